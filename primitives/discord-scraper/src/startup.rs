//! Startup steps run before the endpoint starts serving.

use crate::{discord::DiscordClient, interaction};
use anyhow::Context;
use csv_ledger::LedgerStore;
use std::sync::Arc;
use tracing::{info, warn};

/// Creates a ledger for every server the bot is in.
///
/// Returns how many ledgers were newly written.
pub async fn prepare_ledgers(
    discord: &DiscordClient,
    store: &Arc<LedgerStore>,
) -> anyhow::Result<usize> {
    let guild_ids = discord
        .guild_ids()
        .await
        .context("failed to list the bot's servers")?;
    let servers = guild_ids.len();

    let store = Arc::clone(store);
    let created = tokio::task::spawn_blocking(move || -> csv_ledger::Result<usize> {
        let mut created = 0;
        for guild_id in &guild_ids {
            if store.ensure(*guild_id)? {
                created += 1;
            }
        }
        Ok(created)
    })
    .await??;

    info!(servers, created, "ledgers ready");
    Ok(created)
}

/// Registers the bot's commands.
///
/// A failed sync leaves the previously registered commands in place and is
/// only logged. Returns the number of registered commands on success.
pub async fn sync_commands(discord: &DiscordClient, application_id: u64) -> Option<usize> {
    match discord
        .register_commands(application_id, &interaction::command_definitions())
        .await
    {
        Ok(count) => {
            info!(count, "commands registered");
            Some(count)
        }
        Err(e) => {
            warn!(error = %e, "command registration failed");
            None
        }
    }
}

/// Prepares ledgers, then syncs commands.
///
/// Only a failure to prepare the ledgers is fatal.
pub async fn prepare(
    discord: &DiscordClient,
    application_id: u64,
    store: &Arc<LedgerStore>,
) -> anyhow::Result<()> {
    prepare_ledgers(discord, store).await?;
    sync_commands(discord, application_id).await;
    Ok(())
}
