//! Command handlers.
//!
//! [`CommandSurface`] has one method per command the bot offers. The
//! endpoint decodes an interaction and calls the matching method; whatever it
//! returns is the immediate answer to Discord. Long-running commands answer
//! with a deferral and finish in a spawned task that sends a follow-up.

use crate::{
    discord::{DiscordClient, FollowUp, Message},
    interaction::{Attachment, CommandContext, InteractionResponse},
};
use anyhow::Context;
use async_trait::async_trait;
use csv_ledger::{
    ChatMessage, LedgerStore, import_upload, rebuild_from_history, validate_upload_name,
};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::task::spawn_blocking;
use tracing::{debug, error, info};

/// The bot's commands.
#[async_trait]
pub trait CommandSurface: Send + Sync {
    /// Rebuilds the server's ledger from the whole channel history.
    async fn scrap(&self, ctx: CommandContext) -> InteractionResponse;

    /// Sends the server's ledger file.
    async fn download(&self, ctx: CommandContext) -> InteractionResponse;

    /// Merges an uploaded CSV file into the server's ledger.
    async fn from_file(&self, ctx: CommandContext, upload: Attachment) -> InteractionResponse;

    /// Opens the annotation form for a message picked from the context menu.
    async fn add_to_csv(&self, ctx: CommandContext, target: Message) -> InteractionResponse;

    /// Appends the picked message once its annotation form is submitted.
    async fn submit_extra(
        &self,
        ctx: CommandContext,
        message_id: u64,
        extra: String,
    ) -> InteractionResponse;
}

/// Follow-up sent when a deferred command fails.
pub const FAILURE_REPLY: &str = "Something went wrong, please try again later.";

/// Messages whose annotation form is open, kept as they were when picked.
const PICKED_LIMIT: usize = 256;

/// Commands backed by a [`LedgerStore`].
#[derive(Debug, Clone)]
pub struct LedgerCommands {
    discord: DiscordClient,
    application_id: u64,
    store: Arc<LedgerStore>,
    oldest_first: bool,
    picked: Arc<Mutex<VecDeque<Message>>>,
}

impl LedgerCommands {
    /// Creates the handlers for `application_id`, answering follow-ups
    /// through `discord` and writing ledgers into `store`.
    ///
    /// With `oldest_first`, scraped history is stored oldest message first.
    pub fn new(
        discord: DiscordClient,
        application_id: u64,
        store: Arc<LedgerStore>,
        oldest_first: bool,
    ) -> Self {
        Self {
            discord,
            application_id,
            store,
            oldest_first,
            picked: Arc::default(),
        }
    }

    /// Remembers a picked message until its form comes back.
    fn remember(&self, message: Message) {
        let mut picked = self.picked.lock().unwrap_or_else(PoisonError::into_inner);
        picked.retain(|m| m.id != message.id);
        if picked.len() >= PICKED_LIMIT {
            picked.pop_front();
        }
        picked.push_back(message);
    }

    /// Takes back a picked message, if it is still remembered.
    fn take_picked(&self, message_id: u64) -> Option<Message> {
        let mut picked = self.picked.lock().unwrap_or_else(PoisonError::into_inner);
        let index = picked.iter().position(|m| m.id == message_id)?;
        picked.remove(index)
    }

    /// Runs `work` in the background and answers with its result as a follow-up.
    fn defer<F>(
        &self,
        ctx: CommandContext,
        command: &'static str,
        work: F,
    ) -> InteractionResponse
    where
        F: Future<Output = anyhow::Result<FollowUp>> + Send + 'static,
    {
        let discord = self.discord.clone();
        let application_id = self.application_id;

        tokio::spawn(async move {
            let reply = match work.await {
                Ok(reply) => reply,
                Err(e) => {
                    error!(
                        command,
                        guild_id = ctx.guild_id,
                        error = %format!("{e:#}"),
                        "command failed"
                    );
                    FollowUp::text(FAILURE_REPLY)
                }
            };

            if let Err(e) = discord.followup(application_id, &ctx.token, reply).await {
                error!(
                    command,
                    guild_id = ctx.guild_id,
                    error = %e,
                    "failed to send follow-up"
                );
            }
        });

        InteractionResponse::deferred()
    }

    /// Follow-up carrying the server's ledger file.
    async fn ledger_file(&self, guild_id: u64, content: &str) -> anyhow::Result<FollowUp> {
        let store = Arc::clone(&self.store);
        let data = spawn_blocking(move || store.contents(guild_id))
            .await?
            .context("reading ledger")?;
        Ok(FollowUp::with_file(content, format!("{guild_id}.csv"), data))
    }

    async fn run_scrap(&self, ctx: &CommandContext) -> anyhow::Result<FollowUp> {
        let mut history = self
            .discord
            .channel_history(ctx.channel_id)
            .await
            .context("fetching channel history")?;
        if self.oldest_first {
            history.reverse();
        }

        let store = Arc::clone(&self.store);
        let guild_id = ctx.guild_id;
        let rows = spawn_blocking(move || rebuild_from_history(&store, guild_id, &history))
            .await?
            .context("rebuilding ledger")?;
        info!(guild_id, channel_id = ctx.channel_id, rows, "channel scraped");

        self.ledger_file(guild_id, "Here is your CSV 👇").await
    }

    async fn run_import(&self, guild_id: u64, upload: Attachment) -> anyhow::Result<FollowUp> {
        let data = self
            .discord
            .download(&upload.url)
            .await
            .context("downloading upload")?;

        let store = Arc::clone(&self.store);
        let imported =
            spawn_blocking(move || import_upload(&store, guild_id, &upload.filename, &data))
                .await?
                .context("importing upload")?;

        let noun = if imported == 1 { "row" } else { "rows" };
        Ok(FollowUp::text(format!("Import done ✔️ ({imported} {noun} added)")))
    }

    async fn append_message(
        &self,
        ctx: &CommandContext,
        message_id: u64,
        extra: String,
    ) -> anyhow::Result<()> {
        // Forms outliving the remembered set fall back to the current message
        let message = match self.take_picked(message_id) {
            Some(message) => message,
            None => self
                .discord
                .message(ctx.channel_id, message_id)
                .await
                .context("fetching target message")?,
        };
        let entry = message.to_entry(&extra);

        let store = Arc::clone(&self.store);
        let guild_id = ctx.guild_id;
        spawn_blocking(move || store.append(guild_id, &entry))
            .await?
            .context("appending to ledger")?;

        info!(guild_id, message_id, "message added to ledger");
        Ok(())
    }
}

#[async_trait]
impl CommandSurface for LedgerCommands {
    async fn scrap(&self, ctx: CommandContext) -> InteractionResponse {
        let this = self.clone();
        let task_ctx = ctx.clone();
        self.defer(ctx, "scrap", async move { this.run_scrap(&task_ctx).await })
    }

    async fn download(&self, ctx: CommandContext) -> InteractionResponse {
        let this = self.clone();
        let guild_id = ctx.guild_id;
        self.defer(ctx, "download", async move {
            this.ledger_file(guild_id, "Here is your CSV").await
        })
    }

    async fn from_file(&self, ctx: CommandContext, upload: Attachment) -> InteractionResponse {
        if let Err(e) = validate_upload_name(&upload.filename) {
            debug!(guild_id = ctx.guild_id, error = %e, "upload rejected");
            return InteractionResponse::ephemeral("The file must be a CSV.");
        }
        debug!(
            guild_id = ctx.guild_id,
            filename = %upload.filename,
            size = upload.size,
            "importing upload"
        );

        let this = self.clone();
        let guild_id = ctx.guild_id;
        self.defer(ctx, "from_file", async move {
            this.run_import(guild_id, upload).await
        })
    }

    async fn add_to_csv(&self, ctx: CommandContext, target: Message) -> InteractionResponse {
        debug!(guild_id = ctx.guild_id, message_id = target.id, "opening annotation form");
        let message_id = target.id;
        self.remember(target);
        InteractionResponse::extra_modal(message_id)
    }

    async fn submit_extra(
        &self,
        ctx: CommandContext,
        message_id: u64,
        extra: String,
    ) -> InteractionResponse {
        match self.append_message(&ctx, message_id, extra).await {
            Ok(()) => InteractionResponse::ephemeral("Added to CSV ✔️"),
            Err(e) => {
                error!(
                    guild_id = ctx.guild_id,
                    message_id,
                    error = %format!("{e:#}"),
                    "add to CSV failed"
                );
                InteractionResponse::ephemeral("Could not add the message to the CSV.")
            }
        }
    }
}
