//! Interaction endpoint.
//!
//! Discord POSTs every interaction to a single URL. Each request is signed
//! with the application's Ed25519 key over `timestamp || body`; unsigned or
//! badly signed requests are refused before the body is looked at.

use crate::{
    commands::CommandSurface,
    interaction::{Command, Interaction, InteractionResponse},
};
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
};
use ed25519_dalek::{Signature, VerifyingKey};
use std::sync::Arc;
use tracing::{debug, warn};

const SIGNATURE_HEADER: &str = "x-signature-ed25519";
const TIMESTAMP_HEADER: &str = "x-signature-timestamp";

/// Shared endpoint state.
pub struct AppState {
    pub verifying_key: VerifyingKey,
    pub commands: Arc<dyn CommandSurface>,
}

/// Builds the router serving interactions on `path`.
pub fn router(path: &str, state: Arc<AppState>) -> Router {
    Router::new()
        .route(path, post(handle_interaction))
        .with_state(state)
}

/// Checks a hex-encoded Ed25519 signature over `timestamp || body`.
pub fn verify_signature(
    key: &VerifyingKey,
    timestamp: &str,
    body: &[u8],
    signature: &str,
) -> bool {
    let signature = match hex::decode(signature) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let signature = match Signature::from_slice(&signature) {
        Ok(s) => s,
        Err(_) => return false,
    };

    let mut message = Vec::with_capacity(timestamp.len() + body.len());
    message.extend_from_slice(timestamp.as_bytes());
    message.extend_from_slice(body);

    key.verify_strict(&message, &signature).is_ok()
}

/// Handles one signed interaction.
async fn handle_interaction(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|h| h.to_str().ok());
    let timestamp = headers.get(TIMESTAMP_HEADER).and_then(|h| h.to_str().ok());

    let (Some(signature), Some(timestamp)) = (signature, timestamp) else {
        return (StatusCode::UNAUTHORIZED, "Missing signature").into_response();
    };
    if !verify_signature(&state.verifying_key, timestamp, &body, signature) {
        return (StatusCode::UNAUTHORIZED, "Invalid signature").into_response();
    }

    let interaction: Interaction = match serde_json::from_slice(&body) {
        Ok(i) => i,
        Err(e) => {
            warn!(error = %e, "malformed interaction");
            return (StatusCode::BAD_REQUEST, "Malformed interaction").into_response();
        }
    };

    Json(dispatch(state.commands.as_ref(), interaction).await).into_response()
}

/// Routes a decoded interaction to the matching command.
pub async fn dispatch(
    commands: &dyn CommandSurface,
    interaction: Interaction,
) -> InteractionResponse {
    let (command, context) = interaction.into_parts();

    if matches!(command, Command::Ping) {
        return InteractionResponse::pong();
    }
    let Some(ctx) = context else {
        return InteractionResponse::ephemeral("This command only works inside a server.");
    };

    debug!(
        guild_id = ctx.guild_id,
        channel_id = ctx.channel_id,
        ?command,
        "interaction received"
    );

    match command {
        Command::Ping => InteractionResponse::pong(),
        Command::Scrap => commands.scrap(ctx).await,
        Command::Download => commands.download(ctx).await,
        Command::FromFile(upload) => commands.from_file(ctx, upload).await,
        Command::AddToCsv(target) => commands.add_to_csv(ctx, target).await,
        Command::SubmitExtra { message_id, extra } => {
            commands.submit_extra(ctx, message_id, extra).await
        }
        Command::Unknown(name) => {
            warn!(guild_id = ctx.guild_id, name = %name, "unknown interaction");
            InteractionResponse::ephemeral("Unknown command.")
        }
    }
}
