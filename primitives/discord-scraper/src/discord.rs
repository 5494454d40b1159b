//! Discord REST client.
//!
//! One [`DiscordClient`] is created at startup and handed to everything that
//! talks to Discord. It is cheap to clone; clones share the connection pool.

use csv_ledger::ChatMessage;
use reqwest::{
    Client, RequestBuilder, Response,
    header::AUTHORIZATION,
    multipart::{Form, Part},
};
use serde::{Deserialize, Deserializer};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

/// Discord REST API root.
pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

/// Largest page Discord returns for channel history.
const HISTORY_PAGE: usize = 100;

/// Largest page Discord returns for the bot's guild list.
const GUILD_PAGE: usize = 200;

/// Errors talking to Discord.
#[derive(Debug, thiserror::Error)]
pub enum DiscordError {
    /// The request could not be sent or the response not decoded.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Discord answered with a non-success status.
    #[error("Discord API error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body.
        message: String,
    },

    /// The application public key is not a hex-encoded Ed25519 key.
    #[error("invalid public key: {0}")]
    PublicKey(String),
}

/// The bot's application.
#[derive(Debug, Clone, Deserialize)]
pub struct Application {
    #[serde(deserialize_with = "snowflake")]
    pub id: u64,
    /// Hex-encoded Ed25519 key used to sign interactions.
    pub verify_key: String,
}

#[derive(Debug, Deserialize)]
struct Guild {
    #[serde(deserialize_with = "snowflake")]
    id: u64,
}

/// A channel message.
#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    #[serde(deserialize_with = "snowflake")]
    pub id: u64,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub mentions: Vec<User>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub username: String,
}

impl ChatMessage for Message {
    fn content(&self) -> &str {
        &self.content
    }

    fn mention_names(&self) -> Vec<&str> {
        self.mentions.iter().map(|u| u.username.as_str()).collect()
    }
}

/// File attached to a follow-up message.
#[derive(Debug, Clone)]
pub struct Upload {
    pub name: String,
    pub data: Vec<u8>,
}

/// Follow-up message for a deferred interaction.
#[derive(Debug, Clone)]
pub struct FollowUp {
    pub content: String,
    pub file: Option<Upload>,
}

impl FollowUp {
    /// A plain text follow-up.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            file: None,
        }
    }

    /// A follow-up carrying `data` as a CSV attachment called `name`.
    pub fn with_file(
        content: impl Into<String>,
        name: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            content: content.into(),
            file: Some(Upload {
                name: name.into(),
                data,
            }),
        }
    }
}

/// Authenticated handle on the Discord REST API.
#[derive(Debug, Clone)]
pub struct DiscordClient {
    http: Client,
    api_base: String,
    token: String,
}

impl DiscordClient {
    /// Creates a client for the given bot token.
    pub fn new(token: &str, api_base: &str) -> Result<Self, DiscordError> {
        let http = Client::builder()
            .user_agent(concat!(
                "DiscordBot (",
                env!("CARGO_PKG_REPOSITORY"),
                ", ",
                env!("CARGO_PKG_VERSION"),
                ")"
            ))
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.header(AUTHORIZATION, format!("Bot {}", self.token))
    }

    /// Loads the application the token belongs to.
    pub async fn current_application(&self) -> Result<Application, DiscordError> {
        let request = self.authorized(self.http.get(self.url("/oauth2/applications/@me")));
        Ok(send(request).await?.json().await?)
    }

    /// Ids of every guild the bot is a member of.
    pub async fn guild_ids(&self) -> Result<Vec<u64>, DiscordError> {
        let mut ids = Vec::new();
        let mut after: Option<u64> = None;

        loop {
            let mut query = vec![("limit", GUILD_PAGE.to_string())];
            if let Some(id) = after {
                query.push(("after", id.to_string()));
            }

            let request = self.http.get(self.url("/users/@me/guilds")).query(&query);
            let page: Vec<Guild> = send(self.authorized(request)).await?.json().await?;
            let page_len = page.len();

            after = page.last().map(|g| g.id);
            ids.extend(page.into_iter().map(|g| g.id));

            if page_len < GUILD_PAGE {
                break;
            }
        }

        Ok(ids)
    }

    /// Replaces the application's global commands, returning how many are registered.
    pub async fn register_commands(
        &self,
        application_id: u64,
        commands: &Value,
    ) -> Result<usize, DiscordError> {
        let url = self.url(&format!("/applications/{application_id}/commands"));
        let request = self.authorized(self.http.put(url).json(commands));
        let registered: Vec<Value> = send(request).await?.json().await?;
        Ok(registered.len())
    }

    /// Full history of a channel, newest message first.
    pub async fn channel_history(&self, channel_id: u64) -> Result<Vec<Message>, DiscordError> {
        let url = self.url(&format!("/channels/{channel_id}/messages"));
        let mut history = Vec::new();
        let mut before: Option<u64> = None;

        loop {
            let mut query = vec![("limit", HISTORY_PAGE.to_string())];
            if let Some(id) = before {
                query.push(("before", id.to_string()));
            }

            let request = self.authorized(self.http.get(&url).query(&query));
            let page: Vec<Message> = send(request).await?.json().await?;
            let page_len = page.len();

            before = page.last().map(|m| m.id);
            history.extend(page);
            debug!(channel_id, fetched = history.len(), "history page fetched");

            if page_len < HISTORY_PAGE {
                break;
            }
        }

        Ok(history)
    }

    /// A single message of a channel.
    pub async fn message(&self, channel_id: u64, message_id: u64) -> Result<Message, DiscordError> {
        let url = self.url(&format!("/channels/{channel_id}/messages/{message_id}"));
        let request = self.authorized(self.http.get(url));
        Ok(send(request).await?.json().await?)
    }

    /// Downloads an attachment from the CDN.
    pub async fn download(&self, url: &str) -> Result<Vec<u8>, DiscordError> {
        let response = send(self.http.get(url)).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Sends the follow-up message of a deferred interaction.
    pub async fn followup(
        &self,
        application_id: u64,
        interaction_token: &str,
        reply: FollowUp,
    ) -> Result<(), DiscordError> {
        let url = self.url(&format!("/webhooks/{application_id}/{interaction_token}"));
        let payload = json!({ "content": reply.content });

        let request = match reply.file {
            Some(file) => {
                let part = Part::bytes(file.data)
                    .file_name(file.name)
                    .mime_str("text/csv")?;
                let form = Form::new()
                    .text("payload_json", payload.to_string())
                    .part("files[0]", part);
                self.http.post(url).multipart(form)
            }
            None => self.http.post(url).json(&payload),
        };

        send(request).await?;
        Ok(())
    }
}

/// Sends a request, turning non-success statuses into [`DiscordError::Api`].
async fn send(request: RequestBuilder) -> Result<Response, DiscordError> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response.text().await.unwrap_or_default();
    Err(DiscordError::Api {
        status: status.as_u16(),
        message,
    })
}

/// Snowflakes arrive as strings, occasionally as numbers.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawSnowflake {
    Text(String),
    Number(u64),
}

impl RawSnowflake {
    fn parse<E: serde::de::Error>(self) -> Result<u64, E> {
        match self {
            Self::Text(text) => text.parse().map_err(E::custom),
            Self::Number(n) => Ok(n),
        }
    }
}

pub(crate) fn snowflake<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    RawSnowflake::deserialize(deserializer)?.parse()
}

pub(crate) fn optional_snowflake<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<RawSnowflake>::deserialize(deserializer)?
        .map(RawSnowflake::parse)
        .transpose()
}

/// Parses a hex-encoded Ed25519 public key.
pub fn parse_public_key(hex_key: &str) -> Result<ed25519_dalek::VerifyingKey, DiscordError> {
    let bytes = hex::decode(hex_key.trim()).map_err(|e| DiscordError::PublicKey(e.to_string()))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| DiscordError::PublicKey("expected 32 bytes".to_string()))?;
    ed25519_dalek::VerifyingKey::from_bytes(&bytes)
        .map_err(|e| DiscordError::PublicKey(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serve;
    use axum::{Json, Router, extract::Query, http::StatusCode, routing::get};
    use std::collections::HashMap;

    #[test]
    fn message_decodes_string_snowflakes() {
        let message: Message = serde_json::from_value(json!({
            "id": "1100000000000000001",
            "content": "hi <@42>",
            "mentions": [{ "id": "42", "username": "alice", "global_name": "Alice" }],
            "attachments": []
        }))
        .unwrap();

        assert_eq!(message.id, 1_100_000_000_000_000_001);
        assert_eq!(message.to_entry("").message, "hi");
        assert_eq!(message.mention_names(), vec!["alice"]);
    }

    #[test]
    fn message_without_content_defaults_to_empty() {
        let message: Message = serde_json::from_value(json!({ "id": 5 })).unwrap();
        assert_eq!(message.content, "");
        assert!(message.mentions.is_empty());
    }

    #[test]
    fn rejects_malformed_snowflake() {
        let result: Result<Message, _> = serde_json::from_value(json!({ "id": "abc" }));
        assert!(result.is_err());
    }

    #[test]
    fn parses_public_key() {
        let signing = ed25519_dalek::SigningKey::from_bytes(&[9u8; 32]);
        let hex_key = hex::encode(signing.verifying_key().to_bytes());

        let key = parse_public_key(&hex_key).unwrap();
        assert_eq!(key, signing.verifying_key());
    }

    #[test]
    fn rejects_short_public_key() {
        let err = parse_public_key("abcd").unwrap_err();
        assert!(matches!(err, DiscordError::PublicKey(_)));
        assert!(parse_public_key("not hex").is_err());
    }

    fn page(ids: std::ops::Range<u64>) -> Vec<Value> {
        ids.rev()
            .map(|id| json!({ "id": id.to_string(), "content": format!("m{id}"), "mentions": [] }))
            .collect()
    }

    #[tokio::test]
    async fn channel_history_follows_pages() {
        let app = Router::new().route(
            "/channels/{channel_id}/messages",
            get(|Query(query): Query<HashMap<String, String>>| async move {
                match query.get("before").map(String::as_str) {
                    None => Json(page(1000..1100)),
                    Some("1000") => Json(page(997..1000)),
                    Some(_) => Json(Vec::new()),
                }
            }),
        );
        let base = serve(app).await;
        let client = DiscordClient::new("token", &base).unwrap();

        let history = client.channel_history(7).await.unwrap();

        assert_eq!(history.len(), 103);
        assert_eq!(history.first().map(|m| m.id), Some(1099));
        assert_eq!(history.last().map(|m| m.id), Some(997));
    }

    #[tokio::test]
    async fn api_errors_carry_status_and_body() {
        let app = Router::new().route(
            "/channels/{channel_id}/messages/{message_id}",
            get(|| async { (StatusCode::FORBIDDEN, "Missing Access") }),
        );
        let base = serve(app).await;
        let client = DiscordClient::new("token", &base).unwrap();

        let err = client.message(1, 2).await.unwrap_err();

        match err {
            DiscordError::Api { status, message } => {
                assert_eq!(status, 403);
                assert_eq!(message, "Missing Access");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
