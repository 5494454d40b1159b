//! Interaction payloads.
//!
//! Discord delivers slash commands, context-menu actions and modal
//! submissions as signed HTTP callbacks. This module decodes them into a
//! [`Command`] plus the [`CommandContext`] it runs in, and builds the JSON
//! responses sent back.

use crate::discord::{Message, optional_snowflake};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;

/// Name of the context-menu action on messages.
pub const ADD_TO_CSV: &str = "Add to CSV";

/// Prefix of the modal `custom_id`; the target message id follows it.
const EXTRA_MODAL_PREFIX: &str = "add_to_csv:";

/// `custom_id` of the modal's free-text input.
const EXTRA_INPUT: &str = "extra";

/// Message flag hiding a reply from everyone but the invoking user.
const EPHEMERAL: u64 = 1 << 6;

mod kind {
    pub const PING: u8 = 1;
    pub const APPLICATION_COMMAND: u8 = 2;
    pub const MODAL_SUBMIT: u8 = 5;

    pub const PONG: u8 = 1;
    pub const CHANNEL_MESSAGE: u8 = 4;
    pub const DEFERRED_CHANNEL_MESSAGE: u8 = 5;
    pub const MODAL: u8 = 9;
}

/// An inbound interaction.
#[derive(Debug, Deserialize)]
pub struct Interaction {
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default)]
    pub data: Option<InteractionData>,
    #[serde(default, deserialize_with = "optional_snowflake")]
    pub guild_id: Option<u64>,
    #[serde(default, deserialize_with = "optional_snowflake")]
    pub channel_id: Option<u64>,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct InteractionData {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub options: Vec<CommandOption>,
    #[serde(default)]
    pub resolved: Resolved,
    #[serde(default, deserialize_with = "optional_snowflake")]
    pub target_id: Option<u64>,
    #[serde(default)]
    pub custom_id: String,
    #[serde(default)]
    pub components: Vec<Value>,
}

#[derive(Debug, Deserialize)]
pub struct CommandOption {
    pub name: String,
    #[serde(default)]
    pub value: Option<Value>,
}

/// Objects referenced by id from command options.
#[derive(Debug, Default, Deserialize)]
pub struct Resolved {
    #[serde(default)]
    pub attachments: HashMap<String, Attachment>,
    #[serde(default)]
    pub messages: HashMap<String, Message>,
}

/// An uploaded file.
#[derive(Debug, Clone, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub url: String,
    #[serde(default)]
    pub size: u64,
}

/// Where a command was invoked and how to answer it later.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub guild_id: u64,
    pub channel_id: u64,
    /// Interaction token used for follow-up messages.
    pub token: String,
}

/// What an interaction asks for.
#[derive(Debug)]
pub enum Command {
    Ping,
    Scrap,
    Download,
    FromFile(Attachment),
    AddToCsv(Message),
    SubmitExtra { message_id: u64, extra: String },
    Unknown(String),
}

impl Interaction {
    /// Splits the interaction into its command and, inside a server, its context.
    pub fn into_parts(self) -> (Command, Option<CommandContext>) {
        let context = match (self.guild_id, self.channel_id) {
            (Some(guild_id), Some(channel_id)) => Some(CommandContext {
                guild_id,
                channel_id,
                token: self.token,
            }),
            _ => None,
        };

        let data = self.data.unwrap_or_default();
        let command = match self.kind {
            kind::PING => Command::Ping,
            kind::APPLICATION_COMMAND => application_command(data),
            kind::MODAL_SUBMIT => modal_submit(data),
            other => Command::Unknown(format!("interaction type {other}")),
        };

        (command, context)
    }
}

fn application_command(mut data: InteractionData) -> Command {
    match data.name.as_str() {
        "scrap" => Command::Scrap,
        "download" => Command::Download,
        "from_file" => {
            let attachment = data
                .options
                .iter()
                .find(|opt| opt.name == "csv_file")
                .and_then(|opt| opt.value.as_ref())
                .and_then(Value::as_str)
                .and_then(|id| data.resolved.attachments.remove(id));
            match attachment {
                Some(attachment) => Command::FromFile(attachment),
                None => Command::Unknown("from_file without attachment".to_string()),
            }
        }
        ADD_TO_CSV => {
            let target = data
                .target_id
                .and_then(|id| data.resolved.messages.remove(&id.to_string()));
            match target {
                Some(message) => Command::AddToCsv(message),
                None => Command::Unknown("Add to CSV without target message".to_string()),
            }
        }
        other => Command::Unknown(other.to_string()),
    }
}

fn modal_submit(data: InteractionData) -> Command {
    let message_id = data
        .custom_id
        .strip_prefix(EXTRA_MODAL_PREFIX)
        .and_then(|id| id.parse::<u64>().ok());

    match message_id {
        Some(message_id) => Command::SubmitExtra {
            message_id,
            extra: input_value(&data.components, EXTRA_INPUT).unwrap_or_default(),
        },
        None => Command::Unknown(format!("modal {}", data.custom_id)),
    }
}

/// Finds a text input's value anywhere in a modal's component tree.
fn input_value(components: &[Value], custom_id: &str) -> Option<String> {
    components.iter().find_map(|component| {
        if component.get("custom_id").and_then(Value::as_str) == Some(custom_id) {
            return component
                .get("value")
                .and_then(Value::as_str)
                .map(str::to_string);
        }

        let nested = component.get("components").and_then(Value::as_array);
        let single = component.get("component").map(std::slice::from_ref);
        nested
            .map(Vec::as_slice)
            .into_iter()
            .chain(single)
            .find_map(|children| input_value(children, custom_id))
    })
}

/// Response to an interaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InteractionResponse {
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl InteractionResponse {
    pub fn pong() -> Self {
        Self {
            kind: kind::PONG,
            data: None,
        }
    }

    /// Acknowledges now; the answer follows as a follow-up message.
    pub fn deferred() -> Self {
        Self {
            kind: kind::DEFERRED_CHANNEL_MESSAGE,
            data: None,
        }
    }

    /// Reply visible only to the invoking user.
    pub fn ephemeral(content: impl Into<String>) -> Self {
        Self {
            kind: kind::CHANNEL_MESSAGE,
            data: Some(json!({ "content": content.into(), "flags": EPHEMERAL })),
        }
    }

    /// Form asking for the optional annotation of a message being added.
    pub fn extra_modal(message_id: u64) -> Self {
        Self {
            kind: kind::MODAL,
            data: Some(json!({
                "custom_id": format!("{EXTRA_MODAL_PREFIX}{message_id}"),
                "title": "Add info to CSV",
                "components": [{
                    "type": 1,
                    "components": [{
                        "type": 4,
                        "custom_id": EXTRA_INPUT,
                        "style": 1,
                        "label": "Extra info, like the person if not already @",
                        "placeholder": "Optional additional text",
                        "required": false
                    }]
                }]
            })),
        }
    }
}

/// Commands registered with Discord at startup.
pub fn command_definitions() -> Value {
    json!([
        {
            "name": "scrap",
            "type": 1,
            "description": "Scrape the channel and send the CSV.",
            "contexts": [0]
        },
        {
            "name": "download",
            "type": 1,
            "description": "Download the CSV.",
            "contexts": [0]
        },
        {
            "name": "from_file",
            "type": 1,
            "description": "Add rows from an uploaded CSV file.",
            "contexts": [0],
            "options": [{
                "name": "csv_file",
                "description": "The CSV file to import",
                "type": 11,
                "required": true
            }]
        },
        {
            "name": ADD_TO_CSV,
            "type": 3,
            "contexts": [0]
        }
    ])
}
