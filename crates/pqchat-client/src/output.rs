//! Output formatting for CLI results
//!
//! Three formats:
//! - Table: human-readable (default)
//! - JSON: structured output for scripting
//! - Quiet: exit codes only

use std::str::FromStr;

use comfy_table::{presets::UTF8_FULL, Table};
use serde::Serialize;

use crate::session::MessageView;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Quiet,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(Self::Table),
            "json" => Ok(Self::Json),
            "quiet" => Ok(Self::Quiet),
            _ => Err(format!("Unknown output format: {s}")),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Table => write!(f, "table"),
            Self::Json => write!(f, "json"),
            Self::Quiet => write!(f, "quiet"),
        }
    }
}

/// Standard JSON response wrapper
#[derive(Serialize)]
pub struct JsonResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// ISO 8601 timestamp
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl<T: Serialize> JsonResponse<T> {
    pub fn success_with_command(data: T, command: &str) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
            command: Some(command.to_string()),
        }
    }
}

impl JsonResponse<()> {
    pub fn error(message: &str) -> JsonResponse<()> {
        JsonResponse {
            success: false,
            data: None,
            error: Some(message.to_string()),
            timestamp: chrono::Utc::now().to_rfc3339(),
            command: None,
        }
    }
}

#[derive(Serialize)]
struct PublicKeyOutput<'a> {
    identity: &'a str,
    algorithm: &'a str,
    public_key: String,
}

pub struct OutputFormatter {
    format: OutputFormat,
    verbose: bool,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat, verbose: bool) -> Self {
        Self { format, verbose }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn is_quiet(&self) -> bool {
        self.format == OutputFormat::Quiet
    }

    /// Conversation history, oldest first.
    pub fn format_messages(&self, messages: &[MessageView]) -> String {
        match self.format {
            OutputFormat::Table => Self::messages_table(messages),
            OutputFormat::Json => self.to_json_response(&messages, "history"),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// A single live message, one line in table mode.
    pub fn format_message(&self, message: &MessageView) -> String {
        match self.format {
            OutputFormat::Table => format!(
                "[{}] {}: {}",
                message.timestamp.format("%Y-%m-%d %H:%M:%S"),
                message.sender,
                message.display_text()
            ),
            OutputFormat::Json => serde_json::to_string(message).unwrap_or_default(),
            OutputFormat::Quiet => String::new(),
        }
    }

    pub fn format_public_key(&self, identity: &str, algorithm: &str, public_key: &pqchat_crypto::PublicKey) -> String {
        match self.format {
            OutputFormat::Table => {
                let encoded = public_key.to_base64();
                let mut table = Table::new();
                table.load_preset(UTF8_FULL);
                table.set_header(vec!["Property", "Value"]);
                table.add_row(vec!["Identity", identity]);
                table.add_row(vec!["Algorithm", algorithm]);
                table.add_row(vec!["Public Key", encoded.as_str()]);
                table.to_string()
            }
            OutputFormat::Json => self.to_json_response(
                &PublicKeyOutput {
                    identity,
                    algorithm,
                    public_key: public_key.to_base64(),
                },
                "keygen",
            ),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Only shown in verbose mode
    pub fn progress(&self, message: &str) {
        if self.verbose && self.format == OutputFormat::Table {
            eprintln!("... {message}");
        }
    }

    pub fn success(&self, message: &str) {
        if self.format == OutputFormat::Table {
            println!("✓ {message}");
        }
    }

    pub fn error(&self, message: &str) {
        match self.format {
            OutputFormat::Table => eprintln!("✗ {message}"),
            OutputFormat::Json => println!("{}", self.to_json(&JsonResponse::<()>::error(message))),
            OutputFormat::Quiet => {}
        }
    }

    fn messages_table(messages: &[MessageView]) -> String {
        if messages.is_empty() {
            return "No messages.".to_string();
        }

        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Time", "From", "To", "Message"]);
        for m in messages {
            table.add_row(vec![
                m.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                m.sender.to_string(),
                m.receiver.to_string(),
                m.display_text().to_string(),
            ]);
        }
        table.to_string()
    }

    fn to_json<T: Serialize>(&self, value: &T) -> String {
        serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }

    fn to_json_response<T: Serialize>(&self, value: &T, command: &str) -> String {
        self.to_json(&JsonResponse::success_with_command(value, command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MessageBody;
    use pqchat_crypto::Identity;

    fn view(body: MessageBody) -> MessageView {
        MessageView {
            id: uuid::Uuid::new_v4(),
            sender: Identity::parse("alice").unwrap(),
            receiver: Identity::parse("bob").unwrap(),
            timestamp: chrono::Utc::now(),
            outgoing: false,
            body,
        }
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!("xml".parse::<OutputFormat>().is_err());
        assert_eq!(OutputFormat::Quiet.to_string(), "quiet");
    }

    #[test]
    fn test_table_shows_placeholder() {
        let formatter = OutputFormatter::new(OutputFormat::Table, false);
        let out = formatter.format_messages(&[
            view(MessageBody::Text("hi".to_string())),
            view(MessageBody::Undecryptable),
        ]);
        assert!(out.contains("hi"));
        assert!(out.contains("[unable to decrypt message]"));
    }

    #[test]
    fn test_json_history_envelope() {
        let formatter = OutputFormatter::new(OutputFormat::Json, false);
        let out = formatter.format_messages(&[view(MessageBody::Text("hi".to_string()))]);
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["command"], "history");
        assert_eq!(value["data"][0]["body"]["text"], "hi");
    }

    #[test]
    fn test_quiet_prints_nothing() {
        let formatter = OutputFormatter::new(OutputFormat::Quiet, true);
        assert!(formatter.format_messages(&[]).is_empty());
        assert!(formatter.format_message(&view(MessageBody::Undecryptable)).is_empty());
    }
}
