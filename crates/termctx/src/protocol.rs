//! Daemon wire protocol: one JSON object per line, discriminated by `type`.
//!
//! Client to daemon:
//!
//! ```json
//! {"type": "query", "message": "why did make fail?", "cwd": "/src", "command_context": "..."}
//! {"type": "command", "command": "remember", "args": "Always use tabs"}
//! {"type": "ping"}
//! ```
//!
//! Daemon to client: `text`, `tool_use`, `tool_result`, `status`, `info`,
//! `error`, and a terminating `done`. Every request, including a malformed
//! one, is answered by exactly one `done`.

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ProtocolError;

/// Administrative commands.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Status,
    Compact,
    Clear,
    Forget,
    Topic,
    Recall,
    Remember,
    Stop,
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Status => "status",
            Command::Compact => "compact",
            Command::Clear => "clear",
            Command::Forget => "forget",
            Command::Topic => "topic",
            Command::Recall => "recall",
            Command::Remember => "remember",
            Command::Stop => "stop",
        };
        f.write_str(name)
    }
}

/// A request from a client.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Query {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        /// Output of the command the user just ran. Sent to the backend with
        /// this query only.
        #[serde(
            default,
            alias = "commandContext",
            skip_serializing_if = "Option::is_none"
        )]
        command_context: Option<String>,
    },
    Command {
        command: Command,
        /// Accepts a string or an array of words, which are joined by spaces.
        #[serde(
            default,
            deserialize_with = "deserialize_args",
            skip_serializing_if = "Option::is_none"
        )]
        args: Option<String>,
    },
    Ping,
}

impl ClientFrame {
    /// Decode one line.
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ProtocolError::Empty);
        }
        Ok(serde_json::from_str(line)?)
    }

    /// Encode as one newline-terminated line.
    pub fn encode(&self) -> String {
        encode_line(self)
    }

    pub fn query(message: impl Into<String>) -> Self {
        ClientFrame::Query {
            message: message.into(),
            cwd: None,
            command_context: None,
        }
    }

    pub fn command(command: Command, args: Option<String>) -> Self {
        ClientFrame::Command { command, args }
    }
}

fn deserialize_args<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Args {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<Args>::deserialize(d)? {
        None => None,
        Some(Args::One(s)) => Some(s),
        Some(Args::Many(words)) => Some(words.join(" ")),
    }
    .filter(|s| !s.trim().is_empty()))
}

/// A frame sent to a client.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Text { content: String },
    ToolUse { tool: String, input: serde_json::Value },
    ToolResult { output: String },
    Status { data: serde_json::Value },
    Info { message: String },
    Error { message: String },
    Done,
}

impl ServerFrame {
    pub fn text(content: impl Into<String>) -> Self {
        ServerFrame::Text {
            content: content.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        ServerFrame::Info {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            message: message.into(),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, ServerFrame::Done)
    }

    /// Encode as one newline-terminated line.
    pub fn encode(&self) -> String {
        encode_line(self)
    }

    /// Decode one line (client side).
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ProtocolError::Empty);
        }
        Ok(serde_json::from_str(line)?)
    }
}

fn encode_line<T: Serialize>(value: &T) -> String {
    let mut line = serde_json::to_string(value).unwrap_or_else(|e| {
        serde_json::json!({"type": "error", "message": format!("encoding failed: {e}")})
            .to_string()
    });
    line.push('\n');
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_query_with_either_context_spelling() {
        let snake = ClientFrame::decode(
            r#"{"type":"query","message":"hi","cwd":"/tmp","command_context":"ls output"}"#,
        )
        .unwrap();
        let camel = ClientFrame::decode(
            r#"{"type":"query","message":"hi","cwd":"/tmp","commandContext":"ls output"}"#,
        )
        .unwrap();
        assert_eq!(snake, camel);
        assert!(matches!(
            snake,
            ClientFrame::Query { command_context: Some(ref c), .. } if c == "ls output"
        ));
    }

    #[test]
    fn query_cwd_is_optional() {
        let frame = ClientFrame::decode(r#"{"type":"query","message":"hi"}"#).unwrap();
        assert_eq!(frame, ClientFrame::query("hi"));
    }

    #[test]
    fn command_args_accept_string_array_or_nothing() {
        let one = ClientFrame::decode(r#"{"type":"command","command":"remember","args":"use tabs"}"#)
            .unwrap();
        let many = ClientFrame::decode(
            r#"{"type":"command","command":"remember","args":["use","tabs"]}"#,
        )
        .unwrap();
        assert_eq!(one, many);

        let none = ClientFrame::decode(r#"{"type":"command","command":"status"}"#).unwrap();
        assert_eq!(none, ClientFrame::command(Command::Status, None));

        let blank =
            ClientFrame::decode(r#"{"type":"command","command":"topic","args":"  "}"#).unwrap();
        assert_eq!(blank, ClientFrame::command(Command::Topic, None));
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(matches!(ClientFrame::decode(""), Err(ProtocolError::Empty)));
        assert!(matches!(
            ClientFrame::decode("{not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(ClientFrame::decode(r#"{"type":"dance"}"#).is_err());
        assert!(ClientFrame::decode(r#"{"type":"command","command":"reboot"}"#).is_err());
        assert!(ClientFrame::decode(r#"{"type":"query"}"#).is_err());
    }

    #[test]
    fn server_frames_have_wire_shape() {
        assert_eq!(ServerFrame::Done.encode(), "{\"type\":\"done\"}\n");
        assert_eq!(
            ServerFrame::text("hi").encode(),
            "{\"type\":\"text\",\"content\":\"hi\"}\n"
        );
        let tool = ServerFrame::ToolUse {
            tool: "shell".into(),
            input: serde_json::json!({"cmd": "ls"}),
        };
        let value: serde_json::Value = serde_json::from_str(&tool.encode()).unwrap();
        assert_eq!(value["type"], "tool_use");
        assert_eq!(value["input"]["cmd"], "ls");
    }

    #[test]
    fn client_encoding_is_one_line() {
        let frame = ClientFrame::Query {
            message: "multi\nline".into(),
            cwd: Some("/x".into()),
            command_context: None,
        };
        let line = frame.encode();
        assert_eq!(line.matches('\n').count(), 1);
        assert!(line.ends_with('\n'));
        assert_eq!(ClientFrame::decode(&line).unwrap(), frame);
    }
}
