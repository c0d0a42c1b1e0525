//! Controller server replies
//!
//! A reply line is split into whitespace-separated fields once, at the
//! socket boundary. A first field equal to `ERROR` marks a failure; the rest
//! of the line is the message.

use std::fmt;

use crate::common::ErrorStatus;

/// First field of a failure reply
pub const ERROR_SENTINEL: &str = "ERROR";

/// Message used when an error reply carries no text
pub const UNKNOWN_ERROR: &str = "Unknown error";

/// Parsed controller server reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Success, with the reply fields (e.g. `["OK", "2500"]`)
    Ok(Vec<String>),
    /// Failure reported by the controller server
    Error { message: String },
}

impl Reply {
    /// Parse one reply line (terminator already stripped or not)
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let mut parts = line.splitn(2, char::is_whitespace);
        match parts.next() {
            Some(ERROR_SENTINEL) => Reply::Error {
                message: non_empty_or_unknown(parts.next().unwrap_or("").trim()),
            },
            _ => Reply::Ok(line.split_whitespace().map(str::to_string).collect()),
        }
    }

    /// Build a reply from already separated fields
    pub fn from_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        if fields.first().map(String::as_str) == Some(ERROR_SENTINEL) {
            let message = fields.get(1).map(String::as_str).unwrap_or("");
            Reply::Error {
                message: non_empty_or_unknown(message),
            }
        } else {
            Reply::Ok(fields)
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error { .. })
    }

    /// Reply fields (empty for error replies)
    pub fn fields(&self) -> &[String] {
        match self {
            Reply::Ok(fields) => fields,
            Reply::Error { .. } => &[],
        }
    }

    /// Field at `index`, if present
    pub fn field(&self, index: usize) -> Option<&str> {
        self.fields().get(index).map(String::as_str)
    }

    /// Value of a `OK <value>` reply
    pub fn value(&self) -> Option<&str> {
        self.field(1)
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ok(fields) => write!(f, "{}", fields.join(" ")),
            Reply::Error { message } => write!(f, "{} {}", ERROR_SENTINEL, message),
        }
    }
}

fn non_empty_or_unknown(message: &str) -> String {
    if message.is_empty() {
        UNKNOWN_ERROR.to_string()
    } else {
        message.to_string()
    }
}

/// Result of classifying a reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyStatus {
    pub is_error: bool,
    /// Error message, empty on success
    pub message: String,
}

impl ReplyStatus {
    fn success() -> Self {
        Self {
            is_error: false,
            message: String::new(),
        }
    }
}

/// Classify a reply and mirror the outcome into `status`
///
/// A missing reply is a success and leaves `status` untouched.
pub fn classify_reply(reply: Option<&Reply>, status: &ErrorStatus) -> ReplyStatus {
    match reply {
        None => ReplyStatus::success(),
        Some(Reply::Error { message }) => {
            status.set(ERROR_SENTINEL, message.clone());
            ReplyStatus {
                is_error: true,
                message: message.clone(),
            }
        }
        Some(Reply::Ok(_)) => {
            status.clear();
            ReplyStatus::success()
        }
    }
}
