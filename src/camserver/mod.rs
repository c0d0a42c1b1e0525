//! Command channel to the controller server
//!
//! Text protocol over TCP: a request is `<Verb> [args...]` plus a
//! terminator, the reply is one line. Replies starting with `ERROR` are
//! failures. File upload streams raw bytes on the same connection after the
//! `cmd UploadFile <size>` announcement.

pub mod client;
pub mod reply;

pub use client::{CameraServerClient, RemoteFile, DEFAULT_TERMINATOR};
pub use reply::{classify_reply, Reply, ReplyStatus, ERROR_SENTINEL, UNKNOWN_ERROR};
