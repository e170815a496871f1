//! Error types surfaced to clients as `ERROR ...` reply lines.
//!
//! None of these close the control connection.

use std::io;
use thiserror::Error;

/// Malformed PORT argument.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressFormatError {
    #[error("expected 6 comma-separated fields, got {0}")]
    FieldCount(usize),
    #[error("field '{0}' is not a decimal number")]
    NotNumeric(String),
    #[error("field '{0}' is out of range 0-255")]
    OutOfRange(String),
}

/// LIST/FILE failures.
#[derive(Debug, Error)]
pub enum FileTransferError {
    #[error("no data channel, send PORT first")]
    NoDataChannel,
    #[error("a transfer is already in progress")]
    InProgress,
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("data transfer failed: {0}")]
    Io(#[from] io::Error),
}

/// Any failure while executing one command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unrecognized command '{0}'")]
    Unrecognized(String),
    #[error("{0} not yet implemented")]
    NotImplemented(&'static str),
    #[error("{0} requires an argument")]
    MissingArgument(&'static str),
    #[error("user {0} is already logged in")]
    UserTaken(String),
    #[error("bad PORT address: {0}")]
    AddressFormat(#[from] AddressFormatError),
    #[error("cannot open data channel: {0}")]
    Connect(#[source] io::Error),
    #[error(transparent)]
    Transfer(#[from] FileTransferError),
}

impl CommandError {
    /// Render as a reply line.
    pub fn reply(&self) -> String {
        format!("ERROR {self}")
    }
}
