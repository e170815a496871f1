//! Command dispatch for one control session.

use super::channel::{DataChannel, Transfer};
use super::error::{CommandError, FileTransferError};
use super::parser::{parse_port_argument, Command};
use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Local};
use std::fmt;
use std::fs::{self, File};
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

/// Fixed identification returned by INFO.
pub const SERVER_ID: &str = concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"));

/// WHO view of one registered connection.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: usize,
    pub peer: SocketAddr,
    pub user: Option<String>,
    pub since: DateTime<Local>,
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} {} since {}",
            self.id,
            self.peer,
            self.user.as_deref().unwrap_or("-"),
            self.since.format("%H:%M:%S")
        )
    }
}

/// Outcome of handling one request line.
#[derive(Debug)]
pub enum Reply {
    /// Send this line.
    Line(String),
    /// Send this line, then close the connection.
    Close(String),
    /// Start a bulk transfer; the reply follows its completion.
    Transfer(Transfer),
}

/// Per-connection protocol state.
#[derive(Debug)]
pub struct Session {
    root: Arc<Path>,
    user: Option<String>,
    channel: Option<DataChannel>,
    transferring: bool,
}

impl Session {
    /// Create a session serving LIST and FILE from `root`.
    pub fn new(root: Arc<Path>) -> Self {
        Self {
            root,
            user: None,
            channel: None,
            transferring: false,
        }
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    #[cfg(test)]
    pub fn has_data_channel(&self) -> bool {
        self.channel.is_some()
    }

    /// Called by the event loop when a transfer this session started ends.
    pub fn end_transfer(&mut self) {
        self.transferring = false;
    }

    /// Handle one request line (without delimiter).
    ///
    /// `roster` is the set of registered connections at call time.
    pub fn handle(&mut self, line: &str, roster: &[PeerInfo]) -> Reply {
        let command = Command::parse(line);
        trace!(code = %command.code, args = %command.args, "Dispatching command");

        match self.execute(&command, roster) {
            Ok(reply) => reply,
            Err(e) => {
                debug!(code = %command.code, error = %e, "Command failed");
                Reply::Line(e.reply())
            }
        }
    }

    fn execute(&mut self, command: &Command, roster: &[PeerInfo]) -> Result<Reply, CommandError> {
        let args = command.args.as_str();
        match command.code.as_str() {
            "USER" => self.login(args, roster),
            "INFO" => Ok(Reply::Line(format!("OK {SERVER_ID}"))),
            "WHO" => Ok(Reply::Line(who(roster))),
            "FIND" => Err(CommandError::NotImplemented("FIND")),
            "MSG" => Err(CommandError::NotImplemented("MSG")),
            "ECHO" => Ok(Reply::Line(ok(args))),
            "PORT" => self.open_channel(args),
            "LIST" => self.list(),
            "FILE" => self.send_file(args),
            "QUIT" => Ok(Reply::Close("OK bye".to_string())),
            other => Err(CommandError::Unrecognized(other.to_string())),
        }
    }

    /// USER: a name held by another connection is refused.
    fn login(&mut self, name: &str, roster: &[PeerInfo]) -> Result<Reply, CommandError> {
        if name.is_empty() {
            return Err(CommandError::MissingArgument("USER"));
        }
        let taken = roster.iter().any(|p| p.user.as_deref() == Some(name));
        if taken && self.user() != Some(name) {
            return Err(CommandError::UserTaken(name.to_string()));
        }
        self.user = Some(name.to_string());
        Ok(Reply::Line(format!("OK logged in as {name}")))
    }

    /// PORT: connect a fresh data channel, closing any unused one.
    fn open_channel(&mut self, args: &str) -> Result<Reply, CommandError> {
        let target = SocketAddr::V4(parse_port_argument(args)?);
        let channel = DataChannel::connect(target).map_err(CommandError::Connect)?;

        if let Some(old) = self.channel.replace(channel) {
            debug!(old = %old.target(), new = %target, "Replacing unused data channel");
        }
        Ok(Reply::Line(format!("OK data port {}", target.port())))
    }

    /// Take the pending channel. Whatever happens next, the channel is gone
    /// from the session: it is either handed to a transfer or dropped.
    fn claim_channel(&mut self) -> Result<DataChannel, FileTransferError> {
        if self.transferring {
            return Err(FileTransferError::InProgress);
        }
        self.channel.take().ok_or(FileTransferError::NoDataChannel)
    }

    fn list(&mut self) -> Result<Reply, CommandError> {
        let channel = self.claim_channel()?;

        let mut payload = BytesMut::new();
        let mut entries = 0;
        for entry in fs::read_dir(&self.root).map_err(FileTransferError::Io)? {
            let entry = entry.map_err(FileTransferError::Io)?;
            payload.put_slice(entry.file_name().to_string_lossy().as_bytes());
            payload.put_slice(super::DELIMITER);
            entries += 1;
        }

        self.transferring = true;
        Ok(Reply::Transfer(Transfer::listing(
            channel,
            payload.freeze(),
            entries,
        )))
    }

    fn send_file(&mut self, args: &str) -> Result<Reply, CommandError> {
        let channel = self.claim_channel()?;
        if args.is_empty() {
            return Err(CommandError::MissingArgument("FILE"));
        }

        let path = self.resolve(args)?;
        let file = File::open(&path).map_err(FileTransferError::Io)?;

        self.transferring = true;
        Ok(Reply::Transfer(Transfer::file(
            channel,
            file,
            args.to_string(),
        )))
    }

    /// Join a client path onto the root, accepting only regular files that
    /// stay below it.
    fn resolve(&self, relative: &str) -> Result<PathBuf, FileTransferError> {
        let not_found = || FileTransferError::NotFound(relative.to_string());

        let relative = Path::new(relative);
        let contained = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !contained {
            return Err(not_found());
        }

        let path = self.root.join(relative);
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(path),
            _ => Err(not_found()),
        }
    }
}

fn ok(text: &str) -> String {
    if text.is_empty() {
        "OK".to_string()
    } else {
        format!("OK {text}")
    }
}

fn who(roster: &[PeerInfo]) -> String {
    let entries: Vec<String> = roster.iter().map(PeerInfo::to_string).collect();
    format!("OK {} connected: {}", roster.len(), entries.join("; "))
}
