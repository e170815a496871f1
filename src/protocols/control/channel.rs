//! Data channels and the bulk transfers that run over them.
//!
//! A `DataChannel` is opened by PORT and consumed by exactly one LIST or
//! FILE. The consuming command wraps it in a `Transfer`, which the event loop
//! registers for writability and drains chunk by chunk, so a slow data peer
//! never stalls other sessions. Dropping a transfer closes its channel.

use bytes::{Buf, Bytes, BytesMut};
use mio::net::TcpStream;
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

/// Bytes read from a file per refill.
const FILE_CHUNK: usize = 16 * 1024;

/// Secondary connection to a client-chosen address.
#[derive(Debug)]
pub struct DataChannel<W = TcpStream> {
    stream: W,
    target: SocketAddr,
}

impl DataChannel<TcpStream> {
    /// Start a nonblocking connect to `target`.
    ///
    /// Completion (or failure) of the connect is observed when the channel
    /// first becomes writable.
    pub fn connect(target: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(target)?;
        Ok(Self { stream, target })
    }
}

impl<W> DataChannel<W> {
    /// Wrap an already connected writer.
    #[cfg(test)]
    pub fn from_stream(stream: W, target: SocketAddr) -> Self {
        Self { stream, target }
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

/// What a transfer carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferKind {
    /// Directory listing with this many entries.
    Listing { entries: usize },
    /// Contents of the named file.
    File { path: String },
}

/// Result of driving a transfer on writability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Peer is not accepting more bytes right now.
    Pending,
    /// Everything was written; total bytes sent.
    Complete(u64),
}

/// One bulk payload bound to its data channel.
#[derive(Debug)]
pub struct Transfer<W = TcpStream> {
    channel: DataChannel<W>,
    kind: TransferKind,
    /// Remaining file contents, if the payload is file-backed.
    source: Option<File>,
    /// Bytes read from the source but not yet accepted by the peer.
    pending: Bytes,
    sent: u64,
}

impl<W> Transfer<W> {
    /// Transfer an in-memory listing.
    pub fn listing(channel: DataChannel<W>, payload: Bytes, entries: usize) -> Self {
        Self {
            channel,
            kind: TransferKind::Listing { entries },
            source: None,
            pending: payload,
            sent: 0,
        }
    }

    /// Transfer a file, read lazily in chunks.
    pub fn file(channel: DataChannel<W>, file: File, path: String) -> Self {
        Self {
            channel,
            kind: TransferKind::File { path },
            source: Some(file),
            pending: Bytes::new(),
            sent: 0,
        }
    }

    #[cfg(test)]
    pub fn kind(&self) -> &TransferKind {
        &self.kind
    }

    pub fn target(&self) -> SocketAddr {
        self.channel.target
    }

    /// Bytes accepted by the peer so far.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn stream_mut(&mut self) -> &mut W {
        &mut self.channel.stream
    }

    /// Reply line queued on the control connection once the transfer is done.
    pub fn completion_line(&self) -> String {
        match &self.kind {
            TransferKind::Listing { entries } => {
                format!("OK end of listing ({entries} entries)")
            }
            TransferKind::File { .. } => format!("OK sent {} bytes", self.sent),
        }
    }

    /// Load the next file chunk into `pending`. Returns 0 once the source is
    /// exhausted (or for in-memory payloads).
    fn refill(&mut self) -> io::Result<usize> {
        let Some(file) = self.source.as_mut() else {
            return Ok(0);
        };

        let mut chunk = BytesMut::zeroed(FILE_CHUNK);
        let n = loop {
            match file.read(&mut chunk) {
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        if n == 0 {
            self.source = None;
            return Ok(0);
        }

        chunk.truncate(n);
        self.pending = chunk.freeze();
        Ok(n)
    }
}

impl<W: Write> Transfer<W> {
    /// Push as many bytes as the channel accepts without blocking.
    pub fn on_writable(&mut self) -> io::Result<Progress> {
        loop {
            if self.pending.is_empty() && self.refill()? == 0 {
                return Ok(Progress::Complete(self.sent));
            }

            match self.channel.stream.write(&self.pending) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "data channel closed",
                    ));
                }
                Ok(n) => {
                    self.pending.advance(n);
                    self.sent += n as u64;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Progress::Pending);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}

impl Transfer<TcpStream> {
    /// Surface a failed nonblocking connect.
    pub fn check_connected(&mut self) -> io::Result<()> {
        match self.channel.stream.take_error()? {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    /// Writer that accepts at most `per_call` bytes per write and blocks on
    /// every other call.
    struct ChokedWriter {
        accepted: Vec<u8>,
        per_call: usize,
        calls: usize,
    }

    impl ChokedWriter {
        fn new(per_call: usize) -> Self {
            Self {
                accepted: Vec::new(),
                per_call,
                calls: 0,
            }
        }
    }

    impl Write for ChokedWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.calls += 1;
            if self.calls % 2 == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.per_call);
            self.accepted.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn target() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7681))
    }

    fn drain<W: Write>(transfer: &mut Transfer<W>) -> (u64, usize) {
        let mut pendings = 0;
        loop {
            match transfer.on_writable().unwrap() {
                Progress::Pending => pendings += 1,
                Progress::Complete(sent) => return (sent, pendings),
            }
        }
    }

    #[test]
    fn test_listing_survives_partial_writes() {
        let payload = Bytes::from_static(b"a.txt\r\nb.txt\r\nsub\r\n");
        let channel = DataChannel::from_stream(ChokedWriter::new(4), target());
        let mut transfer = Transfer::listing(channel, payload, 3);

        let (sent, pendings) = drain(&mut transfer);

        assert_eq!(sent, 19);
        assert!(pendings > 0);
        assert_eq!(transfer.stream_mut().accepted, b"a.txt\r\nb.txt\r\nsub\r\n");
        assert_eq!(transfer.completion_line(), "OK end of listing (3 entries)");
    }

    #[test]
    fn test_empty_listing_completes_immediately() {
        let channel = DataChannel::from_stream(ChokedWriter::new(4), target());
        let mut transfer = Transfer::listing(channel, Bytes::new(), 0);

        assert_eq!(transfer.on_writable().unwrap(), Progress::Complete(0));
        assert!(transfer.stream_mut().accepted.is_empty());
    }

    #[test]
    fn test_file_streams_in_chunks() {
        let contents: Vec<u8> = (0..FILE_CHUNK * 2 + 123).map(|i| (i % 251) as u8).collect();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&contents).unwrap();
        io::Seek::rewind(&mut file).unwrap();

        let channel = DataChannel::from_stream(ChokedWriter::new(5000), target());
        let mut transfer = Transfer::file(channel, file, "blob.bin".to_string());

        let (sent, _) = drain(&mut transfer);

        assert_eq!(sent, contents.len() as u64);
        assert_eq!(transfer.stream_mut().accepted, contents);
        assert_eq!(
            transfer.completion_line(),
            format!("OK sent {} bytes", contents.len())
        );
        assert_eq!(
            transfer.kind(),
            &TransferKind::File {
                path: "blob.bin".to_string()
            }
        );
    }

    #[test]
    fn test_closed_peer_is_an_error() {
        struct Closed;
        impl Write for Closed {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let channel = DataChannel::from_stream(Closed, target());
        let mut transfer = Transfer::listing(channel, Bytes::from_static(b"x\r\n"), 1);
        let err = transfer.on_writable().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
        assert_eq!(transfer.sent(), 0);
    }
}
