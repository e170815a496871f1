//! Connection state machine for managing client control connections.
//!
//! Each connection owns its inbound/outbound buffers and the protocol
//! session scoped to it. The stream type is generic so the buffering logic
//! can be driven without real sockets.

use crate::protocols::control::{
    find_delimiter, PeerInfo, Reply, Session, Transfer, DELIMITER,
};
use bytes::{Buf, BytesMut};
use chrono::{DateTime, Local};
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

/// Largest single read from a client socket.
pub const READ_CHUNK: usize = 4096;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Nothing queued for the client.
    AwaitingRequest,
    /// Reply bytes are waiting in the outbound buffer.
    ResponsePending,
    /// Terminal: the connection hit an I/O failure or finished QUIT.
    Closed,
}

/// Outcome of one read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// This many bytes were appended to the inbound buffer.
    Data(usize),
    /// No bytes available right now.
    WouldBlock,
    /// Peer closed its side.
    Eof,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    peer: SocketAddr,
    connected_at: DateTime<Local>,
    inbound: BytesMut,
    outbound: BytesMut,
    state: ConnState,
    /// QUIT was received; close once the outbound buffer drains.
    closing: bool,
    /// Whether the stream is currently registered for writability.
    write_armed: bool,
    /// Key of this connection's in-flight transfer.
    transfer: Option<usize>,
    session: Session,
}

impl<S> Connection<S> {
    /// Create a new connection awaiting its first request.
    pub fn new(stream: S, peer: SocketAddr, session: Session) -> Self {
        Self {
            stream,
            peer,
            connected_at: Local::now(),
            inbound: BytesMut::with_capacity(READ_CHUNK),
            outbound: BytesMut::new(),
            state: ConnState::AwaitingRequest,
            closing: false,
            write_armed: false,
            transfer: None,
            session,
        }
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnState {
        self.state
    }

    #[cfg(test)]
    pub fn inbound(&self) -> &[u8] {
        &self.inbound
    }

    #[cfg(test)]
    pub fn outbound(&self) -> &[u8] {
        &self.outbound
    }

    /// Append freshly read bytes to the inbound buffer.
    pub fn on_data(&mut self, bytes: &[u8]) {
        self.inbound.extend_from_slice(bytes);
    }

    /// Split the next complete request line off the inbound buffer.
    ///
    /// Returns `None` until a delimiter has been observed; a partial request
    /// stays buffered.
    pub fn next_request(&mut self) -> Option<String> {
        let end = find_delimiter(&self.inbound)?;
        let line = self.inbound.split_to(end + DELIMITER.len());
        Some(String::from_utf8_lossy(&line[..end]).into_owned())
    }

    /// Queue a reply line behind whatever is still unsent.
    pub fn queue_reply(&mut self, line: &str) {
        if self.state == ConnState::Closed {
            return;
        }
        self.outbound.extend_from_slice(line.as_bytes());
        self.outbound.extend_from_slice(DELIMITER);
        self.state = ConnState::ResponsePending;
    }

    /// Run one request through the session.
    ///
    /// Line replies are queued directly; a transfer is handed back to the
    /// caller to schedule.
    pub fn dispatch(&mut self, line: &str, roster: &[PeerInfo]) -> Option<Transfer> {
        match self.session.handle(line, roster) {
            Reply::Line(reply) => self.queue_reply(&reply),
            Reply::Close(reply) => {
                self.queue_reply(&reply);
                self.closing = true;
            }
            Reply::Transfer(transfer) => return Some(transfer),
        }
        None
    }

    /// Connections are always interested in reads.
    pub fn wants_read(&self) -> bool {
        self.state != ConnState::Closed
    }

    /// Interested in writes iff there is something to send.
    pub fn wants_write(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// QUIT was handled and every reply byte has been written.
    pub fn is_finished(&self) -> bool {
        self.closing && self.outbound.is_empty()
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub fn write_armed(&self) -> bool {
        self.write_armed
    }

    pub fn set_write_armed(&mut self, armed: bool) {
        self.write_armed = armed;
    }

    pub fn transfer(&self) -> Option<usize> {
        self.transfer
    }

    /// Record the transfer started on behalf of this connection.
    pub fn start_transfer(&mut self, key: usize) {
        self.transfer = Some(key);
    }

    /// Clear the in-flight transfer and queue its outcome.
    pub fn finish_transfer(&mut self, reply: &str) {
        self.transfer = None;
        self.session.end_transfer();
        self.queue_reply(reply);
    }

    /// Mark the connection as terminated.
    pub fn close(&mut self) {
        self.state = ConnState::Closed;
    }

    /// WHO entry for this connection.
    pub fn peer_info(&self, id: usize) -> PeerInfo {
        PeerInfo {
            id,
            peer: self.peer,
            user: self.session.user().map(str::to_string),
            since: self.connected_at,
        }
    }
}

impl<S: Read> Connection<S> {
    /// Attempt one nonblocking read of up to `scratch.len()` bytes.
    pub fn fill(&mut self, scratch: &mut [u8]) -> io::Result<Fill> {
        loop {
            match self.stream.read(scratch) {
                Ok(0) => return Ok(Fill::Eof),
                Ok(n) => {
                    self.on_data(&scratch[..n]);
                    return Ok(Fill::Data(n));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Fill::WouldBlock);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl<S: Write> Connection<S> {
    /// Write as much of the outbound buffer as the socket accepts.
    ///
    /// The accepted prefix is removed; the rest waits for the next
    /// writable readiness.
    pub fn on_writable(&mut self) -> io::Result<()> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => self.outbound.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        if self.outbound.is_empty() && self.state == ConnState::ResponsePending {
            self.state = ConnState::AwaitingRequest;
        }
        Ok(())
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry<S> {
    connections: Slab<Connection<S>>,
    max_connections: usize,
}

impl<S> ConnectionRegistry<S> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection<S>) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    /// Get an immutable reference to a connection.
    pub fn get(&self, id: usize) -> Option<&Connection<S>> {
        self.connections.get(id)
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection<S>> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<Connection<S>> {
        self.connections.try_remove(id)
    }

    /// Check if a connection exists.
    #[cfg(test)]
    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    /// Snapshot of every registered connection for WHO.
    pub fn roster(&self) -> Vec<PeerInfo> {
        self.connections
            .iter()
            .map(|(id, conn)| conn.peer_info(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::path::Path;
    use std::sync::Arc;

    /// Scripted stream: reads replay `reads`, writes accept at most
    /// `write_limit` bytes per call (0 means would-block).
    #[derive(Default)]
    struct MockStream {
        reads: VecDeque<Fill>,
        incoming: VecDeque<Vec<u8>>,
        written: Vec<u8>,
        write_limit: usize,
    }

    impl MockStream {
        fn with_chunks(chunks: &[&[u8]]) -> Self {
            let mut stream = MockStream {
                write_limit: usize::MAX,
                ..Default::default()
            };
            for chunk in chunks {
                stream.reads.push_back(Fill::Data(chunk.len()));
                stream.incoming.push_back(chunk.to_vec());
            }
            stream
        }

        fn then(mut self, fill: Fill) -> Self {
            self.reads.push_back(fill);
            self
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(Fill::Data(_)) => {
                    let chunk = self.incoming.pop_front().unwrap();
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                Some(Fill::Eof) => Ok(0),
                Some(Fill::WouldBlock) | None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.write_limit == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.write_limit);
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn conn(stream: MockStream, port: u16) -> Connection<MockStream> {
        let peer = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
        Connection::new(stream, peer, Session::new(Arc::from(Path::new("."))))
    }

    /// Read everything available, dispatching each complete request.
    fn pump(conn: &mut Connection<MockStream>) -> (usize, Fill) {
        let mut scratch = [0u8; READ_CHUNK];
        let mut dispatched = 0;
        loop {
            match conn.fill(&mut scratch).unwrap() {
                Fill::Data(_) => {
                    while let Some(line) = conn.next_request() {
                        dispatched += 1;
                        assert!(conn.dispatch(&line, &[]).is_none());
                    }
                }
                other => return (dispatched, other),
            }
        }
    }

    #[test]
    fn test_partial_reads_dispatch_once() {
        let stream = MockStream::with_chunks(&[b"EC", b"HO he", b"llo\r", b"\n"]);
        let mut c = conn(stream, 5000);

        let (dispatched, last) = pump(&mut c);

        assert_eq!(dispatched, 1);
        assert_eq!(last, Fill::WouldBlock);
        assert!(c.inbound().is_empty());
        assert_eq!(c.outbound(), b"OK hello\r\n");
        assert_eq!(c.state(), ConnState::ResponsePending);
    }

    #[test]
    fn test_no_delimiter_no_dispatch() {
        let stream = MockStream::with_chunks(&[b"ECHO never", b" ending", b" story\r"]);
        let mut c = conn(stream, 5000);

        let (dispatched, _) = pump(&mut c);

        assert_eq!(dispatched, 0);
        assert_eq!(c.inbound(), b"ECHO never ending story\r");
        assert!(!c.wants_write());
        assert_eq!(c.state(), ConnState::AwaitingRequest);
    }

    #[test]
    fn test_pipelined_requests_queue_in_order() {
        let stream = MockStream::with_chunks(&[b"ECHO one\r\nECHO two\r\nECHO thr"]);
        let mut c = conn(stream, 5000);

        let (dispatched, _) = pump(&mut c);

        assert_eq!(dispatched, 2);
        assert_eq!(c.inbound(), b"ECHO thr");
        assert_eq!(c.outbound(), b"OK one\r\nOK two\r\n");
    }

    #[test]
    fn test_partial_writes_keep_remainder() {
        let mut c = conn(MockStream::with_chunks(&[]), 5000);
        c.stream_mut().write_limit = 4;
        c.queue_reply("OK hello");
        assert!(c.wants_write());

        // Limit of 4 bytes per call, so the loop drains it in three writes
        c.on_writable().unwrap();
        assert!(c.outbound().is_empty());
        assert_eq!(c.stream_mut().written, b"OK hello\r\n");
        assert_eq!(c.state(), ConnState::AwaitingRequest);

        c.queue_reply("OK again");
        c.stream_mut().write_limit = 0;
        c.on_writable().unwrap();
        assert_eq!(c.outbound(), b"OK again\r\n");
        assert_eq!(c.state(), ConnState::ResponsePending);
    }

    #[test]
    fn test_unsent_reply_is_not_overwritten() {
        let stream = MockStream::with_chunks(&[b"ECHO first\r\n", b"ECHO second\r\n"]);
        let mut c = conn(stream, 5000);
        c.stream_mut().write_limit = 0;

        pump(&mut c);
        c.on_writable().unwrap();

        assert_eq!(c.outbound(), b"OK first\r\nOK second\r\n");
    }

    #[test]
    fn test_quit_finishes_after_drain() {
        let stream = MockStream::with_chunks(&[b"QUIT\r\nECHO late\r\n"]);
        let mut c = conn(stream, 5000);

        let mut scratch = [0u8; READ_CHUNK];
        c.fill(&mut scratch).unwrap();
        let line = c.next_request().unwrap();
        c.dispatch(&line, &[]);

        assert!(c.is_closing());
        assert!(!c.is_finished());
        c.on_writable().unwrap();
        assert!(c.is_finished());
        assert_eq!(c.stream_mut().written, b"OK bye\r\n");
    }

    #[test]
    fn test_connection_state_transitions() {
        let mut c = conn(MockStream::with_chunks(&[]), 5000);
        assert_eq!(c.state(), ConnState::AwaitingRequest);
        assert!(c.wants_read());

        c.queue_reply("OK");
        assert_eq!(c.state(), ConnState::ResponsePending);

        c.close();
        assert_eq!(c.state(), ConnState::Closed);
        assert!(!c.wants_read());

        // Closed is terminal
        c.queue_reply("OK ignored");
        c.on_writable().unwrap();
        assert_eq!(c.state(), ConnState::Closed);
    }

    #[test]
    fn test_eof_removes_only_that_connection() {
        let mut registry = ConnectionRegistry::new(4);
        let a = registry
            .insert(conn(MockStream::with_chunks(&[]).then(Fill::Eof), 5000))
            .unwrap();
        let b = registry
            .insert(conn(MockStream::with_chunks(&[b"ECHO par"]), 5001))
            .unwrap();

        let mut scratch = [0u8; READ_CHUNK];
        assert_eq!(
            registry.get_mut(b).unwrap().fill(&mut scratch).unwrap(),
            Fill::Data(8)
        );

        let fill = registry.get_mut(a).unwrap().fill(&mut scratch).unwrap();
        assert_eq!(fill, Fill::Eof);
        let mut closed = registry.remove(a).unwrap();
        closed.close();

        assert_eq!(registry.len(), 1);
        assert!(!registry.contains(a));
        assert!(registry.remove(a).is_none());

        let survivor = registry.get(b).unwrap();
        assert_eq!(survivor.inbound(), b"ECHO par");
        assert!(!survivor.wants_write());
        assert_eq!(survivor.state(), ConnState::AwaitingRequest);
    }

    #[test]
    fn test_connection_registry() {
        let mut registry = ConnectionRegistry::new(2);

        let id1 = registry.insert(conn(MockStream::default(), 10)).unwrap();
        let id2 = registry.insert(conn(MockStream::default(), 11)).unwrap();

        // At capacity
        assert!(registry.is_full());
        assert!(registry.insert(conn(MockStream::default(), 12)).is_none());

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(id1).unwrap().peer().port(), 10);
        assert_eq!(registry.get(id2).unwrap().peer().port(), 11);

        let roster = registry.roster();
        assert_eq!(roster.len(), 2);
        assert_eq!(roster[1].id, id2);
        assert_eq!(roster[1].user, None);

        registry.remove(id1);
        assert!(!registry.contains(id1));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.roster().len(), 1);
    }
}
