//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! Everything runs on one thread. The registry, sessions and in-flight
//! transfers are owned by the `Reactor` and only touched between two calls
//! to `Poll::poll`, which is the sole suspension point.
//!
//! ## Bulk transfers
//!
//! LIST and FILE do not write their payload inline. The session hands back a
//! `Transfer`, whose data channel is registered here for writability and
//! drained a chunk at a time alongside every other socket. The owning
//! connection gets its reply once the transfer completes or fails.

use crate::config::Config;
use crate::protocols::control::{
    CommandError, FileTransferError, Progress, Session, Transfer,
};
use crate::runtime::connection::{Connection, ConnectionRegistry, Fill, READ_CHUNK};
use crate::runtime::token::{Endpoint, LISTENER, WAKER};
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Waker};
use slab::Slab;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Readiness events handled per poll call.
const EVENT_CAPACITY: usize = 1024;

/// A transfer together with the connection waiting on it.
struct ActiveTransfer {
    owner: usize,
    transfer: Transfer,
}

/// The control socket plus everything reachable from it.
pub struct Reactor {
    poll: Poll,
    listener: TcpListener,
    waker: Arc<Waker>,
    connections: ConnectionRegistry<TcpStream>,
    transfers: Slab<ActiveTransfer>,
    root: Arc<Path>,
    scratch: Box<[u8]>,
}

impl Reactor {
    /// Bind the control socket and set up the poll instance.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let addr = config
            .listen
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("no address for '{}'", config.listen),
                )
            })?;

        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(create_listener(addr)?);
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        Ok(Self {
            poll,
            listener,
            waker,
            connections: ConnectionRegistry::new(config.max_connections),
            transfers: Slab::new(),
            root: Arc::from(config.root.as_path()),
            scratch: vec![0u8; READ_CHUNK].into_boxed_slice(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle for breaking a blocked poll from another thread or a signal
    /// handler, so a stop condition set elsewhere is noticed promptly.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Run the loop until `stop` returns true.
    ///
    /// `stop` is checked once per cycle. Whoever sets it must also wake the
    /// loop (see `waker`), otherwise the change is only seen after the next
    /// socket event.
    pub fn run_until(&mut self, mut stop: impl FnMut() -> bool) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENT_CAPACITY);

        while !stop() {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                match Endpoint::from_token(event.token()) {
                    Endpoint::Listener => self.accept_connections(),
                    Endpoint::Waker => {}
                    Endpoint::Client(conn_id) => {
                        if let Err(e) = self.handle_client_event(conn_id, event) {
                            debug!(conn_id, error = %e, "Connection error");
                            self.close_connection(conn_id);
                        }
                    }
                    Endpoint::Data(key) => self.handle_transfer_event(key),
                }
            }
        }

        info!(
            connections = self.connections.len(),
            transfers = self.transfers.len(),
            "Event loop stopped"
        );
        Ok(())
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.connections.is_full() {
                        warn!(peer = %peer, "Connection limit reached");
                        continue;
                    }

                    let session = Session::new(Arc::clone(&self.root));
                    let Some(conn_id) = self
                        .connections
                        .insert(Connection::new(stream, peer, session))
                    else {
                        continue;
                    };

                    let Some(conn) = self.connections.get_mut(conn_id) else {
                        continue;
                    };
                    let token = Endpoint::Client(conn_id).token();
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(conn.stream_mut(), token, Interest::READABLE)
                    {
                        warn!(peer = %peer, error = %e, "Failed to register connection");
                        self.connections.remove(conn_id);
                        continue;
                    }

                    debug!(conn_id, peer = %peer, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!("Accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_client_event(&mut self, conn_id: usize, event: &Event) -> io::Result<()> {
        let Some(conn) = self.connections.get(conn_id) else {
            return Ok(());
        };

        let readable = event.is_readable() || event.is_read_closed() || event.is_error();
        if conn.wants_read() && readable {
            self.handle_readable(conn_id)?;
        }

        if event.is_writable() {
            self.handle_writable(conn_id)?;
        }

        self.sync_interest(conn_id)
    }

    /// Read until the socket would block, dispatching each complete request.
    fn handle_readable(&mut self, conn_id: usize) -> io::Result<()> {
        loop {
            let conn = self
                .connections
                .get_mut(conn_id)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;

            match conn.fill(&mut self.scratch)? {
                Fill::Data(_) => self.dispatch_requests(conn_id),
                Fill::WouldBlock => return Ok(()),
                Fill::Eof => {
                    return Err(io::Error::new(io::ErrorKind::ConnectionReset, "EOF"));
                }
            }
        }
    }

    fn dispatch_requests(&mut self, conn_id: usize) {
        loop {
            let Some(conn) = self.connections.get_mut(conn_id) else {
                return;
            };
            if conn.is_closing() {
                return;
            }
            let Some(line) = conn.next_request() else {
                return;
            };

            let roster = self.connections.roster();
            let Some(conn) = self.connections.get_mut(conn_id) else {
                return;
            };
            if let Some(transfer) = conn.dispatch(&line, &roster) {
                self.start_transfer(conn_id, transfer);
            }
        }
    }

    fn handle_writable(&mut self, conn_id: usize) -> io::Result<()> {
        let conn = self
            .connections
            .get_mut(conn_id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;

        conn.on_writable()?;

        if conn.is_finished() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "client quit",
            ));
        }
        Ok(())
    }

    /// Register for writability iff the outbound buffer is non-empty.
    fn sync_interest(&mut self, conn_id: usize) -> io::Result<()> {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return Ok(());
        };

        let wants_write = conn.wants_write();
        if wants_write == conn.write_armed() {
            return Ok(());
        }

        let interest = if wants_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        self.poll.registry().reregister(
            conn.stream_mut(),
            Endpoint::Client(conn_id).token(),
            interest,
        )?;
        conn.set_write_armed(wants_write);
        Ok(())
    }

    fn start_transfer(&mut self, owner: usize, mut transfer: Transfer) {
        let entry = self.transfers.vacant_entry();
        let key = entry.key();
        let target = transfer.target();

        let registered = self.poll.registry().register(
            transfer.stream_mut(),
            Endpoint::Data(key).token(),
            Interest::WRITABLE,
        );

        let Some(conn) = self.connections.get_mut(owner) else {
            return;
        };
        match registered {
            Ok(()) => {
                entry.insert(ActiveTransfer { owner, transfer });
                conn.start_transfer(key);
                debug!(conn_id = owner, key, target = %target, "Transfer started");
            }
            Err(e) => {
                warn!(
                    conn_id = owner,
                    target = %target,
                    error = %e,
                    "Failed to register data channel"
                );
                conn.finish_transfer(&CommandError::from(FileTransferError::Io(e)).reply());
            }
        }
    }

    fn handle_transfer_event(&mut self, key: usize) {
        let Some(active) = self.transfers.get_mut(key) else {
            return;
        };

        let outcome = active
            .transfer
            .check_connected()
            .and_then(|()| active.transfer.on_writable());

        let reply = match outcome {
            Ok(Progress::Pending) => return,
            Ok(Progress::Complete(sent)) => {
                debug!(conn_id = active.owner, key, sent, "Transfer complete");
                active.transfer.completion_line()
            }
            Err(e) => {
                warn!(
                    conn_id = active.owner,
                    key,
                    sent = active.transfer.sent(),
                    error = %e,
                    "Transfer failed"
                );
                CommandError::from(FileTransferError::Io(e)).reply()
            }
        };

        self.finish_transfer(key, &reply);
    }

    /// Close a transfer's data channel and hand its reply to the owner.
    fn finish_transfer(&mut self, key: usize, reply: &str) {
        let Some(mut active) = self.transfers.try_remove(key) else {
            return;
        };
        let _ = self.poll.registry().deregister(active.transfer.stream_mut());
        let owner = active.owner;
        drop(active);

        if let Some(conn) = self.connections.get_mut(owner) {
            conn.finish_transfer(reply);
        }
        if let Err(e) = self.sync_interest(owner) {
            debug!(conn_id = owner, error = %e, "Connection error");
            self.close_connection(owner);
        }
    }

    fn close_connection(&mut self, conn_id: usize) {
        let Some(mut conn) = self.connections.remove(conn_id) else {
            return;
        };
        conn.close();
        let _ = self.poll.registry().deregister(conn.stream_mut());

        if let Some(key) = conn.transfer() {
            if let Some(mut active) = self.transfers.try_remove(key) {
                let _ = self.poll.registry().deregister(active.transfer.stream_mut());
                debug!(conn_id, key, "Transfer abandoned");
            }
        }

        debug!(conn_id, peer = %conn.peer(), "Connection closed");
    }
}

/// Create the nonblocking control listener.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}
