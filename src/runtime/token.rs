//! Mapping between mio tokens and the sockets they identify.
//!
//! Client connections and data channels live in separate slabs, so their
//! keys are interleaved into one token space: even tokens are clients, odd
//! tokens are data channels. The top two values are reserved.

use mio::Token;

/// Token for the control listener.
pub const LISTENER: Token = Token(usize::MAX);

/// Token for the cross-thread waker.
pub const WAKER: Token = Token(usize::MAX - 1);

/// Socket identified by a readiness event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// The control listener.
    Listener,
    /// Wakeup from another thread.
    Waker,
    /// A client control connection.
    Client(usize),
    /// The data channel of an in-flight transfer.
    Data(usize),
}

impl Endpoint {
    /// Token to register this endpoint under.
    pub fn token(self) -> Token {
        match self {
            Endpoint::Listener => LISTENER,
            Endpoint::Waker => WAKER,
            Endpoint::Client(id) => Token(id << 1),
            Endpoint::Data(key) => Token((key << 1) | 1),
        }
    }

    /// Decode the endpoint an event token refers to.
    pub fn from_token(token: Token) -> Self {
        match token {
            LISTENER => Endpoint::Listener,
            WAKER => Endpoint::Waker,
            Token(n) if n & 1 == 0 => Endpoint::Client(n >> 1),
            Token(n) => Endpoint::Data(n >> 1),
        }
    }
}
