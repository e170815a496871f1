//! Protocol implementations.
//!
//! Each protocol has a parser module used by the runtime event loop.
//!
//! - `control`: FTP-style control protocol with PORT data channels

pub mod control;
