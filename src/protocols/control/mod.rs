//! Control protocol implementation.
//!
//! Line-oriented commands modeled after FTP, with bulk payloads moved over a
//! separate data connection:
//!
//! ```text
//! Request:  CODE[ ARGS]\r\n     (code = first 4 characters, case-insensitive)
//! Response: OK <text>\r\n  |  ERROR <text>\r\n
//!
//! Example session:
//! > USER alice            < OK logged in as alice
//! > PORT 127,0,0,1,30,1   < OK data port 7681
//! > LIST                  < OK end of listing (3 entries)
//! ```
//!
//! PORT connects to `h1.h2.h3.h4:(p1*256+p2)`; the next LIST or FILE consumes
//! that connection and closes it when done.

pub mod channel;
pub mod error;
pub mod handler;
pub mod parser;

pub use channel::{Progress, Transfer};
pub use error::{CommandError, FileTransferError};
pub use handler::{PeerInfo, Reply, Session};
pub use parser::{find_delimiter, DELIMITER};
