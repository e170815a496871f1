//! Control protocol parser.

use super::error::AddressFormatError;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Terminator for every request and reply line.
pub const DELIMITER: &[u8] = b"\r\n";

/// Width of the command code at the start of a request line.
const CODE_WIDTH: usize = 4;

/// A parsed request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Upper-cased command code, at most four characters.
    pub code: String,
    /// Trimmed remainder of the line.
    pub args: String,
}

impl Command {
    /// Split a request line (without delimiter) into code and arguments.
    ///
    /// The code is the first four characters, so `WHO` and `MSG` keep the
    /// separating space inside the code field and lose it to trimming.
    pub fn parse(line: &str) -> Self {
        let line = line.trim_start();
        let split = line
            .char_indices()
            .nth(CODE_WIDTH)
            .map_or(line.len(), |(idx, _)| idx);
        let (code, rest) = line.split_at(split);

        Self {
            code: code.trim().to_ascii_uppercase(),
            args: rest.trim().to_string(),
        }
    }
}

/// Parse a PORT argument `h1,h2,h3,h4,p1,p2` into a socket address.
///
/// The address is `h1.h2.h3.h4` and the port is `p1 * 256 + p2`.
pub fn parse_port_argument(args: &str) -> Result<SocketAddrV4, AddressFormatError> {
    let fields: Vec<&str> = args.split(',').map(str::trim).collect();
    if fields.len() != 6 {
        return Err(AddressFormatError::FieldCount(fields.len()));
    }

    let mut octets = [0u8; 6];
    for (octet, field) in octets.iter_mut().zip(&fields) {
        if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AddressFormatError::NotNumeric(field.to_string()));
        }
        *octet = field
            .parse()
            .map_err(|_| AddressFormatError::OutOfRange(field.to_string()))?;
    }

    let ip = Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]);
    let port = u16::from(octets[4]) * 256 + u16::from(octets[5]);
    Ok(SocketAddrV4::new(ip, port))
}

/// Find \r\n in buffer, returning the position of \r.
pub fn find_delimiter(buffer: &[u8]) -> Option<usize> {
    buffer.windows(DELIMITER.len()).position(|w| w == DELIMITER)
}
