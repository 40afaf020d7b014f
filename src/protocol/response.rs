//! Parsing of controller reply lines.
//!
//! Grammar (one line, delimiter already stripped):
//!
//! ```text
//! R                 -> Ack
//! E<digits>         -> ErrorCode
//! <int>             -> IntValue
//! <int>,<int>[,<int>] -> PositionTriple (missing Z reads as 0)
//! anything else     -> Malformed
//! ```

use crate::error::TransportError;
use crate::protocol::ErrorKind;

/// One parsed reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ack,
    ErrorCode(ErrorKind),
    IntValue(i64),
    PositionTriple(i64, i64, i64),
    Malformed(String),
}

impl Response {
    /// Setter replies are either `R` or `0` depending on the command family.
    pub fn is_success(&self) -> bool {
        matches!(self, Response::Ack | Response::IntValue(0))
    }

    /// Lines that terminate a motion wait: the completion token or an error.
    pub fn ends_motion(&self) -> bool {
        matches!(self, Response::Ack | Response::ErrorCode(_))
    }
}

/// Parse one reply line. An empty line is a transport failure, not a reply.
pub fn parse_response(line: &str) -> Result<Response, TransportError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(TransportError::EmptyResponse);
    }

    if line == "R" {
        return Ok(Response::Ack);
    }

    if let Some(digits) = line.strip_prefix('E') {
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(match digits.parse::<u32>() {
                Ok(code) => Response::ErrorCode(ErrorKind::from_code(code)),
                Err(_) => Response::Malformed(line.to_string()),
            });
        }
    }

    let values: Option<Vec<i64>> = line
        .split(',')
        .map(|field| field.trim().parse::<i64>().ok())
        .collect();

    Ok(match values.as_deref() {
        Some([value]) => Response::IntValue(*value),
        Some([x, y]) => Response::PositionTriple(*x, *y, 0),
        Some([x, y, z]) => Response::PositionTriple(*x, *y, *z),
        _ => Response::Malformed(line.to_string()),
    })
}
