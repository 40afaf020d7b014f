//! Wire protocol of the stage controller.
//!
//! ASCII commands terminated by `\r`, one reply line per command (also `\r`
//! terminated). The protocol carries no request identifier, so pairing a reply
//! with its request relies entirely on the engine never overlapping exchanges.

/// Typed commands and their wire encoding.
pub mod command;
/// Reply line parsing.
pub mod response;
/// Controller error codes.
pub mod taxonomy;

pub use command::{Axis, Command, Position};
pub use response::{parse_response, Response};
pub use taxonomy::ErrorKind;
