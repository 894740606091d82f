//! RESP Protocol Implementation
//!
//! Outbound commands are encoded as arrays of bulk strings and inbound replies
//! are decoded incrementally from the connection's read buffer.
//!
//! ## Modules
//!
//! - `types`: The `RespValue` enum and its serialization
//! - `parser`: Incremental reply parser
//!
//! ## Example
//!
//! ```
//! use flashkv_driver::protocol::{parse_message, RespValue};
//!
//! let frame = RespValue::command("GET", [&b"name"[..]]).serialize();
//! assert_eq!(frame, b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n");
//!
//! let (reply, consumed) = parse_message(b"$4\r\nAriz\r\n").unwrap().unwrap();
//! assert_eq!(reply, RespValue::bulk_string("Ariz"));
//! assert_eq!(consumed, 10);
//! ```

pub mod parser;
pub mod types;

pub use parser::{parse_message, ParseError, ParseResult, RespParser};
pub use types::RespValue;
