//! Memcache ASCII protocol: constants, error taxonomy, line framing, and
//! command field parsing.
//!
//! The protocol speaks `\r\n`-terminated text lines over TCP, with raw
//! payload blocks following `set` command lines. [`LineReader`] frames
//! commands and payloads; the `parse_*` functions in [`parse`] validate
//! and decode command fields.
//!
//! Errors split into two channels: [`ClientError`] values describe bad
//! input on an intact connection (report `CLIENT_ERROR` and keep going),
//! while the other [`ReadError`] variants mean the stream itself is done
//! or broken.

mod error;
mod parse;
mod reader;

pub use error::{ClientError, ReadError};
pub use parse::{check_key, parse_delete_fields, parse_get_fields, parse_set_fields};
pub use reader::{Line, LineReader};

/// Maximum key length, fixed by protocol compatibility.
pub const MAX_KEY_SIZE: usize = 250;

/// Absolute ceiling for any configured maximum item size.
pub const MAX_ITEM_SIZE: usize = 128 * (1 << 20);

/// Default maximum item size when not configured.
pub const DEFAULT_MAX_ITEM_SIZE: usize = 1 << 20;

/// Exptime values above this are absolute unix seconds; positive values up
/// to it are relative to now.
pub const MAX_RELATIVE_EXPTIME: i64 = 60 * 60 * 24 * 30;

pub const SEPARATOR: &[u8] = b"\r\n";

pub const SET_COMMAND: &[u8] = b"set";
pub const GET_COMMAND: &[u8] = b"get";
pub const GETS_COMMAND: &[u8] = b"gets";
pub const DELETE_COMMAND: &[u8] = b"delete";

pub const NOREPLY_OPTION: &[u8] = b"noreply";

pub const STORED_RESPONSE: &str = "STORED";
pub const VALUE_RESPONSE: &str = "VALUE";
pub const END_RESPONSE: &str = "END";
pub const DELETED_RESPONSE: &str = "DELETED";
pub const NOT_FOUND_RESPONSE: &str = "NOT_FOUND";
pub const ERROR_RESPONSE: &str = "ERROR";
pub const CLIENT_ERROR_RESPONSE: &str = "CLIENT_ERROR";
pub const SERVER_ERROR_RESPONSE: &str = "SERVER_ERROR";

/// Fixed input buffer size; commands must fit in it.
pub const IN_BUFFER_SIZE: usize = 16 * (1 << 10);
pub const OUT_BUFFER_SIZE: usize = 16 * (1 << 10);
