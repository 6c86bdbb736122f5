//! Wire framing: the byte-level cursor and the PDU protocol built on it.

pub mod cursor;
pub mod protocol;

pub use cursor::Cursor;
