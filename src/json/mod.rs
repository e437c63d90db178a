//! Minimal JSON reader producing a tagged value tree.
//!
//! Deliberately narrower than the JSON grammar: the document root must be an
//! object or an array, `\uXXXX` escapes are recognized but not decoded, and a
//! malformed number degrades to `0` instead of failing the document.

mod parser;
mod value;

pub use parser::{parse, parse_at, parse_bytes, JsonError};
pub use value::JsonValue;
