//! Recursive-descent parser over a byte cursor.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{error, warn};

use super::JsonValue;

/// Why a document was rejected. Positions are byte offsets into the input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JsonError {
    #[error("document root must be an object or an array")]
    InvalidRoot,
    #[error("unexpected end of input at byte {0}")]
    UnexpectedEnd(usize),
    #[error("unterminated string starting at byte {0}")]
    UnterminatedString(usize),
    #[error("invalid escape '\\{escape}' at byte {pos}")]
    InvalidEscape { escape: char, pos: usize },
    #[error("expected {expected} at byte {pos}, found '{found}'")]
    Expected {
        expected: &'static str,
        pos: usize,
        found: char,
    },
    #[error("unexpected character '{found}' at byte {pos}")]
    UnexpectedToken { found: char, pos: usize },
}

/// Parse a document whose root is an object or array.
pub fn parse(text: &str) -> Result<JsonValue, JsonError> {
    let mut pos = 0;
    parse_at(text, &mut pos)
}

/// Parse starting at `*pos`, leaving `*pos` just past the root value.
pub fn parse_at(text: &str, pos: &mut usize) -> Result<JsonValue, JsonError> {
    let mut parser = Parser {
        input: text.as_bytes(),
        pos: *pos,
    };
    let value = parser.parse_root()?;
    *pos = parser.pos;
    Ok(value)
}

/// Parse raw bytes, e.g. a WebSocket payload or an HTTP body.
pub fn parse_bytes(bytes: &[u8]) -> Result<JsonValue, JsonError> {
    let mut parser = Parser {
        input: bytes,
        pos: 0,
    };
    parser.parse_root()
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn parse_root(&mut self) -> Result<JsonValue, JsonError> {
        self.skip_whitespace();
        match self.peek() {
            Some(b'{') | Some(b'[') => self.parse_value(),
            _ => Err(JsonError::InvalidRoot),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, byte: u8, expected: &'static str) -> Result<(), JsonError> {
        match self.peek() {
            Some(b) if b == byte => {
                self.pos += 1;
                Ok(())
            }
            Some(found) => Err(JsonError::Expected {
                expected,
                pos: self.pos,
                found: found as char,
            }),
            None => Err(JsonError::UnexpectedEnd(self.pos)),
        }
    }

    fn parse_value(&mut self) -> Result<JsonValue, JsonError> {
        self.skip_whitespace();
        match self.peek() {
            None => Err(JsonError::UnexpectedEnd(self.pos)),
            Some(b'{') => self.parse_object(),
            Some(b'[') => self.parse_array(),
            Some(b'"') => self.parse_string().map(JsonValue::String),
            Some(b'0'..=b'9' | b'-' | b'+') => Ok(JsonValue::Number(self.parse_number())),
            Some(b't') => self.parse_literal("true", JsonValue::Bool(true)),
            Some(b'f') => self.parse_literal("false", JsonValue::Bool(false)),
            Some(b'n') => self.parse_literal("null", JsonValue::Null),
            Some(found) => Err(JsonError::UnexpectedToken {
                found: found as char,
                pos: self.pos,
            }),
        }
    }

    fn parse_literal(&mut self, word: &'static str, value: JsonValue) -> Result<JsonValue, JsonError> {
        if self.input[self.pos..].starts_with(word.as_bytes()) {
            self.pos += word.len();
            Ok(value)
        } else {
            Err(JsonError::UnexpectedToken {
                found: self.input[self.pos] as char,
                pos: self.pos,
            })
        }
    }

    fn parse_object(&mut self) -> Result<JsonValue, JsonError> {
        self.expect(b'{', "'{'")?;
        let mut members = BTreeMap::new();
        self.skip_whitespace();
        if self.peek() == Some(b'}') {
            self.pos += 1;
            return Ok(JsonValue::Object(members));
        }
        loop {
            self.skip_whitespace();
            if self.peek() != Some(b'"') {
                return match self.peek() {
                    Some(found) => Err(JsonError::Expected {
                        expected: "object key",
                        pos: self.pos,
                        found: found as char,
                    }),
                    None => Err(JsonError::UnexpectedEnd(self.pos)),
                };
            }
            let key = self.parse_string()?;
            self.skip_whitespace();
            self.expect(b':', "':' after object key")?;
            let value = self.parse_value()?;
            members.insert(key, value);
            self.skip_whitespace();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b'}') => {
                    self.pos += 1;
                    return Ok(JsonValue::Object(members));
                }
                Some(found) => {
                    return Err(JsonError::Expected {
                        expected: "',' or '}'",
                        pos: self.pos,
                        found: found as char,
                    })
                }
                None => return Err(JsonError::UnexpectedEnd(self.pos)),
            }
        }
    }

    fn parse_array(&mut self) -> Result<JsonValue, JsonError> {
        self.expect(b'[', "'['")?;
        let mut items = Vec::new();
        self.skip_whitespace();
        if self.peek() == Some(b']') {
            self.pos += 1;
            return Ok(JsonValue::Array(items));
        }
        loop {
            items.push(self.parse_value()?);
            self.skip_whitespace();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b']') => {
                    self.pos += 1;
                    return Ok(JsonValue::Array(items));
                }
                Some(found) => {
                    return Err(JsonError::Expected {
                        expected: "',' or ']'",
                        pos: self.pos,
                        found: found as char,
                    })
                }
                None => return Err(JsonError::UnexpectedEnd(self.pos)),
            }
        }
    }

    fn parse_string(&mut self) -> Result<String, JsonError> {
        let start = self.pos;
        self.expect(b'"', "'\"'")?;
        let mut out = Vec::new();
        while let Some(byte) = self.peek() {
            self.pos += 1;
            match byte {
                b'"' => return Ok(String::from_utf8_lossy(&out).into_owned()),
                b'\\' => {
                    let Some(escape) = self.peek() else {
                        return Err(JsonError::UnterminatedString(start));
                    };
                    self.pos += 1;
                    match escape {
                        b'"' => out.push(b'"'),
                        b'\\' => out.push(b'\\'),
                        b'/' => out.push(b'/'),
                        b'b' => out.push(0x08),
                        b'f' => out.push(0x0c),
                        b'n' => out.push(b'\n'),
                        b'r' => out.push(b'\r'),
                        b't' => out.push(b'\t'),
                        b'u' => {
                            let digits = self.input[self.pos..]
                                .iter()
                                .take(4)
                                .take_while(|b| b.is_ascii_hexdigit())
                                .count();
                            self.pos += digits;
                            warn!(pos = self.pos, "unicode escape sequences are not supported, dropping");
                        }
                        other => {
                            return Err(JsonError::InvalidEscape {
                                escape: other as char,
                                pos: self.pos - 1,
                            })
                        }
                    }
                }
                other => out.push(other),
            }
        }
        Err(JsonError::UnterminatedString(start))
    }

    fn parse_number(&mut self) -> f64 {
        let start = self.pos;
        while matches!(
            self.peek(),
            Some(b'0'..=b'9' | b'-' | b'+' | b'.' | b'e' | b'E')
        ) {
            self.pos += 1;
        }
        let run = String::from_utf8_lossy(&self.input[start..self.pos]);
        match run.parse::<f64>() {
            Ok(n) => n,
            Err(e) => {
                error!(pos = start, run = %run, error = %e, "invalid JSON number, using 0");
                0.0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_document() {
        let doc = parse(r#" { "a": [1, -2.5, 3e2], "b": {"c": null, "d": true, "e": false}, "s": "x" } "#)
            .unwrap();
        let a = doc.get("a").and_then(JsonValue::as_array).unwrap();
        assert_eq!(a.len(), 3);
        assert_eq!(a[1].as_f64(), Some(-2.5));
        assert_eq!(a[2].as_f64(), Some(300.0));
        assert!(doc.get_path(&["b", "c"]).unwrap().is_null());
        assert_eq!(doc.get_path(&["b", "d"]).and_then(JsonValue::as_bool), Some(true));
        assert_eq!(doc.get("s").and_then(JsonValue::as_str), Some("x"));
    }

    #[test]
    fn rejects_scalar_root() {
        assert_eq!(parse("\"text\""), Err(JsonError::InvalidRoot));
        assert_eq!(parse("42"), Err(JsonError::InvalidRoot));
        assert_eq!(parse("   "), Err(JsonError::InvalidRoot));
        assert_eq!(parse(""), Err(JsonError::InvalidRoot));
    }

    #[test]
    fn decodes_standard_escapes() {
        let doc = parse(r#"["q\"b\\s\/n\nr\rt\tb\bf\f"]"#).unwrap();
        assert_eq!(doc.index(0).and_then(JsonValue::as_str), Some("q\"b\\s/n\nr\rt\tb\u{8}f\u{c}"));
    }

    #[test]
    fn unicode_escape_is_dropped_not_fatal() {
        let doc = parse(r#"["a\u00e9b"]"#).unwrap();
        assert_eq!(doc.index(0).and_then(JsonValue::as_str), Some("ab"));
    }

    #[test]
    fn raw_utf8_survives() {
        let doc = parse("[\"héllo ✓\"]").unwrap();
        assert_eq!(doc.index(0).and_then(JsonValue::as_str), Some("héllo ✓"));
    }

    #[test]
    fn malformed_number_becomes_zero() {
        let doc = parse(r#"{"n": 1-2, "ok": 7}"#).unwrap();
        assert_eq!(doc.get("n").and_then(JsonValue::as_f64), Some(0.0));
        assert_eq!(doc.get("ok").and_then(JsonValue::as_f64), Some(7.0));
    }

    #[test]
    fn structural_errors_abort() {
        assert!(matches!(parse(r#"{"a" 1}"#), Err(JsonError::Expected { .. })));
        assert!(matches!(parse(r#"{"a": 1"#), Err(JsonError::UnexpectedEnd(_))));
        assert!(matches!(parse(r#"[1, 2"#), Err(JsonError::UnexpectedEnd(_))));
        assert!(matches!(parse(r#"["abc"#), Err(JsonError::UnterminatedString(1))));
        assert!(matches!(parse(r#"["\q"]"#), Err(JsonError::InvalidEscape { escape: 'q', .. })));
        assert!(matches!(parse(r#"[tru]"#), Err(JsonError::UnexpectedToken { .. })));
        assert!(matches!(parse(r#"{1: 2}"#), Err(JsonError::Expected { .. })));
        assert!(matches!(parse(r#"[1 2]"#), Err(JsonError::Expected { .. })));
    }

    #[test]
    fn duplicate_keys_keep_last_value() {
        let doc = parse(r#"{"k": 1, "k": 2}"#).unwrap();
        assert_eq!(doc.get("k").and_then(JsonValue::as_f64), Some(2.0));
        assert_eq!(doc.as_object().map(|m| m.len()), Some(1));
    }

    #[test]
    fn cursor_stops_after_root() {
        let text = r#"{"a":1} trailing"#;
        let mut pos = 0;
        parse_at(text, &mut pos).unwrap();
        assert_eq!(&text[pos..], " trailing");
    }

    #[test]
    fn empty_containers() {
        assert_eq!(parse("{}").unwrap(), JsonValue::Object(BTreeMap::new()));
        assert_eq!(parse("[ ]").unwrap(), JsonValue::Array(vec![]));
        assert_eq!(parse("[[],{}]").unwrap().as_array().map(<[_]>::len), Some(2));
    }

    #[test]
    fn serialized_documents_parse_back_equal() {
        let docs = [
            r#"{"metadata":{"message_type":"notification"},"payload":{"event":{"cost":100,"ok":true,"list":[1,2.5,-3,null,"s"]}}}"#,
            r#"[{"a":"tab\there"},[],{},[[[]]],"quote\"slash\\"]"#,
            r#"{"nested":{"deeper":{"deepest":[0.125,1e-7,123456789012]}}}"#,
        ];
        for text in docs {
            let first = parse(text).unwrap();
            let again = parse(&first.to_string()).unwrap();
            assert_eq!(first, again, "round trip of {text}");
        }
    }
}
