//! Inbound record parsing for the adapter's line protocol
//!
//! The adapter speaks newline-delimited logfmt: each line is a sequence of
//! `key=value` pairs where the first key names the event (`scan`, `conn`,
//! `read`, ...). Keys must be identifiers; anything else on the line is
//! noise from the adapter firmware and is dropped. Byte-valued fields
//! (`m`, `data`) are URL-percent-encoded.

use std::fmt;

/// One parsed inbound line: ordered `key=value` pairs, identifier keys only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pairs: Vec<(String, String)>,
}

impl Record {
    /// Parse a single line. Returns `None` when no identifier-keyed pair
    /// survives (blank line, pure garbage).
    pub fn parse(line: &str) -> Option<Record> {
        let mut pairs = Vec::new();
        for token in line.split_ascii_whitespace() {
            let (key, value) = match token.split_once('=') {
                Some((k, v)) => (k, v),
                None => (token, ""),
            };
            if is_identifier(key) {
                pairs.push((key.to_string(), value.to_string()));
            }
        }
        if pairs.is_empty() {
            None
        } else {
            Some(Record { pairs })
        }
    }

    /// The event name: the first key on the line.
    pub fn event(&self) -> &str {
        &self.pairs[0].0
    }

    /// Value of the first pair with the given key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Integer field, if present and well-formed.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key)?.parse().ok()
    }

    /// Percent-decoded byte field. Missing field decodes as empty.
    pub fn get_bytes(&self, key: &str) -> Vec<u8> {
        decode_bytes(self.get(key).unwrap_or(""))
    }

    /// The connection handle of a handle-scoped event. Adapter firmware
    /// variants spell these either `read conn=1 attr=3` or
    /// `read=1 attr=3`; accept both.
    pub fn conn_handle(&self) -> Option<i64> {
        self.get_int("conn").or_else(|| self.get_int(self.event()))
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<")?;
        for (i, (k, v)) in self.pairs.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{k}={v}")?;
        }
        write!(f, ">")
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Percent-decode a byte-valued field.
pub fn decode_bytes(text: &str) -> Vec<u8> {
    urlencoding::decode_binary(text.as_bytes()).into_owned()
}

/// Percent-encode bytes for an outbound command field.
pub fn encode_bytes(data: &[u8]) -> String {
    urlencoding::encode_binary(data).into_owned()
}
