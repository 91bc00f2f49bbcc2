//! Proxied header block
//!
//! Headers captured from a request or response head. A proxy only needs a
//! single value per name to route and re-emit a message, so the store keeps
//! unique names with last-write-wins values while remembering the order in
//! which names first appeared on the wire.

use super::CRLF;

/// Header collection with unique, case-insensitive names
///
/// - The first spelling of a name is kept when it is re-emitted
/// - A repeated name replaces the earlier value in place
/// - Iteration follows first-appearance order
#[derive(Debug, Clone, Default)]
pub struct Headers {
    headers: Vec<(String, String)>,
}

impl Headers {
    /// Create a new empty headers collection
    pub fn new() -> Self {
        Headers {
            headers: Vec::new(),
        }
    }

    /// Set a header, replacing any existing value for the same name
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();

        match self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            Some((_, existing)) => *existing = value,
            None => self.headers.push((name, value)),
        }
    }

    /// Get the value for a header (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Check if a header exists
    pub fn contains(&self, name: &str) -> bool {
        self.headers
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Get the number of headers
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    /// Check if there are no headers
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Clear all headers
    pub fn clear(&mut self) {
        self.headers.clear();
    }

    /// Iterate over all headers
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Serialize as `Name: Value` lines joined by CRLF (no trailing CRLF)
    pub fn to_header_string(&self) -> String {
        self.iter()
            .map(|(name, value)| format!("{}: {}", name, value))
            .collect::<Vec<_>>()
            .join(CRLF)
    }

    /// Split a header line on its first colon
    ///
    /// Returns `None` for lines without a colon or with an empty name; the
    /// parser skips those instead of failing the whole message.
    pub fn parse_header_line(line: &str) -> Option<(String, String)> {
        let (name, value) = line.split_once(':')?;
        let name = name.trim();

        if name.is_empty() {
            return None;
        }

        Some((name.to_string(), value.trim().to_string()))
    }
}
