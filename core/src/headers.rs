/*
 * headers.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Corriere, a concurrent HTTP client library.
 *
 * Corriere is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Corriere is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Corriere.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Case-insensitive, insertion-ordered header multimap. Names are stored as
//! given; comparison is ASCII case-insensitive per HTTP. Repeated names are
//! kept in order (required for HPACK round-trips and Set-Cookie style headers).

/// Ordered multimap of HTTP header fields.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a field, keeping any existing fields with the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace all fields with this name by a single field.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.entries.push((name, value.into()));
    }

    /// First value for the name, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for the name, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Remove all fields with this name; returns true if any were removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.entries.len() != before
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// True if a token appears in the comma-separated value list of the field
    /// (e.g. `Connection: keep-alive, upgrade`).
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
    }

    /// Parsed Content-Length, if present and well-formed.
    pub fn content_length(&self) -> Option<u64> {
        self.get("content-length").and_then(|v| v.trim().parse().ok())
    }

    /// Merge fields from `other`, appending only names not already present.
    pub fn merge_missing(&mut self, other: &HeaderMap) {
        for (name, value) in other.iter() {
            if !self.contains(name) {
                self.append(name, value);
            }
        }
    }
}

impl<'a> IntoIterator for &'a HeaderMap {
    type Item = (&'a str, &'a str);
    type IntoIter = std::iter::Map<
        std::slice::Iter<'a, (String, String)>,
        fn(&'a (String, String)) -> (&'a str, &'a str),
    >;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_is_case_insensitive() {
        let mut h = HeaderMap::new();
        h.append("Content-Type", "text/plain");
        assert_eq!(h.get("content-type"), Some("text/plain"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/plain"));
        assert!(h.contains("Content-type"));
    }

    #[test]
    fn append_preserves_order_and_repeats() {
        let mut h = HeaderMap::new();
        h.append("set-cookie", "a=1");
        h.append("x-other", "v");
        h.append("Set-Cookie", "b=2");
        let all: Vec<&str> = h.get_all("set-cookie").collect();
        assert_eq!(all, vec!["a=1", "b=2"]);
        let names: Vec<&str> = h.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["set-cookie", "x-other", "Set-Cookie"]);
    }

    #[test]
    fn insert_replaces_all() {
        let mut h = HeaderMap::new();
        h.append("accept", "text/html");
        h.append("Accept", "text/plain");
        h.insert("accept", "*/*");
        let all: Vec<&str> = h.get_all("accept").collect();
        assert_eq!(all, vec!["*/*"]);
    }

    #[test]
    fn connection_token_matching() {
        let mut h = HeaderMap::new();
        h.append("Connection", "Keep-Alive, Upgrade");
        assert!(h.has_token("connection", "keep-alive"));
        assert!(h.has_token("connection", "upgrade"));
        assert!(!h.has_token("connection", "close"));
    }

    #[test]
    fn content_length_parsing() {
        let mut h = HeaderMap::new();
        h.append("Content-Length", " 42 ");
        assert_eq!(h.content_length(), Some(42));
        h.insert("Content-Length", "nan");
        assert_eq!(h.content_length(), None);
    }

    #[test]
    fn merge_missing_does_not_override() {
        let mut base = HeaderMap::new();
        base.append("user-agent", "corriere");
        let mut extra = HeaderMap::new();
        extra.append("User-Agent", "other");
        extra.append("Accept", "*/*");
        base.merge_missing(&extra);
        assert_eq!(base.get("user-agent"), Some("corriere"));
        assert_eq!(base.get("accept"), Some("*/*"));
    }
}
