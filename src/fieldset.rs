//! Ordered key-value text record
//!
//! Node references and metadata travel as `key=value` lines terminated by an
//! `End` line. Keys are dotted paths (`dsaGroup.p`, `ark.pubURI`); a dotted
//! prefix addresses a nested subset. Repeatable fields store their values
//! joined with `;`.
//!
//! ```text
//! identity=q0Z...
//! physical.udp=203.0.113.5:9001;198.51.100.7:9001
//! testnet=false
//! End
//! ```

use std::collections::BTreeMap;
use std::fmt;

use crate::error::PeerError;

/// Separator between values of a repeatable field
pub const MULTI_VALUE_SEPARATOR: char = ';';

/// Terminator line of a serialized record
pub const END_MARKER: &str = "End";

/// Ordered key-value record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSet {
    fields: BTreeMap<String, String>,
}

impl FieldSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Set a key, replacing any previous value
    pub fn put_single(&mut self, key: &str, value: impl Into<String>) {
        self.fields.insert(key.to_string(), value.into());
    }

    /// Add one more value to a repeatable key
    pub fn put_append(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.fields.get_mut(key) {
            Some(existing) if !existing.is_empty() => {
                existing.push(MULTI_VALUE_SEPARATOR);
                existing.push_str(&value);
            }
            _ => {
                self.fields.insert(key.to_string(), value);
            }
        }
    }

    /// Copy every field of `subset` under `prefix.`
    pub fn put_subset(&mut self, prefix: &str, subset: &FieldSet) {
        for (k, v) in &subset.fields {
            self.fields.insert(format!("{}.{}", prefix, k), v.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// All values of a repeatable key, empty if absent
    pub fn get_all(&self, key: &str) -> Vec<String> {
        match self.fields.get(key) {
            Some(v) if !v.is_empty() => v
                .split(MULTI_VALUE_SEPARATOR)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Boolean with a fallback for absent or unparseable values
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(v) if v.eq_ignore_ascii_case("true") => true,
            Some(v) if v.eq_ignore_ascii_case("false") => false,
            _ => default,
        }
    }

    /// Unsigned integer; absent yields `None`, garbage is an error
    pub fn get_u64(&self, key: &str) -> Result<Option<u64>, PeerError> {
        self.get(key)
            .map(|v| {
                v.trim()
                    .parse::<u64>()
                    .map_err(|e| PeerError::parse(format!("{}={}: {}", key, v, e)))
            })
            .transpose()
    }

    pub fn get_i64(&self, key: &str) -> Result<Option<i64>, PeerError> {
        self.get(key)
            .map(|v| {
                v.trim()
                    .parse::<i64>()
                    .map_err(|e| PeerError::parse(format!("{}={}: {}", key, v, e)))
            })
            .transpose()
    }

    pub fn get_f64(&self, key: &str) -> Result<Option<f64>, PeerError> {
        self.get(key)
            .map(|v| {
                v.trim()
                    .parse::<f64>()
                    .map_err(|e| PeerError::parse(format!("{}={}: {}", key, v, e)))
            })
            .transpose()
    }

    /// Integer list stored as a repeatable key
    pub fn get_int_array(&self, key: &str) -> Result<Option<Vec<i32>>, PeerError> {
        if !self.fields.contains_key(key) {
            return Ok(None);
        }
        self.get_all(key)
            .iter()
            .map(|v| {
                v.trim()
                    .parse::<i32>()
                    .map_err(|e| PeerError::parse(format!("{}={}: {}", key, v, e)))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    /// Nested record under `prefix.`, `None` if nothing is there
    pub fn subset(&self, prefix: &str) -> Option<FieldSet> {
        let dotted = format!("{}.", prefix);
        let fields: BTreeMap<String, String> = self
            .fields
            .range(dotted.clone()..)
            .take_while(|(k, _)| k.starts_with(&dotted))
            .map(|(k, v)| (k[dotted.len()..].to_string(), v.clone()))
            .collect();
        if fields.is_empty() {
            None
        } else {
            Some(FieldSet { fields })
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.fields.remove(key)
    }

    /// Drop a key and everything nested under it
    pub fn remove_subset(&mut self, prefix: &str) {
        let dotted = format!("{}.", prefix);
        self.fields
            .retain(|k, _| k != prefix && !k.starts_with(&dotted));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Canonical serialization: sorted `key=value` lines then `End`
    pub fn to_ordered_string(&self) -> String {
        let mut out = String::new();
        for (k, v) in &self.fields {
            out.push_str(k);
            out.push('=');
            out.push_str(v);
            out.push('\n');
        }
        out.push_str(END_MARKER);
        out.push('\n');
        out
    }

    /// Canonical serialization with one key left out (signature input)
    pub fn to_ordered_string_without(&self, skip: &str) -> String {
        let mut copy = self.clone();
        copy.fields.remove(skip);
        copy.to_ordered_string()
    }

    /// Parse `key=value` lines up to an optional `End` line
    pub fn parse(text: &str) -> Result<Self, PeerError> {
        let mut fs = FieldSet::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim_end_matches('\r');
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line == END_MARKER {
                break;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                PeerError::parse(format!("line {}: no '=' in {:?}", lineno + 1, line))
            })?;
            if key.is_empty() {
                return Err(PeerError::parse(format!("line {}: empty key", lineno + 1)));
            }
            fs.put_single(key, value);
        }
        Ok(fs)
    }
}

impl fmt::Display for FieldSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_ordered_string())
    }
}
