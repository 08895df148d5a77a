//! The legacy persistent state file (spec.md §6): a text file of
//! `Key value` lines, one setting per line, loaded at startup and
//! rewritten on clean shutdown. Kept as its own small format rather than
//! folded into the TOML config file, since the key names and one-line
//! shape are pinned by the spec and predate the daemon's TOML config.

use std::collections::BTreeMap;
use std::fmt::Write as _;

/// The recognized key names, in the canonical order they are written back
/// out in.
pub const KEYS: &[&str] = &[
    "Frequency",
    "Mode",
    "Shift",
    "Filter low",
    "Filter high",
    "Kaiser Beta",
    "Blocksize",
    "Impulse len",
    "Tunestep",
    "Source",
    "Output",
    "TTL",
    "Locale",
];

/// Parsed key/value pairs from a state file. Unrecognized keys are kept
/// (round-tripped) but not interpreted.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StateFile {
    values: BTreeMap<String, String>,
}

impl StateFile {
    pub fn parse(text: &str) -> Self {
        let mut values = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = split_key_value(line) {
                values.insert(key.to_string(), value.to_string());
            }
        }
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key)?.parse().ok()
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.get(key)?.parse().ok()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), value.into());
    }

    /// Serializes back to the `Key value` line format, known keys first in
    /// canonical order, then any unrecognized keys that were preserved.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let mut written = std::collections::HashSet::new();

        for &key in KEYS {
            if let Some(value) = self.values.get(key) {
                let _ = writeln!(out, "{key} {value}");
                written.insert(key);
            }
        }

        for (key, value) in &self.values {
            if !written.contains(key.as_str()) {
                let _ = writeln!(out, "{key} {value}");
            }
        }

        out
    }
}

/// Keys may contain a single embedded space ("Filter low", "Kaiser Beta",
/// "Impulse len"); the value is everything after the longest known-key
/// prefix that matches, falling back to a simple first-space split.
fn split_key_value(line: &str) -> Option<(&str, &str)> {
    for &key in KEYS {
        if let Some(rest) = line.strip_prefix(key) {
            let value = rest.trim_start();
            if rest.len() != line.len() && (rest.starts_with(' ') || rest.is_empty()) {
                return Some((key, value));
            }
        }
    }
    line.split_once(' ').map(|(k, v)| (k, v.trim_start()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multiword_keys() {
        let text = "Frequency 146000000\nFilter low -5000\nFilter high 5000\nKaiser Beta 3.0\n";
        let state = StateFile::parse(text);
        assert_eq!(state.get("Frequency"), Some("146000000"));
        assert_eq!(state.get_f64("Filter low"), Some(-5000.0));
        assert_eq!(state.get_f64("Filter high"), Some(5000.0));
        assert_eq!(state.get_f64("Kaiser Beta"), Some(3.0));
    }

    #[test]
    fn ignores_blank_and_comment_lines() {
        let text = "# comment\n\nMode usb\n";
        let state = StateFile::parse(text);
        assert_eq!(state.get("Mode"), Some("usb"));
    }

    #[test]
    fn round_trips_through_text() {
        let mut state = StateFile::default();
        state.set("Frequency", "146000000");
        state.set("Mode", "usb");
        let text = state.to_text();
        let reparsed = StateFile::parse(&text);
        assert_eq!(reparsed, state);
    }
}
