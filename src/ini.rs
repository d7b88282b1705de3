//! A small INI document container.
//!
//! The server reads its startup configuration from an INI file; this module
//! owns the text format. Documents are string sections of string key/value
//! pairs. Parsing reports malformed input as [`IniError`] values carrying
//! the error kind and line number, and serialization produces text that
//! parses back to an equal document.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::{IniError, IniErrorKind};

/// One named section: an ordered map of keys to values.
pub type Section = BTreeMap<String, String>;

/// An INI document.
///
/// # Examples
///
/// ```
/// use erebus::ini::Ini;
///
/// let ini = Ini::parse("[server]\nport = 8080\n").unwrap();
/// assert_eq!(ini.get("server", "port"), Some("8080"));
/// ```
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Ini {
    sections: BTreeMap<String, Section>,
}

impl Ini {
    /// Creates an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads and parses an INI file from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, crate::error::ConfigError> {
        let text = fs::read_to_string(path)?;
        Ok(Self::parse(&text)?)
    }

    /// Parses an INI document from text.
    ///
    /// Lines are trimmed. Empty lines and lines starting with `;` or `#`
    /// are skipped. `[name]` opens a section; `key = value` adds a pair to
    /// the current section. Later duplicate keys overwrite earlier ones,
    /// and re-opening a section continues it.
    ///
    /// # Errors
    /// Returns an [`IniError`] naming the offending line for an unclosed
    /// or empty section header, a pair outside any section, or a line
    /// without a `=` delimiter.
    pub fn parse(text: &str) -> Result<Self, IniError> {
        let mut ini = Self::new();
        let mut current: Option<String> = None;

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            let lineno = idx + 1;

            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            if let Some(rest) = line.strip_prefix('[') {
                let name = rest.strip_suffix(']').ok_or(IniError {
                    kind: IniErrorKind::UnclosedSection,
                    line: lineno,
                })?;
                let name = name.trim();
                if name.is_empty() {
                    return Err(IniError {
                        kind: IniErrorKind::EmptySectionName,
                        line: lineno,
                    });
                }
                ini.sections.entry(name.to_owned()).or_default();
                current = Some(name.to_owned());
                continue;
            }

            let (key, value) = line.split_once('=').ok_or(IniError {
                kind: IniErrorKind::MissingDelimiter,
                line: lineno,
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(IniError {
                    kind: IniErrorKind::MissingDelimiter,
                    line: lineno,
                });
            }
            let section = current.as_deref().ok_or(IniError {
                kind: IniErrorKind::OrphanKey,
                line: lineno,
            })?;
            ini.sections
                .get_mut(section)
                .expect("current section exists")
                .insert(key.to_owned(), value.trim().to_owned());
        }
        Ok(ini)
    }

    /// Returns the value for `key` in `section`, if present.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections.get(section)?.get(key).map(String::as_str)
    }

    /// Returns the value for `key` in `section`, or `default` when absent.
    pub fn get_or<'a>(&'a self, section: &str, key: &str, default: &'a str) -> &'a str {
        self.get(section, key).unwrap_or(default)
    }

    /// Sets a value, creating the section and key as needed.
    pub fn set(&mut self, section: &str, key: &str, value: &str) {
        self.sections
            .entry(section.to_owned())
            .or_default()
            .insert(key.to_owned(), value.to_owned());
    }

    /// Adds an empty section.
    ///
    /// Returns `false` if the section already exists.
    pub fn add_section(&mut self, name: &str) -> bool {
        if self.sections.contains_key(name) {
            return false;
        }
        self.sections.insert(name.to_owned(), Section::new());
        true
    }

    /// Removes a whole section.
    ///
    /// Returns `false` if no such section exists.
    pub fn remove_section(&mut self, name: &str) -> bool {
        self.sections.remove(name).is_some()
    }

    /// Removes a single key.
    ///
    /// Returns `false` if the section or the key does not exist.
    pub fn remove_key(&mut self, section: &str, key: &str) -> bool {
        match self.sections.get_mut(section) {
            Some(sec) => sec.remove(key).is_some(),
            None => false,
        }
    }

    /// Renames a section, keeping its pairs.
    ///
    /// Returns `false` if the source is missing or the target exists.
    pub fn rename_section(&mut self, from: &str, to: &str) -> bool {
        if !self.sections.contains_key(from) || self.sections.contains_key(to) {
            return false;
        }
        let sec = self.sections.remove(from).expect("checked above");
        self.sections.insert(to.to_owned(), sec);
        true
    }

    /// Merges another document into this one; pairs from `other` win.
    pub fn merge(&mut self, other: &Ini) {
        for (name, sec) in &other.sections {
            let target = self.sections.entry(name.clone()).or_default();
            for (k, v) in sec {
                target.insert(k.clone(), v.clone());
            }
        }
    }

    /// Whether a section exists.
    pub fn has_section(&self, name: &str) -> bool {
        self.sections.contains_key(name)
    }

    /// Whether a key exists.
    pub fn has_key(&self, section: &str, key: &str) -> bool {
        self.get(section, key).is_some()
    }

    /// Iterates over `(name, section)` pairs in name order.
    pub fn sections(&self) -> impl Iterator<Item = (&str, &Section)> {
        self.sections.iter().map(|(n, s)| (n.as_str(), s))
    }

    /// Number of sections.
    pub fn len(&self) -> usize {
        self.sections.len()
    }

    /// Whether the document has no sections.
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}

impl fmt::Display for Ini {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, sec) in &self.sections {
            if !first {
                writeln!(f)?;
            }
            first = false;
            writeln!(f, "[{name}]")?;
            for (k, v) in sec {
                writeln!(f, "{k} = {v}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
; server settings
[server]
port = 8080
address = 127.0.0.1

# logging
[log]
path = server.log
";

    /// Tests parsing of sections, pairs, and both comment styles.
    #[test]
    fn test_parse_sample() {
        let ini = Ini::parse(SAMPLE).unwrap();
        assert_eq!(ini.len(), 2);
        assert_eq!(ini.get("server", "port"), Some("8080"));
        assert_eq!(ini.get("server", "address"), Some("127.0.0.1"));
        assert_eq!(ini.get("log", "path"), Some("server.log"));
        assert_eq!(ini.get("log", "missing"), None);
        assert_eq!(ini.get_or("log", "missing", "x"), "x");
    }

    /// Tests that serializing and re-parsing yields an equal document.
    #[test]
    fn test_round_trip() {
        let ini = Ini::parse(SAMPLE).unwrap();
        let again = Ini::parse(&ini.to_string()).unwrap();
        assert_eq!(ini, again);
    }

    /// Tests each error kind together with its reported line number.
    #[test]
    fn test_parse_errors() {
        let err = Ini::parse("[server\nport = 1\n").unwrap_err();
        assert_eq!(err.kind, IniErrorKind::UnclosedSection);
        assert_eq!(err.line, 1);

        let err = Ini::parse("\n[]\n").unwrap_err();
        assert_eq!(err.kind, IniErrorKind::EmptySectionName);
        assert_eq!(err.line, 2);

        let err = Ini::parse("port = 1\n").unwrap_err();
        assert_eq!(err.kind, IniErrorKind::OrphanKey);
        assert_eq!(err.line, 1);

        let err = Ini::parse("[s]\njust a line\n").unwrap_err();
        assert_eq!(err.kind, IniErrorKind::MissingDelimiter);
        assert_eq!(err.line, 2);
    }

    /// Tests set / remove / rename / merge editing operations.
    #[test]
    fn test_editing() {
        let mut ini = Ini::new();
        ini.set("server", "port", "9000");
        assert!(ini.has_section("server"));
        assert!(ini.has_key("server", "port"));

        assert!(ini.add_section("log"));
        assert!(!ini.add_section("log"));

        assert!(ini.rename_section("log", "logging"));
        assert!(!ini.rename_section("log", "x"));
        assert!(ini.has_section("logging"));

        let mut other = Ini::new();
        other.set("server", "port", "9001");
        other.set("server", "backlog", "16");
        ini.merge(&other);
        assert_eq!(ini.get("server", "port"), Some("9001"));
        assert_eq!(ini.get("server", "backlog"), Some("16"));

        assert!(ini.remove_key("server", "backlog"));
        assert!(!ini.remove_key("server", "backlog"));
        assert!(ini.remove_section("logging"));
        assert!(!ini.remove_section("logging"));
    }

    /// Tests that re-opening a section continues it and later keys win.
    #[test]
    fn test_reopened_section() {
        let ini = Ini::parse("[a]\nx = 1\n[b]\ny = 2\n[a]\nx = 3\nz = 4\n").unwrap();
        assert_eq!(ini.get("a", "x"), Some("3"));
        assert_eq!(ini.get("a", "z"), Some("4"));
        assert_eq!(ini.get("b", "y"), Some("2"));
    }
}
