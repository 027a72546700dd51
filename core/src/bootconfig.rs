//! Line-preserving key/value parser for bootloader entry files (§4.2).

use std::collections::BTreeMap;

use camino::Utf8Path;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;

use crate::error::{Error, Result};

/// Default separator set between a key and its value, matching the
/// upstream bootloader-spec entry file format (space or tab).
const DEFAULT_SEPARATORS: &str = " \t";

/// A single line of a [`BootConfig`] file: its parsed key (empty string if
/// the line is not a `key SEP value` line) and the verbatim line text.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Line {
    key: String,
    text: String,
}

/// An ordered, line-preserving bootloader-entry file.
///
/// Reserved keys consumed by the writer: `title`, `version`, `linux`,
/// `initrd`, `devicetree`, `options`, `aboot`, `abootcfg`.
#[derive(Debug, Clone, Default)]
pub struct BootConfig {
    separators: String,
    lines: Vec<Line>,
    options: BTreeMap<String, String>,
    parsed: bool,
}

impl BootConfig {
    /// Create an empty, unparsed bootconfig using the default separator set.
    pub fn new() -> Self {
        Self {
            separators: DEFAULT_SEPARATORS.to_string(),
            lines: Vec::new(),
            options: BTreeMap::new(),
            parsed: false,
        }
    }

    /// Create an empty bootconfig with a custom separator set.
    pub fn with_separators(separators: &str) -> Self {
        Self {
            separators: separators.to_string(),
            ..Self::new()
        }
    }

    /// Parse `contents` into this bootconfig. May only be called once.
    pub fn parse(&mut self, contents: &str) -> Result<()> {
        if self.parsed {
            return Err(Error::CorruptedLayout(
                "bootconfig already parsed".to_string(),
            ));
        }
        for line in contents.split('\n') {
            let mut key = String::new();
            if line.as_bytes().first().is_some_and(|b| b.is_ascii_alphabetic()) {
                if let Some(sep_idx) = line.find(|c| self.separators.contains(c)) {
                    if sep_idx > 0 {
                        let k = &line[..sep_idx];
                        let v = &line[sep_idx + 1..];
                        self.options.insert(k.to_string(), v.to_string());
                        key = k.to_string();
                    }
                }
            }
            self.lines.push(Line {
                key,
                text: line.to_string(),
            });
        }
        self.parsed = true;
        Ok(())
    }

    /// Parse the file at `path` relative to `dir`.
    pub fn parse_at(&mut self, dir: &Dir, path: &Utf8Path) -> Result<()> {
        let contents = dir
            .read_to_string(path.as_std_path())
            .map_err(|e| Error::path_io(path, e))?;
        self.parse(&contents)
    }

    /// Look up a key's current value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Set (or insert) a key's value.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.options.insert(key.to_string(), value.into());
    }

    /// Serialize to text: lines are emitted verbatim except that any line
    /// whose key's value changed since parse is rewritten in place; keys
    /// with no originating line are appended at the end.
    pub fn to_string_serialized(&self) -> String {
        let mut buf = String::new();
        let mut written = std::collections::BTreeSet::new();
        for line in &self.lines {
            match self.options.get(&line.key).filter(|_| !line.key.is_empty()) {
                Some(value) => {
                    self.write_key(&mut buf, &line.key, value);
                    written.insert(line.key.clone());
                }
                None => {
                    buf.push_str(&line.text);
                    buf.push('\n');
                }
            }
        }
        for (key, value) in &self.options {
            if written.contains(key) {
                continue;
            }
            self.write_key(&mut buf, key, value);
        }
        buf
    }

    fn write_key(&self, buf: &mut String, key: &str, value: &str) {
        buf.push_str(key);
        buf.push(self.separators.chars().next().unwrap_or(' '));
        buf.push_str(value);
        buf.push('\n');
    }

    /// Write the serialized form to `path` relative to `dir`, replacing any
    /// existing file atomically.
    pub fn write_at(&self, dir: &Dir, path: &Utf8Path) -> Result<()> {
        dir.atomic_write(path.as_std_path(), self.to_string_serialized().as_bytes())
            .map_err(|e| Error::path_io(path, e))
    }
}
