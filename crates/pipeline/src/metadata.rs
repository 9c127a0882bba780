use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::Path;
use tempfile::NamedTempFile;

/// Tags handed to the encoder through an `FFMETADATA1` side-channel file, so
/// that arbitrary text never has to pass through command-line arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, String)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a tag; empty values are skipped.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let value = value.into();
        if !value.is_empty() {
            self.entries.push((key.into(), value));
        }
        self
    }

    pub fn set_opt(&mut self, key: impl Into<String>, value: Option<impl Into<String>>) -> &mut Self {
        if let Some(value) = value {
            self.set(key, value);
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn render(&self) -> String {
        let mut out = String::from(";FFMETADATA1\n");
        for (key, value) in &self.entries {
            // Writing to a String cannot fail.
            let _ = writeln!(out, "{}={}", escape(key), escape(value));
        }
        out
    }

    /// Write the rendered file into `dir`. The file is removed when the
    /// returned handle is dropped.
    pub fn write_temp(&self, dir: &Path) -> Result<NamedTempFile> {
        let mut file = tempfile::Builder::new()
            .prefix("meta-")
            .suffix(".txt")
            .tempfile_in(dir)
            .or_raise(|| ErrorKind::Metadata)?;
        file.write_all(self.render().as_bytes()).or_raise(|| ErrorKind::Metadata)?;
        file.flush().or_raise(|| ErrorKind::Metadata)?;
        Ok(file)
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '=' | ';' | '#' | '\\' | '\n') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
