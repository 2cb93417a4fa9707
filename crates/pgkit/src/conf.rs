//! `postgresql.conf` parsing and rendering.
//!
//! Files are edited in place: unrelated lines, comments and layout survive a
//! load/save cycle. Removing a parameter comments it out rather than deleting
//! the line, the way `initdb` ships its defaults.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

const INCLUDE_DIRECTIVES: &[&str] = &["include", "include_if_exists", "include_dir"];

// ============================================================================
// Values
// ============================================================================

/// A configuration parameter value.
///
/// Two values are equal when they render identically, so `128MB` read from
/// a file matches `"128MB"` from a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    /// Parse an unquoted token the way the server would type it.
    fn from_token(token: &str) -> Self {
        match token.to_ascii_lowercase().as_str() {
            "on" | "true" | "yes" => return Self::Bool(true),
            "off" | "false" | "no" => return Self::Bool(false),
            _ => {}
        }
        if let Ok(i) = token.parse::<i64>() {
            return Self::Int(i);
        }
        if let Ok(f) = token.parse::<f64>()
            && f.is_finite()
        {
            return Self::Float(f);
        }
        Self::Str(token.to_string())
    }

    /// The integer value, if this is an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// The value as a plain string, without quoting.
    pub fn as_text(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Whether this is a string value.
    pub fn is_str(&self) -> bool {
        matches!(self, Self::Str(_))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(true) => f.write_str("on"),
            Self::Bool(false) => f.write_str("off"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => write!(f, "'{}'", s.replace('\'', "''")),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

// ============================================================================
// Lines
// ============================================================================

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    value: Value,
    commented: bool,
    comment: Option<String>,
    /// Original text, dropped once the entry is modified
    raw: Option<String>,
}

impl Entry {
    fn render(&self) -> String {
        if let Some(raw) = &self.raw {
            return raw.clone();
        }
        let mut line = format!(
            "{}{} = {}",
            if self.commented { "#" } else { "" },
            self.name,
            self.value
        );
        if let Some(comment) = &self.comment {
            line.push_str("\t# ");
            line.push_str(comment);
        }
        line
    }
}

#[derive(Debug, Clone)]
enum Line {
    Raw(String),
    Entry(Entry),
}

/// Split `name = rest` or `name rest`; `None` if `text` does not start
/// with a parameter name.
fn split_name(text: &str) -> Option<(&str, &str)> {
    let first = text.chars().next()?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    let end = text
        .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
        .unwrap_or(text.len());
    let (name, rest) = text.split_at(end);
    let trimmed = rest.trim_start();
    if let Some(value) = trimmed.strip_prefix('=') {
        Some((name, value))
    } else if rest.len() != trimmed.len() || rest.is_empty() {
        Some((name, trimmed))
    } else {
        None
    }
}

/// Parse `name = value [# comment]` (the `=` is optional).
fn parse_entry(text: &str) -> std::result::Result<Option<Entry>, String> {
    let Some((name, rest)) = split_name(text) else {
        return Ok(None);
    };
    let name = name.to_string();
    if INCLUDE_DIRECTIVES.contains(&name.as_str()) {
        return Ok(None);
    }
    let rest = rest.trim_start();
    let (value, tail) = if let Some(quoted) = rest.strip_prefix('\'') {
        let mut out = String::new();
        let mut chars = quoted.char_indices().peekable();
        let mut end = None;
        while let Some((i, c)) = chars.next() {
            match c {
                '\'' if chars.peek().map(|(_, n)| *n) == Some('\'') => {
                    chars.next();
                    out.push('\'');
                }
                '\'' => {
                    end = Some(i + 1);
                    break;
                }
                '\\' => {
                    if let Some((_, n)) = chars.next() {
                        out.push(n);
                    }
                }
                c => out.push(c),
            }
        }
        let Some(end) = end else {
            return Err(format!("unterminated quoted value for '{name}'"));
        };
        (Value::Str(out), &quoted[end..])
    } else {
        let end = rest
            .find(|c: char| c.is_whitespace() || c == '#')
            .unwrap_or(rest.len());
        let token = &rest[..end];
        if token.is_empty() {
            return Err(format!("missing value for '{name}'"));
        }
        (Value::from_token(token), &rest[end..])
    };
    let tail = tail.trim();
    let comment = match tail.strip_prefix('#') {
        Some(c) => Some(c.trim().to_string()).filter(|c| !c.is_empty()),
        None if tail.is_empty() => None,
        None => return Err(format!("unexpected text after value of '{name}': {tail}")),
    };
    Ok(Some(Entry {
        name,
        value,
        commented: false,
        comment,
        raw: None,
    }))
}

// ============================================================================
// ConfigFile
// ============================================================================

/// A parsed `postgresql.conf`.
#[derive(Debug, Clone, Default)]
pub struct ConfigFile {
    lines: Vec<Line>,
}

impl ConfigFile {
    /// Parse configuration text.
    pub fn parse(content: &str) -> Result<Self> {
        Self::parse_named(content, Path::new("<string>"))
    }

    fn parse_named(content: &str, path: &Path) -> Result<Self> {
        let mut lines = Vec::new();
        for (idx, raw) in content.lines().enumerate() {
            let text = raw.trim();
            if text.is_empty() {
                lines.push(Line::Raw(raw.to_string()));
            } else if let Some(commented) = text.strip_prefix('#') {
                // a commented-out setting is kept as such; prose stays raw
                match parse_entry(commented.trim_start()) {
                    Ok(Some(mut entry)) => {
                        entry.commented = true;
                        entry.raw = Some(raw.to_string());
                        lines.push(Line::Entry(entry));
                    }
                    _ => lines.push(Line::Raw(raw.to_string())),
                }
            } else {
                match parse_entry(text) {
                    Ok(Some(mut entry)) => {
                        entry.raw = Some(raw.to_string());
                        lines.push(Line::Entry(entry));
                    }
                    Ok(None) if INCLUDE_DIRECTIVES.iter().any(|d| text.starts_with(d)) => {
                        lines.push(Line::Raw(raw.to_string()));
                    }
                    Ok(None) => {
                        return Err(Error::ConfigParse {
                            path: path.to_path_buf(),
                            line: idx + 1,
                            message: format!("invalid line: {text}"),
                        });
                    }
                    Err(message) => {
                        return Err(Error::ConfigParse {
                            path: path.to_path_buf(),
                            line: idx + 1,
                            message,
                        });
                    }
                }
            }
        }
        Ok(Self { lines })
    }

    /// Read and parse a file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse_named(&content, path)
    }

    /// Write the file back.
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.render())?;
        Ok(())
    }

    /// Render as file content.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Raw(raw) => out.push_str(raw),
                Line::Entry(entry) => out.push_str(&entry.render()),
            }
            out.push('\n');
        }
        out
    }

    /// Active parameters; when a name appears several times, the last wins.
    pub fn entries(&self) -> BTreeMap<String, Value> {
        self.active().map(|e| (e.name.clone(), e.value.clone())).collect()
    }

    /// Active value of `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.active()
            .filter(|e| e.name == name)
            .last()
            .map(|e| &e.value)
    }

    fn active(&self) -> impl Iterator<Item = &Entry> {
        self.lines.iter().filter_map(|l| match l {
            Line::Entry(e) if !e.commented => Some(e),
            _ => None,
        })
    }

    /// Set `name` to `value`.
    ///
    /// The last active occurrence is updated in place; otherwise the value is
    /// written after its commented-out default, or appended.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        let value = value.into();
        let position = |lines: &[Line], commented: bool| {
            lines.iter().rposition(
                |l| matches!(l, Line::Entry(e) if e.name == name && e.commented == commented),
            )
        };
        if let Some(idx) = position(&self.lines, false) {
            if let Line::Entry(entry) = &mut self.lines[idx]
                && entry.value != value
            {
                entry.value = value;
                entry.raw = None;
            }
            return;
        }
        let entry = Line::Entry(Entry {
            name: name.to_string(),
            value,
            commented: false,
            comment: None,
            raw: None,
        });
        match position(&self.lines, true) {
            Some(idx) => self.lines.insert(idx + 1, entry),
            None => self.lines.push(entry),
        }
    }

    /// Comment out every active occurrence of `name`.
    ///
    /// Returns whether anything was active.
    pub fn remove(&mut self, name: &str) -> bool {
        let mut removed = false;
        for line in &mut self.lines {
            if let Line::Entry(e) = line
                && e.name == name
                && !e.commented
            {
                e.commented = true;
                e.raw = None;
                removed = true;
            }
        }
        removed
    }

    /// Comment out every active parameter.
    pub fn comment_all(&mut self) {
        for line in &mut self.lines {
            if let Line::Entry(e) = line
                && !e.commented
            {
                e.commented = true;
                e.raw = None;
            }
        }
    }
}

/// Path of `postgresql.conf` in a data directory.
pub fn config_path(datadir: &Path) -> PathBuf {
    datadir.join("postgresql.conf")
}
