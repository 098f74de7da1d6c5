//! # Configuration Strings
//!
//! Objects are configured with compact `key=value` lists such as
//! `key_format=S,value_format=S,columns=(k,v),import=(enabled=true)`.
//! The same format is used for metadata records, so everything written to
//! the metadata store round-trips through this module.
//!
//! ```text
//! config  := entry ("," entry)*
//! entry   := key [("=" | ":") value]
//! value   := "(" config ")" | "[" config "]" | quoted | token
//! ```
//!
//! Dotted keys address nested structures: `import.enabled=true` and
//! `import=(enabled=true)` are the same configuration.

use std::fmt;

use crate::error::{Error, Result};

/// One configuration value.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    /// Key listed without a value, e.g. the `k` in `columns=(k,v)`.
    Key,
    Bool(bool),
    Int(i64),
    Str(String),
    Struct(ConfigString),
}

impl ConfigValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Key => Some(true),
            ConfigValue::Bool(b) => Some(*b),
            ConfigValue::Int(n) => Some(*n != 0),
            ConfigValue::Str(s) => match s.as_str() {
                "true" | "on" => Some(true),
                "false" | "off" | "" => Some(false),
                _ => None,
            },
            ConfigValue::Struct(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ConfigValue::Int(n) => Some(*n),
            ConfigValue::Bool(b) => Some(*b as i64),
            ConfigValue::Key => Some(1),
            ConfigValue::Str(s) => parse_int(s),
            ConfigValue::Struct(_) => None,
        }
    }

    /// String form of a scalar; structures render their inner list.
    pub fn as_string(&self) -> String {
        match self {
            ConfigValue::Key => String::new(),
            ConfigValue::Bool(b) => b.to_string(),
            ConfigValue::Int(n) => n.to_string(),
            ConfigValue::Str(s) => s.clone(),
            ConfigValue::Struct(c) => c.to_string(),
        }
    }

    /// Zero-length values (`key=`, `key=""`, `key=()`) are treated as unset by most readers.
    pub fn is_empty(&self) -> bool {
        match self {
            ConfigValue::Str(s) => s.is_empty(),
            ConfigValue::Struct(c) => c.is_empty(),
            _ => false,
        }
    }
}

/// An ordered list of configuration entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigString {
    entries: Vec<(String, ConfigValue)>,
}

impl ConfigString {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(input: &str) -> Result<Self> {
        let mut parser = Parser { src: input.as_bytes(), pos: 0, input };
        let config = parser.parse_list(None)?;
        parser.skip_ws();
        if parser.pos < parser.src.len() {
            return Err(parser.error("unexpected trailing characters"));
        }
        Ok(config)
    }

    /// Merge a stack of configuration strings; later strings override earlier ones and
    /// nested structures are merged key by key.
    pub fn collapse<S: AsRef<str>>(configs: &[S]) -> Result<String> {
        let mut merged = ConfigString::new();
        for cfg in configs {
            merged.merge(&ConfigString::parse(cfg.as_ref())?);
        }
        Ok(merged.to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True for empty structures and lists of bare keys.
    pub fn is_list(&self) -> bool {
        self.entries.iter().all(|(_, v)| matches!(v, ConfigValue::Key))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ConfigValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn get(&self, path: &str) -> Option<&ConfigValue> {
        let (head, rest) = split_path(path);
        let value = self.entries.iter().find(|(k, _)| k == head).map(|(_, v)| v)?;
        match rest {
            None => Some(value),
            Some(rest) => match value {
                ConfigValue::Struct(inner) => inner.get(rest),
                _ => None,
            },
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    pub fn get_bool(&self, path: &str) -> Option<bool> {
        self.get(path).and_then(ConfigValue::as_bool)
    }

    pub fn get_int(&self, path: &str) -> Option<i64> {
        self.get(path).and_then(ConfigValue::as_int)
    }

    pub fn get_str(&self, path: &str) -> Option<String> {
        self.get(path).map(ConfigValue::as_string)
    }

    /// Like [`get_str`](Self::get_str) but treats zero-length values as unset.
    pub fn get_nonempty(&self, path: &str) -> Option<String> {
        self.get(path).filter(|v| !v.is_empty()).map(ConfigValue::as_string)
    }

    pub fn get_struct(&self, path: &str) -> Option<&ConfigString> {
        match self.get(path)? {
            ConfigValue::Struct(inner) => Some(inner),
            _ => None,
        }
    }

    /// Set a value, creating intermediate structures for dotted paths.
    pub fn set(&mut self, path: &str, value: ConfigValue) {
        let (head, rest) = split_path(path);
        match rest {
            None => self.set_entry(head, value),
            Some(rest) => {
                let pos = match self.entries.iter().position(|(k, _)| k == head) {
                    Some(pos) => pos,
                    None => {
                        self.entries.push((head.to_string(), ConfigValue::Struct(ConfigString::new())));
                        self.entries.len() - 1
                    }
                };
                if !matches!(self.entries[pos].1, ConfigValue::Struct(_)) {
                    self.entries[pos].1 = ConfigValue::Struct(ConfigString::new());
                }
                if let ConfigValue::Struct(inner) = &mut self.entries[pos].1 {
                    inner.set(rest, value);
                }
            }
        }
    }

    /// Set a top-level entry whose key may itself contain dots, such as a
    /// checkpoint name or a URI in a list.
    pub fn insert_raw(&mut self, key: &str, value: ConfigValue) {
        self.set_entry(key, value);
    }

    pub fn set_str(&mut self, path: &str, value: impl Into<String>) {
        self.set(path, ConfigValue::Str(value.into()));
    }

    pub fn set_int(&mut self, path: &str, value: i64) {
        self.set(path, ConfigValue::Int(value));
    }

    pub fn remove(&mut self, path: &str) -> Option<ConfigValue> {
        let (head, rest) = split_path(path);
        match rest {
            None => {
                let pos = self.entries.iter().position(|(k, _)| k == head)?;
                Some(self.entries.remove(pos).1)
            }
            Some(rest) => match self.entries.iter_mut().find(|(k, _)| k == head) {
                Some((_, ConfigValue::Struct(inner))) => inner.remove(rest),
                _ => None,
            },
        }
    }

    /// Overlay `other` on top of `self`.
    pub fn merge(&mut self, other: &ConfigString) {
        for (key, value) in &other.entries {
            self.set_entry(key, value.clone());
        }
    }

    fn set_entry(&mut self, key: &str, value: ConfigValue) {
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| k == key) {
            match (&mut slot.1, value) {
                // Empty structures and plain lists such as `tiers=(a,b)` replace; anything
                // else merges key by key.
                (ConfigValue::Struct(existing), ConfigValue::Struct(incoming)) if !incoming.is_list() => {
                    existing.merge(&incoming)
                }
                (slot_value, value) => *slot_value = value,
            }
        } else {
            self.entries.push((key.to_string(), value));
        }
    }
}

impl fmt::Display for ConfigString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            if key.contains('.') {
                // Quoted so the dot is not read back as a path separator.
                write_quoted(f, key)?;
            } else {
                write_token(f, key)?;
            }
            match value {
                ConfigValue::Key => {}
                ConfigValue::Bool(b) => write!(f, "={}", b)?,
                ConfigValue::Int(n) => write!(f, "={}", n)?,
                ConfigValue::Str(s) => {
                    f.write_str("=")?;
                    write_token(f, s)?;
                }
                ConfigValue::Struct(inner) => write!(f, "=({})", inner)?,
            }
        }
        Ok(())
    }
}

fn split_path(path: &str) -> (&str, Option<&str>) {
    match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    }
}

fn needs_quotes(s: &str) -> bool {
    s.is_empty()
        || s.chars().any(|c| matches!(c, ',' | '=' | '(' | ')' | '[' | ']' | '"' | '\\') || c.is_whitespace())
}

fn write_token(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    if !needs_quotes(s) {
        return f.write_str(s);
    }
    write_quoted(f, s)
}

fn write_quoted(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_str("\"")?;
    for c in s.chars() {
        if c == '"' || c == '\\' {
            f.write_str("\\")?;
        }
        write!(f, "{}", c)?;
    }
    f.write_str("\"")
}

/// Integers accept an optional binary size suffix: `4KB`, `1M`, `2g`.
pub fn parse_int(token: &str) -> Option<i64> {
    let t = token.trim();
    let digits_end = t
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && c == '-')))
        .map(|(i, _)| i)
        .unwrap_or(t.len());
    if digits_end == 0 || (digits_end == 1 && t.starts_with('-')) {
        return None;
    }
    let base: i64 = t[..digits_end].parse().ok()?;
    let multiplier: i64 = match t[digits_end..].to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => 1 << 10,
        "M" | "MB" => 1 << 20,
        "G" | "GB" => 1 << 30,
        "T" | "TB" => 1 << 40,
        _ => return None,
    };
    base.checked_mul(multiplier)
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
    input: &'a str,
}

impl<'a> Parser<'a> {
    fn error(&self, what: &str) -> Error {
        Error::invalid(format!("{} at offset {} in configuration \"{}\"", what, self.pos, self.input))
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn parse_list(&mut self, close: Option<u8>) -> Result<ConfigString> {
        let mut config = ConfigString::new();
        loop {
            self.skip_ws();
            match self.peek() {
                None => {
                    if close.is_some() {
                        return Err(self.error("unbalanced brackets"));
                    }
                    return Ok(config);
                }
                Some(c) if Some(c) == close => {
                    self.pos += 1;
                    return Ok(config);
                }
                Some(b',') => {
                    self.pos += 1;
                    continue;
                }
                Some(b')') | Some(b']') => return Err(self.error("unbalanced brackets")),
                _ => {}
            }

            let quoted = self.peek() == Some(b'"');
            let key = self.parse_scalar()?;
            if key.is_empty() && !quoted {
                return Err(self.error("empty key"));
            }
            self.skip_ws();
            let value = match self.peek() {
                Some(b'=') | Some(b':') => {
                    self.pos += 1;
                    self.parse_value()?
                }
                _ => ConfigValue::Key,
            };
            if quoted {
                config.set_entry(&key, value);
            } else {
                config.set(&key, value);
            }
        }
    }

    fn parse_value(&mut self) -> Result<ConfigValue> {
        self.skip_ws();
        match self.peek() {
            Some(b'(') => {
                self.pos += 1;
                Ok(ConfigValue::Struct(self.parse_list(Some(b')'))?))
            }
            Some(b'[') => {
                self.pos += 1;
                Ok(ConfigValue::Struct(self.parse_list(Some(b']'))?))
            }
            Some(b'"') => Ok(ConfigValue::Str(self.parse_quoted()?)),
            _ => {
                let token = self.parse_bare();
                Ok(match token.as_str() {
                    "true" => ConfigValue::Bool(true),
                    "false" => ConfigValue::Bool(false),
                    // Sized values (`4KB`) and format strings (`5t`) keep their text;
                    // `as_int` applies the suffix when a number is wanted.
                    _ => match token.parse::<i64>() {
                        Ok(n) => ConfigValue::Int(n),
                        Err(_) => ConfigValue::Str(token),
                    },
                })
            }
        }
    }

    fn parse_scalar(&mut self) -> Result<String> {
        if self.peek() == Some(b'"') {
            self.parse_quoted()
        } else {
            Ok(self.parse_bare())
        }
    }

    fn parse_bare(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if matches!(c, b',' | b'=' | b'(' | b')' | b'[' | b']' | b'"') || c.is_ascii_whitespace() {
                break;
            }
            // ':' separates key from value only directly after a key; inside tokens such
            // as `file:a.wt` it is part of the text.
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.src[start..self.pos]).into_owned()
    }

    fn parse_quoted(&mut self) -> Result<String> {
        self.pos += 1;
        let mut out = Vec::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated string")),
                Some(b'"') => {
                    self.pos += 1;
                    return Ok(String::from_utf8_lossy(&out).into_owned());
                }
                Some(b'\\') => {
                    self.pos += 1;
                    match self.peek() {
                        Some(c) => {
                            out.push(c);
                            self.pos += 1;
                        }
                        None => return Err(self.error("unterminated escape")),
                    }
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
    }
}
