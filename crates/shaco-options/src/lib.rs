//! Read-only key→string configuration store.
//!
//! Grounded on the options names and defaults in spec.md §6 ("Options
//! consumed") and the teacher workspace's use of `toml`/`clap` for its own
//! CLI/config plumbing (`lunatic-runtime`'s root `Cargo.toml`). The original
//! `shaco_env.c` is a flat key→string table populated from a Lua config file
//! and command-line overrides; this keeps the same shape (no nested tables,
//! no schema) rather than introducing a typed `serde` config struct, since
//! downstream code still wants "get this key as a string/int/bool with a
//! default" the way `shaco_getenv`/`shaco_optint`/`shaco_optstr` do.

use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum OptionsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path} as TOML: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("option table root is not a table of key = value pairs")]
    NotATable,
}

/// A read-only key→string map. Values are stored as their TOML source
/// representation (strings unquoted, numbers/bools stringified) so a single
/// storage type backs all three typed accessors, matching the C source's
/// "everything is a string until you ask for an int" model.
#[derive(Debug, Clone, Default)]
pub struct Options {
    values: HashMap<String, String>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a TOML document (as used by a `shaco.toml` config file) into
    /// an options table. Nested tables are rejected — the original config
    /// format is flat.
    pub fn from_toml_str(input: &str) -> Result<Self, OptionsError> {
        let parsed: toml::Value = input.parse().map_err(|source| OptionsError::Parse {
            path: "<string>".to_string(),
            source,
        })?;
        Self::from_toml_value(parsed)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, OptionsError> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|source| OptionsError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let parsed: toml::Value = input.parse().map_err(|source| OptionsError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_value(parsed)
    }

    fn from_toml_value(value: toml::Value) -> Result<Self, OptionsError> {
        let table = value.as_table().ok_or(OptionsError::NotATable)?;
        let mut values = HashMap::with_capacity(table.len());
        for (key, value) in table {
            let rendered = match value {
                toml::Value::String(s) => s.clone(),
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Float(f) => f.to_string(),
                toml::Value::Boolean(b) => b.to_string(),
                other => other.to_string(),
            };
            values.insert(key.clone(), rendered);
        }
        Ok(Self { values })
    }

    /// Sets or overwrites a single key, used to layer CLI overrides on top
    /// of a parsed config file (CLI wins, matching `clap`'s usual
    /// precedence over a config file in the teacher's own `src/mode/*`).
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get_str<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.values.get(key).map(String::as_str).unwrap_or(default)
    }

    pub fn get_opt_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.values
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.values.get(key).map(String::as_str) {
            Some("1") | Some("true") | Some("yes") => true,
            Some("0") | Some("false") | Some("no") => false,
            _ => default,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }
}
