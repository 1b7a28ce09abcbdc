//! Property map
//!
//! A flat `key -> value` map read once when a communicator is created.
//! Values come from code, from `--Key=Value` command-line arguments or
//! from a properties file. Unknown keys are ignored.

use crate::error::{Result, RpcError};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

/// Property naming a file to load while parsing the command line
pub const CONFIG_PROPERTY: &str = "Floe.Config";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    props: BTreeMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property; an empty value removes it.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if value.is_empty() {
            self.props.remove(&key);
        } else {
            self.props.insert(key, value);
        }
    }

    /// Builder-style [`set`](Self::set)
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(String::as_str)
    }

    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    /// Integer value; a malformed value is reported and treated as unset.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        let raw = self.get(key)?;
        match raw.trim().parse::<i64>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("property `{}` is not an integer: `{}`", key, raw);
                None
            }
        }
    }

    pub fn get_int_or(&self, key: &str, default: i64) -> i64 {
        self.get_int(key).unwrap_or(default)
    }

    /// Whitespace- or comma-separated list
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(|c: char| c == ',' || c.is_whitespace())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All properties whose key starts with `prefix`
    pub fn get_for_prefix(&self, prefix: &str) -> BTreeMap<String, String> {
        self.props
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.props.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.props.len()
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    /// Consume `--Key=Value` arguments and return the rest.
    ///
    /// `--Key` alone sets `Key=1`. A `--Floe.Config=<path>` argument loads
    /// that file before the remaining arguments are applied, so arguments
    /// override file contents.
    pub fn parse_command_line<I, S>(&mut self, args: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut remaining = Vec::new();
        let mut parsed = Vec::new();
        for arg in args {
            let arg = arg.into();
            let Some(body) = arg.strip_prefix("--") else {
                remaining.push(arg);
                continue;
            };
            // only dotted keys are properties; `--help` and friends pass through
            let (key, value) = body.split_once('=').unwrap_or((body, "1"));
            if !key.contains('.') || key.starts_with('.') {
                remaining.push(arg);
                continue;
            }
            parsed.push((key.to_string(), value.to_string()));
        }

        if let Some((_, path)) = parsed.iter().find(|(k, _)| k == CONFIG_PROPERTY) {
            self.load(path)?;
        }
        for (key, value) in parsed {
            self.set(key, value);
        }
        Ok(remaining)
    }

    /// Load a properties file, merging into the current map.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            RpcError::InitializationFailed(format!(
                "cannot read properties file `{}`: {}",
                path.display(),
                e
            ))
        })?;
        self.parse(&text);
        Ok(())
    }

    /// Merge `key = value` lines. `#` starts a comment; `\#`, `\=` and
    /// `\\` escape those characters.
    pub fn parse(&mut self, text: &str) {
        for (lineno, line) in text.lines().enumerate() {
            match parse_line(line) {
                Some((key, value)) if !key.is_empty() => self.set(key, value),
                Some(_) => warn!("ignoring property line {} with empty key", lineno + 1),
                None => {}
            }
        }
    }
}

impl FromStr for Properties {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        let mut props = Properties::new();
        props.parse(s);
        Ok(props)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut props = Properties::new();
        for (k, v) in iter {
            props.set(k, v);
        }
        props
    }
}

fn parse_line(line: &str) -> Option<(String, String)> {
    let mut key = String::new();
    let mut value = String::new();
    let mut in_value = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        let target = if in_value { &mut value } else { &mut key };
        match c {
            '\\' => match chars.next() {
                Some(next @ ('#' | '=' | '\\')) => target.push(next),
                Some(next) => {
                    target.push('\\');
                    target.push(next);
                }
                None => target.push('\\'),
            },
            '#' => break,
            '=' if !in_value => in_value = true,
            c => target.push(c),
        }
    }
    if !in_value {
        return None;
    }
    Some((key.trim().to_string(), value.trim().to_string()))
}
