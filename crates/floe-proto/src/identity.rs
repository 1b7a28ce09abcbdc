//! Object identities
//!
//! An identity names a servant within an adapter's namespace. Its string
//! form is `category/name`, or just `name` when the category is empty.
//! Either component may contain any character; `/`, `\`, quotes and
//! control characters are backslash-escaped.

use crate::error::{ProtocolError, Result};
use std::fmt;
use std::str::FromStr;

/// Identity of a servant: `{category, name}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Identity {
    pub category: String,
    pub name: String,
}

impl Identity {
    pub fn new(category: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            name: name.into(),
        }
    }

    /// Identity with an empty category
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(String::new(), name)
    }

    /// Parse the stringified form, unescaping both components.
    ///
    /// Fails on an empty name, on more than one unescaped `/`, and on
    /// malformed escape sequences.
    pub fn parse(s: &str) -> Result<Self> {
        let mut slash = None;
        let mut escaped = false;
        for (i, c) in s.char_indices() {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '/' {
                if slash.is_some() {
                    return Err(ProtocolError::InvalidIdentity(format!(
                        "unescaped '/' in name component of `{}`",
                        s
                    )));
                }
                slash = Some(i);
            }
        }

        let identity = match slash {
            Some(i) => Identity {
                category: unescape(&s[..i])?,
                name: unescape(&s[i + 1..])?,
            },
            None => Identity {
                category: String::new(),
                name: unescape(s)?,
            },
        };
        identity.validate()?;
        Ok(identity)
    }

    /// Reject identities that can never be bound.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ProtocolError::InvalidIdentity(
                "identity name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.category.is_empty()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.category.is_empty() {
            f.write_str(&escape(&self.name))
        } else {
            write!(f, "{}/{}", escape(&self.category), escape(&self.name))
        }
    }
}

impl FromStr for Identity {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Identity::parse(s)
    }
}

/// Escape one identity component (or a facet) for its string form.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '/' => out.push_str("\\/"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            c if c.is_control() => out.push_str(&format!("\\u{:04X}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// Reverse of [`escape`].
pub fn unescape(s: &str) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let next = chars.next().ok_or_else(|| {
            ProtocolError::InvalidIdentity(format!("trailing backslash in `{}`", s))
        })?;
        match next {
            '\\' | '/' | '\'' | '"' => out.push(next),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            'b' => out.push('\u{8}'),
            'f' => out.push('\u{c}'),
            'u' => {
                let hex: String = chars.by_ref().take(4).collect();
                let code = (hex.len() == 4)
                    .then(|| u32::from_str_radix(&hex, 16).ok())
                    .flatten()
                    .and_then(char::from_u32)
                    .ok_or_else(|| {
                        ProtocolError::InvalidIdentity(format!(
                            "invalid unicode escape `\\u{}` in `{}`",
                            hex, s
                        ))
                    })?;
                out.push(code);
            }
            other => {
                return Err(ProtocolError::InvalidIdentity(format!(
                    "invalid escape `\\{}` in `{}`",
                    other, s
                )))
            }
        }
    }
    Ok(out)
}
