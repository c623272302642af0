use std::fmt;

use serde::{Deserialize, Serialize};

/// A reference to a context attribute.
///
/// A reference is either a plain attribute name (`"email"`) or a slash-delimited path into nested
/// JSON objects (`"/address/street"`). In paths, `~1` stands for `/` and `~0` for `~`.
///
/// Invalid references are still representable; they are reported when used.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    raw: String,
    components: Result<Vec<String>, ReferenceError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ReferenceError {
    #[error("attribute reference is empty")]
    Empty,
    #[error("attribute reference contains an empty path component")]
    EmptyComponent,
    #[error("attribute reference contains an invalid escape sequence")]
    InvalidEscape,
}

impl Reference {
    /// Parse an attribute reference, which may be a path starting with `/`.
    pub fn new(value: impl Into<String>) -> Reference {
        let raw = value.into();
        let components = parse(&raw);
        Reference { raw, components }
    }

    /// Create a reference that treats the whole string as an attribute name, even if it starts
    /// with `/`. Used for clauses that predate context kinds.
    pub fn literal(value: impl Into<String>) -> Reference {
        let raw: String = value.into();
        let components = if raw.is_empty() {
            Err(ReferenceError::Empty)
        } else {
            Ok(vec![raw.clone()])
        };
        let raw = if raw.starts_with('/') {
            format!("/{}", raw.replace('~', "~0").replace('/', "~1"))
        } else {
            raw
        };
        Reference { raw, components }
    }

    pub fn is_valid(&self) -> bool {
        self.components.is_ok()
    }

    pub fn error(&self) -> Option<ReferenceError> {
        self.components.as_ref().err().copied()
    }

    pub fn components(&self) -> &[String] {
        match &self.components {
            Ok(components) => components,
            Err(_) => &[],
        }
    }

    pub fn depth(&self) -> usize {
        self.components().len()
    }

    /// The string this reference was created from (escaped form for literals).
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

fn parse(raw: &str) -> Result<Vec<String>, ReferenceError> {
    if raw.is_empty() || raw == "/" {
        return Err(ReferenceError::Empty);
    }
    let Some(path) = raw.strip_prefix('/') else {
        return Ok(vec![raw.to_owned()]);
    };
    path.split('/').map(unescape).collect()
}

fn unescape(component: &str) -> Result<String, ReferenceError> {
    if component.is_empty() {
        return Err(ReferenceError::EmptyComponent);
    }
    let mut out = String::with_capacity(component.len());
    let mut chars = component.chars();
    while let Some(c) = chars.next() {
        if c != '~' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('0') => out.push('~'),
            Some('1') => out.push('/'),
            _ => return Err(ReferenceError::InvalidEscape),
        }
    }
    Ok(out)
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for Reference {
    fn from(value: &str) -> Self {
        Reference::new(value)
    }
}

impl From<String> for Reference {
    fn from(value: String) -> Self {
        Reference::new(value)
    }
}

impl Serialize for Reference {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Reference {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Reference::new)
    }
}
