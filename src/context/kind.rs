use std::{borrow::Borrow, fmt};

use serde::{Deserialize, Serialize};

use crate::Error;

/// A named category of context, such as `"user"` or `"organization"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Kind(String);

impl Kind {
    /// The kind used by contexts created without an explicit kind.
    pub fn user() -> Kind {
        Kind("user".to_owned())
    }

    pub(crate) fn multi() -> Kind {
        Kind("multi".to_owned())
    }

    pub fn is_user(&self) -> bool {
        self.0 == "user"
    }

    pub fn is_multi(&self) -> bool {
        self.0 == "multi"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Kind {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            return Err(Error::InvalidContext("context kind cannot be empty".into()));
        }
        if value == "kind" {
            return Err(Error::InvalidContext(
                "\"kind\" is not a valid context kind".into(),
            ));
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
        {
            return Err(Error::InvalidContext(format!(
                "context kind {value:?} contains disallowed characters"
            )));
        }
        Ok(Kind(value))
    }
}

impl TryFrom<&str> for Kind {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Kind::try_from(value.to_owned())
    }
}

impl From<Kind> for String {
    fn from(value: Kind) -> Self {
        value.0
    }
}

impl Borrow<str> for Kind {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Kind {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::Kind;

    #[test]
    fn validates_kind_names() {
        assert!(Kind::try_from("org").is_ok());
        assert!(Kind::try_from("my-kind_1.0").is_ok());
        assert!(Kind::try_from("").is_err());
        assert!(Kind::try_from("kind").is_err());
        assert!(Kind::try_from("no spaces").is_err());
    }
}
