//! Evaluation contexts.
//!
//! A [`Context`] is the identity flags are evaluated against. It is either a single context of
//! some [`Kind`] (e.g., a user or an organization) or a multi-kind context holding several single
//! contexts with distinct kinds. Contexts are validated on construction and immutable afterwards.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

mod attributes;
mod kind;
mod reference;

pub use attributes::{AttributeValue, Attributes};
pub use kind::Kind;
pub use reference::{Reference, ReferenceError};

/// An immutable, validated evaluation context.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "serde_json::Value")]
pub struct Context {
    kind: Kind,
    key: String,
    name: Option<String>,
    anonymous: bool,
    secondary: Option<String>,
    attributes: Attributes,
    private_attributes: Vec<Reference>,
    /// Individual contexts of a multi-kind context, sorted by kind. Empty for single contexts.
    contexts: Vec<Context>,
    canonical_key: String,
}

impl Context {
    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    pub fn is_multi(&self) -> bool {
        self.kind.is_multi()
    }

    /// Key of a single context. Multi-kind contexts have no key of their own and return `""`.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn anonymous(&self) -> bool {
        self.anonymous
    }

    pub fn secondary(&self) -> Option<&str> {
        self.secondary.as_deref()
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn private_attributes(&self) -> &[Reference] {
        &self.private_attributes
    }

    /// A string that uniquely identifies this context across kinds.
    pub fn canonical_key(&self) -> &str {
        &self.canonical_key
    }

    /// Single contexts making up this context: itself for a single context, or the individual
    /// contexts (sorted by kind) for a multi-kind context.
    pub fn individual_contexts(&self) -> Vec<&Context> {
        if self.is_multi() {
            self.contexts.iter().collect()
        } else {
            vec![self]
        }
    }

    pub fn kinds(&self) -> Vec<&Kind> {
        self.individual_contexts()
            .into_iter()
            .map(|c| &c.kind)
            .collect()
    }

    /// Return the single context of the given kind, if present.
    pub fn as_kind(&self, kind: &Kind) -> Option<&Context> {
        self.individual_contexts()
            .into_iter()
            .find(|c| &c.kind == kind)
    }

    /// Map from kind to key of every individual context.
    pub fn context_keys(&self) -> BTreeMap<String, String> {
        self.individual_contexts()
            .into_iter()
            .map(|c| (c.kind.to_string(), c.key.clone()))
            .collect()
    }

    /// Look up an attribute of a single context by reference. Built-in attributes (`kind`, `key`,
    /// `name`, `anonymous`) are resolved as well. Returns `None` for multi-kind contexts, invalid
    /// references, and missing or null values.
    pub fn get_value(&self, reference: &Reference) -> Option<AttributeValue> {
        if self.is_multi() {
            return None;
        }
        let (first, rest) = reference.components().split_first()?;
        let mut value = match first.as_str() {
            "kind" => AttributeValue::String(self.kind.to_string()),
            "key" => AttributeValue::String(self.key.clone()),
            "name" => AttributeValue::String(self.name.clone()?),
            "anonymous" => AttributeValue::Bool(self.anonymous),
            name => self.attributes.get(name)?.clone(),
        };
        for component in rest {
            value = value.get(component)?.clone();
        }
        if value.is_null() {
            None
        } else {
            Some(value)
        }
    }

    fn to_json_value(&self, include_kind: bool) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        if self.is_multi() {
            map.insert("kind".into(), "multi".into());
            for context in &self.contexts {
                map.insert(context.kind.to_string(), context.to_json_value(false));
            }
            return serde_json::Value::Object(map);
        }
        if include_kind {
            map.insert("kind".into(), self.kind.to_string().into());
        }
        map.insert("key".into(), self.key.clone().into());
        if let Some(name) = &self.name {
            map.insert("name".into(), name.clone().into());
        }
        if self.anonymous {
            map.insert("anonymous".into(), true.into());
        }
        for (name, value) in &self.attributes {
            map.insert(name.clone(), value.into());
        }
        let mut meta = serde_json::Map::new();
        if !self.private_attributes.is_empty() {
            meta.insert(
                "privateAttributes".into(),
                self.private_attributes
                    .iter()
                    .map(|r| serde_json::Value::from(r.as_str()))
                    .collect(),
            );
        }
        if let Some(secondary) = &self.secondary {
            meta.insert("secondary".into(), secondary.clone().into());
        }
        if !meta.is_empty() {
            map.insert("_meta".into(), meta.into());
        }
        serde_json::Value::Object(map)
    }
}

impl Serialize for Context {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        self.to_json_value(true).serialize(serializer)
    }
}

/// Builder for a single-kind [`Context`].
///
/// ```
/// # use flagpole::ContextBuilder;
/// let context = ContextBuilder::new("org-key")
///     .kind("organization")
///     .name("Example Org")
///     .set_value("employees", 42.0)
///     .build()
///     .unwrap();
/// assert_eq!(context.canonical_key(), "organization:org-key");
/// ```
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    kind: String,
    key: String,
    name: Option<String>,
    anonymous: bool,
    secondary: Option<String>,
    attributes: Attributes,
    private_attributes: Vec<Reference>,
}

impl ContextBuilder {
    /// Start building a context of kind `user` with the given key.
    pub fn new(key: impl Into<String>) -> Self {
        ContextBuilder {
            kind: "user".to_owned(),
            key: key.into(),
            name: None,
            anonymous: false,
            secondary: None,
            attributes: Attributes::new(),
            private_attributes: Vec::new(),
        }
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn anonymous(mut self, anonymous: bool) -> Self {
        self.anonymous = anonymous;
        self
    }

    /// Legacy secondary key, appended to the bucketing input.
    pub fn secondary(mut self, secondary: impl Into<String>) -> Self {
        self.secondary = Some(secondary.into());
        self
    }

    /// Set an attribute. Built-in attribute names are routed to their dedicated fields; values of
    /// the wrong type for a built-in attribute are ignored.
    pub fn set_value(mut self, name: &str, value: impl Into<AttributeValue>) -> Self {
        let value = value.into();
        match (name, value) {
            ("kind", AttributeValue::String(kind)) => self.kind = kind,
            ("key", AttributeValue::String(key)) => self.key = key,
            ("name", AttributeValue::String(n)) => self.name = Some(n),
            ("name", AttributeValue::Null) => self.name = None,
            ("anonymous", AttributeValue::Bool(a)) => self.anonymous = a,
            ("kind" | "key" | "name" | "anonymous" | "_meta", _) => {}
            (_, AttributeValue::Null) => {
                self.attributes.remove(name);
            }
            (_, value) => {
                self.attributes.insert(name.to_owned(), value);
            }
        }
        self
    }

    /// Mark an attribute (possibly a nested `/path`) as private for analytics events.
    pub fn add_private_attribute(mut self, reference: impl Into<Reference>) -> Self {
        self.private_attributes.push(reference.into());
        self
    }

    pub fn build(self) -> Result<Context> {
        let kind = Kind::try_from(self.kind)?;
        if kind.is_multi() {
            return Err(Error::InvalidContext(
                "single context cannot have kind \"multi\"".into(),
            ));
        }
        if self.key.is_empty() {
            return Err(Error::InvalidContext("context key must not be empty".into()));
        }
        let canonical_key = if kind.is_user() {
            self.key.clone()
        } else {
            format!("{kind}:{}", escape_key(&self.key))
        };
        Ok(Context {
            kind,
            key: self.key,
            name: self.name,
            anonymous: self.anonymous,
            secondary: self.secondary,
            attributes: self.attributes,
            private_attributes: self.private_attributes,
            contexts: Vec::new(),
            canonical_key,
        })
    }
}

/// Builder for a multi-kind [`Context`].
#[derive(Debug, Clone, Default)]
pub struct MultiContextBuilder {
    contexts: Vec<Context>,
}

impl MultiContextBuilder {
    pub fn new() -> Self {
        MultiContextBuilder::default()
    }

    /// Add a context. Multi-kind contexts are flattened into their individual contexts.
    pub fn add_context(mut self, context: Context) -> Self {
        if context.is_multi() {
            self.contexts.extend(context.contexts);
        } else {
            self.contexts.push(context);
        }
        self
    }

    pub fn build(mut self) -> Result<Context> {
        if self.contexts.is_empty() {
            return Err(Error::InvalidContext(
                "multi-kind context must contain at least one context".into(),
            ));
        }
        if self.contexts.len() == 1 {
            return Ok(self.contexts.remove(0));
        }
        self.contexts.sort_by(|a, b| a.kind.cmp(&b.kind));
        if let Some(pair) = self.contexts.windows(2).find(|w| w[0].kind == w[1].kind) {
            return Err(Error::InvalidContext(format!(
                "multi-kind context contains kind {:?} more than once",
                pair[0].kind.as_str()
            )));
        }
        let canonical_key = self
            .contexts
            .iter()
            .map(|c| format!("{}:{}", c.kind, escape_key(&c.key)))
            .collect::<Vec<_>>()
            .join(":");
        Ok(Context {
            kind: Kind::multi(),
            key: String::new(),
            name: None,
            anonymous: false,
            secondary: None,
            attributes: Attributes::new(),
            private_attributes: Vec::new(),
            contexts: self.contexts,
            canonical_key,
        })
    }
}

fn escape_key(key: &str) -> String {
    key.replace('%', "%25").replace(':', "%3A")
}

impl TryFrom<serde_json::Value> for Context {
    type Error = Error;

    fn try_from(value: serde_json::Value) -> Result<Self> {
        let serde_json::Value::Object(mut map) = value else {
            return Err(Error::InvalidContext("context must be a JSON object".into()));
        };
        match map.remove("kind") {
            None => parse_legacy_user(map),
            Some(serde_json::Value::String(kind)) if kind == "multi" => {
                let mut builder = MultiContextBuilder::new();
                for (kind, value) in map {
                    let serde_json::Value::Object(inner) = value else {
                        return Err(Error::InvalidContext(format!(
                            "context of kind {kind:?} must be a JSON object"
                        )));
                    };
                    builder = builder.add_context(parse_single(kind, inner)?);
                }
                builder.build()
            }
            Some(serde_json::Value::String(kind)) => parse_single(kind, map),
            Some(_) => Err(Error::InvalidContext("context kind must be a string".into())),
        }
    }
}

fn parse_single(kind: String, map: serde_json::Map<String, serde_json::Value>) -> Result<Context> {
    let mut builder = ContextBuilder::new("").kind(kind);
    for (name, value) in map {
        match (name.as_str(), value) {
            ("key", serde_json::Value::String(key)) => builder = builder.key(key),
            ("key", _) => return Err(Error::InvalidContext("context key must be a string".into())),
            ("name", serde_json::Value::String(n)) => builder = builder.name(n),
            ("name", serde_json::Value::Null) => {}
            ("name", _) => {
                return Err(Error::InvalidContext("context name must be a string".into()))
            }
            ("anonymous", serde_json::Value::Bool(a)) => builder = builder.anonymous(a),
            ("anonymous", serde_json::Value::Null) => {}
            ("anonymous", _) => {
                return Err(Error::InvalidContext(
                    "context anonymous must be a boolean".into(),
                ))
            }
            ("_meta", serde_json::Value::Object(meta)) => {
                if let Some(serde_json::Value::Array(refs)) = meta.get("privateAttributes") {
                    for r in refs.iter().filter_map(|r| r.as_str()) {
                        builder = builder.add_private_attribute(r);
                    }
                }
                if let Some(serde_json::Value::String(secondary)) = meta.get("secondary") {
                    builder = builder.secondary(secondary.clone());
                }
            }
            ("_meta", _) => {}
            (name, value) => builder = builder.set_value(name, AttributeValue::from(value)),
        }
    }
    builder.build()
}

const LEGACY_BUILT_INS: &[&str] = &[
    "firstName",
    "lastName",
    "email",
    "avatar",
    "ip",
    "country",
];

fn parse_legacy_user(map: serde_json::Map<String, serde_json::Value>) -> Result<Context> {
    let mut builder = ContextBuilder::new("");
    for (name, value) in map {
        match (name.as_str(), value) {
            ("key", serde_json::Value::String(key)) => builder = builder.key(key),
            ("key", _) => return Err(Error::InvalidContext("user key must be a string".into())),
            ("name", serde_json::Value::String(n)) => builder = builder.name(n),
            ("anonymous", serde_json::Value::Bool(a)) => builder = builder.anonymous(a),
            ("secondary", serde_json::Value::String(s)) => builder = builder.secondary(s),
            ("custom", serde_json::Value::Object(custom)) => {
                for (name, value) in custom {
                    builder = builder.set_value(&name, AttributeValue::from(value));
                }
            }
            ("privateAttributeNames", serde_json::Value::Array(names)) => {
                for name in names.iter().filter_map(|n| n.as_str()) {
                    builder = builder.add_private_attribute(Reference::literal(name));
                }
            }
            (name, serde_json::Value::String(s)) if LEGACY_BUILT_INS.contains(&name) => {
                builder = builder.set_value(name, s);
            }
            _ => {}
        }
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{AttributeValue, Context, ContextBuilder, Kind, MultiContextBuilder, Reference};

    fn org() -> Context {
        ContextBuilder::new("org:1").kind("org").build().unwrap()
    }

    #[test]
    fn single_user_canonical_key_is_the_key() {
        let context = ContextBuilder::new("user-key").build().unwrap();
        assert_eq!(context.canonical_key(), "user-key");
        assert_eq!(context.kind(), &Kind::user());
    }

    #[test]
    fn non_user_canonical_key_is_escaped() {
        assert_eq!(org().canonical_key(), "org:org%3A1");
    }

    #[test]
    fn multi_kind_is_sorted_by_kind() {
        let user = ContextBuilder::new("u%1").build().unwrap();
        let context = MultiContextBuilder::new()
            .add_context(user)
            .add_context(org())
            .build()
            .unwrap();
        assert!(context.is_multi());
        assert_eq!(context.canonical_key(), "org:org%3A1:user:u%251");
        assert_eq!(
            context.kinds().iter().map(|k| k.as_str()).collect::<Vec<_>>(),
            ["org", "user"]
        );
    }

    #[test]
    fn multi_kind_with_one_context_is_unwrapped() {
        let context = MultiContextBuilder::new()
            .add_context(org())
            .build()
            .unwrap();
        assert!(!context.is_multi());
        assert_eq!(context.key(), "org:1");
    }

    #[test]
    fn multi_kind_rejects_duplicate_kinds() {
        let result = MultiContextBuilder::new()
            .add_context(org())
            .add_context(ContextBuilder::new("other").kind("org").build().unwrap())
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn empty_key_is_invalid() {
        assert!(ContextBuilder::new("").build().is_err());
        assert!(ContextBuilder::new("k").kind("multi").build().is_err());
    }

    #[test]
    fn get_value_resolves_built_ins_and_paths() {
        let context = ContextBuilder::new("key")
            .name("Red")
            .set_value(
                "address",
                AttributeValue::from(json!({"street": "Main", "zip": 12345})),
            )
            .build()
            .unwrap();
        assert_eq!(context.get_value(&"key".into()), Some("key".into()));
        assert_eq!(context.get_value(&"kind".into()), Some("user".into()));
        assert_eq!(context.get_value(&"name".into()), Some("Red".into()));
        assert_eq!(
            context.get_value(&"/address/street".into()),
            Some("Main".into())
        );
        assert_eq!(context.get_value(&"/address/city".into()), None);
        assert_eq!(context.get_value(&Reference::literal("/address")), None);
    }

    #[test]
    fn parses_single_kind_json() {
        let context: Context = serde_json::from_value(json!({
            "kind": "org",
            "key": "o1",
            "name": "Org",
            "tier": "gold",
            "_meta": {"privateAttributes": ["tier"]}
        }))
        .unwrap();
        assert_eq!(context.kind().as_str(), "org");
        assert_eq!(context.get_value(&"tier".into()), Some("gold".into()));
        assert_eq!(context.private_attributes(), &[Reference::new("tier")]);
    }

    #[test]
    fn parses_multi_kind_json() {
        let context: Context = serde_json::from_value(json!({
            "kind": "multi",
            "user": {"key": "u1"},
            "org": {"key": "o1"}
        }))
        .unwrap();
        assert_eq!(context.canonical_key(), "org:o1:user:u1");
        assert_eq!(
            context.as_kind(&Kind::user()).map(|c| c.key()),
            Some("u1")
        );
    }

    #[test]
    fn parses_legacy_user_json() {
        let context: Context = serde_json::from_value(json!({
            "key": "u1",
            "email": "a@b.c",
            "custom": {"age": 99},
            "privateAttributeNames": ["email"]
        }))
        .unwrap();
        assert_eq!(context.kind(), &Kind::user());
        assert_eq!(context.get_value(&"age".into()), Some(99.0.into()));
        assert_eq!(context.get_value(&"email".into()), Some("a@b.c".into()));
        assert_eq!(context.private_attributes(), &[Reference::literal("email")]);
    }

    #[test]
    fn rejects_invalid_json() {
        assert!(serde_json::from_value::<Context>(json!({"kind": "user"})).is_err());
        assert!(serde_json::from_value::<Context>(json!({"kind": "user", "key": 1})).is_err());
        assert!(serde_json::from_value::<Context>(json!("user")).is_err());
    }

    #[test]
    fn serializes_round_trip_shape() {
        let context = ContextBuilder::new("u1").name("Red").build().unwrap();
        assert_eq!(
            serde_json::to_value(&context).unwrap(),
            json!({"kind": "user", "key": "u1", "name": "Red"})
        );
    }
}
