//! Private attribute redaction for contexts included in analytics events.
use crate::{Context, Reference};

/// Converts contexts to their event JSON form, removing private attributes.
///
/// `kind`, `key` and `anonymous` are never redacted.
#[derive(Debug, Clone, Default)]
pub struct ContextFilter {
    all_attributes_private: bool,
    private_attributes: Vec<Reference>,
}

impl ContextFilter {
    pub fn new(all_attributes_private: bool, private_attributes: Vec<Reference>) -> ContextFilter {
        ContextFilter {
            all_attributes_private,
            private_attributes,
        }
    }

    pub fn filter(&self, context: &Context) -> serde_json::Value {
        if !context.is_multi() {
            return serde_json::Value::Object(self.filter_single(context, true));
        }
        let mut map = serde_json::Map::new();
        map.insert("kind".into(), "multi".into());
        for individual in context.individual_contexts() {
            map.insert(
                individual.kind().to_string(),
                serde_json::Value::Object(self.filter_single(individual, false)),
            );
        }
        serde_json::Value::Object(map)
    }

    fn filter_single(
        &self,
        context: &Context,
        include_kind: bool,
    ) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        if include_kind {
            map.insert("kind".into(), context.kind().to_string().into());
        }
        map.insert("key".into(), context.key().into());
        if context.anonymous() {
            map.insert("anonymous".into(), true.into());
        }

        let mut attributes = serde_json::Map::new();
        if let Some(name) = context.name() {
            attributes.insert("name".into(), name.into());
        }
        for (name, value) in context.attributes() {
            attributes.insert(name.clone(), value.into());
        }

        let mut redacted = Vec::new();
        if self.all_attributes_private {
            redacted = attributes.keys().cloned().collect();
            redacted.sort();
            attributes.clear();
        } else {
            for reference in self
                .private_attributes
                .iter()
                .chain(context.private_attributes())
            {
                if !reference.is_valid() {
                    continue;
                }
                if redact(&mut attributes, reference.components())
                    && !redacted.iter().any(|r| r == reference.as_str())
                {
                    redacted.push(reference.as_str().to_owned());
                }
            }
        }

        map.extend(attributes);
        if !redacted.is_empty() {
            let mut meta = serde_json::Map::new();
            meta.insert("redactedAttributes".into(), redacted.into());
            map.insert("_meta".into(), meta.into());
        }
        map
    }
}

fn redact(map: &mut serde_json::Map<String, serde_json::Value>, path: &[String]) -> bool {
    match path {
        [] => false,
        [last] => map.remove(last).is_some(),
        [first, rest @ ..] => match map.get_mut(first) {
            Some(serde_json::Value::Object(inner)) => redact(inner, rest),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::ContextFilter;
    use crate::{AttributeValue, ContextBuilder, MultiContextBuilder, Reference};

    fn context() -> crate::Context {
        ContextBuilder::new("u1")
            .name("Red")
            .anonymous(true)
            .set_value("email", "red@example.com")
            .set_value(
                "address",
                AttributeValue::from(json!({"street": "Main", "city": "Oakland"})),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn no_private_attributes() {
        let filtered = ContextFilter::default().filter(&context());
        assert_eq!(
            filtered,
            json!({
                "kind": "user",
                "key": "u1",
                "anonymous": true,
                "name": "Red",
                "email": "red@example.com",
                "address": {"street": "Main", "city": "Oakland"}
            })
        );
    }

    #[test]
    fn all_attributes_private() {
        let filtered = ContextFilter::new(true, vec![]).filter(&context());
        assert_eq!(
            filtered,
            json!({
                "kind": "user",
                "key": "u1",
                "anonymous": true,
                "_meta": {"redactedAttributes": ["address", "email", "name"]}
            })
        );
    }

    #[test]
    fn configured_and_context_private_attributes() {
        let context = ContextBuilder::new("u1")
            .set_value("email", "red@example.com")
            .set_value(
                "address",
                AttributeValue::from(json!({"street": "Main", "city": "Oakland"})),
            )
            .add_private_attribute("/address/street")
            .build()
            .unwrap();
        let filter = ContextFilter::new(false, vec![Reference::new("email"), Reference::new("missing")]);
        assert_eq!(
            filter.filter(&context),
            json!({
                "kind": "user",
                "key": "u1",
                "address": {"city": "Oakland"},
                "_meta": {"redactedAttributes": ["email", "/address/street"]}
            })
        );
    }

    #[test]
    fn key_and_kind_cannot_be_redacted() {
        let filter = ContextFilter::new(false, vec![Reference::new("key"), Reference::new("kind")]);
        let filtered = filter.filter(&ContextBuilder::new("u1").build().unwrap());
        assert_eq!(filtered, json!({"kind": "user", "key": "u1"}));
    }

    #[test]
    fn multi_kind_context() {
        let context = MultiContextBuilder::new()
            .add_context(
                ContextBuilder::new("o1")
                    .kind("org")
                    .set_value("secret", "x")
                    .add_private_attribute("secret")
                    .build()
                    .unwrap(),
            )
            .add_context(ContextBuilder::new("u1").build().unwrap())
            .build()
            .unwrap();
        assert_eq!(
            ContextFilter::default().filter(&context),
            json!({
                "kind": "multi",
                "org": {"key": "o1", "_meta": {"redactedAttributes": ["secret"]}},
                "user": {"key": "u1"}
            })
        );
    }
}
