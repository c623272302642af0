use regex::Regex;
use semver::{BuildMetadata, Version};

use crate::{
    eval::ErrorKind,
    flags::{Clause, Op},
    AttributeValue, Context, Kind, Reference,
};

impl Clause {
    /// Attribute reference this clause reads. Without a context kind the attribute is a plain
    /// name, even when it starts with `/`.
    pub(crate) fn reference(&self) -> Reference {
        if self.context_kind.is_some() {
            Reference::new(self.attribute.as_str())
        } else {
            Reference::literal(self.attribute.as_str())
        }
    }

    /// Match a clause against a context. `segmentMatch` clauses are resolved by the evaluator
    /// and never match here.
    ///
    /// Negation is only applied when the context has the attribute.
    pub(crate) fn matches_context(&self, context: &Context) -> Result<bool, ErrorKind> {
        let reference = self.reference();
        if !reference.is_valid() {
            return Err(ErrorKind::MalformedFlag);
        }

        if reference.components() == ["kind"] {
            let matched = context
                .kinds()
                .into_iter()
                .any(|kind| self.any_value_matches(&AttributeValue::String(kind.to_string())));
            return Ok(self.maybe_negate(matched));
        }

        let kind = self.context_kind.clone().unwrap_or_else(Kind::user);
        let Some(individual) = context.as_kind(&kind) else {
            return Ok(false);
        };
        let Some(value) = individual.get_value(&reference) else {
            return Ok(false);
        };

        let matched = match &value {
            AttributeValue::Array(values) => values.iter().any(|v| self.any_value_matches(v)),
            value => self.any_value_matches(value),
        };
        Ok(self.maybe_negate(matched))
    }

    fn any_value_matches(&self, attribute: &AttributeValue) -> bool {
        self.values.iter().any(|v| self.op.eval(attribute, v))
    }

    pub(crate) fn maybe_negate(&self, matched: bool) -> bool {
        if self.negate {
            !matched
        } else {
            matched
        }
    }
}

impl Op {
    /// Apply the operator to an attribute value and one clause value. Returns `false` if the
    /// operator cannot be applied to these types.
    pub(crate) fn eval(&self, attribute: &AttributeValue, clause_value: &AttributeValue) -> bool {
        self.try_eval(attribute, clause_value).unwrap_or(false)
    }

    fn try_eval(&self, attribute: &AttributeValue, clause_value: &AttributeValue) -> Option<bool> {
        match self {
            Self::In => Some(attribute == clause_value),

            Self::StartsWith => Some(attribute.as_str()?.starts_with(clause_value.as_str()?)),
            Self::EndsWith => Some(attribute.as_str()?.ends_with(clause_value.as_str()?)),
            Self::Contains => Some(attribute.as_str()?.contains(clause_value.as_str()?)),

            Self::Matches => {
                let s = attribute.as_str()?;
                let regex = Regex::new(clause_value.as_str()?).ok()?;
                Some(regex.is_match(s))
            }

            Self::LessThan
            | Self::LessThanOrEqual
            | Self::GreaterThan
            | Self::GreaterThanOrEqual => {
                let a = attribute.as_f64()?;
                let b = clause_value.as_f64()?;
                Some(match self {
                    Self::LessThan => a < b,
                    Self::LessThanOrEqual => a <= b,
                    Self::GreaterThan => a > b,
                    _ => a >= b,
                })
            }

            Self::Before | Self::After => {
                let a = attribute.as_timestamp_millis()?;
                let b = clause_value.as_timestamp_millis()?;
                Some(if *self == Self::Before { a < b } else { a > b })
            }

            Self::SemVerEqual | Self::SemVerLessThan | Self::SemVerGreaterThan => {
                let a = parse_semver(attribute.as_str()?)?;
                let b = parse_semver(clause_value.as_str()?)?;
                Some(match self {
                    Self::SemVerEqual => a == b,
                    Self::SemVerLessThan => a < b,
                    _ => a > b,
                })
            }

            Self::SegmentMatch | Self::Unknown => None,
        }
    }
}

/// Parse a semantic version, accepting a missing minor or patch component (`2` is `2.0.0`,
/// `2.1-beta` is `2.1.0-beta`). Build metadata is dropped as it does not affect precedence.
fn parse_semver(s: &str) -> Option<Version> {
    let mut version = Version::parse(s).or_else(|_| {
        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let (numbers, rest) = s.split_at(split);
        let mut padded = numbers.to_owned();
        for _ in numbers.matches('.').count()..2 {
            padded.push_str(".0");
        }
        padded.push_str(rest);
        Version::parse(&padded)
    });
    if let Ok(version) = &mut version {
        version.build = BuildMetadata::EMPTY;
    }
    version.ok()
}
