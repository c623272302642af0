use serde::{Deserialize, Serialize};

use crate::{big_segments::BigSegmentsStatus, flags::VariationIndex};

/// Why an evaluation produced the value it did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reason {
    #[serde(flatten)]
    pub kind: ReasonKind,
    /// Set when the evaluation consulted a big segment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub big_segments_status: Option<BigSegmentsStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "kind",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ReasonKind {
    /// Flag is off.
    Off,
    /// No target or rule matched.
    Fallthrough {
        #[serde(default, skip_serializing_if = "is_false")]
        in_experiment: bool,
    },
    /// Context key was in a target list.
    TargetMatch,
    RuleMatch {
        rule_index: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rule_id: Option<String>,
        #[serde(default, skip_serializing_if = "is_false")]
        in_experiment: bool,
    },
    /// A prerequisite was off or did not return the required variation.
    PrerequisiteFailed { prerequisite_key: String },
    Error { error_kind: ErrorKind },
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Kind of evaluation error. The caller's default value is returned for all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Flag does not exist in the store.
    FlagNotFound,
    /// Context was missing or invalid.
    UserNotSpecified,
    /// Client is offline or the store has not been initialized yet.
    ClientNotReady,
    /// Flag data is invalid, e.g., a variation index is out of range or prerequisites form a
    /// cycle.
    MalformedFlag,
    /// Flag value does not match the type requested by the caller.
    WrongType,
    /// Unexpected error.
    Exception,
}

impl Reason {
    fn new(kind: ReasonKind) -> Reason {
        Reason {
            kind,
            big_segments_status: None,
        }
    }

    pub fn off() -> Reason {
        Reason::new(ReasonKind::Off)
    }

    pub fn fallthrough(in_experiment: bool) -> Reason {
        Reason::new(ReasonKind::Fallthrough { in_experiment })
    }

    pub fn target_match() -> Reason {
        Reason::new(ReasonKind::TargetMatch)
    }

    pub fn rule_match(rule_index: usize, rule_id: Option<String>, in_experiment: bool) -> Reason {
        Reason::new(ReasonKind::RuleMatch {
            rule_index,
            rule_id,
            in_experiment,
        })
    }

    pub fn prerequisite_failed(prerequisite_key: impl Into<String>) -> Reason {
        Reason::new(ReasonKind::PrerequisiteFailed {
            prerequisite_key: prerequisite_key.into(),
        })
    }

    pub fn error(error_kind: ErrorKind) -> Reason {
        Reason::new(ReasonKind::Error { error_kind })
    }

    pub fn in_experiment(&self) -> bool {
        match self.kind {
            ReasonKind::Fallthrough { in_experiment } => in_experiment,
            ReasonKind::RuleMatch { in_experiment, .. } => in_experiment,
            _ => false,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self.kind {
            ReasonKind::Error { error_kind } => Some(error_kind),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_kind().is_some()
    }
}

/// Result of an evaluation: the value, the variation it came from and the reason.
///
/// `value` and `variation_index` are `None` when evaluation fell back to the caller's default.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Detail<T> {
    pub value: Option<T>,
    pub variation_index: Option<VariationIndex>,
    pub reason: Reason,
}

impl<T> Detail<T> {
    pub fn err(kind: ErrorKind) -> Detail<T> {
        Detail {
            value: None,
            variation_index: None,
            reason: Reason::error(kind),
        }
    }

    /// Map `Detail.value` using the `f` function.
    pub fn map<T2, F: FnOnce(T) -> T2>(self, f: F) -> Detail<T2> {
        Detail {
            value: self.value.map(f),
            variation_index: self.variation_index,
            reason: self.reason,
        }
    }

    /// Replace the value with `default` when evaluation did not produce one.
    pub fn or(self, default: T) -> Detail<T> {
        Detail {
            value: Some(self.value.unwrap_or(default)),
            ..self
        }
    }

    /// Try converting the value, reporting [`ErrorKind::WrongType`] when conversion fails.
    pub fn try_map<T2, F: FnOnce(T) -> Option<T2>>(self, f: F) -> Detail<T2> {
        match self.value {
            None => Detail {
                value: None,
                variation_index: self.variation_index,
                reason: self.reason,
            },
            Some(value) => match f(value) {
                Some(value) => Detail {
                    value: Some(value),
                    variation_index: self.variation_index,
                    reason: self.reason,
                },
                None => Detail::err(ErrorKind::WrongType),
            },
        }
    }
}
