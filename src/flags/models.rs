use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{AttributeValue, Kind};

/// Index into [`Flag::variations`].
pub type VariationIndex = usize;

/// A feature flag definition as delivered by the update source.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Flag {
    pub key: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub on: bool,
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
    /// Legacy targets. These apply to `user` contexts only.
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub context_targets: Vec<Target>,
    #[serde(default)]
    pub rules: Vec<FlagRule>,
    #[serde(default)]
    pub fallthrough: VariationOrRollout,
    #[serde(default)]
    pub off_variation: Option<VariationIndex>,
    #[serde(default)]
    pub variations: Vec<serde_json::Value>,
    #[serde(default)]
    pub salt: String,
    #[serde(default)]
    pub track_events: bool,
    #[serde(default)]
    pub track_events_fallthrough: bool,
    /// Unix timestamp in milliseconds until which full debug events are emitted.
    #[serde(default)]
    pub debug_events_until_date: Option<u64>,
    #[serde(default)]
    pub client_side_availability: Option<ClientSideAvailability>,
    /// Older form of `clientSideAvailability.usingEnvironmentId`.
    #[serde(default)]
    pub client_side: bool,
    #[serde(default)]
    pub migration: Option<MigrationFlagParameters>,
    /// Emit one out of `samplingRatio` full events. `None` means every event.
    #[serde(default)]
    pub sampling_ratio: Option<u32>,
    #[serde(default)]
    pub exclude_from_summaries: bool,
    #[serde(default)]
    pub deleted: bool,
}

impl Flag {
    /// Value of the variation at `index`, or `None` if the index is out of range.
    pub fn variation(&self, index: VariationIndex) -> Option<&serde_json::Value> {
        self.variations.get(index)
    }

    /// Whether the flag should be exposed to client-side SDKs.
    pub fn is_client_side(&self) -> bool {
        match &self.client_side_availability {
            Some(availability) => availability.using_environment_id,
            None => self.client_side,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Prerequisite {
    pub key: String,
    pub variation: VariationIndex,
}

/// A list of context keys that receive a specific variation.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    /// Kind of contexts targeted. Legacy targets have no kind and apply to `user`.
    #[serde(default)]
    pub context_kind: Option<Kind>,
    #[serde(default)]
    pub values: HashSet<String>,
    pub variation: VariationIndex,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct FlagRule {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub clauses: Vec<Clause>,
    #[serde(flatten)]
    pub variation_or_rollout: VariationOrRollout,
    #[serde(default)]
    pub track_events: bool,
}

/// Outcome of a rule or the fallthrough: either a fixed variation or a percentage rollout.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct VariationOrRollout {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variation: Option<VariationIndex>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout: Option<Rollout>,
}

impl From<VariationIndex> for VariationOrRollout {
    fn from(value: VariationIndex) -> Self {
        VariationOrRollout {
            variation: Some(value),
            rollout: None,
        }
    }
}

impl From<Rollout> for VariationOrRollout {
    fn from(value: Rollout) -> Self {
        VariationOrRollout {
            variation: None,
            rollout: Some(value),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Rollout {
    #[serde(default)]
    pub kind: RolloutKind,
    #[serde(default)]
    pub context_kind: Option<Kind>,
    #[serde(default)]
    pub bucket_by: Option<String>,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default)]
    pub variations: Vec<WeightedVariation>,
}

impl Rollout {
    pub fn is_experiment(&self) -> bool {
        self.kind == RolloutKind::Experiment
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum RolloutKind {
    #[default]
    Rollout,
    Experiment,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct WeightedVariation {
    pub variation: VariationIndex,
    /// Weight in units of 1/100000.
    pub weight: u32,
    #[serde(default)]
    pub untracked: bool,
}

/// A single condition of a rule.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Clause {
    /// When absent, `attribute` is a plain attribute name of the `user` context. When present,
    /// `attribute` is an attribute reference.
    #[serde(default)]
    pub context_kind: Option<Kind>,
    pub attribute: String,
    pub op: Op,
    #[serde(default)]
    pub values: Vec<AttributeValue>,
    #[serde(default)]
    pub negate: bool,
}

/// Clause operator.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Op {
    In,
    EndsWith,
    StartsWith,
    Matches,
    Contains,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Before,
    After,
    SegmentMatch,
    SemVerEqual,
    SemVerLessThan,
    SemVerGreaterThan,
    /// Operator not known to this version of the SDK. Never matches.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClientSideAvailability {
    #[serde(default)]
    pub using_mobile_key: bool,
    #[serde(default)]
    pub using_environment_id: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationFlagParameters {
    /// Run consistency checks for one out of `checkRatio` operations.
    #[serde(default)]
    pub check_ratio: Option<u32>,
}

/// A reusable set of contexts referenced by `segmentMatch` clauses.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub key: String,
    #[serde(default)]
    pub version: u64,
    /// User keys included in the segment.
    #[serde(default)]
    pub included: HashSet<String>,
    /// User keys excluded from the segment.
    #[serde(default)]
    pub excluded: HashSet<String>,
    #[serde(default)]
    pub included_contexts: Vec<SegmentTarget>,
    #[serde(default)]
    pub excluded_contexts: Vec<SegmentTarget>,
    #[serde(default)]
    pub rules: Vec<SegmentRule>,
    #[serde(default)]
    pub salt: String,
    /// Membership is stored in a big segment store.
    #[serde(default)]
    pub unbounded: bool,
    #[serde(default)]
    pub unbounded_context_kind: Option<Kind>,
    #[serde(default)]
    pub generation: Option<u64>,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SegmentTarget {
    pub context_kind: Kind,
    #[serde(default)]
    pub values: HashSet<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct SegmentRule {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub clauses: Vec<Clause>,
    /// Percentage of matching contexts included, in units of 1/100000.
    #[serde(default)]
    pub weight: Option<u32>,
    #[serde(default)]
    pub bucket_by: Option<String>,
    #[serde(default)]
    pub rollout_context_kind: Option<Kind>,
}

#[cfg(test)]
mod tests {
    use super::{Flag, Op, Segment};

    #[test]
    fn parse_flag() {
        let flag: Flag = serde_json::from_value(serde_json::json!({
            "key": "flag",
            "version": 3,
            "on": true,
            "rules": [{
                "id": "r1",
                "clauses": [{"attribute": "email", "op": "endsWith", "values": ["@example.com"]}],
                "rollout": {
                    "kind": "experiment",
                    "variations": [{"variation": 0, "weight": 60000}, {"variation": 1, "weight": 40000, "untracked": true}]
                }
            }],
            "fallthrough": {"variation": 1},
            "offVariation": 0,
            "variations": [false, true],
            "salt": "abc",
            "debugEventsUntilDate": 1700000000000u64
        }))
        .unwrap();
        assert_eq!(flag.version, 3);
        assert_eq!(flag.fallthrough.variation, Some(1));
        let rollout = flag.rules[0].variation_or_rollout.rollout.as_ref().unwrap();
        assert!(rollout.is_experiment());
        assert!(rollout.variations[1].untracked);
        assert_eq!(flag.rules[0].clauses[0].op, Op::EndsWith);
        assert_eq!(flag.debug_events_until_date, Some(1700000000000));
    }

    #[test]
    fn unknown_operator_parses() {
        let flag: Flag = serde_json::from_value(serde_json::json!({
            "key": "flag",
            "rules": [{"clauses": [{"attribute": "a", "op": "someFutureOp", "values": []}], "variation": 0}]
        }))
        .unwrap();
        assert_eq!(flag.rules[0].clauses[0].op, Op::Unknown);
    }

    #[test]
    fn client_side_availability() {
        let legacy: Flag =
            serde_json::from_value(serde_json::json!({"key": "a", "clientSide": true})).unwrap();
        assert!(legacy.is_client_side());
        let modern: Flag = serde_json::from_value(serde_json::json!({
            "key": "a",
            "clientSide": true,
            "clientSideAvailability": {"usingEnvironmentId": false, "usingMobileKey": true}
        }))
        .unwrap();
        assert!(!modern.is_client_side());
    }

    #[test]
    fn parse_segment_lists_into_sets() {
        let segment: Segment = serde_json::from_value(serde_json::json!({
            "key": "seg",
            "included": ["a", "b", "a"],
            "includedContexts": [{"contextKind": "org", "values": ["o1"]}],
            "unbounded": true,
            "generation": 2
        }))
        .unwrap();
        assert_eq!(segment.included.len(), 2);
        assert!(segment.included_contexts[0].values.contains("o1"));
        assert_eq!(segment.generation, Some(2));
    }
}
