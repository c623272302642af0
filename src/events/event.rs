use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, TimestampMilliSeconds};

use crate::{
    eval::Reason,
    flags::VariationIndex,
    migrations::{MigrationOp, Origin},
    Context,
};

/// Events accepted by the event processor.
#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    Feature(FeatureEvent),
    Identify(IdentifyEvent),
    Custom(CustomEvent),
    MigrationOp(MigrationOpEvent),
}

impl InputEvent {
    pub fn context(&self) -> &Context {
        match self {
            InputEvent::Feature(e) => &e.context,
            InputEvent::Identify(e) => &e.context,
            InputEvent::Custom(e) => &e.context,
            InputEvent::MigrationOp(e) => &e.context,
        }
    }

    pub fn creation_date(&self) -> DateTime<Utc> {
        match self {
            InputEvent::Feature(e) => e.creation_date,
            InputEvent::Identify(e) => e.creation_date,
            InputEvent::Custom(e) => e.creation_date,
            InputEvent::MigrationOp(e) => e.creation_date,
        }
    }

    pub(crate) fn sampling_ratio(&self) -> Option<u32> {
        match self {
            InputEvent::Feature(e) => e.sampling_ratio,
            InputEvent::Identify(e) => e.sampling_ratio,
            InputEvent::Custom(e) => e.sampling_ratio,
            InputEvent::MigrationOp(e) => e.sampling_ratio,
        }
    }
}

/// Evaluation of a flag (or of a prerequisite) for a context.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureEvent {
    pub creation_date: DateTime<Utc>,
    pub context: Context,
    pub key: String,
    /// `None` for unknown flags.
    pub version: Option<u64>,
    pub variation: Option<VariationIndex>,
    pub value: serde_json::Value,
    pub default: Option<serde_json::Value>,
    pub reason: Option<Reason>,
    /// Key of the flag this flag was evaluated as a prerequisite of.
    pub prereq_of: Option<String>,
    /// Emit a full feature event in addition to summarizing.
    pub track_events: bool,
    pub debug_events_until_date: Option<u64>,
    pub sampling_ratio: Option<u32>,
    pub exclude_from_summaries: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdentifyEvent {
    pub creation_date: DateTime<Utc>,
    pub context: Context,
    pub sampling_ratio: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CustomEvent {
    pub creation_date: DateTime<Utc>,
    pub context: Context,
    pub key: String,
    pub data: Option<serde_json::Value>,
    pub metric_value: Option<f64>,
    pub sampling_ratio: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MigrationOpEvent {
    pub creation_date: DateTime<Utc>,
    pub context: Context,
    pub operation: MigrationOp,
    pub evaluation: MigrationEvaluation,
    pub measurements: Vec<Measurement>,
    pub sampling_ratio: Option<u32>,
}

/// Flag evaluation that selected the migration stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationEvaluation {
    pub key: String,
    pub value: serde_json::Value,
    pub default: serde_json::Value,
    pub reason: Reason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variation: Option<VariationIndex>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

/// A measurement recorded by a migration operation tracker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "key")]
pub enum Measurement {
    #[serde(rename = "invoked")]
    Invoked { values: HashMap<Origin, bool> },
    #[serde(rename = "latency_ms")]
    Latency { values: HashMap<Origin, f64> },
    #[serde(rename = "error")]
    Error { values: HashMap<Origin, bool> },
    #[serde(rename = "consistent")]
    Consistent {
        value: bool,
        #[serde(rename = "samplingRatio", skip_serializing_if = "Option::is_none")]
        sampling_ratio: Option<u32>,
    },
}

/// Events sent to the events service.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputEvent {
    #[serde(rename_all = "camelCase")]
    Index {
        #[serde_as(as = "TimestampMilliSeconds<i64>")]
        creation_date: DateTime<Utc>,
        context: serde_json::Value,
    },
    Feature(FeatureOutput),
    Debug(FeatureOutput),
    #[serde(rename_all = "camelCase")]
    Identify {
        #[serde_as(as = "TimestampMilliSeconds<i64>")]
        creation_date: DateTime<Utc>,
        context: serde_json::Value,
    },
    Custom(CustomOutput),
    MigrationOp(MigrationOpOutput),
    Summary(SummaryOutput),
}

impl OutputEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            OutputEvent::Index { .. } => "index",
            OutputEvent::Feature(_) => "feature",
            OutputEvent::Debug(_) => "debug",
            OutputEvent::Identify { .. } => "identify",
            OutputEvent::Custom(_) => "custom",
            OutputEvent::MigrationOp(_) => "migration_op",
            OutputEvent::Summary(_) => "summary",
        }
    }
}

/// Feature or debug event. Feature events carry `contextKeys`, debug events the full (filtered)
/// context.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureOutput {
    #[serde_as(as = "TimestampMilliSeconds<i64>")]
    pub creation_date: DateTime<Utc>,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_keys: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variation: Option<VariationIndex>,
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prereq_of: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling_ratio: Option<u32>,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomOutput {
    #[serde_as(as = "TimestampMilliSeconds<i64>")]
    pub creation_date: DateTime<Utc>,
    pub key: String,
    pub context_keys: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling_ratio: Option<u32>,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationOpOutput {
    #[serde_as(as = "TimestampMilliSeconds<i64>")]
    pub creation_date: DateTime<Utc>,
    pub context_keys: BTreeMap<String, String>,
    pub operation: MigrationOp,
    pub evaluation: serde_json::Value,
    pub measurements: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling_ratio: Option<u32>,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryOutput {
    #[serde_as(as = "TimestampMilliSeconds<i64>")]
    pub start_date: DateTime<Utc>,
    #[serde_as(as = "TimestampMilliSeconds<i64>")]
    pub end_date: DateTime<Utc>,
    pub features: BTreeMap<String, FlagSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagSummary {
    #[serde(default)]
    pub default: serde_json::Value,
    pub context_kinds: Vec<String>,
    pub counters: Vec<SummaryCounter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryCounter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variation: Option<VariationIndex>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    pub value: serde_json::Value,
    pub count: u64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unknown: bool,
}
