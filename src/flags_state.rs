//! Snapshot of all flag values for a context, used to bootstrap client-side SDKs.
use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use serde::{Serialize, Serializer};

use crate::{eval::Reason, flags::Flag};

/// Options for [`Client::all_flags_state`](crate::Client::all_flags_state).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlagsStateOptions {
    with_reasons: bool,
    client_side_only: bool,
    details_only_for_tracked_flags: bool,
}

impl FlagsStateOptions {
    pub fn new() -> Self {
        FlagsStateOptions::default()
    }

    /// Include evaluation reasons.
    pub fn with_reasons(mut self, with_reasons: bool) -> Self {
        self.with_reasons = with_reasons;
        self
    }

    /// Only include flags available to client-side SDKs.
    pub fn client_side_only(mut self, client_side_only: bool) -> Self {
        self.client_side_only = client_side_only;
        self
    }

    /// Omit version and reason of flags that do not need them for event tracking.
    pub fn details_only_for_tracked_flags(mut self, details_only: bool) -> Self {
        self.details_only_for_tracked_flags = details_only;
        self
    }

    pub(crate) fn is_client_side_only(&self) -> bool {
        self.client_side_only
    }
}

/// Per-flag metadata serialized under `$flagsState`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variation: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub track_events: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub track_reason: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_events_until_date: Option<u64>,
}

/// Values and metadata of all flags for one context.
///
/// Serializes to `{<flag key>: <value>, ..., "$flagsState": {...}, "$valid": bool}`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FlagsState {
    valid: bool,
    values: BTreeMap<String, serde_json::Value>,
    metadata: BTreeMap<String, FlagState>,
}

impl FlagsState {
    /// State returned when flags could not be evaluated (offline or uninitialized client).
    pub(crate) fn invalid() -> FlagsState {
        FlagsState::default()
    }

    /// Whether the state was produced from initialized flag data.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn flag_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    pub fn flag_reason(&self, key: &str) -> Option<&Reason> {
        self.metadata.get(key).and_then(|m| m.reason.as_ref())
    }

    pub fn flag_state(&self, key: &str) -> Option<&FlagState> {
        self.metadata.get(key)
    }

    /// Flag values by key.
    pub fn values(&self) -> HashMap<String, serde_json::Value> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl Serialize for FlagsState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(Some(self.values.len() + 2))?;
        for (key, value) in &self.values {
            map.serialize_entry(key, value)?;
        }
        map.serialize_entry("$flagsState", &self.metadata)?;
        map.serialize_entry("$valid", &self.valid)?;
        map.end()
    }
}

pub(crate) struct FlagsStateBuilder {
    state: FlagsState,
    with_reasons: bool,
    details_only_for_tracked_flags: bool,
}

impl FlagsStateBuilder {
    pub fn new(valid: bool, options: FlagsStateOptions) -> FlagsStateBuilder {
        FlagsStateBuilder {
            state: FlagsState {
                valid,
                ..FlagsState::default()
            },
            with_reasons: options.with_reasons,
            details_only_for_tracked_flags: options.details_only_for_tracked_flags,
        }
    }

    /// `track_reason` is set when the evaluation requires experiment data: the reason is then
    /// always included.
    pub fn add_flag(
        &mut self,
        flag: &Flag,
        value: serde_json::Value,
        variation: Option<usize>,
        reason: Reason,
        track_events: bool,
        track_reason: bool,
    ) {
        let now = Utc::now().timestamp_millis();
        let debugging = flag
            .debug_events_until_date
            .is_some_and(|until| i64::try_from(until).is_ok_and(|t| t > now));
        let omit_details =
            self.details_only_for_tracked_flags && !track_events && !track_reason && !debugging;

        self.state.values.insert(flag.key.clone(), value);
        self.state.metadata.insert(
            flag.key.clone(),
            FlagState {
                variation,
                version: (!omit_details).then_some(flag.version),
                reason: (track_reason || (self.with_reasons && !omit_details)).then_some(reason),
                track_events,
                track_reason,
                debug_events_until_date: flag.debug_events_until_date,
            },
        );
    }

    pub fn build(self) -> FlagsState {
        self.state
    }
}
