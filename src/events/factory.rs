use chrono::Utc;

use crate::{
    eval::{Detail, ErrorKind, Reason, ReasonKind},
    events::{CustomEvent, FeatureEvent, IdentifyEvent},
    flags::Flag,
    Context,
};

/// Builds input events from evaluation outcomes and client calls.
///
/// A factory created `with_reasons` includes the evaluation reason in every feature event (used
/// by the `*_detail` methods). Otherwise reasons are only included when the evaluation is part
/// of an experiment.
#[derive(Debug, Clone, Copy)]
pub struct EventFactory {
    with_reasons: bool,
}

impl EventFactory {
    pub fn new(with_reasons: bool) -> EventFactory {
        EventFactory { with_reasons }
    }

    /// Event for an evaluation of `flag`. `value` falls back to `default` when the evaluation did
    /// not produce one.
    pub fn eval_event(
        &self,
        flag: &Flag,
        context: &Context,
        detail: &Detail<serde_json::Value>,
        default: Option<serde_json::Value>,
        prereq_of: Option<&Flag>,
    ) -> FeatureEvent {
        let forced = is_tracking_forced(flag, &detail.reason);
        FeatureEvent {
            creation_date: Utc::now(),
            context: context.clone(),
            key: flag.key.clone(),
            version: Some(flag.version),
            variation: detail.variation_index,
            value: detail
                .value
                .clone()
                .or_else(|| default.clone())
                .unwrap_or(serde_json::Value::Null),
            default,
            reason: (self.with_reasons || forced).then(|| detail.reason.clone()),
            prereq_of: prereq_of.map(|f| f.key.clone()),
            track_events: flag.track_events || forced,
            debug_events_until_date: flag.debug_events_until_date,
            sampling_ratio: flag.sampling_ratio,
            exclude_from_summaries: flag.exclude_from_summaries,
        }
    }

    /// Event for an evaluation of a flag that does not exist.
    pub fn unknown_flag_event(
        &self,
        key: &str,
        context: &Context,
        default: serde_json::Value,
    ) -> FeatureEvent {
        FeatureEvent {
            creation_date: Utc::now(),
            context: context.clone(),
            key: key.to_owned(),
            version: None,
            variation: None,
            value: default.clone(),
            default: Some(default),
            reason: self
                .with_reasons
                .then(|| Reason::error(ErrorKind::FlagNotFound)),
            prereq_of: None,
            track_events: false,
            debug_events_until_date: None,
            sampling_ratio: None,
            exclude_from_summaries: false,
        }
    }

    pub fn identify_event(&self, context: &Context) -> IdentifyEvent {
        IdentifyEvent {
            creation_date: Utc::now(),
            context: context.clone(),
            sampling_ratio: None,
        }
    }

    pub fn custom_event(
        &self,
        key: &str,
        context: &Context,
        data: Option<serde_json::Value>,
        metric_value: Option<f64>,
    ) -> CustomEvent {
        CustomEvent {
            creation_date: Utc::now(),
            context: context.clone(),
            key: key.to_owned(),
            data,
            metric_value,
            sampling_ratio: None,
        }
    }
}

/// Whether a full feature event must be sent regardless of the flag's `trackEvents`: the context
/// is in an experiment, the matched rule tracks events, or the fallthrough tracks events.
pub(crate) fn is_tracking_forced(flag: &Flag, reason: &Reason) -> bool {
    if reason.in_experiment() {
        return true;
    }
    match &reason.kind {
        ReasonKind::Fallthrough { .. } => flag.track_events_fallthrough,
        ReasonKind::RuleMatch { rule_index, .. } => flag
            .rules
            .get(*rule_index)
            .is_some_and(|rule| rule.track_events),
        _ => false,
    }
}
