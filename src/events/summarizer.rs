use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::{
    events::{FeatureEvent, FlagSummary, SummaryCounter, SummaryOutput},
    flags::VariationIndex,
};

/// Rolling per-flag, per-(variation, version) counters of feature evaluations.
#[derive(Default)]
pub(crate) struct EventSummarizer {
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
    features: HashMap<String, FlagCounters>,
}

struct FlagCounters {
    default: serde_json::Value,
    context_kinds: BTreeSet<String>,
    counters: HashMap<(Option<VariationIndex>, Option<u64>), Counter>,
}

struct Counter {
    value: serde_json::Value,
    count: u64,
}

impl EventSummarizer {
    pub fn new() -> EventSummarizer {
        EventSummarizer::default()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn summarize_event(&mut self, event: &FeatureEvent) {
        let flag = self
            .features
            .entry(event.key.clone())
            .or_insert_with(|| FlagCounters {
                default: event.default.clone().unwrap_or(serde_json::Value::Null),
                context_kinds: BTreeSet::new(),
                counters: HashMap::new(),
            });
        flag.context_kinds
            .extend(event.context.kinds().into_iter().map(|k| k.to_string()));
        flag.counters
            .entry((event.variation, event.version))
            .or_insert_with(|| Counter {
                value: event.value.clone(),
                count: 0,
            })
            .count += 1;

        let date = event.creation_date;
        self.start_date = Some(self.start_date.map_or(date, |d| d.min(date)));
        self.end_date = Some(self.end_date.map_or(date, |d| d.max(date)));
    }

    /// Take the current summary, leaving the summarizer empty. Returns `None` if no events were
    /// summarized.
    pub fn take_summary(&mut self) -> Option<SummaryOutput> {
        let summarizer = std::mem::take(self);
        let (Some(start_date), Some(end_date)) = (summarizer.start_date, summarizer.end_date) else {
            return None;
        };
        let features = summarizer
            .features
            .into_iter()
            .map(|(key, flag)| {
                let mut counters = flag
                    .counters
                    .into_iter()
                    .map(|((variation, version), counter)| SummaryCounter {
                        variation,
                        version,
                        value: counter.value,
                        count: counter.count,
                        unknown: version.is_none(),
                    })
                    .collect::<Vec<_>>();
                counters.sort_by_key(|c| (c.variation, c.version));
                (
                    key,
                    FlagSummary {
                        default: flag.default,
                        context_kinds: flag.context_kinds.into_iter().collect(),
                        counters,
                    },
                )
            })
            .collect::<BTreeMap<_, _>>();
        Some(SummaryOutput {
            start_date,
            end_date,
            features,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::EventSummarizer;
    use crate::{
        events::{FeatureEvent, SummaryCounter},
        ContextBuilder, MultiContextBuilder,
    };

    fn event(key: &str, variation: Option<usize>, version: Option<u64>, at: i64) -> FeatureEvent {
        FeatureEvent {
            creation_date: Utc.timestamp_millis_opt(at).unwrap(),
            context: ContextBuilder::new("u").build().unwrap(),
            key: key.to_owned(),
            version,
            variation,
            value: json!(variation.map(|v| format!("value{v}"))),
            default: Some(json!("default")),
            reason: None,
            prereq_of: None,
            track_events: false,
            debug_events_until_date: None,
            sampling_ratio: None,
            exclude_from_summaries: false,
        }
    }

    #[test]
    fn empty_summarizer_has_no_summary() {
        assert!(EventSummarizer::new().take_summary().is_none());
    }

    #[test]
    fn counts_per_variation_and_version() {
        let mut summarizer = EventSummarizer::new();
        summarizer.summarize_event(&event("f", Some(1), Some(11), 2000));
        summarizer.summarize_event(&event("f", Some(1), Some(11), 1000));
        summarizer.summarize_event(&event("f", Some(2), Some(11), 1500));
        summarizer.summarize_event(&event("f", Some(1), Some(12), 1500));
        summarizer.summarize_event(&event("g", None, None, 3000));

        let summary = summarizer.take_summary().unwrap();
        assert_eq!(summary.start_date.timestamp_millis(), 1000);
        assert_eq!(summary.end_date.timestamp_millis(), 3000);

        let f = &summary.features["f"];
        assert_eq!(f.default, json!("default"));
        assert_eq!(f.context_kinds, ["user"]);
        assert_eq!(
            f.counters,
            [
                SummaryCounter {
                    variation: Some(1),
                    version: Some(11),
                    value: json!("value1"),
                    count: 2,
                    unknown: false
                },
                SummaryCounter {
                    variation: Some(1),
                    version: Some(12),
                    value: json!("value1"),
                    count: 1,
                    unknown: false
                },
                SummaryCounter {
                    variation: Some(2),
                    version: Some(11),
                    value: json!("value2"),
                    count: 1,
                    unknown: false
                },
            ]
        );
        assert!(summary.features["g"].counters[0].unknown);
    }

    #[test]
    fn collects_context_kinds() {
        let mut summarizer = EventSummarizer::new();
        let mut e = event("f", Some(0), Some(1), 0);
        e.context = MultiContextBuilder::new()
            .add_context(ContextBuilder::new("u").build().unwrap())
            .add_context(ContextBuilder::new("o").kind("org").build().unwrap())
            .build()
            .unwrap();
        summarizer.summarize_event(&e);
        summarizer.summarize_event(&event("f", Some(0), Some(1), 0));
        let summary = summarizer.take_summary().unwrap();
        assert_eq!(summary.features["f"].context_kinds, ["org", "user"]);
    }

    #[test]
    fn take_resets_state() {
        let mut summarizer = EventSummarizer::new();
        summarizer.summarize_event(&event("f", Some(0), Some(1), 0));
        assert!(summarizer.take_summary().is_some());
        assert!(summarizer.is_empty());
        assert!(summarizer.take_summary().is_none());
    }
}
