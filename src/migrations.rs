//! Technology migrations driven by a flag whose variations are migration stages.
//!
//! [`Client::migration_variation`](crate::Client::migration_variation) evaluates the stage and
//! returns a [`MigrationOpTracker`]. The caller records what the migration did (which origins
//! were invoked, latencies, errors and consistency) and hands the tracker back to
//! [`Client::track_migration_op`](crate::Client::track_migration_op), which sends a
//! `migration_op` event.
use std::{collections::HashMap, fmt::Display, str::FromStr, time::Duration};

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    eval::Reason,
    events::{Measurement, MigrationEvaluation, MigrationOpEvent},
    flags::VariationIndex,
    Context, Error, Result,
};

/// Stage of a migration from an old to a new implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Off,
    DualWrite,
    Shadow,
    Live,
    RampDown,
    Complete,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Off => "off",
            Stage::DualWrite => "dualwrite",
            Stage::Shadow => "shadow",
            Stage::Live => "live",
            Stage::RampDown => "rampdown",
            Stage::Complete => "complete",
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "off" => Ok(Stage::Off),
            "dualwrite" => Ok(Stage::DualWrite),
            "shadow" => Ok(Stage::Shadow),
            "live" => Ok(Stage::Live),
            "rampdown" => Ok(Stage::RampDown),
            "complete" => Ok(Stage::Complete),
            _ => Err(Error::InvalidMigrationOp(format!("unknown migration stage {s:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationOp {
    Read,
    Write,
}

/// Implementation a migration operation ran against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Old,
    New,
}

/// Records the outcome of one migration operation.
#[derive(Debug, Clone)]
pub struct MigrationOpTracker {
    flag_key: String,
    context: Context,
    default_stage: Stage,
    stage: Stage,
    reason: Reason,
    variation: Option<VariationIndex>,
    version: Option<u64>,
    check_ratio: Option<u32>,
    sampling_ratio: Option<u32>,
    operation: Option<MigrationOp>,
    invoked: HashMap<Origin, bool>,
    errors: HashMap<Origin, bool>,
    latencies: HashMap<Origin, Duration>,
    consistent: Option<bool>,
}

impl MigrationOpTracker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        flag_key: &str,
        context: &Context,
        default_stage: Stage,
        stage: Stage,
        reason: Reason,
        variation: Option<VariationIndex>,
        version: Option<u64>,
        check_ratio: Option<u32>,
        sampling_ratio: Option<u32>,
    ) -> MigrationOpTracker {
        MigrationOpTracker {
            flag_key: flag_key.to_owned(),
            context: context.clone(),
            default_stage,
            stage,
            reason,
            variation,
            version,
            check_ratio,
            sampling_ratio,
            operation: None,
            invoked: HashMap::new(),
            errors: HashMap::new(),
            latencies: HashMap::new(),
            consistent: None,
        }
    }

    /// Stage the operation ran in.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn operation(&mut self, operation: MigrationOp) {
        self.operation = Some(operation);
    }

    pub fn invoked(&mut self, origin: Origin) {
        self.invoked.insert(origin, true);
    }

    pub fn error(&mut self, origin: Origin) {
        self.errors.insert(origin, true);
    }

    pub fn latency(&mut self, origin: Origin, latency: Duration) {
        self.latencies.insert(origin, latency);
    }

    /// Run a consistency check between the old and new results. The check only runs for one out
    /// of `checkRatio` operations (all of them when the flag has no ratio, none for a ratio of 0).
    pub fn consistency(&mut self, check: impl FnOnce() -> bool) {
        let sampled = match self.check_ratio {
            None | Some(1) => true,
            Some(0) => false,
            Some(ratio) => rand::thread_rng().gen_range(0..ratio) == 0,
        };
        if sampled {
            self.consistent = Some(check());
        }
    }

    /// Validate the recorded measurements and produce the event.
    pub fn build(&self) -> Result<MigrationOpEvent> {
        let Some(operation) = self.operation else {
            return Err(Error::InvalidMigrationOp(
                "operation must be set before an event can be created".into(),
            ));
        };
        if self.invoked.is_empty() {
            return Err(Error::InvalidMigrationOp(
                "migration invoked neither the old nor the new implementation".into(),
            ));
        }
        self.check_measurements()?;

        let mut measurements = vec![Measurement::Invoked {
            values: self.invoked.clone(),
        }];
        if let Some(value) = self.consistent {
            measurements.push(Measurement::Consistent {
                value,
                sampling_ratio: Some(self.check_ratio.unwrap_or(1)),
            });
        }
        if !self.latencies.is_empty() {
            measurements.push(Measurement::Latency {
                values: self
                    .latencies
                    .iter()
                    .map(|(origin, latency)| (*origin, latency.as_secs_f64() * 1000.0))
                    .collect(),
            });
        }
        if !self.errors.is_empty() {
            measurements.push(Measurement::Error {
                values: self.errors.clone(),
            });
        }

        Ok(MigrationOpEvent {
            creation_date: Utc::now(),
            context: self.context.clone(),
            operation,
            evaluation: MigrationEvaluation {
                key: self.flag_key.clone(),
                value: serde_json::Value::from(self.stage.as_str()),
                default: serde_json::Value::from(self.default_stage.as_str()),
                reason: self.reason.clone(),
                variation: self.variation,
                version: self.version,
            },
            measurements,
            sampling_ratio: self.sampling_ratio,
        })
    }

    /// Latencies, errors and consistency results are only meaningful for invoked origins.
    fn check_measurements(&self) -> Result<()> {
        let not_invoked = |origin: &Origin| !self.invoked.contains_key(origin);
        if let Some(origin) = self.latencies.keys().find(|o| not_invoked(o)) {
            return Err(Error::InvalidMigrationOp(format!(
                "latency was recorded for {origin:?}, but that origin was not invoked"
            )));
        }
        if let Some(origin) = self.errors.keys().find(|o| not_invoked(o)) {
            return Err(Error::InvalidMigrationOp(format!(
                "error was recorded for {origin:?}, but that origin was not invoked"
            )));
        }
        if self.consistent.is_some() && self.invoked.len() != 2 {
            return Err(Error::InvalidMigrationOp(
                "consistency check was done, but both origins were not invoked".into(),
            ));
        }
        Ok(())
    }
}
