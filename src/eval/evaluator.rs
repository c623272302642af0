use std::{collections::HashMap, sync::Arc};

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;

use crate::{
    big_segments::{BigSegmentsManager, BigSegmentsStatus, Membership},
    eval::{
        bucketing::{bucket_context, BucketParams},
        Detail, ErrorKind, Reason,
    },
    events::{EventFactory, FeatureEvent},
    flags::{Clause, Flag, FlagRule, Op, VariationIndex, VariationOrRollout},
    store::FeatureStore,
    Context, Kind,
};

/// Maximum depth of nested prerequisites.
const MAX_DEPTH: usize = 100;

/// Outcome of a single flag evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalResult {
    pub detail: Detail<Value>,
    /// One event per prerequisite evaluated (nested ones included), in evaluation order.
    pub prerequisite_events: Vec<FeatureEvent>,
}

/// State threaded through one evaluation, including recursive prerequisite and segment checks.
#[derive(Default)]
pub(super) struct EvalState {
    visited_flags: Vec<String>,
    pub(super) visited_segments: Vec<String>,
    /// Big segment membership by context key, fetched at most once per evaluation.
    pub(super) big_segments_membership: HashMap<String, Option<Arc<Membership>>>,
    big_segments_status: Option<BigSegmentsStatus>,
    prerequisite_events: Vec<FeatureEvent>,
}

impl EvalState {
    pub(super) fn merge_big_segments_status(&mut self, status: BigSegmentsStatus) {
        self.big_segments_status = Some(match self.big_segments_status {
            Some(current) => current.max(status),
            None => status,
        });
    }
}

/// Flag evaluation engine.
///
/// Reads flags and segments from the feature store. Evaluation never fails: every error is
/// reported as an [`ErrorKind`] in the reason of the returned detail.
pub struct Evaluator {
    store: Arc<dyn FeatureStore>,
    pub(super) big_segments: Option<Arc<BigSegmentsManager>>,
}

impl Evaluator {
    pub fn new(
        store: Arc<dyn FeatureStore>,
        big_segments: Option<Arc<BigSegmentsManager>>,
    ) -> Evaluator {
        Evaluator {
            store,
            big_segments,
        }
    }

    /// Evaluate `flag` for `context`. Prerequisite events are produced only if `factory` is
    /// given.
    pub async fn evaluate(
        &self,
        flag: &Flag,
        context: &Context,
        factory: Option<&EventFactory>,
    ) -> EvalResult {
        let mut state = EvalState::default();
        let mut detail = match self.check_flag(flag, context, factory, &mut state).await {
            Ok(detail) => detail,
            Err(error_kind) => {
                log::warn!(target: "flagpole",
                           flag_key = flag.key.as_str(),
                           error_kind:?;
                           "failed to evaluate flag");
                Detail::err(error_kind)
            }
        };
        detail.reason.big_segments_status = state.big_segments_status;

        log::trace!(target: "flagpole",
                    flag_key = flag.key.as_str(),
                    context_key = context.canonical_key(),
                    variation = detail.variation_index,
                    reason:serde = detail.reason;
                    "evaluated flag");

        EvalResult {
            detail,
            prerequisite_events: state.prerequisite_events,
        }
    }

    fn check_flag<'a>(
        &'a self,
        flag: &'a Flag,
        context: &'a Context,
        factory: Option<&'a EventFactory>,
        state: &'a mut EvalState,
    ) -> BoxFuture<'a, Result<Detail<Value>, ErrorKind>> {
        async move {
            if !flag.on {
                return off_value(flag, Reason::off());
            }
            if state.visited_flags.len() >= MAX_DEPTH {
                log::warn!(target: "flagpole",
                           flag_key = flag.key.as_str();
                           "prerequisite depth limit exceeded");
                return Err(ErrorKind::MalformedFlag);
            }

            state.visited_flags.push(flag.key.clone());
            let prerequisites = self.check_prerequisites(flag, context, factory, state).await;
            state.visited_flags.pop();
            if let Some(prerequisite_key) = prerequisites? {
                return off_value(flag, Reason::prerequisite_failed(prerequisite_key));
            }

            if let Some(index) = target_match(flag, context) {
                return variation(flag, index, Reason::target_match());
            }

            for (rule_index, rule) in flag.rules.iter().enumerate() {
                if self.rule_matches(rule, context, state).await? {
                    let (index, in_experiment) =
                        resolve_variation(flag, &rule.variation_or_rollout, context)?;
                    let reason = Reason::rule_match(rule_index, rule.id.clone(), in_experiment);
                    return variation(flag, index, reason);
                }
            }

            let (index, in_experiment) = resolve_variation(flag, &flag.fallthrough, context)?;
            variation(flag, index, Reason::fallthrough(in_experiment))
        }
        .boxed()
    }

    /// Returns the key of the first failed prerequisite.
    async fn check_prerequisites(
        &self,
        flag: &Flag,
        context: &Context,
        factory: Option<&EventFactory>,
        state: &mut EvalState,
    ) -> Result<Option<String>, ErrorKind> {
        for prerequisite in &flag.prerequisites {
            if state.visited_flags.contains(&prerequisite.key) {
                log::warn!(target: "flagpole",
                           flag_key = flag.key.as_str(),
                           prerequisite_key = prerequisite.key.as_str();
                           "prerequisite relationship forms a cycle");
                return Err(ErrorKind::MalformedFlag);
            }
            let Some(prerequisite_flag) = self.store.flag(&prerequisite.key) else {
                log::warn!(target: "flagpole",
                           flag_key = flag.key.as_str(),
                           prerequisite_key = prerequisite.key.as_str();
                           "prerequisite flag not found");
                return Err(ErrorKind::MalformedFlag);
            };

            let detail = self
                .check_flag(&prerequisite_flag, context, factory, state)
                .await?;
            if let Some(factory) = factory {
                state.prerequisite_events.push(factory.eval_event(
                    &prerequisite_flag,
                    context,
                    &detail,
                    None,
                    Some(flag),
                ));
            }

            if !prerequisite_flag.on || detail.variation_index != Some(prerequisite.variation) {
                return Ok(Some(prerequisite.key.clone()));
            }
        }
        Ok(None)
    }

    async fn rule_matches(
        &self,
        rule: &FlagRule,
        context: &Context,
        state: &mut EvalState,
    ) -> Result<bool, ErrorKind> {
        for clause in &rule.clauses {
            if !self.clause_matches(clause, context, state).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Match a clause, resolving `segmentMatch` clauses against the store. Unknown segments are
    /// skipped.
    pub(super) fn clause_matches<'a>(
        &'a self,
        clause: &'a Clause,
        context: &'a Context,
        state: &'a mut EvalState,
    ) -> BoxFuture<'a, Result<bool, ErrorKind>> {
        async move {
            if !matches!(clause.op, Op::SegmentMatch) {
                return clause.matches_context(context);
            }
            for value in &clause.values {
                let Some(segment_key) = value.as_str() else {
                    continue;
                };
                let Some(segment) = self.store.segment(segment_key) else {
                    continue;
                };
                if self.segment_matches(&segment, context, state).await? {
                    return Ok(clause.maybe_negate(true));
                }
            }
            Ok(clause.maybe_negate(false))
        }
        .boxed()
    }
}

/// Variation for a context found in the flag's target lists.
fn target_match(flag: &Flag, context: &Context) -> Option<VariationIndex> {
    let user = Kind::user();
    if flag.context_targets.is_empty() {
        let individual = context.as_kind(&user)?;
        return flag
            .targets
            .iter()
            .find(|target| target.values.contains(individual.key()))
            .map(|target| target.variation);
    }

    for target in &flag.context_targets {
        let kind = target.context_kind.as_ref().unwrap_or(&user);
        let Some(individual) = context.as_kind(kind) else {
            continue;
        };
        let matched = if kind.is_user() && target.values.is_empty() {
            // user keys live in the legacy list of the same variation
            flag.targets.iter().any(|legacy| {
                legacy.variation == target.variation && legacy.values.contains(individual.key())
            })
        } else {
            target.values.contains(individual.key())
        };
        if matched {
            return Some(target.variation);
        }
    }
    None
}

/// Pick the variation of a rule or the fallthrough. Returns the index and whether the context is
/// in an experiment.
fn resolve_variation(
    flag: &Flag,
    variation_or_rollout: &VariationOrRollout,
    context: &Context,
) -> Result<(VariationIndex, bool), ErrorKind> {
    if let Some(index) = variation_or_rollout.variation {
        return Ok((index, false));
    }
    let Some(rollout) = &variation_or_rollout.rollout else {
        return Err(ErrorKind::MalformedFlag);
    };
    let Some(last) = rollout.variations.last() else {
        return Err(ErrorKind::MalformedFlag);
    };

    let is_experiment = rollout.is_experiment();
    let (bucket, had_kind) = bucket_context(
        context,
        BucketParams {
            context_kind: rollout.context_kind.as_ref(),
            bucket_by: rollout.bucket_by.as_deref(),
            is_experiment,
            key: &flag.key,
            salt: &flag.salt,
            seed: rollout.seed,
        },
    )?;

    let mut sum = 0.0;
    let chosen = rollout
        .variations
        .iter()
        .find(|weighted| {
            sum += f64::from(weighted.weight) / 100_000.0;
            bucket < sum
        })
        .unwrap_or(last);
    Ok((
        chosen.variation,
        is_experiment && had_kind && !chosen.untracked,
    ))
}

fn variation(
    flag: &Flag,
    index: VariationIndex,
    reason: Reason,
) -> Result<Detail<Value>, ErrorKind> {
    let Some(value) = flag.variation(index) else {
        log::warn!(target: "flagpole",
                   flag_key = flag.key.as_str(),
                   index;
                   "variation index out of range");
        return Err(ErrorKind::MalformedFlag);
    };
    Ok(Detail {
        value: Some(value.clone()),
        variation_index: Some(index),
        reason,
    })
}

fn off_value(flag: &Flag, reason: Reason) -> Result<Detail<Value>, ErrorKind> {
    match flag.off_variation {
        Some(index) => variation(flag, index, reason),
        None => Ok(Detail {
            value: None,
            variation_index: None,
            reason,
        }),
    }
}
