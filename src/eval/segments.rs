//! Segment membership.
use crate::{
    big_segments::{segment_ref, BigSegmentsStatus},
    eval::{
        bucketing::{bucket_context, BucketParams},
        evaluator::EvalState,
        ErrorKind, Evaluator,
    },
    flags::{Segment, SegmentRule, SegmentTarget},
    Context, Kind,
};

impl Evaluator {
    /// Whether `context` is a member of `segment`.
    ///
    /// Explicit exclusion beats explicit inclusion, which beats big segment membership, which
    /// beats rules.
    pub(super) async fn segment_matches(
        &self,
        segment: &Segment,
        context: &Context,
        state: &mut EvalState,
    ) -> Result<bool, ErrorKind> {
        if state.visited_segments.contains(&segment.key) {
            log::warn!(target: "flagpole",
                       segment_key = segment.key.as_str();
                       "segment rules form a cycle");
            return Err(ErrorKind::MalformedFlag);
        }

        if let Some(member) = explicit_membership(segment, context) {
            return Ok(member);
        }

        if segment.unbounded {
            match self.big_segment_membership(segment, context, state).await {
                BigSegmentMembership::Member(member) => return Ok(member),
                BigSegmentMembership::NotMember => return Ok(false),
                BigSegmentMembership::Unknown => {}
            }
        }

        state.visited_segments.push(segment.key.clone());
        let matched = self.segment_rules_match(segment, context, state).await;
        state.visited_segments.pop();
        matched
    }

    async fn segment_rules_match(
        &self,
        segment: &Segment,
        context: &Context,
        state: &mut EvalState,
    ) -> Result<bool, ErrorKind> {
        for rule in &segment.rules {
            if self.segment_rule_matches(rule, segment, context, state).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn segment_rule_matches(
        &self,
        rule: &SegmentRule,
        segment: &Segment,
        context: &Context,
        state: &mut EvalState,
    ) -> Result<bool, ErrorKind> {
        for clause in &rule.clauses {
            if !self.clause_matches(clause, context, state).await? {
                return Ok(false);
            }
        }

        let Some(weight) = rule.weight else {
            return Ok(true);
        };
        let (bucket, _) = bucket_context(
            context,
            BucketParams {
                context_kind: rule.rollout_context_kind.as_ref(),
                bucket_by: rule.bucket_by.as_deref(),
                is_experiment: false,
                key: &segment.key,
                salt: &segment.salt,
                seed: None,
            },
        )?;
        Ok(bucket < f64::from(weight) / 100_000.0)
    }

    async fn big_segment_membership(
        &self,
        segment: &Segment,
        context: &Context,
        state: &mut EvalState,
    ) -> BigSegmentMembership {
        let kind = segment
            .unbounded_context_kind
            .clone()
            .unwrap_or_else(Kind::user);
        let Some(individual) = context.as_kind(&kind) else {
            return BigSegmentMembership::NotMember;
        };
        let (Some(generation), Some(manager)) = (segment.generation, &self.big_segments) else {
            state.merge_big_segments_status(BigSegmentsStatus::NotConfigured);
            return BigSegmentMembership::NotMember;
        };

        let key = individual.key();
        let membership = match state.big_segments_membership.get(key) {
            Some(membership) => membership.clone(),
            None => {
                let (membership, status) = manager.context_membership(key).await;
                state.merge_big_segments_status(status);
                state
                    .big_segments_membership
                    .insert(key.to_owned(), membership.clone());
                membership
            }
        };

        match membership.and_then(|m| m.get(&segment_ref(&segment.key, generation)).copied()) {
            Some(member) => BigSegmentMembership::Member(member),
            None => BigSegmentMembership::Unknown,
        }
    }
}

enum BigSegmentMembership {
    /// The store has an explicit entry for the segment.
    Member(bool),
    /// The segment cannot match this context.
    NotMember,
    /// No entry; segment rules decide.
    Unknown,
}

fn explicit_membership(segment: &Segment, context: &Context) -> Option<bool> {
    let user_key = context.as_kind(&Kind::user()).map(Context::key);

    if user_key.is_some_and(|key| segment.excluded.contains(key))
        || targets_contain(&segment.excluded_contexts, context)
    {
        return Some(false);
    }
    if user_key.is_some_and(|key| segment.included.contains(key))
        || targets_contain(&segment.included_contexts, context)
    {
        return Some(true);
    }
    None
}

fn targets_contain(targets: &[SegmentTarget], context: &Context) -> bool {
    targets.iter().any(|target| {
        context
            .as_kind(&target.context_kind)
            .is_some_and(|individual| target.values.contains(individual.key()))
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::explicit_membership;
    use crate::{flags::Segment, ContextBuilder, MultiContextBuilder};

    #[test]
    fn exclusion_beats_inclusion() {
        let segment: Segment = serde_json::from_value(json!({
            "key": "s",
            "included": ["a"],
            "excludedContexts": [{"contextKind": "user", "values": ["a"]}],
            "includedContexts": [{"contextKind": "org", "values": ["o"]}]
        }))
        .unwrap();

        let a = ContextBuilder::new("a").build().unwrap();
        assert_eq!(explicit_membership(&segment, &a), Some(false));

        let org = ContextBuilder::new("o").kind("org").build().unwrap();
        assert_eq!(explicit_membership(&segment, &org), Some(true));

        let multi = MultiContextBuilder::new()
            .add_context(ContextBuilder::new("b").build().unwrap())
            .add_context(ContextBuilder::new("x").kind("org").build().unwrap())
            .build()
            .unwrap();
        assert_eq!(explicit_membership(&segment, &multi), None);
    }
}
