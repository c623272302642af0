//! Evaluation hooks: user callbacks run before and after every flag evaluation.
//!
//! Hooks run in the order they were added for the `before` stage and in reverse order for the
//! `after` stage. Each stage of each hook runs inside its own error boundary: errors and panics
//! are logged and replaced with empty series data, and never reach the evaluation caller.
use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, RwLock},
};

use crate::{eval::Detail, Context};

/// Data passed from the `before` stage of a hook to its `after` stage.
pub type EvaluationSeriesData = HashMap<String, serde_json::Value>;

/// Error returned from a hook stage.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookMetadata {
    pub name: String,
}

/// Parameters of the evaluation a hook is invoked for.
#[derive(Debug, Clone)]
pub struct EvaluationSeriesContext {
    pub flag_key: String,
    pub context: Context,
    pub default_value: serde_json::Value,
    /// Client method that triggered the evaluation, e.g. `"bool_variation"`.
    pub method: &'static str,
}

pub trait Hook: Send + Sync {
    fn metadata(&self) -> HookMetadata;

    fn before_evaluation(
        &self,
        _series_context: &EvaluationSeriesContext,
        data: EvaluationSeriesData,
    ) -> Result<EvaluationSeriesData, HookError> {
        Ok(data)
    }

    fn after_evaluation(
        &self,
        _series_context: &EvaluationSeriesContext,
        data: EvaluationSeriesData,
        _detail: &Detail<serde_json::Value>,
    ) -> Result<EvaluationSeriesData, HookError> {
        Ok(data)
    }
}

const UNKNOWN_HOOK_NAME: &str = "unknown hook";

/// Ordered, growable list of hooks.
#[derive(Default)]
pub(crate) struct HookRunner {
    hooks: RwLock<Vec<Arc<dyn Hook>>>,
}

impl HookRunner {
    pub fn new(hooks: Vec<Arc<dyn Hook>>) -> HookRunner {
        HookRunner {
            hooks: RwLock::new(hooks),
        }
    }

    pub fn add_hook(&self, hook: Arc<dyn Hook>) {
        self.hooks
            .write()
            .expect("thread holding hooks lock should not panic")
            .push(hook);
    }

    /// Hooks registered at this moment. Hooks added during an evaluation apply to the next one.
    pub fn snapshot(&self) -> Vec<Arc<dyn Hook>> {
        self.hooks
            .read()
            .expect("thread holding hooks lock should not panic")
            .clone()
    }
}

/// Run `before_evaluation` of every hook, returning series data for each hook in order.
pub(crate) fn execute_before(
    hooks: &[Arc<dyn Hook>],
    series_context: &EvaluationSeriesContext,
) -> Vec<EvaluationSeriesData> {
    hooks
        .iter()
        .map(|hook| {
            run_stage(hook.as_ref(), "beforeEvaluation", series_context, || {
                hook.before_evaluation(series_context, EvaluationSeriesData::new())
            })
        })
        .collect()
}

/// Run `after_evaluation` of every hook in reverse order.
pub(crate) fn execute_after(
    hooks: &[Arc<dyn Hook>],
    series_context: &EvaluationSeriesContext,
    data: Vec<EvaluationSeriesData>,
    detail: &Detail<serde_json::Value>,
) {
    for (hook, data) in hooks.iter().zip(data).rev() {
        run_stage(hook.as_ref(), "afterEvaluation", series_context, || {
            hook.after_evaluation(series_context, data, detail)
        });
    }
}

fn run_stage(
    hook: &dyn Hook,
    stage: &str,
    series_context: &EvaluationSeriesContext,
    f: impl FnOnce() -> Result<EvaluationSeriesData, HookError>,
) -> EvaluationSeriesData {
    let error = match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(data)) => return data,
        Ok(Err(err)) => err.to_string(),
        Err(_) => "hook panicked".to_owned(),
    };
    let hook_name = hook_name(hook);
    log::error!(target: "flagpole",
                hook = hook_name.as_str(),
                stage,
                flag_key = series_context.flag_key.as_str();
                "an error was encountered in {stage:?} of the {hook_name:?} hook: {error}");
    EvaluationSeriesData::new()
}

fn hook_name(hook: &dyn Hook) -> String {
    match catch_unwind(AssertUnwindSafe(|| hook.metadata())) {
        Ok(metadata) => metadata.name,
        Err(_) => {
            log::error!(target: "flagpole",
                        "exception thrown getting metadata for hook, unable to get hook name");
            UNKNOWN_HOOK_NAME.to_owned()
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::{
        execute_after, execute_before, hook_name, EvaluationSeriesContext, EvaluationSeriesData,
        Hook, HookError, HookMetadata,
    };
    use crate::{
        eval::{Detail, Reason},
        ContextBuilder,
    };

    /// Hook recording every stage it sees.
    #[derive(Default)]
    pub(crate) struct RecordingHook {
        pub name: String,
        pub calls: Mutex<Vec<(String, String, EvaluationSeriesData)>>,
        pub fail_before: bool,
        pub panic_after: bool,
        pub panic_metadata: bool,
    }

    impl RecordingHook {
        pub fn named(name: &str) -> RecordingHook {
            RecordingHook {
                name: name.to_owned(),
                ..Default::default()
            }
        }
    }

    impl Hook for RecordingHook {
        fn metadata(&self) -> HookMetadata {
            if self.panic_metadata {
                panic!("no metadata");
            }
            HookMetadata {
                name: self.name.clone(),
            }
        }

        fn before_evaluation(
            &self,
            series_context: &EvaluationSeriesContext,
            mut data: EvaluationSeriesData,
        ) -> Result<EvaluationSeriesData, HookError> {
            self.calls.lock().unwrap().push((
                "before".into(),
                series_context.flag_key.clone(),
                data.clone(),
            ));
            if self.fail_before {
                return Err("before failed".into());
            }
            data.insert("from".into(), json!(self.name));
            Ok(data)
        }

        fn after_evaluation(
            &self,
            series_context: &EvaluationSeriesContext,
            data: EvaluationSeriesData,
            _detail: &Detail<serde_json::Value>,
        ) -> Result<EvaluationSeriesData, HookError> {
            self.calls.lock().unwrap().push((
                "after".into(),
                series_context.flag_key.clone(),
                data.clone(),
            ));
            if self.panic_after {
                panic!("after panicked");
            }
            Ok(data)
        }
    }

    fn series_context() -> EvaluationSeriesContext {
        EvaluationSeriesContext {
            flag_key: "flag".into(),
            context: ContextBuilder::new("u").build().unwrap(),
            default_value: json!(false),
            method: "bool_variation",
        }
    }

    fn detail() -> Detail<serde_json::Value> {
        Detail {
            value: Some(json!(true)),
            variation_index: Some(0),
            reason: Reason::fallthrough(false),
        }
    }

    #[test]
    fn passes_data_from_before_to_after() {
        let a = Arc::new(RecordingHook::named("a"));
        let b = Arc::new(RecordingHook::named("b"));
        let hooks: Vec<Arc<dyn Hook>> = vec![a.clone(), b.clone()];

        let data = execute_before(&hooks, &series_context());
        execute_after(&hooks, &series_context(), data, &detail());

        let a_calls = a.calls.lock().unwrap();
        assert_eq!(a_calls[1].0, "after");
        assert_eq!(a_calls[1].2.get("from"), Some(&json!("a")));
        let b_calls = b.calls.lock().unwrap();
        assert_eq!(b_calls[1].2.get("from"), Some(&json!("b")));
    }

    #[test]
    fn errors_are_isolated_per_stage() {
        let failing = Arc::new(RecordingHook {
            fail_before: true,
            panic_after: true,
            ..RecordingHook::named("failing")
        });
        let ok = Arc::new(RecordingHook::named("ok"));
        let hooks: Vec<Arc<dyn Hook>> = vec![failing.clone(), ok.clone()];

        let data = execute_before(&hooks, &series_context());
        assert!(data[0].is_empty());
        assert_eq!(data[1].get("from"), Some(&json!("ok")));

        execute_after(&hooks, &series_context(), data, &detail());
        assert_eq!(ok.calls.lock().unwrap().len(), 2);
        assert_eq!(failing.calls.lock().unwrap().len(), 2);
    }

    #[test]
    fn unknown_hook_name_when_metadata_fails() {
        let hook = RecordingHook {
            panic_metadata: true,
            ..RecordingHook::named("x")
        };
        assert_eq!(hook_name(&hook), "unknown hook");
        assert_eq!(hook_name(&RecordingHook::named("x")), "x");
    }
}
