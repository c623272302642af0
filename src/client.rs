use std::sync::Arc;

use serde_json::Value;

use crate::{
    big_segments::{BigSegmentStoreStatus, BigSegmentsManager},
    diagnostics::{DiagnosticConfiguration, DiagnosticsManager},
    eval::{Detail, ErrorKind, Evaluator, Reason},
    events::{
        is_tracking_forced, EventFactory, EventProcessor, EventProcessorConfig, EventSender,
        HttpEventSender, HttpEventSenderConfig, InputEvent,
    },
    flags::Flag,
    flags_state::{FlagsState, FlagsStateBuilder, FlagsStateOptions},
    hooks::{execute_after, execute_before, EvaluationSeriesContext, Hook, HookRunner},
    migrations::{MigrationOpTracker, Stage},
    store::{FeatureStore, InMemoryFeatureStore},
    Config, Context, Error, Result,
};

/// A client evaluating feature flags and recording analytics events.
///
/// In order to create a client instance, first create [`Config`].
///
/// Flag data is read from the client's [`FeatureStore`]. Update sources (streaming, polling or a
/// relay daemon) write to the same store, see [`Client::feature_store`].
///
/// # Examples
/// ```
/// # use flagpole::{Client, Config};
/// let client = Client::new(Config::from_sdk_key("sdk-key").offline(true)).unwrap();
/// assert!(client.is_offline());
/// ```
pub struct Client {
    offline: bool,
    store: Arc<dyn FeatureStore>,
    evaluator: Evaluator,
    big_segments: Option<Arc<BigSegmentsManager>>,
    event_processor: Option<EventProcessor>,
    diagnostics: Option<Arc<DiagnosticsManager>>,
    hooks: HookRunner,
}

type TypeCheck = fn(&Value) -> bool;

impl Client {
    /// Create a new `Client` using the specified configuration.
    ///
    /// Unless the client is offline or events are disabled, this starts the event processor and
    /// must be called within a tokio runtime.
    pub fn new(config: Config) -> Result<Client> {
        if config.sdk_key.is_empty() && !config.offline {
            return Err(Error::MissingSdkKey);
        }

        let store: Arc<dyn FeatureStore> = match &config.feature_store {
            Some(store) => store.clone(),
            None => Arc::new(InMemoryFeatureStore::new()),
        };
        let big_segments = BigSegmentsManager::new(config.big_segments.clone()).map(Arc::new);

        let mut diagnostics = None;
        let mut event_processor = None;
        if !config.offline && config.send_events {
            let sender: Arc<dyn EventSender> = match &config.event_sender {
                Some(sender) => sender.clone(),
                None => Arc::new(HttpEventSender::new(HttpEventSenderConfig {
                    events_uri: config.events_uri.clone(),
                    sdk_key: config.sdk_key.clone(),
                    user_agent: config.sdk.user_agent(),
                    timeout: config.timeout,
                })?),
            };
            if !config.diagnostic_opt_out {
                diagnostics = Some(Arc::new(DiagnosticsManager::new(
                    &config.sdk_key,
                    config.sdk.clone(),
                    config.platform.clone(),
                    DiagnosticConfiguration::new(&config, store.description()),
                )));
            }
            event_processor = Some(EventProcessor::new(
                EventProcessorConfig::from(&config),
                sender,
                diagnostics.clone(),
            ));
        }

        log::debug!(target: "flagpole",
                    offline = config.offline,
                    send_events = config.send_events,
                    big_segments = big_segments.is_some();
                    "created client");

        Ok(Client {
            offline: config.offline,
            evaluator: Evaluator::new(store.clone(), big_segments.clone()),
            store,
            big_segments,
            event_processor,
            diagnostics,
            hooks: HookRunner::new(config.hooks),
        })
    }

    /// Whether flag data is available. An offline client is always initialized.
    pub fn initialized(&self) -> bool {
        self.offline || self.store.initialized()
    }

    pub fn is_offline(&self) -> bool {
        self.offline
    }

    /// Store the client evaluates flags from. Update sources write flag data here.
    pub fn feature_store(&self) -> &Arc<dyn FeatureStore> {
        &self.store
    }

    /// Diagnostics recorder, if diagnostics are enabled. Update sources report stream
    /// initialization attempts here.
    pub fn diagnostics(&self) -> Option<&DiagnosticsManager> {
        self.diagnostics.as_deref()
    }

    /// Register a hook for all subsequent evaluations.
    pub fn add_hook(&self, hook: Arc<dyn Hook>) {
        self.hooks.add_hook(hook);
    }

    /// Evaluate a flag, returning `default` when the flag cannot be evaluated.
    pub async fn variation(&self, context: &Context, flag_key: &str, default: Value) -> Value {
        let (detail, _) = self
            .evaluate_with_hooks(
                context,
                flag_key,
                default.clone(),
                EventFactory::new(false),
                "variation",
                None,
            )
            .await;
        detail.value.unwrap_or(default)
    }

    /// Like [`Client::variation`], also returning the variation index and the reason.
    pub async fn variation_detail(
        &self,
        context: &Context,
        flag_key: &str,
        default: Value,
    ) -> Detail<Value> {
        let (detail, _) = self
            .evaluate_with_hooks(
                context,
                flag_key,
                default,
                EventFactory::new(true),
                "variation_detail",
                None,
            )
            .await;
        detail
    }

    pub async fn bool_variation(&self, context: &Context, flag_key: &str, default: bool) -> bool {
        self.bool_detail(context, flag_key, default, EventFactory::new(false), "bool_variation")
            .await
            .value
            .unwrap_or(default)
    }

    pub async fn bool_variation_detail(
        &self,
        context: &Context,
        flag_key: &str,
        default: bool,
    ) -> Detail<bool> {
        self.bool_detail(
            context,
            flag_key,
            default,
            EventFactory::new(true),
            "bool_variation_detail",
        )
        .await
    }

    async fn bool_detail(
        &self,
        context: &Context,
        flag_key: &str,
        default: bool,
        factory: EventFactory,
        method: &'static str,
    ) -> Detail<bool> {
        let (detail, _) = self
            .evaluate_with_hooks(
                context,
                flag_key,
                Value::Bool(default),
                factory,
                method,
                Some(Value::is_boolean),
            )
            .await;
        detail.try_map(|v| v.as_bool()).or(default)
    }

    /// Evaluate a numeric flag. Floating point values are truncated.
    pub async fn int_variation(&self, context: &Context, flag_key: &str, default: i64) -> i64 {
        self.int_detail(context, flag_key, default, EventFactory::new(false), "int_variation")
            .await
            .value
            .unwrap_or(default)
    }

    pub async fn int_variation_detail(
        &self,
        context: &Context,
        flag_key: &str,
        default: i64,
    ) -> Detail<i64> {
        self.int_detail(context, flag_key, default, EventFactory::new(true), "int_variation_detail")
            .await
    }

    async fn int_detail(
        &self,
        context: &Context,
        flag_key: &str,
        default: i64,
        factory: EventFactory,
        method: &'static str,
    ) -> Detail<i64> {
        let (detail, _) = self
            .evaluate_with_hooks(
                context,
                flag_key,
                Value::from(default),
                factory,
                method,
                Some(Value::is_number),
            )
            .await;
        detail
            .try_map(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
            .or(default)
    }

    pub async fn float_variation(&self, context: &Context, flag_key: &str, default: f64) -> f64 {
        self.float_detail(context, flag_key, default, EventFactory::new(false), "float_variation")
            .await
            .value
            .unwrap_or(default)
    }

    pub async fn float_variation_detail(
        &self,
        context: &Context,
        flag_key: &str,
        default: f64,
    ) -> Detail<f64> {
        self.float_detail(
            context,
            flag_key,
            default,
            EventFactory::new(true),
            "float_variation_detail",
        )
        .await
    }

    async fn float_detail(
        &self,
        context: &Context,
        flag_key: &str,
        default: f64,
        factory: EventFactory,
        method: &'static str,
    ) -> Detail<f64> {
        let (detail, _) = self
            .evaluate_with_hooks(
                context,
                flag_key,
                Value::from(default),
                factory,
                method,
                Some(Value::is_number),
            )
            .await;
        detail.try_map(|v| v.as_f64()).or(default)
    }

    pub async fn str_variation(&self, context: &Context, flag_key: &str, default: &str) -> String {
        self.str_detail(context, flag_key, default, EventFactory::new(false), "str_variation")
            .await
            .value
            .unwrap_or_else(|| default.to_owned())
    }

    pub async fn str_variation_detail(
        &self,
        context: &Context,
        flag_key: &str,
        default: &str,
    ) -> Detail<String> {
        self.str_detail(context, flag_key, default, EventFactory::new(true), "str_variation_detail")
            .await
    }

    async fn str_detail(
        &self,
        context: &Context,
        flag_key: &str,
        default: &str,
        factory: EventFactory,
        method: &'static str,
    ) -> Detail<String> {
        let (detail, _) = self
            .evaluate_with_hooks(
                context,
                flag_key,
                Value::from(default),
                factory,
                method,
                Some(Value::is_string),
            )
            .await;
        detail
            .try_map(|v| match v {
                Value::String(s) => Some(s),
                _ => None,
            })
            .or(default.to_owned())
    }

    /// Evaluate a flag of any JSON type.
    pub async fn json_variation(&self, context: &Context, flag_key: &str, default: Value) -> Value {
        let (detail, _) = self
            .evaluate_with_hooks(
                context,
                flag_key,
                default.clone(),
                EventFactory::new(false),
                "json_variation",
                None,
            )
            .await;
        detail.value.unwrap_or(default)
    }

    pub async fn json_variation_detail(
        &self,
        context: &Context,
        flag_key: &str,
        default: Value,
    ) -> Detail<Value> {
        let (detail, _) = self
            .evaluate_with_hooks(
                context,
                flag_key,
                default,
                EventFactory::new(true),
                "json_variation_detail",
                None,
            )
            .await;
        detail
    }

    /// Evaluate a migration flag. Returns the stage and a tracker for recording the outcome of
    /// the migration operation, see [`Client::track_migration_op`].
    ///
    /// A flag value that is not a known stage yields `default`.
    pub async fn migration_variation(
        &self,
        context: &Context,
        flag_key: &str,
        default: Stage,
    ) -> (Stage, MigrationOpTracker) {
        let (detail, flag) = self
            .evaluate_with_hooks(
                context,
                flag_key,
                Value::from(default.as_str()),
                EventFactory::new(true),
                "migration_variation",
                None,
            )
            .await;

        let check_ratio = flag
            .as_ref()
            .and_then(|f| f.migration.as_ref())
            .and_then(|m| m.check_ratio);
        let sampling_ratio = flag.as_ref().and_then(|f| f.sampling_ratio);
        let version = flag.as_ref().map(|f| f.version);

        let stage = detail
            .value
            .as_ref()
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<Stage>().ok());
        match stage {
            Some(stage) => {
                let tracker = MigrationOpTracker::new(
                    flag_key,
                    context,
                    default,
                    stage,
                    detail.reason,
                    detail.variation_index,
                    version,
                    check_ratio,
                    sampling_ratio,
                );
                (stage, tracker)
            }
            None => {
                log::warn!(target: "flagpole",
                           flag_key;
                           "unrecognized migration stage, returning default value");
                let tracker = MigrationOpTracker::new(
                    flag_key,
                    context,
                    default,
                    default,
                    Reason::error(ErrorKind::WrongType),
                    None,
                    version,
                    check_ratio,
                    sampling_ratio,
                );
                (default, tracker)
            }
        }
    }

    /// Values and metadata of all flags for `context`, e.g. for bootstrapping a client-side SDK.
    /// No analytics events are recorded.
    pub async fn all_flags_state(
        &self,
        context: &Context,
        options: FlagsStateOptions,
    ) -> FlagsState {
        if self.offline {
            log::info!(target: "flagpole",
                       "all_flags_state() called in offline mode, returning empty state");
            return FlagsState::invalid();
        }
        if !self.store.initialized() {
            log::warn!(target: "flagpole",
                       "all_flags_state() called before the feature store was initialized, \
                        returning empty state");
            return FlagsState::invalid();
        }

        let mut builder = FlagsStateBuilder::new(true, options);
        for flag in self.store.all_flags().into_values() {
            if options.is_client_side_only() && !flag.is_client_side() {
                continue;
            }
            let result = self.evaluator.evaluate(&flag, context, None).await;
            let detail = result.detail;
            if let Some(error_kind) = detail.reason.error_kind() {
                log::warn!(target: "flagpole",
                           flag_key = flag.key.as_str(),
                           error_kind:?;
                           "error while evaluating all flags");
            }
            let require_experiment_data = is_tracking_forced(&flag, &detail.reason);
            builder.add_flag(
                &flag,
                detail.value.unwrap_or(Value::Null),
                detail.variation_index,
                detail.reason,
                flag.track_events || require_experiment_data,
                require_experiment_data,
            );
        }
        builder.build()
    }

    /// Report that a context exists, sending its attributes to the events service.
    pub fn identify(&self, context: &Context) {
        let event = EventFactory::new(false).identify_event(context);
        self.send_event(InputEvent::Identify(event));
    }

    /// Record a custom event.
    pub fn track_event(&self, context: &Context, key: &str) {
        self.track(context, key, None, None);
    }

    /// Record a custom event with data attached.
    pub fn track_data(&self, context: &Context, key: &str, data: Value) {
        self.track(context, key, Some(data), None);
    }

    /// Record a custom event with a numeric value for experimentation metrics.
    pub fn track_metric(&self, context: &Context, key: &str, value: f64, data: Option<Value>) {
        self.track(context, key, data, Some(value));
    }

    fn track(&self, context: &Context, key: &str, data: Option<Value>, metric_value: Option<f64>) {
        let event = EventFactory::new(false).custom_event(key, context, data, metric_value);
        self.send_event(InputEvent::Custom(event));
    }

    /// Record the outcome of a migration operation. Invalid trackers are logged and dropped.
    pub fn track_migration_op(&self, tracker: &MigrationOpTracker) {
        match tracker.build() {
            Ok(event) => self.send_event(InputEvent::MigrationOp(event)),
            Err(err) => {
                log::error!(target: "flagpole", "failed to create migration op event: {err}")
            }
        }
    }

    /// Deliver pending events.
    pub async fn flush(&self) -> Result<()> {
        match &self.event_processor {
            Some(event_processor) => event_processor.flush().await,
            None => Ok(()),
        }
    }

    /// Flush pending events and stop sending events. Evaluation keeps working.
    pub async fn close(&self) {
        if let Some(event_processor) = &self.event_processor {
            event_processor.close().await;
        }
    }

    /// Status of the big segment store, or `None` if big segments are not configured.
    pub async fn big_segment_store_status(&self) -> Option<BigSegmentStoreStatus> {
        match &self.big_segments {
            Some(manager) => Some(manager.status().await),
            None => None,
        }
    }

    fn send_event(&self, event: InputEvent) {
        if let Some(event_processor) = &self.event_processor {
            event_processor.send_event(event);
        }
    }

    async fn evaluate_with_hooks(
        &self,
        context: &Context,
        flag_key: &str,
        default: Value,
        factory: EventFactory,
        method: &'static str,
        type_check: Option<TypeCheck>,
    ) -> (Detail<Value>, Option<Arc<Flag>>) {
        let hooks = self.hooks.snapshot();
        if hooks.is_empty() {
            return self
                .evaluate(context, flag_key, default, factory, type_check)
                .await;
        }

        let series_context = EvaluationSeriesContext {
            flag_key: flag_key.to_owned(),
            context: context.clone(),
            default_value: default.clone(),
            method,
        };
        let data = execute_before(&hooks, &series_context);
        let result = self
            .evaluate(context, flag_key, default, factory, type_check)
            .await;
        execute_after(&hooks, &series_context, data, &result.0);
        result
    }

    /// Evaluate a flag and record its events. The returned detail always has a value: the
    /// caller's default is used when evaluation produced none.
    async fn evaluate(
        &self,
        context: &Context,
        flag_key: &str,
        default: Value,
        factory: EventFactory,
        type_check: Option<TypeCheck>,
    ) -> (Detail<Value>, Option<Arc<Flag>>) {
        if self.offline {
            log::debug!(target: "flagpole",
                        flag_key;
                        "variation called in offline mode, returning default value");
            return (Detail::err(ErrorKind::ClientNotReady).or(default), None);
        }
        if !self.store.initialized() {
            log::warn!(target: "flagpole",
                       flag_key;
                       "variation called before the feature store was initialized, \
                        returning default value");
            return (Detail::err(ErrorKind::ClientNotReady).or(default), None);
        }

        let Some(flag) = self.store.flag(flag_key) else {
            log::warn!(target: "flagpole",
                       flag_key;
                       "unknown feature flag, returning default value");
            let event = factory.unknown_flag_event(flag_key, context, default.clone());
            self.send_event(InputEvent::Feature(event));
            return (Detail::err(ErrorKind::FlagNotFound).or(default), None);
        };

        let result = self.evaluator.evaluate(&flag, context, Some(&factory)).await;
        let mut detail = result.detail;
        if detail.variation_index.is_none() {
            detail.value = None;
        }
        let mut detail = detail.or(default.clone());

        let wrong_type =
            type_check.is_some_and(|check| !detail.value.as_ref().is_some_and(check));
        if wrong_type {
            log::warn!(target: "flagpole",
                       flag_key;
                       "flag value does not have the requested type, returning default value");
            detail = Detail::err(ErrorKind::WrongType).or(default.clone());
        } else {
            for event in result.prerequisite_events {
                self.send_event(InputEvent::Feature(event));
            }
        }
        let event = factory.eval_event(&flag, context, &detail, Some(default), None);
        self.send_event(InputEvent::Feature(event));

        (detail, Some(flag))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{json, Value};

    use super::Client;
    use crate::{
        eval::{ErrorKind, Reason},
        events::MockEventSender,
        flags::Flag,
        flags_state::FlagsStateOptions,
        hooks::tests::RecordingHook,
        migrations::{MigrationOp, Origin, Stage},
        store::{AllData, FeatureStore, InMemoryFeatureStore},
        Config, Context, ContextBuilder, Error,
    };

    fn flag(value: Value) -> Flag {
        serde_json::from_value(value).unwrap()
    }

    fn store(flags: Vec<Flag>) -> Arc<InMemoryFeatureStore> {
        let store = Arc::new(InMemoryFeatureStore::new());
        store.init(AllData {
            flags: flags.into_iter().map(|f| (f.key.clone(), f)).collect(),
            ..AllData::default()
        });
        store
    }

    fn string_flag(key: &str) -> Flag {
        flag(json!({
            "key": key,
            "version": 3,
            "on": true,
            "fallthrough": {"variation": 1},
            "offVariation": 0,
            "variations": ["off-value", "on-value"]
        }))
    }

    fn client(store: Arc<InMemoryFeatureStore>) -> (Client, Arc<MockEventSender>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let sender = Arc::new(MockEventSender::new());
        let client = Client::new(
            Config::from_sdk_key("sdk-key")
                .feature_store(store)
                .event_sender(sender.clone())
                .diagnostic_opt_out(true),
        )
        .unwrap();
        (client, sender)
    }

    fn user() -> Context {
        ContextBuilder::new("u").build().unwrap()
    }

    fn kinds(events: &[Value]) -> Vec<&str> {
        events.iter().map(|e| e["kind"].as_str().unwrap()).collect()
    }

    #[test]
    fn sdk_key_required_unless_offline() {
        assert!(matches!(
            Client::new(Config::from_sdk_key("")),
            Err(Error::MissingSdkKey)
        ));
        assert!(Client::new(Config::from_sdk_key("").offline(true)).is_ok());
    }

    #[tokio::test]
    async fn offline_client_returns_defaults() {
        let client = Client::new(
            Config::from_sdk_key("sdk-key")
                .offline(true)
                .feature_store(store(vec![string_flag("flag")])),
        )
        .unwrap();

        let detail = client
            .variation_detail(&user(), "flag", json!("default"))
            .await;
        assert_eq!(detail.value, Some(json!("default")));
        assert_eq!(detail.reason, Reason::error(ErrorKind::ClientNotReady));
        assert!(client.initialized());
        assert!(client.flush().await.is_ok());

        let state = client
            .all_flags_state(&user(), FlagsStateOptions::new())
            .await;
        assert!(!state.is_valid());
    }

    #[tokio::test]
    async fn uninitialized_store() {
        let (client, sender) = client(Arc::new(InMemoryFeatureStore::new()));
        assert!(!client.initialized());
        let detail = client.str_variation_detail(&user(), "flag", "d").await;
        assert_eq!(detail.value.as_deref(), Some("d"));
        assert_eq!(detail.reason, Reason::error(ErrorKind::ClientNotReady));

        client.flush().await.unwrap();
        assert_eq!(sender.calls(), 0);
    }

    #[tokio::test]
    async fn evaluates_and_summarizes() {
        let (client, sender) = client(store(vec![string_flag("flag")]));
        assert_eq!(client.str_variation(&user(), "flag", "d").await, "on-value");
        assert_eq!(client.str_variation(&user(), "flag", "d").await, "on-value");
        client.flush().await.unwrap();

        let events = sender.analytics_events();
        assert_eq!(kinds(&events), ["index", "summary"]);
        assert_eq!(
            events[1]["features"]["flag"]["counters"],
            json!([{"variation": 1, "version": 3, "value": "on-value", "count": 2}])
        );
        assert_eq!(events[1]["features"]["flag"]["default"], "d");
    }

    #[tokio::test]
    async fn unknown_flag() {
        let (client, sender) = client(store(vec![]));
        let detail = client.bool_variation_detail(&user(), "missing", true).await;
        assert_eq!(detail.value, Some(true));
        assert_eq!(detail.reason, Reason::error(ErrorKind::FlagNotFound));
        client.flush().await.unwrap();

        let events = sender.analytics_events();
        assert_eq!(kinds(&events), ["index", "summary"]);
        assert_eq!(
            events[1]["features"]["missing"]["counters"],
            json!([{"value": true, "count": 1, "unknown": true}])
        );
    }

    #[tokio::test]
    async fn wrong_type_returns_default() {
        let (client, sender) = client(store(vec![string_flag("flag")]));
        let detail = client.bool_variation_detail(&user(), "flag", false).await;
        assert_eq!(detail.value, Some(false));
        assert_eq!(detail.variation_index, None);
        assert_eq!(detail.reason, Reason::error(ErrorKind::WrongType));
        assert_eq!(client.int_variation(&user(), "flag", 7).await, 7);
        client.flush().await.unwrap();

        let counters = &sender.analytics_events()[1]["features"]["flag"]["counters"];
        assert_eq!(counters[0]["version"], 3);
        assert!(counters[0].get("variation").is_none());
    }

    #[tokio::test]
    async fn numeric_variations() {
        let mut numeric = string_flag("number");
        numeric.variations = vec![json!(0), json!(2.75)];
        let (client, _) = client(store(vec![numeric]));
        assert_eq!(client.int_variation(&user(), "number", 0).await, 2);
        assert_eq!(client.float_variation(&user(), "number", 0.0).await, 2.75);
        assert_eq!(client.json_variation(&user(), "number", json!(null)).await, json!(2.75));
    }

    #[tokio::test]
    async fn off_flag_without_off_variation_returns_default() {
        let mut off = string_flag("flag");
        off.on = false;
        off.off_variation = None;
        let (client, _) = client(store(vec![off]));
        let detail = client.str_variation_detail(&user(), "flag", "d").await;
        assert_eq!(detail.value.as_deref(), Some("d"));
        assert_eq!(detail.variation_index, None);
        assert_eq!(detail.reason, Reason::off());
    }

    #[tokio::test]
    async fn prerequisite_events_precede_evaluation_event() {
        let mut main = string_flag("main");
        main.track_events = true;
        main.prerequisites = vec![crate::flags::Prerequisite {
            key: "pre".into(),
            variation: 1,
        }];
        let mut pre = string_flag("pre");
        pre.track_events = true;
        let (client, sender) = client(store(vec![main, pre]));

        client.variation(&user(), "main", json!("d")).await;
        client.flush().await.unwrap();

        let events = sender.analytics_events();
        assert_eq!(kinds(&events), ["index", "feature", "feature", "summary"]);
        assert_eq!(events[1]["key"], "pre");
        assert_eq!(events[1]["prereqOf"], "main");
        assert_eq!(events[2]["key"], "main");
        assert_eq!(events[2]["default"], "d");
    }

    #[tokio::test]
    async fn wrong_type_sends_only_evaluation_event() {
        let mut main = string_flag("main");
        main.track_events = true;
        main.prerequisites = vec![crate::flags::Prerequisite {
            key: "pre".into(),
            variation: 1,
        }];
        let mut pre = string_flag("pre");
        pre.track_events = true;
        let (client, sender) = client(store(vec![main, pre]));

        let detail = client.bool_variation_detail(&user(), "main", false).await;
        assert_eq!(detail.reason, Reason::error(ErrorKind::WrongType));
        client.flush().await.unwrap();

        let events = sender.analytics_events();
        assert_eq!(kinds(&events), ["index", "feature", "summary"]);
        assert_eq!(events[1]["key"], "main");
        assert_eq!(
            events[1]["reason"],
            json!({"kind": "ERROR", "errorKind": "WRONG_TYPE"})
        );
        assert!(events[2]["features"].get("pre").is_none());
    }

    #[tokio::test]
    async fn detail_events_include_reason() {
        let mut tracked = string_flag("flag");
        tracked.track_events = true;
        let (client, sender) = client(store(vec![tracked]));
        client.variation_detail(&user(), "flag", json!("d")).await;
        client.variation(&user(), "flag", json!("d")).await;
        client.flush().await.unwrap();

        let events = sender.analytics_events();
        assert_eq!(events[1]["reason"], json!({"kind": "FALLTHROUGH"}));
        assert!(events[2].get("reason").is_none());
    }

    #[tokio::test]
    async fn hooks_see_every_evaluation() {
        let (client, _) = client(store(vec![string_flag("flag")]));
        let hook = Arc::new(RecordingHook::named("recorder"));
        client.add_hook(hook.clone());

        client.str_variation(&user(), "flag", "d").await;
        client.bool_variation(&user(), "missing", false).await;

        let calls = hook.calls.lock().unwrap();
        let stages: Vec<_> = calls
            .iter()
            .map(|(stage, key, _)| (stage.as_str(), key.as_str()))
            .collect();
        assert_eq!(
            stages,
            [
                ("before", "flag"),
                ("after", "flag"),
                ("before", "missing"),
                ("after", "missing")
            ]
        );
    }

    #[tokio::test]
    async fn identify_and_custom_events() {
        let (client, sender) = client(store(vec![]));
        client.identify(&user());
        client.track_event(&user(), "viewed");
        client.track_metric(&user(), "spent", 9.5, Some(json!({"currency": "EUR"})));
        client.flush().await.unwrap();

        let events = sender.analytics_events();
        assert_eq!(kinds(&events), ["identify", "custom", "custom"]);
        assert_eq!(events[2]["metricValue"], 9.5);
        assert_eq!(events[2]["data"], json!({"currency": "EUR"}));
    }

    #[tokio::test]
    async fn all_flags_state() {
        let mut client_side = string_flag("client-side");
        client_side.client_side = true;
        let (client, sender) = client(store(vec![string_flag("server-side"), client_side]));

        let state = client
            .all_flags_state(&user(), FlagsStateOptions::new())
            .await;
        assert!(state.is_valid());
        assert_eq!(state.flag_value("server-side"), Some(&json!("on-value")));
        assert_eq!(state.values().len(), 2);

        let state = client
            .all_flags_state(&user(), FlagsStateOptions::new().client_side_only(true))
            .await;
        assert_eq!(state.values().len(), 1);
        assert!(state.flag_value("client-side").is_some());

        client.flush().await.unwrap();
        assert_eq!(sender.calls(), 0);
    }

    #[tokio::test]
    async fn all_flags_state_before_initialization() {
        let (client, _) = client(Arc::new(InMemoryFeatureStore::new()));
        let state = client
            .all_flags_state(&user(), FlagsStateOptions::new())
            .await;
        assert!(!state.is_valid());
    }

    #[tokio::test]
    async fn migration_variation_and_tracking() {
        let migration = flag(json!({
            "key": "migration",
            "version": 2,
            "on": true,
            "fallthrough": {"variation": 1},
            "variations": ["off", "shadow", "not-a-stage"],
            "migration": {"checkRatio": 1}
        }));
        let mut broken = migration.clone();
        broken.key = "broken".into();
        broken.fallthrough = 2.into();
        let (client, sender) = client(store(vec![migration, broken]));

        let (stage, mut tracker) = client
            .migration_variation(&user(), "migration", Stage::Off)
            .await;
        assert_eq!(stage, Stage::Shadow);
        tracker.operation(MigrationOp::Read);
        tracker.invoked(Origin::Old);
        tracker.invoked(Origin::New);
        tracker.consistency(|| true);
        client.track_migration_op(&tracker);

        let (stage, _) = client
            .migration_variation(&user(), "broken", Stage::Live)
            .await;
        assert_eq!(stage, Stage::Live);

        client.flush().await.unwrap();
        let events = sender.analytics_events();
        let migration_op = events
            .iter()
            .find(|e| e["kind"] == "migration_op")
            .unwrap();
        assert_eq!(migration_op["operation"], "read");
        assert_eq!(migration_op["contextKeys"], json!({"user": "u"}));
        assert_eq!(migration_op["evaluation"]["value"], "shadow");
        assert_eq!(migration_op["evaluation"]["default"], "off");
        assert_eq!(migration_op["measurements"][1]["key"], "consistent");
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (client, sender) = client(store(vec![string_flag("flag")]));
        client.variation(&user(), "flag", json!("d")).await;
        client.close().await;
        client.close().await;
        assert_eq!(sender.calls(), 1);
        assert!(matches!(client.flush().await, Err(Error::EventProcessorClosed)));
        assert_eq!(
            client.variation(&user(), "flag", json!("d")).await,
            json!("on-value")
        );
    }

    #[tokio::test]
    async fn no_events_when_disabled() {
        let sender = Arc::new(MockEventSender::new());
        let client = Client::new(
            Config::from_sdk_key("sdk-key")
                .feature_store(store(vec![string_flag("flag")]))
                .event_sender(sender.clone())
                .send_events(false),
        )
        .unwrap();
        client.variation(&user(), "flag", json!("d")).await;
        client.flush().await.unwrap();
        assert_eq!(sender.calls(), 0);
        assert!(client.feature_store().initialized());
    }
}
