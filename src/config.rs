use std::{sync::Arc, time::Duration};

use crate::{
    big_segments::{BigSegmentStore, BigSegmentsConfig},
    events::EventSender,
    hooks::Hook,
    platform::{PlatformData, SdkData},
    store::FeatureStore,
    Client, Reference, Result,
};

/// Configuration for [`Client`].
///
/// # Examples
/// ```
/// # use flagpole::Config;
/// # use std::time::Duration;
/// let config = Config::from_sdk_key("sdk-key")
///     .flush_interval(Duration::from_secs(10))
///     .private_attribute("email");
/// ```
#[derive(Clone)]
pub struct Config {
    pub(crate) sdk_key: String,
    pub(crate) offline: bool,
    pub(crate) base_uri: String,
    pub(crate) stream_uri: String,
    pub(crate) events_uri: String,
    pub(crate) send_events: bool,
    pub(crate) events_capacity: usize,
    pub(crate) flush_interval: Duration,
    pub(crate) context_keys_capacity: usize,
    pub(crate) context_keys_flush_interval: Duration,
    pub(crate) all_attributes_private: bool,
    pub(crate) private_attributes: Vec<Reference>,
    pub(crate) diagnostic_opt_out: bool,
    pub(crate) diagnostic_recording_interval: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) timeout: Duration,
    pub(crate) stream: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) reconnect_time: Duration,
    pub(crate) use_relay_daemon: bool,
    pub(crate) feature_store: Option<Arc<dyn FeatureStore>>,
    pub(crate) event_sender: Option<Arc<dyn EventSender>>,
    pub(crate) big_segments: BigSegmentsConfig,
    pub(crate) hooks: Vec<Arc<dyn Hook>>,
    pub(crate) sdk: SdkData,
    pub(crate) platform: PlatformData,
}

impl Config {
    /// Create a default configuration using the specified SDK key.
    ///
    /// ```
    /// # use flagpole::Config;
    /// Config::from_sdk_key("sdk-key");
    /// ```
    pub fn from_sdk_key(sdk_key: impl Into<String>) -> Self {
        Config {
            sdk_key: sdk_key.into(),
            offline: false,
            base_uri: Config::DEFAULT_BASE_URI.to_owned(),
            stream_uri: Config::DEFAULT_STREAM_URI.to_owned(),
            events_uri: Config::DEFAULT_EVENTS_URI.to_owned(),
            send_events: true,
            events_capacity: Config::DEFAULT_EVENTS_CAPACITY,
            flush_interval: Config::DEFAULT_FLUSH_INTERVAL,
            context_keys_capacity: Config::DEFAULT_CONTEXT_KEYS_CAPACITY,
            context_keys_flush_interval: Config::DEFAULT_CONTEXT_KEYS_FLUSH_INTERVAL,
            all_attributes_private: false,
            private_attributes: Vec::new(),
            diagnostic_opt_out: false,
            diagnostic_recording_interval: Config::DEFAULT_DIAGNOSTIC_RECORDING_INTERVAL,
            connect_timeout: Config::DEFAULT_TIMEOUT,
            timeout: Config::DEFAULT_TIMEOUT,
            stream: true,
            poll_interval: Config::DEFAULT_POLL_INTERVAL,
            reconnect_time: Config::DEFAULT_RECONNECT_TIME,
            use_relay_daemon: false,
            feature_store: None,
            event_sender: None,
            big_segments: BigSegmentsConfig::default(),
            hooks: Vec::new(),
            sdk: SdkData::default(),
            platform: PlatformData::current(),
        }
    }

    /// Default base URI for flag data requests.
    pub const DEFAULT_BASE_URI: &'static str = "https://sdk.flagpole.dev";
    /// Default URI of the streaming service.
    pub const DEFAULT_STREAM_URI: &'static str = "https://stream.flagpole.dev";
    /// Default URI of the events service.
    pub const DEFAULT_EVENTS_URI: &'static str = "https://events.flagpole.dev";

    pub const DEFAULT_EVENTS_CAPACITY: usize = 10000;
    pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
    pub const DEFAULT_CONTEXT_KEYS_CAPACITY: usize = 1000;
    pub const DEFAULT_CONTEXT_KEYS_FLUSH_INTERVAL: Duration = Duration::from_secs(300);
    pub const DEFAULT_DIAGNOSTIC_RECORDING_INTERVAL: Duration = Duration::from_secs(900);
    /// Diagnostic recording interval cannot be set lower than this.
    pub const MIN_DIAGNOSTIC_RECORDING_INTERVAL: Duration = Duration::from_secs(60);
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
    pub const DEFAULT_RECONNECT_TIME: Duration = Duration::from_secs(1);

    /// In offline mode the client makes no network requests, sends no events and evaluates every
    /// flag to the default value.
    pub fn offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    /// Override base URI for flag data requests. Clients should use the default setting in most
    /// cases.
    pub fn base_uri(mut self, uri: impl Into<String>) -> Self {
        self.base_uri = uri.into();
        self
    }

    pub fn stream_uri(mut self, uri: impl Into<String>) -> Self {
        self.stream_uri = uri.into();
        self
    }

    pub fn events_uri(mut self, uri: impl Into<String>) -> Self {
        self.events_uri = uri.into();
        self
    }

    /// Disable sending analytics events. Evaluation is unaffected.
    pub fn send_events(mut self, send_events: bool) -> Self {
        self.send_events = send_events;
        self
    }

    /// Maximum number of events buffered between flushes. Events beyond this are dropped.
    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = capacity;
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Number of context keys remembered for index event deduplication.
    pub fn context_keys_capacity(mut self, capacity: usize) -> Self {
        self.context_keys_capacity = capacity;
        self
    }

    pub fn context_keys_flush_interval(mut self, interval: Duration) -> Self {
        self.context_keys_flush_interval = interval;
        self
    }

    /// Redact all context attributes (except key, kind and anonymous) from events.
    pub fn all_attributes_private(mut self, private: bool) -> Self {
        self.all_attributes_private = private;
        self
    }

    /// Redact an attribute of every context from events.
    pub fn private_attribute(mut self, reference: impl Into<Reference>) -> Self {
        self.private_attributes.push(reference.into());
        self
    }

    pub fn diagnostic_opt_out(mut self, opt_out: bool) -> Self {
        self.diagnostic_opt_out = opt_out;
        self
    }

    /// Interval of periodic diagnostic events. Values below one minute are raised to one minute.
    pub fn diagnostic_recording_interval(mut self, interval: Duration) -> Self {
        self.diagnostic_recording_interval =
            interval.max(Config::MIN_DIAGNOSTIC_RECORDING_INTERVAL);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Timeout of event delivery requests.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether the update source streams changes (`true`) or polls for them.
    pub fn stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn reconnect_time(mut self, time: Duration) -> Self {
        self.reconnect_time = time;
        self
    }

    /// Flag data is written to the feature store by a relay daemon instead of an update source.
    pub fn use_relay_daemon(mut self, use_relay_daemon: bool) -> Self {
        self.use_relay_daemon = use_relay_daemon;
        self
    }

    /// Use a custom feature store. Defaults to [`InMemoryFeatureStore`](crate::InMemoryFeatureStore).
    pub fn feature_store(mut self, store: Arc<dyn FeatureStore>) -> Self {
        self.feature_store = Some(store);
        self
    }

    /// Use a custom event sender. Defaults to an HTTP sender targeting the events URI.
    pub fn event_sender(mut self, sender: Arc<dyn EventSender>) -> Self {
        self.event_sender = Some(sender);
        self
    }

    pub fn big_segments(mut self, config: BigSegmentsConfig) -> Self {
        self.big_segments = config;
        self
    }

    /// Shorthand for `big_segments(BigSegmentsConfig::new(store))`.
    pub fn big_segment_store(self, store: Arc<dyn BigSegmentStore>) -> Self {
        self.big_segments(BigSegmentsConfig::new(store))
    }

    pub fn hook(mut self, hook: Arc<dyn Hook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Identify a wrapper library in diagnostics and the `User-Agent` header.
    pub fn wrapper(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.sdk.wrapper_name = Some(name.into());
        self.sdk.wrapper_version = Some(version.into());
        self
    }

    /// Create a new [`Client`] using the specified configuration.
    ///
    /// Must be called within a tokio runtime unless the client is offline or events are disabled.
    pub fn to_client(self) -> Result<Client> {
        Client::new(self)
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("offline", &self.offline)
            .field("base_uri", &self.base_uri)
            .field("events_uri", &self.events_uri)
            .field("send_events", &self.send_events)
            .field("events_capacity", &self.events_capacity)
            .field("flush_interval", &self.flush_interval)
            .field("all_attributes_private", &self.all_attributes_private)
            .field("big_segments", &self.big_segments)
            .field("hooks", &self.hooks.len())
            .finish_non_exhaustive()
    }
}
