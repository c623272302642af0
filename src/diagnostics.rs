//! Diagnostic events: SDK identity and configuration at startup, then periodic statistics.
use std::{sync::Mutex, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_with::{serde_as, DurationMilliSeconds, TimestampMilliSeconds};

use crate::{
    platform::{PlatformData, SdkData},
    Config,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticId {
    pub diagnostic_id: String,
    /// Last six characters of the SDK key.
    pub sdk_key_suffix: String,
}

/// Configuration snapshot reported in the init event.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticConfiguration {
    #[serde(rename = "customBaseURI")]
    pub custom_base_uri: bool,
    #[serde(rename = "customStreamURI")]
    pub custom_stream_uri: bool,
    #[serde(rename = "customEventsURI")]
    pub custom_events_uri: bool,
    pub events_capacity: usize,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "connectTimeoutMillis")]
    pub connect_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "socketTimeoutMillis")]
    pub socket_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "eventsFlushIntervalMillis")]
    pub events_flush_interval: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "pollingIntervalMillis")]
    pub polling_interval: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "reconnectTimeMillis")]
    pub reconnect_time: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "contextKeysFlushIntervalMillis")]
    pub context_keys_flush_interval: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "diagnosticRecordingIntervalMillis")]
    pub diagnostic_recording_interval: Duration,
    pub streaming_disabled: bool,
    pub using_relay_daemon: bool,
    pub offline: bool,
    pub all_attributes_private: bool,
    pub context_keys_capacity: usize,
    pub using_proxy: bool,
    pub using_proxy_authenticator: bool,
    pub data_store_type: String,
}

impl DiagnosticConfiguration {
    pub(crate) fn new(config: &Config, data_store_type: String) -> DiagnosticConfiguration {
        DiagnosticConfiguration {
            custom_base_uri: config.base_uri != Config::DEFAULT_BASE_URI,
            custom_stream_uri: config.stream_uri != Config::DEFAULT_STREAM_URI,
            custom_events_uri: config.events_uri != Config::DEFAULT_EVENTS_URI,
            events_capacity: config.events_capacity,
            connect_timeout: config.connect_timeout,
            socket_timeout: config.timeout,
            events_flush_interval: config.flush_interval,
            polling_interval: config.poll_interval,
            reconnect_time: config.reconnect_time,
            context_keys_flush_interval: config.context_keys_flush_interval,
            diagnostic_recording_interval: config.diagnostic_recording_interval,
            streaming_disabled: !config.stream,
            using_relay_daemon: config.use_relay_daemon,
            offline: config.offline,
            all_attributes_private: config.all_attributes_private,
            context_keys_capacity: config.context_keys_capacity,
            using_proxy: config.platform.using_proxy,
            using_proxy_authenticator: config.platform.using_proxy_authenticator,
            data_store_type,
        }
    }
}

/// One attempt to initialize the streaming connection.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInit {
    #[serde_as(as = "TimestampMilliSeconds<i64>")]
    pub timestamp: DateTime<Utc>,
    pub failed: bool,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "durationMillis")]
    pub duration: Duration,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum DiagnosticEvent {
    #[serde(rename = "diagnostic-init", rename_all = "camelCase")]
    Init {
        id: DiagnosticId,
        #[serde_as(as = "TimestampMilliSeconds<i64>")]
        creation_date: DateTime<Utc>,
        sdk: SdkData,
        configuration: DiagnosticConfiguration,
        platform: PlatformData,
    },
    #[serde(rename = "diagnostic", rename_all = "camelCase")]
    Stats {
        id: DiagnosticId,
        #[serde_as(as = "TimestampMilliSeconds<i64>")]
        creation_date: DateTime<Utc>,
        #[serde_as(as = "TimestampMilliSeconds<i64>")]
        data_since_date: DateTime<Utc>,
        dropped_events: u64,
        deduplicated_users: u64,
        events_in_last_batch: u64,
        stream_inits: Vec<StreamInit>,
    },
}

struct Window {
    data_since: DateTime<Utc>,
    stream_inits: Vec<StreamInit>,
}

/// Builds diagnostic events. Shared between the event processor (statistics) and update sources
/// (stream initialization records).
pub struct DiagnosticsManager {
    id: DiagnosticId,
    start_time: DateTime<Utc>,
    sdk: SdkData,
    platform: PlatformData,
    configuration: DiagnosticConfiguration,
    window: Mutex<Window>,
}

impl DiagnosticsManager {
    pub fn new(
        sdk_key: &str,
        sdk: SdkData,
        platform: PlatformData,
        configuration: DiagnosticConfiguration,
    ) -> DiagnosticsManager {
        let suffix_start = sdk_key
            .char_indices()
            .rev()
            .nth(5)
            .map_or(0, |(index, _)| index);
        let start_time = Utc::now();
        DiagnosticsManager {
            id: DiagnosticId {
                diagnostic_id: uuid::Uuid::new_v4().to_string(),
                sdk_key_suffix: sdk_key[suffix_start..].to_owned(),
            },
            start_time,
            sdk,
            platform,
            configuration,
            window: Mutex::new(Window {
                data_since: start_time,
                stream_inits: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> &DiagnosticId {
        &self.id
    }

    /// Init event. Always the same for a given manager.
    pub fn create_init_event(&self) -> DiagnosticEvent {
        DiagnosticEvent::Init {
            id: self.id.clone(),
            creation_date: self.start_time,
            sdk: self.sdk.clone(),
            configuration: self.configuration.clone(),
            platform: self.platform.clone(),
        }
    }

    /// Record an attempt to open the stream, reported in the next statistics event.
    pub fn record_stream_init(&self, timestamp: DateTime<Utc>, failed: bool, duration: Duration) {
        self.window
            .lock()
            .expect("thread holding diagnostics lock should not panic")
            .stream_inits
            .push(StreamInit {
                timestamp,
                failed,
                duration,
            });
    }

    /// Statistics event covering the time since the previous one. Starts a new window.
    pub fn create_stats_event_and_reset(
        &self,
        dropped_events: u64,
        deduplicated_users: u64,
        events_in_last_batch: u64,
    ) -> DiagnosticEvent {
        let now = Utc::now();
        let mut window = self
            .window
            .lock()
            .expect("thread holding diagnostics lock should not panic");
        let data_since_date = std::mem::replace(&mut window.data_since, now);
        let stream_inits = std::mem::take(&mut window.stream_inits);
        DiagnosticEvent::Stats {
            id: self.id.clone(),
            creation_date: now,
            data_since_date,
            dropped_events,
            deduplicated_users,
            events_in_last_batch,
            stream_inits,
        }
    }
}
