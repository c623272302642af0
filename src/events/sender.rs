//! Delivery of event payloads to the events service.
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, StatusCode, Url};

use crate::{Error, Result};

/// Kind of payload being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventDataKind {
    Analytics,
    Diagnostics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Succeeded,
    /// Delivery failed, later deliveries may succeed.
    Failed,
    /// Delivery failed in a way that makes further deliveries pointless (e.g., invalid SDK key).
    FailedAndMustShutDown,
}

#[derive(Debug, Clone)]
pub struct EventSenderResult {
    pub status: DeliveryStatus,
    pub error: Option<Error>,
    /// Server clock at the time of delivery, taken from the response `Date` header.
    pub server_time: Option<DateTime<Utc>>,
}

impl EventSenderResult {
    pub fn succeeded(server_time: Option<DateTime<Utc>>) -> EventSenderResult {
        EventSenderResult {
            status: DeliveryStatus::Succeeded,
            error: None,
            server_time,
        }
    }

    pub fn failed(status: DeliveryStatus, error: Error) -> EventSenderResult {
        EventSenderResult {
            status,
            error: Some(error),
            server_time: None,
        }
    }
}

/// Capability to deliver event payloads.
#[async_trait]
pub trait EventSender: Send + Sync {
    async fn send_event_data(
        &self,
        kind: EventDataKind,
        payload: serde_json::Value,
    ) -> EventSenderResult;
}

pub struct HttpEventSenderConfig {
    pub events_uri: String,
    pub sdk_key: String,
    pub user_agent: String,
    pub timeout: Duration,
}

const ANALYTICS_PATH: &str = "/bulk";
const DIAGNOSTICS_PATH: &str = "/diagnostic";
const EVENT_SCHEMA: &str = "4";
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Sends events over HTTP with one retry for recoverable errors.
pub struct HttpEventSender {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    analytics_url: Url,
    diagnostics_url: Url,
    config: HttpEventSenderConfig,
}

impl HttpEventSender {
    pub fn new(config: HttpEventSenderConfig) -> Result<HttpEventSender> {
        let base = config.events_uri.trim_end_matches('/');
        let analytics_url =
            Url::parse(&format!("{base}{ANALYTICS_PATH}")).map_err(Error::InvalidBaseUrl)?;
        let diagnostics_url =
            Url::parse(&format!("{base}{DIAGNOSTICS_PATH}")).map_err(Error::InvalidBaseUrl)?;
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(HttpEventSender {
            client,
            analytics_url,
            diagnostics_url,
            config,
        })
    }

    async fn try_send(
        &self,
        url: &Url,
        kind: EventDataKind,
        payload: &serde_json::Value,
        payload_id: &str,
    ) -> std::result::Result<Option<DateTime<Utc>>, (Error, bool)> {
        let mut request = self
            .client
            .post(url.clone())
            .header(header::AUTHORIZATION, &self.config.sdk_key)
            .header(header::USER_AGENT, &self.config.user_agent)
            .json(payload);
        if kind == EventDataKind::Analytics {
            request = request
                .header("X-Event-Schema", EVENT_SCHEMA)
                .header("X-Payload-Id", payload_id);
        }

        let response = request.send().await.map_err(|err| (Error::from(err), true))?;
        let status = response.status();
        if status.is_success() {
            let server_time = response
                .headers()
                .get(header::DATE)
                .and_then(|date| date.to_str().ok())
                .and_then(|date| DateTime::parse_from_rfc2822(date).ok())
                .map(|date| date.with_timezone(&Utc));
            return Ok(server_time);
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            log::warn!(target: "flagpole",
                       status = status.as_u16();
                       "events service rejected the SDK key");
            return Err((Error::Unauthorized, false));
        }
        Err((
            Error::EventDelivery(format!("received HTTP status {status}")),
            is_recoverable(status),
        ))
    }
}

fn is_recoverable(status: StatusCode) -> bool {
    if status.is_client_error() {
        matches!(status.as_u16(), 400 | 408 | 429)
    } else {
        true
    }
}

#[async_trait]
impl EventSender for HttpEventSender {
    async fn send_event_data(
        &self,
        kind: EventDataKind,
        payload: serde_json::Value,
    ) -> EventSenderResult {
        let url = match kind {
            EventDataKind::Analytics => &self.analytics_url,
            EventDataKind::Diagnostics => &self.diagnostics_url,
        };
        let payload_id = uuid::Uuid::new_v4().to_string();

        let mut retried = false;
        loop {
            log::debug!(target: "flagpole", kind:?, retried; "delivering event payload");
            match self.try_send(url, kind, &payload, &payload_id).await {
                Ok(server_time) => return EventSenderResult::succeeded(server_time),
                Err((err, true)) if !retried => {
                    log::warn!(target: "flagpole", "error delivering events, will retry: {err}");
                    retried = true;
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err((err, true)) => {
                    log::warn!(target: "flagpole", "error delivering events: {err}");
                    return EventSenderResult::failed(DeliveryStatus::Failed, err);
                }
                Err((err, false)) => {
                    log::warn!(target: "flagpole",
                               "unrecoverable error delivering events, \
                                event sending is disabled: {err}");
                    return EventSenderResult::failed(DeliveryStatus::FailedAndMustShutDown, err);
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use reqwest::StatusCode;

    use super::{
        is_recoverable, DeliveryStatus, EventDataKind, EventSender, EventSenderResult,
        HttpEventSender, HttpEventSenderConfig,
    };
    use crate::Error;

    /// Sender that records payloads and replies with a configurable status.
    pub(crate) struct MockEventSender {
        pub payloads: Mutex<Vec<(EventDataKind, serde_json::Value)>>,
        pub status: Mutex<DeliveryStatus>,
    }

    impl MockEventSender {
        pub fn new() -> MockEventSender {
            MockEventSender {
                payloads: Mutex::new(Vec::new()),
                status: Mutex::new(DeliveryStatus::Succeeded),
            }
        }

        pub fn set_status(&self, status: DeliveryStatus) {
            *self.status.lock().unwrap() = status;
        }

        pub fn calls(&self) -> usize {
            self.payloads.lock().unwrap().len()
        }

        /// All analytics events delivered so far, flattened.
        pub fn analytics_events(&self) -> Vec<serde_json::Value> {
            self.payloads
                .lock()
                .unwrap()
                .iter()
                .filter(|(kind, _)| *kind == EventDataKind::Analytics)
                .flat_map(|(_, payload)| payload.as_array().cloned().unwrap_or_default())
                .collect()
        }

        pub fn diagnostics_events(&self) -> Vec<serde_json::Value> {
            self.payloads
                .lock()
                .unwrap()
                .iter()
                .filter(|(kind, _)| *kind == EventDataKind::Diagnostics)
                .map(|(_, payload)| payload.clone())
                .collect()
        }
    }

    #[async_trait]
    impl EventSender for MockEventSender {
        async fn send_event_data(
            &self,
            kind: EventDataKind,
            payload: serde_json::Value,
        ) -> EventSenderResult {
            self.payloads.lock().unwrap().push((kind, payload));
            let status = *self.status.lock().unwrap();
            match status {
                DeliveryStatus::Succeeded => EventSenderResult::succeeded(None),
                DeliveryStatus::Failed => {
                    EventSenderResult::failed(status, Error::EventDelivery("mock failure".into()))
                }
                DeliveryStatus::FailedAndMustShutDown => {
                    EventSenderResult::failed(status, Error::Unauthorized)
                }
            }
        }
    }

    #[test]
    fn recoverable_statuses() {
        assert!(is_recoverable(StatusCode::BAD_REQUEST));
        assert!(is_recoverable(StatusCode::REQUEST_TIMEOUT));
        assert!(is_recoverable(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_recoverable(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_recoverable(StatusCode::NOT_FOUND));
        assert!(!is_recoverable(StatusCode::PAYLOAD_TOO_LARGE));
    }

    #[test]
    fn rejects_invalid_events_uri() {
        let result = HttpEventSender::new(HttpEventSenderConfig {
            events_uri: "not a url".into(),
            sdk_key: "key".into(),
            user_agent: "test".into(),
            timeout: std::time::Duration::from_secs(1),
        });
        assert!(matches!(result, Err(Error::InvalidBaseUrl(_))));
    }
}
