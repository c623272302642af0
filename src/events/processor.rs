//! Event processor: the single owner of queued events, the summary and the context deduplicator.
//!
//! Callers talk to a background task over a bounded channel. Sending an event never blocks: if
//! the channel or the outbox is full, the event is dropped and counted. Flushing swaps the queue
//! and summary out of the task's state and delivers them from a separate task, so ingestion is
//! never blocked by slow delivery.
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinSet,
    time::{interval_at, Instant, MissedTickBehavior},
};

use crate::{
    diagnostics::DiagnosticsManager,
    events::{
        context_filter::ContextFilter, deduplicator::ContextDeduplicator,
        summarizer::EventSummarizer, CustomOutput, DeliveryStatus, EventDataKind, EventSender,
        FeatureEvent, FeatureOutput, InputEvent, MigrationOpOutput, OutputEvent,
    },
    Config, Error, Reference, Result,
};

#[derive(Debug, Clone)]
pub struct EventProcessorConfig {
    /// Maximum number of output events held between flushes.
    pub capacity: usize,
    pub flush_interval: Duration,
    pub context_keys_capacity: usize,
    pub context_keys_flush_interval: Duration,
    pub diagnostic_recording_interval: Duration,
    pub all_attributes_private: bool,
    pub private_attributes: Vec<Reference>,
    /// Upper bound on the final flush performed by [`EventProcessor::close`].
    pub close_timeout: Duration,
}

impl EventProcessorConfig {
    pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
}

impl From<&Config> for EventProcessorConfig {
    fn from(config: &Config) -> Self {
        EventProcessorConfig {
            capacity: config.events_capacity,
            flush_interval: config.flush_interval,
            context_keys_capacity: config.context_keys_capacity,
            context_keys_flush_interval: config.context_keys_flush_interval,
            diagnostic_recording_interval: config.diagnostic_recording_interval,
            all_attributes_private: config.all_attributes_private,
            private_attributes: config.private_attributes.clone(),
            close_timeout: EventProcessorConfig::DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

enum Message {
    Event(InputEvent),
    Flush(oneshot::Sender<Result<()>>),
    Close(oneshot::Sender<()>),
}

/// State shared between the handle, the background task and delivery tasks.
#[derive(Default)]
struct Shared {
    dropped_events: AtomicU64,
    /// Set after an unrecoverable delivery failure.
    shutdown: AtomicBool,
    closed: AtomicBool,
    last_known_server_time: Mutex<Option<DateTime<Utc>>>,
}

impl Shared {
    fn server_time(&self) -> Option<DateTime<Utc>> {
        *self
            .last_known_server_time
            .lock()
            .expect("thread holding server time lock should not panic")
    }
}

/// Handle to the event processor task.
pub struct EventProcessor {
    inbox: mpsc::Sender<Message>,
    shared: Arc<Shared>,
    close_timeout: Duration,
}

impl EventProcessor {
    /// Start the processor. Must be called within a tokio runtime.
    pub fn new(
        config: EventProcessorConfig,
        sender: Arc<dyn EventSender>,
        diagnostics: Option<Arc<DiagnosticsManager>>,
    ) -> EventProcessor {
        let (inbox, receiver) = mpsc::channel(config.capacity.max(1));
        let shared = Arc::new(Shared::default());
        let close_timeout = config.close_timeout;
        let actor = EventProcessorTask {
            queue: Vec::new(),
            summarizer: EventSummarizer::new(),
            deduplicator: ContextDeduplicator::new(config.context_keys_capacity),
            filter: ContextFilter::new(
                config.all_attributes_private,
                config.private_attributes.clone(),
            ),
            deduplicated_users: 0,
            events_in_last_batch: 0,
            config,
            sender,
            diagnostics,
            shared: shared.clone(),
        };
        tokio::spawn(actor.run(receiver));
        EventProcessor {
            inbox,
            shared,
            close_timeout,
        }
    }

    /// Enqueue an event. Never blocks and never fails; events are dropped when the queue is full
    /// or the processor is closed or shut down.
    pub fn send_event(&self, event: InputEvent) {
        if self.shared.closed.load(Ordering::Acquire)
            || self.shared.shutdown.load(Ordering::Acquire)
        {
            return;
        }
        let sent = self.inbox.try_send(Message::Event(event));
        if let Err(mpsc::error::TrySendError::Full(_)) = sent {
            self.record_dropped();
        }
    }

    fn record_dropped(&self) {
        if self.shared.dropped_events.fetch_add(1, Ordering::Relaxed) == 0 {
            log::warn!(target: "flagpole",
                       "exceeded event queue capacity, increase capacity to avoid dropping events");
        }
    }

    /// Deliver all queued events and the current summary. Resolves once delivery finished.
    pub async fn flush(&self) -> Result<()> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(Error::InvalidSdkKey);
        }
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::EventProcessorClosed);
        }
        let (reply, result) = oneshot::channel();
        self.inbox
            .send(Message::Flush(reply))
            .await
            .map_err(|_| Error::EventProcessorClosed)?;
        result.await.map_err(|_| Error::EventProcessorClosed)?
    }

    /// Flush remaining events and stop the processor. Calling `close` more than once is a no-op.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let (reply, done) = oneshot::channel();
        if self.inbox.send(Message::Close(reply)).await.is_err() {
            return;
        }
        if tokio::time::timeout(self.close_timeout, done).await.is_err() {
            log::warn!(target: "flagpole", "timed out waiting for final event flush");
        }
    }

    /// Whether an unrecoverable delivery failure disabled event sending.
    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }
}

struct EventProcessorTask {
    config: EventProcessorConfig,
    sender: Arc<dyn EventSender>,
    diagnostics: Option<Arc<DiagnosticsManager>>,
    shared: Arc<Shared>,
    queue: Vec<OutputEvent>,
    summarizer: EventSummarizer,
    deduplicator: ContextDeduplicator,
    filter: ContextFilter,
    deduplicated_users: u64,
    events_in_last_batch: u64,
}

impl EventProcessorTask {
    async fn run(mut self, mut inbox: mpsc::Receiver<Message>) {
        let mut in_flight = JoinSet::new();

        if let Some(diagnostics) = &self.diagnostics {
            let payload = serde_json::to_value(diagnostics.create_init_event());
            in_flight.spawn(send_diagnostics(self.sender.clone(), payload));
        }

        let mut flush_timer = timer(self.config.flush_interval);
        let mut context_keys_timer = timer(self.config.context_keys_flush_interval);
        let mut diagnostics_timer = timer(self.config.diagnostic_recording_interval);

        loop {
            tokio::select! {
                message = inbox.recv() => match message {
                    Some(Message::Event(event)) => self.process_event(event),
                    Some(Message::Flush(reply)) => self.start_flush(&mut in_flight, Some(reply)),
                    Some(Message::Close(reply)) => {
                        self.finish(in_flight).await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.finish(in_flight).await;
                        break;
                    }
                },
                _ = flush_timer.tick() => self.start_flush(&mut in_flight, None),
                _ = context_keys_timer.tick() => self.deduplicator.flush(),
                _ = diagnostics_timer.tick(), if self.diagnostics.is_some() => {
                    self.send_stats(&mut in_flight);
                }
                Some(_) = in_flight.join_next() => {}
            }
        }
        log::debug!(target: "flagpole", "event processor stopped");
    }

    fn process_event(&mut self, event: InputEvent) {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return;
        }

        let (add_full, add_debug) = match &event {
            InputEvent::MigrationOp(e) => {
                if is_sampled(e.sampling_ratio) {
                    self.enqueue(OutputEvent::MigrationOp(MigrationOpOutput {
                        creation_date: e.creation_date,
                        context_keys: e.context.context_keys(),
                        operation: e.operation,
                        evaluation: serde_json::to_value(&e.evaluation)
                            .unwrap_or(serde_json::Value::Null),
                        measurements: e
                            .measurements
                            .iter()
                            .filter_map(|m| serde_json::to_value(m).ok())
                            .collect(),
                        sampling_ratio: e.sampling_ratio.filter(|r| *r != 1),
                    }));
                }
                return;
            }
            InputEvent::Feature(e) => {
                if !e.exclude_from_summaries {
                    self.summarizer.summarize_event(e);
                }
                (e.track_events, self.should_debug(e))
            }
            InputEvent::Identify(_) | InputEvent::Custom(_) => (true, false),
        };

        let is_identify = matches!(event, InputEvent::Identify(_));
        let is_new_context = self.deduplicator.process_context(event.context());
        if !is_identify {
            if is_new_context {
                self.enqueue(OutputEvent::Index {
                    creation_date: event.creation_date(),
                    context: self.filter.filter(event.context()),
                });
            } else {
                self.deduplicated_users += 1;
            }
        }

        let sampled = is_sampled(event.sampling_ratio());
        match event {
            InputEvent::Feature(e) => {
                if add_full && sampled {
                    let output = self.feature_output(&e, false);
                    self.enqueue(OutputEvent::Feature(output));
                }
                if add_debug && sampled {
                    let output = self.feature_output(&e, true);
                    self.enqueue(OutputEvent::Debug(output));
                }
            }
            InputEvent::Identify(e) if add_full && sampled => {
                let context = self.filter.filter(&e.context);
                self.enqueue(OutputEvent::Identify {
                    creation_date: e.creation_date,
                    context,
                });
            }
            InputEvent::Custom(e) if add_full && sampled => {
                self.enqueue(OutputEvent::Custom(CustomOutput {
                    creation_date: e.creation_date,
                    key: e.key,
                    context_keys: e.context.context_keys(),
                    data: e.data,
                    metric_value: e.metric_value,
                    sampling_ratio: e.sampling_ratio.filter(|r| *r != 1),
                }));
            }
            _ => {}
        }
    }

    /// Debug events are emitted while `debugEventsUntilDate` is later than both the server clock
    /// (as of the last delivery) and the local clock.
    fn should_debug(&self, event: &FeatureEvent) -> bool {
        let Some(until) = event.debug_events_until_date else {
            return false;
        };
        let mut last_past = Utc::now().max(event.creation_date);
        if let Some(server_time) = self.shared.server_time() {
            last_past = last_past.max(server_time);
        }
        i64::try_from(until).is_ok_and(|until| until > last_past.timestamp_millis())
    }

    fn feature_output(&self, event: &FeatureEvent, debug: bool) -> FeatureOutput {
        FeatureOutput {
            creation_date: event.creation_date,
            key: event.key.clone(),
            context_keys: (!debug).then(|| event.context.context_keys()),
            context: debug.then(|| self.filter.filter(&event.context)),
            version: event.version,
            variation: event.variation,
            value: event.value.clone(),
            default: event.default.clone(),
            reason: event.reason.clone(),
            prereq_of: event.prereq_of.clone(),
            sampling_ratio: event.sampling_ratio.filter(|r| *r != 1),
        }
    }

    fn enqueue(&mut self, event: OutputEvent) {
        if self.queue.len() >= self.config.capacity {
            if self.shared.dropped_events.fetch_add(1, Ordering::Relaxed) == 0 {
                log::warn!(target: "flagpole",
                           "exceeded event queue capacity, \
                            increase capacity to avoid dropping events");
            }
            return;
        }
        self.queue.push(event);
    }

    /// Swap out queued events and the summary. Returns `None` if there is nothing to send.
    fn take_payload(&mut self) -> Option<Vec<OutputEvent>> {
        let mut events = std::mem::take(&mut self.queue);
        if let Some(summary) = self.summarizer.take_summary() {
            events.push(OutputEvent::Summary(summary));
        }
        if events.is_empty() {
            return None;
        }
        self.events_in_last_batch = events.len() as u64;
        Some(events)
    }

    fn start_flush(
        &mut self,
        in_flight: &mut JoinSet<()>,
        reply: Option<oneshot::Sender<Result<()>>>,
    ) {
        if self.shared.shutdown.load(Ordering::Acquire) {
            if let Some(reply) = reply {
                let _ = reply.send(Err(Error::InvalidSdkKey));
            }
            return;
        }
        let Some(events) = self.take_payload() else {
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
            return;
        };
        let sender = self.sender.clone();
        let shared = self.shared.clone();
        in_flight.spawn(async move {
            let result = deliver(sender, shared, events).await;
            match reply {
                Some(reply) => {
                    let _ = reply.send(result);
                }
                None => {
                    if let Err(err) = result {
                        log::warn!(target: "flagpole", "scheduled event flush failed: {err}");
                    }
                }
            }
        });
    }

    fn send_stats(&mut self, in_flight: &mut JoinSet<()>) {
        let Some(diagnostics) = &self.diagnostics else {
            return;
        };
        if self.shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        let event = diagnostics.create_stats_event_and_reset(
            self.shared.dropped_events.swap(0, Ordering::Relaxed),
            std::mem::take(&mut self.deduplicated_users),
            self.events_in_last_batch,
        );
        in_flight.spawn(send_diagnostics(
            self.sender.clone(),
            serde_json::to_value(event),
        ));
    }

    /// Final flush, then wait for every delivery still in flight.
    async fn finish(&mut self, mut in_flight: JoinSet<()>) {
        if !self.shared.shutdown.load(Ordering::Acquire) {
            if let Some(events) = self.take_payload() {
                if let Err(err) = deliver(self.sender.clone(), self.shared.clone(), events).await {
                    log::warn!(target: "flagpole", "final event flush failed: {err}");
                }
            }
        }
        while in_flight.join_next().await.is_some() {}
    }
}

fn timer(period: Duration) -> tokio::time::Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Sampling ratio `n` keeps one out of `n` events. `0` drops all of them.
fn is_sampled(ratio: Option<u32>) -> bool {
    match ratio {
        None | Some(1) => true,
        Some(0) => false,
        Some(n) => rand::thread_rng().gen_range(0..n) == 0,
    }
}

async fn deliver(
    sender: Arc<dyn EventSender>,
    shared: Arc<Shared>,
    events: Vec<OutputEvent>,
) -> Result<()> {
    if shared.shutdown.load(Ordering::Acquire) {
        return Err(Error::InvalidSdkKey);
    }
    let count = events.len();
    let payload =
        serde_json::to_value(&events).map_err(|err| Error::EventDelivery(err.to_string()))?;
    log::debug!(target: "flagpole", count; "flushing events");

    let result = sender
        .send_event_data(EventDataKind::Analytics, payload)
        .await;
    match result.status {
        DeliveryStatus::Succeeded => {
            if let Some(server_time) = result.server_time {
                *shared
                    .last_known_server_time
                    .lock()
                    .expect("thread holding server time lock should not panic") = Some(server_time);
            }
            Ok(())
        }
        DeliveryStatus::Failed => Err(result
            .error
            .unwrap_or_else(|| Error::EventDelivery("delivery failed".into()))),
        DeliveryStatus::FailedAndMustShutDown => {
            shared.shutdown.store(true, Ordering::Release);
            Err(result.error.unwrap_or(Error::InvalidSdkKey))
        }
    }
}

async fn send_diagnostics(
    sender: Arc<dyn EventSender>,
    payload: serde_json::Result<serde_json::Value>,
) {
    match payload {
        Ok(payload) => {
            let result = sender
                .send_event_data(EventDataKind::Diagnostics, payload)
                .await;
            if let Some(err) = result.error {
                log::debug!(target: "flagpole", "failed to send diagnostic event: {err}");
            }
        }
        Err(err) => log::warn!(target: "flagpole", "failed to serialize diagnostic event: {err}"),
    }
}
