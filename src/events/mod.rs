//! Analytics events: construction, summarization, context redaction and delivery.
mod context_filter;
mod deduplicator;
mod event;
mod factory;
mod processor;
mod sender;
mod summarizer;

pub use event::*;
pub use factory::EventFactory;
pub use processor::{EventProcessor, EventProcessorConfig};
pub use sender::{
    DeliveryStatus, EventDataKind, EventSender, EventSenderResult, HttpEventSender,
    HttpEventSenderConfig,
};

pub(crate) use factory::is_tracking_forced;
#[cfg(test)]
pub(crate) use sender::tests::MockEventSender;
