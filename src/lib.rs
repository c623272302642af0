//! Server-side SDK for Flagpole, a feature flagging and experimentation service.
//!
//! # Overview
//!
//! The SDK revolves around a [`Client`] that evaluates feature flags for [`Context`]s. A context
//! is a keyed set of attributes describing a user, an organization, a device or any other kind
//! of entity, and several contexts can be combined into a multi-context. Evaluation walks the
//! flag's prerequisites, targets and rules and results in a [`Detail`] holding the flag value,
//! the variation index and the [`Reason`] the value was chosen.
//!
//! Flag data lives in a [`FeatureStore`]. Update sources write to the store; the client reads
//! from it on every evaluation.
//!
//! Evaluations, identifies and custom events are summarized and delivered to the events service
//! in the background. See [`Config`] for the available knobs.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Flag evaluation never fails: when a flag cannot be evaluated, the caller's default value is
//! returned and the reason carries an [`ErrorKind`]. Errors are only returned from client
//! construction and from [`Client::flush`].
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages,
//! with the `flagpole` target. Consider integrating a `log`-compatible logger implementation for
//! better visibility into SDK operations.

#![warn(rustdoc::missing_crate_level_docs)]

mod big_segments;
mod client;
mod config;
mod context;
mod diagnostics;
mod error;
mod eval;
mod events;
mod flags;
mod flags_state;
mod hooks;
mod migrations;
mod platform;
mod store;

pub use big_segments::{
    BigSegmentStore, BigSegmentStoreMetadata, BigSegmentStoreStatus, BigSegmentsConfig,
    BigSegmentsStatus, Membership,
};
pub use client::Client;
pub use config::Config;
pub use context::{
    AttributeValue, Attributes, Context, ContextBuilder, Kind, MultiContextBuilder, Reference,
    ReferenceError,
};
pub use diagnostics::{
    DiagnosticConfiguration, DiagnosticEvent, DiagnosticId, DiagnosticsManager, StreamInit,
};
pub use error::{Error, Result};
pub use eval::{Detail, ErrorKind, Reason, ReasonKind};
pub use events::{
    CustomEvent, DeliveryStatus, EventDataKind, EventSender, EventSenderResult, FeatureEvent,
    HttpEventSender, HttpEventSenderConfig, IdentifyEvent, InputEvent, Measurement,
    MigrationEvaluation, MigrationOpEvent, OutputEvent,
};
pub use flags::{Flag, Segment, VariationIndex};
pub use flags_state::{FlagState, FlagsState, FlagsStateOptions};
pub use hooks::{
    EvaluationSeriesContext, EvaluationSeriesData, Hook, HookError, HookMetadata,
};
pub use migrations::{MigrationOp, MigrationOpTracker, Origin, Stage};
pub use platform::{PlatformData, SdkData};
pub use store::{AllData, DataKind, FeatureStore, InMemoryFeatureStore, StoreItem};
