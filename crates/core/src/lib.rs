//! Relay engine core.
//!
//! Copies top-level posts and their threaded replies from origin chats into
//! destination chats, reconstructing reply structure across the copy. The
//! platform is reached only through the capability traits in [`session`];
//! persistence only through [`identity::IdentityMap`] and
//! [`outcome::OutcomeLog`].

pub mod dedup;
pub mod error;
#[cfg(any(test, feature = "test-support"))]
pub mod fake;
pub mod governor;
pub mod identity;
pub mod listener;
pub mod locks;
pub mod outcome;
pub mod pipeline;
pub mod resolver;
pub mod session;
pub mod types;

pub use {
    dedup::DedupGuard,
    error::{Error, PlatformError, Result},
    governor::RateGovernor,
    identity::{IdentityMap, InMemoryIdentityMap, MessageRecord, RecordKey},
    listener::{BindingState, ListenerPool},
    outcome::{DeliveryOutcome, InMemoryOutcomeLog, OutcomeLog, OutcomeStatus, Strategy},
    pipeline::{Delivered, DeliveryConfig, DeliveryFailure, DeliveryPipeline},
    resolver::ThreadResolver,
    session::{EventSource, InboundEvent, OriginReader, Sender, Session, SessionProvider},
    types::{ChatId, DestinationTarget, MessageId, SourceBinding, SourceMessage},
};
