//! Telegram sessions for the relay engine.
//!
//! Each configured bot account becomes a [`threadrelay_core::Session`]:
//! long polling feeds the listener, the Bot API carries deliveries, and
//! messages the bot has seen stand in for history reads.

pub mod bot;
pub mod convert;
pub mod error;
pub mod outbound;
pub mod provider;
pub mod session;
pub mod state;

pub use {
    error::{Error, Result},
    provider::TelegramSessionProvider,
    session::TelegramSession,
    state::ObservedMessages,
};
