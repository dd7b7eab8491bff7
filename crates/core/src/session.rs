use std::sync::Arc;

use {async_trait::async_trait, tokio::sync::mpsc, tokio_util::sync::CancellationToken};

use crate::{
    Result,
    error::PlatformError,
    types::{ChatId, MediaPayload, MediaRef, MessageId, SourceMessage},
};

/// Result of a single platform call.
pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

/// Outbound capability shared by every session kind (per-owner or shared
/// relay account). The delivery pipeline depends only on this trait.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Ask the platform to relay `message_id` from `from` by reference.
    async fn native_transfer(
        &self,
        to: ChatId,
        from: ChatId,
        message_id: MessageId,
        reply_to: Option<MessageId>,
    ) -> PlatformResult<MessageId>;

    async fn send_text(
        &self,
        to: ChatId,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> PlatformResult<MessageId>;

    async fn send_file(
        &self,
        to: ChatId,
        media: &MediaPayload,
        caption: Option<&str>,
        reply_to: Option<MessageId>,
    ) -> PlatformResult<MessageId>;

    /// Replace the text of a message we sent earlier.
    async fn edit_text(
        &self,
        _chat: ChatId,
        _message_id: MessageId,
        _text: &str,
    ) -> PlatformResult<()> {
        Err(PlatformError::Unsupported {
            operation: "edit_text",
        })
    }
}

/// Read access to origin chats.
#[async_trait]
pub trait OriginReader: Send + Sync {
    async fn fetch_message(&self, chat: ChatId, message_id: MessageId)
    -> PlatformResult<SourceMessage>;

    async fn download_media(&self, media: &MediaRef) -> PlatformResult<MediaPayload>;

    /// Discussion chat linked to `chat`, if any.
    async fn linked_chat(&self, chat: ChatId) -> PlatformResult<Option<ChatId>>;
}

/// Event delivered by a session's listener.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Message(SourceMessage),
    Edited(SourceMessage),
    /// The connection is gone for good; the listener stops.
    Disconnected { reason: String },
}

/// Inbound event stream of one connected session.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Start receiving events. The stream ends when `cancel` fires or the
    /// connection is lost.
    async fn listen(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<InboundEvent>>;
}

/// A connected account session.
#[derive(Clone)]
pub struct Session {
    pub account_id: String,
    pub sender: Arc<dyn Sender>,
    pub origin: Arc<dyn OriginReader>,
    pub events: Arc<dyn EventSource>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("account_id", &self.account_id)
            .finish_non_exhaustive()
    }
}

/// Opens sessions for configured accounts. Supplied by whoever owns the
/// credentials.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Connect `account_id`. Unknown accounts and missing credentials are
    /// configuration errors.
    async fn connect(&self, account_id: &str) -> Result<Session>;
}
