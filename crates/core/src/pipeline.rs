//! Delivery fallback chain: native transfer, content recreation, text-only,
//! then a best-effort failure notice.

use std::sync::Arc;

use {
    chrono::Utc,
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use threadrelay_metrics::{counter, relay as relay_metrics};

use crate::{
    error::PlatformError,
    governor::RateGovernor,
    identity::{IdentityMap, RecordKey},
    outcome::{DeliveryOutcome, OutcomeLog, OutcomeStatus, Strategy},
    session::{OriginReader, Sender},
    types::{ChatId, DestinationTarget, MediaKind, MediaRef, MessageId, SourceMessage},
};

/// Knobs for the fallback chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryConfig {
    /// Try relaying by reference before re-uploading.
    pub native_transfer: bool,
    /// Prefix recreated content with the origin chat and sender.
    pub attribution_header: bool,
    /// Post a notice to the destination when every strategy failed.
    pub failure_notice: bool,
    /// Sent when a media-only message degrades to text. `{kind}` is replaced
    /// with the media kind.
    pub placeholder_text: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            native_transfer: true,
            attribution_header: true,
            failure_notice: true,
            placeholder_text: "📎 {kind} could not be relayed".into(),
        }
    }
}

/// A successful delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivered {
    pub destination_message_id: MessageId,
    pub strategy: Strategy,
}

/// Every strategy failed for one message and target.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "delivery of message {message_id} from chat {origin_chat_id} to chat {destination_chat_id} failed: {reason}"
)]
pub struct DeliveryFailure {
    pub origin_chat_id: ChatId,
    pub message_id: MessageId,
    pub destination_chat_id: ChatId,
    pub reason: String,
}

/// Executes the delivery fallback chain for one session's sender.
pub struct DeliveryPipeline {
    sender: Arc<dyn Sender>,
    origin: Arc<dyn OriginReader>,
    identity: Arc<dyn IdentityMap>,
    outcomes: Arc<dyn OutcomeLog>,
    governor: RateGovernor,
    config: DeliveryConfig,
}

impl DeliveryPipeline {
    pub fn new(
        sender: Arc<dyn Sender>,
        origin: Arc<dyn OriginReader>,
        identity: Arc<dyn IdentityMap>,
        outcomes: Arc<dyn OutcomeLog>,
    ) -> Self {
        Self {
            sender,
            origin,
            identity,
            outcomes,
            governor: RateGovernor::default(),
            config: DeliveryConfig::default(),
        }
    }

    pub fn with_governor(mut self, governor: RateGovernor) -> Self {
        self.governor = governor;
        self
    }

    pub fn with_config(mut self, config: DeliveryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn origin(&self) -> &Arc<dyn OriginReader> {
        &self.origin
    }

    pub fn identity(&self) -> &Arc<dyn IdentityMap> {
        &self.identity
    }

    pub fn governor(&self) -> &RateGovernor {
        &self.governor
    }

    /// Deliver `message` to `target`, optionally as a reply to `reply_anchor`.
    ///
    /// Returns `Ok(None)` for empty messages. Platform errors never escape:
    /// the worst case is a `DeliveryFailure` plus a best-effort notice.
    pub async fn deliver(
        &self,
        message: &SourceMessage,
        target: &DestinationTarget,
        reply_anchor: Option<MessageId>,
    ) -> Result<Option<Delivered>, DeliveryFailure> {
        if message.is_empty() {
            debug!(
                origin_chat_id = message.chat_id,
                message_id = message.message_id,
                "skipping empty message"
            );
            return Ok(None);
        }

        // One entry per strategy that failed, in chain order.
        let mut causes = Vec::new();

        if self.config.native_transfer {
            match self
                .governor
                .execute("native_transfer", || {
                    self.sender.native_transfer(
                        target.chat_id,
                        message.chat_id,
                        message.message_id,
                        reply_anchor,
                    )
                })
                .await
            {
                Ok(id) => {
                    return Ok(Some(
                        self.succeed(message, target, id, Strategy::NativeTransfer)
                            .await,
                    ));
                },
                Err(e) => {
                    warn!(
                        origin_chat_id = message.chat_id,
                        message_id = message.message_id,
                        target = %target.name,
                        error = %e,
                        "native transfer failed, recreating content"
                    );
                    causes.push(format!("{}: {e}", Strategy::NativeTransfer.as_str()));
                },
            }
        }

        if let Some(media) = &message.media {
            match self.recreate(message, media, target, reply_anchor).await {
                Ok(id) => {
                    return Ok(Some(
                        self.succeed(message, target, id, Strategy::ContentRecreation)
                            .await,
                    ));
                },
                Err(e) => {
                    warn!(
                        origin_chat_id = message.chat_id,
                        message_id = message.message_id,
                        target = %target.name,
                        media_kind = %media.kind,
                        error = %e,
                        "content recreation failed, sending text only"
                    );
                    causes.push(format!("{}: {e}", Strategy::ContentRecreation.as_str()));
                },
            }
        }

        let text = self.text_only_body(message);
        match self
            .governor
            .execute("send_text", || {
                self.sender.send_text(target.chat_id, &text, reply_anchor)
            })
            .await
        {
            Ok(id) => {
                return Ok(Some(
                    self.succeed(message, target, id, Strategy::TextOnly).await,
                ));
            },
            Err(e) => {
                warn!(
                    origin_chat_id = message.chat_id,
                    message_id = message.message_id,
                    target = %target.name,
                    error = %e,
                    "text-only delivery failed"
                );
                causes.push(format!("{}: {e}", Strategy::TextOnly.as_str()));
            },
        }

        Err(self.fail(message, target, causes.join("; ")).await)
    }

    /// Deliver and write the Identity Map entry on success.
    ///
    /// Returns the recorded destination id, which is the existing one if a
    /// concurrent delivery recorded first.
    pub async fn deliver_and_record(
        &self,
        message: &SourceMessage,
        target: &DestinationTarget,
        reply_anchor: Option<MessageId>,
    ) -> Result<Option<MessageId>, DeliveryFailure> {
        let Some(delivered) = self.deliver(message, target, reply_anchor).await? else {
            return Ok(None);
        };

        let key = RecordKey::new(message.chat_id, message.message_id, target.chat_id);
        match self
            .identity
            .insert_if_absent(&key, delivered.destination_message_id)
            .await
        {
            Ok(winner) => {
                if winner != delivered.destination_message_id {
                    warn!(
                        origin_chat_id = message.chat_id,
                        message_id = message.message_id,
                        destination_chat_id = target.chat_id,
                        recorded = winner,
                        orphan = delivered.destination_message_id,
                        "message already recorded, keeping existing copy"
                    );
                }
                Ok(Some(winner))
            },
            Err(e) => {
                warn!(
                    origin_chat_id = message.chat_id,
                    message_id = message.message_id,
                    destination_chat_id = target.chat_id,
                    error = %e,
                    "failed to record delivered message"
                );
                Ok(Some(delivered.destination_message_id))
            },
        }
    }

    /// Like [`Self::deliver_and_record`], but returns the existing copy when
    /// the message was already delivered to `target`.
    pub async fn deliver_once(
        &self,
        message: &SourceMessage,
        target: &DestinationTarget,
        reply_anchor: Option<MessageId>,
    ) -> Result<Option<MessageId>, DeliveryFailure> {
        let key = RecordKey::new(message.chat_id, message.message_id, target.chat_id);
        match self.identity.get(&key).await {
            Ok(Some(existing)) => {
                debug!(
                    origin_chat_id = message.chat_id,
                    message_id = message.message_id,
                    destination_chat_id = target.chat_id,
                    "message already delivered"
                );
                return Ok(Some(existing));
            },
            Ok(None) => {},
            Err(e) => warn!(
                origin_chat_id = message.chat_id,
                message_id = message.message_id,
                error = %e,
                "identity lookup failed, delivering anyway"
            ),
        }
        self.deliver_and_record(message, target, reply_anchor).await
    }

    /// Propagate an edit of `message` to every recorded copy. Returns the
    /// number of copies updated.
    pub async fn apply_edit(&self, message: &SourceMessage) -> usize {
        let Some(text) = self.compose_text(message) else {
            debug!(
                origin_chat_id = message.chat_id,
                message_id = message.message_id,
                "edit without text, nothing to update"
            );
            return 0;
        };

        let records = match self
            .identity
            .records_for_origin(message.chat_id, message.message_id)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                warn!(
                    origin_chat_id = message.chat_id,
                    message_id = message.message_id,
                    error = %e,
                    "failed to look up copies for edit"
                );
                return 0;
            },
        };

        let mut updated = 0;
        for record in records {
            let chat = record.key.destination_chat_id;
            let id = record.destination_message_id;
            match self
                .governor
                .execute("edit_text", || self.sender.edit_text(chat, id, &text))
                .await
            {
                Ok(()) => updated += 1,
                Err(e) => debug!(
                    origin_chat_id = message.chat_id,
                    message_id = message.message_id,
                    destination_chat_id = chat,
                    error = %e,
                    "copy not editable"
                ),
            }
        }
        updated
    }

    async fn recreate(
        &self,
        message: &SourceMessage,
        media: &MediaRef,
        target: &DestinationTarget,
        reply_anchor: Option<MessageId>,
    ) -> Result<MessageId, PlatformError> {
        let payload = self
            .governor
            .execute("download_media", || self.origin.download_media(media))
            .await?;
        let caption = self.compose_text(message);
        self.governor
            .execute("send_file", || {
                self.sender
                    .send_file(target.chat_id, &payload, caption.as_deref(), reply_anchor)
            })
            .await
    }

    /// Attribution header plus body, if there is anything to say.
    fn compose_text(&self, message: &SourceMessage) -> Option<String> {
        let header = self
            .config
            .attribution_header
            .then(|| attribution_header(message))
            .flatten();
        match (header, message.body()) {
            (Some(h), Some(body)) => Some(format!("{h}\n{body}")),
            (Some(h), None) => Some(h),
            (None, Some(body)) => Some(body.to_string()),
            (None, None) => None,
        }
    }

    fn text_only_body(&self, message: &SourceMessage) -> String {
        if message.body().is_some() {
            return self.compose_text(message).unwrap_or_default();
        }
        let kind = message
            .media
            .as_ref()
            .map_or(MediaKind::Other, |m| m.kind);
        let placeholder = self.config.placeholder_text.replace("{kind}", kind.as_str());
        match self.compose_text(message) {
            Some(header) => format!("{header}\n{placeholder}"),
            None => placeholder,
        }
    }

    async fn succeed(
        &self,
        message: &SourceMessage,
        target: &DestinationTarget,
        destination_message_id: MessageId,
        strategy: Strategy,
    ) -> Delivered {
        info!(
            origin_chat_id = message.chat_id,
            message_id = message.message_id,
            target = %target.name,
            destination_chat_id = target.chat_id,
            destination_message_id,
            %strategy,
            "message relayed"
        );
        #[cfg(feature = "metrics")]
        counter!(relay_metrics::DELIVERIES_TOTAL, "strategy" => strategy.as_str()).increment(1);

        self.record(DeliveryOutcome {
            timestamp: Utc::now(),
            origin_chat_id: message.chat_id,
            message_id: message.message_id,
            destination_chat_id: target.chat_id,
            destination_message_id: Some(destination_message_id),
            strategy,
            status: OutcomeStatus::Delivered,
            detail: None,
        })
        .await;

        Delivered {
            destination_message_id,
            strategy,
        }
    }

    async fn fail(
        &self,
        message: &SourceMessage,
        target: &DestinationTarget,
        reason: String,
    ) -> DeliveryFailure {
        warn!(
            origin_chat_id = message.chat_id,
            message_id = message.message_id,
            target = %target.name,
            %reason,
            "all delivery strategies failed"
        );
        #[cfg(feature = "metrics")]
        counter!(relay_metrics::DELIVERY_FAILURES_TOTAL).increment(1);

        if self.config.failure_notice {
            let notice = failure_notice(message);
            // Best effort: the notice itself may fail for the same reason.
            if let Err(e) = self
                .governor
                .execute("failure_notice", || {
                    self.sender.send_text(target.chat_id, &notice, None)
                })
                .await
            {
                debug!(
                    destination_chat_id = target.chat_id,
                    error = %e,
                    "failure notice not delivered"
                );
            }
        }

        self.record(DeliveryOutcome {
            timestamp: Utc::now(),
            origin_chat_id: message.chat_id,
            message_id: message.message_id,
            destination_chat_id: target.chat_id,
            destination_message_id: None,
            strategy: Strategy::FailureNotice,
            status: OutcomeStatus::Failed,
            detail: Some(reason.clone()),
        })
        .await;

        DeliveryFailure {
            origin_chat_id: message.chat_id,
            message_id: message.message_id,
            destination_chat_id: target.chat_id,
            reason,
        }
    }

    async fn record(&self, outcome: DeliveryOutcome) {
        if let Err(e) = self.outcomes.append(outcome).await {
            warn!(error = %e, "failed to append delivery outcome");
        }
    }
}

/// `🚀 {chat title} — {sender}:` with whichever parts are known.
fn attribution_header(message: &SourceMessage) -> Option<String> {
    let title = message.chat_title.as_deref().filter(|t| !t.is_empty());
    let sender = message.sender_name.as_deref().filter(|s| !s.is_empty());
    match (title, sender) {
        (Some(t), Some(s)) if t != s => Some(format!("🚀 {t} — {s}:")),
        (Some(t), _) => Some(format!("🚀 {t}:")),
        (None, Some(s)) => Some(format!("🚀 {s}:")),
        (None, None) => None,
    }
}

fn failure_notice(message: &SourceMessage) -> String {
    let origin = message
        .chat_title
        .as_deref()
        .map_or_else(|| message.chat_id.to_string(), |t| format!("{t} ({})", message.chat_id));
    format!(
        "⚠️ Could not relay message {} from {origin}, sent {}.",
        message.message_id,
        message.date.format("%Y-%m-%d %H:%M:%S UTC"),
    )
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            fake::{Call, FakeSession},
            identity::InMemoryIdentityMap,
            outcome::InMemoryOutcomeLog,
            types::MediaRef,
        },
    };

    struct Harness {
        session: Arc<FakeSession>,
        identity: Arc<InMemoryIdentityMap>,
        outcomes: Arc<InMemoryOutcomeLog>,
        pipeline: DeliveryPipeline,
    }

    fn harness(config: DeliveryConfig) -> Harness {
        let session = Arc::new(FakeSession::new());
        let identity = Arc::new(InMemoryIdentityMap::new());
        let outcomes = Arc::new(InMemoryOutcomeLog::new());
        let pipeline = DeliveryPipeline::new(
            session.clone(),
            session.clone(),
            identity.clone(),
            outcomes.clone(),
        )
        .with_config(config);
        Harness {
            session,
            identity,
            outcomes,
            pipeline,
        }
    }

    fn target() -> DestinationTarget {
        DestinationTarget::new("posts", 500)
    }

    fn photo() -> MediaRef {
        MediaRef {
            kind: MediaKind::Photo,
            file_id: "photo-1".into(),
            file_name: None,
            mime_type: Some("image/jpeg".into()),
            size: Some(1024),
        }
    }

    #[tokio::test]
    async fn native_transfer_wins_first() {
        let h = harness(DeliveryConfig::default());
        let msg = SourceMessage::text(100, 1, "hello");

        let delivered = h.pipeline.deliver(&msg, &target(), None).await.unwrap().unwrap();

        assert_eq!(delivered.strategy, Strategy::NativeTransfer);
        assert_eq!(h.session.calls().len(), 1);
        let outcomes = h.outcomes.snapshot();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, OutcomeStatus::Delivered);
        assert_eq!(outcomes[0].strategy, Strategy::NativeTransfer);
    }

    #[tokio::test]
    async fn empty_message_is_a_no_op() {
        let h = harness(DeliveryConfig::default());
        let mut msg = SourceMessage::text(100, 1, "");
        msg.text = None;

        assert_eq!(h.pipeline.deliver(&msg, &target(), None).await.unwrap(), None);
        assert!(h.session.calls().is_empty());
        assert!(h.outcomes.snapshot().is_empty());
    }

    #[tokio::test]
    async fn text_message_never_touches_media_steps() {
        let h = harness(DeliveryConfig::default());
        h.session.fail_native_transfer(PlatformError::transient("forwarding disabled"));
        let msg = SourceMessage::text(100, 1, "hello");

        let delivered = h.pipeline.deliver(&msg, &target(), None).await.unwrap().unwrap();

        assert_eq!(delivered.strategy, Strategy::TextOnly);
        assert!(
            !h.session
                .calls()
                .iter()
                .any(|c| matches!(c, Call::Download { .. } | Call::SendFile { .. }))
        );
    }

    #[tokio::test]
    async fn text_failure_ends_in_failure_notice() {
        let h = harness(DeliveryConfig::default());
        h.session.fail_native_transfer(PlatformError::transient("disabled"));
        h.session.fail_send_text_times(1, PlatformError::transient("chat write forbidden"));
        let msg = SourceMessage::text(100, 7, "hello");

        let failure = h.pipeline.deliver(&msg, &target(), None).await.unwrap_err();

        assert_eq!(failure.message_id, 7);
        assert!(failure.reason.contains("chat write forbidden"));
        let notice = h.session.sent_texts().pop().unwrap();
        assert!(notice.1.contains("Could not relay message 7"));
        let outcomes = h.outcomes.snapshot();
        assert_eq!(outcomes[0].status, OutcomeStatus::Failed);
        assert_eq!(outcomes[0].strategy, Strategy::FailureNotice);
        assert_eq!(outcomes[0].destination_message_id, None);
    }

    #[tokio::test]
    async fn failure_reason_names_every_failed_strategy() {
        let h = harness(DeliveryConfig::default());
        h.session.fail_native_transfer(PlatformError::transient("disabled"));
        h.session
            .fail_downloads(PlatformError::permanent_source("file gone"));
        h.session.fail_send_text_times(1, PlatformError::transient("chat write forbidden"));
        let msg = SourceMessage::text(100, 8, "look").with_media(photo());

        let failure = h.pipeline.deliver(&msg, &target(), None).await.unwrap_err();

        assert_eq!(
            failure.reason,
            "native_transfer: transient platform error: disabled; \
             content_recreation: source unavailable: file gone; \
             text_only: transient platform error: chat write forbidden"
        );
        let outcomes = h.outcomes.snapshot();
        assert_eq!(outcomes[0].detail.as_deref(), Some(failure.reason.as_str()));
    }

    #[tokio::test]
    async fn failure_notice_errors_are_swallowed() {
        let h = harness(DeliveryConfig::default());
        h.session.fail_native_transfer(PlatformError::transient("disabled"));
        h.session.fail_send_text_times(2, PlatformError::transient("down"));
        let msg = SourceMessage::text(100, 7, "hello");

        assert!(h.pipeline.deliver(&msg, &target(), None).await.is_err());
        assert_eq!(h.outcomes.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn media_is_recreated_with_caption_and_anchor() {
        let h = harness(DeliveryConfig {
            native_transfer: false,
            ..DeliveryConfig::default()
        });
        let mut msg = SourceMessage::text(100, 3, "look").with_media(photo());
        msg.chat_title = Some("Tips".into());
        msg.sender_name = Some("Ana".into());

        let delivered = h
            .pipeline
            .deliver(&msg, &target(), Some(77))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(delivered.strategy, Strategy::ContentRecreation);
        let file = h
            .session
            .calls()
            .into_iter()
            .find_map(|c| match c {
                Call::SendFile {
                    caption, reply_to, ..
                } => Some((caption, reply_to)),
                _ => None,
            })
            .unwrap();
        assert_eq!(file.0.as_deref(), Some("🚀 Tips — Ana:\nlook"));
        assert_eq!(file.1, Some(77));
    }

    #[tokio::test]
    async fn unsupported_media_degrades_to_placeholder() {
        let h = harness(DeliveryConfig {
            native_transfer: false,
            attribution_header: false,
            ..DeliveryConfig::default()
        });
        h.session
            .fail_downloads(PlatformError::unsupported_content("file is too big"));
        let mut msg = SourceMessage::text(100, 4, "").with_media(photo());
        msg.text = None;

        let delivered = h.pipeline.deliver(&msg, &target(), None).await.unwrap().unwrap();

        assert_eq!(delivered.strategy, Strategy::TextOnly);
        let (_, text) = h.session.sent_texts().pop().unwrap();
        assert_eq!(text, "📎 photo could not be relayed");
    }

    #[tokio::test]
    async fn deliver_and_record_writes_identity() {
        let h = harness(DeliveryConfig::default());
        let msg = SourceMessage::text(100, 1, "hello");

        let id = h
            .pipeline
            .deliver_and_record(&msg, &target(), None)
            .await
            .unwrap()
            .unwrap();

        let key = RecordKey::new(100, 1, 500);
        assert_eq!(h.identity.get(&key).await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn deliver_once_reuses_existing_record() {
        let h = harness(DeliveryConfig::default());
        let msg = SourceMessage::text(100, 1, "hello");
        h.identity
            .insert_if_absent(&RecordKey::new(100, 1, 500), 4242)
            .await
            .unwrap();

        let id = h.pipeline.deliver_once(&msg, &target(), None).await.unwrap();

        assert_eq!(id, Some(4242));
        assert!(h.session.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_is_absorbed_by_the_governor() {
        let h = harness(DeliveryConfig::default());
        h.session.rate_limit_native_transfer_once(std::time::Duration::from_secs(2));
        let msg = SourceMessage::text(100, 1, "hello");

        let delivered = h.pipeline.deliver(&msg, &target(), None).await.unwrap().unwrap();

        assert_eq!(delivered.strategy, Strategy::NativeTransfer);
        let transfers = h
            .session
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::NativeTransfer { .. }))
            .count();
        assert_eq!(transfers, 2);
    }

    #[tokio::test]
    async fn edits_update_recorded_copies() {
        let h = harness(DeliveryConfig {
            attribution_header: false,
            ..DeliveryConfig::default()
        });
        let msg = SourceMessage::text(100, 1, "hello");
        h.pipeline
            .deliver_and_record(&msg, &target(), None)
            .await
            .unwrap();

        let edited = SourceMessage::text(100, 1, "hello, edited");
        assert_eq!(h.pipeline.apply_edit(&edited).await, 1);
        assert!(h.session.calls().iter().any(|c| matches!(
            c,
            Call::EditText { text, .. } if text == "hello, edited"
        )));
    }

    #[test]
    fn header_uses_known_parts() {
        let mut msg = SourceMessage::text(1, 1, "x");
        assert_eq!(attribution_header(&msg), None);
        msg.chat_title = Some("Tips".into());
        assert_eq!(attribution_header(&msg).as_deref(), Some("🚀 Tips:"));
        msg.sender_name = Some("Tips".into());
        assert_eq!(attribution_header(&msg).as_deref(), Some("🚀 Tips:"));
        msg.sender_name = Some("Ana".into());
        assert_eq!(attribution_header(&msg).as_deref(), Some("🚀 Tips — Ana:"));
    }
}
