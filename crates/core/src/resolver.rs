//! Anchor resolution for thread replies.
//!
//! A reply in a companion chat refers to an origin post by its origin id. The
//! destination copy of that post has a different id; the resolver finds it in
//! the Identity Map or, when the post was never relayed, delivers the post
//! first (lazy backfill) so the reply has something to hang off.

use std::sync::Arc;

use tracing::{debug, info, warn};

#[cfg(feature = "metrics")]
use threadrelay_metrics::{counter, relay as relay_metrics};

use crate::{
    identity::RecordKey,
    locks::{KeyedGuard, KeyedLocks},
    pipeline::DeliveryPipeline,
    types::{ChatId, MessageId, SourceBinding, SourceMessage},
};

/// Lock key for one origin post: `(origin chat, post id)`.
pub type PostKey = (ChatId, MessageId);

pub struct ThreadResolver {
    pipeline: Arc<DeliveryPipeline>,
    locks: Arc<KeyedLocks<PostKey>>,
}

impl ThreadResolver {
    /// `locks` must be shared with every path that delivers origin posts to a
    /// comments target.
    pub fn new(pipeline: Arc<DeliveryPipeline>, locks: Arc<KeyedLocks<PostKey>>) -> Self {
        Self { pipeline, locks }
    }

    pub fn pipeline(&self) -> &Arc<DeliveryPipeline> {
        &self.pipeline
    }

    /// Hold the anchor lock of one origin post.
    pub async fn lock_post(&self, origin_chat_id: ChatId, post_id: MessageId) -> KeyedGuard<PostKey> {
        self.locks.lock((origin_chat_id, post_id)).await
    }

    /// Destination id the reply should point at, if one exists or can be
    /// created. Never fails: every problem degrades to `None` and the reply
    /// goes out unanchored.
    pub async fn resolve_anchor(
        &self,
        reply: &SourceMessage,
        binding: &SourceBinding,
    ) -> Option<MessageId> {
        let post_id = reply.thread.anchor_post_id()?;
        let target = binding.comments_target();
        let key = RecordKey::new(binding.origin_chat_id, post_id, target.chat_id);

        if let Some(anchor) = self.lookup(&key).await {
            return Some(anchor);
        }

        let _guard = self.lock_post(binding.origin_chat_id, post_id).await;
        // Someone may have created the anchor while we waited.
        if let Some(anchor) = self.lookup(&key).await {
            debug!(
                origin_chat_id = binding.origin_chat_id,
                post_id, anchor, "anchor created concurrently"
            );
            return Some(anchor);
        }

        self.backfill(binding, post_id, reply).await
    }

    async fn lookup(&self, key: &RecordKey) -> Option<MessageId> {
        match self.pipeline.identity().get(key).await {
            Ok(found) => found,
            Err(e) => {
                warn!(
                    origin_chat_id = key.origin_chat_id,
                    post_id = key.origin_message_id,
                    error = %e,
                    "anchor lookup failed"
                );
                None
            },
        }
    }

    async fn backfill(
        &self,
        binding: &SourceBinding,
        post_id: MessageId,
        reply: &SourceMessage,
    ) -> Option<MessageId> {
        let origin_chat_id = binding.origin_chat_id;
        let original = match self
            .pipeline
            .governor()
            .execute("fetch_message", || {
                self.pipeline.origin().fetch_message(origin_chat_id, post_id)
            })
            .await
        {
            Ok(original) => original,
            Err(e) => {
                warn!(
                    origin_chat_id,
                    post_id,
                    reply_id = reply.message_id,
                    error = %e,
                    "original post unavailable, relaying reply without anchor"
                );
                return None;
            },
        };

        #[cfg(feature = "metrics")]
        counter!(relay_metrics::BACKFILLS_TOTAL).increment(1);

        match self
            .pipeline
            .deliver_and_record(&original, binding.comments_target(), None)
            .await
        {
            Ok(Some(anchor)) => {
                info!(
                    origin_chat_id,
                    post_id,
                    anchor,
                    reply_id = reply.message_id,
                    "backfilled original post for reply"
                );
                Some(anchor)
            },
            Ok(None) => {
                debug!(origin_chat_id, post_id, "original post is empty, no anchor");
                None
            },
            Err(e) => {
                warn!(
                    origin_chat_id,
                    post_id,
                    error = %e,
                    "backfill failed, relaying reply without anchor"
                );
                None
            },
        }
    }
}
