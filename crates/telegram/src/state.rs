use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use threadrelay_core::{ChatId, MessageId, SourceMessage};

/// Default number of observed messages kept per account.
pub const DEFAULT_OBSERVED_CAPACITY: usize = 2048;

/// Messages seen by one account's poller.
///
/// The Bot API cannot read chat history, so the poller keeps what it saw:
/// recent messages (served by `fetch_message`) and the thread roots of
/// discussion chats, mapping the automatic copy of a channel post to the
/// post's id. Both are bounded FIFO buffers.
pub struct ObservedMessages {
    capacity: usize,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    messages: HashMap<(ChatId, MessageId), SourceMessage>,
    message_order: VecDeque<(ChatId, MessageId)>,
    /// `(discussion chat, copy id)` → `(channel, post id)`
    roots: HashMap<(ChatId, MessageId), (ChatId, MessageId)>,
    root_order: VecDeque<(ChatId, MessageId)>,
}

impl Default for ObservedMessages {
    fn default() -> Self {
        Self::new(DEFAULT_OBSERVED_CAPACITY)
    }
}

impl ObservedMessages {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Remember `message`, replacing an earlier version (edits).
    pub fn remember(&self, message: &SourceMessage) {
        let key = (message.chat_id, message.message_id);
        let mut inner = self.lock();
        if inner.messages.insert(key, message.clone()).is_none() {
            inner.message_order.push_back(key);
            while inner.message_order.len() > self.capacity {
                if let Some(old) = inner.message_order.pop_front() {
                    inner.messages.remove(&old);
                }
            }
        }
    }

    pub fn get(&self, chat: ChatId, message_id: MessageId) -> Option<SourceMessage> {
        self.lock().messages.get(&(chat, message_id)).cloned()
    }

    /// Record that `copy_id` in `discussion` is the automatic copy of
    /// `post_id` in `channel`.
    pub fn remember_root(
        &self,
        discussion: ChatId,
        copy_id: MessageId,
        channel: ChatId,
        post_id: MessageId,
    ) {
        let key = (discussion, copy_id);
        let mut inner = self.lock();
        if inner.roots.insert(key, (channel, post_id)).is_none() {
            inner.root_order.push_back(key);
            while inner.root_order.len() > self.capacity {
                if let Some(old) = inner.root_order.pop_front() {
                    inner.roots.remove(&old);
                }
            }
        }
    }

    /// Channel post behind a thread root of `discussion`.
    pub fn root(&self, discussion: ChatId, copy_id: MessageId) -> Option<(ChatId, MessageId)> {
        self.lock().roots.get(&(discussion, copy_id)).copied()
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
