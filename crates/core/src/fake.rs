//! Scriptable in-memory session. No platform behind it, for tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use {async_trait::async_trait, tokio::sync::mpsc, tokio_util::sync::CancellationToken};

use crate::{
    Error, Result,
    error::PlatformError,
    session::{
        EventSource, InboundEvent, OriginReader, PlatformResult, Sender, Session, SessionProvider,
    },
    types::{ChatId, MediaPayload, MediaRef, MessageId, SourceMessage},
};

/// A platform call observed by the fake, successful or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    NativeTransfer {
        to: ChatId,
        from: ChatId,
        message_id: MessageId,
        reply_to: Option<MessageId>,
    },
    SendText {
        to: ChatId,
        text: String,
        reply_to: Option<MessageId>,
    },
    SendFile {
        to: ChatId,
        file_name: String,
        caption: Option<String>,
        reply_to: Option<MessageId>,
    },
    EditText {
        chat: ChatId,
        message_id: MessageId,
        text: String,
    },
    Download {
        file_id: String,
    },
    Fetch {
        chat: ChatId,
        message_id: MessageId,
    },
    LinkedChat {
        chat: ChatId,
    },
}

/// A message the fake created in a destination chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub chat: ChatId,
    pub id: MessageId,
    pub text: Option<String>,
    pub reply_to: Option<MessageId>,
    /// Origin message when created by native transfer.
    pub transferred_from: Option<(ChatId, MessageId)>,
}

#[derive(Default)]
struct Script {
    calls: Vec<Call>,
    sent: Vec<SentMessage>,
    native_failure: Option<PlatformError>,
    native_rate_limits: VecDeque<Duration>,
    send_text_failures: VecDeque<PlatformError>,
    send_file_failure: Option<PlatformError>,
    download_failure: Option<PlatformError>,
    messages: HashMap<(ChatId, MessageId), SourceMessage>,
    linked: HashMap<ChatId, ChatId>,
    linked_failure: Option<PlatformError>,
    inbound: Option<mpsc::Sender<InboundEvent>>,
    listens: usize,
}

/// In-memory stand-in for a connected account session.
pub struct FakeSession {
    next_id: AtomicI64,
    latency: Duration,
    script: Mutex<Script>,
}

impl Default for FakeSession {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSession {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1000),
            latency: Duration::ZERO,
            script: Mutex::new(Script::default()),
        }
    }

    /// Suspend inside every platform call, to force task interleaving.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn create(
        &self,
        chat: ChatId,
        text: Option<String>,
        reply_to: Option<MessageId>,
        transferred_from: Option<(ChatId, MessageId)>,
    ) -> MessageId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.script().sent.push(SentMessage {
            chat,
            id,
            text,
            reply_to,
            transferred_from,
        });
        id
    }

    // ── scripting ───────────────────────────────────────────────────────────

    /// Every native transfer fails with `error`.
    pub fn fail_native_transfer(&self, error: PlatformError) {
        self.script().native_failure = Some(error);
    }

    /// The next native transfer is rate limited once.
    pub fn rate_limit_native_transfer_once(&self, wait: Duration) {
        self.script().native_rate_limits.push_back(wait);
    }

    /// The next `times` text sends fail with `error`.
    pub fn fail_send_text_times(&self, times: usize, error: PlatformError) {
        let mut script = self.script();
        for _ in 0..times {
            script.send_text_failures.push_back(error.clone());
        }
    }

    pub fn fail_send_file(&self, error: PlatformError) {
        self.script().send_file_failure = Some(error);
    }

    pub fn fail_downloads(&self, error: PlatformError) {
        self.script().download_failure = Some(error);
    }

    pub fn fail_linked_chat(&self, error: PlatformError) {
        self.script().linked_failure = Some(error);
    }

    /// Make `message` fetchable from its origin chat.
    pub fn store_message(&self, message: SourceMessage) {
        self.script()
            .messages
            .insert((message.chat_id, message.message_id), message);
    }

    pub fn link_chat(&self, chat: ChatId, companion: ChatId) {
        self.script().linked.insert(chat, companion);
    }

    /// Push an event to the active listener. Returns `false` when nobody
    /// listens.
    pub async fn emit(&self, event: InboundEvent) -> bool {
        let tx = self.script().inbound.clone();
        match tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    // ── inspection ──────────────────────────────────────────────────────────

    pub fn calls(&self) -> Vec<Call> {
        self.script().calls.clone()
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.script().sent.clone()
    }

    /// Successful text sends as `(chat, text)`.
    pub fn sent_texts(&self) -> Vec<(ChatId, String)> {
        self.script()
            .sent
            .iter()
            .filter_map(|m| m.text.clone().map(|t| (m.chat, t)))
            .collect()
    }

    /// Messages created in `chat`.
    pub fn sent_to(&self, chat: ChatId) -> Vec<SentMessage> {
        self.script()
            .sent
            .iter()
            .filter(|m| m.chat == chat)
            .cloned()
            .collect()
    }

    pub fn listen_count(&self) -> usize {
        self.script().listens
    }
}

#[async_trait]
impl Sender for FakeSession {
    async fn native_transfer(
        &self,
        to: ChatId,
        from: ChatId,
        message_id: MessageId,
        reply_to: Option<MessageId>,
    ) -> PlatformResult<MessageId> {
        let failure = {
            let mut script = self.script();
            script.calls.push(Call::NativeTransfer {
                to,
                from,
                message_id,
                reply_to,
            });
            match script.native_rate_limits.pop_front() {
                Some(wait) => Some(PlatformError::RateLimited { wait }),
                None => script.native_failure.clone(),
            }
        };
        self.pause().await;
        if let Some(e) = failure {
            return Err(e);
        }
        Ok(self.create(to, None, reply_to, Some((from, message_id))))
    }

    async fn send_text(
        &self,
        to: ChatId,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> PlatformResult<MessageId> {
        let failure = {
            let mut script = self.script();
            script.calls.push(Call::SendText {
                to,
                text: text.to_string(),
                reply_to,
            });
            script.send_text_failures.pop_front()
        };
        self.pause().await;
        if let Some(e) = failure {
            return Err(e);
        }
        Ok(self.create(to, Some(text.to_string()), reply_to, None))
    }

    async fn send_file(
        &self,
        to: ChatId,
        media: &MediaPayload,
        caption: Option<&str>,
        reply_to: Option<MessageId>,
    ) -> PlatformResult<MessageId> {
        let failure = {
            let mut script = self.script();
            script.calls.push(Call::SendFile {
                to,
                file_name: media.file_name.clone(),
                caption: caption.map(str::to_string),
                reply_to,
            });
            script.send_file_failure.clone()
        };
        self.pause().await;
        if let Some(e) = failure {
            return Err(e);
        }
        Ok(self.create(to, caption.map(str::to_string), reply_to, None))
    }

    async fn edit_text(&self, chat: ChatId, message_id: MessageId, text: &str) -> PlatformResult<()> {
        let mut script = self.script();
        script.calls.push(Call::EditText {
            chat,
            message_id,
            text: text.to_string(),
        });
        match script
            .sent
            .iter_mut()
            .find(|m| m.chat == chat && m.id == message_id)
        {
            Some(sent) => {
                sent.text = Some(text.to_string());
                Ok(())
            },
            None => Err(PlatformError::permanent_source("message to edit not found")),
        }
    }
}

#[async_trait]
impl OriginReader for FakeSession {
    async fn fetch_message(
        &self,
        chat: ChatId,
        message_id: MessageId,
    ) -> PlatformResult<SourceMessage> {
        let found = {
            let mut script = self.script();
            script.calls.push(Call::Fetch { chat, message_id });
            script.messages.get(&(chat, message_id)).cloned()
        };
        self.pause().await;
        found.ok_or_else(|| PlatformError::permanent_source("message not found"))
    }

    async fn download_media(&self, media: &MediaRef) -> PlatformResult<MediaPayload> {
        let failure = {
            let mut script = self.script();
            script.calls.push(Call::Download {
                file_id: media.file_id.clone(),
            });
            script.download_failure.clone()
        };
        self.pause().await;
        if let Some(e) = failure {
            return Err(e);
        }
        Ok(MediaPayload {
            kind: media.kind,
            file_name: media
                .file_name
                .clone()
                .unwrap_or_else(|| format!("{}.bin", media.file_id)),
            mime_type: media.mime_type.clone(),
            bytes: media.file_id.as_bytes().to_vec(),
        })
    }

    async fn linked_chat(&self, chat: ChatId) -> PlatformResult<Option<ChatId>> {
        let result = {
            let mut script = self.script();
            script.calls.push(Call::LinkedChat { chat });
            match script.linked_failure.clone() {
                Some(e) => Err(e),
                None => Ok(script.linked.get(&chat).copied()),
            }
        };
        self.pause().await;
        result
    }
}

#[async_trait]
impl EventSource for FakeSession {
    async fn listen(&self, _cancel: CancellationToken) -> Result<mpsc::Receiver<InboundEvent>> {
        let (tx, rx) = mpsc::channel(64);
        let mut script = self.script();
        script.inbound = Some(tx);
        script.listens += 1;
        Ok(rx)
    }
}

/// Hands out [`FakeSession`]s by account id and counts connects.
#[derive(Default)]
pub struct FakeProvider {
    sessions: HashMap<String, Arc<FakeSession>>,
    connects: AtomicI64,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_account(mut self, account_id: &str, session: Arc<FakeSession>) -> Self {
        self.sessions.insert(account_id.to_string(), session);
        self
    }

    pub fn connect_count(&self) -> i64 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionProvider for FakeProvider {
    async fn connect(&self, account_id: &str) -> Result<Session> {
        let session = self
            .sessions
            .get(account_id)
            .ok_or_else(|| Error::unknown_account(account_id))?;
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Session {
            account_id: account_id.to_string(),
            sender: session.clone(),
            origin: session.clone(),
            events: session.clone(),
        })
    }
}
