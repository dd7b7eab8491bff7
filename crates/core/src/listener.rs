//! Source Listener Pool: one listener task per account session.
//!
//! Each task owns the scope of chats its account watches (every bound origin
//! plus its companion chat) and dispatches events strictly in arrival order:
//! Dedup Guard, classification, then the Thread Resolver for replies and the
//! Delivery Pipeline for everything.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock},
};

use {
    serde::Serialize,
    tokio::{
        sync::{Mutex, RwLock, mpsc},
        task::JoinHandle,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

#[cfg(feature = "metrics")]
use threadrelay_metrics::{counter, gauge, relay as relay_metrics};

use crate::{
    Error, Result,
    dedup::DedupGuard,
    governor::RateGovernor,
    identity::IdentityMap,
    locks::KeyedLocks,
    outcome::OutcomeLog,
    pipeline::{DeliveryConfig, DeliveryPipeline},
    resolver::{PostKey, ThreadResolver},
    session::{InboundEvent, Session, SessionProvider},
    types::{ChatId, SourceBinding, SourceMessage},
};

/// Lifecycle of a registered binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingState {
    /// Registered, not yet listening (or its listener was lost).
    Unbound,
    /// Looking up the origin's companion chat.
    DiscoveringCompanion,
    /// Events for the origin and its companion are being relayed.
    Active,
}

impl BindingState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unbound => "unbound",
            Self::DiscoveringCompanion => "discovering_companion",
            Self::Active => "active",
        }
    }
}

impl std::fmt::Display for BindingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

type Scope = Arc<RwLock<HashMap<ChatId, SourceBinding>>>;
type States = Arc<StdRwLock<HashMap<ChatId, BindingState>>>;

struct AccountListener {
    session: Session,
    scope: Scope,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl AccountListener {
    /// Cancel and wait for the in-flight dispatch to finish.
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(account_id = %self.session.account_id, error = %e, "listener task failed");
        }
    }
}

/// Owns every binding and the listener tasks serving them.
pub struct ListenerPool {
    sessions: Arc<dyn SessionProvider>,
    identity: Arc<dyn IdentityMap>,
    outcomes: Arc<dyn OutcomeLog>,
    dedup: Arc<DedupGuard>,
    governor: RateGovernor,
    delivery: DeliveryConfig,
    locks: Arc<KeyedLocks<PostKey>>,
    states: States,
    /// Discovered companion per origin; `None` means the origin has none.
    companions: StdMutex<HashMap<ChatId, Option<ChatId>>>,
    listeners: Mutex<HashMap<String, AccountListener>>,
}

impl ListenerPool {
    pub fn new(
        sessions: Arc<dyn SessionProvider>,
        identity: Arc<dyn IdentityMap>,
        outcomes: Arc<dyn OutcomeLog>,
    ) -> Self {
        Self {
            sessions,
            identity,
            outcomes,
            dedup: Arc::new(DedupGuard::default()),
            governor: RateGovernor::default(),
            delivery: DeliveryConfig::default(),
            locks: Arc::new(KeyedLocks::new()),
            states: Arc::new(StdRwLock::new(HashMap::new())),
            companions: StdMutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_dedup(mut self, dedup: Arc<DedupGuard>) -> Self {
        self.dedup = dedup;
        self
    }

    pub fn with_governor(mut self, governor: RateGovernor) -> Self {
        self.governor = governor;
        self
    }

    pub fn with_delivery_config(mut self, delivery: DeliveryConfig) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn dedup(&self) -> &Arc<DedupGuard> {
        &self.dedup
    }

    /// Start relaying `binding`. Registering an origin that is already bound
    /// replaces the old binding and starts over from `Unbound`.
    pub async fn register(&self, binding: SourceBinding) -> Result<BindingState> {
        validate(&binding)?;
        let origin = binding.origin_chat_id;
        let account_id = binding.account_id.clone();

        let mut listeners = self.listeners.lock().await;
        if self.detach(&mut listeners, origin).await {
            info!(origin_chat_id = origin, "re-registering binding");
        }
        self.set_state(origin, BindingState::Unbound);

        match self.attach(&mut listeners, binding).await {
            Ok(state) => {
                info!(account_id = %account_id, origin_chat_id = origin, "binding active");
                Ok(state)
            },
            Err(e) => {
                self.clear_state(origin);
                warn!(
                    account_id = %account_id,
                    origin_chat_id = origin,
                    error = %e,
                    "binding registration failed"
                );
                Err(e)
            },
        }
    }

    /// Stop relaying `origin_chat_id`. The account's listener is cancelled
    /// once it has no bindings left. Returns `false` if nothing was bound.
    pub async fn unregister(&self, origin_chat_id: ChatId) -> bool {
        let mut listeners = self.listeners.lock().await;
        let removed = self.detach(&mut listeners, origin_chat_id).await;
        self.clear_state(origin_chat_id);
        if removed {
            info!(origin_chat_id, "binding removed");
        }
        removed
    }

    pub fn binding_state(&self, origin_chat_id: ChatId) -> Option<BindingState> {
        self.states
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&origin_chat_id)
            .copied()
    }

    /// Every registered binding, companion filled in where discovered.
    pub async fn bindings(&self) -> Vec<SourceBinding> {
        let listeners = self.listeners.lock().await;
        let mut all = Vec::new();
        for listener in listeners.values() {
            all.extend(listener.scope.read().await.values().cloned());
        }
        all.sort_by_key(|b| b.origin_chat_id);
        all
    }

    /// Number of running listener tasks.
    pub async fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .await
            .values()
            .filter(|l| !l.handle.is_finished())
            .count()
    }

    /// Stop every listener, letting in-flight dispatches complete.
    pub async fn shutdown(&self) {
        let mut listeners = self.listeners.lock().await;
        let count = listeners.len();
        for (_, listener) in listeners.drain() {
            listener.stop().await;
        }
        self.states
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        #[cfg(feature = "metrics")]
        gauge!(relay_metrics::ACTIVE_LISTENERS).set(0.0);
        info!(listeners = count, "listener pool shut down");
    }

    async fn attach(
        &self,
        listeners: &mut HashMap<String, AccountListener>,
        mut binding: SourceBinding,
    ) -> Result<BindingState> {
        let origin = binding.origin_chat_id;
        let account_id = binding.account_id.clone();

        // A listener that died on a lost connection is replaced, keeping its
        // bindings.
        let mut inherited = None;
        if listeners
            .get(&account_id)
            .is_some_and(|l| l.handle.is_finished())
            && let Some(dead) = listeners.remove(&account_id)
        {
            warn!(account_id = %account_id, "listener stopped earlier, reconnecting");
            inherited = Some(dead.scope);
        }

        let session = match listeners.get(&account_id) {
            Some(listener) => listener.session.clone(),
            None => self.sessions.connect(&account_id).await?,
        };

        self.set_state(origin, BindingState::DiscoveringCompanion);
        binding.companion_chat_id = self.discover_companion(&session, &binding).await;
        debug!(
            origin_chat_id = origin,
            companion_chat_id = ?binding.companion_chat_id,
            "companion resolved"
        );

        if let Some(listener) = listeners.get(&account_id) {
            listener.scope.write().await.insert(origin, binding);
        } else {
            let scope = inherited.unwrap_or_default();
            scope.write().await.insert(origin, binding);
            for bound in scope.read().await.keys() {
                self.set_state(*bound, BindingState::Active);
            }
            let listener = self.spawn_listener(session, scope).await?;
            listeners.insert(account_id, listener);
            #[cfg(feature = "metrics")]
            gauge!(relay_metrics::ACTIVE_LISTENERS).set(listeners.len() as f64);
        }

        self.set_state(origin, BindingState::Active);
        Ok(BindingState::Active)
    }

    /// Remove `origin` from whichever listener serves it.
    async fn detach(&self, listeners: &mut HashMap<String, AccountListener>, origin: ChatId) -> bool {
        let mut emptied = None;
        let mut removed = false;
        for (account_id, listener) in listeners.iter() {
            let mut scope = listener.scope.write().await;
            if scope.remove(&origin).is_some() {
                removed = true;
                if scope.is_empty() {
                    emptied = Some(account_id.clone());
                }
                break;
            }
        }

        if let Some(account_id) = emptied
            && let Some(listener) = listeners.remove(&account_id)
        {
            debug!(account_id = %account_id, "last binding gone, stopping listener");
            listener.stop().await;
            #[cfg(feature = "metrics")]
            gauge!(relay_metrics::ACTIVE_LISTENERS).set(listeners.len() as f64);
        }
        removed
    }

    async fn discover_companion(&self, session: &Session, binding: &SourceBinding) -> Option<ChatId> {
        let origin = binding.origin_chat_id;
        if binding.companion_chat_id.is_some() {
            return binding.companion_chat_id;
        }
        if let Some(cached) = self
            .companions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&origin)
        {
            return *cached;
        }

        match self
            .governor
            .execute("linked_chat", || session.origin.linked_chat(origin))
            .await
        {
            Ok(found) => {
                self.companions
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(origin, found);
                found
            },
            Err(e) => {
                warn!(
                    origin_chat_id = origin,
                    error = %e,
                    "companion discovery failed, relaying top-level posts only"
                );
                None
            },
        }
    }

    async fn spawn_listener(&self, session: Session, scope: Scope) -> Result<AccountListener> {
        let cancel = CancellationToken::new();
        let events = session.events.listen(cancel.clone()).await?;

        let pipeline = DeliveryPipeline::new(
            Arc::clone(&session.sender),
            Arc::clone(&session.origin),
            Arc::clone(&self.identity),
            Arc::clone(&self.outcomes),
        )
        .with_governor(self.governor)
        .with_config(self.delivery.clone());

        let dispatcher = Dispatcher {
            account_id: session.account_id.clone(),
            scope: Arc::clone(&scope),
            states: Arc::clone(&self.states),
            dedup: Arc::clone(&self.dedup),
            resolver: ThreadResolver::new(Arc::new(pipeline), Arc::clone(&self.locks)),
        };
        let handle = tokio::spawn(run_listener(dispatcher, events, cancel.clone()));
        info!(account_id = %session.account_id, "listener started");

        Ok(AccountListener {
            session,
            scope,
            cancel,
            handle,
        })
    }

    fn set_state(&self, origin: ChatId, state: BindingState) {
        self.states
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(origin, state);
    }

    fn clear_state(&self, origin: ChatId) {
        self.states
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&origin);
    }
}

fn validate(binding: &SourceBinding) -> Result<()> {
    if binding.account_id.trim().is_empty() {
        return Err(Error::configuration(format!(
            "binding for chat {} has no account",
            binding.origin_chat_id
        )));
    }
    if binding.posts.chat_id == 0 {
        return Err(Error::configuration(format!(
            "binding for chat {} has no posts destination",
            binding.origin_chat_id
        )));
    }
    let destinations = std::iter::once(&binding.posts).chain(binding.comments.as_ref());
    for target in destinations {
        if target.chat_id == binding.origin_chat_id {
            return Err(Error::configuration(format!(
                "chat {} cannot relay into itself ({} target)",
                binding.origin_chat_id, target.name
            )));
        }
    }
    Ok(())
}

/// How an inbound message relates to the listener's scope.
enum Route {
    TopLevel(SourceBinding),
    Reply(SourceBinding),
}

struct Dispatcher {
    account_id: String,
    scope: Scope,
    states: States,
    dedup: Arc<DedupGuard>,
    resolver: ThreadResolver,
}

impl Dispatcher {
    async fn route(&self, chat_id: ChatId) -> Option<Route> {
        let scope = self.scope.read().await;
        if let Some(binding) = scope.get(&chat_id) {
            return Some(Route::TopLevel(binding.clone()));
        }
        scope
            .values()
            .find(|b| b.companion_chat_id == Some(chat_id))
            .map(|b| Route::Reply(b.clone()))
    }

    async fn dispatch(&self, message: SourceMessage) {
        if self.dedup.seen((message.chat_id, message.message_id)) {
            debug!(
                account_id = %self.account_id,
                chat_id = message.chat_id,
                message_id = message.message_id,
                "duplicate event suppressed"
            );
            #[cfg(feature = "metrics")]
            counter!(relay_metrics::DEDUP_SUPPRESSED_TOTAL).increment(1);
            return;
        }

        match self.route(message.chat_id).await {
            Some(Route::TopLevel(binding)) => self.relay_post(&message, &binding).await,
            Some(Route::Reply(binding)) if message.auto_forwarded => {
                debug!(
                    origin_chat_id = binding.origin_chat_id,
                    message_id = message.message_id,
                    "skipping automatic copy of channel post"
                );
            },
            Some(Route::Reply(binding)) => self.relay_reply(&message, &binding).await,
            None => debug!(
                account_id = %self.account_id,
                chat_id = message.chat_id,
                "chat not in scope"
            ),
        }
    }

    async fn relay_post(&self, message: &SourceMessage, binding: &SourceBinding) {
        let pipeline = self.resolver.pipeline();
        let anchor_chat = binding.comments_target().chat_id;
        for target in binding.post_targets() {
            // Deliveries into the anchor chat race with backfills of the same
            // post; both go through the post lock.
            let _guard = if target.chat_id == anchor_chat {
                Some(
                    self.resolver
                        .lock_post(message.chat_id, message.message_id)
                        .await,
                )
            } else {
                None
            };
            if let Err(e) = pipeline.deliver_once(message, target, None).await {
                debug!(target = %target.name, error = %e, "post not relayed");
            }
        }
    }

    async fn relay_reply(&self, message: &SourceMessage, binding: &SourceBinding) {
        let anchor = self.resolver.resolve_anchor(message, binding).await;
        if anchor.is_none() {
            debug!(
                origin_chat_id = binding.origin_chat_id,
                message_id = message.message_id,
                "relaying reply without anchor"
            );
        }
        if let Err(e) = self
            .resolver
            .pipeline()
            .deliver_and_record(message, binding.comments_target(), anchor)
            .await
        {
            debug!(error = %e, "reply not relayed");
        }
    }

    async fn dispatch_edit(&self, message: SourceMessage) {
        match self.route(message.chat_id).await {
            Some(Route::Reply(_)) if message.auto_forwarded => {},
            Some(_) => {
                let updated = self.resolver.pipeline().apply_edit(&message).await;
                debug!(
                    chat_id = message.chat_id,
                    message_id = message.message_id,
                    updated,
                    "edit propagated"
                );
            },
            None => {},
        }
    }

    /// Dispatch one event. Returns `false` once the stream is over.
    async fn handle(&self, event: Option<InboundEvent>) -> bool {
        match event {
            Some(InboundEvent::Message(message)) => self.dispatch(message).await,
            Some(InboundEvent::Edited(message)) => self.dispatch_edit(message).await,
            Some(InboundEvent::Disconnected { reason }) => {
                error!(account_id = %self.account_id, %reason, "session disconnected");
                self.mark_unbound().await;
                return false;
            },
            None => {
                error!(account_id = %self.account_id, "event stream closed");
                self.mark_unbound().await;
                return false;
            },
        }
        true
    }

    async fn mark_unbound(&self) {
        let scope = self.scope.read().await;
        let mut states = self.states.write().unwrap_or_else(|e| e.into_inner());
        for origin in scope.keys() {
            states.insert(*origin, BindingState::Unbound);
        }
    }
}

async fn run_listener(
    dispatcher: Dispatcher,
    mut events: mpsc::Receiver<InboundEvent>,
    cancel: CancellationToken,
) {
    let account_id = dispatcher.account_id.clone();
    loop {
        // Cancellation is only observed between dispatches.
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        if !dispatcher.handle(event).await {
            info!(account_id = %account_id, "listener stopped");
            return;
        }
    }

    // The session may already have acknowledged buffered events to the
    // platform; they are dispatched before the task ends.
    events.close();
    let mut drained = 0usize;
    while let Some(event) = events.recv().await {
        if !dispatcher.handle(Some(event)).await {
            break;
        }
        drained += 1;
    }
    info!(account_id = %account_id, drained, "listener stopped");
}
