use std::time::Duration;

use {
    async_trait::async_trait,
    teloxide::{
        RequestError,
        prelude::*,
        types::{AllowedUpdate, UpdateKind},
    },
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use threadrelay_metrics::{counter, telegram as tg_metrics};

use threadrelay_core::{
    Result,
    session::{EventSource, InboundEvent},
};

use crate::{convert, error::is_conflict, session::TelegramSession, state::ObservedMessages};

/// Pause after a failed `getUpdates` call.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

const EVENT_BUFFER: usize = 256;

#[async_trait]
impl EventSource for TelegramSession {
    async fn listen(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<InboundEvent>> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let poller = Poller {
            account_id: self.account_id.clone(),
            bot: self.bot.clone(),
            timeout_secs: self.poll_timeout_secs,
            observed: self.observed.clone(),
            tx,
        };
        tokio::spawn(poller.run(cancel));
        Ok(rx)
    }
}

struct Poller {
    account_id: String,
    bot: Bot,
    timeout_secs: u32,
    observed: std::sync::Arc<ObservedMessages>,
    tx: mpsc::Sender<InboundEvent>,
}

impl Poller {
    async fn run(self, cancel: CancellationToken) {
        let aid = self.account_id.as_str();
        info!(account_id = aid, "starting telegram polling loop");
        let mut offset: i32 = 0;

        loop {
            let request = self
                .bot
                .get_updates()
                .offset(offset)
                .timeout(self.timeout_secs)
                .allowed_updates(vec![
                    AllowedUpdate::Message,
                    AllowedUpdate::EditedMessage,
                    AllowedUpdate::ChannelPost,
                    AllowedUpdate::EditedChannelPost,
                ]);

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                result = request.send() => result,
            };

            match result {
                Ok(updates) => {
                    debug!(account_id = aid, count = updates.len(), "got telegram updates");
                    for update in updates {
                        offset = update.id.as_offset();
                        #[cfg(feature = "metrics")]
                        counter!(tg_metrics::UPDATES_RECEIVED_TOTAL, "account_id" => self.account_id.clone())
                            .increment(1);

                        let Some(event) = self.event(update.kind) else {
                            continue;
                        };
                        if self.tx.send(event).await.is_err() {
                            debug!(account_id = aid, "event receiver dropped, polling stopped");
                            return;
                        }
                    }
                },
                Err(e) => {
                    #[cfg(feature = "metrics")]
                    counter!(tg_metrics::POLLING_ERRORS_TOTAL, "account_id" => self.account_id.clone())
                        .increment(1);

                    if is_conflict(&e) {
                        warn!(
                            account_id = aid,
                            "telegram polling stopped: another instance is running with this token"
                        );
                        let _ = self
                            .tx
                            .send(InboundEvent::Disconnected {
                                reason: conflict_reason(&e),
                            })
                            .await;
                        return;
                    }

                    warn!(account_id = aid, error = %e, "telegram getUpdates failed");
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(POLL_ERROR_BACKOFF) => {},
                    }
                },
            }
        }
        info!(account_id = aid, "telegram polling stopped");
    }

    fn event(&self, kind: UpdateKind) -> Option<InboundEvent> {
        match kind {
            UpdateKind::Message(msg) | UpdateKind::ChannelPost(msg) => Some(InboundEvent::Message(
                convert::observe(&msg, &self.observed),
            )),
            UpdateKind::EditedMessage(msg) | UpdateKind::EditedChannelPost(msg) => Some(
                InboundEvent::Edited(convert::observe(&msg, &self.observed)),
            ),
            other => {
                debug!(
                    account_id = self.account_id,
                    "ignoring unsupported update: {other:?}"
                );
                None
            },
        }
    }
}

fn conflict_reason(error: &RequestError) -> String {
    format!("another bot instance is polling with this token ({error})")
}
