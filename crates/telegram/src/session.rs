use std::{sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    secrecy::{ExposeSecret, Secret},
    teloxide::{prelude::*, types::ChatId as TgChatId},
    tracing::{debug, info},
};

#[cfg(feature = "metrics")]
use threadrelay_metrics::{counter, telegram as tg_metrics};

use threadrelay_core::{
    ChatId, MessageId, PlatformError, SourceMessage,
    session::{OriginReader, PlatformResult},
    types::{MediaKind, MediaPayload, MediaRef},
};

use crate::{
    error::{self, Error, platform_error},
    state::ObservedMessages,
};

/// One connected bot account.
pub struct TelegramSession {
    pub(crate) account_id: String,
    pub(crate) bot: Bot,
    pub(crate) poll_timeout_secs: u32,
    pub(crate) observed: Arc<ObservedMessages>,
    http: reqwest::Client,
}

/// Bot whose HTTP client outlives a long-poll request.
///
/// teloxide brings its own reqwest major version, so the builder error is
/// carried as a message.
fn long_poll_bot(token: &Secret<String>, poll_timeout_secs: u32) -> error::Result<Bot> {
    let client = teloxide::net::default_reqwest_settings()
        .timeout(Duration::from_secs(u64::from(poll_timeout_secs) + 15))
        .build()
        .map_err(|e| Error::message(format!("failed to build telegram client: {e}")))?;
    Ok(Bot::with_client(token.expose_secret(), client))
}

impl TelegramSession {
    /// Verify the token and prepare the account for long polling.
    pub async fn connect(
        account_id: &str,
        token: &Secret<String>,
        poll_timeout_secs: u32,
        observed: Arc<ObservedMessages>,
    ) -> error::Result<Self> {
        let bot = long_poll_bot(token, poll_timeout_secs)?;

        let me = bot.get_me().await?;
        // Long polling does not work while a webhook is set.
        bot.delete_webhook().await?;

        info!(
            account_id,
            username = ?me.username,
            "telegram bot connected (webhook cleared)"
        );

        Ok(Self {
            account_id: account_id.to_string(),
            bot,
            poll_timeout_secs,
            observed,
            http: reqwest::Client::new(),
        })
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn observed(&self) -> &Arc<ObservedMessages> {
        &self.observed
    }

    async fn download(&self, file_id: &str) -> error::Result<Vec<u8>> {
        let file = self.bot.get_file(file_id).await?;
        let url = format!(
            "https://api.telegram.org/file/bot{}/{}",
            self.bot.token(),
            file.path
        );
        // The URL embeds the token; keep it out of error messages.
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(reqwest::Error::without_url)?;
        let bytes = response.bytes().await.map_err(reqwest::Error::without_url)?;
        Ok(bytes.to_vec())
    }
}

/// Telegram message ids are 32-bit.
pub(crate) fn tg_message_id(id: MessageId) -> PlatformResult<teloxide::types::MessageId> {
    i32::try_from(id)
        .map(teloxide::types::MessageId)
        .map_err(|_| PlatformError::permanent_source(format!("message id {id} out of range")))
}

/// File name used when the platform did not report one.
pub(crate) fn default_file_name(media: &MediaRef) -> String {
    if let Some(name) = &media.file_name {
        return name.clone();
    }
    let ext = match (media.kind, media.mime_type.as_deref()) {
        (MediaKind::Photo, _) => "jpg",
        (MediaKind::Voice, _) => "ogg",
        (MediaKind::Sticker, _) => "webp",
        (_, Some("video/mp4")) | (MediaKind::Video | MediaKind::Animation, None) => "mp4",
        (_, Some("audio/mpeg")) | (MediaKind::Audio, None) => "mp3",
        (_, Some("application/pdf")) => "pdf",
        _ => "bin",
    };
    format!("{}.{ext}", media.kind)
}

#[async_trait]
impl OriginReader for TelegramSession {
    async fn fetch_message(
        &self,
        chat: ChatId,
        message_id: MessageId,
    ) -> PlatformResult<SourceMessage> {
        self.observed.get(chat, message_id).ok_or_else(|| {
            debug!(
                account_id = self.account_id,
                chat_id = chat,
                message_id,
                "message not observed by this account"
            );
            PlatformError::permanent_source(format!(
                "message {message_id} in chat {chat} was not observed"
            ))
        })
    }

    async fn download_media(&self, media: &MediaRef) -> PlatformResult<MediaPayload> {
        let bytes = self.download(&media.file_id).await.map_err(|e| {
            let mapped = PlatformError::from(e);
            debug!(
                account_id = self.account_id,
                file_id = %media.file_id,
                error = %mapped,
                "media download failed"
            );
            mapped
        })?;

        #[cfg(feature = "metrics")]
        counter!(tg_metrics::DOWNLOADS_TOTAL, "kind" => media.kind.as_str()).increment(1);

        debug!(
            account_id = self.account_id,
            file_id = %media.file_id,
            bytes = bytes.len(),
            "downloaded media"
        );
        Ok(MediaPayload {
            kind: media.kind,
            file_name: default_file_name(media),
            mime_type: media.mime_type.clone(),
            bytes,
        })
    }

    async fn linked_chat(&self, chat: ChatId) -> PlatformResult<Option<ChatId>> {
        let info = self
            .bot
            .get_chat(TgChatId(chat))
            .await
            .map_err(|e| platform_error(&e))?;
        Ok(info.linked_chat_id())
    }
}

impl From<Error> for threadrelay_core::Error {
    fn from(error: Error) -> Self {
        Self::Platform(error.into())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    fn media(kind: MediaKind, name: Option<&str>, mime: Option<&str>) -> MediaRef {
        MediaRef {
            kind,
            file_id: "file".into(),
            file_name: name.map(str::to_string),
            mime_type: mime.map(str::to_string),
            size: None,
        }
    }

    #[rstest]
    #[case(media(MediaKind::Document, Some("report.pdf"), None), "report.pdf")]
    #[case(media(MediaKind::Photo, None, Some("image/jpeg")), "photo.jpg")]
    #[case(media(MediaKind::Voice, None, Some("audio/ogg")), "voice.ogg")]
    #[case(media(MediaKind::Video, None, None), "video.mp4")]
    #[case(media(MediaKind::Document, None, Some("application/pdf")), "document.pdf")]
    #[case(media(MediaKind::Other, None, None), "attachment.bin")]
    fn file_names_fall_back_to_kind(#[case] media: MediaRef, #[case] expected: &str) {
        assert_eq!(default_file_name(&media), expected);
    }

    #[test]
    fn message_ids_must_fit_32_bits() {
        assert_eq!(tg_message_id(42).unwrap(), teloxide::types::MessageId(42));
        assert!(matches!(
            tg_message_id(i64::from(i32::MAX) + 1),
            Err(PlatformError::PermanentSource { .. })
        ));
    }

    #[test]
    fn long_poll_bot_keeps_the_token() {
        let bot = long_poll_bot(&Secret::new("123:abc".to_string()), 30).unwrap();
        assert_eq!(bot.token(), "123:abc");
    }
}
