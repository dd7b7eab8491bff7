use std::future::Future;

use {
    async_trait::async_trait,
    teloxide::{
        payloads::setters::*,
        prelude::*,
        types::{ChatId as TgChatId, InputFile, ReplyParameters},
    },
    tracing::{debug, info, warn},
};

use threadrelay_core::{
    ChatId, MessageId, PlatformError,
    session::{PlatformResult, Sender},
    types::{MediaKind, MediaPayload},
};

use crate::{
    error::{is_message_not_modified, platform_error},
    session::{TelegramSession, tg_message_id},
};

/// Maximum characters in one text message.
pub const TELEGRAM_MAX_MESSAGE_LEN: usize = 4096;

/// Maximum characters in a media caption.
pub const TELEGRAM_CAPTION_LIMIT: usize = 1024;

/// Split `text` into chunks of at most `max_chars` characters, preferring
/// line breaks, then spaces.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    if max_chars == 0 || text.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        let Some((window_end, _)) = remaining.char_indices().nth(max_chars) else {
            chunks.push(remaining.to_string());
            break;
        };

        let window = &remaining[..window_end];
        let split_at = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&at| at > 0)
            .unwrap_or(window_end);

        chunks.push(remaining[..split_at].to_string());
        remaining = &remaining[split_at..];
        remaining = remaining
            .strip_prefix('\n')
            .or_else(|| remaining.strip_prefix(' '))
            .unwrap_or(remaining);
    }
    chunks
}

/// Longest prefix of `text` with at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

fn reply_params(reply_to: Option<MessageId>) -> PlatformResult<Option<ReplyParameters>> {
    reply_to
        .map(|id| tg_message_id(id).map(|id| ReplyParameters::new(id).allow_sending_without_reply()))
        .transpose()
}

/// Fill in the optional caption and reply target of a media request, send
/// it, and return the new message id.
macro_rules! send_media {
    ($request:expr, $caption:expr, $reply:expr) => {{
        let mut request = $request;
        if let Some(caption) = $caption {
            request = request.caption(caption);
        }
        if let Some(reply) = $reply {
            request = request.reply_parameters(reply);
        }
        request.await.map(|message| i64::from(message.id.0))
    }};
}

/// Send `chunks` in order through `send` and return the first message id.
///
/// Only a failure of the first chunk is an error: once part of the text has
/// landed, a retry of the whole text would post it twice. A later chunk gets
/// one retry after a rate-limit wait; any other failure drops the rest.
async fn send_chunks<F, Fut>(
    account_id: &str,
    to: ChatId,
    chunks: &[String],
    mut send: F,
) -> PlatformResult<MessageId>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = PlatformResult<MessageId>>,
{
    if chunks.is_empty() {
        return Err(PlatformError::unsupported_content("empty text"));
    }
    let first = send(0).await?;

    for index in 1..chunks.len() {
        let result = match send(index).await {
            Err(PlatformError::RateLimited { wait }) => {
                warn!(
                    account_id,
                    destination_chat_id = to,
                    chunk = index,
                    retry_after_ms = wait.as_millis() as u64,
                    "telegram rate limited mid-text, waiting before retry"
                );
                tokio::time::sleep(wait).await;
                send(index).await
            },
            other => other,
        };
        if let Err(e) = result {
            warn!(
                account_id,
                destination_chat_id = to,
                chunk = index,
                chunk_count = chunks.len(),
                error = %e,
                "telegram text chunk failed, dropping the rest"
            );
            break;
        }
    }
    Ok(first)
}

#[async_trait]
impl Sender for TelegramSession {
    async fn native_transfer(
        &self,
        to: ChatId,
        from: ChatId,
        message_id: MessageId,
        reply_to: Option<MessageId>,
    ) -> PlatformResult<MessageId> {
        let source_id = tg_message_id(message_id)?;
        let sent = match reply_params(reply_to)? {
            // A forward cannot carry a reply target; a copy can.
            Some(reply) => self
                .bot
                .copy_message(TgChatId(to), TgChatId(from), source_id)
                .reply_parameters(reply)
                .await
                .map(|id| i64::from(id.0)),
            None => self
                .bot
                .forward_message(TgChatId(to), TgChatId(from), source_id)
                .await
                .map(|message| i64::from(message.id.0)),
        };
        let sent = sent.map_err(|e| platform_error(&e))?;
        debug!(
            account_id = self.account_id,
            destination_chat_id = to,
            origin_chat_id = from,
            message_id,
            sent,
            reply_to = ?reply_to,
            "telegram native transfer"
        );
        Ok(sent)
    }

    async fn send_text(
        &self,
        to: ChatId,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> PlatformResult<MessageId> {
        let chunks = chunk_text(text, TELEGRAM_MAX_MESSAGE_LEN);
        let reply = reply_params(reply_to)?;
        let first = send_chunks(&self.account_id, to, &chunks, |index| {
            let mut request = self.bot.send_message(TgChatId(to), chunks[index].clone());
            // Only the first chunk is threaded.
            if index == 0
                && let Some(reply) = reply.clone()
            {
                request = request.reply_parameters(reply);
            }
            async move {
                request
                    .await
                    .map(|message| i64::from(message.id.0))
                    .map_err(|e| platform_error(&e))
            }
        })
        .await?;

        if chunks.len() > 1 {
            info!(
                account_id = self.account_id,
                destination_chat_id = to,
                text_len = text.len(),
                chunk_count = chunks.len(),
                "telegram text sent in chunks"
            );
        }
        Ok(first)
    }

    async fn send_file(
        &self,
        to: ChatId,
        media: &MediaPayload,
        caption: Option<&str>,
        reply_to: Option<MessageId>,
    ) -> PlatformResult<MessageId> {
        let chat = TgChatId(to);
        let input = InputFile::memory(media.bytes.clone()).file_name(media.file_name.clone());
        let reply = reply_params(reply_to)?;
        let caption = caption.filter(|c| !c.trim().is_empty()).map(|c| {
            let cut = truncate_chars(c, TELEGRAM_CAPTION_LIMIT);
            if cut.len() < c.len() {
                warn!(
                    account_id = self.account_id,
                    destination_chat_id = to,
                    caption_len = c.chars().count(),
                    "caption truncated to telegram limit"
                );
            }
            cut.to_string()
        });

        let bot = &self.bot;
        let sent = match media.kind {
            MediaKind::Photo => send_media!(bot.send_photo(chat, input), caption, reply),
            MediaKind::Video => send_media!(bot.send_video(chat, input), caption, reply),
            MediaKind::Audio => send_media!(bot.send_audio(chat, input), caption, reply),
            MediaKind::Voice => send_media!(bot.send_voice(chat, input), caption, reply),
            MediaKind::Animation => send_media!(bot.send_animation(chat, input), caption, reply),
            MediaKind::Sticker if caption.is_none() => {
                let mut request = bot.send_sticker(chat, input);
                if let Some(reply) = reply {
                    request = request.reply_parameters(reply);
                }
                request.await.map(|message| i64::from(message.id.0))
            },
            MediaKind::Sticker | MediaKind::Document | MediaKind::Other => {
                send_media!(bot.send_document(chat, input), caption, reply)
            },
        };
        let sent = sent.map_err(|e| platform_error(&e))?;
        debug!(
            account_id = self.account_id,
            destination_chat_id = to,
            kind = %media.kind,
            bytes = media.bytes.len(),
            sent,
            "telegram file sent"
        );
        Ok(sent)
    }

    async fn edit_text(&self, chat: ChatId, message_id: MessageId, text: &str) -> PlatformResult<()> {
        let id = tg_message_id(message_id)?;
        let text = truncate_chars(text, TELEGRAM_MAX_MESSAGE_LEN);
        match self.bot.edit_message_text(TgChatId(chat), id, text).await {
            Ok(_) => Ok(()),
            Err(e) if is_message_not_modified(&e) => {
                debug!(
                    account_id = self.account_id,
                    chat_id = chat,
                    message_id,
                    "telegram edit left text unchanged"
                );
                Ok(())
            },
            Err(e) => Err(platform_error(&e)),
        }
    }
}
