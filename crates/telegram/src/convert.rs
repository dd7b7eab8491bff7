//! Conversion from Bot API messages to relay messages.

use teloxide::types::{MediaKind as TgMediaKind, Message, MessageKind, MessageOrigin};

use threadrelay_core::{
    ChatId, MessageId, SourceMessage,
    types::{MediaKind, MediaRef, ThreadRef},
};

use crate::state::ObservedMessages;

/// Convert `msg` and remember it so later replies and backfills can find it.
///
/// Automatic copies of channel posts, whether received directly or embedded
/// as the replied-to message of a comment, also record their thread root and
/// the channel post they carry. That is the only way to learn about posts
/// sent before the poller started.
pub fn observe(msg: &Message, observed: &ObservedMessages) -> SourceMessage {
    for copy in std::iter::once(msg).chain(msg.reply_to_message()) {
        if copy.is_automatic_forward()
            && let Some(post) = channel_post_of(copy)
        {
            observed.remember_root(
                copy.chat.id.0,
                message_id(copy),
                post.chat_id,
                post.message_id,
            );
            if observed.get(post.chat_id, post.message_id).is_none() {
                observed.remember(&post);
            }
        }
    }
    let message = source_message(msg, observed);
    observed.remember(&message);
    message
}

pub fn source_message(msg: &Message, observed: &ObservedMessages) -> SourceMessage {
    SourceMessage {
        chat_id: msg.chat.id.0,
        message_id: message_id(msg),
        date: msg.date,
        chat_title: msg.chat.title().map(str::to_string),
        sender_name: sender_name(msg),
        text: msg.text().or_else(|| msg.caption()).map(str::to_string),
        media: media_ref(msg),
        thread: thread_ref(msg, observed),
        auto_forwarded: msg.is_automatic_forward(),
    }
}

/// The channel post an automatic copy was made from, in the channel's id
/// space. File ids are valid across chats, so the copy's media stands in
/// for the post's.
fn channel_post_of(copy: &Message) -> Option<SourceMessage> {
    let MessageOrigin::Channel {
        date,
        chat,
        message_id,
        author_signature,
        ..
    } = copy.forward_origin()?
    else {
        return None;
    };
    let title = chat.title().map(str::to_string);
    Some(SourceMessage {
        chat_id: chat.id.0,
        message_id: i64::from(message_id.0),
        date: *date,
        sender_name: author_signature.clone().or_else(|| title.clone()),
        chat_title: title,
        text: copy.text().or_else(|| copy.caption()).map(str::to_string),
        media: media_ref(copy),
        thread: ThreadRef::default(),
        auto_forwarded: false,
    })
}

fn message_id(msg: &Message) -> MessageId {
    i64::from(msg.id.0)
}

/// Channel post a message was copied from.
fn channel_origin(msg: &Message) -> Option<(ChatId, MessageId)> {
    match msg.forward_origin()? {
        MessageOrigin::Channel {
            chat, message_id, ..
        } => Some((chat.id.0, i64::from(message_id.0))),
        _ => None,
    }
}

/// Thread references in the origin channel's id space.
///
/// The top of the thread comes from the discussion thread id (resolved
/// through the observed roots) or from the replied-to automatic copy. The
/// parent is only reported when it is itself a channel post; ids of other
/// discussion messages mean nothing on the channel side.
fn thread_ref(msg: &Message, observed: &ObservedMessages) -> ThreadRef {
    let chat = msg.chat.id.0;
    let parent = msg.reply_to_message();

    let parent_post = parent.and_then(|p| {
        if p.is_automatic_forward() {
            channel_origin(p).map(|(_, post_id)| post_id)
        } else if msg.chat.is_channel() && p.chat.id == msg.chat.id {
            Some(i64::from(p.id.0))
        } else {
            observed
                .root(chat, i64::from(p.id.0))
                .map(|(_, post_id)| post_id)
        }
    });
    let thread_post = msg
        .thread_id
        .and_then(|thread| observed.root(chat, i64::from(thread.0.0)))
        .map(|(_, post_id)| post_id);

    ThreadRef {
        top_id: thread_post.or_else(|| parent_post.filter(|_| !msg.chat.is_channel())),
        parent_id: parent_post,
    }
}

fn sender_name(msg: &Message) -> Option<String> {
    if let Some(user) = msg.from.as_ref().filter(|u| !u.is_anonymous()) {
        let last = user.last_name.as_deref().unwrap_or("");
        let name = format!("{} {last}", user.first_name).trim().to_string();
        if !name.is_empty() {
            return Some(name);
        }
        if user.username.is_some() {
            return user.username.clone();
        }
    }
    if let Some(signature) = msg.author_signature() {
        return Some(signature.to_string());
    }
    msg.sender_chat
        .as_ref()
        .and_then(|c| c.title())
        .map(str::to_string)
}

/// Attachment carried by `msg`. Photos resolve to their largest size.
pub fn media_ref(msg: &Message) -> Option<MediaRef> {
    let MessageKind::Common(common) = &msg.kind else {
        return None;
    };
    let media = |kind, file: &teloxide::types::FileMeta, name: Option<&String>, mime: Option<String>| {
        MediaRef {
            kind,
            file_id: file.id.clone(),
            file_name: name.cloned(),
            mime_type: mime,
            size: Some(u64::from(file.size)),
        }
    };
    match &common.media_kind {
        TgMediaKind::Photo(p) => p
            .photo
            .iter()
            .max_by_key(|ps| u64::from(ps.width) * u64::from(ps.height))
            .map(|ps| media(MediaKind::Photo, &ps.file, None, Some("image/jpeg".into()))),
        TgMediaKind::Document(d) => Some(media(
            MediaKind::Document,
            &d.document.file,
            d.document.file_name.as_ref(),
            d.document.mime_type.as_ref().map(ToString::to_string),
        )),
        TgMediaKind::Video(v) => Some(media(
            MediaKind::Video,
            &v.video.file,
            v.video.file_name.as_ref(),
            v.video.mime_type.as_ref().map(ToString::to_string),
        )),
        TgMediaKind::VideoNote(v) => Some(media(
            MediaKind::Video,
            &v.video_note.file,
            None,
            Some("video/mp4".into()),
        )),
        TgMediaKind::Audio(a) => Some(media(
            MediaKind::Audio,
            &a.audio.file,
            a.audio.file_name.as_ref(),
            a.audio.mime_type.as_ref().map(ToString::to_string),
        )),
        TgMediaKind::Voice(v) => Some(media(
            MediaKind::Voice,
            &v.voice.file,
            None,
            v.voice.mime_type.as_ref().map(ToString::to_string),
        )),
        TgMediaKind::Animation(a) => Some(media(
            MediaKind::Animation,
            &a.animation.file,
            a.animation.file_name.as_ref(),
            a.animation.mime_type.as_ref().map(ToString::to_string),
        )),
        TgMediaKind::Sticker(s) => Some(media(MediaKind::Sticker, &s.sticker.file, None, None)),
        _ => None,
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    const CHANNEL: i64 = -1001;
    const DISCUSSION: i64 = -1002;

    fn message(value: serde_json::Value) -> Message {
        serde_json::from_value(value).expect("deserialize message")
    }

    fn channel_post(id: i64, text: &str) -> serde_json::Value {
        json!({
            "message_id": id,
            "date": 1,
            "chat": { "id": CHANNEL, "type": "channel", "title": "News" },
            "sender_chat": { "id": CHANNEL, "type": "channel", "title": "News" },
            "text": text
        })
    }

    fn automatic_copy(copy_id: i64, post_id: i64) -> serde_json::Value {
        json!({
            "message_id": copy_id,
            "date": 1,
            "chat": { "id": DISCUSSION, "type": "supergroup", "title": "News chat" },
            "sender_chat": { "id": CHANNEL, "type": "channel", "title": "News" },
            "is_automatic_forward": true,
            "forward_origin": {
                "type": "channel",
                "date": 1,
                "chat": { "id": CHANNEL, "type": "channel", "title": "News" },
                "message_id": post_id
            },
            "text": "post text"
        })
    }

    fn comment(id: i64, reply_to: serde_json::Value, thread: Option<i64>) -> serde_json::Value {
        let mut value = json!({
            "message_id": id,
            "date": 1,
            "chat": { "id": DISCUSSION, "type": "supergroup", "title": "News chat" },
            "from": { "id": 7, "is_bot": false, "first_name": "Ada", "last_name": "Lovelace" },
            "reply_to_message": reply_to,
            "text": "a comment"
        });
        if let Some(thread) = thread {
            value["message_thread_id"] = json!(thread);
        }
        value
    }

    #[test]
    fn channel_post_converts_text_and_title() {
        let observed = ObservedMessages::default();
        let msg = observe(&message(channel_post(5, "hello")), &observed);

        assert_eq!(msg.chat_id, CHANNEL);
        assert_eq!(msg.message_id, 5);
        assert_eq!(msg.text.as_deref(), Some("hello"));
        assert_eq!(msg.chat_title.as_deref(), Some("News"));
        assert_eq!(msg.sender_name.as_deref(), Some("News"));
        assert_eq!(msg.thread, ThreadRef::default());
        assert!(!msg.auto_forwarded);
        assert_eq!(observed.get(CHANNEL, 5), Some(msg));
    }

    #[test]
    fn automatic_copy_is_flagged_and_becomes_a_root() {
        let observed = ObservedMessages::default();
        let msg = observe(&message(automatic_copy(40, 5)), &observed);

        assert!(msg.auto_forwarded);
        assert_eq!(observed.root(DISCUSSION, 40), Some((CHANNEL, 5)));
    }

    #[test]
    fn direct_reply_to_copy_points_at_channel_post() {
        let observed = ObservedMessages::default();
        let msg = observe(&message(comment(41, automatic_copy(40, 5), Some(40))), &observed);

        assert_eq!(msg.thread.top_id, Some(5));
        assert_eq!(msg.thread.parent_id, Some(5));
        assert_eq!(msg.sender_name.as_deref(), Some("Ada Lovelace"));
    }

    #[test]
    fn nested_reply_resolves_top_through_observed_root() {
        let observed = ObservedMessages::default();
        observe(&message(automatic_copy(40, 5)), &observed);
        let earlier = comment(41, automatic_copy(40, 5), Some(40));

        let msg = observe(&message(comment(42, earlier, Some(40))), &observed);

        assert_eq!(msg.thread.top_id, Some(5));
        assert_eq!(msg.thread.parent_id, None);
    }

    #[test]
    fn comment_on_unobserved_copy_remembers_the_post() {
        let observed = ObservedMessages::default();

        let msg = observe(&message(comment(41, automatic_copy(40, 5), Some(40))), &observed);

        assert_eq!(msg.thread.top_id, Some(5));
        assert_eq!(observed.root(DISCUSSION, 40), Some((CHANNEL, 5)));
        let post = observed.get(CHANNEL, 5).expect("channel post remembered");
        assert_eq!(post.text.as_deref(), Some("post text"));
        assert_eq!(post.chat_title.as_deref(), Some("News"));
        assert!(!post.auto_forwarded);
        assert_eq!(post.thread, ThreadRef::default());
    }

    #[test]
    fn deeper_reply_after_unobserved_copy_keeps_the_thread() {
        let observed = ObservedMessages::default();
        let first = comment(41, automatic_copy(40, 5), Some(40));
        observe(&message(first.clone()), &observed);

        let msg = observe(&message(comment(42, first, Some(40))), &observed);

        assert_eq!(msg.thread.top_id, Some(5));
    }

    #[test]
    fn observed_channel_post_is_not_overwritten_by_its_copy() {
        let observed = ObservedMessages::default();
        observe(&message(channel_post(5, "original")), &observed);

        observe(&message(comment(41, automatic_copy(40, 5), Some(40))), &observed);

        assert_eq!(
            observed.get(CHANNEL, 5).unwrap().text.as_deref(),
            Some("original")
        );
    }

    #[test]
    fn reply_to_unknown_thread_has_no_refs() {
        let observed = ObservedMessages::default();
        let stranger = json!({
            "message_id": 3,
            "date": 1,
            "chat": { "id": DISCUSSION, "type": "supergroup", "title": "News chat" },
            "text": "unrelated"
        });

        let msg = observe(&message(comment(42, stranger, Some(3))), &observed);

        assert_eq!(msg.thread.anchor_post_id(), None);
    }

    #[test]
    fn largest_photo_is_selected() {
        let msg = message(json!({
            "message_id": 6,
            "date": 1,
            "chat": { "id": CHANNEL, "type": "channel", "title": "News" },
            "photo": [
                { "file_id": "small", "file_unique_id": "s", "width": 90, "height": 90, "file_size": 1000 },
                { "file_id": "large", "file_unique_id": "l", "width": 1280, "height": 960, "file_size": 90000 },
                { "file_id": "medium", "file_unique_id": "m", "width": 320, "height": 240, "file_size": 9000 }
            ],
            "caption": "look"
        }));

        let media = media_ref(&msg).unwrap();
        assert_eq!(media.kind, MediaKind::Photo);
        assert_eq!(media.file_id, "large");
        assert_eq!(media.size, Some(90000));

        let converted = source_message(&msg, &ObservedMessages::default());
        assert_eq!(converted.text.as_deref(), Some("look"));
    }

    #[test]
    fn document_keeps_name_and_mime() {
        let msg = message(json!({
            "message_id": 7,
            "date": 1,
            "chat": { "id": CHANNEL, "type": "channel", "title": "News" },
            "document": {
                "file_id": "doc",
                "file_unique_id": "d",
                "file_name": "report.pdf",
                "mime_type": "application/pdf",
                "file_size": 1234
            }
        }));

        let media = media_ref(&msg).unwrap();
        assert_eq!(media.kind, MediaKind::Document);
        assert_eq!(media.file_name.as_deref(), Some("report.pdf"));
        assert_eq!(media.mime_type.as_deref(), Some("application/pdf"));
    }

    #[test]
    fn text_message_has_no_media() {
        assert!(media_ref(&message(channel_post(8, "plain"))).is_none());
    }
}
