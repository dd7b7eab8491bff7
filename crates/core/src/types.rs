use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
};

/// Platform chat identifier.
pub type ChatId = i64;

/// Platform message identifier, unique within its chat.
pub type MessageId = i64;

/// One output conversation of a binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DestinationTarget {
    /// Label used in logs and outcome records (e.g. "posts", "comments").
    pub name: String,
    pub chat_id: ChatId,
}

impl DestinationTarget {
    pub fn new(name: impl Into<String>, chat_id: ChatId) -> Self {
        Self {
            name: name.into(),
            chat_id,
        }
    }
}

/// A watched origin chat and where its content goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceBinding {
    /// Account whose session observes the origin.
    pub account_id: String,
    pub origin_chat_id: ChatId,
    /// Discussion chat linked to the origin, where replies to its posts live.
    pub companion_chat_id: Option<ChatId>,
    pub posts: DestinationTarget,
    pub comments: Option<DestinationTarget>,
}

impl SourceBinding {
    /// Target that receives thread replies and holds their anchors.
    #[must_use]
    pub fn comments_target(&self) -> &DestinationTarget {
        self.comments.as_ref().unwrap_or(&self.posts)
    }

    /// Distinct targets a top-level post is delivered to, posts first.
    #[must_use]
    pub fn post_targets(&self) -> Vec<&DestinationTarget> {
        let mut targets = vec![&self.posts];
        if let Some(comments) = &self.comments
            && comments.chat_id != self.posts.chat_id
        {
            targets.push(comments);
        }
        targets
    }

    /// Chats the listener must watch for this binding.
    #[must_use]
    pub fn watched_chats(&self) -> Vec<ChatId> {
        let mut chats = vec![self.origin_chat_id];
        if let Some(companion) = self.companion_chat_id
            && companion != self.origin_chat_id
        {
            chats.push(companion);
        }
        chats
    }
}

/// Kind of attachment carried by a source message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Document,
    Audio,
    Voice,
    Animation,
    Sticker,
    Other,
}

impl MediaKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Document => "document",
            Self::Audio => "audio",
            Self::Voice => "voice",
            Self::Animation => "animation",
            Self::Sticker => "sticker",
            Self::Other => "attachment",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to media still held by the origin platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    /// Platform handle used to download the content.
    pub file_id: String,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
}

/// Downloaded media ready for re-upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPayload {
    pub kind: MediaKind,
    pub file_name: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Thread references carried by a reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRef {
    /// Origin top-level post the thread hangs off, when the platform says so.
    pub top_id: Option<MessageId>,
    /// Message this one directly replies to.
    pub parent_id: Option<MessageId>,
}

impl ThreadRef {
    /// Origin post id to anchor on: top of thread when known, else the parent.
    #[must_use]
    pub fn anchor_post_id(&self) -> Option<MessageId> {
        self.top_id.or(self.parent_id)
    }
}

/// A message observed on an origin or companion chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMessage {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub date: DateTime<Utc>,
    pub chat_title: Option<String>,
    pub sender_name: Option<String>,
    pub text: Option<String>,
    pub media: Option<MediaRef>,
    #[serde(default)]
    pub thread: ThreadRef,
    /// The platform's automatic copy of a channel post inside its
    /// discussion chat.
    #[serde(default)]
    pub auto_forwarded: bool,
}

impl SourceMessage {
    pub fn text(chat_id: ChatId, message_id: MessageId, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            message_id,
            date: Utc::now(),
            chat_title: None,
            sender_name: None,
            text: Some(text.into()),
            media: None,
            thread: ThreadRef::default(),
            auto_forwarded: false,
        }
    }

    #[must_use]
    pub fn with_media(mut self, media: MediaRef) -> Self {
        self.media = Some(media);
        self
    }

    #[must_use]
    pub fn replying_to(mut self, top_id: Option<MessageId>, parent_id: Option<MessageId>) -> Self {
        self.thread = ThreadRef { top_id, parent_id };
        self
    }

    /// Non-blank text, if any.
    #[must_use]
    pub fn body(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.trim().is_empty())
    }

    /// Nothing to relay: no text and no media.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.body().is_none() && self.media.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(comments: Option<ChatId>, companion: Option<ChatId>) -> SourceBinding {
        SourceBinding {
            account_id: "main".into(),
            origin_chat_id: 100,
            companion_chat_id: companion,
            posts: DestinationTarget::new("posts", 500),
            comments: comments.map(|id| DestinationTarget::new("comments", id)),
        }
    }

    #[test]
    fn comments_target_falls_back_to_posts() {
        assert_eq!(binding(None, None).comments_target().chat_id, 500);
        assert_eq!(binding(Some(600), None).comments_target().chat_id, 600);
    }

    #[test]
    fn post_targets_are_distinct() {
        assert_eq!(binding(Some(600), None).post_targets().len(), 2);
        assert_eq!(binding(Some(500), None).post_targets().len(), 1);
        assert_eq!(binding(None, None).post_targets().len(), 1);
    }

    #[test]
    fn watched_chats_include_companion() {
        assert_eq!(binding(None, Some(200)).watched_chats(), vec![100, 200]);
        assert_eq!(binding(None, None).watched_chats(), vec![100]);
    }

    #[test]
    fn top_of_thread_wins_over_parent() {
        let both = ThreadRef {
            top_id: Some(1),
            parent_id: Some(7),
        };
        assert_eq!(both.anchor_post_id(), Some(1));
        let parent_only = ThreadRef {
            top_id: None,
            parent_id: Some(7),
        };
        assert_eq!(parent_only.anchor_post_id(), Some(7));
        assert_eq!(ThreadRef::default().anchor_post_id(), None);
    }

    #[test]
    fn whitespace_only_message_is_empty() {
        let msg = SourceMessage::text(1, 1, "   \n");
        assert!(msg.is_empty());
        let media = msg.with_media(MediaRef {
            kind: MediaKind::Photo,
            file_id: "f".into(),
            file_name: None,
            mime_type: None,
            size: None,
        });
        assert!(!media.is_empty());
    }
}
