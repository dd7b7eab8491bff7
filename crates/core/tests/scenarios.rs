//! End-to-end relay flows over fake sessions.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{sync::Arc, time::Duration};

use threadrelay_core::{
    BindingState, DeliveryPipeline, DestinationTarget, IdentityMap, InMemoryIdentityMap,
    InMemoryOutcomeLog, InboundEvent, ListenerPool, OutcomeStatus, PlatformError, RecordKey,
    SourceBinding, SourceMessage, Strategy,
    fake::{FakeProvider, FakeSession},
    types::{MediaKind, MediaRef},
};

const ORIGIN: i64 = 100;
const COMPANION: i64 = 200;
const POSTS: i64 = 500;
const COMMENTS: i64 = 600;

struct Relay {
    session: Arc<FakeSession>,
    identity: Arc<InMemoryIdentityMap>,
    outcomes: Arc<InMemoryOutcomeLog>,
    pool: ListenerPool,
}

async fn relay() -> Relay {
    let session = Arc::new(FakeSession::new());
    session.link_chat(ORIGIN, COMPANION);
    let identity = Arc::new(InMemoryIdentityMap::new());
    let outcomes = Arc::new(InMemoryOutcomeLog::new());
    let pool = ListenerPool::new(
        Arc::new(FakeProvider::new().with_account("owner", session.clone())),
        identity.clone(),
        outcomes.clone(),
    );
    let state = pool
        .register(SourceBinding {
            account_id: "owner".into(),
            origin_chat_id: ORIGIN,
            companion_chat_id: None,
            posts: DestinationTarget::new("posts", POSTS),
            comments: Some(DestinationTarget::new("comments", COMMENTS)),
        })
        .await
        .unwrap();
    assert_eq!(state, BindingState::Active);
    Relay {
        session,
        identity,
        outcomes,
        pool,
    }
}

async fn recorded(identity: &InMemoryIdentityMap, origin_message: i64, destination: i64) -> Option<i64> {
    identity
        .get(&RecordKey::new(ORIGIN, origin_message, destination))
        .await
        .unwrap()
}

async fn wait_for_record(identity: &InMemoryIdentityMap, origin_message: i64, destination: i64) -> i64 {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(id) = recorded(identity, origin_message, destination).await {
                return id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("message was never recorded")
}

fn reply(message_id: i64, top: i64) -> SourceMessage {
    let mut reply = SourceMessage::text(COMPANION, message_id, "a comment").replying_to(Some(top), Some(top));
    reply.sender_name = Some("Ada".into());
    reply
}

#[tokio::test]
async fn post_is_relayed_to_posts_and_comments() {
    let relay = relay().await;

    relay
        .session
        .emit(InboundEvent::Message(SourceMessage::text(ORIGIN, 1, "hello")))
        .await;
    let in_posts = wait_for_record(&relay.identity, 1, POSTS).await;
    let in_comments = wait_for_record(&relay.identity, 1, COMMENTS).await;

    assert_ne!(in_posts, in_comments);
    let outcomes = relay.outcomes.snapshot();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| o.status == OutcomeStatus::Delivered
        && matches!(o.strategy, Strategy::NativeTransfer | Strategy::ContentRecreation)));
    relay.pool.shutdown().await;
}

#[tokio::test]
async fn reply_is_anchored_on_relayed_post() {
    let relay = relay().await;
    relay
        .session
        .emit(InboundEvent::Message(SourceMessage::text(ORIGIN, 1, "hello")))
        .await;
    let anchor = wait_for_record(&relay.identity, 1, COMMENTS).await;

    relay.session.emit(InboundEvent::Message(reply(2, 1))).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while relay.identity.records_for_origin(COMPANION, 2).await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let delivered = relay
        .session
        .sent_to(COMMENTS)
        .into_iter()
        .find(|m| m.transferred_from == Some((COMPANION, 2)))
        .expect("reply delivered to comments");
    assert_eq!(delivered.reply_to, Some(anchor));
    relay.pool.shutdown().await;
}

#[tokio::test]
async fn reply_to_unseen_post_backfills_the_anchor() {
    let relay = relay().await;
    relay
        .session
        .store_message(SourceMessage::text(ORIGIN, 999, "older post"));

    relay.session.emit(InboundEvent::Message(reply(3, 999))).await;
    let backfilled = wait_for_record(&relay.identity, 999, COMMENTS).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while relay.identity.records_for_origin(COMPANION, 3).await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let comments = relay.session.sent_to(COMMENTS);
    let post = comments
        .iter()
        .position(|m| m.id == backfilled)
        .expect("backfilled post in comments");
    let answer = comments
        .iter()
        .position(|m| m.transferred_from == Some((COMPANION, 3)))
        .expect("reply in comments");
    assert!(post < answer);
    assert_eq!(comments[answer].reply_to, Some(backfilled));
    // Backfill targets the comments destination only.
    assert_eq!(recorded(&relay.identity, 999, POSTS).await, None);
    relay.pool.shutdown().await;
}

#[tokio::test]
async fn unsupported_attachment_degrades_to_text() {
    let session = Arc::new(FakeSession::new());
    session.fail_native_transfer(PlatformError::transient("restricted chat"));
    session.fail_send_file(PlatformError::unsupported_content("file too big"));
    let outcomes = Arc::new(InMemoryOutcomeLog::new());
    let pipeline = DeliveryPipeline::new(
        session.clone(),
        session.clone(),
        Arc::new(InMemoryIdentityMap::new()),
        outcomes.clone(),
    );
    let message = SourceMessage::text(ORIGIN, 4, "see attached").with_media(MediaRef {
        kind: MediaKind::Video,
        file_id: "huge-video".into(),
        file_name: Some("clip.mp4".into()),
        mime_type: Some("video/mp4".into()),
        size: Some(3 << 30),
    });

    let delivered = pipeline
        .deliver(&message, &DestinationTarget::new("posts", POSTS), None)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(delivered.strategy, Strategy::TextOnly);
    let log = outcomes.snapshot();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].strategy, Strategy::TextOnly);
    assert_eq!(log[0].status, OutcomeStatus::Delivered);
    assert_eq!(session.sent_texts(), vec![(POSTS, "see attached".to_string())]);
}

#[tokio::test]
async fn deleted_post_still_lets_the_reply_through() {
    let relay = relay().await;

    relay.session.emit(InboundEvent::Message(reply(5, 404))).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while relay.identity.records_for_origin(COMPANION, 5).await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let delivered = relay
        .session
        .sent_to(COMMENTS)
        .into_iter()
        .find(|m| m.transferred_from == Some((COMPANION, 5)))
        .expect("reply delivered");
    assert_eq!(delivered.reply_to, None);
    relay.pool.shutdown().await;
}
