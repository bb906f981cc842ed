//! Conversation tracking fed by a live MUC service.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use common::{jid, private_chat, room_jid, TestService};
use waddle_muc::conversation::{ArchiveRecord, ConversationState, InMemoryArchiver};
use waddle_muc::{
    spawn_conversation_worker, ConversationFeed, ConversationKey,
    ConversationTracker, MucConfig, Stanza,
};

const ALICE: &str = "alice@example.com/home";
const BOB: &str = "bob@example.com/work";

struct Tracked {
    svc: TestService,
    tracker: Arc<ConversationTracker>,
    archiver: Arc<InMemoryArchiver>,
    shutdown: CancellationToken,
    worker: tokio::task::JoinHandle<()>,
    feed: Option<Arc<ConversationFeed>>,
}

impl Tracked {
    fn new(config: MucConfig) -> Self {
        let svc = TestService::with_config(config);
        let archiver = Arc::new(InMemoryArchiver::new());
        let tracker = Arc::new(ConversationTracker::new(
            svc.server.config(),
            archiver.clone(),
        ));
        let (feed, rx) = ConversationFeed::channel();
        let feed = Arc::new(feed);
        svc.server.add_listener(feed.clone());
        let shutdown = CancellationToken::new();
        let worker = spawn_conversation_worker(tracker.clone(), rx, shutdown.clone());
        Self {
            svc,
            tracker,
            archiver,
            shutdown,
            worker,
            feed: Some(feed),
        }
    }

    fn quiet() -> Self {
        let mut config = MucConfig::with_domain("muc.example.com");
        config.announcements.join = String::new();
        config.announcements.leave = String::new();
        Self::new(config)
    }

    /// Detach the feed and wait for the worker to drain every queued event.
    async fn drain(mut self) -> (TestService, Arc<ConversationTracker>, Arc<InMemoryArchiver>) {
        if let Some(feed) = self.feed.take() {
            let listener: Arc<dyn waddle_muc::MucEventListener> = feed;
            self.svc.server.remove_listener(&listener);
        }
        tokio::time::timeout(Duration::from_secs(5), self.worker)
            .await
            .expect("worker drains")
            .unwrap();
        drop(self.shutdown);
        (self.svc, self.tracker, self.archiver)
    }
}

#[tokio::test]
async fn test_room_conversation_follows_membership() {
    let tracked = Tracked::quiet();
    let svc = &tracked.svc;
    svc.join(ALICE, "lobby", "alice");
    svc.join(BOB, "lobby", "bob");
    svc.say(ALICE, "lobby", "hi");
    svc.say(BOB, "lobby", "hello");
    svc.leave(BOB, "lobby", "bob");

    let (_svc, tracker, _) = tracked.drain().await;

    let lobby = room_jid("lobby").to_bare();
    let conversation = tracker
        .conversation(&ConversationKey::room(&lobby))
        .expect("room conversation");
    assert_eq!(conversation.message_count(), 2);
    assert_eq!(conversation.state(), ConversationState::Open);
    assert!(conversation
        .participations(&jid(ALICE))
        .unwrap()
        .current()
        .is_some());
    let bob = conversation.participations(&jid(BOB)).unwrap();
    assert_eq!(bob.participations().len(), 1);
    assert!(bob.current().is_none());
}

#[tokio::test]
async fn test_room_destroyed_ends_conversation() {
    let tracked = Tracked::quiet();
    let svc = &tracked.svc;
    svc.join(ALICE, "lobby", "alice");
    svc.say(ALICE, "lobby", "anyone here?");
    svc.leave(ALICE, "lobby", "alice");

    let (_svc, tracker, archiver) = tracked.drain().await;

    assert!(tracker
        .conversation(&ConversationKey::room(&room_jid("lobby").to_bare()))
        .is_none());
    let records = archiver.records();
    assert!(matches!(records.first(), Some(ArchiveRecord::Created(_))));
    assert!(matches!(records.last(), Some(ArchiveRecord::Ended(_))));
}

#[tokio::test]
async fn test_private_messages_tracked_between_real_addresses() {
    let tracked = Tracked::quiet();
    let svc = &tracked.svc;
    svc.join(ALICE, "lobby", "alice");
    svc.join(BOB, "lobby", "bob");
    svc.server
        .process(Stanza::Message(private_chat(ALICE, "lobby", "bob", "psst")));
    svc.server
        .process(Stanza::Message(private_chat(BOB, "lobby", "alice", "what")));

    let (_svc, tracker, _) = tracked.drain().await;

    let conversation = tracker
        .conversation(&ConversationKey::one_to_one(&jid(ALICE), &jid(BOB)))
        .expect("private conversation");
    assert_eq!(conversation.message_count(), 2);
    assert!(!conversation.is_external());
}

#[tokio::test]
async fn test_rooms_without_logging_are_not_tracked() {
    let mut config = MucConfig::with_domain("muc.example.com");
    config.room.enable_logging = false;
    let tracked = Tracked::new(config);
    let svc = &tracked.svc;
    svc.join(ALICE, "lobby", "alice");
    svc.say(ALICE, "lobby", "off the record");

    let (_svc, tracker, archiver) = tracked.drain().await;
    assert_eq!(tracker.conversation_count(), 0);
    assert!(archiver.records().is_empty());
}

#[tokio::test]
async fn test_archive_failure_is_not_fatal() {
    let tracked = Tracked::quiet();
    tracked.archiver.set_failing(true);
    let svc = &tracked.svc;
    svc.join(ALICE, "lobby", "alice");
    svc.say(ALICE, "lobby", "still counted");

    let (_svc, tracker, archiver) = tracked.drain().await;
    let conversation = tracker
        .conversation(&ConversationKey::room(&room_jid("lobby").to_bare()))
        .unwrap();
    assert_eq!(conversation.message_count(), 1);
    assert!(archiver.records().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_expiry_sweeper_ends_idle_conversations() {
    let mut config = MucConfig::with_domain("muc.example.com");
    config.conversation.idle_secs = 0;
    config.conversation.sweep_interval_secs = 30;
    let tracker = Arc::new(ConversationTracker::without_archive(&config));
    tracker.process_message(&jid(ALICE), &jid("carol@elsewhere.org/x"), Utc::now() - chrono::Duration::seconds(1));
    assert_eq!(tracker.conversation_count(), 1);

    let shutdown = CancellationToken::new();
    let handle = tracker.spawn_expiry_sweeper(shutdown.clone());
    tokio::time::sleep(Duration::from_secs(31)).await;
    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(tracker.conversation_count(), 0);
}
