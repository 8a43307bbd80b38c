use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use savegram_core::Error;
use savegram_core::client::sim::{SimFailure, SimWorld};
use savegram_core::client::{ChatKind, ClientKind};
use savegram_core::config::{
    Admission, DedupSettings, Links, SETTINGS_SCHEMA_VERSION, Settings, Tier, Tiers, Transfer,
};
use savegram_core::db::open_memory_db;
use savegram_core::orchestrator::{TransferOrchestrator, TransferOutcome};
use savegram_core::progress::NullSink;
use savegram_core::session_pool::SessionPool;
use tempfile::TempDir;

const VAULT: i64 = -100_900;
const USER_A: i64 = 501;
const USER_B: i64 = 502;

struct Harness {
    _temp: TempDir,
    world: Arc<SimWorld>,
    orchestrator: Arc<TransferOrchestrator>,
    pool: Arc<SessionPool>,
}

fn settings(data_dir: PathBuf) -> Settings {
    Settings {
        version: SETTINGS_SCHEMA_VERSION,
        data_dir,
        vault_chat_id: VAULT,
        admin_chat_id: None,
        admission: Admission::default(),
        tiers: Tiers::default(),
        transfer: Transfer::default(),
        links: Links::default(),
        dedup: DedupSettings::default(),
        sessions: Vec::new(),
        secondary_session: None,
        user_sessions: Vec::new(),
        premium_users: Vec::new(),
    }
}

async fn harness(sessions: usize) -> Harness {
    let temp = TempDir::new().unwrap();
    let settings = settings(temp.path().to_path_buf());
    std::fs::create_dir_all(settings.scratch_dir()).unwrap();

    let world = SimWorld::new();
    world.add_chat(VAULT, ChatKind::Channel, None, false, true);
    world.add_chat(USER_A, ChatKind::Private, None, false, true);
    world.add_chat(USER_B, ChatKind::Private, None, false, true);

    let pool = SessionPool::new();
    for i in 0..sessions {
        let id = format!("s{i}");
        pool.add_session(&id, world.client(ClientKind::User, &id), false);
    }

    let db = open_memory_db().await.unwrap();
    let bot = world.client(ClientKind::Bot, "bot");
    let orchestrator =
        TransferOrchestrator::new(settings, db, bot, None, Arc::clone(&pool));
    Harness {
        _temp: temp,
        world,
        orchestrator,
        pool,
    }
}

fn scratch_files(h: &Harness) -> usize {
    std::fs::read_dir(h.orchestrator.cleanup.scratch_dir())
        .map(|d| d.count())
        .unwrap_or(0)
}

// Public channel, nothing protected: the cheapest path is a server-side
// copy with zero local downloads and no dedup record.
#[tokio::test]
async fn public_channel_goes_server_side() {
    let h = harness(1).await;
    h.world.add_chat(-2001, ChatKind::Channel, Some("pub"), false, true);
    h.world.put_media(-2001, 5, b"video bytes");

    let outcome = h
        .orchestrator
        .submit_single(USER_A, Tier::Free, "https://t.me/pub/5", Arc::new(NullSink))
        .await
        .unwrap();

    assert_eq!(outcome, TransferOutcome::Copied);
    assert_eq!(h.world.download_calls.load(Ordering::Relaxed), 0);
    assert_eq!(h.world.upload_calls.load(Ordering::Relaxed), 0);
    assert_eq!(h.world.message_count(USER_A), 1);
    assert_eq!(h.world.message_count(VAULT), 0);
}

// Forward-protected source: the first request pays for the full fetch, the
// second one is served entirely from the cache.
#[tokio::test]
async fn second_request_is_served_from_cache() {
    let h = harness(1).await;
    h.world
        .add_chat(-2002, ChatKind::Channel, Some("sealed"), true, true);
    h.world.put_media(-2002, 5, b"protected payload");

    let first = h
        .orchestrator
        .submit_single(USER_A, Tier::Free, "https://t.me/sealed/5", Arc::new(NullSink))
        .await
        .unwrap();
    assert_eq!(first, TransferOutcome::Uploaded);
    assert_eq!(h.world.download_calls.load(Ordering::Relaxed), 1);
    assert_eq!(h.world.message_count(VAULT), 1);
    assert_eq!(h.world.message_count(USER_A), 1);

    let second = h
        .orchestrator
        .submit_single(USER_B, Tier::Free, "https://t.me/sealed/5", Arc::new(NullSink))
        .await
        .unwrap();
    assert_eq!(second, TransferOutcome::CachedHit);
    assert_eq!(h.world.download_calls.load(Ordering::Relaxed), 1);
    assert_eq!(h.world.message_count(USER_B), 1);

    // Sessions all returned.
    assert_eq!(h.pool.available(), 1);
    assert_eq!(scratch_files(&h), 0);
}

// Private link without a stored personal session fails fast, before any
// shared resource is touched.
#[tokio::test]
async fn private_link_without_session_fails_fast() {
    let h = harness(1).await;

    let result = h
        .orchestrator
        .submit_single(USER_A, Tier::Free, "https://t.me/c/1234/9", Arc::new(NullSink))
        .await;

    assert!(matches!(result, Err(Error::LoginRequired)));
    assert_eq!(h.orchestrator.queue.running(), 0);
    assert_eq!(h.orchestrator.queue.waiting(), 0);
    assert_eq!(h.pool.available(), 1);
    assert!(h.orchestrator.tasks.is_empty());
}

// Cancel mid-download: the task entry, queue slot, session, and scratch file
// are all reclaimed.
#[tokio::test]
async fn cancel_mid_fetch_reclaims_everything() {
    let h = harness(1).await;
    h.world
        .add_chat(-2003, ChatKind::Channel, Some("slow"), true, true);
    h.world.put_media(-2003, 7, &[9u8; 4096]);
    h.world.download_delay_ms.store(2_000, Ordering::Relaxed);

    let orchestrator = Arc::clone(&h.orchestrator);
    let handle = tokio::spawn(async move {
        orchestrator
            .submit_single(USER_A, Tier::Free, "https://t.me/slow/7", Arc::new(NullSink))
            .await
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.orchestrator.cancel(USER_A));

    let result = handle.await.unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(h.orchestrator.tasks.is_empty());
    assert_eq!(h.orchestrator.queue.running(), 0);
    // Released without an error mark, so it is immediately reusable.
    assert_eq!(h.pool.available(), 1);
    assert_eq!(h.pool.error_count("s0"), Some(0));
    assert_eq!(scratch_files(&h), 0);
    assert_eq!(h.world.message_count(USER_A), 0);
}

#[tokio::test]
async fn second_submission_for_same_user_is_rejected() {
    let h = harness(1).await;
    h.world
        .add_chat(-2004, ChatKind::Channel, Some("busychat"), true, true);
    h.world.put_media(-2004, 3, b"bytes");
    h.world.download_delay_ms.store(1_000, Ordering::Relaxed);

    let orchestrator = Arc::clone(&h.orchestrator);
    let handle = tokio::spawn(async move {
        orchestrator
            .submit_single(USER_A, Tier::Free, "https://t.me/busychat/3", Arc::new(NullSink))
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = h
        .orchestrator
        .submit_single(USER_A, Tier::Free, "https://t.me/busychat/3", Arc::new(NullSink))
        .await;
    assert!(matches!(second, Err(Error::Busy)));

    h.orchestrator.cancel(USER_A);
    let _ = handle.await.unwrap();
}

// A transient connection failure retries with a fresh session and succeeds.
#[tokio::test]
async fn transient_download_failure_is_retried() {
    let h = harness(2).await;
    h.world
        .add_chat(-2005, ChatKind::Channel, Some("flaky"), true, true);
    h.world.put_media(-2005, 4, b"flaky bytes");
    h.world.push_download_failure(SimFailure::Transient);

    let outcome = h
        .orchestrator
        .submit_single(USER_A, Tier::Free, "https://t.me/flaky/4", Arc::new(NullSink))
        .await
        .unwrap();

    assert_eq!(outcome, TransferOutcome::Uploaded);
    assert_eq!(h.world.download_calls.load(Ordering::Relaxed), 2);
    assert_eq!(h.pool.available(), 2);
}

// Repeated rate limits from one user escalate to a temporary persisted
// block; further submissions are refused with the remaining wait.
#[tokio::test]
async fn repeated_rate_limits_escalate_to_a_block() {
    let h = harness(1).await;
    h.world
        .add_chat(-2006, ChatKind::Channel, Some("flood"), true, true);
    h.world.put_media(-2006, 2, b"bytes");
    for _ in 0..4 {
        h.world.push_download_failure(SimFailure::RateLimited(0));
    }

    let first = h
        .orchestrator
        .submit_single(USER_A, Tier::Free, "https://t.me/flood/2", Arc::new(NullSink))
        .await;
    assert!(matches!(first, Err(Error::RateLimited { .. })));

    let second = h
        .orchestrator
        .submit_single(USER_A, Tier::Free, "https://t.me/flood/2", Arc::new(NullSink))
        .await;
    match second {
        Err(Error::RateLimited { seconds }) => assert!(seconds > 0),
        other => panic!("expected a persisted block, got {other:?}"),
    }

    // Other users are unaffected.
    let other = h
        .orchestrator
        .submit_single(USER_B, Tier::Free, "https://t.me/flood/2", Arc::new(NullSink))
        .await
        .unwrap();
    assert_eq!(other, TransferOutcome::Uploaded);
}

// A text-only message takes the cheap path.
#[tokio::test]
async fn text_message_is_forwarded_directly() {
    let h = harness(1).await;
    h.world.add_chat(-2007, ChatKind::Channel, Some("texty"), false, true);
    h.world.put_text(-2007, 11, "hello there");

    let outcome = h
        .orchestrator
        .submit_single(USER_A, Tier::Free, "https://t.me/texty/11", Arc::new(NullSink))
        .await
        .unwrap();
    assert_eq!(outcome, TransferOutcome::TextForwarded);
    assert_eq!(h.world.download_calls.load(Ordering::Relaxed), 0);
    assert_eq!(h.world.message_count(USER_A), 1);
}

// A hidden-history group read: the bot is denied, the user's own session
// carries the transfer.
#[tokio::test]
async fn user_session_covers_bot_denied_chat() {
    let h = harness(0).await;
    h.world.add_chat(-2008, ChatKind::Channel, Some("members"), true, false);
    h.world.put_media(-2008, 6, b"members only");
    h.orchestrator
        .register_user_session(USER_A, h.world.client(ClientKind::User, "u501"));

    let outcome = h
        .orchestrator
        .submit_single(USER_A, Tier::Free, "https://t.me/members/6", Arc::new(NullSink))
        .await
        .unwrap();
    assert_eq!(outcome, TransferOutcome::Uploaded);
    assert_eq!(h.world.message_count(USER_A), 1);
}

// Bot denied and no personal login: a pooled session both resolves the
// message and carries the fetch, then goes back to the pool.
#[tokio::test]
async fn pool_covers_chat_hidden_from_the_bot() {
    let h = harness(1).await;
    h.world.add_chat(-2010, ChatKind::Channel, Some("annex"), true, false);
    h.world.put_media(-2010, 5, b"annex payload");

    let outcome = h
        .orchestrator
        .submit_single(USER_A, Tier::Free, "https://t.me/annex/5", Arc::new(NullSink))
        .await
        .unwrap();
    assert_eq!(outcome, TransferOutcome::Uploaded);
    assert_eq!(h.world.download_calls.load(Ordering::Relaxed), 1);
    assert_eq!(h.world.message_count(USER_A), 1);
    assert_eq!(h.pool.available(), 1);
}

// No pool sessions and no fallback: a restricted fetch surfaces the
// distinguishable "no sessions" outcome.
#[tokio::test]
async fn empty_pool_reports_no_session() {
    let h = harness(0).await;
    h.world
        .add_chat(-2009, ChatKind::Channel, Some("dry"), true, true);
    h.world.put_media(-2009, 8, b"bytes");

    let result = h
        .orchestrator
        .submit_single(USER_A, Tier::Free, "https://t.me/dry/8", Arc::new(NullSink))
        .await;
    assert!(matches!(result, Err(Error::NoSessionAvailable)));
    assert!(h.orchestrator.tasks.is_empty());
    assert_eq!(h.orchestrator.queue.running(), 0);
}
