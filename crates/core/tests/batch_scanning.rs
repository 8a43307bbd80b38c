use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use savegram_core::client::sim::{SimMedia, SimMessage, SimWorld};
use savegram_core::client::{ChatKind, ClientKind, MediaKind};
use savegram_core::config::{
    Admission, DedupSettings, Links, SETTINGS_SCHEMA_VERSION, Settings, Tier, Tiers, Transfer,
};
use savegram_core::batch::{BatchDriver, BatchStop};
use savegram_core::db::open_memory_db;
use savegram_core::orchestrator::TransferOrchestrator;
use savegram_core::progress::NullSink;
use savegram_core::session_pool::SessionPool;
use tempfile::TempDir;

const VAULT: i64 = -100_900;
const USER: i64 = 601;

struct Harness {
    _temp: TempDir,
    world: Arc<SimWorld>,
    orchestrator: Arc<TransferOrchestrator>,
}

async fn harness() -> Harness {
    let temp = TempDir::new().unwrap();
    let settings = Settings {
        version: SETTINGS_SCHEMA_VERSION,
        data_dir: temp.path().to_path_buf(),
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
    };
    std::fs::create_dir_all(settings.scratch_dir()).unwrap();

    let world = SimWorld::new();
    world.add_chat(VAULT, ChatKind::Channel, None, false, true);
    world.add_chat(USER, ChatKind::Private, None, false, true);

    let pool = SessionPool::new();
    pool.add_session("s0", world.client(ClientKind::User, "s0"), false);

    let db = open_memory_db().await.unwrap();
    let bot = world.client(ClientKind::Bot, "bot");
    let orchestrator = TransferOrchestrator::new(settings, db, bot, None, pool);
    Harness {
        _temp: temp,
        world,
        orchestrator,
    }
}

// Ids 5..=40 are deleted, 41 holds media. The batch must stride over the gap
// instead of crawling it, and still land on 41.
#[tokio::test]
async fn stride_probing_jumps_a_long_deleted_run() {
    let h = harness().await;
    h.world.add_chat(-3001, ChatKind::Channel, Some("gap"), false, true);
    h.world.put_media(-3001, 1, b"early");
    h.world.put_media(-3001, 41, b"the survivor");

    let driver = BatchDriver::new(Arc::clone(&h.orchestrator));
    let summary = driver
        .submit_batch(USER, Tier::Free, "https://t.me/gap/5", 10, Arc::new(NullSink))
        .await
        .unwrap();

    assert_eq!(summary.delivered, 1);
    assert_eq!(summary.stop, BatchStop::PastEnd);
    assert_eq!(h.world.media_names(USER), vec!["m41.bin".to_string()]);
    // The gap was jumped, not crawled one id at a time.
    assert!(summary.stride_jumps > 0);
}

// Sparse media scattered over a large id space: the success set must be
// identical with and without stride skipping.
#[tokio::test]
async fn backfill_recovers_everything_stride_skips() {
    let media_ids = [3i64, 17, 18, 29, 55, 56, 90];

    let mut delivered = Vec::new();
    for use_stride in [true, false] {
        let h = harness().await;
        h.world
            .add_chat(-3002, ChatKind::Channel, Some("sparse"), false, true);
        for id in media_ids {
            h.world.put_media(-3002, id, format!("payload {id}").as_bytes());
        }
        h.world.put_text(-3002, 10, "an announcement");

        let driver = if use_stride {
            BatchDriver::new(Arc::clone(&h.orchestrator))
        } else {
            BatchDriver::new(Arc::clone(&h.orchestrator)).without_stride()
        };
        let summary = driver
            .submit_batch(USER, Tier::Free, "https://t.me/sparse/1", 20, Arc::new(NullSink))
            .await
            .unwrap();

        assert_eq!(summary.delivered, media_ids.len() as u32);
        assert_eq!(summary.text_forwarded, 1);
        delivered.push(h.world.media_names(USER));
    }
    assert_eq!(delivered[0], delivered[1]);
}

#[tokio::test]
async fn batch_stops_when_count_is_reached() {
    let h = harness().await;
    h.world.add_chat(-3003, ChatKind::Channel, Some("dense"), false, true);
    for id in 1..=8 {
        h.world.put_media(-3003, id, &[id as u8; 16]);
    }

    let driver = BatchDriver::new(Arc::clone(&h.orchestrator));
    let summary = driver
        .submit_batch(USER, Tier::Free, "https://t.me/dense/1", 3, Arc::new(NullSink))
        .await
        .unwrap();

    assert_eq!(summary.delivered, 3);
    assert_eq!(summary.stop, BatchStop::ReachedCount);
    assert_eq!(h.world.message_count(USER), 3);
}

// Topic scans run off the pre-enumerated id queue, then fall back to linear
// scanning when the queue runs dry short of the requested count.
#[tokio::test]
async fn topic_scan_uses_queue_then_goes_hybrid() {
    let h = harness().await;
    h.world.add_chat(-3004, ChatKind::Group, Some("forum"), false, true);
    for id in [2i64, 4] {
        h.world.put_message(
            -3004,
            id,
            SimMessage {
                topic_id: Some(7),
                media: Some(SimMedia {
                    kind: MediaKind::Document,
                    bytes: vec![id as u8; 32],
                    file_name: Some(format!("m{id}.bin")),
                }),
                ..SimMessage::default()
            },
        );
    }
    h.world.put_media(-3004, 6, b"beyond the topic");
    h.orchestrator
        .register_user_session(USER, h.world.client(ClientKind::User, "u601"));

    let driver = BatchDriver::new(Arc::clone(&h.orchestrator));
    let summary = driver
        .submit_batch(USER, Tier::Free, "https://t.me/forum/7/2", 3, Arc::new(NullSink))
        .await
        .unwrap();

    assert_eq!(summary.delivered, 3);
    assert_eq!(summary.stop, BatchStop::ReachedCount);
}

// Requested counts are clamped to the tier ceiling.
#[tokio::test]
async fn batch_count_is_clamped_to_tier_limit() {
    let h = harness().await;
    h.world.add_chat(-3005, ChatKind::Channel, Some("firehose"), false, true);
    for id in 1..=30 {
        h.world.put_media(-3005, id, &[id as u8; 8]);
    }

    let driver = BatchDriver::new(Arc::clone(&h.orchestrator));
    let summary = driver
        .submit_batch(USER, Tier::Free, "https://t.me/firehose/1", 500, Arc::new(NullSink))
        .await
        .unwrap();

    // Free tier defaults to 20 per batch.
    assert_eq!(summary.requested, 20);
    assert_eq!(summary.delivered, 20);
}

// Dedup across a batch: re-running the same range re-delivers from cache
// without any new downloads.
#[tokio::test]
async fn second_batch_run_is_served_from_cache() {
    let h = harness().await;
    h.world
        .add_chat(-3006, ChatKind::Channel, Some("sealedbatch"), true, true);
    for id in 1..=3 {
        h.world.put_media(-3006, id, format!("file {id}").as_bytes());
    }

    let driver = BatchDriver::new(Arc::clone(&h.orchestrator));
    let first = driver
        .submit_batch(USER, Tier::Free, "https://t.me/sealedbatch/1", 3, Arc::new(NullSink))
        .await
        .unwrap();
    assert_eq!(first.delivered, 3);
    let downloads_after_first = h.world.download_calls.load(Ordering::Relaxed);
    assert_eq!(downloads_after_first, 3);

    let second = driver
        .submit_batch(USER, Tier::Free, "https://t.me/sealedbatch/1", 3, Arc::new(NullSink))
        .await
        .unwrap();
    assert_eq!(second.delivered, 3);
    assert_eq!(
        h.world.download_calls.load(Ordering::Relaxed),
        downloads_after_first
    );
}
