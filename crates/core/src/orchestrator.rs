use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sqlx::{Row, SqlitePool};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cleanup::CleanupManager;
use crate::client::{ChatClient, ClientKind, MessageInfo, TextEntity};
use crate::config::{Settings, Tier};
use crate::dedup::{self, DedupStore};
use crate::link::{ChatRef, MessageLink, ParsedLink, parse_link};
use crate::progress::{ProgressSink, Throttle, TransferProgress};
use crate::queue::DownloadQueue;
use crate::session_pool::SessionPool;
use crate::status::now_unix_ms;
use crate::tasks::{CancelManager, TaskKey, TaskRegistry, TaskStage};
use crate::workq::WorkQueue;
use crate::{Error, Result};

const WARMUP_ATTEMPTS: usize = 3;
const FLOOD_STRIKE_WINDOW: Duration = Duration::from_secs(600);

/// How one request ended up delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Server-side copy, no bytes touched this process.
    Copied,
    /// Served from the dedup cache.
    CachedHit,
    /// Fresh download and two-hop upload through the vault.
    Uploaded,
    /// Non-media message sent as plain text.
    TextForwarded,
}

/// The session actually performing a fetch or upload. Only pooled leases go
/// back through the pool.
enum FetchClient {
    UserOwned(Arc<dyn ChatClient>),
    Pooled {
        session_id: String,
        client: Arc<dyn ChatClient>,
    },
    Secondary(Arc<dyn ChatClient>),
}

impl FetchClient {
    fn client(&self) -> &Arc<dyn ChatClient> {
        match self {
            FetchClient::UserOwned(c) => c,
            FetchClient::Pooled { client, .. } => client,
            FetchClient::Secondary(c) => c,
        }
    }

    fn label(&self) -> &str {
        self.client().label()
    }
}

/// Drives one request end to end: admission, resolution, cheapest-path
/// selection, fetch, two-hop delivery, bookkeeping, and guaranteed cleanup.
pub struct TransferOrchestrator {
    settings: Settings,
    db: SqlitePool,
    bot: Arc<dyn ChatClient>,
    secondary: Option<Arc<dyn ChatClient>>,
    pool: Arc<SessionPool>,
    pub queue: DownloadQueue,
    workq: WorkQueue,
    pub tasks: TaskRegistry,
    pub cancels: CancelManager,
    pub dedup: DedupStore,
    pub cleanup: CleanupManager,
    user_sessions: Mutex<HashMap<i64, Arc<dyn ChatClient>>>,
    active_users: Mutex<HashSet<i64>>,
    flood_strikes: Mutex<HashMap<i64, Vec<Instant>>>,
}

impl TransferOrchestrator {
    pub fn new(
        settings: Settings,
        db: SqlitePool,
        bot: Arc<dyn ChatClient>,
        secondary: Option<Arc<dyn ChatClient>>,
        pool: Arc<SessionPool>,
    ) -> Arc<Self> {
        let queue = DownloadQueue::new(settings.admission.capacity);
        let workq = WorkQueue::new(settings.transfer.max_concurrent);
        let dedup = DedupStore::new(db.clone());
        let cleanup = CleanupManager::new(settings.scratch_dir());
        Arc::new(Self {
            settings,
            db,
            bot,
            secondary,
            pool,
            queue,
            workq,
            tasks: TaskRegistry::new(),
            cancels: CancelManager::new(),
            dedup,
            cleanup,
            user_sessions: Mutex::new(HashMap::new()),
            active_users: Mutex::new(HashSet::new()),
            flood_strikes: Mutex::new(HashMap::new()),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Registers a user's own authenticated session; transfers for that user
    /// prefer it over the shared pool.
    pub fn register_user_session(&self, user_id: i64, client: Arc<dyn ChatClient>) {
        self.user_sessions
            .lock()
            .expect("user session mutex poisoned")
            .insert(user_id, client);
    }

    pub fn user_session(&self, user_id: i64) -> Option<Arc<dyn ChatClient>> {
        self.user_sessions
            .lock()
            .expect("user session mutex poisoned")
            .get(&user_id)
            .cloned()
    }

    /// Trips the user's cancel flag and withdraws their queued tickets.
    pub fn cancel(&self, user_id: i64) -> bool {
        let removed = self.queue.cancel_user(user_id);
        let had_flag = self.cancels.cancel(user_id);
        removed > 0 || had_flag
    }

    pub fn snapshot_running_tasks(&self) -> Vec<crate::tasks::TaskEntry> {
        self.tasks.snapshot()
    }

    /// Single-link entry point. Re-entrant per user: a second submission
    /// while one is active is rejected, never run concurrently.
    pub async fn submit_single(
        self: &Arc<Self>,
        user_id: i64,
        tier: Tier,
        raw_link: &str,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<TransferOutcome> {
        let _active = ActiveGuard::claim(self, user_id)?;
        self.check_flood_block(user_id).await?;

        let link = match parse_link(raw_link, self.settings.links.assume_groups_hidden)? {
            ParsedLink::Message(link) => link,
            ParsedLink::Invite { .. } => {
                return Err(Error::AccessDenied {
                    message: "invite links cannot be fetched; join the chat first".to_string(),
                });
            }
        };

        let cancel = self.cancels.begin(user_id);
        let result = self
            .transfer_message(user_id, tier, &link, raw_link, sink.as_ref(), &cancel)
            .await;
        self.cancels.clear(user_id);
        self.finish_outcome(user_id, raw_link, &result);
        result
    }

    fn finish_outcome(&self, user_id: i64, link: &str, result: &Result<TransferOutcome>) {
        match result {
            Ok(outcome) => {
                info!(event = "transfer.done", user_id, link, ?outcome, "transfer.done");
            }
            Err(Error::Cancelled) => {
                info!(event = "transfer.cancelled", user_id, link, "transfer.cancelled");
            }
            Err(e) => {
                warn!(event = "transfer.failed", user_id, link, error = %e, "transfer.failed");
            }
        }
    }

    /// One message, end to end. Used directly by the batch driver, which
    /// owns the cancel token and re-entrancy claim for the whole run.
    pub async fn transfer_message(
        self: &Arc<Self>,
        user_id: i64,
        tier: Tier,
        link: &MessageLink,
        raw_link: &str,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome> {
        // Login check comes before any shared resource is touched so the
        // caller can render a precise "please authenticate" response.
        let user_session = self.user_session(user_id);
        if link.requires_session && user_session.is_none() {
            return Err(Error::LoginRequired);
        }

        let mut queue_held = false;
        if !tier.is_privileged() {
            let on_update = |queued_link: &str, position: usize, _running: usize, _total: usize| {
                sink.on_progress(TransferProgress {
                    phase: "queued".to_string(),
                    link: Some(queued_link.to_string()),
                    queue_position: Some(position),
                    ..TransferProgress::default()
                });
            };
            self.queue
                .acquire(user_id, raw_link, &on_update, cancel)
                .await?;
            queue_held = true;
        }

        if let Err(e) = self.workq.acquire(tier.priority(), cancel).await {
            if queue_held {
                self.queue.release();
            }
            return Err(e);
        }

        let key = TaskKey {
            user_id,
            message_id: link.message_id,
        };
        self.tasks.insert(key, raw_link);

        let result = self
            .execute(user_id, tier, link, user_session, key, sink, cancel)
            .await;

        self.tasks.set_stage(key, TaskStage::Finalizing);
        self.tasks.remove(key);
        self.workq.release();
        if queue_held {
            self.queue.release();
        }

        if let Err(Error::RateLimited { seconds }) = &result {
            self.note_rate_limited(user_id, *seconds).await;
        }
        result
    }

    async fn execute(
        self: &Arc<Self>,
        user_id: i64,
        tier: Tier,
        link: &MessageLink,
        user_session: Option<Arc<dyn ChatClient>>,
        key: TaskKey,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome> {
        sink.on_progress(TransferProgress::phase("preparing"));

        // Permissive bot-level read first; on denial fall back to the
        // personal session, then to a borrowed pool identity. Group history
        // visibility cannot be read off the link shape alone.
        let (read_client, chat, info) = self
            .resolve_message(tier, link, user_session.as_ref(), cancel)
            .await?;

        let Some(info) = info else {
            return Err(Error::NotFound);
        };

        if !info.has_media() {
            let text = info.text.as_deref().unwrap_or("");
            if text.is_empty() {
                return Err(Error::NotFound);
            }
            self.bot.send_text(user_id, text).await?;
            return Ok(TransferOutcome::TextForwarded);
        }

        // Cheapest path: server-side copy. Broadcast channels only; copying
        // out of groups risks exposing unintended context.
        if !link.requires_session
            && chat.kind == crate::client::ChatKind::Channel
            && !chat.protected_content
        {
            match self.bot.copy_message(&link.chat, info.id, user_id).await {
                Ok(_) => return Ok(TransferOutcome::Copied),
                Err(e) => {
                    debug!(
                        event = "transfer.copy_fallthrough",
                        user_id,
                        error = %e,
                        "transfer.copy_fallthrough"
                    );
                }
            }
        }

        let media = info
            .media
            .as_ref()
            .ok_or_else(|| Error::unexpected("media vanished between checks"))?;
        let msg_hash = dedup::message_hash(chat.id, info.id, media.file_size);
        if let Some(entry) = self.dedup.check_message(&msg_hash).await {
            if self.dedup.deliver_cached(&self.bot, &entry, user_id).await {
                return Ok(TransferOutcome::CachedHit);
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.fetch_and_deliver(
            user_id,
            tier,
            link,
            &read_client,
            &info,
            &msg_hash,
            user_session,
            key,
            sink,
            cancel,
        )
        .await
    }

    async fn resolve_message(
        &self,
        tier: Tier,
        link: &MessageLink,
        user_session: Option<&Arc<dyn ChatClient>>,
        cancel: &CancellationToken,
    ) -> Result<(Arc<dyn ChatClient>, crate::client::ChatInfo, Option<MessageInfo>)> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if !link.requires_session {
            let via_bot = async {
                let chat = self.bot.resolve_chat(&link.chat).await?;
                let info = self.bot.message_info(&link.chat, link.message_id).await?;
                Ok::<_, Error>((Arc::clone(&self.bot), chat, info))
            };
            match via_bot.await {
                Ok(resolved) => return Ok(resolved),
                Err(Error::AccessDenied { .. }) => {
                    if let Some(session) = user_session {
                        let chat = session.resolve_chat(&link.chat).await?;
                        let info = session.message_info(&link.chat, link.message_id).await?;
                        return Ok((Arc::clone(session), chat, info));
                    }
                    return self.resolve_via_pool(tier, link).await;
                }
                Err(e) => return Err(e),
            }
        }
        let session = user_session.ok_or(Error::LoginRequired)?;
        let chat = session.resolve_chat(&link.chat).await?;
        let info = session.message_info(&link.chat, link.message_id).await?;
        Ok((Arc::clone(session), chat, info))
    }

    /// No personal login and the bot identity cannot read the chat: borrow a
    /// pooled session just for the metadata probe, then give it straight
    /// back. The fetch takes its own lease later.
    async fn resolve_via_pool(
        &self,
        tier: Tier,
        link: &MessageLink,
    ) -> Result<(Arc<dyn ChatClient>, crate::client::ChatInfo, Option<MessageInfo>)> {
        let timeout = Duration::from_secs(self.settings.limits(tier).session_timeout_seconds);
        let Some(lease) = self.pool.request_session(tier.is_privileged(), timeout).await
        else {
            return Err(Error::LoginRequired);
        };
        let probe = async {
            let chat = lease.client.resolve_chat(&link.chat).await?;
            let info = lease.client.message_info(&link.chat, link.message_id).await?;
            Ok::<_, Error>((chat, info))
        }
        .await;
        let (had_error, flood_secs) = match &probe {
            Ok(_) | Err(Error::NotFound) => (false, 0),
            Err(Error::RateLimited { seconds }) => (false, *seconds),
            Err(_) => (true, 0),
        };
        self.pool
            .release_session(&lease.session_id, had_error, Duration::from_secs(flood_secs));
        let (chat, info) = probe?;
        Ok((Arc::clone(&self.bot), chat, info))
    }

    #[allow(clippy::too_many_arguments)]
    async fn fetch_and_deliver(
        self: &Arc<Self>,
        user_id: i64,
        tier: Tier,
        link: &MessageLink,
        read_client: &Arc<dyn ChatClient>,
        info: &MessageInfo,
        msg_hash: &str,
        user_session: Option<Arc<dyn ChatClient>>,
        key: TaskKey,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome> {
        let retries = self.settings.transfer.delivery_retries;
        let mut attempt = 0u32;
        let mut session = self
            .acquire_fetch_client(tier, read_client, user_session.as_ref())
            .await?;
        self.tasks.set_session(key, session.label());

        loop {
            let outcome = self
                .attempt_fetch_deliver(user_id, tier, link, info, msg_hash, &session, key, sink, cancel)
                .await;
            match outcome {
                Ok(done) => {
                    self.release_fetch_client(session, false, 0);
                    return Ok(done);
                }
                Err(Error::RateLimited { seconds }) => {
                    self.release_fetch_client(session, false, seconds);
                    if self.flood_strike_count(user_id)
                        >= self.settings.transfer.flood_escalation_threshold
                    {
                        return Err(Error::RateLimited { seconds });
                    }
                    self.record_flood_strike(user_id);
                    sink.on_progress(TransferProgress {
                        phase: "rate_limited".to_string(),
                        note: Some(format!("waiting {seconds}s")),
                        ..TransferProgress::default()
                    });
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                    }
                    session = self
                        .acquire_fetch_client(tier, read_client, user_session.as_ref())
                        .await?;
                    self.tasks.set_session(key, session.label());
                }
                Err(e) if e.is_transient() && attempt < retries => {
                    attempt += 1;
                    self.release_fetch_client(session, true, 0);
                    warn!(
                        event = "transfer.retry",
                        user_id,
                        attempt,
                        error = %e,
                        "transfer.retry"
                    );
                    let backoff = Duration::from_secs(1 << attempt);
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                    }
                    session = self
                        .acquire_fetch_client(tier, read_client, user_session.as_ref())
                        .await?;
                    self.tasks.set_session(key, session.label());
                }
                Err(e) => {
                    let had_error = !matches!(e, Error::Cancelled);
                    self.release_fetch_client(session, had_error, 0);
                    return Err(e);
                }
            }
        }
    }

    /// Session preference order: the user's own session, then the shared
    /// pool, then the designated secondary client.
    async fn acquire_fetch_client(
        &self,
        tier: Tier,
        read_client: &Arc<dyn ChatClient>,
        user_session: Option<&Arc<dyn ChatClient>>,
    ) -> Result<FetchClient> {
        if let Some(session) = user_session {
            return Ok(FetchClient::UserOwned(Arc::clone(session)));
        }
        // A bot read client cannot download restricted media; only reuse it
        // when it is itself a user identity.
        if read_client.kind() == ClientKind::User {
            return Ok(FetchClient::UserOwned(Arc::clone(read_client)));
        }

        let timeout =
            Duration::from_secs(self.settings.limits(tier).session_timeout_seconds);
        let vault = ChatRef::Id(self.settings.vault_chat_id);
        for _ in 0..WARMUP_ATTEMPTS {
            let Some(lease) = self.pool.request_session(tier.is_privileged(), timeout).await
            else {
                break;
            };
            // Warm-up check: a session that cannot see the vault chat is
            // useless for delivery; rotate it out.
            match lease.client.resolve_chat(&vault).await {
                Ok(_) => {
                    return Ok(FetchClient::Pooled {
                        session_id: lease.session_id,
                        client: lease.client,
                    });
                }
                Err(e) => {
                    warn!(
                        event = "pool.warmup_failed",
                        session_id = %lease.session_id,
                        error = %e,
                        "pool.warmup_failed"
                    );
                    self.pool.release_session(&lease.session_id, true, Duration::ZERO);
                }
            }
        }

        match &self.secondary {
            Some(secondary) => Ok(FetchClient::Secondary(Arc::clone(secondary))),
            None => Err(Error::NoSessionAvailable),
        }
    }

    fn release_fetch_client(&self, session: FetchClient, had_error: bool, flood_secs: u64) {
        if let FetchClient::Pooled { session_id, .. } = session {
            self.pool.release_session(
                &session_id,
                had_error,
                Duration::from_secs(flood_secs),
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt_fetch_deliver(
        self: &Arc<Self>,
        user_id: i64,
        tier: Tier,
        link: &MessageLink,
        info: &MessageInfo,
        msg_hash: &str,
        session: &FetchClient,
        key: TaskKey,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome> {
        let scratch = self.cleanup.scratch_path(user_id, link.message_id);
        let result = self
            .fetch_deliver_inner(user_id, tier, link, info, msg_hash, session, key, &scratch, sink, cancel)
            .await;
        self.cleanup.remove(&scratch).await;
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn fetch_deliver_inner(
        &self,
        user_id: i64,
        tier: Tier,
        link: &MessageLink,
        info: &MessageInfo,
        msg_hash: &str,
        session: &FetchClient,
        key: TaskKey,
        scratch: &Path,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome> {
        let media = info
            .media
            .as_ref()
            .ok_or_else(|| Error::unexpected("fetch path requires media"))?;
        self.tasks.set_stage(key, TaskStage::Downloading);

        let throttle = Throttle::new(Duration::from_secs(
            self.settings.transfer.progress_interval_seconds,
        ));
        let total = (media.file_size > 0).then_some(media.file_size);
        let tasks = &self.tasks;
        let progress = Box::new(move |current: u64| {
            tasks.update_progress(key, current, total);
            if throttle.ready() {
                sink.on_progress(TransferProgress::bytes("downloading", current, total));
            }
        });

        let size = session
            .client()
            .download_media(&link.chat, info.id, scratch, Some(progress), cancel)
            .await?;
        sink.on_progress(TransferProgress::bytes("downloading", size, Some(size)));

        // Post-download check catches the same bytes reposted under a
        // different message.
        let content_hash = dedup::content_hash_file(scratch).await?;
        if let Some(entry) = self.dedup.check_content(&content_hash).await {
            if self.dedup.deliver_cached(&self.bot, &entry, user_id).await {
                self.dedup.link_source(msg_hash, &content_hash).await;
                return Ok(TransferOutcome::CachedHit);
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.tasks.set_stage(key, TaskStage::Uploading);
        let caption = info.text.as_deref();
        let vault_msg_id = if size > self.settings.transfer.size_ceiling_bytes {
            self.deliver_large(user_id, tier, session, scratch, size, caption, &info.entities, key, sink, cancel)
                .await?
        } else {
            let vault_msg_id = self
                .upload_to_vault(session, scratch, caption, &info.entities, key, sink, cancel)
                .await?;
            self.copy_from_vault(vault_msg_id, user_id).await?;
            Some(vault_msg_id)
        };

        if let Some(vault_msg_id) = vault_msg_id {
            self.dedup
                .record(
                    &content_hash,
                    msg_hash,
                    media.file_name.as_deref(),
                    size,
                    self.settings.vault_chat_id,
                    vault_msg_id,
                    user_id,
                )
                .await;
        }
        Ok(TransferOutcome::Uploaded)
    }

    async fn upload_to_vault(
        &self,
        session: &FetchClient,
        path: &Path,
        caption: Option<&str>,
        entities: &[TextEntity],
        key: TaskKey,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<i64> {
        let throttle = Throttle::new(Duration::from_secs(
            self.settings.transfer.progress_interval_seconds,
        ));
        let tasks = &self.tasks;
        let progress = Box::new(move |current: u64| {
            tasks.update_progress(key, current, None);
            if throttle.ready() {
                sink.on_progress(TransferProgress::bytes("uploading", current, None));
            }
        });
        session
            .client()
            .upload_media(
                self.settings.vault_chat_id,
                path,
                caption,
                entities,
                Some(progress),
                cancel,
            )
            .await
    }

    async fn copy_from_vault(&self, vault_msg_id: i64, user_id: i64) -> Result<i64> {
        let vault = ChatRef::Id(self.settings.vault_chat_id);
        self.bot.copy_message(&vault, vault_msg_id, user_id).await
    }

    /// Above the single-message ceiling the path is tier-based: premium
    /// goes through the high-capacity secondary client, free tier gets the
    /// file split into ordered parts. Split deliveries are not recorded in
    /// the dedup index (no single cached message to point at).
    #[allow(clippy::too_many_arguments)]
    async fn deliver_large(
        &self,
        user_id: i64,
        tier: Tier,
        session: &FetchClient,
        path: &Path,
        size: u64,
        caption: Option<&str>,
        entities: &[TextEntity],
        key: TaskKey,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Option<i64>> {
        if tier.is_privileged() {
            if let Some(secondary) = &self.secondary {
                let big = FetchClient::Secondary(Arc::clone(secondary));
                let vault_msg_id = self
                    .upload_to_vault(&big, path, caption, entities, key, sink, cancel)
                    .await?;
                self.copy_from_vault(vault_msg_id, user_id).await?;
                return Ok(Some(vault_msg_id));
            }
        }

        let parts = self.split_into_parts(path, size).await?;
        let total = parts.len();
        for (index, part) in parts.iter().enumerate() {
            if cancel.is_cancelled() {
                self.remove_parts(&parts).await;
                return Err(Error::Cancelled);
            }
            let part_caption = format!("part {}/{total}", index + 1);
            let upload = self
                .upload_to_vault(session, part, Some(&part_caption), &[], key, sink, cancel)
                .await;
            match upload {
                Ok(vault_msg_id) => {
                    if let Err(e) = self.copy_from_vault(vault_msg_id, user_id).await {
                        self.remove_parts(&parts).await;
                        return Err(e);
                    }
                }
                Err(e) => {
                    self.remove_parts(&parts).await;
                    return Err(e);
                }
            }
        }
        self.remove_parts(&parts).await;
        Ok(None)
    }

    async fn split_into_parts(&self, path: &Path, size: u64) -> Result<Vec<PathBuf>> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let part_size = self.settings.transfer.part_size_bytes;
        let count = size.div_ceil(part_size);
        let mut source = tokio::fs::File::open(path).await?;
        let mut parts = Vec::with_capacity(count as usize);
        let mut buf = vec![0u8; 4 * 1024 * 1024];
        for index in 0..count {
            let part_path = path.with_extension(format!("part{}", index + 1));
            self.cleanup.track(&part_path);
            let mut out = tokio::fs::File::create(&part_path).await?;
            let mut written = 0u64;
            while written < part_size {
                let want = buf.len().min((part_size - written) as usize);
                let n = source.read(&mut buf[..want]).await?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n]).await?;
                written += n as u64;
            }
            out.flush().await?;
            parts.push(part_path);
        }
        Ok(parts)
    }

    async fn remove_parts(&self, parts: &[PathBuf]) {
        for part in parts {
            self.cleanup.remove(part).await;
        }
    }

    /// Repeated flood hits from one user escalate to a temporary persisted
    /// block so shared sessions are protected across restarts. Operators are
    /// notified; the user is not looped forever.
    async fn note_rate_limited(self: &Arc<Self>, user_id: i64, seconds: u64) {
        self.record_flood_strike(user_id);
        let strikes = self.flood_strike_count(user_id);
        if strikes < self.settings.transfer.flood_escalation_threshold {
            return;
        }
        let block_secs = self.settings.transfer.flood_block_seconds.max(seconds);
        let until_ms = now_unix_ms() + block_secs * 1000;
        let outcome = sqlx::query(
            r#"
            INSERT INTO flood_blocks (user_id, blocked_until_ms, reason, created_at)
            VALUES (?, ?, 'flood escalation', strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            ON CONFLICT(user_id) DO UPDATE SET blocked_until_ms = excluded.blocked_until_ms
            "#,
        )
        .bind(user_id)
        .bind(until_ms as i64)
        .execute(&self.db)
        .await;
        if let Err(e) = outcome {
            warn!(event = "flood.block_persist_failed", error = %e, "flood.block_persist_failed");
        }
        self.flood_strikes
            .lock()
            .expect("flood strike mutex poisoned")
            .remove(&user_id);
        self.cancel(user_id);
        warn!(
            event = "flood.escalated",
            user_id, block_secs, "flood.escalated"
        );
        if let Some(admin) = self.settings.admin_chat_id {
            let text = format!(
                "flood escalation: user {user_id} blocked for {block_secs}s after {strikes} rate limits"
            );
            if let Err(e) = self.bot.send_text(admin, &text).await {
                warn!(event = "flood.notify_failed", error = %e, "flood.notify_failed");
            }
        }
    }

    fn record_flood_strike(&self, user_id: i64) {
        let mut strikes = self
            .flood_strikes
            .lock()
            .expect("flood strike mutex poisoned");
        let entry = strikes.entry(user_id).or_default();
        let now = Instant::now();
        entry.retain(|at| now.duration_since(*at) < FLOOD_STRIKE_WINDOW);
        entry.push(now);
    }

    fn flood_strike_count(&self, user_id: i64) -> u32 {
        let mut strikes = self
            .flood_strikes
            .lock()
            .expect("flood strike mutex poisoned");
        let Some(entry) = strikes.get_mut(&user_id) else {
            return 0;
        };
        let now = Instant::now();
        entry.retain(|at| now.duration_since(*at) < FLOOD_STRIKE_WINDOW);
        entry.len() as u32
    }

    /// A persisted flood block rejects the submission up front with the
    /// remaining wait.
    pub async fn check_flood_block(&self, user_id: i64) -> Result<()> {
        let row = sqlx::query("SELECT blocked_until_ms FROM flood_blocks WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.db)
            .await?;
        if let Some(row) = row {
            let until_ms = row.get::<i64, _>("blocked_until_ms") as u64;
            let now = now_unix_ms();
            if until_ms > now {
                return Err(Error::RateLimited {
                    seconds: (until_ms - now).div_ceil(1000),
                });
            }
            sqlx::query("DELETE FROM flood_blocks WHERE user_id = ?")
                .bind(user_id)
                .execute(&self.db)
                .await?;
        }
        Ok(())
    }

    /// Claims the per-user re-entrancy slot for a batch run.
    pub fn claim_user(self: &Arc<Self>, user_id: i64) -> Result<ActiveGuard> {
        ActiveGuard::claim(self, user_id)
    }

    pub(crate) fn bot(&self) -> &Arc<dyn ChatClient> {
        &self.bot
    }
}

/// Holds the per-user active slot; released on drop so every exit path,
/// including cancellation, frees it.
pub struct ActiveGuard {
    orchestrator: Arc<TransferOrchestrator>,
    user_id: i64,
}

impl ActiveGuard {
    fn claim(orchestrator: &Arc<TransferOrchestrator>, user_id: i64) -> Result<Self> {
        let mut active = orchestrator
            .active_users
            .lock()
            .expect("active user mutex poisoned");
        if !active.insert(user_id) {
            return Err(Error::Busy);
        }
        drop(active);
        Ok(Self {
            orchestrator: Arc::clone(orchestrator),
            user_id,
        })
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.orchestrator
            .active_users
            .lock()
            .expect("active user mutex poisoned")
            .remove(&self.user_id);
    }
}
