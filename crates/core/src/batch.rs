use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{ChatClient, MessageInfo};
use crate::config::Tier;
use crate::link::{MessageLink, ParsedLink, parse_link};
use crate::orchestrator::{TransferOrchestrator, TransferOutcome};
use crate::progress::{ProgressSink, TransferProgress};
use crate::{Error, Result};

/// Linear misses before switching to exponential stride probing.
const LINEAR_MISS_THRESHOLD: u32 = 3;
const STRIDE_CAP: i64 = 32;
/// Probe budget for backfilling one skipped range.
const BACKFILL_BUDGET: usize = 128;
const BACKFILL_LINEAR_MAX: i64 = 4;
/// Batches at or below this size give up after 3 consecutive dead stride
/// probes; larger ones tolerate 6.
const SMALL_BATCH_MAX: u32 = 20;
const HEARTBEAT_AFTER: Duration = Duration::from_secs(15);
const TOPIC_SCAN_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStop {
    ReachedCount,
    PastEnd,
    DeadRun,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub requested: u32,
    pub delivered: u32,
    pub text_forwarded: u32,
    pub scanned: u32,
    pub last_id_checked: i64,
    pub stride_jumps: u32,
    pub stop: BatchStop,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Applies the orchestrator across a contiguous id range, skipping deleted
/// and empty messages with exponential stride probing and recovering skipped
/// content through bounded backfill.
pub struct BatchDriver {
    orchestrator: Arc<TransferOrchestrator>,
    stride_enabled: bool,
}

struct BatchState<'a> {
    user_id: i64,
    tier: Tier,
    link: MessageLink,
    raw_link: String,
    requested: u32,
    delivered: u32,
    text_forwarded: u32,
    scanned: u32,
    last_checked: i64,
    stride_jumps: u32,
    last_msg_ceiling: Option<i64>,
    media_ceiling: Option<i64>,
    probe: Arc<dyn ChatClient>,
    sink: &'a dyn ProgressSink,
    cancel: &'a CancellationToken,
    last_status: Instant,
    last_success: Instant,
}

impl BatchDriver {
    pub fn new(orchestrator: Arc<TransferOrchestrator>) -> Self {
        Self {
            orchestrator,
            stride_enabled: true,
        }
    }

    /// Turns off gap skipping; every id in range gets probed linearly. Mostly
    /// useful for verifying that backfill recovers what stride jumps over.
    pub fn without_stride(mut self) -> Self {
        self.stride_enabled = false;
        self
    }

    /// Batch entry point: collect `count` successful media deliveries
    /// starting at the linked message. Always ends with a terminal summary.
    pub async fn submit_batch(
        &self,
        user_id: i64,
        tier: Tier,
        start_link: &str,
        count: u32,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<BatchSummary> {
        let _active = self.orchestrator.claim_user(user_id)?;
        self.orchestrator.check_flood_block(user_id).await?;

        let max_batch = self.orchestrator.settings().limits(tier).max_batch;
        let count = count.min(max_batch).max(1);

        let link = match parse_link(
            start_link,
            self.orchestrator.settings().links.assume_groups_hidden,
        )? {
            ParsedLink::Message(link) => link,
            ParsedLink::Invite { .. } => {
                return Err(Error::AccessDenied {
                    message: "batch needs a message link, not an invite".to_string(),
                });
            }
        };

        let probe = self.probe_client(user_id, &link)?;
        let cancel = self.orchestrator.cancels.begin(user_id);

        let start_id = link.message_id + link.offset;
        let mut state = BatchState {
            user_id,
            tier,
            link,
            raw_link: start_link.to_string(),
            requested: count,
            delivered: 0,
            text_forwarded: 0,
            scanned: 0,
            last_checked: start_id - 1,
            stride_jumps: 0,
            last_msg_ceiling: None,
            media_ceiling: None,
            probe,
            sink: sink.as_ref(),
            cancel: &cancel,
            last_status: Instant::now(),
            last_success: Instant::now(),
        };

        self.discover_ceilings(&mut state).await;
        let result = self.scan(&mut state, start_id).await;
        self.orchestrator.cancels.clear(user_id);

        let summary = match result {
            Ok(stop) => BatchSummary {
                requested: state.requested,
                delivered: state.delivered,
                text_forwarded: state.text_forwarded,
                scanned: state.scanned,
                last_id_checked: state.last_checked,
                stride_jumps: state.stride_jumps,
                stop,
                failure: None,
            },
            Err(e) => BatchSummary {
                requested: state.requested,
                delivered: state.delivered,
                text_forwarded: state.text_forwarded,
                scanned: state.scanned,
                last_id_checked: state.last_checked,
                stride_jumps: state.stride_jumps,
                stop: if matches!(e, Error::Cancelled) {
                    BatchStop::Cancelled
                } else {
                    BatchStop::Failed
                },
                failure: Some(e.to_string()),
            },
        };
        info!(
            event = "batch.done",
            user_id,
            delivered = summary.delivered,
            scanned = summary.scanned,
            stop = ?summary.stop,
            "batch.done"
        );
        Ok(summary)
    }

    fn probe_client(&self, user_id: i64, link: &MessageLink) -> Result<Arc<dyn ChatClient>> {
        if link.requires_session {
            return self
                .orchestrator
                .user_session(user_id)
                .ok_or(Error::LoginRequired);
        }
        Ok(Arc::clone(self.orchestrator.bot()))
    }

    /// Cheap metadata probes for the two scan ceilings. Failures leave the
    /// ceilings unknown; the dead-run stop covers that case.
    async fn discover_ceilings(&self, state: &mut BatchState<'_>) {
        match state.probe.last_message_id(&state.link.chat).await {
            Ok(last) => {
                state.last_msg_ceiling = Some(last);
                // Walk back from the tail looking for the last id that
                // actually carries media.
                let mut id = last;
                let floor = (last - 20).max(1);
                while id >= floor {
                    match state.probe.message_info(&state.link.chat, id).await {
                        Ok(Some(info)) if info.has_media() => {
                            state.media_ceiling = Some(id);
                            break;
                        }
                        Ok(_) => {}
                        Err(_) => break,
                    }
                    id -= 1;
                }
                if state.media_ceiling.is_none() {
                    state.media_ceiling = Some(last);
                }
            }
            Err(e) => {
                debug!(event = "batch.no_ceiling", error = %e, "batch.no_ceiling");
            }
        }
    }

    async fn scan(&self, state: &mut BatchState<'_>, start_id: i64) -> Result<BatchStop> {
        if state.link.topic_id.is_some() {
            if let Some(stop) = self.scan_topic(state, start_id).await? {
                return Ok(stop);
            }
            // Hybrid mode: queue exhausted short of the count, continue
            // linearly from the last id we know about.
            return self.scan_range(state, state.last_checked + 1).await;
        }
        self.scan_range(state, start_id).await
    }

    /// Topic scans prefer a pre-enumerated id queue over blind probing.
    async fn scan_topic(
        &self,
        state: &mut BatchState<'_>,
        start_id: i64,
    ) -> Result<Option<BatchStop>> {
        let topic_id = state.link.topic_id.unwrap_or_default();
        let ids = state
            .probe
            .topic_message_ids(&state.link.chat, topic_id, TOPIC_SCAN_LIMIT)
            .await
            .unwrap_or_default();
        for id in ids.into_iter().filter(|id| *id >= start_id) {
            if state.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.process_id(state, id).await?;
            if state.delivered >= state.requested {
                return Ok(Some(BatchStop::ReachedCount));
            }
        }
        Ok(None)
    }

    async fn scan_range(&self, state: &mut BatchState<'_>, start_id: i64) -> Result<BatchStop> {
        let dead_run_limit = if state.requested <= SMALL_BATCH_MAX { 3 } else { 6 };
        let mut cursor = start_id;
        let mut linear_misses: u32 = 0;
        let mut stride: i64 = 0;
        let mut stride_misses: u32 = 0;
        let mut skipped: Vec<(i64, i64)> = Vec::new();

        loop {
            if state.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if state.delivered >= state.requested {
                return Ok(BatchStop::ReachedCount);
            }
            if self.past_ceilings(state, cursor) {
                return Ok(BatchStop::PastEnd);
            }

            let hit = self.process_id(state, cursor).await?;
            if hit {
                linear_misses = 0;
                stride_misses = 0;
                if stride > 0 {
                    // A hit after striding: recover anything real the jumps
                    // flew over before moving on.
                    stride = 0;
                    let ranges = std::mem::take(&mut skipped);
                    for (lo, hi) in ranges {
                        self.backfill(state, lo, hi).await?;
                        if state.delivered >= state.requested {
                            return Ok(BatchStop::ReachedCount);
                        }
                    }
                }
                cursor += 1;
                continue;
            }

            if stride == 0 {
                linear_misses += 1;
                if state.media_ceiling.is_none() && linear_misses >= dead_run_limit {
                    return Ok(BatchStop::DeadRun);
                }
                if !self.stride_enabled || linear_misses < LINEAR_MISS_THRESHOLD {
                    cursor += 1;
                    continue;
                }
                // Long runs of deleted ids: jump instead of crawling.
                stride = 2;
                debug!(event = "batch.stride_on", cursor, "batch.stride_on");
            } else {
                stride_misses += 1;
                // Without ceilings there is nothing to clamp against, so a
                // dead run is the only end-of-content signal.
                if state.media_ceiling.is_none() && stride_misses >= dead_run_limit {
                    return Ok(BatchStop::DeadRun);
                }
                stride = (stride * 2).min(STRIDE_CAP);
            }

            let mut next = cursor + stride;
            if let Some(ceiling) = state.media_ceiling {
                if next > ceiling && cursor < ceiling {
                    next = ceiling;
                }
            }
            if next > cursor + 1 {
                state.stride_jumps += 1;
                skipped.push((cursor + 1, next - 1));
            }
            cursor = next;
        }
    }

    fn past_ceilings(&self, state: &BatchState<'_>, cursor: i64) -> bool {
        match (state.last_msg_ceiling, state.media_ceiling) {
            (Some(last), Some(media)) => cursor > last && cursor > media,
            (Some(last), None) => cursor > last,
            _ => false,
        }
    }

    /// Bounded recursive re-scan of a skipped range, bisection order so real
    /// content near the middle surfaces early.
    async fn backfill(&self, state: &mut BatchState<'_>, lo: i64, hi: i64) -> Result<()> {
        let mut budget = BACKFILL_BUDGET;
        let mut stack = vec![(lo, hi)];
        while let Some((lo, hi)) = stack.pop() {
            if lo > hi || budget == 0 {
                continue;
            }
            if state.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if state.delivered >= state.requested {
                return Ok(());
            }
            if hi - lo < BACKFILL_LINEAR_MAX {
                for id in lo..=hi {
                    if budget == 0 {
                        break;
                    }
                    budget -= 1;
                    self.process_id(state, id).await?;
                    if state.delivered >= state.requested {
                        return Ok(());
                    }
                }
                continue;
            }
            let mid = lo + (hi - lo) / 2;
            budget -= 1;
            self.process_id(state, mid).await?;
            stack.push((mid + 1, hi));
            stack.push((lo, mid - 1));
        }
        Ok(())
    }

    /// Probes one id and, when it carries media, runs it through the full
    /// pipeline. Text messages take the cheap path and do not count toward
    /// the media quota. Returns whether the id held any content.
    async fn process_id(&self, state: &mut BatchState<'_>, id: i64) -> Result<bool> {
        state.scanned += 1;
        state.last_checked = state.last_checked.max(id);
        self.maybe_heartbeat(state);

        let info = match state.probe.message_info(&state.link.chat, id).await {
            Ok(info) => info,
            Err(e) if e.is_transient() => {
                warn!(event = "batch.probe_failed", id, error = %e, "batch.probe_failed");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        let Some(info) = info else {
            return Ok(false);
        };

        if !info.has_media() {
            return Ok(self.forward_text(state, &info).await);
        }

        let item_link = MessageLink {
            message_id: id,
            offset: 0,
            ..state.link.clone()
        };
        let outcome = self
            .orchestrator
            .transfer_message(
                state.user_id,
                state.tier,
                &item_link,
                &state.raw_link,
                state.sink,
                state.cancel,
            )
            .await;
        match outcome {
            Ok(
                TransferOutcome::Copied
                | TransferOutcome::CachedHit
                | TransferOutcome::Uploaded,
            ) => {
                state.delivered += 1;
                state.last_success = Instant::now();
                self.push_status(state);
                Ok(true)
            }
            Ok(TransferOutcome::TextForwarded) => {
                state.text_forwarded += 1;
                Ok(true)
            }
            Err(Error::NotFound) => Ok(false),
            Err(e @ (Error::Cancelled
            | Error::LoginRequired
            | Error::AccessDenied { .. }
            | Error::RateLimited { .. }
            | Error::NoSessionAvailable)) => Err(e),
            Err(e) => {
                // Isolated per-item failure; the batch keeps going.
                warn!(event = "batch.item_failed", id, error = %e, "batch.item_failed");
                Ok(false)
            }
        }
    }

    async fn forward_text(&self, state: &mut BatchState<'_>, info: &MessageInfo) -> bool {
        let Some(text) = info.text.as_deref().filter(|t| !t.is_empty()) else {
            return false;
        };
        match self.orchestrator.bot().send_text(state.user_id, text).await {
            Ok(_) => {
                state.text_forwarded += 1;
                true
            }
            Err(e) => {
                warn!(event = "batch.text_failed", error = %e, "batch.text_failed");
                false
            }
        }
    }

    fn push_status(&self, state: &mut BatchState<'_>) {
        state.last_status = Instant::now();
        state.sink.on_progress(TransferProgress {
            phase: "batch".to_string(),
            link: Some(state.raw_link.clone()),
            processed: Some(state.delivered),
            requested: Some(state.requested),
            ..TransferProgress::default()
        });
    }

    /// "Still alive" note when scanning churns without landing a delivery.
    fn maybe_heartbeat(&self, state: &mut BatchState<'_>) {
        if state.last_success.elapsed() < HEARTBEAT_AFTER
            || state.last_status.elapsed() < HEARTBEAT_AFTER
        {
            return;
        }
        state.last_status = Instant::now();
        state.sink.on_progress(TransferProgress {
            phase: "batch".to_string(),
            processed: Some(state.delivered),
            requested: Some(state.requested),
            note: Some(format!("still scanning, checked up to id {}", state.last_checked)),
            ..TransferProgress::default()
        });
    }
}
