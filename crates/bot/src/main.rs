use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use savegram_core::APP_NAME;
use savegram_core::Error;
use savegram_core::batch::{BatchDriver, BatchStop, BatchSummary};
use savegram_core::client::botapi::{BotApiClient, BotApiConfig};
use savegram_core::client::helper::{HelperClient, HelperClientConfig};
use savegram_core::client::{ChatClient, ClientKind};
use savegram_core::config::{Settings, Tier};
use savegram_core::db::open_db;
use savegram_core::orchestrator::{TransferOrchestrator, TransferOutcome};
use savegram_core::progress::{ProgressSink, Throttle, TransferProgress};
use savegram_core::session_pool::SessionPool;

const UPDATE_POLL_SECS: u64 = 30;
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);
const SCRATCH_MAX_AGE: Duration = Duration::from_secs(6 * 3600);
const PURGE_INTERVAL: Duration = Duration::from_secs(24 * 3600);

fn init_tracing() {
    let filter = std::env::var("SAVEGRAM_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .and_then(|v| EnvFilter::try_new(v).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn config_path() -> PathBuf {
    std::env::var("SAVEGRAM_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("savegram.toml"))
}

struct App {
    orchestrator: Arc<TransferOrchestrator>,
    bot: Arc<dyn ChatClient>,
}

impl App {
    fn tier_for(&self, user_id: i64) -> Tier {
        if self.orchestrator.settings().premium_users.contains(&user_id) {
            Tier::Premium
        } else {
            Tier::Free
        }
    }
}

#[derive(Debug, PartialEq)]
enum Command {
    Help,
    Cancel,
    Tasks,
    Batch { link: String, count: u32 },
    Single { link: String },
}

fn parse_command(text: &str) -> Option<Command> {
    let text = text.trim();
    let mut words = text.split_whitespace();
    let head = words.next()?;

    match head {
        "/start" | "/help" => Some(Command::Help),
        "/cancel" => Some(Command::Cancel),
        "/tasks" | "/status" => Some(Command::Tasks),
        "/batch" => {
            let link = words.next()?.to_string();
            let count = words.next().and_then(|w| w.parse().ok()).unwrap_or(1);
            Some(Command::Batch { link, count })
        }
        _ => text
            .split_whitespace()
            .find(|w| w.contains("t.me/") || w.contains("telegram.me/"))
            .map(|w| Command::Single {
                link: w.to_string(),
            }),
    }
}

const HELP_TEXT: &str = "Send a message link (t.me/...) to save its content.\n\
/batch <link> <count> - save a run of messages starting at the link\n\
/cancel - stop your current transfer\n\
/tasks - show what is running";

/// Forwards progress updates into a channel; the per-chat renderer task on
/// the other end turns them into a single edited status message.
struct ChannelSink {
    tx: mpsc::UnboundedSender<TransferProgress>,
}

impl ProgressSink for ChannelSink {
    fn on_progress(&self, progress: TransferProgress) {
        let _ = self.tx.send(progress);
    }
}

fn spawn_status_renderer(
    bot: Arc<dyn ChatClient>,
    chat_id: i64,
    interval: Duration,
) -> Arc<dyn ProgressSink> {
    let (tx, mut rx) = mpsc::unbounded_channel::<TransferProgress>();
    tokio::spawn(async move {
        let throttle = Throttle::new(interval);
        let mut status_msg: Option<i64> = None;
        while let Some(progress) = rx.recv().await {
            let text = render_progress(&progress);
            match status_msg {
                None => match bot.send_text(chat_id, &text).await {
                    Ok(id) => status_msg = Some(id),
                    Err(e) => {
                        warn!(event = "status.send_failed", chat_id, error = %e, "status.send_failed");
                    }
                },
                Some(id) => {
                    if throttle.ready() {
                        if let Err(e) = bot.edit_text(chat_id, id, &text).await {
                            warn!(event = "status.edit_failed", chat_id, error = %e, "status.edit_failed");
                        }
                    }
                }
            }
        }
    });
    Arc::new(ChannelSink { tx })
}

fn render_progress(p: &TransferProgress) -> String {
    let mut line = match p.phase.as_str() {
        "queued" => match p.queue_position {
            Some(pos) => format!("Queued (position {pos})"),
            None => "Queued".to_string(),
        },
        "preparing" => "Preparing".to_string(),
        "downloading" => "Downloading".to_string(),
        "uploading" => "Uploading".to_string(),
        "rate_limited" => "Rate limited, waiting".to_string(),
        "batch" => "Batch running".to_string(),
        other => other.to_string(),
    };
    if let Some(percent) = p.percent {
        line.push_str(&format!(" {percent:.0}%"));
    }
    if let (Some(done), Some(total)) = (p.processed, p.requested) {
        line.push_str(&format!(" ({done}/{total})"));
    }
    if let Some(note) = &p.note {
        line.push_str("\n");
        line.push_str(note);
    }
    line
}

fn outcome_text(outcome: &TransferOutcome) -> String {
    match outcome {
        TransferOutcome::Copied => "Done. Copied directly from the source.".to_string(),
        TransferOutcome::CachedHit => "Done. Served from cache.".to_string(),
        TransferOutcome::Uploaded => "Done. Saved and delivered.".to_string(),
        TransferOutcome::TextForwarded => "Done. Text forwarded.".to_string(),
    }
}

fn error_text(e: &Error) -> String {
    match e {
        Error::LoginRequired => {
            "This content needs a signed-in personal session, and none is set up for you."
                .to_string()
        }
        Error::RateLimited { seconds } => {
            format!("Rate limited. Try again in about {seconds} seconds.")
        }
        Error::Busy => "You already have a transfer running. /cancel it first.".to_string(),
        Error::NoSessionAvailable => {
            "All fetch sessions are busy right now. Try again shortly.".to_string()
        }
        Error::AccessDenied { .. } => "That content is not accessible.".to_string(),
        Error::NotFound => "That message does not exist or was deleted.".to_string(),
        Error::Cancelled => "Cancelled.".to_string(),
        other => {
            warn!(event = "transfer.user_error", error = %other, "transfer.user_error");
            "The transfer failed. Try again later.".to_string()
        }
    }
}

fn summary_text(s: &BatchSummary) -> String {
    let mut text = format!(
        "Batch finished: {} of {} delivered ({} messages checked)",
        s.delivered, s.requested, s.scanned
    );
    if s.text_forwarded > 0 {
        text.push_str(&format!(", {} text messages forwarded", s.text_forwarded));
    }
    match s.stop {
        BatchStop::ReachedCount => {}
        BatchStop::PastEnd => text.push_str(".\nReached the end of the chat."),
        BatchStop::DeadRun => text.push_str(".\nStopped after a long run of deleted messages."),
        BatchStop::Cancelled => text.push_str(".\nCancelled."),
        BatchStop::Failed => {
            if let Some(reason) = &s.failure {
                text.push_str(&format!(".\nStopped: {reason}"));
            }
        }
    }
    text
}

fn tasks_text(app: &App) -> String {
    let tasks = app.orchestrator.snapshot_running_tasks();
    let waiting = app.orchestrator.queue.waiting();
    if tasks.is_empty() && waiting == 0 {
        return "Nothing is running.".to_string();
    }
    let mut lines = Vec::new();
    for t in tasks {
        let progress = match t.percent {
            Some(p) => format!(" {p:.0}%"),
            None => String::new(),
        };
        lines.push(format!("{:?}{} - {}", t.stage, progress, t.link));
    }
    if waiting > 0 {
        lines.push(format!("{waiting} waiting in queue"));
    }
    lines.join("\n")
}

async fn handle_message(app: Arc<App>, chat_id: i64, user_id: i64, text: String) {
    let Some(command) = parse_command(&text) else {
        return;
    };

    match command {
        Command::Help => {
            let _ = app.bot.send_text(chat_id, HELP_TEXT).await;
        }
        Command::Cancel => {
            let reply = if app.orchestrator.cancel(user_id) {
                "Cancel requested."
            } else {
                "Nothing to cancel."
            };
            let _ = app.bot.send_text(chat_id, reply).await;
        }
        Command::Tasks => {
            let _ = app.bot.send_text(chat_id, &tasks_text(&app)).await;
        }
        Command::Single { link } => {
            let tier = app.tier_for(user_id);
            let interval =
                Duration::from_secs(app.orchestrator.settings().transfer.progress_interval_seconds);
            let sink = spawn_status_renderer(app.bot.clone(), chat_id, interval);
            let result = app
                .orchestrator
                .submit_single(user_id, tier, &link, sink)
                .await;
            let reply = match &result {
                Ok(outcome) => outcome_text(outcome),
                Err(e) => error_text(e),
            };
            let _ = app.bot.send_text(chat_id, &reply).await;
        }
        Command::Batch { link, count } => {
            let tier = app.tier_for(user_id);
            let interval =
                Duration::from_secs(app.orchestrator.settings().transfer.progress_interval_seconds);
            let sink = spawn_status_renderer(app.bot.clone(), chat_id, interval);
            let driver = BatchDriver::new(app.orchestrator.clone());
            let reply = match driver
                .submit_batch(user_id, tier, &link, count, sink)
                .await
            {
                Ok(summary) => summary_text(&summary),
                Err(e) => error_text(&e),
            };
            let _ = app.bot.send_text(chat_id, &reply).await;
        }
    }
}

async fn connect_secondary(settings: &Settings) -> Option<Arc<dyn ChatClient>> {
    let cred = settings.secondary_session.as_ref()?;
    match HelperClient::connect(HelperClientConfig {
        session_id: cred.id.clone(),
        helper_path: cred.helper_path.clone(),
        session_b64: cred.session_b64.clone(),
        kind: ClientKind::SecondaryLarge,
    })
    .await
    {
        Ok(client) => {
            info!(event = "secondary.connected", session_id = %cred.id, "secondary.connected");
            Some(Arc::new(client))
        }
        Err(e) => {
            warn!(event = "secondary.connect_failed", session_id = %cred.id, error = %e, "secondary.connect_failed");
            None
        }
    }
}

async fn register_user_sessions(orchestrator: &TransferOrchestrator, settings: &Settings) {
    for cred in &settings.user_sessions {
        let config = HelperClientConfig {
            session_id: format!("user-{}", cred.user_id),
            helper_path: cred.helper_path.clone(),
            session_b64: cred.session_b64.clone(),
            kind: ClientKind::User,
        };
        match HelperClient::connect(config).await {
            Ok(client) => {
                orchestrator.register_user_session(cred.user_id, Arc::new(client));
                info!(event = "user_session.connected", user_id = cred.user_id, "user_session.connected");
            }
            Err(e) => {
                warn!(event = "user_session.connect_failed", user_id = cred.user_id, error = %e, "user_session.connect_failed");
            }
        }
    }
}

fn spawn_maintenance(orchestrator: Arc<TransferOrchestrator>) {
    let sweeper = orchestrator.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(SWEEP_INTERVAL).await;
            let removed = sweeper.cleanup.sweep_stale(SCRATCH_MAX_AGE).await;
            if removed > 0 {
                info!(event = "scratch.swept", removed, "scratch.swept");
            }
        }
    });

    tokio::spawn(async move {
        let retention = orchestrator.settings().dedup.retention_days;
        loop {
            let purged = orchestrator.dedup.purge_expired(retention).await;
            if purged > 0 {
                info!(event = "dedup.purged", purged, "dedup.purged");
            }
            tokio::time::sleep(PURGE_INTERVAL).await;
        }
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = config_path();
    let raw = std::fs::read_to_string(&config_path)
        .map_err(|e| format!("cannot read {}: {e}", config_path.display()))?;
    let settings: Settings = toml::from_str(&raw)?;
    settings.validate()?;
    std::fs::create_dir_all(settings.scratch_dir())?;

    let bot_token = std::env::var("SAVEGRAM_BOT_TOKEN")
        .map_err(|_| "SAVEGRAM_BOT_TOKEN is not set")?;
    let bot_api = Arc::new(BotApiClient::new(BotApiConfig { bot_token }));
    let bot: Arc<dyn ChatClient> = bot_api.clone();

    let db = open_db(&settings.db_path()).await?;

    let pool = SessionPool::new();
    pool.initialize(&settings.sessions).await;

    let secondary = connect_secondary(&settings).await;
    let orchestrator =
        TransferOrchestrator::new(settings.clone(), db, bot.clone(), secondary, pool.clone());
    register_user_sessions(&orchestrator, &settings).await;

    // Anything left in scratch belongs to a previous run.
    let leftover = orchestrator.cleanup.sweep_stale(Duration::ZERO).await;
    if leftover > 0 {
        info!(event = "scratch.recovered", removed = leftover, "scratch.recovered");
    }

    spawn_maintenance(orchestrator.clone());

    info!(
        event = "daemon.started",
        app = APP_NAME,
        pool_sessions = pool.total(),
        capacity = settings.admission.capacity,
        "daemon.started"
    );

    let app = Arc::new(App { orchestrator, bot });
    let mut offset: i64 = 0;

    loop {
        let updates = match bot_api.get_updates(offset, UPDATE_POLL_SECS).await {
            Ok(updates) => updates,
            Err(e) => {
                warn!(event = "updates.poll_failed", error = %e, "updates.poll_failed");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        for update in updates {
            offset = offset.max(update.update_id + 1);
            let Some(message) = update.message else {
                continue;
            };
            let (Some(chat), Some(from), Some(text)) = (message.chat, message.from, message.text)
            else {
                continue;
            };
            // Commands are accepted in direct chats only.
            if chat.id != from.id {
                continue;
            }
            let app = app.clone();
            tokio::spawn(handle_message(app, chat.id, from.id, text));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_link_becomes_a_single_transfer() {
        let cmd = parse_command("please save https://t.me/somechannel/42");
        assert_eq!(
            cmd,
            Some(Command::Single {
                link: "https://t.me/somechannel/42".to_string()
            })
        );
    }

    #[test]
    fn batch_command_parses_link_and_count() {
        let cmd = parse_command("/batch t.me/c/1234/10 25");
        assert_eq!(
            cmd,
            Some(Command::Batch {
                link: "t.me/c/1234/10".to_string(),
                count: 25
            })
        );
    }

    #[test]
    fn batch_without_count_defaults_to_one() {
        let cmd = parse_command("/batch t.me/chan/7");
        assert_eq!(
            cmd,
            Some(Command::Batch {
                link: "t.me/chan/7".to_string(),
                count: 1
            })
        );
    }

    #[test]
    fn plain_chatter_is_ignored() {
        assert_eq!(parse_command("hello there"), None);
        assert_eq!(parse_command(""), None);
    }

    #[test]
    fn progress_render_shows_queue_position() {
        let p = TransferProgress {
            phase: "queued".to_string(),
            queue_position: Some(3),
            ..TransferProgress::default()
        };
        assert_eq!(render_progress(&p), "Queued (position 3)");
    }
}
