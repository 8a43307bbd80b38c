use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Mutex, mpsc};
use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{
    ChatClient, ChatInfo, ChatKind, ClientFuture, ClientKind, MediaInfo, MediaKind, MessageInfo,
    ProgressFn, TextEntity,
};
use crate::link::ChatRef;
use crate::{Error, Result};

const HELPER_READ_TIMEOUT_SECS: u64 = 180;

#[derive(Debug, Clone)]
pub struct HelperClientConfig {
    pub session_id: String,
    pub helper_path: PathBuf,
    pub session_b64: Option<String>,
    pub kind: ClientKind,
}

/// User-identity flavor backed by an external MTProto helper process
/// speaking newline-delimited JSON over stdio. The helper owns the wire
/// protocol; this side owns spawning, respawn-on-death, read timeouts and
/// session-blob passthrough.
#[derive(Debug)]
pub struct HelperClient {
    config: HelperClientConfig,
    session: Mutex<Option<String>>,
    helper: Mutex<Helper>,
}

impl HelperClient {
    pub async fn connect(config: HelperClientConfig) -> Result<Self> {
        if let Some(blob) = &config.session_b64 {
            // Catch mangled blobs here instead of an opaque helper-side
            // init failure.
            base64::engine::general_purpose::STANDARD
                .decode(blob)
                .map_err(|_| Error::InvalidConfig {
                    message: format!("session {} has an invalid base64 blob", config.session_id),
                })?;
        }
        // Spawn and the init round trip block on subprocess stdio.
        tokio::task::block_in_place(|| {
            let mut helper = Helper::spawn(&config.helper_path)?;
            helper.init(InitRequest {
                session_b64: config.session_b64.clone(),
            })?;
            Ok(Self {
                session: Mutex::new(helper.session_b64.clone()),
                helper: Mutex::new(helper),
                config,
            })
        })
    }

    /// Latest session blob reported by the helper, for persistence.
    pub fn session_b64(&self) -> Option<String> {
        self.session.lock().ok().and_then(|g| g.clone())
    }

    fn replace_helper_locked(&self, helper: &mut Helper) -> Result<()> {
        helper.kill_best_effort();

        let session_b64 = self.session_b64();
        let mut new_helper = Helper::spawn(&self.config.helper_path)?;
        new_helper.init(InitRequest { session_b64 })?;

        *helper = new_helper;
        Ok(())
    }

    /// Every round trip blocks on subprocess stdio, up to the read timeout.
    /// Hand the core off so the rest of the runtime keeps making progress
    /// while a download or upload is in flight.
    fn with_helper<T>(&self, f: impl FnOnce(&mut Helper) -> Result<T>) -> Result<T> {
        tokio::task::block_in_place(|| self.with_helper_inner(f))
    }

    fn with_helper_inner<T>(&self, f: impl FnOnce(&mut Helper) -> Result<T>) -> Result<T> {
        let mut helper = self.helper.lock().map_err(|_| Error::Telegram {
            message: "mtproto helper lock poisoned".to_string(),
        })?;

        // Never keep issuing requests against a dead helper.
        if helper.has_exited() {
            self.replace_helper_locked(&mut helper)?;
        }

        let res = f(&mut helper);

        // Persist the latest session regardless of success/failure.
        if let Ok(mut guard) = self.session.lock()
            && helper.session_b64.is_some()
        {
            *guard = helper.session_b64.clone();
        }

        if let Err(ref e) = res
            && matches!(e, Error::Telegram { message } if message.contains("mtproto helper"))
        {
            let _ = self.replace_helper_locked(&mut helper);
        }

        res
    }
}

impl ChatClient for HelperClient {
    fn kind(&self) -> ClientKind {
        self.config.kind
    }

    fn label(&self) -> &str {
        &self.config.session_id
    }

    fn resolve_chat<'a>(&'a self, chat: &'a ChatRef) -> ClientFuture<'a, ChatInfo> {
        Box::pin(async move {
            let raw: RawChatInfo = self.with_helper(|h| {
                h.round_trip(&Request::ResolveChat(ChatParam::from(chat)), None, None)
            })?;
            Ok(ChatInfo {
                id: raw.id,
                kind: match raw.kind.as_str() {
                    "channel" => ChatKind::Channel,
                    "group" => ChatKind::Group,
                    _ => ChatKind::Private,
                },
                title: raw.title,
                username: raw.username,
                protected_content: raw.protected,
            })
        })
    }

    fn message_info<'a>(
        &'a self,
        chat: &'a ChatRef,
        message_id: i64,
    ) -> ClientFuture<'a, Option<MessageInfo>> {
        Box::pin(async move {
            let raw: Option<RawMessageInfo> = self.with_helper(|h| {
                h.round_trip(
                    &Request::MessageInfo {
                        chat: ChatParam::from(chat),
                        message_id,
                    },
                    None,
                    None,
                )
            })?;
            Ok(raw.map(MessageInfo::from))
        })
    }

    fn last_message_id<'a>(&'a self, chat: &'a ChatRef) -> ClientFuture<'a, i64> {
        Box::pin(async move {
            self.with_helper(|h| {
                h.round_trip(&Request::LastMessageId(ChatParam::from(chat)), None, None)
            })
        })
    }

    fn topic_message_ids<'a>(
        &'a self,
        chat: &'a ChatRef,
        topic_id: i64,
        limit: usize,
    ) -> ClientFuture<'a, Vec<i64>> {
        Box::pin(async move {
            self.with_helper(|h| {
                h.round_trip(
                    &Request::TopicMessageIds {
                        chat: ChatParam::from(chat),
                        topic_id,
                        limit,
                    },
                    None,
                    None,
                )
            })
        })
    }

    fn download_media<'a>(
        &'a self,
        chat: &'a ChatRef,
        message_id: i64,
        dest: &'a Path,
        mut progress: Option<ProgressFn<'a>>,
        cancel: &'a CancellationToken,
    ) -> ClientFuture<'a, u64> {
        Box::pin(async move {
            self.with_helper(|h| {
                let progress = progress.as_deref_mut().map(|cb| cb as &mut dyn FnMut(u64));
                h.round_trip(
                    &Request::Download {
                        chat: ChatParam::from(chat),
                        message_id,
                        dest: dest.to_path_buf(),
                    },
                    progress,
                    Some(cancel),
                )
            })
        })
    }

    fn upload_media<'a>(
        &'a self,
        to_chat: i64,
        path: &'a Path,
        caption: Option<&'a str>,
        entities: &'a [TextEntity],
        mut progress: Option<ProgressFn<'a>>,
        cancel: &'a CancellationToken,
    ) -> ClientFuture<'a, i64> {
        Box::pin(async move {
            self.with_helper(|h| {
                let progress = progress.as_deref_mut().map(|cb| cb as &mut dyn FnMut(u64));
                h.round_trip(
                    &Request::Upload {
                        to_chat,
                        path: path.to_path_buf(),
                        caption: caption.map(|c| c.to_string()),
                        entities: entities.to_vec(),
                    },
                    progress,
                    Some(cancel),
                )
            })
        })
    }

    fn copy_message<'a>(
        &'a self,
        from: &'a ChatRef,
        message_id: i64,
        to_chat: i64,
    ) -> ClientFuture<'a, i64> {
        Box::pin(async move {
            self.with_helper(|h| {
                h.round_trip(
                    &Request::CopyMessage {
                        from: ChatParam::from(from),
                        message_id,
                        to_chat,
                    },
                    None,
                    None,
                )
            })
        })
    }

    fn forward_message<'a>(
        &'a self,
        from_chat: i64,
        message_id: i64,
        to_chat: i64,
    ) -> ClientFuture<'a, i64> {
        Box::pin(async move {
            self.with_helper(|h| {
                h.round_trip(
                    &Request::ForwardMessage {
                        from_chat,
                        message_id,
                        to_chat,
                    },
                    None,
                    None,
                )
            })
        })
    }

    fn send_text<'a>(&'a self, chat_id: i64, text: &'a str) -> ClientFuture<'a, i64> {
        Box::pin(async move {
            self.with_helper(|h| {
                h.round_trip(
                    &Request::SendText {
                        chat_id,
                        text: text.to_string(),
                    },
                    None,
                    None,
                )
            })
        })
    }

    fn edit_text<'a>(
        &'a self,
        chat_id: i64,
        message_id: i64,
        text: &'a str,
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            let _: serde_json::Value = self.with_helper(|h| {
                h.round_trip(
                    &Request::EditText {
                        chat_id,
                        message_id,
                        text: text.to_string(),
                    },
                    None,
                    None,
                )
            })?;
            Ok(())
        })
    }

    fn delete_message<'a>(&'a self, chat_id: i64, message_id: i64) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            let _: serde_json::Value = self.with_helper(|h| {
                h.round_trip(
                    &Request::DeleteMessage {
                        chat_id,
                        message_id,
                    },
                    None,
                    None,
                )
            })?;
            Ok(())
        })
    }

    fn join_invite<'a>(&'a self, hash: &'a str) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            let _: serde_json::Value = self.with_helper(|h| {
                h.round_trip(
                    &Request::JoinInvite {
                        hash: hash.to_string(),
                    },
                    None,
                    None,
                )
            })?;
            Ok(())
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum Request {
    Init(InitRequest),
    ResolveChat(ChatParam),
    MessageInfo {
        chat: ChatParam,
        #[serde(rename = "messageId")]
        message_id: i64,
    },
    LastMessageId(ChatParam),
    TopicMessageIds {
        chat: ChatParam,
        #[serde(rename = "topicId")]
        topic_id: i64,
        limit: usize,
    },
    Download {
        chat: ChatParam,
        #[serde(rename = "messageId")]
        message_id: i64,
        dest: PathBuf,
    },
    Upload {
        #[serde(rename = "toChat")]
        to_chat: i64,
        path: PathBuf,
        caption: Option<String>,
        entities: Vec<TextEntity>,
    },
    CopyMessage {
        from: ChatParam,
        #[serde(rename = "messageId")]
        message_id: i64,
        #[serde(rename = "toChat")]
        to_chat: i64,
    },
    ForwardMessage {
        #[serde(rename = "fromChat")]
        from_chat: i64,
        #[serde(rename = "messageId")]
        message_id: i64,
        #[serde(rename = "toChat")]
        to_chat: i64,
    },
    SendText {
        #[serde(rename = "chatId")]
        chat_id: i64,
        text: String,
    },
    EditText {
        #[serde(rename = "chatId")]
        chat_id: i64,
        #[serde(rename = "messageId")]
        message_id: i64,
        text: String,
    },
    DeleteMessage {
        #[serde(rename = "chatId")]
        chat_id: i64,
        #[serde(rename = "messageId")]
        message_id: i64,
    },
    JoinInvite {
        hash: String,
    },
}

#[derive(Debug, Serialize)]
struct InitRequest {
    #[serde(rename = "session")]
    session_b64: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum ChatParam {
    Username(String),
    Id(i64),
}

impl From<&ChatRef> for ChatParam {
    fn from(chat: &ChatRef) -> Self {
        match chat {
            ChatRef::Username(u) => ChatParam::Username(u.clone()),
            ChatRef::Id(id) => ChatParam::Id(*id),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResponseEnvelope {
    ok: bool,
    error: Option<String>,
    #[serde(rename = "errorKind")]
    error_kind: Option<String>,
    #[serde(rename = "floodWaitSeconds")]
    flood_wait_seconds: Option<u64>,
    #[serde(rename = "session")]
    session_b64: Option<String>,
    #[serde(flatten)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RawChatInfo {
    id: i64,
    kind: String,
    title: String,
    username: Option<String>,
    protected: bool,
}

#[derive(Debug, Deserialize)]
struct RawMessageInfo {
    id: i64,
    #[serde(rename = "chatId")]
    chat_id: i64,
    media: Option<RawMediaInfo>,
    text: Option<String>,
    #[serde(default)]
    entities: Vec<TextEntity>,
}

#[derive(Debug, Deserialize)]
struct RawMediaInfo {
    kind: String,
    #[serde(rename = "fileSize")]
    file_size: u64,
    #[serde(rename = "fileName")]
    file_name: Option<String>,
}

impl From<RawMessageInfo> for MessageInfo {
    fn from(raw: RawMessageInfo) -> Self {
        MessageInfo {
            id: raw.id,
            chat_id: raw.chat_id,
            media: raw.media.map(|m| MediaInfo {
                kind: match m.kind.as_str() {
                    "photo" => MediaKind::Photo,
                    "video" => MediaKind::Video,
                    "audio" => MediaKind::Audio,
                    "voice" => MediaKind::Voice,
                    "animation" => MediaKind::Animation,
                    _ => MediaKind::Document,
                },
                file_size: m.file_size,
                file_name: m.file_name,
            }),
            text: raw.text,
            entities: raw.entities,
        }
    }
}

#[derive(Debug)]
struct Helper {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    session_b64: Option<String>,
}

impl Helper {
    fn spawn(path: &Path) -> Result<Self> {
        let mut child = Command::new(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| Error::InvalidConfig {
                message: format!(
                    "failed to start mtproto helper: {} (path={})",
                    e,
                    path.display()
                ),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| Error::InvalidConfig {
            message: "mtproto helper missing stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| Error::InvalidConfig {
            message: "mtproto helper missing stdout".to_string(),
        })?;

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            session_b64: None,
        })
    }

    fn has_exited(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(_) => true,
        }
    }

    fn kill_best_effort(&mut self) {
        let _ = self.child.kill();
        for _ in 0..50 {
            match self.child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) => std::thread::sleep(Duration::from_millis(100)),
                Err(_) => break,
            }
        }
    }

    fn init(&mut self, req: InitRequest) -> Result<()> {
        let _: serde_json::Value = self.round_trip(&Request::Init(req), None, None)?;
        Ok(())
    }

    /// Sends one request and reads envelopes until the terminal one,
    /// surfacing `progress` events and observing `cancel` between them.
    fn round_trip<T: serde::de::DeserializeOwned>(
        &mut self,
        req: &Request,
        mut on_progress: Option<&mut dyn FnMut(u64)>,
        cancel: Option<&CancellationToken>,
    ) -> Result<T> {
        self.send_json(req)?;

        loop {
            if let Some(cancel) = cancel
                && cancel.is_cancelled()
            {
                // Abort the outstanding network operation; the next caller
                // gets a fresh helper via the exited check.
                self.kill_best_effort();
                return Err(Error::Cancelled);
            }

            let env = self.read_json_line()?;
            if let Some(b64) = &env.session_b64
                && !b64.is_empty()
            {
                self.session_b64 = Some(b64.clone());
            }

            if !env.ok {
                return Err(map_helper_error(&env));
            }

            let event = env
                .data
                .get("event")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if event == "progress" {
                if let (Some(bytes), Some(cb)) = (
                    env.data.get("bytes").and_then(|v| v.as_u64()),
                    on_progress.as_mut(),
                ) {
                    (**cb)(bytes);
                }
                continue;
            }

            let result = env
                .data
                .get("result")
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            return serde_json::from_value(result).map_err(|e| Error::Telegram {
                message: format!("mtproto helper invalid result: {e}"),
            });
        }
    }

    fn send_json(&mut self, req: &Request) -> Result<()> {
        let line = serde_json::to_string(req).map_err(|e| Error::InvalidConfig {
            message: format!("mtproto helper request json failed: {e}"),
        })?;
        self.stdin
            .write_all(line.as_bytes())
            .and_then(|_| self.stdin.write_all(b"\n"))
            .map_err(|e| Error::Telegram {
                message: format!("mtproto helper write failed: {e}"),
            })?;
        self.stdin.flush().ok();
        Ok(())
    }

    fn read_json_line(&mut self) -> Result<ResponseEnvelope> {
        let (child, stdout) = (&mut self.child, &mut self.stdout);
        let (tx, rx) = mpsc::channel::<std::io::Result<String>>();

        std::thread::scope(|s| {
            s.spawn(|| {
                let mut line = String::new();
                let res = stdout.read_line(&mut line).and_then(|n| {
                    if n == 0 {
                        Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "mtproto helper closed stdout",
                        ))
                    } else {
                        Ok(line)
                    }
                });
                let _ = tx.send(res);
            });

            let line = match rx.recv_timeout(Duration::from_secs(HELPER_READ_TIMEOUT_SECS)) {
                Ok(Ok(line)) => line,
                Ok(Err(e)) => {
                    return Err(Error::Telegram {
                        message: format!("mtproto helper read failed: {e}"),
                    });
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    // Unresponsive helper: kill it so the blocked read
                    // unblocks, then let the caller respawn.
                    let _ = child.kill();
                    for _ in 0..50 {
                        match child.try_wait() {
                            Ok(Some(_)) => break,
                            Ok(None) => std::thread::sleep(Duration::from_millis(100)),
                            Err(_) => break,
                        }
                    }
                    return Err(Error::Telegram {
                        message: format!(
                            "mtproto helper timed out waiting for response after {HELPER_READ_TIMEOUT_SECS}s"
                        ),
                    });
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(Error::Telegram {
                        message: "mtproto helper response channel disconnected".to_string(),
                    });
                }
            };

            serde_json::from_str::<ResponseEnvelope>(line.trim_end()).map_err(|e| {
                Error::Telegram {
                    message: format!("mtproto helper invalid response: {e}"),
                }
            })
        })
    }
}

fn map_helper_error(env: &ResponseEnvelope) -> Error {
    let message = env
        .error
        .clone()
        .unwrap_or_else(|| "mtproto helper returned ok=false".to_string());
    match env.error_kind.as_deref() {
        Some("flood_wait") => Error::RateLimited {
            seconds: env.flood_wait_seconds.unwrap_or(30),
        },
        Some("access_denied") => Error::AccessDenied { message },
        Some("not_found") => Error::NotFound,
        Some("login_required") => Error::LoginRequired,
        Some("transient") => Error::TransientIo { message },
        _ => Error::Telegram { message },
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    fn stub_helper(script: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("helper.sh");
        std::fs::write(&path, script).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        (dir, path)
    }

    fn config(path: PathBuf, session_b64: Option<String>) -> HelperClientConfig {
        HelperClientConfig {
            session_id: "stub".to_string(),
            helper_path: path,
            session_b64,
            kind: ClientKind::User,
        }
    }

    // A round trip that takes a second to answer must not stall the rest of
    // the runtime while it blocks on the subprocess pipe.
    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn slow_helper_reply_does_not_stall_the_runtime() {
        let (_dir, path) = stub_helper(
            "#!/bin/sh\n\
             read line\n\
             echo '{\"ok\":true,\"result\":null}'\n\
             read line\n\
             sleep 1\n\
             echo '{\"ok\":true,\"result\":null}'\n",
        );
        let client = HelperClient::connect(config(path, None)).await.unwrap();

        let ticked = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ticked);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            flag.store(true, Ordering::SeqCst);
        });

        client.edit_text(1, 1, "x").await.unwrap();
        assert!(ticked.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn helper_error_kinds_map_onto_the_taxonomy() {
        let (_dir, path) = stub_helper(
            "#!/bin/sh\n\
             read line\n\
             echo '{\"ok\":true,\"result\":null}'\n\
             read line\n\
             echo '{\"ok\":false,\"error\":\"slow down\",\"errorKind\":\"flood_wait\",\"floodWaitSeconds\":42}'\n",
        );
        let client = HelperClient::connect(config(path, None)).await.unwrap();
        let err = client.edit_text(1, 1, "x").await.unwrap_err();
        assert!(matches!(err, Error::RateLimited { seconds: 42 }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn mangled_session_blob_is_rejected_before_spawn() {
        let (_dir, path) = stub_helper("#!/bin/sh\nread line\n");
        let err = HelperClient::connect(config(path, Some("not base64!!".to_string())))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }
}
