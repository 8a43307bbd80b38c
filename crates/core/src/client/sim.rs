use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use super::{
    ChatClient, ChatInfo, ChatKind, ClientFuture, ClientKind, MediaInfo, MediaKind, MessageInfo,
    ProgressFn, TextEntity,
};
use crate::link::ChatRef;
use crate::{Error, Result};

/// Scripted failure injected ahead of the next matching call.
#[derive(Debug, Clone, Copy)]
pub enum SimFailure {
    RateLimited(u64),
    Transient,
    AccessDenied,
}

impl SimFailure {
    fn into_error(self) -> Error {
        match self {
            SimFailure::RateLimited(seconds) => Error::RateLimited { seconds },
            SimFailure::Transient => Error::TransientIo {
                message: "simulated connection reset".to_string(),
            },
            SimFailure::AccessDenied => Error::AccessDenied {
                message: "simulated denial".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimMedia {
    pub kind: MediaKind,
    pub bytes: Vec<u8>,
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SimMessage {
    pub topic_id: Option<i64>,
    pub text: Option<String>,
    pub entities: Vec<TextEntity>,
    pub media: Option<SimMedia>,
}

struct SimChat {
    info: ChatInfo,
    /// Whether the bot identity may read/copy from this chat; models the
    /// hidden-history / not-a-member cases.
    bot_readable: bool,
    messages: BTreeMap<i64, SimMessage>,
    next_message_id: i64,
}

#[derive(Default)]
struct WorldState {
    chats: HashMap<i64, SimChat>,
    usernames: HashMap<String, i64>,
    download_failures: VecDeque<SimFailure>,
    upload_failures: VecDeque<SimFailure>,
    copy_failures: VecDeque<SimFailure>,
}

/// Shared in-memory chat platform for tests. Several `SimClient` handles
/// (bot, user, secondary) view the same world.
#[derive(Default)]
pub struct SimWorld {
    state: Mutex<WorldState>,
    pub info_calls: AtomicUsize,
    pub download_calls: AtomicUsize,
    pub upload_calls: AtomicUsize,
    pub copy_calls: AtomicUsize,
    pub forward_calls: AtomicUsize,
    /// Per-download artificial duration, to exercise mid-fetch cancellation.
    pub download_delay_ms: AtomicU64,
}

impl SimWorld {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn client(self: &Arc<Self>, kind: ClientKind, label: &str) -> Arc<SimClient> {
        Arc::new(SimClient {
            world: Arc::clone(self),
            kind,
            label: label.to_string(),
        })
    }

    pub fn add_chat(
        &self,
        id: i64,
        kind: ChatKind,
        username: Option<&str>,
        protected: bool,
        bot_readable: bool,
    ) {
        let mut state = self.state.lock().expect("sim world mutex poisoned");
        if let Some(u) = username {
            state.usernames.insert(u.to_string(), id);
        }
        state.chats.insert(
            id,
            SimChat {
                info: ChatInfo {
                    id,
                    kind,
                    title: format!("chat {id}"),
                    username: username.map(|u| u.to_string()),
                    protected_content: protected,
                },
                bot_readable,
                messages: BTreeMap::new(),
                next_message_id: 1,
            },
        );
    }

    pub fn put_message(&self, chat_id: i64, message_id: i64, message: SimMessage) {
        let mut state = self.state.lock().expect("sim world mutex poisoned");
        let chat = state.chats.get_mut(&chat_id).expect("unknown sim chat");
        chat.next_message_id = chat.next_message_id.max(message_id + 1);
        chat.messages.insert(message_id, message);
    }

    pub fn put_media(&self, chat_id: i64, message_id: i64, bytes: &[u8]) {
        self.put_message(
            chat_id,
            message_id,
            SimMessage {
                media: Some(SimMedia {
                    kind: MediaKind::Document,
                    bytes: bytes.to_vec(),
                    file_name: Some(format!("m{message_id}.bin")),
                }),
                ..SimMessage::default()
            },
        );
    }

    pub fn put_text(&self, chat_id: i64, message_id: i64, text: &str) {
        self.put_message(
            chat_id,
            message_id,
            SimMessage {
                text: Some(text.to_string()),
                ..SimMessage::default()
            },
        );
    }

    /// Message ids currently present in a chat, ascending.
    pub fn message_ids(&self, chat_id: i64) -> Vec<i64> {
        let state = self.state.lock().expect("sim world mutex poisoned");
        state
            .chats
            .get(&chat_id)
            .map(|c| c.messages.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn message_count(&self, chat_id: i64) -> usize {
        self.message_ids(chat_id).len()
    }

    /// File names of all media delivered into a chat, sorted.
    pub fn media_names(&self, chat_id: i64) -> Vec<String> {
        let state = self.state.lock().expect("sim world mutex poisoned");
        let mut names: Vec<String> = state
            .chats
            .get(&chat_id)
            .map(|chat| {
                chat.messages
                    .values()
                    .filter_map(|m| m.media.as_ref())
                    .filter_map(|media| media.file_name.clone())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn push_download_failure(&self, failure: SimFailure) {
        self.state
            .lock()
            .expect("sim world mutex poisoned")
            .download_failures
            .push_back(failure);
    }

    pub fn push_upload_failure(&self, failure: SimFailure) {
        self.state
            .lock()
            .expect("sim world mutex poisoned")
            .upload_failures
            .push_back(failure);
    }

    pub fn push_copy_failure(&self, failure: SimFailure) {
        self.state
            .lock()
            .expect("sim world mutex poisoned")
            .copy_failures
            .push_back(failure);
    }

    fn resolve_id(&self, chat: &ChatRef) -> Result<i64> {
        let state = self.state.lock().expect("sim world mutex poisoned");
        match chat {
            ChatRef::Id(id) if state.chats.contains_key(id) => Ok(*id),
            ChatRef::Username(u) => state.usernames.get(u).copied().ok_or(Error::NotFound),
            ChatRef::Id(_) => Err(Error::NotFound),
        }
    }

    fn check_readable(&self, chat_id: i64, kind: ClientKind) -> Result<()> {
        let state = self.state.lock().expect("sim world mutex poisoned");
        let chat = state.chats.get(&chat_id).ok_or(Error::NotFound)?;
        if kind == ClientKind::Bot && !chat.bot_readable {
            return Err(Error::AccessDenied {
                message: "bot is not a member of this chat".to_string(),
            });
        }
        Ok(())
    }
}

pub struct SimClient {
    world: Arc<SimWorld>,
    kind: ClientKind,
    label: String,
}

impl SimClient {
    fn append_message(&self, chat_id: i64, message: SimMessage) -> Result<i64> {
        let mut state = self.world.state.lock().expect("sim world mutex poisoned");
        let chat = state.chats.get_mut(&chat_id).ok_or(Error::NotFound)?;
        let id = chat.next_message_id;
        chat.next_message_id += 1;
        chat.messages.insert(id, message);
        Ok(id)
    }

    fn get_message(&self, chat_id: i64, message_id: i64) -> Result<Option<SimMessage>> {
        let state = self.world.state.lock().expect("sim world mutex poisoned");
        let chat = state.chats.get(&chat_id).ok_or(Error::NotFound)?;
        Ok(chat.messages.get(&message_id).cloned())
    }
}

impl ChatClient for SimClient {
    fn kind(&self) -> ClientKind {
        self.kind
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn resolve_chat<'a>(&'a self, chat: &'a ChatRef) -> ClientFuture<'a, ChatInfo> {
        Box::pin(async move {
            let id = self.world.resolve_id(chat)?;
            let state = self.world.state.lock().expect("sim world mutex poisoned");
            Ok(state.chats.get(&id).ok_or(Error::NotFound)?.info.clone())
        })
    }

    fn message_info<'a>(
        &'a self,
        chat: &'a ChatRef,
        message_id: i64,
    ) -> ClientFuture<'a, Option<MessageInfo>> {
        Box::pin(async move {
            self.world.info_calls.fetch_add(1, Ordering::Relaxed);
            let chat_id = self.world.resolve_id(chat)?;
            self.world.check_readable(chat_id, self.kind)?;
            Ok(self.get_message(chat_id, message_id)?.map(|m| MessageInfo {
                id: message_id,
                chat_id,
                media: m.media.as_ref().map(|media| MediaInfo {
                    kind: media.kind,
                    file_size: media.bytes.len() as u64,
                    file_name: media.file_name.clone(),
                }),
                text: m.text.clone(),
                entities: m.entities.clone(),
            }))
        })
    }

    fn last_message_id<'a>(&'a self, chat: &'a ChatRef) -> ClientFuture<'a, i64> {
        Box::pin(async move {
            let chat_id = self.world.resolve_id(chat)?;
            self.world.check_readable(chat_id, self.kind)?;
            let state = self.world.state.lock().expect("sim world mutex poisoned");
            let chat = state.chats.get(&chat_id).ok_or(Error::NotFound)?;
            Ok(chat.messages.keys().next_back().copied().unwrap_or(0))
        })
    }

    fn topic_message_ids<'a>(
        &'a self,
        chat: &'a ChatRef,
        topic_id: i64,
        limit: usize,
    ) -> ClientFuture<'a, Vec<i64>> {
        Box::pin(async move {
            let chat_id = self.world.resolve_id(chat)?;
            self.world.check_readable(chat_id, self.kind)?;
            let state = self.world.state.lock().expect("sim world mutex poisoned");
            let chat = state.chats.get(&chat_id).ok_or(Error::NotFound)?;
            Ok(chat
                .messages
                .iter()
                .filter(|(_, m)| m.topic_id == Some(topic_id))
                .map(|(id, _)| *id)
                .take(limit)
                .collect())
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
            self.world.download_calls.fetch_add(1, Ordering::Relaxed);
            if let Some(failure) = self
                .world
                .state
                .lock()
                .expect("sim world mutex poisoned")
                .download_failures
                .pop_front()
            {
                return Err(failure.into_error());
            }

            let chat_id = self.world.resolve_id(chat)?;
            self.world.check_readable(chat_id, self.kind)?;
            let message = self.get_message(chat_id, message_id)?.ok_or(Error::NotFound)?;
            let media = message.media.ok_or(Error::NotFound)?;

            let delay_ms = self.world.download_delay_ms.load(Ordering::Relaxed);
            let mut elapsed = 0u64;
            while elapsed < delay_ms {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                elapsed += 10;
                if let Some(cb) = progress.as_mut() {
                    cb(media.bytes.len() as u64 * elapsed / delay_ms.max(1));
                }
            }
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            tokio::fs::write(dest, &media.bytes).await?;
            if let Some(cb) = progress.as_mut() {
                cb(media.bytes.len() as u64);
            }
            Ok(media.bytes.len() as u64)
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
            self.world.upload_calls.fetch_add(1, Ordering::Relaxed);
            if let Some(failure) = self
                .world
                .state
                .lock()
                .expect("sim world mutex poisoned")
                .upload_failures
                .pop_front()
            {
                return Err(failure.into_error());
            }
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let bytes = tokio::fs::read(path).await?;
            if let Some(cb) = progress.as_mut() {
                cb(bytes.len() as u64);
            }
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned());
            self.append_message(
                to_chat,
                SimMessage {
                    topic_id: None,
                    text: caption.map(|c| c.to_string()),
                    entities: entities.to_vec(),
                    media: Some(SimMedia {
                        kind: MediaKind::Document,
                        bytes,
                        file_name,
                    }),
                },
            )
        })
    }

    fn copy_message<'a>(
        &'a self,
        from: &'a ChatRef,
        message_id: i64,
        to_chat: i64,
    ) -> ClientFuture<'a, i64> {
        Box::pin(async move {
            self.world.copy_calls.fetch_add(1, Ordering::Relaxed);
            if let Some(failure) = self
                .world
                .state
                .lock()
                .expect("sim world mutex poisoned")
                .copy_failures
                .pop_front()
            {
                return Err(failure.into_error());
            }

            let from_id = self.world.resolve_id(from)?;
            self.world.check_readable(from_id, self.kind)?;
            {
                let state = self.world.state.lock().expect("sim world mutex poisoned");
                let chat = state.chats.get(&from_id).ok_or(Error::NotFound)?;
                if chat.info.protected_content {
                    return Err(Error::AccessDenied {
                        message: "chat forbids saving content".to_string(),
                    });
                }
            }
            let message = self.get_message(from_id, message_id)?.ok_or(Error::NotFound)?;
            self.append_message(to_chat, message)
        })
    }

    fn forward_message<'a>(
        &'a self,
        from_chat: i64,
        message_id: i64,
        to_chat: i64,
    ) -> ClientFuture<'a, i64> {
        Box::pin(async move {
            self.world.forward_calls.fetch_add(1, Ordering::Relaxed);
            let message = self
                .get_message(from_chat, message_id)?
                .ok_or(Error::NotFound)?;
            self.append_message(to_chat, message)
        })
    }

    fn send_text<'a>(&'a self, chat_id: i64, text: &'a str) -> ClientFuture<'a, i64> {
        Box::pin(async move {
            self.append_message(
                chat_id,
                SimMessage {
                    text: Some(text.to_string()),
                    ..SimMessage::default()
                },
            )
        })
    }

    fn edit_text<'a>(
        &'a self,
        chat_id: i64,
        message_id: i64,
        text: &'a str,
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.world.state.lock().expect("sim world mutex poisoned");
            let chat = state.chats.get_mut(&chat_id).ok_or(Error::NotFound)?;
            let message = chat.messages.get_mut(&message_id).ok_or(Error::NotFound)?;
            message.text = Some(text.to_string());
            Ok(())
        })
    }

    fn delete_message<'a>(&'a self, chat_id: i64, message_id: i64) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.world.state.lock().expect("sim world mutex poisoned");
            let chat = state.chats.get_mut(&chat_id).ok_or(Error::NotFound)?;
            chat.messages.remove(&message_id);
            Ok(())
        })
    }

    fn join_invite<'a>(&'a self, _hash: &'a str) -> ClientFuture<'a, ()> {
        Box::pin(async move { Ok(()) })
    }
}
