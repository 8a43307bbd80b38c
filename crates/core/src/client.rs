use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::link::ChatRef;

pub mod botapi;
pub mod helper;
pub mod sim;

pub type ClientFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Byte-count progress callback; invoked with cumulative bytes moved.
pub type ProgressFn<'a> = Box<dyn FnMut(u64) + Send + 'a>;

/// Capability tag attached when a client handle is constructed. Dispatch
/// happens on this closed set, never on runtime introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    /// Bot identity, limited by platform bot restrictions.
    Bot,
    /// Authenticated user identity with broader read access.
    User,
    /// Designated high-capacity client for large single-file transfers.
    SecondaryLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Channel,
    Group,
    Private,
}

#[derive(Debug, Clone)]
pub struct ChatInfo {
    pub id: i64,
    pub kind: ChatKind,
    pub title: String,
    pub username: Option<String>,
    /// Source marks content as forward-protected; server-side copy is off
    /// the table and bytes must go through a local buffer.
    pub protected_content: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Document,
    Audio,
    Voice,
    Animation,
}

#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub kind: MediaKind,
    pub file_size: u64,
    pub file_name: Option<String>,
}

/// Rich-text formatting span, carried verbatim between fetch and delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextEntity {
    pub kind: String,
    pub offset: u32,
    pub length: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MessageInfo {
    pub id: i64,
    pub chat_id: i64,
    pub media: Option<MediaInfo>,
    pub text: Option<String>,
    pub entities: Vec<TextEntity>,
}

impl MessageInfo {
    pub fn has_media(&self) -> bool {
        self.media.is_some()
    }
}

/// The external chat-client capability. Two real flavors exist (`botapi`,
/// `helper`) plus the `sim` test double; the orchestrator branches only on
/// `kind()`.
pub trait ChatClient: Send + Sync {
    fn kind(&self) -> ClientKind;

    /// Short label for observability (task registry, logs).
    fn label(&self) -> &str;

    fn resolve_chat<'a>(&'a self, chat: &'a ChatRef) -> ClientFuture<'a, ChatInfo>;

    /// Cheap metadata probe. `Ok(None)` means the message is deleted or
    /// otherwise absent, which is not an error at this layer.
    fn message_info<'a>(
        &'a self,
        chat: &'a ChatRef,
        message_id: i64,
    ) -> ClientFuture<'a, Option<MessageInfo>>;

    fn last_message_id<'a>(&'a self, chat: &'a ChatRef) -> ClientFuture<'a, i64>;

    /// Message ids known to belong to a topic, ascending, bounded by `limit`.
    fn topic_message_ids<'a>(
        &'a self,
        chat: &'a ChatRef,
        topic_id: i64,
        limit: usize,
    ) -> ClientFuture<'a, Vec<i64>>;

    fn download_media<'a>(
        &'a self,
        chat: &'a ChatRef,
        message_id: i64,
        dest: &'a Path,
        progress: Option<ProgressFn<'a>>,
        cancel: &'a CancellationToken,
    ) -> ClientFuture<'a, u64>;

    /// Uploads a local file, returning the new message id in `to_chat`.
    fn upload_media<'a>(
        &'a self,
        to_chat: i64,
        path: &'a Path,
        caption: Option<&'a str>,
        entities: &'a [TextEntity],
        progress: Option<ProgressFn<'a>>,
        cancel: &'a CancellationToken,
    ) -> ClientFuture<'a, i64>;

    /// Server-side copy without the author attribution; no bytes pass
    /// through this process.
    fn copy_message<'a>(
        &'a self,
        from: &'a ChatRef,
        message_id: i64,
        to_chat: i64,
    ) -> ClientFuture<'a, i64>;

    fn forward_message<'a>(
        &'a self,
        from_chat: i64,
        message_id: i64,
        to_chat: i64,
    ) -> ClientFuture<'a, i64>;

    fn send_text<'a>(&'a self, chat_id: i64, text: &'a str) -> ClientFuture<'a, i64>;

    fn edit_text<'a>(
        &'a self,
        chat_id: i64,
        message_id: i64,
        text: &'a str,
    ) -> ClientFuture<'a, ()>;

    fn delete_message<'a>(&'a self, chat_id: i64, message_id: i64) -> ClientFuture<'a, ()>;

    fn join_invite<'a>(&'a self, hash: &'a str) -> ClientFuture<'a, ()>;
}
