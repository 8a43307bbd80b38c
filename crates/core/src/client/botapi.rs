use std::path::Path;

use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::{
    ChatClient, ChatInfo, ChatKind, ClientFuture, ClientKind, MessageInfo, ProgressFn, TextEntity,
};
use crate::link::ChatRef;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct BotApiConfig {
    pub bot_token: String,
}

/// Bot-identity flavor over the HTTP Bot API. The platform does not let a
/// bot read arbitrary chat history, so the metadata/download surface answers
/// with `AccessDenied` and the orchestrator falls back to a personal
/// session; sending, copying and forwarding are fully supported.
pub struct BotApiClient {
    config: BotApiConfig,
    client: reqwest::Client,
    label: String,
}

impl BotApiClient {
    pub fn new(config: BotApiConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            label: "bot".to_string(),
        }
    }

    fn url(&self, method: &str) -> String {
        format!(
            "https://api.telegram.org/bot{}/{method}",
            self.config.bot_token
        )
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: &serde_json::Value,
    ) -> Result<T> {
        let res = self
            .client
            .post(self.url(method))
            .json(params)
            .send()
            .await
            .map_err(|e| Error::TransientIo {
                message: format!("{method} request failed: {e}"),
            })?;

        let status = res.status();
        let body = res.text().await.map_err(|e| Error::TransientIo {
            message: format!("{method} read response failed: {e}"),
        })?;

        let parsed: BotApiResponse<T> =
            serde_json::from_str(&body).map_err(|e| Error::Telegram {
                message: format!("{method} invalid json: {e}; body={body}"),
            })?;

        if parsed.ok {
            return parsed.result.ok_or_else(|| Error::Telegram {
                message: format!("{method} missing result"),
            });
        }

        Err(map_api_error(
            method,
            status.as_u16(),
            parsed.description.as_deref().unwrap_or(""),
            parsed.parameters,
        ))
    }

    fn denied(&self, what: &str) -> Error {
        Error::AccessDenied {
            message: format!("bot identity cannot {what}"),
        }
    }
}

fn map_api_error(
    method: &str,
    status: u16,
    description: &str,
    parameters: Option<BotApiParameters>,
) -> Error {
    if let Some(retry_after) = parameters.and_then(|p| p.retry_after) {
        return Error::RateLimited {
            seconds: retry_after,
        };
    }
    let lower = description.to_ascii_lowercase();
    if lower.contains("not found") || lower.contains("message to copy") {
        return Error::NotFound;
    }
    match status {
        403 => Error::AccessDenied {
            message: format!("{method}: {description}"),
        },
        429 => Error::RateLimited { seconds: 30 },
        500..=599 => Error::TransientIo {
            message: format!("{method} http {status}: {description}"),
        },
        _ => Error::Telegram {
            message: format!("{method} http {status}: {description}"),
        },
    }
}

fn chat_param(chat: &ChatRef) -> serde_json::Value {
    match chat {
        ChatRef::Username(u) => json!(format!("@{u}")),
        ChatRef::Id(id) => json!(id),
    }
}

impl ChatClient for BotApiClient {
    fn kind(&self) -> ClientKind {
        ClientKind::Bot
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn resolve_chat<'a>(&'a self, chat: &'a ChatRef) -> ClientFuture<'a, ChatInfo> {
        Box::pin(async move {
            let raw: RawChat = self
                .call("getChat", &json!({ "chat_id": chat_param(chat) }))
                .await?;
            let kind = match raw.type_.as_str() {
                "channel" => ChatKind::Channel,
                "group" | "supergroup" => ChatKind::Group,
                _ => ChatKind::Private,
            };
            Ok(ChatInfo {
                id: raw.id,
                kind,
                title: raw.title.or(raw.first_name).unwrap_or_default(),
                username: raw.username,
                protected_content: raw.has_protected_content.unwrap_or(false),
            })
        })
    }

    fn message_info<'a>(
        &'a self,
        _chat: &'a ChatRef,
        _message_id: i64,
    ) -> ClientFuture<'a, Option<MessageInfo>> {
        Box::pin(async move { Err(self.denied("read chat history")) })
    }

    fn last_message_id<'a>(&'a self, _chat: &'a ChatRef) -> ClientFuture<'a, i64> {
        Box::pin(async move { Err(self.denied("probe chat history")) })
    }

    fn topic_message_ids<'a>(
        &'a self,
        _chat: &'a ChatRef,
        _topic_id: i64,
        _limit: usize,
    ) -> ClientFuture<'a, Vec<i64>> {
        Box::pin(async move { Err(self.denied("enumerate topic messages")) })
    }

    fn download_media<'a>(
        &'a self,
        _chat: &'a ChatRef,
        _message_id: i64,
        _dest: &'a Path,
        _progress: Option<ProgressFn<'a>>,
        _cancel: &'a CancellationToken,
    ) -> ClientFuture<'a, u64> {
        Box::pin(async move { Err(self.denied("download media by message id")) })
    }

    fn upload_media<'a>(
        &'a self,
        to_chat: i64,
        path: &'a Path,
        caption: Option<&'a str>,
        entities: &'a [TextEntity],
        _progress: Option<ProgressFn<'a>>,
        cancel: &'a CancellationToken,
    ) -> ClientFuture<'a, i64> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let bytes = tokio::fs::read(path).await?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file.dat".to_string());

            let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
            let mut form = reqwest::multipart::Form::new()
                .text("chat_id", to_chat.to_string())
                .part("document", part);
            if let Some(caption) = caption {
                form = form.text("caption", caption.to_string());
            }
            if !entities.is_empty() {
                let ents =
                    serde_json::to_string(&api_entities(entities)).map_err(|e| Error::Telegram {
                        message: format!("caption entity json failed: {e}"),
                    })?;
                form = form.text("caption_entities", ents);
            }

            let res = self
                .client
                .post(self.url("sendDocument"))
                .multipart(form)
                .send()
                .await
                .map_err(|e| Error::TransientIo {
                    message: format!("sendDocument request failed: {e}"),
                })?;

            let status = res.status();
            let body = res.text().await.map_err(|e| Error::TransientIo {
                message: format!("sendDocument read response failed: {e}"),
            })?;
            let parsed: BotApiResponse<RawMessage> =
                serde_json::from_str(&body).map_err(|e| Error::Telegram {
                    message: format!("sendDocument invalid json: {e}; body={body}"),
                })?;
            if !parsed.ok {
                return Err(map_api_error(
                    "sendDocument",
                    status.as_u16(),
                    parsed.description.as_deref().unwrap_or(""),
                    parsed.parameters,
                ));
            }
            parsed
                .result
                .map(|m| m.message_id)
                .ok_or_else(|| Error::Telegram {
                    message: "sendDocument missing result".to_string(),
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
            let raw: RawMessageId = self
                .call(
                    "copyMessage",
                    &json!({
                        "chat_id": to_chat,
                        "from_chat_id": chat_param(from),
                        "message_id": message_id,
                    }),
                )
                .await?;
            Ok(raw.message_id)
        })
    }

    fn forward_message<'a>(
        &'a self,
        from_chat: i64,
        message_id: i64,
        to_chat: i64,
    ) -> ClientFuture<'a, i64> {
        Box::pin(async move {
            let raw: RawMessage = self
                .call(
                    "forwardMessage",
                    &json!({
                        "chat_id": to_chat,
                        "from_chat_id": from_chat,
                        "message_id": message_id,
                    }),
                )
                .await?;
            Ok(raw.message_id)
        })
    }

    fn send_text<'a>(&'a self, chat_id: i64, text: &'a str) -> ClientFuture<'a, i64> {
        Box::pin(async move {
            let raw: RawMessage = self
                .call("sendMessage", &json!({ "chat_id": chat_id, "text": text }))
                .await?;
            Ok(raw.message_id)
        })
    }

    fn edit_text<'a>(
        &'a self,
        chat_id: i64,
        message_id: i64,
        text: &'a str,
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            let _: serde_json::Value = self
                .call(
                    "editMessageText",
                    &json!({ "chat_id": chat_id, "message_id": message_id, "text": text }),
                )
                .await?;
            Ok(())
        })
    }

    fn delete_message<'a>(&'a self, chat_id: i64, message_id: i64) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            let _: serde_json::Value = self
                .call(
                    "deleteMessage",
                    &json!({ "chat_id": chat_id, "message_id": message_id }),
                )
                .await?;
            Ok(())
        })
    }

    fn join_invite<'a>(&'a self, _hash: &'a str) -> ClientFuture<'a, ()> {
        Box::pin(async move { Err(self.denied("join chats by invite link")) })
    }
}

impl BotApiClient {
    /// One long-poll round of updates; used by the daemon loop, not the
    /// transfer pipeline.
    pub async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<RawUpdate>> {
        self.call(
            "getUpdates",
            &json!({ "offset": offset, "timeout": timeout_secs, "allowed_updates": ["message"] }),
        )
        .await
    }
}

fn api_entities(entities: &[TextEntity]) -> Vec<serde_json::Value> {
    entities
        .iter()
        .map(|e| {
            let mut v = json!({ "type": e.kind, "offset": e.offset, "length": e.length });
            if let Some(url) = &e.url {
                v["url"] = json!(url);
            }
            v
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct BotApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    parameters: Option<BotApiParameters>,
}

#[derive(Debug, Deserialize)]
struct BotApiParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawChat {
    id: i64,
    #[serde(rename = "type")]
    type_: String,
    title: Option<String>,
    first_name: Option<String>,
    username: Option<String>,
    has_protected_content: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct RawMessage {
    pub message_id: i64,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub chat: Option<RawChatId>,
    #[serde(default)]
    pub from: Option<RawUser>,
}

#[derive(Debug, Deserialize)]
pub struct RawChatId {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct RawUser {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
struct RawMessageId {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct RawUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<RawMessage>,
}
