use crate::{Error, Result};

/// How a chat is addressed before the client has resolved it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChatRef {
    Username(String),
    Id(i64),
}

impl std::fmt::Display for ChatRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatRef::Username(u) => write!(f, "@{u}"),
            ChatRef::Id(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// Broadcast-channel shaped: `t.me/username/<msg>`.
    PublicChannel,
    /// Group topic shaped: `t.me/username/<topic>/<msg>`.
    PublicTopic,
    /// `t.me/c/<internal>/<msg>` with optional topic segment.
    Private,
    /// `t.me/b/<bot>/<msg>`.
    BotRelay,
    /// `t.me/s/<username>/<msg>`.
    Story,
    /// `tg://openmessage?...`.
    DeepLink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageLink {
    pub chat: ChatRef,
    pub message_id: i64,
    pub topic_id: Option<i64>,
    pub kind: LinkKind,
    /// Conservative tag: content that may be hidden-history and therefore
    /// needs a personal session rather than the bot identity.
    pub requires_session: bool,
    /// Caller-requested shift applied by batch scanning (message N+offset).
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLink {
    Message(MessageLink),
    Invite { hash: String },
}

/// Telegram's canonical marked id for a `/c/` internal id.
pub fn internal_to_chat_id(internal: i64) -> i64 {
    -1_000_000_000_000 - internal
}

/// Classify a raw link. `assume_groups_hidden` is the policy knob from the
/// hidden-history heuristic: when set, every group-shaped link is tagged as
/// requiring a personal session even if nominally public.
pub fn parse_link(raw: &str, assume_groups_hidden: bool) -> Result<ParsedLink> {
    let raw = raw.trim();

    if let Some(rest) = raw.strip_prefix("tg://openmessage?") {
        return parse_deep_link(rest);
    }

    let rest = strip_scheme_and_host(raw)?;
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    let offset = query.map(parse_offset).unwrap_or(0);

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return Err(bad_link(raw));
    }

    if segments[0] == "joinchat" && segments.len() == 2 {
        return Ok(ParsedLink::Invite {
            hash: segments[1].to_string(),
        });
    }
    if let Some(hash) = segments[0].strip_prefix('+') {
        return Ok(ParsedLink::Invite {
            hash: hash.to_string(),
        });
    }

    match segments[0] {
        "c" => parse_private(&segments, offset),
        "b" => {
            let (chat, message_id) = username_and_msg(&segments[1..], raw)?;
            Ok(ParsedLink::Message(MessageLink {
                chat,
                message_id,
                topic_id: None,
                kind: LinkKind::BotRelay,
                requires_session: true,
                offset,
            }))
        }
        "s" => {
            let (chat, message_id) = username_and_msg(&segments[1..], raw)?;
            Ok(ParsedLink::Message(MessageLink {
                chat,
                message_id,
                topic_id: None,
                kind: LinkKind::Story,
                requires_session: true,
                offset,
            }))
        }
        _ => parse_public(&segments, offset, assume_groups_hidden, raw),
    }
}

fn parse_public(
    segments: &[&str],
    offset: i64,
    assume_groups_hidden: bool,
    raw: &str,
) -> Result<ParsedLink> {
    let username = segments[0].to_string();
    match segments.len() {
        2 => {
            let message_id = parse_id(segments[1], raw)?;
            Ok(ParsedLink::Message(MessageLink {
                chat: ChatRef::Username(username),
                message_id,
                topic_id: None,
                kind: LinkKind::PublicChannel,
                requires_session: false,
                offset,
            }))
        }
        3 => {
            let topic_id = parse_id(segments[1], raw)?;
            let message_id = parse_id(segments[2], raw)?;
            Ok(ParsedLink::Message(MessageLink {
                chat: ChatRef::Username(username),
                message_id,
                topic_id: Some(topic_id),
                kind: LinkKind::PublicTopic,
                requires_session: assume_groups_hidden,
                offset,
            }))
        }
        _ => Err(bad_link(raw)),
    }
}

fn parse_private(segments: &[&str], offset: i64) -> Result<ParsedLink> {
    // /c/<internal>/<msg> or /c/<internal>/<topic>/<msg>
    let raw = segments.join("/");
    if segments.len() < 3 || segments.len() > 4 {
        return Err(bad_link(&raw));
    }
    let internal = parse_id(segments[1], &raw)?;
    let chat = ChatRef::Id(internal_to_chat_id(internal));
    let (topic_id, message_id) = if segments.len() == 4 {
        (Some(parse_id(segments[2], &raw)?), parse_id(segments[3], &raw)?)
    } else {
        (None, parse_id(segments[2], &raw)?)
    };
    Ok(ParsedLink::Message(MessageLink {
        chat,
        message_id,
        topic_id,
        kind: LinkKind::Private,
        requires_session: true,
        offset,
    }))
}

fn parse_deep_link(query: &str) -> Result<ParsedLink> {
    let mut user_id = None;
    let mut chat_id = None;
    let mut message_id = None;
    for pair in query.split('&') {
        let Some((k, v)) = pair.split_once('=') else {
            continue;
        };
        match k {
            "user_id" => user_id = v.parse::<i64>().ok(),
            "chat_id" => chat_id = v.parse::<i64>().ok(),
            "message_id" => message_id = v.parse::<i64>().ok(),
            _ => {}
        }
    }
    let message_id = message_id.ok_or_else(|| bad_link(query))?;
    let chat = match (chat_id, user_id) {
        (Some(id), _) => ChatRef::Id(internal_to_chat_id(id)),
        (None, Some(id)) => ChatRef::Id(id),
        (None, None) => return Err(bad_link(query)),
    };
    Ok(ParsedLink::Message(MessageLink {
        chat,
        message_id,
        topic_id: None,
        kind: LinkKind::DeepLink,
        requires_session: true,
        offset: 0,
    }))
}

fn strip_scheme_and_host(raw: &str) -> Result<&str> {
    let no_scheme = raw
        .strip_prefix("https://")
        .or_else(|| raw.strip_prefix("http://"))
        .unwrap_or(raw);
    let no_host = no_scheme
        .strip_prefix("t.me/")
        .or_else(|| no_scheme.strip_prefix("telegram.me/"))
        .or_else(|| no_scheme.strip_prefix("telegram.dog/"))
        .ok_or_else(|| bad_link(raw))?;
    Ok(no_host)
}

fn username_and_msg(segments: &[&str], raw: &str) -> Result<(ChatRef, i64)> {
    if segments.len() != 2 {
        return Err(bad_link(raw));
    }
    Ok((
        ChatRef::Username(segments[0].to_string()),
        parse_id(segments[1], raw)?,
    ))
}

fn parse_offset(query: &str) -> i64 {
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("offset="))
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(0)
}

fn parse_id(s: &str, raw: &str) -> Result<i64> {
    s.parse::<i64>().map_err(|_| bad_link(raw))
}

fn bad_link(raw: &str) -> Error {
    Error::InvalidConfig {
        message: format!("unrecognized telegram link: {raw}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(raw: &str) -> MessageLink {
        match parse_link(raw, true).unwrap() {
            ParsedLink::Message(m) => m,
            other => panic!("expected message link, got {other:?}"),
        }
    }

    #[test]
    fn public_channel_link() {
        let m = message("https://t.me/somechannel/120");
        assert_eq!(m.chat, ChatRef::Username("somechannel".to_string()));
        assert_eq!(m.message_id, 120);
        assert_eq!(m.kind, LinkKind::PublicChannel);
        assert!(!m.requires_session);
        assert_eq!(m.topic_id, None);
    }

    #[test]
    fn public_topic_link_requires_session() {
        let m = message("t.me/somegroup/15/990");
        assert_eq!(m.kind, LinkKind::PublicTopic);
        assert_eq!(m.topic_id, Some(15));
        assert_eq!(m.message_id, 990);
        assert!(m.requires_session);
    }

    #[test]
    fn hidden_history_knob_relaxes_topic_links() {
        let parsed = parse_link("t.me/somegroup/15/990", false).unwrap();
        let ParsedLink::Message(m) = parsed else {
            panic!()
        };
        assert!(!m.requires_session);
    }

    #[test]
    fn private_link_maps_internal_id() {
        let m = message("https://t.me/c/1234567890/55");
        assert_eq!(m.chat, ChatRef::Id(-1001234567890));
        assert_eq!(m.message_id, 55);
        assert_eq!(m.kind, LinkKind::Private);
        assert!(m.requires_session);
    }

    #[test]
    fn private_topic_link() {
        let m = message("t.me/c/1234567890/7/55");
        assert_eq!(m.topic_id, Some(7));
        assert_eq!(m.message_id, 55);
    }

    #[test]
    fn story_and_bot_relay_links() {
        let s = message("t.me/s/someone/3");
        assert_eq!(s.kind, LinkKind::Story);
        assert!(s.requires_session);

        let b = message("t.me/b/somebot/9");
        assert_eq!(b.kind, LinkKind::BotRelay);
        assert!(b.requires_session);
    }

    #[test]
    fn invite_links() {
        assert_eq!(
            parse_link("https://t.me/+AbCdEf123", true).unwrap(),
            ParsedLink::Invite {
                hash: "AbCdEf123".to_string()
            }
        );
        assert_eq!(
            parse_link("t.me/joinchat/AbCdEf123", true).unwrap(),
            ParsedLink::Invite {
                hash: "AbCdEf123".to_string()
            }
        );
    }

    #[test]
    fn deep_link() {
        let m = message("tg://openmessage?user_id=777&message_id=3");
        assert_eq!(m.chat, ChatRef::Id(777));
        assert_eq!(m.message_id, 3);
        assert_eq!(m.kind, LinkKind::DeepLink);
        assert!(m.requires_session);
    }

    #[test]
    fn offset_query_is_surfaced() {
        let m = message("t.me/somechannel/120?offset=5");
        assert_eq!(m.offset, 5);
        assert_eq!(m.message_id, 120);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_link("https://example.com/x/1", true).is_err());
        assert!(parse_link("t.me/onlyusername", true).is_err());
        assert!(parse_link("t.me/c/abc/1", true).is_err());
    }
}
