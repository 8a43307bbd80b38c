use std::path::Path;
use std::sync::Arc;

use sqlx::{Row, SqlitePool};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::Result;
use crate::client::ChatClient;
use crate::link::ChatRef;

const HASH_BUF_BYTES: usize = 1024 * 1024;

/// A previously uploaded file we can deliver by server-side copy instead of
/// re-downloading.
#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub content_hash: String,
    pub file_name: Option<String>,
    pub file_size: i64,
    pub cache_chat_id: i64,
    pub cache_message_id: i64,
}

/// Cheap pre-download identity: same source message and size means the same
/// bytes for all practical purposes.
pub fn message_hash(chat_id: i64, message_id: i64, file_size: u64) -> String {
    blake3::hash(format!("{chat_id}:{message_id}:{file_size}").as_bytes())
        .to_hex()
        .to_string()
}

/// Streamed blake3 of the downloaded file. Never loads the file into memory.
pub async fn content_hash_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; HASH_BUF_BYTES];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Content-addressed cache over the vault chat. Lookup failures are treated
/// as cache misses; a broken index must never block a transfer.
pub struct DedupStore {
    pool: SqlitePool,
}

impl DedupStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Pre-download check keyed by source identity.
    pub async fn check_message(&self, message_hash: &str) -> Option<CachedEntry> {
        let query = sqlx::query(
            r#"
            SELECT r.content_hash, r.file_name, r.file_size,
                   r.cache_chat_id, r.cache_message_id
            FROM dedup_sources s
            JOIN dedup_records r ON r.content_hash = s.content_hash
            WHERE s.message_hash = ?
            LIMIT 1
            "#,
        )
        .bind(message_hash)
        .fetch_optional(&self.pool)
        .await;
        Self::entry_from(query)
    }

    /// Post-download check keyed by actual bytes. Catches the same file
    /// reposted under a different message.
    pub async fn check_content(&self, content_hash: &str) -> Option<CachedEntry> {
        let query = sqlx::query(
            r#"
            SELECT content_hash, file_name, file_size, cache_chat_id, cache_message_id
            FROM dedup_records
            WHERE content_hash = ?
            LIMIT 1
            "#,
        )
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await;
        Self::entry_from(query)
    }

    fn entry_from(
        query: std::result::Result<Option<sqlx::sqlite::SqliteRow>, sqlx::Error>,
    ) -> Option<CachedEntry> {
        match query {
            Ok(row) => row.map(|r| CachedEntry {
                content_hash: r.get("content_hash"),
                file_name: r.get("file_name"),
                file_size: r.get("file_size"),
                cache_chat_id: r.get("cache_chat_id"),
                cache_message_id: r.get("cache_message_id"),
            }),
            Err(e) => {
                warn!(event = "dedup.lookup_failed", error = %e, "dedup.lookup_failed");
                None
            }
        }
    }

    /// Maps another source message onto an existing cached copy, so the next
    /// request for that source hits the cheap pre-download check.
    pub async fn link_source(&self, message_hash: &str, content_hash: &str) {
        let outcome = sqlx::query(
            r#"
            INSERT INTO dedup_sources (message_hash, content_hash, created_at)
            VALUES (?, ?, strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            ON CONFLICT(message_hash) DO NOTHING
            "#,
        )
        .bind(message_hash)
        .bind(content_hash)
        .execute(&self.pool)
        .await;
        if let Err(e) = outcome {
            warn!(event = "dedup.link_failed", error = %e, "dedup.link_failed");
        }
    }

    /// Records a fresh upload. When two transfers of identical bytes race,
    /// the first record wins and later ones are ignored.
    pub async fn record(
        &self,
        content_hash: &str,
        message_hash: &str,
        file_name: Option<&str>,
        file_size: u64,
        cache_chat_id: i64,
        cache_message_id: i64,
        created_by: i64,
    ) {
        let outcome = sqlx::query(
            r#"
            INSERT INTO dedup_records
                (content_hash, file_name, file_size,
                 cache_chat_id, cache_message_id, created_at, created_by)
            VALUES (?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%fZ','now'), ?)
            ON CONFLICT(content_hash) DO NOTHING
            "#,
        )
        .bind(content_hash)
        .bind(file_name)
        .bind(file_size as i64)
        .bind(cache_chat_id)
        .bind(cache_message_id)
        .bind(created_by)
        .execute(&self.pool)
        .await;
        if let Err(e) = outcome {
            warn!(event = "dedup.record_failed", error = %e, "dedup.record_failed");
        }
        self.link_source(message_hash, content_hash).await;
    }

    /// Copies the cached vault message to the user. A failed copy usually
    /// means the cached message was deleted, so the record is purged and the
    /// caller falls back to a fresh transfer.
    pub async fn deliver_cached(
        &self,
        client: &Arc<dyn ChatClient>,
        entry: &CachedEntry,
        to_chat_id: i64,
    ) -> bool {
        let cache_chat = ChatRef::Id(entry.cache_chat_id);
        match client
            .copy_message(&cache_chat, entry.cache_message_id, to_chat_id)
            .await
        {
            Ok(_) => {
                debug!(
                    event = "dedup.cache_hit",
                    content_hash = %entry.content_hash,
                    to_chat_id,
                    "dedup.cache_hit"
                );
                true
            }
            Err(e) => {
                warn!(
                    event = "dedup.cache_stale",
                    content_hash = %entry.content_hash,
                    error = %e,
                    "dedup.cache_stale"
                );
                self.forget(&entry.content_hash).await;
                false
            }
        }
    }

    pub async fn forget(&self, content_hash: &str) {
        for sql in [
            "DELETE FROM dedup_sources WHERE content_hash = ?",
            "DELETE FROM dedup_records WHERE content_hash = ?",
        ] {
            let outcome = sqlx::query(sql)
                .bind(content_hash)
                .execute(&self.pool)
                .await;
            if let Err(e) = outcome {
                warn!(event = "dedup.forget_failed", error = %e, "dedup.forget_failed");
            }
        }
    }

    /// Drops records older than the retention window. Returns how many rows
    /// went away, zero when the sweep itself fails.
    pub async fn purge_expired(&self, retention_days: u32) -> u64 {
        let outcome = sqlx::query(
            "DELETE FROM dedup_records \
             WHERE created_at < strftime('%Y-%m-%dT%H:%M:%fZ','now','-' || ? || ' days')",
        )
        .bind(i64::from(retention_days))
        .execute(&self.pool)
        .await;
        let removed = match outcome {
            Ok(done) => done.rows_affected(),
            Err(e) => {
                warn!(event = "dedup.purge_failed", error = %e, "dedup.purge_failed");
                return 0;
            }
        };
        let orphans = sqlx::query(
            "DELETE FROM dedup_sources WHERE content_hash NOT IN \
             (SELECT content_hash FROM dedup_records)",
        )
        .execute(&self.pool)
        .await;
        if let Err(e) = orphans {
            warn!(event = "dedup.purge_failed", error = %e, "dedup.purge_failed");
        }
        removed
    }
}
