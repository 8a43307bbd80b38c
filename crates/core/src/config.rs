use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub version: u32,
    pub data_dir: PathBuf,
    /// Durable storage ("vault") chat every fetched file is uploaded to
    /// before being copied to the requester.
    pub vault_chat_id: i64,
    #[serde(default)]
    pub admin_chat_id: Option<i64>,
    #[serde(default)]
    pub admission: Admission,
    #[serde(default)]
    pub tiers: Tiers,
    #[serde(default)]
    pub transfer: Transfer,
    #[serde(default)]
    pub links: Links,
    #[serde(default)]
    pub dedup: DedupSettings,
    #[serde(default)]
    pub sessions: Vec<SessionCredential>,
    /// Designated high-capacity session for large single-file transfers.
    #[serde(default)]
    pub secondary_session: Option<SessionCredential>,
    /// Personal sessions provisioned out of band, keyed by requester id.
    #[serde(default)]
    pub user_sessions: Vec<UserSessionCredential>,
    #[serde(default)]
    pub premium_users: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Admission {
    /// Global cap on concurrent downloads attributable to free users.
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Tiers {
    #[serde(default = "TierLimits::free_default")]
    pub free: TierLimits,
    #[serde(default = "TierLimits::premium_default")]
    pub premium: TierLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierLimits {
    pub max_batch: u32,
    pub cooldown_seconds: u64,
    pub session_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    /// Single-message size ceiling; above it the tier-based large-file
    /// branch applies.
    pub size_ceiling_bytes: u64,
    pub part_size_bytes: u64,
    pub max_concurrent: usize,
    /// Minimum interval between progress edits pushed to the UI.
    pub progress_interval_seconds: u64,
    pub delivery_retries: u32,
    /// RateLimited occurrences from one user within the window before the
    /// automatic temporary block kicks in.
    pub flood_escalation_threshold: u32,
    pub flood_block_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Links {
    /// Treat every group-shaped link as hidden-history content requiring a
    /// personal session. Heuristic, not a guarantee; see DESIGN.md.
    pub assume_groups_hidden: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupSettings {
    pub retention_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCredential {
    pub id: String,
    #[serde(default)]
    pub premium_priority: bool,
    /// Path of the MTProto helper binary this session runs through.
    pub helper_path: PathBuf,
    /// Base64 session blob handed to the helper at init.
    #[serde(default)]
    pub session_b64: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSessionCredential {
    pub user_id: i64,
    pub helper_path: PathBuf,
    #[serde(default)]
    pub session_b64: Option<String>,
}

impl Default for Admission {
    fn default() -> Self {
        Self { capacity: 1 }
    }
}

impl TierLimits {
    fn free_default() -> Self {
        Self {
            max_batch: 20,
            cooldown_seconds: 60,
            session_timeout_seconds: 30,
        }
    }

    fn premium_default() -> Self {
        Self {
            max_batch: 500,
            cooldown_seconds: 0,
            session_timeout_seconds: 10,
        }
    }
}

impl Default for TierLimits {
    fn default() -> Self {
        Self::free_default()
    }
}

impl Default for Transfer {
    fn default() -> Self {
        Self {
            size_ceiling_bytes: 2 * 1024 * 1024 * 1024,
            part_size_bytes: 1900 * 1024 * 1024,
            max_concurrent: 4,
            progress_interval_seconds: 4,
            delivery_retries: 2,
            flood_escalation_threshold: 3,
            flood_block_seconds: 600,
        }
    }
}

impl Default for Links {
    fn default() -> Self {
        Self {
            assume_groups_hidden: true,
        }
    }
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self { retention_days: 90 }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.version != SETTINGS_SCHEMA_VERSION {
            return Err(Error::InvalidConfig {
                message: format!(
                    "unsupported settings version {} (expected {SETTINGS_SCHEMA_VERSION})",
                    self.version
                ),
            });
        }
        if self.vault_chat_id == 0 {
            return Err(Error::InvalidConfig {
                message: "vault_chat_id must be set".to_string(),
            });
        }
        if self.admission.capacity == 0 {
            return Err(Error::InvalidConfig {
                message: "admission.capacity must be >= 1".to_string(),
            });
        }
        if self.transfer.max_concurrent == 0 {
            return Err(Error::InvalidConfig {
                message: "transfer.max_concurrent must be >= 1".to_string(),
            });
        }
        if self.transfer.part_size_bytes == 0
            || self.transfer.part_size_bytes > self.transfer.size_ceiling_bytes
        {
            return Err(Error::InvalidConfig {
                message: "transfer.part_size_bytes must be in (0, size_ceiling_bytes]".to_string(),
            });
        }
        let mut seen = std::collections::HashSet::new();
        for s in &self.sessions {
            if !seen.insert(s.id.as_str()) {
                return Err(Error::InvalidConfig {
                    message: format!("duplicate session id: {}", s.id),
                });
            }
        }
        Ok(())
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.data_dir.join("scratch")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("savegram.sqlite")
    }

    pub fn limits(&self, tier: Tier) -> &TierLimits {
        match tier {
            Tier::Free => &self.tiers.free,
            Tier::Premium => &self.tiers.premium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Premium,
}

impl Tier {
    pub fn is_privileged(self) -> bool {
        matches!(self, Tier::Premium)
    }

    /// Work-queue priority: premium before free, FIFO within a tier.
    pub fn priority(self) -> u8 {
        match self {
            Tier::Premium => 0,
            Tier::Free => 1,
        }
    }
}
