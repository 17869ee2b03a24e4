use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::error::ModelParseError;

const DAY: Duration = Duration::from_secs(86_400);

// ─────────────────────────────────────────────────────────────────────────────
// Tiers
// ─────────────────────────────────────────────────────────────────────────────

/// Storage tier. Ordered from hottest to coldest, so `a < b` means `a` is hotter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Hot,
    Warm,
    Cold,
    Archived,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Hot, Tier::Warm, Tier::Cold, Tier::Archived];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hot => "hot",
            Self::Warm => "warm",
            Self::Cold => "cold",
            Self::Archived => "archived",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = ModelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hot" => Ok(Self::Hot),
            "warm" => Ok(Self::Warm),
            "cold" => Ok(Self::Cold),
            "archived" => Ok(Self::Archived),
            other => Err(ModelParseError::Tier(other.to_string())),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Object location
// ─────────────────────────────────────────────────────────────────────────────

/// Physical location of an object: `provider:object_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ObjectUri {
    pub provider: String,
    pub object_id: String,
}

impl ObjectUri {
    pub fn new(provider: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            object_id: object_id.into(),
        }
    }
}

impl fmt::Display for ObjectUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.object_id)
    }
}

impl FromStr for ObjectUri {
    type Err = ModelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((provider, object_id)) if !provider.is_empty() && !object_id.is_empty() => {
                Ok(Self::new(provider, object_id))
            }
            _ => Err(ModelParseError::Uri(s.to_string())),
        }
    }
}

impl From<ObjectUri> for String {
    fn from(uri: ObjectUri) -> Self {
        uri.to_string()
    }
}

impl TryFrom<String> for ObjectUri {
    type Error = ModelParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry entries
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Active,
    Quarantined,
}

/// Logical record mapping a data key to its physical location, tier and health.
///
/// Entries are never physically deleted; `status` encodes quarantine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub key: String,
    pub uri: ObjectUri,
    pub tier: Tier,
    pub status: EntryStatus,
    pub created_at: SystemTime,
    pub last_verified: Option<SystemTime>,
    pub migrated_at: Option<SystemTime>,
    /// Independently verifiable copies held by replica-capable providers.
    #[serde(default)]
    pub replicas: Vec<ObjectUri>,
    pub size_bytes: u64,
    /// Hex SHA-256 of the primary object at the time it was written.
    pub digest: String,
}

impl RegistryEntry {
    pub fn is_active(&self) -> bool {
        self.status == EntryStatus::Active
    }

    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.created_at).unwrap_or(Duration::ZERO)
    }

    /// Every location this entry currently owns, primary first.
    pub fn locations(&self) -> impl Iterator<Item = &ObjectUri> {
        std::iter::once(&self.uri).chain(self.replicas.iter())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle policy
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageClass {
    Memory,
    Compressed,
    Archived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPolicy {
    pub max_age_days: u32,
    pub storage_class: StorageClass,
}

impl TierPolicy {
    pub fn max_age(&self) -> Duration {
        DAY * self.max_age_days
    }
}

/// Mutable retention/archival thresholds shared by the lifecycle, adaptive and
/// archival components. Persisted alongside the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyState {
    pub hot: TierPolicy,
    pub warm: TierPolicy,
    pub cold: TierPolicy,
    pub archive_frequency_days: u32,
}

impl PolicyState {
    /// Coldest tier an object of the given age belongs in.
    pub fn tier_for_age(&self, age: Duration) -> Tier {
        if age > self.cold.max_age() {
            Tier::Archived
        } else if age > self.warm.max_age() {
            Tier::Cold
        } else if age > self.hot.max_age() {
            Tier::Warm
        } else {
            Tier::Hot
        }
    }

    pub fn archive_interval(&self) -> Duration {
        DAY * self.archive_frequency_days
    }
}

impl Default for PolicyState {
    fn default() -> Self {
        Self {
            hot: TierPolicy {
                max_age_days: 7,
                storage_class: StorageClass::Memory,
            },
            warm: TierPolicy {
                max_age_days: 30,
                storage_class: StorageClass::Compressed,
            },
            cold: TierPolicy {
                max_age_days: 365,
                storage_class: StorageClass::Archived,
            },
            archive_frequency_days: 14,
        }
    }
}
