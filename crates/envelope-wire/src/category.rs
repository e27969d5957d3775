//! Rate-limit categories derived from item types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Category an item is rate limited under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataCategory {
    /// Applies to every category.
    All,
    /// Error events.
    Error,
    /// Session updates.
    Session,
    /// Attachments.
    Attachment,
    /// Profiles.
    Profile,
    /// UI profile chunks.
    ProfileChunkUi,
    /// Performance transactions.
    Transaction,
    /// Cron check-ins.
    Monitor,
    /// Session replay recordings.
    Replay,
    /// Anything else. Never rate limited on its own.
    Unknown,
}

impl DataCategory {
    /// Map an item type string to its category.
    pub fn from_item_type(item_type: &str) -> Self {
        match item_type {
            "event" => DataCategory::Error,
            "session" => DataCategory::Session,
            "attachment" => DataCategory::Attachment,
            "profile" => DataCategory::Profile,
            "profile_chunk_ui" => DataCategory::ProfileChunkUi,
            "transaction" => DataCategory::Transaction,
            "check_in" => DataCategory::Monitor,
            "replay_video" => DataCategory::Replay,
            _ => DataCategory::Unknown,
        }
    }

    /// Wire name of the category.
    pub fn as_str(self) -> &'static str {
        match self {
            DataCategory::All => "all",
            DataCategory::Error => "error",
            DataCategory::Session => "session",
            DataCategory::Attachment => "attachment",
            DataCategory::Profile => "profile",
            DataCategory::ProfileChunkUi => "profile_chunk_ui",
            DataCategory::Transaction => "transaction",
            DataCategory::Monitor => "monitor",
            DataCategory::Replay => "replay",
            DataCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DataCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
