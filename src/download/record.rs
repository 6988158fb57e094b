//! Persisted form of a download, used for warm restart.
//!
//! A [`DownloadRecord`] holds only what survives a process restart: no live
//! hash state, no writer, no request. Restoring a record whose state was
//! in progress yields an interrupted item with reason `Crash`.

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::delegate::DangerType;
use super::error::RecordError;
use super::hash::ContentHash;
use super::interrupt::InterruptReason;
use super::state::ExternalState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub guid: String,
    pub url_chain: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_referrer_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_mime_type: Option<String>,
    #[serde(default)]
    pub current_path: PathBuf,
    #[serde(default)]
    pub target_path: PathBuf,
    pub received_bytes: u64,
    pub total_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    /// Hex SHA-256 of the saved data (prefix hash while partial).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default)]
    pub danger_type: DangerType,
    pub state: ExternalState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt_reason: Option<InterruptReason>,
    #[serde(default)]
    pub opened: bool,
    /// Seconds since the UNIX epoch.
    pub start_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
}

impl DownloadRecord {
    /// Serializes to pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::Json`] if serialization fails.
    pub fn to_json(&self) -> Result<String, RecordError> {
        serde_json::to_string_pretty(self).map_err(RecordError::json)
    }

    /// Parses and validates a record.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError`] for malformed JSON or invalid field values.
    pub fn from_json(json: &str) -> Result<Self, RecordError> {
        let record: Self = serde_json::from_str(json).map_err(RecordError::json)?;
        record.validate()?;
        Ok(record)
    }

    /// Checks the fields a restored item relies on.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError`] naming the first invalid field.
    pub fn validate(&self) -> Result<(), RecordError> {
        if Uuid::parse_str(&self.guid).is_err() {
            return Err(RecordError::InvalidGuid {
                guid: self.guid.clone(),
            });
        }
        if self.url_chain.is_empty() {
            return Err(RecordError::EmptyUrlChain);
        }
        self.parsed_hash()?;
        Ok(())
    }

    /// The stored hash, decoded.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::InvalidHash`] if the hex is malformed.
    pub fn parsed_hash(&self) -> Result<Option<ContentHash>, RecordError> {
        match &self.hash {
            None => Ok(None),
            Some(value) => ContentHash::from_hex(value)
                .map(Some)
                .ok_or_else(|| RecordError::InvalidHash {
                    value: value.clone(),
                }),
        }
    }
}

pub(crate) fn to_epoch_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

pub(crate) fn from_epoch_secs(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}
