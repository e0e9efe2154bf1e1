use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const PROGRESS_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Indexing,
    Downloading,
    Uploading,
    Completed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Indexing => "indexing",
            Self::Downloading => "downloading",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferItem {
    pub bucket: String,
    pub path: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
    pub ordinal: u64,
    #[serde(default)]
    pub downloaded: bool,
    #[serde(default)]
    pub uploaded: bool,
    #[serde(default)]
    pub staging_path: Option<PathBuf>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl TransferItem {
    pub fn new(
        bucket: impl Into<String>,
        path: impl Into<String>,
        size_bytes: u64,
        last_modified: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            path: path.into(),
            size_bytes,
            last_modified,
            ordinal: 0,
            downloaded: false,
            uploaded: false,
            staging_path: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressState {
    pub schema_version: u32,
    pub phase: Phase,
    #[serde(default)]
    pub buckets: Vec<String>,
    #[serde(default)]
    pub items: Vec<TransferItem>,
    #[serde(default)]
    pub download_cursor: Option<u64>,
    #[serde(default)]
    pub upload_cursor: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub last_saved_at: Option<DateTime<Utc>>,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressState {
    pub fn new() -> Self {
        Self {
            schema_version: PROGRESS_SCHEMA_VERSION,
            phase: Phase::Init,
            buckets: Vec::new(),
            items: Vec::new(),
            download_cursor: None,
            upload_cursor: None,
            started_at: Utc::now(),
            last_saved_at: None,
        }
    }

    /// Moves the phase forward. Requests to move backwards are ignored.
    pub fn advance_phase(&mut self, next: Phase) {
        if next > self.phase {
            self.phase = next;
        }
    }

    pub fn advance_download_cursor(&mut self, ordinal: u64) {
        self.download_cursor = Some(self.download_cursor.map_or(ordinal, |c| c.max(ordinal)));
    }

    pub fn advance_upload_cursor(&mut self, ordinal: u64) {
        self.upload_cursor = Some(self.upload_cursor.map_or(ordinal, |c| c.max(ordinal)));
    }

    pub fn has_index(&self) -> bool {
        !self.items.is_empty()
    }

    pub fn item_mut(&mut self, ordinal: u64) -> Option<&mut TransferItem> {
        // Ordinals are dense and equal to the position, but a hand-edited
        // record may break that; fall back to a scan.
        let idx = ordinal as usize;
        if self.items.get(idx).is_some_and(|i| i.ordinal == ordinal) {
            return self.items.get_mut(idx);
        }
        self.items.iter_mut().find(|i| i.ordinal == ordinal)
    }

    pub fn counts(&self) -> ItemCounts {
        let mut counts = ItemCounts {
            total: self.items.len() as u64,
            ..ItemCounts::default()
        };
        for item in &self.items {
            counts.bytes_total += item.size_bytes;
            if item.downloaded {
                counts.downloaded += 1;
            }
            if item.uploaded {
                counts.uploaded += 1;
            }
            if item.last_error.is_some() {
                counts.with_errors += 1;
            }
        }
        counts
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemCounts {
    pub total: u64,
    pub downloaded: u64,
    pub uploaded: u64,
    pub with_errors: u64,
    pub bytes_total: u64,
}

impl ItemCounts {
    pub fn downloaded_percent(&self) -> f64 {
        percent(self.downloaded, self.total)
    }

    pub fn uploaded_percent(&self) -> f64 {
        percent(self.uploaded, self.total)
    }
}

fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (done as f64 / total as f64) * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_never_moves_backwards() {
        let mut state = ProgressState::new();
        state.advance_phase(Phase::Uploading);
        state.advance_phase(Phase::Downloading);
        assert_eq!(state.phase, Phase::Uploading);
        state.advance_phase(Phase::Completed);
        assert_eq!(state.phase, Phase::Completed);
    }

    #[test]
    fn cursors_are_monotonic() {
        let mut state = ProgressState::new();
        assert_eq!(state.download_cursor, None);
        state.advance_download_cursor(9);
        state.advance_download_cursor(4);
        assert_eq!(state.download_cursor, Some(9));
        state.advance_upload_cursor(0);
        assert_eq!(state.upload_cursor, Some(0));
    }

    #[test]
    fn phase_serializes_as_snake_case() {
        let json = serde_json::to_string(&Phase::Downloading).unwrap();
        assert_eq!(json, "\"downloading\"");
    }

    #[test]
    fn deserializes_item_with_missing_optional_fields() {
        let json = r#"{"bucket":"b","path":"x/a.txt","size_bytes":10,"ordinal":0}"#;
        let item: TransferItem = serde_json::from_str(json).unwrap();
        assert!(!item.downloaded);
        assert!(item.staging_path.is_none());
        assert!(item.last_modified.is_none());
    }

    #[test]
    fn counts_percentages() {
        let mut state = ProgressState::new();
        for i in 0..4u64 {
            let mut item = TransferItem::new("b", format!("f{i}"), 1, None);
            item.ordinal = i;
            item.downloaded = i < 2;
            state.items.push(item);
        }
        let counts = state.counts();
        assert_eq!(counts.total, 4);
        assert_eq!(counts.downloaded_percent(), 50.0);
        assert_eq!(counts.uploaded_percent(), 0.0);
        assert_eq!(ProgressState::new().counts().downloaded_percent(), 0.0);
    }
}
