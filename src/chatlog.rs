//! Per-user chat logs: one JSON array of snapshots per username, loaded
//! wholesale and rewritten wholesale on every change.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::advice::{AdviceItem, StoredAdvice};
use crate::llm_client::Message;
use crate::traits::TraitSet;

/// Format version written with every record. Records without one predate it.
pub const RECORD_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StoredChatRecord")]
pub struct ChatRecord {
    pub version: u32,
    pub timestamp: String,
    pub messages: Vec<Message>,
    pub traits: TraitSet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advice_points: Option<Vec<AdviceItem>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Fields this version does not model (e.g. `reactions`), kept across rewrites.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Deserialize)]
struct StoredChatRecord {
    #[serde(default)]
    version: Option<u32>,
    timestamp: String,
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default)]
    traits: TraitSet,
    #[serde(default)]
    advice_points: Option<Vec<StoredAdvice>>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl From<StoredChatRecord> for ChatRecord {
    fn from(stored: StoredChatRecord) -> Self {
        let advice_points = stored.advice_points.map(|points| {
            points
                .into_iter()
                .map(|p| p.into_item(&stored.timestamp))
                .collect()
        });
        Self {
            version: stored.version.unwrap_or(1),
            timestamp: stored.timestamp,
            messages: stored.messages,
            traits: stored.traits,
            advice_points,
            display_name: stored.display_name,
            extra: stored.extra,
        }
    }
}

impl ChatRecord {
    pub fn new(
        timestamp: String,
        messages: Vec<Message>,
        traits: TraitSet,
        advice_points: Option<Vec<AdviceItem>>,
    ) -> Self {
        Self {
            version: RECORD_VERSION,
            timestamp,
            messages,
            traits,
            advice_points,
            display_name: None,
            extra: Map::new(),
        }
    }

    /// Same conversation state, ignoring when it was taken and what it is called.
    pub fn same_content(&self, other: &ChatRecord) -> bool {
        let advice = |r: &ChatRecord| r.advice_points.clone().unwrap_or_default();
        self.messages == other.messages
            && self.traits == other.traits
            && advice(self) == advice(other)
    }

    /// Name shown in the saved-chats list: the custom name, else "Chat N" (1-based).
    pub fn label(&self, index: usize) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| format!("Chat {}", index + 1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendPolicy {
    /// Manual saves: always add a snapshot.
    Always,
    /// Autosave: skip when the newest stored snapshot has the same content.
    SkipIfUnchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended { index: usize },
    Unchanged,
}

pub struct ChatLogStore {
    dir: PathBuf,
    // Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl ChatLogStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path_for(&self, username: &str) -> Result<PathBuf> {
        if !is_safe_file_stem(username) {
            return Err(anyhow!("Invalid username for chat log: {:?}", username));
        }
        Ok(self.dir.join(format!("{username}_chats.json")))
    }

    /// All records for the user. A missing or unreadable log reads as empty.
    pub fn load_records(&self, username: &str) -> Vec<ChatRecord> {
        match self.read_strict(username) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!("Treating chat log for {} as empty: {:#}", username, e);
                Vec::new()
            }
        }
    }

    pub fn get_record(&self, username: &str, index: usize) -> Option<ChatRecord> {
        self.load_records(username).into_iter().nth(index)
    }

    /// Append a snapshot and rewrite the file. Unlike reads, a corrupt existing
    /// log is an error here so it is never overwritten with a fresh array.
    pub fn append_record(
        &self,
        username: &str,
        record: ChatRecord,
        policy: AppendPolicy,
    ) -> Result<AppendOutcome> {
        let _guard = self.lock();
        let mut records = self.read_strict(username)?;

        if policy == AppendPolicy::SkipIfUnchanged {
            if let Some(last) = records.last() {
                if last.same_content(&record) {
                    tracing::debug!("Chat for {} unchanged since last snapshot", username);
                    return Ok(AppendOutcome::Unchanged);
                }
            }
        }

        records.push(record);
        self.write_records(username, &records)?;
        tracing::info!("Saved chat snapshot #{} for {}", records.len(), username);
        Ok(AppendOutcome::Appended {
            index: records.len() - 1,
        })
    }

    /// Set `display_name` on one record. `None` when the index is out of range.
    pub fn rename_record(
        &self,
        username: &str,
        index: usize,
        new_name: &str,
    ) -> Result<Option<ChatRecord>> {
        let _guard = self.lock();
        let mut records = self.read_strict(username)?;
        let Some(record) = records.get_mut(index) else {
            return Ok(None);
        };
        record.display_name = Some(new_name.to_string());
        let renamed = record.clone();
        self.write_records(username, &records)?;
        Ok(Some(renamed))
    }

    /// Sum of trait counters over every stored record.
    pub fn total_traits(&self, username: &str) -> TraitSet {
        let mut totals = TraitSet::default();
        for record in self.load_records(username) {
            totals.accumulate(&record.traits);
        }
        totals
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_strict(&self, username: &str) -> Result<Vec<ChatRecord>> {
        let path = self.path_for(username)?;
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("Failed to read {:?}", path))?;
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&contents).with_context(|| format!("Failed to parse {:?}", path))
    }

    fn write_records(&self, username: &str, records: &[ChatRecord]) -> Result<()> {
        let path = self.path_for(username)?;
        let json = serde_json::to_vec_pretty(records).context("Failed to serialize chat log")?;
        write_atomic(&path, &json)
    }
}

/// Write to a sibling temp file, then rename over the target.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file =
        fs::File::create(&tmp).with_context(|| format!("Failed to create {:?}", tmp))?;
    file.write_all(contents)
        .with_context(|| format!("Failed to write {:?}", tmp))?;
    file.sync_all()
        .with_context(|| format!("Failed to flush {:?}", tmp))?;
    drop(file);

    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {:?}", path))
}

/// Usernames become file names; reject anything that could escape the directory.
pub fn is_safe_file_stem(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::Trait;
    use tempfile::TempDir;

    fn temp_store() -> (TempDir, ChatLogStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ChatLogStore::new(dir.path());
        (dir, store)
    }

    fn record(text: &str) -> ChatRecord {
        let mut traits = TraitSet::default();
        traits.increment(Trait::Empathy, 1);
        ChatRecord::new(
            "2024-05-01T10:00:00+00:00".to_string(),
            vec![Message::assistant("Hello"), Message::user(text)],
            traits,
            Some(vec![AdviceItem::new("Try resting.", "2024-05-01T10:00:00+00:00")]),
        )
    }

    #[test]
    fn missing_log_reads_empty() {
        let (_dir, store) = temp_store();
        assert!(store.load_records("alice").is_empty());
        assert!(store.total_traits("alice").is_empty());
    }

    #[test]
    fn write_then_read_round_trips_including_rename() {
        let (_dir, store) = temp_store();
        let first = record("one");
        let second = record("two");

        store
            .append_record("alice", first.clone(), AppendPolicy::Always)
            .unwrap();
        store
            .append_record("alice", second.clone(), AppendPolicy::Always)
            .unwrap();
        let renamed = store
            .rename_record("alice", 0, "Monday check-in")
            .unwrap()
            .expect("record exists");
        assert_eq!(renamed.display_name.as_deref(), Some("Monday check-in"));

        let loaded = store.load_records("alice");
        let mut expected_first = first;
        expected_first.display_name = Some("Monday check-in".to_string());
        assert_eq!(loaded, vec![expected_first, second]);
        assert_eq!(loaded[0].label(0), "Monday check-in");
        assert_eq!(loaded[1].label(1), "Chat 2");
    }

    #[test]
    fn rename_out_of_range_is_none() {
        let (_dir, store) = temp_store();
        store
            .append_record("alice", record("one"), AppendPolicy::Always)
            .unwrap();
        assert!(store.rename_record("alice", 3, "x").unwrap().is_none());
    }

    #[test]
    fn autosave_policy_skips_identical_snapshot() {
        let (_dir, store) = temp_store();
        let snapshot = record("same");
        let mut later = snapshot.clone();
        later.timestamp = "2024-05-01T10:06:00+00:00".to_string();

        assert_eq!(
            store
                .append_record("alice", snapshot, AppendPolicy::SkipIfUnchanged)
                .unwrap(),
            AppendOutcome::Appended { index: 0 }
        );
        assert_eq!(
            store
                .append_record("alice", later.clone(), AppendPolicy::SkipIfUnchanged)
                .unwrap(),
            AppendOutcome::Unchanged
        );
        assert_eq!(store.load_records("alice").len(), 1);

        // Manual saves append regardless.
        store
            .append_record("alice", later, AppendPolicy::Always)
            .unwrap();
        assert_eq!(store.load_records("alice").len(), 2);
    }

    #[test]
    fn totals_sum_every_record() {
        let (_dir, store) = temp_store();
        for text in ["a", "b", "c"] {
            store
                .append_record("bob", record(text), AppendPolicy::Always)
                .unwrap();
        }
        assert_eq!(store.total_traits("bob").empathy, 3);
    }

    #[test]
    fn legacy_records_migrate_and_keep_unknown_fields() {
        let (dir, store) = temp_store();
        let legacy = r#"[
            {
                "timestamp": "2024-04-30T09:00:00.000001",
                "messages": [{"role": "assistant", "content": "Hi"}],
                "traits": {"Empathy": 0, "Self-Awareness": 1, "Anxiety": 0,
                           "Optimism": 0, "Mood Swings": 0, "Confidence": 0},
                "reactions": {"0": "like"},
                "advice_points": ["Try a walk."]
            }
        ]"#;
        fs::write(dir.path().join("carol_chats.json"), legacy).unwrap();

        let records = store.load_records("carol");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].version, 1);
        let advice = records[0].advice_points.as_ref().unwrap();
        assert_eq!(advice[0].text, "Try a walk.");
        assert_eq!(advice[0].timestamp, "2024-04-30T09:00:00.000001");
        assert!(records[0].display_name.is_none());

        store.rename_record("carol", 0, "First").unwrap();
        let raw: Value =
            serde_json::from_slice(&fs::read(dir.path().join("carol_chats.json")).unwrap())
                .unwrap();
        assert_eq!(raw[0]["reactions"]["0"], "like");
        assert_eq!(raw[0]["display_name"], "First");
        assert!(raw[0]["advice_points"][0]["uid"].is_string());
    }

    #[test]
    fn corrupt_log_reads_empty_but_is_not_overwritten() {
        let (dir, store) = temp_store();
        let path = dir.path().join("dave_chats.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(store.load_records("dave").is_empty());
        assert!(store
            .append_record("dave", record("x"), AppendPolicy::Always)
            .is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[test]
    fn unsafe_usernames_are_rejected() {
        let (_dir, store) = temp_store();
        assert!(store.path_for("../etc").is_err());
        assert!(store.path_for("..").is_err());
        assert!(store.path_for("a\\b").is_err());
        assert!(store.path_for("alice").is_ok());
    }
}
