use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::scoring::{ScoringApi, ScoringMetadata, ScoringRequest, ScoringResponse};

// Disambiguates entries landing on the same millisecond.
static ENTRY_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Ai,
    Candidate,
}

impl Speaker {
    pub fn label(self) -> &'static str {
        match self {
            Speaker::Ai => "AI",
            Speaker::Candidate => "Candidate",
        }
    }

    fn id_prefix(self) -> &'static str {
        match self {
            Speaker::Ai => "ai",
            Speaker::Candidate => "candidate",
        }
    }
}

/// One timestamped utterance attributed to the AI or the candidate.
/// Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub id: String,
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

impl TranscriptEntry {
    pub fn new(speaker: Speaker, text: impl Into<String>) -> Self {
        Self::with_confidence(speaker, text, None)
    }

    pub fn with_confidence(
        speaker: Speaker,
        text: impl Into<String>,
        confidence: Option<f32>,
    ) -> Self {
        let timestamp = Utc::now();
        let seq = ENTRY_SEQ.fetch_add(1, Ordering::Relaxed);
        Self {
            id: format!(
                "{}-{}-{}",
                speaker.id_prefix(),
                timestamp.timestamp_millis(),
                seq
            ),
            speaker,
            text: text.into(),
            timestamp,
            confidence,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LocalBackup<'a> {
    interview_id: &'a str,
    transcript: &'a [TranscriptEntry],
    saved_at: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocalBackupOwned {
    interview_id: String,
    transcript: Vec<TranscriptEntry>,
    saved_at: DateTime<Utc>,
}

/// Append-only ordered log of spoken entries; insertion order is
/// chronological order.
#[derive(Debug, Default)]
pub struct TranscriptStore {
    entries: Vec<TranscriptEntry>,
}

impl TranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry to the end of the log. Entries with empty text are
    /// logged and dropped.
    pub fn append(&mut self, entry: TranscriptEntry) {
        if entry.text.trim().is_empty() {
            tracing::warn!(speaker = ?entry.speaker, "dropping transcript entry with empty text");
            return;
        }
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Renders the log as `[time] speaker: text` lines in original order.
    pub fn format(&self) -> String {
        self.entries
            .iter()
            .map(|entry| {
                format!(
                    "[{}] {}: {}",
                    entry.timestamp.format("%H:%M:%S"),
                    entry.speaker.label(),
                    entry.text
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn export_text(&self) -> String {
        self.format()
    }

    pub fn export_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.entries).context("Failed to serialize transcript")
    }

    /// Writes a session-keyed backup. Non-authoritative; used for recovery
    /// when the authoritative send to the scoring collaborator fails.
    pub fn persist_locally(&self, dir: &Path, interview_id: &str) -> Result<PathBuf> {
        let backup = LocalBackup {
            interview_id,
            transcript: &self.entries,
            saved_at: Utc::now(),
        };
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create backup directory {}", dir.display()))?;
        let path = dir.join(format!("interview_transcript_{interview_id}.json"));
        let payload = serde_json::to_vec_pretty(&backup).context("Failed to serialize backup")?;
        fs::write(&path, payload)
            .with_context(|| format!("Failed to write backup {}", path.display()))?;
        tracing::debug!(path = %path.display(), "persisted local transcript backup");
        Ok(path)
    }

    /// Restores entries from a previously persisted backup.
    pub fn load_local(dir: &Path, interview_id: &str) -> Result<Vec<TranscriptEntry>> {
        let path = dir.join(format!("interview_transcript_{interview_id}.json"));
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read backup {}", path.display()))?;
        let backup: LocalBackupOwned =
            serde_json::from_str(&raw).context("Failed to parse backup")?;
        if backup.interview_id != interview_id {
            anyhow::bail!(
                "backup interview id mismatch: expected {interview_id}, found {}",
                backup.interview_id
            );
        }
        tracing::debug!(saved_at = %backup.saved_at, "loaded local transcript backup");
        Ok(backup.transcript)
    }

    /// Forwards the full transcript plus session metadata to the external
    /// scoring collaborator.
    pub async fn send_for_scoring<A: ScoringApi + Sync>(
        &self,
        api: &A,
        interview_id: &str,
        metadata: ScoringMetadata,
    ) -> Result<ScoringResponse, SessionError> {
        let request = ScoringRequest {
            interview_id: interview_id.to_string(),
            transcript: self.entries.clone(),
            metadata,
        };
        tracing::info!(entries = request.transcript.len(), "sending transcript for scoring");
        api.score_interview(&request).await
    }
}
