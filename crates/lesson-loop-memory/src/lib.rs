#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use lesson_loop_domain::{
    Constraint, ExecutionTrace, HistoryEntry, LessonError, MistakeFinding, PatternKey,
    PatternRecord, RunId,
};
use serde::{Deserialize, Serialize};

/// Maximum retained run-history entries; eviction is strictly oldest-first.
pub const HISTORY_CAPACITY: usize = 50;

/// Occurrences required before a pattern yields a constraint. One occurrence
/// is indistinguishable from noise; two are treated as a systematic defect.
pub const DEFAULT_THRESHOLD: u64 = 2;

/// The persisted store layout. This document is the sole source of truth
/// across process restarts; all in-memory state is reconstructible from it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StoreDocument {
    pub run_counter: u64,
    pub patterns: BTreeMap<PatternKey, PatternRecord>,
    pub constraints: Vec<Constraint>,
    pub history: VecDeque<HistoryEntry>,
}

/// Durable backend for the store document. Load once at open; every
/// mutation is written through synchronously.
pub trait StoreBackend {
    /// Loads the persisted document, `None` when no store exists yet.
    ///
    /// # Errors
    /// Returns [`LessonError::StoreCorruption`] when an existing store
    /// cannot be read or parsed.
    fn load(&self) -> Result<Option<StoreDocument>, LessonError>;

    /// Writes the document durably. A single attempt; retry policy lives
    /// with the caller.
    ///
    /// # Errors
    /// Returns [`LessonError::StoreWrite`] when the write fails.
    fn persist(&self, document: &StoreDocument) -> Result<(), LessonError>;
}

/// JSON-file backend. Writes go to a sibling temp file first and are moved
/// into place, so a failed write never leaves a half-written store.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

impl StoreBackend for JsonFileStore {
    fn load(&self) -> Result<Option<StoreDocument>, LessonError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let body = fs::read_to_string(&self.path).map_err(|err| {
            LessonError::StoreCorruption(format!(
                "failed to read store at {}: {err}",
                self.path.display()
            ))
        })?;

        let document = serde_json::from_str(&body).map_err(|err| {
            LessonError::StoreCorruption(format!(
                "failed to parse store at {}: {err}",
                self.path.display()
            ))
        })?;

        Ok(Some(document))
    }

    fn persist(&self, document: &StoreDocument) -> Result<(), LessonError> {
        let body = serde_json::to_string_pretty(document).map_err(|err| {
            LessonError::StoreWrite(format!("failed to serialize store document: {err}"))
        })?;

        let temp = self.temp_path();
        let write_result = fs::write(&temp, &body).and_then(|()| fs::rename(&temp, &self.path));

        if let Err(err) = write_result {
            let _ = fs::remove_file(&temp);
            return Err(LessonError::StoreWrite(format!(
                "failed to write store at {}: {err}",
                self.path.display()
            )));
        }

        Ok(())
    }
}

/// A run staged against the current document but not yet committed. Lets
/// the orchestrator fold newly synthesized constraints into the same
/// durable write as the occurrence counts, so a write failure leaves both
/// at pre-run state.
#[derive(Debug, Clone)]
pub struct StagedRun {
    pub document: StoreDocument,
    pub crossed_keys: Vec<PatternKey>,
}

/// Durable pattern memory: occurrence counts per pattern key plus the
/// bounded run history. Counting uses the records, never history replay.
pub struct PatternMemory<B: StoreBackend> {
    backend: B,
    document: StoreDocument,
    threshold: u64,
}

impl<B: StoreBackend> PatternMemory<B> {
    /// Opens the memory from its backend. A corrupt store is replaced by an
    /// empty one and reported as a warning, not an error: prior learning is
    /// lost, which is an accepted degradation.
    ///
    /// # Errors
    /// Propagates backend failures other than corruption.
    pub fn open(backend: B, threshold: u64) -> Result<(Self, Option<String>), LessonError> {
        let (document, warning) = match backend.load() {
            Ok(Some(document)) => (document, None),
            Ok(None) => (StoreDocument::default(), None),
            Err(LessonError::StoreCorruption(message)) => {
                (StoreDocument::default(), Some(message))
            }
            Err(err) => return Err(err),
        };

        Ok((
            Self {
                backend,
                document,
                threshold,
            },
            warning,
        ))
    }

    #[must_use]
    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    #[must_use]
    pub fn next_run_id(&self) -> RunId {
        RunId(self.document.run_counter + 1)
    }

    #[must_use]
    pub fn occurrence_count(&self, key: &PatternKey) -> u64 {
        self.document
            .patterns
            .get(key)
            .map_or(0, |record| record.occurrence_count)
    }

    #[must_use]
    pub fn history(&self) -> &VecDeque<HistoryEntry> {
        &self.document.history
    }

    #[must_use]
    pub fn constraints(&self) -> &[Constraint] {
        &self.document.constraints
    }

    #[must_use]
    pub fn document(&self) -> &StoreDocument {
        &self.document
    }

    /// Applies one run to a copy of the document: each distinct pattern key
    /// among the findings is counted exactly once, the run is appended to
    /// history with oldest-first eviction, and the keys that reached the
    /// threshold in this run are reported.
    #[must_use]
    pub fn stage_run(
        &self,
        run_id: RunId,
        trace: &ExecutionTrace,
        findings: &[MistakeFinding],
    ) -> StagedRun {
        let mut document = self.document.clone();
        document.run_counter = document.run_counter.max(run_id.0);

        let mut keys: Vec<PatternKey> = Vec::new();
        for finding in findings {
            let key = PatternKey::from_finding(finding);
            if !keys.contains(&key) {
                keys.push(key);
            }
        }

        let mut crossed_keys = Vec::new();
        for key in keys {
            let record = document
                .patterns
                .entry(key.clone())
                .or_insert(PatternRecord {
                    occurrence_count: 0,
                    last_seen_run_id: run_id,
                });
            let previous = record.occurrence_count;
            record.occurrence_count += 1;
            record.last_seen_run_id = run_id;

            if previous < self.threshold && record.occurrence_count >= self.threshold {
                crossed_keys.push(key);
            }
        }

        document.history.push_back(HistoryEntry {
            run_id,
            trace: trace.clone(),
            findings: findings.to_vec(),
        });
        while document.history.len() > HISTORY_CAPACITY {
            let _ = document.history.pop_front();
        }

        StagedRun {
            document,
            crossed_keys,
        }
    }

    /// Persists a staged document and adopts it on success. The durable
    /// write is retried exactly once; if both attempts fail, the in-memory
    /// document is left untouched and both sides reflect pre-run state.
    ///
    /// # Errors
    /// Returns [`LessonError::StoreWrite`] after the failed retry.
    pub fn commit(&mut self, document: StoreDocument) -> Result<(), LessonError> {
        if let Err(first) = self.backend.persist(&document) {
            match first {
                LessonError::StoreWrite(_) => self.backend.persist(&document)?,
                other => return Err(other),
            }
        }

        self.document = document;
        Ok(())
    }

    /// Records one run end to end: stage, persist, adopt. Returns the keys
    /// that reached the threshold in this call.
    ///
    /// # Errors
    /// Returns [`LessonError::StoreWrite`] when the durable write fails
    /// after its retry; the run is then not counted.
    pub fn record_run(
        &mut self,
        run_id: RunId,
        trace: &ExecutionTrace,
        findings: &[MistakeFinding],
    ) -> Result<Vec<PatternKey>, LessonError> {
        let staged = self.stage_run(run_id, trace, findings);
        self.commit(staged.document)?;
        Ok(staged.crossed_keys)
    }
}
