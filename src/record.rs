//! Append-only run record.
//!
//! Every run writes one JSON document per line to `<data_dir>/<plan_id>-<run_uid>.jsonl`:
//!
//! ```text
//! start (1)
//!   ├── transition (N, one per controller state change)
//!   └── feature    (N, one per extracted spectral feature)
//! stop (1)
//! ```
//!
//! Each line is flushed as soon as it is written, so a crash loses at most the document
//! being written.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::controller::state::{ControllerState, RunCause, Transition};
use crate::error::AppResult;
use crate::spectral::SpectralFeature;

/// One line of the run record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunDocument {
    /// Run started.
    Start(StartDoc),
    /// Controller state changed.
    Transition(TransitionDoc),
    /// Spectral feature extracted.
    Feature(FeatureDoc),
    /// Run finished.
    Stop(StopDoc),
}

impl RunDocument {
    /// Run this document belongs to.
    pub fn run_uid(&self) -> Uuid {
        match self {
            RunDocument::Start(d) => d.run_uid,
            RunDocument::Transition(d) => d.run_uid,
            RunDocument::Feature(d) => d.run_uid,
            RunDocument::Stop(d) => d.run_uid,
        }
    }
}

/// Emitted once, before any hardware is driven.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StartDoc {
    /// Run id.
    pub run_uid: Uuid,
    /// Plan identity.
    pub plan_id: String,
    /// Plan label.
    pub plan_name: String,
    /// Number of plan steps.
    pub steps: usize,
    /// Start time.
    pub time: DateTime<Utc>,
}

/// A controller state change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransitionDoc {
    /// Run id.
    pub run_uid: Uuid,
    /// State left.
    pub from: ControllerState,
    /// State entered.
    pub to: ControllerState,
    /// Time of the change.
    pub time: DateTime<Utc>,
}

/// One spectral feature extracted while `step` was monitoring.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureDoc {
    /// Run id.
    pub run_uid: Uuid,
    /// Index of the monitor step.
    pub step: usize,
    /// The extracted feature.
    pub feature: SpectralFeature,
}

/// Emitted once the session has been released.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StopDoc {
    /// Run id.
    pub run_uid: Uuid,
    /// Terminal controller state.
    pub terminal: ControllerState,
    /// Why the run ended.
    pub cause: RunCause,
    /// Feature documents written during the run.
    pub features: usize,
    /// Errors raised while venting, if any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vent_errors: Vec<String>,
    /// Stop time.
    pub time: DateTime<Utc>,
}

/// Writer for one run's record file.
pub struct RunRecorder {
    run_uid: Uuid,
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    features: AtomicUsize,
}

impl RunRecorder {
    /// Create the record file for a new run under `dir`.
    pub fn create(dir: impl AsRef<Path>, plan_id: &str) -> AppResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let run_uid = Uuid::new_v4();
        let stem: String = plan_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let path = dir.join(format!("{stem}-{run_uid}.jsonl"));

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(path = %path.display(), "Run record created");

        Ok(Self {
            run_uid,
            path,
            writer: Mutex::new(BufWriter::new(file)),
            features: AtomicUsize::new(0),
        })
    }

    /// Id stamped on every document.
    pub fn run_uid(&self) -> Uuid {
        self.run_uid
    }

    /// Record file location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of feature documents written so far.
    pub fn feature_count(&self) -> usize {
        self.features.load(Ordering::SeqCst)
    }

    /// Append one document and flush it to disk.
    pub fn record(&self, document: &RunDocument) -> AppResult<()> {
        let line = serde_json::to_string(document)?;
        let mut writer = self.writer.lock();
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        if matches!(document, RunDocument::Feature(_)) {
            self.features.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Append the `start` document.
    pub fn record_start(&self, plan_id: &str, plan_name: &str, steps: usize) -> AppResult<()> {
        self.record(&RunDocument::Start(StartDoc {
            run_uid: self.run_uid,
            plan_id: plan_id.to_string(),
            plan_name: plan_name.to_string(),
            steps,
            time: Utc::now(),
        }))
    }

    /// Append a `transition` document.
    pub fn record_transition(&self, transition: &Transition) -> AppResult<()> {
        self.record(&RunDocument::Transition(TransitionDoc {
            run_uid: self.run_uid,
            from: transition.from,
            to: transition.to,
            time: transition.time,
        }))
    }

    /// Append a `feature` document.
    pub fn record_feature(&self, step: usize, feature: &SpectralFeature) -> AppResult<()> {
        self.record(&RunDocument::Feature(FeatureDoc {
            run_uid: self.run_uid,
            step,
            feature: feature.clone(),
        }))
    }

    /// Append the `stop` document.
    pub fn record_stop(
        &self,
        terminal: ControllerState,
        cause: &RunCause,
        vent_errors: Vec<String>,
    ) -> AppResult<()> {
        self.record(&RunDocument::Stop(StopDoc {
            run_uid: self.run_uid,
            terminal,
            cause: cause.clone(),
            features: self.feature_count(),
            vent_errors,
            time: Utc::now(),
        }))
    }
}

/// Read every complete document from a record file.
///
/// A trailing partial line (left by a crash mid-write) is ignored.
pub fn read_documents(path: impl AsRef<Path>) -> AppResult<Vec<RunDocument>> {
    let reader = BufReader::new(File::open(path.as_ref())?);
    let lines: Vec<String> = reader.lines().collect::<Result<_, _>>()?;
    let last = lines.len().saturating_sub(1);

    let mut documents = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(document) => documents.push(document),
            Err(_) if i == last => break,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(documents)
}
