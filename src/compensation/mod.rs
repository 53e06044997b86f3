//! Undo bookkeeping for partially completed operations.
//!
//! Work pushes a frame for every side effect it acquires. A frame names a
//! delegate registered at startup plus the JSON context that delegate needs
//! to undo the effect. On failure the stack is unwound newest-first.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub type DelegateFn = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompensationError {
    #[error("compensation delegate key must not be empty")]
    EmptyDelegateKey,
    #[error("compensation delegate '{key}' is already registered")]
    DuplicateDelegate { key: String },
    #[error("compensation delegate '{key}' is not registered")]
    UnknownDelegate { key: String },
    #[error("save point {save_point} is beyond the stack depth {depth}")]
    InvalidSavePoint { save_point: usize, depth: usize },
    #[error("failed to serialize context for delegate '{key}': {message}")]
    Context { key: String, message: String },
    #[error("compensation frame {index} ('{key}') failed: {message}")]
    DelegateFailed {
        index: usize,
        key: String,
        message: String,
    },
    #[error("compensation frame {index} ('{key}') panicked")]
    DelegatePanicked { index: usize, key: String },
    #[error("compensation journal write failed: {message}")]
    Journal { message: String },
}

/// Read-only lookup of undo functions by stable key.
#[derive(Default)]
pub struct DelegateRegistry {
    delegates: RwLock<BTreeMap<String, DelegateFn>>,
}

impl fmt::Debug for DelegateRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegateRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}

impl DelegateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, key: impl Into<String>, delegate: F) -> Result<(), CompensationError>
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(CompensationError::EmptyDelegateKey);
        }

        let mut delegates = match self.delegates.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if delegates.contains_key(&key) {
            return Err(CompensationError::DuplicateDelegate { key });
        }
        delegates.insert(key, Arc::new(delegate));
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<DelegateFn> {
        let delegates = match self.delegates.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        delegates.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> Vec<String> {
        let delegates = match self.delegates.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        delegates.keys().cloned().collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompensationFrame {
    pub index: usize,
    pub delegate_key: String,
    pub context: Value,
}

/// Durable mirror of the frames that have not run yet.
pub trait CompensationJournal: Send + Sync {
    fn record(&self, frames: &[CompensationFrame]) -> Result<(), CompensationError>;
}

#[derive(Debug, Default)]
pub struct NoopJournal;

impl CompensationJournal for NoopJournal {
    fn record(&self, _frames: &[CompensationFrame]) -> Result<(), CompensationError> {
        Ok(())
    }
}

/// Depth of the stack before a push. Popping to it discards that push and
/// everything above.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SavePoint(usize);

impl SavePoint {
    pub fn depth(self) -> usize {
        self.0
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct UnwindReport {
    pub executed: usize,
    pub failures: Vec<CompensationError>,
}

impl UnwindReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct CompensationStack {
    registry: Arc<DelegateRegistry>,
    journal: Arc<dyn CompensationJournal>,
    frames: Vec<CompensationFrame>,
    /// Leading frames that came back from the journal rather than a push.
    restored: usize,
    journal_errors: Vec<CompensationError>,
}

impl fmt::Debug for CompensationStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompensationStack")
            .field("frames", &self.frames)
            .finish()
    }
}

impl CompensationStack {
    pub fn new(registry: Arc<DelegateRegistry>, journal: Arc<dyn CompensationJournal>) -> Self {
        Self {
            registry,
            journal,
            frames: Vec::new(),
            restored: 0,
            journal_errors: Vec::new(),
        }
    }

    /// Rebuilds a stack from journaled frames, e.g. after a restart. Frames
    /// whose delegate is no longer registered are kept so unwinding reports
    /// them instead of losing them. Restarted work that pushes a frame
    /// identical to a restored one gets the restored frame back.
    pub fn restore(
        registry: Arc<DelegateRegistry>,
        frames: Vec<CompensationFrame>,
        journal: Arc<dyn CompensationJournal>,
    ) -> Self {
        Self {
            registry,
            journal,
            restored: frames.len(),
            frames,
            journal_errors: Vec::new(),
        }
    }

    pub fn push(&mut self, delegate_key: &str, context: impl Serialize) -> Result<SavePoint, CompensationError> {
        if !self.registry.contains(delegate_key) {
            return Err(CompensationError::UnknownDelegate {
                key: delegate_key.to_owned(),
            });
        }
        let context = serde_json::to_value(context).map_err(|error| CompensationError::Context {
            key: delegate_key.to_owned(),
            message: error.to_string(),
        })?;

        let journaled = self.frames[..self.restored]
            .iter()
            .position(|frame| frame.delegate_key == delegate_key && frame.context == context);
        if let Some(position) = journaled {
            tracing::debug!(
                target: "compensation",
                index = self.frames[position].index,
                delegate = delegate_key,
                "frame already journaled"
            );
            return Ok(SavePoint(position));
        }

        let save_point = SavePoint(self.frames.len());
        let index = self.frames.last().map_or(0, |frame| frame.index + 1);
        self.frames.push(CompensationFrame {
            index,
            delegate_key: delegate_key.to_owned(),
            context,
        });
        self.journal_frames();
        Ok(save_point)
    }

    /// Commits everything pushed since `save_point` without running it.
    pub fn pop(&mut self, save_point: SavePoint) -> Result<usize, CompensationError> {
        let depth = self.frames.len();
        if save_point.0 > depth {
            return Err(CompensationError::InvalidSavePoint {
                save_point: save_point.0,
                depth,
            });
        }
        self.frames.truncate(save_point.0);
        self.restored = self.restored.min(save_point.0);
        let discarded = depth - save_point.0;
        if discarded > 0 {
            self.journal_frames();
        }
        Ok(discarded)
    }

    /// Runs every remaining frame newest-first. Each frame leaves the stack
    /// and the journal before its delegate runs, so it runs at most once
    /// even across a crash. Journal writes that failed at any point since
    /// the last report are reported too.
    pub fn unwind(&mut self) -> UnwindReport {
        let mut report = UnwindReport::default();

        while let Some(frame) = self.frames.pop() {
            self.restored = self.restored.min(self.frames.len());
            self.journal_frames();
            report.executed += 1;

            let Some(delegate) = self.registry.get(&frame.delegate_key) else {
                let error = CompensationError::UnknownDelegate {
                    key: frame.delegate_key.clone(),
                };
                tracing::error!(target: "compensation", index = frame.index, %error, "cannot run compensation frame");
                report.failures.push(error);
                continue;
            };

            let outcome = catch_unwind(AssertUnwindSafe(|| delegate(&frame.context)));
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(message)) => Some(CompensationError::DelegateFailed {
                    index: frame.index,
                    key: frame.delegate_key.clone(),
                    message,
                }),
                Err(_) => Some(CompensationError::DelegatePanicked {
                    index: frame.index,
                    key: frame.delegate_key.clone(),
                }),
            };

            match failure {
                Some(error) => {
                    tracing::warn!(target: "compensation", index = frame.index, %error, "compensation frame failed");
                    report.failures.push(error);
                }
                None => {
                    tracing::debug!(
                        target: "compensation",
                        index = frame.index,
                        delegate = %frame.delegate_key,
                        "compensation frame executed"
                    );
                }
            }
        }

        report.failures.append(&mut self.journal_errors);
        report
    }

    pub fn clear(&mut self) {
        self.restored = 0;
        if !self.frames.is_empty() {
            self.frames.clear();
            self.journal_frames();
        }
    }

    /// Journal write failures not yet handed out by `unwind`.
    pub fn take_journal_errors(&mut self) -> Vec<CompensationError> {
        std::mem::take(&mut self.journal_errors)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[CompensationFrame] {
        &self.frames
    }

    fn journal_frames(&mut self) {
        if let Err(error) = self.journal.record(&self.frames) {
            tracing::warn!(target: "compensation", %error, "failed to journal compensation frames");
            if self.journal_errors.last() != Some(&error) {
                self.journal_errors.push(error);
            }
        }
    }
}
