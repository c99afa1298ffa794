//! Trials and their lifecycle.
//!
//! A [`Trial`] is one execution of one experiment with one concrete input
//! sample. Its status moves from `Created` through `InProgress` into exactly
//! one of the terminal states: `Complete` carries the parsed child-process
//! output, `Error` carries an [`ErrorKind`]. Only terminal trials ever cross
//! a node boundary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::experiment::Sample;

/// The input side of a trial: which experiment, which sample, plus an opaque
/// replicate tag the caller may use to correlate trials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialInput {
    pub experiment_name: String,
    #[serde(default)]
    pub sample: Sample,
    #[serde(default)]
    pub replicate: Json,
}

/// What a successful child process wrote to stdout.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrialOutput {
    /// Predicate outcomes. The key set depends only on what the child wrote;
    /// it need not match the input sample's keys.
    #[serde(default)]
    pub preds: BTreeMap<String, bool>,
    /// Auxiliary output, uninterpreted.
    #[serde(default)]
    pub aux: BTreeMap<String, Json>,
    #[serde(default)]
    pub replicate: Json,
}

/// The failure taxonomy carried by a terminal `Error` status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// An internal fault inside the handling node.
    Exception {
        #[serde(rename = "typeid")]
        type_id: String,
        what: String,
    },
    /// A system-level failure before or during child execution: search,
    /// spawn, pipe, or timeout.
    ErrorCode {
        value: i32,
        message: String,
        category: String,
        stdout: String,
        stderr: String,
    },
    /// The child ran and exited non-zero.
    ExitStatus {
        code: i32,
        stdout: String,
        stderr: String,
    },
    /// The child exited zero but its stdout was not a valid trial output
    /// document.
    BadOutput { stdout: String, stderr: String },
    /// The node received a trial for an experiment it does not have.
    UnknownExperiment { name: String },
}

impl ErrorKind {
    /// Wraps a typed error the way a worker reports an internal fault.
    pub fn exception<E: std::error::Error + ?Sized>(err: &E) -> Self {
        ErrorKind::Exception {
            type_id: std::any::type_name::<E>().to_string(),
            what: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrialStatus {
    Created {},
    InProgress {},
    Error(ErrorKind),
    Complete { output: TrialOutput, stderr: String },
}

impl Default for TrialStatus {
    fn default() -> Self {
        TrialStatus::Created {}
    }
}

impl TrialStatus {
    /// Terminal statuses never transition again.
    pub fn is_final(&self) -> bool {
        matches!(self, TrialStatus::Error(_) | TrialStatus::Complete { .. })
    }
}

/// The unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    #[serde(default)]
    pub status: TrialStatus,
    pub input: TrialInput,
}

impl Trial {
    pub fn new(experiment_name: impl Into<String>, sample: Sample) -> Self {
        Self {
            status: TrialStatus::default(),
            input: TrialInput {
                experiment_name: experiment_name.into(),
                sample,
                replicate: Json::Null,
            },
        }
    }

    pub fn replicate(mut self, replicate: Json) -> Self {
        self.input.replicate = replicate;
        self
    }

    pub fn status(mut self, status: TrialStatus) -> Self {
        self.status = status;
        self
    }

    /// Marks the trial failed with an internal fault.
    pub fn exception<E: std::error::Error + ?Sized>(mut self, err: &E) -> Self {
        self.status = TrialStatus::Error(ErrorKind::exception(err));
        self
    }

    /// The parsed output, when the trial completed successfully.
    pub fn output(&self) -> Option<&TrialOutput> {
        match &self.status {
            TrialStatus::Complete { output, .. } => Some(output),
            _ => None,
        }
    }
}
