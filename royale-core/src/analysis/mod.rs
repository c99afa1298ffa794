//! Analysis over completed trials.
//!
//! An [`Analysis`] consumes a vector of trials and produces a typed result.
//! Only trials in the `Complete` status participate; everything else is
//! ignored. The one built-in analysis type is logistic regression: for each
//! predicate name appearing in any completed trial, a regression is fit
//! whose features are the numeric sample values (in the stable key order of
//! the input spec) and whose target is the predicate outcome.
//!
//! Non-numeric sample values are not supported by this analysis type and
//! abort the run with a typed error rather than being coerced.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::trial::{ErrorKind, Trial, TrialInput, TrialOutput, TrialStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AnalysisType {
    LogisticRegression {},
}

impl AnalysisType {
    /// Resolves a CLI-facing name. The canonical wire tag and two
    /// conventional spellings are accepted.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "LogisticRegression" | "logistic_regression" | "logreg" => {
                Some(AnalysisType::LogisticRegression {})
            }
            _ => None,
        }
    }

    fn do_analysis(&self, input: &AnalysisInput) -> Result<AnalysisOutput> {
        match self {
            AnalysisType::LogisticRegression {} => Ok(AnalysisOutput::LogisticRegression {
                preds: logistic_regression(&input.data)?,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AnalysisOutput {
    LogisticRegression {
        preds: BTreeMap<String, LogisticPredicateOutput>,
    },
}

/// Per-predicate summary plus the fitted coefficients. The empty-string key
/// of `coeffs` holds the intercept; every other key is an input name.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LogisticPredicateOutput {
    pub name: String,
    pub sat_count: usize,
    pub error_count: usize,
    pub count: usize,
    pub prob: f64,
    pub rel_error: f64,
    pub coeffs: BTreeMap<String, f64>,
}

impl LogisticPredicateOutput {
    fn add_outcome(&mut self, sat: bool) {
        if sat {
            self.sat_count += 1;
        }
        self.count += 1;
        self.prob = self.sat_count as f64 / (self.count - self.error_count) as f64;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AnalysisStatus {
    Created {},
    InProgress {},
    Error(ErrorKind),
    Complete {
        output: AnalysisOutput,
        stderr: String,
    },
}

impl Default for AnalysisStatus {
    fn default() -> Self {
        AnalysisStatus::Created {}
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AnalysisInput {
    pub data: Vec<Trial>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    #[serde(default)]
    pub status: AnalysisStatus,
    pub input: AnalysisInput,
    #[serde(rename = "type")]
    pub analysis_type: AnalysisType,
}

impl Analysis {
    pub fn new(analysis_type: AnalysisType, data: Vec<Trial>) -> Self {
        Self {
            status: AnalysisStatus::default(),
            input: AnalysisInput { data },
            analysis_type,
        }
    }

    /// Runs the analysis, moving the status into a terminal state. A typed
    /// failure becomes `Error(Exception)` rather than unwinding.
    pub fn run(&mut self) {
        self.status = AnalysisStatus::InProgress {};
        self.status = match self.analysis_type.do_analysis(&self.input) {
            Ok(output) => AnalysisStatus::Complete {
                output,
                stderr: String::new(),
            },
            Err(err) => AnalysisStatus::Error(ErrorKind::exception(&*err)),
        };
    }
}

fn completed(trials: &[Trial]) -> Vec<(&TrialInput, &TrialOutput)> {
    trials
        .iter()
        .filter_map(|trial| match &trial.status {
            TrialStatus::Complete { output, .. } => Some((&trial.input, output)),
            _ => None,
        })
        .collect()
}

fn logistic_regression(
    trials: &[Trial],
) -> Result<BTreeMap<String, LogisticPredicateOutput>> {
    let mut preds: BTreeMap<String, LogisticPredicateOutput> = BTreeMap::new();

    let completed = completed(trials);
    info!(completed = completed.len(), "fitting logistic regressions");
    for (_, output) in &completed {
        for (name, sat) in &output.preds {
            let entry = preds.entry(name.clone()).or_default();
            entry.name = name.clone();
            entry.add_outcome(*sat);
        }
    }
    if completed.is_empty() {
        return Ok(preds);
    }

    let feature_names: Vec<String> = completed[0].0.sample.keys().cloned().collect();
    let rows = completed.len();
    let cols = feature_names.len() + 1;

    let mut features = DMatrix::zeros(rows, cols);
    for (row, (input, _)) in completed.iter().enumerate() {
        features[(row, 0)] = 1.0;
        for (col, name) in feature_names.iter().enumerate() {
            let value = input
                .sample
                .get(name)
                .ok_or_else(|| anyhow!("trial sample is missing input {name:?}"))?;
            features[(row, col + 1)] = value
                .to_number()
                .with_context(|| format!("input {name:?} is not numeric"))?;
        }
    }

    for (name, pred) in preds.iter_mut() {
        let mut targets = DVector::zeros(rows);
        for (row, (_, output)) in completed.iter().enumerate() {
            let sat = output
                .preds
                .get(name)
                .ok_or_else(|| anyhow!("trial output is missing predicate {name:?}"))?;
            targets[row] = if *sat { 1.0 } else { 0.0 };
        }

        let beta = fit_logistic(&features, &targets);
        debug!(predicate = %name, coeffs = ?beta.as_slice(), "fitted predicate");

        let mut coeffs = BTreeMap::new();
        coeffs.insert(String::new(), beta[0]);
        for (i, feature) in feature_names.iter().enumerate() {
            coeffs.insert(feature.clone(), beta[i + 1]);
        }
        pred.coeffs = coeffs;
    }

    Ok(preds)
}

const MAX_ITERATIONS: usize = 25;
const RIDGE: f64 = 1e-6;

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Newton-Raphson on the regularized log-likelihood (iteratively reweighted
/// least squares). The ridge term keeps the Hessian invertible on separable
/// data.
fn fit_logistic(features: &DMatrix<f64>, targets: &DVector<f64>) -> DVector<f64> {
    let cols = features.ncols();
    let mut beta = DVector::zeros(cols);

    for _ in 0..MAX_ITERATIONS {
        let probs = (features * &beta).map(sigmoid);
        let gradient = features.transpose() * (targets - &probs);

        let mut weighted = features.clone();
        for row in 0..features.nrows() {
            let weight = (probs[row] * (1.0 - probs[row])).max(1e-6);
            weighted.row_mut(row).scale_mut(weight);
        }
        let mut hessian = features.transpose() * weighted;
        for i in 0..cols {
            hessian[(i, i)] += RIDGE;
        }

        let Some(step) = hessian.lu().solve(&gradient) else {
            break;
        };
        beta += &step;
        if step.norm() < 1e-10 {
            break;
        }
    }

    beta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::Sample;
    use crate::value::Value;

    fn completed_trial(x: f64, sat: bool) -> Trial {
        let mut sample = Sample::new();
        sample.insert("x".to_string(), Value::Number(x));
        Trial::new("demo", sample).status(TrialStatus::Complete {
            output: TrialOutput {
                preds: BTreeMap::from([("p".to_string(), sat)]),
                ..Default::default()
            },
            stderr: String::new(),
        })
    }

    fn failed_trial() -> Trial {
        Trial::new("demo", Sample::new()).status(TrialStatus::Error(
            ErrorKind::UnknownExperiment {
                name: "demo".to_string(),
            },
        ))
    }

    /// Mostly-increasing outcomes with one overlap on each side, so the fit
    /// is well conditioned.
    fn trials() -> Vec<Trial> {
        (1..=10)
            .map(|x| {
                let sat = match x {
                    5 => true,
                    6 => false,
                    _ => x > 5,
                };
                completed_trial(x as f64, sat)
            })
            .collect()
    }

    #[test]
    fn regression_recovers_the_trend() {
        let mut analysis = Analysis::new(AnalysisType::LogisticRegression {}, trials());
        analysis.run();

        let AnalysisStatus::Complete { output, .. } = &analysis.status else {
            panic!("analysis failed: {:?}", analysis.status);
        };
        let AnalysisOutput::LogisticRegression { preds } = output;
        let fit = &preds["p"];

        assert_eq!(fit.count, 10);
        assert_eq!(fit.sat_count, 5);
        assert_eq!(fit.prob, 0.5);
        assert_eq!(
            fit.coeffs.keys().cloned().collect::<Vec<_>>(),
            ["", "x"]
        );
        assert!(
            fit.coeffs["x"] > 0.0,
            "satisfaction increases with x: {:?}",
            fit.coeffs
        );
        assert!(fit.coeffs.values().all(|c| c.is_finite()));
    }

    #[test]
    fn incomplete_trials_are_ignored() {
        let mut data = trials();
        data.push(failed_trial());
        let mut analysis = Analysis::new(AnalysisType::LogisticRegression {}, data);
        analysis.run();

        let AnalysisStatus::Complete { output, .. } = &analysis.status else {
            panic!("analysis failed: {:?}", analysis.status);
        };
        let AnalysisOutput::LogisticRegression { preds } = output;
        assert_eq!(preds["p"].count, 10);
    }

    #[test]
    fn no_completed_trials_yields_an_empty_result() {
        let mut analysis =
            Analysis::new(AnalysisType::LogisticRegression {}, vec![failed_trial()]);
        analysis.run();
        let AnalysisStatus::Complete { output, .. } = &analysis.status else {
            panic!("analysis failed: {:?}", analysis.status);
        };
        let AnalysisOutput::LogisticRegression { preds } = output;
        assert!(preds.is_empty());
    }

    #[test]
    fn non_numeric_samples_are_a_typed_error() {
        let mut sample = Sample::new();
        sample.insert("x".to_string(), Value::String("not numeric".to_string()));
        let trial = Trial::new("demo", sample).status(TrialStatus::Complete {
            output: TrialOutput {
                preds: BTreeMap::from([("p".to_string(), true)]),
                ..Default::default()
            },
            stderr: String::new(),
        });

        let mut analysis = Analysis::new(AnalysisType::LogisticRegression {}, vec![trial]);
        analysis.run();
        assert!(matches!(
            analysis.status,
            AnalysisStatus::Error(ErrorKind::Exception { .. })
        ));
    }

    #[test]
    fn status_envelope_matches_the_wire() {
        let wire = serde_json::to_string(&AnalysisType::LogisticRegression {}).unwrap();
        assert_eq!(wire, "{\"LogisticRegression\":{}}");
    }
}
