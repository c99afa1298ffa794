//! Experiment definitions and their input specifications.
//!
//! An [`Experiment`] is immutable after load: a name, a child-process command
//! line with working directory and environment overrides, an optional
//! wall-clock timeout, and an [`InputSpec`] describing how to sample the
//! inputs of each trial.
//!
//! Construction is fluent; every setter returns the experiment for chaining,
//! and the `extend_*` methods append single entries to the environment or
//! input maps (a duplicate key overwrites):
//!
//! ```
//! use royale_core::experiment::Experiment;
//! use royale_core::spec::ValueSpec;
//!
//! let exp = Experiment::default()
//!     .name("demo")
//!     .cmd(["sh", "-c", "true"])
//!     .extend_env("ROOT", "/")
//!     .extend_input("x", ValueSpec::uniform(0.0, 1.0));
//! assert_eq!(exp.name, "demo");
//! ```

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::spec::ValueSpec;
use crate::value::Value;

/// One concrete input assignment, in the insertion order of the spec that
/// produced it.
pub type Sample = IndexMap<String, Value>;

/// A mapping from input names to sampling generators.
///
/// Iteration order is the order inputs were added (or appeared in the
/// serialized document), and [`sample`](InputSpec::sample) preserves it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputSpec {
    inputs: IndexMap<String, ValueSpec>,
}

impl InputSpec {
    pub fn new(inputs: IndexMap<String, ValueSpec>) -> Self {
        Self { inputs }
    }

    pub fn inputs(&self) -> &IndexMap<String, ValueSpec> {
        &self.inputs
    }

    /// Appends one entry; a duplicate key overwrites in place.
    pub fn insert(&mut self, name: impl Into<String>, spec: ValueSpec) {
        self.inputs.insert(name.into(), spec);
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Draws a fresh sample: one value per input, same key set, same order.
    pub fn sample(&mut self) -> Sample {
        self.inputs
            .iter_mut()
            .map(|(name, spec)| (name.clone(), spec.sample()))
            .collect()
    }
}

/// A named, reproducible recipe for producing trials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Experiment {
    pub name: String,
    pub version: String,
    /// Wall-clock bound on each trial's child process, in seconds. Zero
    /// means unbounded.
    pub timeout: f64,
    /// Working directory of the child process, relative to the coordinator's
    /// working directory.
    pub cd: String,
    /// argv of the child process; `cmd[0]` is resolved against the search
    /// path extended by `cd`.
    pub cmd: Vec<String>,
    /// Environment overrides, merged over the parent process environment.
    pub env: BTreeMap<String, String>,
    pub input: InputSpec,
}

impl Default for Experiment {
    fn default() -> Self {
        Self {
            name: String::new(),
            version: String::new(),
            timeout: 0.0,
            cd: ".".to_string(),
            cmd: Vec::new(),
            env: BTreeMap::new(),
            input: InputSpec::default(),
        }
    }
}

impl Experiment {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn timeout(mut self, seconds: f64) -> Self {
        self.timeout = seconds;
        self
    }

    pub fn cd(mut self, cd: impl Into<String>) -> Self {
        self.cd = cd.into();
        self
    }

    pub fn cmd<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cmd = cmd.into_iter().map(Into::into).collect();
        self
    }

    pub fn env<I, K, V>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = env
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    pub fn inputs(mut self, inputs: IndexMap<String, ValueSpec>) -> Self {
        self.input = InputSpec::new(inputs);
        self
    }

    /// Appends one environment entry; a duplicate key overwrites.
    pub fn extend_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Appends one input entry; a duplicate key overwrites.
    pub fn extend_input(mut self, name: impl Into<String>, spec: ValueSpec) -> Self {
        self.input.insert(name, spec);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_experiment() -> Experiment {
        Experiment::default()
            .name("test")
            .cmd(["ls", "-alh", "/"])
            .env([("PATH", "/bin:/usr/bin"), ("ROOT", "/")])
            .extend_env("A", "1")
            .extend_env("B", "2")
            .extend_input("x", ValueSpec::constant(42))
            .extend_input("hello", ValueSpec::constant("world"))
            .extend_input("uniform", ValueSpec::uniform(1.0, 10.5))
            .extend_input("pick0", ValueSpec::choose([]))
            .extend_input(
                "pick4",
                ValueSpec::choose([2, 4, 6, 8].map(ValueSpec::constant)),
            )
    }

    #[test]
    fn fluent_construction() {
        let exp = demo_experiment();
        assert_eq!(exp.name, "test");
        assert_eq!(exp.cmd, ["ls", "-alh", "/"]);
        assert_eq!(exp.env.len(), 4);
        assert_eq!(exp.env["PATH"], "/bin:/usr/bin");
        assert_eq!(exp.env["B"], "2");
        assert_eq!(exp.cd, ".");
    }

    #[test]
    fn duplicate_input_key_overwrites_in_place() {
        let mut exp = demo_experiment().extend_input("x", ValueSpec::constant(7));
        assert_eq!(exp.input.len(), 5);
        let sample = exp.input.sample();
        assert_eq!(sample["x"].as_number(), Ok(7.0));
        // Overwriting must not move the key to the back.
        assert_eq!(sample.get_index(0).unwrap().0, "x");
    }

    #[test]
    fn sample_preserves_key_set_and_order() {
        let mut exp = demo_experiment();
        let sample = exp.input.sample();
        let spec_keys: Vec<_> = exp.input.inputs().keys().cloned().collect();
        let sample_keys: Vec<_> = sample.keys().cloned().collect();
        assert_eq!(spec_keys, sample_keys);

        assert_eq!(sample["x"].as_number(), Ok(42.0));
        assert_eq!(sample["hello"].as_str(), Ok("world"));
        let uniform = sample["uniform"].as_number().unwrap();
        assert!((1.0..=10.5).contains(&uniform));
        assert_eq!(sample["pick0"].as_str(), Ok("<empty>"));
        let pick = sample["pick4"].as_number().unwrap();
        assert!([2.0, 4.0, 6.0, 8.0].contains(&pick));
    }

    #[test]
    fn input_spec_shorthand_parse() {
        let mut spec: InputSpec =
            serde_json::from_str("{\"x\": 3, \"y\": [1, 2], \"z\": [\"a\", \"b\"]}").unwrap();
        assert_eq!(spec.inputs()["x"].type_name(), "Constant");
        assert_eq!(spec.inputs()["y"].type_name(), "Uniform");
        assert_eq!(spec.inputs()["z"].type_name(), "Choose");

        let sample = spec.sample();
        assert_eq!(
            sample.keys().cloned().collect::<Vec<_>>(),
            ["x", "y", "z"]
        );
    }

    #[test]
    fn serialization_idempotent_after_one_round() {
        let exp = demo_experiment();
        let first = serde_json::to_string(&exp).unwrap();
        let reparsed: Experiment = serde_json::from_str(&first).unwrap();
        let second = serde_json::to_string(&reparsed).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn deserialized_experiment_defaults() {
        let exp: Experiment = serde_json::from_str("{\"name\": \"n\"}").unwrap();
        assert_eq!(exp.cd, ".");
        assert_eq!(exp.timeout, 0.0);
        assert!(exp.cmd.is_empty());
        assert!(exp.input.is_empty());
    }
}
