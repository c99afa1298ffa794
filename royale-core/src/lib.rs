//! Distributed experiment-execution engine.
//!
//! Royale dispatches *trials* (one sampled parameter assignment of a named
//! *experiment*) to a pool of registered worker processes, collects the
//! results, and optionally feeds them through an analysis stage.
//!
//! # Semantic Overview
//!
//! - [`Experiment`](experiment::Experiment): a named, reproducible recipe for
//!   producing trials. It pairs a child-process command line with an
//!   [`InputSpec`](experiment::InputSpec), a mapping from input names to
//!   sampling generators.
//! - [`ValueSpec`](spec::ValueSpec): a sampling generator producing a
//!   [`Value`](value::Value) (number or string) on demand. Generators may be
//!   seeded for reproducibility.
//! - [`Trial`](trial::Trial): the unit of work. A trial carries the
//!   experiment name, one concrete input sample, and a status that moves from
//!   `Created` through `InProgress` into exactly one of the terminal states
//!   `Complete` or `Error`.
//! - [`Runner`](runner::Runner): the orchestrator. It owns the local
//!   experiment map, the [`Registry`](registry::Registry) of live workers,
//!   and the optional upstream coordinator connection, and implements
//!   `run_trial`, `run_batch`, and the per-connection request handler loop.
//!
//! # Topology
//!
//! Every node runs the same [`Runner`](runner::Runner); roles emerge from
//! which lifecycle operations are invoked:
//!
//! - A *coordinator* calls [`launch_listener`](runner::Runner::launch_listener)
//!   and accepts workers and clients.
//! - A *worker* calls [`register_with`](runner::Runner::register_with),
//!   advertising its local experiment names, and then serves `RunTrial`
//!   requests pushed over that same connection.
//! - A *client* connects, installs the connection as its
//!   [`remote`](runner::Runner::set_remote), and tunnels `run_trial` /
//!   `run_batch` calls through the coordinator.
//!
//! Messages are single JSON documents framed over a length-delimited TCP
//! stream; see [`protocol`] for the wire format.

pub mod analysis;
pub mod executor;
pub mod experiment;
pub mod protocol;
pub mod registry;
pub mod runner;
pub mod spec;
pub mod trial;
pub mod value;

pub use analysis::{Analysis, AnalysisStatus, AnalysisType};
pub use experiment::{Experiment, InputSpec, Sample};
pub use protocol::{Connection, Message, SharedConnection};
pub use registry::{Registry, WorkerId};
pub use runner::Runner;
pub use spec::ValueSpec;
pub use trial::{ErrorKind, Trial, TrialInput, TrialOutput, TrialStatus};
pub use value::Value;
