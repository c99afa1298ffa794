//! The dispatcher binding experiments, workers, and connections together.
//!
//! A [`Runner`] owns the local experiment map, the worker [`Registry`], and
//! the optional upstream coordinator connection. Every node in a deployment
//! runs the same `Runner`; its role follows from the lifecycle operations
//! invoked on it:
//!
//! - [`launch_listener`](Runner::launch_listener) accepts inbound
//!   connections and runs one handler loop per connection (coordinator).
//! - [`register_with`](Runner::register_with) connects upstream, advertises
//!   the local experiment names, and then serves `RunTrial` requests pushed
//!   over that connection (worker).
//! - [`set_remote`](Runner::set_remote) installs an upstream connection so
//!   that [`run_trial`](Runner::run_trial) and [`run_batch`](Runner::run_batch)
//!   tunnel through it (client).
//!
//! # Dispatch rules
//!
//! `run_trial` samples the experiment's inputs locally and then resolves the
//! trial end-to-end: against an explicit worker connection, through the
//! upstream remote, or by executing the child process in place. `run_batch`
//! fans one trial out to every registered worker advertising the name,
//! concurrently; it always waits for every dispatch to finish, reaps every
//! worker whose exchange failed, and never lets one failure short-circuit
//! the rest.
//!
//! # Shared state
//!
//! The experiment map, the registry, and the remote handle are guarded by
//! short-lived synchronous locks that are never held across a suspension
//! point. The per-connection async mutex inside [`SharedConnection`] is the
//! one lock held across awaits, scoped to a single request/response
//! exchange; that is the borrow discipline that keeps one in-flight message
//! per direction per connection.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use futures::future::join_all;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::executor::exec_trial;
use crate::experiment::{Experiment, Sample};
use crate::protocol::{Connection, Message, ProtocolError, SharedConnection};
use crate::registry::Registry;
use crate::trial::{ErrorKind, Trial, TrialStatus};

/// Fatal configuration errors raised while assembling a node.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("can't add an experiment without a name")]
    EmptyExperimentName,
    #[error("experiment already added: {0:?}")]
    DuplicateExperiment(String),
}

#[derive(Default)]
pub struct Runner {
    experiments: Mutex<BTreeMap<String, Experiment>>,
    registry: Mutex<Registry>,
    remote: Mutex<Option<SharedConnection>>,
}

impl Runner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an experiment, indexed by name. An empty or duplicate name is a
    /// fatal configuration error.
    pub fn add_experiment(&self, exp: Experiment) -> Result<(), ConfigError> {
        if exp.name.is_empty() {
            return Err(ConfigError::EmptyExperimentName);
        }
        info!(experiment = %exp.name, "adding experiment");
        let mut experiments = self.experiments.lock().unwrap();
        if experiments.contains_key(&exp.name) {
            return Err(ConfigError::DuplicateExperiment(exp.name));
        }
        experiments.insert(exp.name.clone(), exp);
        Ok(())
    }

    /// The names of the local experiments, sorted.
    pub fn experiment_names(&self) -> Vec<String> {
        self.experiments.lock().unwrap().keys().cloned().collect()
    }

    /// A copy of one local experiment definition.
    pub fn experiment(&self, name: &str) -> Option<Experiment> {
        self.experiments.lock().unwrap().get(name).cloned()
    }

    /// Installs the upstream coordinator connection used by `run_trial` and
    /// `run_batch` when no explicit target is given.
    pub fn set_remote(&self, conn: Connection) -> SharedConnection {
        let shared = conn.into_shared();
        *self.remote.lock().unwrap() = Some(shared.clone());
        shared
    }

    pub fn remote(&self) -> Option<SharedConnection> {
        self.remote.lock().unwrap().clone()
    }

    /// The number of currently registered workers.
    pub fn worker_count(&self) -> usize {
        self.registry.lock().unwrap().len()
    }

    /// Samples the experiment's inputs into a fresh trial. An unknown name
    /// yields a terminal `UnknownExperiment` trial and no experiment.
    fn prepare_trial(&self, name: &str) -> (Trial, Option<Experiment>) {
        let mut experiments = self.experiments.lock().unwrap();
        match experiments.get_mut(name) {
            Some(exp) => {
                let sample = exp.input.sample();
                debug!(experiment = %name, ?sample, "sampled trial inputs");
                (Trial::new(name, sample), Some(exp.clone()))
            }
            None => {
                let trial = Trial::new(name, Sample::new()).status(TrialStatus::Error(
                    ErrorKind::UnknownExperiment {
                        name: name.to_string(),
                    },
                ));
                (trial, None)
            }
        }
    }

    /// Resolves one trial end-to-end: through the upstream remote when one
    /// is installed, locally otherwise. The returned trial is terminal.
    pub async fn run_trial(&self, name: &str) -> Result<Trial> {
        info!(experiment = %name, "running trial");
        match self.remote() {
            Some(remote) => self.run_trial_on(name, &remote).await,
            None => Ok(self.run_trial_local(name).await),
        }
    }

    /// Samples locally, then forwards the trial over `conn` and awaits the
    /// `TrialDone` reply. Transport failures and protocol violations
    /// propagate to the caller; `run_batch` uses them to reap the worker.
    pub async fn run_trial_on(&self, name: &str, conn: &SharedConnection) -> Result<Trial> {
        let (trial, exp) = self.prepare_trial(name);
        if exp.is_none() {
            return Ok(trial);
        }

        let mut conn = conn.lock().await;
        debug!(experiment = %name, peer = %conn.peer(), "forwarding trial");
        match conn.request(&Message::RunTrial { trial }).await? {
            Message::TrialDone { trial } => Ok(trial),
            other => Err(ProtocolError::Unexpected(other.tag()).into()),
        }
    }

    async fn run_trial_local(&self, name: &str) -> Trial {
        let (trial, exp) = self.prepare_trial(name);
        match exp {
            Some(exp) => self.exec_with_exception_guard(&exp, trial).await,
            None => trial,
        }
    }

    /// Executes locally; an internal fault becomes a terminal `Exception`
    /// status instead of unwinding.
    async fn exec_with_exception_guard(&self, exp: &Experiment, trial: Trial) -> Trial {
        let fallback = trial.clone();
        match exec_trial(exp, trial).await {
            Ok(done) => done,
            Err(err) => {
                warn!(experiment = %exp.name, error = %err, "trial raised an internal fault");
                fallback.exception(&*err)
            }
        }
    }

    /// Runs one batch of `name`: through the upstream remote when one is
    /// installed, otherwise by fanning one trial out to every registered
    /// worker advertising the name.
    ///
    /// Results arrive in no particular order. Workers whose exchange failed
    /// are removed from the registry after every dispatch has finished.
    pub async fn run_batch(&self, name: &str) -> Result<Vec<Trial>> {
        if let Some(remote) = self.remote() {
            let mut conn = remote.lock().await;
            debug!(experiment = %name, peer = %conn.peer(), "tunneling batch upstream");
            return match conn
                .request(&Message::RunBatch {
                    experiment_name: name.to_string(),
                })
                .await?
            {
                Message::BatchDone { trials, .. } => Ok(trials),
                other => Err(ProtocolError::Unexpected(other.tag()).into()),
            };
        }

        let workers = self.registry.lock().unwrap().lookup(name);
        info!(experiment = %name, workers = workers.len(), "dispatching batch");

        let dispatches = workers.into_iter().map(|(id, conn)| async move {
            (id, self.run_trial_on(name, &conn).await)
        });
        let results = join_all(dispatches).await;

        let mut trials = Vec::with_capacity(results.len());
        let mut dead = Vec::new();
        for (id, result) in results {
            match result {
                Ok(trial) => trials.push(trial),
                Err(err) => {
                    warn!(worker = id, error = %err, "reaping worker after failed dispatch");
                    dead.push(id);
                }
            }
        }
        if !dead.is_empty() {
            self.registry.lock().unwrap().remove_bulk(&dead);
        }
        Ok(trials)
    }

    /// Dispatches one inbound message. Returns the connection back when the
    /// handler loop should keep reading from it; after `Register` the
    /// connection has moved into the registry and `None` is returned. A
    /// message that is not expected from a requester is a protocol
    /// violation and closes the connection.
    pub async fn handle_request(
        &self,
        mut conn: Connection,
        msg: Message,
    ) -> Result<Option<Connection>> {
        match msg {
            Message::RunTrial { trial } => {
                let name = trial.input.experiment_name.clone();
                let exp = self.experiments.lock().unwrap().get(&name).cloned();
                let trial = match exp {
                    Some(exp) => self.exec_with_exception_guard(&exp, trial).await,
                    None => {
                        debug!(experiment = %name, "trial names an unknown experiment");
                        trial.status(TrialStatus::Error(ErrorKind::UnknownExperiment { name }))
                    }
                };
                conn.send(&Message::TrialDone { trial }).await?;
                Ok(Some(conn))
            }
            Message::Register { experiments } => {
                self.registry.lock().unwrap().register(conn, experiments);
                Ok(None)
            }
            Message::RunBatch { experiment_name } => {
                let trials = self.run_batch(&experiment_name).await?;
                conn.send(&Message::BatchDone {
                    experiment_name,
                    trials,
                })
                .await?;
                Ok(Some(conn))
            }
            other => Err(ProtocolError::Unexpected(other.tag()).into()),
        }
    }

    /// Reads requests from `conn` until the peer closes, the connection is
    /// registered as a worker, or a request fails.
    pub async fn handle_connection(&self, mut conn: Connection) -> Result<()> {
        loop {
            let Some(msg) = conn.recv().await? else {
                return Ok(());
            };
            match self.handle_request(conn, msg).await? {
                Some(unmoved) => conn = unmoved,
                None => return Ok(()),
            }
        }
    }

    /// Binds `host:port` and accepts connections in a background task, one
    /// handler loop per connection. Returns the bound address.
    pub async fn launch_listener(self: Arc<Self>, host: &str, port: u16) -> Result<SocketAddr> {
        let listener = TcpListener::bind((host, port)).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "listening for workers and clients");

        let runner = self;
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        info!(%peer, "accepted connection");
                        let runner = Arc::clone(&runner);
                        tokio::spawn(async move {
                            if let Err(err) =
                                runner.handle_connection(Connection::new(socket)).await
                            {
                                warn!(%peer, error = %err, "closing connection");
                            }
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                    }
                }
            }
        });
        Ok(addr)
    }

    /// Opens an outbound connection to a coordinator.
    pub async fn connect_to(host: &str, port: u16) -> Result<Connection> {
        Connection::connect(host, port).await
    }

    /// Connects upstream, registers the local experiment names, and serves
    /// `RunTrial` requests on that connection until the coordinator closes
    /// it.
    pub async fn register_with(&self, host: &str, port: u16) -> Result<()> {
        let mut conn = Connection::connect(host, port).await?;
        let experiments = self.experiment_names();
        info!(host, port, ?experiments, "registering with upstream coordinator");
        conn.send(&Message::Register { experiments }).await?;
        self.handle_connection(conn).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_experiment(name: &str) -> Experiment {
        Experiment::default().name(name).cmd([
            "sh",
            "-c",
            "echo '{\"preds\":{\"p\":true},\"aux\":{},\"replicate\":null}'",
        ])
    }

    #[test]
    fn empty_experiment_name_is_rejected() {
        let runner = Runner::new();
        assert!(matches!(
            runner.add_experiment(Experiment::default()),
            Err(ConfigError::EmptyExperimentName)
        ));
    }

    #[test]
    fn duplicate_experiment_name_is_rejected() {
        let runner = Runner::new();
        runner.add_experiment(echo_experiment("demo")).unwrap();
        assert!(matches!(
            runner.add_experiment(echo_experiment("demo")),
            Err(ConfigError::DuplicateExperiment(name)) if name == "demo"
        ));
    }

    #[tokio::test]
    async fn local_trial_runs_to_completion() {
        let runner = Runner::new();
        runner.add_experiment(echo_experiment("demo")).unwrap();
        let trial = runner.run_trial("demo").await.unwrap();
        let output = trial.output().expect("trial should be complete");
        assert_eq!(output.preds.get("p"), Some(&true));
    }

    #[tokio::test]
    async fn unknown_experiment_yields_a_terminal_trial() {
        let runner = Runner::new();
        let trial = runner.run_trial("nope").await.unwrap();
        assert_eq!(
            trial.status,
            TrialStatus::Error(ErrorKind::UnknownExperiment {
                name: "nope".to_string()
            })
        );
    }

    #[tokio::test]
    async fn batch_with_no_workers_is_empty() {
        let runner = Runner::new();
        runner.add_experiment(echo_experiment("demo")).unwrap();
        let trials = runner.run_batch("demo").await.unwrap();
        assert!(trials.is_empty());
    }
}
