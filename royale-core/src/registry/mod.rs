//! The coordinator's worker registry.
//!
//! Two coupled structures: a map of worker records keyed by a stable
//! [`WorkerId`], and a multimap from experiment name to the ids of every
//! worker advertising that name. Ids stay valid across registrations and
//! across removals of other workers.
//!
//! The registry owns its worker records. A record holds the registered
//! connection behind a [`SharedConnection`]; lookups hand out clones of the
//! handle so that a dispatch in flight survives the worker being reaped
//! concurrently. The structural invariant is that every multimap entry
//! points at a live record.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::protocol::{Connection, SharedConnection};

/// A stable handle to a registered worker.
pub type WorkerId = u64;

struct WorkerRecord {
    conn: SharedConnection,
    experiments: Vec<String>,
}

#[derive(Default)]
pub struct Registry {
    workers: HashMap<WorkerId, WorkerRecord>,
    index: HashMap<String, Vec<WorkerId>>,
    next_id: WorkerId,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a worker connection advertising `experiments` and returns its
    /// stable id.
    pub fn register(&mut self, conn: Connection, experiments: Vec<String>) -> WorkerId {
        let id = self.next_id;
        self.next_id += 1;

        info!(worker = id, peer = %conn.peer(), ?experiments, "registering worker");
        for name in &experiments {
            self.index.entry(name.clone()).or_default().push(id);
        }
        self.workers.insert(
            id,
            WorkerRecord {
                conn: conn.into_shared(),
                experiments,
            },
        );
        id
    }

    /// Every worker advertising `name`, in registration order.
    pub fn lookup(&self, name: &str) -> Vec<(WorkerId, SharedConnection)> {
        self.index
            .get(name)
            .into_iter()
            .flatten()
            .map(|id| (*id, self.workers[id].conn.clone()))
            .collect()
    }

    /// Drops a worker and every index entry pointing at it.
    pub fn remove(&mut self, id: WorkerId) {
        let Some(record) = self.workers.remove(&id) else {
            return;
        };
        debug!(worker = id, "removing worker from registry");
        for name in &record.experiments {
            if let Some(ids) = self.index.get_mut(name) {
                ids.retain(|other| *other != id);
                if ids.is_empty() {
                    self.index.remove(name);
                }
            }
        }
    }

    /// Drops several workers in one sweep.
    pub fn remove_bulk(&mut self, ids: &[WorkerId]) {
        for id in ids {
            self.remove(*id);
        }
    }

    pub fn contains(&self, id: WorkerId) -> bool {
        self.workers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn fresh_connection() -> Connection {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = tokio::spawn(async move { listener.accept().await.unwrap() });
        let stream = TcpStream::connect(addr).await.unwrap();
        // Keep the server half alive for the duration of the test by leaking
        // it into a detached task.
        tokio::spawn(async move {
            let (server, _) = accepted.await.unwrap();
            std::mem::forget(server);
        });
        Connection::new(stream)
    }

    #[tokio::test]
    async fn lookup_returns_only_matching_workers() {
        let mut registry = Registry::new();
        let w1 = registry.register(fresh_connection().await, vec!["a".into(), "b".into()]);
        let w2 = registry.register(fresh_connection().await, vec!["b".into()]);

        let a: Vec<_> = registry.lookup("a").into_iter().map(|(id, _)| id).collect();
        assert_eq!(a, [w1]);
        let b: Vec<_> = registry.lookup("b").into_iter().map(|(id, _)| id).collect();
        assert_eq!(b, [w1, w2]);
        assert!(registry.lookup("c").is_empty());
    }

    #[tokio::test]
    async fn removal_erases_every_index_entry() {
        let mut registry = Registry::new();
        let w1 = registry.register(fresh_connection().await, vec!["a".into(), "b".into()]);
        let w2 = registry.register(fresh_connection().await, vec!["b".into()]);

        registry.remove(w1);
        assert!(!registry.contains(w1));
        assert!(registry.lookup("a").is_empty());
        let b: Vec<_> = registry.lookup("b").into_iter().map(|(id, _)| id).collect();
        assert_eq!(b, [w2]);
    }

    #[tokio::test]
    async fn ids_stay_stable_across_other_removals() {
        let mut registry = Registry::new();
        let w1 = registry.register(fresh_connection().await, vec!["a".into()]);
        let w2 = registry.register(fresh_connection().await, vec!["a".into()]);
        let w3 = registry.register(fresh_connection().await, vec!["a".into()]);

        registry.remove_bulk(&[w1, w3]);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(w2));
        let a: Vec<_> = registry.lookup("a").into_iter().map(|(id, _)| id).collect();
        assert_eq!(a, [w2]);

        // A later registration never reuses a removed id.
        let w4 = registry.register(fresh_connection().await, vec!["a".into()]);
        assert!(w4 > w3);
    }

    #[tokio::test]
    async fn removing_an_unknown_id_is_a_no_op() {
        let mut registry = Registry::new();
        registry.remove(17);
        assert!(registry.is_empty());
    }
}
