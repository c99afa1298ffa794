//! The coordinator/worker wire protocol.
//!
//! Every message is a single JSON document with a one-key envelope,
//! `{"<Tag>": <payload>}`, carried as one frame of a length-delimited TCP
//! stream. The transport only has to provide ordered, reliable,
//! message-framed duplex delivery; [`Connection`] supplies that with
//! [`LengthDelimitedCodec`] over a [`TcpStream`].
//!
//! Per connection, at most one request/response pair is in flight in each
//! direction at a time. Worker connections are shared as
//! [`SharedConnection`]; holding the lock for the duration of one
//! [`request`](Connection::request) is what enforces the discipline.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, trace};

use crate::trial::Trial;

/// One protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Coordinator to worker: execute this trial and report back.
    RunTrial { trial: Trial },
    /// Worker to coordinator: the trial reached a terminal state.
    TrialDone { trial: Trial },
    /// Worker to coordinator: these experiment names are available here.
    /// Registering ends the connection's role as a requester.
    Register { experiments: Vec<String> },
    /// Client to coordinator: dispatch one trial to every capable worker.
    RunBatch { experiment_name: String },
    /// Coordinator to client: the collected batch results.
    BatchDone {
        experiment_name: String,
        trials: Vec<Trial>,
    },
}

impl Message {
    pub fn tag(&self) -> &'static str {
        match self {
            Message::RunTrial { .. } => "RunTrial",
            Message::TrialDone { .. } => "TrialDone",
            Message::Register { .. } => "Register",
            Message::RunBatch { .. } => "RunBatch",
            Message::BatchDone { .. } => "BatchDone",
        }
    }
}

/// Protocol-level failures, distinct from transport I/O errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("connection closed while awaiting a reply")]
    ClosedMidRequest,
    #[error("unexpected message type: {0}")]
    Unexpected(&'static str),
}

/// A message-framed duplex connection to a peer.
pub struct Connection {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    peer: String,
}

/// A connection shared between the registry and in-flight dispatches.
pub type SharedConnection = Arc<Mutex<Connection>>;

impl Connection {
    /// Wraps an accepted socket.
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string());
        Self {
            framed: Framed::new(stream, LengthDelimitedCodec::new()),
            peer,
        }
    }

    /// Opens an outbound connection.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port))
            .await
            .with_context(|| format!("connecting to {host}:{port}"))?;
        Ok(Self::new(stream))
    }

    /// The peer address, for logging.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn into_shared(self) -> SharedConnection {
        Arc::new(Mutex::new(self))
    }

    /// Sends one message as one frame.
    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        debug!(peer = %self.peer, tag = msg.tag(), "sending message");
        let buf = serde_json::to_vec(msg)?;
        trace!(doc = %String::from_utf8_lossy(&buf), "message document");
        self.framed
            .send(Bytes::from(buf))
            .await
            .with_context(|| format!("sending {} to {}", msg.tag(), self.peer))?;
        Ok(())
    }

    /// Receives the next message; `None` on a clean close.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        match self.framed.next().await {
            None => {
                debug!(peer = %self.peer, "peer closed the connection");
                Ok(None)
            }
            Some(frame) => {
                let frame = frame.with_context(|| format!("reading from {}", self.peer))?;
                let msg: Message = serde_json::from_slice(&frame)
                    .with_context(|| format!("decoding message from {}", self.peer))?;
                debug!(peer = %self.peer, tag = msg.tag(), "received message");
                Ok(Some(msg))
            }
        }
    }

    /// One request/response exchange. A close before the reply is an error.
    pub async fn request(&mut self, msg: &Message) -> Result<Message> {
        self.send(msg).await?;
        self.recv()
            .await?
            .ok_or_else(|| ProtocolError::ClosedMidRequest.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::Sample;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            Connection::connect("127.0.0.1", addr.port()).await.unwrap()
        });
        let (server, _) = listener.accept().await.unwrap();
        (Connection::new(server), client.await.unwrap())
    }

    #[tokio::test]
    async fn messages_round_trip_in_order() {
        let (mut server, mut client) = connected_pair().await;

        client
            .send(&Message::Register {
                experiments: vec!["a".into(), "b".into()],
            })
            .await
            .unwrap();
        client
            .send(&Message::RunBatch {
                experiment_name: "a".into(),
            })
            .await
            .unwrap();

        match server.recv().await.unwrap().unwrap() {
            Message::Register { experiments } => assert_eq!(experiments, ["a", "b"]),
            other => panic!("unexpected message: {}", other.tag()),
        }
        match server.recv().await.unwrap().unwrap() {
            Message::RunBatch { experiment_name } => assert_eq!(experiment_name, "a"),
            other => panic!("unexpected message: {}", other.tag()),
        }
    }

    #[tokio::test]
    async fn request_pairs_a_send_with_the_reply() {
        let (mut server, mut client) = connected_pair().await;

        let serve = tokio::spawn(async move {
            let msg = server.recv().await.unwrap().unwrap();
            match msg {
                Message::RunTrial { trial } => {
                    server.send(&Message::TrialDone { trial }).await.unwrap()
                }
                other => panic!("unexpected message: {}", other.tag()),
            }
        });

        let trial = Trial::new("demo", Sample::new());
        let reply = client
            .request(&Message::RunTrial { trial })
            .await
            .unwrap();
        assert_eq!(reply.tag(), "TrialDone");
        serve.await.unwrap();
    }

    #[tokio::test]
    async fn close_before_reply_is_an_error() {
        let (server, mut client) = connected_pair().await;
        drop(server);
        let trial = Trial::new("demo", Sample::new());
        let err = client
            .request(&Message::RunTrial { trial })
            .await
            .expect_err("request against a closed peer must fail");
        // Either the send or the missing reply surfaces the failure,
        // depending on how fast the close propagates.
        let _ = err;
    }

    #[test]
    fn envelope_uses_the_wire_tags() {
        let wire = serde_json::to_string(&Message::RunBatch {
            experiment_name: "demo".into(),
        })
        .unwrap();
        assert_eq!(wire, "{\"RunBatch\":{\"experiment_name\":\"demo\"}}");
    }
}
