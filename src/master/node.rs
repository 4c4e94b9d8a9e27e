//! Single-threaded master authority.
//!
//! All mutation is concentrated in one task that owns the handler (index,
//! version source, store).  RPC handlers may run in parallel, but their
//! requests are serialized into one mpsc mailbox and handled to completion,
//! persistence included, before the next one starts.  Correctness of the
//! master is therefore sequential reasoning only; there is no locking.

use std::collections::BTreeMap;

use slog::{crit, info, Logger};
use tokio::sync::{mpsc, oneshot, watch};

use crate::grpc::proto::{Token, TokenQuery};
use crate::master::error::{MasterError, Result};
use crate::master::handler::MasterHandler;
use crate::storage::TokenStore;

/// Master lifecycle, published to the RPC layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MasterState {
    /// Rebuilding the index from the store; requests get a retryable error.
    Recovering,
    /// Serving requests.
    Serving,
    /// Recovery failed; the node is unusable.
    Failed,
}

enum MasterRequest {
    Group {
        prefix: String,
        group_suffix: String,
        reply: oneshot::Sender<Result<BTreeMap<String, i64>>>,
    },
    Query {
        queries: Vec<TokenQuery>,
        reply: oneshot::Sender<Result<Vec<Vec<Token>>>>,
    },
    Modify {
        updates: Vec<Token>,
        deletes: Vec<Token>,
        reply: oneshot::Sender<Result<Vec<Token>>>,
    },
    QueryAndOwn {
        owner: String,
        expiration_time: i64,
        query: TokenQuery,
        reply: oneshot::Sender<Result<Vec<Token>>>,
    },
    Archive {
        tokens: Vec<Token>,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Handle for submitting requests to the master task.
///
/// Cheap to clone; requests from all clones drain through the same FIFO
/// mailbox, which is what gives the master its total order.
#[derive(Clone)]
pub struct MasterHandle {
    tx: mpsc::UnboundedSender<MasterRequest>,
    state: watch::Receiver<MasterState>,
}

/// Start the master task on the given store.
///
/// Recovery runs on the task itself: the handle answers `NotReady` until
/// the index rebuild completes.  The task exits once every handle is
/// dropped, after finishing the in-flight request.
pub fn spawn(store: Box<dyn TokenStore>, log: Logger) -> MasterHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(MasterState::Recovering);

    tokio::task::spawn_blocking(move || run(store, rx, state_tx, log));

    MasterHandle { tx, state: state_rx }
}

fn run(
    store: Box<dyn TokenStore>,
    mut rx: mpsc::UnboundedReceiver<MasterRequest>,
    state_tx: watch::Sender<MasterState>,
    log: Logger,
) {
    let mut handler = match MasterHandler::recover(store, log.clone()) {
        Ok(handler) => handler,
        Err(e) => {
            // A failure here may mean a partially loaded index; serving in
            // that state is unsafe.
            crit!(log, "master recovery failed"; "error" => %e);
            let _ = state_tx.send(MasterState::Failed);
            return;
        }
    };
    let _ = state_tx.send(MasterState::Serving);
    info!(log, "master serving"; "tokens" => handler.token_count());

    while let Some(request) = rx.blocking_recv() {
        match request {
            MasterRequest::Group {
                prefix,
                group_suffix,
                reply,
            } => {
                let _ = reply.send(handler.group(&prefix, &group_suffix));
            }
            MasterRequest::Query { queries, reply } => {
                let _ = reply.send(handler.query(&queries));
            }
            MasterRequest::Modify {
                updates,
                deletes,
                reply,
            } => {
                let _ = reply.send(handler.modify(updates, deletes));
            }
            MasterRequest::QueryAndOwn {
                owner,
                expiration_time,
                query,
                reply,
            } => {
                let _ = reply.send(handler.query_and_own(&owner, expiration_time, &query));
            }
            MasterRequest::Archive { tokens, reply } => {
                let _ = reply.send(handler.archive(tokens));
            }
        }
    }
    info!(log, "master mailbox closed, exiting");
}

impl MasterHandle {
    pub fn state(&self) -> MasterState {
        *self.state.borrow()
    }

    /// Wait until the master leaves the recovering state.
    pub async fn wait_serving(&self) -> Result<()> {
        let mut state = self.state.clone();
        loop {
            match *state.borrow() {
                MasterState::Serving => return Ok(()),
                MasterState::Failed => {
                    return Err(MasterError::Unknown("master recovery failed".to_string()))
                }
                MasterState::Recovering => {}
            }
            if state.changed().await.is_err() {
                return Err(MasterError::Unknown("master task exited".to_string()));
            }
        }
    }

    fn check_serving(&self) -> Result<()> {
        match self.state() {
            MasterState::Serving => Ok(()),
            MasterState::Recovering => Err(MasterError::NotReady),
            MasterState::Failed => Err(MasterError::Unknown("master recovery failed".to_string())),
        }
    }

    async fn submit<T>(
        &self,
        request: MasterRequest,
        rx: oneshot::Receiver<Result<T>>,
    ) -> Result<T> {
        self.check_serving()?;
        self.tx
            .send(request)
            .map_err(|_| MasterError::Unknown("master task exited".to_string()))?;
        rx.await
            .map_err(|_| MasterError::Unknown("master task exited".to_string()))?
    }

    pub async fn group(
        &self,
        prefix: String,
        group_suffix: String,
    ) -> Result<BTreeMap<String, i64>> {
        let (reply, rx) = oneshot::channel();
        self.submit(
            MasterRequest::Group {
                prefix,
                group_suffix,
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn query(&self, queries: Vec<TokenQuery>) -> Result<Vec<Vec<Token>>> {
        let (reply, rx) = oneshot::channel();
        self.submit(MasterRequest::Query { queries, reply }, rx).await
    }

    pub async fn modify(&self, updates: Vec<Token>, deletes: Vec<Token>) -> Result<Vec<Token>> {
        let (reply, rx) = oneshot::channel();
        self.submit(
            MasterRequest::Modify {
                updates,
                deletes,
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn query_and_own(
        &self,
        owner: String,
        expiration_time: i64,
        query: TokenQuery,
    ) -> Result<Vec<Token>> {
        let (reply, rx) = oneshot::channel();
        self.submit(
            MasterRequest::QueryAndOwn {
                owner,
                expiration_time,
                query,
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn archive(&self, tokens: Vec<Token>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.submit(MasterRequest::Archive { tokens, reply }, rx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::EphemeralStore;
    use slog::{o, Discard};

    fn spawn_test_master() -> MasterHandle {
        let log = Logger::root(Discard, o!());
        spawn(Box::new(EphemeralStore::new()), log)
    }

    fn insert(name: &str) -> Token {
        Token {
            name: name.to_string(),
            data: b"x".to_vec(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_requests_serialize_through_mailbox() {
        let handle = spawn_test_master();
        handle.wait_serving().await.unwrap();

        // Fire a burst of concurrent inserts; every one must get a distinct
        // version even though the senders race.
        let mut tasks = Vec::new();
        for i in 0..20 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                handle
                    .modify(vec![insert(&format!("/burst/{:02}", i))], vec![])
                    .await
                    .unwrap()
                    .remove(0)
                    .version
            }));
        }
        let mut versions = Vec::new();
        for task in tasks {
            versions.push(task.await.unwrap());
        }
        versions.sort_unstable();
        versions.dedup();
        assert_eq!(versions.len(), 20);
    }

    #[tokio::test]
    async fn test_query_after_modify() {
        let handle = spawn_test_master();
        handle.wait_serving().await.unwrap();

        handle
            .modify(vec![insert("/a/1"), insert("/a/2")], vec![])
            .await
            .unwrap();
        let results = handle
            .query(vec![TokenQuery {
                name_prefix: "/a/".to_string(),
                max_tokens: 1,
            }])
            .await
            .unwrap();
        assert_eq!(results[0].len(), 1);
        assert_eq!(results[0][0].name, "/a/1");
    }
}
