//! Write dispatcher
//!
//! Applies client writes to the session one at a time, in submission order.
//! Each write borrows the session through a lease, so it never runs while a
//! reconnect is in progress; a write that arrives during a reconnect waits
//! for the new session until its timeout runs out.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uabridge_core::{Value, WriteError, WriteRequest, WriteResult};
use uabridge_protocol::ProtocolError;

use crate::session::{LeaseError, SessionWatcher};
use crate::subscription::PointTable;

pub struct WriteDispatcher {
    watcher: SessionWatcher,
    points: PointTable,
    write_timeout: Duration,
    cancel: CancellationToken,
    serial: Mutex<()>,
}

impl WriteDispatcher {
    pub fn new(
        watcher: SessionWatcher,
        points: PointTable,
        write_timeout: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            watcher,
            points,
            write_timeout,
            cancel,
            serial: Mutex::new(()),
        })
    }

    /// Apply one write and report the outcome
    pub async fn dispatch(&self, request: WriteRequest) -> WriteResult {
        let _serial = self.serial.lock().await;
        match self.apply(&request).await {
            Ok(()) => {
                debug!("Write to {} from {} applied", request.node_id, request.origin);
                WriteResult::applied(&request)
            }
            Err(e) => {
                warn!(
                    "Write to {} from {} failed: {}",
                    request.node_id, request.origin, e
                );
                WriteResult::failed(&request, e)
            }
        }
    }

    /// Coerce the value to the node's last known type
    fn prepare(&self, request: &WriteRequest) -> Result<Value, WriteError> {
        let points = self.points.read();
        let point = points
            .get(&request.node_id)
            .ok_or_else(|| WriteError::UnknownNode(request.node_id.clone()))?;

        match point.known_kind() {
            None => Ok(request.value.clone()),
            Some(kind) => request
                .value
                .coerce_to(kind)
                .ok_or_else(|| WriteError::TypeMismatch {
                    node_id: request.node_id.clone(),
                    expected: kind,
                    found: request.value.kind(),
                }),
        }
    }

    async fn apply(&self, request: &WriteRequest) -> Result<(), WriteError> {
        if self.cancel.is_cancelled() {
            return Err(WriteError::Cancelled);
        }
        let value = self.prepare(request)?;
        let deadline = Instant::now() + self.write_timeout;
        let mut min_generation = 0;

        loop {
            let lease = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(WriteError::Cancelled),
                lease = self.watcher.lease(min_generation, deadline) => match lease {
                    Ok(lease) => lease,
                    Err(LeaseError::Timeout) | Err(LeaseError::Closed) => {
                        return Err(WriteError::SessionUnavailable)
                    }
                },
            };

            let written = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(WriteError::Cancelled),
                written = timeout_at(
                    deadline,
                    lease.session().write(&request.node_id, value.clone()),
                ) => written,
            };

            match written {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(ProtocolError::SessionClosed(_))) | Ok(Err(ProtocolError::Unreachable(_))) => {
                    // Wait for the session after this one
                    min_generation = lease.generation() + 1;
                    info!(
                        "Write to {} hit a dead session (generation {}), waiting for reconnect",
                        request.node_id,
                        lease.generation()
                    );
                    drop(lease);
                }
                Ok(Err(ProtocolError::BadNodeId(node))) => return Err(WriteError::UnknownNode(node)),
                Ok(Err(ProtocolError::TypeMismatch(detail))) => {
                    return Err(WriteError::ServerTypeMismatch {
                        node_id: request.node_id.clone(),
                        detail,
                    })
                }
                Ok(Err(ProtocolError::Timeout)) | Err(_) => {
                    return Err(WriteError::Timeout(self.write_timeout))
                }
                Ok(Err(e)) => return Err(WriteError::Rejected(e.to_string())),
            }
        }
    }

    /// Dispatch requests until the channel closes or the dispatcher is
    /// cancelled. Requests still queued at that point fail as cancelled.
    pub async fn run(
        self: Arc<Self>,
        mut requests: mpsc::Receiver<WriteRequest>,
        results: mpsc::Sender<WriteResult>,
    ) {
        loop {
            let request = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            let result = self.dispatch(request).await;
            if results.send(result).await.is_err() {
                break;
            }
        }

        requests.close();
        while let Ok(request) = requests.try_recv() {
            let _ = results
                .send(WriteResult::failed(&request, WriteError::Cancelled))
                .await;
        }
        debug!("Write dispatcher exiting");
    }
}
