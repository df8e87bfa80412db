//! Subscription engine
//!
//! Creates one subscription per session generation, attaches a monitored
//! item per configured node and turns every data change into an [`Event`].
//! After a reconnect the subscription is created again on the new session.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uabridge_core::{DataChange, Event, MonitoredPoint, NodeId};
use uabridge_protocol::{MonitoredItemRequest, SubscriptionParams};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::config::BridgeConfig;
use crate::error::SubscriptionError;
use crate::session::{SessionHandle, SessionWatcher};

/// Configured points by node id, shared with the write dispatcher
pub type PointTable = Arc<RwLock<HashMap<NodeId, MonitoredPoint>>>;

pub fn point_table(points: impl IntoIterator<Item = MonitoredPoint>) -> PointTable {
    Arc::new(RwLock::new(
        points
            .into_iter()
            .map(|p| (p.node_id.clone(), p))
            .collect(),
    ))
}

/// Subscription engine parameters
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub params: SubscriptionParams,
    pub sampling_interval: Duration,
    pub queue_size: u32,
    pub discard_oldest: bool,
    pub request_timeout: Duration,
    pub retry: BackoffPolicy,
}

impl EngineSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            params: config.subscription_params(),
            sampling_interval: config.sampling_interval(),
            queue_size: config.subscription.queue_size,
            discard_oldest: config.subscription.discard_oldest,
            request_timeout: config.subscription_timeout(),
            retry: config.reconnect.clone(),
        }
    }
}

/// A subscription created on one session
#[derive(Debug)]
pub struct SubscriptionHandle {
    pub id: u32,
    pub generation: u64,
    pub revised_publishing_interval: Duration,
    /// Nodes with a live monitored item
    pub monitored: Vec<NodeId>,
    /// Nodes the server refused, with its status
    pub rejected: Vec<(NodeId, String)>,
    notifications: mpsc::UnboundedReceiver<DataChange>,
}

/// Outcome of the latest subscription attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ReadyState {
    Pending,
    Ready { generation: u64, monitored: usize },
    Failed(SubscriptionError),
}

pub struct SubscriptionEngine {
    watcher: SessionWatcher,
    points: PointTable,
    settings: EngineSettings,
    /// Nodes of the active subscription; empty while there is none
    active: Arc<RwLock<HashSet<NodeId>>>,
    ready_tx: watch::Sender<ReadyState>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionEngine {
    pub fn new(watcher: SessionWatcher, points: PointTable, settings: EngineSettings) -> Arc<Self> {
        let (ready_tx, _) = watch::channel(ReadyState::Pending);
        Arc::new(Self {
            watcher,
            points,
            settings,
            active: Arc::new(RwLock::new(HashSet::new())),
            ready_tx,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    /// Node ids currently monitored
    pub fn monitored(&self) -> Vec<NodeId> {
        let mut ids: Vec<_> = self.active.read().iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Create a subscription on `session` monitoring `node_ids`.
    ///
    /// Nodes the server rejects are logged and left out; the call only
    /// fails when no node could be monitored at all.
    pub async fn create_subscription(
        &self,
        session: &SessionHandle,
        node_ids: &[NodeId],
        publishing_interval: Duration,
    ) -> Result<SubscriptionHandle, SubscriptionError> {
        let request_timeout = self.settings.request_timeout;
        let ua = session.session();
        let params = SubscriptionParams {
            publishing_interval,
            ..self.settings.params.clone()
        };

        let raw = timeout(request_timeout, ua.create_subscription(&params))
            .await
            .map_err(|_| SubscriptionError::Timeout(request_timeout))?
            .map_err(SubscriptionError::Create)?;

        let items: Vec<MonitoredItemRequest> = node_ids
            .iter()
            .map(|node_id| MonitoredItemRequest {
                node_id: node_id.clone(),
                sampling_interval: self.settings.sampling_interval,
                queue_size: self.settings.queue_size,
                discard_oldest: self.settings.discard_oldest,
            })
            .collect();

        let results = match timeout(request_timeout, ua.create_monitored_items(raw.id, &items)).await
        {
            Ok(Ok(results)) => results,
            Ok(Err(e)) => {
                let _ = ua.delete_subscription(raw.id).await;
                return Err(SubscriptionError::MonitoredItems(e));
            }
            Err(_) => {
                let _ = ua.delete_subscription(raw.id).await;
                return Err(SubscriptionError::Timeout(request_timeout));
            }
        };

        let mut monitored = Vec::new();
        let mut rejected = Vec::new();
        for result in results {
            match result.status {
                Ok(_) => monitored.push(result.node_id),
                Err(status) => {
                    warn!("Node {} not monitored: {}", result.node_id, status);
                    rejected.push((result.node_id, status));
                }
            }
        }

        if monitored.is_empty() {
            let _ = ua.delete_subscription(raw.id).await;
            return Err(SubscriptionError::NoMonitoredItems);
        }

        info!(
            "Subscription {} created on generation {}: {} monitored, {} rejected, publishing every {:?}",
            raw.id,
            session.generation(),
            monitored.len(),
            rejected.len(),
            raw.revised_publishing_interval
        );

        Ok(SubscriptionHandle {
            id: raw.id,
            generation: session.generation(),
            revised_publishing_interval: raw.revised_publishing_interval,
            monitored,
            rejected,
            notifications: raw.notifications,
        })
    }

    /// Start producing events into `events`. Subsequent calls are ignored;
    /// fails once the engine has been stopped.
    pub fn spawn(self: &Arc<Self>, events: mpsc::Sender<Event>) -> Result<(), SubscriptionError> {
        let mut task = self.task.lock();
        if self.cancel.is_cancelled() {
            return Err(SubscriptionError::Stopped);
        }
        if task.is_none() {
            let engine = Arc::clone(self);
            *task = Some(tokio::spawn(async move { engine.run(events).await }));
        }
        Ok(())
    }

    /// Wait for the outcome of the first subscription attempt
    pub async fn wait_ready(&self) -> Result<u64, SubscriptionError> {
        let mut rx = self.ready_tx.subscribe();
        loop {
            match &*rx.borrow_and_update() {
                ReadyState::Ready { generation, .. } => return Ok(*generation),
                ReadyState::Failed(e) => return Err(e.clone()),
                ReadyState::Pending => {}
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(SubscriptionError::Stopped),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(SubscriptionError::SessionUnavailable);
                    }
                }
            }
        }
    }

    async fn run(self: Arc<Self>, events: mpsc::Sender<Event>) {
        let node_ids: Vec<NodeId> = {
            let points = self.points.read();
            let mut ids: Vec<_> = points.keys().cloned().collect();
            ids.sort();
            ids
        };
        let mut retry = Backoff::new(self.settings.retry.clone());
        let mut next_generation = 1;

        loop {
            let session = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                session = self.watcher.wait_active(next_generation) => match session {
                    Some(session) => session,
                    None => break,
                },
            };

            let created = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                created = self.create_subscription(
                    &session,
                    &node_ids,
                    self.settings.params.publishing_interval,
                ) => created,
            };

            let mut subscription = match created {
                Ok(subscription) => subscription,
                Err(e) => {
                    let delay = retry.next_delay();
                    error!(
                        "Subscription on generation {} failed: {}; retrying in {:?}",
                        session.generation(),
                        e,
                        delay
                    );
                    self.ready_tx.send_replace(ReadyState::Failed(e));
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    // Retry on the current session, or the next one if it died meanwhile
                    next_generation = self.watcher.generation().max(next_generation);
                    continue;
                }
            };
            retry.reset();
            next_generation = session.generation() + 1;

            *self.active.write() = subscription.monitored.iter().cloned().collect();
            self.ready_tx.send_replace(ReadyState::Ready {
                generation: subscription.generation,
                monitored: subscription.monitored.len(),
            });

            let cancelled = self.pump(&mut subscription, &events).await;
            self.active.write().clear();

            if cancelled {
                let ua = session.session();
                match timeout(self.settings.request_timeout, ua.delete_subscription(subscription.id))
                    .await
                {
                    Ok(Ok(())) => debug!("Subscription {} deleted", subscription.id),
                    Ok(Err(e)) => debug!("Subscription {} not deleted: {}", subscription.id, e),
                    Err(_) => warn!("Timed out deleting subscription {}", subscription.id),
                }
                break;
            }
            info!(
                "Subscription {} ended with generation {}",
                subscription.id, subscription.generation
            );
        }
        debug!("Subscription engine exiting");
    }

    /// Forward notifications until the stream ends (false) or the engine is
    /// cancelled (true)
    async fn pump(
        &self,
        subscription: &mut SubscriptionHandle,
        events: &mpsc::Sender<Event>,
    ) -> bool {
        loop {
            let change = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return true,
                change = subscription.notifications.recv() => match change {
                    Some(change) => change,
                    None => return false,
                },
            };

            let Some(event) = self.normalize(change) else {
                continue;
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return true,
                sent = events.send(event) => {
                    if sent.is_err() {
                        debug!("Event consumer gone");
                        return true;
                    }
                }
            }
        }
    }

    /// Map a raw change to an event. Changes for nodes outside the active
    /// subscription yield nothing.
    fn normalize(&self, change: DataChange) -> Option<Event> {
        if !self.active.read().contains(&change.node_id) {
            debug!("Dropping change for unmonitored node {}", change.node_id);
            return None;
        }

        let timestamp = change
            .server_timestamp
            .or(change.source_timestamp)
            .unwrap_or_else(Utc::now);

        let mut points = self.points.write();
        let point = points.get_mut(&change.node_id)?;
        point.last_value = Some(change.value.clone());
        point.last_timestamp = Some(timestamp);

        Some(Event {
            node_id: change.node_id,
            display_name: point.display_name.clone(),
            value: change.value,
            timestamp,
        })
    }

    /// Stop producing events and delete the subscription. Idempotent; no
    /// event is sent after this returns.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}
