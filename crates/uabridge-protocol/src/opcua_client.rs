//! OPC UA client over the `opcua` crate
//!
//! The 0.12 client API is blocking, so every service call runs on the
//! blocking pool. Subscription callbacks feed the same unbounded channels the
//! simulated server uses, keyed back to the configured node id through the
//! monitored item's client handle.

use async_trait::async_trait;
use opcua::client::prelude::*;
use opcua::sync::RwLock as UaRwLock;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uabridge_core::{
    ApplicationIdentity, DataChange, Endpoint, Identity, SecurityMode, ServerDescription, Value,
};

use crate::error::{ProtocolError, Result};
use crate::traits::{
    CloseReason, ConnectRequest, MonitoredItemRequest, MonitoredItemResult, RawSubscription,
    SubscriptionParams, UaClient, UaSession,
};

/// Run a blocking client call off the async workers
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ProtocolError::Other(format!("client task failed: {}", e)))?
}

/// Map a failed service call
fn service_error(status: StatusCode) -> ProtocolError {
    if status == StatusCode::BadTimeout {
        ProtocolError::Timeout
    } else if status == StatusCode::BadSessionClosed
        || status == StatusCode::BadSessionIdInvalid
        || status == StatusCode::BadNotConnected
        || status == StatusCode::BadConnectionClosed
        || status == StatusCode::BadCommunicationError
    {
        ProtocolError::SessionClosed(status.to_string())
    } else {
        ProtocolError::Other(status.to_string())
    }
}

fn security_mode(mode: MessageSecurityMode) -> SecurityMode {
    match mode {
        MessageSecurityMode::Sign => SecurityMode::Sign,
        MessageSecurityMode::SignAndEncrypt => SecurityMode::SignAndEncrypt,
        _ => SecurityMode::None,
    }
}

fn endpoint_key(url: &str, mode: SecurityMode, policy: &str) -> String {
    format!("{}|{:?}|{}", url, mode, policy)
}

fn identity_token(identity: &Identity) -> IdentityToken {
    match identity {
        Identity::Anonymous => IdentityToken::Anonymous,
        Identity::UserName { user, password } => {
            IdentityToken::UserName(user.clone(), password.clone())
        }
    }
}

fn parse_node_id(node_id: &str) -> Result<NodeId> {
    NodeId::from_str(node_id).map_err(|_| ProtocolError::BadNodeId(node_id.to_string()))
}

/// Convert a server variant into a bridge value
pub fn value_from_variant(variant: &Variant) -> Value {
    match variant {
        Variant::Empty => Value::Null,
        Variant::Boolean(v) => Value::Bool(*v),
        Variant::SByte(v) => Value::Int(i64::from(*v)),
        Variant::Byte(v) => Value::Int(i64::from(*v)),
        Variant::Int16(v) => Value::Int(i64::from(*v)),
        Variant::UInt16(v) => Value::Int(i64::from(*v)),
        Variant::Int32(v) => Value::Int(i64::from(*v)),
        Variant::UInt32(v) => Value::Int(i64::from(*v)),
        Variant::Int64(v) => Value::Int(*v),
        Variant::UInt64(v) => match i64::try_from(*v) {
            Ok(v) => Value::Int(v),
            Err(_) => Value::Float(*v as f64),
        },
        Variant::Float(v) => Value::Float(f64::from(*v)),
        Variant::Double(v) => Value::Float(*v),
        Variant::String(v) => Value::String(v.as_ref().to_string()),
        Variant::DateTime(v) => Value::String(v.as_chrono().to_rfc3339()),
        Variant::Array(array) => Value::Array(array.values.iter().map(value_from_variant).collect()),
        other => Value::String(format!("{:?}", other)),
    }
}

/// Convert a bridge value into a variant of the same type as `current`, the
/// last value the server reported for the node.
pub fn variant_for(value: &Value, current: Option<&Variant>) -> Option<Variant> {
    let Some(current) = current else {
        return match value {
            Value::Null => Some(Variant::Empty),
            Value::Bool(v) => Some(Variant::Boolean(*v)),
            Value::Int(v) => Some(Variant::Int64(*v)),
            Value::Float(v) => Some(Variant::Double(*v)),
            Value::String(v) => Some(Variant::String(UAString::from(v.as_str()))),
            Value::Array(_) | Value::Map(_) => None,
        };
    };

    match (current, value) {
        (Variant::Boolean(_), Value::Bool(v)) => Some(Variant::Boolean(*v)),
        (Variant::SByte(_), Value::Int(v)) => i8::try_from(*v).ok().map(Variant::SByte),
        (Variant::Byte(_), Value::Int(v)) => u8::try_from(*v).ok().map(Variant::Byte),
        (Variant::Int16(_), Value::Int(v)) => i16::try_from(*v).ok().map(Variant::Int16),
        (Variant::UInt16(_), Value::Int(v)) => u16::try_from(*v).ok().map(Variant::UInt16),
        (Variant::Int32(_), Value::Int(v)) => i32::try_from(*v).ok().map(Variant::Int32),
        (Variant::UInt32(_), Value::Int(v)) => u32::try_from(*v).ok().map(Variant::UInt32),
        (Variant::Int64(_), Value::Int(v)) => Some(Variant::Int64(*v)),
        (Variant::UInt64(_), Value::Int(v)) => u64::try_from(*v).ok().map(Variant::UInt64),
        (Variant::Float(_), Value::Float(v)) => Some(Variant::Float(*v as f32)),
        (Variant::Float(_), Value::Int(v)) => Some(Variant::Float(*v as f32)),
        (Variant::Double(_), Value::Float(v)) => Some(Variant::Double(*v)),
        (Variant::Double(_), Value::Int(v)) => Some(Variant::Double(*v as f64)),
        (Variant::String(_), Value::String(v)) => Some(Variant::String(UAString::from(v.as_str()))),
        (Variant::Empty, _) => variant_for(value, None),
        _ => None,
    }
}

/// Client for `opc.tcp://` servers
pub struct OpcUaClient {
    client: Arc<Mutex<Client>>,
    /// Endpoint descriptions seen during discovery, so connect can hand the
    /// server back exactly what it offered
    endpoints: Mutex<HashMap<String, EndpointDescription>>,
    next_session: AtomicU32,
}

impl OpcUaClient {
    pub fn new(application: &ApplicationIdentity, session_timeout: Duration) -> Result<Self> {
        let client = ClientBuilder::new()
            .application_name(application.name.as_str())
            .application_uri(application.uri.as_str())
            .product_uri(application.product_uri.as_str())
            .trust_server_certs(true)
            .session_retry_limit(0)
            .session_timeout(u32::try_from(session_timeout.as_millis()).unwrap_or(u32::MAX))
            .client()
            .ok_or_else(|| ProtocolError::Other("invalid OPC UA client configuration".into()))?;

        Ok(Self {
            client: Arc::new(Mutex::new(client)),
            endpoints: Mutex::new(HashMap::new()),
            next_session: AtomicU32::new(1),
        })
    }

    async fn describe(&self, endpoint: &Endpoint) -> Result<EndpointDescription> {
        let key = endpoint_key(&endpoint.url, endpoint.security_mode, &endpoint.security_policy);
        if let Some(description) = self.endpoints.lock().get(&key).cloned() {
            return Ok(description);
        }
        self.get_endpoints(&endpoint.url).await?;
        self.endpoints
            .lock()
            .get(&key)
            .cloned()
            .ok_or_else(|| ProtocolError::Rejected(format!("endpoint {} is not offered", endpoint.url)))
    }
}

#[async_trait]
impl UaClient for OpcUaClient {
    async fn find_servers(&self, address: &str) -> Result<Vec<ServerDescription>> {
        let client = Arc::clone(&self.client);
        let url = address.to_string();
        let servers = blocking(move || {
            client
                .lock()
                .find_servers(url.as_str())
                .map_err(|status| ProtocolError::Unreachable(format!("{}: {}", url, status)))
        })
        .await?;

        Ok(servers
            .into_iter()
            .map(|server| ServerDescription {
                application_name: server.application_name.text.as_ref().to_string(),
                application_uri: server.application_uri.as_ref().to_string(),
                discovery_urls: server
                    .discovery_urls
                    .unwrap_or_default()
                    .iter()
                    .map(|url| url.as_ref().to_string())
                    .collect(),
            })
            .collect())
    }

    async fn get_endpoints(&self, discovery_url: &str) -> Result<Vec<Endpoint>> {
        let client = Arc::clone(&self.client);
        let url = discovery_url.to_string();
        let descriptions = blocking(move || {
            client
                .lock()
                .get_server_endpoints_from_url(url.as_str())
                .map_err(|status| ProtocolError::Unreachable(format!("{}: {}", url, status)))
        })
        .await?;

        let mut known = self.endpoints.lock();
        Ok(descriptions
            .into_iter()
            .map(|description| {
                let endpoint = Endpoint {
                    url: description.endpoint_url.as_ref().to_string(),
                    security_mode: security_mode(description.security_mode),
                    security_policy: description.security_policy_uri.as_ref().to_string(),
                };
                known.insert(
                    endpoint_key(&endpoint.url, endpoint.security_mode, &endpoint.security_policy),
                    description,
                );
                endpoint
            })
            .collect())
    }

    async fn connect(&self, request: &ConnectRequest) -> Result<Arc<dyn UaSession>> {
        let description = self.describe(&request.endpoint).await?;
        let token = identity_token(&request.identity);
        let client = Arc::clone(&self.client);
        let session = blocking(move || {
            client
                .lock()
                .connect_to_endpoint(description, token)
                .map_err(|status| ProtocolError::Rejected(status.to_string()))
        })
        .await?;

        let (closed_tx, closed_rx) = watch::channel(None::<CloseReason>);
        let lost_tx = closed_tx.clone();
        session
            .write()
            .set_connection_status_callback(ConnectionStatusCallback::new(move |connected| {
                if !connected {
                    lost_tx.send_if_modified(|reason| {
                        if reason.is_some() {
                            return false;
                        }
                        *reason = Some(CloseReason::Lost("connection lost".to_string()));
                        true
                    });
                }
            }));
        let run = Session::run_async(Arc::clone(&session));

        let id = format!(
            "{}#{}",
            request.session_name,
            self.next_session.fetch_add(1, Ordering::SeqCst)
        );
        info!("OPC UA session {} opened on {}", id, request.endpoint.url);

        Ok(Arc::new(OpcUaSession {
            id,
            session,
            run: Mutex::new(Some(run)),
            closed_tx,
            closed_rx,
            next_handle: AtomicU32::new(1),
            handles: Arc::new(Mutex::new(HashMap::new())),
            last_variants: Arc::new(Mutex::new(HashMap::new())),
        }))
    }
}

/// One open session. Dropping it does not disconnect; call `close`.
struct OpcUaSession {
    id: String,
    session: Arc<UaRwLock<Session>>,
    run: Mutex<Option<oneshot::Sender<SessionCommand>>>,
    closed_tx: watch::Sender<Option<CloseReason>>,
    closed_rx: watch::Receiver<Option<CloseReason>>,
    next_handle: AtomicU32,
    /// Monitored item client handle to configured node id
    handles: Arc<Mutex<HashMap<u32, String>>>,
    /// Last variant seen per node, so writes keep the server's type
    last_variants: Arc<Mutex<HashMap<String, Variant>>>,
}

#[async_trait]
impl UaSession for OpcUaSession {
    fn session_id(&self) -> String {
        self.id.clone()
    }

    async fn create_subscription(&self, params: &SubscriptionParams) -> Result<RawSubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handles = Arc::clone(&self.handles);
        let last_variants = Arc::clone(&self.last_variants);
        let callback = DataChangeCallback::new(move |items| {
            for item in items {
                let Some(node_id) = handles.lock().get(&item.client_handle()).cloned() else {
                    continue;
                };
                let data_value = item.last_value();
                let Some(variant) = data_value.value.as_ref() else {
                    continue;
                };
                last_variants.lock().insert(node_id.clone(), variant.clone());
                let _ = tx.send(DataChange {
                    node_id,
                    value: value_from_variant(variant),
                    source_timestamp: data_value.source_timestamp.as_ref().map(|t| t.as_chrono()),
                    server_timestamp: data_value.server_timestamp.as_ref().map(|t| t.as_chrono()),
                });
            }
        });

        let session = Arc::clone(&self.session);
        let publishing_interval = params.publishing_interval;
        let params = params.clone();
        let id = blocking(move || {
            session
                .read()
                .create_subscription(
                    params.publishing_interval.as_millis() as f64,
                    params.lifetime_count,
                    params.max_keep_alive_count,
                    params.max_notifications_per_publish,
                    params.priority,
                    params.publishing_enabled,
                    callback,
                )
                .map_err(service_error)
        })
        .await?;
        debug!("Subscription {} created on session {}", id, self.id);

        Ok(RawSubscription {
            id,
            revised_publishing_interval: publishing_interval,
            notifications: rx,
        })
    }

    async fn create_monitored_items(
        &self,
        subscription_id: u32,
        items: &[MonitoredItemRequest],
    ) -> Result<Vec<MonitoredItemResult>> {
        let mut results: Vec<MonitoredItemResult> = Vec::with_capacity(items.len());
        let mut requests = Vec::new();
        let mut pending = Vec::new();

        for item in items {
            match parse_node_id(&item.node_id) {
                Ok(node_id) => {
                    let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
                    // Registered first: the initial value can arrive before the call returns
                    self.handles.lock().insert(handle, item.node_id.clone());
                    requests.push(MonitoredItemCreateRequest {
                        item_to_monitor: ReadValueId {
                            node_id,
                            attribute_id: AttributeId::Value as u32,
                            index_range: UAString::null(),
                            data_encoding: QualifiedName::null(),
                        },
                        monitoring_mode: MonitoringMode::Reporting,
                        requested_parameters: MonitoringParameters {
                            client_handle: handle,
                            sampling_interval: item.sampling_interval.as_millis() as f64,
                            filter: ExtensionObject::null(),
                            queue_size: item.queue_size,
                            discard_oldest: item.discard_oldest,
                        },
                    });
                    pending.push((results.len(), handle));
                    results.push(MonitoredItemResult {
                        node_id: item.node_id.clone(),
                        status: Err("BadNodeIdUnknown".to_string()),
                    });
                }
                Err(_) => results.push(MonitoredItemResult {
                    node_id: item.node_id.clone(),
                    status: Err("BadNodeIdInvalid".to_string()),
                }),
            }
        }
        if requests.is_empty() {
            return Ok(results);
        }

        let session = Arc::clone(&self.session);
        let created = blocking(move || {
            session
                .read()
                .create_monitored_items(subscription_id, TimestampsToReturn::Both, &requests)
                .map_err(service_error)
        })
        .await;
        let created = match created {
            Ok(created) => created,
            Err(e) => {
                let mut handles = self.handles.lock();
                for (_, handle) in &pending {
                    handles.remove(handle);
                }
                return Err(e);
            }
        };

        let mut handles = self.handles.lock();
        for (i, (index, handle)) in pending.into_iter().enumerate() {
            match created.get(i) {
                Some(result) if result.status_code.is_good() => {
                    results[index].status = Ok(result.monitored_item_id);
                }
                Some(result) => {
                    handles.remove(&handle);
                    results[index].status = Err(result.status_code.to_string());
                }
                None => {
                    handles.remove(&handle);
                    warn!("Server returned no result for {}", results[index].node_id);
                }
            }
        }
        Ok(results)
    }

    async fn delete_subscription(&self, subscription_id: u32) -> Result<()> {
        let session = Arc::clone(&self.session);
        blocking(move || {
            session
                .read()
                .delete_subscription(subscription_id)
                .map(|_| ())
                .map_err(service_error)
        })
        .await
    }

    async fn write(&self, node_id: &str, value: Value) -> Result<()> {
        let target = parse_node_id(node_id)?;
        let current = self.last_variants.lock().get(node_id).cloned();
        let variant = variant_for(&value, current.as_ref()).ok_or_else(|| {
            ProtocolError::TypeMismatch(format!("{} cannot take {}", node_id, value.kind()))
        })?;

        let session = Arc::clone(&self.session);
        let write = WriteValue {
            node_id: target,
            attribute_id: AttributeId::Value as u32,
            index_range: UAString::null(),
            value: DataValue::new_now(variant),
        };
        let statuses = blocking(move || session.read().write(&[write]).map_err(service_error)).await?;

        match statuses.first() {
            Some(status) if status.is_good() => Ok(()),
            Some(status) if *status == StatusCode::BadNodeIdUnknown => {
                Err(ProtocolError::BadNodeId(node_id.to_string()))
            }
            Some(status) if *status == StatusCode::BadTypeMismatch => {
                Err(ProtocolError::TypeMismatch(format!("{} refused {}", node_id, value.kind())))
            }
            Some(status) => Err(ProtocolError::Rejected(status.to_string())),
            None => Err(ProtocolError::Other("empty write response".into())),
        }
    }

    async fn close(&self) -> Result<()> {
        let first = self.closed_tx.send_if_modified(|reason| {
            if reason.is_some() {
                return false;
            }
            *reason = Some(CloseReason::Requested);
            true
        });
        if let Some(run) = self.run.lock().take() {
            let _ = run.send(SessionCommand::Stop);
        }
        if first {
            let session = Arc::clone(&self.session);
            blocking(move || {
                session.read().disconnect();
                Ok(())
            })
            .await?;
            debug!("OPC UA session {} closed", self.id);
        }
        Ok(())
    }

    async fn closed(&self) -> CloseReason {
        let mut rx = self.closed_rx.clone();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(reason) = current {
                return reason;
            }
            if rx.changed().await.is_err() {
                return CloseReason::Lost("session dropped".to_string());
            }
        }
    }
}
