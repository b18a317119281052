//! In-process loopback broker.
//!
//! Plays both the broker and the service side of a device stream without
//! any network: the service calls [`LoopbackHub::initiate`] for a device,
//! that device receives the request through its [`LoopbackConnection`] and, on
//! acceptance, opens a [`LoopbackChannel`] through the hub acting as its
//! [`ChannelFactory`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};

use super::{
    BrokerConnection, ChannelFactory, ConnectionFactory, ConnectionString, StreamChannel,
    TransportKind,
};
use crate::error::{Result, StreamError};
use crate::protocol::{Deadline, StreamRequest};

/// Endpoint scheme of loopback channels.
const LOOPBACK_SCHEME: &str = "loopback://";

/// Service-side result of [`LoopbackHub::initiate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceReply {
    /// The device rejected the stream request.
    Rejected,
    /// The device accepted and answered with this text.
    Response(String),
}

struct PendingStream {
    device_id: String,
    token: String,
    /// Present until the device accepts or rejects
    decision: Option<oneshot::Sender<bool>>,
    /// Present until the device opens the channel
    device_end: Option<LoopbackChannel>,
}

/// Request queue of one device identity.
struct DeviceQueue {
    tx: mpsc::UnboundedSender<StreamRequest>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<StreamRequest>>,
}

struct HubInner {
    queues: Mutex<HashMap<String, Arc<DeviceQueue>>>,
    pending: Mutex<HashMap<String, PendingStream>>,
    connection_opens: AtomicU64,
    connection_closes: AtomicU64,
    channels_opened: AtomicU64,
}

impl HubInner {
    fn pending(&self) -> MutexGuard<'_, HashMap<String, PendingStream>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get (or create) the request queue of `device_id`.
    fn queue(&self, device_id: &str) -> Arc<DeviceQueue> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let queue = queues.entry(device_id.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            Arc::new(DeviceQueue {
                tx,
                rx: tokio::sync::Mutex::new(rx),
            })
        });
        Arc::clone(queue)
    }

    /// Drop streams of `device_id` that were decided but never opened.
    fn abandon_unclaimed(&self, device_id: &str) {
        self.pending()
            .retain(|_, stream| stream.device_id != device_id || stream.decision.is_some());
    }
}

/// In-process broker shared by device and service.
#[derive(Clone)]
pub struct LoopbackHub {
    inner: Arc<HubInner>,
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                queues: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                connection_opens: AtomicU64::new(0),
                connection_closes: AtomicU64::new(0),
                channels_opened: AtomicU64::new(0),
            }),
        }
    }

    /// Open a device connection directly
    pub fn connect(&self, device_id: &str) -> LoopbackConnection {
        self.inner.connection_opens.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Loopback connection opened for device {}", device_id);
        LoopbackConnection {
            inner: Arc::clone(&self.inner),
            requests: self.inner.queue(device_id),
            device_id: device_id.to_string(),
            open: AtomicBool::new(true),
        }
    }

    /// Ask `device_id` for a stream and deliver `payload` over it.
    ///
    /// Resolves once the device rejects, or once it answers the payload.
    /// Requests for a device that is not connected yet wait in its queue.
    pub async fn initiate(&self, device_id: &str, payload: &str) -> Result<ServiceReply> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let token = uuid::Uuid::new_v4().simple().to_string();

        let (decision_tx, decision_rx) = oneshot::channel();
        let (to_device_tx, to_device_rx) = mpsc::unbounded_channel();
        let (from_device_tx, mut from_device_rx) = mpsc::unbounded_channel();

        self.inner.pending().insert(
            request_id.clone(),
            PendingStream {
                device_id: device_id.to_string(),
                token: token.clone(),
                decision: Some(decision_tx),
                device_end: Some(LoopbackChannel {
                    inbound: to_device_rx,
                    outbound: Some(from_device_tx),
                }),
            },
        );

        let request = StreamRequest::new(
            request_id.clone(),
            "loopback",
            format!("{LOOPBACK_SCHEME}{request_id}"),
            token,
        );
        self.inner
            .queue(device_id)
            .tx
            .send(request)
            .map_err(|_| StreamError::BrokerUnreachable("Loopback hub shut down".to_string()))?;

        let accepted = match decision_rx.await {
            Ok(accepted) => accepted,
            Err(_) => {
                self.inner.pending().remove(&request_id);
                return Err(StreamError::Transport(
                    "Stream request dropped without a decision".to_string(),
                ));
            },
        };
        if !accepted {
            return Ok(ServiceReply::Rejected);
        }

        to_device_tx
            .send(payload.as_bytes().to_vec())
            .map_err(|_| StreamError::Transport("Device closed the stream".to_string()))?;

        match from_device_rx.recv().await {
            Some(frame) => Ok(ServiceReply::Response(
                String::from_utf8_lossy(&frame).into_owned(),
            )),
            None => Err(StreamError::Transport(
                "Device closed the stream without responding".to_string(),
            )),
        }
    }

    /// Number of broker connections established (including re-opens)
    pub fn connection_opens(&self) -> u64 {
        self.inner.connection_opens.load(Ordering::SeqCst)
    }

    /// Number of effective broker connection closes
    pub fn connection_closes(&self) -> u64 {
        self.inner.connection_closes.load(Ordering::SeqCst)
    }

    /// Number of stream channels opened by devices
    pub fn channels_opened(&self) -> u64 {
        self.inner.channels_opened.load(Ordering::SeqCst)
    }
}

impl ConnectionFactory for LoopbackHub {
    fn open<'a>(
        &'a self,
        connection_string: &'a ConnectionString,
        transport: TransportKind,
    ) -> BoxFuture<'a, Result<Box<dyn BrokerConnection>>> {
        Box::pin(async move {
            tracing::debug!(
                "Loopback broker accepting {} over {}",
                connection_string.device_id,
                transport
            );
            let connection: Box<dyn BrokerConnection> =
                Box::new(self.connect(&connection_string.device_id));
            Ok(connection)
        })
    }
}

impl ChannelFactory for LoopbackHub {
    fn open_channel<'a>(
        &'a self,
        url: &'a str,
        authorization_token: &'a str,
        _deadline: Deadline,
    ) -> BoxFuture<'a, Result<Box<dyn StreamChannel>>> {
        Box::pin(async move {
            let request_id = url.strip_prefix(LOOPBACK_SCHEME).ok_or_else(|| {
                StreamError::Transport(format!("Not a loopback endpoint: {url}"))
            })?;

            let mut pending = self.inner.pending();
            let stream = pending.get_mut(request_id).ok_or_else(|| {
                StreamError::DeviceNotFound(format!("Unknown stream {request_id}"))
            })?;
            if stream.token != authorization_token {
                return Err(StreamError::Transport(
                    "Channel authorization rejected".to_string(),
                ));
            }
            if stream.decision.is_some() {
                return Err(StreamError::Transport(format!(
                    "Stream {request_id} has not been accepted"
                )));
            }
            let channel = stream.device_end.take().ok_or_else(|| {
                StreamError::Transport(format!("Stream {request_id} already open"))
            })?;
            pending.remove(request_id);
            drop(pending);

            self.inner.channels_opened.fetch_add(1, Ordering::SeqCst);
            let channel: Box<dyn StreamChannel> = Box::new(channel);
            Ok(channel)
        })
    }
}

/// Device connection to a [`LoopbackHub`].
pub struct LoopbackConnection {
    inner: Arc<HubInner>,
    requests: Arc<DeviceQueue>,
    device_id: String,
    open: AtomicBool,
}

impl LoopbackConnection {
    /// Device identity of this connection
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Check if the link is currently open
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl BrokerConnection for LoopbackConnection {
    fn wait_for_stream_request(
        &self,
        deadline: Deadline,
    ) -> BoxFuture<'_, Result<Option<StreamRequest>>> {
        Box::pin(async move {
            if !self.open.swap(true, Ordering::SeqCst) {
                self.inner.connection_opens.fetch_add(1, Ordering::SeqCst);
                tracing::debug!("Loopback connection re-opened for device {}", self.device_id);
            }

            let next = async {
                let mut requests = self.requests.rx.lock().await;
                requests.recv().await
            };
            match tokio::time::timeout_at(deadline.instant(), next).await {
                Ok(request) => Ok(request),
                Err(_) => Ok(None),
            }
        })
    }

    fn accept_stream_request<'a>(
        &'a self,
        request: &'a StreamRequest,
        _deadline: Deadline,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let decision = {
                let mut pending = self.inner.pending();
                let stream = pending
                    .get_mut(&request.request_id)
                    .filter(|stream| stream.device_id == self.device_id)
                    .ok_or_else(|| {
                        StreamError::DeviceNotFound(format!(
                            "Unknown stream request {}",
                            request.request_id
                        ))
                    })?;
                stream.decision.take().ok_or_else(|| {
                    StreamError::Transport(format!(
                        "Stream request {} already decided",
                        request.request_id
                    ))
                })?
            };
            decision.send(true).map_err(|_| {
                StreamError::Transport("Service abandoned the stream request".to_string())
            })
        })
    }

    fn reject_stream_request<'a>(
        &'a self,
        request: &'a StreamRequest,
        _deadline: Deadline,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let stream = {
                let mut pending = self.inner.pending();
                match pending.get(&request.request_id) {
                    Some(stream) if stream.device_id == self.device_id => {
                        pending.remove(&request.request_id)
                    },
                    _ => None,
                }
            }
            .ok_or_else(|| {
                StreamError::DeviceNotFound(format!(
                    "Unknown stream request {}",
                    request.request_id
                ))
            })?;
            if let Some(decision) = stream.decision {
                // A vanished service needs no answer
                let _ = decision.send(false);
            }
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.open.swap(false, Ordering::SeqCst) {
                self.inner.connection_closes.fetch_add(1, Ordering::SeqCst);
                tracing::debug!("Loopback connection closed for device {}", self.device_id);
            }
            self.inner.abandon_unclaimed(&self.device_id);
            Ok(())
        })
    }
}

/// In-memory duplex channel, device end.
pub struct LoopbackChannel {
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl StreamChannel for LoopbackChannel {
    fn receive<'a>(
        &'a mut self,
        buffer: &'a mut [u8],
        _deadline: Deadline,
    ) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            let frame = self.inbound.recv().await.ok_or_else(|| {
                StreamError::Transport("Stream closed by service".to_string())
            })?;
            let len = frame.len().min(buffer.len());
            buffer[..len].copy_from_slice(&frame[..len]);
            Ok(len)
        })
    }

    fn send<'a>(&'a mut self, frame: &'a [u8], _deadline: Deadline) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let outbound = self
                .outbound
                .as_ref()
                .ok_or_else(|| StreamError::Transport("Channel already closed".to_string()))?;
            outbound
                .send(frame.to_vec())
                .map_err(|_| StreamError::Transport("Service hung up".to_string()))
        })
    }

    fn close(&mut self, _deadline: Deadline) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.outbound = None;
            Ok(())
        })
    }
}
