use async_trait::async_trait;
use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::tree_clock::TreeClock;
use crate::error::{EngineError, EngineResult};
use crate::infrastructure::dataset::SnapshotBatch;
use crate::remotes::{LocalCloneServices, OperationMessage, Remotes, Revup, Snapshot};

const OPERATIONS_CHANNEL: &str = "op";
const PRESENCE_CHANNEL: &str = "presence";
const LIVE_SENTINEL: &[u8] = b"__live";
const LEAVE_SENTINEL: &[u8] = b"__leave";

fn control_channel(address: &str) -> String {
    format!("ctl:{}", address)
}

fn reply_channel(address: &str) -> String {
    format!("re:{}", address)
}

fn notify_channel(id: &str) -> String {
    format!("nfy:{}", id)
}

/// Transport contract a concrete binding (broker, socket, in-memory)
/// implements: named channels on a per-domain fabric, delivering payloads
/// tagged with the publisher's address.
#[async_trait]
pub trait PubsubTransport: Send + Sync + 'static {
    fn address(&self) -> String;
    async fn publish(&self, channel: &str, data: Vec<u8>) -> EngineResult<()>;
    async fn subscribe(
        &self,
        channel: &str,
    ) -> EngineResult<mpsc::UnboundedReceiver<(String, Vec<u8>)>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct ControlFrame {
    id: String,
    reply_to: String,
    body: RequestBody,
}

#[derive(Debug, Serialize, Deserialize)]
enum RequestBody {
    NewClock,
    Snapshot { notify: String },
    RevupFrom { time: Value, notify: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct ReplyFrame {
    id: String,
    body: ReplyBody,
}

#[derive(Debug, Serialize, Deserialize)]
enum ReplyBody {
    Clock { time: Value },
    Snapshot { gwc: crate::core::gwc::Gwc },
    Revup,
    CantRevup,
    Rejected { reason: String },
}

#[derive(Debug, Serialize, Deserialize)]
enum Notification {
    Batch(SnapshotBatch),
    Operation(OperationMessage),
    End,
    Failed { reason: String },
}

struct Inner {
    transport: Arc<dyn PubsubTransport>,
    timeout: Duration,
    ops_tx: broadcast::Sender<OperationMessage>,
    live: watch::Sender<Option<bool>>,
    local: RwLock<Option<Arc<dyn LocalCloneServices>>>,
    peers: StdMutex<HashSet<String>>,
    pending: StdMutex<HashMap<String, oneshot::Sender<ReplyBody>>>,
}

/// The pub/sub remotes base: aggregates peer presence, correlates
/// request/reply control exchanges with timeouts, and frames snapshot and
/// rev-up data over notification sub-channels. Concrete backends only
/// supply a [`PubsubTransport`].
pub struct PubsubRemotes {
    inner: Arc<Inner>,
    listener: JoinHandle<()>,
}

impl PubsubRemotes {
    pub async fn connect(
        transport: Arc<dyn PubsubTransport>,
        network_timeout: Duration,
    ) -> EngineResult<Self> {
        let (ops_tx, _) = broadcast::channel(256);
        let (live, _) = watch::channel(None);
        let inner = Arc::new(Inner {
            transport,
            timeout: network_timeout,
            ops_tx,
            live,
            local: RwLock::new(None),
            peers: StdMutex::new(HashSet::new()),
            pending: StdMutex::new(HashMap::new()),
        });

        let address = inner.transport.address();
        let mut ops_rx = inner.transport.subscribe(OPERATIONS_CHANNEL).await?;
        let mut presence_rx = inner.transport.subscribe(PRESENCE_CHANNEL).await?;
        let mut control_rx = inner.transport.subscribe(&control_channel(&address)).await?;
        let mut reply_rx = inner.transport.subscribe(&reply_channel(&address)).await?;

        // Connected: alone until presence says otherwise
        inner.live.send_replace(Some(false));

        let listener = tokio::spawn({
            let inner = inner.clone();
            async move {
                loop {
                    tokio::select! {
                        msg = ops_rx.recv() => match msg {
                            Some((from, data)) => inner.on_operation(&from, &data),
                            None => break,
                        },
                        msg = presence_rx.recv() => match msg {
                            Some((from, data)) => inner.on_presence(&from, &data).await,
                            None => break,
                        },
                        msg = control_rx.recv() => match msg {
                            Some((_, data)) => inner.clone().on_control(data),
                            None => break,
                        },
                        msg = reply_rx.recv() => match msg {
                            Some((_, data)) => inner.on_reply(&data),
                            None => break,
                        },
                    }
                }
                inner.live.send_replace(None);
            }
        });

        Ok(Self { inner, listener })
    }
}

impl Drop for PubsubRemotes {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

impl Inner {
    fn address(&self) -> String {
        self.transport.address()
    }

    fn on_operation(&self, from: &str, data: &[u8]) {
        if from == self.address() {
            return;
        }
        match rmp_serde::from_slice::<OperationMessage>(data) {
            Ok(msg) => {
                let _ = self.ops_tx.send(msg);
            }
            Err(e) => warn!("undecodable operation message: {}", e),
        }
    }

    async fn on_presence(&self, from: &str, data: &[u8]) {
        if from == self.address() {
            return;
        }
        let newly_live = if data == LIVE_SENTINEL {
            self.peers.lock().unwrap().insert(from.to_string())
        } else if data == LEAVE_SENTINEL {
            self.peers.lock().unwrap().remove(from);
            false
        } else {
            return;
        };
        let count = self.peers.lock().unwrap().len();
        self.live.send_replace(Some(count > 0));
        // Answer a newcomer with our own presence so they learn of us
        if newly_live && self.local.read().await.is_some() {
            let _ = self
                .transport
                .publish(PRESENCE_CHANNEL, LIVE_SENTINEL.to_vec())
                .await;
        }
    }

    fn on_reply(&self, data: &[u8]) {
        match rmp_serde::from_slice::<ReplyFrame>(data) {
            Ok(frame) => {
                if let Some(tx) = self.pending.lock().unwrap().remove(&frame.id) {
                    let _ = tx.send(frame.body);
                }
            }
            Err(e) => warn!("undecodable reply frame: {}", e),
        }
    }

    fn on_control(self: Arc<Self>, data: Vec<u8>) {
        tokio::spawn(async move {
            let frame = match rmp_serde::from_slice::<ControlFrame>(&data) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("undecodable control frame: {}", e);
                    return;
                }
            };
            let reply_to = frame.reply_to.clone();
            let id = frame.id.clone();
            let body = self.serve(frame).await;
            let reply = ReplyFrame { id, body };
            if let Ok(bytes) = rmp_serde::to_vec(&reply) {
                let _ = self
                    .transport
                    .publish(&reply_channel(&reply_to), bytes)
                    .await;
            }
        });
    }

    async fn serve(&self, frame: ControlFrame) -> ReplyBody {
        let Some(local) = self.local.read().await.clone() else {
            return ReplyBody::Rejected {
                reason: "no local clone attached".to_string(),
            };
        };
        match frame.body {
            RequestBody::NewClock => match local.fork_clock().await {
                Ok(clock) => ReplyBody::Clock {
                    time: clock.to_json(),
                },
                Err(e) => ReplyBody::Rejected {
                    reason: e.to_string(),
                },
            },
            RequestBody::Snapshot { notify } => match local.snapshot().await {
                Ok((gwc, batches)) => {
                    let channel = notify_channel(&notify);
                    for batch in batches {
                        if let Err(e) = self.notify(&channel, Notification::Batch(batch)).await {
                            return self.fail_stream(&channel, e).await;
                        }
                    }
                    if let Err(e) = self.notify(&channel, Notification::End).await {
                        return self.fail_stream(&channel, e).await;
                    }
                    ReplyBody::Snapshot { gwc }
                }
                Err(e) => ReplyBody::Rejected {
                    reason: e.to_string(),
                },
            },
            RequestBody::RevupFrom { time, notify } => {
                let time = match TreeClock::from_json(&time) {
                    Ok(time) => time,
                    Err(e) => {
                        return ReplyBody::Rejected {
                            reason: e.to_string(),
                        }
                    }
                };
                match local.operations_since(time).await {
                    Ok(Some(ops)) => {
                        let channel = notify_channel(&notify);
                        let from_clone = local.clone_id();
                        for data in ops {
                            let msg = Notification::Operation(OperationMessage {
                                from_clone: from_clone.clone(),
                                data,
                            });
                            if let Err(e) = self.notify(&channel, msg).await {
                                return self.fail_stream(&channel, e).await;
                            }
                        }
                        if let Err(e) = self.notify(&channel, Notification::End).await {
                            return self.fail_stream(&channel, e).await;
                        }
                        ReplyBody::Revup
                    }
                    Ok(None) => ReplyBody::CantRevup,
                    Err(e) => ReplyBody::Rejected {
                        reason: e.to_string(),
                    },
                }
            }
        }
    }

    async fn notify(&self, channel: &str, notification: Notification) -> EngineResult<()> {
        let bytes = rmp_serde::to_vec(&notification)?;
        self.transport.publish(channel, bytes).await
    }

    /// A data stream broke mid-way: tell the receiver it does not have a
    /// whole sequence, and reject the request. The failure marker itself is
    /// best effort; a receiver that misses it still never sees `End`.
    async fn fail_stream(&self, channel: &str, error: EngineError) -> ReplyBody {
        warn!("notification stream failed: {}", error);
        let reason = error.to_string();
        let _ = self
            .notify(
                channel,
                Notification::Failed {
                    reason: reason.clone(),
                },
            )
            .await;
        ReplyBody::Rejected { reason }
    }

    /// Send a control request to a randomly chosen live peer and await the
    /// correlated reply within the network timeout.
    async fn request(&self, body: RequestBody) -> EngineResult<ReplyBody> {
        let peer = {
            let peers = self.peers.lock().unwrap();
            peers
                .iter()
                .choose(&mut rand::rng())
                .cloned()
                .ok_or_else(|| EngineError::NoPeer("no live peer on the domain".to_string()))?
        };
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id.clone(), tx);
        let frame = ControlFrame {
            id: id.clone(),
            reply_to: self.address(),
            body,
        };
        self.transport
            .publish(&control_channel(&peer), rmp_serde::to_vec(&frame)?)
            .await?;
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(EngineError::Closed),
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                Err(EngineError::Timeout(format!(
                    "no reply from {} within {:?}",
                    peer, self.timeout
                )))
            }
        }
    }

    /// Subscribe a notification sub-channel and pump it into a bounded
    /// receiver until the end marker.
    async fn open_notifications<T: Send + 'static>(
        &self,
        notify_id: &str,
        mut map: impl FnMut(Notification) -> Option<EngineResult<T>> + Send + 'static,
    ) -> EngineResult<mpsc::Receiver<EngineResult<T>>> {
        let mut raw = self
            .transport
            .subscribe(&notify_channel(notify_id))
            .await?;
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            while let Some((_, data)) = raw.recv().await {
                let notification = match rmp_serde::from_slice::<Notification>(&data) {
                    Ok(n) => n,
                    Err(e) => {
                        let _ = tx.send(Err(EngineError::Codec(e.to_string()))).await;
                        return;
                    }
                };
                match notification {
                    Notification::End => return,
                    Notification::Failed { reason } => {
                        let _ = tx.send(Err(EngineError::Storage(reason))).await;
                        return;
                    }
                    other => match map(other) {
                        Some(item) => {
                            if tx.send(item).await.is_err() {
                                return; // consumer cancelled
                            }
                        }
                        None => {
                            let _ = tx
                                .send(Err(EngineError::Codec(
                                    "unexpected notification kind".to_string(),
                                )))
                                .await;
                            return;
                        }
                    },
                }
            }
        });
        Ok(rx)
    }
}

#[async_trait]
impl Remotes for PubsubRemotes {
    fn operations(&self) -> broadcast::Receiver<OperationMessage> {
        self.inner.ops_tx.subscribe()
    }

    fn live(&self) -> watch::Receiver<Option<bool>> {
        self.inner.live.subscribe()
    }

    async fn set_local(&self, clone: Option<Arc<dyn LocalCloneServices>>) -> EngineResult<()> {
        let attaching = clone.is_some();
        *self.inner.local.write().await = clone;
        let sentinel = if attaching {
            LIVE_SENTINEL
        } else {
            LEAVE_SENTINEL
        };
        self.inner
            .transport
            .publish(PRESENCE_CHANNEL, sentinel.to_vec())
            .await
    }

    async fn publish(&self, msg: OperationMessage) -> EngineResult<()> {
        self.inner
            .transport
            .publish(OPERATIONS_CHANNEL, rmp_serde::to_vec(&msg)?)
            .await
    }

    async fn new_clock(&self) -> EngineResult<TreeClock> {
        match self.inner.request(RequestBody::NewClock).await? {
            ReplyBody::Clock { time } => TreeClock::from_json(&time),
            ReplyBody::Rejected { reason } => Err(EngineError::NoPeer(reason)),
            other => Err(EngineError::Codec(format!(
                "unexpected reply to new-clock: {:?}",
                other
            ))),
        }
    }

    async fn snapshot(&self) -> EngineResult<Snapshot> {
        let notify = Uuid::new_v4().to_string();
        let batches = self
            .inner
            .open_notifications(&notify, |n| match n {
                Notification::Batch(batch) => Some(Ok(batch)),
                _ => None,
            })
            .await?;
        match self
            .inner
            .request(RequestBody::Snapshot { notify })
            .await?
        {
            ReplyBody::Snapshot { gwc } => {
                debug!("receiving snapshot");
                Ok(Snapshot { gwc, batches })
            }
            ReplyBody::Rejected { reason } => Err(EngineError::NoPeer(reason)),
            other => Err(EngineError::Codec(format!(
                "unexpected reply to snapshot: {:?}",
                other
            ))),
        }
    }

    async fn revup_from(&self, time: TreeClock) -> EngineResult<Option<Revup>> {
        let notify = Uuid::new_v4().to_string();
        let operations = self
            .inner
            .open_notifications(&notify, |n| match n {
                Notification::Operation(msg) => Some(Ok(msg)),
                _ => None,
            })
            .await?;
        match self
            .inner
            .request(RequestBody::RevupFrom {
                time: time.to_json(),
                notify,
            })
            .await?
        {
            ReplyBody::Revup => Ok(Some(Revup { operations })),
            ReplyBody::CantRevup => Ok(None),
            ReplyBody::Rejected { reason } => Err(EngineError::NoPeer(reason)),
            other => Err(EngineError::Codec(format!(
                "unexpected reply to revup: {:?}",
                other
            ))),
        }
    }
}
