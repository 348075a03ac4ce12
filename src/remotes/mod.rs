pub mod memory;
pub mod pubsub;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};

use crate::core::gwc::Gwc;
use crate::core::tree_clock::TreeClock;
use crate::error::EngineResult;
use crate::infrastructure::dataset::SnapshotBatch;

pub use memory::MemoryTransport;
pub use pubsub::{PubsubRemotes, PubsubTransport};

/// A wire-encoded operation published on the domain, tagged with the
/// publishing clone's identity so echoes can be ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationMessage {
    pub from_clone: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// A snapshot being received from a peer: the producer's GWC followed by a
/// finite stream of data batches. The stream must be fully consumed or
/// dropped to release the producer.
pub struct Snapshot {
    pub gwc: Gwc,
    pub batches: mpsc::Receiver<EngineResult<SnapshotBatch>>,
}

/// A rev-up being received from a peer: operations bringing us from our
/// stated time to the peer's present.
pub struct Revup {
    pub operations: mpsc::Receiver<EngineResult<OperationMessage>>,
}

/// What a clone engine exposes to its remotes for serving peer requests.
#[async_trait]
pub trait LocalCloneServices: Send + Sync + 'static {
    fn clone_id(&self) -> String;
    /// Fork the local clock for a new participant.
    async fn fork_clock(&self) -> EngineResult<TreeClock>;
    /// Produce a snapshot of the current graph.
    async fn snapshot(&self) -> EngineResult<(Gwc, Vec<SnapshotBatch>)>;
    /// Encoded operations since `time`; `None` if the journal cannot serve
    /// that far back.
    async fn operations_since(&self, time: TreeClock) -> EngineResult<Option<Vec<Vec<u8>>>>;
}

/// The pub/sub fabric a clone engine consumes: operation delivery, peer
/// presence, and the `new-clock` / `snapshot` / `rev-up-from` control
/// exchanges.
#[async_trait]
pub trait Remotes: Send + Sync + 'static {
    /// Hot stream of operations from other clones of the domain.
    fn operations(&self) -> broadcast::Receiver<OperationMessage>;

    /// Live value: `Some(true)` when other clones are present, `Some(false)`
    /// when we are definitely alone, `None` while unknown (disconnected).
    fn live(&self) -> watch::Receiver<Option<bool>>;

    /// Attach or detach the local clone for presence and request serving.
    async fn set_local(&self, clone: Option<Arc<dyn LocalCloneServices>>) -> EngineResult<()>;

    /// Publish a local operation to the domain.
    async fn publish(&self, msg: OperationMessage) -> EngineResult<()>;

    /// Request a forked clock from any live peer.
    async fn new_clock(&self) -> EngineResult<TreeClock>;

    /// Request a snapshot from any live peer.
    async fn snapshot(&self) -> EngineResult<Snapshot>;

    /// Ask a peer to replay operations since `time`; `Ok(None)` when no peer
    /// can serve that far back and a snapshot is required.
    async fn revup_from(&self, time: TreeClock) -> EngineResult<Option<Revup>>;
}
