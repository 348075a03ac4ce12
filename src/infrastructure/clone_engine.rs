use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::CloneConfig;
use crate::constraints::{create_constraint, Constraint, InterimUpdate};
use crate::core::gwc::Gwc;
use crate::core::messages::MessageService;
use crate::core::operation::CausalOperation;
use crate::core::tree_clock::{Tid, TreeClock};
use crate::error::{EngineError, EngineResult};
use crate::infrastructure::dataset::{DatasetUpdate, Patch, SnapshotBatch, SuSetDataset};
use crate::infrastructure::kv_store::{claim_dataset, release_dataset, KvStore};
use crate::remotes::{LocalCloneServices, OperationMessage, Remotes};

const BACKOFF_BASE_MS: u64 = 1000;
const BACKOFF_CEILING_MS: u64 = 30_000;
const MAX_RECOVERY_ATTEMPTS: u32 = 8;

/// Clone lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineState {
    Uninitialised,
    Initialising,
    RevvingUp,
    Live,
    Closing,
    Closed,
}

/// Observable clone status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CloneStatus {
    /// Remotes report we are connected.
    pub online: bool,
    /// Remotes are live but we have not caught up yet.
    pub outdated: bool,
    /// We are the only live clone on the domain.
    pub silo: bool,
    /// Our clock's tick count.
    pub ticks: u64,
    pub state: EngineState,
}

impl CloneStatus {
    fn initial() -> Self {
        Self {
            online: false,
            outdated: false,
            silo: false,
            ticks: 0,
            state: EngineState::Uninitialised,
        }
    }
}

struct EngineInner {
    service: MessageService,
    buffer: Vec<CausalOperation>,
    state: EngineState,
}

/// The clone engine: coordinates initialisation, snapshot ingestion,
/// rev-up, live operation exchange, and read/write transactions over one
/// dataset. All state transitions run under a single serialised region per
/// clone; network and storage calls are the suspension points.
pub struct CloneEngine {
    config: CloneConfig,
    store: Arc<dyn KvStore>,
    dataset: Arc<SuSetDataset>,
    remotes: Arc<dyn Remotes>,
    constraints: Vec<Arc<dyn Constraint>>,
    inner: Mutex<EngineInner>,
    status: watch::Sender<CloneStatus>,
    updates: broadcast::Sender<DatasetUpdate>,
    session: String,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl CloneEngine {
    /// Open the dataset and bring the clone up: genesis bootstrap, or
    /// clone-from-peer (new clock + snapshot), or restart-and-rev-up.
    /// Returns once the clone is live.
    pub async fn attach(
        config: CloneConfig,
        store: Arc<dyn KvStore>,
        remotes: Arc<dyn Remotes>,
    ) -> EngineResult<Arc<Self>> {
        config.validate()?;
        let (session, _) = claim_dataset(store.as_ref(), &config.domain).await?;

        let dataset = Arc::new(SuSetDataset::new(
            store.clone(),
            config.context.clone(),
            config.max_operation_size,
        ));
        let constraints = config
            .constraints
            .iter()
            .map(create_constraint)
            .collect::<EngineResult<Vec<_>>>()?;

        let existing = dataset.journal().load().await?;
        let (status_tx, _) = watch::channel(CloneStatus::initial());
        let (updates_tx, _) = broadcast::channel(256);

        let engine = Arc::new(Self {
            inner: Mutex::new(EngineInner {
                service: MessageService::new(
                    existing
                        .as_ref()
                        .map(|s| s.time.clone())
                        .unwrap_or_else(TreeClock::genesis),
                ),
                buffer: Vec::new(),
                state: EngineState::Initialising,
            }),
            config,
            store,
            dataset,
            remotes,
            constraints,
            status: status_tx,
            updates: updates_tx,
            session,
            tasks: StdMutex::new(Vec::new()),
        });

        engine.set_status(|s| s.state = EngineState::Initialising);
        engine
            .remotes
            .set_local(Some(Arc::new(CloneServices {
                engine: Arc::downgrade(&engine),
            })))
            .await?;
        engine.spawn_operation_consumer();
        engine.spawn_live_watcher();

        let initialised = match existing {
            None => engine.initialise_empty().await,
            Some(_) => engine.initialise_existing().await,
        };
        if let Err(e) = initialised {
            // Leave nothing claimed behind a failed bring-up
            let _ = engine.close().await;
            return Err(e);
        }

        let (ticks, parked) = {
            let mut inner = engine.inner.lock().await;
            inner.state = EngineState::Live;
            (
                inner.service.peek().all_ticks(),
                std::mem::take(&mut inner.buffer),
            )
        };
        let live = *engine.remotes.live().borrow();
        engine.set_status(|s| {
            s.state = EngineState::Live;
            s.outdated = false;
            s.ticks = ticks;
            s.online = live.is_some();
            s.silo = live == Some(false);
        });
        // Operations that arrived while we were initialising go through
        // ordinary causal delivery now
        for op in parked {
            if let Err(e) = engine.ingest(op).await {
                warn!("parked operation failed to apply: {}", e);
            }
        }
        info!(id = %engine.config.id, domain = %engine.config.domain, "clone is live");
        Ok(engine)
    }

    async fn initialise_empty(&self) -> EngineResult<()> {
        if self.config.genesis {
            self.dataset
                .journal()
                .init(TreeClock::genesis(), Gwc::new())
                .await?;
            debug!("bootstrapped genesis clone");
            return Ok(());
        }
        // Not genesis: there must be a domain out there to clone
        if !self.await_live().await? {
            return Err(EngineError::NotGenesis(format!(
                "no live clones of '{}' to clone from",
                self.config.domain
            )));
        }
        self.set_status(|s| s.outdated = true);
        let clock = self.remotes.new_clock().await?;
        self.inner.lock().await.service.reset(clock.clone());
        self.acquire_snapshot(clock).await
    }

    async fn initialise_existing(&self) -> EngineResult<()> {
        if self.config.genesis {
            return Err(EngineError::IsGenesis(format!(
                "domain '{}' already exists",
                self.config.domain
            )));
        }
        if !self.await_live().await.unwrap_or(false) {
            // Nobody else around: operate as a silo
            self.set_status(|s| s.silo = true);
            return Ok(());
        }
        self.inner.lock().await.state = EngineState::RevvingUp;
        self.set_status(|s| {
            s.state = EngineState::RevvingUp;
            s.outdated = true;
        });
        self.recover().await
    }

    /// Catch up with the domain: rev-up by replay, escalating to a fresh
    /// snapshot when no peer can serve our time. Network errors retry
    /// immediately, then back off exponentially up to a ceiling.
    async fn recover(&self) -> EngineResult<()> {
        let mut attempt: u32 = 0;
        loop {
            let time = self.inner.lock().await.service.peek().clone();
            match self.remotes.revup_from(time).await {
                Ok(Some(mut revup)) => {
                    let mut failed = false;
                    while let Some(item) = revup.operations.recv().await {
                        match item {
                            Ok(msg) => self.handle_remote(msg).await?,
                            Err(e) => {
                                warn!("rev-up stream error: {}", e);
                                failed = true;
                                break;
                            }
                        }
                    }
                    if !failed {
                        debug!("rev-up complete");
                        return Ok(());
                    }
                }
                Ok(None) => {
                    debug!("peer cannot rev us up; taking a snapshot");
                    let clock = self.inner.lock().await.service.peek().clone();
                    return self.acquire_snapshot(clock).await;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("rev-up request failed: {}", e),
            }
            attempt += 1;
            if attempt >= MAX_RECOVERY_ATTEMPTS {
                return Err(EngineError::Timeout(
                    "rev-up kept failing; giving up".to_string(),
                ));
            }
            if attempt > 1 {
                // First retry is immediate; after that, back off
                let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << (attempt - 2).min(10));
                let ceiling = exp.min(BACKOFF_CEILING_MS);
                let jittered = rand::rng().random_range(ceiling / 2..=ceiling);
                tokio::time::sleep(Duration::from_millis(jittered)).await;
            }
        }
    }

    /// Fetch and ingest a snapshot from a peer, replacing graph and journal.
    async fn acquire_snapshot(&self, local_time: TreeClock) -> EngineResult<()> {
        let mut snapshot = self.remotes.snapshot().await?;
        let mut batches = Vec::new();
        while let Some(item) = snapshot.batches.recv().await {
            batches.push(item?);
        }
        // Bring our clock up to date with every source in the snapshot
        let mut inner = self.inner.lock().await;
        inner.service.reset(local_time);
        for batch in &batches {
            if let SnapshotBatch::Operation(bytes) = batch {
                let op = self.dataset.encoder().decode(bytes)?;
                inner.service.join(&op.time);
            }
        }
        let time = inner.service.peek().clone();
        drop(inner);
        self.dataset
            .apply_snapshot(
                crate::infrastructure::dataset::SnapshotData {
                    gwc: snapshot.gwc,
                    batches,
                },
                time,
            )
            .await?;
        debug!("snapshot ingested");
        Ok(())
    }

    /// Wait (bounded by the network timeout) for remotes to report live
    /// peers.
    async fn await_live(&self) -> EngineResult<bool> {
        let mut live = self.remotes.live();
        let deadline = Duration::from_millis(self.config.network_timeout_ms);
        let wait = async {
            loop {
                if *live.borrow() == Some(true) {
                    return true;
                }
                if live.changed().await.is_err() {
                    return false;
                }
            }
        };
        Ok(tokio::time::timeout(deadline, wait).await.unwrap_or(false))
    }

    fn spawn_operation_consumer(self: &Arc<Self>) {
        let engine = Arc::downgrade(self);
        let mut ops = self.remotes.operations();
        let handle = tokio::spawn(async move {
            loop {
                let msg = match ops.recv().await {
                    Ok(msg) => msg,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("operation stream lagged by {}", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(engine) = engine.upgrade() else { break };
                if let Err(e) = engine.on_remote_message(msg).await {
                    if e.is_fatal() {
                        error!("fatal error applying remote operation: {}", e);
                        let _ = engine.close().await;
                        break;
                    }
                    warn!("failed to apply remote operation: {}", e);
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    fn spawn_live_watcher(self: &Arc<Self>) {
        let engine = Arc::downgrade(self);
        let mut live = self.remotes.live();
        let handle = tokio::spawn(async move {
            loop {
                let value = *live.borrow();
                let Some(engine) = engine.upgrade() else { break };
                engine.set_status(|s| {
                    s.online = value.is_some();
                    s.silo = s.state == EngineState::Live && value == Some(false);
                });
                drop(engine);
                if live.changed().await.is_err() {
                    break;
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    async fn on_remote_message(&self, msg: OperationMessage) -> EngineResult<()> {
        if msg.from_clone == self.config.id {
            // Someone else is publishing under our identity
            if !self.config.genesis {
                error!("another live clone claims identity '{}'", self.config.id);
                return Err(EngineError::Corruption(format!(
                    "duplicate clone identity '{}'",
                    self.config.id
                )));
            }
            return Ok(());
        }
        self.handle_remote(msg).await
    }

    /// Order a remote operation through the message service, then apply
    /// everything that became deliverable.
    async fn handle_remote(&self, msg: OperationMessage) -> EngineResult<()> {
        let op = self.dataset.encoder().decode(&msg.data)?;
        self.ingest(op).await
    }

    async fn ingest(&self, op: CausalOperation) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        if matches!(inner.state, EngineState::Closing | EngineState::Closed) {
            return Err(EngineError::Closed);
        }
        if inner.state == EngineState::Initialising {
            // The journal is not ready yet; park the operation, the buffer
            // drains with the first post-init delivery
            inner.buffer.push(op);
            return Ok(());
        }

        let mut delivered: Vec<CausalOperation> = Vec::new();
        let EngineInner {
            service, buffer, ..
        } = &mut *inner;
        service.receive(op, buffer, &mut |op, _| {
            delivered.push(op);
            Ok(())
        })?;

        if inner.buffer.len() > self.config.max_buffered {
            warn!(
                buffered = inner.buffer.len(),
                "reorder buffer overflow; scheduling snapshot recovery"
            );
            inner.buffer.clear();
            self.set_status(|s| s.outdated = true);
            let time = inner.service.peek().clone();
            drop(inner);
            self.acquire_snapshot(time).await?;
            self.set_status(|s| s.outdated = false);
            return Ok(());
        }

        for op in delivered {
            if op.is_empty() {
                // Nothing to apply, but the joined time is kept
                let time = inner.service.peek().clone();
                self.dataset.journal().update_time(time).await?;
                continue;
            }
            let time = inner.service.send();
            let applied = self.dataset.apply(&op, &time).await?;
            self.set_status(|s| s.ticks = time.all_ticks());
            if let Some(update) = applied {
                let _ = self.updates.send(update.clone());
                self.constraint_reactions(&mut inner, &update).await?;
            }
        }
        Ok(())
    }

    /// Run each constraint's `apply` against a remote update; any corrective
    /// patch becomes a fresh local transaction, published like any other.
    async fn constraint_reactions(
        &self,
        inner: &mut EngineInner,
        update: &DatasetUpdate,
    ) -> EngineResult<()> {
        for constraint in &self.constraints {
            if let Some(patch) = constraint.apply(self.dataset.as_ref(), update).await? {
                let resolved = self.dataset.resolve(&patch).await?;
                if resolved.is_empty() {
                    continue;
                }
                let time = inner.service.send();
                let (op, extra) = self.dataset.transact(&resolved, &time).await?;
                self.publish(&op).await;
                let _ = self.updates.send(extra);
                debug!("constraint emitted corrective operation");
            }
        }
        Ok(())
    }

    async fn publish(&self, op: &CausalOperation) {
        let data = match self.dataset.encoder().encode(op) {
            Ok(data) => data,
            Err(e) => {
                error!("failed to encode outbound operation: {}", e);
                return;
            }
        };
        let msg = OperationMessage {
            from_clone: self.config.id.clone(),
            data,
        };
        if let Err(e) = self.remotes.publish(msg).await {
            // Best effort: a silo keeps its writes in the journal for
            // later rev-up
            debug!("publish failed (buffering in journal): {}", e);
        }
    }

    /// Commit a local write transaction. Returns the transaction id, or
    /// `None` when the patch resolves to nothing.
    pub async fn write(&self, patch: Patch) -> EngineResult<Option<Tid>> {
        let mut inner = self.inner.lock().await;
        if !matches!(inner.state, EngineState::Live | EngineState::RevvingUp) {
            return Err(EngineError::Closed);
        }
        let resolved = self.dataset.resolve(&patch).await?;
        let mut interim = InterimUpdate::new(resolved);
        for constraint in &self.constraints {
            constraint
                .check(self.dataset.as_ref(), &mut interim)
                .await?;
        }
        if interim.resolved.is_empty() {
            return Ok(None);
        }

        let before = inner.service.peek().clone();
        let time = inner.service.send();
        let (op, update) = match self.dataset.transact(&interim.resolved, &time).await {
            Ok(result) => result,
            Err(e) => {
                // The store is unchanged; roll the clock back too
                inner.service.reset(before);
                return Err(e);
            }
        };
        self.set_status(|s| s.ticks = time.all_ticks());
        drop(inner);

        self.publish(&op).await;
        let tid = update.tid.clone();
        let _ = self.updates.send(update);
        Ok(Some(tid))
    }

    /// Describe a subject in the current graph.
    pub async fn read(&self, subject: &str) -> EngineResult<Option<Value>> {
        {
            let inner = self.inner.lock().await;
            if matches!(inner.state, EngineState::Closing | EngineState::Closed) {
                return Err(EngineError::Closed);
            }
        }
        self.dataset.describe(subject).await
    }

    pub fn status(&self) -> watch::Receiver<CloneStatus> {
        self.status.subscribe()
    }

    pub fn updates(&self) -> broadcast::Receiver<DatasetUpdate> {
        self.updates.subscribe()
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    fn set_status(&self, mutate: impl FnOnce(&mut CloneStatus)) {
        self.status.send_modify(mutate);
    }

    /// Close the engine: detach from the domain, cancel in-flight work,
    /// release the dataset. Idempotent.
    pub async fn close(&self) -> EngineResult<()> {
        {
            let mut inner = self.inner.lock().await;
            if matches!(inner.state, EngineState::Closing | EngineState::Closed) {
                return Ok(());
            }
            inner.state = EngineState::Closing;
        }
        self.set_status(|s| s.state = EngineState::Closing);
        if let Err(e) = self.remotes.set_local(None).await {
            warn!("failed to announce leave: {}", e);
        }
        release_dataset(self.store.as_ref(), &self.config.domain, &self.session).await?;
        self.inner.lock().await.state = EngineState::Closed;
        self.set_status(|s| {
            s.state = EngineState::Closed;
            s.online = false;
        });
        info!(id = %self.config.id, "clone closed");
        // Last: close may be running on one of these tasks (fatal error
        // path), and aborting it ends this call
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        Ok(())
    }
}

/// The request-serving face of the engine, handed to remotes.
struct CloneServices {
    engine: std::sync::Weak<CloneEngine>,
}

impl CloneServices {
    fn engine(&self) -> EngineResult<Arc<CloneEngine>> {
        self.engine.upgrade().ok_or(EngineError::Closed)
    }
}

#[async_trait::async_trait]
impl LocalCloneServices for CloneServices {
    fn clone_id(&self) -> String {
        self.engine
            .upgrade()
            .map(|e| e.config.id.clone())
            .unwrap_or_default()
    }

    async fn fork_clock(&self) -> EngineResult<TreeClock> {
        let engine = self.engine()?;
        let mut inner = engine.inner.lock().await;
        let handed = inner.service.fork();
        let retained = inner.service.peek().clone();
        drop(inner);
        engine.dataset.journal().update_time(retained).await?;
        debug!("forked clock for a new clone");
        Ok(handed)
    }

    async fn snapshot(&self) -> EngineResult<(Gwc, Vec<SnapshotBatch>)> {
        let engine = self.engine()?;
        let data = engine.dataset.take_snapshot().await?;
        Ok((data.gwc, data.batches))
    }

    async fn operations_since(&self, time: TreeClock) -> EngineResult<Option<Vec<Vec<u8>>>> {
        let engine = self.engine()?;
        match engine.dataset.operations_since(&time).await? {
            Some(ops) => {
                let mut encoded = Vec::with_capacity(ops.len());
                for op in &ops {
                    encoded.push(engine.dataset.encoder().encode(op)?);
                }
                Ok(Some(encoded))
            }
            None => Ok(None),
        }
    }
}
