use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::core::encoding::OperationEncoder;
use crate::core::gwc::Gwc;
use crate::core::operation::CausalOperation;
use crate::core::tree_clock::{Tid, TreeClock};
use crate::error::{EngineError, EngineResult};
use crate::infrastructure::kv_store::{KvBatch, KvStore};

const STATE_KEY: &str = "journal";
const TICK_PREFIX: &str = "tick:";
const OP_PREFIX: &str = "op:";
const OP_CACHE_SIZE: usize = 256;

/// Lexically-sortable tick key: 8 base-36 digits, zero-padded.
pub fn tick_key(tick: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut tick = tick;
    let mut buf = [b'0'; 8];
    let mut at = 8;
    while tick > 0 && at > 0 {
        at -= 1;
        buf[at] = DIGITS[(tick % 36) as usize];
        tick /= 36;
    }
    format!("{}{}", TICK_PREFIX, std::str::from_utf8(&buf).unwrap())
}

pub fn op_key(tid: &Tid) -> String {
    format!("{}{}", OP_PREFIX, tid)
}

/// The TID of the domain's genesis clock; every per-process entry chain
/// bottoms out here.
pub fn genesis_tid() -> Tid {
    TreeClock::genesis().hash()
}

/// Journal state: the greatest local tick with an entry, the engine's
/// current clock, the merged view of all operation times, and the GWC at
/// journal birth (bounds what `operations_since` can replay).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalState {
    pub tail_tick: u64,
    pub time: TreeClock,
    pub gwc: Gwc,
    pub start_gwc: Gwc,
}

/// One journal entry: local tick, the per-source predecessor link, and the
/// TID of the operation it records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub tick: u64,
    pub prev_tick: u64,
    pub prev_tid: Tid,
    pub tid: Tid,
}

/// Stored operation record: wire-encoded bytes plus the predecessor link,
/// so causal walks need no entry scan.
#[derive(Serialize, Deserialize)]
struct StoredOperation {
    prev_tick: u64,
    prev_tid: Tid,
    #[serde(with = "serde_bytes")]
    bytes: Vec<u8>,
}

/// Durable, append-mostly record of local and remote operations, indexed by
/// local tick and by TID. Contiguous same-source appends are fused into a
/// single operation covering the combined tick range.
pub struct Journal {
    store: Arc<dyn KvStore>,
    encoder: OperationEncoder,
    state: RwLock<Option<JournalState>>,
    op_cache: Mutex<LruCache<Tid, CausalOperation>>,
    /// Serialises history-spanning work: fusion splices, causal reduction,
    /// disposal of unreferenced operations.
    body_lock: Mutex<()>,
}

impl Journal {
    pub fn new(store: Arc<dyn KvStore>, encoder: OperationEncoder) -> Self {
        Self {
            store,
            encoder,
            state: RwLock::new(None),
            op_cache: Mutex::new(LruCache::new(NonZeroUsize::new(OP_CACHE_SIZE).unwrap())),
            body_lock: Mutex::new(()),
        }
    }

    /// Load persisted state, if any, caching it for subsequent access.
    pub async fn load(&self) -> EngineResult<Option<JournalState>> {
        if let Some(state) = self.state.read().await.clone() {
            return Ok(Some(state));
        }
        match self.store.get(STATE_KEY).await? {
            Some(bytes) => {
                let state: JournalState = rmp_serde::from_slice(&bytes)?;
                *self.state.write().await = Some(state.clone());
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    /// Initialise a fresh journal with the given clock and starting GWC.
    pub async fn init(&self, time: TreeClock, start_gwc: Gwc) -> EngineResult<JournalState> {
        let state = JournalState {
            tail_tick: 0,
            time,
            gwc: start_gwc.clone(),
            start_gwc,
        };
        self.store
            .put(STATE_KEY, rmp_serde::to_vec(&state)?)
            .await?;
        *self.state.write().await = Some(state.clone());
        Ok(state)
    }

    pub async fn state(&self) -> EngineResult<JournalState> {
        self.load()
            .await?
            .ok_or_else(|| EngineError::Corruption("journal state missing".to_string()))
    }

    /// Persist a clock movement that produced no entry (a no-op join).
    pub async fn update_time(&self, time: TreeClock) -> EngineResult<()> {
        let mut state = self.state().await?;
        state.time = time;
        self.store
            .put(STATE_KEY, rmp_serde::to_vec(&state)?)
            .await?;
        *self.state.write().await = Some(state);
        Ok(())
    }

    /// Append an operation under the engine's post-tick clock. If the new
    /// operation is the causal successor of the tail entry from the same
    /// source, the two are fused in place of a second entry.
    pub async fn commit(
        &self,
        op: &CausalOperation,
        local_time: &TreeClock,
    ) -> EngineResult<JournalEntry> {
        self.commit_with(op, local_time, KvBatch::new()).await
    }

    /// `commit` with caller-supplied writes (dataset mutations) folded into
    /// the same atomic batch.
    pub async fn commit_with(
        &self,
        op: &CausalOperation,
        local_time: &TreeClock,
        mut batch: KvBatch,
    ) -> EngineResult<JournalEntry> {
        let _body = self.body_lock.lock().await;
        let mut state = self.state().await?;
        let tick = local_time.ticks();

        let tail = self.tail_entry(&state).await?;
        let fusable = match &tail {
            Some(tail_entry) => {
                let tail_op = self.operation_required(&tail_entry.tid).await?;
                (tail_op.time.process_path() == op.time.process_path()
                    && op.from == tail_op.time.ticks() + 1)
                    .then_some((tail_entry.clone(), tail_op))
            }
            None => None,
        };

        let (entry, stored_op) = match fusable {
            Some((tail_entry, tail_op)) => {
                let fused = tail_op.fuse(op);
                debug!(
                    from = fused.from,
                    to = fused.time.ticks(),
                    "fusing contiguous operations"
                );
                batch.delete(tick_key(tail_entry.tick));
                batch.delete(op_key(&tail_entry.tid));
                self.op_cache.lock().await.pop(&tail_entry.tid);
                let entry = JournalEntry {
                    tick,
                    prev_tick: tail_entry.prev_tick,
                    prev_tid: tail_entry.prev_tid.clone(),
                    tid: fused.tid(),
                };
                (entry, fused)
            }
            None => {
                let (prev_tick, prev_tid) = state
                    .gwc
                    .prev(&op.time)
                    .unwrap_or_else(|| (0, genesis_tid()));
                let entry = JournalEntry {
                    tick,
                    prev_tick,
                    prev_tid,
                    tid: op.tid(),
                };
                (entry, op.clone())
            }
        };

        let record = StoredOperation {
            prev_tick: entry.prev_tick,
            prev_tid: entry.prev_tid.clone(),
            bytes: self.encoder.encode(&stored_op)?,
        };
        batch.put(tick_key(tick), rmp_serde::to_vec(&entry)?);
        batch.put(op_key(&entry.tid), rmp_serde::to_vec(&record)?);

        state.tail_tick = tick;
        state.time = local_time.clone();
        state.gwc.observe(&op.time, op.tid());
        batch.put(STATE_KEY, rmp_serde::to_vec(&state)?);

        self.store.commit(batch).await?;
        self.op_cache.lock().await.put(entry.tid.clone(), stored_op);
        *self.state.write().await = Some(state);
        trace!(tick, tid = %entry.tid, "journal entry committed");
        Ok(entry)
    }

    async fn tail_entry(&self, state: &JournalState) -> EngineResult<Option<JournalEntry>> {
        if state.tail_tick == 0 {
            return Ok(None);
        }
        match self.store.get(&tick_key(state.tail_tick)).await? {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Fetch a stored operation by TID.
    pub async fn operation(&self, tid: &Tid) -> EngineResult<Option<CausalOperation>> {
        if let Some(op) = self.op_cache.lock().await.get(tid) {
            return Ok(Some(op.clone()));
        }
        match self.store.get(&op_key(tid)).await? {
            Some(bytes) => {
                let record: StoredOperation = rmp_serde::from_slice(&bytes)?;
                let op = self.encoder.decode(&record.bytes)?;
                self.op_cache.lock().await.put(tid.clone(), op.clone());
                Ok(Some(op))
            }
            None => Ok(None),
        }
    }

    pub async fn operation_required(&self, tid: &Tid) -> EngineResult<CausalOperation> {
        self.operation(tid)
            .await?
            .ok_or_else(|| EngineError::Corruption(format!("operation {} missing", tid)))
    }

    /// Store an operation record without a journal entry. Used when
    /// ingesting a snapshot, which carries each live source's most recent
    /// operation for serving rev-ups.
    pub async fn seed_operation(&self, op: &CausalOperation) -> EngineResult<()> {
        let record = StoredOperation {
            prev_tick: 0,
            prev_tid: genesis_tid(),
            bytes: self.encoder.encode(op)?,
        };
        self.store
            .put(&op_key(&op.tid()), rmp_serde::to_vec(&record)?)
            .await?;
        Ok(())
    }

    /// The per-source predecessor link stored for `tid`.
    pub async fn entry_prev(&self, tid: &Tid) -> EngineResult<Option<(u64, Tid)>> {
        match self.store.get(&op_key(tid)).await? {
            Some(bytes) => {
                let record: StoredOperation = rmp_serde::from_slice(&bytes)?;
                Ok(Some((record.prev_tick, record.prev_tid)))
            }
            None => Ok(None),
        }
    }

    /// The next journal entry strictly after a local tick.
    pub async fn entry_after(&self, tick: u64) -> EngineResult<Option<JournalEntry>> {
        match self
            .store
            .next_after(&tick_key(tick), TICK_PREFIX)
            .await?
        {
            Some((_, bytes)) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Walk backward along `prev` links while contiguous with `op` and not
    /// below `min_from`, then fold forward into one fused operation
    /// covering the whole range.
    pub async fn causal_reduce(
        &self,
        op: CausalOperation,
        min_from: u64,
    ) -> EngineResult<CausalOperation> {
        let _body = self.body_lock.lock().await;
        let mut chain = vec![op];
        loop {
            let cur = chain.last().unwrap();
            if cur.from <= min_from {
                break;
            }
            let Some((_, prev_tid)) = self.entry_prev(&cur.tid()).await? else {
                break;
            };
            let Some(prev_op) = self.operation(&prev_tid).await? else {
                break;
            };
            // Fork boundary or discontinuity ends the walk
            if prev_op.time.process_path() != cur.time.process_path()
                || prev_op.time.ticks() + 1 != cur.from
                || prev_op.time.ticks() < min_from
            {
                break;
            }
            chain.push(prev_op);
        }
        let mut fused = chain.pop().unwrap();
        while let Some(next) = chain.pop() {
            fused = fused.fuse(&next);
        }
        Ok(fused)
    }

    /// An operation is disposable iff no journal entry references it and
    /// its TID is no process's latest in the GWC.
    pub async fn dispose_if_unreferenced(&self, tid: &Tid) -> EngineResult<bool> {
        let _body = self.body_lock.lock().await;
        let state = self.state().await?;
        if state.gwc.contains_tid(tid) {
            return Ok(false);
        }
        for (_, bytes) in self.store.scan_prefix(TICK_PREFIX).await? {
            let entry: JournalEntry = rmp_serde::from_slice(&bytes)?;
            if entry.tid == *tid {
                return Ok(false);
            }
        }
        let mut batch = KvBatch::new();
        batch.delete(op_key(tid));
        self.store.commit(batch).await?;
        self.op_cache.lock().await.pop(tid);
        debug!(tid = %tid, "disposed unreferenced operation");
        Ok(true)
    }
}
