// Storage and engine machinery
pub mod clone_engine;
pub mod dataset;
pub mod journal;
pub mod kv_store;

pub use clone_engine::{CloneEngine, CloneStatus, EngineState};
pub use dataset::{DatasetUpdate, Patch, SnapshotBatch, SnapshotData, SuSetDataset};
pub use journal::{Journal, JournalEntry, JournalState};
pub use kv_store::{KvBatch, KvStore, MemoryStore, SledStore};
