// Core primitives: logical time, operations and their encodings
pub mod encoding;
pub mod gwc;
pub mod messages;
pub mod operation;
pub mod tree_clock;
pub mod triples;

pub use encoding::OperationEncoder;
pub use gwc::Gwc;
pub use messages::{MessageService, TimedMessage};
pub use operation::{CausalOperation, ReifiedTriple, OPERATION_VERSION};
pub use tree_clock::{ProcessPath, Tid, TreeClock};
pub use triples::{Term, Triple};
