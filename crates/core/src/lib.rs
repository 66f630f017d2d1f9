pub mod chat;
pub mod markers;
pub mod reassembly;
pub mod sentence;

pub use chat::{ChatClient, ChatMessage, ChatRole, ChatStream};
pub use markers::{ScanOutcome, StreamMarker, scan};
pub use reassembly::ReassemblyBuffer;
pub use sentence::SentenceSplitter;
