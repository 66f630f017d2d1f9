//! Per-Client Session Management
//!
//! Everything that runs on behalf of one connected client lives here,
//! organized into submodules:
//!
//! - `events`: the event and state vocabulary of the session task.
//! - `machine`: the state machine task owning all per-client state.
//! - `arbiter`: deduplication of concurrent reconnect triggers.
//! - `speaker`: the sentence queue feeding the synthesis link.
//! - `relay`: the streaming chat relay for one turn.

pub mod arbiter;
pub mod events;
pub mod machine;
pub mod relay;
pub mod speaker;

pub use events::{AvatarState, ReconnectCause, SessionEvent, SessionSnapshot};
pub use machine::{ClientSession, SessionDeps};
