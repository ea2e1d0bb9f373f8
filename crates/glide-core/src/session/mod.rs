//! Rental session orchestration.
//!
//! Everything a session is made of lives here:
//!
//! - [`state`]: phases, session ids, and the published status snapshot
//! - [`signal`]: the external inputs a running session accepts
//! - [`journal`]: the completion journal that makes crashes resumable
//! - [`projection`]: the watch channel queries are served from
//! - [`machine`]: the worker loop that owns one session's state
//! - [`runtime`]: the multi-session surface that spawns and reaches
//!   workers

pub mod journal;
pub mod machine;
pub mod projection;
pub mod runtime;
pub mod signal;
pub mod state;

pub use journal::{CompletionJournal, FileJournal, JournalError, MemoryJournal};
pub use machine::{RentalRequest, SessionError, SessionMachine};
pub use projection::{StatusPublisher, StatusReader};
pub use runtime::{RuntimeError, SessionRuntime};
pub use signal::Signal;
pub use state::{Phase, SessionId, StatusSnapshot};
