//! Navy Slate Remote
//!
//! Everything that talks to the hosted backend:
//! - [`Backend`]: the table/RPC/edge-function contract
//! - [`MemoryBackend`]: in-process implementation for tests and simulation
//! - [`RemoteAccessor`], [`ProfileAccessor`], [`LedgerAccessor`]: typed,
//!   single-round-trip accessors
//! - [`PushDispatcher`]: partner push notifications

#![warn(unreachable_pub)]

pub mod accessor;
pub mod backend;
pub mod ledger;
pub mod memory;
pub mod profile;
pub mod push;
pub mod table;

pub use accessor::{decode_row, encode_row, RemoteAccessor};
pub use backend::{Backend, Filter, RemoteResult};
pub use ledger::LedgerAccessor;
pub use memory::{ChangeEvent, ChangeKind, MemoryBackend, Operation, ADJUST_POINTS_RPC};
pub use profile::{AdjustPointsArgs, ProfileAccessor};
pub use push::{EdgeFunctionPush, PushDispatcher, PushKind, PushMessage, PUSH_FUNCTION};
pub use table::Table;
