//! `viewcounter` - A shared page-view counter with live synchronization
//!
//! This library keeps one integer per page in a counter store, counts each
//! visiting session at most once after a minimum dwell, and pushes every
//! change to all mounted counters so their displays converge.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod cli;
pub mod config;
pub mod counter;
pub mod display;
pub mod dwell;
pub mod error;
pub mod logging;
pub mod session;
pub mod store;
pub mod sync;

pub use config::Config;
pub use counter::CounterRecord;
pub use display::{CounterView, StyleHint};
pub use dwell::DwellTimer;
pub use error::{Error, Result};
pub use logging::init_logging;
pub use session::{FileSessionStorage, MemorySessionStorage, SessionGate, SessionStorage};
pub use store::{CounterStore, MemoryStore, SqliteStore, Subscription};
pub use sync::{mount, SyncHandle, SyncOptions, SyncSnapshot};
