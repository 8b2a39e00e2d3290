//! Recorder registry
//!
//! Tracks every active recording and guarantees at most one recorder per
//! (stream, format) pair.
//!
//! ```text
//!                      Arc<RecorderRegistry>
//!                 ┌──────────────────────────────┐
//!                 │ entries: HashMap<Key,        │
//!                 │   RecorderEntry {            │
//!                 │     stop: watch::Tx,         │
//!                 │     done: watch::Rx,         │
//!                 │     task: JoinHandle,        │
//!                 │   }                          │
//!                 │ >                            │
//!                 └──────────────┬───────────────┘
//!                                │
//!        try_start() ── spawn ──►│◄── stop() ── signal, wait for done
//!                                │
//!                     recorder task deregisters
//!                     itself when it finishes
//! ```

pub mod key;
pub mod store;

pub use key::RecorderKey;
pub use store::{RecorderInfo, RecorderRegistry, RecorderTicket, StopSignal};
