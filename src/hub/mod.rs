//! Stream hub
//!
//! In-process publish/subscribe fan-out that feeds recorders. Uses
//! `tokio::sync::broadcast`, so every subscriber shares the same `Bytes`
//! allocations.
//!
//! ```text
//!    [Publisher] ── broadcast() ──► StreamHub ──► Subscription ──► recorder
//!                                       │     └─► Subscription ──► recorder
//!                                       └── events(): Publish / Unpublish
//! ```

pub mod error;
pub mod frame;
pub mod source;
pub mod store;

pub use error::SourceError;
pub use frame::{FrameType, MediaFrame};
pub use source::{StreamSource, Subscription};
pub use store::{HubConfig, StreamHub};
