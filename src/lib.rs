//! stream-record: live stream recorder
//!
//! Records published live streams to disk as FLV, progressive MP4,
//! fragmented MP4, HLS or raw elementary streams, driven by publish and
//! unpublish events.
//!
//! # Architecture
//!
//! ```text
//!   publisher ──► StreamHub ──events──► RecordService ──► RecorderRegistry
//!                    │                        │                 │
//!                    │                 RecordPolicies      one task per
//!                    │                 (ArcSwap snapshot)  (stream, format)
//!                    │                                          │
//!                    └──────── frames (broadcast) ─────────► Recorder
//!                                                               │
//!                                                  .flv .mp4 .m3u8/.ts .h264 .aac
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use stream_record::{FormatPolicy, RecordConfig, RecordFormat, RecordService, StreamHub};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let hub = Arc::new(StreamHub::new());
//!     let config = RecordConfig::default()
//!         .with_format(RecordFormat::Flv, FormatPolicy::enabled().path("./recordings"));
//!     let service = RecordService::with_config(hub.clone(), &config)?;
//!     tokio::spawn(Arc::clone(&service).run(hub.events()));
//!
//!     hub.publish("live/cam1").await?;
//!     // feed frames with hub.broadcast(...)
//!     hub.unpublish("live/cam1").await;
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod amf;
pub mod config;
pub mod error;
pub mod event;
pub mod format;
pub mod hub;
pub mod media;
pub mod recorder;
pub mod recovery;
pub mod registry;
pub mod service;
pub mod stats;

pub use config::{FilterRule, FormatPolicy, RecordConfig, RecordPolicies, SubscribePolicy};
pub use error::{RecordError, Result};
pub use event::RecordEvent;
pub use format::RecordFormat;
pub use hub::{MediaFrame, StreamHub, StreamSource};
pub use recorder::Recorder;
pub use registry::{RecorderKey, RecorderRegistry};
pub use service::RecordService;
pub use stats::RecordingStats;
