//! Recording configuration
//!
//! - [`RecordConfig`]: serde schema, one [`FormatPolicy`] per format plus the
//!   shared [`SubscribePolicy`]
//! - [`RecordPolicies`]: compiled snapshot answering `need_record` and
//!   `resolve_path`

pub mod filter;
pub mod policy;
pub mod template;

pub use filter::{FilterRule, StreamFilter};
pub use policy::{FormatPolicy, Policy, RecordConfig, RecordPolicies, SubscribePolicy, CODEC_EXT};
