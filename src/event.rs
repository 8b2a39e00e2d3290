//! Events consumed by the record service

use crate::config::RecordConfig;

/// Inbound event
#[derive(Debug, Clone)]
pub enum RecordEvent {
    /// Replace every format policy
    ConfigReload(RecordConfig),
    /// A stream started publishing
    Publish { stream: String },
    /// A stream stopped publishing
    Unpublish { stream: String },
}

impl RecordEvent {
    pub fn publish(stream: impl Into<String>) -> Self {
        RecordEvent::Publish {
            stream: stream.into(),
        }
    }

    pub fn unpublish(stream: impl Into<String>) -> Self {
        RecordEvent::Unpublish {
            stream: stream.into(),
        }
    }
}
