//! Construction-time configuration.
//!
//! Each pipeline has its own config struct with a `Default`; [`QtpConfig`]
//! bundles them and can be loaded from JSON. Durations are written as
//! milliseconds.
//!
//! ```json
//! {
//!   "reconnect": { "max_attempts": 5, "retry_delay_ms": 2000 },
//!   "reader": { "data_capacity": 1000, "ack_capacity": 1000 },
//!   "writer": { "send_capacity": 1000,
//!               "retry": { "attempts": 3, "timeout_ms": 10000, "interval_ms": 2000 } },
//!   "sender": { "submit_capacity": 1000 }
//! }
//! ```
//!
//! Missing fields take their default values.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::reader::ReaderConfig;
use crate::sender::SenderConfig;
use crate::transport::ReconnectConfig;
use crate::writer::WriterConfig;

/// Settings for one endpoint and every session it creates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QtpConfig {
    /// Client-side reconnect policy.
    pub reconnect: ReconnectConfig,
    pub reader: ReaderConfig,
    /// Send queue and retry timing.
    pub writer: WriterConfig,
    pub sender: SenderConfig,
}

impl QtpConfig {
    /// Parse a configuration from JSON text.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize the configuration as pretty-printed JSON.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Serde adapter storing a `Duration` as whole milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
