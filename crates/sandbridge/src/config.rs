use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const DEFAULT_REGION_CAPACITY: usize = 1024 * 1024;
const MIN_REGION_CAPACITY: usize = 256;
const DEFAULT_WAIT_SLICE_MS: u64 = 50;
const DEFAULT_HOSTCALL_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_QUEUED_MESSAGES: usize = 10_000;
const DEFAULT_WORKER_NAME: &str = "sandbridge-worker";

/// Tunables for one host/sandbox pair.
///
/// Every field has a default, so a partial JSON document is a valid
/// configuration. Unknown fields are rejected.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Size in bytes of the shared region slot. Bounds every sync frame.
    pub region_capacity: usize,
    /// How often a blocked sandbox re-checks for closure.
    pub wait_slice_ms: u64,
    /// Upper bound on a single host call before it is answered with an error.
    pub hostcall_timeout_ms: u64,
    /// Output queue bound. The oldest entry is dropped past this.
    pub max_queued_messages: usize,
    /// Name of the sandbox thread.
    pub worker_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            region_capacity: DEFAULT_REGION_CAPACITY,
            wait_slice_ms: DEFAULT_WAIT_SLICE_MS,
            hostcall_timeout_ms: DEFAULT_HOSTCALL_TIMEOUT_MS,
            max_queued_messages: DEFAULT_MAX_QUEUED_MESSAGES,
            worker_name: DEFAULT_WORKER_NAME.to_string(),
        }
    }
}

impl SessionConfig {
    /// Parse and validate a JSON configuration document.
    ///
    /// # Errors
    /// Returns [`Error::Config`] for malformed JSON, unknown fields or
    /// out-of-range values.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`Error::Config`] naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.region_capacity < MIN_REGION_CAPACITY {
            return Err(Error::Config(format!(
                "region_capacity must be at least {MIN_REGION_CAPACITY} bytes"
            )));
        }
        if self.wait_slice_ms == 0 {
            return Err(Error::Config("wait_slice_ms must be positive".into()));
        }
        if self.hostcall_timeout_ms == 0 {
            return Err(Error::Config("hostcall_timeout_ms must be positive".into()));
        }
        if self.max_queued_messages == 0 {
            return Err(Error::Config("max_queued_messages must be positive".into()));
        }
        if self.worker_name.is_empty() {
            return Err(Error::Config("worker_name must not be empty".into()));
        }
        Ok(())
    }

    #[must_use]
    pub const fn wait_slice(&self) -> Duration {
        Duration::from_millis(self.wait_slice_ms)
    }

    #[must_use]
    pub const fn hostcall_timeout(&self) -> Duration {
        Duration::from_millis(self.hostcall_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_document_keeps_defaults() {
        let config = SessionConfig::from_json(r#"{"region_capacity": 4096}"#).unwrap();
        assert_eq!(config.region_capacity, 4096);
        assert_eq!(config.wait_slice(), Duration::from_millis(50));
        assert_eq!(config.worker_name, "sandbridge-worker");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = SessionConfig::from_json(r#"{"region_size": 4096}"#).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("region_size")));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(SessionConfig::from_json(r#"{"region_capacity": 8}"#).is_err());
        assert!(SessionConfig::from_json(r#"{"wait_slice_ms": 0}"#).is_err());
        assert!(SessionConfig::from_json(r#"{"worker_name": ""}"#).is_err());
        assert!(SessionConfig::default().validate().is_ok());
    }
}
