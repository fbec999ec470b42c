//! # Configuration
//!
//! Settings of a live session, read from a JSON file. Every field has a default, so an empty
//! object (or no file at all) is a valid configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::client::ConnectPolicy;
use crate::errors::Result;
use crate::stack::DEFAULT_ALIGNMENT;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Alignment of the stack watermark in bytes
    pub alignment: u64,
    pub connect_attempts: u32,
    pub connect_interval_ms: u64,
    /// How long a continued target may run before it counts as busy
    pub settle_ms: u64,
    pub max_frames: usize,
    /// Memory regions shown besides the registers
    pub segments: Vec<String>,
    /// Stop at `main` when the target is started
    pub break_at_main: bool,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            alignment: DEFAULT_ALIGNMENT,
            connect_attempts: 5,
            connect_interval_ms: 1000,
            settle_ms: 250,
            max_frames: 64,
            segments: vec!["stack".to_string(), "bss".to_string()],
            break_at_main: true,
        }
    }
}

impl LiveConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("loading the configuration from {}", path.display());
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn connect_policy(&self) -> ConnectPolicy {
        ConnectPolicy {
            attempts: self.connect_attempts,
            interval: Duration::from_millis(self.connect_interval_ms),
        }
    }

    pub fn settle_time(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn shows_segment(&self, name: &str) -> bool {
        self.segments.iter().any(|s| s == name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_partial_config() {
        let c: LiveConfig = serde_json::from_str(r#"{"settle_ms": 10, "segments": ["stack"]}"#)
            .unwrap();
        assert_eq!(c.settle_ms, 10);
        assert_eq!(c.alignment, 32);
        assert!(c.shows_segment("stack"));
        assert!(!c.shows_segment("bss"));
        assert_eq!(c.connect_policy().attempts, 5);
        assert_eq!(c.connect_policy().interval, Duration::from_secs(1));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(LiveConfig::load("/nonexistent/stacksight.json").is_err());
    }
}
