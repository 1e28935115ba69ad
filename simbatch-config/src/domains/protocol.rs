//! Wire protocol limits

use serde::{Deserialize, Serialize};

use crate::error::ConfigResult;
use crate::validation::{validate_at_least, Validatable};

/// Wire protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Largest accepted frame payload
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Largest accepted part count per frame
    #[serde(default = "default_max_parts")]
    pub max_parts: usize,

    /// Deepest accepted list nesting
    #[serde(default = "default_max_list_depth")]
    pub max_list_depth: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: default_max_frame_bytes(),
            max_parts: default_max_parts(),
            max_list_depth: default_max_list_depth(),
        }
    }
}

impl Validatable for ProtocolConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_at_least(self.max_frame_bytes, 1024, "max_frame_bytes", self.domain_name())?;
        validate_at_least(self.max_parts, 2, "max_parts", self.domain_name())?;
        validate_at_least(self.max_list_depth, 1, "max_list_depth", self.domain_name())?;
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "protocol"
    }
}

fn default_max_frame_bytes() -> usize {
    128 * 1024 * 1024 // 128 MiB
}

fn default_max_parts() -> usize {
    65_536
}

fn default_max_list_depth() -> usize {
    64
}
