use serde::{Deserialize, Serialize};

#[cfg(feature = "cli")]
use clap::Args;

/// Smallest ATT MTU every link supports before negotiation.
pub const DEFAULT_ATT_MTU: u16 = 23;

/// ATT write header (opcode + handle) subtracted from the MTU.
pub const ATT_WRITE_HEADER: usize = 3;

/// Limits handed to the Module Runtime when it is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(Args))]
pub struct RuntimeLimits {
    /// Interpreter stack size in bytes
    #[cfg_attr(feature = "cli", arg(long, default_value_t = 8192))]
    #[serde(default = "default_stack_size")]
    pub stack_size: usize,

    /// Module heap size in bytes
    #[cfg_attr(feature = "cli", arg(long, default_value_t = 8192))]
    #[serde(default = "default_heap_size")]
    pub heap_size: usize,

    /// Instruction budget per call (unbounded when absent)
    #[cfg_attr(feature = "cli", arg(long))]
    #[serde(default)]
    pub fuel: Option<u64>,
}

fn default_stack_size() -> usize {
    8192
}
fn default_heap_size() -> usize {
    8192
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        Self {
            stack_size: default_stack_size(),
            heap_size: default_heap_size(),
            fuel: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(Args))]
pub struct EngineConfig {
    /// Module reassembly buffer capacity in bytes
    #[cfg_attr(feature = "cli", arg(long, default_value_t = 32 * 1024))]
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Work queue depth between transport and worker
    #[cfg_attr(feature = "cli", arg(long, default_value_t = 4))]
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Number of resource registry slots
    #[cfg_attr(feature = "cli", arg(long, default_value_t = 256))]
    #[serde(default = "default_registry_capacity")]
    pub registry_capacity: usize,

    /// Largest firmware image the update service buffers
    #[cfg_attr(feature = "cli", arg(long, default_value_t = 64 * 1024))]
    #[serde(default = "default_dfu_capacity")]
    pub dfu_capacity: usize,

    /// MTU assumed until the transport reports a negotiated one
    #[cfg_attr(feature = "cli", arg(long, default_value_t = DEFAULT_ATT_MTU))]
    #[serde(default = "default_mtu")]
    pub default_mtu: u16,

    #[cfg_attr(feature = "cli", command(flatten))]
    #[serde(default)]
    pub runtime: RuntimeLimits,
}

fn default_buffer_capacity() -> usize {
    32 * 1024
}
fn default_queue_capacity() -> usize {
    4
}
fn default_registry_capacity() -> usize {
    256
}
fn default_dfu_capacity() -> usize {
    64 * 1024
}
fn default_mtu() -> u16 {
    DEFAULT_ATT_MTU
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            queue_capacity: default_queue_capacity(),
            registry_capacity: default_registry_capacity(),
            dfu_capacity: default_dfu_capacity(),
            default_mtu: default_mtu(),
            runtime: RuntimeLimits::default(),
        }
    }
}

impl EngineConfig {
    /// Largest attribute write the transport can deliver for `mtu`.
    pub fn max_write_len(mtu: u16) -> usize {
        (mtu as usize).saturating_sub(ATT_WRITE_HEADER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_firmware_constants() {
        let config = EngineConfig::default();
        assert_eq!(config.buffer_capacity, 32768);
        assert_eq!(config.queue_capacity, 4);
        assert_eq!(config.registry_capacity, 256);
        assert_eq!(config.dfu_capacity, 65536);
        assert_eq!(config.runtime.stack_size, 8192);
        assert_eq!(config.runtime.fuel, None);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"queue_capacity": 8}"#).unwrap();
        assert_eq!(config.queue_capacity, 8);
        assert_eq!(config.buffer_capacity, 32768);
        assert_eq!(config.runtime, RuntimeLimits::default());
    }

    #[test]
    fn test_max_write_len() {
        assert_eq!(EngineConfig::max_write_len(23), 20);
        assert_eq!(EngineConfig::max_write_len(247), 244);
        assert_eq!(EngineConfig::max_write_len(2), 0);
    }
}
