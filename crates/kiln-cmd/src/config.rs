//! # Dispatch and Queue Configuration
//!
//! Override switches read once per dispatch, and per-queue settings fixed at
//! queue creation.

use kiln_core::{ByteSize, ContextId, TaskCount};

use crate::family::CopyEngineFamily;

// =============================================================================
// DISPATCH CONFIGURATION
// =============================================================================

/// Per-dispatch override switches
///
/// `Default` gives production behavior. Each switch adds or removes
/// instructions from every encoded descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchConfig {
    /// Emit a TLB-invalidating flush before the copies
    pub force_tlb_flush_before_copy: bool,
    /// Emit a TLB-invalidating flush after the copies
    pub force_tlb_flush_after_copy: bool,
    /// Skip the pre-copy arbitration checkpoint even where hardware wants it
    pub disable_pre_copy_workaround: bool,
    /// Lower the maximum instruction width
    pub limit_max_width: Option<u64>,
    /// Lower the maximum instruction height
    pub limit_max_height: Option<u64>,
}

/// Instruction size caps used for tiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlitLimits {
    /// Maximum tile width in pixels
    pub max_width: u64,
    /// Maximum tile height in rows
    pub max_height: u64,
}

impl DispatchConfig {
    /// Family caps, lowered by any configured limit
    ///
    /// A zero limit is ignored.
    pub fn effective_limits<F: CopyEngineFamily + ?Sized>(&self, family: &F) -> BlitLimits {
        let cap = |hw: u64, limit: Option<u64>| match limit {
            Some(l) if l > 0 => hw.min(l),
            _ => hw,
        };

        BlitLimits {
            max_width: cap(family.max_instruction_width(), self.limit_max_width),
            max_height: cap(family.max_instruction_height(), self.limit_max_height),
        }
    }

    /// Read overrides from the process environment
    ///
    /// Unset variables keep their default; unparsable values are logged and
    /// ignored.
    #[cfg(feature = "std")]
    pub fn from_env() -> Self {
        fn flag(name: &str) -> bool {
            match std::env::var(name) {
                Ok(v) => match v.trim() {
                    "1" | "true" | "TRUE" => true,
                    "0" | "false" | "FALSE" => false,
                    other => {
                        log::warn!("ignoring {}={:?}: expected 0 or 1", name, other);
                        false
                    }
                },
                Err(_) => false,
            }
        }

        fn limit(name: &str) -> Option<u64> {
            let raw = std::env::var(name).ok()?;
            match raw.trim().parse::<u64>() {
                Ok(0) | Err(_) => {
                    log::warn!("ignoring {}={:?}: expected a positive integer", name, raw);
                    None
                }
                Ok(v) => Some(v),
            }
        }

        Self {
            force_tlb_flush_before_copy: flag("KILN_FORCE_TLB_FLUSH_BEFORE_COPY"),
            force_tlb_flush_after_copy: flag("KILN_FORCE_TLB_FLUSH_AFTER_COPY"),
            disable_pre_copy_workaround: flag("KILN_DISABLE_PRE_COPY_WORKAROUND"),
            limit_max_width: limit("KILN_LIMIT_BLITTER_MAX_WIDTH"),
            limit_max_height: limit("KILN_LIMIT_BLITTER_MAX_HEIGHT"),
        }
    }
}

// =============================================================================
// KMD NOTIFY
// =============================================================================

/// Poll-then-sleep policy for completion waits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KmdNotifyConfig {
    /// Poll with a timeout before the blocking OS wait
    pub enabled: bool,
    /// Poll duration before falling back to the OS wait
    pub delay_us: u64,
    /// Poll duration when the caller asks for a quick sleep
    pub quick_sleep_delay_us: u64,
}

impl Default for KmdNotifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_us: 150,
            quick_sleep_delay_us: 20,
        }
    }
}

/// Polling bounds for one wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitParams {
    /// Stop polling after `timeout_us`
    pub enable_timeout: bool,
    /// Polling budget
    pub timeout_us: u64,
}

impl KmdNotifyConfig {
    /// Polling bounds for waiting on `target` while the tag reads `current`
    pub fn timeout_params(
        &self,
        quick_sleep: bool,
        current: TaskCount,
        target: TaskCount,
    ) -> WaitParams {
        if !self.enabled {
            return WaitParams {
                enable_timeout: false,
                timeout_us: 0,
            };
        }

        let timeout_us = if current >= target {
            0
        } else if quick_sleep {
            self.quick_sleep_delay_us
        } else {
            self.delay_us
        };

        WaitParams {
            enable_timeout: true,
            timeout_us,
        }
    }
}

// =============================================================================
// QUEUE CONFIGURATION
// =============================================================================

/// Per-queue settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Hardware context the queue submits to
    pub context: ContextId,
    /// Command buffer segment size, rounded up to 64 KiB
    pub command_buffer_size: ByteSize,
    /// Drain the global sequencer before each batch end
    pub global_sequencer_flush: bool,
    /// Wait policy
    pub kmd_notify: KmdNotifyConfig,
    /// Interval between hang checks while polling
    pub gpu_hang_check_period_us: u64,
    /// Never ask the transport about hangs while polling
    pub disable_gpu_hang_detection: bool,
}

impl QueueConfig {
    /// Segment size granularity
    pub const COMMAND_BUFFER_ALIGNMENT: u64 = ByteSize::KIB_64.as_bytes();

    /// Segment size after rounding
    pub fn segment_size(&self) -> ByteSize {
        let size = self.command_buffer_size.as_bytes().max(1);
        ByteSize::from_bytes(size).align_up(Self::COMMAND_BUFFER_ALIGNMENT)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            context: ContextId(0),
            command_buffer_size: ByteSize::KIB_64,
            global_sequencer_flush: false,
            kmd_notify: KmdNotifyConfig::default(),
            gpu_hang_check_period_us: 500_000,
            disable_gpu_hang_detection: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::Gen12Family;

    #[test]
    fn test_limits_only_lower() {
        let family = Gen12Family::new();
        let config = DispatchConfig {
            limit_max_width: Some(1 << 20),
            limit_max_height: Some(8),
            ..Default::default()
        };
        let limits = config.effective_limits(&family);
        assert_eq!(limits.max_width, family.max_instruction_width());
        assert_eq!(limits.max_height, 8);

        let zero = DispatchConfig {
            limit_max_width: Some(0),
            ..Default::default()
        };
        assert_eq!(
            zero.effective_limits(&family).max_width,
            family.max_instruction_width()
        );
    }

    #[test]
    fn test_kmd_notify_params() {
        let notify = KmdNotifyConfig::default();
        assert_eq!(notify.timeout_params(false, 1, 2).timeout_us, 150);
        assert_eq!(notify.timeout_params(true, 1, 2).timeout_us, 20);
        assert_eq!(notify.timeout_params(false, 2, 2).timeout_us, 0);

        let disabled = KmdNotifyConfig {
            enabled: false,
            ..notify
        };
        assert!(!disabled.timeout_params(false, 0, 5).enable_timeout);
    }

    #[test]
    fn test_segment_size_rounding() {
        let config = QueueConfig {
            command_buffer_size: ByteSize::from_bytes(70_000),
            ..Default::default()
        };
        assert_eq!(config.segment_size(), ByteSize::from_kib(128));
    }
}
