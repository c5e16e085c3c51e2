//! Collector configuration: `key=value` pairs parsed at init (spec §6).
//!
//! Mirrors the knobs a real managed-runtime GC is tuned with: which major
//! collector backend to run, which write-barrier/remembered-set strategy,
//! heap sizing, worker count, and the debug knobs used for fuzzing/tracing.

use crate::error::{GcError, GcResult};

/// Which major-collector backend to run (spec §6 `major=`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MajorKind {
    /// Sequential mark-and-sweep.
    MarkSweep,
    /// Mark-and-sweep with a fixed heap (no growth beyond `max-heap-size`).
    MarkSweepFixed,
    /// Mark-and-sweep with parallel tracing.
    MarkSweepParallel,
    /// Fixed-heap mark-and-sweep with parallel tracing.
    MarkSweepFixedParallel,
    /// Copying (evacuating) major collector.
    Copying,
}

impl MajorKind {
    fn parse(value: &str) -> GcResult<Self> {
        Ok(match value {
            "marksweep" => MajorKind::MarkSweep,
            "marksweep-fixed" => MajorKind::MarkSweepFixed,
            "marksweep-par" => MajorKind::MarkSweepParallel,
            "marksweep-fixed-par" => MajorKind::MarkSweepFixedParallel,
            "copying" => MajorKind::Copying,
            other => {
                return Err(GcError::UnknownVariant {
                    key: "major".into(),
                    value: other.into(),
                });
            }
        })
    }

    /// Whether this backend traces in parallel across the worker pool.
    pub fn is_parallel(self) -> bool {
        matches!(
            self,
            MajorKind::MarkSweepParallel | MajorKind::MarkSweepFixedParallel
        )
    }

    /// Whether this backend moves (copies) surviving objects.
    pub fn is_copying(self) -> bool {
        matches!(self, MajorKind::Copying)
    }
}

/// Which remembered-set / write-barrier strategy to use (spec §6 `wbarrier=`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteBarrierKind {
    /// Sequential store buffer, flushed per-thread before minor collection.
    Remset,
    /// Card-table based barrier.
    CardTable,
}

impl WriteBarrierKind {
    fn parse(value: &str) -> GcResult<Self> {
        Ok(match value {
            "remset" => WriteBarrierKind::Remset,
            "cardtable" => WriteBarrierKind::CardTable,
            other => {
                return Err(GcError::UnknownVariant {
                    key: "wbarrier".into(),
                    value: other.into(),
                });
            }
        })
    }
}

/// Precision of thread stack scanning (spec §6 `stack-mark=`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackMark {
    /// Precise marking via a runtime-supplied per-thread mark function.
    Precise,
    /// Conservative: every stack/register word is a potential pointer.
    Conservative,
}

impl StackMark {
    fn parse(value: &str) -> GcResult<Self> {
        Ok(match value {
            "precise" => StackMark::Precise,
            "conservative" => StackMark::Conservative,
            other => {
                return Err(GcError::UnknownVariant {
                    key: "stack-mark".into(),
                    value: other.into(),
                });
            }
        })
    }
}

/// Debug knobs (spec §6 "Debug knobs"). All default off.
#[derive(Debug, Clone, Default)]
pub struct DebugFlags {
    /// Force a collection before every Nth allocation (0 = disabled).
    pub collect_before_allocs: usize,
    /// Run heap-consistency checks at every minor collection.
    pub check_at_minor_collections: bool,
    /// Assert/log on cross-domain references during domain unload.
    pub xdomain_checks: bool,
    /// Clear (zero) reclaimed memory eagerly instead of lazily.
    pub clear_at_gc: bool,
    /// Verify nursery invariants after every minor collection.
    pub verify_nursery_at_minor_gc: bool,
    /// Dump the nursery's object layout after every minor collection.
    pub dump_nursery_at_minor_gc: bool,
    /// Disable minor collections entirely (everything promotes immediately).
    pub disable_minor: bool,
    /// Disable major collections entirely.
    pub disable_major: bool,
    /// Path to write a heap dump to, if any.
    pub heap_dump: Option<String>,
    /// Log the allowance recomputation after each major.
    pub print_allowance: bool,
    /// Log pin-queue activity during each collection.
    pub print_pinning: bool,
}

/// Minimum ratio between `max-heap-size` and `nursery-size` (spec §7).
pub const MIN_HEAP_TO_NURSERY_RATIO: usize = 4;

/// Full collector configuration, parsed from `key=value` pairs or built
/// programmatically via [`GcConfig::default`] + field assignment.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Major collector backend.
    pub major: MajorKind,
    /// Write barrier / remembered-set strategy.
    pub wbarrier: WriteBarrierKind,
    /// Maximum heap size in bytes (nursery + old generation + LOS).
    pub max_heap_size: usize,
    /// Soft heap limit used to clamp the allowance (spec §4.8).
    pub soft_heap_limit: usize,
    /// Nursery size in bytes (ideally a power of two).
    pub nursery_size: usize,
    /// Number of worker threads for parallel tracing (0 = sequential).
    pub workers: usize,
    /// Stack-scanning precision.
    pub stack_mark: StackMark,
    /// Class name of the registered bridge class, if any.
    pub bridge_class: Option<String>,
    /// Large-object threshold in bytes.
    pub large_object_threshold: usize,
    /// Debug knobs.
    pub debug: DebugFlags,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            major: MajorKind::MarkSweep,
            wbarrier: WriteBarrierKind::Remset,
            max_heap_size: 512 * 1024 * 1024,
            soft_heap_limit: 512 * 1024 * 1024,
            nursery_size: 4 * 1024 * 1024,
            workers: 0,
            stack_mark: StackMark::Conservative,
            bridge_class: None,
            large_object_threshold: 8 * 1024,
            debug: DebugFlags::default(),
        }
    }
}

impl GcConfig {
    /// Parse configuration from an iterator of `"key=value"` strings.
    ///
    /// Unrecognized keys are rejected as [`GcError::Config`]; this matches
    /// spec §7's "Config parse error — Fatal at init" policy.
    pub fn parse<'a, I: IntoIterator<Item = &'a str>>(pairs: I) -> GcResult<Self> {
        let mut config = GcConfig::default();

        for pair in pairs {
            let (key, value) = pair.split_once('=').ok_or_else(|| GcError::Config {
                key: pair.to_string(),
                reason: "expected key=value".into(),
            })?;

            match key {
                "major" => config.major = MajorKind::parse(value)?,
                "wbarrier" => config.wbarrier = WriteBarrierKind::parse(value)?,
                "max-heap-size" => config.max_heap_size = parse_size(key, value)?,
                "soft-heap-limit" => config.soft_heap_limit = parse_size(key, value)?,
                "nursery-size" => config.nursery_size = parse_size(key, value)?,
                "workers" => config.workers = parse_size(key, value)?,
                "stack-mark" => config.stack_mark = StackMark::parse(value)?,
                "bridge" => config.bridge_class = Some(value.to_string()),
                "collect-before-allocs" => {
                    config.debug.collect_before_allocs = if value.is_empty() {
                        1
                    } else {
                        parse_size(key, value)?
                    };
                }
                "check-at-minor-collections" => config.debug.check_at_minor_collections = true,
                "xdomain-checks" => config.debug.xdomain_checks = true,
                "clear-at-gc" => config.debug.clear_at_gc = true,
                "verify-nursery-at-minor-gc" => config.debug.verify_nursery_at_minor_gc = true,
                "dump-nursery-at-minor-gc" => config.debug.dump_nursery_at_minor_gc = true,
                "disable-minor" => config.debug.disable_minor = true,
                "disable-major" => config.debug.disable_major = true,
                "heap-dump" => config.debug.heap_dump = Some(value.to_string()),
                "print-allowance" => config.debug.print_allowance = true,
                "print-pinning" => config.debug.print_pinning = true,
                other => {
                    return Err(GcError::Config {
                        key: other.to_string(),
                        reason: "unrecognized configuration key".into(),
                    });
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate structural constraints (spec §7: `max-heap-size < 4 *
    /// nursery-size` is fatal).
    pub fn validate(&self) -> GcResult<()> {
        if self.max_heap_size < MIN_HEAP_TO_NURSERY_RATIO * self.nursery_size {
            return Err(GcError::HeapTooSmall {
                max_heap_size: self.max_heap_size,
                nursery_size: self.nursery_size,
            });
        }
        Ok(())
    }
}

fn parse_size(key: &str, value: &str) -> GcResult<usize> {
    value.parse::<usize>().map_err(|e| GcError::Config {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(GcConfig::default().validate().is_ok());
    }

    #[test]
    fn test_parse_basic_pairs() {
        let config = GcConfig::parse([
            "major=copying",
            "wbarrier=cardtable",
            "nursery-size=1048576",
            "max-heap-size=16777216",
            "workers=4",
        ])
        .unwrap();

        assert_eq!(config.major, MajorKind::Copying);
        assert_eq!(config.wbarrier, WriteBarrierKind::CardTable);
        assert_eq!(config.nursery_size, 1048576);
        assert_eq!(config.max_heap_size, 16777216);
        assert_eq!(config.workers, 4);
    }

    #[test]
    fn test_parse_debug_flags() {
        let config = GcConfig::parse(["check-at-minor-collections", "print-pinning"]).unwrap();
        assert!(config.debug.check_at_minor_collections);
        assert!(config.debug.print_pinning);
        assert!(!config.debug.print_allowance);
    }

    #[test]
    fn test_parse_unknown_key_fatal() {
        let result = GcConfig::parse(["bogus=1"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_unknown_major_variant() {
        let result = GcConfig::parse(["major=generational-incremental"]);
        assert!(matches!(result, Err(GcError::UnknownVariant { .. })));
    }

    #[test]
    fn test_heap_too_small_is_fatal() {
        let result = GcConfig::parse(["nursery-size=1048576", "max-heap-size=2097152"]);
        assert!(matches!(result, Err(GcError::HeapTooSmall { .. })));
    }

    #[test]
    fn test_major_kind_parallel_flag() {
        assert!(MajorKind::MarkSweepParallel.is_parallel());
        assert!(!MajorKind::MarkSweep.is_parallel());
        assert!(MajorKind::Copying.is_copying());
    }
}
