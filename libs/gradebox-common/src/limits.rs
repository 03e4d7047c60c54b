// Resource limit policy shared by the engine and its callers

use crate::types::{ResourceLimits, SecurityLevel};

const KIB: u64 = 1024;

/// Cap applied by each security level. Stricter levels never allow more
/// than looser ones on any field.
pub fn level_cap(level: SecurityLevel) -> ResourceLimits {
    match level {
        SecurityLevel::Low => ResourceLimits {
            memory_mb: 512,
            cpu_time_seconds: 30,
            wall_time_seconds: 60,
            max_processes: 5,
            max_open_files: 50,
            max_output_bytes: 1024 * KIB,
        },
        SecurityLevel::Medium => ResourceLimits {
            memory_mb: 256,
            cpu_time_seconds: 15,
            wall_time_seconds: 30,
            max_processes: 3,
            max_open_files: 25,
            max_output_bytes: 512 * KIB,
        },
        SecurityLevel::High => ResourceLimits {
            memory_mb: 128,
            cpu_time_seconds: 10,
            wall_time_seconds: 20,
            max_processes: 2,
            max_open_files: 15,
            max_output_bytes: 256 * KIB,
        },
        SecurityLevel::Maximum => ResourceLimits {
            memory_mb: 64,
            cpu_time_seconds: 5,
            wall_time_seconds: 10,
            max_processes: 1,
            max_open_files: 10,
            max_output_bytes: 128 * KIB,
        },
    }
}

/// Default platform ceiling: the loosest security tier.
pub fn default_platform_ceiling() -> ResourceLimits {
    level_cap(SecurityLevel::Low)
}

impl ResourceLimits {
    /// Field-wise minimum.
    pub fn min(&self, other: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            memory_mb: self.memory_mb.min(other.memory_mb),
            cpu_time_seconds: self.cpu_time_seconds.min(other.cpu_time_seconds),
            wall_time_seconds: self.wall_time_seconds.min(other.wall_time_seconds),
            max_processes: self.max_processes.min(other.max_processes),
            max_open_files: self.max_open_files.min(other.max_open_files),
            max_output_bytes: self.max_output_bytes.min(other.max_output_bytes),
        }
    }

    pub fn fits_within(&self, ceiling: &ResourceLimits) -> bool {
        self.memory_mb <= ceiling.memory_mb
            && self.cpu_time_seconds <= ceiling.cpu_time_seconds
            && self.wall_time_seconds <= ceiling.wall_time_seconds
            && self.max_processes <= ceiling.max_processes
            && self.max_open_files <= ceiling.max_open_files
            && self.max_output_bytes <= ceiling.max_output_bytes
    }

    /// Names of fields that are zero.
    pub fn zero_fields(&self) -> Vec<&'static str> {
        let fields = [
            ("memory_mb", self.memory_mb),
            ("cpu_time_seconds", self.cpu_time_seconds),
            ("wall_time_seconds", self.wall_time_seconds),
            ("max_processes", self.max_processes),
            ("max_open_files", self.max_open_files),
            ("max_output_bytes", self.max_output_bytes),
        ];
        fields
            .iter()
            .filter(|(_, value)| *value == 0)
            .map(|(name, _)| *name)
            .collect()
    }
}

/// Limits a run actually gets:
/// min(requested or profile default, level cap, platform ceiling).
pub fn effective_limits(
    requested: Option<&ResourceLimits>,
    profile_default: &ResourceLimits,
    level: SecurityLevel,
    platform_ceiling: &ResourceLimits,
) -> ResourceLimits {
    requested
        .unwrap_or(profile_default)
        .min(&level_cap(level))
        .min(platform_ceiling)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn huge() -> ResourceLimits {
        ResourceLimits {
            memory_mb: u64::MAX,
            cpu_time_seconds: u64::MAX,
            wall_time_seconds: u64::MAX,
            max_processes: u64::MAX,
            max_open_files: u64::MAX,
            max_output_bytes: u64::MAX,
        }
    }

    #[test]
    fn test_levels_tighten_monotonically() {
        for pair in SecurityLevel::ALL.windows(2) {
            let looser = level_cap(pair[0]);
            let stricter = level_cap(pair[1]);
            assert!(stricter.fits_within(&looser), "{:?} vs {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_effective_never_exceeds_ceiling() {
        let ceiling = ResourceLimits {
            memory_mb: 100,
            cpu_time_seconds: 3,
            wall_time_seconds: 4,
            max_processes: 1,
            max_open_files: 8,
            max_output_bytes: 1000,
        };
        let requests = [
            None,
            Some(huge()),
            Some(level_cap(SecurityLevel::Low)),
            Some(ResourceLimits {
                memory_mb: 1,
                ..huge()
            }),
        ];
        for level in SecurityLevel::ALL {
            for requested in requests.iter() {
                let limits = effective_limits(requested.as_ref(), &huge(), level, &ceiling);
                assert!(limits.fits_within(&ceiling));
                assert!(limits.fits_within(&level_cap(level)));
            }
        }
    }

    #[test]
    fn test_smaller_request_is_honoured() {
        let requested = ResourceLimits {
            memory_mb: 32,
            cpu_time_seconds: 1,
            wall_time_seconds: 2,
            max_processes: 1,
            max_open_files: 4,
            max_output_bytes: 10,
        };
        let limits = effective_limits(
            Some(&requested),
            &huge(),
            SecurityLevel::Low,
            &default_platform_ceiling(),
        );
        assert_eq!(limits, requested);
    }

    #[test]
    fn test_profile_default_used_without_request() {
        let default = ResourceLimits {
            memory_mb: 96,
            ..level_cap(SecurityLevel::Maximum)
        };
        let limits = effective_limits(
            None,
            &default,
            SecurityLevel::High,
            &default_platform_ceiling(),
        );
        assert_eq!(limits.memory_mb, 96);
        assert_eq!(limits.wall_time_seconds, 10);
    }

    #[test]
    fn test_zero_fields() {
        let limits = ResourceLimits {
            memory_mb: 0,
            max_open_files: 0,
            ..level_cap(SecurityLevel::High)
        };
        assert_eq!(limits.zero_fields(), vec!["memory_mb", "max_open_files"]);
        assert!(level_cap(SecurityLevel::High).zero_fields().is_empty());
    }
}
