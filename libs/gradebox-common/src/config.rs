// Engine configuration, read once at startup from GRADEBOX_* variables

use crate::limits::default_platform_ceiling;
use crate::types::{ResourceLimits, SecurityLevel};
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Docker,
    Jail,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" | "container" => Ok(BackendKind::Docker),
            "jail" | "process" => Ok(BackendKind::Jail),
            other => Err(format!("expected 'docker' or 'jail', got '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JailConfig {
    pub work_root: PathBuf,
    /// First uid of the range handed out to sandboxes, one uid per live
    /// sandbox. Nothing else on the host may run under these uids: the
    /// process-count rlimit is charged per uid, and a uid with foreign
    /// processes is never leased.
    pub run_as_uid: Option<u32>,
    /// First gid of the matching range; defaults to the leased uid.
    pub run_as_gid: Option<u32>,
    /// Size of the uid range; defaults to `max_sandboxes`.
    pub uid_count: Option<u32>,
    pub isolate_network: bool,
    /// Private mount namespace per process: read-only base, noexec source dir.
    pub isolate_filesystem: bool,
    /// Refuse to provision when no uid range is configured.
    pub require_dedicated_uid: bool,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub backend: BackendKind,
    pub languages_path: Option<PathBuf>,
    pub images_dir: PathBuf,
    pub sandbox_user: String,
    pub instance_label: String,
    pub platform_ceiling: ResourceLimits,
    pub default_security_level: SecurityLevel,
    pub workers: usize,
    pub queue_capacity: usize,
    pub max_sandboxes: usize,
    pub watchdog_grace_ms: u64,
    pub compile_timeout_secs: u64,
    pub max_source_bytes: usize,
    pub max_test_cases: usize,
    pub max_input_bytes: usize,
    pub drain_timeout_secs: u64,
    pub jail: JailConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Docker,
            languages_path: None,
            images_dir: PathBuf::from("docker"),
            sandbox_user: "65534:65534".to_string(),
            instance_label: "gradebox".to_string(),
            platform_ceiling: default_platform_ceiling(),
            default_security_level: SecurityLevel::High,
            workers: 4,
            queue_capacity: 64,
            max_sandboxes: 4,
            watchdog_grace_ms: 1500,
            compile_timeout_secs: 30,
            max_source_bytes: 64 * 1024,
            max_test_cases: 20,
            max_input_bytes: 64 * 1024,
            drain_timeout_secs: 30,
            jail: JailConfig {
                work_root: std::env::temp_dir().join("gradebox"),
                run_as_uid: None,
                run_as_gid: None,
                uid_count: None,
                isolate_network: true,
                isolate_filesystem: true,
                require_dedicated_uid: true,
            },
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("GRADEBOX_BACKEND") {
            config.backend = parse_with("GRADEBOX_BACKEND", &v)?;
        }
        if let Some(v) = lookup("GRADEBOX_LANGUAGES") {
            config.languages_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("GRADEBOX_IMAGES_DIR") {
            config.images_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("GRADEBOX_SANDBOX_USER") {
            config.sandbox_user = v;
        }
        if let Some(v) = lookup("GRADEBOX_INSTANCE") {
            config.instance_label = v;
        }
        if let Some(v) = lookup("GRADEBOX_SECURITY_LEVEL") {
            config.default_security_level = parse_with("GRADEBOX_SECURITY_LEVEL", &v)?;
        }

        let ceiling = &mut config.platform_ceiling;
        read_positive(&lookup, "GRADEBOX_CEILING_MEMORY_MB", &mut ceiling.memory_mb)?;
        read_positive(&lookup, "GRADEBOX_CEILING_CPU_SECS", &mut ceiling.cpu_time_seconds)?;
        read_positive(&lookup, "GRADEBOX_CEILING_WALL_SECS", &mut ceiling.wall_time_seconds)?;
        read_positive(&lookup, "GRADEBOX_CEILING_PROCESSES", &mut ceiling.max_processes)?;
        read_positive(&lookup, "GRADEBOX_CEILING_OPEN_FILES", &mut ceiling.max_open_files)?;
        read_positive(&lookup, "GRADEBOX_CEILING_OUTPUT_BYTES", &mut ceiling.max_output_bytes)?;

        read_positive(&lookup, "GRADEBOX_WORKERS", &mut config.workers)?;
        read_positive(&lookup, "GRADEBOX_QUEUE_CAPACITY", &mut config.queue_capacity)?;
        read_positive(&lookup, "GRADEBOX_MAX_SANDBOXES", &mut config.max_sandboxes)?;
        read_positive(&lookup, "GRADEBOX_WATCHDOG_GRACE_MS", &mut config.watchdog_grace_ms)?;
        read_positive(&lookup, "GRADEBOX_COMPILE_TIMEOUT_SECS", &mut config.compile_timeout_secs)?;
        read_positive(&lookup, "GRADEBOX_MAX_SOURCE_BYTES", &mut config.max_source_bytes)?;
        read_positive(&lookup, "GRADEBOX_MAX_TEST_CASES", &mut config.max_test_cases)?;
        read_positive(&lookup, "GRADEBOX_MAX_INPUT_BYTES", &mut config.max_input_bytes)?;
        read_positive(&lookup, "GRADEBOX_DRAIN_TIMEOUT_SECS", &mut config.drain_timeout_secs)?;

        if let Some(v) = lookup("GRADEBOX_JAIL_ROOT") {
            config.jail.work_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("GRADEBOX_JAIL_UID") {
            config.jail.run_as_uid = Some(parse_with("GRADEBOX_JAIL_UID", &v)?);
        }
        if let Some(v) = lookup("GRADEBOX_JAIL_GID") {
            config.jail.run_as_gid = Some(parse_with("GRADEBOX_JAIL_GID", &v)?);
        }
        if let Some(v) = lookup("GRADEBOX_JAIL_UID_COUNT") {
            let count: u32 = parse_with("GRADEBOX_JAIL_UID_COUNT", &v)?;
            if count == 0 {
                return Err(ConfigError::Invalid {
                    key: "GRADEBOX_JAIL_UID_COUNT",
                    value: v,
                    reason: "must be greater than zero".to_string(),
                });
            }
            config.jail.uid_count = Some(count);
        }
        if let Some(v) = lookup("GRADEBOX_JAIL_ISOLATE_FS") {
            config.jail.isolate_filesystem = parse_bool("GRADEBOX_JAIL_ISOLATE_FS", &v)?;
        }
        if let Some(v) = lookup("GRADEBOX_JAIL_ISOLATE_NETWORK") {
            config.jail.isolate_network = parse_bool("GRADEBOX_JAIL_ISOLATE_NETWORK", &v)?;
        }
        if let Some(v) = lookup("GRADEBOX_JAIL_REQUIRE_UID") {
            config.jail.require_dedicated_uid = parse_bool("GRADEBOX_JAIL_REQUIRE_UID", &v)?;
        }

        Ok(config)
    }
}

fn parse_with<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

fn read_positive<F, T>(lookup: &F, key: &'static str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + PartialOrd + Default,
    T::Err: ToString,
{
    if let Some(raw) = lookup(key) {
        let value: T = parse_with(key, &raw)?;
        if value <= T::default() {
            return Err(ConfigError::Invalid {
                key,
                value: raw,
                reason: "must be greater than zero".to_string(),
            });
        }
        *slot = value;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let config = EngineConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.backend, BackendKind::Docker);
        assert_eq!(config.platform_ceiling, default_platform_ceiling());
        assert_eq!(config.default_security_level, SecurityLevel::High);
        assert_eq!(config.max_test_cases, 20);
    }

    #[test]
    fn test_overrides() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("GRADEBOX_BACKEND", "jail"),
            ("GRADEBOX_CEILING_MEMORY_MB", "256"),
            ("GRADEBOX_MAX_SANDBOXES", "2"),
            ("GRADEBOX_SECURITY_LEVEL", "maximum"),
            ("GRADEBOX_JAIL_UID", "1500"),
            ("GRADEBOX_JAIL_UID_COUNT", "8"),
            ("GRADEBOX_JAIL_ISOLATE_NETWORK", "off"),
        ]))
        .unwrap();
        assert_eq!(config.backend, BackendKind::Jail);
        assert_eq!(config.platform_ceiling.memory_mb, 256);
        assert_eq!(config.max_sandboxes, 2);
        assert_eq!(config.default_security_level, SecurityLevel::Maximum);
        assert_eq!(config.jail.run_as_uid, Some(1500));
        assert_eq!(config.jail.uid_count, Some(8));
        assert!(!config.jail.isolate_network);
        assert!(config.jail.isolate_filesystem);
    }

    #[test]
    fn test_rejects_zero_and_garbage() {
        let err = EngineConfig::from_lookup(lookup_from(&[("GRADEBOX_WORKERS", "0")])).unwrap_err();
        assert!(err.to_string().contains("GRADEBOX_WORKERS"));

        assert!(EngineConfig::from_lookup(lookup_from(&[("GRADEBOX_BACKEND", "vm")])).is_err());
        assert!(
            EngineConfig::from_lookup(lookup_from(&[("GRADEBOX_JAIL_UID_COUNT", "0")])).is_err()
        );
        assert!(
            EngineConfig::from_lookup(lookup_from(&[("GRADEBOX_CEILING_WALL_SECS", "soon")]))
                .is_err()
        );
    }
}
