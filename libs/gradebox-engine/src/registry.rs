// Language registry: build/run profiles for every supported language,
// loaded once at startup from config/languages.json

use crate::error::RegistryError;
use anyhow::Context;
use gradebox_common::types::{Language, LanguageSummary, ResourceLimits};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

const BUILTIN_PROFILES: &str = include_str!("../../../config/languages.json");

lazy_static! {
    static ref JAVA_PUBLIC_CLASS: Regex =
        Regex::new(r"public\s+(?:final\s+)?class\s+([A-Za-z_$][A-Za-z0-9_$]*)")
            .expect("static regex");
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageProfile {
    pub id: Language,
    pub display_name: String,
    pub version: String,
    pub image: String,
    pub dockerfile: String,
    pub source_file: String,
    pub file_extension: String,
    #[serde(default)]
    pub compile: Option<Vec<String>>,
    pub run: Vec<String>,
    #[serde(default)]
    pub syntax_check: Option<Vec<String>>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_cpu_share")]
    pub cpu_share: f64,
    /// Extra pids the runtime itself needs (JVM, Go and Node threads count
    /// against the container pids limit).
    #[serde(default)]
    pub runtime_pid_overhead: u64,
    /// Descriptors the runtime opens before user code runs (jars, assemblies).
    #[serde(default)]
    pub runtime_fd_overhead: u64,
    pub default_limits: ResourceLimits,
    /// Profile-specific regexes, enforced by the scanner at every level.
    #[serde(default)]
    pub disallowed_patterns: Vec<String>,
}

fn default_cpu_share() -> f64 {
    1.0
}

/// Share of the memory limit a managed runtime may use for its heap; the
/// rest covers metaspace, thread stacks and code caches.
pub const HEAP_PERCENT: u64 = 75;

/// Values substituted into command and environment templates.
#[derive(Debug, Clone)]
pub struct CommandContext<'a> {
    pub source: &'a str,
    pub source_dir: &'a str,
    pub build_dir: &'a str,
    pub class_name: &'a str,
    pub memory_mb: u64,
}

impl<'a> CommandContext<'a> {
    pub fn render(&self, template: &str) -> String {
        template
            .replace("{source}", self.source)
            .replace("{source_dir}", self.source_dir)
            .replace("{build_dir}", self.build_dir)
            .replace("{class_name}", self.class_name)
            .replace("{memory_mb}", &self.memory_mb.to_string())
            .replace("{heap_mb}", &self.heap_mb().to_string())
    }

    pub fn heap_mb(&self) -> u64 {
        (self.memory_mb * HEAP_PERCENT / 100).max(1)
    }

    pub fn render_argv(&self, template: &[String]) -> Vec<String> {
        template.iter().map(|part| self.render(part)).collect()
    }
}

impl LanguageProfile {
    pub fn is_compiled(&self) -> bool {
        self.compile.is_some()
    }

    pub fn summary(&self) -> LanguageSummary {
        LanguageSummary {
            id: self.id,
            display_name: self.display_name.clone(),
            version: self.version.clone(),
            compiled: self.is_compiled(),
            file_extension: self.file_extension.clone(),
        }
    }

    /// Entry class for JVM languages; `Main` when no public class is declared.
    pub fn class_name(&self, source_code: &str) -> String {
        if self.id != Language::Java {
            return "Main".to_string();
        }
        JAVA_PUBLIC_CLASS
            .captures(source_code)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "Main".to_string())
    }

    /// File name the submission is written to. javac insists the file is
    /// named after its public class.
    pub fn source_file_name(&self, source_code: &str) -> String {
        if self.id == Language::Java {
            format!("{}.{}", self.class_name(source_code), self.file_extension)
        } else {
            self.source_file.clone()
        }
    }

    pub fn render_env(&self, ctx: &CommandContext<'_>) -> Vec<(String, String)> {
        self.env
            .iter()
            .map(|(key, value)| (key.clone(), ctx.render(value)))
            .collect()
    }

    fn validate(&self) -> Result<(), RegistryError> {
        let invalid = |reason: String| RegistryError::InvalidProfile {
            language: self.id.to_string(),
            reason,
        };

        if self.run.is_empty() || self.run[0].trim().is_empty() {
            return Err(invalid("run command is empty".to_string()));
        }
        if matches!(&self.compile, Some(cmd) if cmd.is_empty()) {
            return Err(invalid("compile command is empty".to_string()));
        }
        if matches!(&self.syntax_check, Some(cmd) if cmd.is_empty()) {
            return Err(invalid("syntax check command is empty".to_string()));
        }
        if self.source_file.is_empty() || self.source_file.contains('/') {
            return Err(invalid(format!("bad source file name '{}'", self.source_file)));
        }
        if !(self.cpu_share.is_finite() && self.cpu_share > 0.0) {
            return Err(invalid(format!("cpu_share must be positive, got {}", self.cpu_share)));
        }
        let zero = self.default_limits.zero_fields();
        if !zero.is_empty() {
            return Err(invalid(format!("default limits must be >= 1: {}", zero.join(", "))));
        }
        for pattern in &self.disallowed_patterns {
            Regex::new(pattern).map_err(|e| invalid(format!("bad pattern '{}': {}", pattern, e)))?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct LanguagesFile {
    languages: Vec<LanguageProfile>,
}

/// Read-only after construction; shared behind an `Arc`.
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    profiles: HashMap<Language, Arc<LanguageProfile>>,
}

impl LanguageRegistry {
    pub fn from_json(content: &str) -> Result<Self, RegistryError> {
        let file: LanguagesFile = serde_json::from_str(content)
            .context("failed to parse language profiles")
            .map_err(RegistryError::Load)?;

        let mut profiles = HashMap::new();
        for profile in file.languages {
            profile.validate()?;
            let id = profile.id;
            if profiles.insert(id, Arc::new(profile)).is_some() {
                return Err(RegistryError::InvalidProfile {
                    language: id.to_string(),
                    reason: "defined more than once".to_string(),
                });
            }
        }
        Ok(Self { profiles })
    }

    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))
            .map_err(RegistryError::Load)?;
        Self::from_json(&content)
    }

    /// Profiles compiled into the binary.
    pub fn builtin() -> Result<Self, RegistryError> {
        Self::from_json(BUILTIN_PROFILES)
    }

    /// Load from `path` when given, otherwise fall back to the built-in set.
    pub fn load_or_builtin(path: Option<&Path>) -> Result<Self, RegistryError> {
        match path {
            Some(path) => Self::load(path),
            None => Self::builtin(),
        }
    }

    pub fn resolve(&self, language_id: &str) -> Result<Arc<LanguageProfile>, RegistryError> {
        let language: Language = language_id
            .parse()
            .map_err(|_| RegistryError::NotFound(language_id.to_string()))?;
        self.get(language)
    }

    pub fn get(&self, language: Language) -> Result<Arc<LanguageProfile>, RegistryError> {
        self.profiles
            .get(&language)
            .cloned()
            .ok_or(RegistryError::NotConfigured(language))
    }

    /// Profiles in the canonical language order.
    pub fn profiles(&self) -> Vec<Arc<LanguageProfile>> {
        Language::ALL
            .iter()
            .filter_map(|language| self.profiles.get(language).cloned())
            .collect()
    }

    pub fn summaries(&self) -> Vec<LanguageSummary> {
        self.profiles().iter().map(|p| p.summary()).collect()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_covers_every_language() {
        let registry = LanguageRegistry::builtin().unwrap();
        assert_eq!(registry.len(), Language::ALL.len());
        for language in Language::ALL {
            let profile = registry.get(language).unwrap();
            assert_eq!(profile.id, language);
        }
    }

    #[test]
    fn test_resolve_unknown_is_not_found() {
        let registry = LanguageRegistry::builtin().unwrap();
        let err = registry.resolve("cobol").unwrap_err();
        assert!(err.is_not_found());
        assert!(matches!(err, RegistryError::NotFound(ref id) if id == "cobol"));
    }

    #[test]
    fn test_supported_but_unconfigured_is_not_found() {
        let registry = LanguageRegistry::from_json(r#"{"languages": []}"#).unwrap();
        let err = registry.resolve("rust").unwrap_err();
        assert!(err.is_not_found());
        assert!(matches!(err, RegistryError::NotConfigured(Language::Rust)));
    }

    #[test]
    fn test_interpreted_languages_have_no_compile_step() {
        let registry = LanguageRegistry::builtin().unwrap();
        assert!(!registry.get(Language::Python).unwrap().is_compiled());
        assert!(!registry.get(Language::JavaScript).unwrap().is_compiled());
        assert!(registry.get(Language::Cpp).unwrap().is_compiled());
        assert!(registry.get(Language::Java).unwrap().is_compiled());
    }

    #[test]
    fn test_summaries_hide_images() {
        let registry = LanguageRegistry::builtin().unwrap();
        let json = serde_json::to_string(&registry.summaries()).unwrap();
        assert!(!json.contains("gradebox-python:latest"));
        assert!(!json.contains("Dockerfile"));
        assert!(json.contains("\"python\""));
    }

    #[test]
    fn test_java_class_name_detection() {
        let registry = LanguageRegistry::builtin().unwrap();
        let java = registry.get(Language::Java).unwrap();

        let code = "import java.util.*;\npublic final class Solution {\n  public static void main(String[] a) {}\n}";
        assert_eq!(java.class_name(code), "Solution");
        assert_eq!(java.source_file_name(code), "Solution.java");

        assert_eq!(java.class_name("class Helper {}"), "Main");
        assert_eq!(java.source_file_name("class Helper {}"), "Main.java");
    }

    #[test]
    fn test_command_rendering() {
        let registry = LanguageRegistry::builtin().unwrap();
        let java = registry.get(Language::Java).unwrap();
        let ctx = CommandContext {
            source: "/sandbox/src/Solution.java",
            source_dir: "/sandbox/src",
            build_dir: "/sandbox/build",
            class_name: "Solution",
            memory_mb: 128,
        };
        let run = ctx.render_argv(&java.run);
        assert_eq!(run.first().map(String::as_str), Some("java"));
        assert!(run.contains(&"-Xmx96m".to_string()));
        assert!(!run.iter().any(|a| a.contains("128")));
        assert!(run.contains(&"/sandbox/build".to_string()));
        assert_eq!(run.last().map(String::as_str), Some("Solution"));
    }

    #[test]
    fn test_rejects_invalid_profiles() {
        let bad_pattern = BUILTIN_PROFILES.replacen(
            "\"disallowed_patterns\": []",
            "\"disallowed_patterns\": [\"(unclosed\"]",
            1,
        );
        assert!(matches!(
            LanguageRegistry::from_json(&bad_pattern),
            Err(RegistryError::InvalidProfile { .. })
        ));

        let zero_limit = BUILTIN_PROFILES.replacen("\"memory_mb\": 128", "\"memory_mb\": 0", 1);
        assert!(matches!(
            LanguageRegistry::from_json(&zero_limit),
            Err(RegistryError::InvalidProfile { .. })
        ));

        assert!(matches!(
            LanguageRegistry::from_json("not json"),
            Err(RegistryError::Load(_))
        ));
    }
}
