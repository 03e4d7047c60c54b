use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Closed set of languages the engine knows how to build and run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    Java,
    Cpp,
    CSharp,
    Go,
    Rust,
}

impl Language {
    pub const ALL: [Language; 7] = [
        Language::Python,
        Language::JavaScript,
        Language::Java,
        Language::Cpp,
        Language::CSharp,
        Language::Go,
        Language::Rust,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Java => "java",
            Language::Cpp => "cpp",
            Language::CSharp => "csharp",
            Language::Go => "go",
            Language::Rust => "rust",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown language '{0}'")]
pub struct UnknownLanguage(pub String);

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" => Ok(Language::Python),
            "javascript" | "js" | "node" => Ok(Language::JavaScript),
            "java" => Ok(Language::Java),
            "cpp" | "c++" => Ok(Language::Cpp),
            "csharp" | "c#" => Ok(Language::CSharp),
            "go" | "golang" => Ok(Language::Go),
            "rust" => Ok(Language::Rust),
            _ => Err(UnknownLanguage(s.to_string())),
        }
    }
}

/// Policy tier controlling scanner strictness and the resource cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Low,
    Medium,
    #[default]
    High,
    Maximum,
}

impl SecurityLevel {
    pub const ALL: [SecurityLevel; 4] = [
        SecurityLevel::Low,
        SecurityLevel::Medium,
        SecurityLevel::High,
        SecurityLevel::Maximum,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityLevel::Low => "low",
            SecurityLevel::Medium => "medium",
            SecurityLevel::High => "high",
            SecurityLevel::Maximum => "maximum",
        }
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(SecurityLevel::Low),
            "medium" => Ok(SecurityLevel::Medium),
            "high" => Ok(SecurityLevel::High),
            "maximum" | "max" => Ok(SecurityLevel::Maximum),
            other => Err(format!("unknown security level '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpu_time_seconds: u64,
    pub wall_time_seconds: u64,
    pub max_processes: u64,
    pub max_open_files: u64,
    pub max_output_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub input: String,
    pub expected_output: String,
    #[serde(default)]
    pub is_hidden: bool,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub id: Uuid,
    pub language: String,
    pub source_code: String,
    pub test_cases: Vec<TestCase>,
    #[serde(default)]
    pub resource_limits: Option<ResourceLimits>,
    #[serde(default)]
    pub security_level: SecurityLevel,
}

/// Role supplied by the external auth layer. The engine never stores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallerRole {
    #[default]
    Candidate,
    Grader,
    Admin,
}

impl CallerRole {
    pub fn can_see_hidden(&self) -> bool {
        matches!(self, CallerRole::Grader | CallerRole::Admin)
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, CallerRole::Admin)
    }
}

impl FromStr for CallerRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "candidate" | "student" => Ok(CallerRole::Candidate),
            "grader" | "instructor" => Ok(CallerRole::Grader),
            "admin" => Ok(CallerRole::Admin),
            other => Err(format!("unknown caller role '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ValidationError,
    SecurityViolation,
    CompileError,
    RuntimeError,
    Timeout,
    MemoryExceeded,
    InternalError,
}

impl FailureKind {
    /// Only isolation-layer failures are worth retrying; everything else is
    /// a property of the submission itself.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::InternalError)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::ValidationError => "validation_error",
            FailureKind::SecurityViolation => "security_violation",
            FailureKind::CompileError => "compile_error",
            FailureKind::RuntimeError => "runtime_error",
            FailureKind::Timeout => "timeout",
            FailureKind::MemoryExceeded => "memory_exceeded",
            FailureKind::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseVerdict {
    Passed,
    WrongAnswer,
    RuntimeError,
    Timeout,
    MemoryExceeded,
    InternalError,
    NotRun,
}

impl CaseVerdict {
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            CaseVerdict::Passed | CaseVerdict::WrongAnswer | CaseVerdict::NotRun => None,
            CaseVerdict::RuntimeError => Some(FailureKind::RuntimeError),
            CaseVerdict::Timeout => Some(FailureKind::Timeout),
            CaseVerdict::MemoryExceeded => Some(FailureKind::MemoryExceeded),
            CaseVerdict::InternalError => Some(FailureKind::InternalError),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub test_case_id: String,
    pub verdict: CaseVerdict,
    pub passed: bool,
    pub failure_kind: Option<FailureKind>,
    pub is_hidden: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
    pub execution_time_ms: u64,
    pub peak_memory_kb: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub request_id: Uuid,
    pub success: bool,
    pub failure_kind: Option<FailureKind>,
    pub retryable: bool,
    pub cancelled: bool,
    pub message: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub test_results: Vec<TestCaseResult>,
    pub passed_tests: usize,
    pub total_tests: usize,
    pub score: f64,
    pub execution_time_ms: u64,
    pub peak_memory_kb: Option<u64>,
    pub security_violations: Vec<String>,
    pub effective_limits: Option<ResourceLimits>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Public view of a language profile: no image or template references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageSummary {
    pub id: Language,
    pub display_name: String,
    pub version: String,
    pub compiled: bool,
    pub file_extension: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_round_trips_through_its_id() {
        for language in Language::ALL {
            assert_eq!(language.as_str().parse::<Language>(), Ok(language));
            let json = serde_json::to_string(&language).unwrap();
            assert_eq!(json, format!("\"{}\"", language.as_str()));
        }
    }

    #[test]
    fn test_language_aliases() {
        assert_eq!("C++".parse::<Language>(), Ok(Language::Cpp));
        assert_eq!("node".parse::<Language>(), Ok(Language::JavaScript));
        assert_eq!(
            "cobol".parse::<Language>(),
            Err(UnknownLanguage("cobol".to_string()))
        );
    }

    #[test]
    fn test_security_levels_are_ordered_by_strictness() {
        assert!(SecurityLevel::Low < SecurityLevel::Medium);
        assert!(SecurityLevel::Medium < SecurityLevel::High);
        assert!(SecurityLevel::High < SecurityLevel::Maximum);
        assert_eq!(SecurityLevel::default(), SecurityLevel::High);
    }

    #[test]
    fn test_caller_privileges() {
        assert!(!CallerRole::Candidate.can_see_hidden());
        assert!(CallerRole::Grader.can_see_hidden());
        assert!(!CallerRole::Grader.is_admin());
        assert!(CallerRole::Admin.is_admin());
    }

    #[test]
    fn test_only_internal_errors_are_retryable() {
        assert!(FailureKind::InternalError.is_retryable());
        assert!(!FailureKind::Timeout.is_retryable());
        assert!(!FailureKind::CompileError.is_retryable());
    }

    #[test]
    fn test_case_defaults() {
        let tc: TestCase =
            serde_json::from_str(r#"{"id":"1","input":"","expected_output":"x"}"#).unwrap();
        assert!(!tc.is_hidden);
        assert_eq!(tc.weight, 1.0);
    }
}
