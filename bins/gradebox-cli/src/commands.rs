// CLI commands for operating Gradebox
use anyhow::{bail, Context, Result};
use gradebox_common::config::EngineConfig;
use gradebox_common::types::{
    CallerRole, CaseVerdict, ExecutionRequest, ExecutionResult, ResourceLimits, SecurityLevel,
    TestCase,
};
use gradebox_engine::sandbox::build_provisioner;
use gradebox_engine::{scan, ExecutionEngine, LanguageRegistry, ScanVerdict};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Contents of a `run --tests` file.
#[derive(Debug, PartialEq)]
pub struct TestFile {
    pub test_cases: Vec<TestCase>,
    pub resource_limits: Option<ResourceLimits>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TestFileFormat {
    Cases(Vec<TestCase>),
    Full {
        test_cases: Vec<TestCase>,
        #[serde(default)]
        resource_limits: Option<ResourceLimits>,
    },
}

pub fn parse_test_file(content: &str) -> Result<TestFile> {
    let parsed: TestFileFormat = serde_json::from_str(content)
        .context("Test file must be a JSON array of test cases or an object with test_cases")?;
    Ok(match parsed {
        TestFileFormat::Cases(test_cases) => TestFile {
            test_cases,
            resource_limits: None,
        },
        TestFileFormat::Full {
            test_cases,
            resource_limits,
        } => TestFile {
            test_cases,
            resource_limits,
        },
    })
}

fn load_config() -> Result<EngineConfig> {
    EngineConfig::from_env().context("Invalid GRADEBOX_* configuration")
}

fn load_registry(config: &EngineConfig) -> Result<LanguageRegistry> {
    LanguageRegistry::load_or_builtin(config.languages_path.as_deref())
        .context("Failed to load language profiles")
}

fn read_source(file: &Path) -> Result<String> {
    fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))
}

/// Bring up an engine against the configured backend.
async fn start_engine() -> Result<ExecutionEngine> {
    let config = load_config()?;
    let registry = Arc::new(load_registry(&config)?);
    let provisioner = build_provisioner(&config).context("Failed to set up sandbox backend")?;
    let engine = ExecutionEngine::new(&config, registry, provisioner);

    let status = engine.init().await.context("Sandbox backend init failed")?;
    if !status.ready {
        bail!("Sandbox backend '{}' is not ready to provision", status.backend);
    }
    Ok(engine)
}

/// List supported languages
pub fn list_languages() -> Result<()> {
    let config = load_config()?;
    let registry = load_registry(&config)?;

    println!("📚 Supported languages:");
    for summary in registry.summaries() {
        println!(
            "  {:<8} {:<12} {:<10} {:<12} {}",
            summary.id.as_str(),
            summary.display_name,
            summary.version,
            if summary.compiled { "compiled" } else { "interpreted" },
            summary.file_extension
        );
    }
    Ok(())
}

pub fn scan_source(
    registry: &LanguageRegistry,
    language: &str,
    code: &str,
    level: SecurityLevel,
) -> Result<ScanVerdict> {
    let profile = registry.resolve(language)?;
    Ok(scan(code, &profile, level))
}

/// Run the static security scan on a source file
pub fn scan_file(language: &str, file: &Path, level: Option<SecurityLevel>) -> Result<()> {
    let config = load_config()?;
    let registry = load_registry(&config)?;
    let level = level.unwrap_or(config.default_security_level);
    let code = read_source(file)?;

    println!("🔍 Scanning {} as {} at level {}", file.display(), language, level);
    let verdict = scan_source(&registry, language, &code, level)?;

    for warning in &verdict.warnings {
        println!("⚠️  {}", warning);
    }
    for violation in &verdict.violations {
        println!("❌ {}", violation);
    }
    println!("   pattern set {}", verdict.pattern_set_version);

    if !verdict.allowed {
        bail!("Submission rejected with {} violation(s)", verdict.violations.len());
    }
    println!("✅ No violations found");
    Ok(())
}

/// Compile or syntax-check a source file without running it
pub async fn validate_file(language: &str, file: &Path) -> Result<()> {
    let code = read_source(file)?;
    let engine = start_engine().await?;

    println!("🔧 Validating {} as {}...", file.display(), language);
    let outcome = engine.validate(&code, language).await;

    for warning in &outcome.warnings {
        println!("⚠️  {}", warning);
    }
    for error in &outcome.errors {
        println!("❌ {}", error);
    }
    if !outcome.valid {
        bail!("Validation failed");
    }
    println!("✅ Source is valid");
    Ok(())
}

/// Execute a request, cancelling it on CTRL+C.
pub async fn execute_source(
    engine: &ExecutionEngine,
    request: &ExecutionRequest,
    role: CallerRole,
) -> ExecutionResult {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("⏹️  Interrupted, cancelling...");
            on_interrupt.cancel();
        }
    });

    let result = engine.execute(request, role, &cancel).await;
    interrupt.abort();
    result
}

fn verdict_label(verdict: CaseVerdict) -> &'static str {
    match verdict {
        CaseVerdict::Passed => "passed",
        CaseVerdict::WrongAnswer => "wrong answer",
        CaseVerdict::RuntimeError => "runtime error",
        CaseVerdict::Timeout => "timeout",
        CaseVerdict::MemoryExceeded => "memory exceeded",
        CaseVerdict::InternalError => "internal error",
        CaseVerdict::NotRun => "not run",
    }
}

/// Human-readable report for a finished request.
pub fn format_result(result: &ExecutionResult) -> String {
    let mut out = String::new();
    let icon = if result.success { "✅" } else { "❌" };
    out.push_str(&format!(
        "{} {} (score {:.2}, {} ms)\n",
        icon,
        result.message.as_deref().unwrap_or(""),
        result.score,
        result.execution_time_ms
    ));
    if let Some(kind) = result.failure_kind {
        out.push_str(&format!("   failure: {}\n", kind));
    }
    for violation in &result.security_violations {
        out.push_str(&format!("   {}\n", violation));
    }

    for case in &result.test_results {
        let mark = if case.passed { "✓" } else { "✗" };
        out.push_str(&format!(
            "  {} {:<10} {:<16} {:>6} ms",
            mark,
            case.test_case_id,
            verdict_label(case.verdict),
            case.execution_time_ms
        ));
        if case.is_hidden {
            out.push_str("  (hidden)");
        }
        out.push('\n');
        if let Some(error) = &case.error {
            out.push_str(&format!("      {}\n", error));
        }
        if !case.passed {
            if let (Some(expected), Some(actual)) = (&case.expected_output, &case.actual_output) {
                out.push_str(&format!("      expected: {:?}\n      actual:   {:?}\n", expected, actual));
            }
        }
    }
    if let Some(limits) = &result.effective_limits {
        out.push_str(&format!(
            "   limits: {} MB, {} s cpu, {} s wall\n",
            limits.memory_mb, limits.cpu_time_seconds, limits.wall_time_seconds
        ));
    }
    out
}

/// Execute a source file against a JSON file of test cases
pub async fn run_file(
    language: &str,
    file: &Path,
    tests: &Path,
    level: Option<SecurityLevel>,
    role: CallerRole,
    json: bool,
) -> Result<()> {
    let code = read_source(file)?;
    let test_file = parse_test_file(&read_source(tests)?)?;
    let engine = start_engine().await?;

    let request = ExecutionRequest {
        id: Uuid::new_v4(),
        language: language.to_string(),
        source_code: code,
        test_cases: test_file.test_cases,
        resource_limits: test_file.resource_limits,
        security_level: level.unwrap_or_else(|| engine.default_security_level()),
    };

    if !json {
        println!(
            "🚀 Running {} ({} test cases) as {}",
            file.display(),
            request.test_cases.len(),
            request.language
        );
    }
    let result = execute_source(&engine, &request, role).await;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&result).context("Failed to serialize result")?
        );
    } else {
        print!("{}", format_result(&result));
    }

    if !result.success {
        bail!("Execution did not pass");
    }
    Ok(())
}

/// Rebuild every sandbox image from its Dockerfile
pub async fn rebuild_images() -> Result<()> {
    let engine = start_engine().await?;
    println!("🔨 Rebuilding sandbox images...");

    let images = engine.rebuild_language_images(CallerRole::Admin).await?;
    let mut failed = 0;
    for image in &images {
        if image.present {
            println!("  ✅ {:<8} {}", image.language, image.image);
        } else {
            failed += 1;
            println!(
                "  ❌ {:<8} {} {}",
                image.language,
                image.image,
                image.message.as_deref().unwrap_or("")
            );
        }
    }
    if failed > 0 {
        bail!("{} image(s) failed to build", failed);
    }
    Ok(())
}

/// Remove sandboxes left behind by a crashed instance
pub async fn cleanup_sandboxes() -> Result<()> {
    let engine = start_engine().await?;
    println!("🗑️  Removing orphaned sandboxes...");

    let report = engine.cleanup_orphaned_sandboxes(CallerRole::Admin).await?;
    for id in &report.removed {
        println!("  removed {}", id);
    }
    for id in &report.failed {
        println!("  ❌ could not remove {}", id);
    }
    println!(
        "✅ {} removed, {} failed",
        report.removed.len(),
        report.failed.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gradebox_engine::sandbox::fake::FakeProvisioner;

    fn fake_engine() -> ExecutionEngine {
        ExecutionEngine::new(
            &EngineConfig::default(),
            Arc::new(LanguageRegistry::builtin().unwrap()),
            Arc::new(FakeProvisioner::echo()),
        )
    }

    fn request(test_cases: Vec<TestCase>) -> ExecutionRequest {
        ExecutionRequest {
            id: Uuid::new_v4(),
            language: "python".to_string(),
            source_code: "print(input())\n".to_string(),
            test_cases,
            resource_limits: None,
            security_level: SecurityLevel::High,
        }
    }

    #[test]
    fn test_parse_plain_array() {
        let file = parse_test_file(r#"[{"id":"1","input":"5\n3","expected_output":"8"}]"#).unwrap();
        assert_eq!(file.test_cases.len(), 1);
        assert_eq!(file.test_cases[0].weight, 1.0);
        assert!(!file.test_cases[0].is_hidden);
        assert!(file.resource_limits.is_none());
    }

    #[test]
    fn test_parse_object_with_limits() {
        let file = parse_test_file(
            r#"{
                "test_cases": [{"id":"a","input":"","expected_output":"x","is_hidden":true,"weight":3.0}],
                "resource_limits": {"memory_mb":128,"cpu_time_seconds":2,"wall_time_seconds":4,
                                    "max_processes":4,"max_open_files":32,"max_output_bytes":65536}
            }"#,
        )
        .unwrap();
        assert!(file.test_cases[0].is_hidden);
        assert_eq!(file.resource_limits.unwrap().memory_mb, 128);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_test_file(r#"{"cases": []}"#).is_err());
        assert!(parse_test_file("not json").is_err());
    }

    #[test]
    fn test_scan_source() {
        let registry = LanguageRegistry::builtin().unwrap();

        let clean = scan_source(&registry, "python", "print(1)\n", SecurityLevel::High).unwrap();
        assert!(clean.allowed);

        let dirty = scan_source(
            &registry,
            "python",
            "import os\nos.system('ls')\n",
            SecurityLevel::High,
        )
        .unwrap();
        assert!(!dirty.allowed);
        assert!(!dirty.violations.is_empty());

        assert!(scan_source(&registry, "cobol", "x", SecurityLevel::Low).is_err());
    }

    #[tokio::test]
    async fn test_execute_and_format() {
        let engine = fake_engine();
        let cases = vec![
            TestCase {
                id: "sum".to_string(),
                input: "8".to_string(),
                expected_output: "8".to_string(),
                is_hidden: false,
                weight: 1.0,
            },
            TestCase {
                id: "other".to_string(),
                input: "7".to_string(),
                expected_output: "9".to_string(),
                is_hidden: false,
                weight: 1.0,
            },
        ];

        let result = execute_source(&engine, &request(cases), CallerRole::Grader).await;
        assert!(!result.success);
        assert_eq!(result.passed_tests, 1);

        let report = format_result(&result);
        assert!(report.starts_with("❌"));
        assert!(report.contains("score 0.50"));
        assert!(report.contains("wrong answer"));
        assert!(report.contains("expected: \"9\""));
    }
}
