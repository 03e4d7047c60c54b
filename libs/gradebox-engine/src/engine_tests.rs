/// End-to-end scenarios against the Docker backend
///
/// These exercise the real container path: image, tmpfs layout, wrapper
/// script, watchdog and cleanup. They need a Docker daemon and the
/// `gradebox-<language>` images built from `docker/` (see `gradebox-cli
/// rebuild-images`), so they are ignored by default:
///
/// ```text
/// cargo test -p gradebox-engine -- --ignored
/// ```

#[cfg(test)]
mod docker_scenarios {
    use crate::orchestrator::ExecutionEngine;
    use crate::registry::LanguageRegistry;
    use crate::sandbox::build_provisioner;
    use gradebox_common::config::EngineConfig;
    use gradebox_common::types::{
        CallerRole, CaseVerdict, ExecutionRequest, FailureKind, ResourceLimits, SecurityLevel,
        TestCase,
    };
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    async fn docker_engine() -> ExecutionEngine {
        let config = EngineConfig::default();
        let registry = Arc::new(LanguageRegistry::builtin().expect("builtin profiles"));
        let provisioner = build_provisioner(&config).expect("docker connection");
        let engine = ExecutionEngine::new(&config, registry, provisioner);
        engine.init().await.expect("docker init");
        engine
    }

    fn test_case(id: &str, input: &str, expected: &str, weight: f64) -> TestCase {
        TestCase {
            id: id.to_string(),
            input: input.to_string(),
            expected_output: expected.to_string(),
            is_hidden: false,
            weight,
        }
    }

    fn request(language: &str, source: &str, test_cases: Vec<TestCase>) -> ExecutionRequest {
        ExecutionRequest {
            id: Uuid::new_v4(),
            language: language.to_string(),
            source_code: source.to_string(),
            test_cases,
            resource_limits: None,
            security_level: SecurityLevel::High,
        }
    }

    async fn run(engine: &ExecutionEngine, req: &ExecutionRequest) -> gradebox_common::types::ExecutionResult {
        engine
            .execute(req, CallerRole::Grader, &CancellationToken::new())
            .await
    }

    /// Python sum of two integers
    #[tokio::test]
    #[ignore] // Requires Docker and the python image
    async fn test_python_sum_passes() {
        let engine = docker_engine().await;
        let req = request(
            "python",
            "a = int(input())\nb = int(input())\nprint(a + b)\n",
            vec![test_case("1", "5\n3", "8", 1.0)],
        );

        let result = run(&engine, &req).await;

        assert!(result.success, "{:?}", result);
        assert_eq!(result.score, 1.0);
        assert_eq!(engine.live_sandboxes(), 0);
    }

    /// Weights 1.0 (pass) and 3.0 (fail)
    #[tokio::test]
    #[ignore] // Requires Docker and the python image
    async fn test_weighted_score() {
        let engine = docker_engine().await;
        let req = request(
            "python",
            "print(int(input()) * 2)\n",
            vec![test_case("1", "2", "4", 1.0), test_case("2", "3", "7", 3.0)],
        );

        let result = run(&engine, &req).await;

        assert!((result.score - 0.25).abs() < 1e-9);
        assert_eq!(result.test_results[1].verdict, CaseVerdict::WrongAnswer);
    }

    /// Infinite loop with a 2 s wall limit
    #[tokio::test]
    #[ignore] // Requires Docker and the python image
    async fn test_infinite_loop_times_out() {
        let engine = docker_engine().await;
        let mut req = request(
            "python",
            "while True:\n    pass\n",
            vec![test_case("1", "", "", 1.0)],
        );
        req.resource_limits = Some(ResourceLimits {
            memory_mb: 64,
            cpu_time_seconds: 10,
            wall_time_seconds: 2,
            max_processes: 1,
            max_open_files: 16,
            max_output_bytes: 4096,
        });

        let started = Instant::now();
        let result = run(&engine, &req).await;

        assert_eq!(result.test_results[0].verdict, CaseVerdict::Timeout);
        // syntax check plus one case, each well under its budget plus grace
        assert!(started.elapsed() < Duration::from_secs(2 + 2 + 10));
        assert!(result.test_results[0].execution_time_ms < 2000 + 1500);
    }

    /// Syntax error stops before any case runs
    #[tokio::test]
    #[ignore] // Requires Docker and the python image
    async fn test_syntax_error_is_compile_error() {
        let engine = docker_engine().await;
        let req = request(
            "python",
            "def broken(:\n    return 1\n",
            vec![test_case("1", "", "1", 1.0)],
        );

        let result = run(&engine, &req).await;

        assert_eq!(result.failure_kind, Some(FailureKind::CompileError));
        assert_eq!(result.score, 0.0);
        assert_eq!(result.test_results[0].verdict, CaseVerdict::NotRun);
    }

    #[tokio::test]
    #[ignore] // Requires Docker and the cpp image
    async fn test_cpp_compile_once_run_many() {
        let engine = docker_engine().await;
        let source = r#"
#include <iostream>
int main() { long long n; std::cin >> n; std::cout << n * n << std::endl; return 0; }
"#;
        let req = request(
            "cpp",
            source,
            vec![
                test_case("1", "3", "9", 1.0),
                test_case("2", "12", "144", 1.0),
                test_case("3", "-4", "16", 1.0),
            ],
        );

        let result = run(&engine, &req).await;

        assert!(result.success, "{:?}", result);
        assert_eq!(result.passed_tests, 3);
    }

    #[tokio::test]
    #[ignore] // Requires Docker and the python image
    async fn test_memory_and_runtime_errors_are_case_scoped() {
        let engine = docker_engine().await;
        let source = "n = int(input())\nif n == 0:\n    raise ValueError('boom')\nif n == 1:\n    x = b'x' * (512 * 1024 * 1024)\nprint(n)\n";
        let req = request(
            "python",
            source,
            vec![
                test_case("err", "0", "0", 1.0),
                test_case("mem", "1", "1", 1.0),
                test_case("ok", "2", "2", 1.0),
            ],
        );

        let result = run(&engine, &req).await;

        assert_eq!(result.test_results[0].verdict, CaseVerdict::RuntimeError);
        assert!(result.test_results[0].error.as_deref().unwrap_or("").contains("ValueError"));
        assert_eq!(result.test_results[1].verdict, CaseVerdict::MemoryExceeded);
        assert_eq!(result.test_results[2].verdict, CaseVerdict::Passed);
    }

    #[tokio::test]
    #[ignore] // Requires Docker and the python image
    async fn test_root_filesystem_is_readonly() {
        let engine = docker_engine().await;
        let source = "try:\n    open('/etc/gradebox-check', 'w')\n    print('writable')\nexcept OSError:\n    print('readonly')\n";
        let mut req = request("python", source, vec![test_case("1", "", "readonly", 1.0)]);
        req.security_level = SecurityLevel::Low;

        let result = run(&engine, &req).await;

        assert!(result.success, "{:?}", result);
    }

    /// javac only fits under the compile floor; the run heap must fit the cgroup
    #[tokio::test]
    #[ignore] // Requires Docker and the java image
    async fn test_java_compiles_and_runs_at_default_level() {
        let engine = docker_engine().await;
        let source = "import java.util.Scanner;\npublic class Main {\n  public static void main(String[] a) {\n    Scanner in = new Scanner(System.in);\n    System.out.println(in.nextInt() + in.nextInt());\n  }\n}\n";
        let req = request(
            "java",
            source,
            vec![test_case("1", "5 3", "8", 1.0), test_case("2", "40 2", "42", 1.0)],
        );

        let result = run(&engine, &req).await;

        assert!(result.success, "{:?}", result);
        assert_eq!(result.failure_kind, None);
        assert!(result.effective_limits.unwrap().memory_mb < crate::orchestrator::COMPILE_MEMORY_FLOOR_MB);
    }
}
