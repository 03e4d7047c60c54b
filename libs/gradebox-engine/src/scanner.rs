//! Static source scanner.
//!
//! Runs before any sandbox exists and rejects submissions that reach for
//! process spawning, the network, the filesystem and so on, depending on the
//! requested [`SecurityLevel`]. Rules are tiered: a rule tagged with a level
//! applies at that level and every stricter one, so the rule sets nest
//! LOW ⊂ MEDIUM ⊂ HIGH ⊂ MAXIMUM.
//!
//! This is a lexical filter, not a parser. Comments are blanked before
//! matching (line numbers survive); string literals are left alone so that
//! module names inside `require("...")` or Go import blocks still match.
//! The sandbox is the real boundary; the scanner only saves a round trip.

use crate::registry::LanguageProfile;
use gradebox_common::types::{Language, SecurityLevel};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Bumped whenever a rule is added, removed or re-tiered.
pub const PATTERN_SET_VERSION: &str = "2024.2";

pub const MAX_LINE_LENGTH: usize = 500;
pub const MAX_NESTING_DEPTH: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    ProcessSpawn,
    Syscall,
    Network,
    Filesystem,
    DynamicEval,
    Reflection,
    Unsafe,
    Threads,
    Timers,
    ProcessExit,
    Environment,
}

impl Category {
    fn describe(&self) -> &'static str {
        match self {
            Category::ProcessSpawn => "process spawning",
            Category::Syscall => "raw system access",
            Category::Network => "network access",
            Category::Filesystem => "filesystem access",
            Category::DynamicEval => "dynamic code evaluation",
            Category::Reflection => "reflection",
            Category::Unsafe => "unsafe code",
            Category::Threads => "threads",
            Category::Timers => "timers",
            Category::ProcessExit => "explicit process exit",
            Category::Environment => "environment/system access",
        }
    }

    /// Least strict level at which this category is enforced.
    fn level(&self) -> SecurityLevel {
        match self {
            Category::ProcessSpawn | Category::Syscall | Category::Network => SecurityLevel::Low,
            Category::Filesystem => SecurityLevel::Medium,
            Category::DynamicEval | Category::Reflection | Category::Unsafe => SecurityLevel::High,
            Category::Threads
            | Category::Timers
            | Category::ProcessExit
            | Category::Environment => SecurityLevel::Maximum,
        }
    }
}

struct Rule {
    category: Category,
    regex: Regex,
}

use Category::*;

fn rule_table(language: Language) -> Vec<(Category, &'static str)> {
    match language {
        Language::Python => vec![
            (ProcessSpawn, r"\bimport\s+(subprocess|pty)\b"),
            (ProcessSpawn, r"\bfrom\s+(subprocess|pty)\s+import\b"),
            (ProcessSpawn, r"\bos\s*\.\s*(system|popen|fork|spawn\w*|exec\w*|kill)\s*\("),
            (Syscall, r"\b(import|from)\s+(ctypes|cffi|mmap|fcntl|resource)\b"),
            (Network, r"\b(import|from)\s+(socket|ssl|urllib|urllib3|requests|http|ftplib|smtplib|telnetlib|xmlrpc)\b"),
            (Filesystem, r"\b(import|from)\s+(os|shutil|pathlib|tempfile|glob|io)\b"),
            (Filesystem, r"\bopen\s*\("),
            (DynamicEval, r"\b(eval|exec)\s*\("),
            // Bare compile() only; method calls such as re.compile() are fine.
            (DynamicEval, r"(?:^|[^.\w])(?P<hit>compile\s*\()"),
            (DynamicEval, r"\bimport\s+builtins\b|\bfrom\s+builtins\s+import\b"),
            (DynamicEval, r"\b__import__\s*\("),
            (DynamicEval, r"\b(import|from)\s+(importlib|code|codeop|marshal|pickle)\b"),
            (Reflection, r"\b(getattr|setattr|delattr|globals|locals|vars)\s*\("),
            (Reflection, r"__(builtins|subclasses|globals|code|class|bases|mro)__"),
            (Reflection, r"\b(import|from)\s+(inspect|gc)\b"),
            (Threads, r"\b(import|from)\s+(threading|_thread|multiprocessing|concurrent|asyncio)\b"),
            (Timers, r"\b(import|from)\s+(signal|sched)\b"),
            (ProcessExit, r"\b(exit|quit)\s*\("),
            (Environment, r"\bimport\s+sys\b"),
            (Environment, r"\bfrom\s+sys\s+import\b"),
            (Environment, r"\b(import|from)\s+(platform|sysconfig)\b"),
            (Environment, r"\benviron\b"),
        ],
        Language::JavaScript => vec![
            (ProcessSpawn, r#"['"`](node:)?child_process['"`]"#),
            (ProcessSpawn, r"\bprocess\s*\.\s*(kill|binding|_linkedBinding|dlopen)\b"),
            (Syscall, r#"['"`](node:)?(inspector|v8|wasi)['"`]"#),
            (Network, r#"['"`](node:)?(net|http|https|http2|dgram|dns|tls)['"`]"#),
            (Network, r"\b(fetch|XMLHttpRequest|WebSocket)\b"),
            (Filesystem, r#"['"`](node:)?(fs|fs/promises|path|os)['"`]"#),
            (DynamicEval, r"\beval\s*\("),
            (DynamicEval, r"\bFunction\s*\("),
            (DynamicEval, r#"['"`](node:)?vm['"`]"#),
            (DynamicEval, r"\bimport\s*\("),
            (Reflection, r"\bReflect\s*\."),
            (Reflection, r"\bnew\s+Proxy\b"),
            (Reflection, r"__proto__|\bconstructor\s*\.\s*constructor\b"),
            (Threads, r#"['"`](node:)?(worker_threads|cluster)['"`]"#),
            (Timers, r"\bset(Timeout|Interval|Immediate)\s*\("),
            (ProcessExit, r"\bprocess\s*\.\s*(exit|abort)\b"),
            (Environment, r"\bprocess\s*\.\s*(env|argv|cwd|chdir|platform)\b"),
        ],
        Language::Java => vec![
            (ProcessSpawn, r"\bRuntime\s*\.\s*getRuntime\s*\("),
            (ProcessSpawn, r"\bProcess(Builder|Handle)\b"),
            (Syscall, r"\bSystem\s*\.\s*load(Library)?\s*\("),
            (Syscall, r"\bnative\s+\w+"),
            (Network, r"\bjava\s*\.\s*net\b"),
            (Network, r"\b(Socket|ServerSocket|DatagramSocket|HttpURLConnection|HttpClient)\b"),
            (Filesystem, r"\bjava\s*\.\s*nio\s*\.\s*file\b"),
            (Filesystem, r"\b(File|FileInputStream|FileOutputStream|FileReader|FileWriter|RandomAccessFile|Files|Paths)\b"),
            (DynamicEval, r"\bjavax\s*\.\s*(script|tools)\b"),
            (DynamicEval, r"\b(ScriptEngine|ToolProvider)\b"),
            (Reflection, r"\bjava\s*\.\s*lang\s*\.\s*reflect\b"),
            (Reflection, r"\bClass\s*\.\s*forName\b"),
            (Reflection, r"\.\s*getDeclared(Method|Field|Constructor)s?\s*\("),
            (Reflection, r"\.\s*setAccessible\s*\("),
            (Reflection, r"\bMethodHandles?\b"),
            (Unsafe, r"\bsun\s*\.\s*misc\b|\bjdk\s*\.\s*internal\b"),
            (Threads, r"\b(Thread|ThreadPoolExecutor|ExecutorService|Executors|ForkJoinPool|CompletableFuture)\b"),
            (Threads, r"\bjava\s*\.\s*util\s*\.\s*concurrent\b"),
            (Threads, r"\.\s*parallel(Stream)?\s*\("),
            (Timers, r"\b(Timer|TimerTask|ScheduledExecutorService)\b"),
            (ProcessExit, r"\bSystem\s*\.\s*exit\s*\("),
            (ProcessExit, r"\bRuntime\s*\.\s*(halt|exit)\b"),
            (Environment, r"\bSystem\s*\.\s*(getenv|getProperty|setProperty|getProperties)\s*\("),
        ],
        Language::Cpp => vec![
            (ProcessSpawn, r"\b(system|popen|fork|vfork|execl|execlp|execle|execv|execvp|execvpe|execve|posix_spawnp?)\s*\("),
            (Syscall, r"\bsyscall\s*\("),
            (Syscall, r"\bptrace\b"),
            (Syscall, r"\b(asm|__asm__)\b"),
            (Syscall, r"#\s*include\s*<sys/(syscall|ptrace|mman|prctl)\.h>"),
            (Network, r"#\s*include\s*<(sys/socket|netinet/\w+|arpa/inet|netdb)\.h>"),
            (Network, r"\bsocket\s*\("),
            (Filesystem, r"#\s*include\s*<(fstream|filesystem|dirent\.h|fcntl\.h|unistd\.h|sys/stat\.h)>"),
            (Filesystem, r"\b(fopen|freopen|unlink|rmdir|mkdir|chmod|opendir)\s*\("),
            // std::remove over iterators is the erase-remove idiom; a path literal is not.
            (Filesystem, r"(?:^|[^.\w:>])(?P<hit>(remove|rename)\s*\()"),
            (Filesystem, r#"\bstd\s*::\s*(remove|rename)\s*\(\s*""#),
            (Filesystem, r"\bstd\s*::\s*(filesystem|[io]?fstream)\b"),
            (DynamicEval, r"\b(dlopen|dlsym)\b"),
            (DynamicEval, r"#\s*include\s*<dlfcn\.h>"),
            (Unsafe, r"\breinterpret_cast\b"),
            (Unsafe, r"\b__attribute__\s*\(\s*\(\s*constructor"),
            (Threads, r"#\s*include\s*<(thread|future|pthread\.h|atomic)>"),
            (Threads, r"\bstd\s*::\s*(thread|jthread|async)\b"),
            (Threads, r"\bpthread_\w+\s*\("),
            (Timers, r"#\s*include\s*<(csignal|signal\.h)>"),
            (Timers, r"\b(alarm|signal|sleep|usleep|nanosleep|setitimer)\s*\("),
            (ProcessExit, r"\b(exit|_exit|_Exit|abort|quick_exit)\s*\("),
            (Environment, r"\b(getenv|setenv|putenv|secure_getenv)\s*\("),
            (Environment, r"\benviron\b"),
        ],
        Language::CSharp => vec![
            (ProcessSpawn, r"\bProcess\s*\.\s*Start\b"),
            (ProcessSpawn, r"\bSystem\s*\.\s*Diagnostics\b"),
            (Syscall, r"\b(DllImport|LibraryImport)\b"),
            (Syscall, r"\bextern\s+\w+"),
            (Network, r"\bSystem\s*\.\s*Net\b"),
            (Network, r"\b(HttpClient|WebClient|TcpClient|TcpListener|UdpClient|Socket|WebRequest)\b"),
            (Filesystem, r"\b(File|Directory|FileInfo|DirectoryInfo|DriveInfo|FileStream|Path)\s*[.(]"),
            (Filesystem, r"\bnew\s+(FileStream|StreamWriter|StreamReader)\s*\(\s*@?\x22"),
            (DynamicEval, r"\b(CSharpCodeProvider|CSharpScript|CodeDom)\b"),
            (DynamicEval, r"\bSystem\s*\.\s*Reflection\s*\.\s*Emit\b"),
            (Reflection, r"\bSystem\s*\.\s*Reflection\b"),
            (Reflection, r"\bAssembly\s*\.\s*Load\w*"),
            (Reflection, r"\bActivator\s*\.\s*CreateInstance\b"),
            (Reflection, r"\.\s*(InvokeMember|GetMethod|GetField|GetProperty)\s*\("),
            (Reflection, r"\bType\s*\.\s*GetType\s*\("),
            (Unsafe, r"\bunsafe\b"),
            (Unsafe, r"\b(Marshal|Unsafe)\s*\."),
            (Unsafe, r"\bstackalloc\b"),
            (Threads, r"\bSystem\s*\.\s*Threading\b"),
            (Threads, r"\b(Thread|ThreadPool|Task|Parallel)\s*\."),
            (Threads, r"\bnew\s+Thread\b"),
            (Timers, r"\bnew\s+Timer\b|\bSystem\s*\.\s*Timers\b"),
            (ProcessExit, r"\bEnvironment\s*\.\s*(Exit|FailFast)\s*\("),
            (Environment, r"\bEnvironment\s*\.\s*(GetEnvironmentVariables?|SetEnvironmentVariable|GetCommandLineArgs|CurrentDirectory|MachineName|UserName)\b"),
        ],
        Language::Go => vec![
            (ProcessSpawn, r#""os/exec""#),
            (ProcessSpawn, r"\bexec\s*\.\s*Command\b"),
            (ProcessSpawn, r"\bos\s*\.\s*(StartProcess|FindProcess)\b"),
            (Syscall, r#""(syscall|golang\.org/x/sys/\w+)""#),
            (Syscall, r"\bsyscall\s*\."),
            (Network, r#""net(/\w+)*""#),
            (Filesystem, r#""(io/ioutil|io/fs|path/filepath|embed)""#),
            (Filesystem, r"\bos\s*\.\s*(Open|OpenFile|Create|ReadFile|WriteFile|Remove|RemoveAll|Mkdir|MkdirAll|ReadDir|Rename|Chdir|Chmod|Chown|Symlink|Link|Truncate|DirFS)\s*\("),
            (DynamicEval, r#""plugin""#),
            (Reflection, r#""reflect""#),
            (Reflection, r"\breflect\s*\."),
            (Unsafe, r#""unsafe""#),
            (Unsafe, r"\bunsafe\s*\."),
            (Unsafe, r#"\bimport\s+"C""#),
            (Threads, r"\bgo\s+(func\b|[A-Za-z_][\w.]*\s*\()"),
            (Threads, r#""(sync|sync/atomic|runtime)""#),
            (Timers, r"\btime\s*\.\s*(After|AfterFunc|NewTimer|NewTicker|Tick|Sleep)\b"),
            (ProcessExit, r"\bos\s*\.\s*Exit\s*\("),
            (ProcessExit, r"\bruntime\s*\.\s*Goexit\b"),
            (Environment, r"\bos\s*\.\s*(Getenv|Setenv|Unsetenv|Environ|LookupEnv|Args|Hostname|Getwd)\b"),
        ],
        Language::Rust => vec![
            (ProcessSpawn, r"\bstd\s*::\s*process\b"),
            (ProcessSpawn, r"\bCommand\s*::\s*new\b"),
            (Syscall, r"\blibc\s*::"),
            (Syscall, r#"\bextern\s+"C""#),
            (Syscall, r"\b(asm|global_asm)!"),
            (Network, r"\bstd\s*::\s*net\b"),
            (Network, r"\b(TcpStream|TcpListener|UdpSocket)\b"),
            (Filesystem, r"\bstd\s*::\s*fs\b"),
            (Filesystem, r"\bFile\s*::\s*(open|create)\b|\bOpenOptions\b"),
            (Filesystem, r"\binclude(_str|_bytes)?!"),
            (DynamicEval, r"\bextern\s+crate\b"),
            (Unsafe, r"\bunsafe\b"),
            (Unsafe, r"\btransmute\b"),
            (Unsafe, r"#\s*!?\[\s*(no_mangle|link|link_section|export_name)\b"),
            (Reflection, r"\bstd\s*::\s*any\s*::\s*type_name\b"),
            (Threads, r"\bstd\s*::\s*thread\b"),
            (Threads, r"\bthread\s*::\s*(spawn|scope|Builder)\b"),
            (Timers, r"\bthread\s*::\s*sleep\b"),
            (ProcessExit, r"\b(exit|abort)\s*\("),
            (Environment, r"\bstd\s*::\s*env\b"),
            (Environment, r"\benv\s*::\s*(var|vars|var_os|args|set_var|current_dir)\b"),
            (Environment, r"\benv!\s*\("),
        ],
    }
}

lazy_static! {
    static ref RULES: HashMap<Language, Vec<Rule>> = Language::ALL
        .iter()
        .map(|&language| {
            let rules = rule_table(language)
                .into_iter()
                .map(|(category, pattern)| Rule {
                    category,
                    regex: Regex::new(pattern).expect("scanner rule must compile"),
                })
                .collect();
            (language, rules)
        })
        .collect();
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanVerdict {
    pub allowed: bool,
    pub violations: Vec<String>,
    pub warnings: Vec<String>,
    pub pattern_set_version: String,
}

/// Inspect `code` against the built-in rules for the profile's language plus
/// the profile's own extra patterns.
pub fn scan(code: &str, profile: &LanguageProfile, level: SecurityLevel) -> ScanVerdict {
    let stripped = strip_comments(code, profile.id);
    let mut violations = Vec::new();
    let mut warnings = Vec::new();

    let rules = RULES.get(&profile.id).map(Vec::as_slice).unwrap_or_default();
    let active: Vec<&Rule> = rules.iter().filter(|r| r.category.level() <= level).collect();

    let extra: Vec<Regex> = profile
        .disallowed_patterns
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect();

    for (idx, line) in stripped.lines().enumerate() {
        let line_no = idx + 1;
        for rule in &active {
            if let Some(caps) = rule.regex.captures(line) {
                let hit = caps.name("hit").or_else(|| caps.get(0)).map_or("", |m| m.as_str());
                violations.push(format!(
                    "Line {}: {} is not allowed ('{}')",
                    line_no,
                    rule.category.describe(),
                    hit.trim()
                ));
            }
        }
        for regex in &extra {
            if let Some(m) = regex.find(line) {
                violations.push(format!(
                    "Line {}: disallowed construct ('{}')",
                    line_no,
                    m.as_str().trim()
                ));
            }
        }
    }

    for (idx, line) in code.lines().enumerate() {
        let length = line.chars().count();
        if length > MAX_LINE_LENGTH {
            warnings.push(format!("Line {}: unusually long line ({} characters)", idx + 1, length));
        }
    }

    let depth = nesting_depth(&stripped, profile.id);
    if depth > MAX_NESTING_DEPTH {
        let message = format!("Excessive nesting depth: {} levels", depth);
        if level == SecurityLevel::Maximum {
            violations.push(message);
        } else {
            warnings.push(message);
        }
    }

    debug!(
        language = %profile.id,
        level = %level,
        violations = violations.len(),
        warnings = warnings.len(),
        "Scanned submission"
    );

    ScanVerdict {
        allowed: violations.is_empty(),
        violations,
        warnings,
        pattern_set_version: PATTERN_SET_VERSION.to_string(),
    }
}

/// Replace comment bodies with spaces, keeping newlines and string literals.
fn strip_comments(code: &str, language: Language) -> String {
    let chars: Vec<char> = code.chars().collect();
    let mut out = String::with_capacity(code.len());
    let hash_comments = language == Language::Python;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if hash_comments && c == '#' {
            while i < chars.len() && chars[i] != '\n' {
                out.push(' ');
                i += 1;
            }
            continue;
        }

        if !hash_comments && c == '/' && next == Some('/') {
            while i < chars.len() && chars[i] != '\n' {
                out.push(' ');
                i += 1;
            }
            continue;
        }

        if !hash_comments && c == '/' && next == Some('*') {
            out.push_str("  ");
            i += 2;
            while i < chars.len() {
                if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
                    out.push_str("  ");
                    i += 2;
                    break;
                }
                out.push(if chars[i] == '\n' { '\n' } else { ' ' });
                i += 1;
            }
            continue;
        }

        if let Some(end) = string_literal_end(&chars, i, language) {
            out.extend(&chars[i..end]);
            i = end;
            continue;
        }

        out.push(c);
        i += 1;
    }

    out
}

/// If a string or char literal starts at `start`, return the index just past it.
fn string_literal_end(chars: &[char], start: usize, language: Language) -> Option<usize> {
    let quote = chars[start];
    let is_quote = match language {
        Language::Rust => quote == '"' || quote == '\'',
        Language::JavaScript | Language::Go => matches!(quote, '"' | '\'' | '`'),
        _ => quote == '"' || quote == '\'',
    };
    if !is_quote {
        return None;
    }

    if language == Language::Rust && quote == '\'' {
        // 'x' and '\n' are char literals; anything else is a lifetime.
        return match (chars.get(start + 1), chars.get(start + 2)) {
            (Some('\\'), _) => chars[start + 2..]
                .iter()
                .position(|&c| c == '\'')
                .map(|p| start + 2 + p + 1),
            (Some(_), Some('\'')) => Some(start + 3),
            _ => None,
        };
    }

    let triple = language == Language::Python
        && chars.get(start + 1) == Some(&quote)
        && chars.get(start + 2) == Some(&quote);
    let raw = quote == '`';

    let mut i = if triple { start + 3 } else { start + 1 };
    while i < chars.len() {
        let c = chars[i];
        if c == '\\' && !raw {
            i += 2;
            continue;
        }
        if triple {
            if c == quote && chars.get(i + 1) == Some(&quote) && chars.get(i + 2) == Some(&quote) {
                return Some(i + 3);
            }
        } else if c == quote {
            return Some(i + 1);
        } else if c == '\n' && !raw {
            // Unterminated single-line literal; stop at the line end.
            return Some(i);
        }
        i += 1;
    }
    Some(chars.len())
}

fn nesting_depth(stripped: &str, language: Language) -> usize {
    if language == Language::Python {
        return python_nesting(stripped);
    }
    let mut depth = 0usize;
    let mut max_depth = 0usize;
    for c in stripped.chars() {
        match c {
            '{' => {
                depth += 1;
                max_depth = max_depth.max(depth);
            }
            '}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    max_depth
}

const PYTHON_BLOCK_KEYWORDS: [&str; 12] = [
    "if ", "elif ", "else:", "for ", "while ", "try:", "except", "finally:", "with ", "def ",
    "class ", "async ",
];

fn python_nesting(stripped: &str) -> usize {
    let mut max_depth = 0;
    for line in stripped.lines() {
        let trimmed = line.trim_start();
        if trimmed.is_empty() {
            continue;
        }
        if PYTHON_BLOCK_KEYWORDS.iter().any(|k| trimmed.starts_with(k)) {
            let indent: usize = line[..line.len() - trimmed.len()]
                .chars()
                .map(|c| if c == '\t' { 4 } else { 1 })
                .sum();
            max_depth = max_depth.max(indent / 4 + 1);
        }
    }
    max_depth
}
