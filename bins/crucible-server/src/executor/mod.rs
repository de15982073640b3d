/// Executor - sandboxed execution of one submission
///
/// **Core Responsibility:**
/// Write the source into a fresh private work directory, optionally compile
/// it, and run the resulting command inside the sandbox wrapper attached to
/// a new PTY. Raw terminal bytes go to the caller's callback as they
/// arrive; input bytes are consumed from a queue and written back verbatim.
///
/// **Critical Architectural Boundary:**
/// - The executor knows HOW to run code. It knows nothing about jobs,
///   the store, the bus, or WebSockets.
/// - Everything here is synchronous and runs on a dedicated worker thread;
///   PTY I/O blocks and must not share a cooperative scheduler.
///
/// **Cleanup guarantee:**
/// The work directory is a `TempDir`, removed on drop on every exit path -
/// success, compile failure, timeout, cancellation, or error.
mod pty;
mod sandbox;

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use thiserror::Error;
use tracing::debug;

use crucible_common::config::Settings;
use crucible_common::types::{validate_filename, ExecutionResult, Language};

pub use pty::TIMEOUT_EXIT_CODE;

/// Exit code reported when the build phase fails.
pub const COMPILE_FAILURE_EXIT_CODE: i32 = -1;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("invalid filename: {0}")]
    InvalidFilename(String),
    #[error("failed to prepare work directory: {0}")]
    Workspace(#[source] std::io::Error),
    #[error("failed to allocate pty: {0}")]
    Pty(#[source] nix::Error),
    #[error("failed to spawn sandboxed command: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to run compiler: {0}")]
    Compiler(#[source] std::io::Error),
    #[error("execution supervision failed: {0}")]
    Supervision(#[source] std::io::Error),
}

/// Everything one execution needs, handed over in a single move.
pub struct ExecuteRequest {
    pub code: String,
    pub filename: String,
    /// Invoked synchronously with each raw PTY chunk.
    pub on_output: Box<dyn FnMut(&[u8]) + Send>,
    /// Opaque byte strings to forward to the terminal.
    pub input: Receiver<Vec<u8>>,
    /// Observed at each poll tick; set by the orchestrator on disconnect.
    pub cancel: Arc<AtomicBool>,
}

pub trait Executor: Send + Sync {
    fn execute(&self, request: ExecuteRequest) -> Result<ExecutionResult, ExecutorError>;
}

/// Pick the executor variant for a language.
pub fn for_language(language: Language, settings: Settings) -> Box<dyn Executor> {
    match language {
        Language::Python => Box::new(InterpretedExecutor::new(settings, "python3")),
        Language::Javascript => Box::new(InterpretedExecutor::new(settings, "node")),
        Language::C => Box::new(CompiledExecutor::new(
            settings,
            CompilerSpec {
                program: "gcc",
                flags: &["-std=c11", "-lm"],
            },
        )),
        Language::Cpp => Box::new(CompiledExecutor::new(
            settings,
            CompilerSpec {
                program: "g++",
                flags: &["-std=c++17"],
            },
        )),
        Language::Rust => Box::new(CompiledExecutor::new(
            settings,
            CompilerSpec {
                program: "rustc",
                flags: &[],
            },
        )),
    }
}

/// Write the snippet into a fresh private directory under its validated
/// filename.
fn prepare_workspace(code: &str, filename: &str) -> Result<(TempDir, PathBuf), ExecutorError> {
    validate_filename(filename).map_err(|_| ExecutorError::InvalidFilename(filename.to_string()))?;
    let dir = TempDir::new().map_err(ExecutorError::Workspace)?;
    let source = dir.path().join(filename);
    std::fs::write(&source, code).map_err(ExecutorError::Workspace)?;
    Ok((dir, source))
}

fn run_under_pty(
    run_argv: &[String],
    workdir: &Path,
    settings: &Settings,
    request: ExecuteRequest,
) -> Result<ExecutionResult, ExecutorError> {
    let argv = sandbox::wrap(run_argv, workdir, settings);
    let outcome = pty::supervise(
        &argv,
        workdir,
        settings,
        request.on_output,
        &request.input,
        &request.cancel,
    )?;
    Ok(ExecutionResult {
        success: outcome.exit_code == 0,
        exit_code: outcome.exit_code,
        execution_time: outcome.execution_time,
        stdout: String::from_utf8_lossy(&outcome.output).into_owned(),
        // PTY-attached programs have stderr merged into the stream; this
        // field carries out-of-band failures only.
        stderr: String::new(),
    })
}

// ---------------------------------------------------------------------------
// Interpreted languages
// ---------------------------------------------------------------------------

pub struct InterpretedExecutor {
    settings: Settings,
    program: &'static str,
}

impl InterpretedExecutor {
    fn new(settings: Settings, program: &'static str) -> Self {
        Self { settings, program }
    }
}

impl Executor for InterpretedExecutor {
    fn execute(&self, request: ExecuteRequest) -> Result<ExecutionResult, ExecutorError> {
        let (workdir, source) = prepare_workspace(&request.code, &request.filename)?;
        let run_argv = vec![
            self.program.to_string(),
            source.display().to_string(),
        ];
        run_under_pty(&run_argv, workdir.path(), &self.settings, request)
    }
}

// ---------------------------------------------------------------------------
// Compiled languages
// ---------------------------------------------------------------------------

pub struct CompilerSpec {
    pub program: &'static str,
    pub flags: &'static [&'static str],
}

pub struct CompiledExecutor {
    settings: Settings,
    compiler: CompilerSpec,
}

impl CompiledExecutor {
    fn new(settings: Settings, compiler: CompilerSpec) -> Self {
        Self { settings, compiler }
    }

    /// Blocking compile with its own timeout and output capture. Returns
    /// the sanitized build log on failure, `None` on success.
    fn compile(
        &self,
        source: &Path,
        binary: &Path,
        workdir: &Path,
        filename: &str,
    ) -> Result<Option<String>, ExecutorError> {
        let mut child = Command::new(self.compiler.program)
            .arg(source)
            .arg("-o")
            .arg(binary)
            .args(self.compiler.flags)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(ExecutorError::Compiler)?;

        let timeout = Duration::from_secs(self.settings.compilation_timeout_secs);
        let started = Instant::now();
        let timed_out = loop {
            match child.try_wait().map_err(ExecutorError::Compiler)? {
                Some(_) => break false,
                None if started.elapsed() >= timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    break true;
                }
                None => thread::sleep(Duration::from_millis(50)),
            }
        };

        if timed_out {
            debug!(compiler = self.compiler.program, "Compilation timed out");
            return Ok(Some(format!(
                "compilation timed out after {} seconds",
                self.settings.compilation_timeout_secs
            )));
        }

        let output = child.wait_with_output().map_err(ExecutorError::Compiler)?;
        if output.status.success() {
            return Ok(None);
        }

        let log = String::from_utf8_lossy(&output.stderr).into_owned();
        Ok(Some(sanitize_build_log(&log, workdir, filename)))
    }
}

impl Executor for CompiledExecutor {
    fn execute(&self, request: ExecuteRequest) -> Result<ExecutionResult, ExecutorError> {
        let (workdir, source) = prepare_workspace(&request.code, &request.filename)?;
        let binary = workdir.path().join("program");

        let compile_started = Instant::now();
        if let Some(log) = self.compile(&source, &binary, workdir.path(), &request.filename)? {
            return Ok(ExecutionResult {
                success: false,
                exit_code: COMPILE_FAILURE_EXIT_CODE,
                execution_time: compile_started.elapsed().as_secs_f64(),
                stdout: String::new(),
                stderr: log,
            });
        }

        let run_argv = vec![binary.display().to_string()];
        run_under_pty(&run_argv, workdir.path(), &self.settings, request)
    }
}

/// Strip the temporary path out of a compiler log so nothing about the
/// filesystem layout leaks to the client; the logical filename stands in.
fn sanitize_build_log(log: &str, workdir: &Path, filename: &str) -> String {
    let dir = workdir.display().to_string();
    let source = format!("{}/{}", dir, filename);
    log.replace(&source, filename)
        .replace(&format!("{}/", dir), "")
        .replace(&dir, "")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn request(code: &str, filename: &str) -> ExecuteRequest {
        let (_tx, rx) = mpsc::channel();
        ExecuteRequest {
            code: code.to_string(),
            filename: filename.to_string(),
            on_output: Box::new(|_| {}),
            input: rx,
            cancel: Arc::default(),
        }
    }

    #[test]
    fn test_invalid_filename_refused_before_any_spawn() {
        let executor = InterpretedExecutor::new(Settings::default(), "python3");
        let result = executor.execute(request("print('hi')", "../escape.py"));
        assert!(matches!(result, Err(ExecutorError::InvalidFilename(_))));

        let result = executor.execute(request("print('hi')", "/abs.py"));
        assert!(matches!(result, Err(ExecutorError::InvalidFilename(_))));
    }

    #[test]
    fn test_workspace_removed_after_run() {
        let captured_path;
        {
            let (dir, source) = prepare_workspace("print('hi')", "main.py").unwrap();
            captured_path = dir.path().to_path_buf();
            assert!(source.exists());
            assert_eq!(std::fs::read_to_string(&source).unwrap(), "print('hi')");
        }
        assert!(!captured_path.exists());
    }

    #[test]
    fn test_sanitize_build_log_hides_temp_path() {
        let workdir = Path::new("/tmp/.tmpAbC123");
        let log = "/tmp/.tmpAbC123/main.c:1:1: error: expected declaration\n\
                   compilation terminated in /tmp/.tmpAbC123";
        let clean = sanitize_build_log(log, workdir, "main.c");
        assert!(clean.contains("main.c:1:1"));
        assert!(!clean.contains(".tmpAbC123"));
    }

    #[test]
    fn test_command_templates() {
        // The language table drives which binary runs; spot-check the wiring.
        let settings = Settings::default();
        assert!(matches!(
            for_language(Language::Python, settings.clone()).execute(request("x", "../bad")),
            Err(ExecutorError::InvalidFilename(_))
        ));
        assert!(matches!(
            for_language(Language::C, settings).execute(request("x", "../bad")),
            Err(ExecutorError::InvalidFilename(_))
        ));
    }

    /// Compile failure must surface a sanitized log, not an error.
    #[test]
    #[ignore] // Requires gcc on the host
    fn test_compile_failure_returns_minus_one() {
        let executor = CompiledExecutor::new(
            Settings::default(),
            CompilerSpec {
                program: "gcc",
                flags: &["-std=c11", "-lm"],
            },
        );
        let result = executor.execute(request("int main(){", "main.c")).unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, COMPILE_FAILURE_EXIT_CODE);
        assert!(result.stdout.is_empty());
        assert!(result.stderr.contains("main.c"));
        assert!(!result.stderr.contains("/tmp"));
    }
}
