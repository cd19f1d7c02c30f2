//! Subprocess evaluation over a JSON stdin/stdout protocol.
//!
//! # Protocol
//! - stdin:  one [`EvaluationContext`] as JSON, then EOF.
//! - stdout: one [`EvaluationResult`] as JSON. If the whole output does not
//!   parse, the last non-empty line is tried, so scripts may print progress
//!   before the result.
//! - stderr: passed through to the parent for logging.
//! - exit:   non-zero means the evaluation raised.
//!
//! `INSTIGATE_LOG_LEVEL` carries the code-server log level to the child.

use crate::error::{InstigateError, Result};
use crate::evaluation::{Evaluate, EvaluationContext, EvaluationError, EvaluationResult};
use std::collections::BTreeMap;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

pub const LOG_LEVEL_ENV: &str = "INSTIGATE_LOG_LEVEL";

const POLL: Duration = Duration::from_millis(25);

// ---------------------------------------------------------------------------
// CommandSpec
// ---------------------------------------------------------------------------

/// An argv plus environment, with relative programs resolved against
/// `working_dir`.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn from_argv(argv: &[String], working_dir: Option<&Path>) -> Result<Self> {
        let (program, args) = argv.split_first().ok_or_else(|| {
            InstigateError::InvalidDefinition("command must name a program".to_string())
        })?;
        if program.trim().is_empty() {
            return Err(InstigateError::InvalidDefinition(
                "command must name a program".to_string(),
            ));
        }
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            env: BTreeMap::new(),
            working_dir: working_dir.map(Path::to_path_buf),
        })
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Locate the program: paths containing a separator are taken relative
    /// to the working dir, bare names are looked up on `PATH`.
    pub fn resolve_program(&self) -> Result<PathBuf> {
        let program = Path::new(&self.program);
        if program.components().count() > 1 || program.is_absolute() {
            let path = match &self.working_dir {
                Some(dir) => crate::paths::resolve(dir, program),
                None => program.to_path_buf(),
            };
            if !path.exists() {
                return Err(InstigateError::InvalidDefinition(format!(
                    "program not found: {}",
                    path.display()
                )));
            }
            return Ok(path);
        }
        which::which(&self.program).map_err(|_| {
            InstigateError::InvalidDefinition(format!("program not found on PATH: {}", self.program))
        })
    }

    pub fn command(&self) -> Result<Command> {
        let mut cmd = Command::new(self.resolve_program()?);
        cmd.args(&self.args);
        cmd.envs(&self.env);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        Ok(cmd)
    }
}

// ---------------------------------------------------------------------------
// JSON subprocess helper
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CommandFailure {
    #[error("failed to spawn {program}: {message}")]
    Spawn { program: String, message: String },
    #[error("{program} exited with {status}")]
    Exit { program: String, status: ExitStatus },
    #[error("{program} did not finish within {limit:?}")]
    Timeout { program: String, limit: Duration },
    #[error("i/o error talking to {program}: {message}")]
    Io { program: String, message: String },
}

/// Run `spec`, feed `stdin_json` to it and collect stdout. The child is
/// killed if it outlives `timeout`.
pub fn run_json_command(
    spec: &CommandSpec,
    stdin_json: &str,
    timeout: Option<Duration>,
) -> std::result::Result<String, CommandFailure> {
    let program = spec.program.clone();
    let mut cmd = spec.command().map_err(|e| CommandFailure::Spawn {
        program: program.clone(),
        message: e.to_string(),
    })?;
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    let mut child = cmd.spawn().map_err(|e| CommandFailure::Spawn {
        program: program.clone(),
        message: e.to_string(),
    })?;

    let Some(mut stdout) = child.stdout.take() else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(CommandFailure::Io {
            program,
            message: "stdout was not captured".to_string(),
        });
    };
    let reader = std::thread::spawn(move || {
        let mut buf = String::new();
        stdout.read_to_string(&mut buf).map(|_| buf)
    });

    // Written off-thread so a child that never reads still meets the deadline.
    let writer = child.stdin.take().map(|mut stdin| {
        let input = stdin_json.to_owned();
        std::thread::spawn(move || stdin.write_all(input.as_bytes()))
    });

    let status = match timeout {
        Some(limit) => match wait_with_deadline(&mut child, limit) {
            Ok(Some(status)) => status,
            Ok(None) => return Err(CommandFailure::Timeout { program, limit }),
            Err(e) => {
                return Err(CommandFailure::Io {
                    program,
                    message: e.to_string(),
                })
            }
        },
        None => child.wait().map_err(|e| CommandFailure::Io {
            program: program.clone(),
            message: e.to_string(),
        })?,
    };

    if let Some(writer) = writer {
        match writer.join() {
            // A child that exits without reading its input is judged by its exit status.
            Ok(Err(e)) if e.kind() != ErrorKind::BrokenPipe => {
                return Err(CommandFailure::Io {
                    program,
                    message: e.to_string(),
                })
            }
            Ok(_) => {}
            Err(_) => {
                return Err(CommandFailure::Io {
                    program,
                    message: "stdin writer panicked".to_string(),
                })
            }
        }
    }

    let output = reader
        .join()
        .map_err(|_| CommandFailure::Io {
            program: program.clone(),
            message: "stdout reader panicked".to_string(),
        })?
        .map_err(|e| CommandFailure::Io {
            program: program.clone(),
            message: e.to_string(),
        })?;

    if !status.success() {
        return Err(CommandFailure::Exit { program, status });
    }
    Ok(output)
}

/// Poll `child` until it exits or `limit` passes. `Ok(None)` means it was
/// killed at the deadline.
pub fn wait_with_deadline(
    child: &mut Child,
    limit: Duration,
) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        std::thread::sleep(POLL);
    }
}

// ---------------------------------------------------------------------------
// CommandEvaluator
// ---------------------------------------------------------------------------

/// Evaluates an instigator by running an external code-server command.
#[derive(Debug, Clone)]
pub struct CommandEvaluator {
    spec: CommandSpec,
    timeout: Option<Duration>,
}

impl CommandEvaluator {
    pub fn new(spec: CommandSpec, log_level: &str, timeout: Option<Duration>) -> Self {
        Self {
            spec: spec.with_env(LOG_LEVEL_ENV, log_level),
            timeout,
        }
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }
}

impl Evaluate for CommandEvaluator {
    fn evaluate(&self, ctx: &EvaluationContext) -> std::result::Result<EvaluationResult, EvaluationError> {
        let input = serde_json::to_string(ctx)
            .map_err(|e| EvaluationError::malformed(format!("cannot encode context: {e}")))?;
        let stdout = run_json_command(&self.spec, &input, self.timeout).map_err(|e| match e {
            CommandFailure::Timeout { .. } => EvaluationError::timeout(e.to_string()),
            other => EvaluationError::raised(other.to_string()),
        })?;
        parse_result(&stdout)
    }
}

fn parse_result(stdout: &str) -> std::result::Result<EvaluationResult, EvaluationError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(EvaluationError::malformed("command produced no output"));
    }
    match serde_json::from_str::<EvaluationResult>(trimmed) {
        Ok(result) => Ok(result),
        Err(whole) => {
            let last = trimmed.lines().rev().find(|l| !l.trim().is_empty());
            match last.map(|l| serde_json::from_str::<EvaluationResult>(l.trim())) {
                Some(Ok(result)) => Ok(result),
                _ => {
                    let hint: String = trimmed.chars().take(200).collect();
                    Err(EvaluationError::malformed(format!(
                        "invalid evaluation result ({whole}): {hint}"
                    )))
                }
            }
        }
    }
}
