//! Invocation of the external neuroimaging programs. Arguments are passed as an argv list,
//! never through a shell.

use crate::error::{PipelineError, Result};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<OsString>,
    pub env: Vec<(String, String)>,
    /// files the program must leave behind for the run to count as a success
    pub expected_outputs: Vec<PathBuf>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            env: vec![],
            expected_outputs: vec![],
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args.extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn expects(mut self, path: impl AsRef<Path>) -> Self {
        self.expected_outputs.push(path.as_ref().to_path_buf());
        self
    }

    /// FSL programs write compressed nifti unless told otherwise
    pub fn fsl(program: impl Into<String>) -> Self {
        Self::new(program).env("FSLOUTPUTTYPE", "NIFTI")
    }

    /// the command line as it would be typed, for logging
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for a in &self.args {
            line.push(' ');
            line.push_str(&a.to_string_lossy());
        }
        line
    }
}

#[derive(Debug, Clone)]
pub struct ToolOutcome {
    /// exit code, None if the process was killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub missing_outputs: Vec<PathBuf>,
}

impl ToolOutcome {
    pub fn succeeded(&self) -> bool {
        self.missing_outputs.is_empty()
    }

    /// converts a run that left outputs missing into a typed error
    pub fn into_result(self, program: &str) -> Result<ToolOutcome> {
        if self.succeeded() {
            return Ok(self);
        }
        Err(PipelineError::Tool {
            program: program.to_string(),
            status: self.status.map_or("a signal".to_string(), |c| format!("status {}", c)),
            missing: self.missing_outputs[0].clone(),
            stderr: self.stderr,
        })
    }
}

pub fn missing_outputs(expected: &[PathBuf]) -> Vec<PathBuf> {
    expected.iter().filter(|p| !p.exists()).cloned().collect()
}

/// Runs tool invocations. Implemented by the real process runner and by test doubles.
pub trait ToolRunner {
    fn execute(&self, invocation: &ToolInvocation) -> Result<ToolOutcome>;

    /// executes and fails unless every expected output exists
    fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutcome> {
        debug!(command = %invocation.command_line(), "running external tool");
        let outcome = self.execute(invocation)?;
        if !outcome.succeeded() {
            warn!(program = %invocation.program, status = ?outcome.status, stderr = %outcome.stderr, "tool left outputs missing");
        }
        outcome.into_result(&invocation.program)
    }
}

/// runs programs found on the PATH
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl ToolRunner for SystemRunner {
    fn execute(&self, invocation: &ToolInvocation) -> Result<ToolOutcome> {
        let output = Command::new(&invocation.program)
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| PipelineError::Spawn {
                program: invocation.program.clone(),
                source: e,
            })?;
        Ok(outcome_from(output.status, &output.stdout, &output.stderr, &invocation.expected_outputs))
    }
}

fn outcome_from(status: ExitStatus, stdout: &[u8], stderr: &[u8], expected: &[PathBuf]) -> ToolOutcome {
    ToolOutcome {
        status: status.code(),
        stdout: String::from_utf8_lossy(stdout).to_string(),
        stderr: String::from_utf8_lossy(stderr).to_string(),
        missing_outputs: missing_outputs(expected),
    }
}

/// Runner double that records invocations and simulates the program with a closure
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::cell::RefCell;

    pub(crate) struct FakeRunner {
        pub calls: RefCell<Vec<ToolInvocation>>,
        on_run: Box<dyn Fn(&ToolInvocation)>,
    }

    impl FakeRunner {
        pub fn new(on_run: impl Fn(&ToolInvocation) + 'static) -> Self {
            Self { calls: RefCell::new(vec![]), on_run: Box::new(on_run) }
        }

        /// creates every expected output as an empty file
        pub fn producing() -> Self {
            Self::new(|inv| {
                for p in &inv.expected_outputs {
                    std::fs::write(p, b"").unwrap();
                }
            })
        }

        /// a program that runs but writes nothing
        pub fn silent() -> Self {
            Self::new(|_| {})
        }

        pub fn programs(&self) -> Vec<String> {
            self.calls.borrow().iter().map(|c| c.program.clone()).collect()
        }
    }

    impl ToolRunner for FakeRunner {
        fn execute(&self, invocation: &ToolInvocation) -> Result<ToolOutcome> {
            self.calls.borrow_mut().push(invocation.clone());
            (self.on_run)(invocation);
            Ok(ToolOutcome {
                status: Some(0),
                stdout: String::new(),
                stderr: String::new(),
                missing_outputs: missing_outputs(&invocation.expected_outputs),
            })
        }
    }
}
