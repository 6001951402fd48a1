//! The domain processing step, treated as a black box.
//!
//! A task reads one input file and leaves a result file and a log file next
//! to it. Their names derive from the input's stem: `sample.vcf` produces
//! `sample.annot.vcf` and `sample.vcf.count.log` with the default suffixes.

use std::path::{Path, PathBuf};
use std::process::Command;

pub const DEFAULT_RESULT_SUFFIX: &str = ".annot.vcf";
pub const DEFAULT_LOG_SUFFIX: &str = ".vcf.count.log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutput {
    pub result: PathBuf,
    pub log: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("task produced no output file {0}")]
    MissingOutput(PathBuf),

    #[error("invalid input path {0}")]
    InvalidInput(PathBuf),
}

pub trait ProcessingTask: Send + Sync {
    /// Process `input` (a file inside `work_dir`).
    fn run(&self, input: &Path, work_dir: &Path) -> Result<TaskOutput, TaskError>;
}

impl<F> ProcessingTask for F
where
    F: Fn(&Path, &Path) -> Result<TaskOutput, TaskError> + Send + Sync,
{
    fn run(&self, input: &Path, work_dir: &Path) -> Result<TaskOutput, TaskError> {
        self(input, work_dir)
    }
}

/// Derived output file names for an input file.
#[derive(Debug, Clone)]
pub struct OutputNaming {
    pub result_suffix: String,
    pub log_suffix: String,
}

impl Default for OutputNaming {
    fn default() -> Self {
        Self {
            result_suffix: DEFAULT_RESULT_SUFFIX.to_string(),
            log_suffix: DEFAULT_LOG_SUFFIX.to_string(),
        }
    }
}

impl OutputNaming {
    pub fn outputs_for(&self, input: &Path) -> Result<TaskOutput, TaskError> {
        let stem = input
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| TaskError::InvalidInput(input.to_path_buf()))?;
        let dir = input.parent().unwrap_or_else(|| Path::new(""));
        Ok(TaskOutput {
            result: dir.join(format!("{stem}{}", self.result_suffix)),
            log: dir.join(format!("{stem}{}", self.log_suffix)),
        })
    }
}

/// Runs an external program as `program [args…] <input>` inside the work dir.
#[derive(Debug, Clone)]
pub struct CommandTask {
    program: String,
    args: Vec<String>,
    naming: OutputNaming,
}

impl CommandTask {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            naming: OutputNaming::default(),
        }
    }

    pub fn with_naming(mut self, naming: OutputNaming) -> Self {
        self.naming = naming;
        self
    }
}

impl ProcessingTask for CommandTask {
    fn run(&self, input: &Path, work_dir: &Path) -> Result<TaskOutput, TaskError> {
        // The child runs inside `work_dir`, so a relative input would resolve twice.
        let input = std::path::absolute(input).map_err(|_| TaskError::InvalidInput(input.to_path_buf()))?;
        let work_dir = std::path::absolute(work_dir).map_err(|_| TaskError::InvalidInput(work_dir.to_path_buf()))?;
        let expected = self.naming.outputs_for(&input)?;

        tracing::debug!(program = %self.program, input = %input.display(), "running task");
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(&input)
            .current_dir(&work_dir)
            .output()
            .map_err(|source| TaskError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TaskError::Failed {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: stderr.trim().chars().take(2048).collect(),
            });
        }

        for path in [&expected.result, &expected.log] {
            if !path.is_file() {
                return Err(TaskError::MissingOutput(path.clone()));
            }
        }
        Ok(expected)
    }
}
