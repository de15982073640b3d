use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Largest accepted source snippet, in bytes.
pub const MAX_CODE_BYTES_DEFAULT: usize = 10 * 1024;

/// Languages the engine can execute. The set is closed: anything else is
/// rejected before a job record exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Javascript,
    C,
    Cpp,
    Rust,
}

impl Language {
    /// Parse a user-supplied language tag. `c++` folds to `cpp`.
    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "python" => Some(Language::Python),
            "javascript" => Some(Language::Javascript),
            "c" => Some(Language::C),
            "cpp" | "c++" => Some(Language::Cpp),
            "rust" => Some(Language::Rust),
            _ => None,
        }
    }

    pub fn all_variants() -> &'static [Language] {
        &[
            Language::Python,
            Language::Javascript,
            Language::C,
            Language::Cpp,
            Language::Rust,
        ]
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Language::Python => "py",
            Language::Javascript => "js",
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Rust => "rs",
        }
    }

    /// Filename used when the client does not supply one.
    pub fn default_filename(&self) -> String {
        format!("main.{}", self.extension())
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Language::Python => "python",
            Language::Javascript => "javascript",
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Rust => "rust",
        };
        write!(f, "{}", name)
    }
}

/// Job lifecycle states. Transitions are monotone:
/// `queued → processing → completed | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(JobStatus::Queued),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Which wire stream an output chunk is tagged with. PTY output is merged
/// into `stdout`; `stderr` carries out-of-band text such as the sanitized
/// compile log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Outcome of one execution, stored on the job record in terminal states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub exit_code: i32,
    pub execution_time: f64,
    pub stdout: String,
    pub stderr: String,
}

/// A single user submission with its lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub code: String,
    pub language: Language,
    pub filename: String,
    pub status: JobStatus,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Messages published on a job's topics. Serialized form doubles as the
/// server→client WebSocket frames, so the orchestrator forwards them
/// verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BusMessage {
    Output {
        stream: StreamKind,
        data: String,
    },
    Complete {
        exit_code: i32,
        execution_time: f64,
    },
    Error {
        message: String,
    },
}

impl BusMessage {
    /// A job publishes exactly one terminal message; nothing follows it.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BusMessage::Complete { .. } | BusMessage::Error { .. })
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum SubmissionError {
    #[error("code must not be empty")]
    EmptyCode,
    #[error("code exceeds the {limit} byte limit")]
    CodeTooLarge { limit: usize },
    #[error("invalid filename: {0}")]
    InvalidFilename(String),
}

/// Validate a source snippet against the configured size bound.
pub fn validate_code(code: &str, max_bytes: usize) -> Result<(), SubmissionError> {
    if code.trim().is_empty() {
        return Err(SubmissionError::EmptyCode);
    }
    if code.len() > max_bytes {
        return Err(SubmissionError::CodeTooLarge { limit: max_bytes });
    }
    Ok(())
}

/// Validate the on-disk filename: a single path component built from
/// `[A-Za-z0-9_.-]`, with no parent traversal and no leading separator.
pub fn validate_filename(filename: &str) -> Result<(), SubmissionError> {
    let valid_chars = !filename.is_empty()
        && filename
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));

    if !valid_chars || filename.contains("..") || filename.starts_with('/') {
        return Err(SubmissionError::InvalidFilename(filename.to_string()));
    }
    Ok(())
}

/// Validate the full submission triple used by both the HTTP issuance
/// endpoint and the WebSocket execute frame.
pub fn validate_submission(
    code: &str,
    filename: &str,
    max_code_bytes: usize,
) -> Result<(), SubmissionError> {
    validate_code(code, max_code_bytes)?;
    validate_filename(filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_tags_round_trip() {
        for language in Language::all_variants() {
            assert_eq!(Language::from_str(&language.to_string()), Some(*language));
        }
        assert_eq!(Language::from_str("c++"), Some(Language::Cpp));
        assert_eq!(Language::from_str("ruby"), None);
        assert_eq!(Language::from_str(""), None);
    }

    #[test]
    fn test_default_filenames() {
        assert_eq!(Language::Python.default_filename(), "main.py");
        assert_eq!(Language::Cpp.default_filename(), "main.cpp");
        assert_eq!(Language::Rust.default_filename(), "main.rs");
    }

    #[test]
    fn test_status_terminality() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn test_code_size_boundary() {
        let limit = MAX_CODE_BYTES_DEFAULT;
        assert!(validate_code(&"a".repeat(limit), limit).is_ok());
        assert_eq!(
            validate_code(&"a".repeat(limit + 1), limit),
            Err(SubmissionError::CodeTooLarge { limit })
        );
        assert_eq!(validate_code("", limit), Err(SubmissionError::EmptyCode));
        assert_eq!(validate_code("  \n", limit), Err(SubmissionError::EmptyCode));
    }

    #[test]
    fn test_filename_rules() {
        assert!(validate_filename("main.py").is_ok());
        assert!(validate_filename("my_prog-2.cpp").is_ok());
        assert!(validate_filename("../x").is_err());
        assert!(validate_filename("/abs").is_err());
        assert!(validate_filename("a b.py").is_err());
        assert!(validate_filename("").is_err());
        assert!(validate_filename("dir/main.py").is_err());
    }

    #[test]
    fn test_bus_message_wire_shape() {
        let complete = BusMessage::Complete {
            exit_code: 0,
            execution_time: 0.42,
        };
        let json = serde_json::to_string(&complete).unwrap();
        assert!(json.contains(r#""type":"complete""#));
        assert!(json.contains(r#""exit_code":0"#));

        let output = BusMessage::Output {
            stream: StreamKind::Stdout,
            data: "hi\n".to_string(),
        };
        let json = serde_json::to_string(&output).unwrap();
        assert!(json.contains(r#""stream":"stdout""#));

        assert!(complete.is_terminal());
        assert!(!output.is_terminal());
    }
}
