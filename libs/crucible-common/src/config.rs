// Runtime configuration, loaded once at startup from the environment.

use std::path::PathBuf;
use std::str::FromStr;

use crate::types::MAX_CODE_BYTES_DEFAULT;

#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub redis_url: String,

    /// Wall-clock limit for the sandboxed program.
    pub execution_timeout_secs: u64,
    /// Limit for the blocking compile phase of compiled languages.
    pub compilation_timeout_secs: u64,
    pub max_memory_mib: u64,
    pub max_file_size_mib: u64,
    pub max_code_bytes: usize,

    pub job_ttl_secs: u64,
    /// Token lifetime; clamped to the job TTL on issuance.
    pub token_ttl_secs: u64,

    pub pty_chunk_bytes: usize,
    pub pty_poll_interval_ms: u64,

    pub sandbox_binary: PathBuf,
    pub sandbox_profile: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            execution_timeout_secs: 7,
            compilation_timeout_secs: 10,
            max_memory_mib: 300,
            max_file_size_mib: 1,
            max_code_bytes: MAX_CODE_BYTES_DEFAULT,
            job_ttl_secs: 3600,
            token_ttl_secs: 120,
            pty_chunk_bytes: 4096,
            pty_poll_interval_ms: 10,
            sandbox_binary: PathBuf::from("/usr/bin/firejail"),
            sandbox_profile: PathBuf::from("/etc/firejail/sandbox.profile"),
        }
    }
}

impl Settings {
    /// Build settings from `CRUCIBLE_*` environment variables, falling back
    /// to the defaults above for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Settings::default();
        Settings {
            bind_addr: env_or("CRUCIBLE_BIND_ADDR", defaults.bind_addr),
            redis_url: env_or("REDIS_URL", defaults.redis_url),
            execution_timeout_secs: env_or(
                "CRUCIBLE_EXECUTION_TIMEOUT_SECS",
                defaults.execution_timeout_secs,
            ),
            compilation_timeout_secs: env_or(
                "CRUCIBLE_COMPILATION_TIMEOUT_SECS",
                defaults.compilation_timeout_secs,
            ),
            max_memory_mib: env_or("CRUCIBLE_MAX_MEMORY_MIB", defaults.max_memory_mib),
            max_file_size_mib: env_or("CRUCIBLE_MAX_FILE_SIZE_MIB", defaults.max_file_size_mib),
            max_code_bytes: env_or("CRUCIBLE_MAX_CODE_BYTES", defaults.max_code_bytes),
            job_ttl_secs: env_or("CRUCIBLE_JOB_TTL_SECS", defaults.job_ttl_secs),
            token_ttl_secs: env_or("CRUCIBLE_TOKEN_TTL_SECS", defaults.token_ttl_secs),
            pty_chunk_bytes: env_or("CRUCIBLE_PTY_CHUNK_BYTES", defaults.pty_chunk_bytes),
            pty_poll_interval_ms: env_or(
                "CRUCIBLE_PTY_POLL_INTERVAL_MS",
                defaults.pty_poll_interval_ms,
            ),
            sandbox_binary: env_or("CRUCIBLE_SANDBOX_BINARY", defaults.sandbox_binary),
            sandbox_profile: env_or("CRUCIBLE_SANDBOX_PROFILE", defaults.sandbox_profile),
        }
    }

    /// Effective token lifetime: never longer than the job record itself.
    pub fn effective_token_ttl_secs(&self) -> u64 {
        self.token_ttl_secs.min(self.job_ttl_secs)
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}
