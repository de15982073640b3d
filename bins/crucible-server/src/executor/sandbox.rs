// Sandbox wrapper - prefixes the user command with the process-level
// isolation invocation. The wrapper binary and its seccomp profile are
// external collaborators; this module only owns the argv shape.

use std::path::Path;

use crucible_common::config::Settings;

/// Open-descriptor cap inside the jail.
const NOFILE_LIMIT: u64 = 64;

/// Build the full sandboxed argv for `command` rooted at `workdir`:
/// no network, no ambient root, a private filesystem view, and rlimits for
/// address space, CPU time, and file size.
pub fn wrap(command: &[String], workdir: &Path, settings: &Settings) -> Vec<String> {
    let mut argv = vec![
        settings.sandbox_binary.display().to_string(),
        format!("--profile={}", settings.sandbox_profile.display()),
        format!("--private={}", workdir.display()),
        "--net=none".to_string(),
        "--nodbus".to_string(),
        "--noroot".to_string(),
        format!("--rlimit-as={}", settings.max_memory_mib * 1024 * 1024),
        format!("--rlimit-cpu={}", settings.execution_timeout_secs),
        format!("--rlimit-fsize={}", settings.max_file_size_mib * 1024 * 1024),
        format!("--rlimit-nofile={}", NOFILE_LIMIT),
        format!("--timeout={}", clock_format(settings.execution_timeout_secs)),
    ];
    argv.extend(command.iter().cloned());
    argv
}

fn clock_format(total_secs: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        total_secs / 3600,
        (total_secs % 3600) / 60,
        total_secs % 60
    )
}
