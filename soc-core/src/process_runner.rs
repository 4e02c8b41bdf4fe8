//! Launches external tools in their own process group, captures output,
//! and enforces a wall-clock timeout that kills the whole group on expiry.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Outcome of a single external-tool invocation. A non-zero `exit_code` is
/// not itself an error — callers inspect both `exit_code` and `stdout`.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Run `argv[0]` with `argv[1..]` as arguments, in a fresh process group,
/// bounded by `timeout`. `argv` must be non-empty.
pub async fn run(argv: &[String], timeout: Duration) -> RunOutput {
    run_with_env(argv, &[], timeout).await
}

/// As `run`, but augmenting the inherited environment with `extra_env`
/// (used by the firmware analyzer invocation's `GPT_OPTION`).
pub async fn run_with_env(
    argv: &[String],
    extra_env: &[(String, String)],
    timeout: Duration,
) -> RunOutput {
    assert!(!argv.is_empty(), "argv must contain at least the program name");

    tracing::debug!(cmd = %argv.join(" "), "exec_cmd");

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .envs(extra_env.iter().cloned())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        // New process group so the whole tree (e.g. sudo + child) can be
        // killed together on timeout, mirroring `start_new_session=True`.
        cmd.process_group(0);
    }

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            return RunOutput {
                stdout: String::new(),
                stderr: format!("failed to spawn {}: {e}", argv[0]),
                exit_code: -1,
            };
        }
    };

    let pid = child.id();

    let wait_fut = async {
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        if let Some(mut out) = child.stdout.take() {
            let _ = out.read_to_end(&mut stdout_buf).await;
        }
        if let Some(mut err) = child.stderr.take() {
            let _ = err.read_to_end(&mut stderr_buf).await;
        }
        let status = child.wait().await;
        (status, stdout_buf, stderr_buf)
    };

    match tokio::time::timeout(timeout, wait_fut).await {
        Ok((status, stdout_buf, stderr_buf)) => {
            let exit_code = status.ok().and_then(|s| s.code()).unwrap_or(-1);
            RunOutput {
                stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
                stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
                exit_code,
            }
        }
        Err(_) => {
            kill_process_group(pid);
            // Give the OS a moment to reap the killed tree; best effort.
            let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
            tracing::warn!(cmd = %argv[0], timeout_s = timeout.as_secs(), "cmd_timeout");
            RunOutput {
                stdout: String::new(),
                stderr: format!("Command timed out after {}s", timeout.as_secs()),
                exit_code: -1,
            }
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    // SIGTERM the whole process group (negative pid). Fall back to killing
    // just the direct child if permission is denied.
    let rc = unsafe { libc::kill(-(pid as i32), libc::SIGTERM) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EPERM) {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

/// Locate a binary on `PATH`, falling back to common absolute install
/// locations, then the bare name (exec will fail if truly absent).
pub fn find_binary(name: &str, override_path: Option<&str>) -> String {
    if let Some(p) = override_path {
        if !p.is_empty() {
            return p.to_string();
        }
    }
    if let Ok(path_var) = std::env::var("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return candidate.to_string_lossy().into_owned();
            }
        }
    }
    for prefix in ["/usr/bin", "/usr/local/bin", "/snap/bin"] {
        let candidate = format!("{prefix}/{name}");
        if std::path::Path::new(&candidate).is_file() {
            return candidate;
        }
    }
    name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_captures_stdout_and_exit_code() {
        let argv = vec!["echo".to_string(), "hello".to_string()];
        let out = run(&argv, Duration::from_secs(5)).await;
        assert_eq!(out.exit_code, 0);
        assert!(out.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn run_reports_nonzero_exit_without_erroring() {
        let argv = vec!["false".to_string()];
        let out = run(&argv, Duration::from_secs(5)).await;
        assert_ne!(out.exit_code, 0);
    }

    #[tokio::test]
    async fn run_times_out() {
        let argv = vec!["sleep".to_string(), "5".to_string()];
        let out = run(&argv, Duration::from_millis(200)).await;
        assert_eq!(out.exit_code, -1);
        assert!(out.stderr.contains("timed out"));
    }

    #[test]
    fn find_binary_prefers_override() {
        assert_eq!(find_binary("nmap", Some("/custom/nmap")), "/custom/nmap");
    }

    #[test]
    fn find_binary_falls_back_to_bare_name() {
        let found = find_binary("definitely-not-a-real-binary-xyz", None);
        assert_eq!(found, "definitely-not-a-real-binary-xyz");
    }
}
