//! Lifecycle hook execution.

use std::io::Write;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use runcell_common::error::LaunchError;
use runcell_spec::config::{Hook, Hooks};
use runcell_spec::hooks::{self as hook_points, HookPoint};

use crate::container::OciState;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Runs one hook with the state document on stdin.
///
/// The hook gets exactly the environment it declares. Its own `timeout`
/// wins over `default_timeout`; without either the hook may run
/// indefinitely. The timeout also covers delivering the state document,
/// which is written from a separate thread.
///
/// # Errors
///
/// Returns [`LaunchError::Hook`] if the hook cannot be spawned, exits
/// non-zero, or runs past its timeout (it is killed in that case).
pub fn run_hook(hook: &Hook, state: &[u8], default_timeout: Option<u32>) -> Result<(), LaunchError> {
    let path = hook.path();
    let failed = |message: String| LaunchError::Hook {
        hook: path.display().to_string(),
        message,
    };

    let mut cmd = Command::new(path);
    if let Some((arg0, rest)) = hook.args().as_deref().and_then(<[String]>::split_first) {
        let _ = cmd.arg0(arg0).args(rest);
    }
    let _ = cmd
        .env_clear()
        .envs(hook.env().iter().flatten().filter_map(|kv| kv.split_once('=')))
        .stdin(Stdio::piped());

    let timeout_secs = hook
        .timeout()
        .and_then(|secs| u64::try_from(secs).ok())
        .or_else(|| default_timeout.map(u64::from));
    let deadline = timeout_secs.map(|secs| Instant::now() + Duration::from_secs(secs));

    let mut child = cmd.spawn().map_err(|e| failed(format!("spawn: {e}")))?;
    if let Some(mut stdin) = child.stdin.take() {
        let doc = state.to_vec();
        // A hook that ignores its stdin may exit, or stall, before reading it.
        let writer = std::thread::Builder::new()
            .name("hook-stdin".into())
            .spawn(move || {
                let _ = stdin.write_all(&doc);
            });
        if let Err(e) = writer {
            let _ = child.kill();
            let _ = child.wait();
            return Err(failed(format!("stdin writer: {e}")));
        }
    }

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(e) => return Err(failed(format!("wait: {e}"))),
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(failed(format!(
                "timed out after {}s",
                timeout_secs.unwrap_or_default()
            )));
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    if status.success() {
        tracing::debug!(hook = %path.display(), "hook finished");
        Ok(())
    } else {
        Err(failed(format!("exited with {status}")))
    }
}

/// Runs every hook registered at `point`, in order.
///
/// At fatal points the first failure is returned; at `poststart` and
/// `poststop` failures are logged and the remaining hooks still run.
///
/// # Errors
///
/// Returns the first [`LaunchError::Hook`] at a fatal point.
pub fn run_hooks(
    hooks: &Hooks,
    point: HookPoint,
    state: &OciState,
    default_timeout: Option<u32>,
) -> Result<(), LaunchError> {
    let mut pending = hook_points::at(hooks, point).peekable();
    if pending.peek().is_none() {
        return Ok(());
    }
    let doc = serde_json::to_vec(state).map_err(|e| LaunchError::Hook {
        hook: point.to_string(),
        message: format!("encoding state: {e}"),
    })?;
    for hook in pending {
        tracing::info!(id = %state.id, %point, hook = %hook.path().display(), "running hook");
        if let Err(e) = run_hook(hook, &doc, default_timeout) {
            if point.is_fatal() {
                return Err(e);
            }
            tracing::warn!(id = %state.id, %point, error = %e, "hook failed");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use runcell_common::types::Status;
    use runcell_spec::config::{HookBuilder, HooksBuilder};

    fn sh(script: &str, env: &[&str], timeout: Option<i64>) -> Hook {
        let env: Vec<&str> = std::iter::once("PATH=/usr/bin:/bin").chain(env.iter().copied()).collect();
        serde_json::from_value(serde_json::json!({
            "path": "/bin/sh",
            "args": ["sh", "-c", script],
            "env": env,
            "timeout": timeout,
        }))
        .unwrap()
    }

    fn state() -> OciState {
        OciState {
            oci_version: "1.2.0".into(),
            id: "web".into(),
            status: Status::Created,
            pid: Some(42),
            bundle: "/bundle".into(),
            annotations: std::collections::BTreeMap::new(),
        }
    }

    #[test]
    fn hook_receives_state_on_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("stdin.json");
        let hook = sh(&format!("cat > {}", out.display()), &[], None);
        run_hook(&hook, br#"{"id":"web"}"#, None).unwrap();
        assert_eq!(std::fs::read_to_string(out).unwrap(), r#"{"id":"web"}"#);
    }

    #[test]
    fn hook_sees_only_declared_environment() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("env");
        let hook = sh(
            &format!("echo \"$HOOK_VAR:$HOME\" > {}", out.display()),
            &["HOOK_VAR=set"],
            None,
        );
        run_hook(&hook, b"", None).unwrap();
        assert_eq!(std::fs::read_to_string(out).unwrap().trim(), "set:");
    }

    #[test]
    fn nonzero_exit_and_missing_binary_fail() {
        assert!(matches!(
            run_hook(&sh("exit 3", &[], None), b"", None),
            Err(LaunchError::Hook { .. })
        ));
        let missing = HookBuilder::default().path("/nonexistent/hook").build().unwrap();
        assert!(run_hook(&missing, b"", None).is_err());
    }

    #[test]
    fn slow_hook_is_killed_at_timeout() {
        let hook = sh("sleep 5", &[], Some(1));
        let started = Instant::now();
        let err = run_hook(&hook, b"", None).unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn default_timeout_applies_to_hooks_without_one() {
        let started = Instant::now();
        let err = run_hook(&sh("sleep 5", &[], None), b"", Some(1)).unwrap_err();
        assert!(err.to_string().contains("timed out after 1s"), "{err}");
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn timeout_holds_when_the_hook_never_reads_stdin() {
        // Larger than any pipe buffer, so a blocking write would never return.
        let state = vec![b'x'; 4 * 1024 * 1024];
        let started = Instant::now();
        let err = run_hook(&sh("sleep 5", &[], Some(1)), &state, None).unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn non_fatal_points_swallow_failures() {
        let hooks: Hooks = HooksBuilder::default()
            .poststop(vec![sh("exit 1", &[], None)])
            .create_runtime(vec![sh("exit 1", &[], None)])
            .build()
            .unwrap();
        assert!(run_hooks(&hooks, HookPoint::Poststop, &state(), None).is_ok());
        assert!(run_hooks(&hooks, HookPoint::CreateRuntime, &state(), None).is_err());
        assert!(run_hooks(&hooks, HookPoint::StartContainer, &state(), None).is_ok());
    }
}
