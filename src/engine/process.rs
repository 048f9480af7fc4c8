//! ST-051: Async engine subprocess execution.
//!
//! Runs one engine step to completion, racing it against the step timeout
//! and the cancellation handle. On cancellation the engine gets SIGINT and
//! is waited on until it exits by itself. On timeout it gets SIGINT, a grace
//! period, then SIGKILL.
//!
//! The engine runs in its own process group so a terminal Ctrl-C reaches it
//! only through the forwarded SIGINT.

use super::{CancelHandle, EngineConfig, ExecOutput};
use crate::error::EngineError;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

enum Finish {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

#[derive(Clone, Copy)]
enum Stop {
    Timeout,
    Cancel,
}

/// Runs engine steps for one configuration.
#[derive(Debug, Clone)]
pub struct EngineRunner {
    config: EngineConfig,
}

impl EngineRunner {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run `<program> <args..> <step_args..>` in `cwd`.
    ///
    /// `context` (`namespace/template`) and `step` label errors only.
    pub async fn run(
        &self,
        context: &str,
        step: &str,
        step_args: &[String],
        cwd: &Path,
        cancel: &CancelHandle,
    ) -> Result<ExecOutput, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Interrupted {
                context: context.to_string(),
                step: step.to_string(),
                exit_code: -1,
                stderr: "cancelled before start".to_string(),
            });
        }

        let started = Instant::now();
        let mut command = Command::new(&self.config.program);
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command
            .args(&self.config.args)
            .args(step_args)
            .envs(&self.config.env)
            .env("TF_IN_AUTOMATION", "1")
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EngineError::Spawn {
                program: self.config.program.clone(),
                source,
            })?;
        tracing::info!(context, step, pid = ?child.id(), "engine started");

        let stdout = capture(child.stdout.take());
        let stderr = capture(child.stderr.take());

        let finish = tokio::select! {
            status = child.wait() => Finish::Exited(status),
            _ = deadline(self.config.timeout_secs) => Finish::TimedOut,
            _ = cancel.cancelled() => Finish::Cancelled,
        };

        let (status, stopped) = match finish {
            Finish::Exited(status) => (status, None),
            Finish::TimedOut => (self.interrupt(&mut child, Stop::Timeout).await, Some(Stop::Timeout)),
            Finish::Cancelled => (self.interrupt(&mut child, Stop::Cancel).await, Some(Stop::Cancel)),
        };
        let status = status.map_err(|source| EngineError::Spawn {
            program: self.config.program.clone(),
            source,
        })?;

        // A grandchild may still hold the pipes after an interrupt.
        let grace = stopped
            .map(|_| Duration::from_secs(self.config.interrupt_grace_secs.max(1)));
        let out = ExecOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: collect(stdout, grace).await,
            stderr: collect(stderr, grace).await,
            duration_seconds: started.elapsed().as_secs_f64(),
        };
        tracing::info!(
            context,
            step,
            exit_code = out.exit_code,
            duration = out.duration_seconds,
            "engine finished"
        );

        match stopped {
            None => Ok(out),
            Some(Stop::Timeout) => Err(EngineError::Timeout {
                context: context.to_string(),
                step: step.to_string(),
                secs: self.config.timeout_secs,
            }),
            Some(Stop::Cancel) => Err(EngineError::Interrupted {
                context: context.to_string(),
                step: step.to_string(),
                exit_code: out.exit_code,
                stderr: out.stderr,
            }),
        }
    }

    /// SIGINT, then wait. A timed-out engine is killed once the grace
    /// period runs out; a cancelled one is left to finish its shutdown.
    async fn interrupt(&self, child: &mut Child, stop: Stop) -> std::io::Result<ExitStatus> {
        if let Some(pid) = child.id() {
            tracing::warn!(pid, "forwarding interrupt to engine");
            let sent = Command::new("kill")
                .arg("-INT")
                .arg(pid.to_string())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            if let Err(e) = sent {
                tracing::warn!(pid, error = %e, "failed to forward interrupt");
            }
        }
        if let Stop::Cancel = stop {
            return child.wait().await;
        }
        let grace = Duration::from_secs(self.config.interrupt_grace_secs);
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                tracing::warn!("engine ignored interrupt; killing");
                child.kill().await?;
                child.wait().await
            }
        }
    }
}

async fn deadline(secs: u64) {
    if secs == 0 {
        std::future::pending::<()>().await;
    } else {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }
}

fn capture<R>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    pipe.map(|mut pipe| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf).await;
            buf
        })
    })
}

async fn collect(handle: Option<JoinHandle<Vec<u8>>>, limit: Option<Duration>) -> String {
    let Some(handle) = handle else {
        return String::new();
    };
    let bytes = match limit {
        None => handle.await.unwrap_or_default(),
        Some(limit) => match tokio::time::timeout(limit, handle).await {
            Ok(joined) => joined.unwrap_or_default(),
            Err(_) => Vec::new(),
        },
    };
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bash(script: &str, timeout_secs: u64, grace: u64) -> (tempfile::TempDir, EngineRunner) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.sh");
        std::fs::write(&path, script).unwrap();
        let runner = EngineRunner::new(EngineConfig {
            program: "bash".into(),
            args: vec![path.display().to_string()],
            timeout_secs,
            interrupt_grace_secs: grace,
            env: [("READY".to_string(), dir.path().join("ready").display().to_string())].into(),
        });
        (dir, runner)
    }

    #[tokio::test]
    async fn test_st051_captures_output_and_exit() {
        let (dir, runner) = bash("echo \"step=$1\"; echo warn >&2; exit 3", 30, 1);
        let out = runner
            .run("ns/t", "plan", &["plan".to_string()], dir.path(), &CancelHandle::new())
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "step=plan");
        assert_eq!(out.stderr.trim(), "warn");
    }

    #[tokio::test]
    async fn test_st051_runs_in_cwd_with_env() {
        let (dir, runner) = bash("pwd; echo \"$TF_IN_AUTOMATION\"", 30, 1);
        let out = runner
            .run("ns/t", "init", &[], dir.path(), &CancelHandle::new())
            .await
            .unwrap();
        let lines: Vec<_> = out.stdout.lines().collect();
        assert!(lines[0].ends_with(dir.path().file_name().unwrap().to_str().unwrap()));
        assert_eq!(lines[1], "1");
    }

    #[tokio::test]
    async fn test_st051_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = EngineRunner::new(EngineConfig {
            program: "/nonexistent/strata-engine".into(),
            ..EngineConfig::default()
        });
        let err = runner
            .run("ns/t", "init", &[], dir.path(), &CancelHandle::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_st051_cancel_before_start_skips_spawn() {
        let (dir, runner) = bash("touch \"$READY\"", 30, 1);
        let cancel = CancelHandle::new();
        cancel.cancel();
        let err = runner
            .run("ns/t", "apply", &[], dir.path(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Interrupted { exit_code: -1, .. }));
        assert!(!dir.path().join("ready").exists());
    }

    #[tokio::test]
    async fn test_st051_cancel_forwards_interrupt() {
        let script = "trap 'echo interrupted >&2; exit 130' INT\n\
                      sleep 30 >/dev/null 2>&1 &\n\
                      touch \"$READY\"\n\
                      wait\n";
        let (dir, runner) = bash(script, 60, 5);
        let cancel = CancelHandle::new();
        let trigger = cancel.clone();
        let ready = dir.path().join("ready");
        tokio::spawn(async move {
            while !ready.exists() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            trigger.cancel();
        });
        let err = runner
            .run("ns/t", "apply", &[], dir.path(), &cancel)
            .await
            .unwrap_err();
        match err {
            EngineError::Interrupted { exit_code, stderr, .. } => {
                assert_eq!(exit_code, 130);
                assert!(stderr.contains("interrupted"));
            }
            other => panic!("expected interrupt, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_st051_cancel_waits_past_grace_for_engine_shutdown() {
        let script = "trap 'sleep 3; echo cleaned >&2; exit 130' INT\n\
                      sleep 30 >/dev/null 2>&1 &\n\
                      touch \"$READY\"\n\
                      wait\n";
        let (dir, runner) = bash(script, 60, 1);
        let cancel = CancelHandle::new();
        let trigger = cancel.clone();
        let ready = dir.path().join("ready");
        tokio::spawn(async move {
            while !ready.exists() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            trigger.cancel();
        });
        let err = runner
            .run("ns/t", "apply", &[], dir.path(), &cancel)
            .await
            .unwrap_err();
        match err {
            EngineError::Interrupted { exit_code, stderr, .. } => {
                assert_eq!(exit_code, 130);
                assert!(stderr.contains("cleaned"), "stderr: {:?}", stderr);
            }
            other => panic!("expected interrupt, got {:?}", other),
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_st051_engine_leads_its_own_process_group() {
        let (dir, runner) = bash("cut -d' ' -f5 /proc/$$/stat; echo $$", 30, 1);
        let out = runner
            .run("ns/t", "init", &[], dir.path(), &CancelHandle::new())
            .await
            .unwrap();
        let lines: Vec<_> = out.stdout.lines().collect();
        assert_eq!(lines[0], lines[1]);
    }

    #[tokio::test]
    async fn test_st051_timeout_kills_stubborn_engine() {
        let script = "trap '' INT\nexec sleep 30\n";
        let (dir, runner) = bash(script, 1, 1);
        let started = Instant::now();
        let err = runner
            .run("ns/t", "apply", &[], dir.path(), &CancelHandle::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout { secs: 1, .. }));
        assert!(started.elapsed() < Duration::from_secs(15));
    }
}
