use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use uuid::Uuid;

use crate::config::ShellConfig;
use crate::scheduler::{JobKind, JobPayload, ShellType};
use crate::worker::executor::{ExecutionContext, ExecutionResult, ExecutionStatus, JobExecutor};

/// Longest stderr excerpt copied into the log entry's error field.
const MAX_ERROR_EXCERPT: usize = 4 * 1024;

/// Runs shell jobs as child processes.
///
/// Layout under `working_dir`:
///
/// ```text
/// <job_id>/
///     <log_id>.sh        script, removed after the run
///     <log_id>.out.log   stdout
///     <log_id>.err.log   stderr
/// ```
///
/// The child leads its own process group so a timeout can kill everything it
/// spawned, not just the interpreter.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    config: ShellConfig,
}

struct ExecutionFiles {
    dir: PathBuf,
    script: PathBuf,
    stdout: PathBuf,
    stderr: PathBuf,
}

impl ShellExecutor {
    pub fn new(config: ShellConfig) -> Self {
        Self { config }
    }

    pub fn job_dir(&self, job_id: Uuid) -> PathBuf {
        self.config.working_dir.join(job_id.to_string())
    }

    async fn prepare(
        &self,
        ctx: &ExecutionContext,
        shell: ShellType,
        content: &str,
    ) -> std::io::Result<ExecutionFiles> {
        let dir = self.job_dir(ctx.job_id);
        tokio::fs::create_dir_all(&dir).await?;

        let script = dir.join(format!("{}{}", ctx.log_id, shell.file_suffix()));
        tokio::fs::write(&script, content).await?;

        Ok(ExecutionFiles {
            stdout: dir.join(format!("{}.out.log", ctx.log_id)),
            stderr: dir.join(format!("{}.err.log", ctx.log_id)),
            dir,
            script,
        })
    }

    async fn spawn(
        &self,
        ctx: &ExecutionContext,
        shell: ShellType,
        files: &ExecutionFiles,
    ) -> std::io::Result<Child> {
        let stdout = tokio::fs::File::create(&files.stdout).await?.into_std().await;
        let stderr = tokio::fs::File::create(&files.stderr).await?.into_std().await;

        let (program, args) = match shell.interpreter() {
            [program, args @ ..] => (*program, args),
            [] => ("sh", &[][..]),
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(&files.script)
            .current_dir(&files.dir)
            .env("CLUSTERCRON_JOB_ID", ctx.job_id.to_string())
            .env("CLUSTERCRON_JOB_NAME", &ctx.job_name)
            .env("CLUSTERCRON_TRIGGER_ID", ctx.trigger_id.to_string())
            .env("CLUSTERCRON_FIRE_TIME", ctx.fire_time.to_rfc3339())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        cmd.spawn()
    }

    async fn run(
        &self,
        ctx: &ExecutionContext,
        shell: ShellType,
        files: &ExecutionFiles,
        timeout: Duration,
    ) -> ExecutionResult {
        let mut child = match self.spawn(ctx, shell, files).await {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(job_id = %ctx.job_id, error = %e, "Failed to spawn shell job");
                return ExecutionResult::failure(format!("spawn {shell:?}: {e}"));
            }
        };

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return ExecutionResult::failure(format!("wait: {e}")),
            Err(_) => {
                tracing::warn!(
                    job_id = %ctx.job_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Shell job timed out, killing process group"
                );
                kill_process_group(&child);
                let _ = child.kill().await;
                let mut result = ExecutionResult::timeout(timeout);
                result.output = read_bounded(&files.stdout, self.config.max_captured_output).await;
                return result;
            }
        };

        let output = read_bounded(&files.stdout, self.config.max_captured_output).await;
        let exit_code = status.code();

        if status.success() {
            return ExecutionResult {
                status: ExecutionStatus::Success,
                exit_code,
                output,
                error: None,
            };
        }

        let stderr = read_bounded(&files.stderr, MAX_ERROR_EXCERPT).await;
        ExecutionResult {
            status: ExecutionStatus::Failure,
            exit_code,
            output,
            error: Some(stderr.unwrap_or_else(|| format!("Exit code: {exit_code:?}"))),
        }
    }
}

#[async_trait]
impl JobExecutor for ShellExecutor {
    fn kind(&self) -> JobKind {
        JobKind::Shell
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        payload: &JobPayload,
        timeout: Duration,
    ) -> ExecutionResult {
        let JobPayload::Shell { shell, content } = payload else {
            return ExecutionResult::failure("shell executor received a non-shell payload");
        };

        tracing::info!(job_id = %ctx.job_id, log_id = %ctx.log_id, shell = ?shell, "Executing shell job");

        let files = match self.prepare(ctx, *shell, content).await {
            Ok(files) => files,
            Err(e) => {
                tracing::error!(job_id = %ctx.job_id, error = %e, "Failed to prepare job directory");
                return ExecutionResult::failure(format!("prepare working dir: {e}"));
            }
        };

        let result = self.run(ctx, *shell, &files, timeout).await;

        if let Err(e) = tokio::fs::remove_file(&files.script).await {
            tracing::debug!(path = %files.script.display(), error = %e, "Script cleanup failed");
        }

        tracing::info!(
            job_id = %ctx.job_id,
            status = ?result.status,
            exit_code = ?result.exit_code,
            "Shell job completed"
        );
        result
    }
}

#[cfg(unix)]
fn kill_process_group(child: &Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            tracing::debug!(pid, error = %e, "killpg failed");
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

/// First `limit` bytes of a file, lossily decoded. `None` when empty or unreadable.
async fn read_bounded(path: &Path, limit: usize) -> Option<String> {
    let file = tokio::fs::File::open(path).await.ok()?;
    let mut buf = Vec::new();
    file.take(limit as u64).read_to_end(&mut buf).await.ok()?;
    if buf.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(&buf).into_owned())
}
