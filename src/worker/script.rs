use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rhai::{Dynamic, Engine, EvalAltResult, Scope};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::ScriptConfig;
use crate::error::{Result, SchedulerError};
use crate::scheduler::{JobKind, JobPayload};
use crate::worker::executor::{ExecutionContext, ExecutionResult, JobExecutor};

/// Engine plus the per-run state its callbacks read and write.
struct PooledEngine {
    engine: Engine,
    deadline: Arc<Mutex<Option<Instant>>>,
    printed: Arc<Mutex<String>>,
}

impl PooledEngine {
    fn new(max_operations: u64) -> Self {
        let deadline: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
        let printed = Arc::new(Mutex::new(String::new()));

        let mut engine = Engine::new();
        if max_operations > 0 {
            engine.set_max_operations(max_operations);
        }

        let progress_deadline = Arc::clone(&deadline);
        engine.on_progress(move |_ops| match *progress_deadline.lock() {
            Some(deadline) if Instant::now() >= deadline => Some(Dynamic::UNIT),
            _ => None,
        });

        let print_buffer = Arc::clone(&printed);
        engine.on_print(move |line| {
            let mut buffer = print_buffer.lock();
            buffer.push_str(line);
            buffer.push('\n');
        });

        Self {
            engine,
            deadline,
            printed,
        }
    }

    /// Evaluate `source` with the job context bound as scope variables.
    fn run(&self, ctx: &ExecutionContext, source: &str, timeout: Duration) -> ExecutionResult {
        self.printed.lock().clear();
        *self.deadline.lock() = Some(Instant::now() + timeout);

        let mut scope = Scope::new();
        scope.push_constant("job_id", ctx.job_id.to_string());
        scope.push_constant("job_name", ctx.job_name.clone());
        scope.push_constant("trigger_id", ctx.trigger_id.to_string());
        scope.push_constant("fire_time", ctx.fire_time.to_rfc3339());
        scope.push_constant("misfire", ctx.misfire);

        let evaluated = self.engine.eval_with_scope::<Dynamic>(&mut scope, source);

        *self.deadline.lock() = None;
        let printed = std::mem::take(&mut *self.printed.lock());

        match evaluated {
            Ok(value) => {
                let mut output = printed;
                if !value.is_unit() {
                    output.push_str(&value.to_string());
                }
                ExecutionResult::success((!output.is_empty()).then_some(output))
            }
            Err(err) if matches!(*err, EvalAltResult::ErrorTerminated(..)) => {
                let mut result = ExecutionResult::timeout(timeout);
                result.output = (!printed.is_empty()).then_some(printed);
                result
            }
            Err(err) => {
                let mut result = ExecutionResult::failure(err.to_string());
                result.output = (!printed.is_empty()).then_some(printed);
                result
            }
        }
    }
}

struct PoolInner {
    idle: Mutex<Vec<PooledEngine>>,
    permits: Arc<Semaphore>,
    checkout_timeout: Duration,
}

/// Fixed set of script engines shared by all workers.
///
/// Building an engine is cheap but not free, and each one carries callbacks
/// bound to its own state, so engines are reused instead of rebuilt per run.
/// A checkout waits at most `checkout_timeout` for a free engine.
#[derive(Clone)]
pub struct EnginePool {
    inner: Arc<PoolInner>,
}

/// Exclusive use of one engine; returned to the pool on drop.
pub struct EngineGuard {
    engine: Option<PooledEngine>,
    inner: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl EnginePool {
    pub fn new(config: &ScriptConfig) -> Result<Self> {
        if config.pool_size == 0 {
            return Err(SchedulerError::Config("script.pool_size must be > 0".into()));
        }
        let engines = (0..config.pool_size)
            .map(|_| PooledEngine::new(config.max_operations))
            .collect();
        Ok(Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(engines),
                permits: Arc::new(Semaphore::new(config.pool_size)),
                checkout_timeout: Duration::from_millis(config.checkout_timeout_ms),
            }),
        })
    }

    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    pub async fn checkout(&self) -> Result<EngineGuard> {
        let permit = tokio::time::timeout(
            self.inner.checkout_timeout,
            Arc::clone(&self.inner.permits).acquire_owned(),
        )
        .await
        .map_err(|_| SchedulerError::PoolExhausted("no script engine available".into()))?
        .map_err(|_| SchedulerError::PoolExhausted("script engine pool closed".into()))?;

        // Holding a permit guarantees an idle engine.
        let engine = self.inner.idle.lock().pop().ok_or_else(|| {
            SchedulerError::PoolExhausted("script engine pool out of sync".into())
        })?;

        Ok(EngineGuard {
            engine: Some(engine),
            inner: Arc::clone(&self.inner),
            _permit: permit,
        })
    }
}

impl EngineGuard {
    fn run(&self, ctx: &ExecutionContext, source: &str, timeout: Duration) -> ExecutionResult {
        match &self.engine {
            Some(engine) => engine.run(ctx, source, timeout),
            None => ExecutionResult::failure("script engine already returned"),
        }
    }
}

impl Drop for EngineGuard {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            self.inner.idle.lock().push(engine);
        }
    }
}

/// Evaluates script jobs on pooled engines.
#[derive(Clone)]
pub struct ScriptExecutor {
    pool: EnginePool,
}

impl ScriptExecutor {
    pub fn new(config: &ScriptConfig) -> Result<Self> {
        Ok(Self {
            pool: EnginePool::new(config)?,
        })
    }

    pub fn pool(&self) -> &EnginePool {
        &self.pool
    }
}

#[async_trait]
impl JobExecutor for ScriptExecutor {
    fn kind(&self) -> JobKind {
        JobKind::Script
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        payload: &JobPayload,
        timeout: Duration,
    ) -> ExecutionResult {
        let JobPayload::Script { source } = payload else {
            return ExecutionResult::failure("script executor received a non-script payload");
        };

        let guard = match self.pool.checkout().await {
            Ok(guard) => guard,
            Err(e) => {
                tracing::warn!(job_id = %ctx.job_id, error = %e, "Script engine checkout failed");
                return ExecutionResult::failure(e.to_string());
            }
        };

        tracing::info!(job_id = %ctx.job_id, log_id = %ctx.log_id, "Evaluating script job");

        let ctx_owned = ctx.clone();
        let source = source.clone();
        let evaluated =
            tokio::task::spawn_blocking(move || guard.run(&ctx_owned, &source, timeout)).await;

        match evaluated {
            Ok(result) => {
                tracing::info!(job_id = %ctx.job_id, status = ?result.status, "Script job completed");
                result
            }
            Err(e) => {
                tracing::error!(job_id = %ctx.job_id, error = %e, "Script evaluation panicked");
                ExecutionResult::failure(format!("script evaluation panicked: {e}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::executor::ExecutionStatus;
    use chrono::Utc;
    use uuid::Uuid;

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            log_id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            job_name: "report".into(),
            trigger_id: Uuid::new_v4(),
            node_id: "n".into(),
            fire_time: Utc::now(),
            misfire: false,
            manual: false,
        }
    }

    fn script(source: &str) -> JobPayload {
        JobPayload::Script {
            source: source.into(),
        }
    }

    fn config(pool_size: usize, checkout_timeout_ms: u64) -> ScriptConfig {
        ScriptConfig {
            pool_size,
            checkout_timeout_ms,
            max_operations: 0,
        }
    }

    #[tokio::test]
    async fn prints_and_value_become_output() {
        let exec = ScriptExecutor::new(&config(1, 100)).unwrap();
        let result = exec
            .execute(&ctx(), &script(r#"print("hello " + job_name); 40 + 2"#), Duration::from_secs(2))
            .await;
        assert!(result.is_success());
        assert_eq!(result.output.as_deref(), Some("hello report\n42"));
    }

    #[tokio::test]
    async fn print_buffer_is_cleared_between_runs() {
        let exec = ScriptExecutor::new(&config(1, 100)).unwrap();
        exec.execute(&ctx(), &script(r#"print("first")"#), Duration::from_secs(2))
            .await;
        let result = exec
            .execute(&ctx(), &script(r#"print("second")"#), Duration::from_secs(2))
            .await;
        assert_eq!(result.output.as_deref(), Some("second\n"));
    }

    #[tokio::test]
    async fn runaway_script_times_out() {
        let exec = ScriptExecutor::new(&config(1, 100)).unwrap();
        let result = exec
            .execute(&ctx(), &script("loop { }"), Duration::from_millis(100))
            .await;
        assert_eq!(result.status, ExecutionStatus::Timeout);
        // Engine went back to the pool.
        assert_eq!(exec.pool().available(), 1);
    }

    #[tokio::test]
    async fn syntax_error_is_failure() {
        let exec = ScriptExecutor::new(&config(1, 100)).unwrap();
        let result = exec
            .execute(&ctx(), &script("let = ;"), Duration::from_secs(1))
            .await;
        assert_eq!(result.status, ExecutionStatus::Failure);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn checkout_times_out_when_pool_is_busy() {
        let pool = EnginePool::new(&config(1, 20)).unwrap();
        let _held = pool.checkout().await.unwrap();
        assert!(matches!(
            pool.checkout().await,
            Err(SchedulerError::PoolExhausted(_))
        ));
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(EnginePool::new(&config(0, 20)).is_err());
    }
}
