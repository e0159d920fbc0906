//! 编排器：线性计划执行引擎
//!
//! 负责：按名解析步骤构建计划、逐个执行步骤（每次尝试经全局准入控制）、步骤级重试退避、
//! 整个任务的截止时间、取消、释放钩子，并把每步结果汇总为 TaskReport。
//! 任务表只保存在内存中，供 get_status / get_result 轮询。

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::error::panic_message;
use crate::core::task::TASK_TIMEOUT;
use crate::core::{
    AdmissionControl, CancelOutcome, OrchestratorError, SharedState, Step, StepContext, StepError,
    StepOutcome, TaskConfig, TaskId, TaskReport, TaskRequest, TaskSnapshot, TaskStatus,
};
use crate::tools::ToolRegistry;

/// 计划执行的结局
#[derive(Debug)]
enum PlanOutcome {
    Completed,
    StepFailed { step: String, error: String },
    TimedOut,
    Cancelled,
}

/// 任务表中的一条记录
struct TaskEntry {
    status: TaskStatus,
    cancel: CancellationToken,
    current_step: Option<String>,
    step_results: Vec<StepOutcome>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    report: Option<TaskReport>,
}

impl TaskEntry {
    fn new() -> Self {
        Self {
            status: TaskStatus::Pending,
            cancel: CancellationToken::new(),
            current_step: None,
            step_results: Vec::new(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            report: None,
        }
    }

    fn snapshot(&self, task_id: &str) -> TaskSnapshot {
        TaskSnapshot {
            task_id: task_id.to_string(),
            status: self.status,
            current_step: self.current_step.clone(),
            step_results: self.step_results.clone(),
            error: self.error.clone(),
            created_at: self.created_at.to_rfc3339(),
            started_at: self.started_at.map(|t| t.to_rfc3339()),
            finished_at: self.finished_at.map(|t| t.to_rfc3339()),
        }
    }
}

/// 执行引擎；构建一次，以 Arc 共享给所有提交任务的调用方
pub struct Orchestrator {
    defaults: TaskConfig,
    steps: HashMap<String, Arc<dyn Step>>,
    tools: Arc<ToolRegistry>,
    admission: AdmissionControl,
    tasks: RwLock<HashMap<TaskId, TaskEntry>>,
}

impl Orchestrator {
    /// 全局并发上限取自 defaults.concurrent_agents
    pub fn new(defaults: TaskConfig, tools: Arc<ToolRegistry>) -> Self {
        let admission = AdmissionControl::new(defaults.concurrent_agents);
        Self {
            defaults,
            steps: HashMap::new(),
            tools,
            admission,
            tasks: RwLock::new(HashMap::new()),
        }
    }

    /// 注册步骤；同名覆盖
    pub fn register_step(&mut self, step: impl Step + 'static) {
        self.register_step_arc(Arc::new(step));
    }

    pub fn register_step_arc(&mut self, step: Arc<dyn Step>) {
        let name = step.name().to_string();
        tracing::info!(step = %name, "Registered step");
        self.steps.insert(name, step);
    }

    pub fn available_steps(&self) -> Vec<String> {
        let mut names: Vec<String> = self.steps.keys().cloned().collect();
        names.sort();
        names
    }

    /// 返回 (name, description) 列表
    pub fn step_descriptions(&self) -> Vec<(String, String)> {
        let mut items: Vec<(String, String)> = self
            .steps
            .iter()
            .map(|(name, step)| (name.clone(), step.description().to_string()))
            .collect();
        items.sort();
        items
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn defaults(&self) -> &TaskConfig {
        &self.defaults
    }

    pub fn admission(&self) -> &AdmissionControl {
        &self.admission
    }

    /// 提交任务：立即返回任务 ID，后台执行
    pub async fn submit(self: &Arc<Self>, request: TaskRequest) -> TaskId {
        let task_id = new_task_id();
        self.tasks
            .write()
            .await
            .insert(task_id.clone(), TaskEntry::new());

        let this = Arc::clone(self);
        let id = task_id.clone();
        tokio::spawn(async move {
            this.execute_task(&id, request).await;
        });
        task_id
    }

    /// 以新任务 ID 执行并等待结果；报告直接返回给调用方，不保留在任务表中
    pub async fn execute(&self, request: TaskRequest) -> TaskReport {
        let task_id = new_task_id();
        let report = self.execute_task(&task_id, request).await;
        self.tasks.write().await.remove(&task_id);
        report
    }

    /// 以指定任务 ID 执行并等待结果；任何结局都返回完整的 TaskReport
    pub async fn execute_task(&self, task_id: &str, request: TaskRequest) -> TaskReport {
        let started = Instant::now();
        let config = request.config.unwrap_or_else(|| self.defaults.clone());
        let cancel = self.track(task_id).await;
        let mut state = SharedState::new(task_id, request.initial_data);

        let plan = match self.build_plan(&request.step_sequence) {
            Ok(plan) => plan,
            Err(e) => {
                tracing::error!(task_id = %task_id, "Task {} failed: {}", task_id, e);
                let outcome = PlanOutcome::StepFailed {
                    step: String::new(),
                    error: e.to_string(),
                };
                return self.finish(task_id, state, outcome, started).await;
            }
        };

        let started_at = self.mark_running(task_id).await;
        state.set_metadata("status", json!(TaskStatus::Running.as_str()));
        state.set_metadata("started_at", json!(started_at.to_rfc3339()));
        tracing::info!(
            task_id = %task_id,
            "Starting task {} with steps: {:?}",
            task_id,
            request.step_sequence
        );

        let deadline = started.checked_add(config.timeout);
        let outcome = self
            .run_plan(&plan, &mut state, &config, &cancel, deadline)
            .await;

        self.finish(task_id, state, outcome, started).await
    }

    /// 获取任务状态快照
    pub async fn get_status(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .map(|entry| entry.snapshot(task_id))
    }

    /// 获取已结束任务的完整结果
    pub async fn get_result(&self, task_id: &str) -> Option<TaskReport> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .and_then(|entry| entry.report.clone())
    }

    /// 从任务表移除已结束的任务，返回其报告
    pub async fn remove(&self, task_id: &str) -> Result<TaskReport, OrchestratorError> {
        let mut tasks = self.tasks.write().await;
        let entry = tasks
            .get(task_id)
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
        if entry.report.is_none() {
            return Err(OrchestratorError::TaskNotFinished(task_id.to_string()));
        }
        tasks
            .remove(task_id)
            .and_then(|entry| entry.report)
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))
    }

    /// 清理结束时间早于 older_than 之前的任务，返回清理数量
    pub async fn purge_finished(&self, older_than: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));
        let Some(cutoff) = cutoff else {
            return 0;
        };
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, entry| match entry.finished_at {
            Some(finished) if entry.report.is_some() => finished > cutoff,
            _ => true,
        });
        let purged = before - tasks.len();
        if purged > 0 {
            tracing::info!("Purged {} finished tasks", purged);
        }
        purged
    }

    /// 任务表中的条目数
    pub async fn task_count(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// 取消运行中的任务；非运行状态（含未知 ID）不做任何事
    pub async fn cancel(&self, task_id: &str) -> CancelOutcome {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(task_id) {
            Some(entry) if entry.status == TaskStatus::Running => {
                entry.cancel.cancel();
                entry.status = TaskStatus::Cancelled;
                tracing::info!(task_id = %task_id, "Cancelled task {}", task_id);
                CancelOutcome::Cancelled
            }
            _ => {
                tracing::info!(task_id = %task_id, "Task {} is not running", task_id);
                CancelOutcome::NotRunning
            }
        }
    }

    /// 关停：取消所有未结束的任务、关闭准入，并释放所有工具；返回释放失败的工具名
    pub async fn shutdown(&self) -> Vec<String> {
        {
            let tasks = self.tasks.read().await;
            let running = tasks
                .values()
                .filter(|entry| !entry.status.is_finished())
                .inspect(|entry| entry.cancel.cancel())
                .count();
            tracing::info!("Cancelled {} unfinished tasks", running);
        }
        self.admission.close();
        self.tools.shutdown_all().await
    }

    fn build_plan(&self, sequence: &[String]) -> Result<Vec<Arc<dyn Step>>, OrchestratorError> {
        if sequence.is_empty() {
            return Err(OrchestratorError::EmptySequence);
        }
        let mut plan: Vec<Arc<dyn Step>> = Vec::with_capacity(sequence.len());
        for (i, name) in sequence.iter().enumerate() {
            if sequence[..i].contains(name) {
                return Err(OrchestratorError::DuplicateStep(name.clone()));
            }
            let step = self
                .steps
                .get(name)
                .ok_or_else(|| OrchestratorError::StepNotRegistered(name.clone()))?;
            plan.push(Arc::clone(step));
        }
        Ok(plan)
    }

    /// 逐步执行计划；每步的尝试与退避受截止时间和取消约束，释放钩子在约束之外完整执行
    async fn run_plan(
        &self,
        plan: &[Arc<dyn Step>],
        state: &mut SharedState,
        config: &TaskConfig,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> PlanOutcome {
        let task_id = state.task_id().to_string();
        for step in plan {
            if cancel.is_cancelled() {
                return PlanOutcome::Cancelled;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return PlanOutcome::TimedOut;
            }

            let name = step.name().to_string();
            let ctx = StepContext::new(&task_id, &name, self.tools.clone(), cancel.child_token());

            state.step_results.push(StepOutcome::pending(&name, &task_id));
            let idx = state.step_results.len() - 1;
            self.publish(&task_id, &state.step_results[idx]).await;

            let result = {
                let attempts = within(
                    deadline,
                    self.run_step_with_retry(step.as_ref(), &ctx, state, idx, config),
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(PlanOutcome::Cancelled),
                    res = attempts => res.ok_or(PlanOutcome::TimedOut),
                }
            };

            // 被放弃的步骤保持最后的非终态，释放钩子照常执行一次
            if result.is_err() {
                tracing::warn!(
                    task_id = %task_id,
                    step = %name,
                    "Abandoning in-flight step {}",
                    name
                );
            }
            step.release(&ctx).await;
            self.publish(&task_id, &state.step_results[idx]).await;

            match result {
                Ok(Ok(value)) => {
                    tracing::info!(
                        task_id = %task_id,
                        step = %name,
                        "Step {} completed in {:.3}s",
                        name,
                        state.step_results[idx].execution_time
                    );
                    state.insert(SharedState::result_key(&name), value);
                }
                Ok(Err(error)) => {
                    tracing::error!(task_id = %task_id, step = %name, "Step {} failed: {}", name, error);
                    return PlanOutcome::StepFailed { step: name, error };
                }
                Err(abandoned) => return abandoned,
            }
        }
        PlanOutcome::Completed
    }

    /// 单步重试循环；execution_time 为从首次尝试起的累计耗时
    async fn run_step_with_retry(
        &self,
        step: &dyn Step,
        ctx: &StepContext,
        state: &mut SharedState,
        idx: usize,
        config: &TaskConfig,
    ) -> Result<Value, String> {
        let task_id = ctx.task_id().to_string();
        let name = ctx.step_id().to_string();
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            if attempt > 0 {
                state.step_results[idx].mark_retrying(attempt);
                self.publish(&task_id, &state.step_results[idx]).await;
                let delay = config.backoff_delay(attempt);
                tracing::info!(
                    task_id = %task_id,
                    step = %name,
                    attempt,
                    "Retrying step {} in {:.3}s (attempt {})",
                    name,
                    delay.as_secs_f64(),
                    attempt
                );
                tokio::time::sleep(delay).await;
            }

            let attempt_ctx = ctx.with_attempt(attempt);
            let attempt_result = match self.admission.acquire().await {
                Ok(_permit) => {
                    state.step_results[idx].mark_running();
                    self.publish(&task_id, &state.step_results[idx]).await;
                    AssertUnwindSafe(step.run(state, &attempt_ctx))
                        .catch_unwind()
                        .await
                }
                Err(e) => Ok(Err(StepError::failed(e))),
            };

            let (error, retryable) = match attempt_result {
                Ok(Ok(value)) => {
                    state.step_results[idx].complete(value.clone(), started.elapsed().as_secs_f64());
                    return Ok(value);
                }
                Ok(Err(e)) => (e.to_string(), e.is_retryable()),
                Err(panic) => (
                    format!("Step {} panicked: {}", name, panic_message(panic.as_ref())),
                    true,
                ),
            };
            tracing::warn!(
                task_id = %task_id,
                step = %name,
                "Step {} attempt {} failed: {}",
                name,
                attempt + 1,
                error
            );

            if !retryable || attempt >= config.max_retries {
                state.step_results[idx].fail(error.clone(), started.elapsed().as_secs_f64());
                return Err(error);
            }
            attempt += 1;
        }
    }

    /// 登记任务（submit 已登记时复用），返回其取消令牌
    async fn track(&self, task_id: &str) -> CancellationToken {
        self.tasks
            .write()
            .await
            .entry(task_id.to_string())
            .or_insert_with(TaskEntry::new)
            .cancel
            .clone()
    }

    async fn mark_running(&self, task_id: &str) -> DateTime<Utc> {
        let now = Utc::now();
        if let Some(entry) = self.tasks.write().await.get_mut(task_id) {
            if entry.status == TaskStatus::Pending {
                entry.status = TaskStatus::Running;
            }
            entry.started_at = Some(now);
        }
        now
    }

    /// 将步骤记录同步到任务表
    async fn publish(&self, task_id: &str, outcome: &StepOutcome) {
        let mut tasks = self.tasks.write().await;
        let Some(entry) = tasks.get_mut(task_id) else {
            return;
        };
        entry.current_step = if outcome.status.is_terminal() {
            None
        } else {
            Some(outcome.step_id.clone())
        };
        match entry
            .step_results
            .iter_mut()
            .find(|o| o.step_id == outcome.step_id)
        {
            Some(existing) => *existing = outcome.clone(),
            None => entry.step_results.push(outcome.clone()),
        }
    }

    async fn finish(
        &self,
        task_id: &str,
        mut state: SharedState,
        outcome: PlanOutcome,
        started: Instant,
    ) -> TaskReport {
        let elapsed = started.elapsed().as_secs_f64();
        let finished_at = Utc::now();
        let mut tasks = self.tasks.write().await;
        let entry = tasks
            .entry(task_id.to_string())
            .or_insert_with(TaskEntry::new);

        // 取消与完成竞争时以取消为准
        let outcome = if entry.cancel.is_cancelled() {
            PlanOutcome::Cancelled
        } else {
            outcome
        };
        let (status, error) = match outcome {
            PlanOutcome::Completed => (TaskStatus::Completed, None),
            PlanOutcome::StepFailed { step, error } => {
                if !step.is_empty() {
                    state.set_metadata("failed_step", json!(step));
                }
                (TaskStatus::Failed, Some(error))
            }
            PlanOutcome::TimedOut => {
                tracing::error!(task_id = %task_id, "Task {} timed out", task_id);
                (TaskStatus::Failed, Some(TASK_TIMEOUT.to_string()))
            }
            PlanOutcome::Cancelled => (TaskStatus::Cancelled, None),
        };

        state.set_metadata("status", json!(status.as_str()));
        if let Some(ref error) = error {
            state.set_metadata("error", json!(error));
        }
        state.set_metadata("total_execution_time", json!(elapsed));
        state.set_metadata("created_at", json!(entry.created_at.to_rfc3339()));
        state.set_metadata("finished_at", json!(finished_at.to_rfc3339()));

        let report = TaskReport {
            task_id: task_id.to_string(),
            status,
            error: error.clone(),
            total_execution_time: elapsed,
            state,
        };

        entry.status = status;
        entry.error = error;
        entry.current_step = None;
        entry.step_results = report.state.step_results.clone();
        entry.finished_at = Some(finished_at);
        entry.report = Some(report.clone());
        drop(tasks);

        tracing::info!(
            task_id = %task_id,
            "Task {} finished as {} in {:.2}s",
            task_id,
            status.as_str(),
            elapsed
        );
        report
    }
}

/// 在可选截止时间内运行；超时返回 None
async fn within<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

fn new_task_id() -> TaskId {
    format!("task_{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::core::StepStatus;

    /// 记录执行顺序；前 fail_first 次失败
    struct Recorder {
        name: &'static str,
        fail_first: usize,
        sleep: Duration,
        calls: Arc<AtomicUsize>,
        releases: Arc<AtomicUsize>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn new(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                fail_first: 0,
                sleep: Duration::ZERO,
                calls: Arc::new(AtomicUsize::new(0)),
                releases: Arc::new(AtomicUsize::new(0)),
                log: log.clone(),
            }
        }

        fn failing(mut self, times: usize) -> Self {
            self.fail_first = times;
            self
        }

        fn sleeping(mut self, sleep: Duration) -> Self {
            self.sleep = sleep;
            self
        }
    }

    #[async_trait]
    impl Step for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(&self, state: &mut SharedState, _ctx: &StepContext) -> Result<Value, StepError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.log.lock().unwrap().push(self.name.to_string());
            if !self.sleep.is_zero() {
                tokio::time::sleep(self.sleep).await;
            }
            if n < self.fail_first {
                return Err(StepError::failed(format!("{} failure {}", self.name, n)));
            }
            let seen: Vec<String> = state.shared_data.keys().cloned().collect();
            Ok(json!({ "step": self.name, "seen": seen }))
        }

        async fn release(&self, _ctx: &StepContext) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fast_config() -> TaskConfig {
        TaskConfig::default()
            .with_timeout(Duration::from_secs(5))
            .with_retries(2, Duration::from_millis(10), 2.0)
    }

    fn engine(steps: Vec<Recorder>) -> Orchestrator {
        let mut orchestrator = Orchestrator::new(fast_config(), Arc::new(ToolRegistry::new()));
        for step in steps {
            orchestrator.register_step(step);
        }
        orchestrator
    }

    #[tokio::test]
    async fn test_steps_run_in_listed_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let orchestrator = engine(vec![
            Recorder::new("a", &log),
            Recorder::new("b", &log),
            Recorder::new("c", &log),
        ]);

        let report = orchestrator
            .execute(TaskRequest::new(["c", "a", "b"]))
            .await;

        assert_eq!(report.status, TaskStatus::Completed);
        assert_eq!(*log.lock().unwrap(), vec!["c", "a", "b"]);
        let order: Vec<&str> = report
            .state
            .step_results
            .iter()
            .map(|o| o.step_id.as_str())
            .collect();
        assert_eq!(order, vec!["c", "a", "b"]);
        // b 能看到 c 和 a 的输出
        let seen = &report.state.step_output("b").unwrap()["seen"];
        assert_eq!(seen, &json!(["a_result", "c_result"]));
        assert_eq!(report.state.execution_metadata["status"], json!("completed"));
    }

    #[tokio::test]
    async fn test_unregistered_step_fails_before_any_outcome() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let orchestrator = engine(vec![Recorder::new("a", &log)]);

        let report = orchestrator
            .execute(TaskRequest::new(["a", "missing"]))
            .await;

        assert_eq!(report.status, TaskStatus::Failed);
        assert!(report.state.step_results.is_empty());
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(report.error.as_deref(), Some("Step missing not registered"));
        assert!(report.state.execution_metadata.get("failed_step").is_none());
    }

    #[tokio::test]
    async fn test_empty_and_duplicate_sequences_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let orchestrator = engine(vec![Recorder::new("a", &log)]);

        let empty = orchestrator.execute(TaskRequest::new(Vec::<String>::new())).await;
        assert_eq!(empty.status, TaskStatus::Failed);
        assert_eq!(empty.error.as_deref(), Some("Step sequence is empty"));

        let dup = orchestrator.execute(TaskRequest::new(["a", "a"])).await;
        assert_eq!(dup.status, TaskStatus::Failed);
        assert!(dup.state.step_results.is_empty());
    }

    #[tokio::test]
    async fn test_retry_then_success_counts_retries() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let recorder = Recorder::new("flaky", &log).failing(2);
        let releases = recorder.releases.clone();
        let orchestrator = engine(vec![recorder]);
        let started = std::time::Instant::now();

        let report = orchestrator.execute(TaskRequest::new(["flaky"])).await;

        assert_eq!(report.status, TaskStatus::Completed);
        let outcome = report.step_result("flaky").unwrap();
        assert_eq!(outcome.status, StepStatus::Completed);
        assert_eq!(outcome.retry_count, 2);
        assert!(outcome.error.is_none());
        // 10ms + 20ms
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(outcome.execution_time >= 0.03);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_step_stops_the_plan() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bad = Recorder::new("bad", &log).failing(usize::MAX);
        let bad_calls = bad.calls.clone();
        let bad_releases = bad.releases.clone();
        let orchestrator = engine(vec![Recorder::new("ok", &log), bad, Recorder::new("after", &log)]);

        let report = orchestrator
            .execute(TaskRequest::new(["ok", "bad", "after"]))
            .await;

        assert_eq!(report.status, TaskStatus::Failed);
        assert_eq!(report.step_result("ok").unwrap().status, StepStatus::Completed);
        let bad = report.step_result("bad").unwrap();
        assert_eq!(bad.status, StepStatus::Failed);
        assert_eq!(bad.retry_count, 2);
        assert_eq!(bad.error.as_deref(), Some("bad failure 2"));
        assert!(bad.result.is_none());
        assert!(report.step_result("after").is_none());
        assert_eq!(bad_calls.load(Ordering::SeqCst), 3);
        assert_eq!(bad_releases.load(Ordering::SeqCst), 1);
        assert_eq!(report.state.execution_metadata["error"], json!("bad failure 2"));
        assert_eq!(report.state.execution_metadata["failed_step"], json!("bad"));
    }

    #[tokio::test]
    async fn test_fatal_error_skips_retries() {
        struct Fatal;

        #[async_trait]
        impl Step for Fatal {
            fn name(&self) -> &str {
                "fatal"
            }

            async fn run(&self, _state: &mut SharedState, _ctx: &StepContext) -> Result<Value, StepError> {
                Err(StepError::fatal("input malformed"))
            }
        }

        let mut orchestrator = Orchestrator::new(fast_config(), Arc::new(ToolRegistry::new()));
        orchestrator.register_step(Fatal);
        let report = orchestrator.execute(TaskRequest::new(["fatal"])).await;

        let outcome = report.step_result("fatal").unwrap();
        assert_eq!(outcome.status, StepStatus::Failed);
        assert_eq!(outcome.retry_count, 0);
        assert_eq!(outcome.error.as_deref(), Some("input malformed"));
    }

    #[tokio::test]
    async fn test_panicking_step_is_contained() {
        struct Panics;

        #[async_trait]
        impl Step for Panics {
            fn name(&self) -> &str {
                "panics"
            }

            async fn run(&self, _state: &mut SharedState, _ctx: &StepContext) -> Result<Value, StepError> {
                panic!("index out of range")
            }
        }

        let mut orchestrator = Orchestrator::new(
            fast_config().with_retries(1, Duration::from_millis(1), 1.0),
            Arc::new(ToolRegistry::new()),
        );
        orchestrator.register_step(Panics);
        let report = orchestrator.execute(TaskRequest::new(["panics"])).await;

        assert_eq!(report.status, TaskStatus::Failed);
        let outcome = report.step_result("panics").unwrap();
        assert_eq!(outcome.retry_count, 1);
        assert_eq!(
            outcome.error.as_deref(),
            Some("Step panics panicked: index out of range")
        );
        // 许可已归还
        assert_eq!(orchestrator.admission().available(), orchestrator.admission().capacity());
    }

    #[tokio::test]
    async fn test_deadline_marks_task_timeout() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let slow = Recorder::new("slow", &log).sleeping(Duration::from_millis(500));
        let releases = slow.releases.clone();
        let orchestrator = engine(vec![Recorder::new("quick", &log), slow]);

        let config = fast_config().with_timeout(Duration::from_millis(100));
        let report = orchestrator
            .execute(TaskRequest::new(["quick", "slow"]).with_config(config))
            .await;

        assert_eq!(report.status, TaskStatus::Failed);
        assert!(report.is_timeout());
        assert_eq!(report.state.execution_metadata["error"], json!("Task timeout"));
        assert_eq!(report.step_result("quick").unwrap().status, StepStatus::Completed);
        // 被放弃的步骤保持最后状态
        assert_eq!(report.step_result("slow").unwrap().status, StepStatus::Running);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_initial_data_is_visible_and_preserved() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let orchestrator = engine(vec![Recorder::new("a", &log)]);
        let mut data = Map::new();
        data.insert("input".into(), json!([1, 2, 3]));

        let report = orchestrator
            .execute(TaskRequest::new(["a"]).with_data(data))
            .await;

        assert_eq!(report.state.get("input"), Some(&json!([1, 2, 3])));
        assert_eq!(report.state.step_output("a").unwrap()["seen"], json!(["input"]));
        assert!(report.state.execution_metadata.contains_key("total_execution_time"));
    }

    #[tokio::test]
    async fn test_cancel_unknown_or_finished_is_noop() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let orchestrator = engine(vec![Recorder::new("a", &log)]);
        assert_eq!(orchestrator.cancel("nope").await, CancelOutcome::NotRunning);

        let report = orchestrator
            .execute_task("task_done", TaskRequest::new(["a"]))
            .await;
        assert_eq!(report.task_id, "task_done");
        assert_eq!(
            orchestrator.cancel("task_done").await,
            CancelOutcome::NotRunning
        );
        assert_eq!(
            orchestrator.get_status("task_done").await.unwrap().status,
            TaskStatus::Completed
        );
    }

    /// release 较慢，run 很快
    struct SlowRelease {
        delay: Duration,
        started: Arc<AtomicUsize>,
        completed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Step for SlowRelease {
        fn name(&self) -> &str {
            "slow_release"
        }

        async fn run(&self, _state: &mut SharedState, _ctx: &StepContext) -> Result<Value, StepError> {
            Ok(json!("done"))
        }

        async fn release(&self, _ctx: &StepContext) {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_release_runs_to_completion_past_deadline() {
        let started = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));
        let mut orchestrator = Orchestrator::new(fast_config(), Arc::new(ToolRegistry::new()));
        orchestrator.register_step(SlowRelease {
            delay: Duration::from_millis(200),
            started: started.clone(),
            completed: completed.clone(),
        });

        let config = fast_config().with_timeout(Duration::from_millis(100));
        let report = orchestrator
            .execute(TaskRequest::new(["slow_release"]).with_config(config))
            .await;

        assert_eq!(report.status, TaskStatus::Completed);
        assert!(report.error.is_none());
        assert_eq!(
            report.step_result("slow_release").unwrap().status,
            StepStatus::Completed
        );
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_next_step_not_started_after_deadline() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut orchestrator = engine(vec![Recorder::new("after", &log)]);
        let started = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));
        orchestrator.register_step(SlowRelease {
            delay: Duration::from_millis(200),
            started: started.clone(),
            completed: completed.clone(),
        });

        let config = fast_config().with_timeout(Duration::from_millis(100));
        let report = orchestrator
            .execute(TaskRequest::new(["slow_release", "after"]).with_config(config))
            .await;

        assert!(report.is_timeout());
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert!(report.step_result("after").is_none());
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_sleep() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stubborn = Recorder::new("stubborn", &log).failing(usize::MAX);
        let calls = stubborn.calls.clone();
        let releases = stubborn.releases.clone();
        let mut orchestrator = Orchestrator::new(
            fast_config().with_retries(3, Duration::from_secs(10), 2.0),
            Arc::new(ToolRegistry::new()),
        );
        orchestrator.register_step(stubborn);
        let orchestrator = Arc::new(orchestrator);

        let task_id = orchestrator.submit(TaskRequest::new(["stubborn"])).await;
        loop {
            let snapshot = orchestrator.get_status(&task_id).await.unwrap();
            if snapshot
                .step_results
                .first()
                .is_some_and(|o| o.status == StepStatus::Retrying)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let cancelled_at = std::time::Instant::now();
        assert_eq!(orchestrator.cancel(&task_id).await, CancelOutcome::Cancelled);

        let report = loop {
            if let Some(report) = orchestrator.get_result(&task_id).await {
                break report;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        assert_eq!(report.status, TaskStatus::Cancelled);
        assert!(cancelled_at.elapsed() < Duration::from_secs(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        let outcome = report.step_result("stubborn").unwrap();
        assert_eq!(outcome.status, StepStatus::Retrying);
        assert_eq!(outcome.retry_count, 1);
    }

    #[tokio::test]
    async fn test_execute_does_not_retain_entries() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let orchestrator = engine(vec![Recorder::new("a", &log)]);

        for _ in 0..20 {
            let report = orchestrator.execute(TaskRequest::new(["a"])).await;
            assert_eq!(report.status, TaskStatus::Completed);
            assert!(orchestrator.get_result(&report.task_id).await.is_none());
        }
        assert_eq!(orchestrator.task_count().await, 0);
    }

    #[tokio::test]
    async fn test_remove_and_purge_finished() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let orchestrator = engine(vec![Recorder::new("a", &log)]);
        orchestrator.execute_task("t1", TaskRequest::new(["a"])).await;
        orchestrator.execute_task("t2", TaskRequest::new(["a"])).await;
        orchestrator.execute_task("t3", TaskRequest::new(["a"])).await;

        let report = orchestrator.remove("t1").await.unwrap();
        assert_eq!(report.task_id, "t1");
        assert_eq!(
            orchestrator.remove("t1").await.unwrap_err(),
            OrchestratorError::TaskNotFound("t1".into())
        );

        assert_eq!(orchestrator.purge_finished(Duration::from_secs(3600)).await, 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(orchestrator.purge_finished(Duration::from_millis(10)).await, 2);
        assert_eq!(orchestrator.task_count().await, 0);
    }

    #[tokio::test]
    async fn test_remove_refuses_unfinished_task() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let slow = Recorder::new("slow", &log).sleeping(Duration::from_millis(300));
        let orchestrator = Arc::new(engine(vec![slow]));

        let task_id = orchestrator.submit(TaskRequest::new(["slow"])).await;
        assert_eq!(
            orchestrator.remove(&task_id).await.unwrap_err(),
            OrchestratorError::TaskNotFinished(task_id.clone())
        );
        assert_eq!(orchestrator.purge_finished(Duration::ZERO).await, 0);
        assert_eq!(orchestrator.task_count().await, 1);
    }
}
