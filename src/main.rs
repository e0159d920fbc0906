//! Baton CLI
//!
//! 入口：初始化日志、加载配置、构建编排器，执行一条步骤序列并把 TaskReport 以 JSON 输出到 stdout。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};

use baton::core::shutdown::run_until_shutdown;
use baton::core::task::duration_from_secs;
use baton::core::{
    create_orchestrator_builder, OrchestratorError, ShutdownManager, ShutdownReason, TaskRequest,
    TaskStatus,
};

/// Baton - run named steps in order over shared state
#[derive(Parser)]
#[command(name = "baton")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Extra TOML config layered over config/default.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a step sequence
    Run {
        /// Comma-separated step names, executed in order
        #[arg(long, value_delimiter = ',', required = true)]
        steps: Vec<String>,

        /// Initial shared data as a JSON object
        #[arg(long)]
        data: Option<String>,

        /// Whole-task deadline in seconds
        #[arg(long)]
        timeout: Option<f64>,

        /// Per-step retry limit
        #[arg(long)]
        max_retries: Option<u32>,

        /// Pretty-print the report
        #[arg(long)]
        pretty: bool,
    },

    /// List registered steps
    Steps,

    /// List registered tools
    Tools,
}

#[tokio::main]
async fn main() -> Result<()> {
    baton::observability::init();

    let cli = Cli::parse();
    let builder = create_orchestrator_builder(cli.config);
    let orchestrator = Arc::new(builder.build());

    match cli.command {
        Commands::Steps => {
            for (name, description) in orchestrator.step_descriptions() {
                println!("{:<24} {}", name, description);
            }
            Ok(())
        }
        Commands::Tools => {
            for (name, description) in orchestrator.tools().tool_descriptions() {
                println!("{:<24} {}", name, description);
            }
            Ok(())
        }
        Commands::Run {
            steps,
            data,
            timeout,
            max_retries,
            pretty,
        } => {
            let initial_data = parse_data(data.as_deref())?;
            let mut config = orchestrator.defaults().clone();
            if let Some(secs) = timeout {
                config = config.with_timeout(duration_from_secs(secs));
            }
            if let Some(n) = max_retries {
                config.max_retries = n;
            }
            let request = TaskRequest::new(steps)
                .with_data(initial_data)
                .with_config(config);

            let manager = Arc::new(ShutdownManager::new());
            let task_id = orchestrator.submit(request).await;
            let waiter = {
                let orchestrator = orchestrator.clone();
                let task_id = task_id.clone();
                async move { wait_for_report(&orchestrator, &task_id).await }
            };

            let (report, interrupted) =
                match run_until_shutdown(manager, orchestrator.clone(), waiter).await {
                    Ok(report) => (report?, None),
                    // 被信号打断：任务已取消，等待其收尾
                    Err(reason) => (wait_for_report(&orchestrator, &task_id).await?, Some(reason)),
                };

            let out = if pretty {
                serde_json::to_string_pretty(&report)?
            } else {
                serde_json::to_string(&report)?
            };
            println!("{}", out);

            match interrupted {
                Some(ShutdownReason::UserInitiated) => std::process::exit(130),
                Some(ShutdownReason::Signal) => std::process::exit(143),
                None if report.status != TaskStatus::Completed => std::process::exit(1),
                None => {}
            }
            Ok(())
        }
    }
}

fn parse_data(raw: Option<&str>) -> Result<Map<String, Value>> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str::<Value>(raw).context("--data is not valid JSON")? {
        Value::Object(map) => Ok(map),
        _ => bail!("--data must be a JSON object"),
    }
}

/// 轮询直到任务结束，并把它从任务表中取出
async fn wait_for_report(
    orchestrator: &baton::Orchestrator,
    task_id: &str,
) -> Result<baton::TaskReport> {
    let mut interval = tokio::time::interval(std::time::Duration::from_millis(50));
    loop {
        interval.tick().await;
        match orchestrator.remove(task_id).await {
            Ok(report) => return Ok(report),
            Err(OrchestratorError::TaskNotFinished(_)) => continue,
            Err(e) => return Err(e).context("Lost track of submitted task"),
        }
    }
}
