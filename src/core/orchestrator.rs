//! 进程编排器：按执行约束启动各通道
//!
//! - 启用的 MainContext 通道至多一个，否则为配置错误；
//! - 有 MainContext 通道时，先派生所有后台通道，再在调用方任务上运行主通道，主通道返回即进程结束；
//! - 否则派生全部通道并等待它们结束。
//!
//! 后台通道的错误与 panic 只记录，不影响其他通道；`TransportConflict` 例外，会触发全局关闭。

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::task::JoinSet;

use crate::channels::{ChannelDescriptor, ChannelKind, ChannelRunner, ExecutionConstraint};
use crate::core::{AgentError, ShutdownManager, ShutdownReason};
use crate::dispatch::dispatcher::panic_message;

/// 主通道结束后等待后台通道收尾的时间
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// 一次运行的结果摘要
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// 在调用方任务上运行的通道
    pub main: Option<ChannelKind>,
    /// 派生到后台的通道（按启动顺序）
    pub background: Vec<ChannelKind>,
    /// 以错误或 panic 结束的通道
    pub failed: Vec<(ChannelKind, String)>,
}

type ChannelOutcome = (ChannelKind, Result<(), AgentError>);

/// 运行一个通道，把 panic 转为错误
async fn run_guarded(
    runner: Box<dyn ChannelRunner>,
    shutdown: tokio_util::sync::CancellationToken,
) -> ChannelOutcome {
    let kind = runner.kind();
    let outcome = match AssertUnwindSafe(runner.run(shutdown)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(AgentError::Unhandled(format!(
            "{} channel panicked: {}",
            kind,
            panic_message(panic.as_ref())
        ))),
    };
    (kind, outcome)
}

/// 记录一个通道的结束；遇到进程级错误时触发关闭并返回该错误
fn record(
    shutdown: &ShutdownManager,
    report: &mut RunReport,
    (kind, outcome): ChannelOutcome,
) -> Option<AgentError> {
    match outcome {
        Ok(()) => {
            tracing::info!("{} channel finished", kind);
            None
        }
        Err(e) if e.is_fatal_to_process() => {
            tracing::error!("{} channel hit a fatal error: {}", kind, e);
            report.failed.push((kind, e.to_string()));
            shutdown.shutdown(ShutdownReason::FatalError(e.to_string()));
            Some(e)
        }
        Err(e) => {
            tracing::error!("{} channel stopped with error: {}", kind, e);
            report.failed.push((kind, e.to_string()));
            None
        }
    }
}

pub struct Orchestrator {
    channels: Vec<(ChannelDescriptor, Box<dyn ChannelRunner>)>,
    shutdown: ShutdownManager,
}

impl Orchestrator {
    pub fn new(shutdown: ShutdownManager) -> Self {
        Self {
            channels: Vec::new(),
            shutdown,
        }
    }

    pub fn add(&mut self, descriptor: ChannelDescriptor, runner: Box<dyn ChannelRunner>) -> &mut Self {
        self.channels.push((descriptor, runner));
        self
    }

    pub async fn run(self) -> Result<RunReport, AgentError> {
        let Orchestrator { channels, shutdown } = self;
        let enabled: Vec<_> = channels.into_iter().filter(|(d, _)| d.enabled).collect();

        let main_count = enabled
            .iter()
            .filter(|(d, _)| d.execution_constraint == ExecutionConstraint::MainContext)
            .count();
        if main_count > 1 {
            return Err(AgentError::Config(format!(
                "{} channels require the main execution context; at most one may be enabled",
                main_count
            )));
        }
        if enabled.is_empty() {
            tracing::warn!("No channels enabled, nothing to run");
            return Ok(RunReport::default());
        }

        let token = shutdown.token();
        let mut report = RunReport::default();
        let mut background = JoinSet::new();
        let mut main = None;

        for (descriptor, runner) in enabled {
            match descriptor.execution_constraint {
                ExecutionConstraint::Background => {
                    tracing::info!("Starting {} channel in background", descriptor.kind);
                    report.background.push(descriptor.kind);
                    background.spawn(run_guarded(runner, token.clone()));
                }
                ExecutionConstraint::MainContext => main = Some((descriptor.kind, runner)),
            }
        }

        let mut fatal = None;

        if let Some((kind, runner)) = main {
            report.main = Some(kind);
            tracing::info!("Running {} channel on the main task", kind);
            let main_fut = run_guarded(runner, token.clone());
            tokio::pin!(main_fut);

            let main_outcome = loop {
                tokio::select! {
                    outcome = &mut main_fut => break outcome,
                    Some(joined) = background.join_next(), if !background.is_empty() => {
                        if let Ok(outcome) = joined {
                            if let Some(e) = record(&shutdown, &mut report, outcome) {
                                fatal.get_or_insert(e);
                            }
                        }
                    }
                }
            };

            let main_ok = main_outcome.1.is_ok();
            if let Some(e) = record(&shutdown, &mut report, main_outcome) {
                fatal.get_or_insert(e);
            }

            if main_ok || fatal.is_some() {
                // 主通道的返回决定进程生命周期
                shutdown.shutdown(ShutdownReason::UserInitiated);
                let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
                    while let Some(joined) = background.join_next().await {
                        if let Ok(outcome) = joined {
                            if let Some(e) = record(&shutdown, &mut report, outcome) {
                                fatal.get_or_insert(e);
                            }
                        }
                    }
                })
                .await;
                if drained.is_err() {
                    tracing::warn!("Background channels did not stop in time, aborting");
                    background.abort_all();
                }
                return match fatal {
                    Some(e) => Err(e),
                    None => Ok(report),
                };
            }
            // 主通道因自身错误退出（如 token 无效），其余通道继续运行
        }

        while let Some(joined) = background.join_next().await {
            match joined {
                Ok(outcome) => {
                    if let Some(e) = record(&shutdown, &mut report, outcome) {
                        fatal.get_or_insert(e);
                    }
                }
                Err(e) => tracing::error!("Channel task aborted: {}", e),
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}
