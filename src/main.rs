//! OSS Boss 入口
//!
//! 解析命令行选择通道，初始化日志与配置，构建共享的生命周期管理器与 Dispatcher，
//! 交给编排器运行。机器人通道占用主任务，其余通道派生为后台任务。

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use ossboss::channels::{
    build_descriptors, ChannelKind, ChannelRunner, ChannelSelection, ConsoleRunner, HttpRunner,
    TelegramRunner,
};
use ossboss::config::{load_config, AppConfig};
use ossboss::core::{LifecycleManager, Orchestrator, ShutdownManager};
use ossboss::dispatch::Dispatcher;

#[derive(Parser, Debug)]
#[command(name = "ossboss")]
#[command(about = "GitHub repository and NPM package analyzer over console, HTTP and Telegram")]
#[command(version)]
struct Cli {
    /// Start the interactive console
    #[arg(long)]
    cli: bool,

    /// Start the HTTP API server
    #[arg(long)]
    api: bool,

    /// Start the Telegram bot (requires TELEGRAM_BOT_TOKEN)
    #[arg(long)]
    telegram: bool,

    /// Start all channels
    #[arg(long)]
    all: bool,

    /// Configuration file (defaults to config/default.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn build_runner(
    kind: ChannelKind,
    dispatcher: &Arc<Dispatcher>,
    cfg: &AppConfig,
) -> anyhow::Result<Box<dyn ChannelRunner>> {
    Ok(match kind {
        ChannelKind::Console => Box::new(ConsoleRunner::stdio(Arc::clone(dispatcher))),
        ChannelKind::Http => Box::new(HttpRunner::new(
            Arc::clone(dispatcher),
            cfg.http.host.clone(),
            cfg.http.port,
        )),
        ChannelKind::Bot => Box::new(TelegramRunner::from_config(Arc::clone(dispatcher), cfg)?),
    })
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let cfg = match load_config(cli.config.clone()) {
        Ok(cfg) => cfg,
        Err(e) if cli.config.is_some() => {
            return Err(anyhow::anyhow!("failed to load config {:?}: {}", cli.config, e));
        }
        Err(e) => {
            tracing::warn!("Config load failed ({}), using defaults", e);
            let mut cfg = AppConfig::default();
            ossboss::config::apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
            cfg
        }
    };

    tracing::info!(
        "Starting {} (store: {})",
        cfg.app.name.as_deref().unwrap_or("OSS Boss"),
        cfg.store.url
    );

    let selection = ChannelSelection::from_flags(cli.cli, cli.api, cli.telegram, cli.all);
    let descriptors = build_descriptors(selection, &cfg);

    let lifecycle = Arc::new(LifecycleManager::from_config(cfg.clone()));
    let dispatcher =
        Arc::new(Dispatcher::new(lifecycle).with_per_caller_sessions(cfg.session.per_caller));

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let mut reasons = shutdown.subscribe();
    let mut orchestrator = Orchestrator::new((*shutdown).clone());
    for descriptor in descriptors.into_iter().filter(|d| d.enabled) {
        let runner = build_runner(descriptor.kind, &dispatcher, &cfg)?;
        orchestrator.add(descriptor, runner);
    }

    let outcome = orchestrator.run().await;
    if let Ok(reason) = reasons.try_recv() {
        tracing::info!("Stopped: {}", reason);
    }

    match outcome {
        Ok(report) => {
            tracing::info!(
                "Channels finished (main: {:?}, background: {:?}, failed: {})",
                report.main,
                report.background,
                report.failed.len()
            );
            Ok(0)
        }
        Err(e) if e.is_fatal_to_process() => {
            tracing::error!("Terminating: {}", e);
            Ok(1)
        }
        Err(e) => Err(e.into()),
    }
}

#[tokio::main]
async fn main() {
    ossboss::observability::init();
    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            1
        }
    };
    // 控制台通道的 stdin 读取在阻塞线程上，直接退出避免运行时关闭时等待它
    std::process::exit(code);
}
