use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};
use unifs::{Config, Executor, Executors, Outcome, Runtime, TaskContext};

#[derive(Parser, Debug)]
#[command(author, version, about = "统一存储挂载与后台任务服务", long_about = None)]
struct Args {
    /// 配置文件路径，不存在时自动创建
    #[arg(short, long, env = "UNIFS_CONFIG", default_value = "data/config.json")]
    config: PathBuf,

    /// 强制清理任务存储目录上已有的锁
    #[arg(short, long, env = "UNIFS_FORCE_LOCK")]
    force: bool,
}

/// 真正的执行函数由存储驱动提供，这里只记录失败
fn unsupported() -> Arc<dyn Executor> {
    Arc::new(|ctx: TaskContext| async move {
        Err::<Outcome, _>(anyhow!(
            "no {} executor installed for {}",
            ctx.kind(),
            ctx.name()
        ))
    })
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match Config::load_or_create(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("读取配置失败 {:?}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // RUST_LOG 优先，其次是配置中的日志级别
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_ansi(false)
        .init();

    info!("使用配置文件 {:?}", args.config);
    let runtime = match Runtime::start(config, Executors::uniform(unsupported()), args.force).await {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("启动失败: {}", e);
            std::process::exit(1);
        }
    };

    for stats in runtime.tasks().stats() {
        info!("{}", stats);
    }

    info!("等待中断信号...");
    if let Err(e) = signal::ctrl_c().await {
        error!("无法监听 Ctrl+C 信号: {}", e);
    }
    info!("接收到中断信号，正在关闭...");
    runtime.shutdown().await;
}
