use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use unifs::task::FileTaskStore;
use unifs::{Task, TaskKind, TaskStore};
use tracing::{error, info, warn};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
enum Action {
    /// 未完成的任务
    Undone,
    /// 已结束的任务
    Done,
    /// 删除已结束的任务
    ClearDone,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "离线任务存储工具", long_about = None)]
struct Args {
    /// 任务存储目录
    #[arg(short, long, default_value = "data/tasks")]
    dir: PathBuf,

    /// 任务类型 (download/down, upload, transfer, copy)，不指定时处理全部
    #[arg(short, long)]
    kind: Option<TaskKind>,

    /// 操作
    #[arg(short, long, value_enum, default_value_t = Action::Undone)]
    action: Action,

    /// 强制清理已有的锁
    #[arg(short, long, default_value = "false")]
    force: bool,
}

fn print_task(task: &Task) {
    println!(
        "  {:<36} {:<10} {:>6.1} retry={}/{} {}",
        task.id, task.state, task.progress, task.retry_count, task.max_retries, task.name
    );
    if let Some(error) = &task.error {
        println!("  {:<36} error: {}", "", error);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    // 服务运行时目录被锁定，这里会直接失败
    let store = match FileTaskStore::open(&args.dir, args.force) {
        Ok(store) => store,
        Err(e) => {
            error!("打开任务存储失败: {}", e);
            std::process::exit(1);
        }
    };

    let kinds: Vec<TaskKind> = match args.kind {
        Some(kind) => vec![kind],
        None => TaskKind::ALL.to_vec(),
    };

    for kind in kinds {
        let tasks = store.load_all(kind).await?;
        match args.action {
            Action::Undone => {
                let undone: Vec<&Task> = tasks.iter().filter(|t| t.state.is_undone()).collect();
                println!("{} 未完成 {} 个:", kind, undone.len());
                undone.into_iter().for_each(print_task);
                if tasks.iter().any(|t| t.state == unifs::TaskState::Running) {
                    warn!("{} 中 running 的任务会在下次启动时标记为失败", kind);
                }
            }
            Action::Done => {
                let done: Vec<&Task> = tasks.iter().filter(|t| t.state.is_terminal()).collect();
                println!("{} 已结束 {} 个:", kind, done.len());
                done.into_iter().for_each(print_task);
            }
            Action::ClearDone => {
                let mut cleared = 0;
                for task in tasks.iter().filter(|t| t.state.is_terminal()) {
                    store.remove(kind, &task.id).await?;
                    cleared += 1;
                }
                info!("{} 清理 {} 个已结束的任务", kind, cleared);
            }
        }
    }

    Ok(())
}
