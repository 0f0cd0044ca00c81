use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use serde_json::json;
use unifs::task::MemoryTaskStore;
use unifs::{
    ConfiguredStorage, MountTable, NewTask, Outcome, QueueConfig, StorageInstance, TaskContext,
    TaskEngine, TaskKind,
};

#[derive(ValueEnum, Clone, Debug, PartialEq)]
enum BenchMode {
    Resolve,
    Engine,
    Both,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "unifs Benchmark Tool", long_about = None)]
struct Args {
    /// 测试项目
    #[arg(long, value_enum, default_value_t = BenchMode::Both)]
    mode: BenchMode,

    /// 挂载路径数量
    #[arg(short, long, default_value = "100")]
    mounts: usize,

    /// 负载均衡组内的实例数
    #[arg(short, long, default_value = "4")]
    group_size: usize,

    /// 路径解析次数
    #[arg(short = 'n', long, default_value = "100000")]
    resolves: usize,

    /// 提交的任务数
    #[arg(short, long, default_value = "10000")]
    tasks: usize,

    /// 引擎 worker 数
    #[arg(short, long, default_value = "8")]
    workers: usize,
}

struct BenchmarkResult {
    operation: String,
    duration: Duration,
    ops_per_sec: f64,
}

impl BenchmarkResult {
    fn new(operation: &str, duration: Duration, ops: usize) -> Self {
        let ops_per_sec = ops as f64 / duration.as_secs_f64();
        Self {
            operation: operation.to_string(),
            duration,
            ops_per_sec,
        }
    }

    fn print(&self) {
        print!("  {:<30} {:>10.3} ms", self.operation, self.duration.as_secs_f64() * 1000.0);
        print!(" | {:>12.1} ops/s", self.ops_per_sec);
        println!();
    }
}

fn mount(table: &MountTable, mount_path: &str, order: i32) {
    let instance = StorageInstance::new("bench", mount_path, order)
        .with_additional(json!({ "root_folder_path": format!("/backend{}", order) }));
    table
        .register(Arc::new(ConfiguredStorage::new(instance)))
        .expect("注册存储失败");
}

fn benchmark_resolve(args: &Args) -> Vec<BenchmarkResult> {
    let mut results = Vec::new();
    println!("\n=== 路径解析 ===");

    // 1. 每个挂载路径一个实例
    let table = MountTable::new();
    for i in 0..args.mounts {
        mount(&table, &format!("/m{}/sub", i), 0);
    }
    println!("测试普通解析 ({} 个挂载, {} 次)...", args.mounts, args.resolves);
    let start = Instant::now();
    for i in 0..args.resolves {
        let path = format!("/m{}/sub/dir/file_{}.txt", i % args.mounts, i);
        table.resolve(&path).expect("解析失败");
    }
    results.push(BenchmarkResult::new("普通解析", start.elapsed(), args.resolves));

    // 2. 未命中子挂载，回退到根挂载
    mount(&table, "/", 0);
    println!("测试最长前缀回退...");
    let start = Instant::now();
    let mut fallbacks = 0;
    for i in 0..args.resolves {
        let path = format!("/m{}/other/file_{}.txt", i % args.mounts, i);
        let resolved = table.resolve(&path).expect("解析失败");
        if resolved.instance.mount_path == "/" {
            fallbacks += 1;
        }
    }
    results.push(BenchmarkResult::new("回退解析", start.elapsed(), args.resolves));
    println!("  回退到根挂载 {} 次", fallbacks);

    // 3. 负载均衡组
    let balanced = MountTable::new();
    for order in 0..args.group_size as i32 {
        mount(&balanced, "/balanced", order);
    }
    println!("测试负载均衡解析 ({} 个实例)...", args.group_size);
    let mut hits = vec![0usize; args.group_size];
    let start = Instant::now();
    for i in 0..args.resolves {
        let resolved = balanced
            .resolve(&format!("/balanced/file_{}.bin", i))
            .expect("解析失败");
        hits[resolved.instance.order as usize] += 1;
    }
    results.push(BenchmarkResult::new("负载均衡解析", start.elapsed(), args.resolves));
    println!("  分布: {:?}", hits);

    // 4. 虚拟目录
    let start = Instant::now();
    for _ in 0..1000 {
        table.virtual_children("/").expect("列出虚拟目录失败");
    }
    results.push(BenchmarkResult::new("虚拟目录列表（1000次）", start.elapsed(), 1000));

    results
}

async fn benchmark_engine(args: &Args) -> Vec<BenchmarkResult> {
    let mut results = Vec::new();
    println!("\n=== 任务引擎 ===");

    let engine = TaskEngine::start(
        TaskKind::Copy,
        QueueConfig::new(args.workers, args.tasks.max(1), 0),
        Arc::new(|_ctx: TaskContext| async { anyhow::Ok(Outcome::Completed) }),
        Arc::new(MemoryTaskStore::new()),
    )
    .await
    .expect("启动任务引擎失败");

    println!("测试提交 ({} 个任务, {} 个 worker)...", args.tasks, args.workers);
    let start = Instant::now();
    for i in 0..args.tasks {
        engine
            .submit(NewTask::new(format!("bench {}", i), json!({ "n": i })))
            .await
            .expect("提交任务失败");
    }
    results.push(BenchmarkResult::new("任务提交", start.elapsed(), args.tasks));

    while engine.stats().succeeded < args.tasks {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    results.push(BenchmarkResult::new("提交到全部完成", start.elapsed(), args.tasks));

    let start = Instant::now();
    let cleared = engine.clear_done().await.expect("清理任务失败");
    results.push(BenchmarkResult::new("清理已完成", start.elapsed(), cleared));

    engine.shutdown(Duration::from_secs(1)).await;
    results
}

fn print_results(results: &[BenchmarkResult]) {
    println!("\n📊 性能测试结果:");
    println!("  {:<30} {:>10} | {:>12}", "操作", "耗时", "吞吐量");
    println!("  {}", "-".repeat(60));
    for result in results {
        result.print();
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    println!("🚀 unifs 性能基准测试");
    println!("配置：");
    println!("  挂载路径: {}", args.mounts);
    println!("  均衡组大小: {}", args.group_size);
    println!("  解析次数: {}", args.resolves);
    println!("  任务数: {}", args.tasks);
    println!("  worker 数: {}", args.workers);

    if args.mounts == 0 || args.group_size == 0 {
        eprintln!("挂载路径数量和均衡组大小必须大于 0");
        std::process::exit(1);
    }

    if args.mode == BenchMode::Resolve || args.mode == BenchMode::Both {
        print_results(&benchmark_resolve(&args));
    }
    if args.mode == BenchMode::Engine || args.mode == BenchMode::Both {
        print_results(&benchmark_engine(&args).await);
    }

    println!("\n✅ 基准测试完成！");
}
