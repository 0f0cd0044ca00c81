use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use unifs::task::{FileTaskStore, MemoryTaskStore};
use unifs::{
    EngineError, Executor, NewTask, Outcome, QueueConfig, Task, TaskContext, TaskEngine, TaskKind,
    TaskState, TaskStore,
};

async fn wait_for(engine: &TaskEngine, id: &str, state: TaskState) -> Task {
    for _ in 0..500 {
        if let Some(task) = engine.get(id) {
            if task.state == state {
                return task;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {} never reached {}: {:?}", id, state, engine.get(id));
}

fn ids(tasks: &[Task]) -> Vec<(&str, TaskState)> {
    tasks.iter().map(|t| (t.id.as_str(), t.state)).collect()
}

/// 每次执行都要先从 gate 取得一个许可
fn gated(gate: Arc<Semaphore>) -> Arc<dyn Executor> {
    Arc::new(move |_ctx: TaskContext| {
        let gate = Arc::clone(&gate);
        async move {
            gate.acquire().await?.forget();
            anyhow::Ok(Outcome::Completed)
        }
    })
}

/// 一直运行到被取消
fn endless() -> Arc<dyn Executor> {
    Arc::new(|ctx: TaskContext| async move {
        ctx.canceled().await;
        anyhow::Ok(Outcome::Canceled)
    })
}

#[tokio::test]
async fn test_download_end_to_end() {
    let gate = Arc::new(Semaphore::new(0));
    let engine = TaskEngine::start(
        TaskKind::Download,
        QueueConfig::new(1, 16, 1),
        gated(Arc::clone(&gate)),
        Arc::new(MemoryTaskStore::new()),
    )
    .await
    .unwrap();

    let blocker = engine.submit(NewTask::new("blocker", json!({}))).await.unwrap();
    wait_for(&engine, &blocker, TaskState::Running).await;

    let d1 = engine
        .submit(NewTask::new("download D1", json!({ "url": "http://example/d1" })))
        .await
        .unwrap();
    assert_eq!(
        ids(&engine.list_undone()),
        vec![(blocker.as_str(), TaskState::Running), (d1.as_str(), TaskState::Pending)]
    );

    gate.add_permits(1);
    wait_for(&engine, &d1, TaskState::Running).await;
    assert!(ids(&engine.list_undone()).contains(&(d1.as_str(), TaskState::Running)));

    gate.add_permits(1);
    wait_for(&engine, &d1, TaskState::Succeeded).await;
    assert!(ids(&engine.list_done()).contains(&(d1.as_str(), TaskState::Succeeded)));
    assert!(engine.list_undone().is_empty());

    assert_eq!(engine.clear_done().await.unwrap(), 2);
    assert!(engine.list_done().is_empty());
    assert!(engine.list_undone().is_empty());
    assert!(matches!(
        engine.cancel(&d1).await,
        Err(EngineError::TaskNotFound { .. })
    ));
}

#[tokio::test]
async fn test_restart_rehydrates_from_file_store() {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path().join("tasks");

    let (running, pending, deleted) = {
        let store = Arc::new(FileTaskStore::open(&dir, false).unwrap());
        let engine = TaskEngine::start(
            TaskKind::Transfer,
            QueueConfig::new(1, 16, 2),
            endless(),
            store.clone(),
        )
        .await
        .unwrap();

        let deleted = engine.submit(NewTask::new("deleted", json!({}))).await.unwrap();
        wait_for(&engine, &deleted, TaskState::Running).await;
        engine.cancel(&deleted).await.unwrap();
        wait_for(&engine, &deleted, TaskState::Canceled).await;
        engine.delete(&deleted).await.unwrap();

        let running = engine.submit(NewTask::new("running", json!({}))).await.unwrap();
        wait_for(&engine, &running, TaskState::Running).await;
        let pending = engine.submit(NewTask::new("pending", json!({}))).await.unwrap();

        // 模拟进程退出：运行中的任务来不及结束
        engine.shutdown(Duration::from_millis(20)).await;
        drop(engine);

        // 等被中止的 worker 释放存储
        for _ in 0..500 {
            if Arc::strong_count(&store) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(Arc::strong_count(&store), 1);
        (running, pending, deleted)
    };

    let store = Arc::new(FileTaskStore::open(&dir, false).unwrap());
    let engine = TaskEngine::start(
        TaskKind::Transfer,
        QueueConfig::new(1, 16, 2),
        gated(Arc::new(Semaphore::new(16))),
        store.clone(),
    )
    .await
    .unwrap();

    let interrupted = engine.get(&running).unwrap();
    assert_eq!(interrupted.state, TaskState::Failed);
    assert_eq!(interrupted.error.as_deref(), Some("interrupted by restart"));
    assert!(engine.get(&deleted).is_none());

    wait_for(&engine, &pending, TaskState::Succeeded).await;
    assert_eq!(
        ids(&engine.list_done()),
        vec![
            (running.as_str(), TaskState::Failed),
            (pending.as_str(), TaskState::Succeeded)
        ]
    );

    // 状态写回磁盘在注册表更新之后完成
    let expected = engine.list_done();
    let mut stored = Vec::new();
    for _ in 0..500 {
        stored = store.load_all(TaskKind::Transfer).await.unwrap();
        if ids(&stored) == ids(&expected) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(ids(&stored), ids(&expected));
    assert!(store.load_all(TaskKind::Download).await.unwrap().is_empty());

    assert_eq!(engine.clear_done().await.unwrap(), 2);
    assert!(store.load_all(TaskKind::Transfer).await.unwrap().is_empty());
    engine.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_delete_running_leaves_task_unchanged() {
    let engine = TaskEngine::start(
        TaskKind::Upload,
        QueueConfig::new(2, 16, 0),
        endless(),
        Arc::new(MemoryTaskStore::new()),
    )
    .await
    .unwrap();

    let id = engine.submit(NewTask::new("u", json!({}))).await.unwrap();
    let before = wait_for(&engine, &id, TaskState::Running).await;

    match engine.delete(&id).await {
        Err(EngineError::TaskRunning { state, .. }) => assert_eq!(state, TaskState::Running),
        other => panic!("unexpected delete result: {:?}", other),
    }
    assert_eq!(engine.get(&id).unwrap(), before);
    assert_eq!(ids(&engine.list_undone()), vec![(id.as_str(), TaskState::Running)]);

    assert_eq!(engine.cancel(&id).await.unwrap(), TaskState::Running);
    wait_for(&engine, &id, TaskState::Canceled).await;
    assert_eq!(engine.delete(&id).await.unwrap().id, id);
}
