//! 任务调度：委派批次的并发上限
//!
//! 单条语句内的工具调用严格串行；只有一批相互独立的委派代理可以并发，
//! 由 Semaphore 限制同时运行的数量，全部 join 后再汇总结果。

use std::future::Future;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Semaphore;

pub struct TaskScheduler {
    permits: Arc<Semaphore>,
    limit: usize,
}

impl TaskScheduler {
    pub fn new(max_concurrent: usize) -> Self {
        let limit = max_concurrent.max(1);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// 并发运行一批任务（受并发上限约束），按输入顺序返回结果
    pub async fn run_batch<F, T>(&self, tasks: Vec<F>) -> Vec<T>
    where
        F: Future<Output = T>,
    {
        let permits = self.permits.clone();
        join_all(tasks.into_iter().map(|task| {
            let permits = permits.clone();
            async move {
                // 信号量从不关闭；获取失败时不限流直接运行
                let _permit = permits.acquire_owned().await.ok();
                task.await
            }
        }))
        .await
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(3)
    }
}
