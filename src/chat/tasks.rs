//! 按会话分组的可取消定时任务
//!
//! 逐段展示、图片轮播、情绪过期等定时器都登记在这里，离开会话时按 key 一次性取消，
//! 避免过期任务写入已经不在查看的会话。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// 单个定时任务的句柄
#[derive(Debug, Clone)]
pub struct TaskHandle {
    abort: AbortHandle,
}

impl TaskHandle {
    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

#[derive(Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, Vec<AbortHandle>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在 `deadline` 时刻执行 `fut`
    pub fn spawn_at<F>(&self, key: &str, deadline: Instant, fut: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            sleep_until(deadline).await;
            fut.await;
        });
        self.track(key, handle.abort_handle())
    }

    /// 延迟 `delay` 后执行 `fut`
    pub fn spawn_after<F>(&self, key: &str, delay: Duration, fut: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn_at(key, Instant::now() + delay, fut)
    }

    /// 每隔 `period` 调用一次 `tick`，直到被取消
    pub fn spawn_repeating<F>(&self, key: &str, period: Duration, mut tick: F) -> TaskHandle
    where
        F: FnMut() + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                tick();
            }
        });
        self.track(key, handle.abort_handle())
    }

    /// 取消 key 下的全部任务，返回取消前仍在等待的任务数
    pub fn cancel_all(&self, key: &str) -> usize {
        let handles = self
            .tasks
            .lock()
            .map(|mut tasks| tasks.remove(key).unwrap_or_default())
            .unwrap_or_default();
        let pending = handles.iter().filter(|h| !h.is_finished()).count();
        for handle in handles {
            handle.abort();
        }
        if pending > 0 {
            debug!("[Tasks] 取消定时任务: key={}, 数量={}", key, pending);
        }
        pending
    }

    /// key 下仍在等待的任务数
    pub fn pending(&self, key: &str) -> usize {
        let Ok(mut tasks) = self.tasks.lock() else {
            return 0;
        };
        match tasks.get_mut(key) {
            Some(handles) => {
                handles.retain(|h| !h.is_finished());
                handles.len()
            }
            None => 0,
        }
    }

    /// 取消全部任务（客户端关闭时）
    pub fn cancel_everything(&self) {
        let keys: Vec<String> = match self.tasks.lock() {
            Ok(tasks) => tasks.keys().cloned().collect(),
            Err(_) => return,
        };
        for key in keys {
            self.cancel_all(&key);
        }
    }

    fn track(&self, key: &str, abort: AbortHandle) -> TaskHandle {
        if let Ok(mut tasks) = self.tasks.lock() {
            let handles = tasks.entry(key.to_string()).or_default();
            handles.retain(|h| !h.is_finished());
            handles.push(abort.clone());
        }
        TaskHandle { abort }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn delayed_tasks_run_in_order() {
        let registry = TaskRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for (i, delay) in [300u64, 100, 200].iter().enumerate() {
            let log = log.clone();
            registry.spawn_after("c1", Duration::from_millis(*delay), async move {
                log.lock().unwrap().push(i);
            });
        }
        assert_eq!(registry.pending("c1"), 3);
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 0]);
        assert_eq!(registry.pending("c1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_only_touches_its_key() {
        let registry = TaskRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for key in ["a", "a", "b"] {
            let hits = hits.clone();
            registry.spawn_after(key, Duration::from_millis(100), async move {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(registry.cancel_all("a"), 2);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_task_stops_when_cancelled() {
        let registry = TaskRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let handle = registry.spawn_repeating("a", Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        handle.cancel();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
