//! 任务队列：严格 FIFO，多个 worker 共享一个接收端

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use super::TaskPacket;

pub struct TaskQueue {
    tx: mpsc::UnboundedSender<TaskPacket>,
    rx: Mutex<mpsc::UnboundedReceiver<TaskPacket>>,
    len: Arc<AtomicUsize>,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            len: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 追加到队尾
    pub fn enqueue(&self, task: TaskPacket) {
        push(&self.tx, &self.len, task);
    }

    /// 延迟 `delay` 后追加到队尾（审批等待时使用）
    pub fn enqueue_after(&self, task: TaskPacket, delay: Duration) {
        let tx = self.tx.clone();
        let len = Arc::clone(&self.len);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            push(&tx, &len, task);
        });
    }

    /// 等待并取出队首；队列关闭时返回 None。取消安全
    pub async fn dequeue(&self) -> Option<TaskPacket> {
        let task = self.rx.lock().await.recv().await?;
        self.len.fetch_sub(1, Ordering::SeqCst);
        Some(task)
    }

    /// 当前积压数量
    pub fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn push(tx: &mpsc::UnboundedSender<TaskPacket>, len: &AtomicUsize, task: TaskPacket) {
    let task_id = task.task_id.clone();
    len.fetch_add(1, Ordering::SeqCst);
    if tx.send(task).is_err() {
        len.fetch_sub(1, Ordering::SeqCst);
        tracing::warn!(task_id = %task_id, "Task queue closed, dropping task");
    } else {
        tracing::debug!(task_id = %task_id, "Task enqueued");
    }
}
