//! Minimal in-process job queue: single consumer per message, FIFO.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

pub struct JobQueue {
    items: Mutex<VecDeque<String>>,
    notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, job_id: String) {
        self.items.lock().push_back(job_id);
        self.notify.notify_one();
    }

    /// Claim the next job, waiting until one is available. Each pushed id
    /// is delivered to exactly one caller.
    pub async fn pop(&self) -> String {
        loop {
            let (claimed, more) = {
                let mut items = self.items.lock();
                let claimed = items.pop_front();
                (claimed, !items.is_empty())
            };
            if let Some(job_id) = claimed {
                if more {
                    // Notify's permit does not accumulate; re-arm for the
                    // next waiting worker while items remain.
                    self.notify.notify_one();
                }
                return job_id;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fifo_delivery() {
        let queue = JobQueue::new();
        queue.push("a".to_string());
        queue.push("b".to_string());
        assert_eq!(queue.pop().await, "a");
        assert_eq!(queue.pop().await, "b");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_each_job_claimed_once() {
        let queue = Arc::new(JobQueue::new());
        for i in 0..20 {
            queue.push(format!("job-{i}"));
        }
        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                for _ in 0..5 {
                    claimed.push(queue.pop().await);
                }
                claimed
            }));
        }
        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 20, "every job claimed exactly once");
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(JobQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.push("late".to_string());
        assert_eq!(waiter.await.unwrap(), "late");
    }
}
