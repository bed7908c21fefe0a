use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::error::Result;
use crate::queue::{MessageHandle, MessageQueue, ReceivedMessage};

/// Process-local queue, shared between producers and consumers through an `Arc`.
#[derive(Debug)]
pub struct InMemoryQueue {
    name: String,
    messages: Mutex<VecDeque<ReceivedMessage>>,
    next_handle: AtomicU64,
    posted: Notify,
}

impl InMemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            messages: Mutex::new(VecDeque::new()),
            next_handle: AtomicU64::new(1),
            posted: Notify::new(),
        }
    }

    /// Number of messages currently visible.
    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.lock().await.is_empty()
    }

    /// Remove and return every visible message.
    pub async fn drain(&self) -> Vec<ReceivedMessage> {
        self.messages.lock().await.drain(..).collect()
    }

    async fn try_take(&self) -> Option<ReceivedMessage> {
        self.messages.lock().await.pop_front()
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn post(&self, body: String) -> Result<MessageHandle> {
        let handle = MessageHandle::new(format!(
            "{}-{}",
            self.name,
            self.next_handle.fetch_add(1, Ordering::Relaxed)
        ));
        self.messages.lock().await.push_back(ReceivedMessage {
            handle: handle.clone(),
            body,
        });
        self.posted.notify_one();
        Ok(handle)
    }

    async fn receive(&self, hold_time: Duration) -> Result<Option<ReceivedMessage>> {
        let deadline = tokio::time::Instant::now() + hold_time;
        loop {
            // Register interest before checking so a post in between is not missed.
            let notified = self.posted.notified();
            if let Some(message) = self.try_take().await {
                return Ok(Some(message));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.try_take().await);
            }
        }
    }

    async fn update(&self, handle: &MessageHandle, body: String) -> Result<()> {
        let mut messages = self.messages.lock().await;
        if let Some(existing) = messages.iter_mut().find(|m| &m.handle == handle) {
            existing.body = body;
        } else {
            messages.push_back(ReceivedMessage {
                handle: handle.clone(),
                body,
            });
            drop(messages);
            self.posted.notify_one();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn receive_deletes_message() {
        let queue = InMemoryQueue::new("jobs");
        queue.post("a".into()).await.unwrap();

        let got = queue.receive(Duration::from_millis(10)).await.unwrap();
        assert_eq!(got.unwrap().body, "a");
        assert!(queue
            .receive(Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn receive_waits_for_late_post() {
        let queue = Arc::new(InMemoryQueue::new("jobs"));
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            producer.post("late".into()).await.unwrap();
        });

        let got = queue.receive(Duration::from_secs(5)).await.unwrap();
        assert_eq!(got.unwrap().body, "late");
    }

    #[tokio::test(start_paused = true)]
    async fn receive_gives_up_after_hold_time() {
        let queue = InMemoryQueue::new("jobs");
        let start = tokio::time::Instant::now();
        assert!(queue.receive(Duration::from_secs(3)).await.unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn update_replaces_visible_body() {
        let queue = InMemoryQueue::new("status");
        let handle = queue.post("v1".into()).await.unwrap();
        queue.update(&handle, "v2".into()).await.unwrap();

        assert_eq!(queue.len().await, 1);
        let got = queue.drain().await;
        assert_eq!(got[0].body, "v2");
        assert_eq!(got[0].handle, handle);
    }

    #[tokio::test]
    async fn update_after_consumption_republishes_once() {
        let queue = InMemoryQueue::new("status");
        let handle = queue.post("v1".into()).await.unwrap();
        queue.receive(Duration::ZERO).await.unwrap();

        queue.update(&handle, "v2".into()).await.unwrap();
        queue.update(&handle, "v3".into()).await.unwrap();

        let got = queue.drain().await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].body, "v3");
    }
}
