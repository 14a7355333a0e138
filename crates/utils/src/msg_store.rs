use std::{
    collections::VecDeque,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

const DEFAULT_HISTORY_LEN: usize = 1000;
const CHANNEL_CAPACITY: usize = 10000;

/// Broadcast channel with a bounded replay history.
///
/// Live subscribers get every message pushed after they subscribe; late
/// subscribers can replay the last `capacity` messages first.
pub struct MsgStore<T> {
    history: RwLock<VecDeque<T>>,
    capacity: usize,
    sender: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> Default for MsgStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> MsgStore<T> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_LEN)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            history: RwLock::new(VecDeque::with_capacity(capacity.min(64))),
            capacity: capacity.max(1),
            sender,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, VecDeque<T>> {
        self.history.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, VecDeque<T>> {
        self.history.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, msg: T) {
        let _ = self.sender.send(msg.clone()); // live listeners

        let mut history = self.write();
        while history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(msg);
    }

    pub fn get_receiver(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    pub fn get_history(&self) -> Vec<T> {
        self.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// History then live.
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, T> {
        let (history, rx) = (self.get_history(), self.get_receiver());

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        Box::pin(hist.chain(live))
    }

    /// Live-only stream, skipping history.
    pub fn stream_live_only(&self) -> futures::stream::BoxStream<'static, T> {
        let rx = self.get_receiver();
        Box::pin(BroadcastStream::new(rx).filter_map(|res| async move { res.ok() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn collect_until(
        mut stream: futures::stream::BoxStream<'static, String>,
        last: &str,
    ) -> Vec<String> {
        let mut received = Vec::new();
        let timeout = tokio::time::sleep(Duration::from_millis(100));
        tokio::pin!(timeout);

        loop {
            tokio::select! {
                _ = &mut timeout => break,
                msg = stream.next() => match msg {
                    Some(s) if s == last => {
                        received.push(s);
                        break;
                    }
                    Some(s) => received.push(s),
                    None => break,
                }
            }
        }
        received
    }

    #[tokio::test]
    async fn test_stream_live_only_skips_history() {
        let store = MsgStore::new();
        for i in 0..5 {
            store.push(format!("history_{}", i));
        }

        let stream = store.stream_live_only();
        for i in 0..3 {
            store.push(format!("live_{}", i));
        }
        store.push("finished".to_string());

        let received = collect_until(stream, "finished").await;
        assert_eq!(received.len(), 4);
        assert!(!received.iter().any(|s| s.starts_with("history_")));
    }

    #[tokio::test]
    async fn test_history_plus_stream_includes_history() {
        let store = MsgStore::new();
        for i in 0..3 {
            store.push(format!("history_{}", i));
        }

        let stream = store.history_plus_stream();
        store.push("live_0".to_string());
        store.push("finished".to_string());

        let received = collect_until(stream, "finished").await;
        assert_eq!(received.len(), 5);
        assert!(received[0].starts_with("history_"));
        assert!(received[2].starts_with("history_"));
        assert_eq!(received[3], "live_0");
    }

    #[test]
    fn test_history_is_bounded() {
        let store = MsgStore::with_capacity(3);
        for i in 0..10 {
            store.push(i);
        }
        assert_eq!(store.get_history(), vec![7, 8, 9]);
    }
}
