//! 스레드 간 전달용 큐
//!
//! 락 기반 가변 링 큐. 네트워크 스레드와 사용자 스레드 사이의 모든 전달에 사용.
//! 대기 핸들은 신호 후 꺼내기가 원자적이지 않으므로 가짜 깨어남이 생길 수 있고,
//! 호출자는 루프에서 다시 시도해야 함.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// 스레드 안전 큐
pub struct NetQueue<T> {
    items: Mutex<VecDeque<T>>,
    signal: Condvar,
}

impl<T> NetQueue<T> {
    pub fn new() -> Self {
        Self::with_capacity(16)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            signal: Condvar::new(),
        }
    }

    pub fn enqueue(&self, item: T) {
        self.items.lock().push_back(item);
        self.signal.notify_all();
    }

    /// 맨 앞으로 되돌림
    pub fn enqueue_front(&self, item: T) {
        self.items.lock().push_front(item);
        self.signal.notify_all();
    }

    pub fn try_dequeue(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// 전부 꺼내서 `out`에 추가, 꺼낸 개수 반환
    pub fn try_drain(&self, out: &mut Vec<T>) -> usize {
        let mut items = self.items.lock();
        let count = items.len();
        out.extend(items.drain(..));
        count
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }

    /// 항목이 생기거나 타임아웃까지 대기. 신호를 받았으면 true
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut items = self.items.lock();
        if !items.is_empty() {
            return true;
        }
        !self.signal.wait_for(&mut items, timeout).timed_out()
    }

    /// 꺼낼 때까지 대기. 가짜 깨어남은 남은 시간 안에서 재시도
    pub fn wait_dequeue(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(item) = self.try_dequeue() {
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            self.wait(deadline - now);
        }
    }
}

impl<T> Default for NetQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_fifo_and_drain() {
        let queue = NetQueue::new();
        for i in 0..40 {
            queue.enqueue(i);
        }
        assert_eq!(queue.try_dequeue(), Some(0));
        queue.enqueue_front(100);

        let mut out = Vec::new();
        assert_eq!(queue.try_drain(&mut out), 40);
        assert_eq!(out[0], 100);
        assert_eq!(out[1], 1);
        assert!(queue.is_empty());
        assert_eq!(queue.try_dequeue(), None);
    }

    #[test]
    fn test_wait_dequeue_across_threads() {
        let queue = Arc::new(NetQueue::new());
        let producer = queue.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.enqueue("hello");
        });

        assert_eq!(queue.wait_dequeue(Duration::from_secs(5)), Some("hello"));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_timeout_returns_none() {
        let queue: NetQueue<u8> = NetQueue::new();
        assert_eq!(queue.wait_dequeue(Duration::from_millis(10)), None);
    }
}
