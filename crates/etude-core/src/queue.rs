// src/queue.rs
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::conn::Conn;
use crate::error::{EngineError, EngineResult};

/// Bounded FIFO of connections awaiting a pool worker.
///
/// Entries are shared references; ownership of the connection never
/// leaves the reactor's table. The queue only sequences who may call
/// `process()` next — the one-shot re-arm discipline guarantees a given
/// connection is never queued twice at once.
pub struct WorkQueue {
    inner: Mutex<Inner>,
    ready: Condvar,
    capacity: usize,
}

struct Inner {
    items: VecDeque<Arc<Mutex<Conn>>>,
    closed: bool,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            ready: Condvar::new(),
            capacity,
        }
    }

    /// Non-blocking append. A full queue is an admission-control failure;
    /// the caller must not block and handles it by dropping the connection.
    pub fn push(&self, conn: Arc<Mutex<Conn>>) -> EngineResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed || inner.items.len() >= self.capacity {
            return Err(EngineError::QueueFull);
        }
        inner.items.push_back(conn);
        self.ready.notify_one();
        Ok(())
    }

    /// Block until an entry is available. Returns None once the queue is
    /// closed and drained; spurious wakeups re-check and keep waiting.
    pub fn pop(&self) -> Option<Arc<Mutex<Conn>>> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(conn) = inner.items.pop_front() {
                return Some(conn);
            }
            if inner.closed {
                return None;
            }
            inner = self.ready.wait(inner).unwrap();
        }
    }

    /// Stop accepting work and wake every blocked worker.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    fn queued_conn(token: usize) -> Arc<Mutex<Conn>> {
        Arc::new(Mutex::new(Conn::new(
            -1,
            "127.0.0.1:0".parse().unwrap(),
            token,
            256,
            512,
        )))
    }

    #[test]
    fn push_beyond_capacity_fails_cleanly() {
        let queue = WorkQueue::new(2);
        assert!(queue.push(queued_conn(0)).is_ok());
        assert!(queue.push(queued_conn(1)).is_ok());
        assert!(matches!(
            queue.push(queued_conn(2)),
            Err(EngineError::QueueFull)
        ));
        assert_eq!(queue.len(), 2);
        // The earlier entries are intact and come out in order.
        assert_eq!(queue.pop().unwrap().lock().unwrap().token, 0);
        assert_eq!(queue.pop().unwrap().lock().unwrap().token, 1);
    }

    #[test]
    fn each_entry_is_popped_exactly_once() {
        const ENTRIES: usize = 200;
        const WORKERS: usize = 4;

        let queue = Arc::new(WorkQueue::new(ENTRIES));
        for token in 0..ENTRIES {
            queue.push(queued_conn(token)).unwrap();
        }
        queue.close();

        let mut handles = Vec::new();
        for _ in 0..WORKERS {
            let queue = queue.clone();
            handles.push(thread::spawn(move || {
                let mut seen = Vec::new();
                while let Some(conn) = queue.pop() {
                    seen.push(conn.lock().unwrap().token);
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.join().unwrap());
        }
        assert_eq!(all.len(), ENTRIES);
        let unique: HashSet<usize> = all.into_iter().collect();
        assert_eq!(unique.len(), ENTRIES);
    }

    #[test]
    fn close_wakes_blocked_workers() {
        let queue = Arc::new(WorkQueue::new(4));
        let waiter = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop())
        };
        // Give the worker time to block on the condvar.
        thread::sleep(std::time::Duration::from_millis(20));
        queue.close();
        assert!(waiter.join().unwrap().is_none());
    }

    #[test]
    fn push_after_close_is_rejected() {
        let queue = WorkQueue::new(4);
        queue.close();
        assert!(queue.push(queued_conn(0)).is_err());
    }
}
