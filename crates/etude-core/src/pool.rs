// src/pool.rs
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::conn::ProcessOutcome;
use crate::reactor::Shared;
use crate::syscalls::{EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP};

/// Fixed set of worker threads popping connections off the shared queue
/// and running the CPU-bound half of the request cycle.
pub struct ThreadPool {
    handles: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawn `count` workers, pinned round-robin to cores when the
    /// platform exposes them.
    pub fn spawn(count: usize, shared: Arc<Shared>) -> ThreadPool {
        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        let mut handles = Vec::with_capacity(count);

        for i in 0..count {
            let core_id = if core_ids.is_empty() {
                None
            } else {
                core_ids.get(i % core_ids.len()).copied()
            };
            let shared = shared.clone();

            let handle = thread::Builder::new()
                .name(format!("etude-worker-{i}"))
                .spawn(move || {
                    if let Some(id) = core_id {
                        if core_affinity::set_for_current(id) {
                            debug!(worker = i, core = id.id, "worker pinned");
                        }
                    }
                    worker_loop(&shared);
                    debug!(worker = i, "worker exiting");
                })
                .expect("failed to spawn pool worker");

            handles.push(handle);
        }

        ThreadPool { handles }
    }

    /// Wait for every worker to drain and exit. Call after closing the
    /// work queue.
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: &Shared) {
    while let Some(slot) = shared.queue.pop() {
        // Uncontended by construction: a connection is only re-armed (and
        // can only be re-queued) after this call returns.
        let mut conn = slot.lock().unwrap();
        if conn.fd < 0 {
            continue; // closed while queued
        }
        let fd = conn.fd;
        let token = conn.token as u64;

        let outcome = conn.process(&shared.docroot, &shared.stats);
        drop(conn);

        let interests = match outcome {
            ProcessOutcome::NeedRead => EPOLLIN | EPOLLRDHUP | EPOLLONESHOT,
            ProcessOutcome::NeedWrite => EPOLLOUT | EPOLLRDHUP | EPOLLONESHOT,
        };
        if let Err(e) = shared.epoll.modify(fd, token, interests) {
            // The idle timer will reap the connection.
            warn!(fd, error = %e, "failed to re-arm descriptor");
        }
    }
}
