// src/reactor.rs
//
// The event loop. One thread owns the listening socket, the connection
// table and every raw receive/send/map/unmap; readiness events arrive
// one-shot and edge-triggered, and a descriptor is re-armed only after
// the operation that produced its event has fully completed. CPU-bound
// parsing and response building is handed to the pool through the work
// queue.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::conn::{Conn, SendStatus};
use crate::docroot::DocRoot;
use crate::error::{EngineError, EngineResult};
use crate::queue::WorkQueue;
use crate::slab::ConnTable;
use crate::stats::ServerStats;
use crate::syscalls::{
    self, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP, Epoll, epoll_event,
};
use crate::timer::{NO_TIMER, TimerList};

/// Token reserved for the listening socket.
const LISTEN_TOKEN: u64 = u64::MAX;
/// Readiness events drained per wait call.
const MAX_EVENTS: usize = 1024;

/// Process-scoped state shared between the reactor and the pool workers:
/// the epoll registration table, the docroot, the counters and the work
/// queue. Everything else stays private to the reactor thread.
pub struct Shared {
    pub config: Config,
    pub epoll: Epoll,
    pub docroot: DocRoot,
    pub stats: ServerStats,
    pub queue: WorkQueue,
}

pub struct Reactor {
    shared: Arc<Shared>,
    listen_fd: i32,
    table: ConnTable,
    timers: Mutex<TimerList>,
}

impl Reactor {
    pub fn new(shared: Arc<Shared>, listen_fd: i32) -> EngineResult<Self> {
        // The listener is not one-shot: each edge is drained by a full
        // accept loop.
        shared.epoll.add(listen_fd, LISTEN_TOKEN, EPOLLIN)?;
        Ok(Self {
            table: ConnTable::with_capacity(shared.config.max_connections),
            timers: Mutex::new(TimerList::new()),
            shared,
            listen_fd,
        })
    }

    /// Run until the shutdown flag is raised. Only a failure of the
    /// readiness wait itself (other than an interrupting signal) ends
    /// the loop with an error.
    pub fn run(&mut self, shutdown: &AtomicBool) -> EngineResult<()> {
        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let timeslot = self.shared.config.timeslot_secs.max(1);
        let mut last_tick = unix_now();

        while !shutdown.load(Ordering::Acquire) {
            let n = self
                .shared
                .epoll
                .wait(&mut events, (timeslot * 1000) as i32)?;

            for i in 0..n {
                let token = events[i].u64;
                let bits = events[i].events;

                if token == LISTEN_TOKEN {
                    self.accept_ready();
                } else if bits & ((EPOLLRDHUP | EPOLLHUP | EPOLLERR) as u32) != 0 {
                    self.close_conn(token as usize);
                } else if bits & (EPOLLIN as u32) != 0 {
                    self.conn_readable(token as usize);
                } else if bits & (EPOLLOUT as u32) != 0 {
                    self.conn_writable(token as usize);
                }
            }

            // The wait timeout doubles as the periodic eviction trigger.
            let now = unix_now();
            if now.saturating_sub(last_tick) >= timeslot {
                self.tick(now);
                last_tick = now;
            }
        }

        self.shutdown_drain();
        Ok(())
    }

    fn accept_ready(&mut self) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(None) => break,
                Ok(Some((fd, peer))) => {
                    if let Err(e) = self.admit(fd, peer) {
                        warn!(fd, %peer, error = %e, "refusing connection");
                        syscalls::close_fd(fd);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn admit(&mut self, fd: i32, peer: SocketAddr) -> EngineResult<()> {
        let shared = &self.shared;
        if shared.stats.conn_count() >= shared.config.max_connections {
            return Err(EngineError::TableFull);
        }
        let (read_cap, write_cap) = (shared.config.read_buf_size, shared.config.write_buf_size);
        let (token, slot) = match self
            .table
            .insert_with(|token| Conn::new(fd, peer, token, read_cap, write_cap))
        {
            Some(entry) => entry,
            None => return Err(EngineError::TableFull),
        };

        let deadline = unix_now() + self.shared.config.idle_timeout_secs;
        let timer = self.timers.lock().unwrap().add(token, fd, deadline);
        slot.lock().unwrap().timer = timer;

        if let Err(e) = self
            .shared
            .epoll
            .add(fd, token as u64, EPOLLIN | EPOLLRDHUP | EPOLLONESHOT)
        {
            self.timers.lock().unwrap().remove(timer);
            if let Some(slot) = self.table.remove(token) {
                // The caller closes the raw fd on any admission failure;
                // disarm the connection so its Drop does not close it too.
                slot.lock().unwrap().fd = -1;
            }
            return Err(e);
        }

        self.shared.stats.inc_conn();
        debug!(fd, %peer, token, "accepted connection");
        Ok(())
    }

    /// Readable event: the reactor itself drains the socket, then hands
    /// the connection to the pool for parsing.
    fn conn_readable(&mut self, token: usize) {
        let Some(slot) = self.table.get(token).cloned() else {
            return;
        };
        let (ok, timer) = {
            let mut conn = slot.lock().unwrap();
            (conn.read(), conn.timer)
        };
        if !ok {
            self.close_conn(token);
            return;
        }

        // Activity extends the idle deadline.
        let deadline = unix_now() + self.shared.config.idle_timeout_secs;
        self.timers.lock().unwrap().adjust(timer, deadline);

        if self.shared.queue.push(slot).is_err() {
            warn!(token, "work queue full, dropping connection");
            self.close_conn(token);
        }
    }

    /// Writable event: attach the file mapping if one is still needed,
    /// then transmit as much as the kernel accepts.
    fn conn_writable(&mut self, token: usize) {
        let Some(slot) = self.table.get(token).cloned() else {
            return;
        };
        let mut conn = slot.lock().unwrap();

        if conn.respond_failed {
            drop(conn);
            self.close_conn(token);
            return;
        }

        if conn.needs_mapping() {
            let meta = conn.resolved().cloned();
            if let Some(meta) = meta {
                match self.shared.docroot.map(&meta) {
                    Ok(mapping) => conn.attach_mapping(mapping),
                    Err(e) => {
                        warn!(token, path = %meta.path.display(), error = %e, "mmap failed");
                        drop(conn);
                        self.close_conn(token);
                        return;
                    }
                }
            }
        }

        let before = conn.bytes_sent();
        let status = conn.send();
        self.shared
            .stats
            .add_bytes(conn.bytes_sent().saturating_sub(before));

        match status {
            SendStatus::Blocked => {
                let (fd, timer) = (conn.fd, conn.timer);
                drop(conn);
                let deadline = unix_now() + self.shared.config.idle_timeout_secs;
                self.timers.lock().unwrap().adjust(timer, deadline);
                if self
                    .shared
                    .epoll
                    .modify(fd, token as u64, EPOLLOUT | EPOLLRDHUP | EPOLLONESHOT)
                    .is_err()
                {
                    self.close_conn(token);
                }
            }
            SendStatus::KeepAlive => {
                let residual = conn.reset();
                let (fd, timer) = (conn.fd, conn.timer);
                drop(conn);
                let deadline = unix_now() + self.shared.config.idle_timeout_secs;
                self.timers.lock().unwrap().adjust(timer, deadline);

                if residual {
                    // A pipelined request is already buffered: straight
                    // back to the pool, no read event will fire for it.
                    if self.shared.queue.push(slot).is_err() {
                        warn!(token, "work queue full, dropping connection");
                        self.close_conn(token);
                    }
                } else if self
                    .shared
                    .epoll
                    .modify(fd, token as u64, EPOLLIN | EPOLLRDHUP | EPOLLONESHOT)
                    .is_err()
                {
                    self.close_conn(token);
                }
            }
            SendStatus::Finished => {
                drop(conn);
                self.close_conn(token);
            }
            SendStatus::Error => {
                debug!(token, "send failed, closing");
                drop(conn);
                self.close_conn(token);
            }
        }
    }

    fn close_conn(&mut self, token: usize) {
        let Some(slot) = self.table.remove(token) else {
            return;
        };
        let mut conn = slot.lock().unwrap();
        self.shared.epoll.delete(conn.fd).ok();
        self.timers.lock().unwrap().remove(conn.timer);
        conn.timer = NO_TIMER;
        let fd = conn.fd;
        conn.close_socket();
        self.shared.stats.dec_conn();
        debug!(fd, token, "closed connection");
    }

    /// Periodic pass: evict idle connections and log a stats summary.
    fn tick(&mut self, now: u64) {
        let table = &mut self.table;
        let shared = &self.shared;
        self.timers.lock().unwrap().tick(now, |token, fd| {
            if let Some(slot) = table.remove(token) {
                let mut conn = slot.lock().unwrap();
                conn.timer = NO_TIMER;
                shared.epoll.delete(fd).ok();
                conn.close_socket();
                shared.stats.dec_conn();
                debug!(fd, token, "idle connection evicted");
            }
        });

        info!(
            active = self.shared.stats.conn_count(),
            requests = self.shared.stats.requests(),
            bytes = self.shared.stats.bytes(),
            queued = self.shared.queue.len(),
            "tick"
        );
    }

    fn shutdown_drain(&mut self) {
        info!(connections = self.table.len(), "shutting down");
        for (_token, slot) in self.table.drain() {
            let mut conn = slot.lock().unwrap();
            self.shared.epoll.delete(conn.fd).ok();
            conn.close_socket();
            self.shared.stats.dec_conn();
        }
        self.timers.lock().unwrap().tick(u64::MAX - 1, |_, _| {});
        syscalls::close_fd(self.listen_fd);
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
