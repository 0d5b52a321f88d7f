// src/server.rs
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use crate::config::Config;
use crate::docroot::DocRoot;
use crate::error::EngineResult;
use crate::pool::ThreadPool;
use crate::queue::WorkQueue;
use crate::reactor::{Reactor, Shared};
use crate::stats::ServerStats;
use crate::syscalls::{self, Epoll};

/// The assembled server: listening socket, reactor and worker pool.
///
/// ```rust,ignore
/// use etude_core::{Config, Server};
///
/// let server = Server::bind(Config::from_env())?;
/// server.run()?;
/// ```
pub struct Server {
    config: Config,
    listen_fd: i32,
    port: u16,
}

impl Server {
    /// Validate the configuration and bind the listening socket. Binding
    /// port 0 picks an ephemeral port, readable through [`port`](Self::port).
    pub fn bind(config: Config) -> EngineResult<Self> {
        config.validate()?;
        let listen_fd = syscalls::create_listen_socket(&config.host, config.port)?;
        let port = syscalls::local_addr(listen_fd)?.port();
        Ok(Self {
            config,
            listen_fd,
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Serve until the shutdown flag is raised, then drain: close every
    /// connection, close the queue and join the pool.
    pub fn serve(self, shutdown: Arc<AtomicBool>) -> EngineResult<()> {
        let workers = self.config.effective_workers();
        let shared = Arc::new(Shared {
            epoll: Epoll::new()?,
            docroot: DocRoot::new(self.config.doc_root.clone()),
            stats: ServerStats::new(),
            queue: WorkQueue::new(self.config.queue_capacity),
            config: self.config,
        });

        info!(
            port = self.port,
            workers,
            root = %shared.config.doc_root.display(),
            "serving"
        );

        let mut reactor = Reactor::new(shared.clone(), self.listen_fd)?;
        let pool = ThreadPool::spawn(workers, shared.clone());

        let result = reactor.run(&shutdown);

        shared.queue.close();
        pool.join();
        info!("server stopped");
        result
    }

    /// Serve until SIGINT/SIGTERM.
    pub fn run(self) -> EngineResult<()> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        ctrlc::set_handler(move || {
            flag.store(true, Ordering::SeqCst);
        })
        .expect("failed to install signal handler");

        self.serve(shutdown)
    }
}
