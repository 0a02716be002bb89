//! TCP server: listener, readiness signal, graceful shutdown.
//!
//! Everything runs on a single-threaded cooperative executor: the accept
//! loop and one task per connection share a current-thread tokio runtime
//! through a `LocalSet`. The object register and the rendezvous table are
//! plain `RefCell`s behind an `Rc` — no two tasks ever execute
//! simultaneously, and borrows are never held across an await.
//!
//! Embedders start the server on a dedicated thread and use a
//! [`ServerHandle`] to block until the listener is bound and to request
//! shutdown. SIGINT and SIGTERM trigger the same graceful stop.

mod connection;
mod pending;

use anyhow::{Context, Result};
use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::{Arc, Condvar, Mutex};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::LocalSet;

use crate::register::ObjectRegister;

use pending::PendingTable;

/// Default port of the server binary.
pub const DEFAULT_PORT: u16 = 7744;

/// Default cap on a single object payload (4 GiB).
pub const DEFAULT_MEMORY_LIMIT: u64 = 4 * 1024 * 1024 * 1024;

/// Server configuration, fixed at startup.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Largest payload a SET may carry; connections exceeding it are
    /// dropped.
    pub memory_limit: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            memory_limit: DEFAULT_MEMORY_LIMIT,
        }
    }
}

/// State shared by every connection task on the executor.
pub(crate) struct ServerState {
    pub(crate) register: RefCell<ObjectRegister>,
    pub(crate) pending: RefCell<PendingTable>,
    pub(crate) memory_limit: u64,
}

/// One-shot "listener is bound" signal plus the shutdown request flag,
/// shared between the server thread and its handles.
struct Shared {
    ready: ReadyState,
    shutdown: Notify,
}

struct ReadyState {
    addr: Mutex<Option<SocketAddr>>,
    cond: Condvar,
}

impl ReadyState {
    fn new() -> Self {
        Self {
            addr: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    fn set(&self, addr: SocketAddr) {
        *self.addr.lock().expect("lock poisoned") = Some(addr);
        self.cond.notify_all();
    }

    fn wait(&self) -> SocketAddr {
        let mut guard = self.addr.lock().expect("lock poisoned");
        loop {
            if let Some(addr) = *guard {
                return addr;
            }
            guard = self.cond.wait(guard).expect("lock poisoned");
        }
    }
}

/// The object storage server.
///
/// [`Server::run`] blocks the calling thread until shutdown; obtain a
/// [`ServerHandle`] first to coordinate from other threads.
pub struct Server {
    config: ServerConfig,
    shared: Arc<Shared>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                ready: ReadyState::new(),
                shutdown: Notify::new(),
            }),
        }
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Bind, serve until a shutdown request or signal, then drop in-flight
    /// connection tasks at their next suspension point.
    pub fn run(self) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to build runtime")?;
        let tasks = LocalSet::new();
        runtime.block_on(tasks.run_until(self.serve()))
    }

    async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port))
            .await
            .with_context(|| {
                format!("failed to bind {}:{}", self.config.host, self.config.port)
            })?;
        let addr = listener
            .local_addr()
            .context("failed to read bound address")?;

        tokio::task::spawn_local(watch_signals(Arc::clone(&self.shared)));

        tracing::info!("object storage server listening on {addr}");
        self.shared.ready.set(addr);

        let state = Rc::new(ServerState {
            register: RefCell::new(ObjectRegister::new()),
            pending: RefCell::new(PendingTable::new()),
            memory_limit: self.config.memory_limit,
        });

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted.context("accept failed")?;
                    if let Err(error) = stream.set_nodelay(true) {
                        tracing::warn!("failed to set TCP_NODELAY on {peer}: {error}");
                    }

                    let (reader, writer) = stream.into_split();
                    let client = connection::Client::new(peer, writer);
                    tokio::task::spawn_local(connection::serve_client(
                        Rc::clone(&state),
                        client,
                        reader,
                    ));
                }
                _ = self.shared.shutdown.notified() => {
                    tracing::info!("object storage server shutting down");
                    return Ok(());
                }
            }
        }
    }
}

/// Cloneable cross-thread handle to a [`Server`].
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    /// Block until the listener is bound and accepting, and return the
    /// bound address.
    pub fn wait_until_ready(&self) -> SocketAddr {
        self.shared.ready.wait()
    }

    /// Request a graceful shutdown. Safe to call from any thread, before or
    /// after the server reaches its accept loop.
    pub fn stop(&self) {
        self.shared.shutdown.notify_one();
    }
}

async fn watch_signals(shared: Arc<Shared>) {
    let interrupt = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to install SIGINT handler: {error}");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        #[cfg(unix)]
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(error) => {
                tracing::warn!("failed to install SIGTERM handler: {error}");
                std::future::pending::<()>().await;
            }
        }
        #[cfg(not(unix))]
        std::future::pending::<()>().await;
    };

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }

    tracing::info!("received shutdown signal");
    shared.shutdown.notify_one();
}
