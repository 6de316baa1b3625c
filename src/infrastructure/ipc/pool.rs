//! Process-wide pool of running IPC servers.
//!
//! Every server joins the pool on a successful listen. The pool installs the
//! process-termination hooks (SIGTERM, SIGINT) once at construction, against
//! itself rather than any true global, and stops every registered server
//! when they fire.

use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use super::server::IpcServer;

/// Registry of live servers with termination cleanup.
pub struct ServerPool {
    servers: Mutex<Vec<IpcServer>>,
}

impl ServerPool {
    /// Create the pool and install its signal hooks. Must be called from
    /// within the async runtime.
    pub fn new() -> Arc<Self> {
        let pool = Arc::new(Self {
            servers: Mutex::new(Vec::new()),
        });
        Arc::clone(&pool).install_signal_hooks();
        pool
    }

    /// Add a server.
    pub fn register(&self, server: IpcServer) {
        self.servers.lock().expect("pool lock").push(server);
    }

    /// Remove a session's server without stopping it.
    pub fn deregister(&self, session_id: &str) {
        self.servers
            .lock()
            .expect("pool lock")
            .retain(|s| s.session_id() != session_id);
    }

    pub fn len(&self) -> usize {
        self.servers.lock().expect("pool lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every registered server (used by the termination hooks and by
    /// orderly shutdown). Servers drain concurrently; each stop is already
    /// bounded by its own backstop.
    pub async fn stop_all(&self) {
        let servers: Vec<IpcServer> = {
            let mut guard = self.servers.lock().expect("pool lock");
            guard.drain(..).collect()
        };
        futures::future::join_all(servers.iter().map(IpcServer::stop)).await;
    }

    fn install_signal_hooks(self: Arc<Self>) {
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "cannot install SIGTERM hook");
                    return;
                }
            };
            let mut int = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "cannot install SIGINT hook");
                    return;
                }
            };
            tokio::select! {
                _ = term.recv() => info!("SIGTERM received; draining IPC server pool"),
                _ = int.recv() => info!("SIGINT received; draining IPC server pool"),
            }
            self.stop_all().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::event_bus::EventBus;

    #[tokio::test]
    async fn test_register_and_deregister() {
        let pool = ServerPool::new();
        let bus = Arc::new(EventBus::default());
        let server = IpcServer::new("pool-a", bus.clone(), false);
        server.start(&pool).await.unwrap();
        assert_eq!(pool.len(), 1);

        pool.deregister("pool-a");
        assert!(pool.is_empty());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_all_stops_registered_servers() {
        let pool = ServerPool::new();
        let bus = Arc::new(EventBus::default());
        let a = IpcServer::new("pool-b1", bus.clone(), false);
        let b = IpcServer::new("pool-b2", bus, false);
        let path_a = a.start(&pool).await.unwrap();
        let path_b = b.start(&pool).await.unwrap();
        assert_eq!(pool.len(), 2);

        pool.stop_all().await;
        assert!(pool.is_empty());
        assert!(!a.is_listening());
        assert!(!b.is_listening());
        assert!(!path_a.exists());
        assert!(!path_b.exists());
    }
}
