//! Process entry point: parses configuration, wires up the router and
//! session binder, and runs the accept loop until SIGINT/SIGTERM.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use clap::Parser;
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;

mod config;
mod dispatcher;
mod error;
mod filter;
mod paging;
mod router;
mod session;
mod upstream;

use config::Config;
use error::ProxyError;
use router::Router;
use session::SessionBinder;

/// Bound applied to the drain period after a shutdown signal: any client
/// task still running after this is aborted rather than waited on.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn main() {
    let config = Config::parse();
    if let Err(e) = config.validate() {
        eprintln!("configuration error: {e}");
        std::process::exit(1);
    }

    env_logger::Builder::new()
        .filter_level(config.log_filter())
        .init();

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.parallelism())
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(run(config)) {
        error!("fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), ProxyError> {
    let router = Router::new(config.additional_backends.clone(), config.default_backend.clone());
    let timeout = Duration::from_secs(config.timeout_seconds as u64);
    let binder = Arc::new(SessionBinder::new(router, timeout));

    let bind_addr: SocketAddr = config
        .bind_address
        .parse()
        .map_err(|e| ProxyError::Config(format!("invalid bind-address: {e}")))?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| ProxyError::Config(format!("cannot bind {bind_addr}: {e}")))?;
    info!("ldap-proxy listening on {bind_addr}, default backend {}", config.default_backend);

    if let Some(addr) = &config.pprof_address {
        spawn_debug_endpoint(addr.clone());
    }

    let shutdown = shutdown_signal();
    let mut shutdown = pin!(shutdown);

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("shutdown signal received, draining in-flight connections");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        debug!("accepted connection from {peer}");
                        let binder = binder.clone();
                        connections.spawn(handle_one(socket, binder, timeout));
                    }
                    Err(e) => warn!("accept failed: {e}"),
                }
            }
        }
    }

    drop(listener);
    let drain = async {
        while connections.join_next().await.is_some() {}
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!(
            "{} connection(s) still active after {:?} grace period, aborting",
            connections.len(),
            SHUTDOWN_GRACE
        );
        connections.shutdown().await;
    }

    info!("shutdown complete");
    Ok(())
}

async fn handle_one(socket: TcpStream, binder: Arc<SessionBinder>, timeout: Duration) {
    dispatcher::handle_connection(socket, binder, timeout).await;
}

/// Resolves once on SIGINT (all platforms) or SIGTERM (unix).
fn shutdown_signal() -> impl Future<Output = ()> {
    async move {
        let ctrl_c = async {
            let _ = tokio::signal::ctrl_c().await;
        };

        #[cfg(unix)]
        {
            let terminate = async {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut sig) => {
                        sig.recv().await;
                    }
                    Err(e) => {
                        warn!("failed to register SIGTERM handler: {e}");
                        std::future::pending::<()>().await;
                    }
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = terminate => {}
            }
        }

        #[cfg(not(unix))]
        ctrl_c.await;
    }
}

/// A minimal debug/pprof-style endpoint: textual counters only, no flamegraph
/// support. Disabled unless `--pprof` is given; see DESIGN.md for why a full
/// profiler crate was not pulled in for this optional surface.
fn spawn_debug_endpoint(addr: String) {
    static CONNECTIONS_SERVED: AtomicUsize = AtomicUsize::new(0);

    tokio::spawn(async move {
        let bind_addr: SocketAddr = match addr.parse() {
            Ok(a) => a,
            Err(e) => {
                warn!("invalid pprof address {addr}: {e}, debug endpoint disabled");
                return;
            }
        };
        let listener = match TcpListener::bind(bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                warn!("cannot bind pprof address {bind_addr}: {e}, debug endpoint disabled");
                return;
            }
        };
        info!("debug endpoint listening on {bind_addr}");
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("pprof endpoint accept failed: {e}");
                    continue;
                }
            };
            let served = CONNECTIONS_SERVED.fetch_add(1, Ordering::Relaxed) + 1;
            tokio::spawn(async move {
                use tokio::io::AsyncWriteExt;
                let body = format!("ldap-proxy debug endpoint\nconnections_served={served}\n");
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
}
