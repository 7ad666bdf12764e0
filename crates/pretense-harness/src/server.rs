use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::server::Acceptor;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinError, JoinSet};
use tokio_rustls::LazyConfigAcceptor;

use crate::config::HarnessConfig;
use crate::coordinator::TestCoordinator;
use crate::destination::Destination;
use crate::engine::{CertificateContextObserver, CertificateSource, ConnectionLifecycleObserver};
use crate::errors::HarnessError;
use crate::listener::TestListener;
use crate::types::ConnectionInfo;

const READ_BUFFER_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    /// Original destination assumed for every accepted connection.
    pub destination: Destination,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    /// Stop accepting after this many connections.
    pub max_connections: Option<usize>,
}

impl ServerOptions {
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            destination: config.destination.clone(),
            handshake_timeout: config.timeouts.handshake_timeout(),
            idle_timeout: config.timeouts.idle_timeout(),
            max_connections: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerRunSummary {
    pub accepted_connections: u64,
    pub completed_connections: u64,
    pub failed_connections: u64,
}

/// Accepts connections until `shutdown` resolves or `max_connections` is
/// reached, then waits for every in-flight connection to finish.
pub async fn run_test_listener_server<C, S, F>(
    coordinator: Arc<C>,
    source: Arc<S>,
    listener: TcpListener,
    options: ServerOptions,
    shutdown: F,
) -> Result<ServerRunSummary, HarnessError>
where
    C: TestCoordinator,
    S: CertificateSource,
    F: Future<Output = ()>,
{
    let options = Arc::new(options);
    let mut summary = ServerRunSummary::default();
    let mut tasks = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        if options
            .max_connections
            .is_some_and(|max| summary.accepted_connections >= max as u64)
        {
            break;
        }

        let (stream, peer_addr) = tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => accepted?,
        };
        summary.accepted_connections += 1;
        tasks.spawn(serve_test_connection(
            Arc::clone(&coordinator),
            Arc::clone(&source),
            stream,
            peer_addr,
            Arc::clone(&options),
        ));

        while let Some(result) = tasks.try_join_next() {
            record_connection_result(&mut summary, result);
        }
    }

    while let Some(result) = tasks.join_next().await {
        record_connection_result(&mut summary, result);
    }
    tracing::info!(
        accepted = summary.accepted_connections,
        completed = summary.completed_connections,
        failed = summary.failed_connections,
        "test listener stopped"
    );
    Ok(summary)
}

fn record_connection_result(
    summary: &mut ServerRunSummary,
    result: Result<Result<(), HarnessError>, JoinError>,
) {
    match result {
        Ok(Ok(())) => summary.completed_connections += 1,
        Ok(Err(error)) => {
            tracing::warn!(%error, "test connection failed");
            summary.failed_connections += 1;
        }
        Err(error) => {
            tracing::error!(%error, "test connection task did not finish");
            summary.failed_connections += 1;
        }
    }
}

/// Runs one accepted connection through the engine and the harness. Engine
/// failures are returned as `HarnessError::Engine` after `on_unbind` ran.
pub async fn serve_test_connection<C, S>(
    coordinator: Arc<C>,
    source: Arc<S>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    options: Arc<ServerOptions>,
) -> Result<(), HarnessError>
where
    C: TestCoordinator,
    S: CertificateSource,
{
    let connection = ConnectionInfo::new(peer_addr, options.destination.clone());
    let mut listener = TestListener::new(coordinator, connection)?;
    let driven = drive_connection(&mut listener, source.as_ref(), stream, &options).await;
    let unbound = listener.on_unbind();
    driven.and(unbound)
}

async fn drive_connection<C, S>(
    listener: &mut TestListener<C>,
    source: &S,
    stream: TcpStream,
    options: &ServerOptions,
) -> Result<(), HarnessError>
where
    C: TestCoordinator,
    S: CertificateSource,
{
    let authority = Arc::clone(listener.fallback_authority());
    let destination = listener.connection().destination.clone();

    let mut context = source.initial_context(&authority, &destination).await?;
    listener.on_context_ready(&mut context);

    let acceptor = LazyConfigAcceptor::new(Acceptor::default(), stream);
    let start = match tokio::time::timeout(options.handshake_timeout, acceptor).await {
        Ok(Ok(start)) => start,
        Ok(Err(error)) => return listener.on_handshake_failure(&error.to_string()),
        Err(_) => return listener.on_handshake_failure("timed out waiting for client hello"),
    };

    let server_name = start.client_hello().server_name().map(str::to_string);
    if let Some(server_name) = server_name.as_deref() {
        context = source
            .sni_context(&authority, &destination, server_name)
            .await?;
        listener.on_sni(server_name, &mut context);
    }

    let server_config = context.server_config()?;
    let handshake = start.into_stream(server_config);
    let mut tls = match tokio::time::timeout(options.handshake_timeout, handshake).await {
        Ok(Ok(tls)) => tls,
        Ok(Err(error)) => return listener.on_handshake_failure(&error.to_string()),
        Err(_) => return listener.on_handshake_failure("handshake timed out"),
    };
    listener.on_handshake_success()?;

    let connection_id = listener.connection().connection_id;
    let mut buffer = vec![0_u8; READ_BUFFER_BYTES];
    loop {
        let read = match tokio::time::timeout(options.idle_timeout, tls.read(&mut buffer)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(read)) => read,
            Ok(Err(error)) => {
                tracing::debug!(%connection_id, %error, "client read ended with error");
                break;
            }
            Err(_) => {
                tracing::debug!(%connection_id, "client idle timeout elapsed");
                break;
            }
        };
        listener.on_data(&buffer[..read])?;
    }

    if let Err(error) = tls.shutdown().await {
        if !ignored_shutdown_error(&error) {
            tracing::debug!(%connection_id, %error, "client shutdown failed");
        }
    }
    Ok(())
}

fn ignored_shutdown_error(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
    )
}
