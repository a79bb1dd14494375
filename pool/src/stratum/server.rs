/// Stratum Server - async TCP listener for Stratum v1 miners
///
/// Handles miner connections with:
/// - Async TCP (Tokio) and SO_REUSEADDR binding
/// - One task per connection, plus a writer task so frames never interleave
/// - A job-push task per authorized session, cancelled with the session
/// - Periodic job rotation broadcast to every authorized session

use anyhow::{anyhow, Result};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::codec::{Frame, StratumCodec};
use super::connection::{PoolContext, Session};
use super::protocol::Message;
use crate::config::Config;
use crate::jobs::{JobId, JobTemplate};
use crate::metrics::prometheus as metrics;

pub struct StratumServer {
    ctx: Arc<PoolContext>,
    connection_count: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl StratumServer {
    pub fn new(config: Config) -> Self {
        Self::with_context(Arc::new(PoolContext::new(config)))
    }

    pub fn with_context(ctx: Arc<PoolContext>) -> Self {
        tracing::info!(
            "Creating Stratum server on {} (difficulty {}, {:?} share validation)",
            ctx.config.listen,
            ctx.config.difficulty,
            ctx.validator.policy()
        );
        Self {
            ctx,
            connection_count: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn context(&self) -> &Arc<PoolContext> {
        &self.ctx
    }

    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::Relaxed)
    }

    /// Stop accepting, end the rotation task and close every session.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Bind a listener with SO_REUSEADDR so restarts don't trip over TIME_WAIT.
    pub fn bind(addr: &str) -> Result<TcpListener> {
        let sock_addr: SocketAddr = addr
            .parse()
            .map_err(|e| anyhow!("Invalid address '{}': {}", addr, e))?;

        let socket = socket2::Socket::new(
            socket2::Domain::for_address(sock_addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&socket2::SockAddr::from(sock_addr))?;
        socket.listen(1024)?;

        let std_listener: std::net::TcpListener = socket.into();
        Ok(TcpListener::from_std(std_listener)?)
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let listener = Self::bind(&self.ctx.config.listen)?;
        self.serve(listener).await
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        tracing::info!("✅ Stratum server listening on {} (SO_REUSEADDR)", local);

        self.spawn_rotation();

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((mut socket, peer_addr)) => {
                    let conn_count = self.connection_count.load(Ordering::Relaxed);
                    if conn_count >= self.ctx.config.max_connections {
                        tracing::warn!(
                            "🚫 Max connections ({}) reached, rejecting {}",
                            self.ctx.config.max_connections,
                            peer_addr
                        );
                        let _ = socket.shutdown().await;
                        continue;
                    }

                    self.connection_count.fetch_add(1, Ordering::Relaxed);
                    metrics::inc_connections();
                    tracing::info!("🔌 New connection from {}", peer_addr);

                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(socket, peer_addr).await {
                            tracing::warn!("Connection error from {}: {}", peer_addr, e);
                        }
                        server.connection_count.fetch_sub(1, Ordering::Relaxed);
                        metrics::dec_connections();
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept connection: {}", e);
                }
            }
        }

        tracing::info!("Stratum server on {} stopped", local);
        Ok(())
    }

    /// Rotate the job every `notify_secs` and fan it out to the broadcast group.
    fn spawn_rotation(&self) {
        let ctx = Arc::clone(&self.ctx);
        let cancel = self.shutdown.clone();
        let period = ctx.config.notify_interval();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let job = ctx.jobs.rotate_job(false);
                        let listeners = ctx.jobs.broadcast(Arc::clone(&job));
                        metrics::inc_job_broadcasts();
                        tracing::info!("📢 Broadcast job {} to {} sessions", job.job_id, listeners);
                    }
                }
            }
        });
    }

    async fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        let _ = socket.set_nodelay(true);
        let mut session = Session::new(Arc::clone(&self.ctx), Some(peer_addr));
        let session_id = session.session_id.clone();
        let cancel = self.shutdown.child_token();

        let (reader, writer) = socket.into_split();
        let mut frames = FramedRead::new(reader, StratumCodec::new());
        let tx = spawn_writer(writer, cancel.clone(), peer_addr);

        let idle = self.ctx.config.idle_timeout();

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = next_frame(&mut frames, idle) => next,
            };

            let frame = match next {
                Ok(Some(Ok(frame))) => frame,
                Ok(Some(Err(e))) => {
                    tracing::warn!("Read error from {}: {}", peer_addr, e);
                    break;
                }
                Ok(None) => {
                    tracing::info!("📥 Connection closed by client: {}", peer_addr);
                    break;
                }
                Err(_) => {
                    tracing::warn!("⏱️  Connection idle timeout: {}", peer_addr);
                    break;
                }
            };

            match frame {
                Frame::Malformed { line, reason } => {
                    metrics::inc_malformed_lines();
                    tracing::warn!("Discarding malformed line from {}: {} ({})", peer_addr, line, reason);
                }
                Frame::Message(request) => {
                    tracing::debug!("📨 Received from {}: {} {}", peer_addr, request.method, request.params);

                    let mut open = true;
                    for msg in session.handle(&request) {
                        if tx.send(msg).is_err() {
                            open = false;
                            break;
                        }
                    }
                    if !open {
                        break;
                    }

                    if let Some(feed) = session.take_job_feed() {
                        spawn_job_push(tx.clone(), feed, session.last_job_id(), cancel.clone(), session_id.clone());
                    }
                }
            }
        }

        cancel.cancel();
        tracing::info!(
            "🔌 Connection closed: {} ({}, {} shares)",
            session_id,
            peer_addr,
            session.share_count()
        );
        Ok(())
    }
}

type FrameResult = Option<Result<Frame, super::codec::CodecError>>;

async fn next_frame(
    frames: &mut FramedRead<tokio::net::tcp::OwnedReadHalf, StratumCodec>,
    idle: Option<std::time::Duration>,
) -> Result<FrameResult, tokio::time::error::Elapsed> {
    match idle {
        Some(limit) => tokio::time::timeout(limit, frames.next()).await,
        None => Ok(frames.next().await),
    }
}

/// Writer task for one connection (responses and job pushes).
///
/// A failed write cancels the session.
fn spawn_writer<W>(writer: W, cancel: CancellationToken, peer_addr: SocketAddr) -> mpsc::UnboundedSender<Message>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut sink = FramedWrite::new(writer, StratumCodec::new());
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = sink.send(msg).await {
                tracing::debug!("Write to {} failed: {}", peer_addr, e);
                cancel.cancel();
                break;
            }
        }
    });
    tx
}

/// Forward broadcast jobs to one session until it ends.
///
/// Jobs at or below `floor` were issued before the session's clean job and are skipped.
fn spawn_job_push(
    tx: mpsc::UnboundedSender<Message>,
    mut feed: broadcast::Receiver<Arc<JobTemplate>>,
    floor: Option<JobId>,
    cancel: CancellationToken,
    session_id: String,
) {
    tokio::spawn(async move {
        loop {
            let job = tokio::select! {
                _ = cancel.cancelled() => break,
                job = feed.recv() => job,
            };

            match job {
                Ok(job) => {
                    if floor.is_some_and(|f| job.job_id <= f) {
                        continue;
                    }
                    if tx.send(job.notification().into()).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("Session {} skipped {} jobs", session_id, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        tracing::debug!("Job push for session {} stopped", session_id);
    });
}
