// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! TCP point listener.
//!
//! One [`PointListener`] owns one port. Starting it binds the socket, creates the listener's
//! [`PointBuffer`], spawns the flush workers and an accept loop. Every accepted connection
//! gets its own reader task which splits the stream into lines, decodes them with the
//! listener's decoder and enqueues the resulting points without ever waiting on the buffer.
//!
//! ```text
//!   client ──> reader task ──decode──> PointBuffer <──drain── flush workers ──> PointSender
//!   client ──> reader task ──decode──┘
//! ```
//!
//! Lifecycle: `Created -> Starting -> Running -> Stopping -> Stopped`, or straight from
//! `Starting` to `Stopped` when the port cannot be bound. A stopped listener cannot be
//! restarted.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::buffer::PointBuffer;
use crate::constants::{
    CONNECTIONS_ACTIVE, CONNECTIONS_REJECTED, DEFAULT_FLUSH_INTERVAL_MS, DEFAULT_FLUSH_MAX_POINTS,
    DEFAULT_FLUSH_THREADS, DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_LINE_LENGTH,
    DEFAULT_MEMORY_BUFFER_LIMIT, DEFAULT_SHUTDOWN_GRACE_PERIOD, POINTS_DECODE_ERRORS,
    POINTS_DROPPED, POINTS_RECEIVED,
};
use crate::decoder::{Decoder, DecoderKind};
use crate::errors::{DecodeError, ListenerError};
use crate::flusher::{Flusher, FlusherConfig};
use crate::telemetry::{Counter, Gauge, TelemetryRegistry};
use crate::wavefront::PointSender;

// Pause after a failed accept (e.g. out of file descriptors) so the loop does not spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum ListenerState {
    #[display("created")]
    Created,
    #[display("starting")]
    Starting,
    #[display("running")]
    Running,
    #[display("stopping")]
    Stopping,
    #[display("stopped")]
    Stopped,
}

/// Parameters bound when the listener starts
#[derive(Clone, Debug)]
pub struct ListenerConfig {
    /// Address to bind, e.g. "0.0.0.0"
    pub host: String,
    /// Port to bind, 0 picks an ephemeral port
    pub port: u16,
    pub decoder: DecoderKind,
    /// Number of independent flush workers draining the buffer
    pub flush_threads: usize,
    pub flush_interval: Duration,
    /// Capacity of the point buffer
    pub max_buffer_size: usize,
    pub max_points_per_flush: usize,
    /// Concurrent connections served; extra connections are closed on accept
    pub max_connections: usize,
    pub max_line_length: usize,
    /// How long `stop` waits for readers and flush workers before aborting them
    pub shutdown_grace_period: Duration,
}

impl ListenerConfig {
    #[must_use]
    pub fn new(port: u16, decoder: DecoderKind) -> Self {
        ListenerConfig {
            host: "0.0.0.0".to_string(),
            port,
            decoder,
            flush_threads: DEFAULT_FLUSH_THREADS,
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            max_buffer_size: DEFAULT_MEMORY_BUFFER_LIMIT,
            max_points_per_flush: DEFAULT_FLUSH_MAX_POINTS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            shutdown_grace_period: DEFAULT_SHUTDOWN_GRACE_PERIOD,
        }
    }

    fn validate(&self) -> Result<(), ListenerError> {
        if self.flush_threads == 0 {
            return Err(ListenerError::InvalidConfig(
                "flush_threads must be at least 1".to_string(),
            ));
        }
        if self.max_points_per_flush == 0 {
            return Err(ListenerError::InvalidConfig(
                "max_points_per_flush must be at least 1".to_string(),
            ));
        }
        if self.flush_interval.is_zero() {
            return Err(ListenerError::InvalidConfig(
                "flush_interval must be greater than zero".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ListenerError::InvalidConfig(
                "max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// State shared by every reader task of one listener
struct ConnectionContext {
    decoder: Arc<dyn Decoder>,
    buffer: Arc<PointBuffer>,
    max_line_length: usize,
    max_connections: usize,
    semaphore: Arc<Semaphore>,
    received: Arc<Counter>,
    dropped: Arc<Counter>,
    decode_errors: Arc<Counter>,
    rejected: Arc<Counter>,
    /// shared by every listener on the registry; only adjusted through `ConnectionSlot`
    active: Arc<Gauge>,
}

pub struct PointListener {
    config: ListenerConfig,
    telemetry: Arc<TelemetryRegistry>,
    state: ListenerState,
    cancel_token: CancellationToken,
    local_addr: Option<SocketAddr>,
    buffer: Option<Arc<PointBuffer>>,
    flusher: Option<Flusher>,
    tasks: Vec<JoinHandle<()>>,
}

impl PointListener {
    #[must_use]
    pub fn new(config: ListenerConfig, telemetry: Arc<TelemetryRegistry>) -> Self {
        PointListener {
            config,
            telemetry,
            state: ListenerState::Created,
            cancel_token: CancellationToken::new(),
            local_addr: None,
            buffer: None,
            flusher: None,
            tasks: Vec::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> ListenerState {
        self.state
    }

    /// Address the listener is bound to, once started
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    #[must_use]
    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// Points currently waiting in this listener's buffer
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.as_ref().map_or(0, |b| b.len())
    }

    /// Binds the port and starts the accept loop and the flush workers.
    ///
    /// A bind failure is returned to the caller and leaves the listener `Stopped`; it is
    /// not retried.
    pub async fn start(&mut self, sender: Arc<dyn PointSender>) -> Result<(), ListenerError> {
        if self.state != ListenerState::Created {
            return Err(ListenerError::InvalidState(
                self.state,
                ListenerState::Created,
            ));
        }
        self.config.validate()?;
        self.state = ListenerState::Starting;

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(source) => {
                self.state = ListenerState::Stopped;
                error!("Failed to bind {} listener to {}: {}", self.config.decoder, addr, source);
                return Err(ListenerError::Bind { addr, source });
            }
        };
        self.local_addr = listener.local_addr().ok();

        let buffer = Arc::new(PointBuffer::new(self.config.max_buffer_size));
        let flusher = Flusher::new(FlusherConfig {
            buffer: Arc::clone(&buffer),
            sender,
            flush_interval: self.config.flush_interval,
            max_points_per_flush: self.config.max_points_per_flush,
            telemetry: Arc::clone(&self.telemetry),
        });
        self.tasks = flusher.spawn_workers(self.config.flush_threads, &self.cancel_token);

        let context = Arc::new(ConnectionContext {
            decoder: self.config.decoder.build(),
            buffer: Arc::clone(&buffer),
            max_line_length: self.config.max_line_length,
            max_connections: self.config.max_connections,
            semaphore: Arc::new(Semaphore::new(self.config.max_connections)),
            received: self.telemetry.counter(POINTS_RECEIVED),
            dropped: self.telemetry.counter(POINTS_DROPPED),
            decode_errors: self.telemetry.counter(POINTS_DECODE_ERRORS),
            rejected: self.telemetry.counter(CONNECTIONS_REJECTED),
            active: self.telemetry.gauge(CONNECTIONS_ACTIVE),
        });
        self.tasks.push(tokio::spawn(accept_loop(
            listener,
            context,
            self.cancel_token.clone(),
        )));
        self.buffer = Some(buffer);
        self.flusher = Some(flusher);
        self.state = ListenerState::Running;

        info!(
            "Listening for {} points on {} with {} flush workers",
            self.config.decoder,
            self.local_addr.map_or(addr, |a| a.to_string()),
            self.config.flush_threads
        );
        Ok(())
    }

    /// Stops accepting, signals every reader and flush worker and waits for them.
    ///
    /// A send already in progress is given the grace period to finish. Tasks still running
    /// after it are aborted, and the points of their abandoned sends are counted as dropped.
    /// Points left in the buffer are discarded, not flushed, and also counted as dropped.
    /// Calling `stop` on a listener that is not running does nothing.
    pub async fn stop(&mut self) {
        if self.state != ListenerState::Running {
            debug!("Ignoring stop, listener is {}", self.state);
            return;
        }
        self.state = ListenerState::Stopping;
        self.cancel_token.cancel();

        let mut tasks = std::mem::take(&mut self.tasks);
        let wait_all = async {
            for task in &mut tasks {
                if let Err(e) = task.await {
                    if e.is_panic() {
                        error!("Listener task panicked: {}", e);
                    }
                }
            }
        };
        if timeout(self.config.shutdown_grace_period, wait_all)
            .await
            .is_err()
        {
            warn!(
                "Listener on port {} did not stop within {} ms, aborting remaining tasks",
                self.config.port,
                self.config.shutdown_grace_period.as_millis()
            );
            for task in &tasks {
                task.abort();
            }
            for task in tasks {
                let _ = task.await;
            }
        }

        if let Some(flusher) = self.flusher.take() {
            let abandoned = flusher.in_flight();
            if abandoned > 0 {
                self.telemetry.counter(POINTS_DROPPED).add(abandoned as u64);
                warn!("Abandoned {} in-flight points on shutdown", abandoned);
            }
            flusher.release_buffer_size();
        }
        if let Some(buffer) = self.buffer.take() {
            let discarded = buffer.clear();
            if discarded > 0 {
                self.telemetry.counter(POINTS_DROPPED).add(discarded as u64);
                warn!("Discarded {} buffered points on shutdown", discarded);
            }
        }
        self.state = ListenerState::Stopped;
        info!("Stopped {} listener on port {}", self.config.decoder, self.config.port);
    }
}

impl Drop for PointListener {
    fn drop(&mut self) {
        // a listener dropped without stop() must not leave its tasks behind
        self.cancel_token.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    context: Arc<ConnectionContext>,
    cancel_token: CancellationToken,
) {
    let mut connections = JoinSet::new();
    loop {
        let accepted = tokio::select! {
            biased;
            () = cancel_token.cancelled() => break,
            // reap finished readers so the set does not grow with every connection
            Some(_) = connections.join_next(), if !connections.is_empty() => continue,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };

        let Ok(permit) = Arc::clone(&context.semaphore).try_acquire_owned() else {
            context.rejected.inc();
            warn!(
                "Rejecting connection from {}: {} connections already open",
                peer, context.max_connections
            );
            drop(stream);
            continue;
        };
        let slot = ConnectionSlot::open(permit, Arc::clone(&context.active));
        debug!("Accepted connection from {}", peer);
        connections.spawn(handle_connection(
            stream,
            peer,
            Arc::clone(&context),
            cancel_token.clone(),
            slot,
        ));
    }

    // closes the listening socket before waiting on the readers
    drop(listener);
    while connections.join_next().await.is_some() {}
}

/// One open connection: holds its permit and counts itself in `connections.active` until
/// dropped, including when the reader task is aborted.
struct ConnectionSlot {
    _permit: OwnedSemaphorePermit,
    active: Arc<Gauge>,
}

impl ConnectionSlot {
    fn open(permit: OwnedSemaphorePermit, active: Arc<Gauge>) -> Self {
        active.add(1.0);
        ConnectionSlot {
            _permit: permit,
            active,
        }
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.active.add(-1.0);
    }
}

enum LineRead {
    Eof,
    Line,
    TooLong,
}

/// Reads one `\n` terminated line into `buf`, holding at most `max_len + 1` bytes.
///
/// A longer line is discarded up to and including its newline and reported as `TooLong`.
async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>, max_len: usize) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    let limit = u64::try_from(max_len).unwrap_or(u64::MAX).saturating_add(1);
    let n = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(LineRead::Eof);
    }
    if buf.last() == Some(&b'\n') || n <= max_len {
        return Ok(LineRead::Line);
    }

    loop {
        let (consumed, found_newline) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(LineRead::TooLong);
            }
            match available.iter().position(|b| *b == b'\n') {
                Some(pos) => (pos + 1, true),
                None => (available.len(), false),
            }
        };
        reader.consume(consumed);
        if found_newline {
            return Ok(LineRead::TooLong);
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    context: Arc<ConnectionContext>,
    cancel_token: CancellationToken,
    slot: ConnectionSlot,
) {
    let mut reader = BufReader::new(stream);
    let mut line = Vec::with_capacity(256);
    let mut warned_full = false;

    loop {
        line.clear();
        let read = tokio::select! {
            biased;
            () = cancel_token.cancelled() => break,
            read = read_line(&mut reader, &mut line, context.max_line_length) => read,
        };

        match read {
            Ok(LineRead::Eof) => break,
            Ok(LineRead::TooLong) => {
                context.decode_errors.inc();
                debug!(
                    "Skipping line from {}: {}",
                    peer,
                    DecodeError::LineTooLong(context.max_line_length)
                );
            }
            Ok(LineRead::Line) => {
                let Ok(text) = std::str::from_utf8(&line) else {
                    context.decode_errors.inc();
                    debug!("Skipping non UTF-8 line from {}", peer);
                    continue;
                };
                if text.trim().is_empty() {
                    continue;
                }
                match context.decoder.decode(text) {
                    Ok(point) => {
                        context.received.inc();
                        if !context.buffer.try_enqueue(point) {
                            context.dropped.inc();
                            if !warned_full {
                                warn!("Point buffer full, dropping points from {}", peer);
                                warned_full = true;
                            }
                        }
                    }
                    Err(e) => {
                        context.decode_errors.inc();
                        debug!("Failed to decode line from {} {:?}: {}", peer, text.trim_end(), e);
                    }
                }
            }
            Err(e) => {
                debug!("Error reading from {}: {}", peer, e);
                break;
            }
        }
    }

    trace!("Closing connection from {}", peer);
    drop(reader);
    drop(slot);
}
