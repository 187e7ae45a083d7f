//! Multiplexed connection engine.
//!
//! A [`Conn`] runs two tasks over one record stream and lets any number of
//! callers share it:
//!
//! ```text
//!  callers ──send/request──► queue ──► writer task ──► RecordWrite
//!     ▲                                                    │
//!     │ reply (by sequence)                                ▼
//!  pending table ◄──── reader task ◄──────────────── RecordRead
//!                          │
//!                          └── uncorrelated / peer requests ──► Handler
//! ```
//!
//! # Writer
//!
//! Each pass drains the whole queue, writes every frame, then flushes once
//! for the batch. The first failure is stamped on the failing frame and
//! every frame after it, and the connection starts closing.
//!
//! # Reader
//!
//! Frames whose sequence lies in our own sequence space are replies: they
//! complete the matching pending request, or are dropped if the caller gave
//! up. Everything else goes to the handler through a pooled [`Context`].
//! With a nonzero `read_timeout`, a peer that sends nothing for that long
//! closes the connection.
//!
//! # Shutdown
//!
//! `Open → Closing → Closed`. Entering `Closing` rejects new calls, fails
//! every pending request with [`ConnError::Closed`], stops the reader, and
//! lets the writer drain what is already queued before shutting the write
//! half down. The state becomes `Closed` once both tasks have exited.
//!
//! Dropping every handle does not close the connection; call
//! [`Conn::close`].

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use carrier_proto::{
    FRAME_HEADER_SIZE, RecordRead, RecordWrite, Role, UNCORRELATED, append_frame, parse_frame,
};
use parking_lot::Mutex;
use tokio::{
    sync::{Notify, watch},
    time::Instant,
};
use tracing::{debug, trace, warn};

use crate::{
    config::{ConnConfig, SequenceConfig},
    context::Context,
    error::ConnError,
    handler::{Handler, NoopHandler},
    pool::Pools,
    slot::{Handoff, RequestSlot, WriteSlot},
};

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// Accepting new sends and requests.
    Open,
    /// Shutting down; queued writes are still being drained.
    Closing,
    /// Both tasks have exited.
    Closed,
}

struct Queued {
    slot: Arc<WriteSlot>,
    wait: bool,
}

struct Shared {
    state: ConnState,
    queue: VecDeque<Queued>,
    pending: HashMap<u32, Arc<RequestSlot>>,
    next_seq: u32,
}

impl Shared {
    /// Next free sequence: skips `0` and anything still pending.
    fn allocate_seq(&mut self, delta: u32) -> u32 {
        loop {
            let seq = self.next_seq;
            self.next_seq = seq.wrapping_add(delta);
            if seq != UNCORRELATED && !self.pending.contains_key(&seq) {
                return seq;
            }
        }
    }
}

struct Inner {
    shared: Mutex<Shared>,
    writer_wake: Notify,
    closing: watch::Sender<bool>,
    running: watch::Sender<usize>,
    role: Role,
    sequence: SequenceConfig,
    config: ConnConfig,
    pools: Arc<Pools>,
    peer_addr: Option<SocketAddr>,
}

impl Inner {
    /// Move to `Closing`. Returns `false` if already closing or closed.
    fn begin_close(&self) -> bool {
        {
            let mut shared = self.shared.lock();
            if shared.state != ConnState::Open {
                return false;
            }
            shared.state = ConnState::Closing;
            for (_, slot) in shared.pending.drain() {
                slot.fail(ConnError::Closed);
            }
        }
        self.closing.send_replace(true);
        self.writer_wake.notify_one();
        true
    }

    fn task_exited(&self) {
        self.running.send_modify(|running| {
            *running = running.saturating_sub(1);
            if *running == 0 {
                self.shared.lock().state = ConnState::Closed;
            }
        });
    }

    fn deregister(&self, seq: u32) -> bool {
        self.shared.lock().pending.remove(&seq).is_some()
    }
}

/// Handle to a running connection.
///
/// Cheap to clone; every clone drives the same connection.
#[derive(Clone)]
pub struct Conn {
    inner: Arc<Inner>,
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("role", &self.inner.role)
            .field("peer_addr", &self.inner.peer_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Builds and starts a [`Conn`].
pub struct ConnBuilder {
    role: Role,
    config: ConnConfig,
    handler: Arc<dyn Handler>,
    pools: Option<Arc<Pools>>,
    peer_addr: Option<SocketAddr>,
}

impl ConnBuilder {
    /// Connection settings.
    #[must_use]
    pub fn config(mut self, config: ConnConfig) -> Self {
        self.config = config;
        self
    }

    /// Handler for inbound messages. Defaults to [`NoopHandler`].
    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handler = handler;
        self
    }

    /// Pools to draw from. Defaults to a private set.
    #[must_use]
    pub fn pools(mut self, pools: Arc<Pools>) -> Self {
        self.pools = Some(pools);
        self
    }

    /// Remote address, for diagnostics.
    #[must_use]
    pub fn peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    /// Start the reader and writer tasks.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// [`ConnError::Config`] if the sequence config is invalid for the role.
    pub fn spawn<R, W>(self, reader: R, writer: W) -> Result<Conn, ConnError>
    where
        R: RecordRead + 'static,
        W: RecordWrite + 'static,
    {
        let sequence = self.config.sequence_for(self.role)?;
        let (closing, _) = watch::channel(false);
        let (running, _) = watch::channel(2usize);

        let conn = Conn {
            inner: Arc::new(Inner {
                shared: Mutex::new(Shared {
                    state: ConnState::Open,
                    queue: VecDeque::new(),
                    pending: HashMap::new(),
                    next_seq: sequence.offset,
                }),
                writer_wake: Notify::new(),
                closing,
                running,
                role: self.role,
                sequence,
                config: self.config,
                pools: self.pools.unwrap_or_default(),
                peer_addr: self.peer_addr,
            }),
        };

        tokio::spawn(run_writer(Arc::clone(&conn.inner), writer));
        tokio::spawn(run_reader(conn.clone(), reader, self.handler));
        debug!(role = ?conn.inner.role, peer = ?conn.inner.peer_addr, "connection started");

        Ok(conn)
    }
}

impl Conn {
    /// Start building a connection for `role`.
    pub fn builder(role: Role) -> ConnBuilder {
        ConnBuilder {
            role,
            config: ConnConfig::default(),
            handler: Arc::new(NoopHandler),
            pools: None,
            peer_addr: None,
        }
    }

    /// Send an uncorrelated message and wait until the writer has attempted
    /// it.
    ///
    /// # Errors
    ///
    /// - [`ConnError::Closed`] if the connection is not open
    /// - [`ConnError::Transport`] or [`ConnError::Timeout`] if the write
    ///   failed
    pub async fn send(&self, payload: &[u8]) -> Result<(), ConnError> {
        let mut in_flight = self.submit(UNCORRELATED, payload, false)?;
        in_flight.finish(&mut Vec::new()).await
    }

    /// Queue an uncorrelated message without waiting.
    ///
    /// # Errors
    ///
    /// [`ConnError::Closed`] if the connection is not open. Write failures
    /// are not reported.
    pub fn send_no_wait(&self, payload: &[u8]) -> Result<(), ConnError> {
        self.enqueue(UNCORRELATED, payload)
    }

    /// Send a request and wait for the reply, using the configured
    /// `request_timeout`.
    ///
    /// The reply replaces the contents of `dst`.
    ///
    /// # Errors
    ///
    /// See [`request_with_timeout`](Self::request_with_timeout).
    pub async fn request(&self, dst: &mut Vec<u8>, payload: &[u8]) -> Result<(), ConnError> {
        self.request_with_timeout(dst, payload, self.inner.config.request_timeout).await
    }

    /// Send a request and wait up to `timeout` for the reply.
    ///
    /// The reply replaces the contents of `dst`; on error `dst` is left
    /// untouched. The deadline covers both the write and the reply.
    ///
    /// # Errors
    ///
    /// - [`ConnError::Closed`] if the connection is or becomes closed
    /// - [`ConnError::Timeout`] if the deadline passes first; the connection
    ///   stays open
    /// - [`ConnError::Transport`] if writing the request failed
    pub async fn request_with_timeout(
        &self,
        dst: &mut Vec<u8>,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<(), ConnError> {
        let mut in_flight = self.submit(UNCORRELATED, payload, true)?;
        let mut timer = self.inner.pools.lease_timer(timeout);

        tokio::select! {
            result = in_flight.finish(dst) => result,
            () = timer.expired() => {
                trace!(seq = in_flight.seq, "request timed out");
                Err(ConnError::Timeout(timeout))
            },
        }
    }

    /// Begin shutting down. Idempotent.
    ///
    /// Pending requests fail with [`ConnError::Closed`] immediately; writes
    /// already queued are still attempted.
    pub fn close(&self) {
        if self.inner.begin_close() {
            debug!(peer = ?self.inner.peer_addr, "closing connection");
        }
    }

    /// Wait until both connection tasks have exited.
    pub async fn closed(&self) {
        let mut running = self.inner.running.subscribe();
        let _ = running.wait_for(|n| *n == 0).await;
    }

    /// Wait until the connection starts closing, for any reason.
    pub async fn closing(&self) {
        let mut closing = self.inner.closing.subscribe();
        let _ = closing.wait_for(|c| *c).await;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        self.inner.shared.lock().state
    }

    /// Whether new sends and requests are accepted.
    pub fn is_open(&self) -> bool {
        self.state() == ConnState::Open
    }

    /// Which end of the connection this is.
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Remote address, if known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// Requests waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.shared.lock().pending.len()
    }

    /// Frames waiting for the writer.
    pub fn queued_writes(&self) -> usize {
        self.inner.shared.lock().queue.len()
    }

    /// Pools this connection draws from.
    pub fn pools(&self) -> &Arc<Pools> {
        &self.inner.pools
    }

    /// Queue a frame without waiting for it.
    pub(crate) fn enqueue(&self, seq: u32, payload: &[u8]) -> Result<(), ConnError> {
        let pools = &self.inner.pools;
        let slot = pools.writes.acquire(Arc::default);
        slot.fill(|frame| append_frame(frame, seq, payload));

        {
            let mut shared = self.inner.shared.lock();
            if shared.state != ConnState::Open {
                drop(shared);
                pools.writes.release(slot);
                return Err(ConnError::Closed);
            }
            shared.queue.push_back(Queued { slot, wait: false });
        }
        self.inner.writer_wake.notify_one();
        Ok(())
    }

    /// Queue a waited frame, registering a pending request if `request`.
    fn submit(&self, seq: u32, payload: &[u8], request: bool) -> Result<InFlight<'_>, ConnError> {
        let pools = &self.inner.pools;
        let write = pools.writes.acquire(Arc::default);
        let reply = request.then(|| pools.requests.acquire(Arc::default));

        let seq = {
            let mut shared = self.inner.shared.lock();
            if shared.state != ConnState::Open {
                drop(shared);
                pools.writes.release(write);
                if let Some(reply) = reply {
                    pools.requests.release(reply);
                }
                return Err(ConnError::Closed);
            }

            let seq = match &reply {
                Some(slot) => {
                    let seq = shared.allocate_seq(self.inner.sequence.delta);
                    shared.pending.insert(seq, Arc::clone(slot));
                    seq
                },
                None => seq,
            };
            write.fill(|frame| append_frame(frame, seq, payload));
            shared.queue.push_back(Queued { slot: Arc::clone(&write), wait: true });
            seq
        };
        self.inner.writer_wake.notify_one();
        if request {
            trace!(seq, "request queued");
        }

        Ok(InFlight { inner: &self.inner, seq, write: Some(write), reply })
    }
}

/// A waited write, and optionally the request it carries.
///
/// Dropping it early (timeout, caller cancelled) hands the write slot to the
/// writer and deregisters the request.
struct InFlight<'a> {
    inner: &'a Inner,
    seq: u32,
    write: Option<Arc<WriteSlot>>,
    reply: Option<Arc<RequestSlot>>,
}

impl InFlight<'_> {
    async fn finish(&mut self, dst: &mut Vec<u8>) -> Result<(), ConnError> {
        if let Some(write) = &self.write {
            write.wait().await?;
        }
        if let Some(write) = self.write.take() {
            self.inner.pools.writes.release(write);
        }
        match &self.reply {
            Some(reply) => reply.wait_into(dst).await,
            None => Ok(()),
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let pools = &self.inner.pools;
        if let Some(write) = self.write.take() {
            if write.abandon() == Handoff::Delivered {
                pools.writes.release(write);
            }
        }
        if let Some(reply) = self.reply.take() {
            self.inner.deregister(self.seq);
            pools.requests.release(reply);
        }
    }
}

async fn run_writer<W: RecordWrite>(inner: Arc<Inner>, writer: W) {
    let mut task = WriterTask { inner: &inner, writer, batch: Vec::new(), broken: None };
    task.run().await;
    inner.task_exited();
}

struct WriterTask<'a, W> {
    inner: &'a Inner,
    writer: W,
    batch: Vec<Queued>,
    broken: Option<ConnError>,
}

impl<W: RecordWrite> WriterTask<'_, W> {
    async fn run(&mut self) {
        loop {
            let closing = {
                let mut shared = self.inner.shared.lock();
                self.batch.extend(shared.queue.drain(..));
                shared.state != ConnState::Open
            };

            if self.batch.is_empty() {
                if closing {
                    break;
                }
                self.inner.writer_wake.notified().await;
                continue;
            }

            self.write_batch().await;
        }

        if self.broken.is_none() {
            let deadline = self.deadline();
            let timeout = self.inner.config.write_timeout;
            if let Err(e) = bounded(deadline, timeout, self.writer.shutdown()).await {
                debug!(error = %e, "write half shutdown failed");
            }
        }
    }

    fn deadline(&self) -> Option<Instant> {
        deadline_after(self.inner.config.write_timeout)
    }

    async fn write_batch(&mut self) {
        let deadline = self.deadline();
        let timeout = self.inner.config.write_timeout;
        let mut failure = self.broken.clone();
        let mut written = 0;

        if failure.is_none() {
            for item in &self.batch {
                let frame = item.slot.take_frame();
                let result = bounded(deadline, timeout, self.writer.write_record(&frame)).await;
                item.slot.restore_frame(frame);
                match result {
                    Ok(()) => written += 1,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    },
                }
            }
        }

        if failure.is_none() {
            if let Err(e) = bounded(deadline, timeout, self.writer.flush()).await {
                failure = Some(e);
                written = 0;
            }
        }

        let pools = &self.inner.pools;
        for (i, item) in self.batch.drain(..).enumerate() {
            let outcome = match &failure {
                Some(e) if i >= written => Err(e.clone()),
                _ => Ok(()),
            };
            if !item.wait || item.slot.complete(outcome) == Handoff::Orphaned {
                pools.writes.release(item.slot);
            }
        }

        if let Some(e) = failure {
            if self.broken.is_none() {
                warn!(peer = ?self.inner.peer_addr, error = %e, "write failed, closing connection");
                self.broken = Some(e);
                self.inner.begin_close();
            }
        }
    }
}

async fn signalled(flag: &mut watch::Receiver<bool>) {
    let _ = flag.wait_for(|set| *set).await;
}

/// `timeout` from now, or `None` if zero.
fn deadline_after(timeout: Duration) -> Option<Instant> {
    (!timeout.is_zero()).then(|| Instant::now() + timeout)
}

/// Run `fut` against an optional deadline.
async fn bounded<F>(deadline: Option<Instant>, timeout: Duration, fut: F) -> Result<(), ConnError>
where
    F: Future<Output = carrier_proto::Result<()>>,
{
    match deadline {
        None => fut.await.map_err(ConnError::from),
        Some(at) => match tokio::time::timeout_at(at, fut).await {
            Ok(result) => result.map_err(ConnError::from),
            Err(_) => Err(ConnError::Timeout(timeout)),
        },
    }
}

async fn run_reader<R: RecordRead>(conn: Conn, mut reader: R, handler: Arc<dyn Handler>) {
    let inner = &conn.inner;
    let mut closing = inner.closing.subscribe();
    let mut frame = Vec::new();
    let read_timeout = inner.config.read_timeout;

    loop {
        tokio::select! {
            biased;
            () = signalled(&mut closing) => break,
            result = bounded(
                deadline_after(read_timeout),
                read_timeout,
                reader.read_record(&mut frame),
            ) => {
                match result {
                    Ok(()) => {},
                    Err(ConnError::Timeout(_)) => {
                        debug!(
                            peer = ?inner.peer_addr,
                            ?read_timeout,
                            "read timed out, closing connection"
                        );
                        break;
                    },
                    Err(ConnError::Transport(e)) if e.is_disconnect() => {
                        debug!(peer = ?inner.peer_addr, "peer disconnected");
                        break;
                    },
                    Err(e) => {
                        warn!(peer = ?inner.peer_addr, error = %e, "read failed, closing connection");
                        break;
                    },
                }
            },
        }

        let seq = match parse_frame(&frame) {
            Ok((seq, _)) => seq,
            Err(e) => {
                warn!(peer = ?inner.peer_addr, error = %e, "malformed frame, closing connection");
                break;
            },
        };

        if inner.sequence.is_own(seq) {
            // Completed under the lock so a caller that just timed out cannot
            // recycle the slot underneath us.
            let delivered = {
                let mut shared = inner.shared.lock();
                match shared.pending.remove(&seq) {
                    Some(slot) => {
                        slot.complete(&frame[FRAME_HEADER_SIZE..]);
                        true
                    },
                    None => false,
                }
            };
            if delivered {
                trace!(seq, "reply delivered");
            } else {
                trace!(seq, "dropping reply with no pending request");
            }
            continue;
        }

        trace!(seq, len = frame.len() - FRAME_HEADER_SIZE, "dispatching to handler");
        let mut ctx = inner.pools.contexts.lease(Context::default);
        ctx.load(&conn, seq, &mut frame);
        if let Err(e) = handler.handle_message(&mut ctx).await {
            warn!(peer = ?inner.peer_addr, seq, error = %e, "handler failed");
        }
        ctx.unload(&mut frame);
    }

    inner.begin_close();
    inner.task_exited();
}
