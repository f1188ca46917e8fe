//! Session lifecycle and the host half of the bridge.
//!
//! A [`Session`] owns one shared region and one pair of async channels, the
//! sandbox thread on the other side of them, and a background pump task that
//! moves traffic between the two. The pump is the only place the host reads
//! from the sandbox; everything else the host does is posting commands and
//! awaiting their completions.

mod eval;
mod pump;
mod router;

use std::{
    collections::HashMap,
    fmt,
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll},
    time::Duration,
};

pub use eval::{Captured, EvalOptions, OutputMode};
use futures::Stream;
use parking_lot::Mutex;
pub use router::SubscriptionId;
use router::{CaptureBuffer, Router};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    TRACE_TARGET_BRIDGE, cbor,
    config::SessionConfig,
    error::{Error, Result, TransportError},
    host::{BoxError, Host, NoopHost},
    protocol::{CaptureId, Command, Completion, Envelope, Handle, IdAllocator, Message, MessageId},
    queue::AsyncChannel,
    region::SharedRegion,
    sandbox::{Interpreter, SandboxLink, spawn_worker},
    shelter::{Proxy, Registry, Shelter, ShelterId},
};

/// Bytes a `command` reply adds around the command envelope it carries.
const REPLY_OVERHEAD: usize = 64;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    /// The transport failed. Every later request is refused with the error.
    Failed(TransportError),
    Destroyed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => f.write_str("uninitialized"),
            Self::Initializing => f.write_str("initializing"),
            Self::Ready => f.write_str("ready"),
            Self::Failed(e) => write!(f, "failed ({e})"),
            Self::Destroyed => f.write_str("destroyed"),
        }
    }
}

/// Completion sink for a command that expects a response.
pub(crate) enum Pending {
    Reply(oneshot::Sender<Result<Completion>>),
    /// Runs on the pump task, outside every session lock.
    Callback(Box<dyn FnOnce(Result<Completion>) + Send>),
}

type Launcher = Box<dyn FnOnce(SandboxLink) -> std::io::Result<std::thread::JoinHandle<()>> + Send>;

/// State shared by the session handle, the pump and console callbacks.
pub(crate) struct Core {
    pub(crate) config: SessionConfig,
    pub(crate) region: Arc<SharedRegion>,
    pub(crate) outbound: Arc<AsyncChannel<Message>>,
    pub(crate) inbound: AsyncChannel<Command>,
    ids: IdAllocator,
    pub(crate) wake: Arc<Notify>,
    pub(crate) host: Arc<dyn Host>,
    pub(crate) router: Mutex<Router>,
    pub(crate) registry: Mutex<Registry>,
    state: Mutex<SessionState>,
    pending: Mutex<HashMap<MessageId, Pending>>,
}

impl Core {
    fn new(config: SessionConfig, host: Arc<dyn Host>) -> Self {
        let wake = Arc::new(Notify::new());
        Self {
            region: Arc::new(SharedRegion::new(
                config.region_capacity,
                config.wait_slice(),
                Arc::clone(&wake),
            )),
            outbound: Arc::new(AsyncChannel::new(Arc::clone(&wake))),
            inbound: AsyncChannel::new(Arc::clone(&wake)),
            ids: IdAllocator::host(),
            router: Mutex::new(Router::new(config.max_queued_messages)),
            registry: Mutex::new(Registry::new()),
            state: Mutex::new(SessionState::Uninitialized),
            pending: Mutex::new(HashMap::new()),
            host,
            wake,
            config,
        }
    }

    fn link(&self) -> SandboxLink {
        SandboxLink {
            region: Arc::clone(&self.region),
            outbound: Arc::clone(&self.outbound),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state.lock().clone()
    }

    pub(crate) fn ensure_ready(&self) -> Result<()> {
        match &*self.state.lock() {
            SessionState::Ready => Ok(()),
            SessionState::Failed(e) => Err(Error::Transport(e.clone())),
            state => Err(Error::State {
                state: state.clone(),
            }),
        }
    }

    /// Queue `command` for the sandbox.
    ///
    /// `pending` is registered before the command is visible to the sandbox,
    /// so its completion cannot be missed.
    pub(crate) fn send(
        &self,
        command: Command,
        capture: Option<CaptureId>,
        pending: Option<Pending>,
    ) -> Result<MessageId> {
        self.ensure_ready()?;
        self.send_unchecked(command, capture, pending)
    }

    fn send_unchecked(
        &self,
        command: Command,
        capture: Option<CaptureId>,
        pending: Option<Pending>,
    ) -> Result<MessageId> {
        let id = self.ids.message();
        let frame = cbor::encode_frame(&Envelope::new(id, command).with_capture(capture))?;
        let len = frame.len() + REPLY_OVERHEAD;
        if len > self.region.capacity() {
            return Err(TransportError::PayloadTooLarge {
                len,
                capacity: self.region.capacity(),
            }
            .into());
        }

        if let Some(pending) = pending {
            self.pending.lock().insert(id, pending);
        }
        if let Err(e) = self.inbound.post_frame(frame) {
            self.pending.lock().remove(&id);
            return Err(e.into());
        }
        tracing::trace!(target: TRACE_TARGET_BRIDGE, %id, "command queued");
        Ok(id)
    }

    /// Send `command` and wait for its completion.
    pub(crate) async fn request(
        &self,
        command: Command,
        capture: Option<CaptureId>,
    ) -> Result<Completion> {
        let (tx, rx) = oneshot::channel();
        self.send(command, capture, Some(Pending::Reply(tx)))?;
        rx.await
            .map_err(|_| Error::Transport(TransportError::Closed))?
    }

    /// Tell the sandbox it may reclaim `handles`.
    pub(crate) fn release(&self, handles: Vec<Handle>) {
        if handles.is_empty() {
            return;
        }
        tracing::debug!(target: TRACE_TARGET_BRIDGE, count = handles.len(), "releasing handles");
        if let Err(e) = self.send(Command::Release { handles }, None, None) {
            tracing::debug!(target: TRACE_TARGET_BRIDGE, error = %e, "release not delivered");
        }
    }

    /// Resolve the request `to`. Runs on the pump, outside all locks.
    pub(crate) fn complete(&self, to: MessageId, result: Result<Completion>) {
        let pending = self.pending.lock().remove(&to);
        let orphan = match pending {
            Some(Pending::Reply(tx)) => tx.send(result).err().and_then(Result::ok),
            Some(Pending::Callback(callback)) => {
                callback(result);
                None
            }
            None => {
                tracing::debug!(target: TRACE_TARGET_BRIDGE, %to, "response without a waiter");
                result.ok()
            }
        };
        // Nobody will shelter a handle whose waiter has gone.
        if let Some(Completion::Handle { handle, .. }) = orphan {
            self.release(vec![handle]);
        }
    }

    /// Move to [`SessionState::Failed`] and fail every outstanding request.
    pub(crate) fn fail(&self, err: TransportError) {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Destroyed {
                drop(state);
                self.fail_pending(&TransportError::Closed);
                return;
            }
            tracing::error!(target: TRACE_TARGET_BRIDGE, error = %err, "session failed");
            *state = SessionState::Failed(err.clone());
        }
        self.shutdown_transport();
        self.fail_pending(&err);
    }

    fn fail_pending(&self, err: &TransportError) {
        let pending: Vec<_> = self.pending.lock().drain().collect();
        for (_, pending) in pending {
            let result = Err(Error::Transport(err.clone()));
            match pending {
                Pending::Reply(tx) => {
                    let _ = tx.send(result);
                }
                Pending::Callback(callback) => callback(result),
            }
        }
    }

    fn shutdown_transport(&self) {
        self.region.raise_interrupt();
        self.region.close();
        self.inbound.close();
        self.router.lock().clear_subscribers();
    }

    pub(crate) fn begin_capture(self: &Arc<Self>) -> CaptureGuard {
        let id = self.ids.capture();
        self.router.lock().begin_capture(id);
        CaptureGuard {
            core: Arc::clone(self),
            id,
            active: true,
        }
    }

    pub(crate) fn subscribe(
        &self,
        filter: impl Fn(&Message) -> bool + Send + Sync + 'static,
        callback: impl Fn(&Message) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.router
            .lock()
            .subscribe(Arc::new(filter), Arc::new(callback))
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.router.lock().unsubscribe(id)
    }
}

/// Ends its capture scope when dropped, whatever happened to the evaluation.
pub(crate) struct CaptureGuard {
    core: Arc<Core>,
    id: CaptureId,
    active: bool,
}

impl CaptureGuard {
    pub(crate) const fn id(&self) -> CaptureId {
        self.id
    }

    pub(crate) fn finish(mut self) -> CaptureBuffer {
        self.active = false;
        self.core
            .router
            .lock()
            .end_capture(self.id)
            .unwrap_or_default()
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        if self.active {
            self.core.router.lock().end_capture(self.id);
        }
    }
}

struct SessionInner {
    core: Arc<Core>,
    launcher: Mutex<Option<Launcher>>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
    pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let mut state = self.core.state.lock();
        if *state != SessionState::Destroyed {
            *state = SessionState::Destroyed;
            drop(state);
            self.core.shutdown_transport();
        }
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

/// Handle to one host/sandbox pair. Cheap to clone.
///
/// Proxies and shelters keep their session alive. The sandbox thread and
/// pump stop when [`close`](Self::close) is called or the last handle drops.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    #[must_use]
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// Session with default configuration and no host call support.
    ///
    /// # Errors
    /// Never fails with the default configuration.
    pub fn new<I, F>(factory: F) -> Result<Self>
    where
        I: Interpreter + 'static,
        F: FnOnce() -> Result<I, BoxError> + Send + 'static,
    {
        SessionBuilder::default().build(factory)
    }

    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.inner.core
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.core.state()
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.core.config
    }

    /// Start the sandbox thread and pump, and wait for the sandbox to answer.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// Returns [`Error::State`] unless the session is uninitialized, and a
    /// transport error if the sandbox fails to start.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn init(&self) -> Result<()> {
        let core = self.core();
        {
            let mut state = core.state.lock();
            if *state != SessionState::Uninitialized {
                return Err(Error::State {
                    state: state.clone(),
                });
            }
            *state = SessionState::Initializing;
        }

        let Some(launch) = self.inner.launcher.lock().take() else {
            return Err(Error::State {
                state: SessionState::Initializing,
            });
        };
        let worker = launch(core.link()).map_err(|e| {
            let err = TransportError::SandboxExited(format!("failed to spawn worker: {e}"));
            core.fail(err.clone());
            Error::Transport(err)
        })?;
        *self.inner.worker.lock() = Some(worker);
        *self.inner.pump.lock() = Some(tokio::spawn(pump::run(Arc::clone(core))));

        let (tx, rx) = oneshot::channel();
        core.send_unchecked(Command::Ping, None, Some(Pending::Reply(tx)))?;
        rx.await
            .map_err(|_| Error::Transport(TransportError::Closed))??;

        let mut state = core.state.lock();
        match &*state {
            SessionState::Initializing => {
                *state = SessionState::Ready;
                tracing::debug!(target: TRACE_TARGET_BRIDGE, "session ready");
                Ok(())
            }
            SessionState::Failed(e) => Err(Error::Transport(e.clone())),
            other => Err(Error::State {
                state: other.clone(),
            }),
        }
    }

    /// Shut the sandbox down and move to [`SessionState::Destroyed`].
    ///
    /// The sandbox gets a shutdown command and a moment to act on it; after
    /// that the region is closed under it, which fails whatever request it
    /// is blocked on. A sandbox spinning without ever reaching an
    /// interruption checkpoint cannot be stopped. Idempotent.
    ///
    /// # Errors
    /// Currently infallible; the signature leaves room for reporting worker
    /// failures.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn close(&self) -> Result<()> {
        let core = self.core();
        let previous = std::mem::replace(&mut *core.state.lock(), SessionState::Destroyed);
        match previous {
            SessionState::Destroyed => return Ok(()),
            SessionState::Uninitialized => {
                core.shutdown_transport();
                return Ok(());
            }
            _ => {}
        }

        core.region.raise_interrupt();
        if let Err(e) = core.send_unchecked(Command::Shutdown, None, None) {
            tracing::debug!(target: TRACE_TARGET_BRIDGE, error = %e, "shutdown not delivered");
        }

        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            let mut join = tokio::task::spawn_blocking(move || worker.join());
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut join).await.is_err() {
                tracing::debug!(target: TRACE_TARGET_BRIDGE, "sandbox slow to stop, closing region");
                core.region.close();
                let _ = join.await;
            }
        }

        let pump = self.inner.pump.lock().take();
        if let Some(pump) = pump {
            core.wake.notify_one();
            if tokio::time::timeout(SHUTDOWN_GRACE, pump).await.is_err() {
                tracing::warn!(target: TRACE_TARGET_BRIDGE, "pump did not stop");
            }
        }
        core.shutdown_transport();
        core.outbound.close();
        core.fail_pending(&TransportError::Closed);
        Ok(())
    }

    /// Ask the running evaluation to stop at its next checkpoint.
    pub fn interrupt(&self) {
        self.core().region.raise_interrupt();
        self.core().wake.notify_one();
    }

    /// Whether the sandbox still protects `handle`.
    ///
    /// Commands are processed in order, so releases caused by earlier
    /// purges are already applied.
    ///
    /// # Errors
    /// Fails if the session is not ready or the transport fails.
    pub async fn is_retained(&self, handle: Handle) -> Result<bool> {
        match self.core().request(Command::Retained { handle }, None).await? {
            Completion::Flag(retained) => Ok(retained),
            other => other.unexpected("flag").map_err(Error::from),
        }
    }

    /// Round-trip a no-op through the sandbox.
    ///
    /// # Errors
    /// Fails if the session is not ready or the transport fails.
    pub async fn sync(&self) -> Result<()> {
        self.core().request(Command::Ping, None).await.map(drop)
    }

    /// Take every queued message not routed elsewhere, oldest first.
    #[must_use]
    pub fn flush(&self) -> Vec<Message> {
        self.core().router.lock().flush()
    }

    /// Invoke `callback` for each arriving message matching `filter`.
    ///
    /// Callbacks run on the pump task in arrival order; they must not block.
    /// Captured output never reaches them.
    pub fn subscribe(
        &self,
        filter: impl Fn(&Message) -> bool + Send + Sync + 'static,
        callback: impl Fn(&Message) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.core().subscribe(filter, callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.core().unsubscribe(id)
    }

    /// Stream of arriving messages matching `filter`.
    ///
    /// Ends when the session closes or fails.
    pub fn messages(
        &self,
        filter: impl Fn(&Message) -> bool + Send + Sync + 'static,
    ) -> MessageStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(filter, move |message: &Message| {
            let _ = tx.send(message.clone());
        });
        MessageStream {
            inner: UnboundedReceiverStream::new(rx),
            core: Arc::downgrade(self.core()),
            subscription,
        }
    }

    /// The session-wide shelter. Never purged unless asked to.
    #[must_use]
    pub fn default_shelter(&self) -> Shelter {
        Shelter::attach(self.clone(), ShelterId::DEFAULT)
    }

    /// A new top-level shelter, purged when dropped.
    ///
    /// # Errors
    /// Currently infallible for top-level shelters.
    pub fn shelter(&self) -> Result<Shelter> {
        Shelter::create(self.clone(), None)
    }

    /// Remove `proxy` from its shelter, releasing its value if that was the
    /// last membership.
    ///
    /// # Errors
    /// Returns [`Error::Lifetime`] if the proxy was already purged.
    pub fn destroy(&self, proxy: Proxy) -> Result<()> {
        let mut registry = self.core().registry.lock();
        if !registry.is_live(proxy.id(), proxy.shelter()) {
            return Err(Error::Lifetime {
                handle: proxy.handle(),
            });
        }
        let released = registry.destroy(proxy.id(), proxy.shelter());
        drop(registry);
        self.core().release(released.into_iter().collect());
        Ok(())
    }
}

/// Messages delivered through a subscription. Unsubscribes when dropped.
pub struct MessageStream {
    inner: UnboundedReceiverStream<Message>,
    core: Weak<Core>,
    subscription: SubscriptionId,
}

impl Stream for MessageStream {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            core.unsubscribe(self.subscription);
        }
    }
}

/// Builder for [`Session`].
#[derive(Default)]
pub struct SessionBuilder {
    config: SessionConfig,
    host: Option<Arc<dyn Host>>,
}

impl SessionBuilder {
    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the configuration with a JSON document.
    ///
    /// # Errors
    /// Returns [`Error::Config`] if the document is invalid.
    pub fn config_json(mut self, json: &str) -> Result<Self> {
        self.config = SessionConfig::from_json(json)?;
        Ok(self)
    }

    #[must_use]
    pub const fn region_capacity(mut self, bytes: usize) -> Self {
        self.config.region_capacity = bytes;
        self
    }

    #[must_use]
    pub fn wait_slice(mut self, slice: Duration) -> Self {
        self.config.wait_slice_ms = duration_ms(slice);
        self
    }

    #[must_use]
    pub fn hostcall_timeout(mut self, timeout: Duration) -> Self {
        self.config.hostcall_timeout_ms = duration_ms(timeout);
        self
    }

    #[must_use]
    pub const fn max_queued_messages(mut self, limit: usize) -> Self {
        self.config.max_queued_messages = limit;
        self
    }

    #[must_use]
    pub fn worker_name(mut self, name: impl Into<String>) -> Self {
        self.config.worker_name = name.into();
        self
    }

    #[must_use]
    pub fn host(mut self, host: impl Host) -> Self {
        self.host = Some(Arc::new(host));
        self
    }

    /// Create an uninitialized session whose sandbox will run the
    /// interpreter built by `factory`.
    ///
    /// # Errors
    /// Returns [`Error::Config`] if the configuration is invalid.
    pub fn build<I, F>(self, factory: F) -> Result<Session>
    where
        I: Interpreter + 'static,
        F: FnOnce() -> Result<I, BoxError> + Send + 'static,
    {
        self.config.validate()?;
        let name = self.config.worker_name.clone();
        let launcher: Launcher = Box::new(move |link| spawn_worker(&name, factory, link));
        let core = Core::new(self.config, self.host.unwrap_or_else(NoopHost::shared));
        Ok(Session {
            inner: Arc::new(SessionInner {
                core: Arc::new(core),
                launcher: Mutex::new(Some(launcher)),
                worker: Mutex::new(None),
                pump: Mutex::new(None),
            }),
        })
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
