use std::{
    panic::AssertUnwindSafe,
    sync::Arc,
};

use futures::FutureExt;
use tracing::Instrument;

use super::{
    Core, SessionState,
    router::{Callback, Route},
};
use crate::{
    TRACE_TARGET_BRIDGE,
    error::{Error, TransportError},
    protocol::{Envelope, Message, MessageId, Outcome, Reply, Request},
    value::Value,
};

/// Work collected under the router lock and performed after releasing it,
/// in arrival order.
enum Delivery {
    Complete(MessageId, Outcome),
    Notify(Vec<Callback>, Message),
}

#[derive(Clone, Copy)]
struct ClaimedRead {
    id: MessageId,
    input: bool,
}

/// Host pump: the single consumer of everything the sandbox sends.
///
/// Runs until the sandbox reports it has closed or the transport fails.
pub(crate) async fn run(core: Arc<Core>) {
    let span = tracing::debug_span!(target: TRACE_TARGET_BRIDGE, "host_pump");
    async move {
        let mut pump = Pump { core, claimed: None };
        loop {
            match pump.step().await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    pump.core.fail(e);
                    break;
                }
            }
            let _ = tokio::time::timeout(pump.core.config.wait_slice(), pump.core.wake.notified())
                .await;
        }
        tracing::debug!(target: TRACE_TARGET_BRIDGE, "pump stopped");
    }
    .instrument(span)
    .await;
}

struct Pump {
    core: Arc<Core>,
    /// A `read` the sandbox is blocked on, waiting for the next command.
    claimed: Option<ClaimedRead>,
}

impl Pump {
    /// One pass over both channels. Returns `false` once the sandbox closed.
    async fn step(&mut self) -> Result<bool, TransportError> {
        if !self.route_outbound()? {
            return Ok(false);
        }

        let core = &self.core;
        if self.claimed.is_none() {
            if let Some(request) = core.region.host_poll()? {
                match request.body {
                    Request::Read { input } => {
                        if !input {
                            // The sandbox is idle; an interrupt raised now has nothing to stop.
                            core.region.take_interrupt();
                        }
                        self.claimed = Some(ClaimedRead {
                            id: request.id,
                            input,
                        });
                    }
                    Request::HostCall { call_type, payload } => {
                        let reply = self.host_call(&call_type, payload).await;
                        self.core
                            .region
                            .host_respond(&Envelope::new(request.id, reply))?;
                    }
                }
            }
        }

        if let Some(read) = self.claimed {
            let core = &self.core;
            if read.input && core.region.take_interrupt() {
                core.region
                    .host_respond(&Envelope::new(read.id, Reply::Interrupt))?;
                self.claimed = None;
            } else if let Some(command) = core.inbound.pop() {
                if !read.input {
                    // Raised while the sandbox sat idle; it must not hit this command.
                    core.region.take_interrupt();
                }
                core.region
                    .host_respond(&Envelope::new(read.id, Reply::Command(command?)))?;
                self.claimed = None;
            }
        }
        Ok(true)
    }

    /// Route every queued sandbox message. Returns `false` on `closed`.
    fn route_outbound(&self) -> Result<bool, TransportError> {
        let core = &self.core;
        let mut deliveries = Vec::new();
        let mut closed = None;
        for frame in core.outbound.drain() {
            let Envelope { capture, body, .. } = frame?;
            match body {
                Message::Response { to, outcome } => {
                    deliveries.push(Delivery::Complete(to, outcome));
                }
                Message::Closed { reason } => closed = Some(reason),
                message => {
                    let route = core.router.lock().route(capture, message);
                    if let Route::Notify(callbacks, message) = route {
                        deliveries.push(Delivery::Notify(callbacks, message));
                    }
                }
            }
        }

        let mut fault = None;
        for delivery in deliveries {
            match delivery {
                Delivery::Complete(to, outcome) => {
                    let result = outcome.into_result().map_err(Error::from);
                    if let Err(Error::Transport(e)) = &result {
                        fault.get_or_insert_with(|| e.clone());
                    }
                    core.complete(to, result);
                }
                Delivery::Notify(callbacks, message) => {
                    for callback in &callbacks {
                        notify(callback, &message);
                    }
                }
            }
        }

        if let Some(e) = fault {
            return Err(e);
        }
        match closed {
            None => Ok(true),
            Some(_) if core.state() == SessionState::Destroyed => {
                core.fail(TransportError::Closed);
                Ok(false)
            }
            Some(reason) => Err(TransportError::SandboxExited(
                reason.unwrap_or_else(|| "sandbox stopped unexpectedly".to_string()),
            )),
        }
    }

    /// Answer a host call. Every outcome, including a panic or a timeout in
    /// the embedder, becomes a reply.
    #[tracing::instrument(level = "debug", skip(self, payload))]
    async fn host_call(&self, call_type: &str, payload: Value) -> Reply {
        let call = AssertUnwindSafe(self.core.host.hostcall(call_type, payload)).catch_unwind();
        match tokio::time::timeout(self.core.config.hostcall_timeout(), call).await {
            Ok(Ok(Ok(value))) => Reply::HostCall(value),
            Ok(Ok(Err(e))) => {
                tracing::debug!(target: TRACE_TARGET_BRIDGE, error = %e, "host call failed");
                Reply::Error {
                    message: e.to_string(),
                }
            }
            Ok(Err(_)) => {
                tracing::error!(target: TRACE_TARGET_BRIDGE, call_type, "host call panicked");
                Reply::Error {
                    message: format!("host call {call_type} panicked"),
                }
            }
            Err(_) => {
                tracing::warn!(target: TRACE_TARGET_BRIDGE, call_type, "host call timed out");
                Reply::Error {
                    message: format!("host call {call_type} timed out"),
                }
            }
        }
    }
}

/// Run a subscriber callback, keeping the pump alive if it panics.
fn notify(callback: &Callback, message: &Message) {
    if std::panic::catch_unwind(AssertUnwindSafe(|| callback(message))).is_err() {
        tracing::error!(target: TRACE_TARGET_BRIDGE, kind = message.kind(), "subscriber panicked");
    }
}
