//! Shared wait region: one fixed-capacity slot the sandbox blocks on.
//!
//! The sandbox thread writes a request frame and parks until the host pump
//! claims it and writes a reply frame tagged with the same id. At most one
//! request is outstanding at a time. The slot also carries an interrupt flag
//! the host raises and the sandbox polls.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

use crate::{
    TRACE_TARGET_BRIDGE, cbor,
    error::TransportError,
    protocol::{Envelope, MessageId, Reply, Request},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    Requested(MessageId),
    Claimed(MessageId),
    Responded(MessageId),
}

impl SlotState {
    const fn pending(self) -> Option<MessageId> {
        match self {
            Self::Idle => None,
            Self::Requested(id) | Self::Claimed(id) | Self::Responded(id) => Some(id),
        }
    }
}

struct Slot {
    state: SlotState,
    buf: Box<[u8]>,
    len: usize,
}

impl Slot {
    fn write(&mut self, frame: &[u8]) {
        self.buf[..frame.len()].copy_from_slice(frame);
        self.len = frame.len();
    }

    fn frame(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

pub struct SharedRegion {
    slot: Mutex<Slot>,
    signal: Condvar,
    capacity: usize,
    wait_slice: Duration,
    interrupt: AtomicBool,
    closed: AtomicBool,
    host_wake: Arc<Notify>,
}

impl SharedRegion {
    /// Create a region whose slot holds frames of up to `capacity` bytes.
    ///
    /// `host_wake` is notified whenever a request lands in the slot.
    #[must_use]
    pub fn new(capacity: usize, wait_slice: Duration, host_wake: Arc<Notify>) -> Self {
        Self {
            slot: Mutex::new(Slot {
                state: SlotState::Idle,
                buf: vec![0; capacity].into_boxed_slice(),
                len: 0,
            }),
            signal: Condvar::new(),
            capacity,
            wait_slice,
            interrupt: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            host_wake,
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Sandbox side: publish `request` and block until its reply arrives.
    ///
    /// # Errors
    /// - [`TransportError::RequestOutstanding`] if another request holds the
    ///   slot. Returned immediately.
    /// - [`TransportError::PayloadTooLarge`] if the frame does not fit.
    /// - [`TransportError::Closed`] if the region is closed before or while
    ///   waiting.
    /// - [`TransportError::Desync`] if the reply is tagged with another id.
    pub fn write_request(
        &self,
        request: &Envelope<Request>,
    ) -> Result<Envelope<Reply>, TransportError> {
        let frame = cbor::encode_frame(request)?;
        if frame.len() > self.capacity {
            return Err(TransportError::PayloadTooLarge {
                len: frame.len(),
                capacity: self.capacity,
            });
        }

        let mut slot = self.slot.lock();
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if let Some(pending) = slot.state.pending() {
            return Err(TransportError::RequestOutstanding { pending });
        }
        slot.write(&frame);
        slot.state = SlotState::Requested(request.id);
        self.host_wake.notify_one();

        loop {
            if let SlotState::Responded(id) = slot.state {
                let reply = cbor::decode_frame::<Reply>(slot.frame());
                slot.state = SlotState::Idle;
                slot.len = 0;
                drop(slot);

                let reply = reply?;
                if id != request.id || reply.id != request.id {
                    return Err(TransportError::Desync {
                        expected: Some(request.id),
                        actual: reply.id,
                    });
                }
                return Ok(reply);
            }
            if self.is_closed() {
                slot.state = SlotState::Idle;
                return Err(TransportError::Closed);
            }
            self.signal.wait_for(&mut slot, self.wait_slice);
        }
    }

    /// Host side: claim a pending request, if any.
    ///
    /// # Errors
    /// Returns a transport error if the request frame cannot be decoded or
    /// is tagged with another id than the slot announced.
    pub fn host_poll(&self) -> Result<Option<Envelope<Request>>, TransportError> {
        let mut slot = self.slot.lock();
        let SlotState::Requested(id) = slot.state else {
            return Ok(None);
        };
        let request = cbor::decode_frame::<Request>(slot.frame())?;
        if request.id != id {
            return Err(TransportError::Desync {
                expected: Some(id),
                actual: request.id,
            });
        }
        slot.state = SlotState::Claimed(id);
        Ok(Some(request))
    }

    /// Host side: answer the claimed request and wake the sandbox.
    ///
    /// A reply too large for the slot is replaced by [`Reply::Error`] so the
    /// sandbox is never left waiting.
    ///
    /// # Errors
    /// Returns [`TransportError::Desync`] if no request with the reply's id
    /// is claimed, and [`TransportError::Closed`] after [`close`](Self::close).
    pub fn host_respond(&self, reply: &Envelope<Reply>) -> Result<(), TransportError> {
        let mut frame = cbor::encode_frame(reply)?;
        if frame.len() > self.capacity {
            tracing::warn!(
                target: TRACE_TARGET_BRIDGE,
                id = %reply.id,
                len = frame.len(),
                capacity = self.capacity,
                "reply exceeds region capacity, sending error instead"
            );
            let message = TransportError::PayloadTooLarge {
                len: frame.len(),
                capacity: self.capacity,
            }
            .to_string();
            frame = cbor::encode_frame(&Envelope::new(reply.id, Reply::Error { message }))?;
            if frame.len() > self.capacity {
                return Err(TransportError::PayloadTooLarge {
                    len: frame.len(),
                    capacity: self.capacity,
                });
            }
        }

        let mut slot = self.slot.lock();
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        match slot.state {
            SlotState::Claimed(id) if id == reply.id => {
                slot.write(&frame);
                slot.state = SlotState::Responded(id);
                drop(slot);
                self.signal.notify_all();
                Ok(())
            }
            state => Err(TransportError::Desync {
                expected: match state {
                    SlotState::Claimed(id) => Some(id),
                    _ => None,
                },
                actual: reply.id,
            }),
        }
    }

    /// Mark the region closed and release any waiting sandbox thread.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Taking the lock orders the store before a waiter's re-check.
        drop(self.slot.lock());
        self.signal.notify_all();
        self.host_wake.notify_one();
    }

    pub fn raise_interrupt(&self) {
        self.interrupt.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn interrupt_pending(&self) -> bool {
        self.interrupt.load(Ordering::Acquire)
    }

    /// Clear the interrupt flag, returning whether it was set.
    pub fn take_interrupt(&self) -> bool {
        self.interrupt.swap(false, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("capacity", &self.capacity)
            .field("state", &self.slot.lock().state)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
