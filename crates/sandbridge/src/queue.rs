//! Async channel: an ordered, non-blocking queue of encoded frames.

use std::{
    collections::VecDeque,
    marker::PhantomData,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::Notify;

use crate::{cbor, error::TransportError, protocol::Envelope};

/// FIFO of envelopes of one body type, one per direction.
///
/// Frames are encoded on [`post`](Self::post) and decoded on
/// [`drain`](Self::drain), so both ends see exactly what crossed the
/// boundary. Posting never blocks.
pub struct AsyncChannel<T> {
    frames: Mutex<VecDeque<Bytes>>,
    wake: Arc<Notify>,
    closed: AtomicBool,
    _body: PhantomData<fn() -> T>,
}

impl<T> AsyncChannel<T>
where
    T: Serialize + DeserializeOwned,
{
    /// `wake` is notified after every post.
    #[must_use]
    pub fn new(wake: Arc<Notify>) -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            wake,
            closed: AtomicBool::new(false),
            _body: PhantomData,
        }
    }

    /// Append an envelope.
    ///
    /// # Errors
    /// Returns [`TransportError::Closed`] once the channel is closed and
    /// [`TransportError::Malformed`] if the envelope cannot be encoded.
    pub fn post(&self, envelope: &Envelope<T>) -> Result<(), TransportError> {
        let frame = cbor::encode_frame(envelope)?;
        self.post_frame(frame)
    }

    /// Append an already encoded frame.
    ///
    /// # Errors
    /// Returns [`TransportError::Closed`] once the channel is closed.
    pub fn post_frame(&self, frame: Bytes) -> Result<(), TransportError> {
        let mut frames = self.frames.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        frames.push_back(frame);
        drop(frames);
        self.wake.notify_one();
        Ok(())
    }

    /// Take every queued envelope in post order.
    ///
    /// The batch is fixed when called; envelopes posted while it is being
    /// consumed wait for the next drain.
    pub fn drain(&self) -> impl Iterator<Item = Result<Envelope<T>, TransportError>> + use<T> {
        let batch = std::mem::take(&mut *self.frames.lock());
        batch.into_iter().map(|frame| cbor::decode_frame(&frame))
    }

    /// Take the oldest queued envelope.
    pub fn pop(&self) -> Option<Result<Envelope<T>, TransportError>> {
        let frame = self.frames.lock().pop_front()?;
        Some(cbor::decode_frame(&frame))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// Refuse further posts. Frames already queued can still be drained.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl<T> std::fmt::Debug for AsyncChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncChannel")
            .field("queued", &self.frames.lock().len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
