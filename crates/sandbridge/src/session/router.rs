//! Host-side routing of sandbox notifications.
//!
//! A notification goes to the first of these that accepts it:
//! 1. the capture buffer named by its envelope (output and images only),
//! 2. every subscriber whose filter matches,
//! 3. the bounded output queue returned by `flush`.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::Arc,
};

use crate::{
    TRACE_TARGET_CONSOLE,
    protocol::{CaptureId, Image, Message, OutputRecord},
};

pub(crate) type Filter = Arc<dyn Fn(&Message) -> bool + Send + Sync>;
pub(crate) type Callback = Arc<dyn Fn(&Message) + Send + Sync>;

/// Identifies a subscription for [`Session::unsubscribe`](crate::Session::unsubscribe).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Subscriber {
    id: SubscriptionId,
    filter: Filter,
    callback: Callback,
}

#[derive(Debug, Default)]
pub(crate) struct CaptureBuffer {
    pub(crate) output: Vec<OutputRecord>,
    pub(crate) images: Vec<Image>,
}

/// Where a routed message ended up.
pub(crate) enum Route {
    Captured,
    /// Tagged with a capture scope that has already ended.
    Discarded,
    Notify(Vec<Callback>, Message),
    Queued,
}

pub(crate) struct Router {
    next_subscription: u64,
    subscribers: Vec<Subscriber>,
    captures: HashMap<CaptureId, CaptureBuffer>,
    queue: VecDeque<Message>,
    limit: usize,
    overflowed: bool,
}

impl Router {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            next_subscription: 1,
            subscribers: Vec::new(),
            captures: HashMap::new(),
            queue: VecDeque::new(),
            limit,
            overflowed: false,
        }
    }

    pub(crate) fn subscribe(&mut self, filter: Filter, callback: Callback) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscribers.push(Subscriber {
            id,
            filter,
            callback,
        });
        id
    }

    pub(crate) fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.id != id);
        self.subscribers.len() != before
    }

    pub(crate) fn clear_subscribers(&mut self) {
        self.subscribers.clear();
    }

    pub(crate) fn begin_capture(&mut self, id: CaptureId) {
        self.captures.insert(id, CaptureBuffer::default());
    }

    /// Stop capturing under `id`. Later messages tagged with it are dropped.
    pub(crate) fn end_capture(&mut self, id: CaptureId) -> Option<CaptureBuffer> {
        self.captures.remove(&id)
    }

    pub(crate) fn route(&mut self, capture: Option<CaptureId>, message: Message) -> Route {
        let message = match (capture, message) {
            (Some(capture), Message::Output(record)) => match self.captures.get_mut(&capture) {
                Some(buffer) => {
                    buffer.output.push(record);
                    return Route::Captured;
                }
                None => return Route::Discarded,
            },
            (Some(capture), Message::Canvas(image)) => match self.captures.get_mut(&capture) {
                Some(buffer) => {
                    buffer.images.push(image);
                    return Route::Captured;
                }
                None => return Route::Discarded,
            },
            (_, message) => message,
        };

        let callbacks: Vec<Callback> = self
            .subscribers
            .iter()
            .filter(|s| (s.filter)(&message))
            .map(|s| Arc::clone(&s.callback))
            .collect();
        if !callbacks.is_empty() {
            return Route::Notify(callbacks, message);
        }

        if let Message::Output(OutputRecord { stream, line }) = &message {
            tracing::trace!(target: TRACE_TARGET_CONSOLE, stream = stream.as_str(), %line, "queued output");
        }
        self.queue.push_back(message);
        if self.queue.len() > self.limit {
            self.queue.pop_front();
            if !self.overflowed {
                tracing::warn!(
                    target: TRACE_TARGET_CONSOLE,
                    limit = self.limit,
                    "output queue full, dropping oldest messages"
                );
                self.overflowed = true;
            }
        }
        Route::Queued
    }

    pub(crate) fn flush(&mut self) -> Vec<Message> {
        self.overflowed = false;
        self.queue.drain(..).collect()
    }
}
