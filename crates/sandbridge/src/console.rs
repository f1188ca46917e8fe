//! Console bridge: drive the interpreter's read-eval-print loop from host
//! callbacks.
//!
//! The sandbox prompts, then blocks on the sync channel waiting for a line.
//! The console hands the prompt to the host, and forwards each line given to
//! [`Console::stdin`] as the answer. Lines given while no prompt is
//! outstanding are held and forwarded one per prompt.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;

use crate::{
    TRACE_TARGET_CONSOLE,
    error::{Error, Result},
    protocol::{Command, Completion, Image, Message, OutputRecord, Stream},
    session::{Core, Pending, Session, SubscriptionId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleState {
    Idle,
    /// A prompt was shown and no line has been sent for it yet.
    AwaitingInput,
    Evaluating,
}

type TextCallback = Arc<dyn Fn(&str) + Send + Sync>;
type ImageCallback = Arc<dyn Fn(&Image) + Send + Sync>;

/// Host callbacks. Called on the session pump in arrival order.
#[derive(Clone)]
pub struct ConsoleCallbacks {
    pub stdout: TextCallback,
    pub stderr: TextCallback,
    pub prompt: TextCallback,
    pub canvas: Option<ImageCallback>,
}

impl ConsoleCallbacks {
    pub fn new(
        stdout: impl Fn(&str) + Send + Sync + 'static,
        stderr: impl Fn(&str) + Send + Sync + 'static,
        prompt: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        Self {
            stdout: Arc::new(stdout),
            stderr: Arc::new(stderr),
            prompt: Arc::new(prompt),
            canvas: None,
        }
    }

    #[must_use]
    pub fn canvas(mut self, canvas: impl Fn(&Image) + Send + Sync + 'static) -> Self {
        self.canvas = Some(Arc::new(canvas));
        self
    }
}

impl fmt::Debug for ConsoleCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsoleCallbacks")
            .field("canvas", &self.canvas.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct Shared {
    state: ConsoleState,
    held: VecDeque<String>,
}

pub struct Console {
    session: Session,
    callbacks: ConsoleCallbacks,
    shared: Arc<Mutex<Shared>>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl Console {
    #[must_use]
    pub fn new(session: Session, callbacks: ConsoleCallbacks) -> Self {
        Self {
            session,
            callbacks,
            shared: Arc::new(Mutex::new(Shared {
                state: ConsoleState::Idle,
                held: VecDeque::new(),
            })),
            subscription: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn state(&self) -> ConsoleState {
        self.shared.lock().state
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.subscription.lock().is_some()
    }

    /// Start routing console traffic to the callbacks and put the sandbox
    /// into console mode. Calling it again has no effect.
    ///
    /// # Errors
    /// Fails if the session is not ready.
    pub fn run(&self) -> Result<()> {
        let mut subscription = self.subscription.lock();
        if subscription.is_some() {
            return Ok(());
        }
        self.session.core().ensure_ready()?;

        let core = Arc::downgrade(self.session.core());
        let shared = Arc::clone(&self.shared);
        let callbacks = self.callbacks.clone();
        let id = self.session.subscribe(
            |message: &Message| {
                matches!(
                    message,
                    Message::Output(_) | Message::Prompt { .. } | Message::Canvas(_)
                )
            },
            move |message: &Message| on_message(&core, &shared, &callbacks, message),
        );
        if let Err(e) = self.session.core().send(Command::StartRepl, None, None) {
            self.session.unsubscribe(id);
            return Err(e);
        }
        *subscription = Some(id);
        tracing::debug!(target: TRACE_TARGET_CONSOLE, "console running");
        Ok(())
    }

    /// Supply console input. Text with several lines is split and each line
    /// answers one prompt.
    ///
    /// # Errors
    /// Returns [`Error::State`] if the console is not running, and a
    /// transport error if the session has failed.
    pub fn stdin(&self, text: &str) -> Result<()> {
        if !self.is_running() {
            return Err(Error::State {
                state: self.session.state(),
            });
        }
        self.session.core().ensure_ready()?;

        let text = text.strip_suffix('\n').unwrap_or(text);
        for line in text.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line).to_string();
            let forward_now = {
                let mut shared = self.shared.lock();
                if shared.state == ConsoleState::AwaitingInput && shared.held.is_empty() {
                    shared.state = ConsoleState::Evaluating;
                    true
                } else {
                    shared.held.push_back(line.clone());
                    false
                }
            };
            if forward_now {
                forward(self.session.core(), &self.shared, line)?;
            }
        }
        Ok(())
    }

    /// Interrupt the running line and drop held input.
    pub fn interrupt(&self) {
        self.shared.lock().held.clear();
        self.session.interrupt();
    }

    /// Stop delivering to the callbacks. The sandbox stays in console mode.
    pub fn stop(&self) {
        if let Some(id) = self.subscription.lock().take() {
            self.session.unsubscribe(id);
            tracing::debug!(target: TRACE_TARGET_CONSOLE, "console stopped");
        }
    }
}

impl fmt::Debug for Console {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Console")
            .field("state", &self.state())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        self.stop();
    }
}

fn on_message(
    core: &Weak<Core>,
    shared: &Arc<Mutex<Shared>>,
    callbacks: &ConsoleCallbacks,
    message: &Message,
) {
    match message {
        Message::Output(OutputRecord { stream, line }) => match stream {
            Stream::Stdout => (callbacks.stdout)(line),
            Stream::Stderr => (callbacks.stderr)(line),
        },
        Message::Canvas(image) => {
            if let Some(canvas) = &callbacks.canvas {
                canvas(image);
            }
        }
        Message::Prompt { text } => {
            shared.lock().state = ConsoleState::AwaitingInput;
            (callbacks.prompt)(text);

            let held = {
                let mut shared = shared.lock();
                let line = shared.held.pop_front();
                if line.is_some() {
                    shared.state = ConsoleState::Evaluating;
                }
                line
            };
            if let (Some(line), Some(core)) = (held, core.upgrade()) {
                if let Err(e) = forward(&core, shared, line) {
                    tracing::warn!(target: TRACE_TARGET_CONSOLE, error = %e, "held input not delivered");
                }
            }
        }
        _ => {}
    }
}

/// Send one line; the console returns to idle once the sandbox is done
/// with it.
fn forward(core: &Core, shared: &Arc<Mutex<Shared>>, line: String) -> Result<()> {
    tracing::trace!(target: TRACE_TARGET_CONSOLE, %line, "stdin");
    let shared = Arc::clone(shared);
    let done = Box::new(move |result: Result<Completion>| {
        if let Err(e) = result {
            tracing::debug!(target: TRACE_TARGET_CONSOLE, error = %e, "console line failed");
        }
        let mut shared = shared.lock();
        if shared.state == ConsoleState::Evaluating {
            shared.state = ConsoleState::Idle;
        }
    });
    core.send(Command::Stdin { line }, None, Some(Pending::Callback(done)))
        .map(drop)
}
