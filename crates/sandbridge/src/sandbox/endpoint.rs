use std::{cell::RefCell, collections::VecDeque, sync::Arc};

use crate::{
    error::TransportError,
    protocol::{
        CaptureId, Command, Completion, Envelope, IdAllocator, Image, Message, MessageId,
        Outcome, OutputRecord, PackageStatus, Reply, Request, Stream,
    },
    queue::AsyncChannel,
    region::SharedRegion,
    sandbox::Condition,
    value::Value,
};

/// Sandbox half of the transport, as handed to the worker thread.
#[derive(Clone)]
pub(crate) struct SandboxLink {
    pub(crate) region: Arc<SharedRegion>,
    pub(crate) outbound: Arc<AsyncChannel<Message>>,
}

/// The worker's view of the link plus its capture scope stack.
pub(crate) struct SandboxEndpoint {
    link: SandboxLink,
    ids: IdAllocator,
    captures: RefCell<Vec<CaptureId>>,
}

impl SandboxEndpoint {
    pub(crate) fn new(link: SandboxLink) -> Self {
        Self {
            link,
            ids: IdAllocator::sandbox(),
            captures: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn region(&self) -> &SharedRegion {
        &self.link.region
    }

    /// Innermost active capture.
    pub(crate) fn capture(&self) -> Option<CaptureId> {
        self.captures.borrow().last().copied()
    }

    /// Tag everything posted until the guard drops with `capture`.
    ///
    /// `None` keeps the enclosing scope.
    pub(crate) fn enter_capture(&self, capture: Option<CaptureId>) -> CaptureScope<'_> {
        let mut captures = self.captures.borrow_mut();
        let depth = captures.len();
        captures.extend(capture);
        CaptureScope {
            endpoint: self,
            depth,
        }
    }

    pub(crate) fn post(&self, body: Message) -> Result<(), TransportError> {
        let envelope = Envelope::new(self.ids.message(), body).with_capture(self.capture());
        self.link.outbound.post(&envelope)
    }

    pub(crate) fn respond(&self, to: MessageId, outcome: Outcome) -> Result<(), TransportError> {
        self.post(Message::Response { to, outcome })
    }

    /// Issue a sync request and block for its reply.
    pub(crate) fn request(&self, body: Request) -> Result<Envelope<Reply>, TransportError> {
        let envelope = Envelope::new(self.ids.message(), body).with_capture(self.capture());
        self.link.region.write_request(&envelope)
    }
}

/// Restores the capture stack to its depth at entry.
pub(crate) struct CaptureScope<'a> {
    endpoint: &'a SandboxEndpoint,
    depth: usize,
}

impl Drop for CaptureScope<'_> {
    fn drop(&mut self) {
        self.endpoint.captures.borrow_mut().truncate(self.depth);
    }
}

/// I/O available to an interpreter while it runs a command.
///
/// Output is split into lines and posted in order. Reads and host calls
/// block the sandbox thread on the shared region until the host answers.
pub struct Io<'a> {
    endpoint: &'a SandboxEndpoint,
    deferred: &'a mut VecDeque<Envelope<Command>>,
    quiet: bool,
}

impl<'a> Io<'a> {
    pub(crate) const fn new(
        endpoint: &'a SandboxEndpoint,
        deferred: &'a mut VecDeque<Envelope<Command>>,
    ) -> Self {
        Self {
            endpoint,
            deferred,
            quiet: false,
        }
    }

    #[must_use]
    pub(crate) const fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// # Errors
    /// Fails only if the outbound channel is closed.
    pub fn stdout(&mut self, text: &str) -> Result<(), Condition> {
        self.write(Stream::Stdout, text)
    }

    /// # Errors
    /// Fails only if the outbound channel is closed.
    pub fn stderr(&mut self, text: &str) -> Result<(), Condition> {
        self.write(Stream::Stderr, text)
    }

    fn write(&self, stream: Stream, text: &str) -> Result<(), Condition> {
        for line in text.lines() {
            self.endpoint.post(Message::Output(OutputRecord {
                stream,
                line: line.to_string(),
            }))?;
        }
        Ok(())
    }

    /// # Errors
    /// Fails only if the outbound channel is closed.
    pub fn canvas(&mut self, image: Image) -> Result<(), Condition> {
        Ok(self.endpoint.post(Message::Canvas(image))?)
    }

    /// Report package installation progress, unless running quietly.
    ///
    /// # Errors
    /// Fails only if the outbound channel is closed.
    pub fn progress(&mut self, package: &str, status: PackageStatus) -> Result<(), Condition> {
        if self.quiet {
            return Ok(());
        }
        Ok(self.endpoint.post(Message::PackageProgress {
            package: package.to_string(),
            status,
        })?)
    }

    /// Show `prompt` and block until the host supplies a line of input.
    ///
    /// Commands other than console input that arrive meanwhile are held and
    /// run after the current command completes.
    ///
    /// # Errors
    /// Returns [`Condition::Interrupted`] if the host interrupts the wait or
    /// shuts the session down, and [`Condition::Transport`] if the channel
    /// fails.
    pub fn read_line(&mut self, prompt: &str) -> Result<String, Condition> {
        self.endpoint.post(Message::Prompt {
            text: prompt.to_string(),
        })?;
        loop {
            let reply = self.endpoint.request(Request::Read { input: true })?;
            let command = match reply.body {
                Reply::Command(command) => command,
                Reply::Interrupt => return Err(Condition::Interrupted),
                Reply::Error { message } => {
                    return Err(TransportError::Malformed(message).into());
                }
                Reply::HostCall(_) => {
                    return Err(
                        TransportError::Malformed("host call reply to a read".into()).into(),
                    );
                }
            };
            match command.body {
                Command::Stdin { line } => {
                    self.endpoint
                        .respond(command.id, Outcome::Success(Completion::Unit))?;
                    return Ok(line);
                }
                Command::Shutdown => {
                    self.deferred.push_back(command);
                    return Err(Condition::Interrupted);
                }
                _ => self.deferred.push_back(command),
            }
        }
    }

    /// Ask the embedder to perform `call_type` and block for the result.
    ///
    /// # Errors
    /// Returns [`Condition::Error`] carrying the host's message if the host
    /// call fails or times out.
    pub fn host_call(&mut self, call_type: &str, payload: Value) -> Result<Value, Condition> {
        let reply = self
            .endpoint
            .request(Request::HostCall {
                call_type: call_type.to_string(),
                payload,
            })
            .map_err(|e| match e {
                TransportError::PayloadTooLarge { .. } => Condition::Error(e.to_string()),
                e => Condition::Transport(e),
            })?;
        match reply.body {
            Reply::HostCall(value) => Ok(value),
            Reply::Error { message } => Err(Condition::Error(message)),
            Reply::Interrupt => Err(Condition::Interrupted),
            Reply::Command(_) => {
                Err(TransportError::Malformed("command reply to a host call".into()).into())
            }
        }
    }

    /// Interruption checkpoint for long-running interpreter work.
    ///
    /// # Errors
    /// Returns [`Condition::Interrupted`] once per host interrupt.
    pub fn check_interrupt(&mut self) -> Result<(), Condition> {
        if self.endpoint.region().take_interrupt() {
            return Err(Condition::Interrupted);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::Notify;

    use super::*;

    fn endpoint() -> (SandboxEndpoint, Arc<AsyncChannel<Message>>) {
        let wake = Arc::new(Notify::new());
        let outbound = Arc::new(AsyncChannel::new(Arc::clone(&wake)));
        let link = SandboxLink {
            region: Arc::new(SharedRegion::new(4096, Duration::from_millis(5), wake)),
            outbound: Arc::clone(&outbound),
        };
        (SandboxEndpoint::new(link), outbound)
    }

    #[test]
    fn nested_capture_scopes_restore_outer_tag() {
        let (endpoint, outbound) = endpoint();
        let mut deferred = VecDeque::new();
        let outer = CaptureId::new(100);
        let inner = CaptureId::new(200);
        {
            let _outer = endpoint.enter_capture(Some(outer));
            Io::new(&endpoint, &mut deferred).stdout("a").unwrap();
            {
                let _inner = endpoint.enter_capture(Some(inner));
                Io::new(&endpoint, &mut deferred).stdout("b").unwrap();
            }
            {
                let _same = endpoint.enter_capture(None);
                Io::new(&endpoint, &mut deferred).stdout("c").unwrap();
            }
        }
        Io::new(&endpoint, &mut deferred).stdout("d").unwrap();

        let tags: Vec<_> = outbound
            .drain()
            .map(|envelope| envelope.unwrap().capture)
            .collect();
        assert_eq!(tags, [Some(outer), Some(inner), Some(outer), None]);
    }

    #[test]
    fn multi_line_output_becomes_one_message_per_line() {
        let (endpoint, outbound) = endpoint();
        let mut deferred = VecDeque::new();
        Io::new(&endpoint, &mut deferred)
            .stderr("first\nsecond\n")
            .unwrap();
        let lines: Vec<_> = outbound
            .drain()
            .map(|envelope| match envelope.unwrap().body {
                Message::Output(OutputRecord { stream, line }) => (stream, line),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(
            lines,
            [
                (Stream::Stderr, "first".to_string()),
                (Stream::Stderr, "second".to_string())
            ]
        );
    }

    #[test]
    fn quiet_io_suppresses_progress() {
        let (endpoint, outbound) = endpoint();
        let mut deferred = VecDeque::new();
        Io::new(&endpoint, &mut deferred)
            .quiet(true)
            .progress("pkg", PackageStatus::Installed)
            .unwrap();
        assert!(outbound.is_empty());
    }

    #[test]
    fn interrupt_is_observed_once() {
        let (endpoint, _outbound) = endpoint();
        let mut deferred = VecDeque::new();
        let mut io = Io::new(&endpoint, &mut deferred);
        io.check_interrupt().unwrap();
        endpoint.region().raise_interrupt();
        assert_eq!(io.check_interrupt(), Err(Condition::Interrupted));
        io.check_interrupt().unwrap();
    }
}
