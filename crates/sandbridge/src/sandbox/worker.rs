use std::{
    any::Any,
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    thread::JoinHandle,
};

use smallvec::SmallVec;

use super::{
    Argument, Condition, HandleTable, Interpreter,
    endpoint::{Io, SandboxEndpoint, SandboxLink},
};
use crate::{
    TRACE_TARGET_BRIDGE,
    error::TransportError,
    host::BoxError,
    protocol::{
        Arg, ArgValue, Binding, Command, Completion, Envelope, Failure, FailureKind, Handle,
        Message, Outcome, Reply, Request, ResultMode,
    },
};

/// Start the sandbox thread.
///
/// The interpreter is constructed on the new thread. Whatever ends the
/// thread, a `closed` message is posted last.
pub(crate) fn spawn_worker<I, F>(
    name: &str,
    factory: F,
    link: SandboxLink,
) -> std::io::Result<JoinHandle<()>>
where
    I: Interpreter + 'static,
    F: FnOnce() -> Result<I, BoxError> + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let _span = tracing::debug_span!(target: TRACE_TARGET_BRIDGE, "sandbox_worker").entered();
            let endpoint = SandboxEndpoint::new(link);
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                let interpreter =
                    factory().map_err(|e| format!("interpreter failed to start: {e}"))?;
                Worker::new(interpreter, &endpoint)
                    .run()
                    .map_err(|e| e.to_string())
            }));
            let reason = match result {
                Ok(Ok(())) => None,
                Ok(Err(reason)) => Some(reason),
                Err(payload) => Some(format!("panic: {}", panic_message(payload.as_ref()))),
            };
            match &reason {
                None => tracing::debug!(target: TRACE_TARGET_BRIDGE, "sandbox worker stopped"),
                Some(reason) => {
                    tracing::warn!(target: TRACE_TARGET_BRIDGE, %reason, "sandbox worker exited");
                }
            }
            if let Err(e) = endpoint.post(Message::Closed { reason }) {
                tracing::debug!(target: TRACE_TARGET_BRIDGE, error = %e, "host gone before close notice");
            }
        })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Why a command failed on the sandbox side.
enum Fault {
    Condition(Condition),
    /// The command named a handle that was already released.
    UnknownHandle(Handle),
}

impl From<Condition> for Fault {
    fn from(value: Condition) -> Self {
        Self::Condition(value)
    }
}

impl From<TransportError> for Fault {
    fn from(value: TransportError) -> Self {
        Self::Condition(Condition::Transport(value))
    }
}

enum Flow {
    Continue,
    Exit,
}

struct Worker<'e, I: Interpreter> {
    interpreter: I,
    endpoint: &'e SandboxEndpoint,
    handles: HandleTable<I::Value>,
    /// Commands received while the interpreter was waiting for input.
    deferred: VecDeque<Envelope<Command>>,
    repl: bool,
    prompted: bool,
}

impl<'e, I: Interpreter> Worker<'e, I> {
    fn new(interpreter: I, endpoint: &'e SandboxEndpoint) -> Self {
        Self {
            interpreter,
            endpoint,
            handles: HandleTable::new(),
            deferred: VecDeque::new(),
            repl: false,
            prompted: false,
        }
    }

    fn run(mut self) -> Result<(), TransportError> {
        loop {
            let command = match self.deferred.pop_front() {
                Some(command) => command,
                None => match self.next_command()? {
                    Some(command) => command,
                    None => continue,
                },
            };
            if let Flow::Exit = self.dispatch(command)? {
                return Ok(());
            }
        }
    }

    fn next_command(&mut self) -> Result<Option<Envelope<Command>>, TransportError> {
        if self.repl && !self.prompted {
            self.endpoint.post(Message::Prompt {
                text: self.interpreter.prompt().to_string(),
            })?;
            self.prompted = true;
        }
        let reply = self.endpoint.request(Request::Read { input: self.repl })?;
        match reply.body {
            Reply::Command(command) => Ok(Some(command)),
            Reply::Interrupt => {
                self.prompted = false;
                Ok(None)
            }
            Reply::Error { message } => Err(TransportError::Malformed(message)),
            Reply::HostCall(_) => Err(TransportError::Malformed(
                "host call reply to a read".to_string(),
            )),
        }
    }

    fn dispatch(&mut self, envelope: Envelope<Command>) -> Result<Flow, TransportError> {
        let Envelope {
            id, capture, body, ..
        } = envelope;
        let endpoint = self.endpoint;
        let _scope = endpoint.enter_capture(capture);

        let result = match body {
            Command::Eval { code, env, result } => self.eval(&code, env, result),
            Command::Call {
                function,
                args,
                result,
            } => self.call(function, args, result),
            Command::Bind { name, value } => self.bind(&name, value),
            Command::Convert { handle, result } => self
                .handles
                .get(handle)
                .cloned()
                .ok_or_else(|| Fault::UnknownHandle(handle))
                .and_then(|value| self.complete(value, result)),
            Command::Stdin { line } => {
                self.prompted = false;
                self.console_line(&line)
            }
            Command::Release { handles } => {
                for handle in handles {
                    self.handles.release(handle);
                }
                return Ok(Flow::Continue);
            }
            Command::Retained { handle } => Ok(Completion::Flag(self.handles.contains(handle))),
            Command::InstallPackages { names, quiet } => {
                let mut io = Io::new(self.endpoint, &mut self.deferred).quiet(quiet);
                self.interpreter
                    .install_packages(&names, &mut io)
                    .map(|()| Completion::Unit)
                    .map_err(Fault::from)
            }
            Command::StartRepl => {
                self.repl = true;
                self.prompted = false;
                return Ok(Flow::Continue);
            }
            Command::Ping => Ok(Completion::Unit),
            Command::Shutdown => return Ok(Flow::Exit),
        };

        let outcome = match result {
            Ok(completion) => Outcome::Success(completion),
            Err(Fault::Condition(Condition::Error(message))) => Outcome::Failure(Failure {
                kind: FailureKind::Evaluation,
                message,
            }),
            Err(Fault::Condition(Condition::Interrupted)) => Outcome::Failure(Failure {
                kind: FailureKind::Interrupted,
                message: "interrupted".to_string(),
            }),
            Err(Fault::Condition(Condition::Transport(e))) => return Err(e),
            Err(Fault::UnknownHandle(handle)) => Outcome::Failure(Failure {
                kind: FailureKind::UnknownHandle { handle },
                message: format!("unknown handle {handle}"),
            }),
        };
        endpoint.respond(id, outcome)?;
        Ok(Flow::Continue)
    }

    fn resolve(&mut self, value: ArgValue) -> Result<I::Value, Fault> {
        match value {
            ArgValue::Value(value) => Ok(self.interpreter.from_wire(&value)?),
            ArgValue::Handle(handle) => self
                .handles
                .get(handle)
                .cloned()
                .ok_or_else(|| Fault::UnknownHandle(handle)),
        }
    }

    fn eval(
        &mut self,
        code: &str,
        env: Vec<Binding>,
        mode: ResultMode,
    ) -> Result<Completion, Fault> {
        let mut bindings = Vec::with_capacity(env.len());
        for Binding { name, value } in env {
            bindings.push((name, self.resolve(value)?));
        }
        let mut io = Io::new(self.endpoint, &mut self.deferred);
        let value = self.interpreter.eval(code, &bindings, &mut io)?;
        self.complete(value, mode)
    }

    fn call(
        &mut self,
        function: Handle,
        args: Vec<Arg>,
        mode: ResultMode,
    ) -> Result<Completion, Fault> {
        let function = self
            .handles
            .get(function)
            .cloned()
            .ok_or_else(|| Fault::UnknownHandle(function))?;
        let mut arguments = SmallVec::<[Argument<I::Value>; 4]>::with_capacity(args.len());
        for arg in args {
            let (name, value) = match arg {
                Arg::Positional(value) => (None, value),
                Arg::Named(name, value) => (Some(name), value),
            };
            arguments.push(Argument {
                name,
                value: self.resolve(value)?,
            });
        }
        let mut io = Io::new(self.endpoint, &mut self.deferred);
        let value = self.interpreter.call(&function, &arguments, &mut io)?;
        self.complete(value, mode)
    }

    fn bind(&mut self, name: &str, value: ArgValue) -> Result<Completion, Fault> {
        let value = self.resolve(value)?;
        self.interpreter.bind(name, value)?;
        Ok(Completion::Unit)
    }

    fn console_line(&mut self, line: &str) -> Result<Completion, Fault> {
        let mut io = Io::new(self.endpoint, &mut self.deferred);
        match self.interpreter.eval_console(line, &mut io) {
            Ok(()) => Ok(Completion::Unit),
            Err(Condition::Error(message)) => {
                io.stderr(&format!("Error: {message}"))?;
                Err(Condition::Error(message).into())
            }
            Err(other) => Err(other.into()),
        }
    }

    fn complete(&mut self, value: I::Value, mode: ResultMode) -> Result<Completion, Fault> {
        Ok(match mode {
            ResultMode::Handle => {
                let kind = self.interpreter.kind(&value);
                Completion::Handle {
                    handle: self.handles.insert(value),
                    kind,
                }
            }
            ResultMode::Discard => Completion::Unit,
            ResultMode::Value => Completion::Value(self.interpreter.to_wire(&value)?),
            ResultMode::Text => Completion::Text(self.interpreter.to_text(&value)),
        })
    }
}
