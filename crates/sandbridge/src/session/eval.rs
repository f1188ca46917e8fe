//! Evaluation façade.

use serde::Serialize;

use super::Session;
use crate::{
    error::{Error, Result},
    protocol::{ArgValue, Binding, Command, Completion, Image, OutputRecord, ResultMode, ValueKind},
    shelter::{Proxy, Shelter, ShelterId},
    value::Value,
};

/// What happens to output produced while an evaluation runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// Deliver to subscribers, or queue for [`Session::flush`].
    #[default]
    Stream,
    /// Capture and discard. Nothing reaches subscribers or the queue.
    Capture,
}

/// Per-evaluation options.
#[derive(Debug, Clone, Default)]
pub struct EvalOptions {
    env: Vec<Binding>,
    output: OutputMode,
    shelter: Option<ShelterId>,
}

impl EvalOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to a wire value for this evaluation only.
    #[must_use]
    pub fn bind(mut self, name: impl Into<String>, value: Value) -> Self {
        self.env.push(Binding {
            name: name.into(),
            value: ArgValue::Value(value),
        });
        self
    }

    /// Bind `name` to the sandbox value behind `proxy`.
    ///
    /// # Errors
    /// Returns [`Error::Lifetime`] if the proxy has been purged.
    pub fn bind_proxy(mut self, name: impl Into<String>, proxy: &Proxy) -> Result<Self> {
        self.env.push(Binding {
            name: name.into(),
            value: proxy.arg()?,
        });
        Ok(self)
    }

    /// Bind every entry of a map-like serializable value.
    ///
    /// `EvalOptions::new().env(&json!({"foo": 1234, "bar": 1}))` binds `foo`
    /// and `bar`.
    ///
    /// # Errors
    /// Returns [`Error::Codec`] if `env` does not serialize to a map.
    pub fn env<T: Serialize + ?Sized>(mut self, env: &T) -> Result<Self> {
        let serde_json::Value::Object(entries) =
            serde_json::to_value(env).map_err(crate::value::Error::from)?
        else {
            return Err(Error::Codec(crate::value::Error::Json(
                <serde_json::Error as serde::ser::Error>::custom(
                    "environment must serialize to a map",
                ),
            )));
        };
        for (name, value) in entries {
            let value = Value::from_json_value(&value)?;
            self.env.push(Binding {
                name,
                value: ArgValue::Value(value),
            });
        }
        Ok(self)
    }

    #[must_use]
    pub fn output(mut self, mode: OutputMode) -> Self {
        self.output = mode;
        self
    }

    /// Shelter the result in `shelter` instead of the default one.
    #[must_use]
    pub fn shelter(mut self, shelter: &Shelter) -> Self {
        self.shelter = Some(shelter.id());
        self
    }
}

/// Result of [`Session::evaluate_capturing`].
#[derive(Debug)]
pub struct Captured {
    /// Output lines in the order they were written.
    pub output: Vec<OutputRecord>,
    pub images: Vec<Image>,
    pub result: Proxy,
}

impl Captured {
    /// Captured lines joined with newlines, stdout and stderr interleaved.
    #[must_use]
    pub fn text(&self) -> String {
        self.output
            .iter()
            .map(|record| record.line.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Session {
    async fn run_eval(
        &self,
        code: &str,
        options: EvalOptions,
        result: ResultMode,
    ) -> Result<Completion> {
        let EvalOptions { env, output, .. } = options;
        let command = Command::Eval {
            code: code.to_string(),
            env,
            result,
        };
        match output {
            OutputMode::Stream => self.core().request(command, None).await,
            OutputMode::Capture => {
                let capture = self.core().begin_capture();
                self.core().request(command, Some(capture.id())).await
            }
        }
    }

    /// Evaluate `code` and shelter the result.
    ///
    /// The result lands in the shelter named by `options`, or in the default
    /// shelter.
    ///
    /// # Errors
    /// Returns [`Error::Evaluation`] with the interpreter's message if the
    /// code fails, [`Error::Interrupted`] if it was interrupted, and a
    /// transport error if the session failed.
    #[tracing::instrument(level = "debug", skip(self, options))]
    pub async fn evaluate(&self, code: &str, options: EvalOptions) -> Result<Proxy> {
        let shelter = options.shelter.unwrap_or(ShelterId::DEFAULT);
        self.ensure_shelter(shelter)?;
        let completion = self.run_eval(code, options, ResultMode::Handle).await?;
        self.adopt(completion, shelter)
    }

    /// Evaluate `code` for its effects only.
    ///
    /// # Errors
    /// As for [`evaluate`](Self::evaluate).
    pub async fn evaluate_void(&self, code: &str, options: EvalOptions) -> Result<()> {
        self.run_eval(code, options, ResultMode::Discard)
            .await
            .map(drop)
    }

    /// Evaluate `code`, which must produce a single string.
    ///
    /// # Errors
    /// Returns [`Error::KindMismatch`] if the result is not a string, and
    /// otherwise as for [`evaluate`](Self::evaluate).
    pub async fn evaluate_string(&self, code: &str) -> Result<String> {
        let value = self.evaluate_value(code, EvalOptions::default()).await?;
        match value.to_json_value()? {
            serde_json::Value::String(text) => Ok(text),
            other => Err(Error::KindMismatch {
                expected: ValueKind::Character,
                found: json_kind(&other),
            }),
        }
    }

    /// Evaluate `code` and copy the result out as a wire value.
    ///
    /// # Errors
    /// As for [`evaluate`](Self::evaluate); values without a wire form fail
    /// with [`Error::Evaluation`].
    pub async fn evaluate_value(&self, code: &str, options: EvalOptions) -> Result<Value> {
        match self.run_eval(code, options, ResultMode::Value).await? {
            Completion::Value(value) => Ok(value),
            other => other.unexpected("value").map_err(Error::from),
        }
    }

    /// Evaluate `code`, collecting its output instead of streaming it.
    ///
    /// Capture is scoped to this call: concurrent or nested captures each
    /// see only their own output, and routing is restored even if the
    /// evaluation fails.
    ///
    /// # Errors
    /// As for [`evaluate`](Self::evaluate).
    #[tracing::instrument(level = "debug", skip(self, options))]
    pub async fn evaluate_capturing(&self, code: &str, options: EvalOptions) -> Result<Captured> {
        let shelter = options.shelter.unwrap_or(ShelterId::DEFAULT);
        self.ensure_shelter(shelter)?;
        let EvalOptions { env, .. } = options;
        let capture = self.core().begin_capture();
        let completion = self
            .core()
            .request(
                Command::Eval {
                    code: code.to_string(),
                    env,
                    result: ResultMode::Handle,
                },
                Some(capture.id()),
            )
            .await?;
        let buffer = capture.finish();
        Ok(Captured {
            output: buffer.output,
            images: buffer.images,
            result: self.adopt(completion, shelter)?,
        })
    }

    /// Bind `name` in the interpreter's global environment.
    ///
    /// # Errors
    /// Fails if the session is not ready, the value cannot be converted, or
    /// a proxy argument has been purged.
    pub async fn bind(&self, name: &str, value: impl Into<ArgValue>) -> Result<()> {
        self.core()
            .request(
                Command::Bind {
                    name: name.to_string(),
                    value: value.into(),
                },
                None,
            )
            .await
            .map(drop)
    }

    /// Call the function behind `function`, sheltering the result alongside
    /// it.
    ///
    /// # Errors
    /// As for [`Proxy::call`].
    pub async fn call(
        &self,
        function: &Proxy,
        args: impl IntoIterator<Item = crate::protocol::Arg>,
    ) -> Result<Proxy> {
        function.call(args).await
    }

    /// Install packages through the interpreter. Progress arrives as
    /// `package_progress` messages unless `quiet`.
    ///
    /// # Errors
    /// Returns [`Error::Evaluation`] if installation fails or the interpreter
    /// does not support it.
    pub async fn install_packages<S: Into<String>>(
        &self,
        names: impl IntoIterator<Item = S>,
        quiet: bool,
    ) -> Result<()> {
        let names = names.into_iter().map(Into::into).collect();
        self.core()
            .request(Command::InstallPackages { names, quiet }, None)
            .await
            .map(drop)
    }

    fn ensure_shelter(&self, shelter: ShelterId) -> Result<()> {
        if self.core().registry.lock().contains_shelter(shelter) {
            Ok(())
        } else {
            Err(Error::UnknownShelter(shelter))
        }
    }

    /// Wrap a handle completion in a proxy sheltered by `shelter`.
    pub(crate) fn adopt(&self, completion: Completion, shelter: ShelterId) -> Result<Proxy> {
        let Completion::Handle { handle, kind } = completion else {
            return completion.unexpected("handle").map_err(Error::from);
        };
        let created = self.core().registry.lock().create_proxy(handle, shelter);
        match created {
            Ok(id) => Ok(Proxy::new(self.clone(), handle, kind, id, shelter)),
            Err(e) => {
                // The shelter went away while the evaluation ran.
                self.core().release(vec![handle]);
                Err(e)
            }
        }
    }
}

const fn json_kind(value: &serde_json::Value) -> ValueKind {
    match value {
        serde_json::Value::Null => ValueKind::Null,
        serde_json::Value::Bool(_) => ValueKind::Logical,
        serde_json::Value::Number(_) => ValueKind::Double,
        serde_json::Value::String(_) => ValueKind::Character,
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => ValueKind::List,
    }
}
