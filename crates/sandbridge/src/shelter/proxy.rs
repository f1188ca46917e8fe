use std::fmt;

use serde::de::DeserializeOwned;

use super::{ShelterId, registry::ProxyId};
use crate::{
    error::{Error, Result},
    protocol::{Arg, ArgValue, Command, Completion, Handle, ResultMode, ValueKind},
    session::Session,
    value::Value,
};

/// Typed host reference to a value living in the sandbox.
///
/// A proxy is valid while its shelter membership lasts. Once the shelter is
/// purged or the proxy destroyed, every dereferencing operation fails with
/// [`Error::Lifetime`].
pub struct Proxy {
    handle: Handle,
    kind: ValueKind,
    id: ProxyId,
    shelter: ShelterId,
    session: Session,
}

impl Proxy {
    pub(crate) fn new(
        session: Session,
        handle: Handle,
        kind: ValueKind,
        id: ProxyId,
        shelter: ShelterId,
    ) -> Self {
        Self {
            handle,
            kind,
            id,
            shelter,
            session,
        }
    }

    #[must_use]
    pub const fn handle(&self) -> Handle {
        self.handle
    }

    /// Kind recorded when the value was sheltered.
    #[must_use]
    pub const fn kind(&self) -> ValueKind {
        self.kind
    }

    #[must_use]
    pub const fn shelter(&self) -> ShelterId {
        self.shelter
    }

    pub(crate) const fn id(&self) -> ProxyId {
        self.id
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self.kind, ValueKind::Null)
    }

    #[must_use]
    pub const fn is_function(&self) -> bool {
        matches!(self.kind, ValueKind::Function)
    }

    #[must_use]
    pub const fn is_list(&self) -> bool {
        matches!(self.kind, ValueKind::List)
    }

    #[must_use]
    pub const fn is_character(&self) -> bool {
        matches!(self.kind, ValueKind::Character)
    }

    #[must_use]
    pub const fn is_logical(&self) -> bool {
        matches!(self.kind, ValueKind::Logical)
    }

    #[must_use]
    pub const fn is_numeric(&self) -> bool {
        self.kind.is_numeric()
    }

    #[must_use]
    pub const fn is_environment(&self) -> bool {
        matches!(self.kind, ValueKind::Environment)
    }

    /// Whether the shelter membership behind this proxy still exists.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.session
            .core()
            .registry
            .lock()
            .is_live(self.id, self.shelter)
    }

    /// # Errors
    /// Returns [`Error::Lifetime`] if the proxy is dangling.
    pub fn ensure_live(&self) -> Result<()> {
        if self.is_live() {
            Ok(())
        } else {
            Err(Error::Lifetime {
                handle: self.handle,
            })
        }
    }

    /// Pass the value by reference in a call or binding.
    ///
    /// # Errors
    /// Returns [`Error::Lifetime`] if the proxy is dangling.
    pub fn arg(&self) -> Result<ArgValue> {
        self.ensure_live()?;
        Ok(ArgValue::Handle(self.handle))
    }

    /// Copy the value out in its wire form.
    ///
    /// # Errors
    /// Returns [`Error::Lifetime`] if the proxy is dangling and
    /// [`Error::Evaluation`] if the value has no wire form.
    pub async fn to_value(&self) -> Result<Value> {
        match self.convert(ResultMode::Value).await? {
            Completion::Value(value) => Ok(value),
            other => other.unexpected("value").map_err(Error::from),
        }
    }

    /// Copy the value out and deserialize it.
    ///
    /// # Errors
    /// As for [`to_value`](Self::to_value), plus [`Error::Codec`] if the
    /// value does not deserialize into `T`.
    pub async fn to_serde<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(self.to_value().await?.to_serde()?)
    }

    /// The interpreter's printed representation of the value.
    ///
    /// # Errors
    /// Returns [`Error::Lifetime`] if the proxy is dangling.
    pub async fn to_text(&self) -> Result<String> {
        match self.convert(ResultMode::Text).await? {
            Completion::Text(text) => Ok(text),
            other => other.unexpected("text").map_err(Error::from),
        }
    }

    async fn convert(&self, result: ResultMode) -> Result<Completion> {
        self.ensure_live()?;
        self.session
            .core()
            .request(
                Command::Convert {
                    handle: self.handle,
                    result,
                },
                None,
            )
            .await
    }

    /// Call the function behind this proxy. The result is sheltered in the
    /// same shelter as the function.
    ///
    /// # Errors
    /// Returns [`Error::KindMismatch`] if the value is not a function,
    /// [`Error::Lifetime`] if the proxy is dangling, and
    /// [`Error::Evaluation`] if the call fails.
    pub async fn call(&self, args: impl IntoIterator<Item = Arg>) -> Result<Self> {
        if !self.is_function() {
            return Err(Error::KindMismatch {
                expected: ValueKind::Function,
                found: self.kind,
            });
        }
        self.ensure_live()?;
        let completion = self
            .session
            .core()
            .request(
                Command::Call {
                    function: self.handle,
                    args: args.into_iter().collect(),
                    result: ResultMode::Handle,
                },
                None,
            )
            .await?;
        self.session.adopt(completion, self.shelter)
    }

    /// End this membership. See [`Session::destroy`].
    ///
    /// # Errors
    /// Returns [`Error::Lifetime`] if the proxy was already purged.
    pub fn destroy(self) -> Result<()> {
        let session = self.session.clone();
        session.destroy(self)
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .field("shelter", &self.shelter)
            .finish_non_exhaustive()
    }
}
