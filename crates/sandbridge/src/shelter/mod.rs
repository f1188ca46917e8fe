//! Lifetime management for host references to sandbox values.
//!
//! Every [`Proxy`] is a membership of one handle in one [`Shelter`]. The
//! sandbox keeps a value alive while any membership of its handle exists;
//! purging a shelter ends all of its memberships at once.
//!
//! The default shelter lives as long as the session and is only purged on
//! request, so results left there accumulate. Scoped shelters from
//! [`Session::shelter`] bound that growth: dropping one purges it.

mod proxy;
mod registry;

use std::fmt;

pub use proxy::Proxy;
pub(crate) use registry::Registry;
pub use registry::ShelterId;

use crate::{
    error::Result,
    protocol::Handle,
    session::{Captured, EvalOptions, Session},
};

/// A scoped group of proxies that can be released together.
pub struct Shelter {
    id: ShelterId,
    session: Session,
    /// Scoped shelters are removed on drop; the default one never is.
    scoped: bool,
}

impl Shelter {
    pub(crate) fn attach(session: Session, id: ShelterId) -> Self {
        Self {
            id,
            session,
            scoped: false,
        }
    }

    pub(crate) fn create(session: Session, parent: Option<ShelterId>) -> Result<Self> {
        let id = session.core().registry.lock().create_shelter(parent)?;
        Ok(Self {
            id,
            session,
            scoped: true,
        })
    }

    #[must_use]
    pub const fn id(&self) -> ShelterId {
        self.id
    }

    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// A child shelter. Purging this shelter purges the child too.
    ///
    /// # Errors
    /// Returns [`Error::UnknownShelter`](crate::Error::UnknownShelter) if
    /// this shelter has been removed along with an ancestor.
    pub fn nested(&self) -> Result<Self> {
        Self::create(self.session.clone(), Some(self.id))
    }

    /// End every membership held by this shelter and its children.
    ///
    /// Handles left with no membership are released to the sandbox. The
    /// shelter stays usable, and purging again has no further effect.
    ///
    /// # Errors
    /// Returns [`Error::UnknownShelter`](crate::Error::UnknownShelter) if
    /// this shelter has been removed along with an ancestor.
    pub fn purge(&self) -> Result<()> {
        let released = self.session.core().registry.lock().purge(self.id)?;
        self.session.core().release(released);
        Ok(())
    }

    /// Number of live proxies in this shelter, children excluded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.session
            .core()
            .registry
            .lock()
            .len(self.id)
            .unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handles this shelter protects, oldest first.
    #[must_use]
    pub fn handles(&self) -> Vec<Handle> {
        self.session.core().registry.lock().handles(self.id)
    }

    /// Total memberships of `handle` across every shelter of the session.
    #[must_use]
    pub fn membership(&self, handle: Handle) -> usize {
        self.session.core().registry.lock().membership(handle)
    }

    /// [`Session::evaluate`] with the result sheltered here.
    ///
    /// # Errors
    /// As for [`Session::evaluate`].
    pub async fn evaluate(&self, code: &str, options: EvalOptions) -> Result<Proxy> {
        self.session.evaluate(code, options.shelter(self)).await
    }

    /// [`Session::evaluate_capturing`] with the result sheltered here.
    ///
    /// # Errors
    /// As for [`Session::evaluate_capturing`].
    pub async fn evaluate_capturing(&self, code: &str, options: EvalOptions) -> Result<Captured> {
        self.session
            .evaluate_capturing(code, options.shelter(self))
            .await
    }
}

impl fmt::Debug for Shelter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shelter")
            .field("id", &self.id)
            .field("scoped", &self.scoped)
            .finish_non_exhaustive()
    }
}

impl Drop for Shelter {
    fn drop(&mut self) {
        if !self.scoped {
            return;
        }
        let released = self.session.core().registry.lock().remove_shelter(self.id);
        self.session.core().release(released);
    }
}
