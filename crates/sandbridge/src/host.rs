use std::sync::Arc;

use crate::value::Value;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Embedder hooks for requests only the host can satisfy.
///
/// The sandbox issues these as blocking sync requests (fetch a file, render a
/// bitmap, look something up). The call runs on the host pump; whatever it
/// returns, including an error or a timeout, is turned into a reply so the
/// sandbox never waits forever.
#[async_trait::async_trait]
pub trait Host: Send + Sync + 'static {
    async fn hostcall(&self, call_type: &str, payload: Value) -> Result<Value, BoxError>;
}

#[async_trait::async_trait]
impl<T: Host + ?Sized> Host for Arc<T> {
    async fn hostcall(&self, call_type: &str, payload: Value) -> Result<Value, BoxError> {
        (**self).hostcall(call_type, payload).await
    }
}

/// Host that rejects every call.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHost;

impl NoopHost {
    #[must_use]
    pub fn shared() -> Arc<dyn Host> {
        Arc::new(Self)
    }
}

#[async_trait::async_trait]
impl Host for NoopHost {
    async fn hostcall(&self, call_type: &str, _payload: Value) -> Result<Value, BoxError> {
        Err(std::io::Error::other(format!("unsupported hostcall: {call_type}")).into())
    }
}
