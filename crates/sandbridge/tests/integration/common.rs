use std::{future::Future, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use sandbridge::{BoxError, Host, Session, SessionBuilder, Value};
use sandbridge_calc::Calc;

pub const TIMEOUT: Duration = Duration::from_secs(10);
const POLL: Duration = Duration::from_millis(5);

pub struct TestHost;

#[async_trait]
impl Host for TestHost {
    async fn hostcall(&self, call_type: &str, payload: Value) -> Result<Value, BoxError> {
        match call_type {
            "echo" => Ok(payload),
            "slow" => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(payload)
            }
            "panic" => panic!("test host panicked"),
            _ => Err(format!("unsupported hostcall: {call_type}").into()),
        }
    }
}

pub async fn start() -> Result<Session> {
    start_with(Session::builder()).await
}

pub async fn start_with(builder: SessionBuilder) -> Result<Session> {
    let session = builder
        .wait_slice(Duration::from_millis(5))
        .host(TestHost)
        .build(|| Ok::<_, BoxError>(Calc::new()))
        .context("failed to build session")?;
    within(session.init()).await.context("failed to init session")?;
    Ok(session)
}

/// Await a bridge call, failing the test instead of hanging.
pub async fn within<T>(fut: impl Future<Output = sandbridge::Result<T>>) -> Result<T> {
    Ok(tokio::time::timeout(TIMEOUT, fut)
        .await
        .context("timed out")??)
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) -> Result<()> {
    tokio::time::timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(POLL).await;
        }
    })
    .await
    .context("condition not reached")
}
