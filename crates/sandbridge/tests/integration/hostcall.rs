use std::time::Duration;

use anyhow::Result;
use sandbridge::{Error, EvalOptions, Session, SessionState};

use super::common::{start, start_with, within};

fn evaluation_message(err: &anyhow::Error) -> &str {
    match err.downcast_ref::<Error>() {
        Some(Error::Evaluation { message }) => message,
        other => panic!("expected evaluation error, got {other:?}"),
    }
}

#[tokio::test]
async fn integration_hostcall_echo() -> Result<()> {
    let session = start().await?;

    let value = within(session.evaluate_value(
        "hostcall('echo', c(1, 2, 3))",
        EvalOptions::new(),
    ))
    .await?;
    assert_eq!(value.to_serde::<Vec<f64>>()?, [1.0, 2.0, 3.0]);

    let value = within(session.evaluate_value(
        "hostcall('echo', list(name = 'calc'))",
        EvalOptions::new(),
    ))
    .await?;
    assert_eq!(
        value.to_json_value()?,
        serde_json::json!({"name": "calc"})
    );
    Ok(())
}

#[tokio::test]
async fn integration_hostcall_error_becomes_condition() -> Result<()> {
    let session = start().await?;

    let err = within(session.evaluate_void("hostcall('nope', 1)", EvalOptions::new()))
        .await
        .expect_err("expected unknown hostcall to fail");
    assert!(evaluation_message(&err).contains("unsupported hostcall: nope"));
    assert_eq!(session.state(), SessionState::Ready);
    Ok(())
}

#[tokio::test]
async fn integration_hostcall_timeout() -> Result<()> {
    let session =
        start_with(Session::builder().hostcall_timeout(Duration::from_millis(100))).await?;

    let err = within(session.evaluate_void("hostcall('slow', 1)", EvalOptions::new()))
        .await
        .expect_err("expected slow hostcall to time out");
    assert!(evaluation_message(&err).contains("timed out"));

    let value = within(session.evaluate_value("1", EvalOptions::new())).await?;
    assert_eq!(value.to_serde::<f64>()?, 1.0);
    Ok(())
}

#[tokio::test]
async fn integration_hostcall_panic() -> Result<()> {
    let session = start().await?;

    let err = within(session.evaluate_void("hostcall('panic', 1)", EvalOptions::new()))
        .await
        .expect_err("expected panicking hostcall to fail");
    assert!(evaluation_message(&err).contains("panicked"));
    assert_eq!(session.state(), SessionState::Ready);
    Ok(())
}
