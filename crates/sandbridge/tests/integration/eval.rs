use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use sandbridge::{
    Arg, BoxError, Error, EvalOptions, Message, PackageStatus, Session, SessionState,
    TransportError, Value, ValueKind,
};
use sandbridge_calc::Calc;
use serde_json::json;

use super::common::{TIMEOUT, start, start_with, within};

#[tokio::test]
async fn integration_eval_with_env_bindings() -> Result<()> {
    let session = start().await?;

    let options = EvalOptions::new().env(&json!({"foo": 1234, "bar": 1}))?;
    let value = within(session.evaluate_value("foo + bar", options)).await?;
    assert_eq!(value.to_serde::<f64>()?, 1235.0);

    // The environment only lives for one evaluation.
    let err = within(session.evaluate_void("foo", EvalOptions::new()))
        .await
        .expect_err("expected foo to be unbound");
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Evaluation { .. })));
    Ok(())
}

#[tokio::test]
async fn integration_eval_call_function_proxy() -> Result<()> {
    let session = start().await?;

    let sin = within(session.evaluate("sin", EvalOptions::new())).await?;
    assert!(sin.is_function());
    let result = within(sin.call([Arg::value(Value::from_serde(&[1, 2, 3])?)])).await?;
    let values: Vec<f64> = within(result.to_serde()).await?;

    let expected = [0.8415, 0.9093, 0.1411];
    assert_eq!(values.len(), expected.len());
    for (got, want) in values.iter().zip(expected) {
        assert!((got - want).abs() < 1e-4, "expected {want}, got {got}");
    }
    Ok(())
}

#[tokio::test]
async fn integration_eval_named_arguments_and_closures() -> Result<()> {
    let session = start().await?;

    let scale = within(session.evaluate(
        "function(x, by = 2) x * by",
        EvalOptions::new(),
    ))
    .await?;
    let result = within(session.call(
        &scale,
        [
            Arg::value(Value::from_serde(&5)?),
            Arg::named("by", Value::from_serde(&3)?),
        ],
    ))
    .await?;
    assert_eq!(within(result.to_serde::<f64>()).await?, 15.0);
    Ok(())
}

#[tokio::test]
async fn integration_eval_error_is_not_fatal() -> Result<()> {
    let session = start().await?;

    let err = within(session.evaluate_void("stop('boom')", EvalOptions::new()))
        .await
        .expect_err("expected stop() to fail");
    match err.downcast_ref::<Error>() {
        Some(Error::Evaluation { message }) => assert!(message.contains("boom")),
        other => panic!("expected evaluation error, got {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Ready);

    let value = within(session.evaluate_value("1 + 1", EvalOptions::new())).await?;
    assert_eq!(value.to_serde::<f64>()?, 2.0);
    Ok(())
}

#[tokio::test]
async fn integration_eval_string_checks_kind() -> Result<()> {
    let session = start().await?;

    let text = within(session.evaluate_string("paste('a', 'b')")).await?;
    assert_eq!(text, "a b");

    let err = within(session.evaluate_string("1"))
        .await
        .expect_err("expected a kind mismatch");
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::KindMismatch {
            expected: ValueKind::Character,
            ..
        })
    ));

    let err = within(session.evaluate_value("sin", EvalOptions::new()))
        .await
        .expect_err("expected functions to have no wire form");
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Evaluation { .. })));
    Ok(())
}

#[tokio::test]
async fn integration_eval_bind_globals() -> Result<()> {
    let session = start().await?;

    within(session.bind("x", Value::from_serde(&21)?)).await?;
    let value = within(session.evaluate_value("x * 2", EvalOptions::new())).await?;
    assert_eq!(value.to_serde::<f64>()?, 42.0);

    let sqrt = within(session.evaluate("sqrt", EvalOptions::new())).await?;
    within(session.bind("root", sqrt.arg()?)).await?;
    let value = within(session.evaluate_value("root(16)", EvalOptions::new())).await?;
    assert_eq!(value.to_serde::<f64>()?, 4.0);
    Ok(())
}

#[tokio::test]
async fn integration_eval_list_conversion() -> Result<()> {
    let session = start().await?;

    let list = within(session.evaluate("list(a = 1, b = 'x')", EvalOptions::new())).await?;
    assert!(list.is_list());
    assert_eq!(
        within(list.to_value()).await?.to_json_value()?,
        json!({"a": 1.0, "b": "x"})
    );
    let text = within(list.to_text()).await?;
    assert!(text.contains("$a"), "expected list printout, got {text:?}");
    Ok(())
}

#[tokio::test]
async fn integration_eval_interrupt() -> Result<()> {
    let session = start().await?;

    let task = tokio::spawn({
        let session = session.clone();
        async move {
            session
                .evaluate_void("Sys.sleep(30)", EvalOptions::new())
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    session.interrupt();

    let result = tokio::time::timeout(TIMEOUT, task)
        .await
        .context("interrupt was not observed")??;
    assert!(matches!(result, Err(Error::Interrupted)));

    // A stale interrupt must not leak into the next evaluation.
    let value = within(session.evaluate_value("3", EvalOptions::new())).await?;
    assert_eq!(value.to_serde::<f64>()?, 3.0);
    Ok(())
}

#[tokio::test]
async fn integration_eval_interrupt_while_idle() -> Result<()> {
    let session = start().await?;

    // Let the sandbox park on its next-command read first.
    tokio::time::sleep(Duration::from_millis(100)).await;
    session.interrupt();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let value = within(session.evaluate_value("sum(1)", EvalOptions::new())).await?;
    assert_eq!(value.to_serde::<f64>()?, 1.0);
    Ok(())
}

#[tokio::test]
async fn integration_eval_flush_unrouted_output() -> Result<()> {
    let session = start().await?;

    within(session.evaluate_void("cat('hello')", EvalOptions::new())).await?;
    let messages = session.flush();
    assert!(
        messages
            .iter()
            .filter_map(Message::as_output)
            .any(|record| record.line == "hello"),
        "expected queued output, got {messages:?}"
    );
    assert!(session.flush().is_empty());
    Ok(())
}

#[tokio::test]
async fn integration_eval_install_packages_progress() -> Result<()> {
    let session = start().await?;

    let mut progress =
        session.messages(|message| matches!(message, Message::PackageProgress { .. }));
    within(session.install_packages(["ggplot2"], false)).await?;

    let mut statuses = Vec::new();
    for _ in 0..3 {
        let message = tokio::time::timeout(TIMEOUT, progress.next())
            .await
            .context("timed out waiting for progress")?
            .context("message stream ended")?;
        if let Message::PackageProgress { package, status } = message {
            assert_eq!(package, "ggplot2");
            statuses.push(status);
        }
    }
    assert_eq!(
        statuses,
        [
            PackageStatus::Downloading,
            PackageStatus::Installing,
            PackageStatus::Installed,
        ]
    );

    let err = within(session.install_packages(["not a package"], true))
        .await
        .expect_err("expected invalid package name to fail");
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Evaluation { .. })));
    Ok(())
}

#[tokio::test]
async fn integration_eval_oversized_command_is_rejected() -> Result<()> {
    let session = start_with(Session::builder().region_capacity(1024)).await?;

    let code = format!("'{}'", "x".repeat(4096));
    let err = within(session.evaluate_void(&code, EvalOptions::new()))
        .await
        .expect_err("expected the command not to fit");
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::Transport(TransportError::PayloadTooLarge { .. }))
    ));
    assert_eq!(session.state(), SessionState::Ready);

    let value = within(session.evaluate_value("2 ^ 10", EvalOptions::new())).await?;
    assert_eq!(value.to_serde::<f64>()?, 1024.0);
    Ok(())
}

#[tokio::test]
async fn integration_eval_close() -> Result<()> {
    let session = start().await?;

    within(session.close()).await?;
    within(session.close()).await?;
    assert_eq!(session.state(), SessionState::Destroyed);

    let err = within(session.evaluate_void("1", EvalOptions::new()))
        .await
        .expect_err("expected closed session to refuse work");
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::State {
            state: SessionState::Destroyed
        })
    ));
    Ok(())
}

#[tokio::test]
async fn integration_eval_init_lifecycle() -> Result<()> {
    let session = start().await?;
    let err = within(session.init()).await.expect_err("expected second init to fail");
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::State { .. })));

    let broken = Session::new(|| Err::<Calc, BoxError>("no interpreter".into()))?;
    let err = within(broken.init()).await.expect_err("expected startup to fail");
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::Transport(TransportError::SandboxExited(_)))
    ));
    assert!(matches!(broken.state(), SessionState::Failed(_)));
    Ok(())
}

#[tokio::test]
async fn integration_eval_proxy_kinds() -> Result<()> {
    let builder = Session::builder().config_json(r#"{"worker_name": "calc-kinds"}"#)?;
    let session = start_with(builder).await?;
    assert_eq!(session.config().worker_name, "calc-kinds");

    let text = within(session.evaluate("'a'", EvalOptions::new())).await?;
    assert!(text.is_character());
    assert!(text.kind().is_atomic());

    let flag = within(session.evaluate("1 < 2", EvalOptions::new())).await?;
    assert!(flag.is_logical());
    assert!(!flag.is_numeric());

    let list = within(session.evaluate("list(1)", EvalOptions::new())).await?;
    assert!(!list.kind().is_atomic());
    assert!(!list.is_environment());

    let nothing = within(session.evaluate("NULL", EvalOptions::new())).await?;
    assert!(nothing.is_null());
    Ok(())
}
