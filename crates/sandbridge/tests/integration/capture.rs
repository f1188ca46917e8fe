use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use parking_lot::Mutex;
use sandbridge::{EvalOptions, ImageFormat, Message, OutputMode, OutputRecord, Stream};

use super::common::{TIMEOUT, start, within};

fn lines(messages: &[Message]) -> Vec<String> {
    messages
        .iter()
        .filter_map(Message::as_output)
        .map(|record| record.line.clone())
        .collect()
}

#[tokio::test]
async fn integration_capture_output_and_result() -> Result<()> {
    let session = start().await?;

    let captured = within(session.evaluate_capturing(
        "cat('a\\nb'); message('warn'); 42",
        EvalOptions::new(),
    ))
    .await?;
    assert_eq!(
        captured.output,
        [
            OutputRecord {
                stream: Stream::Stdout,
                line: "a".to_string(),
            },
            OutputRecord {
                stream: Stream::Stdout,
                line: "b".to_string(),
            },
            OutputRecord {
                stream: Stream::Stderr,
                line: "warn".to_string(),
            },
        ]
    );
    assert_eq!(captured.text(), "a\nb\nwarn");
    assert_eq!(within(captured.result.to_serde::<f64>()).await?, 42.0);
    Ok(())
}

#[tokio::test]
async fn integration_capture_does_not_reach_subscribers() -> Result<()> {
    let session = start().await?;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let subscription = session.subscribe(
        |message| matches!(message, Message::Output(_)),
        {
            let seen = Arc::clone(&seen);
            move |message: &Message| seen.lock().push(message.clone())
        },
    );

    within(session.evaluate_capturing("print(1)", EvalOptions::new())).await?;
    within(session.evaluate_void("print(2)", EvalOptions::new())).await?;
    within(session.sync()).await?;

    assert_eq!(lines(&seen.lock()), ["[1] 2"]);
    assert!(session.unsubscribe(subscription));
    assert!(!session.unsubscribe(subscription));
    Ok(())
}

#[tokio::test]
async fn integration_capture_restored_after_error() -> Result<()> {
    let session = start().await?;

    within(session.evaluate_capturing("cat('lost'); stop('no')", EvalOptions::new()))
        .await
        .expect_err("expected stop() to fail");
    within(session.evaluate_void("cat('after')", EvalOptions::new())).await?;

    assert_eq!(lines(&session.flush()), ["after"]);
    Ok(())
}

#[tokio::test]
async fn integration_capture_concurrent() -> Result<()> {
    let session = start().await?;

    let (one, two) = tokio::join!(
        within(session.evaluate_capturing("cat('one')", EvalOptions::new())),
        within(session.evaluate_capturing("cat('two'); cat('three')", EvalOptions::new())),
    );
    assert_eq!(one?.text(), "one");
    assert_eq!(two?.text(), "two\nthree");
    assert!(session.flush().is_empty());
    Ok(())
}

#[tokio::test]
async fn integration_capture_mode_silences_output() -> Result<()> {
    let session = start().await?;

    let value = within(session.evaluate_value(
        "cat('quiet'); 5",
        EvalOptions::new().output(OutputMode::Capture),
    ))
    .await?;
    assert_eq!(value.to_serde::<f64>()?, 5.0);
    assert!(lines(&session.flush()).is_empty());
    Ok(())
}

#[tokio::test]
async fn integration_capture_plot_image() -> Result<()> {
    let session = start().await?;

    let captured = within(session.evaluate_capturing("plot(c(1, 3, 2))", EvalOptions::new())).await?;
    assert!(captured.output.is_empty());
    assert_eq!(captured.images.len(), 1);
    let image = &captured.images[0];
    assert_eq!(image.format, ImageFormat::Ppm);
    assert!(image.bytes.starts_with(b"P6\n"));
    assert!(captured.result.is_null());
    Ok(())
}

#[tokio::test]
async fn integration_capture_message_stream() -> Result<()> {
    let session = start().await?;

    let mut output = session.messages(|message| matches!(message, Message::Output(_)));
    within(session.evaluate_void("cat('streamed')", EvalOptions::new())).await?;

    let message = tokio::time::timeout(TIMEOUT, output.next())
        .await
        .context("timed out waiting for output")?
        .context("message stream ended")?;
    assert_eq!(
        message.as_output().map(|record| record.line.as_str()),
        Some("streamed")
    );

    within(session.close()).await?;
    let end = tokio::time::timeout(TIMEOUT, output.next())
        .await
        .context("stream did not end with the session")?;
    assert!(end.is_none());
    Ok(())
}
