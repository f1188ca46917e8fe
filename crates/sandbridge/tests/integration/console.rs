use std::{sync::Arc, time::Duration};

use anyhow::Result;
use parking_lot::Mutex;
use sandbridge::{Console, ConsoleCallbacks, ConsoleState, Error, ImageFormat, Session};

use super::common::{start, wait_until};

#[derive(Default)]
struct Transcript {
    stdout: Mutex<Vec<String>>,
    stderr: Mutex<Vec<String>>,
    prompts: Mutex<Vec<String>>,
    images: Mutex<Vec<ImageFormat>>,
}

impl Transcript {
    fn has_stdout(&self, line: &str) -> bool {
        self.stdout.lock().iter().any(|l| l == line)
    }

    fn prompt_count(&self) -> usize {
        self.prompts.lock().len()
    }
}

fn console(session: &Session) -> (Console, Arc<Transcript>) {
    let transcript = Arc::new(Transcript::default());
    let callbacks = ConsoleCallbacks::new(
        {
            let t = Arc::clone(&transcript);
            move |line: &str| t.stdout.lock().push(line.to_string())
        },
        {
            let t = Arc::clone(&transcript);
            move |line: &str| t.stderr.lock().push(line.to_string())
        },
        {
            let t = Arc::clone(&transcript);
            move |prompt: &str| t.prompts.lock().push(prompt.to_string())
        },
    )
    .canvas({
        let t = Arc::clone(&transcript);
        move |image: &sandbridge::Image| t.images.lock().push(image.format)
    });
    (Console::new(session.clone(), callbacks), transcript)
}

#[tokio::test]
async fn integration_console_evaluates_input() -> Result<()> {
    let session = start().await?;
    let (console, transcript) = console(&session);

    console.run()?;
    console.run()?;
    wait_until(|| console.state() == ConsoleState::AwaitingInput).await?;
    assert_eq!(*transcript.prompts.lock(), ["> "]);

    console.stdin("1+1")?;
    assert_eq!(console.state(), ConsoleState::Evaluating);
    wait_until(|| transcript.has_stdout("[1] 2")).await?;
    wait_until(|| console.state() == ConsoleState::AwaitingInput).await?;
    assert_eq!(transcript.prompt_count(), 2);
    Ok(())
}

#[tokio::test]
async fn integration_console_holds_early_input() -> Result<()> {
    let session = start().await?;
    let (console, transcript) = console(&session);

    console.run()?;
    console.stdin("x <- 5\nx * 2\n")?;
    wait_until(|| transcript.has_stdout("[1] 10")).await?;

    // The assignment is invisible; only the product is printed.
    assert_eq!(*transcript.stdout.lock(), ["[1] 10"]);
    Ok(())
}

#[tokio::test]
async fn integration_console_reports_errors() -> Result<()> {
    let session = start().await?;
    let (console, transcript) = console(&session);

    console.run()?;
    console.stdin("stop('bad')\n3")?;
    wait_until(|| transcript.has_stdout("[1] 3")).await?;
    assert_eq!(*transcript.stderr.lock(), ["Error: bad"]);
    Ok(())
}

#[tokio::test]
async fn integration_console_readline() -> Result<()> {
    let session = start().await?;
    let (console, transcript) = console(&session);

    console.run()?;
    console.stdin("name <- readline('who? ')")?;
    wait_until(|| transcript.prompts.lock().iter().any(|p| p == "who? ")).await?;
    wait_until(|| console.state() == ConsoleState::AwaitingInput).await?;

    console.stdin("calc")?;
    console.stdin("name")?;
    wait_until(|| transcript.has_stdout("[1] \"calc\"")).await?;
    Ok(())
}

#[tokio::test]
async fn integration_console_interrupt() -> Result<()> {
    let session = start().await?;
    let (console, transcript) = console(&session);

    console.run()?;
    wait_until(|| console.state() == ConsoleState::AwaitingInput).await?;
    let prompts = transcript.prompt_count();

    console.stdin("Sys.sleep(30)\n'never'")?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(console.state(), ConsoleState::Evaluating);
    console.interrupt();

    wait_until(|| {
        transcript.prompt_count() > prompts && console.state() == ConsoleState::AwaitingInput
    })
    .await?;
    console.stdin("'after'")?;
    wait_until(|| transcript.has_stdout("[1] \"after\"")).await?;
    assert!(!transcript.has_stdout("[1] \"never\""));
    Ok(())
}

#[tokio::test]
async fn integration_console_canvas() -> Result<()> {
    let session = start().await?;
    let (console, transcript) = console(&session);

    console.run()?;
    console.stdin("plot(c(2, 4, 8))")?;
    wait_until(|| !transcript.images.lock().is_empty()).await?;
    assert_eq!(*transcript.images.lock(), [ImageFormat::Ppm]);
    Ok(())
}

#[tokio::test]
async fn integration_console_requires_run() -> Result<()> {
    let session = start().await?;
    let (console, _transcript) = console(&session);

    let err = console.stdin("1").expect_err("expected stdin before run to fail");
    assert!(matches!(err, Error::State { .. }));

    console.run()?;
    assert!(console.is_running());
    console.stop();
    assert!(!console.is_running());
    Ok(())
}
