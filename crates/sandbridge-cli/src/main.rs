use std::{
    io::Write as _,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context as _;
use clap::Parser;
use sandbridge::{
    BoxError, Console, ConsoleCallbacks, ConsoleState, EvalOptions, Message, Session,
    SessionConfig, SessionState, Stream,
};
use sandbridge_calc::Calc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const SETTLE_POLL: Duration = Duration::from_millis(10);

/// Interactive calculator console running in a sandbox thread.
#[derive(Parser, Debug)]
#[command(name = "sandbridge", version, about)]
struct Args {
    /// JSON session configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Evaluate code, print the result and exit instead of starting a console.
    #[arg(long)]
    eval: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;
    let session = Session::builder()
        .config(config)
        .build(|| Ok::<_, BoxError>(Calc::new()))?;
    session.init().await.context("failed to start sandbox")?;

    let result = match args.eval {
        Some(code) => eval_once(&session, &code).await,
        None => repl(&session).await,
    };
    session.close().await?;
    result
}

fn load_config(path: Option<&Path>) -> anyhow::Result<SessionConfig> {
    let Some(path) = path else {
        return Ok(SessionConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    SessionConfig::from_json(&text).with_context(|| format!("invalid config {}", path.display()))
}

async fn eval_once(session: &Session, code: &str) -> anyhow::Result<()> {
    let subscription = session.subscribe(
        |message: &Message| matches!(message, Message::Output(_)),
        |message: &Message| {
            if let Some(record) = message.as_output() {
                match record.stream {
                    Stream::Stdout => println!("{}", record.line),
                    Stream::Stderr => eprintln!("{}", record.line),
                }
            }
        },
    );
    let result = session.evaluate(code, EvalOptions::new()).await;
    session.unsubscribe(subscription);

    let result = result?;
    if !result.is_null() {
        println!("{}", result.to_text().await?);
    }
    Ok(())
}

async fn repl(session: &Session) -> anyhow::Result<()> {
    let console = Console::new(
        session.clone(),
        ConsoleCallbacks::new(
            |line| println!("{line}"),
            |line| eprintln!("{line}"),
            |prompt| {
                let mut stdout = std::io::stdout().lock();
                let _ = write!(stdout, "{prompt}");
                let _ = stdout.flush();
            },
        ),
    );
    console.run()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => console.stdin(&line)?,
                None => break,
            },
            signal = tokio::signal::ctrl_c() => {
                signal?;
                console.interrupt();
                println!();
            }
        }
    }

    settle(session, &console).await;
    println!();
    Ok(())
}

/// Wait for the console to finish held input and prompt again.
async fn settle(session: &Session, console: &Console) {
    while console.state() != ConsoleState::AwaitingInput && session.state() == SessionState::Ready
    {
        tokio::time::sleep(SETTLE_POLL).await;
    }
}
