use anyhow::{Context, Result};
use futures::StreamExt;
use std::future::Future;
use std::io::{self, Write};
use std::path::Path;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::signal;
use tracing::{debug, info, warn};

use crate::cli::commands::{BenchCommand, ChatCommand, InfoCommand};
use crate::cli::transcript::{ResponseBuffer, Turn};
use crate::config::{validate_model_path, Identity, RunLoopConfig};
use crate::prompt::greeting;
use crate::runloop::{LlamaClient, RunLoop, RunLoopClient};

async fn start_run_loop(config: RunLoopConfig) -> Result<RunLoopClient> {
    RunLoop::start(config)
        .await
        .context("Failed to start run loop")
}

async fn load_model(client: &RunLoopClient, model: &Path) -> Result<()> {
    client
        .load(model)
        .await
        .with_context(|| format!("Failed to load model {}", model.display()))
}

/// Run `session`, then shut the run loop down whatever the outcome.
async fn with_shutdown<T>(
    client: &RunLoopClient,
    session: impl Future<Output = Result<T>>,
) -> Result<T> {
    let result = session.await;
    if let Err(e) = client.shutdown().await {
        if result.is_ok() {
            return Err(e).context("Failed to shut down run loop");
        }
        warn!("Failed to shut down run loop: {}", e);
    }
    result
}

/// Stream one reply to stdout. Ctrl-C cancels the reply, not the session.
async fn stream_reply(
    client: &RunLoopClient,
    identity: &Identity,
    prompt: &str,
) -> Result<ResponseBuffer> {
    let mut stream = client.send(prompt);
    let mut buffer = ResponseBuffer::default();

    print!("{}:", identity.assistant);
    io::stdout().flush()?;

    let interrupted = loop {
        tokio::select! {
            fragment = stream.next() => match fragment {
                Some(Ok(text)) => {
                    print!("{}", text);
                    let _ = io::stdout().flush();
                    buffer.push(&text);
                }
                Some(Err(e)) => {
                    println!();
                    return Err(e).context("Generation failed");
                }
                None => break false,
            },
            _ = signal::ctrl_c() => break true,
        }
    };
    println!();

    let report = if interrupted {
        stream.cancel().await
    } else {
        stream.finish().await
    };
    debug!(
        outcome = ?report.outcome,
        fragments = report.fragments,
        cursor = report.cursor,
        "Generation finished"
    );
    info!(
        "Generated {} fragments in {}ms ({:.2} fragments/sec)",
        report.fragments,
        report.elapsed.as_millis(),
        report.fragments_per_second()
    );
    if report.is_cancelled() {
        warn!("Reply interrupted");
    }

    Ok(buffer)
}

pub async fn handle_chat(cmd: ChatCommand) -> Result<()> {
    let mut config = RunLoopConfig::load(&cmd.config)?;
    if cmd.format_chat {
        config.format_chat = true;
    }
    validate_model_path(&cmd.model)?;
    let identity = config.identity.clone();
    let client = start_run_loop(config).await?;

    with_shutdown(&client, async {
        load_model(&client, &cmd.model).await?;
        match &cmd.prompt {
            Some(prompt) => stream_reply(&client, &identity, prompt).await.map(drop),
            None => chat_session(&client, &identity, &cmd.model).await,
        }
    })
    .await
}

/// Next input line, or `None` on end of input or when `interrupt` fires first.
async fn read_prompt<R: AsyncBufRead + Unpin>(
    lines: &mut Lines<R>,
    interrupt: impl Future<Output = io::Result<()>>,
) -> Result<Option<String>> {
    tokio::select! {
        line = lines.next_line() => Ok(line?),
        _ = interrupt => {
            println!();
            Ok(None)
        }
    }
}

async fn chat_session(client: &RunLoopClient, identity: &Identity, model: &Path) -> Result<()> {
    println!("{}", greeting(identity));
    println!("Commands: /reset starts a new chat, /history shows this chat, /quit exits");

    let mut history: Vec<Turn> = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("{}: ", identity.user);
        io::stdout().flush()?;

        let Some(line) = read_prompt(&mut lines, signal::ctrl_c()).await? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/reset" => {
                client.unload().await?;
                load_model(client, model).await?;
                history.clear();
                println!("{}", greeting(identity));
                continue;
            }
            "/history" => {
                for turn in &history {
                    println!("{}: {}", identity.user, turn.prompt);
                    println!("{}: {}", identity.assistant, turn.reply);
                }
                continue;
            }
            _ => {}
        }

        let buffer = stream_reply(client, identity, line).await?;
        match Turn::record(line, &buffer) {
            Some(turn) => history.push(turn),
            None => debug!("Empty reply, not recorded"),
        }
    }
    Ok(())
}

pub async fn handle_bench(cmd: BenchCommand) -> Result<()> {
    let config = RunLoopConfig::load(&cmd.config)?;
    validate_model_path(&cmd.model)?;
    let client = start_run_loop(config).await?;

    with_shutdown(&client, async {
        load_model(&client, &cmd.model).await?;
        let params = cmd.params();
        info!(
            "Benchmarking {} (pp={}, tg={}, pl={}, reps={})",
            cmd.model.display(),
            params.pp,
            params.tg,
            params.pl,
            params.reps
        );
        let report = client.bench(params).await.context("Benchmark failed")?;
        println!("{}", report);
        Ok(())
    })
    .await
}

pub async fn handle_info(cmd: InfoCommand) -> Result<()> {
    let config = RunLoopConfig::load(&cmd.config)?;
    let client = start_run_loop(config).await?;

    with_shutdown(&client, async {
        println!("{}", client.system_info().await?);
        Ok(())
    })
    .await
}
