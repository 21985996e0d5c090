mod citations;
mod config;
mod error;
mod history;
mod memory;
mod ollama;
mod plan;
mod ports;
mod progress;
mod research;
mod retrieval;
mod run;
mod summarize;
mod writing;

use anyhow::Result;
use clap::Parser;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use config::Config;
use history::HistoryStore;
use ollama::OllamaClient;
use progress::ProgressEmitter;
use retrieval::SearchRetrieval;
use run::{Agent, RunRequest};

/// Research a topic and stream a cited article as server-sent events.
#[derive(Debug, Parser)]
#[command(name = "deepscribe", version)]
struct Args {
    /// Topic to research and write about
    topic: Vec<String>,

    /// Session to file the finished document under (random if omitted)
    #[arg(long)]
    session: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let topic = args.topic.join(" ");
    if topic.trim().is_empty() {
        anyhow::bail!("no topic given; usage: deepscribe <topic>");
    }

    let config = Config::load();
    let history = HistoryStore::open_default()?;

    let request = RunRequest {
        message: topic,
        session_id: args
            .session
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
    };
    let session_id = request.session_id.clone();
    let topic = request.message.clone();

    let completion = Arc::new(OllamaClient::with_config(
        config.ollama.host.clone(),
        config.ollama.model.clone(),
    ));
    tracing::info!(model = completion.get_model(), "completion port ready");
    let retrieval = Arc::new(SearchRetrieval::new(
        config.search.endpoint.clone(),
        config.search.top_k,
    ));
    let agent = Agent::new(completion, retrieval, config.run.clone());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let emitter = ProgressEmitter::new(tx);
    let cancel = CancellationToken::new();

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received, cancelling run");
            ctrl_c.cancel();
        }
    });

    let runner =
        tokio::spawn(async move { agent.execute(&request, &emitter, &cancel).await });

    // The event channel is the transport surface: print each event in
    // SSE framing as it arrives, in emission order.
    let mut stdout = std::io::stdout();
    while let Some(event) = rx.recv().await {
        stdout.write_all(event.to_sse().as_bytes())?;
        stdout.flush()?;
    }

    if let Ok(Some(document)) = runner.await {
        let text = if document.references.is_empty() {
            document.body
        } else {
            format!("{}\n\n{}", document.body, document.references)
        };
        history.add_run(&session_id, &topic, &text)?;
        tracing::info!(session = %session_id, "run stored");
    }

    Ok(())
}
