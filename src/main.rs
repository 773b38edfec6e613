use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use qcluster::{
    config::Config, telemetry, AnalysisJob, Analyzer, ChatClient, ClusterSummarizer,
    EmbeddingClient, QuestionStore, Scope, SqliteStore, WorkerPool,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "qcluster", version, about = "Groups audience questions into labeled topic clusters")]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker pool, reading one JSON job per line from stdin
    Serve,
    /// Analyze one session (or one iteration of it) and exit
    Analyze {
        #[arg(long)]
        session: String,
        #[arg(long)]
        iteration: Option<u32>,
    },
    /// Print the stored clusters of a session as JSON
    Clusters {
        #[arg(long)]
        session: String,
        #[arg(long)]
        iteration: Option<u32>,
    },
    /// Ask the language model a free-form question about a session's questions
    Ask {
        #[arg(long)]
        session: String,
        query: String,
    },
    /// Check that the chat endpoint is up and serving the configured model
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.config;
    config.validate()?;
    telemetry::init(&config.log_level, config.log_json)?;

    match cli.command {
        Command::Serve => serve(&config).await,
        Command::Analyze { session, iteration } => {
            analyze(&config, Scope::new(session, iteration)).await
        }
        Command::Clusters { session, iteration } => {
            let store = open_store(&config)?;
            let clusters = store.clusters_in_scope(&Scope::new(session, iteration))?;
            println!("{}", serde_json::to_string_pretty(&clusters)?);
            Ok(())
        }
        Command::Ask { session, query } => ask(&config, &session, &query).await,
        Command::Health => {
            let health = chat_client(&config).health_check().await?;
            println!("{}", serde_json::to_string_pretty(&health)?);
            Ok(())
        }
    }
}

fn open_store(config: &Config) -> Result<Arc<SqliteStore>> {
    Ok(Arc::new(SqliteStore::open_with_pool_size(
        &config.database_path,
        config.db_pool_size,
    )?))
}

fn chat_client(config: &Config) -> ChatClient {
    let client = ChatClient::with_timeout(config.llm_url.clone(), config.llm_timeout())
        .with_model(config.chat_model.clone());
    match &config.llm_api_key {
        Some(key) => client.with_api_key(key.clone()),
        None => client,
    }
}

fn build_analyzer(config: &Config, store: Arc<SqliteStore>) -> Analyzer {
    let embedder = EmbeddingClient::with_timeout(config.embedding_url(), config.embedding_timeout())
        .with_model(config.embedding_model.clone());
    let embedder = match config.embedding_api_key() {
        Some(key) => embedder.with_api_key(key),
        None => embedder,
    };

    Analyzer::new(
        store,
        Arc::new(embedder),
        ClusterSummarizer::new(Arc::new(chat_client(config))),
        config.analysis_settings(),
    )
}

async fn analyze(config: &Config, scope: Scope) -> Result<()> {
    let start = Instant::now();
    let analyzer = build_analyzer(config, open_store(config)?);
    let report = analyzer.run(&scope).await?;

    println!(
        "✓ {} questions -> {} clusters ({:?}) [{:.2}s]",
        report.questions,
        report.clusters.len(),
        report.outcome,
        start.elapsed().as_secs_f64()
    );
    if report.unembedded > 0 {
        println!("  {} questions had no embedding and were left out", report.unembedded);
    }
    for (i, cluster) in report.clusters.iter().enumerate() {
        println!(
            "  {}. [{}] {}\n     {}",
            i + 1,
            cluster.question_count,
            cluster.representative_question,
            cluster.label.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn ask(config: &Config, session: &str, query: &str) -> Result<()> {
    let store = open_store(config)?;
    let questions = store.questions_in_scope(&Scope::session(session))?;
    let context = questions
        .iter()
        .enumerate()
        .map(|(i, q)| format!("{}. {}", i + 1, q.text))
        .collect::<Vec<_>>()
        .join("\n");

    let answer = chat_client(config)
        .answer_host_query(query, &context)
        .await
        .context("Host query failed")?;
    println!("{}", answer);
    Ok(())
}

async fn serve(config: &Config) -> Result<()> {
    let analyzer = build_analyzer(config, open_store(config)?);
    let pool = WorkerPool::start(Arc::new(analyzer), config.pool_config());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let signal = shutdown_signal();
    tokio::pin!(signal);

    loop {
        tokio::select! {
            _ = &mut signal => {
                info!("shutdown signal received");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read job input")? else {
                    info!("job input closed, waiting for queued jobs");
                    tokio::select! {
                        _ = pool.wait_idle() => {}
                        _ = &mut signal => info!("shutdown signal received"),
                    }
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<AnalysisJob>(line) {
                    Ok(job) => pool.submit(job)?,
                    Err(e) => warn!(error = %e, "ignoring malformed job"),
                }
            }
        }
    }

    let report = pool.shutdown(config.shutdown_grace()).await;
    let stats = report.stats;
    println!(
        "{} completed, {} retried, {} dead-lettered{}",
        stats.completed,
        stats.retried,
        stats.dead_lettered,
        if report.clean { "" } else { " (some jobs were still running)" }
    );
    for dead in pool.dead_letters() {
        println!("{}", serde_json::to_string(&dead)?);
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
