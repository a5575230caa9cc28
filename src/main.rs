mod agent;
mod ai_sdk;
mod bus;
mod client;
mod data;
mod error;
mod prompts;
mod protocol;
mod relay;
mod server;
mod tools;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use agent::{Agent, AgentConfig};
use client::ChatClient;
use data::MockStore;
use protocol::StreamEvent;
use server::ServerConfig;

#[derive(Parser)]
#[command(name = "qa-agent")]
#[command(version, about = "QA assistant chat server with a live tool-call event stream")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "QA_AGENT_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server
    Serve(ServeArgs),
    /// Send one message to a running server and follow its events
    Ask {
        #[arg(long, env = "QA_AGENT_SERVER", default_value = "http://127.0.0.1:8000")]
        server: String,
        /// Session to use; a new one is generated when omitted
        #[arg(long)]
        session: Option<String>,
        message: String,
    },
    /// Run every query in a file against a running server, one session each
    Batch {
        #[arg(long, env = "QA_AGENT_SERVER", default_value = "http://127.0.0.1:8000")]
        server: String,
        /// Seconds to wait between queries
        #[arg(long, default_value_t = 1)]
        pause_secs: u64,
        queries: PathBuf,
    },
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, env = "QA_AGENT_LISTEN", default_value = "127.0.0.1:8000")]
    listen: String,

    #[arg(long, env = "MODEL_NAME", default_value = agent::DEFAULT_MODEL)]
    model: String,

    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Directory holding features.json, bugs.json and project_context.json
    #[arg(long, env = "QA_AGENT_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Static browser UI; skipped when the directory does not exist
    #[arg(long, env = "QA_AGENT_WEB_DIR", default_value = "web")]
    web_dir: PathBuf,

    /// File overriding the built-in agent instructions
    #[arg(long, env = "QA_AGENT_INSTRUCTIONS")]
    instructions: Option<PathBuf>,

    #[arg(long, default_value_t = 15)]
    heartbeat_secs: u64,

    /// Drop a session's event channel after this long without subscribers or events
    #[arg(long, default_value_t = 600)]
    idle_timeout_secs: u64,

    #[arg(long, default_value_t = 10)]
    max_turns: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.log_json);

    match cli.command {
        Command::Serve(args) => serve(args).await?,
        Command::Ask {
            server,
            session,
            message,
        } => ask(&server, session, message).await?,
        Command::Batch {
            server,
            pause_secs,
            queries,
        } => {
            let queries = client::load_queries(&queries)
                .with_context(|| format!("reading {}", queries.display()))?;
            if queries.is_empty() {
                println!("No queries to run.");
                return Ok(ExitCode::SUCCESS);
            }
            let results =
                client::run_batch(&server, &queries, Duration::from_secs(pause_secs)).await;
            client::print_summary(&results);
            if results.iter().any(|r| r.outcome.is_err()) {
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let store = MockStore::load(&args.data_dir)?;
    let instructions = prompts::load_instructions(args.instructions.as_deref())
        .context("reading instructions file")?;

    let mut config = AgentConfig::new(args.api_key, instructions);
    config.model = args.model;
    config.max_turns = args.max_turns;
    let agent = Arc::new(Agent::new(config, Arc::new(store)));

    let config = ServerConfig {
        listen: args.listen,
        web_dir: Some(args.web_dir),
        heartbeat: Duration::from_secs(args.heartbeat_secs),
        idle_timeout: Duration::from_secs(args.idle_timeout_secs),
        sweep_interval: Duration::from_secs(60),
    };
    server::run(config, agent).await
}

async fn ask(server: &str, session: Option<String>, message: String) -> anyhow::Result<()> {
    let client = ChatClient::new(server, session);
    println!("session: {}", client.session_id());

    let reply = client
        .ask(message, |event| match event {
            StreamEvent::ToolCall { name, args } => println!("tool: {}({})", name, args),
            StreamEvent::ToolEnd { name } => println!("tool done: {}", name),
            StreamEvent::TypingStart {} => println!("thinking..."),
            StreamEvent::TypingEnd {} | StreamEvent::Ping {} | StreamEvent::Final { .. } => {}
        })
        .await?;

    println!();
    println!("{}", reply);
    Ok(())
}
