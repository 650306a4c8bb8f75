use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::sync::mpsc;

use parley_agent::{AgentEvent, Orchestrator, OrchestratorConfig, TurnContext, TurnState};
use parley_core::config::Config;
use parley_core::session::{SessionId, TranscriptStore};
use parley_core::session_store::JsonlTranscriptStore;
use parley_core::types::{Decision, ProviderId, ToolResult};
use parley_providers::transport::{HttpTransport, default_api_key_env};
use parley_providers::{AdapterRegistry, StreamParser, extract};
use parley_tools::ToolRegistry;
use parley_tools::document::DocumentStore;

#[derive(Parser)]
#[command(
    name = "parley",
    about = "Tool-calling LLM agent speaking five provider protocols",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the agent (one-shot or interactive)
    Chat {
        /// Message to send (omit for interactive mode)
        #[arg(short, long)]
        message: Option<String>,

        /// Provider protocol (openai_chat, openai_responses, anthropic, gemini, mistral)
        #[arg(short, long)]
        provider: Option<String>,

        /// Model to use
        #[arg(long)]
        model: Option<String>,

        /// Session id to continue (a new one is generated if omitted)
        #[arg(short, long)]
        session: Option<String>,

        /// Text file the agent may read and edit (repeatable)
        #[arg(short, long = "doc")]
        docs: Vec<PathBuf>,

        /// Accept every proposed edit without asking
        #[arg(short, long)]
        yes: bool,
    },

    /// Parse a captured SSE stream and print the canonical events
    Replay {
        /// Provider protocol the capture was recorded from
        #[arg(short, long)]
        provider: String,

        /// File holding the raw SSE bytes
        file: PathBuf,

        /// Feed the parser in chunks of this many bytes
        #[arg(long)]
        chunk: Option<usize>,
    },

    /// List provider protocols and their status
    Providers,

    /// Transcript management
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Check the configuration for problems
    Validate,
    /// Print the config file path
    Path,
}

#[derive(Subcommand)]
enum SessionAction {
    /// List stored sessions
    List,
    /// Print a session transcript
    Show { session: String },
    /// Delete a session transcript
    Delete { session: String },
}

/// Filter directives: `RUST_LOG` wins, then `-v`, then the config.
fn log_directives(config: &Config, verbose: bool) -> String {
    let logging = config.logging.clone().unwrap_or_default();
    let level = if verbose {
        "debug".to_string()
    } else {
        logging.level.unwrap_or_else(|| "info".to_string())
    };
    std::iter::once(level)
        .chain(logging.filters)
        .collect::<Vec<_>>()
        .join(",")
}

fn init_logging(config: &Config, verbose: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_directives(config, verbose)));
    let json = config.logging.as_ref().is_some_and(|l| l.format == "json");

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    init_logging(&config, cli.verbose);

    match cli.command {
        Commands::Chat {
            message,
            provider,
            model,
            session,
            docs,
            yes,
        } => {
            let provider = match provider {
                Some(p) => p.parse()?,
                None => config.default_provider(),
            };
            let chat = Chat::new(&config, provider, model, &docs, yes).await?;
            let session = session.map(SessionId::new).unwrap_or_else(SessionId::generate);
            tracing::info!(%session, %provider, "Chat session");

            match message {
                Some(message) => chat.turn(&session, &message).await?,
                None => chat.interactive(&session).await?,
            }
        }
        Commands::Replay {
            provider,
            file,
            chunk,
        } => replay(provider.parse()?, &file, chunk).await?,
        Commands::Providers => {
            let transport = HttpTransport::from_config(&config);
            let adapters = AdapterRegistry::with_defaults();
            for id in adapters.ids() {
                let adapter = adapters.get(id)?;
                let key = if transport.has_credentials(id) {
                    "key configured".to_string()
                } else {
                    format!("no key (set {})", default_api_key_env(id))
                };
                println!(
                    "{:<18} {:<8} {:<28} {}",
                    id.as_str(),
                    format!("{:?}", adapter.continuation_style()).to_lowercase(),
                    config.model_for(id),
                    key
                );
            }
        }
        Commands::Sessions { action } => {
            let store = JsonlTranscriptStore::new(config.transcript_dir());
            match action {
                SessionAction::List => {
                    for session in store.list().await? {
                        println!("{session}");
                    }
                }
                SessionAction::Show { session } => {
                    for message in store.load(&SessionId::new(session)).await? {
                        println!("{}", serde_json::to_string(&message)?);
                    }
                }
                SessionAction::Delete { session } => {
                    store.delete(&SessionId::new(session.clone())).await?;
                    println!("Deleted {session}");
                }
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for w in &warnings {
                    println!("warning: {w}");
                }
                for e in &errors {
                    println!("error: {e}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} config error(s)", errors.len());
                }
                println!("Config OK");
            }
            ConfigAction::Path => println!("{}", config_path.display()),
        },
    }

    Ok(())
}

/// An orchestrator wired to real providers and the on-disk documents.
struct Chat {
    orchestrator: Orchestrator,
    docs: DocumentStore,
    /// Document name to the file it was loaded from.
    files: HashMap<String, PathBuf>,
    auto_accept: bool,
}

impl Chat {
    async fn new(
        config: &Config,
        provider: ProviderId,
        model: Option<String>,
        paths: &[PathBuf],
        auto_accept: bool,
    ) -> anyhow::Result<Self> {
        let transport = HttpTransport::from_config(config);
        if !transport.has_credentials(provider) {
            anyhow::bail!(
                "no API key for {provider}: set {} or providers[].api_key",
                default_api_key_env(provider)
            );
        }

        let docs = DocumentStore::new();
        let mut files = HashMap::new();
        for path in paths {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            docs.put(name.clone(), content).await;
            files.insert(name, path.clone());
        }

        let mut tools = ToolRegistry::new();
        docs.register_tools(&mut tools);

        let mut settings = OrchestratorConfig::from_config(config, provider);
        if let Some(model) = model {
            settings.model = model;
        }
        let orchestrator = Orchestrator::new(
            settings,
            Arc::new(transport),
            tools,
            Arc::new(JsonlTranscriptStore::new(config.transcript_dir())),
        );

        Ok(Self {
            orchestrator,
            docs,
            files,
            auto_accept,
        })
    }

    async fn interactive(&self, session: &SessionId) -> anyhow::Result<()> {
        println!("Session {session}. Type /quit to leave.");
        loop {
            let line: String = dialoguer::Input::new()
                .with_prompt("you")
                .interact_text()?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if matches!(line, "/quit" | "/exit") {
                break;
            }
            if let Err(e) = self.turn(session, line).await {
                eprintln!("error: {e}");
            }
        }
        Ok(())
    }

    /// One user message, including any decision rounds it triggers.
    async fn turn(&self, session: &SessionId, message: &str) -> anyhow::Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = TurnContext::with_events(tx);
        let printer = tokio::spawn(print_events(rx));

        let cancel = ctx.cancel.clone();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });

        let result = self.drive(session, message, &ctx).await;
        interrupt.abort();
        drop(ctx);
        let _ = printer.await;
        println!();

        let handle = result?;
        if handle.state == TurnState::Cancelled {
            eprintln!("(cancelled)");
        }
        Ok(())
    }

    async fn drive(
        &self,
        session: &SessionId,
        message: &str,
        ctx: &TurnContext,
    ) -> anyhow::Result<parley_agent::TurnHandle> {
        let mut handle = self.orchestrator.start_turn(session, message, ctx).await?;
        while handle.state == TurnState::AwaitingDecision {
            for pending in handle.pending.clone() {
                let decision = self.decide(&pending).await?;
                handle = self
                    .orchestrator
                    .submit_decision(session, &pending.tool_call_id, decision, ctx)
                    .await?;
            }
        }
        Ok(handle)
    }

    /// Ask about one proposal and apply the answer to the document store.
    async fn decide(&self, pending: &ToolResult) -> anyhow::Result<Decision> {
        let payload = &pending.payload;
        let proposal_id = payload["proposal_id"].as_str().unwrap_or_default();
        let document = payload["document"].as_str().unwrap_or_default();

        eprintln!(
            "\n--- proposed {} on '{document}' ---\n{}\n---",
            payload["operation"].as_str().unwrap_or(&pending.name),
            payload["proposed"].as_str().unwrap_or_default()
        );
        let accepted = self.auto_accept
            || dialoguer::Confirm::new()
                .with_prompt("Apply this change?")
                .default(false)
                .interact()?;

        if !accepted {
            if let Err(e) = self.docs.discard(proposal_id).await {
                tracing::warn!(error = %e, "Discarding proposal failed");
            }
            return Ok(Decision::Rejected);
        }

        match self.docs.commit(proposal_id).await {
            Ok(content) => {
                if let Some(path) = self.files.get(document) {
                    tokio::fs::write(path, content)
                        .await
                        .with_context(|| format!("writing {}", path.display()))?;
                }
                Ok(Decision::Accepted)
            }
            Err(e) => {
                eprintln!("could not apply: {e}");
                Ok(Decision::Rejected)
            }
        }
    }
}

async fn print_events(mut rx: mpsc::UnboundedReceiver<AgentEvent>) {
    let mut stdout = std::io::stdout();
    while let Some(event) = rx.recv().await {
        match event {
            AgentEvent::TextDelta { text } => {
                let _ = write!(stdout, "{text}");
                let _ = stdout.flush();
            }
            AgentEvent::ToolCall { name, arguments, .. } => {
                eprintln!("\n[tool] {name} {arguments}");
            }
            AgentEvent::ToolResult { result } if !result.success => {
                eprintln!("[tool] {} failed: {}", result.name, result.payload_text());
            }
            AgentEvent::Error { kind, message } => {
                eprintln!("\n[{kind}] {message}");
            }
            AgentEvent::StateChanged { state } => {
                tracing::debug!(?state, "Turn state");
            }
            _ => {}
        }
    }
}

/// Run a captured stream through the parser as if it had arrived live.
async fn replay(provider: ProviderId, file: &Path, chunk: Option<usize>) -> anyhow::Result<()> {
    let adapter = AdapterRegistry::with_defaults().get(provider)?;
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;

    let mut parser = StreamParser::for_adapter(adapter.as_ref());
    let size = chunk.unwrap_or(bytes.len()).max(1);
    let mut events = Vec::new();
    for piece in bytes.chunks(size) {
        events.extend(parser.feed(piece));
    }
    events.extend(parser.finish());

    for event in &events {
        println!("{}", serde_json::to_string(event)?);
    }

    if !parser.saw_tool_events() {
        if let Some(payload) = parser.terminal_payload() {
            for call in extract::extract(adapter.as_ref(), payload) {
                println!(
                    "{}",
                    json!({ "type": "extracted_tool_call", "call": call })
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_log_directives() {
        let config = Config::parse(
            r#"{ logging: { level: "warn", filters: ["parley_agent=trace"] } }"#,
        )
        .unwrap();
        assert_eq!(log_directives(&config, false), "warn,parley_agent=trace");
        assert_eq!(log_directives(&config, true), "debug,parley_agent=trace");
        assert_eq!(log_directives(&Config::default(), false), "info");
    }

    #[test]
    fn test_chat_args() {
        let cli = Cli::parse_from([
            "parley", "chat", "-m", "hi", "-p", "gemini", "--doc", "a.txt", "--doc", "b.txt",
        ]);
        match cli.command {
            Commands::Chat {
                message,
                provider,
                docs,
                yes,
                ..
            } => {
                assert_eq!(message.as_deref(), Some("hi"));
                assert_eq!(provider.as_deref(), Some("gemini"));
                assert_eq!(docs.len(), 2);
                assert!(!yes);
            }
            _ => panic!("expected chat"),
        }
    }
}
