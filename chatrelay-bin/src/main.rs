use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use cli_context::{CliHistory, CliIdentity};
use chatrelay_core::{
    completion::{AuthContext, BriefRequest, CompletionRequest, CompletionService},
    config::Config,
    model::ChatMessage,
    provider::ChatModel,
    provider_factory::ModelRegistry,
    stream::StreamEvent,
    telemetry::{self, ProviderTrace, StreamLog, TelemetrySink},
};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "chatrelay CLI smoke tool", long_about = None)]
struct Cli {
    /// Config file (JSON or TOML)
    #[arg(long, default_value = "chatrelay.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered logical model names
    Models,
    /// Single-shot completion
    Generate {
        #[arg(long)]
        model: String,
        #[arg(short, long, help = "Message from the user")]
        message: String,
        #[arg(long, default_value = "cli")]
        user: String,
    },
    /// Stream a completion, one JSON line per content event
    Stream {
        #[arg(long)]
        model: String,
        #[arg(short, long, help = "Message from the user")]
        message: String,
        #[arg(long, default_value = "cli")]
        user: String,
        #[arg(long, help = "Optional system prompt")]
        system: Option<String>,
    },
    /// Generate a short title for a message
    Brief {
        #[arg(short, long, help = "First message of the conversation")]
        message: String,
        #[arg(long, default_value = "cli")]
        user: String,
    },
}

/// Forwards core telemetry to the log.
struct LogSink;

impl TelemetrySink for LogSink {
    fn record(&self, trace: ProviderTrace) {
        match serde_json::to_string(&trace) {
            Ok(json) => tracing::info!(target: "chatrelay::telemetry", trace = %json),
            Err(e) => tracing::warn!(error = %e, "telemetry encode failed"),
        }
    }

    fn record_stream(&self, log: StreamLog) {
        match serde_json::to_string(&log) {
            Ok(json) => tracing::info!(target: "chatrelay::telemetry", stream = %json),
            Err(e) => tracing::warn!(error = %e, "telemetry encode failed"),
        }
    }
}

mod cli_context {
    use chatrelay_core::{
        completion::{AuthContext, CompletionRequest, History, HistoryStore, IdentityExtractor},
        error::CoreResult,
    };

    /// The CLI user is whoever `--user` says.
    pub struct CliIdentity(pub String);

    impl IdentityExtractor for CliIdentity {
        fn user_id(&self, _ctx: &AuthContext) -> CoreResult<String> {
            Ok(self.0.clone())
        }
    }

    /// No stored conversation; only an optional system prompt.
    pub struct CliHistory(pub Option<String>);

    #[async_trait::async_trait]
    impl HistoryStore for CliHistory {
        async fn load(&self, _user_id: &str, _req: &CompletionRequest) -> CoreResult<History> {
            Ok(History {
                messages: Vec::new(),
                system_prompt: self.0.clone(),
            })
        }
    }
}

fn service(registry: Arc<ModelRegistry>, cfg: &Config, user: String, system: Option<String>) -> CompletionService {
    CompletionService::new(
        registry,
        Arc::new(CliHistory(system)),
        Arc::new(CliIdentity(user)),
        cfg.brief_model.clone(),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
    telemetry::set_telemetry_sink(Arc::new(LogSink));

    let cli = Cli::parse();
    let cfg = Config::from_path(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    let registry = Arc::new(ModelRegistry::from_config(&cfg)?);

    match cli.command {
        Commands::Models => {
            for name in registry.names() {
                println!("{name}");
            }
        }
        Commands::Generate { model, message, user } => {
            let m = registry.get(&model, &user)?;
            let reply = m.generate(vec![ChatMessage::user(message)]).await?;
            if let Some(reasoning) = reply.reasoning_content {
                eprintln!("[reasoning: {reasoning}]");
            }
            println!("{}", reply.content);
        }
        Commands::Stream {
            model,
            message,
            user,
            system,
        } => {
            let svc = service(registry.clone(), &cfg, user, system);
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_signal.cancel();
                }
            });

            let req = CompletionRequest {
                model,
                conversation_id: "cli".into(),
                messages: vec![ChatMessage::user(message)],
            };
            let mut events = svc.completions(&AuthContext::default(), req, cancel.clone()).await?;
            while let Some(ev) = events.next().await {
                match ev {
                    StreamEvent::Content(c) => {
                        let extra = c.metadata();
                        let line = serde_json::json!({
                            "content": c.envelope,
                            "extra": extra,
                        });
                        println!("{line}");
                    }
                    StreamEvent::Stop => eprintln!("[stop]"),
                    StreamEvent::Error(err) => {
                        eprintln!("[error: {err}]");
                        std::process::exit(1);
                    }
                    _ => {}
                }
            }
            if cancel.is_cancelled() {
                eprintln!("[cancelled]");
            }
        }
        Commands::Brief { message, user } => {
            let svc = service(registry.clone(), &cfg, user, None);
            let req = BriefRequest {
                messages: vec![ChatMessage::user(message)],
            };
            println!("{}", svc.generate_brief(&AuthContext::default(), &req).await?);
        }
    }

    Ok(())
}
