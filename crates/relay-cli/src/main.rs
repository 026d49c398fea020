use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use relay_adapters::{
    Delivery, FixtureSource, LogDelivery, OpenRouterClient, OpenRouterConfig, TelegramDelivery,
    TextModel,
};
use relay_core::{
    AiModel, MediaDescriptor, MediaItem, MediaKind, NewAiModel, PostId, PostStatus, WorkerKind,
};
use relay_storage::{PostFilter, Store};
use relay_workers::{
    improve_post, run_workers, ChannelRegistry, ClassifierWorker, PublisherWorker, RelayConfig,
    ScraperWorker, Worker,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str =
    "relay_cli=info,relay_workers=info,relay_adapters=info,relay_storage=info";

#[derive(Debug, Parser)]
#[command(name = "relay-cli")]
#[command(about = "Channel relay operator command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create or upgrade the database schema.
    Migrate,
    /// Upsert channels and settings from a YAML registry file.
    Seed { file: PathBuf },
    /// Supervise workers until interrupted.
    Run {
        /// Worker kinds to supervise; all when omitted.
        #[arg(long = "worker", value_name = "KIND")]
        workers: Vec<WorkerKind>,
        /// Set should-run for the selected workers before supervising.
        #[arg(long)]
        start: bool,
    },
    /// Inspect or flip worker control flags.
    Worker {
        #[command(subcommand)]
        action: WorkerAction,
    },
    #[command(subcommand)]
    Post(PostCommand),
    #[command(subcommand)]
    Settings(SettingsCommand),
    /// Language model catalog.
    #[command(subcommand)]
    Models(ModelsCommand),
    /// Verify the configured model and Telegram credentials.
    Check,
    /// Dashboard counters.
    Stats,
}

#[derive(Debug, Subcommand)]
enum WorkerAction {
    Start { kind: Option<WorkerKind> },
    Stop { kind: Option<WorkerKind> },
    Status,
}

#[derive(Debug, Subcommand)]
enum PostCommand {
    /// Create a manual post.
    Create {
        #[arg(long)]
        text: Option<String>,
        /// Media file path or URL; repeat for an album.
        #[arg(long = "media")]
        media: Vec<String>,
        #[arg(long)]
        target: Option<i64>,
    },
    List {
        #[arg(long)]
        status: Option<PostStatus>,
        #[arg(long)]
        target: Option<i64>,
        #[arg(long)]
        manual: bool,
        #[arg(long, default_value_t = 20)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    Show { id: PostId },
    Approve {
        id: PostId,
        #[arg(long)]
        target: Option<i64>,
        #[arg(long, default_value = "operator")]
        by: String,
    },
    Schedule {
        id: PostId,
        /// RFC 3339 timestamp, e.g. 2030-01-01T09:00:00Z.
        #[arg(long)]
        at: DateTime<Utc>,
        #[arg(long)]
        target: Option<i64>,
        #[arg(long, default_value = "operator")]
        by: String,
    },
    PublishNow { id: PostId },
    Reject {
        id: PostId,
        #[arg(long, default_value = "operator")]
        by: String,
        #[arg(long)]
        notes: Option<String>,
    },
    Edit {
        id: PostId,
        #[arg(long)]
        text: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Rework the outgoing text with the language model.
    Improve {
        id: PostId,
        /// Instructions for the model, e.g. "shorter, add a call to action".
        #[arg(long)]
        prompt: String,
    },
}

#[derive(Debug, Subcommand)]
enum ModelsCommand {
    List {
        #[arg(long)]
        active: bool,
    },
    Add {
        /// Provider model id, e.g. openai/gpt-4o-mini.
        model_id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        default: bool,
    },
    SetDefault { id: i64 },
    Enable { id: i64 },
    Disable { id: i64 },
    Remove { id: i64 },
}

#[derive(Debug, Subcommand)]
enum SettingsCommand {
    Get { key: String },
    Set {
        key: String,
        value: String,
        #[arg(long)]
        description: Option<String>,
    },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let config = RelayConfig::from_env();
    init_tracing(DEFAULT_LOG_FILTER, config.log_json);

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run {
        workers: Vec::new(),
        start: false,
    });

    let store = Store::open(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;

    let result = dispatch(command, &store, &config).await;
    store.close().await;
    result
}

async fn dispatch(command: Commands, store: &Store, config: &RelayConfig) -> Result<()> {
    match command {
        Commands::Migrate => {
            println!("migrations applied: {}", config.database_url);
        }
        Commands::Seed { file } => {
            let registry = ChannelRegistry::from_path(&file).await?;
            let summary = registry.apply(store).await?;
            print_json(&summary)?;
        }
        Commands::Run { workers, start } => run(store, config, workers, start).await?,
        Commands::Worker { action } => worker_command(store, action).await?,
        Commands::Post(command) => post_command(store, config, command).await?,
        Commands::Settings(command) => settings_command(store, command).await?,
        Commands::Models(command) => models_command(store, command).await?,
        Commands::Check => check(store, config).await?,
        Commands::Stats => print_json(&store.dashboard_stats(Utc::now()).await?)?,
    }
    Ok(())
}

fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// The catalog default wins over `OPENROUTER_MODEL`.
fn chosen_model(default: Option<&AiModel>, configured: &str) -> String {
    default
        .map(|m| m.model_id.clone())
        .unwrap_or_else(|| configured.to_string())
}

async fn model_client(store: &Store, config: &RelayConfig) -> Result<Option<OpenRouterClient>> {
    let Some(key) = &config.openrouter_api_key else {
        return Ok(None);
    };
    let default = store.default_ai_model().await?;
    let model = chosen_model(default.as_ref(), &config.openrouter_model);
    info!(model = %model, from_catalog = default.is_some(), "language model selected");

    let mut model_config = OpenRouterConfig::new(key, model);
    if let Some(base_url) = &config.openrouter_base_url {
        model_config.base_url = base_url.clone();
    }
    model_config.timeout = config.http_timeout();
    let client = OpenRouterClient::new(model_config).context("building model client")?;
    Ok(Some(client))
}

fn telegram_delivery(config: &RelayConfig) -> Result<Option<TelegramDelivery>> {
    config
        .telegram_bot_token
        .as_deref()
        .map(|token| {
            TelegramDelivery::new(token, config.http_timeout()).context("building telegram delivery")
        })
        .transpose()
}

async fn build_workers(
    store: &Store,
    config: &RelayConfig,
    kinds: &[WorkerKind],
) -> Result<Vec<Arc<dyn Worker>>> {
    let mut workers: Vec<Arc<dyn Worker>> = Vec::new();
    for kind in kinds {
        match kind {
            WorkerKind::Scraper => {
                let Some(dir) = &config.source_dir else {
                    warn!("RELAY_SOURCE_DIR is not set; scraper not started");
                    continue;
                };
                let source = Arc::new(FixtureSource::new(dir));
                workers.push(Arc::new(ScraperWorker::new(
                    store.clone(),
                    source,
                    config.scraper,
                )));
            }
            WorkerKind::Classifier => {
                let Some(model) = model_client(store, config).await? else {
                    warn!("OPENROUTER_API_KEY is not set; classifier not started");
                    continue;
                };
                workers.push(Arc::new(ClassifierWorker::new(
                    store.clone(),
                    Arc::new(model),
                    config.classifier,
                )));
            }
            WorkerKind::Publisher => {
                let delivery: Arc<dyn Delivery> = match telegram_delivery(config)? {
                    Some(telegram) => Arc::new(telegram),
                    None => {
                        warn!("TELEGRAM_BOT_TOKEN is not set; publishing in dry-run mode");
                        Arc::new(LogDelivery::default())
                    }
                };
                workers.push(Arc::new(PublisherWorker::new(
                    store.clone(),
                    delivery,
                    config.publisher,
                )));
            }
        }
    }
    Ok(workers)
}

async fn run(store: &Store, config: &RelayConfig, kinds: Vec<WorkerKind>, start: bool) -> Result<()> {
    let kinds = if kinds.is_empty() {
        WorkerKind::ALL.to_vec()
    } else {
        kinds
    };
    let workers = build_workers(store, config, &kinds).await?;
    if workers.is_empty() {
        bail!("no worker could be configured");
    }
    if start {
        for worker in &workers {
            store.set_should_run(worker.kind(), true).await?;
        }
    }

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested");
                trigger.cancel();
            }
            Err(err) => error!(error = %err, "cannot listen for ctrl-c"),
        }
    });

    info!(workers = workers.len(), "supervising workers");
    run_workers(workers, store.clone(), config.runtime, shutdown).await;
    info!("all workers stopped");
    Ok(())
}

async fn worker_command(store: &Store, action: WorkerAction) -> Result<()> {
    let (kind, should_run) = match action {
        WorkerAction::Status => {
            print_json(&store.list_worker_controls().await?)?;
            return Ok(());
        }
        WorkerAction::Start { kind } => (kind, true),
        WorkerAction::Stop { kind } => (kind, false),
    };
    let kinds = kind.map(|k| vec![k]).unwrap_or_else(|| WorkerKind::ALL.to_vec());
    for kind in kinds {
        let control = store.set_should_run(kind, should_run).await?;
        println!("{kind}: should_run={}", control.should_run);
    }
    Ok(())
}

async fn post_command(store: &Store, config: &RelayConfig, command: PostCommand) -> Result<()> {
    let post = match command {
        PostCommand::Create {
            text,
            media,
            target,
        } => {
            let media = MediaDescriptor::from_items(media.iter().map(|p| media_item(p)).collect());
            if text.as_deref().map_or(true, |t| t.trim().is_empty()) && media.is_none() {
                bail!("a post needs --text or at least one --media");
            }
            store.create_manual_post(text, media, target).await?
        }
        PostCommand::List {
            status,
            target,
            manual,
            limit,
            offset,
        } => {
            let filter = PostFilter {
                status,
                target_channel_id: target,
                is_manual: manual.then_some(true),
                limit,
                offset,
                ..PostFilter::default()
            };
            return print_json(&store.list_posts(&filter).await?);
        }
        PostCommand::Show { id } => store.get_post(id).await?,
        PostCommand::Approve { id, target, by } => store.approve(id, target, &by).await?,
        PostCommand::Schedule {
            id,
            at,
            target,
            by,
        } => store.schedule(id, target, at, &by).await?,
        PostCommand::PublishNow { id } => store.request_immediate_publish(id).await?,
        PostCommand::Reject { id, by, notes } => store.reject(id, &by, notes.as_deref()).await?,
        PostCommand::Edit { id, text, notes } => {
            if text.is_none() && notes.is_none() {
                bail!("nothing to edit; pass --text and/or --notes");
            }
            store
                .update_post_text(id, text.as_deref(), notes.as_deref())
                .await?
        }
        PostCommand::Improve { id, prompt } => {
            let Some(model) = model_client(store, config).await? else {
                bail!("OPENROUTER_API_KEY is not set");
            };
            improve_post(store, &model, id, &prompt).await?
        }
    };
    print_json(&post)
}

async fn models_command(store: &Store, command: ModelsCommand) -> Result<()> {
    let model = match command {
        ModelsCommand::List { active } => return print_json(&store.list_ai_models(active).await?),
        ModelsCommand::Add {
            model_id,
            name,
            description,
            default,
        } => {
            let name = name.unwrap_or_else(|| model_id.clone());
            store
                .create_ai_model(&NewAiModel {
                    name,
                    model_id,
                    description,
                    is_active: true,
                    is_default: default,
                })
                .await?
        }
        ModelsCommand::SetDefault { id } => store.set_default_ai_model(id).await?,
        ModelsCommand::Enable { id } => store.set_ai_model_active(id, true).await?,
        ModelsCommand::Disable { id } => store.set_ai_model_active(id, false).await?,
        ModelsCommand::Remove { id } => {
            store.delete_ai_model(id).await?;
            println!("ai model {id} removed");
            return Ok(());
        }
    };
    print_json(&model)
}

/// Outcome line for one adapter check.
fn check_status<E: std::fmt::Display>(outcome: Option<Result<(), E>>) -> (String, bool) {
    match outcome {
        None => ("not configured".to_string(), true),
        Some(Ok(())) => ("ok".to_string(), true),
        Some(Err(err)) => (format!("failed: {err}"), false),
    }
}

async fn check(store: &Store, config: &RelayConfig) -> Result<()> {
    let model = match model_client(store, config).await? {
        Some(client) => Some(client.check().await),
        None => None,
    };
    let telegram = match telegram_delivery(config)? {
        Some(telegram) => Some(telegram.check().await),
        None => None,
    };

    let mut report = BTreeMap::new();
    let mut healthy = true;
    for (name, outcome) in [("openrouter", model), ("telegram", telegram)] {
        let (line, ok) = check_status(outcome);
        healthy &= ok;
        report.insert(name, line);
    }
    print_json(&report)?;
    if !healthy {
        bail!("one or more adapters failed their check");
    }
    Ok(())
}

async fn settings_command(store: &Store, command: SettingsCommand) -> Result<()> {
    match command {
        SettingsCommand::Get { key } => match store.get_setting(&key).await? {
            Some(setting) => print_json(&setting)?,
            None => bail!("setting {key} is not set"),
        },
        SettingsCommand::Set {
            key,
            value,
            description,
        } => print_json(
            &store
                .upsert_setting(&key, &value, description.as_deref())
                .await?,
        )?,
        SettingsCommand::List => print_json(&store.list_settings().await?)?,
    }
    Ok(())
}

fn media_item(path: &str) -> MediaItem {
    let extension = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let kind = match extension.as_str() {
        "jpg" | "jpeg" | "png" | "webp" => MediaKind::Photo,
        "mp4" | "mov" | "webm" | "gif" => MediaKind::Video,
        _ => MediaKind::Document,
    };
    MediaItem::new(kind, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_kind_follows_extension() {
        assert_eq!(media_item("a/b.JPG").kind, MediaKind::Photo);
        assert_eq!(media_item("clip.mp4").kind, MediaKind::Video);
        assert_eq!(media_item("report.pdf").kind, MediaKind::Document);
    }

    #[test]
    fn catalog_default_overrides_configured_model() {
        let default = AiModel {
            id: 1,
            name: "Haiku".into(),
            model_id: "anthropic/claude-3-haiku".into(),
            description: None,
            is_active: true,
            is_default: true,
            created_at: Utc::now(),
            updated_at: None,
        };
        assert_eq!(
            chosen_model(Some(&default), "openai/gpt-4o-mini"),
            "anthropic/claude-3-haiku"
        );
        assert_eq!(chosen_model(None, "openai/gpt-4o-mini"), "openai/gpt-4o-mini");
    }

    #[tokio::test]
    async fn model_client_follows_the_catalog() {
        let store = Store::open_in_memory().await.unwrap();
        let mut config = RelayConfig::from_env();
        config.openrouter_api_key = None;
        assert!(model_client(&store, &config).await.unwrap().is_none());

        config.openrouter_api_key = Some("key".into());
        store
            .create_ai_model(&NewAiModel {
                name: "Mini".into(),
                model_id: "openai/gpt-4o-mini".into(),
                description: None,
                is_active: true,
                is_default: true,
            })
            .await
            .unwrap();
        let client = model_client(&store, &config).await.unwrap().unwrap();
        assert_eq!(client.model(), "openai/gpt-4o-mini");
    }

    #[test]
    fn check_report_lines() {
        assert_eq!(check_status::<String>(None), ("not configured".to_string(), true));
        assert_eq!(check_status::<String>(Some(Ok(()))), ("ok".to_string(), true));
        let (line, ok) = check_status(Some(Err("authentication failed: 401")));
        assert!(!ok);
        assert!(line.contains("401"));
    }

    #[test]
    fn improve_and_models_commands_parse() {
        let cli = Cli::parse_from(["relay-cli", "post", "improve", "7", "--prompt", "make it punchy"]);
        assert!(matches!(
            cli.command,
            Some(Commands::Post(PostCommand::Improve { id: 7, ref prompt })) if prompt == "make it punchy"
        ));
        let cli = Cli::parse_from(["relay-cli", "models", "add", "openai/gpt-4o", "--default"]);
        assert!(matches!(
            cli.command,
            Some(Commands::Models(ModelsCommand::Add { default: true, .. }))
        ));
        let cli = Cli::parse_from(["relay-cli", "models", "set-default", "3"]);
        assert!(matches!(
            cli.command,
            Some(Commands::Models(ModelsCommand::SetDefault { id: 3 }))
        ));
    }

    #[test]
    fn worker_flag_parses_kinds() {
        let cli = Cli::parse_from(["relay-cli", "run", "--worker", "scraper", "--worker", "Publisher"]);
        match cli.command {
            Some(Commands::Run { workers, start }) => {
                assert_eq!(workers, vec![WorkerKind::Scraper, WorkerKind::Publisher]);
                assert!(!start);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
