use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::time::{Duration, Instant, sleep};
use tracing::{error, info};

use courier_core::counters::{CountMode, CounterStore};
use courier_core::domain::{LabelId, QueuedTask, TaskAction, TaskResult, UserId};
use courier_core::ports::{ManualConnectivity, TaskHandler};
use courier_core::{
    BuildError, ConfigError, CoordinatorBuilder, PersistenceMode, QueueConfig, QueueError,
};

const INBOX: &str = "0";

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("encode json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("background window closed before completing")]
    WindowDropped,
}

#[derive(Parser)]
#[command(name = "courier", about = "Offline-first mutation queue")]
struct Args {
    /// TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides `data_dir` from the config and COURIER_DATA_DIR
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Keep every store in memory
    #[arg(long)]
    ephemeral: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Queue a draft chain and a mark-read, then drain them in a background window
    Demo {
        #[arg(long, default_value = "demo-user")]
        user: String,

        /// Start offline and reconnect after this many milliseconds
        #[arg(long)]
        offline_ms: Option<u64>,

        /// Length of the background window
        #[arg(long, default_value_t = 30)]
        budget_secs: u64,

        /// Attempts the mark-read fails with a retry before succeeding
        #[arg(long, default_value_t = 1)]
        failures: u32,
    },
    /// Print both lanes as JSON without draining them
    Inspect,
    /// Print the cached counter record for one label
    Counters {
        #[arg(long)]
        user: String,

        #[arg(long, default_value = INBOX)]
        label: String,

        #[arg(long)]
        conversation: bool,
    },
}

/// デモ用のセッション：リモート API の代わりに少し待ってログを出すだけ
struct DemoSession {
    user_id: UserId,
    counters: Arc<CounterStore>,
    remaining_failures: AtomicU32,
}

#[async_trait]
impl TaskHandler for DemoSession {
    fn user_id(&self) -> &UserId {
        &self.user_id
    }

    async fn handle_task(&self, task: QueuedTask) -> TaskResult {
        sleep(Duration::from_millis(50)).await;

        match &task.action {
            TaskAction::MarkRead { item_ids, .. } => {
                let left = self.remaining_failures.load(Ordering::Relaxed);
                if left > 0 {
                    self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
                    info!(task_id = %task.id, left, "intentional failure, retrying");
                    return TaskResult::retry();
                }
                let delta = i32::try_from(item_ids.len()).unwrap_or(i32::MAX);
                let unread = self
                    .counters
                    .apply_unread_delta(&LabelId::new(INBOX), &self.user_id, CountMode::Single, -delta)
                    .await;
                println!("marked {} read, inbox unread={unread}", item_ids.len());
            }
            action => println!("{} on {:?} done", action.name(), task.target_id),
        }
        TaskResult::none()
    }
}

fn load_config(args: &Args) -> Result<QueueConfig, CliError> {
    let config = match &args.config {
        Some(path) => QueueConfig::load(path)?,
        None => QueueConfig::default(),
    };
    let mut config = config.with_env_overrides()?;
    if let Some(dir) = &args.data_dir {
        config = config.with_data_dir(dir);
    }
    if args.ephemeral {
        config = config.with_persistence(PersistenceMode::Disabled);
    }
    Ok(config)
}

async fn demo(
    config: QueueConfig,
    user: String,
    offline_ms: Option<u64>,
    budget_secs: u64,
    failures: u32,
) -> Result<(), CliError> {
    let connectivity = Arc::new(ManualConnectivity::new(offline_ms.is_none()));
    let queue = CoordinatorBuilder::new(config)
        .connectivity(connectivity.clone())
        .build()
        .await?;
    let user_id = UserId::new(user);

    queue
        .counters()
        .update_unread_count(&LabelId::new(INBOX), &user_id, 3, 10, CountMode::Single, true)
        .await;

    queue
        .register_handler(Arc::new(DemoSession {
            user_id: user_id.clone(),
            counters: Arc::clone(queue.counters()),
            remaining_failures: AtomicU32::new(failures),
        }))
        .await?;

    let actions = [
        ("msg-1", TaskAction::SaveDraft {
            message_object_uri: "local://drafts/1".into(),
        }),
        ("msg-1", TaskAction::UploadAttachment {
            attachment_object_uri: "local://attachments/1".into(),
        }),
        ("msg-1", TaskAction::Send {
            message_object_uri: "local://drafts/1".into(),
        }),
        ("msg-2", TaskAction::MarkRead {
            item_ids: vec!["msg-2".into()],
            object_ids: vec!["local://messages/2".into()],
        }),
    ];
    for (target, action) in actions {
        queue
            .add_task(queue.new_task(target, action, user_id.clone()), false)
            .await?;
    }
    queue
        .queue_read(|_| println!("read block ran after the writes"))
        .await?;

    if let Some(ms) = offline_ms {
        let connectivity = connectivity.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(ms)).await;
            info!("network back");
            connectivity.set_connected(true);
        });
    }

    let done = queue
        .background_fetch(Instant::now() + Duration::from_secs(budget_secs))
        .await?;
    done.await.map_err(|_| CliError::WindowDropped)?;

    let activity = queue.activity();
    println!(
        "window closed: message={:?} ({}) misc={:?} ({}) reads={}",
        activity.message,
        activity.message_count,
        activity.misc,
        activity.misc_count,
        activity.read_count
    );
    Ok(())
}

async fn inspect(config: QueueConfig) -> Result<(), CliError> {
    // offline: nothing is dispatched while we look
    let queue = CoordinatorBuilder::new(config)
        .connectivity(Arc::new(ManualConnectivity::offline()))
        .build()
        .await?;

    let lanes = serde_json::json!({
        "message": queue.message_tasks().await?,
        "misc": queue.misc_tasks().await?,
    });
    println!("{}", serde_json::to_string_pretty(&lanes)?);
    Ok(())
}

async fn counters(
    config: QueueConfig,
    user: String,
    label: String,
    conversation: bool,
) -> Result<(), CliError> {
    let queue = CoordinatorBuilder::new(config)
        .connectivity(Arc::new(ManualConnectivity::offline()))
        .build()
        .await?;
    let mode = if conversation {
        CountMode::Conversation
    } else {
        CountMode::Single
    };

    let record = queue
        .counters()
        .last_update(&LabelId::new(label), &UserId::new(user), mode)
        .await;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

async fn run(args: Args) -> Result<(), CliError> {
    let config = load_config(&args)?;
    match args.command {
        Command::Demo {
            user,
            offline_ms,
            budget_secs,
            failures,
        } => demo(config, user, offline_ms, budget_secs, failures).await,
        Command::Inspect => inspect(config).await,
        Command::Counters {
            user,
            label,
            conversation,
        } => counters(config, user, label, conversation).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier_core=info,courier_cli=info".into()),
        )
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "courier failed");
            ExitCode::FAILURE
        }
    }
}
