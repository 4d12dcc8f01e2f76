//! chatsync - command-line client for streamed chat conversations

mod config;

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use chatsync_engine::message::SnapshotContent;
use chatsync_engine::{
    ControllerConfig, InMemoryTaskStore, StreamController, StreamOutcome, SyncEvent, SyncManager,
    TaskOperationBridge, TaskStore, sync_history,
};
use chatsync_wire::{
    ChatRequest, ChatTransport, HttpTransport, ReplayTransport, RetrievalClient,
};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use serde_json::json;
use tracing_subscriber::EnvFilter;

/// chatsync - stream and synchronize chat conversations
#[derive(Parser, Debug)]
#[command(name = "chatsync")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,

    /// Backend base URL (overrides the config file)
    #[arg(long, global = true)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a message and stream the reply
    Send {
        message: String,

        /// Continue an existing conversation
        #[arg(short, long)]
        conversation: Option<String>,
    },
    /// Feed a recorded event stream through the engine
    Replay {
        file: PathBuf,

        /// Read the file in chunks of this many bytes
        #[arg(long)]
        chunk_size: Option<usize>,
    },
    /// Fetch the stored history and tasks of a conversation
    History { conversation: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries the JSON output
    let filter = if args.verbose {
        EnvFilter::new("chatsync=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    if args.init_config {
        match config::Config::init() {
            Ok(path) => {
                println!("Config file created at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let mut cfg = config::Config::load();
    if let Some(base_url) = args.base_url {
        cfg.base_url = Some(base_url);
    }

    match args.command {
        Some(Command::Send {
            message,
            conversation,
        }) => run_send(&cfg, message, conversation).await,
        Some(Command::Replay { file, chunk_size }) => run_replay(&cfg, file, chunk_size).await,
        Some(Command::History { conversation }) => run_history(&cfg, &conversation).await,
        None => {
            eprintln!("No command given. Run `chatsync --help` for usage.");
            std::process::exit(2);
        }
    }
}

fn retrieval_client(cfg: &config::Config) -> Arc<RetrievalClient> {
    Arc::new(RetrievalClient::new(cfg.base_url(), cfg.endpoints()))
}

/// Manager wired to a task store through the operation bridge
fn build_manager(tasks: Arc<InMemoryTaskStore>) -> Arc<Mutex<SyncManager>> {
    let manager =
        SyncManager::default().with_task_bridge(TaskOperationBridge::new(tasks as Arc<dyn TaskStore>));
    Arc::new(Mutex::new(manager))
}

async fn run_send(
    cfg: &config::Config,
    message: String,
    conversation: Option<String>,
) -> anyhow::Result<()> {
    let client = retrieval_client(cfg);
    let tasks = Arc::new(InMemoryTaskStore::new().with_source(client));
    let manager = build_manager(tasks.clone());
    let transport: Arc<dyn ChatTransport> = Arc::new(HttpTransport::new(
        cfg.base_url(),
        &cfg.endpoints().chat_path,
    ));
    let controller = StreamController::new(transport, manager.clone())
        .with_task_store(tasks.clone())
        .with_config(ControllerConfig {
            recovery_delay: cfg.recovery_delay(),
        });

    let mut request = ChatRequest::new(message);
    request.conversation_id = conversation;
    request.user_id = cfg.user_id.clone();
    request.system_prompt = cfg.system_prompt.clone();

    let request_id = uuid::Uuid::new_v4();
    tracing::info!(%request_id, conversation = ?request.conversation_id, "Sending message");

    let printer = spawn_printer(&manager);

    // Ctrl-C stops the stream; received content stays
    let handle = controller.handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.stop();
        }
    });

    let result = controller.run(&request).await;
    interrupt.abort();
    printer.abort();
    println!();

    match result {
        Ok(StreamOutcome::Cancelled) => eprintln!("[Stopped]"),
        Ok(StreamOutcome::Completed) => {}
        Err(e) => eprintln!("Error: {}", e),
    }

    let output = {
        let manager = manager.lock();
        let conversations: Vec<_> = manager.conversations().collect();
        serde_json::to_string_pretty(&conversations)?
    };
    println!("{}", output);
    Ok(())
}

async fn run_replay(
    cfg: &config::Config,
    file: PathBuf,
    chunk_size: Option<usize>,
) -> anyhow::Result<()> {
    let tasks = Arc::new(InMemoryTaskStore::new());
    let manager = build_manager(tasks.clone());

    let mut transport = ReplayTransport::new(file);
    if let Some(size) = chunk_size {
        transport = transport.with_chunk_size(size);
    }
    let controller = StreamController::new(Arc::new(transport), manager.clone())
        .with_config(ControllerConfig {
            recovery_delay: cfg.recovery_delay(),
        });

    if let Err(e) = controller.run(&ChatRequest::default()).await {
        eprintln!("Error: {}", e);
    }

    let output = {
        let manager = manager.lock();
        let conversations: Vec<_> = manager.conversations().collect();
        let task_lists: HashMap<&str, _> = conversations
            .iter()
            .filter_map(|c| tasks.get(&c.id).map(|list| (c.id.as_str(), list)))
            .collect();
        serde_json::to_string_pretty(&json!({
            "conversations": conversations,
            "tasks": task_lists,
        }))?
    };
    println!("{}", output);
    Ok(())
}

async fn run_history(cfg: &config::Config, conversation: &str) -> anyhow::Result<()> {
    let client = retrieval_client(cfg);
    let tasks = InMemoryTaskStore::new().with_source(client.clone());
    let manager = Mutex::new(SyncManager::default());

    let count = sync_history(client.as_ref(), &manager, conversation).await?;
    tracing::debug!(conversation, count, "History loaded");
    tasks.reload(conversation).await?;

    let output = {
        let manager = manager.lock();
        serde_json::to_string_pretty(&json!({
            "conversation": manager.conversation(conversation),
            "tasks": tasks.get(conversation),
        }))?
    };
    println!("{}", output);
    Ok(())
}

/// Print streamed text as it grows
fn spawn_printer(manager: &Arc<Mutex<SyncManager>>) -> tokio::task::JoinHandle<()> {
    let mut receiver = manager.lock().subscribe();
    tokio::spawn(async move {
        let mut printed: HashMap<String, usize> = HashMap::new();
        loop {
            let event = match receiver.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Printer lagged behind");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            match event {
                SyncEvent::SnapshotUpdated { snapshot } => {
                    let id = snapshot.display_id.as_str().to_string();
                    match &snapshot.content {
                        SnapshotContent::Text { text } => {
                            let seen = printed.entry(id).or_insert(0);
                            if text.len() > *seen && text.is_char_boundary(*seen) {
                                print!("{}", &text[*seen..]);
                                io::stdout().flush().ok();
                                *seen = text.len();
                            }
                        }
                        SnapshotContent::Reasoning { visible: true, .. } => {
                            if printed.insert(id, 0).is_none() {
                                eprintln!("[Thinking...]");
                            }
                        }
                        SnapshotContent::ToolCall { calls } => {
                            for call in calls {
                                let key = format!("{}#{}", id, call.index);
                                if !call.name.is_empty() && printed.insert(key, 0).is_none() {
                                    eprintln!("\n[{}...]", call.name);
                                }
                            }
                        }
                        _ => {}
                    }
                }
                SyncEvent::Error { message, .. } => eprintln!("\nError: {}", message),
                SyncEvent::UsageUpdated { usage, .. } => {
                    eprintln!(
                        "\n[Tokens: {} in, {} out]",
                        usage.input_tokens, usage.output_tokens
                    );
                }
                _ => {}
            }
        }
    })
}
