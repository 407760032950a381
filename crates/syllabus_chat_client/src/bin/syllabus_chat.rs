//! syllabus-chat: command-line client for the course-syllabus chatbot.
//! Reads config, streams the answer to a question to stdout as it arrives,
//! and manages the signed-in user's chat history.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use syllabus_chat_client::model::unique_locators;
use syllabus_chat_client::{
    config, ChatController, ChatError, Client, Config, Conversation, FileStore, Role, StreamEvent,
};

#[derive(Parser, Debug)]
#[command(name = "syllabus-chat")]
#[command(version, about = "Ask the course-syllabus chatbot and manage chat history")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Path to configuration file (default: ~/.syllabus-chat/config.yaml)
    #[arg(short, long, env = "SYLLABUS_CHAT_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Question to ask; read from stdin when omitted
    question: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ask a question, optionally continuing a stored conversation
    Ask {
        question: Option<String>,
        /// Conversation id to continue
        #[arg(long)]
        chat: Option<String>,
    },
    /// Edit the user message at INDEX and ask again
    Edit {
        id: String,
        index: usize,
        content: String,
    },
    /// List active conversations, newest first
    History {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// List archived conversations
    Archived,
    /// Search active conversations by title or message text
    Search { query: String },
    /// Print a stored conversation
    Show { id: String },
    Rename { id: String, title: String },
    Archive { id: String },
    Unarchive { id: String },
    Delete { id: String },
    /// Delete all stored conversations
    Clear,
    /// Publish a read-only copy of a conversation and print its share id
    Share { id: String },
    /// Print a shared conversation
    Shared { share_id: String },
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "syllabus_chat_client=debug"
    } else {
        "syllabus_chat_client=warn"
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn resolve_config_path(flag_or_env: Option<PathBuf>) -> PathBuf {
    // 1. --config <path> flag, 2. SYLLABUS_CHAT_CONFIG (both via clap)
    if let Some(path) = flag_or_env {
        return path;
    }
    // 3. Default path (~/.syllabus-chat/config.yaml)
    config::default_config_path().unwrap_or_else(|| {
        eprintln!("Error: unable to determine config path (set --config or SYLLABUS_CHAT_CONFIG)");
        process::exit(1);
    })
}

/// An explicitly named config must exist; a missing default one means defaults.
fn load_config(path: &Path, explicit: bool) -> Config {
    match config::load(path) {
        Ok(c) => c,
        Err(e) if !explicit && e.is_not_found() => Config::default(),
        Err(e) => {
            eprintln!("Error: failed to load config from {}: {}", path.display(), e);
            process::exit(1);
        }
    }
}

fn read_question(arg: Option<String>) -> String {
    let question = match arg {
        Some(q) => q,
        None => {
            // First line of stdin.
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line).unwrap_or(0);
            line
        }
    };
    let question = question.trim().to_string();
    if question.is_empty() {
        eprintln!("Error: no question provided on stdin");
        process::exit(1);
    }
    question
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let explicit = cli.config.is_some();
    let config_path = resolve_config_path(cli.config.clone());
    let cfg = load_config(&config_path, explicit);

    let command = match cli.command {
        Some(command) => command,
        None => Command::Ask {
            question: cli.question,
            chat: None,
        },
    };

    let client = Client::from_config(&cfg).unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        process::exit(1);
    });
    let store = FileStore::new(cfg.store_path(&config_path));
    let controller = ChatController::new(client, store, cfg.user_identity())
        .with_guest_limit(cfg.guest_message_limit())
        .with_history_limit(cfg.history_limit());

    // The chat model is single-threaded and cooperative.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| {
            eprintln!("Error: failed to create runtime: {}", e);
            process::exit(1);
        });

    let code = rt.block_on(run(controller, command));
    process::exit(code);
}

async fn run(mut controller: ChatController<FileStore>, command: Command) -> i32 {
    let result = match command {
        Command::Ask { question, chat } => {
            let question = read_question(question);
            return ask(&mut controller, chat.as_deref(), &question).await;
        }
        Command::Edit { id, index, content } => {
            return edit(&mut controller, &id, index, &content).await;
        }
        Command::History { limit } => controller
            .history(limit)
            .await
            .map(|chats| print_list(&chats)),
        Command::Archived => controller.archived().await.map(|chats| print_list(&chats)),
        Command::Search { query } => controller.search(&query).await.map(|chats| print_list(&chats)),
        Command::Show { id } => controller
            .open(&id)
            .await
            .map(|view| print_conversation(&view.conversation)),
        Command::Rename { id, title } => controller
            .rename(&id, &title)
            .await
            .map(|c| println!("Renamed {} to {}", c.id, c.title)),
        Command::Archive { id } => controller
            .archive(&id)
            .await
            .map(|c| println!("Archived {}", c.id)),
        Command::Unarchive { id } => controller
            .unarchive(&id)
            .await
            .map(|c| println!("Unarchived {}", c.id)),
        Command::Delete { id } => controller
            .delete(&id)
            .await
            .map(|()| println!("Deleted {}", id)),
        Command::Clear => controller
            .clear_history()
            .await
            .map(|n| println!("Deleted {} conversations", n)),
        Command::Share { id } => controller
            .share(&id)
            .await
            .map(|shared| println!("{}", shared.share_id)),
        Command::Shared { share_id } => controller.open_shared(&share_id).await.map(|shared| {
            println!("{} (viewed {} times)", shared.title, shared.share_count);
            print_messages(&shared.messages);
        }),
    };
    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

/// Write each chunk to stdout as soon as it arrives.
fn print_event(event: &StreamEvent) {
    if let StreamEvent::Chunk(text) = event {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        let _ = write!(out, "{}", text);
        let _ = out.flush();
    }
}

async fn ask(controller: &mut ChatController<FileStore>, chat: Option<&str>, question: &str) -> i32 {
    let result = controller.send(chat, question, print_event).await;
    finish_turn(result)
}

async fn edit(
    controller: &mut ChatController<FileStore>,
    id: &str,
    index: usize,
    content: &str,
) -> i32 {
    let result = controller
        .edit_and_resend(id, index, content, print_event)
        .await;
    finish_turn(result)
}

fn finish_turn(result: Result<syllabus_chat_client::TurnReport, ChatError>) -> i32 {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    // Newline after the answer text.
    let _ = writeln!(out);
    match result {
        Ok(report) => {
            if let Some(sources) = report.sources.as_deref().filter(|s| !s.is_empty()) {
                let _ = writeln!(out, "\nSources:");
                for locator in unique_locators(sources) {
                    let _ = writeln!(out, "  {}", locator);
                }
            }
            if report.persisted.is_some() {
                eprintln!("Conversation: {}", report.conversation_id);
            }
            match report.server_error {
                Some(message) => {
                    eprintln!("Server error: {}", message);
                    1
                }
                None => 0,
            }
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn print_list(chats: &[Conversation]) {
    if chats.is_empty() {
        println!("No conversations.");
        return;
    }
    for chat in chats {
        println!(
            "{}  {}  {}",
            chat.id,
            chat.timestamp.format("%Y-%m-%d %H:%M"),
            chat.title
        );
    }
}

fn print_conversation(conversation: &Conversation) {
    println!("{}", conversation.title);
    print_messages(&conversation.messages);
}

fn print_messages(messages: &[syllabus_chat_client::Message]) {
    for (index, message) in messages.iter().enumerate() {
        let who = match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        println!("[{}] {}: {}", index, who, message.content);
        if let Some(sources) = &message.sources {
            for locator in unique_locators(sources) {
                println!("      - {}", locator);
            }
        }
    }
}
