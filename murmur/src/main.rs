//! Murmur -- line-mode chat client.
//!
//! Reads commands from stdin and prints conversation activity to stdout.
//! Logs go to a file so they do not interleave with the chat.
//!
//! ```bash
//! cargo run --bin murmur -- --server-url ws://127.0.0.1:9000/ws \
//!     --token t-alice --peer bob
//! ```
//!
//! Type a line to send it. Commands: `/join <user>`, `/leave`, `/read`,
//! `/more`, `/list`, `/typing`, `/retry <n>`, `/reconnect`, `/quit`.

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_appender::non_blocking::WorkerGuard;

use murmur::client::{ChatClient, ClientUpdate};
use murmur::config::{CliArgs, ClientConfig};
use murmur::controller::{ChatController, Delivery, ViewMessage};
use murmur_proto::event::ServerEvent;
use murmur_proto::message::UserId;

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    let Some(options) = config.to_options() else {
        eprintln!("No token configured: pass --token or set MURMUR_TOKEN");
        std::process::exit(1);
    };

    let client = match ChatClient::connect(options).await {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Could not connect to {}: {e}", config.server_url);
            std::process::exit(1);
        }
    };
    println!("Connected as {} ({})", client.user().display_name, client.user().id);

    let me = client.user().id.clone();
    let printer = client.subscribe();
    let updates = client.subscribe();
    let controller = Arc::new(ChatController::new(client, me.clone()));
    tokio::spawn(Arc::clone(&controller).run_updates(updates));
    tokio::spawn(print_updates(printer, me));

    if let Some(peer) = config.peer.as_deref() {
        join(&controller, peer).await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "stdin read failed");
                break;
            }
        };
        if !run_command(&controller, line.trim()).await {
            break;
        }
    }

    let _ = controller.stop_typing().await;
    controller.api().shutdown().await;
    tracing::info!("murmur exiting");
}

/// Handle one input line. Returns `false` to quit.
async fn run_command(controller: &ChatController<ChatClient>, line: &str) -> bool {
    let (command, arg) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "" => {}
        "/quit" => return false,
        "/join" => join(controller, arg.trim()).await,
        "/leave" => report(controller.leave_chat().await),
        "/read" => match controller.mark_as_read().await {
            Ok(updated) => println!("-- marked {updated} message(s) read"),
            Err(e) => println!("!! {e}"),
        },
        "/more" => match controller.load_more_messages().await {
            Ok(0) => println!("-- no older messages"),
            Ok(_) => print_messages(&controller.messages()),
            Err(e) => println!("!! {e}"),
        },
        "/list" => match controller.refresh_conversations().await {
            Ok(()) => {
                for c in controller.conversations() {
                    println!(
                        "   {:<16} {:>3} unread  {}",
                        c.peer.display_name, c.unread_count, c.last_message.content
                    );
                }
            }
            Err(e) => println!("!! {e}"),
        },
        "/typing" => report(controller.start_typing().await),
        "/retry" => match arg.trim().parse::<u64>() {
            Ok(local_id) => report(controller.retry(local_id).await.map(|_| ())),
            Err(_) => println!("!! usage: /retry <n>"),
        },
        "/reconnect" => controller.api().reconnect().await,
        _ if command.starts_with('/') => println!("!! unknown command {command}"),
        _ => match controller.send_message(line).await {
            Ok(_) => {}
            Err(e) if e.is_retryable() => {
                let failed = controller
                    .messages()
                    .into_iter()
                    .rev()
                    .find(|m| matches!(m.delivery, Delivery::FailedRetryable(_)));
                match failed {
                    Some(m) => println!("!! {e} -- /retry {} to resend", m.local_id),
                    None => println!("!! {e}"),
                }
            }
            Err(e) => println!("!! {e}"),
        },
    }
    true
}

async fn join(controller: &ChatController<ChatClient>, peer: &str) {
    let peer = match UserId::parse(peer) {
        Ok(peer) => peer,
        Err(e) => {
            println!("!! {e}");
            return;
        }
    };
    match controller.join_chat(&peer).await {
        Ok(()) => {
            println!("-- chatting with {peer}");
            print_messages(&controller.messages());
        }
        Err(e) => println!("!! {e}"),
    }
}

fn report(result: Result<(), murmur::error::ClientError>) {
    if let Err(e) = result {
        println!("!! {e}");
    }
}

fn print_messages(messages: &[ViewMessage]) {
    for m in messages {
        let marker = match m.delivery {
            Delivery::Pending => " (sending)",
            Delivery::FailedRetryable(_) => " (failed)",
            Delivery::Confirmed if m.message.read => " (read)",
            Delivery::Confirmed => "",
        };
        println!("   [{}] {}: {}{marker}", m.local_id, m.message.sender_id, m.message.content);
    }
}

/// Print pushes as they arrive.
async fn print_updates(mut updates: broadcast::Receiver<ClientUpdate>, me: UserId) {
    loop {
        let update = match updates.recv().await {
            Ok(update) => update,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match update {
            ClientUpdate::Status(status) => println!("-- {status}"),
            ClientUpdate::Event(ServerEvent::NewMessage { message }) if message.sender_id != me => {
                println!("   {}: {}", message.sender_id, message.content);
            }
            ClientUpdate::Event(ServerEvent::UserTyping {
                user_id,
                is_typing: true,
            }) => println!("-- {user_id} is typing"),
            ClientUpdate::Event(ServerEvent::MessagesRead { read_by }) => {
                println!("-- {read_by} read your messages");
            }
            ClientUpdate::Event(_) => {}
        }
    }
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("murmur.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}
