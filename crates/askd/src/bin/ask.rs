//! ask: command-line client for the askd daemon.
//!
//! Collects the query sources (positional words, piped stdin, attachment)
//! and sends them to the daemon, which composes and submits them. The client
//! never merges sources itself, so scripted and interactive use always get
//! the same composition rules.

use anyhow::{Context, Result, bail};
use askd_protocol::{ErrorCode, HistoryFilter, SubmitRequest};
use clap::{Parser, Subcommand};
use std::io::{BufRead, IsTerminal, Read, Write};
use std::path::PathBuf;

use askd::client::{BusError, ChatClient, HistoryClient, UserClient};

#[derive(Debug, Parser)]
#[command(name = "ask", about = "Ask the command-line assistant", version)]
struct Cli {
    /// Directory holding the daemon sockets.
    #[arg(long, value_name = "DIR", default_value = askd_protocol::DEFAULT_SOCKET_DIR)]
    socket_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ask a question.
    Chat {
        /// The question. May be omitted when piping via stdin or attaching a
        /// file.
        query: Vec<String>,

        /// Attach a file as additional context.
        #[arg(short, long, value_name = "PATH")]
        attachment: Option<PathBuf>,

        /// Include the last captured terminal output.
        #[arg(short = 'w', long)]
        with_output: bool,

        /// Interactive mode: a conversation loop within one session.
        #[arg(short, long, conflicts_with = "query")]
        interactive: bool,
    },

    /// Show or manage conversation history.
    History {
        /// Show only the oldest entry.
        #[arg(long, conflicts_with_all = ["last", "filter", "clear"])]
        first: bool,

        /// Show only the newest entry.
        #[arg(long, conflicts_with_all = ["filter", "clear"])]
        last: bool,

        /// Show entries containing a keyword.
        #[arg(long, value_name = "KEYWORD", conflicts_with = "clear")]
        filter: Option<String>,

        /// Match the keyword case-sensitively.
        #[arg(long, requires = "filter")]
        case_sensitive: bool,

        /// Delete all history entries.
        #[arg(long)]
        clear: bool,
    },

    /// Print the logical user id history is scoped to.
    Whoami,

    /// Check that the daemon endpoints respond.
    Ping,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        render_error(&err);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Chat {
            query,
            attachment,
            with_output,
            interactive,
        } => {
            let client = ChatClient::new(cli.socket_dir.join(askd_protocol::CHAT_SOCKET));
            if interactive {
                run_interactive(&client).await
            } else {
                run_chat(&client, query, attachment, with_output).await
            }
        }
        Command::History {
            first,
            last,
            filter,
            case_sensitive,
            clear,
        } => {
            let client = HistoryClient::new(cli.socket_dir.join(askd_protocol::HISTORY_SOCKET));
            if clear {
                let deleted = client.clear().await?;
                println!("Deleted {deleted} history entries.");
                return Ok(());
            }
            let filter = if first {
                HistoryFilter::First
            } else if last {
                HistoryFilter::Last
            } else if let Some(pattern) = filter {
                HistoryFilter::Keyword {
                    pattern,
                    case_sensitive,
                }
            } else {
                HistoryFilter::All
            };
            let entries = client.list(filter).await?;
            if entries.is_empty() {
                println!("No history entries found.");
                return Ok(());
            }
            for entry in entries {
                println!("[{}] Q: {}", entry.created_at, entry.query_text);
                println!("    A: {}", entry.response_text);
            }
            Ok(())
        }
        Command::Whoami => {
            let client = UserClient::new(cli.socket_dir.join(askd_protocol::USER_SOCKET));
            let id = client.get_id().await?;
            println!("{}", id.user_id);
            Ok(())
        }
        Command::Ping => {
            let chat = ChatClient::new(cli.socket_dir.join(askd_protocol::CHAT_SOCKET));
            let history = HistoryClient::new(cli.socket_dir.join(askd_protocol::HISTORY_SOCKET));
            let user = UserClient::new(cli.socket_dir.join(askd_protocol::USER_SOCKET));
            let mut failures = 0;
            for (name, result) in [
                ("chat", chat.ping().await),
                ("history", history.ping().await),
                ("user", user.ping().await),
            ] {
                match result {
                    Ok(()) => println!("{name}: ok"),
                    Err(err) => {
                        println!("{name}: unreachable ({err})");
                        failures += 1;
                    }
                }
            }
            if failures > 0 {
                bail!("{failures} endpoint(s) did not respond");
            }
            Ok(())
        }
    }
}

async fn run_chat(
    client: &ChatClient,
    query: Vec<String>,
    attachment: Option<PathBuf>,
    with_output: bool,
) -> Result<()> {
    let question = if query.is_empty() {
        None
    } else {
        Some(query.join(" "))
    };

    // Piped input only; an attached terminal is not a stdin source.
    let stdin_text = if std::io::stdin().is_terminal() {
        None
    } else {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("reading stdin")?;
        Some(buffer)
    };

    let (response, stored) = client
        .submit(SubmitRequest {
            question,
            stdin: stdin_text,
            attachment,
            use_capture: with_output,
            session_id: None,
        })
        .await?;

    println!("{response}");
    if !stored {
        eprintln!("Warning: the response was not saved to history.");
    }
    Ok(())
}

async fn run_interactive(client: &ChatClient) -> Result<()> {
    if !std::io::stdin().is_terminal() {
        bail!("interactive mode needs a terminal; pipe input without --interactive instead");
    }

    let session_id = client.start_session().await?;
    println!("Interactive mode. Type 'exit' or press Ctrl-D to leave.");

    let stdin = std::io::stdin();
    let mut line = String::new();
    loop {
        print!(">>> ");
        std::io::stdout().flush().ok();
        line.clear();
        if stdin.lock().read_line(&mut line).context("reading input")? == 0 {
            break;
        }
        let question = line.trim();
        if question.is_empty() {
            continue;
        }
        if question == "exit" || question == "quit" {
            break;
        }

        let result = client
            .submit(SubmitRequest {
                question: Some(question.to_string()),
                stdin: None,
                attachment: None,
                use_capture: false,
                session_id: Some(session_id.clone()),
            })
            .await;
        match result {
            Ok((response, stored)) => {
                println!("{response}");
                if !stored {
                    eprintln!("Warning: the response was not saved to history.");
                }
            }
            Err(err) => render_error(&err),
        }
    }

    client.end_session(session_id).await?;
    println!("Session ended.");
    Ok(())
}

/// Render an error with its specific cause, so scripted callers can tell a
/// bad query from an unreachable daemon.
fn render_error(err: &anyhow::Error) {
    if let Some(bus) = err.downcast_ref::<BusError>() {
        let hint = match bus.0.code {
            ErrorCode::EmptyQuery => {
                Some("Provide a question, pipe text via stdin, or attach a file with -a.")
            }
            ErrorCode::PermissionDenied => {
                Some("Your user is not permitted to use the assistant on this machine.")
            }
            ErrorCode::HistoryNotEnabled => {
                Some("History is turned off in the daemon configuration.")
            }
            ErrorCode::BackendTimeout | ErrorCode::BackendUnavailable => {
                Some("The assistant service could not be reached. Try again later.")
            }
            _ => None,
        };
        eprintln!("Error: {}", bus.0.message);
        if let Some(hint) = hint {
            eprintln!("{hint}");
        }
    } else {
        eprintln!("Error: {err:#}");
    }
}
