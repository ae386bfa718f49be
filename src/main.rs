use pilotwire::client::{PilotClient, DEFAULT_SUMMARY_MESSAGES};
use pilotwire::config::{self, Config};
use pilotwire::functions::FunctionRegistry;
use pilotwire::logs;
use pilotwire::runs::Answer;
use pilotwire::tools::builtins;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "pilotwire", version, about = "Talk to pilot-backed OpenAI assistants")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a new thread and ask a pilot
    Ask {
        /// Pilot name
        #[arg(long)]
        pilot: String,
        /// User the thread and assistant belong to
        #[arg(long)]
        user: Option<String>,
        /// Message text
        text: String,
    },
    /// Continue an existing thread
    Reply {
        /// Thread id
        #[arg(long)]
        thread: String,
        /// Pilot to answer with; defaults to the one that answered last
        #[arg(long)]
        pilot: Option<String>,
        /// Message text
        text: String,
    },
    /// Summarize the latest messages of a thread
    Summary {
        #[arg(long)]
        thread: String,
        /// Number of recent messages to include
        #[arg(long, default_value_t = DEFAULT_SUMMARY_MESSAGES)]
        messages: usize,
    },
    /// Rate every configured pilot for a prompt
    Assume {
        /// Thread whose context should be taken into account
        #[arg(long)]
        thread: Option<String>,
        /// Prompt text
        text: String,
    },
    /// List configured pilots
    Pilots,
    /// Delete a thread
    DeleteThread {
        thread: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logs::init(logs::directive_for(cli.verbose));

    let config_path = cli.config.unwrap_or_else(config::default_path);
    info!(path = %config_path.display(), "loading configuration");
    let cfg = Config::load(&config_path).await?;

    let mut functions = FunctionRegistry::new();
    builtins::register(&mut functions);

    let client = PilotClient::from_config(&cfg, functions).context("failed to set up client")?;

    // Ctrl-C abandons the run in flight instead of leaving it running remotely.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling");
                cancel.cancel();
            }
        });
    }

    let result = run(&client, cli.command, &cancel).await;
    if let Err(e) = client.dispose() {
        warn!("failed to dispose client caches: {e}");
    }
    result
}

async fn run(client: &PilotClient, command: Command, cancel: &CancellationToken) -> anyhow::Result<()> {
    match command {
        Command::Ask { pilot, user, text } => {
            let answer = client
                .ask_in_new_thread_with_cancel(&text, &pilot, user.as_deref(), cancel)
                .await?;
            print_answer(&answer);
        }
        Command::Reply {
            thread,
            pilot,
            text,
        } => {
            let answer = client
                .ask_with_cancel(&text, &thread, pilot.as_deref(), cancel)
                .await?;
            print_answer(&answer);
        }
        Command::Summary { thread, messages } => {
            let answer = client.conversation_summary(&thread, messages).await?;
            println!("{}", answer.text);
        }
        Command::Assume { thread, text } => {
            let assumptions = match thread {
                Some(thread) => client.pilot_assumption_in_thread(&text, &thread).await?,
                None => client.pilot_assumption(&text).await?,
            };
            for a in assumptions {
                println!("{:>6.1}%  {}", a.probability_in_percent, a.pilot_name);
            }
        }
        Command::Pilots => {
            for pilot in client.pilots().await {
                let functions: Vec<&str> = pilot
                    .tools()
                    .iter()
                    .filter_map(|t| t.function_name())
                    .collect();
                println!("{}  ({})", pilot.name, pilot.model);
                if !pilot.description.is_empty() {
                    println!("    {}", pilot.description);
                }
                if !functions.is_empty() {
                    println!("    functions: {}", functions.join(", "));
                }
            }
        }
        Command::DeleteThread { thread } => {
            let deleted = client.delete_thread(&thread).await?;
            println!("{}", if deleted { "deleted" } else { "not deleted" });
        }
    }
    Ok(())
}

fn print_answer(answer: &Answer) {
    println!("{}", answer.text);
    eprintln!("thread: {}  assistant: {}", answer.thread_id, answer.assistant_id);
}
