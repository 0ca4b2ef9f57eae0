use std::path::PathBuf;

use clap::Parser;
use llama_chat::{load_config, load_transcript, SessionConfig};
use llama_cli::{run_chat, run_complete, CliResult, RunOptions, RunSummary};
use tracing_subscriber::EnvFilter;

/// llama-chat: incremental chat completion against the scripted engine
#[derive(Parser)]
#[command(name = "llama-chat")]
struct Cli {
    /// Model path passed to the backend.
    #[arg(long, global = true, default_value = "scripted")]
    model: String,

    /// Session configuration file (JSON).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Maximum number of tokens to generate per reply.
    #[arg(short, long, global = true, default_value_t = 128)]
    max_tokens: usize,

    /// Scripted reply; repeat for successive turns.
    #[arg(long = "reply", global = true)]
    replies: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Prefill a transcript, then read further user turns from stdin.
    Chat {
        /// Transcript file: a JSON array of {"role", "content"} objects.
        #[arg(short, long)]
        transcript: PathBuf,
    },
    /// Complete raw text without a chat template.
    Complete {
        /// Input prompt text.
        #[arg(short, long)]
        prompt: String,

        /// Parse control markup in the prompt as special tokens.
        #[arg(long)]
        parse_special: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(summary) => {
            tracing::info!(
                replies = summary.replies,
                full_resets = summary.full_resets,
                used_cells = summary.used_cells,
                "done"
            );
        }
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> CliResult<RunSummary> {
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => SessionConfig::default(),
    };
    let options = RunOptions {
        model: cli.model,
        config,
        max_tokens: cli.max_tokens,
        replies: cli.replies,
    };

    let mut stdout = std::io::stdout().lock();
    match cli.command {
        Command::Chat { transcript } => {
            let turns = load_transcript(&transcript)?;
            run_chat(&options, turns, std::io::stdin().lock(), &mut stdout)
        }
        Command::Complete {
            prompt,
            parse_special,
        } => run_complete(&options, &prompt, parse_special, &mut stdout),
    }
}
