//! Keepsake CLI
//!
//! Long-term memory for a conversational agent: capture facts, inspect the
//! memory document and history log, consolidate saved transcripts, or serve
//! all of it to a front end over a JSON-lines stdio bridge.

use clap::{Parser, Subcommand};
use keepsake::bridge::Bridge;
use keepsake::config::{keepsake_home, load_config};
use keepsake::provider::Role;
use keepsake::{
    ChatProvider, ConsolidationOutcome, Consolidator, FactExtractor, KeepsakeConfig, MemoryStore,
    OpenAiProvider, SessionStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Keepsake - durable memory for conversational agents
#[derive(Parser, Debug)]
#[command(name = "keepsake")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Keepsake home directory (defaults to $KEEPSAKE_HOME or ~/.keepsake)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Override the workspace directory from config
    #[arg(short = 'w', long, global = true)]
    workspace: Option<PathBuf>,

    /// Override the consolidation model from config
    #[arg(short, long, global = true)]
    model: Option<String>,

    /// Verbose output: debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Save one fact to the relationship section of long-term memory
    Remember {
        #[arg(required = true, trailing_var_arg = true)]
        fact: Vec<String>,
    },

    /// Extract facts from a user message
    Capture {
        /// Also append the message to this session's transcript
        #[arg(long)]
        session: Option<String>,

        #[arg(required = true, trailing_var_arg = true)]
        text: Vec<String>,
    },

    /// Print the memory context block
    Context,

    /// Print history entries, optionally filtered
    History {
        /// Case-insensitive substring filter
        #[arg(long)]
        grep: Option<String>,
    },

    /// Consolidate a saved session into memory
    Consolidate {
        #[arg(long)]
        session: String,

        /// Fold the entire transcript regardless of the window
        #[arg(long)]
        archive_all: bool,
    },

    /// List saved sessions
    Sessions,

    /// Serve memory operations over stdin/stdout (JSON lines)
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays clean for output and the bridge
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let home = match cli.home {
        Some(home) => home,
        None => keepsake_home()?,
    };
    let mut config = load_config(&home).await?;
    if let Some(workspace) = cli.workspace {
        config.workspace = workspace;
    }
    if let Some(model) = cli.model {
        config = config.with_model(model);
    }
    info!("Keepsake home: {:?}", home);

    run(cli.command, config).await
}

async fn run(command: Command, config: KeepsakeConfig) -> anyhow::Result<()> {
    let store = MemoryStore::new(&config.workspace);

    match command {
        Command::Remember { fact } => {
            let extractor = FactExtractor::new(store);
            let fact = fact.join(" ");
            if extractor.remember_fact(&fact).await? {
                println!("Remembered: {}", fact.trim());
            } else {
                println!("Already known or empty, nothing saved");
            }
        }

        Command::Capture { session, text } => {
            let extractor = FactExtractor::new(store);
            let text = text.join(" ");
            for fact in extractor.extract(&text) {
                println!("candidate: {}", fact);
            }
            let saved = extractor.capture_from_user_message(&text).await?;
            println!("Saved {} new fact(s)", saved);

            if let Some(key) = session {
                let sessions = SessionStore::new(&config.workspace).await?;
                let mut session = sessions.get_or_create(&key).await?;
                session.add_message(Role::User, text.trim(), Vec::new());
                sessions.save(&session).await?;
            }
        }

        Command::Context => {
            let context = store.get_memory_context().await?;
            if !context.is_empty() {
                println!("{}", context);
            }
        }

        Command::History { grep } => {
            let entries = match grep {
                Some(query) => store.search_history(&query).await?,
                None => store.read_history().await?,
            };
            for entry in entries {
                println!("{}\n", entry);
            }
        }

        Command::Consolidate {
            session: key,
            archive_all,
        } => {
            let provider = OpenAiProvider::new(&config.provider)?;
            let sessions = SessionStore::new(&config.workspace).await?;
            let Some(mut session) = sessions.load(&key).await? else {
                anyhow::bail!("No saved session named '{}'", key);
            };

            let consolidator = Consolidator::new(store);
            let outcome = consolidator
                .consolidate(
                    &session.messages,
                    &mut session.last_consolidated,
                    &provider,
                    &config.model,
                    &config.policy(archive_all),
                )
                .await;

            match outcome {
                ConsolidationOutcome::Success { consolidated, .. } => {
                    sessions.save(&session).await?;
                    println!(
                        "Consolidated {} message(s); last_consolidated={}",
                        consolidated, session.last_consolidated
                    );
                }
                ConsolidationOutcome::NoOp => println!("Nothing to consolidate"),
                failure => anyhow::bail!("Consolidation failed: {:?}", failure),
            }
        }

        Command::Sessions => {
            let sessions = SessionStore::new(&config.workspace).await?;
            for key in sessions.list_sessions().await? {
                println!("{}", key);
            }
        }

        Command::Serve => {
            let provider: Arc<dyn ChatProvider> = Arc::new(OpenAiProvider::new(&config.provider)?);
            let bridge = Bridge::new(config, provider).await?;
            bridge
                .run(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
                .await?;
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
    fn test_parse_consolidate() {
        let cli = Cli::parse_from([
            "keepsake",
            "--verbose",
            "consolidate",
            "--session",
            "overlay:default",
            "--archive-all",
        ]);
        assert!(cli.verbose);
        match cli.command {
            Command::Consolidate {
                session,
                archive_all,
            } => {
                assert_eq!(session, "overlay:default");
                assert!(archive_all);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_capture_joins_words() {
        let cli = Cli::parse_from(["keepsake", "capture", "my", "name", "is", "Sam"]);
        match cli.command {
            Command::Capture { session, text } => {
                assert!(session.is_none());
                assert_eq!(text.join(" "), "my name is Sam");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
