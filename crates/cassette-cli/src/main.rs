use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use cassette_host::{
    CassetteLoader, CassetteSource, EventDeduplicator, LoaderConfig, NormalizedMessage,
};

/// Load a WebAssembly cassette and talk to it.
#[derive(Debug, Parser)]
#[command(name = "cassette", version)]
struct Cli {
    /// Cassette path (`.wasm`, or `.wat` to assemble) or http(s) URL.
    source: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the raw description JSON.
    Describe,
    /// Print the raw schema JSON.
    Schema,
    /// Send a REQ and keep polling until EOSE.
    Req {
        /// Request message, e.g. '["REQ","sub1",{"kinds":[1]}]'.
        message: String,
        /// Stop after this many calls even without an EOSE.
        #[arg(long, default_value_t = 10, env = "CASSETTE_MAX_ROUNDS")]
        max_rounds: u32,
    },
    /// Send a CLOSE message.
    Close { message: String },
    /// Route any client message by its tag.
    Send { message: String },
    /// Print metadata, resolved exports, and stubbed imports as JSON.
    Info,
}

fn is_final(message: &NormalizedMessage) -> bool {
    match message {
        NormalizedMessage::EndOfStream { .. } => true,
        NormalizedMessage::EventBatch(events) => events.is_empty(),
        _ => false,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let loader = CassetteLoader::new(LoaderConfig::from_env());
    let source = CassetteSource::parse(&cli.source);
    let mut cassette = loader
        .load(&source)
        .await
        .with_context(|| format!("failed to load cassette from {}", cli.source))?;

    match cli.command {
        Command::Describe => println!("{}", cassette.describe()?),
        Command::Schema => println!("{}", cassette.get_schema()?),
        Command::Req {
            message,
            max_rounds,
        } => {
            for round in 1..=max_rounds {
                let response = cassette.req(&message);
                println!("{response}");
                if is_final(&response) {
                    tracing::debug!(
                        round,
                        tracked_events = cassette.deduplicator().map_or(0, EventDeduplicator::len),
                        "subscription finished"
                    );
                    break;
                }
            }
        }
        Command::Close { message } => println!("{}", cassette.close(&message)),
        Command::Send { message } => println!("{}", cassette.send(&message)),
        Command::Info => {
            let info = serde_json::json!({
                "id": cassette.id(),
                "file_name": cassette.file_name(),
                "metadata": cassette.metadata(),
                "capabilities": cassette.capabilities(),
                "stubbed_imports": cassette.stubbed_imports(),
            });
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_req() {
        let cli = Cli::try_parse_from([
            "cassette",
            "feed.wasm",
            "req",
            r#"["REQ","s",{}]"#,
            "--max-rounds",
            "3",
        ])
        .unwrap();
        assert_eq!(cli.source, "feed.wasm");
        assert!(matches!(cli.command, Command::Req { max_rounds: 3, .. }));
    }

    #[test]
    fn test_final_messages() {
        assert!(is_final(&NormalizedMessage::EndOfStream {
            subscription_id: Some("s".into()),
            raw: None,
        }));
        assert!(is_final(&NormalizedMessage::EventBatch(vec![])));
        assert!(!is_final(&NormalizedMessage::notice("hi")));
    }
}
