//! CLI implementation for patrol
//!
//! Builds the pipeline from the global flags and runs one command. All
//! commands output pretty JSON on stdout; logs go to stderr.

use crate::client::ChainClient;
use crate::codec::parse_account;
use crate::config::{load_settings, Settings};
use crate::decoder::EventDecoder;
use crate::fetcher::EventFetcher;
use crate::owner::ChainOwnerLookup;
use crate::protocol::Submission;
use crate::records::MinerKey;
use crate::rpc::HttpTransport;
use crate::runtime::load_versions;
use crate::scoring::{MinerIdentity, MinerScoring};
use crate::store::RocksScoreRepository;
use crate::subgraph::SubgraphBuilder;
use crate::targets::TargetGenerator;
use crate::validation::PayloadValidator;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

/// Bittensor transaction subgraph tool
#[derive(Parser)]
#[command(name = "patrol")]
#[command(about = "Build, validate and score transaction subgraphs from a Subtensor archive node")]
pub struct Cli {
    /// Archive node JSON-RPC endpoint
    #[arg(short, long, default_value = "http://127.0.0.1:9944")]
    rpc_url: String,

    /// Runtime versions file (version -> block range)
    #[arg(short, long, default_value = "runtime_versions.json")]
    versions: PathBuf,

    /// Settings file overriding the defaults (JSON)
    #[arg(short, long)]
    settings: Option<PathBuf>,

    /// Path to the RocksDB score database directory
    #[arg(short, long, default_value = "./scores_db")]
    db_path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build the subgraph around an account at a block
    Subgraph {
        /// SS58 address of the target account
        #[arg(long)]
        target: String,
        /// Target block number
        #[arg(long)]
        block: u64,
    },
    /// Validate a subgraph payload against the chain
    Validate {
        /// Payload file (JSON)
        #[arg(long)]
        payload: PathBuf,
        /// SS58 address the payload was requested for
        #[arg(long)]
        target: String,
        /// Miner uid
        #[arg(long)]
        uid: u16,
    },
    /// Validate a payload, score it and store the score
    Score {
        /// Payload file (JSON)
        #[arg(long)]
        payload: PathBuf,
        /// SS58 address the payload was requested for
        #[arg(long)]
        target: String,
        /// Miner uid
        #[arg(long)]
        uid: u16,
        /// Miner coldkey
        #[arg(long)]
        coldkey: String,
        /// Miner hotkey
        #[arg(long)]
        hotkey: String,
        /// Seconds the miner took to answer
        #[arg(long)]
        response_time: f64,
        /// Scoring round identifier (random when omitted)
        #[arg(long)]
        batch_id: Option<Uuid>,
    },
    /// Pick random accounts and blocks to query miners about
    Targets {
        /// Number of targets
        #[arg(long, default_value_t = 1)]
        count: usize,
        /// Seed for reproducible sampling
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Compute weights from the stored moving averages
    Weights {
        /// Active miners as hotkey:uid
        #[arg(long, num_args = 1.., value_parser = parse_miner_key)]
        active: Vec<MinerKey>,
    },
}

/// Parse `hotkey:uid`.
fn parse_miner_key(s: &str) -> Result<MinerKey, String> {
    let (hotkey, uid) = s
        .rsplit_once(':')
        .ok_or_else(|| format!("expected hotkey:uid, got {}", s))?;
    let uid = uid.parse().map_err(|e| format!("invalid uid {}: {}", uid, e))?;
    Ok(MinerKey::new(hotkey, uid))
}

fn read_payload(path: &Path) -> Result<Value> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read payload file: {:?}", path))?;
    serde_json::from_str(&contents).with_context(|| format!("Payload is not JSON: {:?}", path))
}

/// Chain-facing components shared by the commands.
struct Pipeline {
    fetcher: Arc<EventFetcher>,
    decoder: Arc<EventDecoder>,
    settings: Settings,
}

impl Pipeline {
    async fn connect(cli: &Cli, settings: Settings) -> Result<Self> {
        let versions = load_versions(&cli.versions)?;
        let transport = HttpTransport::new(cli.rpc_url.clone(), settings.client.request_timeout())
            .context("Failed to build HTTP transport")?;

        let mut client = ChainClient::new(Arc::new(transport), versions, settings.client.clone());
        client
            .initialize()
            .await
            .with_context(|| format!("Failed to initialize chain client for {}", cli.rpc_url))?;
        let client = Arc::new(client);

        let fetcher = Arc::new(EventFetcher::new(client.clone(), settings.fetcher.clone()));
        let owners = Arc::new(ChainOwnerLookup::new(client));
        let decoder = Arc::new(EventDecoder::new(owners, settings.decoder.clone()));

        Ok(Self {
            fetcher,
            decoder,
            settings,
        })
    }

    fn validator(&self) -> PayloadValidator {
        PayloadValidator::new(
            self.fetcher.clone(),
            self.decoder.clone(),
            self.settings.subgraph.clone(),
        )
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(cli.settings.as_deref())?;

    let result = match &cli.command {
        Commands::Subgraph { target, block } => {
            parse_account(target).with_context(|| format!("Invalid target address: {}", target))?;
            let pipeline = Pipeline::connect(&cli, settings).await?;
            let builder = SubgraphBuilder::new(
                pipeline.fetcher.clone(),
                pipeline.decoder.clone(),
                pipeline.settings.subgraph.clone(),
            );

            let start = Instant::now();
            let subgraph = builder.run(target, *block).await?;
            info!("Subgraph ready in {:.2?}", start.elapsed());
            json!({
                "target": target,
                "block": block,
                "volume": subgraph.volume(),
                "subgraph": subgraph,
            })
        }
        Commands::Validate { payload, target, uid } => {
            let payload = read_payload(payload)?;
            let pipeline = Pipeline::connect(&cli, settings).await?;
            match pipeline.validator().validate(*uid, &payload, target).await {
                Ok(graph) => json!({ "valid": true, "volume": graph.volume() }),
                Err(error) => json!({ "valid": false, "error": error.message }),
            }
        }
        Commands::Score {
            payload,
            target,
            uid,
            coldkey,
            hotkey,
            response_time,
            batch_id,
        } => {
            let payload = read_payload(payload)?;
            let repository = Arc::new(
                RocksScoreRepository::open(&cli.db_path)
                    .with_context(|| format!("Failed to open database at {:?}", cli.db_path))?,
            );
            let scoring = MinerScoring::new(repository, settings.scoring.clone());
            let pipeline = Pipeline::connect(&cli, settings).await?;

            let submission = Submission::from(pipeline.validator().validate(*uid, &payload, target).await);
            let miner = MinerIdentity {
                uid: *uid,
                coldkey: coldkey.clone(),
                hotkey: hotkey.clone(),
            };
            let record = scoring
                .score_and_record(
                    &miner,
                    &submission,
                    *response_time,
                    batch_id.unwrap_or_else(Uuid::new_v4),
                )
                .await?;
            serde_json::to_value(&record)?
        }
        Commands::Targets { count, seed } => {
            let pipeline = Pipeline::connect(&cli, settings).await?;
            let (fetcher, decoder) = (pipeline.fetcher.clone(), pipeline.decoder.clone());
            let targets_settings = pipeline.settings.targets.clone();
            let generator = match seed {
                Some(seed) => TargetGenerator::with_seed(fetcher, decoder, targets_settings, *seed),
                None => TargetGenerator::new(fetcher, decoder, targets_settings),
            };
            serde_json::to_value(generator.generate_targets(*count).await?)?
        }
        Commands::Weights { active } => {
            let repository = Arc::new(
                RocksScoreRepository::open(&cli.db_path)
                    .with_context(|| format!("Failed to open database at {:?}", cli.db_path))?,
            );
            let scoring = MinerScoring::new(repository, settings.scoring.clone());
            let weights = scoring.weights(active).await?;

            let mut rows: Vec<_> = weights.into_iter().collect();
            rows.sort_by(|a, b| a.0.cmp(&b.0));
            json!(rows
                .into_iter()
                .map(|(miner, weight)| json!({ "hotkey": miner.hotkey, "uid": miner.uid, "weight": weight }))
                .collect::<Vec<_>>())
        }
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_miner_key() {
        assert_eq!(parse_miner_key("5Hot:12").unwrap(), MinerKey::new("5Hot", 12));
        assert!(parse_miner_key("5Hot").is_err());
        assert!(parse_miner_key("5Hot:x").is_err());
    }

    #[test]
    fn test_cli_parses_commands() {
        let cli = Cli::try_parse_from([
            "patrol",
            "--rpc-url",
            "http://node:9944",
            "weights",
            "--active",
            "a:1",
            "b:2",
        ])
        .unwrap();
        assert_eq!(cli.rpc_url, "http://node:9944");
        match cli.command {
            Commands::Weights { active } => assert_eq!(active.len(), 2),
            _ => panic!("expected weights command"),
        }

        let cli = Cli::try_parse_from(["patrol", "subgraph", "--target", "5Abc", "--block", "42"]).unwrap();
        assert!(matches!(cli.command, Commands::Subgraph { block: 42, .. }));

        let cli = Cli::try_parse_from(["patrol", "targets", "--count", "5", "--seed", "9"]).unwrap();
        assert!(matches!(cli.command, Commands::Targets { count: 5, seed: Some(9) }));
        let cli = Cli::try_parse_from(["patrol", "targets"]).unwrap();
        assert!(matches!(cli.command, Commands::Targets { count: 1, seed: None }));
    }
}
