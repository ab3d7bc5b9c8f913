use clap::{AppSettings, Clap};
use ledgersync::auth::Session;
use ledgersync::core::Config;
use ledgersync::Peer;
use serde_json::{json, Map};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod store;

use store::SledCommitStore;

#[derive(Clap)]
#[clap(setting = AppSettings::ColoredHelp)]
struct Opts {
    /// Directory sled databases are created under. Defaults to a temp dir.
    #[clap(long)]
    data_dir: Option<PathBuf>,
    /// Repository path both sides exchange commits under.
    #[clap(long, default_value = "/teams/demo")]
    repo: String,
    /// Number of commits seeded into the left-hand side before the first cycle.
    #[clap(long, default_value = "50")]
    seed: usize,
    /// Number of sync cycles to run.
    #[clap(long, default_value = "6")]
    cycles: u32,
    /// Force the smallest, least accurate filter on every cycle.
    #[clap(long)]
    low_accuracy: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();
    let data_dir = match opts.data_dir {
        Some(dir) => dir,
        None => std::env::temp_dir().join(format!("ledgersync-relay-{}", std::process::id())),
    };
    std::fs::create_dir_all(&data_dir)?;

    let config = Config {
        low_accuracy: opts.low_accuracy,
        ..Config::default()
    };

    let left_db = sled::open(data_dir.join("left"))?;
    let right_db = sled::open(data_dir.join("right"))?;
    let left = Peer::new(SledCommitStore::open(&left_db, "org-left")?, config, 1);
    let right = Peer::new(SledCommitStore::open(&right_db, "org-right")?, config, 1);

    for i in 0..opts.seed {
        let payload: Map<String, serde_json::Value> =
            json!({ "n": i }).as_object().unwrap().clone();
        let commit = ledgersync_core::Commit::new(
            format!("seed-{}", i),
            "null",
            payload,
            ledgersync_core::now_ms(),
        );
        left.process_inbound(
            &opts.repo,
            &Session::new("root"),
            ledgersync::core::SyncMessage {
                org_id: "org-left".to_owned(),
                build_version: 1,
                filter: ledgersync::core::BloomFilter::new(1, 0.5),
                size: 0,
                values: vec![commit],
                access_denied: Vec::new(),
            },
        )
        .await?;
    }
    info!(seeded = opts.seed, repo = %opts.repo, "seeded left-hand store");

    let session = Session::new("root");

    // Each side tracks its own last recounted cardinality plus the last
    // filter/cardinality it heard from the other, mirroring what a real
    // transport would hold between cycles on either end of the wire.
    let mut left_own_size = 0u64;
    let mut left_peer_filter: Option<ledgersync::core::BloomFilter> = None;
    let mut left_peer_size = 0u64;

    let mut right_own_size = 0u64;
    let mut right_peer_filter: Option<ledgersync::core::BloomFilter> = None;
    let mut right_peer_size = 0u64;

    for cycle in 1..=opts.cycles {
        let left_msg = left
            .build_outbound(&opts.repo, &session, left_peer_filter.as_ref(), left_own_size, left_peer_size)
            .await?;
        let wire = left_msg.to_bytes()?;
        left_own_size = left_msg.size;

        let metrics = right.metrics().clone();
        let right_inserted = match ledgersync::core::SyncMessage::from_bytes(&wire, "org-right", &metrics).await {
            Ok(decoded) => {
                let outcome = right.process_inbound(&opts.repo, &session, decoded).await?;
                right_peer_filter = Some(outcome.peer_filter.clone());
                right_peer_size = outcome.peer_size;
                outcome.inserted
            }
            Err(err) => {
                // Per spec §7, a filter decode failure abandons just this
                // cycle for this side: log it, leave the last good peer
                // filter/size in place, and keep the loop going.
                warn!(%err, cycle, side = "right", "abandoning cycle, keeping previous peer filter");
                0
            }
        };

        let right_msg = right
            .build_outbound(&opts.repo, &session, right_peer_filter.as_ref(), right_own_size, right_peer_size)
            .await?;
        let wire_back = right_msg.to_bytes()?;
        right_own_size = right_msg.size;

        let metrics = left.metrics().clone();
        let left_inserted = match ledgersync::core::SyncMessage::from_bytes(&wire_back, "org-left", &metrics).await {
            Ok(decoded) => {
                let outcome = left.process_inbound(&opts.repo, &session, decoded).await?;
                left_peer_filter = Some(outcome.peer_filter.clone());
                left_peer_size = outcome.peer_size;
                outcome.inserted
            }
            Err(err) => {
                warn!(%err, cycle, side = "left", "abandoning cycle, keeping previous peer filter");
                0
            }
        };

        info!(
            cycle,
            right_inserted,
            left_inserted,
            "sync cycle complete"
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    Ok(())
}
