//! activity-feed CLI: page merged history, verify transcripts, inspect the cache.

use activity_feed::cache::IntervalStore;
use activity_feed::digest::{feed_digest, transcript_hash, verify_transcript_hash, FeedTranscript};
use activity_feed::feed::{build_feed, Accounts, AssetScope};
use activity_feed::{Activity, AssetSlug, ChainKey, FeedConfig};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use tracing::info;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    match cli.command {
        Command::Feed(args) => run_feed(args),
        Command::Verify(args) => run_verify(args),
        Command::Cache(args) => run_cache(args),
    }
}

#[derive(Parser)]
#[command(name = "activity-feed")]
#[command(author = "gorusys <goru.connector@outlook.com>")]
#[command(about = "Cached, gap-free activity history merged across Tezos and EVM indexers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load batches of merged history, newest first.
    Feed(FeedArgs),
    /// Verify a saved transcript against its .sha256 file.
    Verify(VerifyArgs),
    /// Inspect or clear the interval cache.
    Cache(CacheArgs),
}

#[derive(Parser)]
struct FeedArgs {
    /// Tezos account (tz1/tz2/tz3/KT1).
    #[arg(long)]
    tezos: Option<String>,
    /// EVM account, shared across EVM chains.
    #[arg(long)]
    evm: Option<String>,
    /// Restrict to one asset (`native`, `<contract>` or `<contract>_<tokenId>`).
    #[arg(long, requires = "asset_chain")]
    asset: Option<String>,
    /// Chain the asset lives on (`tezos:<chain id>` or `evm:<id>`).
    #[arg(long, requires = "asset")]
    asset_chain: Option<String>,
    /// Number of load calls; stops early at the end of history.
    #[arg(long, default_value_t = 1)]
    batches: usize,
    #[arg(long)]
    page_size: Option<usize>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    cache_dir: Option<PathBuf>,
    #[arg(long)]
    offline: bool,
    /// Write `<name>.transcript.json` and `<name>.sha256` here.
    #[arg(long)]
    out: Option<PathBuf>,
    /// Print JSON batches instead of one line per activity.
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct VerifyArgs {
    #[arg(long)]
    transcript: PathBuf,
}

#[derive(Parser)]
struct CacheArgs {
    #[command(subcommand)]
    action: CacheAction,
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum CacheAction {
    /// List cached keys with interval and activity counts.
    List,
    /// Remove cached keys whose label starts with `--prefix` (all when omitted).
    Clear {
        #[arg(long, default_value = "")]
        prefix: String,
    },
}

fn load_config(
    path: Option<&Path>,
    cache_dir: Option<&Path>,
) -> Result<FeedConfig, Box<dyn std::error::Error>> {
    let mut config = match path {
        Some(p) => FeedConfig::load_from_path(p)?,
        None => FeedConfig::load(),
    };
    if let Some(dir) = cache_dir {
        config.cache_path = dir.join("activity.sqlite");
    }
    Ok(config)
}

fn run_feed(args: FeedArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config(args.config.as_deref(), args.cache_dir.as_deref())?;
    config.http.offline |= args.offline;
    if let Some(n) = args.page_size {
        config.page_size = n;
    }
    let accounts = Accounts {
        tezos: args.tezos.clone(),
        evm: args.evm.clone(),
    };
    let scope = match (&args.asset, &args.asset_chain) {
        (Some(asset), Some(chain)) => Some(AssetScope {
            chain: chain.parse::<ChainKey>()?,
            asset: asset.parse::<AssetSlug>()?,
        }),
        _ => None,
    };
    let feed = build_feed(&config, &accounts, scope.as_ref())?;
    let keys = feed
        .statuses()
        .unwrap_or_default()
        .into_iter()
        .map(|s| s.key)
        .collect();
    let mut transcript = FeedTranscript::new(keys);

    let rt = tokio::runtime::Runtime::new()?;
    for _ in 0..args.batches.max(1) {
        let Some(batch) = rt.block_on(feed.load_next()) else {
            break;
        };
        for failure in &batch.failures {
            eprintln!("FAILED\t{}\t{}", failure.key, failure.message);
        }
        if args.json {
            println!("{}", serde_json::to_string(&batch)?);
        } else {
            for activity in &batch.activities {
                println!("{}", activity_line(activity));
            }
        }
        transcript.record(&batch);
        if batch.reached_end {
            break;
        }
    }
    info!(
        batches = transcript.batches,
        activities = transcript.activities.len(),
        reached_end = transcript.reached_end,
        "feed complete"
    );

    let hash = transcript_hash(&transcript)?;
    if let Some(out) = &args.out {
        std::fs::create_dir_all(out)?;
        let name = transcript_name(&accounts);
        let transcript_path = out.join(format!("{}.transcript.json", name));
        let hash_path = out.join(format!("{}.sha256", name));
        std::fs::write(&transcript_path, serde_json::to_string_pretty(&transcript)?)?;
        std::fs::write(&hash_path, format!("{}\n", hash))?;
        info!(?transcript_path, ?hash_path, "transcript written");
    }
    eprintln!("digest\t{}", feed_digest(&transcript.activities)?);
    Ok(())
}

fn activity_line(a: &Activity) -> String {
    let when = a.added_at.format(&Rfc3339).unwrap_or_default();
    let kinds: Vec<String> = a
        .operations
        .iter()
        .map(|op| {
            let kind = format!("{:?}", op.kind).to_lowercase();
            match &op.asset {
                Some(asset) => format!(
                    "{}:{}:{}",
                    kind,
                    asset.contract.as_deref().unwrap_or("native"),
                    asset.amount
                ),
                None => kind,
            }
        })
        .collect();
    format!(
        "{}\t{}\t{}\t{:?}\t{}",
        when,
        a.chain,
        a.hash,
        a.status,
        kinds.join(",")
    )
}

fn transcript_name(accounts: &Accounts) -> String {
    let raw = [accounts.tezos.as_deref(), accounts.evm.as_deref()]
        .into_iter()
        .flatten()
        .map(|a| a.chars().take(12).collect::<String>())
        .collect::<Vec<_>>()
        .join("_");
    if raw.is_empty() {
        "feed".to_string()
    } else {
        raw.replace([' ', ':'], "_")
    }
}

fn run_verify(args: VerifyArgs) -> Result<(), Box<dyn std::error::Error>> {
    let json = std::fs::read_to_string(&args.transcript)?;
    let transcript: FeedTranscript = serde_json::from_str(&json)?;
    let stem = args
        .transcript
        .file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .trim_end_matches(".transcript.json")
        .to_string();
    let sha256_path = args
        .transcript
        .parent()
        .unwrap_or(Path::new("."))
        .join(format!("{}.sha256", stem));
    let expected = std::fs::read_to_string(sha256_path).ok();
    let result = verify_transcript_hash(&transcript, expected.as_deref())?;
    if result.matches {
        println!("OK\t{}", result.transcript_hash);
    } else {
        eprintln!(
            "MISMATCH\tcomputed={}\texpected={:?}",
            result.transcript_hash, result.expected_hash
        );
        std::process::exit(1);
    }
    Ok(())
}

fn run_cache(args: CacheArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args.config.as_deref(), args.cache_dir.as_deref())?;
    if !config.cache_path.exists() {
        info!(path = %config.cache_path.display(), "no cache yet");
        return Ok(());
    }
    let store = IntervalStore::open(&config.cache_path)?;
    match args.action {
        CacheAction::List => {
            for key in store.list()? {
                println!(
                    "{}\tintervals={}\tactivities={}\tupdated={}",
                    key.label, key.interval_count, key.activity_count, key.updated_utc
                );
            }
        }
        CacheAction::Clear { prefix } => {
            let removed = store.clear_matching(&prefix)?;
            info!(removed, prefix = %prefix, "cache cleared");
            println!("{}", removed);
        }
    }
    Ok(())
}
