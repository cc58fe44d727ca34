//! # Tessera Demo
//!
//! A standalone CLI that runs a small in-process cluster on the Tessera
//! replication core and narrates what happens.
//!
//! ```text
//! backfill   primary ──writes──▶ L1 ──replier──▶ replica (sub-region)
//! failover   primary dies, the surviving replica forks a new branch
//! inspect    GET a path of the admin metadata tree
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::*;
use rand::Rng;
use tessera_admin::{DirectoryApp, HttpRequest, NodeMetadata};
use tessera_branch::{
    Broadcaster, BroadcasterBusinessCard, BroadcasterConfig, Listener, Replier,
    ReplierBusinessCard, ReplierConfig, Result,
};
use tessera_cluster::{Directory, Network, PeerId, Publication, Signal};
use tessera_core::kv::{KeyRange, KvProtocol, KvWrite, MemoryStore};
use tessera_core::{OrderSource, Region, SharedProtocolHistory, Store};

// ─── CLI ───────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "tessera-demo")]
#[command(about = "In-process walkthrough of the Tessera replication core")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Backfill a replica of a sub-region while writes keep arriving
    Backfill {
        /// Writes issued before and during the backfill
        #[arg(long, default_value_t = 200)]
        writes: usize,
        /// First key of the replica's region
        #[arg(long, default_value = "a")]
        from: String,
        /// Last key of the replica's region
        #[arg(long, default_value = "m")]
        to: String,
    },
    /// Lose the primary and promote the surviving store
    Failover {
        #[arg(long, default_value_t = 10)]
        writes: usize,
    },
    /// Print the admin view at PATH, e.g. `/primary/broadcasters`
    Inspect {
        #[arg(default_value = "/")]
        path: String,
    },
}

// ─── Cluster: peers sharing a network, a history and two directories ──────

type KvBroadcaster = Broadcaster<KvProtocol>;
type KvListener = Listener<KvProtocol>;

struct Cluster {
    network: Network,
    history: SharedProtocolHistory<KvProtocol>,
    broadcasters: Directory<BroadcasterBusinessCard<KvProtocol>>,
    repliers: Directory<ReplierBusinessCard<KvProtocol>>,
    interruptor: Signal,
}

impl Cluster {
    fn new() -> Self {
        Self {
            network: Network::new(),
            history: SharedProtocolHistory::<KvProtocol>::new(),
            broadcasters: Directory::new(),
            repliers: Directory::new(),
            interruptor: Signal::new(),
        }
    }

    fn start_broadcaster(
        &self,
        peer: &str,
        store: &MemoryStore,
    ) -> Result<(
        Arc<KvBroadcaster>,
        Publication<BroadcasterBusinessCard<KvProtocol>>,
    )> {
        let broadcaster = Broadcaster::new(
            self.network.manager(PeerId::new(peer)),
            &self.history,
            store,
            BroadcasterConfig::default(),
        )?;
        let card = self
            .broadcasters
            .publish(PeerId::new(peer), broadcaster.business_card());
        Ok((Arc::new(broadcaster), card))
    }

    async fn attach(&self, peer: &str, store: Arc<MemoryStore>, primary: &str) -> Result<KvListener> {
        Listener::<KvProtocol>::attach_current(
            self.network.manager(PeerId::new(peer)),
            store,
            self.broadcasters.peer_view(PeerId::new(primary)),
            &self.interruptor,
        )
        .await
    }

    async fn backfill(
        &self,
        peer: &str,
        store: Arc<MemoryStore>,
        primary: &str,
        source: &str,
    ) -> Result<KvListener> {
        Listener::<KvProtocol>::backfill(
            self.network.manager(PeerId::new(peer)),
            self.history.clone(),
            store,
            self.broadcasters.peer_view(PeerId::new(primary)),
            self.repliers.peer_view(PeerId::new(source)),
            &self.interruptor,
        )
        .await
    }
}

async fn write_random(
    broadcaster: &KvBroadcaster,
    source: &OrderSource,
    interruptor: &Signal,
    count: usize,
) -> Result<()> {
    for _ in 0..count {
        let (key, value) = {
            let mut rng = rand::thread_rng();
            let letter = rng.gen_range(b'a'..=b'z') as char;
            (format!("{letter}{:04}", rng.gen_range(0..10_000)), rng.gen::<u32>().to_string())
        };
        broadcaster
            .write(KvWrite::set(key, value), &source.check_in("demo"), interruptor)
            .await?;
    }
    Ok(())
}

// ─── Pretty printing ──────────────────────────────────────────────────────

fn header(text: &str) {
    let bar = "═".repeat(60);
    println!("\n{}", bar.bright_cyan());
    println!("  {}", text.bold().bright_white());
    println!("{}", bar.bright_cyan());
}

fn section(text: &str) {
    println!("\n{} {}", "▸".bright_yellow(), text.bold());
}

fn step(text: &str) {
    println!("  {} {}", "•".bright_green(), text);
}

fn verdict(ok: bool, good: &str, bad: &str) {
    if ok {
        println!("\n  {} {}", "✓".bright_green().bold(), good.bright_green().bold());
    } else {
        println!("\n  {} {}", "✗".bright_red().bold(), bad.bright_red().bold());
    }
}

// ─── Backfill ─────────────────────────────────────────────────────────────

async fn run_backfill(writes: usize, from: &str, to: &str) -> Result<()> {
    header("BACKFILL: copy a sub-region under concurrent writes");
    let cluster = Cluster::new();
    let primary_store = Arc::new(MemoryStore::new(KeyRange::universe()));
    let (broadcaster, _card) = cluster.start_broadcaster("primary", &primary_store)?;
    let l1 = cluster.attach("primary", primary_store.clone(), "primary").await?;
    step(&format!("branch {} started on primary", broadcaster.branch_id()));

    section("Phase 1: seed the primary");
    let source = OrderSource::new();
    write_random(&broadcaster, &source, &cluster.interruptor, writes / 2).await?;
    step(&format!("{} writes applied, timestamp {}", writes / 2, broadcaster.current_timestamp()));

    section("Phase 2: backfill while writing");
    let replier = Replier::new(&l1, ReplierConfig::default())?;
    let _replier_card = cluster
        .repliers
        .publish(PeerId::new("primary"), replier.business_card());
    let region = KeyRange::closed(from, to);
    let replica_store = Arc::new(MemoryStore::new(region.clone()));

    let writer = {
        let broadcaster = Arc::clone(&broadcaster);
        let interruptor = cluster.interruptor.clone();
        let remaining = writes - writes / 2;
        tokio::spawn(async move {
            let source = OrderSource::new();
            write_random(&broadcaster, &source, &interruptor, remaining).await
        })
    };
    let replica = cluster
        .backfill("replica", replica_store.clone(), "primary", "primary")
        .await?;
    if let Some(progress) = replica.metadata().backfill {
        step(&format!(
            "replica {} received {}/{} chunks, {} tail writes",
            region, progress.chunks_received, progress.total_chunks, progress.tail_applied
        ));
    }
    match writer.await {
        Ok(result) => result?,
        Err(err) => println!("  {} writer task failed: {err}", "!".bright_red()),
    }

    section("Phase 3: compare");
    let target = broadcaster.current_timestamp();
    replica
        .wait_until_applied(target, &cluster.interruptor)
        .await?;
    let expected = primary_store.key_count(&region);
    let actual = replica_store.key_count(&region);
    step(&format!("primary holds {expected} keys in {region}"));
    step(&format!("replica holds {actual} keys at {}", replica.applied_timestamp()));
    let same = replica_store
        .keys()
        .iter()
        .all(|key| replica_store.get(key) == primary_store.get(key));
    verdict(
        expected == actual && same,
        "replica matches the primary on its region",
        "replica diverged from the primary",
    );
    Ok(())
}

// ─── Failover ─────────────────────────────────────────────────────────────

async fn run_failover(writes: usize) -> Result<()> {
    header("FAILOVER: promote a surviving store");
    let cluster = Cluster::new();
    let primary_store = Arc::new(MemoryStore::new(KeyRange::universe()));
    let replica_store = Arc::new(MemoryStore::new(KeyRange::universe()));
    let (first, first_card) = cluster.start_broadcaster("primary", &primary_store)?;
    let l1 = cluster.attach("primary", primary_store.clone(), "primary").await?;

    let replier = Replier::new(&l1, ReplierConfig::default())?;
    let _replier_card = cluster
        .repliers
        .publish(PeerId::new("primary"), replier.business_card());
    let survivor = cluster
        .backfill("replica", replica_store.clone(), "primary", "primary")
        .await?;

    section("Phase 1: writes on the first branch");
    let source = OrderSource::new();
    write_random(&first, &source, &cluster.interruptor, writes).await?;
    let first_branch = first.branch_id();
    survivor
        .wait_until_applied(first.current_timestamp(), &cluster.interruptor)
        .await?;
    step(&format!("branch {first_branch} reached {}", first.current_timestamp()));

    section("Phase 2: primary goes away");
    drop(first_card);
    first.shutdown();
    let lost = survivor.broadcaster_lost_signal();
    if tokio::time::timeout(Duration::from_secs(1), lost.wait()).await.is_err() {
        verdict(false, "", "replica never noticed the primary was gone");
        return Ok(());
    }
    step(&format!("replica state: {:?}", survivor.state()));
    drop(survivor);

    section("Phase 3: promote the replica");
    let (second, _second_card) = cluster.start_broadcaster("replica", &replica_store)?;
    let _l2 = cluster.attach("replica", replica_store.clone(), "replica").await?;
    write_random(&second, &source, &cluster.interruptor, 1).await?;
    let ancestry: Vec<String> = cluster
        .history
        .ancestry_of(&second.branch_id())?
        .into_iter()
        .map(|(id, certificate)| match certificate.origin {
            Some(origin) => format!("{id} (forked at {origin})"),
            None => format!("{id} (root)"),
        })
        .collect();
    for line in &ancestry {
        step(line);
    }
    let continues = cluster
        .history
        .get(&second.branch_id())
        .map(|certificate| certificate.initial_timestamp == first.current_timestamp())
        .unwrap_or(false);
    verdict(
        continues && ancestry.len() == 2,
        "new branch continues where the old one stopped",
        "branch history does not record the fork",
    );
    Ok(())
}

// ─── Inspect ──────────────────────────────────────────────────────────────

async fn run_inspect(path: &str) -> Result<()> {
    let cluster = Cluster::new();
    let primary_store = Arc::new(MemoryStore::new(KeyRange::universe()));
    let (broadcaster, _card) = cluster.start_broadcaster("primary", &primary_store)?;
    let l1 = cluster.attach("primary", primary_store.clone(), "primary").await?;
    write_random(&broadcaster, &OrderSource::new(), &cluster.interruptor, 20).await?;
    let replier = Replier::new(&l1, ReplierConfig::default())?;
    let _replier_card = cluster
        .repliers
        .publish(PeerId::new("primary"), replier.business_card());
    let replica = cluster
        .backfill(
            "replica",
            Arc::new(MemoryStore::new(KeyRange::closed("a", "m"))),
            "primary",
            "primary",
        )
        .await?;

    let nodes = Directory::new();
    nodes.put(
        PeerId::new("primary"),
        NodeMetadata::new(PeerId::new("primary"))
            .with_history(&cluster.history)
            .with_broadcaster(&broadcaster)
            .with_listener(&l1)
            .with_replier(&replier),
    );
    nodes.put(
        PeerId::new("replica"),
        NodeMetadata::new(PeerId::new("replica"))
            .with_history(&cluster.history)
            .with_listener(&replica),
    );
    let app = DirectoryApp::new(nodes);
    let response = app.handle(&HttpRequest::get(path));
    let status = if response.status == 200 {
        response.status.to_string().bright_green()
    } else {
        response.status.to_string().bright_red()
    };
    println!("{} {}", "GET".bold(), path.bright_white());
    println!("{} {}", status, response.content_type.dimmed());
    println!("{}", response.body);
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let outcome = match cli.command {
        Commands::Backfill { writes, from, to } => run_backfill(writes, &from, &to).await,
        Commands::Failover { writes } => run_failover(writes).await,
        Commands::Inspect { path } => run_inspect(&path).await,
    };
    if let Err(err) = outcome {
        eprintln!("{} {}", "error:".bright_red().bold(), err);
        std::process::exit(1);
    }
}
