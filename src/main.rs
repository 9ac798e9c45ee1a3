//! WolfMember - Dynamic Membership for WolfScale Consensus Groups
//!
//! Command-line front end: configuration management, inspection of the
//! persisted membership, and an in-process reconfiguration simulation.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rand::Rng;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfmember::clock::SystemClock;
use wolfmember::config::WolfMemberConfig;
use wolfmember::error::Result;
use wolfmember::log::{EntryContent, InMemoryLog, LogEvent, ReadableLog};
use wolfmember::member::{member_set, FollowerProgress, FollowerStates, LogIndex, MemberId, Role};
use wolfmember::membership::{
    MembershipManager, MembershipSets, MembershipStateKind, MembershipWaiter, SharedCommitIndex,
};
use wolfmember::replication::ChannelReplicator;
use wolfmember::state::{InMemoryStateStorage, SqliteStateStorage, StateStorage};

/// WolfMember - Dynamic membership for WolfScale consensus groups
#[derive(Parser)]
#[command(name = "wolfmember")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfmember.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log format (pretty, json)
    #[arg(long, default_value = "pretty")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfmember.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,

    /// Show the persisted voting membership
    Snapshot {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Simulate a leader adding one member and removing a surplus one
    Simulate {
        /// Persist membership under the configured state directory
        #[arg(long)]
        persist: bool,

        /// Maximum number of writes appended per tick
        #[arg(long, default_value = "20")]
        writes_per_tick: u64,

        /// Entries the new member replicates per tick while catching up
        #[arg(long, default_value = "50")]
        catchup_rate: u64,

        /// Give up after this many ticks
        #[arg(long, default_value = "2000")]
        max_ticks: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(&cli.log_level, &cli.log_format);

    match cli.command {
        Commands::Init { output, node_id } => {
            run_init(output, node_id)
        }
        Commands::Validate => {
            run_validate(cli.config)
        }
        Commands::Info => {
            run_info(cli.config)
        }
        Commands::Snapshot { json } => {
            run_snapshot(cli.config, json)
        }
        Commands::Simulate { persist, writes_per_tick, catchup_rate, max_ticks } => {
            run_simulate(cli.config, persist, writes_per_tick, catchup_rate, max_ticks).await
        }
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Write a sample configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    let config_content = format!(r#"# WolfMember Configuration
# Generated configuration file

[node]
id = "{node_id}"
data_dir = "/var/lib/wolfmember/{node_id}"

[membership]
# Members are only removed while the group is larger than this
expected_cluster_size = 3
catchup_round_timeout_ms = 5000
catchup_timeout_ms = 60000
consensus_timeout_ms = 30000

[join]
max_catchup_lag_ms = 1000
join_catchup_timeout_ms = 600000

[logging]
level = "info"
format = "pretty"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to set the node id and data directory.");
    println!("Then inspect it with: wolfmember --config {} info", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfMemberConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Expected Cluster Size: {}", config.membership.expected_cluster_size);
            println!("  Catch-up: {} ms per round, {} ms total",
                config.membership.catchup_round_timeout_ms,
                config.membership.catchup_timeout_ms);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = WolfMemberConfig::from_file(&config_path)?;

    println!("WolfMember Node Information");
    println!("===========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Data Directory:   {}", config.data_dir().display());
    println!("State Directory:  {}", config.state_dir().display());
    println!();
    println!("Membership Configuration:");
    println!("  Expected Size:  {}", config.membership.expected_cluster_size);
    println!("  Round Timeout:  {} ms", config.membership.catchup_round_timeout_ms);
    println!("  Catch-up Limit: {} ms", config.membership.catchup_timeout_ms);
    println!("  Consensus:      {} ms", config.membership.consensus_timeout_ms);
    println!();
    println!("Join Configuration:");
    println!("  Check Interval: {} ms", config.join.max_catchup_lag_ms);
    println!("  Join Timeout:   {} ms", config.join.join_catchup_timeout_ms);

    Ok(())
}

/// Print the persisted membership snapshot
fn run_snapshot(config_path: PathBuf, json: bool) -> Result<()> {
    let config = WolfMemberConfig::from_file(&config_path)?;
    let storage = SqliteStateStorage::new(config.state_dir())?;
    let snapshot = storage.get_initial_state()?;
    let updated = storage.last_updated()?;

    if json {
        let value = serde_json::json!({
            "node_id": config.node.id,
            "voting_members": snapshot.voting_members,
            "log_index": snapshot.log_index,
            "updated_at": updated.map(|t| t.to_rfc3339()),
        });
        let text = serde_json::to_string_pretty(&value)
            .map_err(|e| wolfmember::Error::State(format!("JSON encoding failed: {}", e)))?;
        println!("{}", text);
        return Ok(());
    }

    println!("Persisted Membership");
    println!("====================");
    println!();
    if snapshot.log_index == 0 && snapshot.voting_members.is_empty() {
        println!("No membership change has been committed yet.");
        return Ok(());
    }
    println!("Log Index:        {}", snapshot.log_index);
    println!("Voting Members:   {}", snapshot.voting_members.len());
    for member in &snapshot.voting_members {
        println!("  - {}", member);
    }
    if let Some(updated) = updated {
        println!("Updated:          {}", updated.to_rfc3339());
    }

    Ok(())
}

/// Run a single in-process leader through an add and a removal
async fn run_simulate(
    config_path: PathBuf,
    persist: bool,
    writes_per_tick: u64,
    catchup_rate: u64,
    max_ticks: u64,
) -> Result<()> {
    let config = if config_path.exists() {
        WolfMemberConfig::from_file(&config_path)?
    } else {
        tracing::info!("No configuration at {:?}, using defaults", config_path);
        WolfMemberConfig::from_str("[node]\nid = \"node-1\"\n")?
    };

    let leader = MemberId::new(config.node.id.clone());
    let joiner = MemberId::new("node-5");
    let initial: BTreeSet<MemberId> =
        member_set([leader.as_str(), "node-2", "node-3", "node-4"]);
    let target: BTreeSet<MemberId> =
        member_set([leader.as_str(), "node-2", "node-3", joiner.as_str()]);

    // Bootstrap log: the initial membership, committed
    let log = Arc::new(InMemoryLog::new());
    log.append(EntryContent::Membership { members: initial.clone() });
    log.commit(1);

    let storage: Box<dyn StateStorage> = if persist {
        Box::new(SqliteStateStorage::new(config.state_dir())?)
    } else {
        Box::new(InMemoryStateStorage::new())
    };

    let (replicator, mut proposals) = ChannelReplicator::new(16);
    let mut manager = MembershipManager::new(
        leader.clone(),
        config.membership.clone(),
        log.clone(),
        Arc::new(replicator),
        storage,
        Arc::new(SystemClock),
    )?;

    manager.register_listener(Arc::new(|sets: &MembershipSets| -> Result<()> {
        tracing::info!(
            "Membership changed: voting {:?}, catching up {:?}",
            sets.voting,
            sets.additional
        );
        Ok(())
    }));

    // The joiner watches the same view the leader publishes
    let commits = Arc::new(SharedCommitIndex::new());
    let waiter = MembershipWaiter::new(
        joiner.clone(),
        manager.view(),
        commits.clone(),
        config.join.max_catchup_lag(),
    );
    let join_timeout = config.join.join_catchup_timeout();
    let join_task = tokio::spawn(async move { waiter.wait_with_timeout(join_timeout).await });

    // Elected in term 2; the new leader opens its term with a no-op
    log.set_term(2);
    manager.on_role(Role::Leader);
    let opened = log.append(EntryContent::Noop);
    manager.process_log_events(&[opened])?;
    manager.set_target_membership_set(target.clone());

    let mut match_indices: HashMap<MemberId, LogIndex> = HashMap::new();
    let mut ticker = tokio::time::interval(Duration::from_millis(50));
    let mut rng = rand::thread_rng();
    let mut ticks = 0;

    while ticks < max_ticks {
        ticker.tick().await;
        ticks += 1;

        let mut events: Vec<LogEvent> = Vec::new();
        while let Ok(record) = proposals.try_recv() {
            tracing::info!("Appending membership change {:?}", record.members);
            events.push(log.append(record.into_entry_content()));
        }

        let writes = rng.gen_range(0..=writes_per_tick);
        if writes > 0 {
            events.push(log.append_all(vec![EntryContent::Data(vec![0u8; 16]); writes as usize]));
        }

        let append_index = log.append_index();
        events.push(log.commit(append_index));
        manager.process_log_events(&events)?;

        // Voters track the tail closely, the candidate replicates at a fixed rate
        let mut states = FollowerStates::new();
        for member in manager.replication_members() {
            if member == leader {
                continue;
            }
            let current = match_indices.entry(member.clone()).or_insert(0);
            *current = if manager.voting_members().contains(&member) {
                append_index.saturating_sub(rng.gen_range(0..=2))
            } else {
                (*current + catchup_rate).min(append_index)
            };
            states.insert(member, FollowerProgress::new(*current));
        }
        manager.on_follower_state_change(states);

        let joiner_index = match_indices.get(&joiner).copied().unwrap_or(0);
        commits.set_local(joiner_index.min(log.commit_index()));
        commits.set_leader(Some(log.commit_index()));

        if manager.voting_members() == target
            && manager.state() == MembershipStateKind::Idle
            && join_task.is_finished()
        {
            break;
        }
    }

    println!();
    println!("Simulation finished after {} ticks", ticks);
    println!("  State:           {}", manager.state());
    println!("  Voting Members:  {:?}", manager.voting_members());
    println!("  Committed Index: {}", manager.log_index());
    println!("  Log Tail:        {}", log.append_index());

    if join_task.is_finished() {
        match join_task.await {
            Ok(Ok(())) => println!("  {} joined as a caught-up voter", joiner),
            Ok(Err(e)) => println!("  {} did not join: {}", joiner, e),
            Err(e) => tracing::error!("Join task failed: {}", e),
        }
    } else {
        join_task.abort();
        println!("  {} is still catching up", joiner);
    }

    if manager.voting_members() != target {
        tracing::warn!("Target membership {:?} not reached", target);
    }

    Ok(())
}
