use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "bal")]
#[command(about = "Balance engine operator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> env -> region...)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Read a balance snapshot directly from Postgres (bypasses the cache)
    Balance {
        #[arg(long)]
        account_id: i64,
        #[arg(long)]
        currency: String,
    },

    /// Print the committed consumer offset for a partition
    Offset {
        #[arg(long)]
        consumer_group: String,
        #[arg(long)]
        topic: String,
        #[arg(long)]
        partition: String,
    },

    /// Outbox maintenance
    Outbox {
        #[command(subcommand)]
        cmd: OutboxCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[derive(Subcommand)]
enum OutboxCmd {
    /// Run one sweep pass: republish stale/failed rows, escalate exhausted
    /// retries to the dead-letter topic.
    Sweep {
        /// Rows pending longer than this are treated as stuck, not just slow.
        #[arg(long, default_value_t = 30)]
        stale_after_secs: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = commands::connect_pool().await?;
            match cmd {
                DbCmd::Status => {
                    let s = bal_db::status(&pool).await?;
                    println!("db_ok={} has_balances_table={}", s.ok, s.has_balances_table);
                }
                DbCmd::Migrate => {
                    bal_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = bal_config::load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Balance { account_id, currency } => {
            let pool = commands::connect_pool().await?;
            match bal_db::balance_fetch(&pool, account_id, &currency).await? {
                Some(snap) => println!(
                    "account_id={} currency={} available={} frozen={} version={}",
                    snap.account_id, snap.currency, snap.available, snap.frozen, snap.version
                ),
                None => println!("no balance row for account_id={account_id} currency={currency}"),
            }
        }

        Commands::Offset {
            consumer_group,
            topic,
            partition,
        } => {
            let pool = commands::connect_pool().await?;
            let offset = bal_db::offset_fetch(&pool, &consumer_group, &topic, &partition).await?;
            println!("committed_offset={offset}");
        }

        Commands::Outbox { cmd } => match cmd {
            OutboxCmd::Sweep { stale_after_secs } => {
                let pool = commands::connect_pool().await?;
                let secrets = bal_config::secrets::resolve_secrets()?;
                let log = bal_log::KafkaLogProducer::new(&secrets.kafka_brokers)
                    .context("failed to construct kafka producer for sweep")?;
                let retry = bal_config::RetryConfig::default();
                let sweeper = bal_outbox::Sweeper::new(&pool, &log, retry, chrono::Duration::seconds(stale_after_secs));
                let report = sweeper.sweep_once().await?;
                println!(
                    "republished={} escalated_to_dlq={}",
                    report.republished, report.escalated_to_dlq
                );
            }
        },
    }

    Ok(())
}
