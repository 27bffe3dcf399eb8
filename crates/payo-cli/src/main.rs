use anyhow::Result;
use clap::{Parser, Subcommand};

use payo_config::UnusedKeyPolicy;

mod commands;

#[derive(Parser)]
#[command(name = "payo")]
#[command(about = "Loan-lock agent maintenance CLI", long_about = None)]
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
        /// Paths in merge order (base -> site -> device)
        #[arg(required = true)]
        paths: Vec<String>,

        /// Fail instead of warn when the config has keys nothing reads
        #[arg(long, default_value_t = false)]
        strict: bool,
    },

    /// Tamper log utilities
    TamperLog {
        #[command(subcommand)]
        cmd: TamperLogCmd,
    },

    /// Write the device registration row
    Register {
        #[arg(long)]
        device_id: String,

        #[arg(long)]
        serial: Option<String>,

        /// Registered SIM serial; repeat for dual-SIM devices
        #[arg(long = "sim")]
        sims: Vec<String>,

        #[arg(long)]
        loan_number: Option<String>,
    },

    /// Lock record inspection
    Lock {
        #[command(subcommand)]
        cmd: LockCmd,
    },

    /// Offline outbox inspection
    Queue {
        #[command(subcommand)]
        cmd: QueueCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    /// Apply SQL migrations
    Migrate,
}

#[derive(Subcommand)]
enum TamperLogCmd {
    /// Check hash linkage and sequence of a tamper log file
    Verify { path: String },
}

#[derive(Subcommand)]
enum LockCmd {
    /// Print the persisted lock record
    Show,
}

#[derive(Subcommand)]
enum QueueCmd {
    /// Queued heartbeats, queued tamper reports, processed commands
    Stats,
    /// Most recent heartbeat attempts
    Heartbeats {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Silent if the file does not exist.
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = commands::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = payo_db::status(&pool).await?;
                    println!("db_ok={} has_lock_table={}", s.ok, s.has_lock_table);
                }
                DbCmd::Migrate => {
                    payo_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::ConfigHash { paths, strict } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = payo_config::load_layered_yaml(&path_refs)?;
            // Typed parse surfaces invalid values here rather than at boot.
            loaded.agent()?;
            let policy = if strict {
                UnusedKeyPolicy::Fail
            } else {
                UnusedKeyPolicy::Warn
            };
            let report = payo_config::report_unused_keys(&loaded.config_json, policy)?;
            for p in &report.unused_leaf_pointers {
                eprintln!("unused_key={}", p);
            }
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::TamperLog { cmd } => match cmd {
            TamperLogCmd::Verify { path } => commands::verify_tamper_log(&path)?,
        },

        Commands::Register {
            device_id,
            serial,
            sims,
            loan_number,
        } => {
            let pool = commands::connect_from_env().await?;
            payo_db::migrate(&pool).await?;
            commands::device::register(&pool, device_id, serial, sims, loan_number).await?;
        }

        Commands::Lock { cmd } => match cmd {
            LockCmd::Show => {
                let pool = commands::connect_from_env().await?;
                commands::device::lock_show(&pool).await?;
            }
        },

        Commands::Queue { cmd } => {
            let pool = commands::connect_from_env().await?;
            match cmd {
                QueueCmd::Stats => commands::device::queue_stats(&pool).await?,
                QueueCmd::Heartbeats { limit } => {
                    commands::device::recent_heartbeats(&pool, limit).await?
                }
            }
        }
    }

    Ok(())
}

/// Logs go to stderr; stdout carries the `key=value` output.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();
}
