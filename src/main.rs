use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ration_ledger::config::{BackendMode, LedgerConfig};
use ration_ledger::contracts::{RationContract, SimulatedContract};
use ration_ledger::runtime::Runtime;
use ration_ledger::{LedgerBackend, NewTransaction, TransactionRecord};

#[derive(Parser)]
#[command(name = "ration-ledger", version, about = "Hash-chained ledger of ration distributions")]
struct Cli {
    /// TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Overrides the configured sled directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record a distribution
    Add(AddArgs),
    /// Mark a transaction as reviewed (removed)
    Review {
        id: String,
        #[arg(long)]
        code: String,
        #[arg(long)]
        reviewer: String,
        #[arg(long)]
        note: String,
    },
    /// Print transactions as JSON
    List {
        #[arg(long, conflicts_with = "reviewed")]
        pending: bool,
        #[arg(long)]
        reviewed: bool,
    },
    Stats,
    /// Check the hash chain
    Verify,
    /// Interactive session; `--remote` runs against a simulated contract
    Shell {
        #[arg(long)]
        remote: bool,
    },
}

#[derive(Args)]
struct AddArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    beneficiary_id: String,
    #[arg(long)]
    item_type: String,
    #[arg(long)]
    quantity: f64,
    #[arg(long)]
    shop_id: String,
    #[arg(long)]
    officer: String,
}

impl From<AddArgs> for NewTransaction {
    fn from(args: AddArgs) -> Self {
        NewTransaction {
            beneficiary_name: args.name,
            beneficiary_id: args.beneficiary_id,
            item_type: args.item_type,
            quantity: args.quantity,
            shop_id: args.shop_id,
            officer_name: args.officer,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ration_ledger=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut config = LedgerConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.storage.path = dir;
    }

    match cli.command {
        Command::Shell { remote } => {
            if remote {
                config.mode = BackendMode::Remote;
            }
            let contract: Option<Arc<dyn RationContract>> = match config.mode {
                BackendMode::Remote => Some(Arc::new(SimulatedContract::deploy(
                    config.contract_owner.clone(),
                    config.verification_code(),
                ))),
                BackendMode::Local => None,
            };
            let runtime = Runtime::start(config, contract).await?;
            run_shell(runtime.backend()).await?;
        }
        command => {
            let runtime = Runtime::start(config, None).await?;
            run_command(runtime.backend().as_ref(), command).await?;
        }
    }
    Ok(())
}

async fn run_command(
    backend: &dyn LedgerBackend,
    command: Command,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Add(args) => {
            let record = backend.add_transaction(args.into()).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Review { id, code, reviewer, note } => {
            if backend.review_transaction(&id, &code, &reviewer, &note).await? {
                println!("Transaction {} reviewed.", id);
            } else {
                println!("Verification failed.");
            }
        }
        Command::List { pending, reviewed } => {
            let filter = ListFilter::from_flags(pending, reviewed);
            let records: Vec<_> = backend
                .transactions()
                .await?
                .into_iter()
                .filter(|r| filter.matches(r))
                .collect();
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Command::Stats => {
            println!("{}", serde_json::to_string_pretty(&backend.stats().await?)?);
        }
        Command::Verify => {
            if backend.verify_chain_integrity().await? {
                println!("Chain intact.");
            } else {
                println!("Chain integrity check FAILED.");
            }
        }
        Command::Shell { .. } => {}
    }
    Ok(())
}

const SHELL_HELP: &str = "Available commands:
  add <name>,<beneficiary id>,<item>,<quantity>,<shop id>,<officer>
  review <id>,<code>,<reviewer>,<note>
  list | pending | reviewed | stats | verify | help | exit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListFilter {
    All,
    Pending,
    Reviewed,
}

impl ListFilter {
    fn from_flags(pending: bool, reviewed: bool) -> Self {
        match (pending, reviewed) {
            (true, _) => ListFilter::Pending,
            (false, true) => ListFilter::Reviewed,
            (false, false) => ListFilter::All,
        }
    }

    fn from_command(command: &str) -> Self {
        match command {
            "pending" => ListFilter::Pending,
            "reviewed" => ListFilter::Reviewed,
            _ => ListFilter::All,
        }
    }

    fn matches(self, record: &TransactionRecord) -> bool {
        match self {
            ListFilter::All => true,
            ListFilter::Pending => !record.is_reviewed(),
            ListFilter::Reviewed => record.is_reviewed(),
        }
    }
}

fn split_fields(args: &str, expected: usize) -> Option<Vec<&str>> {
    let fields: Vec<&str> = args.split(',').map(str::trim).collect();
    (fields.len() == expected).then_some(fields)
}

/// Parse the shell's `add` arguments.
fn parse_add(args: &str) -> Result<NewTransaction, String> {
    let f = split_fields(args, 6).ok_or_else(|| SHELL_HELP.to_string())?;
    let quantity = f[3]
        .parse::<f64>()
        .map_err(|_| "Quantity must be a number.".to_string())?;
    Ok(NewTransaction {
        beneficiary_name: f[0].to_string(),
        beneficiary_id: f[1].to_string(),
        item_type: f[2].to_string(),
        quantity,
        shop_id: f[4].to_string(),
        officer_name: f[5].to_string(),
    })
}

async fn run_shell(backend: Arc<dyn LedgerBackend>) -> Result<(), Box<dyn std::error::Error>> {
    println!("Ration ledger shell ({} mode). Type 'help' for commands.", backend.mode());

    let mut subscription = backend.subscribe();
    let watcher = tokio::spawn(async move {
        while let Some(change) = subscription.receiver.recv().await {
            info!(?change, "ledger changed");
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let (command, args) = line.trim().split_once(' ').unwrap_or((line.trim(), ""));

        match command {
            "" => {}
            "exit" => break,
            "help" => println!("{}", SHELL_HELP),
            "add" => match parse_add(args) {
                Ok(fields) => match backend.add_transaction(fields).await {
                    Ok(record) => println!("Transaction {} added ({}).", record.id, record.hash),
                    Err(e) => eprintln!("Failed to add transaction: {}", e),
                },
                Err(message) => eprintln!("{}", message),
            },
            "review" => match split_fields(args, 4) {
                Some(f) => match backend.review_transaction(f[0], f[1], f[2], f[3]).await {
                    Ok(true) => println!("Transaction {} reviewed.", f[0]),
                    Ok(false) => println!("Verification failed."),
                    Err(e) => eprintln!("Failed to review transaction: {}", e),
                },
                None => println!("{}", SHELL_HELP),
            },
            "list" | "pending" | "reviewed" => match backend.transactions().await {
                Ok(records) => {
                    let filter = ListFilter::from_command(command);
                    for r in records.iter().filter(|r| filter.matches(r)) {
                        let state = if r.is_reviewed() { "removed" } else { "pending" };
                        println!(
                            "{}  {}  {} {} x{}  shop {}  [{}]",
                            r.id, r.beneficiary_id, r.beneficiary_name, r.item_type, r.quantity, r.shop_id, state
                        );
                    }
                }
                Err(e) => eprintln!("Failed to list transactions: {}", e),
            },
            "stats" => match backend.stats().await {
                Ok(stats) => println!("{:?}", stats),
                Err(e) => eprintln!("Failed to get stats: {}", e),
            },
            "verify" => match backend.verify_chain_integrity().await {
                Ok(true) => println!("Chain intact."),
                Ok(false) => println!("Chain integrity check FAILED."),
                Err(e) => eprintln!("Failed to verify chain: {}", e),
            },
            other => println!("Unknown command: {}", other),
        }
    }

    watcher.abort();
    println!("Exiting ration ledger shell.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ration_ledger::types::{Review, ReviewStatus, GENESIS_HASH};

    fn record(reviewed: bool) -> TransactionRecord {
        let mut record = TransactionRecord::new(
            "tx1".to_string(),
            parse_add("John Doe, BEN123, Rice, 10, SHOP001, Officer Smith").unwrap(),
            1,
            GENESIS_HASH.to_string(),
        );
        if reviewed {
            record.status = ReviewStatus::Reviewed(Review {
                reviewer_name: "V".to_string(),
                reason: "N".to_string(),
                timestamp: 2,
            });
        }
        record
    }

    #[test]
    fn test_parse_add() {
        let fields = parse_add("John Doe, BEN123, Rice, 2.5, SHOP001, Officer Smith").unwrap();
        assert_eq!(fields.beneficiary_name, "John Doe");
        assert_eq!(fields.quantity, 2.5);
        assert_eq!(fields.officer_name, "Officer Smith");
    }

    #[test]
    fn test_parse_add_wrong_field_count() {
        assert_eq!(parse_add("John Doe, BEN123, Rice, 10, SHOP001").unwrap_err(), SHELL_HELP);
        assert_eq!(parse_add("").unwrap_err(), SHELL_HELP);
        assert!(split_fields("a,b,c,d,e,f,g", 6).is_none());
        assert_eq!(split_fields(" 1 , GOVT2024 ,V, N", 4).unwrap(), vec!["1", "GOVT2024", "V", "N"]);
    }

    #[test]
    fn test_parse_add_non_numeric_quantity() {
        assert_eq!(
            parse_add("John Doe, BEN123, Rice, ten, SHOP001, Officer Smith").unwrap_err(),
            "Quantity must be a number."
        );
    }

    #[test]
    fn test_list_filters() {
        let pending = record(false);
        let reviewed = record(true);

        assert_eq!(ListFilter::from_flags(false, false), ListFilter::All);
        assert_eq!(ListFilter::from_flags(true, false), ListFilter::Pending);
        assert_eq!(ListFilter::from_flags(false, true), ListFilter::Reviewed);
        assert_eq!(ListFilter::from_command("list"), ListFilter::All);

        assert!(ListFilter::All.matches(&pending) && ListFilter::All.matches(&reviewed));
        assert!(ListFilter::Pending.matches(&pending) && !ListFilter::Pending.matches(&reviewed));
        assert!(ListFilter::from_command("reviewed").matches(&reviewed));
        assert!(!ListFilter::from_command("reviewed").matches(&pending));
    }
}
