use anyhow::{Context, Result};
use card_analyzer::normalizer::{mask_card_number, normalize_card_number};
use card_analyzer::{
    init_tracing, write_query_csv, write_records_csv, AnalysisError, AnalysisOutcome,
    CardAnalyzer, CardStore, Config, LocalBlobStore, QueryError, QueryGateway, SidecarExtractor,
};
use clap::{Parser, Subcommand};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "card-analyzer")]
#[command(
    about = "Validate photographed payment cards and query stored records",
    long_about = None
)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = card_analyzer::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a card image, validate the extracted fields and store the card
    Analyze {
        image: PathBuf,

        /// Directory holding `<image name>.json` extraction results
        /// (defaults to the image's directory)
        #[arg(short, long)]
        fields_dir: Option<PathBuf>,
    },
    /// Show every stored card
    List {
        /// Write the table as CSV instead of printing it
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Run a read-only SQL query against the cards table
    Query {
        sql: String,

        /// Write the result as CSV instead of printing it
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Look up a card by number
    Lookup { card_number: String },
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = Config::load_or_default(&cli.config)?;
    info!(db = %config.db_path, "configuration loaded");

    let store = Arc::new(
        CardStore::open(&config.db_path)
            .with_context(|| format!("Failed to open database {}", config.db_path))?,
    );

    match cli.command {
        Commands::Analyze { image, fields_dir } => run_analyze(&config, store, &image, fields_dir),
        Commands::List { csv } => run_list(&store, csv.as_deref()),
        Commands::Query { sql, csv } => run_query(store, &sql, csv.as_deref()),
        Commands::Lookup { card_number } => run_lookup(&store, &card_number),
    }
}

fn run_analyze(
    config: &Config,
    store: Arc<CardStore>,
    image: &Path,
    fields_dir: Option<PathBuf>,
) -> Result<()> {
    let bytes = fs::read(image).with_context(|| format!("Failed to read {}", image.display()))?;
    let filename = image
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let fields_dir = fields_dir
        .or_else(|| config.fields_dir.as_ref().map(PathBuf::from))
        .or_else(|| image.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));

    let analyzer = CardAnalyzer::new(
        Box::new(LocalBlobStore::new(&config.blob_dir)),
        Box::new(SidecarExtractor::new().with_fields_dir(fields_dir)),
        store,
    )
    .with_name_policy(config.name_policy);

    println!("💳 Analyzing {}...", image.display());

    match analyzer.analyze(&bytes, &filename) {
        Ok(analysis) => {
            println!("\nCard Information:");
            println!("{}", serde_json::to_string_pretty(&analysis.fields)?);
            println!("\n✅ Valid Card");
            match analysis.outcome {
                AnalysisOutcome::Inserted { id } => {
                    println!("✓ Card inserted into database (id {})", id)
                }
                AnalysisOutcome::AlreadyExists { id } => {
                    println!("ℹ Card already exists in database. ID: {}", id)
                }
            }
        }
        Err(AnalysisError::Invalid { fields, verdict }) => {
            println!("\nCard Information:");
            println!("{}", serde_json::to_string_pretty(&fields)?);
            println!("\n❌ Invalid Card");
            for failure in &verdict.failures {
                println!("   - {}", failure);
            }
        }
        Err(e) => eprintln!("❌ {}", e),
    }

    Ok(())
}

fn run_list(store: &CardStore, csv: Option<&Path>) -> Result<()> {
    let records = store.get_all()?;

    if let Some(path) = csv {
        write_records_csv(&records, File::create(path)?)?;
        println!("💾 Exported {} records to {}", records.len(), path.display());
        return Ok(());
    }

    if records.is_empty() {
        println!("⚠️  No data found in cards table.");
        return Ok(());
    }

    println!("📊 {} records in cards table\n", records.len());
    for record in &records {
        println!(
            "{:>4}  {:<19}  {}  {:<24}  {}",
            record.id.unwrap_or_default(),
            record.card_number,
            record.expiration,
            record.holder_name,
            record.bank_name
        );
    }
    Ok(())
}

fn run_query(store: Arc<CardStore>, sql: &str, csv: Option<&Path>) -> Result<()> {
    let gateway = QueryGateway::new(store);

    let result = match gateway.run(sql) {
        Ok(result) => result,
        Err(QueryError::Validation(msg)) => {
            eprintln!("❌ Validation error: {}", msg);
            return Ok(());
        }
        Err(QueryError::Execution(msg)) => {
            eprintln!("❌ Error executing query: {}", msg);
            return Ok(());
        }
    };

    if let Some(path) = csv {
        write_query_csv(&result, File::create(path)?)?;
        println!("💾 Exported {} rows to {}", result.rows.len(), path.display());
        return Ok(());
    }

    if result.rows.is_empty() {
        println!("🔍 No results found for the query.");
        return Ok(());
    }

    write_query_csv(&result, std::io::stdout().lock())?;
    Ok(())
}

fn run_lookup(store: &CardStore, card_number: &str) -> Result<()> {
    let number = normalize_card_number(card_number);
    match store.get_by_card_number(&number)? {
        Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
        None => println!("🔍 No card found for {}", mask_card_number(&number)),
    }
    Ok(())
}

