//! doc-bootstrap CLI
//!
//! Usage:
//!   doc-bootstrap apply manifests/n8n_ai_memory.json
//!   doc-bootstrap --backend mongodb --uri mongodb://localhost:27017 \
//!       --admin-user root apply manifests/n8n_ai_memory.json --report json
//!   doc-bootstrap insert n8n_ai_memory chat_memory '{"sessionId": "s1", ...}'
//!
//! Exit status: 0 when every object is created or already present, 1 when any
//! object conflicts or fails, 2 when nothing could be applied.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use doc_bootstrap::admin::connect;
use doc_bootstrap::auth::SecretResolver;
use doc_bootstrap::config::{ConnectionArgs, Manifest};
use doc_bootstrap::engine::Bootstrapper;
use doc_bootstrap::logging::{init_logging, LoggingConfig};
use doc_bootstrap::report::{print_report, ReportFormat, EXIT_FATAL, EXIT_OK};

#[derive(Parser)]
#[command(name = "doc-bootstrap", version)]
#[command(about = "Idempotently provision document-database users, collections and indexes")]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(flatten)]
    logging: LoggingConfig,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a manifest
    Apply {
        manifest: PathBuf,
        #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
        report: ReportFormat,
    },
    /// Insert one JSON document, subject to the collection's validator
    Insert {
        database: String,
        collection: String,
        document: String,
    },
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    let config = cli.connection.connection_config();
    let policy = cli.connection.apply_policy();

    match cli.command {
        Commands::Apply { manifest, report } => {
            let specs = Manifest::from_file(&manifest)
                .and_then(Manifest::into_specs)
                .with_context(|| format!("loading manifest {}", manifest.display()))?;

            let admin = connect(&config, &SecretResolver::new(policy.production))
                .await
                .context("connecting to database")?;

            let results = Bootstrapper::new(admin.as_ref(), policy).run(&specs).await;
            let summary = print_report(&results, report)?;
            info!(%summary, "bootstrap finished");
            Ok(summary.exit_code())
        }
        Commands::Insert {
            database,
            collection,
            document,
        } => {
            let document: serde_json::Value =
                serde_json::from_str(&document).context("parsing document")?;
            let admin = connect(&config, &SecretResolver::new(policy.production))
                .await
                .context("connecting to database")?;
            let id = admin
                .insert_document(&database, &collection, document)
                .await
                .with_context(|| format!("inserting into {database}.{collection}"))?;
            println!("✅ Inserted document {id} into {database}.{collection}");
            Ok(EXIT_OK)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let _guard = match init_logging(&cli.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to initialize logging: {e:#}");
            return ExitCode::from(EXIT_FATAL);
        }
    };

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e:#}");
            eprintln!("❌ {e:#}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}
