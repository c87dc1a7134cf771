use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use invoice_drafter::attachments::file_to_text;
use invoice_drafter::config::Config;
use invoice_drafter::error::SerializationError;
use invoice_drafter::invoice_db::InvoiceStore;
use invoice_drafter::serialization::format_timestamp;
use invoice_drafter::service::InvoiceService;
use invoice_drafter::synthesizer::UpdateSynthesizer;

#[derive(Parser)]
#[command(name = "invoice-drafter", version, about = "Draft, edit and version invoices from plain text")]
struct Cli {
    /// TOML config file; missing means defaults
    #[arg(long, env = "INVOICE_DRAFTER_CONFIG", default_value = ".config/invoice_drafter.toml")]
    config: PathBuf,

    /// Owner id, overriding the config file
    #[arg(long)]
    owner: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Draft a new invoice, or redraft an existing one with --invoice
    Generate {
        prompt: String,
        /// Attachment whose text is fed to the extractor (repeatable)
        #[arg(long = "file")]
        files: Vec<PathBuf>,
        #[arg(long)]
        invoice: Option<String>,
    },
    /// Apply a natural-language edit and store a new version
    Edit { invoice: String, instruction: String },
    Show { invoice: String },
    List,
    Versions { invoice: String },
    /// Pin the edit model in the config file
    SetModel { model: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let owner = cli.owner.as_deref();

    let output = match cli.command {
        Command::Generate { prompt, files, invoice } => {
            let extracted = files
                .iter()
                .map(|path| file_to_text(path))
                .collect::<Result<Vec<_>, _>>()?
                .join("\n\n");
            let (cfg, owner, mut service) = open_service(&cli.config, owner)?;
            let generated = service.generate(
                &owner,
                &cfg.business_defaults(),
                &prompt,
                &extracted,
                invoice.as_deref(),
            )?;
            serde_json::to_value(&generated)?
        }
        Command::Edit { invoice, instruction } => {
            let (_, owner, mut service) = open_service(&cli.config, owner)?;
            serde_json::to_value(service.edit(&owner, &invoice, &instruction).await?)?
        }
        Command::Show { invoice } => {
            let (_, owner, service) = open_service(&cli.config, owner)?;
            serde_json::to_value(service.show(&owner, &invoice)?)?
        }
        Command::List => {
            let (_, owner, service) = open_service(&cli.config, owner)?;
            serde_json::to_value(service.list(&owner)?)?
        }
        Command::Versions { invoice } => {
            let (_, owner, service) = open_service(&cli.config, owner)?;
            let versions = service
                .versions(&owner, &invoice)?
                .into_iter()
                .map(|v| {
                    Ok(json!({
                        "version": v.version,
                        "sourcePrompt": v.source_prompt,
                        "digest": v.digest,
                        "createdAt": format_timestamp(v.created_at)?,
                        "snapshot": v.snapshot,
                    }))
                })
                .collect::<Result<Vec<_>, SerializationError>>()?;
            json!(versions)
        }
        Command::SetModel { model } => {
            Config::update_model(&cli.config, &model)?;
            info!(model = %model, config = %cli.config.display(), "Edit model pinned");
            json!({ "model": model, "config": cli.config.display().to_string() })
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Load the config, resolve the owner and open the store it points at.
fn open_service(
    config_path: &Path,
    owner: Option<&str>,
) -> Result<(Config, String, InvoiceService), Box<dyn std::error::Error>> {
    let cfg = Config::load_or_default(config_path)?;
    let owner = owner.map_or_else(|| cfg.owner_id.clone(), str::to_string);

    if let Some(parent) = Path::new(&cfg.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = InvoiceStore::open(&cfg.db_path)?;
    let service = InvoiceService::new(store, UpdateSynthesizer::new(cfg.synthesizer_settings()));
    Ok((cfg, owner, service))
}
