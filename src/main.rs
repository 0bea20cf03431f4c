//! # Diploma CLI
//!
//! Renders diploma templates kept as JSON files.
//!
//! ## Usage
//!
//! ```bash
//! # Export one PNG per player of a tournament
//! diploma export --templates ./templates --template spring --tournament spring.json --out ./out
//!
//! # Write the per-player preview thumbnails
//! diploma preview --templates ./templates --template spring --tournament spring.json --out ./previews
//!
//! # Write the thumbnail a save would send along
//! diploma thumbnail --templates ./templates --template spring --out spring.png
//!
//! # With an engine config and verbose logging
//! diploma --config engine.json --log-level debug export ...
//! ```

use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use diploma::{
    DiplomaError, EditSession, EngineConfig, RenderTargetManager, logging::init_logging,
    recipient::Tournament, store::FileTemplateStore,
};

/// Diploma - certificate template renderer
#[derive(Parser, Debug)]
#[command(name = "diploma")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Engine configuration (JSON)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level filter, overrides the config (e.g. "debug", "diploma=trace")
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct TemplateArgs {
    /// Directory holding `<id>.json` templates
    #[arg(long, default_value = "templates")]
    templates: PathBuf,

    /// Template id
    #[arg(long)]
    template: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Render every player's diploma to PNG files
    Export {
        #[command(flatten)]
        template: TemplateArgs,

        /// Tournament JSON with `standing.players`
        #[arg(long, value_name = "FILE")]
        tournament: PathBuf,

        /// Output directory
        #[arg(long, default_value = "out")]
        out: PathBuf,
    },

    /// Write the per-player preview thumbnails
    Preview {
        #[command(flatten)]
        template: TemplateArgs,

        /// Tournament JSON with `standing.players`
        #[arg(long, value_name = "FILE")]
        tournament: PathBuf,

        /// Output directory
        #[arg(long, default_value = "previews")]
        out: PathBuf,
    },

    /// Write the save thumbnail of the template's edit surface
    Thumbnail {
        #[command(flatten)]
        template: TemplateArgs,

        /// Output PNG file
        #[arg(long, value_name = "FILE")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(exit_code(&e));
    }
}

fn exit_code(error: &DiplomaError) -> i32 {
    match error {
        DiplomaError::Configuration(_) | DiplomaError::Json(_) => 2,
        DiplomaError::Export(_) => 3,
        _ => 1,
    }
}

async fn run() -> Result<(), DiplomaError> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    init_logging(&config.logging);

    match cli.command {
        Commands::Export {
            template,
            tournament,
            out,
        } => {
            let tournament = read_tournament(&tournament)?;
            let recipients = tournament.recipients();
            let session = open_session(&template, config).await;
            std::fs::create_dir_all(&out)?;

            let outcomes = session.export_all(&tournament, &recipients).await;
            let mut failed = 0;
            for outcome in &outcomes {
                match &outcome.result {
                    Ok(artifact) => {
                        let path = artifact.write_to(&out)?;
                        println!("{} -> {}", outcome.recipient_id, path.display());
                    }
                    Err(e) => {
                        failed += 1;
                        eprintln!("{}: {}", outcome.recipient_id, e);
                    }
                }
            }
            if failed > 0 {
                return Err(DiplomaError::Export(format!(
                    "{} of {} diplomas failed",
                    failed,
                    outcomes.len()
                )));
            }
            println!("Exported {} diplomas", outcomes.len());
        }

        Commands::Preview {
            template,
            tournament,
            out,
        } => {
            let tournament = read_tournament(&tournament)?;
            let mut session = open_session(&template, config).await;
            session
                .manager_mut()
                .sync_recipients(&tournament, &tournament.recipients());
            session.render().await;
            std::fs::create_dir_all(&out)?;

            let ids: Vec<String> = session.manager().recipients().map(|r| r.id.clone()).collect();
            for id in ids {
                let png = session.manager().thumbnail_png(&id)?;
                let path = out.join(format!("{}.png", id.replace(['/', '\\'], "-")));
                std::fs::write(&path, png)?;
                println!("{} -> {}", id, path.display());
            }
        }

        Commands::Thumbnail { template, out } => {
            let mut session = open_session(&template, config).await;
            session.render().await;
            let payload = session.manager().save_thumbnail()?;
            std::fs::write(&out, payload.decode()?.bytes)?;
            println!("Thumbnail -> {}", out.display());
        }
    }

    Ok(())
}

async fn open_session(args: &TemplateArgs, config: EngineConfig) -> EditSession {
    let store = Arc::new(FileTemplateStore::new(&args.templates));
    EditSession::open(store, args.template.clone(), RenderTargetManager::new(config)).await
}

fn read_tournament(path: &Path) -> Result<Tournament, DiplomaError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}
