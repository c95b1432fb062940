use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lookout_core::{
    compare_embeddings, read_gallery, Embedding, EnrollMetadata, Gallery, GalleryStore, Matcher,
    RecognitionConfig,
};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "lookout", about = "Lookout face gallery administration")]
struct Cli {
    /// Gallery file (default: $LOOKOUT_GALLERY_PATH or the XDG data dir)
    #[arg(short, long, global = true)]
    gallery: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List enrolled identities
    List,
    /// Enroll an embedding under an identity
    Enroll {
        /// Identity key (name or ID)
        key: String,
        /// JSON file holding {"values": [...], "model_version": "..."}
        embedding: PathBuf,
        /// Source reference recorded with the embedding
        #[arg(short, long)]
        source: Option<String>,
    },
    /// Remove an identity, or a single reference embedding of it
    Remove {
        key: String,
        /// Reference embedding id; removes the whole identity when omitted
        #[arg(long)]
        embedding_id: Option<uuid::Uuid>,
    },
    /// Match an embedding against the gallery
    Match {
        embedding: PathBuf,
        /// Override the acceptance threshold
        #[arg(short, long)]
        threshold: Option<f32>,
    },
    /// Similarity of two embeddings, in [0, 1]
    Compare { first: PathBuf, second: PathBuf },
    /// Show gallery status
    Status,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = RecognitionConfig::default().with_env();
    if let Some(path) = cli.gallery {
        config.gallery_path = path;
    }
    config.validate()?;

    match cli.command {
        Commands::List => {
            let gallery = read(&config)?;
            if gallery.is_empty() {
                println!("No identities enrolled");
            }
            for identity in gallery.identities() {
                println!("{} ({} embeddings)", identity.key, identity.references.len());
                for reference in &identity.references {
                    println!(
                        "  {}  {}  {}",
                        reference.id,
                        reference.metadata.enrolled_at.to_rfc3339(),
                        reference.metadata.source.as_deref().unwrap_or("-")
                    );
                }
            }
        }
        Commands::Enroll {
            key,
            embedding,
            source,
        } => {
            let store = open(&config)?;
            let embedding = read_embedding(&embedding)?;
            let mut metadata = EnrollMetadata::now();
            if let Some(source) = source {
                metadata = metadata.with_source(source);
            }
            let id = store.enroll(&key, &embedding, metadata)?;
            println!("Enrolled {key}: {id}");
        }
        Commands::Remove { key, embedding_id } => {
            let store = open(&config)?;
            match embedding_id {
                Some(id) => {
                    if store.remove_embedding(&key, id)? {
                        println!("Removed {id}; {key} had no embeddings left and was removed");
                    } else {
                        println!("Removed {id} from {key}");
                    }
                }
                None => {
                    let removed = store.remove(&key)?;
                    println!("Removed {key} ({} embeddings)", removed.references.len());
                }
            }
        }
        Commands::Match {
            embedding,
            threshold,
        } => {
            let gallery = read(&config)?;
            if let Some(t) = threshold {
                config.acceptance_threshold = t;
                config.validate()?;
            }
            let probe = read_embedding(&embedding)?;
            let result = config.matcher().compare(&probe, &gallery)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Compare { first, second } => {
            let a = read_embedding(&first)?;
            let b = read_embedding(&second)?;
            let similarity = compare_embeddings(&a, &b)?;
            println!("{similarity:.4}");
        }
        Commands::Status => {
            let snapshot = read(&config)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "version": env!("CARGO_PKG_VERSION"),
                    "gallery": config.gallery_path,
                    "model_version": snapshot.model_version(),
                    "dimension": snapshot.dimension(),
                    "identities": snapshot.len(),
                    "references": snapshot.reference_count(),
                    "acceptance_threshold": config.acceptance_threshold,
                }))?
            );
        }
    }

    Ok(())
}

/// Read-only view; works while lookoutd holds the gallery.
fn read(config: &RecognitionConfig) -> Result<Gallery> {
    read_gallery(&config.gallery_path, &config.model_version, config.embedding_dim)
        .with_context(|| format!("reading gallery {}", config.gallery_path.display()))
}

/// Writable store; fails while lookoutd (or another lookout) has it open.
fn open(config: &RecognitionConfig) -> Result<GalleryStore> {
    tracing::debug!(path = %config.gallery_path.display(), "opening gallery");
    GalleryStore::open(&config.gallery_path, &config.model_version, config.embedding_dim)
        .with_context(|| format!("opening gallery {}", config.gallery_path.display()))
}

fn read_embedding(path: &Path) -> Result<Embedding> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading embedding {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing embedding {}", path.display()))
}
