//! Blobvault CLI - Admin Command Line Interface
//!
//! Opens a blob store from a configuration file and runs one command
//! against it.

use anyhow::{Context, Result};
use blobvault_client::{
    FsObjectStorage, MemoryObjectStorage, ObjectStorageClient, RetryPolicy, RetryingClient,
};
use blobvault_common::{
    BLOB_NAME_HEADER, BackendKind, BlobId, CONTENT_TYPE_HEADER, CREATED_BY_HEADER, Config,
    DIRECT_PATH_BLOB_HEADER, Headers,
};
use blobvault_index::{DeletedBlobIndex, MemoryDeletedBlobIndex, RedbDeletedBlobIndex};
use blobvault_store::{BlobStore, DefaultLocationResolver};
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "blobvault-cli")]
#[command(about = "Blobvault Admin CLI")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "BLOBVAULT_CONFIG")]
    config: Option<PathBuf>,

    /// Override the filesystem backend root directory
    #[arg(long)]
    root: Option<PathBuf>,

    /// Log level (defaults to the configured level)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Store a file (or stdin with "-") as a new blob
    Put {
        /// File to upload
        file: PathBuf,
        /// Blob name (defaults to the file name)
        #[arg(short, long)]
        name: Option<String>,
        /// Address the blob by its name instead of a generated id
        #[arg(long)]
        direct: bool,
        /// Content type header
        #[arg(long)]
        content_type: Option<String>,
    },
    /// Write blob content to a file or stdout
    Get {
        /// Blob ID
        id: String,
        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Also return soft-deleted blobs
        #[arg(long)]
        include_deleted: bool,
    },
    /// Show blob attributes
    Stat {
        /// Blob ID
        id: String,
    },
    /// Soft-delete a blob
    Delete {
        /// Blob ID
        id: String,
        /// Reason recorded with the deletion
        #[arg(short, long, default_value = "deleted via cli")]
        reason: String,
    },
    /// Permanently remove a blob
    Purge {
        /// Blob ID
        id: String,
    },
    /// Purge all soft-deleted blobs
    Compact,
    /// List blob ids
    List {
        /// Only direct-path blobs whose name starts with this prefix
        #[arg(long)]
        direct_prefix: Option<String>,
    },
    /// Show store metrics
    Metrics,
}

fn build_client(config: &Config) -> Arc<dyn ObjectStorageClient> {
    let container = config.store.container_name.clone();
    match config.backend.kind {
        BackendKind::Memory => Arc::new(MemoryObjectStorage::new(container)),
        BackendKind::Filesystem => Arc::new(RetryingClient::new(
            FsObjectStorage::new(&config.backend.root, container),
            RetryPolicy::default(),
        )),
    }
}

fn build_index(config: &Config) -> Result<Arc<dyn DeletedBlobIndex>> {
    Ok(match &config.index.path {
        Some(path) => Arc::new(
            RedbDeletedBlobIndex::open(path)
                .with_context(|| format!("Failed to open index at {}", path.display()))?,
        ),
        None => Arc::new(MemoryDeletedBlobIndex::new()),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(root) = args.root.clone() {
        config.backend.root = root;
    }

    // Initialize logging
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    debug!("Configuration: {:?}", config.store);
    let store = BlobStore::new(
        config.store.clone(),
        build_client(&config),
        build_index(&config)?,
        Arc::new(DefaultLocationResolver::new()),
    )
    .await
    .context("Failed to open blob store")?;
    store.start().await.context("Failed to start blob store")?;

    let result = run(&store, args.command).await;
    store.stop().await.context("Failed to stop blob store")?;
    result
}

async fn run(store: &BlobStore, command: Commands) -> Result<()> {
    match command {
        Commands::Put {
            file,
            name,
            direct,
            content_type,
        } => {
            let name = match name {
                Some(name) => name,
                None => file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .context("A blob name is required when reading stdin")?,
            };
            let mut headers = Headers::new();
            headers.insert(BLOB_NAME_HEADER.to_string(), name);
            headers.insert(CREATED_BY_HEADER.to_string(), "blobvault-cli".to_string());
            if direct {
                headers.insert(DIRECT_PATH_BLOB_HEADER.to_string(), "true".to_string());
            }
            if let Some(content_type) = content_type {
                headers.insert(CONTENT_TYPE_HEADER.to_string(), content_type);
            }

            let blob = if file.as_os_str() == "-" {
                store.create(headers, &mut tokio::io::stdin(), None).await?
            } else {
                let mut reader = tokio::fs::File::open(&file)
                    .await
                    .with_context(|| format!("Failed to open {}", file.display()))?;
                store.create(headers, &mut reader, None).await?
            };

            let metrics = blob.metrics().context("Created blob has no metrics")?;
            println!("Blob created successfully!");
            println!();
            println!("Blob ID: {}", blob.id());
            println!("Size:    {}", metrics.content_size);
            println!("SHA-1:   {}", metrics.sha1_hash);
        }
        Commands::Get {
            id,
            output,
            include_deleted,
        } => {
            let id = BlobId::new(id);
            let blob = store
                .get(&id, include_deleted)
                .await?
                .with_context(|| format!("Blob {id} not found"))?;
            let content = blob.content().await?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, &content)
                        .await
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    info!("Wrote {} bytes to {}", content.len(), path.display());
                }
                None => {
                    let mut stdout = tokio::io::stdout();
                    stdout.write_all(&content).await?;
                    stdout.flush().await?;
                }
            }
        }
        Commands::Stat { id } => {
            let id = BlobId::new(id);
            let attributes = store
                .get_blob_attributes(&id)
                .await?
                .with_context(|| format!("Blob {id} not found"))?;
            let summary = serde_json::json!({
                "id": id.to_string(),
                "headers": attributes.headers,
                "size": attributes.metrics.content_size,
                "sha1": attributes.metrics.sha1_hash,
                "created": attributes.metrics.creation_time.to_rfc3339(),
                "deleted": attributes.deleted,
                "deletedReason": attributes.deleted_reason,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Delete { id, reason } => {
            let id = BlobId::new(id);
            if store.soft_delete(&id, &reason).await? {
                println!("Blob '{id}' deleted");
            } else {
                println!("Blob '{id}' not found or already deleted");
            }
        }
        Commands::Purge { id } => {
            let id = BlobId::new(id);
            if store.hard_delete(&id).await? {
                println!("Blob '{id}' purged");
            } else {
                println!("Blob '{id}' not found");
            }
        }
        Commands::Compact => {
            let report = store.compact(None).await?;
            println!("Compaction finished");
            println!("===================");
            println!("Examined: {}", report.examined);
            println!("Purged:   {} ({} bytes)", report.purged, report.reclaimed_bytes);
            println!("Live:     {}", report.live);
            println!("Absent:   {}", report.absent);
            println!("Failed:   {}", report.failed);
        }
        Commands::List { direct_prefix } => {
            let ids = match direct_prefix {
                Some(prefix) => store.direct_path_blob_id_stream(&prefix)?,
                None => store.blob_id_stream()?,
            };
            let mut ids = Box::pin(ids.into_stream());
            let mut count = 0usize;
            while let Some(id) = ids.try_next().await? {
                println!("{id}");
                count += 1;
            }
            info!("Listed {} blobs", count);
        }
        Commands::Metrics => {
            let metrics = store.metrics()?;
            println!("Blob Store Metrics");
            println!("==================");
            println!("Blobs:           {}", metrics.blob_count);
            println!("Total size:      {}", metrics.total_size);
            println!("Available space: {}", metrics.available_space);
            println!("Writable:        {}", metrics.writable);
        }
    }
    Ok(())
}
