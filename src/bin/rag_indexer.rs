use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use cisnr_assistant::config::Secret;
use cisnr_assistant::indexer::chunker::Chunker;
use cisnr_assistant::indexer::extractor::extract_text;
use cisnr_assistant::indexer::walker::{find_documents, DocumentFormat};
use cisnr_assistant::indexer::{point_id, source_name, IndexRun};
use cisnr_assistant::rag::embeddings::{Embedder, GeminiEmbedder};
use cisnr_assistant::rag::vector_store::{ChunkPoint, QdrantStore};

#[derive(Parser, Debug)]
#[command(name = "rag-indexer")]
#[command(about = "Index documents into the CISNR assistant's vector store")]
struct Args {
    /// Directory to recursively index
    #[arg(short, long)]
    dir: PathBuf,

    /// Qdrant server URL
    #[arg(long, env = "QDRANT_URL", default_value = "http://localhost:6334")]
    qdrant_url: String,

    #[arg(long, env = "QDRANT_API_KEY", hide_env_values = true)]
    qdrant_api_key: String,

    /// Qdrant collection name
    #[arg(long, env = "VECTOR_INDEX_NAME")]
    collection: String,

    /// Gemini API key used for document embeddings
    #[arg(long, env = "GOOGLE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[arg(long, env = "EMBEDDING_MODEL", default_value = "models/embedding-001")]
    embedding_model: String,

    #[arg(
        long,
        env = "GEMINI_BASE_URL",
        default_value = "https://generativelanguage.googleapis.com/v1beta"
    )]
    gemini_base_url: String,

    /// Embed locally with a fastembed model directory instead of calling Gemini
    #[cfg(feature = "local-embeddings")]
    #[arg(long, env = "LOCAL_EMBEDDING_MODEL_DIR")]
    local_model_dir: Option<PathBuf>,

    /// Maximum chunk size in characters
    #[arg(long, default_value_t = 1000)]
    chunk_size: usize,

    /// Overlap between chunks in characters
    #[arg(long, default_value_t = 200)]
    chunk_overlap: usize,

    /// Chunks embedded and upserted per request
    #[arg(long, default_value_t = 32)]
    batch_size: usize,

    /// Keep chunks of files that were deleted or shrank since the last run
    #[arg(long)]
    keep_stale: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    if !args.dir.is_dir() {
        anyhow::bail!("Directory does not exist: {}", args.dir.display());
    }
    let chunker = Chunker::new(args.chunk_size, args.chunk_overlap)?;

    println!("Initializing embedding provider...");
    let embedder = build_embedder(&args)?;

    println!("Connecting to Qdrant at {}...", args.qdrant_url);
    let store = QdrantStore::new(
        &args.qdrant_url,
        &Secret::new(args.qdrant_api_key.clone()),
        &args.collection,
        Duration::from_secs(60),
    )?;

    println!("Scanning directory: {}", args.dir.display());
    let files = find_documents(&args.dir);
    println!("Found {} supported files", files.len());

    if files.is_empty() {
        println!("No supported files found. Exiting.");
        return Ok(());
    }

    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    let mut indexer = Indexer {
        embedder: embedder.as_ref(),
        store: &store,
        chunker,
        batch_size: args.batch_size.max(1),
        collection_ready: false,
    };

    let mut run = IndexRun::default();
    let mut success_count = 0usize;
    let mut total_chunks = 0usize;
    let mut failed_files: Vec<(PathBuf, String)> = Vec::new();

    for (path, format) in &files {
        let source = source_name(&args.dir, path);
        pb.set_message(source.clone());
        run.saw(&source);

        match indexer.index_file(path, *format, &source).await {
            Ok(ids) => {
                success_count += 1;
                total_chunks += ids.len();
                run.indexed(&source, ids);
            }
            Err(e) => {
                tracing::warn!("Failed to process {}: {:#}", path.display(), e);
                failed_files.push((path.clone(), format!("{:#}", e)));
            }
        }

        pb.inc(1);
    }

    pb.finish_with_message("done");

    let removed = if args.keep_stale {
        0
    } else {
        match remove_stale(&store, &run).await {
            Ok(count) => count,
            Err(e) => {
                tracing::error!("Failed to clean up stale chunks: {:#}", e);
                0
            }
        }
    };

    println!("\nIndexing complete!");
    println!("  Files processed: {}/{}", success_count, files.len());
    println!("  Files failed:    {}", failed_files.len());
    println!("  Total chunks:    {}", total_chunks);
    println!("  Stale removed:   {}", removed);
    println!("  Embeddings:      {}", embedder.name());
    println!("  Collection:      {}", store.collection_name());
    println!("  Qdrant URL:      {}", args.qdrant_url);

    if !failed_files.is_empty() {
        println!("\nFailed files:");
        for (path, err) in &failed_files {
            println!("  {}: {}", path.display(), err);
        }
    }

    Ok(())
}

fn build_embedder(args: &Args) -> Result<Arc<dyn Embedder>> {
    #[cfg(feature = "local-embeddings")]
    {
        if let Some(dir) = &args.local_model_dir {
            let embedder = cisnr_assistant::rag::embeddings::LocalEmbedder::new(dir)?;
            return Ok(Arc::new(embedder));
        }
    }

    let api_key = args
        .api_key
        .clone()
        .filter(|k| !k.trim().is_empty())
        .context("GOOGLE_API_KEY (or --api-key) is required for Gemini embeddings")?;
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()?;

    Ok(Arc::new(GeminiEmbedder::new(
        client,
        &args.gemini_base_url,
        &args.embedding_model,
        Secret::new(api_key),
    )))
}

async fn remove_stale(store: &QdrantStore, run: &IndexRun) -> Result<usize> {
    if !store.exists().await? {
        return Ok(0);
    }

    let stale = run.stale(&store.stored_points().await?);
    let count = stale.len();
    if count > 0 {
        tracing::info!("Removing {} stale chunks", count);
        store.delete_points(stale).await?;
    }
    Ok(count)
}

struct Indexer<'a> {
    embedder: &'a dyn Embedder,
    store: &'a QdrantStore,
    chunker: Chunker,
    batch_size: usize,
    collection_ready: bool,
}

impl Indexer<'_> {
    /// Returns the ids of every point written for the file.
    async fn index_file(&mut self, path: &Path, format: DocumentFormat, source: &str) -> Result<Vec<String>> {
        let text = extract_text(path, format)?;
        let chunks = self.chunker.split(&text);
        let mut ids = Vec::with_capacity(chunks.len());

        for batch in chunks.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = self
                .embedder
                .embed_documents(&texts)
                .await
                .with_context(|| format!("embedding {}", source))?;

            if !self.collection_ready {
                let dimension = vectors.first().map_or(0, |v| v.len()) as u64;
                self.store.ensure_collection(dimension).await?;
                self.collection_ready = true;
            }

            let points: Vec<ChunkPoint> = batch
                .iter()
                .zip(vectors)
                .map(|(chunk, vector)| ChunkPoint {
                    id: point_id(source, chunk.chunk_index),
                    text: chunk.text.clone(),
                    source: source.to_string(),
                    chunk_index: chunk.chunk_index,
                    vector,
                })
                .collect();
            ids.extend(points.iter().map(|p| p.id.clone()));

            self.store
                .upsert(points)
                .await
                .with_context(|| format!("storing {}", source))?;
        }

        tracing::debug!("Indexed {} chunks from {}", ids.len(), source);
        Ok(ids)
    }
}
