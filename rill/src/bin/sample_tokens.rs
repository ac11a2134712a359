//! Samples the most frequent tokens of text fields from a JSON-lines database.
//!
//! ## Input
//!
//! - a schema description (`{"classes": {...}}`, see `Schema::from_description`)
//! - a JSON-lines file with one root record per line, sub-tables nested as
//!   arrays of objects
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin sample_tokens -- \
//!     --schema schema.json --data customers.jsonl --root Customer \
//!     --fields Name,Orders.Comment --kind words --count 50
//! ```

use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use indicatif::{HumanDuration, ProgressBar, ProgressStyle};
use tracing::info;

use rill::common::TextFeatureKind;
use rill::database::{Database, MemoryDatabase};
use rill::sampler::{SampleRequest, SamplerConfig, TokenSampler};
use rill::schema::Schema;
use rill::tokenizer::TokenPolicy;

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser, Debug)]
#[command(about = "Sample frequent tokens of text fields from a JSON-lines database")]
struct Args {
    /// Schema description JSON.
    #[arg(long)]
    schema: PathBuf,

    /// JSON-lines file of root records.
    #[arg(long)]
    data: PathBuf,

    /// Root class of the records.
    #[arg(long)]
    root: String,

    /// Dotted paths of text fields, relative to the root class.
    #[arg(long, value_delimiter = ',', required = true)]
    fields: Vec<String>,

    /// Tokenization: "words" or "tokens".
    #[arg(long, default_value = "words")]
    kind: TextFeatureKind,

    /// Tokens to keep per field.
    #[arg(long, default_value_t = 20)]
    count: usize,

    /// Worker threads (0 scans on the main thread). Defaults to the number
    /// of available cores.
    #[arg(long)]
    workers: Option<usize>,

    /// Root records per shard.
    #[arg(long, default_value_t = 10_000)]
    shard_size: usize,

    /// Skip the exact counting pass and keep pass-1 estimates.
    #[arg(long, default_value_t = false)]
    approximate: bool,

    /// Write the samples as JSON to this file.
    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let policy = TokenPolicy::for_kind(args.kind)
        .ok_or("n-gram features are hashed and need no token sample; use --kind words or tokens")?;
    let start = Instant::now();

    // ── Step 1: Load schema and records ──
    info!("Step 1: Loading schema and records...");
    let schema = Schema::load_description(&args.schema)?;
    let root = schema.require_class(&args.root)?;
    let database = MemoryDatabase::load_json_lines(&args.data, &schema, root)?;
    info!("  {} records in {}", database.record_count(), database.name());

    // ── Step 2: Resolve fields ──
    let requests = args
        .fields
        .iter()
        .map(|path| {
            let hops = schema.resolve_path(root, path)?;
            Ok(SampleRequest {
                name: path.clone(),
                source: schema.path_operand(root, &hops)?,
                policy,
                requested: args.count,
            })
        })
        .collect::<Result<Vec<_>, rill::schema::SchemaError>>()?;

    // ── Step 3: Sample ──
    info!("Step 3: Sampling {} fields...", requests.len());
    let mut config = SamplerConfig {
        shard_size: args.shard_size,
        exact_refinement: !args.approximate,
        ..SamplerConfig::default()
    };
    if let Some(workers) = args.workers {
        config.num_workers = workers;
    }

    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::with_template("  Sampling   {bar:40.cyan/blue} {pos}% [{elapsed_precise}]")?
            .progress_chars("##-"),
    );
    let progress = pb.clone();
    let sampler = TokenSampler::new(&schema, &database, config).with_progress(move |p| progress.set_position(p as u64));
    info!("  Estimated peak token entries: {}", sampler.resource_estimate(&requests));
    let samples = sampler.sample(&requests)?;
    pb.finish_and_clear();

    for (request, tokens) in requests.iter().zip(&samples) {
        println!("{} ({} tokens)", request.name, tokens.len());
        for token in tokens {
            println!("  {:>10}  {}", token.frequency, token.token);
        }
    }

    if let Some(output) = &args.output {
        let named: indexmap::IndexMap<&str, _> = requests
            .iter()
            .map(|r| r.name.as_str())
            .zip(&samples)
            .collect();
        fs::write(output, serde_json::to_string_pretty(&named)?)?;
        info!("Wrote {}", output.display());
    }

    info!("Done in {}", HumanDuration(start.elapsed()));
    Ok(())
}
