//! Constructs text features for a root class and writes the extended schema.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin construct -- \
//!     --schema schema.json --data customers.jsonl --root Customer \
//!     --count 100 --kind words --output customers.schema.json
//!
//! # Chain a second run on the output, and score every record
//! cargo run --release --bin construct -- \
//!     --schema customers.schema.json --saved --data customers.jsonl \
//!     --root Customer --count 50 --kind ngrams --scores scores.jsonl
//! ```

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use indexmap::IndexMap;
use indicatif::{HumanDuration, ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tracing::info;

use estuary::pipeline::{TextFeatureConfig, TextFeatureConstruction};
use rill::common::{BlockIdx, ClassIdx, TextFeatureKind};
use rill::database::{Database, MemoryDatabase};
use rill::derive::BlockEvaluator;
use rill::sampler::SamplerConfig;
use rill::schema::Schema;

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser, Debug)]
#[command(about = "Construct budgeted text features over a relational schema")]
struct Args {
    /// Schema description JSON, or a schema saved by a previous run with
    /// `--saved`.
    #[arg(long)]
    schema: PathBuf,

    /// The schema file was written by a previous run.
    #[arg(long, default_value_t = false)]
    saved: bool,

    /// JSON-lines file of root records.
    #[arg(long)]
    data: PathBuf,

    /// Root class of the records.
    #[arg(long)]
    root: String,

    /// Number of features to construct.
    #[arg(long, default_value_t = 100)]
    count: usize,

    /// Feature kind: "ngrams", "words" or "tokens".
    #[arg(long, default_value = "ngrams")]
    kind: TextFeatureKind,

    /// Name features TextFeature1, TextFeature2, ... instead of after their
    /// path and token.
    #[arg(long, default_value_t = false)]
    index_names: bool,

    /// Cost added to every text path.
    #[arg(long, default_value_t = 0.0)]
    selection_cost: f64,

    /// Sampler worker threads (0 scans on the main thread). Defaults to the
    /// number of available cores.
    #[arg(long)]
    workers: Option<usize>,

    /// Root records per sampler shard.
    #[arg(long, default_value_t = 10_000)]
    shard_size: usize,

    /// Skip the exact counting pass of the sampler.
    #[arg(long, default_value_t = false)]
    approximate: bool,

    /// Use placeholder tokens instead of scanning the records.
    #[arg(long, default_value_t = false)]
    synthetic: bool,

    /// Write the extended schema to this file.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Write the non-zero feature values of every record, one JSON object
    /// per line, to this file.
    #[arg(long)]
    scores: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let start = Instant::now();

    // ── Step 1: Load schema and records ──
    info!("Step 1: Loading schema and records...");
    let mut schema = if args.saved {
        Schema::from_json_str(&fs::read_to_string(&args.schema)?)?
    } else {
        Schema::load_description(&args.schema)?
    };
    let root = schema.require_class(&args.root)?;
    let database = MemoryDatabase::load_json_lines(&args.data, &schema, root)?;
    info!("  {} records in {}", database.record_count(), database.name());

    // ── Step 2: Construct ──
    info!("Step 2: Constructing {} {} features...", args.count, args.kind.as_str());
    let mut sampler = SamplerConfig {
        shard_size: args.shard_size,
        exact_refinement: !args.approximate,
        synthetic: args.synthetic,
        ..SamplerConfig::default()
    };
    if let Some(workers) = args.workers {
        sampler.num_workers = workers;
    }
    let config = TextFeatureConfig {
        kind: args.kind,
        interpretable_names: !args.index_names,
        selection_cost: args.selection_cost,
        sampler,
    };

    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::with_template("  Sampling   {bar:40.cyan/blue} {pos}% [{elapsed_precise}]")?
            .progress_chars("##-"),
    );
    let progress = pb.clone();
    let construction =
        TextFeatureConstruction::new(config).with_progress(move |p| progress.set_position(p as u64));
    let report = construction.construct(&mut schema, &database, root, args.count)?;
    pb.finish_and_clear();

    println!("{}", report.summary());
    for name in &report.constructed {
        println!("  {name}");
    }

    // ── Step 3: Write outputs ──
    if let Some(output) = &args.output {
        fs::write(output, schema.to_json_pretty()?)?;
        info!("Wrote schema to {}", output.display());
    }
    if let Some(scores) = &args.scores {
        let lines = score_records(&schema, root, &database);
        let mut writer = BufWriter::new(File::create(scores)?);
        for line in &lines {
            serde_json::to_writer(&mut writer, line)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        info!("Wrote {} scored records to {}", lines.len(), scores.display());
    }

    info!("Done in {}", HumanDuration(start.elapsed()));
    Ok(())
}

/// Non-zero values of every feature block of `root`, per record.
fn score_records(schema: &Schema, root: ClassIdx, database: &MemoryDatabase) -> Vec<IndexMap<String, u64>> {
    let class = schema.class(root);
    let evaluators: Vec<BlockEvaluator> = (0..class.blocks.len())
        .map(|b| BlockEvaluator::new(schema, root, BlockIdx(b as u32)))
        .collect();

    database
        .records()
        .par_iter()
        .map(|record| {
            evaluators
                .iter()
                .flat_map(|evaluator| evaluator.evaluate(schema, record))
                .map(|(field, count)| (class.field(field).name.clone(), count))
                .collect()
        })
        .collect()
}
