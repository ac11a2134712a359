//! Inspect a schema from the point of view of text feature construction:
//! classes, text fields reachable from a root, path costs and the budget
//! each path would receive.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin inspect -- --schema schema.json --root Customer
//! cargo run --release --bin inspect -- --schema schema.json --root Customer --count 250
//! ```

use std::fs;
use std::path::PathBuf;

use clap::Parser;

use estuary::discovery::contains_text_fields;
use estuary::pipeline::{TextFeatureConfig, TextFeatureConstruction};
use rill::common::TextFeatureKind;
use rill::schema::Schema;

#[derive(Parser, Debug)]
#[command(about = "Inspect text paths and budget allocation of a schema")]
struct Args {
    /// Schema description JSON, or a schema saved by `construct` with
    /// `--saved`.
    #[arg(long)]
    schema: PathBuf,

    /// The schema file was written by `construct`.
    #[arg(long, default_value_t = false)]
    saved: bool,

    /// Root class.
    #[arg(long)]
    root: String,

    /// Feature budget to preview.
    #[arg(long, default_value_t = 100)]
    count: usize,

    /// Feature kind used to count existing features.
    #[arg(long, default_value = "ngrams")]
    kind: TextFeatureKind,

    /// Cost added to every text path.
    #[arg(long, default_value_t = 0.0)]
    selection_cost: f64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let schema = if args.saved {
        Schema::from_json_str(&fs::read_to_string(&args.schema)?)?
    } else {
        Schema::load_description(&args.schema)?
    };
    let root = schema.require_class(&args.root)?;

    let construction = TextFeatureConstruction::new(TextFeatureConfig {
        kind: args.kind,
        selection_cost: args.selection_cost,
        ..TextFeatureConfig::default()
    });
    let index = construction.plan(&schema, root, args.count)?;
    let paths = index.root_paths();

    let num_fields: usize = schema.classes().iter().map(|c| c.fields.len()).sum();
    let num_blocks: usize = schema.classes().iter().map(|c| c.blocks.len()).sum();
    let total_prob: f64 = paths.iter().map(|p| (-p.cost).exp()).sum();

    // ── Overview ──────────────────────────────────────────────────────────
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║  Schema: {}", args.schema.display());
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Classes:    {:>10}", schema.classes().len());
    println!("║  Fields:     {num_fields:>10}");
    println!("║  Blocks:     {num_blocks:>10}");
    println!("║  Root:       {:>10}", args.root);
    println!("║  Text paths: {:>10} (total probability {total_prob:.4})", paths.len());
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    // ── Classes ──────────────────────────────────────────────────────────
    for class in schema.classes() {
        println!("Class {} ({} fields, {} blocks)", class.name, class.fields.len(), class.blocks.len());
        for field in &class.fields {
            let mut notes = Vec::new();
            if !field.used {
                notes.push("unused".to_string());
            }
            if let Some(rule) = &field.derivation {
                notes.push(format!("derived: {}", rule.op.name()));
            }
            if let Some(membership) = &field.block {
                notes.push(format!("block {} key {}", class.block(membership.block).name, membership.key));
            }
            if let Some(target) = field.ftype.target_class() {
                notes.push(format!("-> {}", schema.class(target).name));
            }
            let notes = if notes.is_empty() {
                String::new()
            } else {
                format!("  [{}]", notes.join(", "))
            };
            println!("  {:<32} {:<12}{notes}", field.name, field.ftype.label());
        }
        for block in &class.blocks {
            println!("  block {:<26} {:<12} {} members", block.name, block.rule.name(), block.members.len());
        }
        println!();
    }

    // ── Text index ───────────────────────────────────────────────────────
    println!("Text index from {}:", args.root);
    for entry in index.entries() {
        let class = schema.class(entry.class);
        let names = |fields: &mut dyn Iterator<Item = &rill::common::FieldIdx>| {
            fields
                .map(|f| class.field(*f).name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        println!(
            "  {:<20} text: [{}]  relations: [{}]  reaches text: {}",
            class.name,
            names(&mut entry.text_fields.iter()),
            names(&mut entry.text_relations.iter()),
            contains_text_fields(&schema, entry.class)
        );
    }
    println!();

    // ── Allocation ───────────────────────────────────────────────────────
    println!("Allocation of {} features:", args.count);
    println!("  {:<40} {:>8} {:>8} {:>9} {:>9}", "path", "cost", "prob", "allocated", "existing");
    for path in paths {
        println!(
            "  {:<40} {:>8.4} {:>8.4} {:>9} {:>9}",
            path.name(&schema),
            path.cost,
            (-path.cost).exp() / total_prob,
            path.allocated_count,
            path.existing_count
        );
    }
    Ok(())
}
