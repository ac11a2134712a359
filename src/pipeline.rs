//! End-to-end text feature construction.
//!
//! Discovery, costing and allocation run on the schema; the token sampler
//! scans the database when the feature kind needs a vocabulary; the
//! builder then works on a copy of the schema that replaces the original
//! only when every step succeeded.

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use rill::common::{ClassIdx, TextFeatureKind};
use rill::database::Database;
use rill::sampler::{Interrupt, ProgressFn, SampleRequest, SamplerConfig, SamplerError, TokenSampler};
use rill::schema::{Schema, SchemaError};
use rill::tokenizer::TokenPolicy;

use crate::allocation::allocate_budget;
use crate::builder::{FeatureBuilder, existing_feature_count};
use crate::cost::compute_costs;
use crate::discovery::{SchemaTextIndex, discover};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct TextFeatureConfig {
    pub kind: TextFeatureKind,
    /// Name features after their path and token rather than `TextFeatureN`.
    pub interpretable_names: bool,
    /// Added to the cost of every path.
    pub selection_cost: f64,
    pub sampler: SamplerConfig,
}

impl Default for TextFeatureConfig {
    fn default() -> Self {
        Self {
            kind: TextFeatureKind::default(),
            interpretable_names: true,
            selection_cost: 0.0,
            sampler: SamplerConfig::default(),
        }
    }
}

// ============================================================================
// Errors and Report
// ============================================================================

#[derive(Debug, Error)]
pub enum ConstructionError {
    #[error(transparent)]
    Sampler(#[from] SamplerError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("database {database} holds {found} records, not {expected}")]
    WrongDatabase {
        database: String,
        expected: String,
        found: String,
    },
}

impl ConstructionError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, ConstructionError::Sampler(SamplerError::Interrupted))
    }
}

#[derive(Debug, Clone)]
pub struct ConstructionReport {
    /// Names of the new features, in construction order.
    pub constructed: Vec<String>,
    pub requested: usize,
    pub kind: TextFeatureKind,
    pub elapsed: Duration,
}

impl ConstructionReport {
    pub fn constructed_count(&self) -> usize {
        self.constructed.len()
    }

    pub fn summary(&self) -> String {
        let count = self.constructed_count();
        if count == self.requested {
            format!(
                "Text feature construction time: {:.2?} ({} {})",
                self.elapsed,
                count,
                self.kind.as_str()
            )
        } else {
            format!(
                "Text feature construction time: {:.2?} ({} {}, out of {} planned)",
                self.elapsed,
                count,
                self.kind.as_str(),
                self.requested
            )
        }
    }
}

// ============================================================================
// Construction
// ============================================================================

pub struct TextFeatureConstruction<'a> {
    config: TextFeatureConfig,
    interrupt: Interrupt,
    progress: Option<ProgressFn<'a>>,
}

impl<'a> TextFeatureConstruction<'a> {
    pub fn new(config: TextFeatureConfig) -> Self {
        Self {
            config,
            interrupt: Interrupt::new(),
            progress: None,
        }
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// `progress` receives the percentage of records read by each scan.
    pub fn with_progress(mut self, progress: impl Fn(f64) + Send + Sync + 'a) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    pub fn config(&self) -> &TextFeatureConfig {
        &self.config
    }

    /// Discovered, costed and budgeted text paths of `root`, without
    /// sampling.
    pub fn plan(&self, schema: &Schema, root: ClassIdx, feature_number: usize) -> Result<SchemaTextIndex, SchemaError> {
        let mut index = discover(schema, root);
        compute_costs(&mut index, self.config.selection_cost);
        allocate_budget(&mut index, feature_number);
        for path in index.root_paths_mut() {
            path.existing_count = existing_feature_count(schema, root, path, self.config.kind)?;
        }
        Ok(index)
    }

    /// Adds up to `feature_number` text features to `root`.
    ///
    /// On error `schema` is left unchanged.
    pub fn construct(
        &self,
        schema: &mut Schema,
        database: &dyn Database,
        root: ClassIdx,
        feature_number: usize,
    ) -> Result<ConstructionReport, ConstructionError> {
        let start = Instant::now();
        info!(
            "TextFeatureConstruction::construct: root={}, feature_number={}, kind={}",
            schema.class(root).name,
            feature_number,
            self.config.kind.as_str()
        );

        let result = self.run(schema, database, root, feature_number, start);
        if let Err(err) = &result {
            if err.is_interrupted() {
                warn!("Text feature construction interrupted after {:.2?}", start.elapsed());
            } else {
                warn!("TextFeatureConstruction::construct: failed: {}", err);
            }
        }
        result
    }

    fn run(
        &self,
        schema: &mut Schema,
        database: &dyn Database,
        root: ClassIdx,
        feature_number: usize,
        start: Instant,
    ) -> Result<ConstructionReport, ConstructionError> {
        let mut report = ConstructionReport {
            constructed: Vec::new(),
            requested: feature_number,
            kind: self.config.kind,
            elapsed: Duration::ZERO,
        };
        if feature_number == 0 {
            report.elapsed = start.elapsed();
            return Ok(report);
        }
        if database.class() != root {
            return Err(ConstructionError::WrongDatabase {
                database: database.name().to_string(),
                expected: schema.class(root).name.clone(),
                found: schema
                    .classes()
                    .get(database.class().index())
                    .map(|c| c.name.clone())
                    .unwrap_or_default(),
            });
        }

        // ── Step 1: plan ──
        let mut index = self.plan(schema, root, feature_number)?;
        if index.root_paths().is_empty() {
            info!("TextFeatureConstruction::construct: no text field reachable from {}", schema.class(root).name);
            report.elapsed = start.elapsed();
            return Ok(report);
        }

        // ── Step 2: vocabulary ──
        if self.config.kind.needs_token_sample() {
            self.sample_tokens(schema, database, root, &mut index)?;
        }
        if self.interrupt.is_triggered() {
            return Err(SamplerError::Interrupted.into());
        }

        // ── Step 3: build on a working copy ──
        let mut working = schema.clone();
        let mut builder = FeatureBuilder::new(&mut working, root, self.config.kind, self.config.interpretable_names);
        builder.build_all(&index)?;
        let constructed = builder.constructed().to_vec();
        debug_assert!(constructed.len() <= feature_number);

        working.validate()?;
        report.constructed = constructed
            .iter()
            .map(|&field| working.field(root, field).name.clone())
            .collect();
        *schema = working;

        report.elapsed = start.elapsed();
        info!("{}", report.summary());
        Ok(report)
    }

    /// Fills the tokens of every budgeted path with one sampler run.
    fn sample_tokens(
        &self,
        schema: &Schema,
        database: &dyn Database,
        root: ClassIdx,
        index: &mut SchemaTextIndex,
    ) -> Result<(), ConstructionError> {
        let Some(policy) = TokenPolicy::for_kind(self.config.kind) else {
            return Ok(());
        };
        let mut requests = Vec::new();
        let mut targets = Vec::new();
        for (i, path) in index.root_paths().iter().enumerate() {
            if path.allocated_count == 0 {
                continue;
            }
            requests.push(SampleRequest {
                name: path.name(schema),
                source: schema.path_operand(root, &path.hops)?,
                policy,
                requested: path.allocated_count + path.existing_count,
            });
            targets.push(i);
        }

        let mut sampler =
            TokenSampler::new(schema, database, self.config.sampler.clone()).with_interrupt(self.interrupt.clone());
        if let Some(progress) = &self.progress {
            sampler = sampler.with_progress(move |percent| progress(percent));
        }
        debug!(
            "TextFeatureConstruction::sample_tokens: requests={}, estimated_entries={}",
            requests.len(),
            sampler.resource_estimate(&requests)
        );

        let samples = sampler.sample(&requests)?;
        let paths = index.root_paths_mut();
        for (target, tokens) in targets.into_iter().zip(samples) {
            paths[target].tokens = tokens;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill::common::FieldType;
    use rill::database::MemoryDatabase;
    use rill::derive::evaluate_block;

    fn config(kind: TextFeatureKind) -> TextFeatureConfig {
        TextFeatureConfig {
            kind,
            sampler: SamplerConfig {
                num_workers: 2,
                shard_size: 2,
                ..SamplerConfig::default()
            },
            ..TextFeatureConfig::default()
        }
    }

    fn root_only() -> (Schema, ClassIdx, MemoryDatabase) {
        let mut schema = Schema::new();
        let root = schema.add_class("Root").unwrap();
        schema.add_field(root, "Id", FieldType::Categorical).unwrap();
        schema.add_field(root, "T1", FieldType::Text).unwrap();
        let data = r#"{"Id": "1", "T1": "red green blue"}
{"Id": "2", "T1": "red green yellow"}
{"Id": "3", "T1": "red black white"}
{"Id": "4", "T1": "red, green!"}
"#;
        let database = MemoryDatabase::from_json_lines("root", &schema, root, data.as_bytes()).unwrap();
        (schema, root, database)
    }

    fn with_sub_table() -> (Schema, ClassIdx, MemoryDatabase) {
        let mut schema = Schema::new();
        let root = schema.add_class("Root").unwrap();
        let sub = schema.add_class("SubTable").unwrap();
        schema.add_field(root, "Id", FieldType::Categorical).unwrap();
        schema.add_field(root, "Rows", FieldType::ObjectArray(sub)).unwrap();
        schema.add_field(sub, "T2", FieldType::Text).unwrap();
        let data = r#"{"Id": "1", "Rows": [{"T2": "late delivery"}, {"T2": "late again"}]}
{"Id": "2", "Rows": [{"T2": "good product"}]}
{"Id": "3", "Rows": []}
{"Id": "4", "Rows": [{"T2": "late"}, {"T2": "good"}, {"T2": "broken box"}]}
"#;
        let database = MemoryDatabase::from_json_lines("root", &schema, root, data.as_bytes()).unwrap();
        (schema, root, database)
    }

    #[test]
    fn test_single_text_field() {
        let (mut schema, root, database) = root_only();
        let report = TextFeatureConstruction::new(config(TextFeatureKind::Words))
            .construct(&mut schema, &database, root, 5)
            .unwrap();

        assert_eq!(report.constructed_count(), 5);
        assert_eq!(report.requested, 5);
        assert!(report.constructed.iter().all(|name| name.starts_with("T1(")));
        // Most frequent first
        assert_eq!(report.constructed[0], "T1(red)");
        assert_eq!(report.constructed[1], "T1(green)");
        assert!(report.summary().ends_with("(5 words)"), "{}", report.summary());

        let block = &schema.class(root).blocks[0];
        assert_eq!(block.members.len(), 5);
        schema.validate().unwrap();
    }

    #[test]
    fn test_sub_table_path() {
        let (mut schema, root, database) = with_sub_table();
        let report = TextFeatureConstruction::new(config(TextFeatureKind::Words))
            .construct(&mut schema, &database, root, 3)
            .unwrap();

        assert_eq!(report.constructed_count(), 3);
        let class = schema.class(root);
        let path_field = class.lookup_field("Rows.T2").unwrap();
        assert!(!class.field(path_field).used);
        assert_eq!(class.field(path_field).ftype, FieldType::TextList);
        assert_eq!(report.constructed[0], "Rows.T2(late)");
        assert_eq!(report.constructed[1], "Rows.T2(good)");

        // Scoring the first record counts "late" twice
        let block = class.blocks[0].members.clone();
        let counts = evaluate_block(&schema, root, rill::common::BlockIdx(0), &database.records()[0]);
        assert_eq!(counts[0], (block[0], 2));
    }

    #[test]
    fn test_zero_budget_leaves_schema_untouched() {
        let (mut schema, root, database) = root_only();
        let before = schema.to_json_pretty().unwrap();
        let report = TextFeatureConstruction::new(config(TextFeatureKind::Words))
            .construct(&mut schema, &database, root, 0)
            .unwrap();

        assert_eq!(report.constructed_count(), 0);
        assert_eq!(schema.to_json_pretty().unwrap(), before);
    }

    #[test]
    fn test_interruption_leaves_schema_untouched() {
        let (mut schema, root, database) = with_sub_table();
        let before = schema.to_json_pretty().unwrap();
        let interrupt = Interrupt::new();
        interrupt.trigger();

        let err = TextFeatureConstruction::new(config(TextFeatureKind::Tokens))
            .with_interrupt(interrupt)
            .construct(&mut schema, &database, root, 3)
            .unwrap_err();
        assert!(err.is_interrupted());
        assert_eq!(schema.to_json_pretty().unwrap(), before);
    }

    #[test]
    fn test_ngrams_need_no_sample() {
        let (mut schema, root, database) = with_sub_table();
        let report = TextFeatureConstruction::new(config(TextFeatureKind::Ngrams))
            .construct(&mut schema, &database, root, 4)
            .unwrap();

        assert_eq!(report.constructed_count(), 4);
        assert_eq!(report.constructed[0], "Rows.T2.1gram1[0]");
        // Every character falls in the single slot of the first table
        let counts = evaluate_block(&schema, root, rill::common::BlockIdx(0), &database.records()[1]);
        let first_member = schema.class(root).blocks[0].members[0];
        assert_eq!(counts[0], (first_member, "good product".len() as u64));
    }

    #[test]
    fn test_budget_bound_with_small_vocabulary() {
        let (mut schema, root, database) = root_only();
        let report = TextFeatureConstruction::new(config(TextFeatureKind::Tokens))
            .construct(&mut schema, &database, root, 50)
            .unwrap();

        // red green blue yellow black white "red," green!
        assert_eq!(report.constructed_count(), 8);
        assert!(report.summary().ends_with("(8 tokens, out of 50 planned)"), "{}", report.summary());
    }

    #[test]
    fn test_second_run_extends_existing_block() {
        let (mut schema, root, database) = root_only();
        let construction = TextFeatureConstruction::new(config(TextFeatureKind::Words));
        construction.construct(&mut schema, &database, root, 2).unwrap();
        let report = construction.construct(&mut schema, &database, root, 2).unwrap();

        assert_eq!(report.constructed_count(), 2);
        assert_eq!(schema.class(root).blocks.len(), 1);
        assert_eq!(schema.class(root).blocks[0].members.len(), 4);
        let plan = construction.plan(&schema, root, 1).unwrap();
        assert_eq!(plan.root_paths()[0].existing_count, 4);
    }

    #[test]
    fn test_synthetic_sampling() {
        let (mut schema, root, database) = root_only();
        let mut config = config(TextFeatureKind::Words);
        config.sampler.synthetic = true;
        config.interpretable_names = false;
        let report = TextFeatureConstruction::new(config)
            .construct(&mut schema, &database, root, 3)
            .unwrap();

        assert_eq!(report.constructed, vec!["TextFeature1", "TextFeature2", "TextFeature3"]);
        let class = schema.class(root);
        let keys: Vec<String> = class.blocks[0]
            .members
            .iter()
            .filter_map(|f| class.field(*f).block.as_ref().map(|b| b.key.to_string()))
            .collect();
        assert_eq!(keys, vec!["A", "B", "C"]);
    }
}
