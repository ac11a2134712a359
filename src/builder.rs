//! Turns budgeted text paths into feature blocks of the schema.

use tracing::{debug, info};

use rill::common::{BlockIdx, ClassIdx, FieldIdx, TextFeatureKind, VarKey};
use rill::ngram::layout;
use rill::schema::{BlockKey, BlockRule, Operand, Schema, SchemaError};
use rill::tokenizer::token_to_key;

use crate::cost::universal_code_length;
use crate::discovery::{PathModel, SchemaTextIndex};

/// Prefix of index-based names.
pub const INDEX_NAME_PREFIX: &str = "TextFeature";

/// Source field of `path` on the root class if it already exists: the
/// terminal field itself, or an equivalent derived field.
fn existing_source(schema: &Schema, root: ClassIdx, path: &PathModel) -> Result<Option<FieldIdx>, SchemaError> {
    Ok(match schema.path_operand(root, &path.hops)? {
        Operand::Field(field) => Some(field),
        Operand::Rule(rule) => schema.find_derived_field(root, &rule),
    })
}

/// Existing block computing `kind` features from the source of `path`.
fn existing_block(
    schema: &Schema,
    root: ClassIdx,
    path: &PathModel,
    kind: TextFeatureKind,
) -> Result<Option<BlockIdx>, SchemaError> {
    let Some(source) = existing_source(schema, root, path)? else {
        return Ok(None);
    };
    let ftype = schema.field(root, source).ftype;
    Ok(BlockRule::for_source(kind, source, ftype).and_then(|rule| schema.find_block(root, &rule)))
}

/// Number of features already computed by an equivalent block.
pub fn existing_feature_count(
    schema: &Schema,
    root: ClassIdx,
    path: &PathModel,
    kind: TextFeatureKind,
) -> Result<usize, SchemaError> {
    Ok(existing_block(schema, root, path, kind)?
        .map(|block| schema.class(root).block(block).members.len())
        .unwrap_or(0))
}

/// Interpretable name of an n-gram slot, e.g. `Comment.3gram4096[17]`.
fn ngram_feature_name(field: &str, key: VarKey) -> String {
    match layout().locate(key) {
        Some((table, slot)) => {
            let table = &layout().tables()[table];
            format!("{field}.{}gram{}[{slot}]", table.ngram_length, table.size)
        }
        None => format!("{field}.ngram[{}]", key.0),
    }
}

/// Inserts derived fields, blocks and features into a schema.
///
/// Meant to run on a working copy: a failure leaves the schema half built.
pub struct FeatureBuilder<'s> {
    schema: &'s mut Schema,
    root: ClassIdx,
    kind: TextFeatureKind,
    interpretable_names: bool,
    /// Shared by every index-based name of the run.
    name_counter: usize,
    constructed: Vec<FieldIdx>,
}

impl<'s> FeatureBuilder<'s> {
    pub fn new(schema: &'s mut Schema, root: ClassIdx, kind: TextFeatureKind, interpretable_names: bool) -> Self {
        Self {
            schema,
            root,
            kind,
            interpretable_names,
            name_counter: 0,
            constructed: Vec::new(),
        }
    }

    /// Features constructed so far, in construction order.
    pub fn constructed(&self) -> &[FieldIdx] {
        &self.constructed
    }

    fn next_index_name(&mut self) -> String {
        self.name_counter += 1;
        self.schema
            .build_field_name(self.root, &format!("{INDEX_NAME_PREFIX}{}", self.name_counter))
    }

    fn feature_name(&mut self, interpretable: &str) -> String {
        if self.interpretable_names {
            self.schema.build_field_name(self.root, interpretable)
        } else {
            self.next_index_name()
        }
    }

    /// Source field of `path` on the root class. Multi-hop paths get an
    /// unused derived field, reused when an equivalent one exists.
    pub fn build_path_field(&mut self, path: &PathModel) -> Result<FieldIdx, SchemaError> {
        let rule = match self.schema.path_operand(self.root, &path.hops)? {
            Operand::Field(field) => return Ok(field),
            Operand::Rule(rule) => *rule,
        };
        if let Some(field) = self.schema.find_derived_field(self.root, &rule) {
            return Ok(field);
        }
        let path_name = path.name(self.schema);
        let name = self.feature_name(&path_name);
        self.schema.insert_derived_field(self.root, &name, rule, false)
    }

    /// Block of `kind` features over `source`, created if missing.
    pub fn build_block(&mut self, source: FieldIdx) -> Result<BlockIdx, SchemaError> {
        let source_field = self.schema.field(self.root, source);
        let rule = BlockRule::for_source(self.kind, source, source_field.ftype).ok_or_else(|| {
            SchemaError::TypeMismatch {
                context: source_field.name.clone(),
                expected: "text-based",
                found: source_field.ftype.label(),
            }
        })?;
        if let Some(block) = self.schema.find_block(self.root, &rule) {
            return Ok(block);
        }
        let name = self
            .schema
            .build_block_name(self.root, &format!("{}.{}", source_field.name, self.kind.as_str()));
        self.schema.create_block(self.root, &name, rule)
    }

    /// Keys of the next `allocated_count` features of `path`, skipping keys
    /// already in an equivalent block.
    fn candidate_keys(&self, path: &PathModel) -> Result<Vec<BlockKey>, SchemaError> {
        let existing = match existing_block(self.schema, self.root, path, self.kind)? {
            Some(block) => self.schema.block_keys(self.root, block),
            None => Default::default(),
        };
        let wanted = path.allocated_count;

        let keys = match self.kind {
            TextFeatureKind::Ngrams => (1..=layout().max_var_key())
                .map(|key| BlockKey::Slot(VarKey(key)))
                .filter(|key| !existing.contains(key))
                .take(wanted)
                .collect(),
            TextFeatureKind::Words | TextFeatureKind::Tokens => path
                .tokens
                .iter()
                .map(|t| BlockKey::Token(token_to_key(&t.token)))
                .filter(|key| !existing.contains(key))
                .take(wanted)
                .collect(),
        };
        Ok(keys)
    }

    /// Builds the features of one path; returns how many were added.
    ///
    /// Fewer than `allocated_count` are added when the path ran out of
    /// sampled tokens.
    pub fn build_features(&mut self, path: &PathModel) -> Result<usize, SchemaError> {
        if path.allocated_count == 0 {
            return Ok(0);
        }
        let keys = self.candidate_keys(path)?;
        if keys.is_empty() {
            debug!(
                "FeatureBuilder::build_features: path={}, no new feature available",
                path.name(self.schema)
            );
            return Ok(0);
        }

        let source = self.build_path_field(path)?;
        let block = self.build_block(source)?;
        let source_name = self.schema.field(self.root, source).name.clone();

        for (rank, key) in keys.iter().enumerate() {
            let descriptive = match key {
                BlockKey::Slot(slot) => ngram_feature_name(&source_name, *slot),
                BlockKey::Token(token) => format!("{source_name}({token})"),
            };
            let name = self.feature_name(&descriptive);
            let cost = path.cost + universal_code_length(rank + 1);
            let field = self
                .schema
                .insert_block_field(self.root, block, &name, key.clone(), cost)?;
            self.constructed.push(field);
        }

        if keys.len() < path.allocated_count {
            info!(
                "FeatureBuilder::build_features: path={}, built={}, allocated={} (vocabulary exhausted)",
                path.name(self.schema),
                keys.len(),
                path.allocated_count
            );
        }
        Ok(keys.len())
    }

    /// Builds the features of every root path of `index`.
    pub fn build_all(&mut self, index: &SchemaTextIndex) -> Result<usize, SchemaError> {
        let mut total = 0;
        for path in index.root_paths() {
            total += self.build_features(path)?;
        }
        debug_assert!(total <= index.root_paths().iter().map(|p| p.allocated_count).sum());
        Ok(total)
    }
}
