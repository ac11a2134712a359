//! In-memory relational schema: classes, typed fields, derived fields and
//! feature blocks.
//!
//! The schema is the catalog the feature construction reads from and writes
//! into. Field kinds are never mutated once declared; construction only adds
//! derived fields and blocks, and uses the signature lookups
//! ([`Schema::find_derived_field`], [`Schema::find_block`]) to avoid adding
//! a derivation that already exists.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::common::{BlockIdx, ClassIdx, FieldIdx, FieldType, TextFeatureKind, VarKey};

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("unknown class: {0}")]
    UnknownClass(String),

    #[error("unknown field {field} in class {class}")]
    UnknownField { class: String, field: String },

    #[error("duplicate name {name} in class {class}")]
    DuplicateName { class: String, name: String },

    #[error("type mismatch for {context}: expected {expected}, found {found}")]
    TypeMismatch {
        context: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("invalid block {block} in class {class}: {reason}")]
    InvalidBlock {
        class: String,
        block: String,
        reason: String,
    },

    #[error("unknown field type {0:?}")]
    UnknownFieldType(String),

    #[error("failed to read schema: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse schema JSON: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Derivation Rules
// ============================================================================

/// Operator projecting a text value of a related class onto the owning class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathOp {
    /// Follow a one-to-one relation to a `Text` value.
    GetText,
    /// Follow a one-to-one relation to a `TextList` value.
    GetTextList,
    /// Collect a `Text` value over every row of a one-to-many relation.
    TableAllTexts,
    /// Concatenate `TextList` values over every row of a one-to-many relation.
    TableAllTextLists,
}

impl PathOp {
    /// Operator for a hop through `relation` towards a value of type `operand`.
    pub fn for_hop(relation: FieldType, operand: FieldType) -> Option<Self> {
        match (relation, operand) {
            (FieldType::Object(_), FieldType::Text) => Some(PathOp::GetText),
            (FieldType::Object(_), FieldType::TextList) => Some(PathOp::GetTextList),
            (FieldType::ObjectArray(_), FieldType::Text) => Some(PathOp::TableAllTexts),
            (FieldType::ObjectArray(_), FieldType::TextList) => Some(PathOp::TableAllTextLists),
            _ => None,
        }
    }

    pub fn result_type(self) -> FieldType {
        match self {
            PathOp::GetText => FieldType::Text,
            _ => FieldType::TextList,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PathOp::GetText => "GetText",
            PathOp::GetTextList => "GetTextList",
            PathOp::TableAllTexts => "TableAllTexts",
            PathOp::TableAllTextLists => "TableAllTextLists",
        }
    }
}

/// Second operand of a [`PathRule`], resolved in the relation's target class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operand {
    Field(FieldIdx),
    Rule(Box<PathRule>),
}

/// A derivation of the form `op(relation, operand)`.
///
/// Structural equality is the derivation signature: two fields whose rules
/// compare equal compute the same value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathRule {
    pub op: PathOp,
    pub relation: FieldIdx,
    pub operand: Operand,
}

/// The rule computing a sparse feature block from one text-based field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRule {
    pub kind: TextFeatureKind,
    pub source: FieldIdx,
    /// Whether `source` is a `TextList` rather than a `Text`.
    pub list: bool,
}

impl BlockRule {
    /// Picks the rule family for a source field type. `None` if the field is
    /// not text-based.
    pub fn for_source(kind: TextFeatureKind, source: FieldIdx, source_type: FieldType) -> Option<Self> {
        match source_type {
            FieldType::Text => Some(Self { kind, source, list: false }),
            FieldType::TextList => Some(Self { kind, source, list: true }),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match (self.kind, self.list) {
            (TextFeatureKind::Ngrams, false) => "TextNgrams",
            (TextFeatureKind::Ngrams, true) => "TextListNgrams",
            (TextFeatureKind::Words, false) => "TextWords",
            (TextFeatureKind::Words, true) => "TextListWords",
            (TextFeatureKind::Tokens, false) => "TextTokens",
            (TextFeatureKind::Tokens, true) => "TextListTokens",
        }
    }
}

/// Key of a field inside its block: a hash-table slot for n-gram blocks, an
/// encoded token for word and token blocks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BlockKey {
    Slot(VarKey),
    Token(String),
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockKey::Slot(key) => write!(f, "{}", key.0),
            BlockKey::Token(token) => f.write_str(token),
        }
    }
}

// ============================================================================
// Schema Objects
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockMembership {
    pub block: BlockIdx,
    pub key: BlockKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub ftype: FieldType,
    pub used: bool,
    /// Derivation computing this field, `None` for stored fields.
    pub derivation: Option<PathRule>,
    /// Set for numerical fields computed as members of a feature block.
    pub block: Option<BlockMembership>,
    /// Construction cost, zero for initial fields.
    pub cost: f64,
}

impl Field {
    pub fn is_stored(&self) -> bool {
        self.derivation.is_none() && self.block.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub name: String,
    pub rule: BlockRule,
    /// Member fields in insertion order.
    pub members: Vec<FieldIdx>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Class {
    pub name: String,
    pub fields: Vec<Field>,
    pub blocks: Vec<Block>,
    #[serde(skip)]
    field_index: IndexMap<String, FieldIdx>,
}

impl Class {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fields: Vec::new(),
            blocks: Vec::new(),
            field_index: IndexMap::new(),
        }
    }

    pub fn field(&self, idx: FieldIdx) -> &Field {
        &self.fields[idx.index()]
    }

    pub fn block(&self, idx: BlockIdx) -> &Block {
        &self.blocks[idx.index()]
    }

    pub fn lookup_field(&self, name: &str) -> Option<FieldIdx> {
        self.field_index.get(name).copied()
    }

    /// Used fields in declaration order.
    pub fn used_fields(&self) -> impl Iterator<Item = (FieldIdx, &Field)> {
        self.fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.used)
            .map(|(i, f)| (FieldIdx(i as u32), f))
    }

    pub fn is_name_taken(&self, name: &str) -> bool {
        self.field_index.contains_key(name) || self.blocks.iter().any(|b| b.name == name)
    }

    fn reindex(&mut self) {
        self.field_index = self
            .fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), FieldIdx(i as u32)))
            .collect();
    }
}

/// The catalog of classes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schema {
    classes: Vec<Class>,
    #[serde(skip)]
    class_index: IndexMap<String, ClassIdx>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classes(&self) -> &[Class] {
        &self.classes
    }

    pub fn class(&self, idx: ClassIdx) -> &Class {
        &self.classes[idx.index()]
    }

    pub fn lookup_class(&self, name: &str) -> Option<ClassIdx> {
        self.class_index.get(name).copied()
    }

    pub fn require_class(&self, name: &str) -> Result<ClassIdx, SchemaError> {
        self.lookup_class(name)
            .ok_or_else(|| SchemaError::UnknownClass(name.to_string()))
    }

    pub fn field(&self, class: ClassIdx, field: FieldIdx) -> &Field {
        self.class(class).field(field)
    }

    pub fn add_class(&mut self, name: &str) -> Result<ClassIdx, SchemaError> {
        if self.class_index.contains_key(name) {
            return Err(SchemaError::DuplicateName {
                class: name.to_string(),
                name: name.to_string(),
            });
        }
        let idx = ClassIdx(self.classes.len() as u32);
        self.classes.push(Class::new(name));
        self.class_index.insert(name.to_string(), idx);
        Ok(idx)
    }

    /// Adds a stored, used field.
    pub fn add_field(&mut self, class: ClassIdx, name: &str, ftype: FieldType) -> Result<FieldIdx, SchemaError> {
        self.push_field(
            class,
            Field {
                name: name.to_string(),
                ftype,
                used: true,
                derivation: None,
                block: None,
                cost: 0.0,
            },
        )
    }

    fn push_field(&mut self, class: ClassIdx, field: Field) -> Result<FieldIdx, SchemaError> {
        let c = &mut self.classes[class.index()];
        if c.is_name_taken(&field.name) {
            return Err(SchemaError::DuplicateName {
                class: c.name.clone(),
                name: field.name,
            });
        }
        let idx = FieldIdx(c.fields.len() as u32);
        c.field_index.insert(field.name.clone(), idx);
        c.fields.push(field);
        Ok(idx)
    }

    /// Type of an operand evaluated in `class`.
    pub fn operand_type(&self, class: ClassIdx, operand: &Operand) -> Result<FieldType, SchemaError> {
        match operand {
            Operand::Field(f) => {
                let c = self.class(class);
                c.fields
                    .get(f.index())
                    .map(|field| field.ftype)
                    .ok_or_else(|| SchemaError::UnknownField {
                        class: c.name.clone(),
                        field: format!("#{}", f.0),
                    })
            }
            Operand::Rule(rule) => self.path_rule_type(class, rule),
        }
    }

    /// Checks a path rule evaluated in `class` and returns its result type.
    pub fn path_rule_type(&self, class: ClassIdx, rule: &PathRule) -> Result<FieldType, SchemaError> {
        let c = self.class(class);
        let relation = c
            .fields
            .get(rule.relation.index())
            .ok_or_else(|| SchemaError::UnknownField {
                class: c.name.clone(),
                field: format!("#{}", rule.relation.0),
            })?;
        let target = relation.ftype.target_class().ok_or(SchemaError::TypeMismatch {
            context: format!("{}.{}", c.name, relation.name),
            expected: "relation",
            found: relation.ftype.label(),
        })?;
        let operand_type = self.operand_type(target, &rule.operand)?;
        let expected = PathOp::for_hop(relation.ftype, operand_type).ok_or(SchemaError::TypeMismatch {
            context: format!("operand of {}.{}", c.name, relation.name),
            expected: "text-based",
            found: operand_type.label(),
        })?;
        if expected != rule.op {
            return Err(SchemaError::TypeMismatch {
                context: format!("{} over {}.{}", rule.op.name(), c.name, relation.name),
                expected: expected.name(),
                found: rule.op.name(),
            });
        }
        Ok(rule.op.result_type())
    }

    /// Field indices of a dotted path such as `Orders.Comment`, starting
    /// from `class`.
    pub fn resolve_path(&self, class: ClassIdx, path: &str) -> Result<Vec<FieldIdx>, SchemaError> {
        let mut hops = Vec::new();
        let mut current = Some(class);
        for name in path.split('.') {
            let owner = current.ok_or_else(|| SchemaError::TypeMismatch {
                context: path.to_string(),
                expected: "relation",
                found: "non-relation",
            })?;
            let c = self.class(owner);
            let field = c.lookup_field(name).ok_or_else(|| SchemaError::UnknownField {
                class: c.name.clone(),
                field: name.to_string(),
            })?;
            hops.push(field);
            current = c.field(field).ftype.target_class();
        }
        Ok(hops)
    }

    /// Operand reaching the last field of `hops` from `class`: the field
    /// itself for a single hop, otherwise nested path rules built from the
    /// innermost relation outwards.
    pub fn path_operand(&self, class: ClassIdx, hops: &[FieldIdx]) -> Result<Operand, SchemaError> {
        let Some((&last, relations)) = hops.split_last() else {
            return Err(SchemaError::UnknownField {
                class: self.class(class).name.clone(),
                field: "<empty path>".to_string(),
            });
        };

        let mut owners = Vec::with_capacity(relations.len());
        let mut current = class;
        for &hop in relations {
            owners.push(current);
            let c = self.class(current);
            let field = c.fields.get(hop.index()).ok_or_else(|| SchemaError::UnknownField {
                class: c.name.clone(),
                field: format!("#{}", hop.0),
            })?;
            current = field.ftype.target_class().ok_or(SchemaError::TypeMismatch {
                context: format!("{}.{}", c.name, field.name),
                expected: "relation",
                found: field.ftype.label(),
            })?;
        }

        let mut operand = Operand::Field(last);
        let mut operand_type = self.operand_type(current, &operand)?;
        for (&relation, &owner) in relations.iter().zip(&owners).rev() {
            let relation_field = self.field(owner, relation);
            let op = PathOp::for_hop(relation_field.ftype, operand_type).ok_or(SchemaError::TypeMismatch {
                context: format!("operand of {}.{}", self.class(owner).name, relation_field.name),
                expected: "text-based",
                found: operand_type.label(),
            })?;
            operand = Operand::Rule(Box::new(PathRule { op, relation, operand }));
            operand_type = op.result_type();
        }
        Ok(operand)
    }

    /// Finds a field of `class` computed by an equivalent derivation.
    pub fn find_derived_field(&self, class: ClassIdx, rule: &PathRule) -> Option<FieldIdx> {
        self.class(class)
            .fields
            .iter()
            .position(|f| f.derivation.as_ref() == Some(rule))
            .map(|i| FieldIdx(i as u32))
    }

    pub fn insert_derived_field(
        &mut self,
        class: ClassIdx,
        name: &str,
        rule: PathRule,
        used: bool,
    ) -> Result<FieldIdx, SchemaError> {
        let ftype = self.path_rule_type(class, &rule)?;
        let idx = self.push_field(
            class,
            Field {
                name: name.to_string(),
                ftype,
                used,
                derivation: Some(rule),
                block: None,
                cost: 0.0,
            },
        )?;
        debug!("Schema::insert_derived_field: class={}, name={}", self.class(class).name, name);
        Ok(idx)
    }

    pub fn find_block(&self, class: ClassIdx, rule: &BlockRule) -> Option<BlockIdx> {
        self.class(class)
            .blocks
            .iter()
            .position(|b| &b.rule == rule)
            .map(|i| BlockIdx(i as u32))
    }

    pub fn create_block(&mut self, class: ClassIdx, name: &str, rule: BlockRule) -> Result<BlockIdx, SchemaError> {
        let c = &mut self.classes[class.index()];
        if c.is_name_taken(name) {
            return Err(SchemaError::DuplicateName {
                class: c.name.clone(),
                name: name.to_string(),
            });
        }
        let source_type = c.fields.get(rule.source.index()).map(|f| f.ftype);
        let expected = if rule.list { FieldType::TextList } else { FieldType::Text };
        if source_type != Some(expected) {
            return Err(SchemaError::InvalidBlock {
                class: c.name.clone(),
                block: name.to_string(),
                reason: format!("{} needs a {} source", rule.name(), expected.label()),
            });
        }
        let idx = BlockIdx(c.blocks.len() as u32);
        c.blocks.push(Block {
            name: name.to_string(),
            rule,
            members: Vec::new(),
        });
        Ok(idx)
    }

    /// Appends a used numerical field at the end of `block`.
    pub fn insert_block_field(
        &mut self,
        class: ClassIdx,
        block: BlockIdx,
        name: &str,
        key: BlockKey,
        cost: f64,
    ) -> Result<FieldIdx, SchemaError> {
        let idx = self.push_field(
            class,
            Field {
                name: name.to_string(),
                ftype: FieldType::Numerical,
                used: true,
                derivation: None,
                block: Some(BlockMembership { block, key }),
                cost,
            },
        )?;
        self.classes[class.index()].blocks[block.index()].members.push(idx);
        Ok(idx)
    }

    /// Keys of the members of a block.
    pub fn block_keys(&self, class: ClassIdx, block: BlockIdx) -> HashSet<BlockKey> {
        let c = self.class(class);
        c.block(block)
            .members
            .iter()
            .filter_map(|m| c.field(*m).block.as_ref().map(|b| b.key.clone()))
            .collect()
    }

    /// Returns `prefix` if free in `class`, otherwise the first free
    /// `prefix_1`, `prefix_2`, ...
    pub fn build_field_name(&self, class: ClassIdx, prefix: &str) -> String {
        let c = self.class(class);
        if !c.is_name_taken(prefix) {
            return prefix.to_string();
        }
        (1..)
            .map(|i| format!("{prefix}_{i}"))
            .find(|candidate| !c.is_name_taken(candidate))
            .unwrap_or_else(|| prefix.to_string())
    }

    /// Blocks and fields share one namespace per class.
    pub fn build_block_name(&self, class: ClassIdx, prefix: &str) -> String {
        self.build_field_name(class, prefix)
    }

    /// Checks structural consistency: relation targets, derivation typing,
    /// and block membership.
    pub fn validate(&self) -> Result<(), SchemaError> {
        for (ci, class) in self.classes.iter().enumerate() {
            let class_idx = ClassIdx(ci as u32);
            for field in &class.fields {
                if let Some(target) = field.ftype.target_class() {
                    if target.index() >= self.classes.len() {
                        return Err(SchemaError::UnknownClass(format!("#{} (from {}.{})", target.0, class.name, field.name)));
                    }
                }
                if let Some(rule) = &field.derivation {
                    let ftype = self.path_rule_type(class_idx, rule)?;
                    if ftype != field.ftype {
                        return Err(SchemaError::TypeMismatch {
                            context: format!("{}.{}", class.name, field.name),
                            expected: ftype.label(),
                            found: field.ftype.label(),
                        });
                    }
                }
            }
            for (fi, field) in class.fields.iter().enumerate() {
                let Some(membership) = &field.block else {
                    continue;
                };
                let listed = class
                    .blocks
                    .get(membership.block.index())
                    .is_some_and(|block| block.members.contains(&FieldIdx(fi as u32)));
                if !listed {
                    return Err(SchemaError::InvalidBlock {
                        class: class.name.clone(),
                        block: format!("#{}", membership.block.0),
                        reason: format!("{} is not listed as a member", field.name),
                    });
                }
            }
            for (bi, block) in class.blocks.iter().enumerate() {
                let invalid = |reason: String| SchemaError::InvalidBlock {
                    class: class.name.clone(),
                    block: block.name.clone(),
                    reason,
                };
                let source = class
                    .fields
                    .get(block.rule.source.index())
                    .ok_or_else(|| invalid(format!("unknown source #{}", block.rule.source.0)))?;
                let expected = if block.rule.list { FieldType::TextList } else { FieldType::Text };
                if source.ftype != expected {
                    return Err(invalid(format!(
                        "source {} is {}, {} expects {}",
                        source.name,
                        source.ftype.label(),
                        block.rule.name(),
                        expected.label()
                    )));
                }
                let mut keys = HashSet::new();
                for member in &block.members {
                    let field = class
                        .fields
                        .get(member.index())
                        .ok_or_else(|| invalid(format!("unknown member #{}", member.0)))?;
                    if field.ftype != FieldType::Numerical {
                        return Err(invalid(format!("member {} is not numerical", field.name)));
                    }
                    let membership = field
                        .block
                        .as_ref()
                        .ok_or_else(|| invalid(format!("member {} has no key", field.name)))?;
                    if membership.block.index() != bi {
                        return Err(invalid(format!("member {} belongs to block #{}", field.name, membership.block.0)));
                    }
                    if !keys.insert(&membership.key) {
                        return Err(invalid(format!("duplicate key {}", membership.key)));
                    }
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Serialization
    // ========================================================================

    /// Loads a schema previously written with [`Schema::to_json_pretty`].
    pub fn from_json_str(text: &str) -> Result<Self, SchemaError> {
        let mut schema: Schema = serde_json::from_str(text)?;
        schema.reindex();
        schema.validate()?;
        Ok(schema)
    }

    pub fn to_json_pretty(&self) -> Result<String, SchemaError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    fn reindex(&mut self) {
        for class in &mut self.classes {
            class.reindex();
        }
        self.class_index = self
            .classes
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), ClassIdx(i as u32)))
            .collect();
    }

    /// Builds a schema from a human-authored description.
    ///
    /// ```json
    /// { "classes": {
    ///     "Customer": { "Name": "Text", "Orders": { "table": "Order" } },
    ///     "Order": { "Comment": "Text", "Amount": "Numerical" } } }
    /// ```
    pub fn from_description(description: &SchemaDescription) -> Result<Self, SchemaError> {
        let mut schema = Schema::new();
        for name in description.classes.keys() {
            schema.add_class(name)?;
        }
        for (class_name, fields) in &description.classes {
            let class = schema.require_class(class_name)?;
            for (field_name, raw) in fields {
                let ftype = match raw {
                    RawFieldType::Simple(label) => match label.as_str() {
                        "Numerical" => FieldType::Numerical,
                        "Categorical" => FieldType::Categorical,
                        "Text" => FieldType::Text,
                        "TextList" => FieldType::TextList,
                        other => return Err(SchemaError::UnknownFieldType(other.to_string())),
                    },
                    RawFieldType::Object { object } => FieldType::Object(schema.require_class(object)?),
                    RawFieldType::Table { table } => FieldType::ObjectArray(schema.require_class(table)?),
                };
                schema.add_field(class, field_name, ftype)?;
            }
        }
        Ok(schema)
    }

    pub fn load_description(path: &Path) -> Result<Self, SchemaError> {
        let text = std::fs::read_to_string(path)?;
        let description: SchemaDescription = serde_json::from_str(&text)?;
        Self::from_description(&description)
    }
}

// ============================================================================
// Description JSON schema (serde)
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct SchemaDescription {
    pub classes: IndexMap<String, IndexMap<String, RawFieldType>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawFieldType {
    Simple(String),
    Object { object: String },
    Table { table: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn customer_schema() -> (Schema, ClassIdx, ClassIdx) {
        let mut schema = Schema::new();
        let customer = schema.add_class("Customer").unwrap();
        let order = schema.add_class("Order").unwrap();
        schema.add_field(customer, "Name", FieldType::Text).unwrap();
        schema.add_field(customer, "Orders", FieldType::ObjectArray(order)).unwrap();
        schema.add_field(order, "Comment", FieldType::Text).unwrap();
        schema.add_field(order, "Amount", FieldType::Numerical).unwrap();
        (schema, customer, order)
    }

    #[test]
    fn test_derived_field_lookup_by_signature() {
        let (mut schema, customer, order) = customer_schema();
        let orders = schema.class(customer).lookup_field("Orders").unwrap();
        let comment = schema.class(order).lookup_field("Comment").unwrap();
        let rule = PathRule {
            op: PathOp::TableAllTexts,
            relation: orders,
            operand: Operand::Field(comment),
        };

        assert_eq!(schema.find_derived_field(customer, &rule), None);
        let idx = schema
            .insert_derived_field(customer, "Orders.Comment", rule.clone(), false)
            .unwrap();
        assert_eq!(schema.find_derived_field(customer, &rule), Some(idx));
        let field = schema.field(customer, idx);
        assert_eq!(field.ftype, FieldType::TextList);
        assert!(!field.used);
        schema.validate().unwrap();
    }

    #[test]
    fn test_wrong_operator_is_rejected() {
        let (mut schema, customer, order) = customer_schema();
        let orders = schema.class(customer).lookup_field("Orders").unwrap();
        let comment = schema.class(order).lookup_field("Comment").unwrap();
        let rule = PathRule {
            op: PathOp::GetText,
            relation: orders,
            operand: Operand::Field(comment),
        };
        assert!(matches!(
            schema.insert_derived_field(customer, "Bad", rule, false),
            Err(SchemaError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_blocks_and_unique_names() {
        let (mut schema, customer, _) = customer_schema();
        let name = schema.class(customer).lookup_field("Name").unwrap();
        let rule = BlockRule::for_source(TextFeatureKind::Words, name, FieldType::Text).unwrap();
        assert_eq!(rule.name(), "TextWords");

        let block = schema.create_block(customer, "Name.words", rule).unwrap();
        assert_eq!(schema.find_block(customer, &rule), Some(block));
        schema
            .insert_block_field(customer, block, "Name(hello)", BlockKey::Token("hello".into()), 1.5)
            .unwrap();

        assert_eq!(schema.build_field_name(customer, "Name(hello)"), "Name(hello)_1");
        assert_eq!(schema.build_block_name(customer, "Name.words"), "Name.words_1");
        assert_eq!(schema.build_field_name(customer, "Fresh"), "Fresh");
        assert!(schema.block_keys(customer, block).contains(&BlockKey::Token("hello".into())));
        schema.validate().unwrap();

        assert!(schema.create_block(customer, "Other", BlockRule { list: true, ..rule }).is_err());
    }

    #[test]
    fn test_description_and_json_reload() {
        let text = r#"{ "classes": {
            "Customer": { "Name": "Text", "Orders": { "table": "Order" }, "Profile": { "object": "Profile" } },
            "Order": { "Comment": "Text", "Amount": "Numerical" },
            "Profile": { "Bio": "TextList" } } }"#;
        let description: SchemaDescription = serde_json::from_str(text).unwrap();
        let schema = Schema::from_description(&description).unwrap();
        let customer = schema.lookup_class("Customer").unwrap();
        let profile = schema.lookup_class("Profile").unwrap();
        let field = schema.class(customer).lookup_field("Profile").unwrap();
        assert_eq!(schema.field(customer, field).ftype, FieldType::Object(profile));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.json");
        std::fs::write(&path, schema.to_json_pretty().unwrap()).unwrap();
        let reloaded = Schema::from_json_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(reloaded.lookup_class("Order"), schema.lookup_class("Order"));
        assert!(reloaded.class(customer).lookup_field("Orders").is_some());
    }

    #[test]
    fn test_path_operand_nests_from_the_inside() {
        let (mut schema, customer, order) = customer_schema();
        let item = schema.add_class("Item").unwrap();
        let detail = schema.add_field(order, "Detail", FieldType::Object(item)).unwrap();
        let labels = schema.add_field(item, "Labels", FieldType::TextList).unwrap();

        let hops = schema.resolve_path(customer, "Orders.Detail.Labels").unwrap();
        let orders = schema.class(customer).lookup_field("Orders").unwrap();
        assert_eq!(hops, vec![orders, detail, labels]);

        let operand = schema.path_operand(customer, &hops).unwrap();
        let expected = Operand::Rule(Box::new(PathRule {
            op: PathOp::TableAllTextLists,
            relation: orders,
            operand: Operand::Rule(Box::new(PathRule {
                op: PathOp::GetTextList,
                relation: detail,
                operand: Operand::Field(labels),
            })),
        }));
        assert_eq!(operand, expected);
        assert_eq!(schema.operand_type(customer, &operand).unwrap(), FieldType::TextList);

        let name = schema.class(customer).lookup_field("Name").unwrap();
        assert_eq!(schema.path_operand(customer, &[name]).unwrap(), Operand::Field(name));
        assert!(schema.resolve_path(customer, "Name.Oops").is_err());
        assert!(schema.resolve_path(customer, "Orders.Missing").is_err());
        assert!(schema.path_operand(customer, &[]).is_err());
    }

    #[test]
    fn test_edited_blocks_fail_validation() {
        let (mut schema, customer, _) = customer_schema();
        let name = schema.class(customer).lookup_field("Name").unwrap();
        let words = BlockRule::for_source(TextFeatureKind::Words, name, FieldType::Text).unwrap();
        let tokens = BlockRule::for_source(TextFeatureKind::Tokens, name, FieldType::Text).unwrap();
        let first = schema.create_block(customer, "Name.words", words).unwrap();
        schema.create_block(customer, "Name.tokens", tokens).unwrap();
        let member = schema
            .insert_block_field(customer, first, "Name(hi)", BlockKey::Token("hi".into()), 1.0)
            .unwrap();
        let saved: serde_json::Value = serde_json::from_str(&schema.to_json_pretty().unwrap()).unwrap();
        let c = customer.index();

        let reload = |pointer: String, value: serde_json::Value| {
            let mut json = saved.clone();
            *json.pointer_mut(&pointer).unwrap() = value;
            Schema::from_json_str(&json.to_string())
        };
        let source = format!("/classes/{c}/blocks/0/rule/source");
        let list = format!("/classes/{c}/blocks/0/rule/list");
        let owner = format!("/classes/{c}/fields/{}/block/block", member.index());

        assert!(reload(source.clone(), serde_json::json!(name.0)).is_ok());
        let edits = [
            (source, serde_json::json!(99)),
            (list, serde_json::json!(true)),
            (owner.clone(), serde_json::json!(1)),
            (owner, serde_json::json!(7)),
        ];
        for (pointer, value) in edits {
            assert!(
                matches!(reload(pointer.clone(), value), Err(SchemaError::InvalidBlock { .. })),
                "{pointer}"
            );
        }
    }

    #[test]
    fn test_unknown_type_in_description() {
        let text = r#"{ "classes": { "A": { "X": "Blob" } } }"#;
        let description: SchemaDescription = serde_json::from_str(text).unwrap();
        assert!(matches!(
            Schema::from_description(&description),
            Err(SchemaError::UnknownFieldType(_))
        ));
    }
}
