//! Evaluation of derived fields and feature blocks on records.
//!
//! This is the scoring side of construction: a derived field is computed by
//! walking its [`PathRule`] through sub-records, and a block member is the
//! count of its key in the block's source text, produced by the same encoder
//! or tokenizer used when the block was built.

use std::borrow::Cow;
use std::collections::HashMap;

use tracing::warn;

use crate::common::{BlockIdx, ClassIdx, FieldIdx, VarKey};
use crate::database::{FieldSelection, Record, Value};
use crate::ngram::NGramEncoder;
use crate::schema::{BlockKey, Operand, PathOp, PathRule, Schema};
use crate::tokenizer::{DeployedTokens, TokenPolicy, key_to_token};

// ============================================================================
// Field Values
// ============================================================================

/// Value of `field` of `class` on `record`.
///
/// Stored fields are borrowed from the record. Derived fields follow their
/// rule; block members evaluate their block and yield a count.
pub fn field_value<'r>(schema: &Schema, class: ClassIdx, record: &'r Record, field: FieldIdx) -> Cow<'r, Value> {
    let f = schema.field(class, field);
    if let Some(rule) = &f.derivation {
        return Cow::Owned(rule_value(schema, class, record, rule));
    }
    if let Some(membership) = &f.block {
        let count = BlockEvaluator::new(schema, class, membership.block)
            .evaluate(schema, record)
            .into_iter()
            .find(|(member, _)| *member == field)
            .map_or(0, |(_, count)| count);
        return Cow::Owned(Value::Number(count as f64));
    }
    Cow::Borrowed(record.get(field))
}

/// Evaluates `rule` on a record of `class`.
///
/// A missing relation yields `Missing`; a present but empty table yields an
/// empty list.
pub fn rule_value(schema: &Schema, class: ClassIdx, record: &Record, rule: &PathRule) -> Value {
    let relation = schema.field(class, rule.relation);
    let Some(target) = relation.ftype.target_class() else {
        debug_assert!(false, "path rule over non-relation {}", relation.name);
        return Value::Missing;
    };

    match (rule.op, record.get(rule.relation)) {
        (PathOp::GetText | PathOp::GetTextList, Value::Object(sub)) => {
            operand_value(schema, target, sub, &rule.operand).into_owned()
        }
        (PathOp::TableAllTexts, Value::Table(rows)) => {
            let texts = rows
                .iter()
                .filter_map(|row| match operand_value(schema, target, row, &rule.operand).into_owned() {
                    Value::Text(text) => Some(text),
                    _ => None,
                })
                .collect();
            Value::TextList(texts)
        }
        (PathOp::TableAllTextLists, Value::Table(rows)) => {
            let mut texts = Vec::new();
            for row in rows {
                if let Value::TextList(items) = operand_value(schema, target, row, &rule.operand).into_owned() {
                    texts.extend(items);
                }
            }
            Value::TextList(texts)
        }
        _ => Value::Missing,
    }
}

/// Evaluates an operand (a field or a nested rule) on a record of `class`.
pub fn operand_value<'r>(schema: &Schema, class: ClassIdx, record: &'r Record, operand: &Operand) -> Cow<'r, Value> {
    match operand {
        Operand::Field(field) => field_value(schema, class, record, *field),
        Operand::Rule(rule) => Cow::Owned(rule_value(schema, class, record, rule)),
    }
}

/// Adds to `selection` the stored fields that evaluating `operand` on a
/// record of `class` reads.
pub fn select_operand(schema: &Schema, class: ClassIdx, operand: &Operand, selection: &mut FieldSelection) {
    match operand {
        Operand::Field(field) => {
            let f = schema.field(class, *field);
            if let Some(rule) = &f.derivation {
                select_rule(schema, class, rule, selection);
            } else if let Some(membership) = &f.block {
                let source = schema.class(class).block(membership.block).rule.source;
                select_operand(schema, class, &Operand::Field(source), selection);
            } else {
                selection.select(*field);
            }
        }
        Operand::Rule(rule) => select_rule(schema, class, rule, selection),
    }
}

fn select_rule(schema: &Schema, class: ClassIdx, rule: &PathRule, selection: &mut FieldSelection) {
    let Some(target) = schema.field(class, rule.relation).ftype.target_class() else {
        return;
    };
    select_operand(schema, target, &rule.operand, selection.select(rule.relation));
}

/// The texts of a text-based value; empty for anything else.
pub fn texts(value: &Value) -> Vec<&str> {
    match value {
        Value::Text(text) => vec![text.as_str()],
        Value::TextList(items) => items.iter().map(String::as_str).collect(),
        _ => Vec::new(),
    }
}

// ============================================================================
// Block Evaluation
// ============================================================================

enum Counter {
    Ngrams {
        encoder: NGramEncoder,
        members: HashMap<VarKey, FieldIdx>,
    },
    Tokens {
        deployed: DeployedTokens,
        members: Vec<FieldIdx>,
    },
}

/// A block prepared for scoring many records.
pub struct BlockEvaluator {
    class: ClassIdx,
    source: FieldIdx,
    counter: Counter,
}

impl BlockEvaluator {
    pub fn new(schema: &Schema, class: ClassIdx, block: BlockIdx) -> Self {
        let c = schema.class(class);
        let b = c.block(block);
        let keyed_members = b
            .members
            .iter()
            .filter_map(|&member| c.field(member).block.as_ref().map(|m| (member, &m.key)));

        let counter = match TokenPolicy::for_kind(b.rule.kind) {
            None => {
                let members: HashMap<VarKey, FieldIdx> = keyed_members
                    .filter_map(|(member, key)| match key {
                        BlockKey::Slot(slot) => Some((*slot, member)),
                        BlockKey::Token(_) => None,
                    })
                    .collect();
                Counter::Ngrams {
                    encoder: NGramEncoder::new(members.keys().copied()),
                    members,
                }
            }
            Some(policy) => {
                let mut tokens = Vec::new();
                let mut members = Vec::new();
                for (member, key) in keyed_members {
                    let BlockKey::Token(key) = key else { continue };
                    match key_to_token(key) {
                        Some(token) => {
                            tokens.push(token);
                            members.push(member);
                        }
                        None => warn!("BlockEvaluator::new: block={}, malformed key {:?}", b.name, key),
                    }
                }
                Counter::Tokens {
                    deployed: DeployedTokens::new(policy, tokens),
                    members,
                }
            }
        };

        Self {
            class,
            source: b.rule.source,
            counter,
        }
    }

    /// Sparse `(member, count)` pairs for one record, sorted by member,
    /// non-zero counts only.
    pub fn evaluate(&self, schema: &Schema, record: &Record) -> Vec<(FieldIdx, u64)> {
        let value = field_value(schema, self.class, record, self.source);
        let texts = texts(&value);
        let mut counts: Vec<(FieldIdx, u64)> = match &self.counter {
            Counter::Ngrams { encoder, members } => encoder
                .encode_list(&texts)
                .into_iter()
                .filter_map(|(key, count)| members.get(&key).map(|&m| (m, u64::from(count))))
                .collect(),
            Counter::Tokens { deployed, members } => deployed
                .count(texts)
                .into_iter()
                .map(|(position, count)| (members[position], count))
                .collect(),
        };
        counts.sort_unstable();
        counts
    }
}

/// One-shot evaluation of a block on a record.
pub fn evaluate_block(schema: &Schema, class: ClassIdx, block: BlockIdx, record: &Record) -> Vec<(FieldIdx, u64)> {
    BlockEvaluator::new(schema, class, block).evaluate(schema, record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{FieldType, TextFeatureKind};
    use crate::schema::BlockRule;
    use crate::tokenizer::token_to_key;

    struct Fixture {
        schema: Schema,
        customer: ClassIdx,
        comments: FieldIdx,
        bio: FieldIdx,
    }

    /// Customer { Name: Text, Orders: *Order, Profile: Profile }
    /// Order { Comment: Text }, Profile { Bio: TextList }
    fn fixture() -> Fixture {
        let mut schema = Schema::new();
        let customer = schema.add_class("Customer").unwrap();
        let order = schema.add_class("Order").unwrap();
        let profile = schema.add_class("Profile").unwrap();
        schema.add_field(customer, "Name", FieldType::Text).unwrap();
        let orders = schema.add_field(customer, "Orders", FieldType::ObjectArray(order)).unwrap();
        let prof = schema.add_field(customer, "Profile", FieldType::Object(profile)).unwrap();
        let comment = schema.add_field(order, "Comment", FieldType::Text).unwrap();
        let bio_field = schema.add_field(profile, "Bio", FieldType::TextList).unwrap();

        let comments = schema
            .insert_derived_field(
                customer,
                "Orders.Comment",
                PathRule {
                    op: PathOp::TableAllTexts,
                    relation: orders,
                    operand: Operand::Field(comment),
                },
                false,
            )
            .unwrap();
        let bio = schema
            .insert_derived_field(
                customer,
                "Profile.Bio",
                PathRule {
                    op: PathOp::GetTextList,
                    relation: prof,
                    operand: Operand::Field(bio_field),
                },
                false,
            )
            .unwrap();
        Fixture {
            schema,
            customer,
            comments,
            bio,
        }
    }

    fn order(comment: &str) -> Record {
        Record::new(vec![Value::Text(comment.into())])
    }

    fn customer(orders: Value, profile: Value) -> Record {
        Record::new(vec![Value::Text("ada".into()), orders, profile])
    }

    #[test]
    fn test_path_rules() {
        let fx = fixture();
        let record = customer(
            Value::Table(vec![order("fast delivery"), Record::new(vec![]), order("late")]),
            Value::Object(Box::new(Record::new(vec![Value::TextList(vec!["x".into(), "y".into()])]))),
        );

        let comments = field_value(&fx.schema, fx.customer, &record, fx.comments);
        assert_eq!(
            comments.as_ref(),
            &Value::TextList(vec!["fast delivery".into(), "late".into()])
        );
        let bio = field_value(&fx.schema, fx.customer, &record, fx.bio);
        assert_eq!(bio.as_ref(), &Value::TextList(vec!["x".into(), "y".into()]));
        assert!(matches!(
            field_value(&fx.schema, fx.customer, &record, FieldIdx(0)),
            Cow::Borrowed(Value::Text(_))
        ));
    }

    #[test]
    fn test_selection_follows_derivations() {
        let fx = fixture();
        let orders = fx.schema.class(fx.customer).lookup_field("Orders").unwrap();
        let profile = fx.schema.class(fx.customer).lookup_field("Profile").unwrap();
        let mut selection = FieldSelection::new();
        select_operand(&fx.schema, fx.customer, &Operand::Field(fx.comments), &mut selection);
        assert!(selection.contains(orders));
        assert!(!selection.contains(profile));
        assert!(!selection.contains(FieldIdx(0)));

        let record = customer(
            Value::Table(vec![order("fast delivery"), order("late")]),
            Value::Object(Box::new(Record::new(vec![Value::TextList(vec!["x".into()])]))),
        );
        let projected = selection.project(&record);
        assert_eq!(projected.get(profile), &Value::Missing);
        assert_eq!(
            field_value(&fx.schema, fx.customer, &projected, fx.comments),
            field_value(&fx.schema, fx.customer, &record, fx.comments)
        );
    }

    #[test]
    fn test_missing_and_empty_relations() {
        let fx = fixture();
        let record = customer(Value::Table(vec![]), Value::Missing);
        assert_eq!(
            field_value(&fx.schema, fx.customer, &record, fx.comments).as_ref(),
            &Value::TextList(vec![])
        );
        assert_eq!(field_value(&fx.schema, fx.customer, &record, fx.bio).as_ref(), &Value::Missing);

        let record = customer(Value::Missing, Value::Missing);
        assert_eq!(
            field_value(&fx.schema, fx.customer, &record, fx.comments).as_ref(),
            &Value::Missing
        );
    }

    #[test]
    fn test_word_block_on_derived_list() {
        let mut fx = fixture();
        let rule = BlockRule::for_source(TextFeatureKind::Words, fx.comments, FieldType::TextList).unwrap();
        let block = fx.schema.create_block(fx.customer, "Orders.Comment.words", rule).unwrap();
        let mut members = Vec::new();
        for token in ["late", "fast", "\tx"] {
            let member = fx
                .schema
                .insert_block_field(
                    fx.customer,
                    block,
                    &format!("Orders.Comment({token})"),
                    BlockKey::Token(token_to_key(token)),
                    1.0,
                )
                .unwrap();
            members.push(member);
        }

        let record = customer(
            Value::Table(vec![order("fast, fast and late"), order("late!")]),
            Value::Missing,
        );
        let counts = evaluate_block(&fx.schema, fx.customer, block, &record);
        assert_eq!(counts, vec![(members[0], 2), (members[1], 2)]);

        assert_eq!(
            field_value(&fx.schema, fx.customer, &record, members[1]).as_ref(),
            &Value::Number(2.0)
        );
        assert_eq!(
            field_value(&fx.schema, fx.customer, &record, members[2]).as_ref(),
            &Value::Number(0.0)
        );
    }

    #[test]
    fn test_ngram_block_matches_encoder() {
        let mut fx = fixture();
        let name = fx.schema.class(fx.customer).lookup_field("Name").unwrap();
        let rule = BlockRule::for_source(TextFeatureKind::Ngrams, name, FieldType::Text).unwrap();
        let block = fx.schema.create_block(fx.customer, "Name.ngrams", rule).unwrap();
        for key in 1..=40 {
            fx.schema
                .insert_block_field(fx.customer, block, &format!("Name.k{key}"), BlockKey::Slot(VarKey(key)), 0.5)
                .unwrap();
        }

        let record = customer(Value::Missing, Value::Missing);
        let counts = evaluate_block(&fx.schema, fx.customer, block, &record);
        let expected = NGramEncoder::first(40).encode("ada");
        assert_eq!(counts.len(), expected.len());
        let members = &fx.schema.class(fx.customer).block(block).members;
        for ((member, count), (key, expected_count)) in counts.iter().zip(&expected) {
            assert_eq!(*member, members[key.0 as usize - 1]);
            assert_eq!(*count, u64::from(*expected_count));
        }
        // Key 1 is the single-slot table: every byte lands there.
        assert_eq!(counts[0], (members[0], 3));
    }
}
