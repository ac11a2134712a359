//! Discovery of every text field reachable from a root class.
//!
//! The schema graph is walked depth-first from the root through relation
//! fields. A class already owning a hop of the current path is not entered
//! again, so recursive schemas lose some reachable paths but every path is
//! cycle-free.

use std::collections::HashSet;

use indexmap::{IndexMap, IndexSet};
use tracing::debug;

use rill::common::{ClassIdx, FieldIdx, TokenFrequency};
use rill::schema::Schema;

// ============================================================================
// Path Model
// ============================================================================

/// One access path from the root class to a text-based field.
#[derive(Debug, Clone, PartialEq)]
pub struct PathModel {
    /// Field hops from the root. All but the last are relations; the last
    /// is text-based.
    pub hops: Vec<FieldIdx>,
    /// Owning class of each hop; `classes[0]` is the root.
    pub classes: Vec<ClassIdx>,
    /// Selection cost, `exp(-cost)` being the selection probability.
    pub cost: f64,
    /// Features to construct on this path.
    pub allocated_count: usize,
    /// Features already present in an equivalent block.
    pub existing_count: usize,
    /// Sampled tokens, by decreasing frequency.
    pub tokens: Vec<TokenFrequency>,
}

impl PathModel {
    fn new(hops: Vec<FieldIdx>, classes: Vec<ClassIdx>) -> Self {
        debug_assert_eq!(hops.len(), classes.len());
        Self {
            hops,
            classes,
            cost: 0.0,
            allocated_count: 0,
            existing_count: 0,
            tokens: Vec::new(),
        }
    }

    /// Hop names joined by '.'.
    pub fn name(&self, schema: &Schema) -> String {
        self.classes
            .iter()
            .zip(&self.hops)
            .map(|(&class, &field)| schema.field(class, field).name.as_str())
            .collect::<Vec<_>>()
            .join(".")
    }
}

// ============================================================================
// Text Index
// ============================================================================

/// What one class exposes towards text.
#[derive(Debug, Clone, PartialEq)]
pub struct TextClassEntry {
    pub class: ClassIdx,
    /// Text-based fields owned by the class.
    pub text_fields: IndexSet<FieldIdx>,
    /// Relation fields of the class leading, transitively, to text.
    pub text_relations: IndexSet<FieldIdx>,
    /// Complete paths; only filled on the root entry.
    pub root_paths: Vec<PathModel>,
}

impl TextClassEntry {
    fn new(class: ClassIdx) -> Self {
        Self {
            class,
            text_fields: IndexSet::new(),
            text_relations: IndexSet::new(),
            root_paths: Vec::new(),
        }
    }
}

/// Per-class text catalog built for one construction run.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaTextIndex {
    root: ClassIdx,
    entries: IndexMap<ClassIdx, TextClassEntry>,
}

impl SchemaTextIndex {
    pub fn root(&self) -> ClassIdx {
        self.root
    }

    pub fn entry(&self, class: ClassIdx) -> Option<&TextClassEntry> {
        self.entries.get(&class)
    }

    /// Entries in first-visit order, the root first.
    pub fn entries(&self) -> impl Iterator<Item = &TextClassEntry> {
        self.entries.values()
    }

    pub fn root_paths(&self) -> &[PathModel] {
        self.entries
            .get(&self.root)
            .map(|e| e.root_paths.as_slice())
            .unwrap_or(&[])
    }

    pub fn root_paths_mut(&mut self) -> &mut [PathModel] {
        self.entries
            .get_mut(&self.root)
            .map(|e| e.root_paths.as_mut_slice())
            .unwrap_or(&mut [])
    }

    fn entry_mut(&mut self, class: ClassIdx) -> &mut TextClassEntry {
        self.entries
            .entry(class)
            .or_insert_with(|| TextClassEntry::new(class))
    }
}

// ============================================================================
// Discovery
// ============================================================================

/// Builds the text index of every class reachable from `root`.
pub fn discover(schema: &Schema, root: ClassIdx) -> SchemaTextIndex {
    let mut index = SchemaTextIndex {
        root,
        entries: IndexMap::new(),
    };
    let mut hops = Vec::new();
    let mut classes = Vec::new();
    collect(schema, root, &mut hops, &mut classes, &mut index);

    debug!(
        "discover: root={}, classes={}, paths={}",
        schema.class(root).name,
        index.entries.len(),
        index.root_paths().len()
    );
    index
}

/// Visits `class` under the current path; returns whether any text was
/// found below it.
fn collect(
    schema: &Schema,
    class: ClassIdx,
    hops: &mut Vec<FieldIdx>,
    classes: &mut Vec<ClassIdx>,
    index: &mut SchemaTextIndex,
) -> bool {
    index.entry_mut(class);
    if classes.contains(&class) {
        return false;
    }

    let mut contains_text = false;
    for (field_idx, field) in schema.class(class).used_fields() {
        if field.ftype.is_text_based() {
            index.entry_mut(class).text_fields.insert(field_idx);

            let mut path_hops = hops.clone();
            path_hops.push(field_idx);
            let mut path_classes = classes.clone();
            path_classes.push(class);
            let root = index.root;
            index
                .entry_mut(root)
                .root_paths
                .push(PathModel::new(path_hops, path_classes));
            contains_text = true;
        } else if let Some(target) = field.ftype.target_class() {
            hops.push(field_idx);
            classes.push(class);
            let leads_to_text = collect(schema, target, hops, classes, index);
            hops.pop();
            classes.pop();

            if leads_to_text {
                index.entry_mut(class).text_relations.insert(field_idx);
                contains_text = true;
            }
        }
    }
    contains_text
}

/// Whether any text-based field is reachable from `class`.
///
/// Each class is explored once, whatever the path leading to it.
pub fn contains_text_fields(schema: &Schema, class: ClassIdx) -> bool {
    fn explore(schema: &Schema, class: ClassIdx, explored: &mut HashSet<ClassIdx>) -> bool {
        if !explored.insert(class) {
            return false;
        }
        schema.class(class).used_fields().any(|(_, field)| {
            field.ftype.is_text_based()
                || field
                    .ftype
                    .target_class()
                    .is_some_and(|target| explore(schema, target, explored))
        })
    }
    explore(schema, class, &mut HashSet::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill::common::FieldType;

    #[test]
    fn test_single_text_field() {
        let mut schema = Schema::new();
        let root = schema.add_class("Root").unwrap();
        schema.add_field(root, "Id", FieldType::Categorical).unwrap();
        let t1 = schema.add_field(root, "T1", FieldType::Text).unwrap();

        let index = discover(&schema, root);
        assert_eq!(index.root_paths().len(), 1);
        let path = &index.root_paths()[0];
        assert_eq!(path.hops, vec![t1]);
        assert_eq!(path.classes, vec![root]);
        assert_eq!(path.name(&schema), "T1");
        assert!(contains_text_fields(&schema, root));
    }

    #[test]
    fn test_paths_through_relations() {
        let mut schema = Schema::new();
        let customer = schema.add_class("Customer").unwrap();
        let order = schema.add_class("Order").unwrap();
        let address = schema.add_class("Address").unwrap();
        let name = schema.add_field(customer, "Name", FieldType::Text).unwrap();
        let orders = schema.add_field(customer, "Orders", FieldType::ObjectArray(order)).unwrap();
        let home = schema.add_field(customer, "Home", FieldType::Object(address)).unwrap();
        let comment = schema.add_field(order, "Comment", FieldType::Text).unwrap();
        let tags = schema.add_field(order, "Tags", FieldType::TextList).unwrap();
        schema.add_field(address, "Zip", FieldType::Numerical).unwrap();

        let index = discover(&schema, customer);
        let names: Vec<String> = index.root_paths().iter().map(|p| p.name(&schema)).collect();
        assert_eq!(names, vec!["Name", "Orders.Comment", "Orders.Tags"]);

        let root_entry = index.entry(customer).unwrap();
        assert_eq!(root_entry.text_fields.iter().copied().collect::<Vec<_>>(), vec![name]);
        assert_eq!(root_entry.text_relations.iter().copied().collect::<Vec<_>>(), vec![orders]);
        assert!(!root_entry.text_relations.contains(&home));

        let order_entry = index.entry(order).unwrap();
        assert_eq!(order_entry.text_fields.iter().copied().collect::<Vec<_>>(), vec![comment, tags]);
        assert!(order_entry.root_paths.is_empty());

        let address_entry = index.entry(address).unwrap();
        assert!(address_entry.text_fields.is_empty());
        assert!(!contains_text_fields(&schema, address));
    }

    #[test]
    fn test_cycles_are_cut() {
        // Person -> *Friends: Person, Person -> Employer: Company -> *Staff: Person
        let mut schema = Schema::new();
        let person = schema.add_class("Person").unwrap();
        let company = schema.add_class("Company").unwrap();
        schema.add_field(person, "Bio", FieldType::Text).unwrap();
        schema.add_field(person, "Friends", FieldType::ObjectArray(person)).unwrap();
        schema.add_field(person, "Employer", FieldType::Object(company)).unwrap();
        schema.add_field(company, "Motto", FieldType::Text).unwrap();
        schema.add_field(company, "Staff", FieldType::ObjectArray(person)).unwrap();

        let index = discover(&schema, person);
        let names: Vec<String> = index.root_paths().iter().map(|p| p.name(&schema)).collect();
        assert_eq!(names, vec!["Bio", "Employer.Motto"]);

        for path in index.root_paths() {
            let distinct: HashSet<_> = path.classes.iter().collect();
            assert_eq!(distinct.len(), path.classes.len(), "{:?}", path);
        }
        assert!(contains_text_fields(&schema, company));
    }

    #[test]
    fn test_no_text() {
        let mut schema = Schema::new();
        let root = schema.add_class("Root").unwrap();
        let child = schema.add_class("Child").unwrap();
        schema.add_field(root, "Kids", FieldType::ObjectArray(child)).unwrap();
        schema.add_field(child, "Age", FieldType::Numerical).unwrap();

        let index = discover(&schema, root);
        assert!(index.root_paths().is_empty());
        assert!(index.entry(root).unwrap().text_relations.is_empty());
        assert_eq!(index.entries().count(), 2);
        assert!(!contains_text_fields(&schema, root));
    }
}
