//! Description-length costs of text paths.
//!
//! A path is chosen by a uniform choice at each class it crosses: among the
//! class's text fields plus one "follow a relation" option, then among the
//! relations leading to text. The cost of a path is the negative log of the
//! probability of that sequence of choices.

use tracing::debug;

use crate::discovery::{PathModel, SchemaTextIndex};

/// Normalization constant of the universal prior on integers.
const UNIVERSAL_PRIOR_CONSTANT: f64 = 2.86511;

/// Cost of one path, summed hop by hop from the root.
///
/// `T` and `R` are the text fields and text-leading relations exposed by
/// the class owning each hop.
pub fn path_cost(index: &SchemaTextIndex, path: &PathModel) -> f64 {
    let last = path.hops.len() - 1;
    let mut cost = 0.0;
    for (i, class) in path.classes.iter().enumerate() {
        let Some(entry) = index.entry(*class) else {
            debug_assert!(false, "path crosses a class missing from the text index");
            continue;
        };
        let text_count = entry.text_fields.len() as f64;
        let relation_count = entry.text_relations.len();

        if i == last {
            cost += if relation_count == 0 {
                text_count.ln()
            } else {
                (text_count + 1.0).ln()
            };
        } else {
            cost += (text_count + 1.0).ln() + (relation_count as f64).ln();
        }
    }
    debug_assert!(cost >= 0.0);
    cost
}

/// Sets the cost of every root path, adding `selection_cost` to each.
pub fn compute_costs(index: &mut SchemaTextIndex, selection_cost: f64) {
    let costs: Vec<f64> = index
        .root_paths()
        .iter()
        .map(|path| path_cost(index, path) + selection_cost)
        .collect();
    for (path, cost) in index.root_paths_mut().iter_mut().zip(costs) {
        path.cost = cost;
    }
    debug!("compute_costs: paths={}, selection_cost={}", index.root_paths().len(), selection_cost);
}

/// Iterated base-2 logarithm, summing only the positive terms.
fn log2_star(n: usize) -> f64 {
    let mut sum = 0.0;
    let mut x = (n as f64).log2();
    while x > 0.0 {
        sum += x;
        x = x.log2();
    }
    sum
}

/// Code length in nats of the positive integer `n` under the universal
/// prior: `ln 2 · (log2(c0) + log2*(n))`.
pub fn universal_code_length(n: usize) -> f64 {
    debug_assert!(n >= 1);
    std::f64::consts::LN_2 * (UNIVERSAL_PRIOR_CONSTANT.log2() + log2_star(n))
}
