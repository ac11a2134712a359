//! Budgeted text feature construction over a relational schema.
//!
//! The global allocator is set by `rill`.

pub mod allocation;
pub mod builder;
pub mod cost;
pub mod discovery;
pub mod pipeline;
