use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub mod common;
pub mod database;
pub mod derive;
pub mod ngram;
pub mod sampler;
pub mod schema;
pub mod tokenizer;
