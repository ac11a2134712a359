//! Two-pass, memory-bounded token sampling over a database.
//!
//! The scan is split into fixed-size shards of root records, read through a
//! projection on the fields the requests reach. Shards are tokenized
//! independently, by the calling thread or by a pool of worker threads, and
//! the master folds every shard result into one accumulator per request:
//!
//! 1. Collect: every requested field is tokenized with a counter capped at
//!    `1000 + 10 * requested` distinct entries. Shard tables, sorted by
//!    token, are merged into the accumulator with frequencies summed, and the
//!    accumulator is cut back to its most frequent `cap` entries.
//! 2. Count (optional, on by default): the database is scanned again,
//!    counting only the tokens kept by pass 1, exactly.
//!
//! Shard boundaries do not depend on the worker count and shards are folded
//! in shard order, so the output is the same whatever the number of workers.
//! Workers never run more than `2 * num_workers` shards ahead of the fold,
//! which bounds the tables waiting for their turn.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crossbeam::channel;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info};

use crate::common::{TokenFrequency, keep_most_frequent};
use crate::database::{Database, DatabaseError, FieldSelection, Value};
use crate::derive::{operand_value, select_operand};
use crate::schema::{Operand, Schema};
use crate::tokenizer::{TokenCounter, TokenPolicy};

/// Floor of the pass-1 cap on distinct tokens per field.
pub const MIN_COLLECTED_TOKENS: usize = 1000;

/// Pass-1 cap growth per requested token.
pub const COLLECTED_TOKENS_PER_REQUEST: usize = 10;

/// Distinct tokens kept per field during pass 1.
pub fn max_collected(requested: usize) -> usize {
    MIN_COLLECTED_TOKENS + COLLECTED_TOKENS_PER_REQUEST * requested
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Worker threads; 0 scans on the calling thread.
    pub num_workers: usize,
    /// Root records per shard.
    pub shard_size: usize,
    /// Run the exact counting pass after collection.
    pub exact_refinement: bool,
    /// Generate placeholder tokens instead of reading the database.
    pub synthetic: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            num_workers: std::thread::available_parallelism().map_or(1, |n| n.get()),
            shard_size: 10_000,
            exact_refinement: true,
            synthetic: false,
        }
    }
}

/// Cooperative cancellation flag, checked between records.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// One text source to sample, evaluated on root records.
#[derive(Debug, Clone)]
pub struct SampleRequest {
    /// Display name, for logs.
    pub name: String,
    /// A text-based field of the root class, or a rule reaching one through
    /// relations.
    pub source: Operand,
    pub policy: TokenPolicy,
    /// Tokens to export; 0 skips the source.
    pub requested: usize,
}

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("token sampling interrupted")]
    Interrupted,

    #[error("failed to read record {record} of database {database}")]
    ReadFailed { database: String, record: usize },

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("failed to spawn sampler worker: {0}")]
    Spawn(#[source] std::io::Error),
}

// ============================================================================
// Scan Phases
// ============================================================================

/// Read-only parameters shared by every shard of one scan.
#[derive(Debug)]
enum ScanPhase {
    Collect(CollectParams),
    Count(CountParams),
}

#[derive(Debug)]
struct CollectParams {
    /// Cap per request.
    max_collected: Vec<usize>,
}

#[derive(Debug)]
struct CountParams {
    /// Tokens to count exactly, per request.
    vocabularies: Vec<Vec<String>>,
}

impl ScanPhase {
    fn name(&self) -> &'static str {
        match self {
            ScanPhase::Collect(_) => "collect",
            ScanPhase::Count(_) => "count",
        }
    }

    fn counter(&self, request: usize, policy: TokenPolicy) -> TokenCounter {
        match self {
            ScanPhase::Collect(params) => TokenCounter::collecting(policy, params.max_collected[request]),
            ScanPhase::Count(params) => TokenCounter::specific(policy, &params.vocabularies[request]),
        }
    }
}

/// One pass over every shard: what to read and how each shard's counters
/// are summarized.
struct Scan<'s, E> {
    requests: &'s [&'s SampleRequest],
    selection: &'s FieldSelection,
    phase: &'s ScanPhase,
    finish: fn(TokenCounter) -> Vec<E>,
}

struct ShardResult<E> {
    records: usize,
    /// One entry per request.
    fields: Vec<Vec<E>>,
}

// ============================================================================
// Shard Folding
// ============================================================================

/// Folds shard outputs into one accumulator per request, in shard order.
/// Outputs arriving ahead of their turn wait in `pending`.
struct ShardFold<E> {
    accumulators: Vec<Vec<E>>,
    fold: fn(Vec<E>, Vec<E>, usize) -> Vec<E>,
    /// Accumulator bound per request, handed to `fold`.
    caps: Vec<usize>,
    pending: BTreeMap<usize, Vec<Vec<E>>>,
    next: usize,
    peak_entries: usize,
}

/// Accumulators of a finished scan.
struct PhaseOutput<E> {
    accumulators: Vec<Vec<E>>,
    /// Most entries held at once by the accumulators and pending outputs.
    peak_entries: usize,
}

impl<E> ShardFold<E> {
    fn new(fold: fn(Vec<E>, Vec<E>, usize) -> Vec<E>, caps: Vec<usize>) -> Self {
        Self {
            accumulators: caps.iter().map(|_| Vec::new()).collect(),
            fold,
            caps,
            pending: BTreeMap::new(),
            next: 0,
            peak_entries: 0,
        }
    }

    /// Shards folded so far; they are always the first ones.
    fn folded(&self) -> usize {
        self.next
    }

    fn push(&mut self, shard: usize, outputs: Vec<Vec<E>>) {
        self.pending.insert(shard, outputs);
        self.peak_entries = self.peak_entries.max(self.held_entries());

        let fold = self.fold;
        while let Some(outputs) = self.pending.remove(&self.next) {
            for ((accumulator, output), &cap) in self.accumulators.iter_mut().zip(outputs).zip(&self.caps) {
                *accumulator = fold(std::mem::take(accumulator), output, cap);
            }
            self.next += 1;
        }
    }

    fn held_entries(&self) -> usize {
        let accumulated: usize = self.accumulators.iter().map(Vec::len).sum();
        let pending: usize = self.pending.values().flatten().map(Vec::len).sum();
        accumulated + pending
    }

    fn finish(self) -> PhaseOutput<E> {
        debug_assert!(self.pending.is_empty());
        PhaseOutput {
            accumulators: self.accumulators,
            peak_entries: self.peak_entries,
        }
    }
}

/// Merges a shard table into the pass-1 accumulator, both sorted by token,
/// and keeps the `cap` most frequent entries, still sorted by token.
fn fold_collected(accumulated: Vec<TokenFrequency>, shard: Vec<TokenFrequency>, cap: usize) -> Vec<TokenFrequency> {
    let mut merged = accumulated;
    merged.extend(shard);
    merged.sort_by(|a, b| a.token.cmp(&b.token));
    merged.dedup_by(|next, kept| {
        let same = next.token == kept.token;
        if same {
            kept.frequency += next.frequency;
        }
        same
    });

    if merged.len() > cap {
        merged.select_nth_unstable_by(cap, TokenFrequency::cmp_by_frequency);
        merged.truncate(cap);
        merged.sort_unstable_by(TokenFrequency::cmp_by_token);
    }
    merged
}

/// Adds a shard's exact counts into the pass-2 accumulator.
fn fold_counts(mut accumulated: Vec<u64>, shard: Vec<u64>, _cap: usize) -> Vec<u64> {
    if accumulated.is_empty() {
        return shard;
    }
    for (total, count) in accumulated.iter_mut().zip(shard) {
        *total += count;
    }
    accumulated
}

// ============================================================================
// Sampler
// ============================================================================

pub type ProgressFn<'a> = Box<dyn Fn(f64) + Send + Sync + 'a>;

pub struct TokenSampler<'a> {
    schema: &'a Schema,
    database: &'a dyn Database,
    config: SamplerConfig,
    interrupt: Interrupt,
    progress: Option<ProgressFn<'a>>,
}

impl<'a> TokenSampler<'a> {
    pub fn new(schema: &'a Schema, database: &'a dyn Database, config: SamplerConfig) -> Self {
        Self {
            schema,
            database,
            config,
            interrupt: Interrupt::new(),
            progress: None,
        }
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// `progress` receives the percentage of records read in the current
    /// scan, from the master thread.
    pub fn with_progress(mut self, progress: impl Fn(f64) + Send + Sync + 'a) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    /// Shards dispatched but not yet folded, at most.
    fn max_outstanding_shards(&self) -> usize {
        match self.config.num_workers {
            0 => 1,
            n => 2 * n,
        }
    }

    /// Peak number of token entries held at once. Per request: the master's
    /// accumulator, plus one capped table for every outstanding shard
    /// (being filled by a worker or waiting to be folded).
    pub fn resource_estimate(&self, requests: &[SampleRequest]) -> usize {
        let per_table: usize = requests
            .iter()
            .filter(|r| r.requested > 0)
            .map(|r| max_collected(r.requested))
            .sum();
        per_table * (1 + self.max_outstanding_shards())
    }

    /// Top tokens of every request, by decreasing frequency then token.
    ///
    /// Each output holds `requested` tokens, or every distinct token seen
    /// when there are fewer. Nothing is returned on failure.
    pub fn sample(&self, requests: &[SampleRequest]) -> Result<Vec<Vec<TokenFrequency>>, SamplerError> {
        let start = Instant::now();
        info!(
            "TokenSampler::sample: database={}, records={}, requests={}, workers={}, synthetic={}",
            self.database.name(),
            self.database.record_count(),
            requests.len(),
            self.config.num_workers,
            self.config.synthetic
        );

        if self.config.synthetic {
            return Ok(requests.iter().map(|r| synthetic_tokens(r.requested)).collect());
        }

        let mut samples = vec![Vec::new(); requests.len()];
        let active: Vec<usize> = (0..requests.len()).filter(|&i| requests[i].requested > 0).collect();
        if active.is_empty() {
            return Ok(samples);
        }
        let active_requests: Vec<&SampleRequest> = active.iter().map(|&i| &requests[i]).collect();
        let selection = self.selection(&active_requests);

        // ── Pass 1: bounded collection ──
        let caps: Vec<usize> = active_requests.iter().map(|r| max_collected(r.requested)).collect();
        let phase = ScanPhase::Collect(CollectParams {
            max_collected: caps.clone(),
        });
        let scan = Scan {
            requests: &active_requests,
            selection: &selection,
            phase: &phase,
            finish: TokenCounter::into_sorted_by_token,
        };
        let collected: Vec<Vec<TokenFrequency>> = self
            .run_phase(&scan, ShardFold::new(fold_collected, caps))?
            .accumulators
            .into_par_iter()
            .map(|mut tokens| {
                tokens.sort_unstable_by(TokenFrequency::cmp_by_frequency);
                tokens
            })
            .collect();

        // ── Pass 2: exact counts of the collected vocabulary ──
        let ranked = if self.config.exact_refinement {
            let vocabularies: Vec<Vec<String>> = collected
                .iter()
                .map(|tokens| tokens.iter().map(|t| t.token.clone()).collect())
                .collect();
            let phase = ScanPhase::Count(CountParams { vocabularies });
            let scan = Scan {
                requests: &active_requests,
                selection: &selection,
                phase: &phase,
                finish: TokenCounter::into_specific_counts,
            };
            let unbounded = vec![usize::MAX; active_requests.len()];
            let counts = self.run_phase(&scan, ShardFold::new(fold_counts, unbounded))?.accumulators;
            collected
                .into_par_iter()
                .zip(counts)
                .map(|(tokens, totals)| {
                    tokens
                        .into_iter()
                        .zip(totals)
                        .filter(|&(_, frequency)| frequency > 0)
                        .map(|(t, frequency)| TokenFrequency::new(t.token, frequency))
                        .collect::<Vec<_>>()
                })
                .collect()
        } else {
            collected
        };

        for ((&slot, request), mut tokens) in active.iter().zip(&active_requests).zip(ranked) {
            keep_most_frequent(&mut tokens, request.requested);
            debug!(
                "TokenSampler::sample: field={}, requested={}, sampled={}",
                request.name,
                request.requested,
                tokens.len()
            );
            samples[slot] = tokens;
        }

        info!(
            "TokenSampler::sample: done in {:.2}s, tokens={}",
            start.elapsed().as_secs_f64(),
            samples.iter().map(Vec::len).sum::<usize>()
        );
        Ok(samples)
    }

    /// Stored fields read by the requests, following relations.
    fn selection(&self, requests: &[&SampleRequest]) -> FieldSelection {
        let class = self.database.class();
        let mut selection = FieldSelection::new();
        for request in requests {
            select_operand(self.schema, class, &request.source, &mut selection);
        }
        debug_assert!(!selection.is_empty());
        selection
    }

    fn shards(&self) -> Vec<Range<usize>> {
        let total = self.database.record_count();
        let size = self.config.shard_size.max(1);
        (0..total).step_by(size).map(|s| s..(s + size).min(total)).collect()
    }

    /// Scans every shard and folds the outputs as they come.
    fn run_phase<E: Send>(&self, scan: &Scan<'_, E>, mut folder: ShardFold<E>) -> Result<PhaseOutput<E>, SamplerError> {
        let shards = self.shards();
        let total = self.database.record_count();
        debug!(
            "TokenSampler::run_phase: phase={}, shards={}, records={}",
            scan.phase.name(),
            shards.len(),
            total
        );

        let mut records_read = 0;
        if self.config.num_workers == 0 {
            let never = AtomicBool::new(false);
            for (i, range) in shards.iter().enumerate() {
                let result = self.scan_shard(scan, range.clone(), &never)?;
                records_read += result.records;
                self.report_progress(records_read, total);
                folder.push(i, result.fields);
            }
        } else {
            self.run_workers(scan, &shards, &mut folder, &mut records_read)?;
        }

        let output = folder.finish();
        debug!(
            "TokenSampler::run_phase: phase={}, records_read={}, peak_entries={}",
            scan.phase.name(),
            records_read,
            output.peak_entries
        );
        Ok(output)
    }

    fn run_workers<E: Send>(
        &self,
        scan: &Scan<'_, E>,
        shards: &[Range<usize>],
        folder: &mut ShardFold<E>,
        records_read: &mut usize,
    ) -> Result<(), SamplerError> {
        let (job_tx, job_rx) = channel::unbounded::<(usize, Range<usize>)>();
        let (result_tx, result_rx) = channel::unbounded::<(usize, Result<ShardResult<E>, SamplerError>)>();

        let abort = AtomicBool::new(false);
        let num_workers = self.config.num_workers.min(shards.len()).max(1);
        let window = self.max_outstanding_shards();
        let total = self.database.record_count();

        std::thread::scope(|scope| {
            let mut first_error = None;

            for w in 0..num_workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let abort = &abort;
                let spawned = std::thread::Builder::new()
                    .name(format!("token-sampler-{w}"))
                    .spawn_scoped(scope, move || {
                        debug!("TokenSampler worker {} started", w);
                        for (i, range) in job_rx.iter() {
                            let result = self.scan_shard(scan, range, abort);
                            let failed = result.is_err();
                            if result_tx.send((i, result)).is_err() || failed {
                                break;
                            }
                        }
                        debug!("TokenSampler worker {} exiting", w);
                    });
                if let Err(e) = spawned {
                    abort.store(true, Ordering::SeqCst);
                    first_error = Some(SamplerError::Spawn(e));
                    break;
                }
            }
            drop(job_rx);
            drop(result_tx);

            let mut dispatched = 0;
            let mut received = 0;
            loop {
                while first_error.is_none() && dispatched < shards.len() && dispatched < folder.folded() + window {
                    if job_tx.send((dispatched, shards[dispatched].clone())).is_err() {
                        break;
                    }
                    dispatched += 1;
                }
                if received == dispatched {
                    break;
                }
                // Every worker gone means every result is in.
                let Ok((i, result)) = result_rx.recv() else {
                    break;
                };
                received += 1;
                match result {
                    Ok(result) => {
                        *records_read += result.records;
                        self.report_progress(*records_read, total);
                        folder.push(i, result.fields);
                    }
                    Err(e) => {
                        abort.store(true, Ordering::SeqCst);
                        first_error.get_or_insert(e);
                    }
                }
            }
            drop(job_tx);

            first_error.map_or(Ok(()), Err)
        })
    }

    fn scan_shard<E>(
        &self,
        scan: &Scan<'_, E>,
        range: Range<usize>,
        abort: &AtomicBool,
    ) -> Result<ShardResult<E>, SamplerError> {
        let class = self.database.class();
        let mut counters: Vec<TokenCounter> = scan
            .requests
            .iter()
            .enumerate()
            .map(|(i, r)| scan.phase.counter(i, r.policy))
            .collect();

        let mut reader = self.database.reader(range.clone(), scan.selection);
        reader.open()?;
        let mut records = 0;
        while !reader.is_end() {
            if self.interrupt.is_triggered() || abort.load(Ordering::Relaxed) {
                debug!(
                    "TokenSampler::scan_shard: stopped at {:.1}% of records {}..{}",
                    100.0 * reader.percentage_read(),
                    range.start,
                    range.end
                );
                let _ = reader.close();
                return Err(SamplerError::Interrupted);
            }
            let Some(record) = reader.read() else {
                if reader.is_error() {
                    let _ = reader.close();
                    return Err(SamplerError::ReadFailed {
                        database: self.database.name().to_string(),
                        record: range.start + records,
                    });
                }
                break;
            };
            records += 1;

            for (request, counter) in scan.requests.iter().zip(&mut counters) {
                match operand_value(self.schema, class, &record, &request.source).as_ref() {
                    Value::Text(text) => counter.tokenize(text),
                    Value::TextList(texts) => counter.tokenize_list(texts),
                    _ => {}
                }
            }
        }
        reader.close()?;

        Ok(ShardResult {
            records,
            fields: counters.into_iter().map(scan.finish).collect(),
        })
    }

    fn report_progress(&self, records_read: usize, total: usize) {
        if let Some(progress) = &self.progress {
            progress(100.0 * records_read as f64 / total.max(1) as f64);
        }
    }
}

/// Placeholder sample of `count` tokens: `A`..`Z`, then `W27`, `W28`, ...
/// with strictly decreasing frequencies.
pub fn synthetic_tokens(count: usize) -> Vec<TokenFrequency> {
    (0..count)
        .map(|i| {
            let token = match u8::try_from(i) {
                Ok(letter) if letter < 26 => char::from(b'A' + letter).to_string(),
                _ => format!("W{}", i + 1),
            };
            TokenFrequency::new(token, (count + 1 - i) as u64)
        })
        .collect()
}
