//! Two-pass pipeline: resolve every identity, then scrub every record.
//!
//! Pass 1 must finish on every shard before Pass 2 starts; a scrub that ran
//! early could miss a research id another shard was about to create. The
//! first failing shard aborts the run and no output is returned. Shards still
//! running stop at their next record, and the run only reports the failure
//! once all of them have stopped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::types::*;
use deident_core::{
    DeidentConfig, Error, IdentitySchema, PipelineConfig, Record, ResolverConfig, Result,
};
use deident_ingest::Extractor;
use deident_resolve::IdentityResolver;
use deident_scrub::{verify_scrubbed, Scrubber};
use deident_store::{IdentitySnapshot, IdentityStore};

/// Stop a shard between records once `cancel` is raised.
fn check_cancelled(cancel: &AtomicBool, shard: &Shard) -> Result<()> {
    if cancel.load(Ordering::Acquire) {
        return Err(Error::Cancelled(format!("shard {} stopped", shard.id)));
    }
    Ok(())
}

/// Pass 1 over one shard.
pub fn identity_pass(
    schema: &IdentitySchema,
    resolver: &IdentityResolver,
    shard: &Shard,
    cancel: &AtomicBool,
) -> Result<IdentityPassReport> {
    let extractor = Extractor::new(schema);
    let mut report = IdentityPassReport {
        shard_id: shard.id,
        ..Default::default()
    };

    for (table, record) in &shard.records {
        check_cancelled(cancel, shard)?;
        report.records += 1;
        for set in extractor.extract(table, record) {
            if !set.has_linking() {
                report.confidential_only += 1;
                continue;
            }
            let resolution = resolver.resolve(&set)?;
            report.witness_sets += 1;
            report.retries += resolution.retries;
            report.filled_slots += resolution.filled;
            if resolution.created {
                report.new_identities += 1;
            }
        }
    }

    debug!(
        "Shard {}: {} records, {} witness sets, {} new identities",
        shard.id, report.records, report.witness_sets, report.new_identities
    );
    Ok(report)
}

/// Pass 2 over one shard. Read-only against the store.
pub fn scrub_pass(
    schema: &IdentitySchema,
    store: &dyn IdentityStore,
    shard: &Shard,
    verify: bool,
    cancel: &AtomicBool,
) -> Result<(Shard, ScrubPassReport)> {
    let scrubber = Scrubber::new(schema, store);
    let mut report = ScrubPassReport {
        shard_id: shard.id,
        ..Default::default()
    };

    let mut scrubbed = Vec::with_capacity(shard.len());
    for (table, record) in &shard.records {
        check_cancelled(cancel, shard)?;
        let (out, stats) = scrubber.scrub(table, record.clone())?;
        if verify {
            verify_scrubbed(schema, table, record, &out)?;
        }
        report.records += 1;
        report.stats.merge(&stats);
        scrubbed.push((table.clone(), out));
    }

    Ok((Shard::new(shard.id, scrubbed), report))
}

/// Cut an ordered record stream into shards of at most `shard_size`.
pub fn split_into_shards(records: Vec<(String, Record)>, shard_size: usize) -> Vec<Shard> {
    let shard_size = shard_size.max(1);
    let mut shards = Vec::new();
    let mut current = Vec::with_capacity(shard_size.min(records.len()));
    for row in records {
        current.push(row);
        if current.len() == shard_size {
            shards.push(Shard::new(shards.len(), std::mem::take(&mut current)));
        }
    }
    if !current.is_empty() {
        shards.push(Shard::new(shards.len(), current));
    }
    shards
}

/// Runs both passes over shared shards with bounded parallelism.
pub struct DeidentPipeline {
    schema: Arc<IdentitySchema>,
    store: Arc<dyn IdentityStore>,
    resolver: ResolverConfig,
    pipeline: PipelineConfig,
}

impl DeidentPipeline {
    pub fn new(
        schema: Arc<IdentitySchema>,
        store: Arc<dyn IdentityStore>,
        resolver: ResolverConfig,
        pipeline: PipelineConfig,
    ) -> Self {
        Self {
            schema,
            store,
            resolver,
            pipeline,
        }
    }

    pub fn from_config(
        schema: Arc<IdentitySchema>,
        store: Arc<dyn IdentityStore>,
        config: &DeidentConfig,
    ) -> Self {
        Self::new(schema, store, config.resolver.clone(), config.pipeline.clone())
    }

    pub fn store(&self) -> &Arc<dyn IdentityStore> {
        &self.store
    }

    /// Split `records` by the configured shard size and run.
    pub async fn run_records(&self, records: Vec<(String, Record)>) -> Result<RunOutput> {
        self.run(split_into_shards(records, self.pipeline.shard_size))
            .await
    }

    pub async fn run(&self, shards: Vec<Shard>) -> Result<RunOutput> {
        let started = Instant::now();
        let shards = Arc::new(shards);
        let identities_before = self.store.count()?;
        let snapshot = if self.pipeline.verify_identity_map {
            Some(IdentitySnapshot::capture(self.store.as_ref())?)
        } else {
            None
        };

        info!(
            "Identity pass: {} shards, {} workers, {} existing identities",
            shards.len(),
            self.pipeline.max_workers,
            identities_before
        );
        let resolver = Arc::new(IdentityResolver::new(
            self.store.clone(),
            self.resolver.clone(),
        ));
        let identity = {
            let (schema, shards) = (self.schema.clone(), shards.clone());
            self.run_sharded(shards.len(), move |i, cancel| {
                identity_pass(&schema, &resolver, &shards[i], cancel)
            })
            .await?
        };

        // Barrier: every shard has resolved.
        let identities_after = self.store.count()?;
        let stability = match snapshot {
            Some(snapshot) => {
                let report = snapshot.verify_against(self.store.as_ref())?;
                info!(
                    "Identity map stable: {} identities checked, {} extended",
                    report.checked, report.filled_since
                );
                Some(report)
            }
            None => None,
        };

        info!(
            "Scrub pass: {} shards, {} identities",
            shards.len(),
            identities_after
        );
        let scrubbed = {
            let (schema, store, shards) =
                (self.schema.clone(), self.store.clone(), shards.clone());
            let verify = self.pipeline.verify_output;
            self.run_sharded(shards.len(), move |i, cancel| {
                scrub_pass(&schema, store.as_ref(), &shards[i], verify, cancel)
            })
            .await?
        };
        let (out_shards, scrub): (Vec<Shard>, Vec<ScrubPassReport>) =
            scrubbed.into_iter().unzip();

        let report = RunReport {
            schema_fingerprint: self.schema.fingerprint().to_string(),
            identities_before,
            identities_after,
            identity,
            scrub,
            stability,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            "Run complete: {} records, {} new identities, {} slot fills in {}ms",
            report.records(),
            report.new_identities(),
            report.filled_slots(),
            report.duration_ms
        );

        Ok(RunOutput {
            shards: out_shards,
            report,
        })
    }

    /// Run `work(i, cancel)` for every shard index on the blocking pool, at
    /// most `max_workers` at a time. Results come back in index order.
    ///
    /// Blocking workers cannot be aborted, so the first error raises `cancel`
    /// and every remaining task is joined before the error is returned.
    async fn run_sharded<T, F>(&self, count: usize, work: F) -> Result<Vec<T>>
    where
        T: Send + 'static,
        F: Fn(usize, &AtomicBool) -> Result<T> + Send + Sync + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.pipeline.max_workers.max(1)));
        let cancel = Arc::new(AtomicBool::new(false));
        let work = Arc::new(work);
        let mut tasks = JoinSet::new();

        for index in 0..count {
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let work = work.clone();
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::Internal(e.to_string()))?;
                let value = tokio::task::spawn_blocking(move || work(index, cancel.as_ref()))
                    .await
                    .map_err(|e| Error::Internal(format!("shard {} worker failed: {}", index, e)))??;
                Ok::<_, Error>((index, value))
            });
        }

        let mut results: Vec<Option<T>> = (0..count).map(|_| None).collect();
        let mut failure: Option<Error> = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .map_err(|e| Error::Internal(e.to_string()))
                .and_then(|r| r);
            match outcome {
                Ok((index, value)) => results[index] = Some(value),
                Err(e) if failure.is_none() => {
                    cancel.store(true, Ordering::Release);
                    error!("Aborting run: {}", e);
                    failure = Some(e);
                }
                Err(Error::Cancelled(msg)) => debug!("{}", msg),
                Err(e) => warn!("Further shard failure during abort: {}", e),
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        results
            .into_iter()
            .enumerate()
            .map(|(i, r)| r.ok_or_else(|| Error::Internal(format!("shard {} produced no result", i))))
            .collect()
    }
}
