//! Caller-facing entry points.
//!
//! [`Engine::run`] partitions a dataset, schedules one task per partition on the
//! configured backend and merges the results into one [`Snapshot`] holding the final
//! buffers of every UDF. [`Engine::run_streaming`] does the same but hands back a
//! [`RunStream`], an iterator yielding an immutable snapshot after every merged
//! partition. Dropping or cancelling the stream stops the run.
//!
//! ```
//! use ironframe::prelude::*;
//! use ironframe::testing::{SumAllUdf, ones_dataset};
//!
//! # fn main() -> ironframe::Result<()> {
//! let engine = Engine::new(EngineConfig { num_workers: 2, ..Default::default() })?;
//! let dataset = ones_dataset(&[4, 4, 2, 2], 2)?;
//! let result = engine.run(dataset, vec![SumAllUdf::arc("sum")])?;
//! assert_eq!(result.buffer("sum", "total")?.values::<f64>()?, &[64.0]);
//! # Ok(())
//! # }
//! ```

use crate::compile_cache::CompileCache;
use crate::config::{Backend, EngineConfig};
use crate::dataset::Dataset;
use crate::error::{EngineError, Result};
use crate::executor::{ClusterClient, ClusterExecutor, Executor, LocalExecutor, SimulatedCluster, TaskStream};
use crate::ids::RunId;
use crate::index::DatasetIndex;
use crate::kernel::{ExprCompiler, KernelCompiler};
use crate::merge::{MergeStatus, ResultMerger, Snapshot};
use crate::metrics::{MetricsCollector, names};
use crate::pool::BufferPool;
use crate::task::RunContext;
use crate::udf::Udf;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Builds an [`Engine`] with non-default collaborators.
pub struct EngineBuilder {
    config: EngineConfig,
    compiler: Arc<dyn KernelCompiler>,
    cluster: Option<Arc<dyn ClusterClient>>,
    metrics: MetricsCollector,
}

impl EngineBuilder {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            compiler: Arc::new(ExprCompiler),
            cluster: None,
            metrics: MetricsCollector::new(),
        }
    }

    /// Kernel compiler used by the compile cache.
    #[must_use]
    pub fn compiler(mut self, compiler: Arc<dyn KernelCompiler>) -> Self {
        self.compiler = compiler;
        self
    }

    /// Cluster used by the distributed backend. Without one, a
    /// [`SimulatedCluster`] with `num_workers` workers is started.
    #[must_use]
    pub fn cluster(mut self, cluster: Arc<dyn ClusterClient>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    #[must_use]
    pub fn metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the compile cache location
    /// cannot be created or the backend cannot start.
    pub fn build(self) -> Result<Engine> {
        let config = self.config;
        config.validate()?;
        let cache = match &config.compile_cache_location {
            Some(dir) => CompileCache::with_location(self.compiler, dir)?,
            None => CompileCache::new(self.compiler),
        };
        let executor: Arc<dyn Executor> = match config.backend {
            Backend::Local => Arc::new(LocalExecutor::new(config.num_workers, config.retry_limit)),
            Backend::Distributed => {
                let cluster = match self.cluster {
                    Some(cluster) => cluster,
                    None => Arc::new(SimulatedCluster::new(config.num_workers)?),
                };
                Arc::new(
                    ClusterExecutor::new(cluster, config.retry_limit)
                        .with_max_in_flight(config.effective_max_in_flight()),
                )
            }
        };
        Ok(Engine {
            config,
            cache: Arc::new(cache),
            executor,
            metrics: self.metrics,
        })
    }
}

/// Runs UDFs over datasets.
pub struct Engine {
    config: EngineConfig,
    cache: Arc<CompileCache>,
    executor: Arc<dyn Executor>,
    metrics: MetricsCollector,
}

impl Engine {
    /// An engine with the default kernel compiler.
    ///
    /// # Errors
    ///
    /// See [`EngineBuilder::build`].
    pub fn new(config: EngineConfig) -> Result<Self> {
        EngineBuilder::new(config).build()
    }

    #[must_use]
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    #[must_use]
    pub fn compile_cache(&self) -> &Arc<CompileCache> {
        &self.cache
    }

    /// Run `udfs` over `dataset` and return the merged buffers.
    ///
    /// On failure the partial result is discarded.
    ///
    /// # Errors
    ///
    /// The first error of the run: a partitioning, merge, UDF or compile error, or
    /// [`EngineError::WorkerExhausted`] once a partition runs out of retries.
    pub fn run(&self, dataset: Arc<dyn Dataset>, udfs: Vec<Arc<dyn Udf>>) -> Result<Snapshot> {
        let mut stream = self.run_streaming(dataset, udfs)?;
        for snapshot in &mut stream {
            snapshot?;
        }
        stream.finish()
    }

    /// Start a run and stream a snapshot after every merged partition.
    ///
    /// # Errors
    ///
    /// Returns an error if the run cannot be planned or submitted. Errors during the
    /// run are yielded by the stream.
    pub fn run_streaming(&self, dataset: Arc<dyn Dataset>, udfs: Vec<Arc<dyn Udf>>) -> Result<RunStream> {
        let run_id = RunId::next();
        let meta = dataset.meta().clone();
        check_udf_names(&udfs)?;

        let partitions = DatasetIndex::partition_with(&meta, &self.config.partition_options())?;
        // Specs are taken once so they cannot change mid-run.
        let specs: Vec<_> = udfs.iter().map(|u| u.buffer_specs(&meta)).collect();
        let merger = ResultMerger::new(
            udfs.iter()
                .map(|u| u.name().to_string())
                .zip(specs.iter().cloned())
                .collect(),
            &meta,
            partitions.len(),
        )?;
        let block_size = partitions.iter().map(|p| p.byte_len).max().unwrap_or(0);
        let run = Arc::new(RunContext {
            run_id,
            dataset,
            udfs,
            specs,
            cache: Arc::clone(&self.cache),
            pool: BufferPool::new(block_size, self.config.effective_read_pool_blocks()),
        });
        info!(
            run = %run_id,
            backend = self.executor.name(),
            partitions = partitions.len(),
            frames = meta.num_frames(),
            "starting run"
        );
        self.metrics.record_start();
        let tasks = self.executor.submit(run, partitions)?;
        Ok(RunStream {
            run_id,
            tasks,
            merger: Some(merger),
            last: None,
            error: false,
            cancelled: false,
            done: false,
            metrics: self.metrics.clone(),
            cache: Arc::clone(&self.cache),
        })
    }
}

fn check_udf_names(udfs: &[Arc<dyn Udf>]) -> Result<()> {
    if udfs.is_empty() {
        return Err(EngineError::Config("a run needs at least one UDF".to_string()));
    }
    let mut seen = HashSet::new();
    for udf in udfs {
        if !seen.insert(udf.name()) {
            return Err(EngineError::Config(format!("duplicate UDF name '{}'", udf.name())));
        }
    }
    Ok(())
}

/// A run in progress, yielding a [`Snapshot`] after every merged partition.
///
/// The stream ends after the last partition or right after yielding an error. After
/// an error, [`last_snapshot`](Self::last_snapshot) still holds the state of the last
/// successful merge.
pub struct RunStream {
    run_id: RunId,
    tasks: Box<dyn TaskStream>,
    merger: Option<ResultMerger>,
    last: Option<Snapshot>,
    error: bool,
    cancelled: bool,
    done: bool,
    metrics: MetricsCollector,
    cache: Arc<CompileCache>,
}

impl RunStream {
    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// The most recent successfully merged state.
    #[must_use]
    pub fn last_snapshot(&self) -> Option<&Snapshot> {
        self.last.as_ref()
    }

    /// Stop the run. Results still arriving are discarded.
    pub fn cancel(&mut self) {
        if !self.done {
            warn!(run = %self.run_id, "cancelling run");
            self.tasks.cancel();
            self.cancelled = true;
            self.close();
        }
    }

    /// Drive the run to completion and return the final result.
    ///
    /// # Errors
    ///
    /// The run's error, or [`EngineError::Cancelled`] if it was cancelled.
    pub fn finish(mut self) -> Result<Snapshot> {
        while let Some(item) = self.next() {
            item?;
        }
        if self.cancelled {
            return Err(EngineError::Cancelled);
        }
        match self.merger.take() {
            Some(merger) if !self.error => merger.finish(),
            _ => Err(EngineError::Worker("run already failed".to_string())),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn close(&mut self) {
        self.done = true;
        self.metrics.record_end();
        self.metrics
            .increment_counter(names::RETRIES, self.tasks.retries());
        self.metrics
            .increment_counter(names::DUPLICATES_DROPPED, self.tasks.duplicates());
        let stats = self.cache.stats();
        self.metrics.set_gauge(names::CACHE_HITS, stats.hits as f64);
        self.metrics.set_gauge(names::CACHE_MISSES, stats.misses as f64);
        self.metrics
            .set_gauge(names::CACHE_COMPILATIONS, stats.compilations as f64);
    }

    fn fail(&mut self, error: EngineError) -> Option<Result<Snapshot>> {
        warn!(run = %self.run_id, %error, "run failed");
        self.tasks.cancel();
        self.error = true;
        self.metrics.increment_counter(names::RUNS_FAILED, 1);
        self.close();
        Some(Err(error))
    }
}

impl Iterator for RunStream {
    type Item = Result<Snapshot>;

    #[allow(clippy::cast_precision_loss)]
    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            let Some(outcome) = self.tasks.next() else {
                info!(run = %self.run_id, "run finished");
                self.close();
                return None;
            };
            let task = match outcome {
                Ok(task) => task,
                Err(e) => return self.fail(e),
            };
            let merger = self.merger.as_mut()?;
            match merger.accept(task.partition, &task.buffers) {
                Ok(MergeStatus::Merged) => {
                    let snapshot = merger.snapshot();
                    self.metrics.increment_counter(names::PARTITIONS_MERGED, 1);
                    self.metrics
                        .increment_counter(names::TILES_PROCESSED, task.tiles as u64);
                    self.metrics
                        .record_histogram(names::TASK_DURATION_MS, task.elapsed.as_secs_f64() * 1e3);
                    self.metrics.set_gauge(names::RUN_PROGRESS, snapshot.progress());
                    self.last = Some(snapshot.clone());
                    return Some(Ok(snapshot));
                }
                Ok(MergeStatus::Duplicate) => {
                    self.metrics.increment_counter(names::DUPLICATES_DROPPED, 1);
                }
                Err(e) => return self.fail(e),
            }
        }
    }
}

impl Drop for RunStream {
    fn drop(&mut self) {
        if !self.done {
            self.tasks.cancel();
        }
    }
}

/// Run `udfs` over `dataset` with a one-off engine built from `config`.
///
/// # Errors
///
/// See [`Engine::run`].
pub fn run(dataset: Arc<dyn Dataset>, udfs: Vec<Arc<dyn Udf>>, config: EngineConfig) -> Result<Snapshot> {
    Engine::new(config)?.run(dataset, udfs)
}
