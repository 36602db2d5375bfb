//! The cache orchestrator.
//!
//! [`GraphCache::load`] is the single entry point the compiler pipeline
//! calls: compute the key, walk the tiers (memo, local disk, remote), and on
//! a miss run the real compiler and persist the result. Cache-internal
//! failures trade a hit for a recompile; only errors about the computation
//! itself (a compile failure, an empty autotuning round) propagate.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use crate::artifact::{
    CompileContext, CompiledArtifact, CompiledCallable, CompileOutput, ExecutableProgram,
    GraphCompiler,
};
use crate::cache::disk::DiskCache;
use crate::cache::memo::{MemoEntry, ProgramMemo};
use crate::cache::remote::{RemoteCacheBackend, RemoteTier};
use crate::cache::{CacheEntry, KernelEntry, AUTOTUNE_DIR, GRAPH_DIR, KERNEL_DIR};
use crate::counters;
use crate::env::CacheSettings;
use crate::error::{CacheError, CacheResult, CompileError, CompileResult};
use crate::events::{self, CacheEvent, CacheOutcome};
use crate::fingerprint::{check_cacheable, compute_key, CompileConfig, CompileScope};
use crate::graph::inputs::ExampleInputs;
use crate::graph::Graph;
use crate::registry::KernelDef;

/// Builds the autotune-result tiers matching `settings`, for handing to a
/// [`crate::autotune::Tuner`].
pub fn autotune_cache_tiers(
    settings: &CacheSettings,
    remote: Option<&Arc<dyn RemoteCacheBackend>>,
) -> (Option<DiskCache>, Option<RemoteTier>) {
    let local = settings
        .local_autotune
        .then(|| DiskCache::new(&settings.cache_dir, AUTOTUNE_DIR, settings.strict));
    let remote = match (settings.remote_autotune, remote) {
        (true, Some(backend)) => Some(RemoteTier::new(
            Arc::clone(backend),
            AUTOTUNE_DIR,
            settings.strict,
        )),
        _ => None,
    };
    (local, remote)
}

/// Durable + in-process caching façade for compiled graphs.
pub struct GraphCache {
    settings: CacheSettings,
    graph_local: Option<DiskCache>,
    kernel_local: Option<DiskCache>,
    graph_remote: Option<RemoteTier>,
    kernel_remote: Option<RemoteTier>,
    memo: ProgramMemo,
}

impl GraphCache {
    pub fn new(settings: CacheSettings) -> Self {
        let graph_local = settings
            .local_graph
            .then(|| DiskCache::new(&settings.cache_dir, GRAPH_DIR, settings.strict));
        let kernel_local = settings
            .local_graph
            .then(|| DiskCache::new(&settings.cache_dir, KERNEL_DIR, settings.strict));
        let memo = ProgramMemo::new(settings.memo_capacity);
        Self {
            settings,
            graph_local,
            kernel_local,
            graph_remote: None,
            kernel_remote: None,
            memo,
        }
    }

    /// Attaches a remote backend; tiers are created only when the settings
    /// enable them.
    pub fn with_remote(mut self, backend: Arc<dyn RemoteCacheBackend>) -> Self {
        if self.settings.remote_graph {
            self.graph_remote = Some(RemoteTier::new(
                Arc::clone(&backend),
                GRAPH_DIR,
                self.settings.strict,
            ));
            self.kernel_remote = Some(RemoteTier::new(
                backend,
                KERNEL_DIR,
                self.settings.strict,
            ));
        }
        self
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Drops the in-process memo only; durable tiers are untouched.
    pub fn reset_memo(&self) {
        self.memo.clear();
    }

    /// Administrative reset: removes the graph and kernel namespaces from
    /// disk and empties the memo.
    pub fn clear(&self) -> CacheResult<()> {
        if let Some(local) = &self.graph_local {
            local.clear()?;
        }
        if let Some(local) = &self.kernel_local {
            local.clear()?;
        }
        self.memo.clear();
        Ok(())
    }

    /// Produces a runnable callable for `graph`: from cache when possible,
    /// from `compiler` otherwise.
    pub fn load(
        &self,
        ctx: &CompileContext,
        compiler: &dyn GraphCompiler,
        graph: &Graph,
        inputs: &ExampleInputs,
        config: &CompileConfig,
    ) -> CompileResult<CompiledCallable> {
        let started = Instant::now();

        let (key, debug_lines) =
            match check_cacheable(graph).and_then(|()| compute_key(graph, inputs, config)) {
                Ok(computed) => computed,
                Err(err) => return self.load_bypassed(ctx, compiler, graph, inputs, config, err, started),
            };
        let key = key.to_string();

        // In-process memo first: a process that already rehydrated this key
        // never touches storage again.
        if let Some(memoized) = self.memo.get(&key) {
            if memoized.generation == ctx.generation.current() {
                counters::bump(counters::GRAPH_CACHE_HIT);
                self.emit(&key, CacheOutcome::Hit, &debug_lines, started);
                return Ok(self.callable(ctx, memoized.program));
            }
            // Tracked constants changed under the memoized program.
            self.memo.remove(&key);
            counters::bump(counters::GRAPH_CACHE_GUARD_MISS);
        }

        if let Some(entry) = self.lookup_entry(&key)? {
            match self.rehydrate(ctx, &entry.artifact) {
                Ok(program) => {
                    self.memoize(&key, ctx, &program);
                    counters::bump(counters::GRAPH_CACHE_HIT);
                    self.emit(&key, CacheOutcome::Hit, &debug_lines, started);
                    return Ok(self.callable(ctx, program));
                }
                Err(err) => {
                    // Tiers are not transactionally consistent; an entry
                    // whose referenced kernels vanished is a miss, not an
                    // error.
                    counters::bump(counters::GRAPH_CACHE_GUARD_MISS);
                    log::warn!("cache entry for {key} is unusable, recompiling: {err:#}");
                }
            }
        }

        counters::bump(counters::GRAPH_CACHE_MISS);
        let output = self.compile(ctx, compiler, graph, inputs, config)?;
        self.save_output(&key, &debug_lines, &output)?;
        let program = register_fresh(ctx, &output);
        self.memoize(&key, ctx, &program);
        self.emit(&key, CacheOutcome::Miss, &debug_lines, started);
        Ok(self.callable(ctx, program))
    }

    fn load_bypassed(
        &self,
        ctx: &CompileContext,
        compiler: &dyn GraphCompiler,
        graph: &Graph,
        inputs: &ExampleInputs,
        config: &CompileConfig,
        err: CacheError,
        started: Instant,
    ) -> CompileResult<CompiledCallable> {
        counters::bump(counters::GRAPH_CACHE_BYPASS);
        let reason = format!("bypass: {err}");
        events::emit(&CacheEvent {
            namespace: GRAPH_DIR,
            key: String::new(),
            outcome: CacheOutcome::Bypass,
            debug_lines: vec![reason],
            elapsed_us: started.elapsed().as_micros() as u64,
        });
        if self.settings.strict {
            // Strict mode surfaces bypasses so test suites can assert on
            // cacheability itself.
            return Err(err.into());
        }
        if !err.is_bypass() {
            log::warn!("key computation failed, compiling uncached: {err}");
        }
        let output = self.compile(ctx, compiler, graph, inputs, config)?;
        let program = register_fresh(ctx, &output);
        Ok(self.callable(ctx, program))
    }

    fn compile(
        &self,
        ctx: &CompileContext,
        compiler: &dyn GraphCompiler,
        graph: &Graph,
        inputs: &ExampleInputs,
        config: &CompileConfig,
    ) -> CompileResult<CompileOutput> {
        let _scope = CompileScope::enter();
        compiler.compile(graph, inputs, config, ctx)
    }

    fn callable(&self, ctx: &CompileContext, program: Arc<ExecutableProgram>) -> CompiledCallable {
        CompiledCallable::new(program, ctx.registry.clone(), Arc::clone(&ctx.executor))
    }

    fn memoize(&self, key: &str, ctx: &CompileContext, program: &Arc<ExecutableProgram>) {
        self.memo.insert(
            key.to_string(),
            MemoEntry {
                program: Arc::clone(program),
                generation: ctx.generation.current(),
            },
        );
    }

    fn emit(&self, key: &str, outcome: CacheOutcome, debug_lines: &[String], started: Instant) {
        events::emit(&CacheEvent {
            namespace: GRAPH_DIR,
            key: key.to_string(),
            outcome,
            debug_lines: debug_lines.to_vec(),
            elapsed_us: started.elapsed().as_micros() as u64,
        });
    }

    /// Walks local then remote, writing remote hits back into the local
    /// tier. Entries written by another crate version are misses.
    fn lookup_entry(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        if let Some(local) = &self.graph_local {
            if let Some(entry) = local.lookup::<CacheEntry>(key)? {
                if entry.version_matches() {
                    return Ok(Some(entry));
                }
                log::warn!(
                    "ignoring cache entry for {key} written by version {}",
                    entry.version
                );
            }
        }
        if let Some(remote) = &self.graph_remote {
            if let Some(entry) = remote.lookup::<CacheEntry>(key)? {
                if !entry.version_matches() {
                    return Ok(None);
                }
                if let Some(local) = &self.graph_local {
                    local.save(key, &entry)?;
                    counters::bump(counters::LOOKUP_WRITE_FILE);
                }
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    fn lookup_kernel(&self, key: &str) -> Option<KernelDef> {
        if let Some(local) = &self.kernel_local {
            if let Ok(Some(entry)) = local.lookup::<KernelEntry>(key) {
                return Some(entry.def);
            }
        }
        if let Some(remote) = &self.kernel_remote {
            if let Ok(Some(entry)) = remote.lookup::<KernelEntry>(key) {
                if let Some(local) = &self.kernel_local {
                    let _ = local.save(key, &entry);
                }
                return Some(entry.def);
            }
        }
        None
    }

    /// Rebinds a stored artifact against the current process: every
    /// referenced kernel is fetched from the kernel namespace and registered
    /// into the context's side-table.
    fn rehydrate(
        &self,
        ctx: &CompileContext,
        artifact: &CompiledArtifact,
    ) -> anyhow::Result<Arc<ExecutableProgram>> {
        let mut kernels = BTreeMap::new();
        for (node_idx, choice) in &artifact.choices {
            let def = self.lookup_kernel(&choice.kernel_key).ok_or_else(|| {
                anyhow::anyhow!(
                    "generated kernel {} is missing from the kernel cache",
                    choice.kernel_key
                )
            })?;
            kernels.insert(*node_idx, ctx.registry.add(def));
        }
        Ok(Arc::new(ExecutableProgram {
            graph: Arc::new(artifact.graph.clone()),
            kernels,
        }))
    }

    /// Persists a fresh compile: kernel definitions first, then the graph
    /// entry that references them. Failures are soft (the tiers already
    /// absorbed them) unless strict mode propagated out of `save`.
    fn save_output(
        &self,
        key: &str,
        debug_lines: &[String],
        output: &CompileOutput,
    ) -> Result<(), CompileError> {
        for (kernel_key, def) in &output.kernels {
            let entry = KernelEntry::new(kernel_key.clone(), def.clone());
            if let Some(local) = &self.kernel_local {
                local.save(kernel_key, &entry)?;
            }
            if let Some(remote) = &self.kernel_remote {
                remote.save(kernel_key, &entry)?;
            }
        }
        let entry = CacheEntry::new(
            key.to_string(),
            output.artifact.clone(),
            debug_lines.to_vec(),
        );
        if let Some(local) = &self.graph_local {
            local.save(key, &entry)?;
        }
        if let Some(remote) = &self.graph_remote {
            remote.save(key, &entry)?;
        }
        Ok(())
    }
}

/// Registers a fresh compile's kernels straight from the compiler output,
/// without a round-trip through the kernel cache.
fn register_fresh(ctx: &CompileContext, output: &CompileOutput) -> Arc<ExecutableProgram> {
    let by_key: BTreeMap<&str, &KernelDef> = output
        .kernels
        .iter()
        .map(|(key, def)| (key.as_str(), def))
        .collect();
    let kernels = output
        .artifact
        .choices
        .iter()
        .filter_map(|(node_idx, choice)| {
            by_key
                .get(choice.kernel_key.as_str())
                .map(|def| (*node_idx, ctx.registry.add((*def).clone())))
        })
        .collect();
    Arc::new(ExecutableProgram {
        graph: Arc::new(output.artifact.graph.clone()),
        kernels,
    })
}
