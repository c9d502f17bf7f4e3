// The instrumentation controller
//
// Activation requests arrive from the analyzer as feature bit-set and
// filter mutations. The controller propagates them to the affected
// pipelines, figures out which shader variants are missing, and runs
// a three-phase compile batch on the dispatcher: rewrite the dirty
// shaders, recreate the dirty pipelines, then atomically hot-swap the
// results in. Exactly one batch is in flight at a time; mutations
// that land mid-batch bump an event counter and replay in the next
// bucket.
//
// Austin Shafer - 2025

pub mod dispatch;
pub mod filters;
pub mod pipeline;
pub mod shader;

pub use filters::FilterEntry;
pub use pipeline::{InstrumentationInfo, PipelineRecord, PipelineTable, PipelineType};
pub use shader::{ContentHash, InstrumentationKey, ShaderRecord, ShaderStore};

use fxhash::{FxHashMap, FxHasher};

extern crate utils as sq_utils;
use crate::device::Device;
use crate::features::FeatureRegistry;
use crate::spv;
use crate::CreateInfo;
use dispatch::{Dispatcher, DispatcherBucket};
use sq_utils::log;
use sq_utils::timing::StopWatch;

use std::collections::HashSet;
use std::hash::Hasher;
use std::sync::{Arc, Condvar, Mutex};

/// Compile workers the dispatcher runs
const COMPILE_WORKERS: usize = 4;

struct ControllerState {
    /// Feature bits applied to every pipeline
    cs_global_features: u64,
    /// Per shader content hash overrides
    cs_shader_features: FxHashMap<ContentHash, u64>,
    /// Per pipeline uid overrides
    cs_pipeline_features: FxHashMap<u64, u64>,
    cs_filters: filters::FilterList,

    /// Objects whose instrumentation inputs changed since last commit
    cs_dirty_shaders: HashSet<ContentHash>,
    cs_dirty_pipelines: HashSet<u64>,

    /// One batch in flight at a time
    cs_batch_active: bool,
    /// Mutations that arrived while a batch was compiling; the next
    /// bucket replays them
    cs_pending_events: u64,
    /// Batches started / finished, the completion event pair
    cs_head_counter: u64,
    cs_completed_counter: u64,

    /// The device-wide feature summary the hook table reflects
    cs_active_summary: u64,
}

/// One collected compile batch
struct BatchData {
    bd_shader_jobs: Vec<ShaderJob>,
    bd_pipelines: Vec<Arc<PipelineRecord>>,
    bd_results: Mutex<Vec<(Arc<PipelineRecord>, ash::vk::Pipeline)>>,
    bd_failed_shaders: Mutex<u64>,
    bd_skipped_pipelines: Mutex<u64>,
    bd_watch: Mutex<StopWatch>,
}

struct ShaderJob {
    sj_shader: Arc<ShaderRecord>,
    sj_key: InstrumentationKey,
    /// Descriptor set slot the rewritten code binds its exports to
    sj_diag_set: u32,
}

pub struct InstrumentationController {
    ic_dev: Arc<Device>,
    ic_features: Arc<FeatureRegistry>,
    ic_shaders: ShaderStore,
    ic_pipelines: PipelineTable,
    ic_dispatcher: Dispatcher,
    ic_state: Mutex<ControllerState>,
    ic_completion: Condvar,
    ic_report: Arc<Mutex<crate::report::Report>>,
}

impl InstrumentationController {
    pub fn new(
        dev: Arc<Device>,
        features: Arc<FeatureRegistry>,
        report: Arc<Mutex<crate::report::Report>>,
        _info: &CreateInfo,
    ) -> Self {
        Self {
            ic_dev: dev,
            ic_features: features,
            ic_shaders: ShaderStore::new(),
            ic_pipelines: PipelineTable::new(),
            ic_dispatcher: Dispatcher::new(COMPILE_WORKERS),
            ic_state: Mutex::new(ControllerState {
                cs_global_features: 0,
                cs_shader_features: FxHashMap::default(),
                cs_pipeline_features: FxHashMap::default(),
                cs_filters: filters::FilterList::new(),
                cs_dirty_shaders: HashSet::new(),
                cs_dirty_pipelines: HashSet::new(),
                cs_batch_active: false,
                cs_pending_events: 0,
                cs_head_counter: 0,
                cs_completed_counter: 0,
                cs_active_summary: 0,
            }),
            ic_completion: Condvar::new(),
            ic_report: report,
        }
    }

    pub fn shaders(&self) -> &ShaderStore {
        &self.ic_shaders
    }

    pub fn pipelines(&self) -> &PipelineTable {
        &self.ic_pipelines
    }

    /// Track a new pipeline
    ///
    /// If instrumentation is already active the record is propagated
    /// and compiled immediately, otherwise it just sits in the table
    /// until a feature shows up.
    pub fn register_pipeline(self: &Arc<Self>, record: Arc<PipelineRecord>) {
        self.ic_pipelines.insert(record.clone());

        let mut state = self.ic_state.lock().unwrap();
        if Self::propagate_record(&mut state, &record) {
            drop(state);
            self.commit();
        }
    }

    /// Stop tracking a pipeline and drop now-unreferenced shaders
    pub fn unregister_pipeline(&self, uid: u64) {
        self.ic_pipelines.remove(uid);
        self.ic_shaders.collect();
    }

    // ---- analyzer message entry points -------------------------------

    pub fn set_global_instrumentation(self: &Arc<Self>, feature_bits: u64) {
        {
            let mut state = self.ic_state.lock().unwrap();
            state.cs_global_features = feature_bits;
        }
        self.propagate_all();
        self.commit();
    }

    pub fn set_shader_instrumentation(self: &Arc<Self>, hash: ContentHash, feature_bits: u64) {
        {
            let mut state = self.ic_state.lock().unwrap();
            state.cs_shader_features.insert(hash, feature_bits);
        }
        self.propagate_all();
        self.commit();
    }

    pub fn set_pipeline_instrumentation(self: &Arc<Self>, uid: u64, feature_bits: u64) {
        {
            let mut state = self.ic_state.lock().unwrap();
            state.cs_pipeline_features.insert(uid, feature_bits);
        }
        self.propagate_all();
        self.commit();
    }

    pub fn set_or_add_filter(self: &Arc<Self>, entry: FilterEntry) {
        {
            let mut state = self.ic_state.lock().unwrap();
            state.cs_filters.set_or_add(entry);
        }
        // Filters re-apply to every pipeline on every mutation, even
        // an unchanged one, so the outcome is deterministic
        self.propagate_all();
        self.commit();
    }

    pub fn remove_filter(self: &Arc<Self>, guid: u64) {
        {
            let mut state = self.ic_state.lock().unwrap();
            state.cs_filters.remove(guid);
        }
        self.propagate_all();
        self.commit();
    }

    // ---- propagation -------------------------------------------------

    /// Recompute one pipeline's effective instrumentation inputs.
    /// Returns true if they changed and the object went dirty.
    fn propagate_record(state: &mut ControllerState, record: &Arc<PipelineRecord>) -> bool {
        let mut features = state.cs_global_features;
        if let Some(bits) = state.cs_pipeline_features.get(&record.uid()) {
            features |= bits;
        }
        for shader in record.shaders() {
            if let Some(bits) = state.cs_shader_features.get(&shader.hash()) {
                features |= bits;
            }
        }

        // Specialization is the concatenation of the same layers that
        // contributed feature bits, filters last in list order
        let mut specialization = Vec::new();
        for filter in state.cs_filters.matching(record) {
            features |= filter.features;
            specialization.extend_from_slice(&filter.specialization);
        }

        let mut hasher = FxHasher::default();
        hasher.write(&specialization);
        let spec_hash = hasher.finish();

        let mut info = record.info().lock().unwrap();
        if info.features == features && info.specialization_hash == spec_hash {
            return false;
        }
        info.features = features;
        info.specialization = specialization;
        info.specialization_hash = spec_hash;
        drop(info);

        state.cs_dirty_pipelines.insert(record.uid());
        for shader in record.shaders() {
            state.cs_dirty_shaders.insert(shader.hash());
        }
        true
    }

    fn propagate_all(self: &Arc<Self>) {
        let records = self.ic_pipelines.all();
        let mut state = self.ic_state.lock().unwrap();
        for record in records.iter() {
            Self::propagate_record(&mut state, record);
        }
    }

    // ---- commit ------------------------------------------------------

    /// Union of every pipeline's effective features
    fn summarize_feature_bit_set(&self) -> u64 {
        let mut summary = 0;
        for record in self.ic_pipelines.all() {
            summary |= record.info().lock().unwrap().features;
        }
        summary
    }

    /// Kick a compile batch for everything dirty
    pub fn commit(self: &Arc<Self>) {
        let mut state = self.ic_state.lock().unwrap();

        if state.cs_batch_active {
            state.cs_pending_events += 1;
            return;
        }
        if state.cs_dirty_pipelines.is_empty() && state.cs_dirty_shaders.is_empty() {
            return;
        }

        // Summarize and fire activation transitions before any
        // instrumented dispatch can run
        drop(state);
        let summary = self.summarize_feature_bit_set();
        state = self.ic_state.lock().unwrap();

        let newly_active = summary & !state.cs_active_summary;
        let newly_inactive = state.cs_active_summary & !summary;
        state.cs_active_summary = summary;
        if newly_active != 0 {
            self.ic_features.on_instrumentation(newly_active);
        }
        if newly_inactive != 0 {
            self.ic_features.on_deactivate(newly_inactive);
        }
        self.ic_features.set_command_hooks(summary);

        // Collect the batch under the lock: shader jobs are the cross
        // product of dirty shaders and their dependent pipelines,
        // deduplicated by variant reservation
        let dirty_pipelines: Vec<u64> = state.cs_dirty_pipelines.drain().collect();
        state.cs_dirty_shaders.clear();

        let mut shader_jobs = Vec::new();
        let mut batch_pipelines = Vec::new();
        for uid in dirty_pipelines {
            let record = match self.ic_pipelines.get(uid) {
                Some(r) => r,
                None => continue,
            };
            let info = record.info().lock().unwrap().clone();
            if info.features != 0 {
                for shader in record.shaders() {
                    let key = InstrumentationKey {
                        features: info.features,
                        layout_summary: record.layout().compat_hash,
                        specialization_hash: info.specialization_hash,
                    };
                    if shader.reserve(key) {
                        shader_jobs.push(ShaderJob {
                            sj_shader: shader.clone(),
                            sj_key: key,
                            sj_diag_set: record.layout().user_slot_count,
                        });
                    }
                }
            }
            batch_pipelines.push(record);
        }

        state.cs_batch_active = true;
        state.cs_head_counter += 1;
        drop(state);

        let batch = Arc::new(BatchData {
            bd_shader_jobs: shader_jobs,
            bd_pipelines: batch_pipelines,
            bd_results: Mutex::new(Vec::new()),
            bd_failed_shaders: Mutex::new(0),
            bd_skipped_pipelines: Mutex::new(0),
            bd_watch: Mutex::new(StopWatch::new()),
        });
        batch.bd_watch.lock().unwrap().start();

        self.enqueue_shader_phase(batch);
    }

    fn enqueue_shader_phase(self: &Arc<Self>, batch: Arc<BatchData>) {
        let controller = self.clone();
        let phase_batch = batch.clone();
        let bucket = DispatcherBucket::new(Box::new(move || {
            controller.enqueue_pipeline_phase(phase_batch);
        }));

        for i in 0..batch.bd_shader_jobs.len() {
            let job_batch = batch.clone();
            let job_controller = self.clone();
            self.ic_dispatcher.enqueue(&bucket, move || {
                job_controller.run_shader_job(&job_batch, i);
            });
        }
        bucket.release();
    }

    fn run_shader_job(self: &Arc<Self>, batch: &BatchData, index: usize) {
        let job = &batch.bd_shader_jobs[index];

        let compiled = self.compile_shader_variant(job);
        if compiled.is_none() {
            *batch.bd_failed_shaders.lock().unwrap() += 1;
        }
        job.sj_shader.store(job.sj_key, compiled);
    }

    /// Parse, rewrite, and serialize one shader variant
    fn compile_shader_variant(&self, job: &ShaderJob) -> Option<Vec<u8>> {
        let mut module = match spv::Module::from_bytes(job.sj_shader.bytecode()) {
            Ok(m) => m,
            Err(e) => {
                log::error!(
                    "could not parse shader {:#x}: {:?}",
                    job.sj_shader.hash(),
                    e
                );
                return None;
            }
        };

        let mut manager =
            self.ic_features
                .build_pass_manager(job.sj_key.features, job.sj_shader.hash());
        match manager.run(&mut module, job.sj_diag_set) {
            Ok(_) => Some(module.into_bytes()),
            Err(e) => {
                log::error!(
                    "instrumentation pass failed on shader {:#x}: {:?}",
                    job.sj_shader.hash(),
                    e
                );
                None
            }
        }
    }

    fn enqueue_pipeline_phase(self: &Arc<Self>, batch: Arc<BatchData>) {
        let controller = self.clone();
        let phase_batch = batch.clone();
        let bucket = DispatcherBucket::new(Box::new(move || {
            controller.commit_batch(phase_batch);
        }));

        for i in 0..batch.bd_pipelines.len() {
            let job_batch = batch.clone();
            self.ic_dispatcher.enqueue(&bucket, move || {
                Self::run_pipeline_job(&job_batch, i);
            });
        }
        bucket.release();
    }

    fn run_pipeline_job(batch: &BatchData, index: usize) {
        let record = &batch.bd_pipelines[index];
        let info = record.info().lock().unwrap().clone();

        if info.features == 0 {
            // Deactivated: drop the instrumented object at commit
            return;
        }

        // Gather every shader's variant; a missing one means its
        // compile failed and this pipeline keeps its native object
        let mut variants = Vec::new();
        for shader in record.shaders() {
            let key = InstrumentationKey {
                features: info.features,
                layout_summary: record.layout().compat_hash,
                specialization_hash: info.specialization_hash,
            };
            match shader.get_variant(&key) {
                Some(bytes) => variants.push(bytes),
                None => {
                    *batch.bd_skipped_pipelines.lock().unwrap() += 1;
                    return;
                }
            }
        }

        match record.recreate(&variants) {
            Ok(pipeline) => {
                batch
                    .bd_results
                    .lock()
                    .unwrap()
                    .push((record.clone(), pipeline));
            }
            Err(e) => {
                log::error!("pipeline {} recreation failed: {:?}", record.uid(), e);
                *batch.bd_skipped_pipelines.lock().unwrap() += 1;
            }
        }
    }

    /// Final phase: swap results in and close the batch
    fn commit_batch(self: &Arc<Self>, batch: Arc<BatchData>) {
        let results: Vec<_> = batch.bd_results.lock().unwrap().drain(..).collect();
        let retire_point = self.ic_dev.completed_timeline_point() + 1;

        let mut swapped = 0u64;
        for (record, pipeline) in results {
            let old = record.swap_instrumented(Some(pipeline));
            swapped += 1;
            if let Some(old_pipeline) = old {
                // In-flight command buffers may still reference it
                let dev = self.ic_dev.clone();
                self.ic_dev.schedule_drop_at_point(
                    Box::new(RetiredPipeline {
                        rp_dev: dev,
                        rp_pipeline: old_pipeline,
                    }),
                    retire_point,
                );
            }
        }

        // Pipelines whose features dropped to zero lose their variant
        for record in batch.bd_pipelines.iter() {
            if record.info().lock().unwrap().features == 0 {
                if let Some(old_pipeline) = record.swap_instrumented(None) {
                    let dev = self.ic_dev.clone();
                    self.ic_dev.schedule_drop_at_point(
                        Box::new(RetiredPipeline {
                            rp_dev: dev,
                            rp_pipeline: old_pipeline,
                        }),
                        retire_point,
                    );
                }
            }
        }

        let failed = *batch.bd_failed_shaders.lock().unwrap();
        let skipped = *batch.bd_skipped_pipelines.lock().unwrap();
        let millis = {
            let mut watch = batch.bd_watch.lock().unwrap();
            watch.end();
            watch.get_duration().as_millis() as u64
        };
        log::debug!(
            "compile batch done: {} swapped, {} failed shaders, {} skipped pipelines, {} ms",
            swapped,
            failed,
            skipped,
            millis
        );
        {
            let mut report = self.ic_report.lock().unwrap();
            report.shader_compiles += batch.bd_shader_jobs.len() as u64;
            report.failed_shader_compiles += failed;
            report.pipeline_compiles += swapped;
            report.failed_pipeline_compiles += skipped;
            report.compile_millis += millis;
        }

        let summary = {
            let state = self.ic_state.lock().unwrap();
            state.cs_active_summary
        };
        self.ic_features.on_commit(summary);

        let rerun = {
            let mut state = self.ic_state.lock().unwrap();
            state.cs_batch_active = false;
            state.cs_completed_counter += 1;
            self.ic_completion.notify_all();
            let rerun = state.cs_pending_events > 0;
            state.cs_pending_events = 0;
            rerun
        };

        // Mutations arrived while we compiled, replay them now
        if rerun {
            self.propagate_all();
            self.commit();
        }
    }

    /// The device-wide active feature summary
    pub fn active_summary(&self) -> u64 {
        self.ic_state.lock().unwrap().cs_active_summary
    }

    /// Block until every batch started so far has landed
    pub fn wait_for_completion(&self) {
        let mut state = self.ic_state.lock().unwrap();
        let head = state.cs_head_counter;
        while state.cs_completed_counter < head {
            state = self.ic_completion.wait(state).unwrap();
        }
    }

    pub fn shutdown(&self) {
        self.ic_dispatcher.shutdown();
    }
}

/// A hot-swapped-out pipeline parked until its timeline point
struct RetiredPipeline {
    rp_dev: Arc<Device>,
    rp_pipeline: ash::vk::Pipeline,
}

impl Drop for RetiredPipeline {
    fn drop(&mut self) {
        unsafe {
            self.rp_dev.dev.destroy_pipeline(self.rp_pipeline, None);
        }
    }
}
