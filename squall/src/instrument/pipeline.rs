// Pipeline records and the hot-swap slot
//
// Every application pipeline the layer tracks gets a record holding
// its native handle, strong handles to its interned shaders, and an
// atomic slot for the instrumented replacement. Bind-Pipeline does a
// single atomic load to pick which handle actually goes on the
// command buffer, so swapping a freshly compiled pipeline in is
// lock-free.
//
// Austin Shafer - 2025

use ash::vk;
use ash::vk::Handle;
use fxhash::FxHashMap;

use super::shader::{ContentHash, ShaderRecord};
use crate::streamer::PipelineLayoutInfo;
use crate::Result;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PipelineType {
    Graphics,
    Compute,
    Mesh,
    RayTracing,
}

/// The instrumentation inputs a pipeline was last propagated to
#[derive(Debug, Clone, Default)]
pub struct InstrumentationInfo {
    /// Effective feature bit set (global | per-uid | filters)
    pub features: u64,
    /// Concatenated specialization streams of every layer
    pub specialization: Vec<u8>,
    pub specialization_hash: u64,
}

/// Recreates the native pipeline with instrumented bytecode
///
/// The glue layer captured the original create info, squall only
/// supplies the replacement shaders in shader-slot order.
pub type RecreateFn =
    Box<dyn Fn(&[Arc<Vec<u8>>]) -> Result<vk::Pipeline> + Send + Sync>;

pub struct PipelineRecord {
    pr_uid: u64,
    pr_name: String,
    pr_type: PipelineType,
    pr_native: vk::Pipeline,
    pr_layout: PipelineLayoutInfo,
    pr_shaders: Vec<Arc<ShaderRecord>>,
    pr_recreate: RecreateFn,
    /// The instrumented replacement, zero when none exists.
    /// vk::Pipeline is a plain 64-bit handle so an atomic holds it.
    pr_instrumented: AtomicU64,
    pr_info: Mutex<InstrumentationInfo>,
}

impl PipelineRecord {
    pub fn new(
        uid: u64,
        name: String,
        ptype: PipelineType,
        native: vk::Pipeline,
        layout: PipelineLayoutInfo,
        shaders: Vec<Arc<ShaderRecord>>,
        recreate: RecreateFn,
    ) -> Self {
        Self {
            pr_uid: uid,
            pr_name: name,
            pr_type: ptype,
            pr_native: native,
            pr_layout: layout,
            pr_shaders: shaders,
            pr_recreate: recreate,
            pr_instrumented: AtomicU64::new(0),
            pr_info: Mutex::new(InstrumentationInfo::default()),
        }
    }

    pub fn uid(&self) -> u64 {
        self.pr_uid
    }

    pub fn name(&self) -> &str {
        &self.pr_name
    }

    pub fn pipeline_type(&self) -> PipelineType {
        self.pr_type
    }

    pub fn native(&self) -> vk::Pipeline {
        self.pr_native
    }

    pub fn layout(&self) -> &PipelineLayoutInfo {
        &self.pr_layout
    }

    pub fn shaders(&self) -> &[Arc<ShaderRecord>] {
        &self.pr_shaders
    }

    pub fn info(&self) -> &Mutex<InstrumentationInfo> {
        &self.pr_info
    }

    pub fn recreate(&self, variants: &[Arc<Vec<u8>>]) -> Result<vk::Pipeline> {
        (self.pr_recreate)(variants)
    }

    /// The handle Bind-Pipeline should use right now
    pub fn instrumented(&self) -> Option<vk::Pipeline> {
        match self.pr_instrumented.load(Ordering::Acquire) {
            0 => None,
            raw => Some(vk::Pipeline::from_raw(raw)),
        }
    }

    /// Swap in a new instrumented pipeline, returning the old one for
    /// deferred destruction
    pub fn swap_instrumented(&self, pipeline: Option<vk::Pipeline>) -> Option<vk::Pipeline> {
        let raw = pipeline.map(|p| p.as_raw()).unwrap_or(0);
        match self.pr_instrumented.swap(raw, Ordering::AcqRel) {
            0 => None,
            old => Some(vk::Pipeline::from_raw(old)),
        }
    }
}

/// Per-device pipeline table plus the shader -> pipelines dependency
/// edges used for dirty propagation
pub struct PipelineTable {
    pt_internal: Mutex<PipelineTableInternal>,
}

struct PipelineTableInternal {
    pti_records: FxHashMap<u64, Arc<PipelineRecord>>,
    pti_shader_users: FxHashMap<ContentHash, Vec<u64>>,
}

impl PipelineTable {
    pub fn new() -> Self {
        Self {
            pt_internal: Mutex::new(PipelineTableInternal {
                pti_records: FxHashMap::default(),
                pti_shader_users: FxHashMap::default(),
            }),
        }
    }

    pub fn insert(&self, record: Arc<PipelineRecord>) {
        let mut internal = self.pt_internal.lock().unwrap();
        for shader in record.shaders() {
            internal
                .pti_shader_users
                .entry(shader.hash())
                .or_default()
                .push(record.uid());
        }
        internal.pti_records.insert(record.uid(), record);
    }

    pub fn remove(&self, uid: u64) -> Option<Arc<PipelineRecord>> {
        let mut internal = self.pt_internal.lock().unwrap();
        let record = internal.pti_records.remove(&uid)?;
        for shader in record.shaders() {
            if let Some(users) = internal.pti_shader_users.get_mut(&shader.hash()) {
                users.retain(|u| *u != uid);
            }
        }
        Some(record)
    }

    pub fn get(&self, uid: u64) -> Option<Arc<PipelineRecord>> {
        self.pt_internal.lock().unwrap().pti_records.get(&uid).cloned()
    }

    pub fn all(&self) -> Vec<Arc<PipelineRecord>> {
        self.pt_internal
            .lock()
            .unwrap()
            .pti_records
            .values()
            .cloned()
            .collect()
    }

    /// Pipelines referencing a shader, for dirty propagation
    pub fn users_of(&self, hash: ContentHash) -> Vec<Arc<PipelineRecord>> {
        let internal = self.pt_internal.lock().unwrap();
        internal
            .pti_shader_users
            .get(&hash)
            .map(|uids| {
                uids.iter()
                    .filter_map(|uid| internal.pti_records.get(uid).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.pt_internal.lock().unwrap().pti_records.len()
    }
}
