// The feature plug-in registry
//
// Each validation feature contributes a SPIR-V injection pass, the
// host-side bookkeeping behind it, and a handler that turns its raw
// GPU messages into structured reports. The registry owns activation
// (features may only touch GPU memory once their Instrumentation
// event fires), message dispatch by uid, and the per-command hook
// table the command buffer wrappers branch on.
//
// Austin Shafer - 2025

pub mod bounds;
pub mod descriptor;
pub mod init;

use fxhash::FxHashMap;

extern crate utils as sq_utils;
use crate::device::Device;
use crate::heap::HeapPool;
use crate::messages::{AccessKind, FailureCode, GpuMessage, MessageUid};
use crate::report::Report;
use crate::sguid::SguidRegistry;
use crate::spv::{InjectionPass, PassManager};
use crate::Result;
use sq_utils::log;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

bitflags::bitflags! {
    /// The feature bit assignments shared with the analyzer
    pub struct FeatureSet: u64 {
        const INITIALIZATION = 1 << 0;
        const RESOURCE_BOUNDS = 1 << 1;
        const DESCRIPTOR_VALIDATION = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Which command hooks take the instrumented fast path
    pub struct CommandHooks: u32 {
        const COPY = 1 << 0;
        const CLEAR = 1 << 1;
        const RESOLVE = 1 << 2;
        const RENDER_PASS_STORE = 1 << 3;
        const DRAW = 1 << 4;
        const DISPATCH = 1 << 5;
    }
}

/// A structured report produced from one GPU message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatureReport {
    Uninitialized {
        puid: u32,
        code: FailureCode,
        offset: u64,
        /// The 28-bit detail field saturated
        truncated: bool,
    },
    OutOfBounds {
        sguid: u32,
        shader_hash: Option<u64>,
        kind: AccessKind,
        offset: u64,
    },
    DescriptorMismatch {
        sguid: u32,
        slot: u8,
        binding: u16,
        expected: u8,
        observed: u8,
    },
}

/// One batch of metadata words headed for a device buffer
pub struct PendingUpload {
    pub buffer: ash::vk::Buffer,
    /// Destination offset in u32 words
    pub word_offset: u64,
    pub words: Vec<u32>,
}

/// Timeline waits an application submission must honor so shaders
/// never observe stale metadata
#[derive(Debug, Default, Copy, Clone)]
pub struct SubmitWaits {
    /// The transfer queue's metadata drain (V_T)
    pub transfer: Option<(ash::vk::Semaphore, u64)>,
    /// The compute queue's metadata clears (V_C)
    pub compute: Option<(ash::vk::Semaphore, u64)>,
}

/// One validation feature plug-in
pub trait Feature: Send + Sync {
    fn name(&self) -> &'static str;
    fn bit(&self) -> u64;
    fn message_uid(&self) -> MessageUid;

    /// The feature may allocate GPU resources, no instrumented
    /// dispatch referencing it has run yet
    fn on_instrumentation(&self) -> Result<()>;
    /// The feature's instrumented pipelines are being swapped live
    fn on_commit(&self);
    /// Release GPU-visible resources
    fn on_deactivate(&self);

    /// The injection pass for one shader
    fn build_pass(&self, shader_hash: u64) -> Box<dyn InjectionPass>;

    /// Which command hooks this feature needs while live
    fn command_hooks(&self) -> CommandHooks;

    /// Metadata words to push to the device before the next batch
    /// submission
    fn drain_uploads(&self) -> Vec<PendingUpload> {
        Vec::new()
    }

    /// Transform one raw message into report state
    fn handle_message(
        &self,
        msg: GpuMessage,
        report: &Mutex<Report>,
        out: &Mutex<Vec<FeatureReport>>,
    );
}

/// Per-device feature registry
pub struct FeatureRegistry {
    fr_dev: Arc<Device>,
    fr_features: Vec<Arc<dyn Feature>>,
    fr_by_uid: FxHashMap<MessageUid, usize>,
    /// Union of hooks needed by currently live features
    fr_hooks: AtomicU32,
    /// Analyzer-driven remapping of virtual feature bits onto
    /// concrete implementations
    fr_redirects: Mutex<FxHashMap<u64, u64>>,
    fr_sguids: Arc<SguidRegistry>,
    fr_init: Arc<init::InitializationFeature>,
    /// Structured reports awaiting egress
    fr_reports: Mutex<Vec<FeatureReport>>,
}

impl FeatureRegistry {
    pub fn new(
        dev: Arc<Device>,
        heaps: Arc<HeapPool>,
        _report: Arc<Mutex<Report>>,
    ) -> Result<Self> {
        let sguids = Arc::new(SguidRegistry::new());

        let init = Arc::new(init::InitializationFeature::new(
            dev.clone(),
            heaps.clone(),
        ));
        let bounds = Arc::new(bounds::ResourceBoundsFeature::new(sguids.clone()));
        let desc = Arc::new(descriptor::DescriptorValidationFeature::new(sguids.clone()));

        let features: Vec<Arc<dyn Feature>> = vec![init.clone(), bounds, desc];
        let mut by_uid = FxHashMap::default();
        for (i, feature) in features.iter().enumerate() {
            by_uid.insert(feature.message_uid(), i);
        }

        Ok(Self {
            fr_dev: dev,
            fr_features: features,
            fr_by_uid: by_uid,
            fr_hooks: AtomicU32::new(0),
            fr_redirects: Mutex::new(FxHashMap::default()),
            fr_sguids: sguids,
            fr_init: init,
            fr_reports: Mutex::new(Vec::new()),
        })
    }

    /// Typed access for the command hooks that talk to the
    /// initialization tracker directly
    pub fn initialization(&self) -> Arc<init::InitializationFeature> {
        self.fr_init.clone()
    }

    pub fn sguids(&self) -> Arc<SguidRegistry> {
        self.fr_sguids.clone()
    }

    /// Map virtual feature bits onto their redirected targets
    pub fn resolve_bits(&self, bits: u64) -> u64 {
        let redirects = self.fr_redirects.lock().unwrap();
        if redirects.is_empty() {
            return bits;
        }

        let mut resolved = bits;
        for (virt, actual) in redirects.iter() {
            if bits & virt != 0 {
                resolved = (resolved & !virt) | actual;
            }
        }
        resolved
    }

    /// Analyzer request: point a virtual feature bit at a concrete
    /// implementation
    pub fn redirect(&self, virtual_bits: u64, actual_bits: u64) {
        self.fr_redirects
            .lock()
            .unwrap()
            .insert(virtual_bits, actual_bits);
    }

    fn each_selected<F: FnMut(&Arc<dyn Feature>)>(&self, bits: u64, mut func: F) {
        let resolved = self.resolve_bits(bits);
        for feature in self.fr_features.iter() {
            if resolved & feature.bit() != 0 {
                func(feature);
            }
        }
    }

    pub fn on_instrumentation(&self, newly_active: u64) {
        self.each_selected(newly_active, |feature| {
            if let Err(e) = feature.on_instrumentation() {
                log::error!(
                    "feature {} failed to allocate its GPU state: {:?}",
                    feature.name(),
                    e
                );
            }
        });
    }

    pub fn on_commit(&self, active: u64) {
        self.each_selected(active, |feature| feature.on_commit());
    }

    pub fn on_deactivate(&self, newly_inactive: u64) {
        self.each_selected(newly_inactive, |feature| feature.on_deactivate());
    }

    /// Recompute the hook table for the active feature summary
    pub fn set_command_hooks(&self, active: u64) {
        let mut hooks = CommandHooks::empty();
        self.each_selected(active, |feature| hooks |= feature.command_hooks());
        self.fr_hooks.store(hooks.bits(), Ordering::Release);
    }

    /// The hook table consulted by the command buffer wrappers
    pub fn command_hooks(&self) -> CommandHooks {
        CommandHooks::from_bits_truncate(self.fr_hooks.load(Ordering::Acquire))
    }

    /// Compose the injection passes for a feature bit set
    pub fn build_pass_manager(&self, bits: u64, shader_hash: u64) -> PassManager {
        let mut manager = PassManager::new();
        self.each_selected(bits, |feature| {
            manager.register(feature.build_pass(shader_hash));
        });
        manager
    }

    /// Dispatch one raw GPU message to its feature handler
    pub fn handle_message(&self, msg: GpuMessage, report: &Mutex<Report>) {
        let uid = match msg.uid() {
            Some(uid) => uid,
            None => {
                log::error!("dropping message with unknown uid: {:#018x}", msg.0);
                return;
            }
        };

        if let Some(index) = self.fr_by_uid.get(&uid) {
            self.fr_features[*index].handle_message(msg, report, &self.fr_reports);
        }
    }

    /// Take the structured reports accumulated since the last drain
    pub fn drain_reports(&self) -> Vec<FeatureReport> {
        std::mem::take(&mut self.fr_reports.lock().unwrap())
    }

    /// The pre-submission metadata protocol
    ///
    /// Drains every feature's pending uploads to the transfer queue
    /// (signaling V_T) and the initialization tracker's metadata
    /// clears to the compute queue (signaling V_C). The application's
    /// submission must wait on whatever comes back before its shaders
    /// run.
    pub fn flush_pending(&self) -> Result<SubmitWaits> {
        let mut waits = SubmitWaits::default();

        let mut uploads = Vec::new();
        for feature in self.fr_features.iter() {
            uploads.append(&mut feature.drain_uploads());
        }

        if !uploads.is_empty() {
            let mut internal = self.fr_dev.d_internal.write().unwrap();
            let cmd = self
                .fr_dev
                .create_command_buffers(internal.transfer_cmd_pool, 1)[0];

            unsafe {
                let begin = ash::vk::CommandBufferBeginInfo::builder()
                    .flags(ash::vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
                    .build();
                self.fr_dev
                    .dev
                    .begin_command_buffer(cmd, &begin)
                    .or(Err(crate::SquallError::INVALID))?;

                for upload in uploads {
                    // cmd_update_buffer payloads cap at 64k, chunk
                    for (i, chunk) in upload.words.chunks(16384).enumerate() {
                        let bytes = std::slice::from_raw_parts(
                            chunk.as_ptr() as *const u8,
                            chunk.len() * 4,
                        );
                        self.fr_dev.dev.cmd_update_buffer(
                            cmd,
                            upload.buffer,
                            (upload.word_offset + i as u64 * 16384) * 4,
                            bytes,
                        );
                    }
                }
                self.fr_dev
                    .dev
                    .end_command_buffer(cmd)
                    .or(Err(crate::SquallError::INVALID))?;

                internal.transfer_timeline_point += 1;
                let point = internal.transfer_timeline_point;
                let signal_values = [point];
                let mut timeline_info = ash::vk::TimelineSemaphoreSubmitInfo::builder()
                    .signal_semaphore_values(&signal_values)
                    .build();
                let cmds = [cmd];
                let signal_semas = [internal.transfer_timeline_sema];
                let submit = ash::vk::SubmitInfo::builder()
                    .command_buffers(&cmds)
                    .signal_semaphores(&signal_semas)
                    .push_next(&mut timeline_info)
                    .build();
                self.fr_dev
                    .dev
                    .queue_submit(internal.transfer_queue, &[submit], ash::vk::Fence::null())
                    .or(Err(crate::SquallError::INVALID))?;

                waits.transfer = Some((internal.transfer_timeline_sema, point));
            }
        }

        // Metadata clears ride the compute queue
        if self.fr_init.has_pending_clears() {
            let mut internal = self.fr_dev.d_internal.write().unwrap();
            let cmd = self
                .fr_dev
                .create_command_buffers(internal.compute_cmd_pool, 1)[0];

            unsafe {
                let begin = ash::vk::CommandBufferBeginInfo::builder()
                    .flags(ash::vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
                    .build();
                self.fr_dev
                    .dev
                    .begin_command_buffer(cmd, &begin)
                    .or(Err(crate::SquallError::INVALID))?;
            }
            let recorded = self.fr_init.record_pending_clears(cmd);
            unsafe {
                self.fr_dev
                    .dev
                    .end_command_buffer(cmd)
                    .or(Err(crate::SquallError::INVALID))?;

                if recorded {
                    internal.compute_timeline_point += 1;
                    let point = internal.compute_timeline_point;
                    let signal_values = [point];
                    let mut timeline_info = ash::vk::TimelineSemaphoreSubmitInfo::builder()
                        .signal_semaphore_values(&signal_values)
                        .build();
                    let cmds = [cmd];
                    let signal_semas = [internal.compute_timeline_sema];
                    let submit = ash::vk::SubmitInfo::builder()
                        .command_buffers(&cmds)
                        .signal_semaphores(&signal_semas)
                        .push_next(&mut timeline_info)
                        .build();
                    self.fr_dev
                        .dev
                        .queue_submit(
                            internal.compute_queue,
                            &[submit],
                            ash::vk::Fence::null(),
                        )
                        .or(Err(crate::SquallError::INVALID))?;

                    waits.compute = Some((internal.compute_timeline_sema, point));
                }
            }
        }

        Ok(waits)
    }

    /// An application submission retired, promote whatever it proved
    pub fn retire_submissions(&self, completed_point: u64) {
        self.fr_init.retire_submissions(completed_point);
    }
}
