// The Squall shader validation engine
//
// Squall sits between an application and its Vulkan device and checks
// what the application's shaders actually do. Pipelines are rewritten
// on demand with validation instrumentation, the instrumented code
// exports packed messages into per-command-buffer streams, and a
// background worker turns those streams into structured reports.
//
// Austin Shafer - 2025

pub mod deletion_queue;
mod device;
pub mod heap;
mod instance;
pub mod instrument;
pub mod messages;
pub mod report;
pub mod sguid;
pub mod spv;
pub mod stream;
pub mod streamer;
pub mod texelmem;

pub mod features;
mod kernels;

#[cfg(test)]
mod tests;

pub use deletion_queue::DeletionQueue;
pub use device::Device;
pub use instance::Instance;
pub use messages::{GpuMessage, MessageUid, StreamHeader};
pub use report::Report;

extern crate utils as sq_utils;
pub use sq_utils::{anyhow, Context, Error};

// The glue layer drives raw handles through us, give it the same ash
pub use ash;

#[macro_use]
extern crate memoffset;
extern crate thiserror;
use std::sync::Arc;

/// Squall engine errors
///
/// These get returned out of every fallible engine path. The split
/// matters: most of these are recoverable and the caller skips the
/// instrumented path for a frame, but INCONSISTENT_API poisons the
/// device session for good.
#[derive(thiserror::Error, Debug, PartialEq, Eq, Clone, Copy)]
#[allow(non_camel_case_types)]
pub enum SquallError {
    #[error("Out of host visible memory")]
    OUT_OF_HOST_MEMORY,
    #[error("Out of device local memory")]
    OUT_OF_DEVICE_MEMORY,
    #[error("Could not map host visible memory")]
    MAP_FAILED,
    #[error("The driver reported inconsistent requirements for identical parameters")]
    INCONSISTENT_API,
    #[error("The device session has been marked dead")]
    SESSION_DEAD,
    #[error("Operation timed out")]
    TIMEOUT,
    #[error("Shader instrumentation pass failed")]
    COMPILE_FAILED,
    #[error("Could not create a GPU pipeline")]
    COULD_NOT_CREATE_PIPELINE,
    #[error("Could not create a GPU buffer")]
    COULD_NOT_CREATE_BUFFER,
    #[error("Descriptor pool exhausted")]
    DESCRIPTOR_POOL_EXHAUSTED,
    #[error("Resource is not tracked by this feature")]
    UNTRACKED,
    #[error("Invalid parameters")]
    INVALID,
    #[error("The SPIR-V module could not be parsed")]
    INVALID_SPIRV,
    #[error("The id space for this session is exhausted")]
    ID_SPACE_EXHAUSTED,
}

pub type Result<T> = std::result::Result<T, SquallError>;

/// Catchall trait for objects parked in the deletion queue
pub trait Droppable {}
impl<T> Droppable for T {}

bitflags::bitflags! {
    /// Severities that get forwarded to the analyzer
    pub struct LogSeverity: u32 {
        const INFO    = 0b0001;
        const WARNING = 0b0010;
        const ERROR   = 0b0100;
    }
}

/// Engine tunables
///
/// Everything the analyzer or the launcher can turn. The defaults are
/// what ships; `builder()` is the way to change them.
#[derive(Debug, Clone)]
pub struct CreateInfo {
    /// Default heap chunk size for suballocations
    pub chunked_working_set_bytes: u64,
    /// Starting message capacity for a fresh command buffer stream
    pub command_buffer_message_count_default: u32,
    /// Hard ceiling on any stream's message capacity
    pub command_buffer_message_count_limit: u32,
    /// A pooled stream is only reused when capacity / requested stays
    /// at or under this ratio
    pub allocation_viability_limit_threshold: f32,
    /// visible / average ratio past which a stream is marked as a
    /// transfer sync point
    pub transfer_sync_point_threshold: f32,
    /// Enables mid-work partial readback of message streams
    pub latent_transfers: bool,
    /// Which severities surface to the analyzer
    pub log_severity_mask: LogSeverity,
    /// Forces Begin-Command-Buffer to block on pending instrumentation
    pub synchronous_recording: bool,
    /// Enables DXBC to DXIL lifting on backends that carry DXBC. The
    /// Vulkan backend ignores it.
    pub dxbc_conversion_enabled: bool,
}

impl CreateInfo {
    pub fn builder() -> CreateInfoBuilder {
        CreateInfoBuilder {
            b_info: CreateInfo::default(),
        }
    }
}

impl Default for CreateInfo {
    fn default() -> Self {
        Self {
            chunked_working_set_bytes: 32 * 1024 * 1024,
            command_buffer_message_count_default: 1024,
            command_buffer_message_count_limit: 1 << 20,
            allocation_viability_limit_threshold: 4.0,
            transfer_sync_point_threshold: 1.5,
            latent_transfers: false,
            log_severity_mask: LogSeverity::WARNING | LogSeverity::ERROR,
            synchronous_recording: false,
            dxbc_conversion_enabled: false,
        }
    }
}

pub struct CreateInfoBuilder {
    b_info: CreateInfo,
}

#[allow(dead_code)]
impl CreateInfoBuilder {
    pub fn chunked_working_set_bytes(mut self, bytes: u64) -> Self {
        self.b_info.chunked_working_set_bytes = bytes;
        self
    }

    pub fn message_count_default(mut self, count: u32) -> Self {
        self.b_info.command_buffer_message_count_default = count;
        self
    }

    pub fn message_count_limit(mut self, count: u32) -> Self {
        self.b_info.command_buffer_message_count_limit = count;
        self
    }

    pub fn viability_limit_threshold(mut self, ratio: f32) -> Self {
        self.b_info.allocation_viability_limit_threshold = ratio;
        self
    }

    pub fn transfer_sync_point_threshold(mut self, ratio: f32) -> Self {
        self.b_info.transfer_sync_point_threshold = ratio;
        self
    }

    pub fn latent_transfers(mut self, enable: bool) -> Self {
        self.b_info.latent_transfers = enable;
        self
    }

    pub fn log_severity_mask(mut self, mask: LogSeverity) -> Self {
        self.b_info.log_severity_mask = mask;
        self
    }

    pub fn synchronous_recording(mut self, enable: bool) -> Self {
        self.b_info.synchronous_recording = enable;
        self
    }

    pub fn dxbc_conversion(mut self, enable: bool) -> Self {
        self.b_info.dxbc_conversion_enabled = enable;
        self
    }

    pub fn build(self) -> CreateInfo {
        self.b_info
    }
}

/// The Squall engine for one device session
///
/// This bundles the per-device subsystems: the suballocator, the
/// diagnostic stream pool and its drain worker, the descriptor
/// streamer, the instrumentation controller, and the feature set.
pub struct Squall {
    sq_info: CreateInfo,
    sq_dev: Arc<Device>,
    sq_heaps: Arc<heap::HeapPool>,
    sq_streams: Arc<stream::DiagnosticPool>,
    sq_controller: Arc<instrument::InstrumentationController>,
    sq_features: Arc<features::FeatureRegistry>,
    sq_report: Arc<std::sync::Mutex<Report>>,
}

impl Squall {
    /// Bring up the engine on a fresh device session
    ///
    /// This creates a context and logical device, spins up the drain
    /// worker and the compile dispatcher, and registers the built in
    /// feature plugins.
    pub fn new(info: &CreateInfo) -> Result<Self> {
        let inst = Arc::new(Instance::new());
        let dev = Arc::new(Device::new(inst)?);

        let heaps = Arc::new(heap::HeapPool::new(dev.clone(), info));
        let report = Arc::new(std::sync::Mutex::new(Report::new()));

        let features = Arc::new(features::FeatureRegistry::new(
            dev.clone(),
            heaps.clone(),
            report.clone(),
        )?);

        let streams = Arc::new(stream::DiagnosticPool::new(
            dev.clone(),
            heaps.clone(),
            features.clone(),
            report.clone(),
            info,
        )?);

        let controller = Arc::new(instrument::InstrumentationController::new(
            dev.clone(),
            features.clone(),
            report.clone(),
            info,
        ));

        Ok(Self {
            sq_info: info.clone(),
            sq_dev: dev,
            sq_heaps: heaps,
            sq_streams: streams,
            sq_controller: controller,
            sq_features: features,
            sq_report: report,
        })
    }

    /// Snapshot the session report for egress
    pub fn report_snapshot(&self) -> Report {
        self.sq_report.lock().unwrap().snapshot()
    }

    pub fn get_info(&self) -> &CreateInfo {
        &self.sq_info
    }

    pub fn get_device(&self) -> Arc<Device> {
        self.sq_dev.clone()
    }

    pub fn get_heaps(&self) -> Arc<heap::HeapPool> {
        self.sq_heaps.clone()
    }

    pub fn get_streams(&self) -> Arc<stream::DiagnosticPool> {
        self.sq_streams.clone()
    }

    pub fn get_controller(&self) -> Arc<instrument::InstrumentationController> {
        self.sq_controller.clone()
    }

    pub fn get_features(&self) -> Arc<features::FeatureRegistry> {
        self.sq_features.clone()
    }

    /// Open a fresh streamer context for one command buffer
    ///
    /// When synchronous recording is on this first blocks until any
    /// in-flight instrumentation batch lands, so the commands recorded
    /// next see the freshest pipelines.
    pub fn begin_command_buffer(
        &self,
        cmd: ash::vk::CommandBuffer,
    ) -> Result<streamer::StreamState> {
        if self.sq_info.synchronous_recording {
            self.sq_controller.wait_for_completion();
        }

        streamer::StreamState::open(self.sq_dev.clone(), self.sq_streams.clone(), cmd)
    }

    /// Flush the drain worker
    ///
    /// Called on explicit application sync (fence waits, device idle)
    /// so reports observe everything submitted before the sync.
    pub fn wait_for_filtering(&self) {
        self.sq_streams.wait_for_filtering();
    }
}

impl Drop for Squall {
    fn drop(&mut self) {
        self.sq_controller.shutdown();
        self.sq_streams.shutdown();
    }
}
