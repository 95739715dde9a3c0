//! Command buffer recording for a single dispatch.

use crate::context::Context;
use crate::error::{ComputeError, Result};
use crate::handle::Owned;
use crate::pipeline::Pipeline;
use ash::vk;
use std::marker::PhantomData;

/// Workgroup counts for one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSize {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl DispatchSize {
    /// Dispatch of `x * y * z` workgroups.
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// One-dimensional dispatch of `x` workgroups.
    pub fn x(x: u32) -> Self {
        Self::new(x, 1, 1)
    }
}

impl From<u32> for DispatchSize {
    fn from(x: u32) -> Self {
        Self::x(x)
    }
}

impl From<(u32, u32, u32)> for DispatchSize {
    fn from((x, y, z): (u32, u32, u32)) -> Self {
        Self::new(x, y, z)
    }
}

/// Sink for the commands of a compute dispatch.
///
/// [`CommandQueue`] records into a device command buffer; anything else
/// implementing this can observe the same sequence.
pub trait ComputeRecorder {
    /// Start recording with the given usage flags.
    fn begin(&mut self, usage: vk::CommandBufferUsageFlags) -> Result<()>;
    /// Bind a compute pipeline.
    fn bind_pipeline(&mut self, pipeline: vk::Pipeline);
    /// Bind descriptor sets starting at `first_set`, without dynamic offsets.
    fn bind_descriptor_sets(
        &mut self,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    );
    /// Record a dispatch of `x * y * z` workgroups.
    fn dispatch(&mut self, x: u32, y: u32, z: u32);
    /// Finish recording.
    fn end(&mut self) -> Result<()>;
}

/// Everything needed to record one dispatch.
#[derive(Debug, Clone, Copy)]
pub struct DispatchPlan {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub descriptor_set: vk::DescriptorSet,
    pub usage: vk::CommandBufferUsageFlags,
    pub size: DispatchSize,
}

impl DispatchPlan {
    /// Plan a dispatch of `pipeline` with its own descriptor set.
    pub fn for_pipeline(
        pipeline: &Pipeline<'_>,
        usage: vk::CommandBufferUsageFlags,
        size: DispatchSize,
    ) -> Self {
        Self {
            pipeline: pipeline.handle(),
            layout: pipeline.layout(),
            descriptor_set: pipeline.descriptor_set(),
            usage,
            size,
        }
    }
}

/// Record begin, bind pipeline, bind set 0, dispatch, end.
pub fn record_dispatch<R: ComputeRecorder + ?Sized>(
    recorder: &mut R,
    plan: &DispatchPlan,
) -> Result<()> {
    recorder.begin(plan.usage)?;
    recorder.bind_pipeline(plan.pipeline);
    recorder.bind_descriptor_sets(plan.layout, 0, &[plan.descriptor_set]);
    recorder.dispatch(plan.size.x, plan.size.y, plan.size.z);
    recorder.end()
}

/// Records into a primary command buffer.
pub(crate) struct DeviceRecorder<'d> {
    device: &'d ash::Device,
    cmd: vk::CommandBuffer,
}

impl ComputeRecorder for DeviceRecorder<'_> {
    fn begin(&mut self, usage: vk::CommandBufferUsageFlags) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default().flags(usage);
        unsafe { self.device.begin_command_buffer(self.cmd, &begin_info) }
            .map_err(ComputeError::CommandRecording)
    }

    fn bind_pipeline(&mut self, pipeline: vk::Pipeline) {
        unsafe {
            self.device
                .cmd_bind_pipeline(self.cmd, vk::PipelineBindPoint::COMPUTE, pipeline);
        }
    }

    fn bind_descriptor_sets(
        &mut self,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                self.cmd,
                vk::PipelineBindPoint::COMPUTE,
                layout,
                first_set,
                sets,
                &[],
            );
        }
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        unsafe { self.device.cmd_dispatch(self.cmd, x, y, z) };
    }

    fn end(&mut self) -> Result<()> {
        unsafe { self.device.end_command_buffer(self.cmd) }
            .map_err(ComputeError::CommandRecording)
    }
}

/// A command pool with one primary command buffer, recorded once.
///
/// The command buffer is freed together with the pool.
pub struct CommandQueue<'a> {
    buffer: vk::CommandBuffer,
    pool: Owned<'a, vk::CommandPool>,
    size: DispatchSize,
    _pipeline: PhantomData<&'a Pipeline<'a>>,
}

impl<'a> CommandQueue<'a> {
    /// Allocate a command buffer and record a dispatch of `pipeline` into it.
    pub fn new(
        context: &'a Context,
        pipeline: &'a Pipeline<'_>,
        usage: vk::CommandBufferUsageFlags,
        groups: impl Into<DispatchSize>,
    ) -> Result<Self> {
        let size = groups.into();
        let device = context.device();

        let pool = unsafe {
            let create_info = vk::CommandPoolCreateInfo::default()
                .queue_family_index(context.queue_family_index());
            let raw = device
                .create_command_pool(&create_info, None)
                .map_err(ComputeError::CommandRecording)?;
            Owned::new(device, raw)
        };

        let buffer = unsafe {
            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(pool.raw())
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            device
                .allocate_command_buffers(&alloc_info)
                .map_err(ComputeError::CommandRecording)?[0]
        };

        let plan = DispatchPlan::for_pipeline(pipeline, usage, size);
        record_dispatch(&mut DeviceRecorder { device, cmd: buffer }, &plan)?;

        tracing::debug!(
            "Recorded dispatch ({}, {}, {}) on queue family {}",
            size.x,
            size.y,
            size.z,
            context.queue_family_index()
        );

        Ok(Self {
            buffer,
            pool,
            size,
            _pipeline: PhantomData,
        })
    }

    /// The recorded primary command buffer.
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.buffer
    }

    /// Command pool owning the command buffer.
    pub fn pool(&self) -> vk::CommandPool {
        self.pool.raw()
    }

    /// Workgroup counts that were recorded.
    pub fn dispatch_size(&self) -> DispatchSize {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[derive(Debug, PartialEq)]
    enum Call {
        Begin(vk::CommandBufferUsageFlags),
        BindPipeline(vk::Pipeline),
        BindSets(vk::PipelineLayout, u32, Vec<vk::DescriptorSet>),
        Dispatch(u32, u32, u32),
        End,
    }

    #[derive(Default)]
    struct Log {
        calls: Vec<Call>,
        fail_begin: bool,
    }

    impl ComputeRecorder for Log {
        fn begin(&mut self, usage: vk::CommandBufferUsageFlags) -> Result<()> {
            if self.fail_begin {
                return Err(ComputeError::CommandRecording(
                    vk::Result::ERROR_OUT_OF_HOST_MEMORY,
                ));
            }
            self.calls.push(Call::Begin(usage));
            Ok(())
        }

        fn bind_pipeline(&mut self, pipeline: vk::Pipeline) {
            self.calls.push(Call::BindPipeline(pipeline));
        }

        fn bind_descriptor_sets(
            &mut self,
            layout: vk::PipelineLayout,
            first_set: u32,
            sets: &[vk::DescriptorSet],
        ) {
            self.calls
                .push(Call::BindSets(layout, first_set, sets.to_vec()));
        }

        fn dispatch(&mut self, x: u32, y: u32, z: u32) {
            self.calls.push(Call::Dispatch(x, y, z));
        }

        fn end(&mut self) -> Result<()> {
            self.calls.push(Call::End);
            Ok(())
        }
    }

    fn plan(size: impl Into<DispatchSize>) -> DispatchPlan {
        DispatchPlan {
            pipeline: vk::Pipeline::from_raw(1),
            layout: vk::PipelineLayout::from_raw(2),
            descriptor_set: vk::DescriptorSet::from_raw(3),
            usage: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            size: size.into(),
        }
    }

    #[test]
    fn records_in_order() {
        let mut log = Log::default();
        record_dispatch(&mut log, &plan(DispatchSize::x(4))).unwrap();

        assert_eq!(
            log.calls,
            vec![
                Call::Begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                Call::BindPipeline(vk::Pipeline::from_raw(1)),
                Call::BindSets(
                    vk::PipelineLayout::from_raw(2),
                    0,
                    vec![vk::DescriptorSet::from_raw(3)]
                ),
                Call::Dispatch(4, 1, 1),
                Call::End,
            ]
        );
    }

    #[test]
    fn three_dimensional_groups_are_passed_through() {
        let mut log = Log::default();
        record_dispatch(&mut log, &plan((8, 4, 2))).unwrap();
        assert!(log.calls.contains(&Call::Dispatch(8, 4, 2)));
    }

    #[test]
    fn failed_begin_records_nothing() {
        let mut log = Log {
            fail_begin: true,
            ..Log::default()
        };
        let result = record_dispatch(&mut log, &plan(1));
        assert!(matches!(result, Err(ComputeError::CommandRecording(_))));
        assert!(log.calls.is_empty());
    }

    #[test]
    fn dispatch_size_conversions() {
        assert_eq!(DispatchSize::from(4), DispatchSize::new(4, 1, 1));
        assert_eq!(DispatchSize::x(1), DispatchSize::from((1, 1, 1)));
        assert_eq!(DispatchSize::from((2, 3, 5)).z, 5);
    }
}
