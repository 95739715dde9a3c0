//! Queue submission and fence waits.

use crate::command::CommandQueue;
use crate::context::Context;
use crate::error::{ComputeError, Result};
use crate::handle::Owned;
use ash::vk;
use std::cell::Cell;
use std::time::Duration;

/// State of a submission's fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    /// The submitted work has finished.
    Signaled,
    /// The work is still running.
    Pending,
}

impl FenceStatus {
    /// Whether the submitted work has finished.
    pub fn is_signaled(self) -> bool {
        self == Self::Signaled
    }
}

/// Create an unsignaled fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device) -> Result<vk::Fence> {
    let create_info = vk::FenceCreateInfo::default();
    device
        .create_fence(&create_info, None)
        .map_err(ComputeError::Submission)
}

/// Wait up to `timeout_ns` for `fence`.
///
/// # Safety
/// The device and fence must be valid.
pub unsafe fn wait_for_fence(
    device: &ash::Device,
    fence: vk::Fence,
    timeout_ns: u64,
) -> Result<FenceStatus> {
    fence_status(device.wait_for_fences(&[fence], true, timeout_ns))
}

fn fence_status(result: ash::prelude::VkResult<()>) -> Result<FenceStatus> {
    match result {
        Ok(()) => Ok(FenceStatus::Signaled),
        Err(vk::Result::TIMEOUT) => Ok(FenceStatus::Pending),
        Err(e) => Err(ComputeError::Submission(e)),
    }
}

fn timeout_ns(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}

/// One submission of a recorded [`CommandQueue`] with its own fence.
pub struct Submission<'a> {
    fence: Owned<'a, vk::Fence>,
    queue: &'a CommandQueue<'a>,
    signaled: Cell<bool>,
}

impl<'a> Submission<'a> {
    /// Submit the command buffer to queue 0 of the context's queue family.
    pub fn submit(context: &'a Context, queue: &'a CommandQueue<'a>) -> Result<Self> {
        let device = context.device();
        let fence = unsafe { Owned::new(device, create_fence(device)?) };

        let command_buffers = [queue.command_buffer()];
        let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
        unsafe {
            device
                .queue_submit(context.queue(0), &[submit_info], fence.raw())
                .map_err(ComputeError::Submission)?;
        }

        tracing::debug!("Submitted command buffer {:?}", queue.command_buffer());

        Ok(Self {
            fence,
            queue,
            signaled: Cell::new(false),
        })
    }

    /// Check the fence without blocking.
    pub fn poll(&self) -> Result<FenceStatus> {
        let signaled = unsafe { self.fence.device().get_fence_status(self.fence.raw()) }
            .map_err(ComputeError::Submission)?;
        let status = if signaled {
            FenceStatus::Signaled
        } else {
            FenceStatus::Pending
        };
        Ok(self.record(status))
    }

    /// Block up to `timeout`. A timeout is reported as [`FenceStatus::Pending`].
    pub fn wait(&self, timeout: Duration) -> Result<FenceStatus> {
        let status =
            unsafe { wait_for_fence(self.fence.device(), self.fence.raw(), timeout_ns(timeout)) }?;
        if status == FenceStatus::Pending {
            tracing::debug!("Fence wait timed out after {timeout:?}");
        }
        Ok(self.record(status))
    }

    /// The queue this submission executes.
    pub fn command_queue(&self) -> &'a CommandQueue<'a> {
        self.queue
    }

    /// Fence signaled when the work finishes.
    pub fn fence(&self) -> vk::Fence {
        self.fence.raw()
    }

    fn record(&self, status: FenceStatus) -> FenceStatus {
        if status.is_signaled() {
            self.signaled.set(true);
        }
        status
    }
}

impl Drop for Submission<'_> {
    fn drop(&mut self) {
        if !self.signaled.get() {
            // The fence cannot be destroyed while the queue still owns it.
            let waited =
                unsafe { wait_for_fence(self.fence.device(), self.fence.raw(), u64::MAX) };
            if let Err(e) = waited {
                tracing::warn!("Fence wait on drop failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_pending_not_an_error() {
        assert_eq!(
            fence_status(Err(vk::Result::TIMEOUT)).unwrap(),
            FenceStatus::Pending
        );
        assert_eq!(fence_status(Ok(())).unwrap(), FenceStatus::Signaled);
    }

    #[test]
    fn device_loss_is_a_submission_error() {
        assert!(matches!(
            fence_status(Err(vk::Result::ERROR_DEVICE_LOST)),
            Err(ComputeError::Submission(vk::Result::ERROR_DEVICE_LOST))
        ));
    }

    #[test]
    fn long_timeouts_saturate() {
        assert_eq!(timeout_ns(Duration::from_millis(5)), 5_000_000);
        assert_eq!(timeout_ns(Duration::MAX), u64::MAX);
    }
}
