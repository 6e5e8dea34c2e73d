use ash::vk;
use std::{error::Error, fmt};

pub type RenderCoreResult<T> = Result<T, RenderCoreError>;

/// The error taxonomy of the render-orchestration core.
///
/// `OutOfMemory` and `UnsupportedDevice` are the only variants an embedder is
/// expected to recover from programmatically (by releasing resources and
/// retrying, or by reconfiguring device selection, respectively).
/// `DeviceLost` is fatal: the embedder must tear down and reconstruct the
/// renderer. `InvalidHandle` indicates a caller bug (operating on a bundle,
/// texture, or pipeline index that was never returned by this crate, or was
/// already removed).
#[derive(Debug)]
pub enum RenderCoreError {
  /// A host or device memory allocation could not be satisfied, either
  /// because the OS refused the request twice (full size, then remaining
  /// budget) or because doing so would exceed the heap budget reported by
  /// `VK_EXT_memory_budget`.
  OutOfMemory,
  /// A required device extension or feature was not enabled at device
  /// selection time (e.g. `VK_EXT_mesh_shader` missing for the mesh-shader
  /// model manager).
  UnsupportedDevice(&'static str),
  /// The swapchain backing a render pass went out of date; the caller should
  /// trigger a resize and skip the frame.
  SwapchainOutOfDate,
  /// The logical device was lost; the renderer must be reconstructed.
  DeviceLost,
  /// A bundle, texture, pipeline, or camera index was used that this crate
  /// never issued, or that has already been removed.
  InvalidHandle,
  /// A shared buffer extension could not proceed because a previous
  /// extension's grow-copy has not yet been flushed through a transfer
  /// submission.
  TempBufferBusy,
  /// Vulkan returned an error code not otherwise classified above.
  VulkanError(vk::Result),
}

impl From<vk::Result> for RenderCoreError {
  fn from(e: vk::Result) -> Self {
    match e {
      vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
        RenderCoreError::OutOfMemory
      }
      vk::Result::ERROR_DEVICE_LOST => RenderCoreError::DeviceLost,
      vk::Result::ERROR_OUT_OF_DATE_KHR => RenderCoreError::SwapchainOutOfDate,
      e => RenderCoreError::VulkanError(e),
    }
  }
}

impl fmt::Display for RenderCoreError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      RenderCoreError::OutOfMemory => write!(f, "out of memory for the requested allocation"),
      RenderCoreError::UnsupportedDevice(s) => {
        write!(f, "device does not support a required feature: {}", s)
      }
      RenderCoreError::SwapchainOutOfDate => write!(f, "swapchain is out of date, resize needed"),
      RenderCoreError::DeviceLost => write!(f, "device lost, renderer must be reconstructed"),
      RenderCoreError::InvalidHandle => {
        write!(f, "operation referenced a handle this crate did not issue")
      }
      RenderCoreError::TempBufferBusy => write!(
        f,
        "shared buffer already has a pending grow-copy awaiting a transfer submission"
      ),
      RenderCoreError::VulkanError(r) => write!(f, "vulkan error: {}", r),
    }
  }
}

impl Error for RenderCoreError {}
