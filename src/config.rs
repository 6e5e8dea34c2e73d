//! Configuration surface for the render-orchestration core.
//!
//! The core never enumerates devices or creates a swapchain -- that is the
//! embedder's job -- so this module only carries the knobs the core itself
//! consumes: how many frames may be in flight, the default memory-pool
//! budgets the allocator starts with, where to find compiled shaders, and a
//! handle to the thread pool the staging manager dispatches host copies onto.

use derive_builder::Builder;
use std::{path::PathBuf, sync::Arc};

/// Default size of a new GPU-local `DeviceMemory` block (§6 Constants).
pub const DEFAULT_GPU_BLOCK_SIZE: vk::DeviceSize = 2 * 1024 * 1024 * 1024;
/// Default size of a new host-coherent `DeviceMemory` block (§6 Constants).
pub const DEFAULT_CPU_BLOCK_SIZE: vk::DeviceSize = 100 * 1024 * 1024;
/// Staging manager host-copy batch size (§6 Constants).
pub const STAGING_HOST_COPY_BATCH_SIZE: vk::DeviceSize = 250 * 1024 * 1024;
/// Compute shader local-size for the frustum-culling pass (§6 Constants).
pub const CULLING_COMPUTE_BLOCK_SIZE: u32 = 64;
/// Task-shader invocations that cooperatively process one meshlet (§6).
pub const MESHLET_TASK_INVOCATIONS: u32 = 32;

use ash::vk;

/// Configuration for the render-orchestration core, built once at renderer
/// construction and not mutated afterwards (shader path aside, which may be
/// updated via `SetShaderPath` on the façade before the first pipeline is
/// compiled).
#[derive(Builder, Clone)]
#[builder(setter(into))]
pub struct RendererConfig {
  /// Number of in-flight frames (N in `PerFrameRing[N]`). Must be >= 2.
  #[builder(default = "2")]
  pub frame_count: u32,

  /// Initial size of a device-local memory block the allocator creates on
  /// first GPU allocation, and every time it must grow a pool.
  #[builder(default = "DEFAULT_GPU_BLOCK_SIZE")]
  pub initial_gpu_block_size: vk::DeviceSize,

  /// Initial size of a host-coherent memory block.
  #[builder(default = "DEFAULT_CPU_BLOCK_SIZE")]
  pub initial_cpu_block_size: vk::DeviceSize,

  /// Directory `.spv` shaders are loaded from, keyed by shader name.
  #[builder(default = "PathBuf::from(\"shaders\")")]
  pub shader_path: PathBuf,

  /// Thread pool the staging manager dispatches host-copy batches onto.
  /// Owned by the embedder so it may be shared with other subsystems.
  pub thread_pool: Arc<rayon::ThreadPool>,
}

impl RendererConfig {
  pub fn builder() -> RendererConfigBuilder {
    RendererConfigBuilder::default()
  }
}

/// Alignments and descriptor sizes queried once from the physical device at
/// construction time and threaded by reference everywhere they're needed,
/// replacing the source's module-wide mutable statics (§9 Design Notes).
#[derive(Clone, Copy, Debug)]
pub struct DeviceProperties {
  pub uniform_buffer_alignment: vk::DeviceSize,
  pub storage_buffer_alignment: vk::DeviceSize,
  /// Size in bytes of one descriptor of each `vk::DescriptorType` the engine
  /// uses, taken from `VkPhysicalDeviceDescriptorBufferPropertiesEXT`.
  pub uniform_buffer_descriptor_size: usize,
  pub storage_buffer_descriptor_size: usize,
  pub sampled_image_descriptor_size: usize,
  pub sampler_descriptor_size: usize,
  pub combined_image_sampler_descriptor_size: usize,
  /// Offset alignment required between descriptors inside a descriptor
  /// buffer.
  pub descriptor_buffer_offset_alignment: vk::DeviceSize,
}

impl DeviceProperties {
  /// Builds properties from the raw physical-device property structs. The
  /// embedder is responsible for chaining
  /// `VkPhysicalDeviceDescriptorBufferPropertiesEXT` onto
  /// `vkGetPhysicalDeviceProperties2` and passing the populated struct in
  /// (device enumeration/feature discovery is out of scope for this crate).
  pub fn new(
    device_properties: &vk::PhysicalDeviceProperties,
    descriptor_buffer_properties: &vk::PhysicalDeviceDescriptorBufferPropertiesEXT,
  ) -> Self {
    Self {
      uniform_buffer_alignment: device_properties.limits.min_uniform_buffer_offset_alignment,
      storage_buffer_alignment: device_properties.limits.min_storage_buffer_offset_alignment,
      uniform_buffer_descriptor_size: descriptor_buffer_properties.uniform_buffer_descriptor_size,
      storage_buffer_descriptor_size: descriptor_buffer_properties.storage_buffer_descriptor_size,
      sampled_image_descriptor_size: descriptor_buffer_properties.sampled_image_descriptor_size,
      sampler_descriptor_size: descriptor_buffer_properties.sampler_descriptor_size,
      combined_image_sampler_descriptor_size: descriptor_buffer_properties
        .combined_image_sampler_descriptor_size,
      descriptor_buffer_offset_alignment: descriptor_buffer_properties
        .descriptor_buffer_offset_alignment,
    }
  }

  /// Rounds `offset` up to the alignment required for sub-allocations backing
  /// `usage`.
  pub fn align_for_usage(&self, offset: vk::DeviceSize, usage: vk::BufferUsageFlags) -> vk::DeviceSize {
    let alignment = if usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER) {
      self.uniform_buffer_alignment
    } else if usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER) {
      self.storage_buffer_alignment
    } else {
      1
    };
    align_up(offset, alignment)
  }

  pub fn descriptor_size(&self, ty: vk::DescriptorType) -> usize {
    match ty {
      vk::DescriptorType::UNIFORM_BUFFER => self.uniform_buffer_descriptor_size,
      vk::DescriptorType::STORAGE_BUFFER => self.storage_buffer_descriptor_size,
      vk::DescriptorType::SAMPLED_IMAGE => self.sampled_image_descriptor_size,
      vk::DescriptorType::SAMPLER => self.sampler_descriptor_size,
      vk::DescriptorType::COMBINED_IMAGE_SAMPLER => self.combined_image_sampler_descriptor_size,
      _ => unreachable!("descriptor type not used by this engine: {:?}", ty),
    }
  }
}

/// Rounds `value` up to the next multiple of `alignment` (`alignment` must be
/// a power of two, which every Vulkan alignment limit is).
pub fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
  if alignment == 0 {
    return value;
  }
  (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn align_up_rounds_to_next_multiple() {
    assert_eq!(align_up(0, 256), 0);
    assert_eq!(align_up(1, 256), 256);
    assert_eq!(align_up(256, 256), 256);
    assert_eq!(align_up(257, 256), 512);
  }

  #[test]
  fn align_up_handles_zero_alignment() {
    assert_eq!(align_up(123, 0), 123);
  }
}
