//! Resource Views (spec §4.2): thin RAII wrappers around `VkBuffer`/`VkImage`
//! plus the memory binding, copy-recording, and queue-ownership-transfer
//! operations layered on top of the [allocator](super::allocator).

use crate::{
  config::DeviceProperties,
  core::allocator::{Allocation, Allocator, MemoryType},
  error::RenderCoreResult,
};
use ash::{vk, Device};
use std::sync::Arc;

/// Which underlying Vulkan object a [`ResourceView`] owns.
pub enum ResourceHandle {
  Buffer(vk::Buffer),
  Image { image: vk::Image, current_layout: vk::ImageLayout },
}

/// A buffer or image plus the memory it is bound to. Exclusively owns its
/// Vulkan handle(s); holds a non-owning reference to the [`Allocator`] (the
/// spec's ownership rule: "Resource Views exclusively own their Vulkan
/// handles and hold a non-owning reference to the Allocator").
pub struct ResourceView {
  device: Arc<Device>,
  handle: ResourceHandle,
  allocation: Allocation,
  memory_type: MemoryType,
  /// Pipeline stage the last operation that touched this resource executed
  /// at; consulted by the render-pass manager to fill in the src-stage of
  /// the first barrier each frame (spec §4.11).
  pub current_pipeline_stage: vk::PipelineStageFlags,
}

impl ResourceView {
  /// Creates a buffer resource and binds it to a fresh allocation.
  pub fn create_buffer(
    device: Arc<Device>, allocator: &mut Allocator, size: vk::DeviceSize,
    usage: vk::BufferUsageFlags, memory_type: MemoryType, heap_index: usize,
    device_properties: &DeviceProperties,
  ) -> RenderCoreResult<Self> {
    let buffer_ci = vk::BufferCreateInfo::builder()
      .size(size)
      .usage(usage)
      .sharing_mode(vk::SharingMode::EXCLUSIVE)
      .build();
    let buffer = unsafe { device.create_buffer(&buffer_ci, None)? };
    let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
    let alignment = requirements.alignment.max(device_properties.align_for_usage(1, usage));
    let allocation = allocator.allocate(requirements.size, alignment, memory_type, heap_index)?;

    unsafe {
      device.bind_buffer_memory(buffer, allocation.memory, allocation.offset)?;
    }

    Ok(Self {
      device,
      handle: ResourceHandle::Buffer(buffer),
      allocation,
      memory_type,
      current_pipeline_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
    })
  }

  /// Creates a 2D image resource and binds it to a fresh allocation. Images
  /// always start `UNDEFINED`; the first [`Self::record_copy`] transitions
  /// them to `TRANSFER_DST_OPTIMAL`.
  pub fn create_image(
    device: Arc<Device>, allocator: &mut Allocator, extent: vk::Extent3D, format: vk::Format,
    usage: vk::ImageUsageFlags, mip_levels: u32, heap_index: usize,
  ) -> RenderCoreResult<Self> {
    let image_ci = vk::ImageCreateInfo::builder()
      .image_type(vk::ImageType::TYPE_2D)
      .format(format)
      .extent(extent)
      .mip_levels(mip_levels)
      .array_layers(1)
      .samples(vk::SampleCountFlags::TYPE_1)
      .tiling(vk::ImageTiling::OPTIMAL)
      .usage(usage)
      .sharing_mode(vk::SharingMode::EXCLUSIVE)
      .initial_layout(vk::ImageLayout::UNDEFINED)
      .build();
    let image = unsafe { device.create_image(&image_ci, None)? };
    let requirements = unsafe { device.get_image_memory_requirements(image) };
    let allocation =
      allocator.allocate(requirements.size, requirements.alignment, MemoryType::GpuOnly, heap_index)?;

    unsafe {
      device.bind_image_memory(image, allocation.memory, allocation.offset)?;
    }

    Ok(Self {
      device,
      handle: ResourceHandle::Image {
        image,
        current_layout: vk::ImageLayout::UNDEFINED,
      },
      allocation,
      memory_type: MemoryType::GpuOnly,
      current_pipeline_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
    })
  }

  pub fn buffer(&self) -> vk::Buffer {
    match self.handle {
      ResourceHandle::Buffer(b) => b,
      ResourceHandle::Image { .. } => panic!("resource view does not hold a buffer"),
    }
  }

  pub fn image(&self) -> vk::Image {
    match self.handle {
      ResourceHandle::Image { image, .. } => image,
      ResourceHandle::Buffer(_) => panic!("resource view does not hold an image"),
    }
  }

  /// Pointer to the start of this resource's bound memory, valid only for
  /// `MemoryType::HostCoherent` resources in a persistently mapped block.
  pub fn mapped_ptr(&self) -> Option<*mut u8> {
    self
      .allocation
      .mapped_ptr
      .map(|base| unsafe { base.add(self.allocation.offset as usize) })
  }

  pub fn size(&self) -> vk::DeviceSize {
    self.allocation.size
  }

  /// Records a copy from `src` (a staging buffer) into this resource. For
  /// images this also performs the first-use `Undefined -> TransferDst`
  /// layout transition.
  pub fn record_copy(
    &mut self, device: &Device, cmd: vk::CommandBuffer, src: vk::Buffer, src_offset: vk::DeviceSize,
    size: vk::DeviceSize, dst_offset: vk::DeviceSize, image_extent: Option<(vk::Extent3D, u32)>,
  ) {
    match &mut self.handle {
      ResourceHandle::Buffer(dst) => {
        let region = vk::BufferCopy::builder()
          .src_offset(src_offset)
          .dst_offset(dst_offset)
          .size(size)
          .build();
        unsafe { device.cmd_copy_buffer(cmd, src, *dst, &[region]) };
      }
      ResourceHandle::Image { image, current_layout } => {
        let (extent, mip_level) = image_extent.expect("image copy requires extent/mip info");
        if *current_layout == vk::ImageLayout::UNDEFINED {
          record_image_barrier(
            device,
            cmd,
            *image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
            None,
          );
          *current_layout = vk::ImageLayout::TRANSFER_DST_OPTIMAL;
        }
        let region = vk::BufferImageCopy::builder()
          .buffer_offset(src_offset)
          .image_subresource(
            vk::ImageSubresourceLayers::builder()
              .aspect_mask(vk::ImageAspectFlags::COLOR)
              .mip_level(mip_level)
              .layer_count(1)
              .build(),
          )
          .image_extent(extent)
          .build();
        unsafe {
          device.cmd_copy_buffer_to_image(cmd, src, *image, *current_layout, &[region]);
        }
      }
    }
    self.current_pipeline_stage = vk::PipelineStageFlags::TRANSFER;
  }

  /// Records a queue-family release barrier on `cmd`, recorded on the
  /// transfer command buffer.
  pub fn release_ownership(
    &self, device: &Device, cmd: vk::CommandBuffer, src_family: u32, dst_family: u32,
    src_access: vk::AccessFlags, src_stage: vk::PipelineStageFlags,
  ) {
    self.record_ownership_barrier(
      device,
      cmd,
      src_family,
      dst_family,
      src_access,
      vk::AccessFlags::empty(),
      src_stage,
      vk::PipelineStageFlags::BOTTOM_OF_PIPE,
    );
  }

  /// Records the matching queue-family acquire barrier on the destination
  /// queue's command buffer.
  pub fn acquire_ownership(
    &self, device: &Device, cmd: vk::CommandBuffer, src_family: u32, dst_family: u32,
    dst_access: vk::AccessFlags, dst_stage: vk::PipelineStageFlags,
  ) {
    self.record_ownership_barrier(
      device,
      cmd,
      src_family,
      dst_family,
      vk::AccessFlags::empty(),
      dst_access,
      vk::PipelineStageFlags::TOP_OF_PIPE,
      dst_stage,
    );
  }

  fn record_ownership_barrier(
    &self, device: &Device, cmd: vk::CommandBuffer, src_family: u32, dst_family: u32,
    src_access: vk::AccessFlags, dst_access: vk::AccessFlags, src_stage: vk::PipelineStageFlags,
    dst_stage: vk::PipelineStageFlags,
  ) {
    match &self.handle {
      ResourceHandle::Buffer(buffer) => {
        let barrier = vk::BufferMemoryBarrier::builder()
          .src_access_mask(src_access)
          .dst_access_mask(dst_access)
          .src_queue_family_index(src_family)
          .dst_queue_family_index(dst_family)
          .buffer(*buffer)
          .offset(0)
          .size(self.allocation.size)
          .build();
        unsafe {
          device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[barrier],
            &[],
          );
        }
      }
      ResourceHandle::Image { image, current_layout } => {
        record_image_barrier(
          device,
          cmd,
          *image,
          *current_layout,
          *current_layout,
          src_access,
          dst_access,
          src_stage,
          dst_stage,
          Some((src_family, dst_family)),
        );
      }
    }
  }

  /// Destroys the Vulkan handle and returns the backing memory to the
  /// allocator. Must not be called while the GPU may still be reading this
  /// resource -- callers retire through the render engine's frame-retired
  /// queue to guarantee that.
  pub fn clean_up(self, allocator: &mut Allocator) {
    unsafe {
      match self.handle {
        ResourceHandle::Buffer(b) => self.device.destroy_buffer(b, None),
        ResourceHandle::Image { image, .. } => self.device.destroy_image(image, None),
      }
    }
    allocator.deallocate(
      self.allocation.memory_id,
      self.allocation.offset,
      self.allocation.size,
      self.memory_type,
    );
  }
}

#[allow(clippy::too_many_arguments)]
fn record_image_barrier(
  device: &Device, cmd: vk::CommandBuffer, image: vk::Image, old_layout: vk::ImageLayout,
  new_layout: vk::ImageLayout, src_access: vk::AccessFlags, dst_access: vk::AccessFlags,
  src_stage: vk::PipelineStageFlags, dst_stage: vk::PipelineStageFlags,
  family_transfer: Option<(u32, u32)>,
) {
  let (src_family, dst_family) = family_transfer.unwrap_or((vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED));
  let barrier = vk::ImageMemoryBarrier::builder()
    .old_layout(old_layout)
    .new_layout(new_layout)
    .src_queue_family_index(src_family)
    .dst_queue_family_index(dst_family)
    .image(image)
    .subresource_range(
      vk::ImageSubresourceRange::builder()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .level_count(vk::REMAINING_MIP_LEVELS)
        .layer_count(vk::REMAINING_ARRAY_LAYERS)
        .build(),
    )
    .src_access_mask(src_access)
    .dst_access_mask(dst_access)
    .build();
  unsafe {
    device.cmd_pipeline_barrier(
      cmd,
      src_stage,
      dst_stage,
      vk::DependencyFlags::empty(),
      &[],
      &[],
      &[barrier],
    );
  }
}
