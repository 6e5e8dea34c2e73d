//! Staging Manager (spec §4.4): queues `cpu -> tempBuffer -> gpuResource`
//! copies, parallelizes the host-side `memcpy`s across a thread pool, and
//! records the GPU-side copy plus release-ownership barrier. Grounded on the
//! teacher's `vulkan_buffer_functions.rs` staging-buffer creation, with the
//! host-copy parallelism borrowed from the fan-out-worker-pool pattern
//! `wgpu` uses its `rayon` dependency for.

use crate::{
  config::{DeviceProperties, STAGING_HOST_COPY_BATCH_SIZE},
  core::{
    allocator::{Allocator, MemoryType},
    resource_view::ResourceView,
  },
  error::RenderCoreResult,
};
use ash::{vk, Device};
use std::sync::Arc;

/// Destination description for an enqueued buffer copy: where in GPU memory
/// the staged bytes land, and which queue family will consume them.
#[derive(Copy, Clone)]
pub struct BufferCopyDestination {
  pub dst_buffer: vk::Buffer,
  pub dst_offset: vk::DeviceSize,
  pub dst_family: u32,
  pub dst_access: vk::AccessFlags,
  pub dst_stage: vk::PipelineStageFlags,
}

#[derive(Copy, Clone)]
pub struct TextureCopyDestination {
  pub dst_image: vk::Image,
  pub mip_level: u32,
  pub image_extent: vk::Extent3D,
  pub dst_family: u32,
  pub dst_access: vk::AccessFlags,
  pub dst_stage: vk::PipelineStageFlags,
}

/// One queued buffer upload: the temp staging buffer is created at enqueue
/// time, per spec ("For each queued item a temporary CPU-coherent buffer is
/// created at enqueue time").
struct QueuedBufferCopy {
  src_ptr: *const u8,
  size: vk::DeviceSize,
  temp_buffer: ResourceView,
  dst: BufferCopyDestination,
}

struct QueuedTextureCopy {
  src_ptr: *const u8,
  size: vk::DeviceSize,
  temp_buffer: ResourceView,
  dst: TextureCopyDestination,
}

// Source pointers are only read inside `run_host_copies`, which the caller
// guarantees happens-before the host buffer backing them is reused -- the
// spec's "Shared Buffers are CPU-mutated only during the window between
// WaitForCurrentBackBuffer and the graphics submission" rule bounds that
// window to a single frame.
unsafe impl Send for QueuedBufferCopy {}
unsafe impl Send for QueuedTextureCopy {}

/// Queues host->device copies, parallelizes the host-side memcpy across a
/// thread pool, and records the GPU-side copy and queue-family release.
pub struct StagingManager {
  device: Arc<Device>,
  thread_pool: Arc<rayon::ThreadPool>,
  buffer_queue: Vec<QueuedBufferCopy>,
  texture_queue: Vec<QueuedTextureCopy>,
  /// Temp buffers from the most recent flush, retired once the transfer
  /// semaphore for that frame has signaled (see `render_engine`'s
  /// frame-retired queue).
  retiring_temp_buffers: Vec<ResourceView>,
  /// Entries awaiting an acquire barrier on their destination queue,
  /// populated by `release_ownership` and drained by `acquire_ownership`.
  pending_acquires: Vec<(u32, vk::AccessFlags, vk::PipelineStageFlags, AcquireTarget)>,
  heap_index: usize,
}

enum AcquireTarget {
  Buffer(vk::Buffer, vk::DeviceSize),
  Image(vk::Image),
}

impl StagingManager {
  pub fn new(device: Arc<Device>, thread_pool: Arc<rayon::ThreadPool>, heap_index: usize) -> Self {
    Self {
      device,
      thread_pool,
      buffer_queue: Vec::new(),
      texture_queue: Vec::new(),
      retiring_temp_buffers: Vec::new(),
      pending_acquires: Vec::new(),
      heap_index,
    }
  }

  /// Enqueues a host-to-GPU-buffer copy, creating the temp staging buffer
  /// immediately. `src` must remain valid until the next
  /// `copy_and_clear_queued_buffers` call.
  pub fn enqueue_buffer_copy(
    &mut self, allocator: &mut Allocator, device_properties: &DeviceProperties, src: &[u8],
    dst: BufferCopyDestination,
  ) -> RenderCoreResult<()> {
    let temp_buffer = ResourceView::create_buffer(
      self.device.clone(),
      allocator,
      src.len() as vk::DeviceSize,
      vk::BufferUsageFlags::TRANSFER_SRC,
      MemoryType::HostCoherent,
      self.heap_index,
      device_properties,
    )?;
    self.buffer_queue.push(QueuedBufferCopy {
      src_ptr: src.as_ptr(),
      size: src.len() as vk::DeviceSize,
      temp_buffer,
      dst,
    });
    Ok(())
  }

  /// Enqueues a host-to-texture copy; same contract as
  /// [`Self::enqueue_buffer_copy`].
  pub fn enqueue_texture_copy(
    &mut self, allocator: &mut Allocator, device_properties: &DeviceProperties, src: &[u8],
    dst: TextureCopyDestination,
  ) -> RenderCoreResult<()> {
    let temp_buffer = ResourceView::create_buffer(
      self.device.clone(),
      allocator,
      src.len() as vk::DeviceSize,
      vk::BufferUsageFlags::TRANSFER_SRC,
      MemoryType::HostCoherent,
      self.heap_index,
      device_properties,
    )?;
    self.texture_queue.push(QueuedTextureCopy {
      src_ptr: src.as_ptr(),
      size: src.len() as vk::DeviceSize,
      temp_buffer,
      dst,
    });
    Ok(())
  }

  pub fn has_queued_work(&self) -> bool {
    !self.buffer_queue.is_empty() || !self.texture_queue.is_empty()
  }

  /// Step 1 (host copy, parallelized) + step 2 (GPU copy) + queue clear, in
  /// that order. For images a barrier `Undefined -> TransferDst` is inserted
  /// before the copy (`ResourceView::record_copy` does this on first use).
  pub fn copy_and_clear_queued_buffers(&mut self, transfer_cmd: vk::CommandBuffer) {
    self.run_host_copies();

    for entry in self.buffer_queue.drain(..) {
      let region = vk::BufferCopy::builder()
        .dst_offset(entry.dst.dst_offset)
        .size(entry.size)
        .build();
      unsafe {
        self
          .device
          .cmd_copy_buffer(transfer_cmd, entry.temp_buffer.buffer(), entry.dst.dst_buffer, &[region]);
      }
      self.pending_acquires.push((
        entry.dst.dst_family,
        entry.dst.dst_access,
        entry.dst.dst_stage,
        AcquireTarget::Buffer(entry.dst.dst_buffer, entry.size),
      ));
      self.retiring_temp_buffers.push(entry.temp_buffer);
    }

    for mut entry in self.texture_queue.drain(..) {
      let temp_buffer_handle = entry.temp_buffer.buffer();
      entry.temp_buffer.record_copy(
        &self.device,
        transfer_cmd,
        temp_buffer_handle,
        0,
        entry.size,
        0,
        Some((entry.dst.image_extent, entry.dst.mip_level)),
      );
      self.pending_acquires.push((
        entry.dst.dst_family,
        entry.dst.dst_access,
        entry.dst.dst_stage,
        AcquireTarget::Image(entry.dst.dst_image),
      ));
      self.retiring_temp_buffers.push(entry.temp_buffer);
    }
  }

  fn run_host_copies(&self) {
    let buffer_batch_len = batch_len::<QueuedBufferCopy>();
    let texture_batch_len = batch_len::<QueuedTextureCopy>();
    self.thread_pool.scope(|scope| {
      for batch in self.buffer_queue.chunks(buffer_batch_len) {
        scope.spawn(move |_| {
          for entry in batch {
            copy_entry(entry.src_ptr, &entry.temp_buffer, entry.size);
          }
        });
      }
      for batch in self.texture_queue.chunks(texture_batch_len) {
        scope.spawn(move |_| {
          for entry in batch {
            copy_entry(entry.src_ptr, &entry.temp_buffer, entry.size);
          }
        });
      }
    });
  }

  /// Emits a queue-family release barrier on `transfer_cmd` for every entry
  /// whose destination family differs from `transfer_family`.
  pub fn release_ownership(&self, transfer_cmd: vk::CommandBuffer, transfer_family: u32) {
    for (dst_family, dst_access, dst_stage, target) in &self.pending_acquires {
      if *dst_family == transfer_family {
        continue;
      }
      let barrier_stage = vk::PipelineStageFlags::TRANSFER;
      match target {
        AcquireTarget::Buffer(buffer, size) => {
          let barrier = vk::BufferMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::empty())
            .src_queue_family_index(transfer_family)
            .dst_queue_family_index(*dst_family)
            .buffer(*buffer)
            .size(*size)
            .build();
          unsafe {
            self.device.cmd_pipeline_barrier(
              transfer_cmd,
              barrier_stage,
              *dst_stage,
              vk::DependencyFlags::empty(),
              &[],
              &[barrier],
              &[],
            );
          }
        }
        AcquireTarget::Image(image) => {
          let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .src_queue_family_index(transfer_family)
            .dst_queue_family_index(*dst_family)
            .image(*image)
            .subresource_range(
              vk::ImageSubresourceRange::builder()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .level_count(vk::REMAINING_MIP_LEVELS)
                .layer_count(vk::REMAINING_ARRAY_LAYERS)
                .build(),
            )
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(*dst_access)
            .build();
          unsafe {
            self.device.cmd_pipeline_barrier(
              transfer_cmd,
              barrier_stage,
              *dst_stage,
              vk::DependencyFlags::empty(),
              &[],
              &[],
              &[barrier],
            );
          }
        }
      }
    }
  }

  /// Emits the matching acquire barrier on `dst_cmd` for every entry whose
  /// destination family equals `dst_family` and differs from
  /// `transfer_family`, then erases the entry. Matches release/acquire pairs
  /// by `{src_family, dst_family}` per the queue-ownership round-trip
  /// invariant.
  pub fn acquire_ownership(&mut self, dst_cmd: vk::CommandBuffer, dst_family: u32, transfer_family: u32) {
    let mut remaining = Vec::new();
    for (family, dst_access, dst_stage, target) in self.pending_acquires.drain(..) {
      if family != dst_family || dst_family == transfer_family {
        remaining.push((family, dst_access, dst_stage, target));
        continue;
      }
      match &target {
        AcquireTarget::Buffer(buffer, size) => {
          let barrier = vk::BufferMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(dst_access)
            .src_queue_family_index(transfer_family)
            .dst_queue_family_index(dst_family)
            .buffer(*buffer)
            .size(*size)
            .build();
          unsafe {
            self.device.cmd_pipeline_barrier(
              dst_cmd,
              vk::PipelineStageFlags::TOP_OF_PIPE,
              dst_stage,
              vk::DependencyFlags::empty(),
              &[],
              &[barrier],
              &[],
            );
          }
        }
        AcquireTarget::Image(image) => {
          let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .src_queue_family_index(transfer_family)
            .dst_queue_family_index(dst_family)
            .image(*image)
            .subresource_range(
              vk::ImageSubresourceRange::builder()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .level_count(vk::REMAINING_MIP_LEVELS)
                .layer_count(vk::REMAINING_ARRAY_LAYERS)
                .build(),
            )
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(dst_access)
            .build();
          unsafe {
            self.device.cmd_pipeline_barrier(
              dst_cmd,
              vk::PipelineStageFlags::TOP_OF_PIPE,
              dst_stage,
              vk::DependencyFlags::empty(),
              &[],
              &[],
              &[barrier],
            );
          }
        }
      }
    }
    self.pending_acquires = remaining;
  }

  /// Drops temp buffers retained since the last flush. Must only be called
  /// after the transfer semaphore for the frame that submitted them has
  /// signaled -- callers route this through the render engine's
  /// frame-retired queue rather than calling it eagerly (§9 Design Notes).
  pub fn clean_up_temp_buffers(&mut self, allocator: &mut Allocator) {
    for temp_buffer in self.retiring_temp_buffers.drain(..) {
      temp_buffer.clean_up(allocator);
    }
  }

  /// Full teardown: drops every temp buffer this manager still owns,
  /// whether already flushed to the retiring queue or still sitting
  /// unflushed in one of the two copy queues. Callers must have already
  /// waited for the GPU to finish (engine `Drop`).
  pub fn clean_up(mut self, allocator: &mut Allocator) {
    self.clean_up_temp_buffers(allocator);
    for entry in self.buffer_queue.drain(..) {
      entry.temp_buffer.clean_up(allocator);
    }
    for entry in self.texture_queue.drain(..) {
      entry.temp_buffer.clean_up(allocator);
    }
  }
}

fn copy_entry(src_ptr: *const u8, temp_buffer: &ResourceView, size: vk::DeviceSize) {
  if let Some(dst_ptr) = temp_buffer.mapped_ptr() {
    unsafe { std::ptr::copy_nonoverlapping(src_ptr, dst_ptr, size as usize) };
  }
}

fn batch_len<T>() -> usize {
  let elem_size = std::mem::size_of::<T>().max(1);
  ((STAGING_HOST_COPY_BATCH_SIZE as usize) / elem_size).max(1)
}
