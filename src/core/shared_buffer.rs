//! Shared Buffers (spec §4.3): growable buffers with free-list
//! sub-allocation. `SharedBufferGPU` grows by creating a bigger buffer and
//! enqueueing a grow-copy; `SharedBufferWriteOnly` grows by simply recreating
//! (callers always rewrite their contents before use, so old data need not
//! survive).

use crate::{
  core::{
    allocator::{Allocator, MemoryType},
    resource_view::ResourceView,
  },
  error::{RenderCoreError, RenderCoreResult},
};
use ash::{vk, Device};
use log::info;
use std::sync::Arc;

/// A sub-allocation inside a shared buffer: `{buffer-ref, offset, size}`.
/// Non-owning -- holds no reference back to the buffer it came from, matching
/// the spec's ownership rule that pipeline binders hold these as non-owning
/// references into Shared Buffers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SharedBufferData {
  pub offset: vk::DeviceSize,
  pub size: vk::DeviceSize,
}

impl SharedBufferData {
  pub fn end(&self) -> vk::DeviceSize {
    self.offset + self.size
  }
}

/// Free-list sub-allocator shared by both shared-buffer variants below.
#[derive(Default)]
struct FreeList {
  ranges: Vec<(vk::DeviceSize, vk::DeviceSize)>,
}

impl FreeList {
  fn new(total_size: vk::DeviceSize) -> Self {
    Self {
      ranges: vec![(0, total_size)],
    }
  }

  fn allocate(&mut self, size: vk::DeviceSize) -> Option<SharedBufferData> {
    for i in 0..self.ranges.len() {
      let (offset, range_size) = self.ranges[i];
      if range_size >= size {
        self.ranges.remove(i);
        if range_size > size {
          self.ranges.insert(i, (offset + size, range_size - size));
        }
        return Some(SharedBufferData { offset, size });
      }
    }
    None
  }

  fn relinquish(&mut self, data: SharedBufferData) {
    let pos = self
      .ranges
      .binary_search_by_key(&data.offset, |&(o, _)| o)
      .unwrap_or_else(|e| e);
    self.ranges.insert(pos, (data.offset, data.size));
    if pos + 1 < self.ranges.len() {
      let (o, s) = self.ranges[pos];
      let (next_o, next_s) = self.ranges[pos + 1];
      if o + s == next_o {
        self.ranges[pos] = (o, s + next_s);
        self.ranges.remove(pos + 1);
      }
    }
    if pos > 0 {
      let (prev_o, prev_s) = self.ranges[pos - 1];
      let (o, s) = self.ranges[pos];
      if prev_o + prev_s == o {
        self.ranges[pos - 1] = (prev_o, prev_s + s);
        self.ranges.remove(pos);
      }
    }
  }

  /// Total addable space: the sum of free ranges beyond `live_end`, used by
  /// `SetupPipelineBuffers`'s search for "addable" capacity in preceding
  /// binders.
  fn addable_capacity_after(&self, live_end: vk::DeviceSize) -> vk::DeviceSize {
    self
      .ranges
      .iter()
      .filter(|&&(o, _)| o >= live_end)
      .map(|&(_, s)| s)
      .sum()
  }

  fn total_free(&self) -> vk::DeviceSize {
    self.ranges.iter().map(|&(_, s)| s).sum()
  }
}

/// A pending grow-copy recorded by [`SharedBufferGpu::extend`] and flushed by
/// the mesh manager/render engine's `CopyOldBuffers` once per frame.
pub struct PendingGrowCopy {
  pub old_buffer: vk::Buffer,
  pub old_size: vk::DeviceSize,
}

/// GPU-only shared buffer. Extension creates a new, larger buffer and defers
/// copying the old contents to a later transfer submission.
pub struct SharedBufferGpu {
  device: Arc<Device>,
  view: ResourceView,
  usage: vk::BufferUsageFlags,
  free_list: FreeList,
  /// Retained old buffer awaiting its grow-copy. `Some` means a second
  /// extension before the copy flushes must fail with `TempBufferBusy`.
  pending_copy: Option<(ResourceView, PendingGrowCopy)>,
  heap_index: usize,
}

impl SharedBufferGpu {
  pub fn new(
    device: Arc<Device>, allocator: &mut Allocator, initial_size: vk::DeviceSize,
    usage: vk::BufferUsageFlags, heap_index: usize,
    device_properties: &crate::config::DeviceProperties,
  ) -> RenderCoreResult<Self> {
    let usage = usage | vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC;
    let view = ResourceView::create_buffer(
      device.clone(),
      allocator,
      initial_size,
      usage,
      MemoryType::GpuOnly,
      heap_index,
      device_properties,
    )?;
    Ok(Self {
      device,
      view,
      usage,
      free_list: FreeList::new(initial_size),
      pending_copy: None,
      heap_index,
    })
  }

  pub fn buffer(&self) -> vk::Buffer {
    self.view.buffer()
  }

  pub fn size(&self) -> vk::DeviceSize {
    self.view.size()
  }

  /// Carves `size` bytes from the free list, extending the buffer first if
  /// no range fits.
  pub fn allocate_and_get_shared_data(
    &mut self, size: vk::DeviceSize, allocator: &mut Allocator,
    device_properties: &crate::config::DeviceProperties,
  ) -> RenderCoreResult<SharedBufferData> {
    if let Some(data) = self.free_list.allocate(size) {
      return Ok(data);
    }
    self.extend(size, allocator, device_properties)?;
    self
      .free_list
      .allocate(size)
      .ok_or(RenderCoreError::OutOfMemory)
  }

  /// Coalesces multiple pending allocations that would each require a grow
  /// into a single extension, per spec: "two allocations requiring two
  /// extensions in the same frame are coalesced".
  pub fn allocate_multiple(
    &mut self, sizes: &[vk::DeviceSize], allocator: &mut Allocator,
    device_properties: &crate::config::DeviceProperties,
  ) -> RenderCoreResult<Vec<SharedBufferData>> {
    let total: vk::DeviceSize = sizes.iter().sum();
    if self.free_list.total_free() < total && self.pending_copy.is_none() {
      self.extend(total, allocator, device_properties)?;
    }
    sizes
      .iter()
      .map(|&size| {
        self
          .free_list
          .allocate(size)
          .ok_or(RenderCoreError::OutOfMemory)
      })
      .collect()
  }

  fn extend(
    &mut self, additional: vk::DeviceSize, allocator: &mut Allocator,
    device_properties: &crate::config::DeviceProperties,
  ) -> RenderCoreResult<()> {
    if self.pending_copy.is_some() {
      return Err(RenderCoreError::TempBufferBusy);
    }

    let old_size = self.view.size();
    let new_size = old_size + additional;
    info!(
      "extending SharedBufferGpu from {} to {} bytes",
      old_size, new_size
    );
    let new_view = ResourceView::create_buffer(
      self.device.clone(),
      allocator,
      new_size,
      self.usage,
      MemoryType::GpuOnly,
      self.heap_index,
      device_properties,
    )?;

    let old_view = std::mem::replace(&mut self.view, new_view);
    let old_buffer = old_view.buffer();
    self.pending_copy = Some((old_view, PendingGrowCopy { old_buffer, old_size }));
    self.free_list.relinquish(SharedBufferData {
      offset: old_size,
      size: additional,
    });
    Ok(())
  }

  /// Records the deferred grow-copy, if any, onto a transfer command buffer
  /// and hands back the retained old buffer for the caller to push onto the
  /// frame-retired queue -- the GPU copy just recorded here has not executed
  /// yet, so the old buffer must outlive at least this frame's transfer
  /// submission (§9 Design Notes: temp/old buffers are retired via the
  /// frame-retired queue, never deleted eagerly). Must be called at most once
  /// per frame, before the transfer submission that must observe it.
  #[must_use]
  pub fn copy_old_buffer(&mut self, cmd: vk::CommandBuffer) -> Option<ResourceView> {
    let (old_view, pending) = self.pending_copy.take()?;
    let region = vk::BufferCopy::builder().size(pending.old_size).build();
    unsafe {
      self
        .device
        .cmd_copy_buffer(cmd, pending.old_buffer, self.view.buffer(), &[region]);
    }
    Some(old_view)
  }

  pub fn relinquish_memory(&mut self, data: SharedBufferData) {
    self.free_list.relinquish(data);
  }

  pub fn addable_capacity_after(&self, live_end: vk::DeviceSize) -> vk::DeviceSize {
    self.free_list.addable_capacity_after(live_end)
  }

  /// Destroys this buffer and any old buffer still awaiting its grow-copy.
  /// Callers must ensure the GPU is idle (or that both buffers have already
  /// been through the frame-retired queue) before calling this.
  pub fn clean_up(self, allocator: &mut Allocator) {
    if let Some((old_view, _)) = self.pending_copy {
      old_view.clean_up(allocator);
    }
    self.view.clean_up(allocator);
  }
}

/// Write-only shared buffer for a given memory type (CPU host-coherent by
/// construction, per spec, since the variant exists to back the CPU-visible
/// per-pipeline argument/model records). Extension recreates the buffer at
/// the new size without copying; callers must rewrite all live contents on
/// the next frame preparation.
pub struct SharedBufferWriteOnly {
  device: Arc<Device>,
  view: ResourceView,
  usage: vk::BufferUsageFlags,
  free_list: FreeList,
  heap_index: usize,
  memory_type: MemoryType,
  /// Debug-only rewrite counter: incremented by `mark_rewritten`, checked by
  /// tests to uphold the spec's documented caller obligation (§9 Design
  /// Notes open question) that every live range is rewritten after an
  /// extension, without the engine silently copying old bytes forward.
  #[cfg(debug_assertions)]
  rewritten_since_extend: bool,
}

impl SharedBufferWriteOnly {
  pub fn new(
    device: Arc<Device>, allocator: &mut Allocator, initial_size: vk::DeviceSize,
    usage: vk::BufferUsageFlags, memory_type: MemoryType, heap_index: usize,
    device_properties: &crate::config::DeviceProperties,
  ) -> RenderCoreResult<Self> {
    let usage = usage | vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC;
    let view = ResourceView::create_buffer(
      device.clone(),
      allocator,
      initial_size,
      usage,
      memory_type,
      heap_index,
      device_properties,
    )?;
    Ok(Self {
      device,
      view,
      usage,
      free_list: FreeList::new(initial_size),
      heap_index,
      memory_type,
      #[cfg(debug_assertions)]
      rewritten_since_extend: true,
    })
  }

  pub fn buffer(&self) -> vk::Buffer {
    self.view.buffer()
  }

  pub fn mapped_ptr(&self) -> Option<*mut u8> {
    self.view.mapped_ptr()
  }

  pub fn size(&self) -> vk::DeviceSize {
    self.view.size()
  }

  pub fn allocate_and_get_shared_data(
    &mut self, size: vk::DeviceSize, allocator: &mut Allocator,
    device_properties: &crate::config::DeviceProperties,
  ) -> RenderCoreResult<SharedBufferData> {
    if let Some(data) = self.free_list.allocate(size) {
      return Ok(data);
    }
    self.recreate(size, allocator, device_properties)?;
    self
      .free_list
      .allocate(size)
      .ok_or(RenderCoreError::OutOfMemory)
  }

  fn recreate(
    &mut self, additional: vk::DeviceSize, allocator: &mut Allocator,
    device_properties: &crate::config::DeviceProperties,
  ) -> RenderCoreResult<()> {
    let old_size = self.view.size();
    let new_size = old_size + additional;
    info!(
      "recreating SharedBufferWriteOnly from {} to {} bytes (old contents NOT preserved)",
      old_size, new_size
    );
    let new_view = ResourceView::create_buffer(
      self.device.clone(),
      allocator,
      new_size,
      self.usage,
      self.memory_type,
      self.heap_index,
      device_properties,
    )?;
    let old_view = std::mem::replace(&mut self.view, new_view);
    old_view.clean_up(allocator);
    self.free_list = FreeList::new(new_size);
    // Every previously-carved SharedBufferData is now invalid; callers must
    // re-allocate. This matches PipelineModelsCSIndirect::AllocateBuffers's
    // "if already allocated, relinquish and re-allocate to the new model
    // count" policy (spec §4.8).
    #[cfg(debug_assertions)]
    {
      self.rewritten_since_extend = false;
    }
    Ok(())
  }

  pub fn relinquish_memory(&mut self, data: SharedBufferData) {
    self.free_list.relinquish(data);
  }

  #[cfg(debug_assertions)]
  pub fn mark_rewritten(&mut self) {
    self.rewritten_since_extend = true;
  }

  #[cfg(debug_assertions)]
  pub fn debug_assert_rewritten(&self) {
    debug_assert!(
      self.rewritten_since_extend,
      "SharedBufferWriteOnly contents must be fully rewritten after a recreate before being read \
       by the GPU"
    );
  }

  pub fn clean_up(self, allocator: &mut Allocator) {
    self.view.clean_up(allocator);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn free_list_allocations_are_disjoint() {
    let mut fl = FreeList::new(1024);
    let a = fl.allocate(100).unwrap();
    let b = fl.allocate(200).unwrap();
    assert!(a.end() <= b.offset || b.end() <= a.offset);
  }

  #[test]
  fn relinquish_coalesces_neighbors() {
    let mut fl = FreeList::new(300);
    let a = fl.allocate(100).unwrap();
    let b = fl.allocate(100).unwrap();
    let _c = fl.allocate(100).unwrap();
    fl.relinquish(a);
    fl.relinquish(b);
    assert_eq!(fl.ranges, vec![(0, 200)]);
  }

  #[test]
  fn addable_capacity_only_counts_ranges_past_live_end() {
    let mut fl = FreeList::new(1000);
    let _a = fl.allocate(400).unwrap(); // live end at 400
    assert_eq!(fl.addable_capacity_after(400), 600);
    assert_eq!(fl.addable_capacity_after(1000), 0);
  }

  #[test]
  fn allocate_fails_when_buffer_is_full() {
    let mut fl = FreeList::new(100);
    assert!(fl.allocate(100).is_some());
    assert!(fl.allocate(1).is_none());
  }
}
