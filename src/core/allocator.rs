//! Memory Allocator (spec §4.1): sub-allocates device memory across a small
//! pool of large `VkDeviceMemory` blocks and returns `{memory_id, offset,
//! size, alignment}` handles. Grounded on the free-list sub-allocation
//! pattern the teacher crate otherwise delegated to `vk-mem`; here it is
//! hand-rolled per spec, including the `VK_EXT_memory_budget` heap check the
//! library does not expose.

use crate::{
  error::{RenderCoreError, RenderCoreResult},
  handles::ReusableVector,
};
use ash::{vk, Device};
use log::{info, warn};
use std::sync::Arc;

/// Which pool an allocation is drawn from.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum MemoryType {
  /// `DEVICE_LOCAL`, not host visible. Used for GPU-only shared buffers and
  /// sampled images.
  GpuOnly,
  /// `HOST_VISIBLE | HOST_COHERENT`. Used for staging buffers, per-frame CPU
  /// model/material buffers, and descriptor buffers.
  HostCoherent,
}

/// A single `VkDeviceMemory` allocation plus its free-list sub-allocator.
struct MemoryBlock {
  memory: vk::DeviceMemory,
  size: vk::DeviceSize,
  memory_type_index: u32,
  /// Which `VkPhysicalDeviceMemoryBudgetPropertiesEXT` heap this block was
  /// charged against, so its size can be credited back to `heap_usage` when
  /// the block is destroyed.
  heap_index: usize,
  mapped_ptr: Option<*mut u8>,
  free_ranges: Vec<(vk::DeviceSize, vk::DeviceSize)>, // (offset, size), sorted by offset
}

impl MemoryBlock {
  fn new(
    memory: vk::DeviceMemory, size: vk::DeviceSize, memory_type_index: u32, heap_index: usize,
    mapped_ptr: Option<*mut u8>,
  ) -> Self {
    Self {
      memory,
      size,
      memory_type_index,
      heap_index,
      mapped_ptr,
      free_ranges: vec![(0, size)],
    }
  }

  /// First-fit scan honoring `alignment`. Returns the (offset, aligned size
  /// consumed) of the carved range.
  fn try_allocate(
    &mut self, size: vk::DeviceSize, alignment: vk::DeviceSize,
  ) -> Option<vk::DeviceSize> {
    for i in 0..self.free_ranges.len() {
      let (range_offset, range_size) = self.free_ranges[i];
      let aligned_offset = crate::config::align_up(range_offset, alignment);
      let padding = aligned_offset - range_offset;
      if range_size < padding + size {
        continue;
      }

      let consumed_end = aligned_offset + size;
      let range_end = range_offset + range_size;
      self.free_ranges.remove(i);
      if padding > 0 {
        self.free_ranges.insert(i, (range_offset, padding));
      }
      if consumed_end < range_end {
        self
          .free_ranges
          .insert(if padding > 0 { i + 1 } else { i }, (consumed_end, range_end - consumed_end));
      }
      return Some(aligned_offset);
    }
    None
  }

  fn deallocate(&mut self, offset: vk::DeviceSize, size: vk::DeviceSize) {
    let pos = self
      .free_ranges
      .binary_search_by_key(&offset, |&(o, _)| o)
      .unwrap_or_else(|e| e);
    self.free_ranges.insert(pos, (offset, size));
    self.coalesce_around(pos);
  }

  fn coalesce_around(&mut self, pos: usize) {
    if pos + 1 < self.free_ranges.len() {
      let (o, s) = self.free_ranges[pos];
      let (next_o, next_s) = self.free_ranges[pos + 1];
      if o + s == next_o {
        self.free_ranges[pos] = (o, s + next_s);
        self.free_ranges.remove(pos + 1);
      }
    }
    if pos > 0 {
      let (prev_o, prev_s) = self.free_ranges[pos - 1];
      let (o, s) = self.free_ranges[pos];
      if prev_o + prev_s == o {
        self.free_ranges[pos - 1] = (prev_o, prev_s + s);
        self.free_ranges.remove(pos);
      }
    }
  }

  fn is_empty(&self) -> bool {
    self.free_ranges.len() == 1 && self.free_ranges[0] == (0, self.size)
  }
}

/// Result of a successful `Allocator::allocate` call.
#[derive(Copy, Clone, Debug)]
pub struct Allocation {
  pub memory_id: u32,
  pub memory: vk::DeviceMemory,
  pub offset: vk::DeviceSize,
  pub size: vk::DeviceSize,
  pub alignment: vk::DeviceSize,
  /// Present only for `MemoryType::HostCoherent` allocations whose block is
  /// persistently mapped.
  pub mapped_ptr: Option<*mut u8>,
}

/// Sub-allocates device memory across two pools (GPU-only, host-coherent),
/// each holding a handful of large `VkDeviceMemory` blocks.
pub struct Allocator {
  device: Arc<Device>,
  gpu_blocks: ReusableVector<MemoryBlock>,
  cpu_blocks: ReusableVector<MemoryBlock>,
  gpu_memory_type_index: u32,
  cpu_memory_type_index: u32,
  default_gpu_block_size: vk::DeviceSize,
  default_cpu_block_size: vk::DeviceSize,
  /// Bytes already committed out of each heap, tracked alongside
  /// `VkPhysicalDeviceMemoryBudgetPropertiesEXT` so allocations that would
  /// exceed the reported budget are refused before calling
  /// `vkAllocateMemory`.
  heap_budgets: Vec<vk::DeviceSize>,
  heap_usage: Vec<vk::DeviceSize>,
}

impl Allocator {
  pub fn new(
    device: Arc<Device>, gpu_memory_type_index: u32, cpu_memory_type_index: u32,
    default_gpu_block_size: vk::DeviceSize, default_cpu_block_size: vk::DeviceSize,
    memory_budget: &vk::PhysicalDeviceMemoryBudgetPropertiesEXT, heap_count: usize,
  ) -> Self {
    Self {
      device,
      gpu_blocks: ReusableVector::new(),
      cpu_blocks: ReusableVector::new(),
      gpu_memory_type_index,
      cpu_memory_type_index,
      default_gpu_block_size,
      default_cpu_block_size,
      heap_budgets: memory_budget.heap_budget[..heap_count].to_vec(),
      heap_usage: memory_budget.heap_usage[..heap_count].to_vec(),
    }
  }

  /// Allocates `size` bytes aligned to `alignment` from the pool matching
  /// `memory_type`. Scans existing blocks first; if none fit, allocates a new
  /// block sized `max(size, default_new_size)`; if the OS refuses that, retries
  /// with exactly the remaining heap budget; fails with `OutOfMemory`
  /// otherwise.
  pub fn allocate(
    &mut self, size: vk::DeviceSize, alignment: vk::DeviceSize, memory_type: MemoryType,
    heap_index: usize,
  ) -> RenderCoreResult<Allocation> {
    let (blocks, memory_type_index, default_size) = match memory_type {
      MemoryType::GpuOnly => (
        &mut self.gpu_blocks,
        self.gpu_memory_type_index,
        self.default_gpu_block_size,
      ),
      MemoryType::HostCoherent => (
        &mut self.cpu_blocks,
        self.cpu_memory_type_index,
        self.default_cpu_block_size,
      ),
    };

    for (memory_id, block) in blocks.iter_mut() {
      if block.memory_type_index != memory_type_index {
        continue;
      }
      if let Some(offset) = block.try_allocate(size, alignment) {
        return Ok(Allocation {
          memory_id,
          memory: block.memory,
          offset,
          size,
          alignment,
          mapped_ptr: block.mapped_ptr,
        });
      }
    }

    let remaining_budget = self
      .heap_budgets
      .get(heap_index)
      .copied()
      .unwrap_or(vk::DeviceSize::MAX)
      .saturating_sub(self.heap_usage.get(heap_index).copied().unwrap_or(0));
    if size > remaining_budget {
      warn!(
        "allocation of {} bytes would exceed heap {} budget ({} remaining)",
        size, heap_index, remaining_budget
      );
      return Err(RenderCoreError::OutOfMemory);
    }

    let requested_block_size = default_size.max(size);
    let new_block = self
      .allocate_block(requested_block_size, memory_type_index, memory_type, heap_index)
      .or_else(|_| {
        info!(
          "new-block allocation of {} bytes failed, retrying with remaining budget of {} bytes",
          requested_block_size, remaining_budget
        );
        self.allocate_block(remaining_budget.max(size), memory_type_index, memory_type, heap_index)
      })?;

    self.heap_usage[heap_index] += new_block.size;
    let block_size = new_block.size;
    let mapped_ptr = new_block.mapped_ptr;
    let blocks = match memory_type {
      MemoryType::GpuOnly => &mut self.gpu_blocks,
      MemoryType::HostCoherent => &mut self.cpu_blocks,
    };
    let memory_id = blocks.add(new_block);
    let block = blocks.get_mut(memory_id).unwrap();
    let offset = block
      .try_allocate(size, alignment)
      .expect("freshly allocated block must fit the request that sized it");

    info!(
      "allocated new {:?} memory block {} of {} bytes",
      memory_type, memory_id, block_size
    );

    Ok(Allocation {
      memory_id,
      memory: block.memory,
      offset,
      size,
      alignment,
      mapped_ptr,
    })
  }

  fn allocate_block(
    &self, size: vk::DeviceSize, memory_type_index: u32, memory_type: MemoryType, heap_index: usize,
  ) -> RenderCoreResult<MemoryBlock> {
    let alloc_info = vk::MemoryAllocateInfo::builder()
      .allocation_size(size)
      .memory_type_index(memory_type_index)
      .build();
    let memory = unsafe { self.device.allocate_memory(&alloc_info, None)? };

    let mapped_ptr = if memory_type == MemoryType::HostCoherent {
      let ptr = unsafe {
        self
          .device
          .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())?
      };
      Some(ptr as *mut u8)
    } else {
      None
    };

    Ok(MemoryBlock::new(memory, size, memory_type_index, heap_index, mapped_ptr))
  }

  /// Returns `[offset, offset+size)` to its block's free list, coalescing
  /// with neighboring free ranges. If the block becomes fully empty it is
  /// destroyed immediately and its id returned to the free-id queue.
  pub fn deallocate(&mut self, memory_id: u32, offset: vk::DeviceSize, size: vk::DeviceSize, memory_type: MemoryType) {
    let blocks = match memory_type {
      MemoryType::GpuOnly => &mut self.gpu_blocks,
      MemoryType::HostCoherent => &mut self.cpu_blocks,
    };
    let should_destroy = if let Some(block) = blocks.get_mut(memory_id) {
      block.deallocate(offset, size);
      block.is_empty()
    } else {
      warn!("deallocate called with unknown memory_id {}", memory_id);
      return;
    };

    if should_destroy {
      if let Some(block) = blocks.remove(memory_id) {
        unsafe {
          if block.mapped_ptr.is_some() {
            self.device.unmap_memory(block.memory);
          }
          self.device.free_memory(block.memory, None);
        }
        if let Some(usage) = self.heap_usage.get_mut(block.heap_index) {
          *usage = usage.saturating_sub(block.size);
        }
        info!("destroyed fully-empty memory block {}", memory_id);
      }
    }
  }
}

// `*mut u8` is only ever dereferenced for writes into persistently-mapped
// host-coherent memory, which is inherently `Send`/`Sync`-unsafe territory
// the caller (the staging manager's worker pool) must serialize by range.
unsafe impl Send for Allocator {}
unsafe impl Sync for Allocator {}

#[cfg(test)]
mod tests {
  use super::*;

  fn fresh_block(size: vk::DeviceSize) -> MemoryBlock {
    MemoryBlock {
      memory: vk::DeviceMemory::null(),
      size,
      memory_type_index: 0,
      heap_index: 0,
      mapped_ptr: None,
      free_ranges: vec![(0, size)],
    }
  }

  #[test]
  fn first_fit_respects_alignment() {
    let mut block = fresh_block(1024);
    let a = block.try_allocate(100, 64).unwrap();
    assert_eq!(a, 0);
    let b = block.try_allocate(50, 64).unwrap();
    assert_eq!(b, 128, "second allocation must round up to the alignment");
  }

  #[test]
  fn deallocate_coalesces_adjacent_free_ranges() {
    let mut block = fresh_block(300);
    let a = block.try_allocate(100, 1).unwrap();
    let b = block.try_allocate(100, 1).unwrap();
    let _c = block.try_allocate(100, 1).unwrap();
    block.deallocate(a, 100);
    block.deallocate(b, 100);
    assert_eq!(block.free_ranges, vec![(0, 200)]);
  }

  #[test]
  fn fully_freed_block_reports_empty() {
    let mut block = fresh_block(256);
    let a = block.try_allocate(256, 1).unwrap();
    assert!(!block.is_empty());
    block.deallocate(a, 256);
    assert!(block.is_empty());
  }

  #[test]
  fn disjoint_allocations_never_overlap() {
    let mut block = fresh_block(4096);
    let mut live = Vec::new();
    for size in [64, 200, 33, 512, 17] {
      let offset = block.try_allocate(size, 16).unwrap();
      for &(o, s) in &live {
        let a: (vk::DeviceSize, vk::DeviceSize) = (o, s);
        let b: (vk::DeviceSize, vk::DeviceSize) = (offset, size);
        assert!(a.0 + a.1 <= b.0 || b.0 + b.1 <= a.0, "ranges overlap");
      }
      live.push((offset, size));
    }
  }
}
