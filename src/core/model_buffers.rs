//! Model Buffers & Material Buffers (spec §4.6): per-frame CPU-visible
//! buffers of per-model / per-material records, indexed by stable handles
//! drawn from a [`ReusableVector`].

use crate::{
  config::DeviceProperties,
  core::{
    allocator::{Allocator, MemoryType},
    resource_view::ResourceView,
  },
  error::RenderCoreResult,
  handles::ReusableVector,
};
use ash::{vk, Device};
use std::sync::Arc;
use ultraviolet::Mat4;

/// Per-model data written into `ModelBuffers`. `#[repr(C)]` and padded to a
/// round size because it is read by shaders through a raw storage-buffer
/// byte view.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct ModelRecord {
  pub transform: Mat4,
  pub material_index: u32,
  pub mesh_index: u32,
  pub _padding: [u32; 2],
}
static_assertions::assert_eq_size!(ModelRecord, [u8; 80]);

/// The subset of a [`ModelRecord`] visible to fragment shading, mirrored to a
/// smaller-stride binding so fragment shaders don't pull in the full
/// transform.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct FragmentModelRecord {
  pub material_index: u32,
}

/// One live model tracked by [`ModelBuffers`].
#[derive(Clone, Copy, Debug)]
pub struct Model {
  pub mesh_index: u32,
  pub material_index: u32,
  pub transform: Mat4,
  pub visible: bool,
}

const GROWTH_EXTRA: usize = 64;

/// Per-frame ring of host-coherent storage buffers, one copy per in-flight
/// frame, laid out as `[ModelRecord; capacity]`.
pub struct ModelBuffers {
  device: Arc<Device>,
  frame_count: u32,
  capacity: usize,
  models: ReusableVector<Model>,
  buffers: Vec<ResourceView>,
  fragment_buffers: Vec<ResourceView>,
  heap_index: usize,
  /// Set whenever `add` triggers a growth recreate; consumed (and cleared)
  /// by the render engine, which must then re-publish this buffer's
  /// descriptor.
  pub descriptors_dirty: bool,
}

impl ModelBuffers {
  pub fn new(
    device: Arc<Device>, allocator: &mut Allocator, device_properties: &DeviceProperties,
    frame_count: u32, initial_capacity: usize, heap_index: usize,
  ) -> RenderCoreResult<Self> {
    let mut buffers = Vec::with_capacity(frame_count as usize);
    let mut fragment_buffers = Vec::with_capacity(frame_count as usize);
    for _ in 0..frame_count {
      buffers.push(Self::create_buffer::<ModelRecord>(
        &device,
        allocator,
        device_properties,
        initial_capacity,
        heap_index,
      )?);
      fragment_buffers.push(Self::create_buffer::<FragmentModelRecord>(
        &device,
        allocator,
        device_properties,
        initial_capacity,
        heap_index,
      )?);
    }
    Ok(Self {
      device,
      frame_count,
      capacity: initial_capacity,
      models: ReusableVector::new(),
      buffers,
      fragment_buffers,
      heap_index,
      descriptors_dirty: false,
    })
  }

  fn create_buffer<T>(
    device: &Arc<Device>, allocator: &mut Allocator, device_properties: &DeviceProperties,
    capacity: usize, heap_index: usize,
  ) -> RenderCoreResult<ResourceView> {
    ResourceView::create_buffer(
      device.clone(),
      allocator,
      (capacity * std::mem::size_of::<T>()) as vk::DeviceSize,
      vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
      MemoryType::HostCoherent,
      heap_index,
      device_properties,
    )
  }

  /// Registers `model`, returning the next free handle. Grows the buffer set
  /// (to `1.5x + GROWTH_EXTRA`) when no free slot exists, raising
  /// `descriptors_dirty`.
  pub fn add(
    &mut self, model: Model, allocator: &mut Allocator, device_properties: &DeviceProperties,
  ) -> RenderCoreResult<u32> {
    if self.models.live_count() == self.capacity && self.models.capacity() == self.capacity {
      self.grow(allocator, device_properties)?;
    }
    Ok(self.models.add(model))
  }

  /// Batched form of [`Self::add`], returning one handle per input model.
  pub fn add_multiple(
    &mut self, models: &[Model], allocator: &mut Allocator, device_properties: &DeviceProperties,
  ) -> RenderCoreResult<Vec<u32>> {
    models
      .iter()
      .map(|&m| self.add(m, allocator, device_properties))
      .collect()
  }

  pub fn remove(&mut self, handle: u32) -> Option<Model> {
    self.models.remove(handle)
  }

  fn grow(&mut self, allocator: &mut Allocator, device_properties: &DeviceProperties) -> RenderCoreResult<()> {
    let new_capacity = (self.capacity * 3 / 2) + GROWTH_EXTRA;
    let mut new_buffers = Vec::with_capacity(self.frame_count as usize);
    let mut new_fragment_buffers = Vec::with_capacity(self.frame_count as usize);
    for _ in 0..self.frame_count {
      new_buffers.push(Self::create_buffer::<ModelRecord>(
        &self.device,
        allocator,
        device_properties,
        new_capacity,
        self.heap_index,
      )?);
      new_fragment_buffers.push(Self::create_buffer::<FragmentModelRecord>(
        &self.device,
        allocator,
        device_properties,
        new_capacity,
        self.heap_index,
      )?);
    }
    for old in std::mem::replace(&mut self.buffers, new_buffers) {
      old.clean_up(allocator);
    }
    for old in std::mem::replace(&mut self.fragment_buffers, new_fragment_buffers) {
      old.clean_up(allocator);
    }
    self.capacity = new_capacity;
    self.descriptors_dirty = true;
    Ok(())
  }

  /// Writes every live model's record into copy `frame_index`. Does not
  /// touch any other frame's copy (per-frame ring isolation, spec §8).
  pub fn update(&mut self, frame_index: u32) {
    let buffer = &self.buffers[frame_index as usize];
    let fragment_buffer = &self.fragment_buffers[frame_index as usize];
    let Some(ptr) = buffer.mapped_ptr() else { return };
    let Some(fragment_ptr) = fragment_buffer.mapped_ptr() else { return };
    for (idx, model) in self.models.iter() {
      let record = ModelRecord {
        transform: model.transform,
        material_index: model.material_index,
        mesh_index: model.mesh_index,
        _padding: [0; 2],
      };
      let fragment_record = FragmentModelRecord {
        material_index: model.material_index,
      };
      unsafe {
        let dst = ptr.add(idx as usize * std::mem::size_of::<ModelRecord>()) as *mut ModelRecord;
        dst.write_unaligned(record);
        let fragment_dst =
          fragment_ptr.add(idx as usize * std::mem::size_of::<FragmentModelRecord>()) as *mut FragmentModelRecord;
        fragment_dst.write_unaligned(fragment_record);
      }
    }
  }

  pub fn buffer(&self, frame_index: u32) -> vk::Buffer {
    self.buffers[frame_index as usize].buffer()
  }

  pub fn fragment_buffer(&self, frame_index: u32) -> vk::Buffer {
    self.fragment_buffers[frame_index as usize].buffer()
  }

  pub fn get(&self, handle: u32) -> Option<&Model> {
    self.models.get(handle)
  }

  pub fn get_mut(&mut self, handle: u32) -> Option<&mut Model> {
    self.models.get_mut(handle)
  }

  pub fn clean_up(self, allocator: &mut Allocator) {
    for buffer in self.buffers {
      buffer.clean_up(allocator);
    }
    for buffer in self.fragment_buffers {
      buffer.clean_up(allocator);
    }
  }
}

/// Per-material record. Materials change rarely, so only one copy is kept
/// and it is updated on demand rather than every frame.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct MaterialRecord {
  pub albedo_texture_index: u32,
  pub normal_texture_index: u32,
  pub roughness: f32,
  pub metallic: f32,
}

pub struct MaterialBuffers {
  device: Arc<Device>,
  capacity: usize,
  materials: ReusableVector<MaterialRecord>,
  buffer: ResourceView,
  heap_index: usize,
}

impl MaterialBuffers {
  pub fn new(
    device: Arc<Device>, allocator: &mut Allocator, device_properties: &DeviceProperties,
    initial_capacity: usize, heap_index: usize,
  ) -> RenderCoreResult<Self> {
    let buffer = ResourceView::create_buffer(
      device.clone(),
      allocator,
      (initial_capacity * std::mem::size_of::<MaterialRecord>()) as vk::DeviceSize,
      vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
      MemoryType::HostCoherent,
      heap_index,
      device_properties,
    )?;
    Ok(Self {
      device,
      capacity: initial_capacity,
      materials: ReusableVector::new(),
      buffer,
      heap_index,
    })
  }

  pub fn add(
    &mut self, record: MaterialRecord, allocator: &mut Allocator, device_properties: &DeviceProperties,
  ) -> RenderCoreResult<u32> {
    if self.materials.live_count() == self.capacity && self.materials.capacity() == self.capacity {
      let new_capacity = (self.capacity * 3 / 2) + GROWTH_EXTRA;
      let new_buffer = ResourceView::create_buffer(
        self.device.clone(),
        allocator,
        (new_capacity * std::mem::size_of::<MaterialRecord>()) as vk::DeviceSize,
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        MemoryType::HostCoherent,
        self.heap_index,
        device_properties,
      )?;
      let old = std::mem::replace(&mut self.buffer, new_buffer);
      self.write_all_into(&self.buffer);
      old.clean_up(allocator);
      self.capacity = new_capacity;
    }
    let handle = self.materials.add(record);
    self.write_one(handle, record);
    Ok(handle)
  }

  pub fn remove(&mut self, handle: u32) -> Option<MaterialRecord> {
    self.materials.remove(handle)
  }

  pub fn update(&mut self, handle: u32, record: MaterialRecord) {
    if let Some(slot) = self.materials.get_mut(handle) {
      *slot = record;
      self.write_one(handle, record);
    }
  }

  fn write_one(&self, handle: u32, record: MaterialRecord) {
    if let Some(ptr) = self.buffer.mapped_ptr() {
      unsafe {
        let dst = ptr.add(handle as usize * std::mem::size_of::<MaterialRecord>()) as *mut MaterialRecord;
        dst.write_unaligned(record);
      }
    }
  }

  fn write_all_into(&self, buffer: &ResourceView) {
    let Some(ptr) = buffer.mapped_ptr() else { return };
    for (idx, record) in self.materials.iter() {
      unsafe {
        let dst = ptr.add(idx as usize * std::mem::size_of::<MaterialRecord>()) as *mut MaterialRecord;
        dst.write_unaligned(*record);
      }
    }
  }

  pub fn buffer(&self) -> vk::Buffer {
    self.buffer.buffer()
  }

  pub fn clean_up(self, allocator: &mut Allocator) {
    self.buffer.clean_up(allocator);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn reusable_handle_stability_for_models() {
    let mut models: ReusableVector<Model> = ReusableVector::new();
    let m = |mesh| Model {
      mesh_index: mesh,
      material_index: 0,
      transform: Mat4::identity(),
      visible: true,
    };
    let i = models.add(m(1));
    let j = models.add(m(2));
    models.remove(i);
    let k = models.add(m(3));
    assert_eq!(k, i);
    assert_eq!(models.get(j).unwrap().mesh_index, 2);
  }
}
