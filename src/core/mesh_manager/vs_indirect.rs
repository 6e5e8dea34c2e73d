//! `MeshManagerVSIndirect`: packs `{vertex, index}` like the individual
//! variant, plus a per-mesh `MeshBounds` record the culling compute pass
//! consumes to build the indirect draw argument buffer.

use crate::{
  core::{
    allocator::Allocator,
    mesh_manager::{BundleRegistry, MeshBundleSource, MeshDetails, MeshManagerOps, Vertex},
    resource_view::ResourceView,
    shared_buffer::{SharedBufferData, SharedBufferGpu},
    staging::{BufferCopyDestination, StagingManager},
  },
  error::RenderCoreResult,
};
use ash::vk;
use ultraviolet::Vec3;

/// `{aabb_min, aabb_max, first_index, index_count, vertex_offset}`: what the
/// frustum-culling compute shader reads per mesh instance to decide whether
/// to emit an indirect draw command (spec §4.11/4.8 culling pass).
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct MeshBounds {
  pub aabb_min: Vec3,
  pub first_index: u32,
  pub aabb_max: Vec3,
  pub index_count: u32,
  pub vertex_offset: u32,
  pub _padding: [u32; 3],
}
static_assertions::assert_eq_size!(MeshBounds, [u8; 48]);

pub struct MeshManagerVsIndirect {
  vertex_buffer: SharedBufferGpu,
  index_buffer: SharedBufferGpu,
  bounds_buffer: SharedBufferGpu,
  bundles: BundleRegistry,
  graphics_family: u32,
}

impl MeshManagerVsIndirect {
  pub fn new(
    vertex_buffer: SharedBufferGpu, index_buffer: SharedBufferGpu, bounds_buffer: SharedBufferGpu,
    graphics_family: u32,
  ) -> Self {
    Self {
      vertex_buffer,
      index_buffer,
      bounds_buffer,
      bundles: BundleRegistry::new(),
      graphics_family,
    }
  }

  pub fn vertex_buffer_handle(&self) -> vk::Buffer {
    self.vertex_buffer.buffer()
  }

  pub fn index_buffer_handle(&self) -> vk::Buffer {
    self.index_buffer.buffer()
  }

  /// Bounds buffer the culling compute pass binds as a read-only storage
  /// buffer, one `MeshBounds` per model-slot (spec §4.8
  /// `PipelineModelsCSIndirect`).
  pub fn bounds_buffer_handle(&self) -> vk::Buffer {
    self.bounds_buffer.buffer()
  }

  pub fn clean_up(self, allocator: &mut Allocator) {
    self.vertex_buffer.clean_up(allocator);
    self.index_buffer.clean_up(allocator);
    self.bounds_buffer.clean_up(allocator);
  }
}

impl MeshManagerOps for MeshManagerVsIndirect {
  fn add_mesh_bundle(
    &mut self, source: MeshBundleSource, staging_mgr: &mut StagingManager, allocator: &mut Allocator,
    device_properties: &crate::config::DeviceProperties,
  ) -> RenderCoreResult<u32> {
    let mut details = Vec::with_capacity(source.meshes.len());
    for mesh in &source.meshes {
      let vertex_bytes = bytes_of_slice(&mesh.vertices);
      let vertex_data = self.vertex_buffer.allocate_and_get_shared_data(
        vertex_bytes.len() as vk::DeviceSize,
        allocator,
        device_properties,
      )?;
      let index_bytes = bytes_of_slice(&mesh.indices);
      let index_data = self.index_buffer.allocate_and_get_shared_data(
        index_bytes.len() as vk::DeviceSize,
        allocator,
        device_properties,
      )?;

      staging_mgr.enqueue_buffer_copy(
        allocator,
        device_properties,
        vertex_bytes,
        BufferCopyDestination {
          dst_buffer: self.vertex_buffer.buffer(),
          dst_offset: vertex_data.offset,
          dst_family: self.graphics_family,
          dst_access: vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
          dst_stage: vk::PipelineStageFlags::VERTEX_INPUT,
        },
      )?;
      staging_mgr.enqueue_buffer_copy(
        allocator,
        device_properties,
        index_bytes,
        BufferCopyDestination {
          dst_buffer: self.index_buffer.buffer(),
          dst_offset: index_data.offset,
          dst_family: self.graphics_family,
          dst_access: vk::AccessFlags::INDEX_READ,
          dst_stage: vk::PipelineStageFlags::VERTEX_INPUT,
        },
      )?;

      let index_offset = (index_data.offset / std::mem::size_of::<u32>() as vk::DeviceSize) as u32;
      let vertex_offset = (vertex_data.offset / std::mem::size_of::<Vertex>() as vk::DeviceSize) as u32;
      let bounds = MeshBounds {
        aabb_min: mesh.aabb_min,
        first_index: index_offset,
        aabb_max: mesh.aabb_max,
        index_count: mesh.indices.len() as u32,
        vertex_offset,
        _padding: [0; 3],
      };
      let bounds_data = self.enqueue_bounds(bounds, staging_mgr, allocator, device_properties)?;

      details.push(MeshDetails {
        index_offset,
        index_count: mesh.indices.len() as u32,
        vertex_offset,
        aabb_min: mesh.aabb_min,
        aabb_max: mesh.aabb_max,
        meshlet_offset: (bounds_data.offset / std::mem::size_of::<MeshBounds>() as vk::DeviceSize) as u32,
        ..Default::default()
      });
    }
    Ok(self.bundles.insert(details))
  }

  fn remove_mesh_bundle(&mut self, bundle_index: u32) {
    self.bundles.remove(bundle_index);
  }

  fn mesh_details(&self, bundle_index: u32, mesh_index: u32) -> Option<&MeshDetails> {
    self.bundles.get(bundle_index, mesh_index)
  }

  fn copy_old_buffers(&mut self, cmd: vk::CommandBuffer) -> Vec<ResourceView> {
    [
      self.vertex_buffer.copy_old_buffer(cmd),
      self.index_buffer.copy_old_buffer(cmd),
      self.bounds_buffer.copy_old_buffer(cmd),
    ]
    .into_iter()
    .flatten()
    .collect()
  }
}

impl MeshManagerVsIndirect {
  fn enqueue_bounds(
    &mut self, bounds: MeshBounds, staging_mgr: &mut StagingManager, allocator: &mut Allocator,
    device_properties: &crate::config::DeviceProperties,
  ) -> RenderCoreResult<SharedBufferData> {
    let bytes = unsafe {
      std::slice::from_raw_parts(&bounds as *const MeshBounds as *const u8, std::mem::size_of::<MeshBounds>())
    };
    let bounds_data =
      self
        .bounds_buffer
        .allocate_and_get_shared_data(bytes.len() as vk::DeviceSize, allocator, device_properties)?;
    staging_mgr.enqueue_buffer_copy(
      allocator,
      device_properties,
      bytes,
      BufferCopyDestination {
        dst_buffer: self.bounds_buffer.buffer(),
        dst_offset: bounds_data.offset,
        dst_family: self.graphics_family,
        dst_access: vk::AccessFlags::SHADER_READ,
        dst_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
      },
    )?;
    Ok(bounds_data)
  }
}

fn bytes_of_slice<T>(slice: &[T]) -> &[u8] {
  unsafe { std::slice::from_raw_parts(slice.as_ptr() as *const u8, std::mem::size_of_val(slice)) }
}
