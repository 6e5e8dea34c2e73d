//! `MeshManagerVSIndividual`: packs `{vertex, index}` into two shared GPU
//! buffers and binds them directly at draw time.

use crate::{
  core::{
    allocator::Allocator,
    mesh_manager::{BundleRegistry, MeshBundleSource, MeshDetails, MeshManagerOps, Vertex},
    resource_view::ResourceView,
    shared_buffer::SharedBufferGpu,
    staging::{BufferCopyDestination, StagingManager},
  },
  error::RenderCoreResult,
};
use ash::vk;

pub struct MeshManagerVsIndividual {
  vertex_buffer: SharedBufferGpu,
  index_buffer: SharedBufferGpu,
  bundles: BundleRegistry,
  graphics_family: u32,
}

impl MeshManagerVsIndividual {
  pub fn new(vertex_buffer: SharedBufferGpu, index_buffer: SharedBufferGpu, graphics_family: u32) -> Self {
    Self {
      vertex_buffer,
      index_buffer,
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

  pub fn clean_up(self, allocator: &mut Allocator) {
    self.vertex_buffer.clean_up(allocator);
    self.index_buffer.clean_up(allocator);
  }

  /// Binds this bundle's vertex/index buffers and issues an indexed draw for
  /// one model (spec §4.8 `PipelineModelsVSIndividual`).
  pub fn record_draw(&self, cmd: vk::CommandBuffer, device: &ash::Device, details: &MeshDetails) {
    unsafe {
      device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer.buffer()], &[0]);
      device.cmd_bind_index_buffer(
        cmd,
        self.index_buffer.buffer(),
        0,
        vk::IndexType::UINT32,
      );
      device.cmd_draw_indexed(cmd, details.index_count, 1, details.index_offset, details.vertex_offset as i32, 0);
    }
  }
}

impl MeshManagerOps for MeshManagerVsIndividual {
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

      details.push(MeshDetails {
        index_offset: (index_data.offset / std::mem::size_of::<u32>() as vk::DeviceSize) as u32,
        index_count: mesh.indices.len() as u32,
        vertex_offset: (vertex_data.offset / std::mem::size_of::<Vertex>() as vk::DeviceSize) as u32,
        aabb_min: mesh.aabb_min,
        aabb_max: mesh.aabb_max,
        ..Default::default()
      });
    }
    Ok(self.bundles.insert(details))
  }

  fn remove_mesh_bundle(&mut self, bundle_index: u32) {
    self.bundles.remove(bundle_index);
    // The shared-buffer ranges for a removed bundle's meshes are relinquished
    // by the owning model manager via `MeshDetails`, mirroring the source's
    // split between mesh storage (here) and per-model binder bookkeeping.
  }

  fn mesh_details(&self, bundle_index: u32, mesh_index: u32) -> Option<&MeshDetails> {
    self.bundles.get(bundle_index, mesh_index)
  }

  fn copy_old_buffers(&mut self, cmd: vk::CommandBuffer) -> Vec<ResourceView> {
    [self.vertex_buffer.copy_old_buffer(cmd), self.index_buffer.copy_old_buffer(cmd)]
      .into_iter()
      .flatten()
      .collect()
  }
}

fn bytes_of_slice<T>(slice: &[T]) -> &[u8] {
  unsafe { std::slice::from_raw_parts(slice.as_ptr() as *const u8, std::mem::size_of_val(slice)) }
}
