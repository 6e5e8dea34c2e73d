//! `MeshManagerMS`: packs vertices, per-meshlet vertex indices, per-meshlet
//! primitive indices, and `Meshlet` records, consumed entirely from task/mesh
//! shaders through `VK_EXT_mesh_shader` (no vertex/index-buffer binding).

use crate::{
  core::{
    allocator::Allocator,
    mesh_manager::{BundleRegistry, MeshBundleSource, MeshDetails, MeshManagerOps, Meshlet, Vertex},
    resource_view::ResourceView,
    shared_buffer::SharedBufferGpu,
    staging::{BufferCopyDestination, StagingManager},
  },
  error::RenderCoreResult,
};
use ash::vk;

pub struct MeshManagerMs {
  vertex_buffer: SharedBufferGpu,
  vertex_indices_buffer: SharedBufferGpu,
  primitive_indices_buffer: SharedBufferGpu,
  meshlet_buffer: SharedBufferGpu,
  bundles: BundleRegistry,
  graphics_family: u32,
}

impl MeshManagerMs {
  pub fn new(
    vertex_buffer: SharedBufferGpu, vertex_indices_buffer: SharedBufferGpu,
    primitive_indices_buffer: SharedBufferGpu, meshlet_buffer: SharedBufferGpu, graphics_family: u32,
  ) -> Self {
    Self {
      vertex_buffer,
      vertex_indices_buffer,
      primitive_indices_buffer,
      meshlet_buffer,
      bundles: BundleRegistry::new(),
      graphics_family,
    }
  }

  pub fn vertex_buffer_handle(&self) -> vk::Buffer {
    self.vertex_buffer.buffer()
  }

  pub fn vertex_indices_buffer_handle(&self) -> vk::Buffer {
    self.vertex_indices_buffer.buffer()
  }

  pub fn primitive_indices_buffer_handle(&self) -> vk::Buffer {
    self.primitive_indices_buffer.buffer()
  }

  pub fn meshlet_buffer_handle(&self) -> vk::Buffer {
    self.meshlet_buffer.buffer()
  }

  pub fn clean_up(self, allocator: &mut Allocator) {
    self.vertex_buffer.clean_up(allocator);
    self.vertex_indices_buffer.clean_up(allocator);
    self.primitive_indices_buffer.clean_up(allocator);
    self.meshlet_buffer.clean_up(allocator);
  }

  /// Dispatches one task-shader workgroup per `MESHLET_TASK_INVOCATIONS`
  /// meshlets for `details` (spec §4.8 `PipelineModelsMSIndividual`).
  pub fn record_draw_mesh_tasks(&self, cmd: vk::CommandBuffer, loader: &ash::extensions::ext::MeshShader, details: &MeshDetails) {
    let group_count = (details.meshlet_count + crate::config::MESHLET_TASK_INVOCATIONS - 1)
      / crate::config::MESHLET_TASK_INVOCATIONS;
    unsafe {
      loader.cmd_draw_mesh_tasks(cmd, group_count.max(1), 1, 1);
    }
  }
}

impl MeshManagerOps for MeshManagerMs {
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
      let vertex_indices_bytes = bytes_of_slice(&mesh.vertex_indices_for_meshlets);
      let vertex_indices_data = self.vertex_indices_buffer.allocate_and_get_shared_data(
        vertex_indices_bytes.len() as vk::DeviceSize,
        allocator,
        device_properties,
      )?;
      let primitive_bytes = bytes_of_slice(&mesh.primitive_indices);
      let primitive_data = self.primitive_indices_buffer.allocate_and_get_shared_data(
        primitive_bytes.len() as vk::DeviceSize,
        allocator,
        device_properties,
      )?;
      let meshlet_bytes = bytes_of_slice(&mesh.meshlets);
      let meshlet_data = self.meshlet_buffer.allocate_and_get_shared_data(
        meshlet_bytes.len() as vk::DeviceSize,
        allocator,
        device_properties,
      )?;

      for (bytes, dst_buffer, dst_offset) in [
        (vertex_bytes, self.vertex_buffer.buffer(), vertex_data.offset),
        (
          vertex_indices_bytes,
          self.vertex_indices_buffer.buffer(),
          vertex_indices_data.offset,
        ),
        (primitive_bytes, self.primitive_indices_buffer.buffer(), primitive_data.offset),
        (meshlet_bytes, self.meshlet_buffer.buffer(), meshlet_data.offset),
      ] {
        staging_mgr.enqueue_buffer_copy(
          allocator,
          device_properties,
          bytes,
          BufferCopyDestination {
            dst_buffer,
            dst_offset,
            dst_family: self.graphics_family,
            dst_access: vk::AccessFlags::SHADER_READ,
            dst_stage: vk::PipelineStageFlags::TASK_SHADER_EXT | vk::PipelineStageFlags::MESH_SHADER_EXT,
          },
        )?;
      }

      details.push(MeshDetails {
        index_offset: (vertex_indices_data.offset / std::mem::size_of::<u32>() as vk::DeviceSize) as u32,
        vertex_offset: (vertex_data.offset / std::mem::size_of::<Vertex>() as vk::DeviceSize) as u32,
        meshlet_offset: (meshlet_data.offset / std::mem::size_of::<Meshlet>() as vk::DeviceSize) as u32,
        meshlet_count: mesh.meshlets.len() as u32,
        primitive_offset: (primitive_data.offset / std::mem::size_of::<u8>() as vk::DeviceSize) as u32,
        aabb_min: mesh.aabb_min,
        aabb_max: mesh.aabb_max,
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
      self.vertex_indices_buffer.copy_old_buffer(cmd),
      self.primitive_indices_buffer.copy_old_buffer(cmd),
      self.meshlet_buffer.copy_old_buffer(cmd),
    ]
    .into_iter()
    .flatten()
    .collect()
  }
}

fn bytes_of_slice<T>(slice: &[T]) -> &[u8] {
  unsafe { std::slice::from_raw_parts(slice.as_ptr() as *const u8, std::mem::size_of_val(slice)) }
}
