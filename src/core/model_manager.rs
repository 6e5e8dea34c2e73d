//! Model Managers (spec §4.10): three variants matching the Mesh Manager
//! split, each owning Model Bundles, aggregating their shared buffers, and
//! publishing descriptors.

use crate::{
  config::DeviceProperties,
  core::{
    allocator::{Allocator, MemoryType},
    mesh_manager::{MeshManagerMs, MeshManagerOps, MeshManagerVsIndirect, MeshManagerVsIndividual},
    model_buffers::ModelBuffers,
    model_bundle::{ModelBundleIndirect, ModelBundleIndividual, SourceModelBundle},
    pipeline_model_binder::{DrawIndexedIndirectCommand, PipelineModelsMsIndividual, PipelineModelsVsIndividual},
    resource_view::ResourceView,
    shared_buffer::{SharedBufferGpu, SharedBufferWriteOnly},
  },
  error::{RenderCoreError, RenderCoreResult},
  handles::ReusableVector,
};
use ash::vk;

/// Model manager for the per-model vertex-shader draw path: no shared
/// culling buffers, bundles just keep their partitions around for
/// `DrawPipeline` to walk.
pub struct ModelManagerVsIndividual {
  bundles: ReusableVector<ModelBundleIndividual>,
}

impl ModelManagerVsIndividual {
  pub fn new() -> Self {
    Self { bundles: ReusableVector::new() }
  }

  pub fn add_model_bundle(&mut self, source: SourceModelBundle) -> u32 {
    self.bundles.add(ModelBundleIndividual::new(source))
  }

  pub fn remove_model_bundle(&mut self, bundle_index: u32) -> Option<ModelBundleIndividual> {
    self.bundles.remove(bundle_index)
  }

  pub fn bundle(&self, bundle_index: u32) -> Option<&ModelBundleIndividual> {
    self.bundles.get(bundle_index)
  }

  /// `ReconfigureModelPipelinesInBundle` for the direct-draw variants: no
  /// shared buffers to resize, just membership bookkeeping.
  pub fn reconfigure_model_pipelines(
    &mut self, bundle_index: u32, decreased_local_idx: usize, decreased_model_indices: Vec<u32>,
    increased_local_idx: usize, increased_model_indices: Vec<u32>,
  ) -> RenderCoreResult<()> {
    let bundle = self.bundles.get_mut(bundle_index).ok_or(RenderCoreError::InvalidHandle)?;
    bundle.reconfigure_models(decreased_local_idx, decreased_model_indices, increased_local_idx, increased_model_indices);
    Ok(())
  }

  /// `DrawPipeline` (spec §4.10): binds the pipeline's models' mesh data and
  /// issues one `vkCmdDrawIndexed` per model in the partition.
  pub fn draw_pipeline_vs(
    &self, bundle_index: u32, pipeline_local_idx: usize, cmd: vk::CommandBuffer, device: &ash::Device,
    pipeline_layout: vk::PipelineLayout, mesh_mgr: &MeshManagerVsIndividual, mesh_bundle_index: u32,
    model_buffers: &ModelBuffers,
  ) -> RenderCoreResult<()> {
    let (handles, details) = self.gather_partition(bundle_index, pipeline_local_idx, mesh_mgr, mesh_bundle_index, model_buffers)?;
    PipelineModelsVsIndividual::new().record_draws(cmd, device, pipeline_layout, &handles, &details);
    Ok(())
  }

  /// `DrawPipeline` for the mesh-shader variant: same partition walk, but
  /// dispatching task/mesh-shader workgroups instead of `vkCmdDrawIndexed`.
  #[allow(clippy::too_many_arguments)]
  pub fn draw_pipeline_ms(
    &self, bundle_index: u32, pipeline_local_idx: usize, cmd: vk::CommandBuffer, device: &ash::Device,
    loader: &ash::extensions::ext::MeshShader, pipeline_layout: vk::PipelineLayout, mesh_mgr: &MeshManagerMs,
    mesh_bundle_index: u32, model_buffers: &ModelBuffers,
  ) -> RenderCoreResult<()> {
    let (handles, details) = self.gather_partition(bundle_index, pipeline_local_idx, mesh_mgr, mesh_bundle_index, model_buffers)?;
    PipelineModelsMsIndividual::new().record_draws(cmd, device, loader, pipeline_layout, &handles, &details);
    Ok(())
  }

  /// Walks a partition's live, visible models, returning their buffer handles
  /// alongside the mesh details `DrawPipeline` needs to record each draw.
  fn gather_partition(
    &self, bundle_index: u32, pipeline_local_idx: usize, mesh_mgr: &impl MeshManagerOps, mesh_bundle_index: u32,
    model_buffers: &ModelBuffers,
  ) -> RenderCoreResult<(Vec<u32>, Vec<crate::core::mesh_manager::MeshDetails>)> {
    let bundle = self.bundles.get(bundle_index).ok_or(RenderCoreError::InvalidHandle)?;
    let partition = bundle
      .partitions
      .get(pipeline_local_idx)
      .ok_or(RenderCoreError::InvalidHandle)?;
    let mut handles = Vec::with_capacity(partition.model_indices_in_bundle.len());
    let mut details = Vec::with_capacity(partition.model_indices_in_bundle.len());
    for &model_handle in &partition.model_indices_in_bundle {
      let model = model_buffers.get(model_handle).ok_or(RenderCoreError::InvalidHandle)?;
      if !model.visible {
        continue;
      }
      let mesh_details = mesh_mgr
        .mesh_details(mesh_bundle_index, model.mesh_index)
        .ok_or(RenderCoreError::InvalidHandle)?;
      handles.push(model_handle);
      details.push(*mesh_details);
    }
    Ok((handles, details))
  }
}

/// Model manager for the mesh-shader draw path; structurally identical to
/// [`ModelManagerVsIndividual`] since neither variant needs culling buffers.
pub type ModelManagerMs = ModelManagerVsIndividual;

const RESET_BUFFER_GROWTH_EXTRA: vk::DeviceSize = 4096;

/// Model manager for the GPU-culled indirect draw path. Owns the three
/// CPU-visible shared buffers (argument-input, per-pipeline, per-model), the
/// GPU-only argument-output buffer, and the per-frame atomic counter buffer
/// the culling compute shader writes into.
pub struct ModelManagerVsIndirect {
  device: std::sync::Arc<ash::Device>,
  bundles: ReusableVector<ModelBundleIndirect>,
  argument_input: SharedBufferWriteOnly,
  per_pipeline: SharedBufferWriteOnly,
  per_model: SharedBufferWriteOnly,
  argument_output: SharedBufferGpu,
  counter_buffers: Vec<ResourceView>,
  reset_buffer: Option<ResourceView>,
  frame_count: u32,
}

impl ModelManagerVsIndirect {
  pub fn new(
    device: std::sync::Arc<ash::Device>, argument_input: SharedBufferWriteOnly, per_pipeline: SharedBufferWriteOnly,
    per_model: SharedBufferWriteOnly, argument_output: SharedBufferGpu, counter_buffers: Vec<ResourceView>,
    frame_count: u32,
  ) -> Self {
    Self {
      device,
      bundles: ReusableVector::new(),
      argument_input,
      per_pipeline,
      per_model,
      argument_output,
      counter_buffers,
      reset_buffer: None,
      frame_count,
    }
  }

  pub fn add_model_bundle(
    &mut self, source: SourceModelBundle, allocator: &mut Allocator, device_properties: &DeviceProperties,
  ) -> RenderCoreResult<u32> {
    let mut bundle = ModelBundleIndirect::new();
    let reserved_index = self.bundles.add(ModelBundleIndirect::new());
    bundle.add_new_pipelines_from_bundle(
      reserved_index,
      &source,
      &mut self.argument_input,
      &mut self.per_pipeline,
      &mut self.per_model,
      &mut self.argument_output,
      self.frame_count,
      allocator,
      device_properties,
    )?;
    *self.bundles.get_mut(reserved_index).expect("just inserted") = bundle;
    Ok(reserved_index)
  }

  pub fn remove_model_bundle(&mut self, bundle_index: u32) -> Option<ModelBundleIndirect> {
    let mut bundle = self.bundles.remove(bundle_index)?;
    bundle.cleanup_data(
      &mut self.argument_input,
      &mut self.per_model,
      &mut self.per_pipeline,
      &mut self.argument_output,
    );
    Some(bundle)
  }

  pub fn bundle(&self, bundle_index: u32) -> Option<&ModelBundleIndirect> {
    self.bundles.get(bundle_index)
  }

  /// `ReconfigureModelPipelinesInBundle` (spec §4.10/§6): moves a model
  /// between two of a bundle's partitions, re-sizing both binders' shared
  /// buffer ranges to the new membership.
  #[allow(clippy::too_many_arguments)]
  pub fn reconfigure_model_pipelines(
    &mut self, bundle_index: u32, decreased_local_idx: u32, decreased_model_indices: Vec<u32>,
    increased_local_idx: u32, increased_model_indices: Vec<u32>, allocator: &mut Allocator,
    device_properties: &DeviceProperties,
  ) -> RenderCoreResult<()> {
    let bundle = self.bundles.get_mut(bundle_index).ok_or(RenderCoreError::InvalidHandle)?;
    bundle.reconfigure_models(
      decreased_local_idx,
      decreased_model_indices,
      increased_local_idx,
      increased_model_indices,
      &mut self.argument_input,
      &mut self.per_pipeline,
      &mut self.per_model,
      &mut self.argument_output,
      self.frame_count,
      allocator,
      device_properties,
    )
  }

  /// `AllocatedModelCount`: `perModelBuffer.Size / stride`. Only ever grows,
  /// since `per_model`'s backing ranges are relinquished but the buffer
  /// itself is never shrunk (spec §4.10 invariant).
  pub fn allocated_model_count(&self) -> u64 {
    self.per_model.size() / std::mem::size_of::<crate::core::pipeline_model_binder::PerModelRecord>() as vk::DeviceSize
  }

  pub fn argument_input_buffer(&self) -> vk::Buffer {
    self.argument_input.buffer()
  }

  pub fn per_pipeline_buffer(&self) -> vk::Buffer {
    self.per_pipeline.buffer()
  }

  pub fn per_model_buffer(&self) -> vk::Buffer {
    self.per_model.buffer()
  }

  pub fn argument_output_buffer(&self) -> vk::Buffer {
    self.argument_output.buffer()
  }

  pub fn counter_buffer(&self, frame_index: u32) -> vk::Buffer {
    self.counter_buffers[frame_index as usize].buffer()
  }

  pub fn clean_up(self, allocator: &mut Allocator) {
    self.argument_input.clean_up(allocator);
    self.per_pipeline.clean_up(allocator);
    self.per_model.clean_up(allocator);
    self.argument_output.clean_up(allocator);
    for counter in self.counter_buffers {
      counter.clean_up(allocator);
    }
    if let Some(reset_buffer) = self.reset_buffer {
      reset_buffer.clean_up(allocator);
    }
  }

  /// `vkCmdCopyBuffer` a zero-filled reset buffer over the counter buffer,
  /// then a `TRANSFER_WRITE -> SHADER_READ` barrier on `COMPUTE_SHADER`. The
  /// reset buffer auto-grows to the counter buffer's size.
  pub fn reset_counter_buffer(
    &mut self, compute_cmd: vk::CommandBuffer, frame_index: u32, device: &ash::Device,
    allocator: &mut Allocator, device_properties: &DeviceProperties,
  ) -> RenderCoreResult<()> {
    let counter = &self.counter_buffers[frame_index as usize];
    let needed_size = counter.size();
    let needs_grow = self.reset_buffer.as_ref().map_or(true, |r| r.size() < needed_size);
    if needs_grow {
      if let Some(old) = self.reset_buffer.take() {
        old.clean_up(allocator);
      }
      self.reset_buffer = Some(ResourceView::create_buffer(
        self.device.clone(),
        allocator,
        needed_size + RESET_BUFFER_GROWTH_EXTRA,
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryType::HostCoherent,
        0,
        device_properties,
      )?);
      if let Some(ptr) = self.reset_buffer.as_ref().unwrap().mapped_ptr() {
        unsafe { std::ptr::write_bytes(ptr, 0, needed_size as usize) };
      }
    }
    let reset_buffer = self.reset_buffer.as_ref().unwrap();
    let region = vk::BufferCopy::builder().size(needed_size).build();
    unsafe {
      device.cmd_copy_buffer(compute_cmd, reset_buffer.buffer(), counter.buffer(), &[region]);
      let barrier = vk::BufferMemoryBarrier::builder()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE)
        .buffer(counter.buffer())
        .size(needed_size)
        .build();
      device.cmd_pipeline_barrier(
        compute_cmd,
        vk::PipelineStageFlags::TRANSFER,
        vk::PipelineStageFlags::COMPUTE_SHADER,
        vk::DependencyFlags::empty(),
        &[],
        &[barrier],
        &[],
      );
    }
    Ok(())
  }

  /// Push-constants `{allocatedModelCount}` and `vkCmdDispatch` the culling
  /// shader over `ceil(allocatedModelCount / CULLING_COMPUTE_BLOCK_SIZE)`
  /// workgroups.
  pub fn dispatch(&self, compute_cmd: vk::CommandBuffer, device: &ash::Device, pipeline_layout: vk::PipelineLayout) {
    let allocated = self.allocated_model_count() as u32;
    let group_count = (allocated + crate::config::CULLING_COMPUTE_BLOCK_SIZE - 1)
      / crate::config::CULLING_COMPUTE_BLOCK_SIZE;
    unsafe {
      device.cmd_push_constants(
        compute_cmd,
        pipeline_layout,
        vk::ShaderStageFlags::COMPUTE,
        0,
        std::slice::from_raw_parts(&allocated as *const u32 as *const u8, 4),
      );
      device.cmd_dispatch(compute_cmd, group_count.max(1), 1, 1);
    }
  }

  /// Returns the buffer `argument_output`'s grow-copy just replaced, if any,
  /// for the caller to push onto the frame-retired queue.
  #[must_use]
  pub fn copy_old_buffers(&mut self, cmd: vk::CommandBuffer) -> Option<ResourceView> {
    self.argument_output.copy_old_buffer(cmd)
  }

  /// Re-walks a pipeline's current membership and rewrites its
  /// `argumentInput`/`perModel`/`perPipeline` records ahead of the culling
  /// dispatch (spec §4.10 `Update`).
  pub fn update_pipeline(
    &mut self, bundle_index: u32, local_idx: u32, mesh_mgr: &MeshManagerVsIndirect, mesh_bundle_index: u32,
    model_buffers: &ModelBuffers, skip_culling: bool,
  ) -> RenderCoreResult<()> {
    let bundle = self.bundles.get(bundle_index).ok_or(RenderCoreError::InvalidHandle)?;
    let pipeline_index = bundle.pipeline_index(local_idx).ok_or(RenderCoreError::InvalidHandle)?;
    let model_indices = bundle.model_indices(local_idx).ok_or(RenderCoreError::InvalidHandle)?.to_vec();
    let mut details = Vec::with_capacity(model_indices.len());
    for &handle in &model_indices {
      let model = model_buffers.get(handle).ok_or(RenderCoreError::InvalidHandle)?;
      let mesh_details = mesh_mgr
        .mesh_details(mesh_bundle_index, model.mesh_index)
        .ok_or(RenderCoreError::InvalidHandle)?;
      details.push(*mesh_details);
    }
    let cs = bundle.cs_indirect(local_idx).ok_or(RenderCoreError::InvalidHandle)?;
    cs.update(&self.argument_input, &self.per_model, pipeline_index, &model_indices, &details, skip_culling);
    cs.update_non_per_frame_data(&self.per_pipeline, model_indices.len() as u32);
    Ok(())
  }

  /// `DrawPipeline` (spec §4.10): binds the shared vertex/index buffers, then
  /// `vkCmdDrawIndexedIndirectCount` over whatever the culling pass wrote.
  pub fn draw_pipeline(
    &self, bundle_index: u32, local_idx: u32, frame_index: usize, cmd: vk::CommandBuffer, device: &ash::Device,
    pipeline_layout: vk::PipelineLayout, mesh_mgr: &MeshManagerVsIndirect,
  ) -> RenderCoreResult<()> {
    let bundle = self.bundles.get(bundle_index).ok_or(RenderCoreError::InvalidHandle)?;
    let vs_indirect = bundle.vs_indirect(local_idx).ok_or(RenderCoreError::InvalidHandle)?;
    let model_offset = bundle
      .cs_indirect(local_idx)
      .and_then(|cs| cs.model_offset())
      .unwrap_or(0);
    let model_count = bundle.model_count(local_idx).unwrap_or(0) as u32;
    unsafe {
      device.cmd_bind_vertex_buffers(cmd, 0, &[mesh_mgr.vertex_buffer_handle()], &[0]);
      device.cmd_bind_index_buffer(cmd, mesh_mgr.index_buffer_handle(), 0, vk::IndexType::UINT32);
    }
    vs_indirect.record_draw(
      cmd,
      device,
      pipeline_layout,
      frame_index,
      model_offset,
      self.argument_output_buffer(),
      self.counter_buffer(frame_index as u32),
      0,
      model_count,
    );
    Ok(())
  }
}

static_assertions::assert_eq_size!(DrawIndexedIndirectCommand, [u8; 20]);
