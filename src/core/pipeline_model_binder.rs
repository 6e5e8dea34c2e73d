//! Pipeline-Model Binder (spec §4.8): per-pipeline list of model references.
//! Three variants matching the Mesh Manager's three drawing strategies, plus
//! the GPU-side half of the indirect pair.

use crate::{
  config::DeviceProperties,
  core::{
    allocator::Allocator,
    mesh_manager::MeshDetails,
    shared_buffer::{SharedBufferData, SharedBufferGpu, SharedBufferWriteOnly},
  },
  error::RenderCoreResult,
};
use ash::vk;

/// One model's push-constant payload for the individual vertex-shader path.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct VsIndividualPushConstants {
  pub model_buffer_index: u32,
}

/// One model's push-constant payload for the mesh-shader path.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct MsIndividualPushConstants {
  pub meshlet_count: u32,
  pub meshlet_offset: u32,
  pub index_offset: u32,
  pub primitive_offset: u32,
  pub vertex_offset: u32,
  pub model_buffer_index: u32,
}

/// Per-model `VkDrawIndexedIndirectCommand`-shaped record the culling compute
/// shader reads and, if the model survives culling, copies verbatim into
/// `argumentOutput`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct DrawIndexedIndirectCommand {
  pub index_count: u32,
  pub instance_count: u32,
  pub first_index: u32,
  pub vertex_offset: i32,
  pub first_instance: u32,
}

bitflags::bitflags! {
  #[derive(Default)]
  pub struct ModelFlags: u32 {
    const VISIBLE = 0b01;
    const SKIP_CULLING = 0b10;
  }
}

/// `{modelCount, modelOffset, modelBundleIndex}`, one per pipeline, consumed
/// by the culling shader to know which slice of `perModel`/`argumentOutput`
/// belongs to it.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct PerPipelineRecord {
  pub model_count: u32,
  pub model_offset: u32,
  pub model_bundle_index: u32,
}

/// `{pipelineIndex, modelIndex, modelFlags}`, one per model slot, read by the
/// culling shader at `dispatch-thread-id`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct PerModelRecord {
  pub pipeline_index: u32,
  pub model_index: u32,
  pub model_flags: u32,
}

/// Binds models directly with `vkCmdDrawIndexed`, one call per model.
pub struct PipelineModelsVsIndividual {
  pub model_indices: Vec<u32>,
}

impl PipelineModelsVsIndividual {
  pub fn new() -> Self {
    Self { model_indices: Vec::new() }
  }

  pub fn record_draws(
    &self, cmd: vk::CommandBuffer, device: &ash::Device, pipeline_layout: vk::PipelineLayout,
    model_buffer_indices: &[u32], mesh_details: &[MeshDetails],
  ) {
    for (&model_buffer_index, details) in model_buffer_indices.iter().zip(mesh_details) {
      let push = VsIndividualPushConstants { model_buffer_index };
      unsafe {
        device.cmd_push_constants(
          cmd,
          pipeline_layout,
          vk::ShaderStageFlags::VERTEX,
          0,
          bytes_of(&push),
        );
        device.cmd_draw_indexed(cmd, details.index_count, 1, details.index_offset, details.vertex_offset as i32, 0);
      }
    }
  }
}

/// Binds models via task/mesh shader dispatch, one call per model.
pub struct PipelineModelsMsIndividual {
  pub model_indices: Vec<u32>,
}

impl PipelineModelsMsIndividual {
  pub fn new() -> Self {
    Self { model_indices: Vec::new() }
  }

  pub fn record_draws(
    &self, cmd: vk::CommandBuffer, device: &ash::Device, loader: &ash::extensions::ext::MeshShader,
    pipeline_layout: vk::PipelineLayout, model_buffer_indices: &[u32], mesh_details: &[MeshDetails],
  ) {
    for (&model_buffer_index, details) in model_buffer_indices.iter().zip(mesh_details) {
      let push = MsIndividualPushConstants {
        meshlet_count: details.meshlet_count,
        meshlet_offset: details.meshlet_offset,
        index_offset: details.index_offset,
        primitive_offset: details.primitive_offset,
        vertex_offset: details.vertex_offset,
        model_buffer_index,
      };
      let group_count =
        (details.meshlet_count + crate::config::MESHLET_TASK_INVOCATIONS - 1) / crate::config::MESHLET_TASK_INVOCATIONS;
      unsafe {
        device.cmd_push_constants(
          cmd,
          pipeline_layout,
          vk::ShaderStageFlags::TASK_EXT | vk::ShaderStageFlags::MESH_EXT,
          0,
          bytes_of(&push),
        );
        loader.cmd_draw_mesh_tasks(cmd, group_count.max(1), 1, 1);
      }
    }
  }
}

/// CPU-visible half of the GPU-culled indirect path: argument-input,
/// per-pipeline, and per-model records, all in `SharedBufferWriteOnly`s owned
/// by the model manager and shared across every binder of that manager.
pub struct PipelineModelsCsIndirect {
  pub allocation: Option<SharedBufferData>,
  pub per_model_allocation: Option<SharedBufferData>,
  pub per_pipeline_allocation: Option<SharedBufferData>,
  pub model_bundle_index: u32,
}

impl PipelineModelsCsIndirect {
  pub fn new(model_bundle_index: u32) -> Self {
    Self {
      allocation: None,
      per_model_allocation: None,
      per_pipeline_allocation: None,
      model_bundle_index,
    }
  }

  /// Relinquishes the current allocation (if any) and carves a fresh one
  /// sized for `model_count` models, per spec: "if already allocated,
  /// relinquish and re-allocate to the new model count".
  pub fn allocate_buffers(
    &mut self, model_count: usize, argument_input: &mut SharedBufferWriteOnly,
    per_pipeline: &mut SharedBufferWriteOnly, per_model: &mut SharedBufferWriteOnly,
    allocator: &mut Allocator, device_properties: &DeviceProperties,
  ) -> RenderCoreResult<()> {
    if let Some(old) = self.allocation.take() {
      argument_input.relinquish_memory(old);
    }
    if let Some(old) = self.per_model_allocation.take() {
      per_model.relinquish_memory(old);
    }
    if let Some(old) = self.per_pipeline_allocation.take() {
      per_pipeline.relinquish_memory(old);
    }
    let arg_size = (model_count * std::mem::size_of::<DrawIndexedIndirectCommand>()) as vk::DeviceSize;
    self.allocation = Some(argument_input.allocate_and_get_shared_data(arg_size, allocator, device_properties)?);
    let per_model_size = (model_count * std::mem::size_of::<PerModelRecord>()) as vk::DeviceSize;
    self.per_model_allocation =
      Some(per_model.allocate_and_get_shared_data(per_model_size, allocator, device_properties)?);
    self.per_pipeline_allocation = Some(per_pipeline.allocate_and_get_shared_data(
      std::mem::size_of::<PerPipelineRecord>() as vk::DeviceSize,
      allocator,
      device_properties,
    )?);
    Ok(())
  }

  pub fn update_non_per_frame_data(&self, per_pipeline: &SharedBufferWriteOnly, model_count: u32) {
    let Some(allocation) = self.allocation else { return };
    let Some(per_pipeline_allocation) = self.per_pipeline_allocation else { return };
    let Some(ptr) = per_pipeline.mapped_ptr() else { return };
    let record = PerPipelineRecord {
      model_count,
      model_offset: (allocation.offset / std::mem::size_of::<DrawIndexedIndirectCommand>() as vk::DeviceSize) as u32,
      model_bundle_index: self.model_bundle_index,
    };
    unsafe {
      let dst = ptr.add(per_pipeline_allocation.offset as usize) as *mut PerPipelineRecord;
      dst.write_unaligned(record);
    }
  }

  /// Writes one argument-input + one per-model record per contained model.
  pub fn update(
    &self, argument_input: &SharedBufferWriteOnly, per_model: &SharedBufferWriteOnly, pipeline_index: u32,
    model_buffer_indices: &[u32], mesh_details: &[MeshDetails], skip_culling: bool,
  ) {
    let Some(allocation) = self.allocation else { return };
    let Some(per_model_allocation) = self.per_model_allocation else { return };
    let Some(arg_ptr) = argument_input.mapped_ptr() else { return };
    let Some(model_ptr) = per_model.mapped_ptr() else { return };
    let mut flags = ModelFlags::VISIBLE;
    if skip_culling {
      flags |= ModelFlags::SKIP_CULLING;
    }
    for (slot, (&model_buffer_index, details)) in model_buffer_indices.iter().zip(mesh_details).enumerate() {
      let command = DrawIndexedIndirectCommand {
        index_count: details.index_count,
        instance_count: 1,
        first_index: details.index_offset,
        vertex_offset: details.vertex_offset as i32,
        first_instance: 0,
      };
      let per_model_record = PerModelRecord {
        pipeline_index,
        model_index: model_buffer_index,
        model_flags: flags.bits(),
      };
      unsafe {
        let arg_dst = arg_ptr.add(allocation.offset as usize)
          .add(slot * std::mem::size_of::<DrawIndexedIndirectCommand>()) as *mut DrawIndexedIndirectCommand;
        arg_dst.write_unaligned(command);
        let model_dst = model_ptr
          .add(per_model_allocation.offset as usize)
          .add(slot * std::mem::size_of::<PerModelRecord>()) as *mut PerModelRecord;
        model_dst.write_unaligned(per_model_record);
      }
    }
  }

  pub fn model_offset(&self) -> Option<u32> {
    self
      .allocation
      .map(|a| (a.offset / std::mem::size_of::<DrawIndexedIndirectCommand>() as vk::DeviceSize) as u32)
  }
}

/// GPU side of the indirect pair: per-frame `{argumentOutput, counter,
/// modelIndices}` GPU-only slices sized to this pipeline's model count.
pub struct PipelineModelsVsIndirect {
  pub allocations: Vec<SharedBufferData>,
}

impl PipelineModelsVsIndirect {
  pub fn new() -> Self {
    Self { allocations: Vec::new() }
  }

  pub fn allocate_buffers(
    &mut self, model_count: usize, frame_count: u32, argument_output: &mut SharedBufferGpu,
    allocator: &mut Allocator, device_properties: &DeviceProperties,
  ) -> RenderCoreResult<()> {
    for old in self.allocations.drain(..) {
      argument_output.relinquish_memory(old);
    }
    let size = (model_count * std::mem::size_of::<DrawIndexedIndirectCommand>()) as vk::DeviceSize;
    for _ in 0..frame_count {
      self
        .allocations
        .push(argument_output.allocate_and_get_shared_data(size, allocator, device_properties)?);
    }
    Ok(())
  }

  /// `vkCmdDrawIndexedIndirectCount` for frame `frame_index`, after
  /// push-constanting this pipeline's `model_offset`.
  pub fn record_draw(
    &self, cmd: vk::CommandBuffer, device: &ash::Device, pipeline_layout: vk::PipelineLayout,
    frame_index: usize, model_offset: u32, argument_output: vk::Buffer, counter_buffer: vk::Buffer,
    counter_offset: vk::DeviceSize, model_count: u32,
  ) {
    let Some(allocation) = self.allocations.get(frame_index) else { return };
    unsafe {
      device.cmd_push_constants(
        cmd,
        pipeline_layout,
        vk::ShaderStageFlags::VERTEX,
        0,
        bytes_of(&model_offset),
      );
      device.cmd_draw_indexed_indirect_count(
        cmd,
        argument_output,
        allocation.offset,
        counter_buffer,
        counter_offset,
        model_count,
        std::mem::size_of::<DrawIndexedIndirectCommand>() as u32,
      );
    }
  }
}

fn bytes_of<T>(value: &T) -> &[u8] {
  unsafe { std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>()) }
}

/// State machine a binder slot moves through as its model count changes
/// (spec §4.9): `Empty -> Allocated(N) -> Allocated(N') -> Empty`. `capacity`
/// is the model count its shared-buffer ranges are actually sized for, kept
/// distinct from the live `model_count` so a binder that shrinks and later
/// regrows within its old footprint reuses it (`N' <= capacity`) instead of
/// forgetting how big its range used to be.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinderState {
  Empty,
  Allocated { model_count: usize, capacity: usize },
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn binder_state_starts_empty() {
    assert_eq!(BinderState::Empty, BinderState::Empty);
    let allocated = BinderState::Allocated { model_count: 4, capacity: 4 };
    assert_ne!(allocated, BinderState::Empty);
  }
}
