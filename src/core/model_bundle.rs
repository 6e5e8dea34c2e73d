//! Model Bundles (spec §4.9): a group of models split across pipelines,
//! owning per-pipeline binders and handling migration of a model between
//! partitions.

use crate::{
  config::DeviceProperties,
  core::{
    allocator::Allocator,
    pipeline_model_binder::{BinderState, DrawIndexedIndirectCommand, PipelineModelsCsIndirect, PipelineModelsVsIndirect},
    shared_buffer::{SharedBufferGpu, SharedBufferWriteOnly},
  },
  error::RenderCoreResult,
  handles::ReusableVector,
};
use ash::vk;
use log::info;

/// One pipeline partition as the embedder describes it: which pipeline, and
/// which of the bundle's model indices currently belong to it.
pub struct PipelinePartition {
  pub pipeline_index: u32,
  pub model_indices_in_bundle: Vec<u32>,
}

pub struct SourceModelBundle {
  pub models: Vec<u32>,
  pub partitions: Vec<PipelinePartition>,
  /// Global mesh-bundle handle (as returned by `AddMeshBundle`) backing every
  /// model's `mesh-index` in this bundle. Grounded on the original's
  /// `ModelBundle::GetMeshBundleIndex()`, read by the model manager to look
  /// up `MeshDetails` at draw/update time.
  pub mesh_bundle_index: u32,
}

struct BinderSlot {
  state: BinderState,
  pipeline_index: u32,
  cs_indirect: PipelineModelsCsIndirect,
  vs_indirect: PipelineModelsVsIndirect,
  /// The partition's current membership, kept around so `Update` can
  /// re-walk it every frame without the embedder re-supplying it.
  model_indices_in_bundle: Vec<u32>,
}

/// Group of models split across pipelines (spec §3 `ModelBundle`). Used by
/// the indirect model manager; the VS-individual and MS managers keep a
/// simpler per-pipeline model-index list directly (no shared-buffer binder
/// bookkeeping needed since those variants draw per model, not indirectly).
pub struct ModelBundleIndirect {
  pipelines: ReusableVector<BinderSlot>,
  pub models: Vec<u32>,
}

impl ModelBundleIndirect {
  pub fn new() -> Self {
    Self {
      pipelines: ReusableVector::new(),
      models: Vec::new(),
    }
  }

  /// Mirrors every partition of `source` not yet present locally, allocating
  /// a binder slot and its shared-buffer ranges for each.
  #[allow(clippy::too_many_arguments)]
  pub fn add_new_pipelines_from_bundle(
    &mut self, bundle_index: u32, source: &SourceModelBundle, argument_input: &mut SharedBufferWriteOnly,
    per_pipeline: &mut SharedBufferWriteOnly, per_model: &mut SharedBufferWriteOnly,
    argument_output: &mut SharedBufferGpu, frame_count: u32, allocator: &mut Allocator,
    device_properties: &DeviceProperties,
  ) -> RenderCoreResult<Vec<u32>> {
    self.models = source.models.clone();
    let mut new_local_indices = Vec::new();
    for partition in &source.partitions {
      let slot = BinderSlot {
        state: BinderState::Empty,
        pipeline_index: partition.pipeline_index,
        cs_indirect: PipelineModelsCsIndirect::new(bundle_index),
        vs_indirect: PipelineModelsVsIndirect::new(),
        model_indices_in_bundle: partition.model_indices_in_bundle.clone(),
      };
      let local_idx = self.pipelines.add(slot);
      let result = self.setup_pipeline_buffers(
        local_idx,
        partition.model_indices_in_bundle.len(),
        argument_input,
        per_pipeline,
        per_model,
        argument_output,
        frame_count,
        allocator,
        device_properties,
      );
      if let Err(err) = result {
        self.pipelines.remove(local_idx);
        return Err(err);
      }
      new_local_indices.push(local_idx);
    }
    Ok(new_local_indices)
  }

  /// A model moved from the partition at `decreased_local_idx` to
  /// `increased_local_idx`; re-run `SetupPipelineBuffers` on both binders
  /// with their updated membership. Binders stay at their existing slot (no
  /// remove/re-add) so `setup_pipeline_buffers`'s buffer-position search sees
  /// every other live binder, including the one being resized.
  #[allow(clippy::too_many_arguments)]
  pub fn reconfigure_models(
    &mut self, decreased_local_idx: u32, decreased_model_indices: Vec<u32>, increased_local_idx: u32,
    increased_model_indices: Vec<u32>, argument_input: &mut SharedBufferWriteOnly,
    per_pipeline: &mut SharedBufferWriteOnly, per_model: &mut SharedBufferWriteOnly,
    argument_output: &mut SharedBufferGpu, frame_count: u32, allocator: &mut Allocator,
    device_properties: &DeviceProperties,
  ) -> RenderCoreResult<()> {
    if self.pipelines.contains(decreased_local_idx) {
      let model_count = decreased_model_indices.len();
      self.setup_pipeline_buffers(
        decreased_local_idx,
        model_count,
        argument_input,
        per_pipeline,
        per_model,
        argument_output,
        frame_count,
        allocator,
        device_properties,
      )?;
      if let Some(slot) = self.pipelines.get_mut(decreased_local_idx) {
        slot.model_indices_in_bundle = decreased_model_indices;
      }
    }
    if self.pipelines.contains(increased_local_idx) {
      let model_count = increased_model_indices.len();
      self.setup_pipeline_buffers(
        increased_local_idx,
        model_count,
        argument_input,
        per_pipeline,
        per_model,
        argument_output,
        frame_count,
        allocator,
        device_properties,
      )?;
      if let Some(slot) = self.pipelines.get_mut(increased_local_idx) {
        slot.model_indices_in_bundle = increased_model_indices;
      }
    }
    Ok(())
  }

  /// The offset this binder's argument-input range starts at, used as a
  /// proxy for its position in every shared buffer this bundle packs (all
  /// four are grown/packed together per binder, so their relative order
  /// matches). `None` for a binder that has never been allocated.
  fn binder_start_offset(&self, local_idx: u32) -> Option<vk::DeviceSize> {
    self.pipelines.get(local_idx)?.cs_indirect.allocation.map(|a| a.offset)
  }

  /// The offset immediately past this binder's own live data in
  /// `argument_output`, i.e. where its "addable" free space (if any) begins.
  /// Unlike `binder_start_offset` (an `argument_input`-space proxy used only
  /// to order binders), this reads `vs_indirect`'s own allocations since
  /// `addable_capacity_after` is queried against `argument_output` directly
  /// and the two buffers' free lists live in unrelated address spaces.
  fn binder_live_end(&self, local_idx: u32) -> vk::DeviceSize {
    self
      .pipelines
      .get(local_idx)
      .map(|s| s.vs_indirect.allocations.iter().map(|a| a.end()).max().unwrap_or(0))
      .unwrap_or(0)
  }

  /// Whether no other live binder's range starts after this one's -- i.e.
  /// this binder sits at the tail of the packed buffers and growing it needs
  /// no one else to move (spec §4.9: "if the binder is the last one, allocate
  /// its own slice at buffer end").
  fn is_last_binder(&self, local_idx: u32) -> bool {
    let Some(this_offset) = self.binder_start_offset(local_idx) else {
      return true;
    };
    !self
      .pipelines
      .iter()
      .any(|(idx, other)| idx != local_idx && other.cs_indirect.allocation.map_or(false, |a| a.offset > this_offset))
  }

  /// Every local index whose range starts at or after `local_idx`'s, ordered
  /// by that start offset -- the binders `RecreateFollowingPipelines`/
  /// `ResizePreviousPipelines` must repack when `local_idx` grows past its
  /// current capacity and isn't last.
  fn binders_from(&self, local_idx: u32) -> Vec<u32> {
    let this_offset = self.binder_start_offset(local_idx).unwrap_or(0);
    let mut ordered: Vec<(vk::DeviceSize, u32)> = self
      .pipelines
      .iter()
      .filter_map(|(idx, slot)| {
        let offset = slot.cs_indirect.allocation.map(|a| a.offset).unwrap_or(0);
        (idx == local_idx || offset > this_offset).then_some((offset, idx))
      })
      .collect();
    ordered.sort_by_key(|&(offset, _)| offset);
    ordered.into_iter().map(|(_, idx)| idx).collect()
  }

  /// Allocates (or re-allocates, if the binder already held a slice) this
  /// binder's shared-buffer ranges for `model_count` models, following spec
  /// §4.9's `SetupPipelineBuffers`:
  /// - shrinking (or regrowing) within the binder's already-allocated
  ///   capacity reuses the range in place (`Allocated(N) -> Allocated(N')`
  ///   when `N' <= N`);
  /// - otherwise, if this binder is last, it grows its own slice at the
  ///   buffer's end -- no other binder is touched;
  /// - otherwise, every binder from this one onward (in buffer-position
  ///   order) is relinquished and re-allocated in that same order.
  ///   `SharedBufferGpu::addable_capacity_after` tells the caller whether
  ///   that repack fits in the free space already past this binder
  ///   (`ResizePreviousPipelines`) or will force `argument_output` to extend
  ///   (`RecreateFollowingPipelines`); either way the repack loop below is
  ///   the same, since `allocate_and_get_shared_data` extends automatically
  ///   when the free list can't satisfy a request.
  #[allow(clippy::too_many_arguments)]
  fn setup_pipeline_buffers(
    &mut self, local_idx: u32, model_count: usize, argument_input: &mut SharedBufferWriteOnly,
    per_pipeline: &mut SharedBufferWriteOnly, per_model: &mut SharedBufferWriteOnly,
    argument_output: &mut SharedBufferGpu, frame_count: u32, allocator: &mut Allocator,
    device_properties: &DeviceProperties,
  ) -> RenderCoreResult<()> {
    let current_capacity = match self.pipelines.get(local_idx).map(|s| s.state) {
      Some(BinderState::Allocated { capacity, .. }) => capacity,
      _ => 0,
    };

    if model_count <= current_capacity {
      if let Some(slot) = self.pipelines.get_mut(local_idx) {
        slot.state = if model_count == 0 {
          BinderState::Empty
        } else {
          BinderState::Allocated { model_count, capacity: current_capacity }
        };
      }
      return Ok(());
    }

    if self.is_last_binder(local_idx) {
      return self.reallocate_one(
        local_idx,
        model_count,
        argument_input,
        per_pipeline,
        per_model,
        argument_output,
        frame_count,
        allocator,
        device_properties,
      );
    }

    let needed_additional =
      ((model_count - current_capacity) * std::mem::size_of::<DrawIndexedIndirectCommand>()) as vk::DeviceSize
        * frame_count as vk::DeviceSize;
    let live_end = self.binder_live_end(local_idx);
    if argument_output.addable_capacity_after(live_end) >= needed_additional {
      info!(
        "binder {} grows to {} models within existing addable capacity; repacking in place (ResizePreviousPipelines)",
        local_idx, model_count
      );
    } else {
      info!(
        "binder {} grows to {} models beyond addable capacity; repacking and growing shared buffers (RecreateFollowingPipelines)",
        local_idx, model_count
      );
    }

    let to_repack = self.binders_from(local_idx);
    let targets: Vec<(u32, usize)> = to_repack
      .into_iter()
      .map(|idx| {
        if idx == local_idx {
          (idx, model_count)
        } else {
          let n = match self.pipelines.get(idx).map(|s| s.state) {
            Some(BinderState::Allocated { model_count, .. }) => model_count,
            _ => 0,
          };
          (idx, n)
        }
      })
      .collect();

    for &(idx, _) in &targets {
      if let Some(slot) = self.pipelines.get_mut(idx) {
        if let Some(allocation) = slot.cs_indirect.allocation.take() {
          argument_input.relinquish_memory(allocation);
        }
        if let Some(allocation) = slot.cs_indirect.per_model_allocation.take() {
          per_model.relinquish_memory(allocation);
        }
        if let Some(allocation) = slot.cs_indirect.per_pipeline_allocation.take() {
          per_pipeline.relinquish_memory(allocation);
        }
        for allocation in slot.vs_indirect.allocations.drain(..) {
          argument_output.relinquish_memory(allocation);
        }
      }
    }
    for (idx, target_model_count) in targets {
      self.reallocate_one(
        idx,
        target_model_count,
        argument_input,
        per_pipeline,
        per_model,
        argument_output,
        frame_count,
        allocator,
        device_properties,
      )?;
    }
    Ok(())
  }

  /// Carves a fresh range for `local_idx` sized to `model_count`, assuming
  /// its previous range (if any) has already been relinquished by the
  /// caller. Used both for a brand-new binder and for the last-binder fast
  /// path where no one else needs to move.
  #[allow(clippy::too_many_arguments)]
  fn reallocate_one(
    &mut self, local_idx: u32, model_count: usize, argument_input: &mut SharedBufferWriteOnly,
    per_pipeline: &mut SharedBufferWriteOnly, per_model: &mut SharedBufferWriteOnly,
    argument_output: &mut SharedBufferGpu, frame_count: u32, allocator: &mut Allocator,
    device_properties: &DeviceProperties,
  ) -> RenderCoreResult<()> {
    let Some(slot) = self.pipelines.get_mut(local_idx) else {
      return Ok(());
    };
    slot
      .cs_indirect
      .allocate_buffers(model_count, argument_input, per_pipeline, per_model, allocator, device_properties)?;
    slot
      .vs_indirect
      .allocate_buffers(model_count, frame_count, argument_output, allocator, device_properties)?;
    slot.state = if model_count == 0 {
      BinderState::Empty
    } else {
      BinderState::Allocated { model_count, capacity: model_count }
    };
    Ok(())
  }

  /// Relinquishes every slice owned by every binder and resets the bundle.
  pub fn cleanup_data(
    &mut self, argument_input: &mut SharedBufferWriteOnly, per_model: &mut SharedBufferWriteOnly,
    per_pipeline: &mut SharedBufferWriteOnly, argument_output: &mut SharedBufferGpu,
  ) {
    let slots: Vec<u32> = self.pipelines.iter().map(|(idx, _)| idx).collect();
    for idx in slots {
      if let Some(slot) = self.pipelines.remove(idx) {
        if let Some(allocation) = slot.cs_indirect.allocation {
          argument_input.relinquish_memory(allocation);
        }
        if let Some(allocation) = slot.cs_indirect.per_model_allocation {
          per_model.relinquish_memory(allocation);
        }
        if let Some(allocation) = slot.cs_indirect.per_pipeline_allocation {
          per_pipeline.relinquish_memory(allocation);
        }
        for allocation in slot.vs_indirect.allocations {
          argument_output.relinquish_memory(allocation);
        }
      }
    }
  }

  pub fn local_indices(&self) -> impl Iterator<Item = u32> + '_ {
    self.pipelines.iter().map(|(idx, _)| idx)
  }

  pub fn pipeline_index(&self, local_idx: u32) -> Option<u32> {
    self.pipelines.get(local_idx).map(|s| s.pipeline_index)
  }

  pub fn cs_indirect(&self, local_idx: u32) -> Option<&PipelineModelsCsIndirect> {
    self.pipelines.get(local_idx).map(|s| &s.cs_indirect)
  }

  pub fn vs_indirect(&self, local_idx: u32) -> Option<&PipelineModelsVsIndirect> {
    self.pipelines.get(local_idx).map(|s| &s.vs_indirect)
  }

  pub fn model_indices(&self, local_idx: u32) -> Option<&[u32]> {
    self.pipelines.get(local_idx).map(|s| s.model_indices_in_bundle.as_slice())
  }

  pub fn model_count(&self, local_idx: u32) -> Option<usize> {
    match self.pipelines.get(local_idx)?.state {
      BinderState::Empty => Some(0),
      BinderState::Allocated { model_count, .. } => Some(model_count),
    }
  }
}

/// A handle into `vk::CommandBuffer` recording is out of scope here; this
/// type only tracks which pipeline a push-constant-driven individual binder
/// belongs to, for the VS-individual/MS model managers (spec §4.9's simpler
/// non-indirect bookkeeping).
pub struct ModelBundleIndividual {
  pub partitions: Vec<PipelinePartition>,
  pub models: Vec<u32>,
}

impl ModelBundleIndividual {
  pub fn new(source: SourceModelBundle) -> Self {
    Self {
      partitions: source.partitions,
      models: source.models,
    }
  }

  /// Mirrors [`ModelBundleIndirect::reconfigure_models`]'s membership move for
  /// the non-indirect variants, which own no shared-buffer ranges to resize --
  /// moving a model between partitions is just updating the two
  /// `model_indices_in_bundle` lists `DrawPipeline` walks.
  pub fn reconfigure_models(
    &mut self, decreased_local_idx: usize, decreased_model_indices: Vec<u32>, increased_local_idx: usize,
    increased_model_indices: Vec<u32>,
  ) {
    if let Some(partition) = self.partitions.get_mut(decreased_local_idx) {
      partition.model_indices_in_bundle = decreased_model_indices;
    }
    if let Some(partition) = self.partitions.get_mut(increased_local_idx) {
      partition.model_indices_in_bundle = increased_model_indices;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn binder_slot_shrink_reuses_allocation_marker() {
    let state = BinderState::Allocated { model_count: 10, capacity: 10 };
    let shrink_to = 4;
    let reuse = matches!(state, BinderState::Allocated { capacity, .. } if shrink_to <= capacity);
    assert!(reuse, "shrinking within existing capacity must reuse in place");
  }

  #[test]
  fn regrow_within_old_capacity_reuses_allocation_marker() {
    let shrunk = BinderState::Allocated { model_count: 4, capacity: 10 };
    let regrow_to = 8;
    let reuse = matches!(shrunk, BinderState::Allocated { capacity, .. } if regrow_to <= capacity);
    assert!(
      reuse,
      "regrowing within the binder's original capacity must not force a reallocation"
    );
  }
}
