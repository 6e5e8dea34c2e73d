//! Queue Family Manager (spec §3.1, supplemented): resolves `QueueType ->
//! (VkQueue, family index)` once at construction, handed by reference to
//! every subsystem that needs to compare a destination family against the
//! transfer family. Extends the teacher's `QueueFamilyIndices` (graphics
//! only) with the transfer/compute families this engine's three parallel
//! submission queues require.

use ash::vk;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum QueueType {
  Graphics,
  Transfer,
  Compute,
}

/// Family indices resolved once by the embedder (which performs physical
/// device enumeration, out of scope here) and handed to the render engine.
#[derive(Default, Clone)]
pub struct QueueFamilyIndices {
  pub graphics_queue_family: Option<u32>,
  pub transfer_queue_family: Option<u32>,
  /// `None` when the device/embedder chose not to stand up a dedicated
  /// compute queue (vertex-shader-only model managers never dispatch).
  pub compute_queue_family: Option<u32>,
}

impl QueueFamilyIndices {
  /// Complete for every model manager except the indirect variant, which
  /// additionally requires a compute family.
  pub fn is_complete(&self) -> bool {
    self.graphics_queue_family.is_some() && self.transfer_queue_family.is_some()
  }

  pub fn is_complete_for_indirect(&self) -> bool {
    self.is_complete() && self.compute_queue_family.is_some()
  }

  pub fn family_for(&self, queue_type: QueueType) -> Option<u32> {
    match queue_type {
      QueueType::Graphics => self.graphics_queue_family,
      QueueType::Transfer => self.transfer_queue_family,
      QueueType::Compute => self.compute_queue_family,
    }
  }
}

/// Owns the resolved `VkQueue` handles alongside their family indices.
pub struct QueueFamilyManager {
  indices: QueueFamilyIndices,
  graphics_queue: vk::Queue,
  transfer_queue: vk::Queue,
  compute_queue: Option<vk::Queue>,
}

impl QueueFamilyManager {
  pub fn new(
    indices: QueueFamilyIndices, graphics_queue: vk::Queue, transfer_queue: vk::Queue,
    compute_queue: Option<vk::Queue>,
  ) -> Self {
    Self {
      indices,
      graphics_queue,
      transfer_queue,
      compute_queue,
    }
  }

  pub fn queue_for(&self, queue_type: QueueType) -> Option<vk::Queue> {
    match queue_type {
      QueueType::Graphics => Some(self.graphics_queue),
      QueueType::Transfer => Some(self.transfer_queue),
      QueueType::Compute => self.compute_queue,
    }
  }

  pub fn family_for(&self, queue_type: QueueType) -> Option<u32> {
    self.indices.family_for(queue_type)
  }

  pub fn indices(&self) -> &QueueFamilyIndices {
    &self.indices
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn completeness_requires_graphics_and_transfer() {
    let mut indices = QueueFamilyIndices::default();
    assert!(!indices.is_complete());
    indices.graphics_queue_family = Some(0);
    assert!(!indices.is_complete());
    indices.transfer_queue_family = Some(1);
    assert!(indices.is_complete());
    assert!(!indices.is_complete_for_indirect());
    indices.compute_queue_family = Some(2);
    assert!(indices.is_complete_for_indirect());
  }
}
