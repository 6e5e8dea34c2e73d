//! Thin Vulkan-specific helpers that sit below the core's subsystems:
//! validation-layer logging, queue family bookkeeping, and shader loading.
//! Device/instance/swapchain creation itself is the embedder's job (spec
//! §1 Non-goals).

pub mod debug_utils;
pub mod queue_family_indices;
pub mod shaders;
