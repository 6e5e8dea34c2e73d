//! Render-orchestration core for a Vulkan 3D renderer.
//!
//! Owns the data structures the frame loop flows through -- shared GPU
//! buffers, descriptor buffers, mesh/model managers, the staging upload
//! pipeline, and the transfer/compute/graphics submission chain -- while
//! leaving device/instance/swapchain creation and pipeline object creation to
//! the embedder. See [`core::render_engine::RenderEngine`] for the entry
//! point.
#[macro_use]
extern crate derive_builder;

pub mod config;
pub mod core;
pub mod error;
pub mod handles;
pub mod image_data;
pub mod vk;
