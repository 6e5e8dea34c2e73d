//! The render-orchestration core (spec §2): the twelve components data flows
//! through from the Render Engine down to the Memory Allocator.

pub mod allocator;
pub mod descriptor_buffer;
pub mod mesh_manager;
pub mod model_buffers;
pub mod model_bundle;
pub mod model_manager;
pub mod pipeline_model_binder;
pub mod render_engine;
pub mod render_pass_manager;
pub mod resource_view;
pub mod shared_buffer;
pub mod staging;
pub mod texture_camera;
