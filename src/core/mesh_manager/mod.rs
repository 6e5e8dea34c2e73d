//! Mesh Managers (spec §4.7): three variants that pack vertex/index/meshlet
//! streams into shared GPU buffers. Mapped from the source's CRTP
//! `MeshManager<Derived, Bundle>` base class to a single `MeshManagerOps`
//! trait implemented by three concrete structs (§9 Design Notes).

pub mod mesh_shader;
pub mod vs_indirect;
pub mod vs_individual;

use crate::{
  config::DeviceProperties,
  core::{allocator::Allocator, resource_view::ResourceView, staging::StagingManager},
  error::RenderCoreResult,
};
use ash::vk;
use ultraviolet::Vec3;

pub use mesh_shader::MeshManagerMs;
pub use vs_indirect::MeshManagerVsIndirect;
pub use vs_individual::MeshManagerVsIndividual;

/// A single vertex as consumed by the VS mesh managers: `{float3 pos, float3
/// normal, float2 uv}`, tightly packed.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct Vertex {
  pub position: Vec3,
  pub normal: Vec3,
  pub uv: [f32; 2],
}
static_assertions::assert_eq_size!(Vertex, [u8; 32]);

/// Source mesh data an embedder supplies to `AddMeshBundle`: one or more
/// meshes sharing vertex/index storage.
pub struct MeshBundleSource {
  pub meshes: Vec<MeshSource>,
}

pub struct MeshSource {
  pub vertices: Vec<Vertex>,
  pub indices: Vec<u32>,
  /// Only populated for the mesh-shader variant.
  pub meshlets: Vec<Meshlet>,
  pub vertex_indices_for_meshlets: Vec<u32>,
  pub primitive_indices: Vec<u8>,
  pub aabb_min: Vec3,
  pub aabb_max: Vec3,
}

/// `{meshlet count, offsets, bounds}`: `<= 64` vertices, `<= 124` primitives
/// per the mesh-shader hardware limits named in the glossary.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct Meshlet {
  pub vertex_offset: u32,
  pub vertex_count: u32,
  pub primitive_offset: u32,
  pub primitive_count: u32,
}

/// Per-mesh offsets into the packed shared buffers, in element units of each
/// buffer's stride (spec §3 Data Model, MeshBundle invariant).
#[derive(Copy, Clone, Debug, Default)]
pub struct MeshDetails {
  pub index_offset: u32,
  pub index_count: u32,
  pub vertex_offset: u32,
  pub meshlet_offset: u32,
  pub meshlet_count: u32,
  pub primitive_offset: u32,
  pub aabb_min: Vec3,
  pub aabb_max: Vec3,
}

/// Capability set shared by all three mesh manager variants. `configure_*`
/// pack source data into this manager's shared buffers and stage the
/// uploads; `remove` relinquishes the backing ranges.
pub trait MeshManagerOps {
  /// Packs `source` into shared buffers, staging uploads through
  /// `staging_mgr`, and returns the new bundle's index plus per-mesh details.
  fn add_mesh_bundle(
    &mut self, source: MeshBundleSource, staging_mgr: &mut StagingManager, allocator: &mut Allocator,
    device_properties: &DeviceProperties,
  ) -> RenderCoreResult<u32>;

  /// Relinquishes every range owned by the bundle at `bundle_index`.
  fn remove_mesh_bundle(&mut self, bundle_index: u32);

  /// Per-mesh packed offsets for `bundle_index`, mesh `mesh_index` within it.
  fn mesh_details(&self, bundle_index: u32, mesh_index: u32) -> Option<&MeshDetails>;

  /// Issues the shared-buffer grow-copies accumulated since the last call,
  /// once per frame, ahead of the transfer submission. Returns the buffers
  /// the copies just replaced, for the caller to push onto the frame-retired
  /// queue rather than freeing them while the copy may still be in flight.
  fn copy_old_buffers(&mut self, cmd: vk::CommandBuffer) -> Vec<ResourceView>;
}

/// Bundle bookkeeping shared by all three variants: which `MeshDetails`
/// belong to which bundle.
#[derive(Default)]
pub struct BundleRegistry {
  bundles: crate::handles::ReusableVector<Vec<MeshDetails>>,
}

impl BundleRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, details: Vec<MeshDetails>) -> u32 {
    self.bundles.add(details)
  }

  pub fn remove(&mut self, bundle_index: u32) -> Option<Vec<MeshDetails>> {
    self.bundles.remove(bundle_index)
  }

  pub fn get(&self, bundle_index: u32, mesh_index: u32) -> Option<&MeshDetails> {
    self.bundles.get(bundle_index)?.get(mesh_index as usize)
  }
}
