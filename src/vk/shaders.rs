//! Shader loading (spec §6 "Persisted state"): `.spv` modules loaded from the
//! directory set via `RendererConfig::shader_path`, keyed by shader name.
//! Grounded on the teacher's `shaders.rs`, with the `slotmap` store replaced
//! by [`ReusableVector`] per §9 Design Notes.

use crate::{
  error::{RenderCoreError, RenderCoreResult},
  handles::ReusableVector,
};
use ash::{vk, Device};
use log::info;
use std::{collections::HashMap, path::Path};

#[derive(Copy, Clone, Debug)]
pub enum ShaderType {
  Vertex,
  Fragment,
  Task,
  Mesh,
  Compute,
}

impl ShaderType {
  fn stage_flag(self) -> vk::ShaderStageFlags {
    match self {
      ShaderType::Vertex => vk::ShaderStageFlags::VERTEX,
      ShaderType::Fragment => vk::ShaderStageFlags::FRAGMENT,
      ShaderType::Task => vk::ShaderStageFlags::TASK_EXT,
      ShaderType::Mesh => vk::ShaderStageFlags::MESH_EXT,
      ShaderType::Compute => vk::ShaderStageFlags::COMPUTE,
    }
  }
}

#[derive(Copy, Clone)]
struct Shader {
  module: vk::ShaderModule,
  shader_type: ShaderType,
}

/// Loads and owns every `VkShaderModule` the renderer has compiled pipelines
/// from, keyed by name so the same `.spv` file is never read or compiled
/// twice.
pub struct ShaderStore {
  loaded: ReusableVector<Shader>,
  by_name: HashMap<String, u32>,
}

impl ShaderStore {
  pub fn new() -> Self {
    Self {
      loaded: ReusableVector::new(),
      by_name: HashMap::new(),
    }
  }

  /// Loads `{shader_path}/{name}.spv` if not already loaded, returning its
  /// handle. Names are relative to `RendererConfig::shader_path`.
  pub fn load_shader(
    &mut self, device: &Device, shader_path: &Path, name: &str, shader_type: ShaderType,
  ) -> RenderCoreResult<ShaderHandle> {
    if let Some(&handle) = self.by_name.get(name) {
      return Ok(ShaderHandle(handle));
    }

    let full_path = shader_path.join(format!("{}.spv", name));
    let bytes = std::fs::read(&full_path).map_err(|_| RenderCoreError::InvalidHandle)?;
    let code = bytes_to_u32_code(&bytes)?;
    let ci = vk::ShaderModuleCreateInfo::builder().code(&code).build();
    let module = unsafe { device.create_shader_module(&ci, None)? };

    info!("loaded shader '{}' from {:?}", name, full_path);
    let idx = self.loaded.add(Shader { module, shader_type });
    self.by_name.insert(name.to_owned(), idx);
    Ok(ShaderHandle(idx))
  }

  pub fn destroy_shader(&mut self, device: &Device, handle: ShaderHandle) -> RenderCoreResult<()> {
    let shader = self.loaded.remove(handle.0).ok_or(RenderCoreError::InvalidHandle)?;
    self.by_name.retain(|_, &mut v| v != handle.0);
    unsafe { device.destroy_shader_module(shader.module, None) };
    Ok(())
  }

  pub fn module(&self, handle: ShaderHandle) -> RenderCoreResult<vk::ShaderModule> {
    self.loaded.get(handle.0).map(|s| s.module).ok_or(RenderCoreError::InvalidHandle)
  }

  pub fn stage_flag(&self, handle: ShaderHandle) -> RenderCoreResult<vk::ShaderStageFlags> {
    self
      .loaded
      .get(handle.0)
      .map(|s| s.shader_type.stage_flag())
      .ok_or(RenderCoreError::InvalidHandle)
  }

  /// Destroys every loaded module. Must only be called once the device is
  /// idle -- the render engine calls this during teardown.
  pub fn destroy_all(&mut self, device: &Device) {
    for (_, shader) in self.loaded.iter() {
      unsafe { device.destroy_shader_module(shader.module, None) };
    }
  }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ShaderHandle(u32);

fn bytes_to_u32_code(bytes: &[u8]) -> RenderCoreResult<Vec<u32>> {
  if bytes.len() % 4 != 0 {
    return Err(RenderCoreError::InvalidHandle);
  }
  Ok(
    bytes
      .chunks_exact(4)
      .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
      .collect(),
  )
}
