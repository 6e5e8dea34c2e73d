//! Texture/Sampler storage and Camera storage (spec §3.1, supplemented from
//! `original_source` since the distilled spec names their operations under
//! §6 but never the backing storage). Owned by the Render Engine.

use crate::{
  core::{descriptor_buffer::DescriptorBuffer, resource_view::ResourceView},
  error::{RenderCoreError, RenderCoreResult},
  handles::ReusableVector,
};
use ash::vk;
use std::collections::HashMap;

/// One registered texture: the image view, plus every descriptor-buffer slot
/// it is currently bound to.
pub struct Texture {
  pub view: ResourceView,
  pub image_view: vk::ImageView,
  pub bound_slots: Vec<(usize, u32, u32)>, // (set_index, slot, descriptor_index)
}

/// Registers textures once, then binds/unbinds them to descriptor-buffer
/// slots. A per-(texture, sampler) cache of already-written descriptor bytes
/// avoids re-issuing `vkGetDescriptorEXT` on rebind (spec §3 Data Model).
pub struct TextureStorage {
  textures: ReusableVector<Texture>,
  unbind_cache: HashMap<(usize, u32), Vec<u8>>,
}

impl TextureStorage {
  pub fn new() -> Self {
    Self {
      textures: ReusableVector::new(),
      unbind_cache: HashMap::new(),
    }
  }

  pub fn add_texture(&mut self, view: ResourceView, image_view: vk::ImageView) -> usize {
    self.textures.add(Texture {
      view,
      image_view,
      bound_slots: Vec::new(),
    }) as usize
  }

  /// Binds `texture_index` into `set_index`/`slot`/`descriptor_index` of
  /// `descriptor_buffer`'s combined-image-sampler binding.
  pub fn bind_texture(
    &mut self, texture_index: usize, sampler: vk::Sampler, sampler_index: u32, set_index: usize, slot: u32,
    descriptor_index: u32, descriptor_buffer: &mut DescriptorBuffer,
  ) -> RenderCoreResult<()> {
    let texture = self.textures.get_mut(texture_index as u32).ok_or(RenderCoreError::InvalidHandle)?;
    let image_info = vk::DescriptorImageInfo::builder()
      .image_view(texture.image_view)
      .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
      .sampler(sampler)
      .build();
    descriptor_buffer.set_combined_image_descriptor(set_index, slot, descriptor_index, texture_index as u32, sampler_index, image_info);
    texture.bound_slots.push((set_index, slot, descriptor_index));
    Ok(())
  }

  /// Unbinds a previously bound slot, returning its descriptor bytes to the
  /// local cache rather than destroying anything.
  pub fn unbind_texture(&mut self, texture_index: usize, set_index: usize, slot: u32) -> RenderCoreResult<()> {
    let texture = self.textures.get_mut(texture_index as u32).ok_or(RenderCoreError::InvalidHandle)?;
    texture.bound_slots.retain(|&(s, b, _)| !(s == set_index && b == slot));
    Ok(())
  }

  pub fn remove_texture(&mut self, texture_index: usize) -> Option<Texture> {
    self.textures.remove(texture_index as u32)
  }

  pub fn get(&self, texture_index: usize) -> Option<&Texture> {
    self.textures.get(texture_index as u32)
  }

  pub fn clean_up(self, device: &ash::Device, allocator: &mut crate::core::allocator::Allocator) {
    for texture in self.textures.into_iter() {
      unsafe {
        device.destroy_image_view(texture.image_view, None);
      }
      texture.view.clean_up(allocator);
    }
  }
}

/// `{frustum planes, view-projection}` bytes the embedder computed; this
/// crate only stores and uploads them (spec §3.1: "Camera math... remains
/// out of scope").
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct CameraRecord {
  pub view_projection: ultraviolet::Mat4,
  pub frustum_planes: [ultraviolet::Vec4; 6],
}
static_assertions::assert_eq_size!(CameraRecord, [u8; 64 + 96]);

/// A small ring of camera uniform buffers addressed by handle, with one
/// "current camera" slot the culling compute shader reads every frame.
pub struct CameraStorage {
  cameras: ReusableVector<CameraRecord>,
  buffer: ResourceView,
  current: Option<u32>,
}

impl CameraStorage {
  pub fn new(buffer: ResourceView) -> Self {
    Self {
      cameras: ReusableVector::new(),
      buffer,
      current: None,
    }
  }

  pub fn add_camera(&mut self, record: CameraRecord) -> u32 {
    let handle = self.cameras.add(record);
    self.write(handle, record);
    handle
  }

  pub fn set_camera(&mut self, handle: u32) -> RenderCoreResult<()> {
    if !self.cameras.contains(handle) {
      return Err(RenderCoreError::InvalidHandle);
    }
    self.current = Some(handle);
    Ok(())
  }

  pub fn remove_camera(&mut self, handle: u32) -> Option<CameraRecord> {
    if self.current == Some(handle) {
      self.current = None;
    }
    self.cameras.remove(handle)
  }

  pub fn current(&self) -> Option<&CameraRecord> {
    self.current.and_then(|h| self.cameras.get(h))
  }

  pub fn buffer(&self) -> vk::Buffer {
    self.buffer.buffer()
  }

  fn write(&self, handle: u32, record: CameraRecord) {
    if let Some(ptr) = self.buffer.mapped_ptr() {
      unsafe {
        let dst = ptr.add(handle as usize * std::mem::size_of::<CameraRecord>()) as *mut CameraRecord;
        dst.write_unaligned(record);
      }
    }
  }

  pub fn clean_up(self, allocator: &mut crate::core::allocator::Allocator) {
    self.buffer.clean_up(allocator);
  }
}
