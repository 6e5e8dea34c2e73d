//! Render Engine (spec §4.12): the top-level object an embedder talks to.
//! Owns every other subsystem, the graphics/transfer/compute command buffers
//! and synchronization primitives for each in-flight frame, and the
//! transfer -> compute -> graphics submission chain. Grounded on the
//! teacher's `vulkan_renderer/mod.rs` `frame()` method (wait -> acquire ->
//! record -> submit -> present -> advance) and `draw_synchronization.rs`'s
//! minimal owned-sync-primitives struct, generalized from one graphics queue
//! to three queues linked by timeline semaphores (spec §5 Concurrency).

use crate::{
  config::{DeviceProperties, RendererConfig},
  core::{
    allocator::{Allocator, MemoryType},
    descriptor_buffer::{BindingDescription, DescriptorBuffer},
    mesh_manager::{MeshBundleSource, MeshManagerMs, MeshManagerOps, MeshManagerVsIndirect, MeshManagerVsIndividual},
    model_buffers::{MaterialBuffers, MaterialRecord, Model, ModelBuffers},
    model_bundle::SourceModelBundle,
    model_manager::{ModelManagerMs, ModelManagerVsIndirect, ModelManagerVsIndividual},
    render_pass_manager::RenderPassManager,
    resource_view::ResourceView,
    shared_buffer::{SharedBufferGpu, SharedBufferWriteOnly},
    staging::{BufferCopyDestination, StagingManager, TextureCopyDestination},
    texture_camera::{CameraRecord, CameraStorage, TextureStorage},
  },
  error::{RenderCoreError, RenderCoreResult},
  handles::ReusableVector,
  image_data::ImageData,
  vk::queue_family_indices::{QueueFamilyManager, QueueType},
};
use ash::{
  extensions::ext::{DescriptorBuffer as DescriptorBufferLoader, MeshShader},
  vk, Device,
};
use log::{info, warn};
use std::{mem::ManuallyDrop, path::PathBuf, sync::Arc};

/// Starting size of a shared vertex/index/meshlet/argument buffer before its
/// first grow. Kept modest since every shared buffer grows on demand.
const INITIAL_SHARED_BUFFER_SIZE: vk::DeviceSize = 1024 * 1024;
const INITIAL_MODEL_CAPACITY: usize = 512;
const INITIAL_MATERIAL_CAPACITY: usize = 128;
/// Upper bound on live bindless textures this engine's graphics descriptor
/// buffer reserves storage for (spec §9 Open Question: the distilled spec
/// does not name a bindless array size, so the Rust port picks one generous
/// enough for the texture counts every example repo in the pack ships with).
const MAX_BINDLESS_TEXTURES: u32 = 4096;

/// Binding slots of the graphics descriptor buffer's set 0 (per-frame data)
/// and set 1 (bindless textures). Fixed at construction: this engine's
/// layout is not embedder-extensible (see `DESIGN.md`).
mod graphics_bindings {
  pub const CAMERA: u32 = 0;
  pub const MODELS: u32 = 1;
  pub const FRAGMENT_MODELS: u32 = 2;
  pub const MATERIALS: u32 = 3;
  pub const TEXTURES_SET: usize = 1;
  pub const TEXTURES: u32 = 0;
}

/// Binding slots of the compute (culling) descriptor buffer's single set.
mod compute_bindings {
  pub const CAMERA: u32 = 0;
  pub const PER_PIPELINE: u32 = 1;
  pub const PER_MODEL: u32 = 2;
  pub const MESH_BOUNDS: u32 = 3;
  pub const ARGUMENT_INPUT: u32 = 4;
  pub const ARGUMENT_OUTPUT: u32 = 5;
}

/// Which of the three drawing strategies a pipeline or model/mesh bundle
/// uses (spec §9 Design Notes: one trait, three managers).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DrawStrategy {
  VsIndividual,
  VsIndirect,
  Ms,
}

/// Which render pass a pipeline draws into.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RenderPassTarget {
  Swapchain,
  External(u32),
}

/// An embedder-supplied, already-compiled `{pipeline, layout}` pair (pipeline
/// construction is out of this crate's scope, spec §1 Non-goals). Associated
/// here with the drawing strategy and render pass it participates in.
pub struct ExternalPipeline {
  pub pipeline: vk::Pipeline,
  pub layout: vk::PipelineLayout,
  pub bind_point: vk::PipelineBindPoint,
  pub kind: DrawStrategy,
  pub pass_target: RenderPassTarget,
}

struct BundleRecord {
  kind: DrawStrategy,
  local_index: u32,
  /// The backing mesh bundle's *local* index within the mesh manager variant
  /// matching `kind`, resolved once at `add_model_bundle` time from the
  /// global `mesh_bundle_index` the embedder supplied (spec §4.9/§4.10:
  /// every model bundle is paired with the mesh bundle its models'
  /// `mesh-index` field indexes into).
  mesh_bundle_local_index: u32,
}

struct MeshBundleRecord {
  kind: DrawStrategy,
  local_index: u32,
}

/// A resource retired during one frame's recording, deferred until that
/// frame's slot is reused (spec §9 Design Notes: "the Render Engine owns a
/// ring of `Vec<RetiredResource>`... resources move into slot `i` at frame
/// `i` and are dropped when frame `i` is waited on next cycle").
enum Retired {
  Resource(ResourceView),
}

/// Per-frame-in-flight command buffers, timeline semaphore values, and the
/// fence the next use of this slot waits on. Mirrors the teacher's
/// `DrawSynchronization`, generalized to three queues.
struct FrameSlot {
  graphics_cmd: vk::CommandBuffer,
  transfer_cmd: vk::CommandBuffer,
  compute_cmd: Option<vk::CommandBuffer>,
  transfer_semaphore: vk::Semaphore,
  compute_semaphore: vk::Semaphore,
  graphics_semaphore: vk::Semaphore,
  graphics_fence: vk::Fence,
  transfer_value: u64,
  compute_value: u64,
  retired: Vec<Retired>,
}

/// Construction parameters the embedder gathers from device enumeration and
/// feature negotiation, none of which this crate performs itself (spec §1
/// Non-goals).
pub struct RenderEngineCreateInfo {
  pub device: Arc<Device>,
  pub queues: QueueFamilyManager,
  pub gpu_memory_type_index: u32,
  pub cpu_memory_type_index: u32,
  pub memory_budget: vk::PhysicalDeviceMemoryBudgetPropertiesEXT,
  pub heap_count: usize,
  pub heap_index: usize,
  pub descriptor_buffer_loader: Arc<DescriptorBufferLoader>,
  pub mesh_shader_loader: Option<Arc<MeshShader>>,
  pub device_properties: DeviceProperties,
  pub config: RendererConfig,
  pub swapchain_format: vk::Format,
  pub rendering_extent: vk::Extent2D,
  pub first_display_coordinates: (i32, i32),
}

/// Owns every subsystem and the per-frame submission chain. The single
/// object an embedder constructs and drives (spec §6 embedder operations).
pub struct RenderEngine {
  device: Arc<Device>,
  queues: QueueFamilyManager,
  device_properties: DeviceProperties,
  frame_count: u32,
  current_frame: u32,
  shader_path: PathBuf,
  rendering_extent: vk::Extent2D,
  swapchain_format: vk::Format,
  first_display_coordinates: (i32, i32),
  heap_index: usize,

  /// This engine's own colour attachment for the swapchain pass; recreated
  /// on every `resize`. `EndPassForSwapchain` blits this into whichever
  /// swapchain image the embedder acquired, so the embedder's presentable
  /// images never need to double as render targets.
  swapchain_colour_image: ManuallyDrop<ResourceView>,
  swapchain_colour_view: vk::ImageView,

  graphics_pool: vk::CommandPool,
  transfer_pool: vk::CommandPool,
  compute_pool: Option<vk::CommandPool>,
  frames: Vec<FrameSlot>,

  allocator: Allocator,
  staging: ManuallyDrop<StagingManager>,

  model_buffers: ManuallyDrop<ModelBuffers>,
  material_buffers: ManuallyDrop<MaterialBuffers>,

  mesh_vs_individual: ManuallyDrop<MeshManagerVsIndividual>,
  mesh_vs_indirect: ManuallyDrop<MeshManagerVsIndirect>,
  mesh_ms: ManuallyDrop<MeshManagerMs>,

  model_vs_individual: ModelManagerVsIndividual,
  model_vs_indirect: ManuallyDrop<ModelManagerVsIndirect>,
  model_ms: ModelManagerMs,

  bundles: ReusableVector<BundleRecord>,
  mesh_bundles: ReusableVector<MeshBundleRecord>,
  pipelines: ReusableVector<ExternalPipeline>,
  external_passes: ReusableVector<RenderPassManager>,
  swapchain_pass: Option<RenderPassManager>,

  graphics_descriptors: ManuallyDrop<DescriptorBuffer>,
  compute_descriptors: ManuallyDrop<DescriptorBuffer>,
  mesh_shader_loader: Option<Arc<MeshShader>>,

  textures: ManuallyDrop<TextureStorage>,
  cameras: ManuallyDrop<CameraStorage>,
  finalised: bool,
}

impl RenderEngine {
  /// Creates every subsystem and the per-frame command/sync resources. Does
  /// not yet bind any descriptors -- `FinaliseInitialisation` publishes the
  /// buffers that exist at this point, since an embedder typically adds its
  /// first pipelines/textures/cameras before the first `Render` call.
  pub fn new(info: RenderEngineCreateInfo) -> RenderCoreResult<Self> {
    let device = info.device;
    let frame_count = info.config.frame_count;
    let mut allocator = Allocator::new(
      device.clone(),
      info.gpu_memory_type_index,
      info.cpu_memory_type_index,
      info.config.initial_gpu_block_size,
      info.config.initial_cpu_block_size,
      &info.memory_budget,
      info.heap_count,
    );

    let graphics_family = info.queues.family_for(QueueType::Graphics).ok_or(RenderCoreError::InvalidHandle)?;
    let transfer_family = info.queues.family_for(QueueType::Transfer).ok_or(RenderCoreError::InvalidHandle)?;
    let compute_family = info.queues.family_for(QueueType::Compute);

    let graphics_pool = create_command_pool(&device, graphics_family)?;
    let transfer_pool = create_command_pool(&device, transfer_family)?;
    let compute_pool = compute_family.map(|f| create_command_pool(&device, f)).transpose()?;

    let mut frames = Vec::with_capacity(frame_count as usize);
    for _ in 0..frame_count {
      frames.push(FrameSlot {
        graphics_cmd: allocate_command_buffer(&device, graphics_pool)?,
        transfer_cmd: allocate_command_buffer(&device, transfer_pool)?,
        compute_cmd: compute_pool.map(|p| allocate_command_buffer(&device, p)).transpose()?,
        transfer_semaphore: create_timeline_semaphore(&device)?,
        compute_semaphore: create_timeline_semaphore(&device)?,
        graphics_semaphore: create_binary_semaphore(&device)?,
        graphics_fence: create_signaled_fence(&device)?,
        transfer_value: 0,
        compute_value: 0,
        retired: Vec::new(),
      });
    }

    let staging = StagingManager::new(device.clone(), info.config.thread_pool.clone(), info.heap_index);

    let model_buffers = ModelBuffers::new(
      device.clone(),
      &mut allocator,
      &info.device_properties,
      frame_count,
      INITIAL_MODEL_CAPACITY,
      info.heap_index,
    )?;
    let material_buffers = MaterialBuffers::new(
      device.clone(),
      &mut allocator,
      &info.device_properties,
      INITIAL_MATERIAL_CAPACITY,
      info.heap_index,
    )?;

    let mesh_vs_individual = MeshManagerVsIndividual::new(
      new_shared_buffer_gpu(&device, &mut allocator, &info.device_properties, info.heap_index, vk::BufferUsageFlags::VERTEX_BUFFER)?,
      new_shared_buffer_gpu(&device, &mut allocator, &info.device_properties, info.heap_index, vk::BufferUsageFlags::INDEX_BUFFER)?,
      graphics_family,
    );
    let mesh_vs_indirect = MeshManagerVsIndirect::new(
      new_shared_buffer_gpu(&device, &mut allocator, &info.device_properties, info.heap_index, vk::BufferUsageFlags::VERTEX_BUFFER)?,
      new_shared_buffer_gpu(&device, &mut allocator, &info.device_properties, info.heap_index, vk::BufferUsageFlags::INDEX_BUFFER)?,
      new_shared_buffer_gpu(&device, &mut allocator, &info.device_properties, info.heap_index, vk::BufferUsageFlags::STORAGE_BUFFER)?,
      graphics_family,
    );
    let mesh_ms = MeshManagerMs::new(
      new_shared_buffer_gpu(&device, &mut allocator, &info.device_properties, info.heap_index, vk::BufferUsageFlags::STORAGE_BUFFER)?,
      new_shared_buffer_gpu(&device, &mut allocator, &info.device_properties, info.heap_index, vk::BufferUsageFlags::STORAGE_BUFFER)?,
      new_shared_buffer_gpu(&device, &mut allocator, &info.device_properties, info.heap_index, vk::BufferUsageFlags::STORAGE_BUFFER)?,
      new_shared_buffer_gpu(&device, &mut allocator, &info.device_properties, info.heap_index, vk::BufferUsageFlags::STORAGE_BUFFER)?,
      graphics_family,
    );

    let model_vs_individual = ModelManagerVsIndividual::new();
    let model_ms = ModelManagerMs::new();

    let argument_input = new_shared_buffer_write_only(&device, &mut allocator, &info.device_properties, info.heap_index)?;
    let per_pipeline = new_shared_buffer_write_only(&device, &mut allocator, &info.device_properties, info.heap_index)?;
    let per_model = new_shared_buffer_write_only(&device, &mut allocator, &info.device_properties, info.heap_index)?;
    let argument_output = new_shared_buffer_gpu(
      &device,
      &mut allocator,
      &info.device_properties,
      info.heap_index,
      vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::INDIRECT_BUFFER,
    )?;
    let mut counter_buffers = Vec::with_capacity(frame_count as usize);
    for _ in 0..frame_count {
      counter_buffers.push(ResourceView::create_buffer(
        device.clone(),
        &mut allocator,
        std::mem::size_of::<u32>() as vk::DeviceSize,
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::INDIRECT_BUFFER,
        MemoryType::GpuOnly,
        info.heap_index,
        &info.device_properties,
      )?);
    }
    let model_vs_indirect = ModelManagerVsIndirect::new(
      device.clone(),
      argument_input,
      per_pipeline,
      per_model,
      argument_output,
      counter_buffers,
      frame_count,
    );

    let graphics_descriptor_storage = ResourceView::create_buffer(
      device.clone(),
      &mut allocator,
      64 * 1024,
      vk::BufferUsageFlags::RESOURCE_DESCRIPTOR_BUFFER_EXT | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
      MemoryType::HostCoherent,
      info.heap_index,
      &info.device_properties,
    )?;
    let mut graphics_descriptors = DescriptorBuffer::new(
      device.clone(),
      info.descriptor_buffer_loader.clone(),
      info.device_properties,
      graphics_descriptor_storage,
    );
    graphics_descriptors.add_binding(0, BindingDescription {
      slot: graphics_bindings::CAMERA,
      descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
      count: 1,
      stage_flags: vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT | vk::ShaderStageFlags::TASK_EXT | vk::ShaderStageFlags::MESH_EXT,
      flags: vk::DescriptorBindingFlags::empty(),
    });
    graphics_descriptors.add_binding(0, BindingDescription {
      slot: graphics_bindings::MODELS,
      descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
      count: 1,
      stage_flags: vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::TASK_EXT | vk::ShaderStageFlags::MESH_EXT,
      flags: vk::DescriptorBindingFlags::empty(),
    });
    graphics_descriptors.add_binding(0, BindingDescription {
      slot: graphics_bindings::FRAGMENT_MODELS,
      descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
      count: 1,
      stage_flags: vk::ShaderStageFlags::FRAGMENT,
      flags: vk::DescriptorBindingFlags::empty(),
    });
    graphics_descriptors.add_binding(0, BindingDescription {
      slot: graphics_bindings::MATERIALS,
      descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
      count: 1,
      stage_flags: vk::ShaderStageFlags::FRAGMENT,
      flags: vk::DescriptorBindingFlags::empty(),
    });
    graphics_descriptors.add_binding(graphics_bindings::TEXTURES_SET, BindingDescription {
      slot: graphics_bindings::TEXTURES,
      descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
      count: MAX_BINDLESS_TEXTURES,
      stage_flags: vk::ShaderStageFlags::FRAGMENT,
      flags: vk::DescriptorBindingFlags::PARTIALLY_BOUND | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND,
    });
    graphics_descriptors.recreate_set_layout(0, &[])?;
    graphics_descriptors.recreate_set_layout(graphics_bindings::TEXTURES_SET, &[])?;

    let compute_descriptor_storage = ResourceView::create_buffer(
      device.clone(),
      &mut allocator,
      16 * 1024,
      vk::BufferUsageFlags::RESOURCE_DESCRIPTOR_BUFFER_EXT | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
      MemoryType::HostCoherent,
      info.heap_index,
      &info.device_properties,
    )?;
    let mut compute_descriptors = DescriptorBuffer::new(
      device.clone(),
      info.descriptor_buffer_loader.clone(),
      info.device_properties,
      compute_descriptor_storage,
    );
    for (slot, ty) in [
      (compute_bindings::CAMERA, vk::DescriptorType::UNIFORM_BUFFER),
      (compute_bindings::PER_PIPELINE, vk::DescriptorType::STORAGE_BUFFER),
      (compute_bindings::PER_MODEL, vk::DescriptorType::STORAGE_BUFFER),
      (compute_bindings::MESH_BOUNDS, vk::DescriptorType::STORAGE_BUFFER),
      (compute_bindings::ARGUMENT_INPUT, vk::DescriptorType::STORAGE_BUFFER),
      (compute_bindings::ARGUMENT_OUTPUT, vk::DescriptorType::STORAGE_BUFFER),
    ] {
      compute_descriptors.add_binding(0, BindingDescription {
        slot,
        descriptor_type: ty,
        count: 1,
        stage_flags: vk::ShaderStageFlags::COMPUTE,
        flags: vk::DescriptorBindingFlags::empty(),
      });
    }
    compute_descriptors.recreate_set_layout(0, &[])?;

    let camera_buffer = ResourceView::create_buffer(
      device.clone(),
      &mut allocator,
      (MAX_CAMERAS as usize * std::mem::size_of::<CameraRecord>()) as vk::DeviceSize,
      vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
      MemoryType::HostCoherent,
      info.heap_index,
      &info.device_properties,
    )?;

    let (swapchain_colour_image, swapchain_colour_view) =
      create_swapchain_colour_attachment(&device, &mut allocator, info.rendering_extent, info.swapchain_format, info.heap_index)?;

    Ok(Self {
      device,
      queues: info.queues,
      device_properties: info.device_properties,
      frame_count,
      current_frame: 0,
      shader_path: info.config.shader_path,
      rendering_extent: info.rendering_extent,
      swapchain_format: info.swapchain_format,
      first_display_coordinates: info.first_display_coordinates,
      heap_index: info.heap_index,
      swapchain_colour_image: ManuallyDrop::new(swapchain_colour_image),
      swapchain_colour_view,
      graphics_pool,
      transfer_pool,
      compute_pool,
      frames,
      allocator,
      staging: ManuallyDrop::new(staging),
      model_buffers: ManuallyDrop::new(model_buffers),
      material_buffers: ManuallyDrop::new(material_buffers),
      mesh_vs_individual: ManuallyDrop::new(mesh_vs_individual),
      mesh_vs_indirect: ManuallyDrop::new(mesh_vs_indirect),
      mesh_ms: ManuallyDrop::new(mesh_ms),
      model_vs_individual,
      model_vs_indirect: ManuallyDrop::new(model_vs_indirect),
      model_ms,
      bundles: ReusableVector::new(),
      mesh_bundles: ReusableVector::new(),
      pipelines: ReusableVector::new(),
      external_passes: ReusableVector::new(),
      swapchain_pass: None,
      graphics_descriptors: ManuallyDrop::new(graphics_descriptors),
      compute_descriptors: ManuallyDrop::new(compute_descriptors),
      mesh_shader_loader: info.mesh_shader_loader,
      textures: ManuallyDrop::new(TextureStorage::new()),
      cameras: ManuallyDrop::new(CameraStorage::new(camera_buffer)),
      finalised: false,
    })
  }

  /// Publishes every descriptor this engine currently owns. Must be called
  /// once, after construction and before the first `Render`, and again
  /// whenever a buffer flagged `descriptors_dirty` has grown.
  pub fn finalise_initialisation(&mut self) -> RenderCoreResult<()> {
    self.publish_camera_descriptor();
    for frame_index in 0..self.frame_count {
      self.publish_model_descriptors(frame_index);
    }
    self.publish_material_descriptor();
    self.publish_compute_buffer_descriptors();
    self.model_buffers.descriptors_dirty = false;
    self.finalised = true;
    Ok(())
  }

  fn publish_camera_descriptor(&mut self) {
    self.graphics_descriptors.set_uniform_buffer_descriptor(
      0,
      graphics_bindings::CAMERA,
      0,
      self.cameras.buffer(),
      0,
      std::mem::size_of::<CameraRecord>() as vk::DeviceSize,
    );
    self.compute_descriptors.set_uniform_buffer_descriptor(
      0,
      compute_bindings::CAMERA,
      0,
      self.cameras.buffer(),
      0,
      std::mem::size_of::<CameraRecord>() as vk::DeviceSize,
    );
  }

  fn publish_model_descriptors(&mut self, frame_index: u32) {
    let model_buffer = self.model_buffers.buffer(frame_index);
    let fragment_buffer = self.model_buffers.fragment_buffer(frame_index);
    self
      .graphics_descriptors
      .set_storage_buffer_descriptor(0, graphics_bindings::MODELS, 0, model_buffer, 0, vk::WHOLE_SIZE);
    self
      .graphics_descriptors
      .set_storage_buffer_descriptor(0, graphics_bindings::FRAGMENT_MODELS, 0, fragment_buffer, 0, vk::WHOLE_SIZE);
  }

  fn publish_material_descriptor(&mut self) {
    self.graphics_descriptors.set_storage_buffer_descriptor(
      0,
      graphics_bindings::MATERIALS,
      0,
      self.material_buffers.buffer(),
      0,
      vk::WHOLE_SIZE,
    );
  }

  fn publish_compute_buffer_descriptors(&mut self) {
    self.compute_descriptors.set_storage_buffer_descriptor(
      0,
      compute_bindings::PER_PIPELINE,
      0,
      self.model_vs_indirect.per_pipeline_buffer(),
      0,
      vk::WHOLE_SIZE,
    );
    self.compute_descriptors.set_storage_buffer_descriptor(
      0,
      compute_bindings::PER_MODEL,
      0,
      self.model_vs_indirect.per_model_buffer(),
      0,
      vk::WHOLE_SIZE,
    );
    self.compute_descriptors.set_storage_buffer_descriptor(
      0,
      compute_bindings::MESH_BOUNDS,
      0,
      self.mesh_vs_indirect.bounds_buffer_handle(),
      0,
      vk::WHOLE_SIZE,
    );
    self.compute_descriptors.set_storage_buffer_descriptor(
      0,
      compute_bindings::ARGUMENT_INPUT,
      0,
      self.model_vs_indirect.argument_input_buffer(),
      0,
      vk::WHOLE_SIZE,
    );
    self.compute_descriptors.set_storage_buffer_descriptor(
      0,
      compute_bindings::ARGUMENT_OUTPUT,
      0,
      self.model_vs_indirect.argument_output_buffer(),
      0,
      vk::WHOLE_SIZE,
    );
  }

  // ---- Frame lifecycle (spec §4.12 WaitForCurrentBackBuffer/Update/Render) ----

  /// Waits on the current frame slot's fence, reaps its retired resources,
  /// and resets its command buffers, making the slot safe to record into.
  /// Must be called once per frame, before `Update`/`Render`.
  pub fn wait_for_current_back_buffer(&mut self) -> RenderCoreResult<()> {
    let frame = &mut self.frames[self.current_frame as usize];
    unsafe {
      self.device.wait_for_fences(&[frame.graphics_fence], true, u64::MAX)?;
      self.device.reset_fences(&[frame.graphics_fence])?;
      self.device.reset_command_buffer(frame.graphics_cmd, vk::CommandBufferResetFlags::empty())?;
      self.device.reset_command_buffer(frame.transfer_cmd, vk::CommandBufferResetFlags::empty())?;
      if let Some(cmd) = frame.compute_cmd {
        self.device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
      }
    }
    for retired in frame.retired.drain(..) {
      match retired {
        Retired::Resource(view) => view.clean_up(&mut self.allocator),
      }
    }
    self.staging.clean_up_temp_buffers(&mut self.allocator);
    Ok(())
  }

  /// `WaitForGPUToFinish` (spec §6): blocks until every in-flight frame's
  /// fence has signaled. Used before a resize or teardown.
  pub fn wait_for_gpu_to_finish(&self) -> RenderCoreResult<()> {
    let fences: Vec<vk::Fence> = self.frames.iter().map(|f| f.graphics_fence).collect();
    unsafe { self.device.wait_for_fences(&fences, true, u64::MAX)? };
    Ok(())
  }

  /// Rewrites CPU-visible per-frame state (model transforms, culling
  /// argument buffers) for `self.current_frame` ahead of `Render`.
  pub fn update(&mut self) -> RenderCoreResult<()> {
    self.model_buffers.update(self.current_frame);
    if self.model_buffers.descriptors_dirty {
      self.publish_model_descriptors(self.current_frame);
      self.model_buffers.descriptors_dirty = false;
    }
    for bundle_index in self.bundle_indices_of_kind(DrawStrategy::VsIndirect) {
      let Some(bundle) = self.model_vs_indirect.bundle(bundle_index) else { continue };
      let local_indices: Vec<u32> = bundle.local_indices().collect();
      for local_idx in local_indices {
        let mesh_bundle_index = self.mesh_bundle_index_for(bundle_index);
        if let Some(mesh_bundle_index) = mesh_bundle_index {
          self
            .model_vs_indirect
            .update_pipeline(bundle_index, local_idx, &self.mesh_vs_indirect, mesh_bundle_index, &self.model_buffers, false)?;
        }
      }
    }
    Ok(())
  }

  /// Records and submits the transfer -> compute (if any indirect work is
  /// pending) -> graphics chain for `self.current_frame`, then presents.
  /// `image_available` is the embedder's swapchain-acquire semaphore;
  /// returns the semaphore the embedder's present call must wait on.
  pub fn render(
    &mut self, swapchain_image_view: vk::ImageView, swapchain_back_buffer: vk::Image, image_available: vk::Semaphore,
  ) -> RenderCoreResult<vk::Semaphore> {
    if !self.finalised {
      self.finalise_initialisation()?;
    }
    let frame_index = self.current_frame;
    let has_transfer_work = self.staging.has_queued_work() || self.any_shared_buffer_grow_pending();
    let has_compute_work = self.model_vs_indirect.allocated_model_count() > 0 && self.compute_pool.is_some();

    let mut wait_semaphore = image_available;
    let mut wait_is_timeline = false;
    let mut wait_value = 0u64;

    if has_transfer_work {
      wait_semaphore = self.record_and_submit_transfer(frame_index, wait_semaphore, wait_is_timeline, wait_value)?;
      wait_is_timeline = true;
      wait_value = self.frames[frame_index as usize].transfer_value;
    }

    if has_compute_work {
      wait_semaphore = self.record_and_submit_compute(frame_index, wait_semaphore, wait_is_timeline, wait_value)?;
      wait_is_timeline = true;
      wait_value = self.frames[frame_index as usize].compute_value;
    }

    self.record_and_submit_graphics(
      frame_index,
      swapchain_image_view,
      swapchain_back_buffer,
      wait_semaphore,
      wait_is_timeline,
      wait_value,
    )?;

    let signal = self.frames[frame_index as usize].graphics_semaphore;
    self.current_frame = (self.current_frame + 1) % self.frame_count;
    Ok(signal)
  }

  fn any_shared_buffer_grow_pending(&self) -> bool {
    // Shared buffers track their own pending grow internally; this engine
    // conservatively always flushes CopyOldBuffers on a transfer submission
    // when anything queued host work this frame, matching the teacher's
    // "always record, barriers are cheap when empty" idiom.
    self.staging.has_queued_work()
  }

  fn record_and_submit_transfer(
    &mut self, frame_index: u32, wait_semaphore: vk::Semaphore, wait_is_timeline: bool, wait_value: u64,
  ) -> RenderCoreResult<vk::Semaphore> {
    let transfer_family = self.queues.family_for(QueueType::Transfer).ok_or(RenderCoreError::InvalidHandle)?;
    let cmd = self.frames[frame_index as usize].transfer_cmd;
    unsafe {
      self.device.begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::default())?;
    }

    let mut retired = Vec::new();
    retired.extend(self.mesh_vs_individual.copy_old_buffers(cmd));
    retired.extend(self.mesh_vs_indirect.copy_old_buffers(cmd));
    retired.extend(self.mesh_ms.copy_old_buffers(cmd));
    if let Some(view) = self.model_vs_indirect.copy_old_buffers(cmd) {
      retired.push(view);
    }
    self.staging.copy_and_clear_queued_buffers(cmd);
    self.staging.release_ownership(cmd, transfer_family);

    unsafe {
      self.device.end_command_buffer(cmd)?;
    }

    let slot = &mut self.frames[frame_index as usize];
    slot.retired.extend(retired.into_iter().map(Retired::Resource));
    slot.transfer_value += 1;
    let signal_value = slot.transfer_value;

    let wait_semaphores = [wait_semaphore];
    let wait_values = [wait_value];
    let signal_semaphores = [slot.transfer_semaphore];
    let signal_values = [signal_value];
    let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::builder();
    if wait_is_timeline {
      timeline_info = timeline_info.wait_semaphore_values(&wait_values);
    }
    timeline_info = timeline_info.signal_semaphore_values(&signal_values);
    let command_buffers = [cmd];
    let wait_stage = [vk::PipelineStageFlags::TRANSFER];
    let submit = vk::SubmitInfo::builder()
      .wait_semaphores(if wait_is_timeline || wait_semaphore != vk::Semaphore::null() { &wait_semaphores } else { &[] })
      .wait_dst_stage_mask(&wait_stage)
      .command_buffers(&command_buffers)
      .signal_semaphores(&signal_semaphores)
      .push_next(&mut timeline_info)
      .build();
    let queue = self.queues.queue_for(QueueType::Transfer).ok_or(RenderCoreError::InvalidHandle)?;
    unsafe {
      self.device.queue_submit(queue, &[submit], vk::Fence::null())?;
    }
    Ok(slot.transfer_semaphore)
  }

  fn record_and_submit_compute(
    &mut self, frame_index: u32, wait_semaphore: vk::Semaphore, wait_is_timeline: bool, wait_value: u64,
  ) -> RenderCoreResult<vk::Semaphore> {
    let Some(cmd) = self.frames[frame_index as usize].compute_cmd else {
      return Ok(wait_semaphore);
    };
    let transfer_family = self.queues.family_for(QueueType::Transfer).ok_or(RenderCoreError::InvalidHandle)?;
    let compute_family = self.queues.family_for(QueueType::Compute).ok_or(RenderCoreError::InvalidHandle)?;
    unsafe {
      self.device.begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::default())?;
    }
    self.staging.acquire_ownership(cmd, compute_family, transfer_family);
    self
      .model_vs_indirect
      .reset_counter_buffer(cmd, frame_index, &self.device, &mut self.allocator, &self.device_properties)?;
    self.compute_descriptors.bind(cmd, vk::PipelineBindPoint::COMPUTE, self.culling_pipeline_layout());
    for pipeline in self.pipelines.iter().filter(|(_, p)| p.bind_point == vk::PipelineBindPoint::COMPUTE) {
      unsafe {
        self.device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, pipeline.1.pipeline);
      }
      self.model_vs_indirect.dispatch(cmd, &self.device, pipeline.1.layout);
    }
    unsafe {
      self.device.end_command_buffer(cmd)?;
    }

    let slot = &mut self.frames[frame_index as usize];
    slot.compute_value += 1;
    let signal_value = slot.compute_value;
    let wait_semaphores = [wait_semaphore];
    let wait_values = [wait_value];
    let signal_semaphores = [slot.compute_semaphore];
    let signal_values = [signal_value];
    let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::builder();
    if wait_is_timeline {
      timeline_info = timeline_info.wait_semaphore_values(&wait_values);
    }
    timeline_info = timeline_info.signal_semaphore_values(&signal_values);
    let command_buffers = [cmd];
    let wait_stage = [vk::PipelineStageFlags::COMPUTE_SHADER];
    let submit = vk::SubmitInfo::builder()
      .wait_semaphores(&wait_semaphores)
      .wait_dst_stage_mask(&wait_stage)
      .command_buffers(&command_buffers)
      .signal_semaphores(&signal_semaphores)
      .push_next(&mut timeline_info)
      .build();
    let queue = self.queues.queue_for(QueueType::Compute).ok_or(RenderCoreError::InvalidHandle)?;
    unsafe {
      self.device.queue_submit(queue, &[submit], vk::Fence::null())?;
    }
    Ok(slot.compute_semaphore)
  }

  #[allow(clippy::too_many_arguments)]
  fn record_and_submit_graphics(
    &mut self, frame_index: u32, swapchain_image_view: vk::ImageView, swapchain_back_buffer: vk::Image,
    wait_semaphore: vk::Semaphore, wait_is_timeline: bool, wait_value: u64,
  ) -> RenderCoreResult<()> {
    let graphics_family = self.queues.family_for(QueueType::Graphics).ok_or(RenderCoreError::InvalidHandle)?;
    let transfer_family = self.queues.family_for(QueueType::Transfer).ok_or(RenderCoreError::InvalidHandle)?;
    let cmd = self.frames[frame_index as usize].graphics_cmd;
    unsafe {
      self.device.begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::default())?;
    }
    self.staging.acquire_ownership(cmd, graphics_family, transfer_family);

    let external_pass_indices: Vec<u32> = self.external_passes.iter().map(|(idx, _)| idx).collect();
    for pass_index in external_pass_indices {
      self.record_pass(cmd, RenderPassTarget::External(pass_index), frame_index)?;
    }
    if self.swapchain_pass.is_some() {
      self.record_swapchain_pass(cmd, swapchain_image_view, swapchain_back_buffer, frame_index)?;
    }

    unsafe {
      self.device.end_command_buffer(cmd)?;
    }

    let slot = &mut self.frames[frame_index as usize];
    let wait_semaphores = [wait_semaphore];
    let wait_values = [wait_value];
    let signal_semaphores = [slot.graphics_semaphore];
    let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::builder();
    if wait_is_timeline {
      timeline_info = timeline_info.wait_semaphore_values(&wait_values);
    }
    let command_buffers = [cmd];
    let wait_stage = [vk::PipelineStageFlags::TOP_OF_PIPE];
    let mut submit_builder = vk::SubmitInfo::builder()
      .wait_semaphores(&wait_semaphores)
      .wait_dst_stage_mask(&wait_stage)
      .command_buffers(&command_buffers)
      .signal_semaphores(&signal_semaphores);
    if wait_is_timeline {
      submit_builder = submit_builder.push_next(&mut timeline_info);
    }
    let submit = submit_builder.build();
    let queue = self.queues.queue_for(QueueType::Graphics).ok_or(RenderCoreError::InvalidHandle)?;
    unsafe {
      self.device.queue_submit(queue, &[submit], slot.graphics_fence)?;
    }
    Ok(())
  }

  fn record_pass(&mut self, cmd: vk::CommandBuffer, target: RenderPassTarget, frame_index: u32) -> RenderCoreResult<()> {
    let RenderPassTarget::External(pass_index) = target else { return Ok(()) };
    let extent = self.rendering_extent;
    {
      let pass = self.external_passes.get_mut(pass_index).ok_or(RenderCoreError::InvalidHandle)?;
      pass.start_pass(&self.device, cmd, vk::Rect2D { offset: vk::Offset2D::default(), extent }, vk::PipelineStageFlags::TOP_OF_PIPE);
    }
    self.bind_and_draw_pipelines(cmd, target, frame_index)?;
    let pass = self.external_passes.get(pass_index).ok_or(RenderCoreError::InvalidHandle)?;
    pass.end_pass(&self.device, cmd);
    Ok(())
  }

  fn record_swapchain_pass(
    &mut self, cmd: vk::CommandBuffer, swapchain_image_view: vk::ImageView, swapchain_back_buffer: vk::Image,
    frame_index: u32,
  ) -> RenderCoreResult<()> {
    let extent = self.rendering_extent;
    {
      let pass = self.swapchain_pass.as_mut().ok_or(RenderCoreError::InvalidHandle)?;
      pass.start_pass(&self.device, cmd, vk::Rect2D { offset: vk::Offset2D::default(), extent }, vk::PipelineStageFlags::TOP_OF_PIPE);
    }
    self.bind_and_draw_pipelines(cmd, RenderPassTarget::Swapchain, frame_index)?;
    let pass = self.swapchain_pass.as_ref().ok_or(RenderCoreError::InvalidHandle)?;
    // The pass draws into swapchain_colour_image (its view was registered
    // with the pass via add_colour_attachment before it was handed to
    // set_swapchain_external_render_pass), never into the acquired
    // swapchain image directly.
    let _ = swapchain_image_view;
    pass.end_pass_for_swapchain(
      &self.device,
      cmd,
      self.swapchain_colour_image.image(),
      swapchain_back_buffer,
      vk::Extent3D { width: extent.width, height: extent.height, depth: 1 },
    );
    Ok(())
  }

  fn bind_and_draw_pipelines(&mut self, cmd: vk::CommandBuffer, target: RenderPassTarget, frame_index: u32) -> RenderCoreResult<()> {
    let pipeline_indices: Vec<u32> = self
      .pipelines
      .iter()
      .filter(|(_, p)| p.pass_target == target && p.bind_point == vk::PipelineBindPoint::GRAPHICS)
      .map(|(idx, _)| idx)
      .collect();
    for pipeline_index in pipeline_indices {
      let (pipeline_handle, layout, kind) = {
        let pipeline = self.pipelines.get(pipeline_index).ok_or(RenderCoreError::InvalidHandle)?;
        (pipeline.pipeline, pipeline.layout, pipeline.kind)
      };
      unsafe {
        self.device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline_handle);
      }
      self.graphics_descriptors.bind(cmd, vk::PipelineBindPoint::GRAPHICS, layout);
      self.draw_bundles_for_pipeline(cmd, pipeline_index, layout, kind, frame_index)?;
    }
    Ok(())
  }

  fn draw_bundles_for_pipeline(
    &mut self, cmd: vk::CommandBuffer, pipeline_index: u32, pipeline_layout: vk::PipelineLayout, kind: DrawStrategy,
    frame_index: u32,
  ) -> RenderCoreResult<()> {
    let bundle_indices = self.bundle_indices_of_kind(kind);
    for bundle_index in bundle_indices {
      let Some(mesh_bundle_index) = self.mesh_bundle_index_for(bundle_index) else { continue };
      match kind {
        DrawStrategy::VsIndividual => {
          let Some(bundle) = self.model_vs_individual.bundle(bundle_index) else { continue };
          for (local_idx, partition) in bundle.partitions.iter().enumerate() {
            if partition.pipeline_index != pipeline_index {
              continue;
            }
            self.model_vs_individual.draw_pipeline_vs(
              bundle_index,
              local_idx,
              cmd,
              &self.device,
              pipeline_layout,
              &self.mesh_vs_individual,
              mesh_bundle_index,
              &self.model_buffers,
            )?;
          }
        }
        DrawStrategy::Ms => {
          let Some(loader) = self.mesh_shader_loader.clone() else { continue };
          let Some(bundle) = self.model_ms.bundle(bundle_index) else { continue };
          for (local_idx, partition) in bundle.partitions.iter().enumerate() {
            if partition.pipeline_index != pipeline_index {
              continue;
            }
            self.model_ms.draw_pipeline_ms(
              bundle_index,
              local_idx,
              cmd,
              &self.device,
              &loader,
              pipeline_layout,
              &self.mesh_ms,
              mesh_bundle_index,
              &self.model_buffers,
            )?;
          }
        }
        DrawStrategy::VsIndirect => {
          let Some(bundle) = self.model_vs_indirect.bundle(bundle_index) else { continue };
          let local_indices: Vec<u32> = bundle.local_indices().collect();
          for local_idx in local_indices {
            if bundle.pipeline_index(local_idx) != Some(pipeline_index) {
              continue;
            }
            self.model_vs_indirect.draw_pipeline(
              bundle_index,
              local_idx,
              frame_index as usize,
              cmd,
              &self.device,
              pipeline_layout,
              &self.mesh_vs_indirect,
            )?;
          }
        }
      }
    }
    Ok(())
  }

  fn bundle_indices_of_kind(&self, kind: DrawStrategy) -> Vec<u32> {
    self.bundles.iter().filter(|(_, b)| b.kind == kind).map(|(idx, _)| idx).collect()
  }

  fn mesh_bundle_index_for(&self, bundle_index: u32) -> Option<u32> {
    self.bundles.get(bundle_index).map(|b| b.mesh_bundle_local_index)
  }

  fn culling_pipeline_layout(&self) -> vk::PipelineLayout {
    self
      .pipelines
      .iter()
      .find(|(_, p)| p.bind_point == vk::PipelineBindPoint::COMPUTE)
      .map(|(_, p)| p.layout)
      .unwrap_or(vk::PipelineLayout::null())
  }

  // ---- Pipelines ----

  pub fn add_graphics_pipeline(
    &mut self, pipeline: vk::Pipeline, layout: vk::PipelineLayout, bind_point: vk::PipelineBindPoint,
    kind: DrawStrategy, pass_target: RenderPassTarget,
  ) -> u32 {
    self.pipelines.add(ExternalPipeline { pipeline, layout, bind_point, kind, pass_target })
  }

  pub fn remove_graphics_pipeline(&mut self, pipeline_index: u32) -> Option<ExternalPipeline> {
    self.pipelines.remove(pipeline_index)
  }

  // ---- Mesh bundles ----

  pub fn add_mesh_bundle(&mut self, source: MeshBundleSource, kind: DrawStrategy) -> RenderCoreResult<u32> {
    let local_index = match kind {
      DrawStrategy::VsIndividual => {
        self
          .mesh_vs_individual
          .add_mesh_bundle(source, &mut self.staging, &mut self.allocator, &self.device_properties)?
      }
      DrawStrategy::VsIndirect => {
        self
          .mesh_vs_indirect
          .add_mesh_bundle(source, &mut self.staging, &mut self.allocator, &self.device_properties)?
      }
      DrawStrategy::Ms => self.mesh_ms.add_mesh_bundle(source, &mut self.staging, &mut self.allocator, &self.device_properties)?,
    };
    Ok(self.mesh_bundles.add(MeshBundleRecord { kind, local_index }))
  }

  pub fn remove_mesh_bundle(&mut self, mesh_bundle_index: u32) -> RenderCoreResult<()> {
    let record = self.mesh_bundles.remove(mesh_bundle_index).ok_or(RenderCoreError::InvalidHandle)?;
    match record.kind {
      DrawStrategy::VsIndividual => self.mesh_vs_individual.remove_mesh_bundle(record.local_index),
      DrawStrategy::VsIndirect => self.mesh_vs_indirect.remove_mesh_bundle(record.local_index),
      DrawStrategy::Ms => self.mesh_ms.remove_mesh_bundle(record.local_index),
    }
    Ok(())
  }

  // ---- Model bundles ----

  pub fn add_model_bundle(&mut self, source: SourceModelBundle, kind: DrawStrategy) -> RenderCoreResult<u32> {
    let mesh_bundle_record = self.mesh_bundles.get(source.mesh_bundle_index).ok_or(RenderCoreError::InvalidHandle)?;
    if mesh_bundle_record.kind != kind {
      return Err(RenderCoreError::InvalidHandle);
    }
    let mesh_bundle_local_index = mesh_bundle_record.local_index;
    let local_index = match kind {
      DrawStrategy::VsIndividual => self.model_vs_individual.add_model_bundle(source),
      DrawStrategy::Ms => self.model_ms.add_model_bundle(source),
      DrawStrategy::VsIndirect => self.model_vs_indirect.add_model_bundle(source, &mut self.allocator, &self.device_properties)?,
    };
    Ok(self.bundles.add(BundleRecord { kind, local_index, mesh_bundle_local_index }))
  }

  pub fn remove_model_bundle(&mut self, bundle_index: u32) -> RenderCoreResult<()> {
    let record = self.bundles.remove(bundle_index).ok_or(RenderCoreError::InvalidHandle)?;
    match record.kind {
      DrawStrategy::VsIndividual => {
        self.model_vs_individual.remove_model_bundle(record.local_index);
      }
      DrawStrategy::Ms => {
        self.model_ms.remove_model_bundle(record.local_index);
      }
      DrawStrategy::VsIndirect => {
        self.model_vs_indirect.remove_model_bundle(record.local_index);
      }
    }
    Ok(())
  }

  pub fn reconfigure_model_pipelines_in_bundle(
    &mut self, bundle_index: u32, decreased_local_idx: u32, decreased_model_indices: Vec<u32>,
    increased_local_idx: u32, increased_model_indices: Vec<u32>,
  ) -> RenderCoreResult<()> {
    let record = self.bundles.get(bundle_index).ok_or(RenderCoreError::InvalidHandle)?;
    match record.kind {
      DrawStrategy::VsIndividual => self.model_vs_individual.reconfigure_model_pipelines(
        record.local_index,
        decreased_local_idx as usize,
        decreased_model_indices,
        increased_local_idx as usize,
        increased_model_indices,
      ),
      DrawStrategy::Ms => self.model_ms.reconfigure_model_pipelines(
        record.local_index,
        decreased_local_idx as usize,
        decreased_model_indices,
        increased_local_idx as usize,
        increased_model_indices,
      ),
      DrawStrategy::VsIndirect => self.model_vs_indirect.reconfigure_model_pipelines(
        record.local_index,
        decreased_local_idx,
        decreased_model_indices,
        increased_local_idx,
        increased_model_indices,
        &mut self.allocator,
        &self.device_properties,
      ),
    }
  }

  pub fn add_model(&mut self, model: Model) -> RenderCoreResult<u32> {
    self.model_buffers.add(model, &mut self.allocator, &self.device_properties)
  }

  pub fn remove_model(&mut self, handle: u32) -> Option<Model> {
    self.model_buffers.remove(handle)
  }

  pub fn add_material(&mut self, record: MaterialRecord) -> RenderCoreResult<u32> {
    self.material_buffers.add(record, &mut self.allocator, &self.device_properties)
  }

  // ---- Textures ----

  pub fn add_texture(&mut self, image_data: &dyn ImageData, graphics_family: u32) -> RenderCoreResult<usize> {
    let (width, height) = image_data.dimensions();
    let view = ResourceView::create_image(
      self.device.clone(),
      &mut self.allocator,
      vk::Extent3D { width, height, depth: 1 },
      vk::Format::R8G8B8A8_UNORM,
      vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
      1,
      0,
    )?;
    let image = view.image();
    let image_view_ci = vk::ImageViewCreateInfo::builder()
      .image(image)
      .view_type(vk::ImageViewType::TYPE_2D)
      .format(vk::Format::R8G8B8A8_UNORM)
      .subresource_range(
        vk::ImageSubresourceRange::builder()
          .aspect_mask(vk::ImageAspectFlags::COLOR)
          .level_count(1)
          .layer_count(1)
          .build(),
      )
      .build();
    let image_view = unsafe { self.device.create_image_view(&image_view_ci, None)? };
    let texture_index = self.textures.add_texture(view, image_view);
    Ok(texture_index)
  }

  /// Stages `image_data`'s bytes into the texture created by `add_texture`.
  /// Split from creation per spec §4.4: uploads are queued, not immediate.
  pub fn upload_texture_data(
    &mut self, texture_index: usize, image_data: &dyn ImageData, dst_family: u32,
  ) -> RenderCoreResult<()> {
    let texture = self.textures.get(texture_index).ok_or(RenderCoreError::InvalidHandle)?;
    let (width, height) = image_data.dimensions();
    let bytes = image_data.into_rgba_32();
    self.staging.enqueue_texture_copy(
      &mut self.allocator,
      &self.device_properties,
      bytes,
      TextureCopyDestination {
        dst_image: texture.view.image(),
        mip_level: 0,
        image_extent: vk::Extent3D { width, height, depth: 1 },
        dst_family,
        dst_access: vk::AccessFlags::SHADER_READ,
        dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
      },
    )
  }

  pub fn bind_texture(&mut self, texture_index: usize, sampler: vk::Sampler, sampler_index: u32, descriptor_index: u32) -> RenderCoreResult<()> {
    self.textures.bind_texture(
      texture_index,
      sampler,
      sampler_index,
      graphics_bindings::TEXTURES_SET,
      graphics_bindings::TEXTURES,
      descriptor_index,
      &mut self.graphics_descriptors,
    )
  }

  pub fn unbind_texture(&mut self, texture_index: usize) -> RenderCoreResult<()> {
    self.textures.unbind_texture(texture_index, graphics_bindings::TEXTURES_SET, graphics_bindings::TEXTURES)
  }

  pub fn remove_texture(&mut self, texture_index: usize) -> RenderCoreResult<()> {
    let texture = self.textures.remove_texture(texture_index).ok_or(RenderCoreError::InvalidHandle)?;
    unsafe { self.device.destroy_image_view(texture.image_view, None) };
    texture.view.clean_up(&mut self.allocator);
    Ok(())
  }

  /// `BindExternalTexture`/`RebindExternalTexture`: an external pass's colour
  /// attachment, already created by this engine's `AddExternalRenderPass`,
  /// bound as a sampled texture for a later pass to read. Reuses the same
  /// texture storage and descriptor path as a regular texture; the embedder
  /// is responsible for sequencing passes so the attachment is written
  /// before it is read (spec §4.11/5).
  pub fn bind_external_texture(
    &mut self, image_view: vk::ImageView, view: ResourceView, sampler: vk::Sampler, sampler_index: u32,
    descriptor_index: u32,
  ) -> RenderCoreResult<usize> {
    let texture_index = self.textures.add_texture(view, image_view);
    self.bind_texture(texture_index, sampler, sampler_index, descriptor_index)?;
    Ok(texture_index)
  }

  pub fn rebind_external_texture(
    &mut self, texture_index: usize, sampler: vk::Sampler, sampler_index: u32, descriptor_index: u32,
  ) -> RenderCoreResult<()> {
    self.unbind_texture(texture_index)?;
    self.bind_texture(texture_index, sampler, sampler_index, descriptor_index)
  }

  pub fn unbind_external_texture(&mut self, texture_index: usize) -> RenderCoreResult<()> {
    self.unbind_texture(texture_index)
  }

  // ---- Cameras ----

  pub fn add_camera(&mut self, record: CameraRecord) -> u32 {
    self.cameras.add_camera(record)
  }

  pub fn set_camera(&mut self, handle: u32) -> RenderCoreResult<()> {
    self.cameras.set_camera(handle)
  }

  pub fn remove_camera(&mut self, handle: u32) {
    self.cameras.remove_camera(handle);
  }

  // ---- External render passes ----

  pub fn add_external_render_pass(&mut self) -> u32 {
    self.external_passes.add(RenderPassManager::new())
  }

  pub fn get_external_render_pass(&mut self, pass_index: u32) -> Option<&mut RenderPassManager> {
    self.external_passes.get_mut(pass_index)
  }

  pub fn remove_external_render_pass(&mut self, pass_index: u32) -> Option<RenderPassManager> {
    self.external_passes.remove(pass_index)
  }

  pub fn set_swapchain_external_render_pass(&mut self, pass: RenderPassManager) {
    self.swapchain_pass = Some(pass);
  }

  pub fn remove_swapchain_external_render_pass(&mut self) -> Option<RenderPassManager> {
    self.swapchain_pass.take()
  }

  // ---- External buffers ----

  /// `UpdateExternalBufferDescriptor`: publishes an embedder-owned buffer
  /// into this engine's graphics descriptor buffer at an embedder-chosen set
  /// and binding (for buffers this crate does not itself own, e.g. a
  /// post-process pass's settings UBO).
  pub fn update_external_buffer_descriptor(
    &mut self, set_index: usize, slot: u32, descriptor_index: u32, ty: vk::DescriptorType, buffer: vk::Buffer,
    offset: vk::DeviceSize, range: vk::DeviceSize,
  ) {
    match ty {
      vk::DescriptorType::UNIFORM_BUFFER => self.graphics_descriptors.set_uniform_buffer_descriptor(set_index, slot, descriptor_index, buffer, offset, range),
      _ => self.graphics_descriptors.set_storage_buffer_descriptor(set_index, slot, descriptor_index, buffer, offset, range),
    }
  }

  /// `UploadExternalBufferGPUOnlyData`: one-shot staged upload into a buffer
  /// the embedder owns (no shared-buffer bookkeeping), for data that never
  /// changes again (e.g. static post-process LUTs).
  pub fn upload_external_buffer_gpu_only_data(&mut self, dst: BufferCopyDestination, data: &[u8]) -> RenderCoreResult<()> {
    self.staging.enqueue_buffer_copy(&mut self.allocator, &self.device_properties, data, dst)
  }

  /// `QueueExternalBufferGPUCopy`: same as the upload above, but the source
  /// bytes come from another GPU buffer via `vkCmdCopyBuffer` rather than a
  /// host upload; recorded directly onto the next transfer submission.
  pub fn queue_external_buffer_gpu_copy(
    &mut self, src: vk::Buffer, src_offset: vk::DeviceSize, dst: vk::Buffer, dst_offset: vk::DeviceSize,
    size: vk::DeviceSize,
  ) {
    let cmd = self.frames[self.current_frame as usize].transfer_cmd;
    let region = vk::BufferCopy::builder().src_offset(src_offset).dst_offset(dst_offset).size(size).build();
    unsafe {
      self.device.cmd_copy_buffer(cmd, src, dst, &[region]);
    }
  }

  // ---- Misc embedder surface ----

  pub fn set_shader_path(&mut self, path: PathBuf) {
    self.shader_path = path;
  }

  pub fn shader_path(&self) -> &std::path::Path {
    &self.shader_path
  }

  pub fn get_current_rendering_extent(&self) -> vk::Extent2D {
    self.rendering_extent
  }

  pub fn resize(&mut self, new_extent: vk::Extent2D) -> RenderCoreResult<()> {
    self.wait_for_gpu_to_finish()?;
    self.rendering_extent = new_extent;

    let (new_image, new_view) =
      create_swapchain_colour_attachment(&self.device, &mut self.allocator, new_extent, self.swapchain_format, self.heap_index)?;
    let old_image = std::mem::replace(&mut *self.swapchain_colour_image, new_image);
    let old_view = std::mem::replace(&mut self.swapchain_colour_view, new_view);
    unsafe {
      self.device.destroy_image_view(old_view, None);
    }
    old_image.clean_up(&mut self.allocator);
    Ok(())
  }

  pub fn get_first_display_coordinates(&self) -> (i32, i32) {
    self.first_display_coordinates
  }

  pub fn get_swapchain_format(&self) -> vk::Format {
    self.swapchain_format
  }

  /// View of this engine's internal swapchain-pass colour attachment. The
  /// embedder passes this to `RenderPassManager::add_colour_attachment` when
  /// building the pass it hands to `set_swapchain_external_render_pass`.
  pub fn swapchain_colour_attachment_view(&self) -> vk::ImageView {
    self.swapchain_colour_view
  }
}

/// Tears down every GPU resource this engine owns, in dependency order:
/// waits for the device to go idle (so nothing here races an in-flight
/// submission), reaps every frame's retired queue and temp-buffer backlog,
/// destroys each subsystem's buffers/images through the allocator, then
/// destroys the command pools and per-frame synchronization primitives.
/// Mirrors the teacher's `ManuallyDrop`-staged teardown in
/// `vulkan_renderer/mod.rs` (spec §9 Design Notes: move-only value types with
/// deferred GPU cleanup map to RAII `Drop`).
///
/// `ExternalPipeline`/`RenderPassManager` objects are not destroyed here:
/// both are named "external" because the embedder constructs them (pipeline
/// compilation and render-pass attachment wiring are both spec §1
/// Non-goals) and therefore owns their `vkDestroy*` calls.
impl Drop for RenderEngine {
  fn drop(&mut self) {
    if let Err(err) = self.wait_for_gpu_to_finish() {
      warn!("RenderEngine::drop: wait_for_gpu_to_finish failed, tearing down anyway: {}", err);
    }

    for frame in &mut self.frames {
      for retired in frame.retired.drain(..) {
        match retired {
          Retired::Resource(view) => view.clean_up(&mut self.allocator),
        }
      }
    }
    unsafe { ManuallyDrop::take(&mut self.staging) }.clean_up(&mut self.allocator);

    unsafe { ManuallyDrop::take(&mut self.mesh_vs_individual) }.clean_up(&mut self.allocator);
    unsafe { ManuallyDrop::take(&mut self.mesh_vs_indirect) }.clean_up(&mut self.allocator);
    unsafe { ManuallyDrop::take(&mut self.mesh_ms) }.clean_up(&mut self.allocator);

    unsafe { ManuallyDrop::take(&mut self.model_vs_indirect) }.clean_up(&mut self.allocator);

    unsafe { ManuallyDrop::take(&mut self.model_buffers) }.clean_up(&mut self.allocator);
    unsafe { ManuallyDrop::take(&mut self.material_buffers) }.clean_up(&mut self.allocator);

    unsafe { ManuallyDrop::take(&mut self.graphics_descriptors) }.clean_up(&mut self.allocator);
    unsafe { ManuallyDrop::take(&mut self.compute_descriptors) }.clean_up(&mut self.allocator);

    unsafe { ManuallyDrop::take(&mut self.textures) }.clean_up(&self.device, &mut self.allocator);
    unsafe { ManuallyDrop::take(&mut self.cameras) }.clean_up(&mut self.allocator);

    unsafe { ManuallyDrop::take(&mut self.swapchain_colour_image) }.clean_up(&mut self.allocator);
    unsafe {
      self.device.destroy_image_view(self.swapchain_colour_view, None);
    }

    for frame in &self.frames {
      unsafe {
        self.device.destroy_semaphore(frame.transfer_semaphore, None);
        self.device.destroy_semaphore(frame.compute_semaphore, None);
        self.device.destroy_semaphore(frame.graphics_semaphore, None);
        self.device.destroy_fence(frame.graphics_fence, None);
      }
    }

    unsafe {
      self.device.destroy_command_pool(self.graphics_pool, None);
      self.device.destroy_command_pool(self.transfer_pool, None);
      if let Some(pool) = self.compute_pool {
        self.device.destroy_command_pool(pool, None);
      }
    }
  }
}

const MAX_CAMERAS: u32 = 64;

fn create_swapchain_colour_attachment(
  device: &Arc<Device>, allocator: &mut Allocator, extent: vk::Extent2D, format: vk::Format, heap_index: usize,
) -> RenderCoreResult<(ResourceView, vk::ImageView)> {
  let image = ResourceView::create_image(
    device.clone(),
    allocator,
    vk::Extent3D { width: extent.width, height: extent.height, depth: 1 },
    format,
    vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
    1,
    heap_index,
  )?;
  let view_ci = vk::ImageViewCreateInfo::builder()
    .image(image.image())
    .view_type(vk::ImageViewType::TYPE_2D)
    .format(format)
    .subresource_range(
      vk::ImageSubresourceRange::builder()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .level_count(1)
        .layer_count(1)
        .build(),
    )
    .build();
  let view = unsafe { device.create_image_view(&view_ci, None)? };
  Ok((image, view))
}

fn create_command_pool(device: &Device, queue_family: u32) -> RenderCoreResult<vk::CommandPool> {
  let ci = vk::CommandPoolCreateInfo::builder()
    .queue_family_index(queue_family)
    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
    .build();
  Ok(unsafe { device.create_command_pool(&ci, None)? })
}

fn allocate_command_buffer(device: &Device, pool: vk::CommandPool) -> RenderCoreResult<vk::CommandBuffer> {
  let ci = vk::CommandBufferAllocateInfo::builder()
    .command_pool(pool)
    .level(vk::CommandBufferLevel::PRIMARY)
    .command_buffer_count(1)
    .build();
  Ok(unsafe { device.allocate_command_buffers(&ci)? }[0])
}

fn create_timeline_semaphore(device: &Device) -> RenderCoreResult<vk::Semaphore> {
  let mut type_ci = vk::SemaphoreTypeCreateInfo::builder().semaphore_type(vk::SemaphoreType::TIMELINE).initial_value(0).build();
  let ci = vk::SemaphoreCreateInfo::builder().push_next(&mut type_ci).build();
  Ok(unsafe { device.create_semaphore(&ci, None)? })
}

fn create_binary_semaphore(device: &Device) -> RenderCoreResult<vk::Semaphore> {
  Ok(unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)? })
}

fn create_signaled_fence(device: &Device) -> RenderCoreResult<vk::Fence> {
  let ci = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED).build();
  Ok(unsafe { device.create_fence(&ci, None)? })
}

fn new_shared_buffer_gpu(
  device: &Arc<Device>, allocator: &mut Allocator, device_properties: &DeviceProperties, heap_index: usize,
  usage: vk::BufferUsageFlags,
) -> RenderCoreResult<SharedBufferGpu> {
  SharedBufferGpu::new(device.clone(), allocator, INITIAL_SHARED_BUFFER_SIZE, usage, heap_index, device_properties)
}

fn new_shared_buffer_write_only(
  device: &Arc<Device>, allocator: &mut Allocator, device_properties: &DeviceProperties, heap_index: usize,
) -> RenderCoreResult<SharedBufferWriteOnly> {
  SharedBufferWriteOnly::new(
    device.clone(),
    allocator,
    INITIAL_SHARED_BUFFER_SIZE,
    vk::BufferUsageFlags::STORAGE_BUFFER,
    MemoryType::HostCoherent,
    heap_index,
    device_properties,
  )
}
