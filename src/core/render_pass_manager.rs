//! Render-Pass Manager (spec §4.11): dynamic-rendering attachment set,
//! pre-pass image barriers, and the swapchain end-of-pass blit.

use ash::vk;

/// A queued pre-pass transition; its `src_stage` is filled in per frame from
/// the attachment's tracked `current_pipeline_stage` so the first use each
/// frame behaves like a `TOP_OF_PIPE` wait and later uses wait on whatever
/// last touched the image.
struct PendingBarrier {
  image: vk::Image,
  old_layout: vk::ImageLayout,
  new_layout: vk::ImageLayout,
  src_access: vk::AccessFlags,
  dst_access: vk::AccessFlags,
  dst_stage: vk::PipelineStageFlags,
  aspect_mask: vk::ImageAspectFlags,
}

/// Holds the dynamic-rendering attachment list plus the barriers that must
/// run immediately before `vkCmdBeginRendering`.
#[derive(Default)]
pub struct RenderPassManager {
  color_attachments: Vec<vk::RenderingAttachmentInfo>,
  depth_attachment: Option<vk::RenderingAttachmentInfo>,
  stencil_attachment: Option<vk::RenderingAttachmentInfo>,
  pending_barriers: Vec<PendingBarrier>,
}

impl RenderPassManager {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_colour_attachment(
    &mut self, view: vk::ImageView, clear_value: vk::ClearValue, load_op: vk::AttachmentLoadOp,
    store_op: vk::AttachmentStoreOp,
  ) {
    self.color_attachments.push(
      vk::RenderingAttachmentInfo::builder()
        .image_view(view)
        .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .load_op(load_op)
        .store_op(store_op)
        .clear_value(clear_value)
        .build(),
    );
  }

  pub fn set_depth_attachment(
    &mut self, view: vk::ImageView, clear_value: vk::ClearValue, load_op: vk::AttachmentLoadOp,
    store_op: vk::AttachmentStoreOp,
  ) {
    self.depth_attachment = Some(
      vk::RenderingAttachmentInfo::builder()
        .image_view(view)
        .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .load_op(load_op)
        .store_op(store_op)
        .clear_value(clear_value)
        .build(),
    );
  }

  pub fn set_stencil_attachment(
    &mut self, view: vk::ImageView, clear_value: vk::ClearValue, load_op: vk::AttachmentLoadOp,
    store_op: vk::AttachmentStoreOp,
  ) {
    self.stencil_attachment = Some(
      vk::RenderingAttachmentInfo::builder()
        .image_view(view)
        .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .load_op(load_op)
        .store_op(store_op)
        .clear_value(clear_value)
        .build(),
    );
  }

  pub fn add_colour_start_barrier(
    &mut self, image: vk::Image, old_layout: vk::ImageLayout, src_access: vk::AccessFlags,
  ) {
    self.pending_barriers.push(PendingBarrier {
      image,
      old_layout,
      new_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
      src_access,
      dst_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
      dst_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
      aspect_mask: vk::ImageAspectFlags::COLOR,
    });
  }

  pub fn add_depth_or_stencil_start_barrier(
    &mut self, image: vk::Image, old_layout: vk::ImageLayout, src_access: vk::AccessFlags,
  ) {
    self.pending_barriers.push(PendingBarrier {
      image,
      old_layout,
      new_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
      src_access,
      dst_access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
      dst_stage: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
      aspect_mask: vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
    });
  }

  /// Executes queued barriers, then `vkCmdBeginRendering`. `src_stage` for
  /// each barrier is the caller-supplied stage the attachment was last used
  /// at (`TOP_OF_PIPE` on first use this frame).
  pub fn start_pass(
    &mut self, device: &ash::Device, graphics_cmd: vk::CommandBuffer, render_area: vk::Rect2D,
    src_stage: vk::PipelineStageFlags,
  ) {
    for barrier in self.pending_barriers.drain(..) {
      let vk_barrier = vk::ImageMemoryBarrier::builder()
        .old_layout(barrier.old_layout)
        .new_layout(barrier.new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(barrier.image)
        .subresource_range(
          vk::ImageSubresourceRange::builder()
            .aspect_mask(barrier.aspect_mask)
            .level_count(vk::REMAINING_MIP_LEVELS)
            .layer_count(vk::REMAINING_ARRAY_LAYERS)
            .build(),
        )
        .src_access_mask(barrier.src_access)
        .dst_access_mask(barrier.dst_access)
        .build();
      unsafe {
        device.cmd_pipeline_barrier(
          graphics_cmd,
          src_stage,
          barrier.dst_stage,
          vk::DependencyFlags::empty(),
          &[],
          &[],
          &[vk_barrier],
        );
      }
    }

    let rendering_info = vk::RenderingInfo::builder()
      .render_area(render_area)
      .layer_count(1)
      .color_attachments(&self.color_attachments);
    let rendering_info = if let Some(depth) = &self.depth_attachment {
      rendering_info.depth_attachment(depth)
    } else {
      rendering_info
    };
    let rendering_info = if let Some(stencil) = &self.stencil_attachment {
      rendering_info.stencil_attachment(stencil)
    } else {
      rendering_info
    };
    unsafe {
      device.cmd_begin_rendering(graphics_cmd, &rendering_info);
    }
  }

  pub fn end_pass(&self, device: &ash::Device, graphics_cmd: vk::CommandBuffer) {
    unsafe {
      device.cmd_end_rendering(graphics_cmd);
    }
  }

  /// Ends rendering, then blits this pass's color attachment into the
  /// swapchain back buffer: `TRANSFER_SRC_OPTIMAL` / `TRANSFER_DST_OPTIMAL`
  /// transitions, `vkCmdCopyImage`, then `PRESENT_SRC_KHR`.
  pub fn end_pass_for_swapchain(
    &self, device: &ash::Device, graphics_cmd: vk::CommandBuffer, src_color_view_image: vk::Image,
    swapchain_back_buffer: vk::Image, src_extent: vk::Extent3D,
  ) {
    self.end_pass(device, graphics_cmd);

    let color_range = vk::ImageSubresourceRange::builder()
      .aspect_mask(vk::ImageAspectFlags::COLOR)
      .level_count(1)
      .layer_count(1)
      .build();
    unsafe {
      let to_transfer_src = vk::ImageMemoryBarrier::builder()
        .old_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(src_color_view_image)
        .subresource_range(color_range)
        .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
        .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
        .build();
      let to_transfer_dst = vk::ImageMemoryBarrier::builder()
        .old_layout(vk::ImageLayout::UNDEFINED)
        .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(swapchain_back_buffer)
        .subresource_range(color_range)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .build();
      device.cmd_pipeline_barrier(
        graphics_cmd,
        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        vk::PipelineStageFlags::TRANSFER,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        &[to_transfer_src, to_transfer_dst],
      );

      let copy = vk::ImageCopy::builder()
        .src_subresource(
          vk::ImageSubresourceLayers::builder()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .layer_count(1)
            .build(),
        )
        .dst_subresource(
          vk::ImageSubresourceLayers::builder()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .layer_count(1)
            .build(),
        )
        .extent(src_extent)
        .build();
      device.cmd_copy_image(
        graphics_cmd,
        src_color_view_image,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        swapchain_back_buffer,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        &[copy],
      );

      let to_present = vk::ImageMemoryBarrier::builder()
        .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(swapchain_back_buffer)
        .subresource_range(color_range)
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::empty())
        .build();
      device.cmd_pipeline_barrier(
        graphics_cmd,
        vk::PipelineStageFlags::TRANSFER,
        vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        &[to_present],
      );
    }
  }
}
