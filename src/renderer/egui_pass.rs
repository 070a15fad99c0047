use egui_wgpu::{Renderer as EguiRenderer, ScreenDescriptor};

/// Tessellated overlay output waiting to be drawn on top of the next frame.
pub struct OverlayFrame {
    pub paint_jobs: Vec<egui::ClippedPrimitive>,
    pub textures_delta: egui::TexturesDelta,
    pub screen: ScreenDescriptor,
}

pub(super) fn render(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    painter: &mut EguiRenderer,
    overlay: &OverlayFrame,
    view: &wgpu::TextureView,
) {
    for (id, delta) in &overlay.textures_delta.set {
        painter.update_texture(device, queue, *id, delta);
    }
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Overlay Encoder") });
    let mut extra_cmd =
        painter.update_buffers(device, queue, &mut encoder, &overlay.paint_jobs, &overlay.screen);
    {
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Overlay Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations { load: wgpu::LoadOp::Load, store: wgpu::StoreOp::Store },
            })],
            depth_stencil_attachment: None,
            occlusion_query_set: None,
            timestamp_writes: None,
        });
        let pass = unsafe {
            std::mem::transmute::<&mut wgpu::RenderPass<'_>, &mut wgpu::RenderPass<'static>>(&mut pass)
        };
        painter.render(pass, &overlay.paint_jobs, &overlay.screen);
    }
    extra_cmd.push(encoder.finish());
    queue.submit(extra_cmd);
    for id in &overlay.textures_delta.free {
        painter.free_texture(id);
    }
}
