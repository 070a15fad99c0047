use std::collections::HashMap;
use std::num::NonZeroU64;

use anyhow::{Context, Result};
use glam::Mat4;
use wgpu::util::DeviceExt;

use super::DEPTH_FORMAT;
use crate::geometry::{Geometry, GeometryId, Material, MaterialHandle, MaterialId, MeshVertex};
use crate::render_loop::FrameInput;

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub(super) struct MeshFrameData {
    pub view_proj: [[f32; 4]; 4],
    pub camera_pos: [f32; 4],
    pub ambient: [f32; 4],
    pub key_dir: [f32; 4],
    pub key_color: [f32; 4],
    pub fill_dir: [f32; 4],
    pub fill_color: [f32; 4],
}

impl MeshFrameData {
    fn from_frame(frame: &FrameInput<'_>) -> Self {
        let rig = &frame.lighting;
        let rgb = |c: [f32; 3]| [c[0], c[1], c[2], 1.0];
        Self {
            view_proj: frame.view_proj.to_cols_array_2d(),
            camera_pos: frame.camera_position.extend(1.0).to_array(),
            ambient: rgb(rig.ambient),
            key_dir: rig.key_direction.extend(0.0).to_array(),
            key_color: rgb(rig.key_color),
            fill_dir: rig.fill_direction.extend(0.0).to_array(),
            fill_color: rgb(rig.fill_color),
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub(super) struct MeshDrawData {
    pub model: [[f32; 4]; 4],
    pub normal_matrix: [[f32; 4]; 4],
}

impl MeshDrawData {
    fn new(world: Mat4) -> Self {
        let normal = if world.determinant().abs() > f32::EPSILON { world.inverse().transpose() } else { world };
        Self { model: world.to_cols_array_2d(), normal_matrix: normal.to_cols_array_2d() }
    }
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub(super) struct MaterialData {
    pub base_color: [f32; 4],
    pub params: [f32; 4],
}

impl From<&Material> for MaterialData {
    fn from(material: &Material) -> Self {
        Self { base_color: material.base_color, params: [f32::from(u8::from(material.double_sided)), 0.0, 0.0, 0.0] }
    }
}

struct GpuMesh {
    vertex_buffer: wgpu::Buffer,
    triangle_buffer: wgpu::Buffer,
    triangle_count: u32,
    line_buffer: wgpu::Buffer,
    line_count: u32,
}

impl GpuMesh {
    fn upload(device: &wgpu::Device, geometry: &Geometry) -> Self {
        let label = format!("Geometry {}", geometry.id().raw());
        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label.as_str()),
            contents: bytemuck::cast_slice::<MeshVertex, u8>(geometry.vertices()),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let triangle_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label.as_str()),
            contents: bytemuck::cast_slice(geometry.indices()),
            usage: wgpu::BufferUsages::INDEX,
        });
        let lines = geometry.wireframe_indices();
        let line_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label.as_str()),
            contents: bytemuck::cast_slice(&lines),
            usage: wgpu::BufferUsages::INDEX,
        });
        Self {
            vertex_buffer,
            triangle_buffer,
            triangle_count: geometry.index_count() as u32,
            line_buffer,
            line_count: lines.len() as u32,
        }
    }

    fn destroy(self) {
        self.vertex_buffer.destroy();
        self.triangle_buffer.destroy();
        self.line_buffer.destroy();
    }
}

struct GpuMaterial {
    buffer: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
}

pub(super) struct MeshPipelineResources {
    surface_format: wgpu::TextureFormat,
    triangle_pipeline: wgpu::RenderPipeline,
    wire_pipeline: wgpu::RenderPipeline,
    draw_bgl: wgpu::BindGroupLayout,
    material_bgl: wgpu::BindGroupLayout,
}

/// Geometry buffers and material uniforms keyed by id, uploaded the first
/// time an item references them.
#[derive(Default)]
pub(super) struct MeshPass {
    resources: Option<MeshPipelineResources>,
    frame_buffer: Option<wgpu::Buffer>,
    frame_bind_group: Option<wgpu::BindGroup>,
    draw_buffer: Option<wgpu::Buffer>,
    draw_bind_group: Option<wgpu::BindGroup>,
    draw_capacity: usize,
    draw_stride: u64,
    meshes: HashMap<GeometryId, GpuMesh>,
    materials: HashMap<MaterialId, GpuMaterial>,
}

impl MeshPass {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resident_meshes(&self) -> usize {
        self.meshes.len()
    }

    pub fn ensure_pipeline(&mut self, device: &wgpu::Device, surface_format: wgpu::TextureFormat) {
        if self.resources.as_ref().is_some_and(|r| r.surface_format == surface_format) {
            return;
        }
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Mesh Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../../assets/shaders/mesh.wgsl").into()),
        });
        let uniform_entry = |visibility, dynamic: bool, size: usize| wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: dynamic,
                min_binding_size: NonZeroU64::new(size as u64),
            },
            count: None,
        };
        let frame_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Mesh Frame BGL"),
            entries: &[uniform_entry(
                wgpu::ShaderStages::VERTEX_FRAGMENT,
                false,
                std::mem::size_of::<MeshFrameData>(),
            )],
        });
        let draw_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Mesh Draw BGL"),
            entries: &[uniform_entry(wgpu::ShaderStages::VERTEX, true, std::mem::size_of::<MeshDrawData>())],
        });
        let material_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Mesh Material BGL"),
            entries: &[uniform_entry(wgpu::ShaderStages::FRAGMENT, false, std::mem::size_of::<MaterialData>())],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Mesh Pipeline Layout"),
            bind_group_layouts: &[&frame_bgl, &draw_bgl, &material_bgl],
            push_constant_ranges: &[],
        });
        let make_pipeline = |label: &str, fragment_entry: &str, topology: wgpu::PrimitiveTopology| {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: Some("vs_main"),
                    buffers: &[MeshVertex::layout()],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &shader,
                    entry_point: Some(fragment_entry),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: surface_format,
                        blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                primitive: wgpu::PrimitiveState { topology, cull_mode: None, ..Default::default() },
                depth_stencil: Some(wgpu::DepthStencilState {
                    format: DEPTH_FORMAT,
                    depth_write_enabled: true,
                    depth_compare: wgpu::CompareFunction::LessEqual,
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            })
        };
        let triangle_pipeline = make_pipeline("Mesh Pipeline", "fs_main", wgpu::PrimitiveTopology::TriangleList);
        let wire_pipeline = make_pipeline("Mesh Wire Pipeline", "fs_wire", wgpu::PrimitiveTopology::LineList);

        let frame_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Mesh Frame Uniform"),
            size: std::mem::size_of::<MeshFrameData>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let frame_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Mesh Frame BG"),
            layout: &frame_bgl,
            entries: &[wgpu::BindGroupEntry { binding: 0, resource: frame_buffer.as_entire_binding() }],
        });
        let alignment = u64::from(device.limits().min_uniform_buffer_offset_alignment).max(1);
        let draw_size = std::mem::size_of::<MeshDrawData>() as u64;
        self.draw_stride = draw_size.div_ceil(alignment) * alignment;
        self.frame_buffer = Some(frame_buffer);
        self.frame_bind_group = Some(frame_bind_group);
        self.draw_buffer = None;
        self.draw_bind_group = None;
        self.draw_capacity = 0;
        // Material bind groups reference the old layout.
        self.materials.clear();
        self.resources =
            Some(MeshPipelineResources { surface_format, triangle_pipeline, wire_pipeline, draw_bgl, material_bgl });
    }

    fn ensure_draw_capacity(&mut self, device: &wgpu::Device, count: usize) -> Result<()> {
        if count <= self.draw_capacity && self.draw_buffer.is_some() {
            return Ok(());
        }
        let resources = self.resources.as_ref().context("mesh pipeline not initialized")?;
        let capacity = count.max(16).next_power_of_two();
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Mesh Draw Uniforms"),
            size: self.draw_stride * capacity as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Mesh Draw BG"),
            layout: &resources.draw_bgl,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &buffer,
                    offset: 0,
                    size: NonZeroU64::new(std::mem::size_of::<MeshDrawData>() as u64),
                }),
            }],
        });
        self.draw_buffer = Some(buffer);
        self.draw_bind_group = Some(bind_group);
        self.draw_capacity = capacity;
        Ok(())
    }

    fn ensure_material(&mut self, device: &wgpu::Device, queue: &wgpu::Queue, handle: &MaterialHandle) -> Result<()> {
        if let Some(gpu) = self.materials.get(&handle.id()) {
            if let Some(material) = handle.take_dirty() {
                queue.write_buffer(&gpu.buffer, 0, bytemuck::bytes_of(&MaterialData::from(&material)));
            }
            return Ok(());
        }
        let resources = self.resources.as_ref().context("mesh pipeline not initialized")?;
        let material = handle.take_dirty().unwrap_or_else(|| handle.snapshot());
        let buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(material.label.as_str()),
            contents: bytemuck::bytes_of(&MaterialData::from(&material)),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Mesh Material BG"),
            layout: &resources.material_bgl,
            entries: &[wgpu::BindGroupEntry { binding: 0, resource: buffer.as_entire_binding() }],
        });
        self.materials.insert(handle.id(), GpuMaterial { buffer, bind_group });
        Ok(())
    }

    /// Uploads whatever the frame needs and writes this frame's uniforms.
    pub fn prepare(&mut self, device: &wgpu::Device, queue: &wgpu::Queue, frame: &FrameInput<'_>) -> Result<()> {
        let frame_buffer = self.frame_buffer.as_ref().context("mesh pipeline not initialized")?;
        queue.write_buffer(frame_buffer, 0, bytemuck::bytes_of(&MeshFrameData::from_frame(frame)));
        if frame.items.is_empty() {
            return Ok(());
        }
        self.ensure_draw_capacity(device, frame.items.len())?;
        let mut draw_bytes = vec![0u8; self.draw_stride as usize * frame.items.len()];
        for (index, item) in frame.items.iter().enumerate() {
            let geometry = &item.geometry;
            self.meshes.entry(geometry.id()).or_insert_with(|| GpuMesh::upload(device, geometry));
            self.ensure_material(device, queue, &item.material)?;
            let offset = index * self.draw_stride as usize;
            let data = MeshDrawData::new(item.world);
            draw_bytes[offset..offset + std::mem::size_of::<MeshDrawData>()].copy_from_slice(bytemuck::bytes_of(&data));
        }
        let draw_buffer = self.draw_buffer.as_ref().context("draw uniforms missing")?;
        queue.write_buffer(draw_buffer, 0, &draw_bytes);
        Ok(())
    }

    pub fn encode(&self, pass: &mut wgpu::RenderPass<'_>, frame: &FrameInput<'_>) {
        let (Some(resources), Some(frame_bg), Some(draw_bg)) =
            (self.resources.as_ref(), self.frame_bind_group.as_ref(), self.draw_bind_group.as_ref())
        else {
            return;
        };
        pass.set_bind_group(0, frame_bg, &[]);
        for (index, item) in frame.items.iter().enumerate() {
            let (Some(mesh), Some(material)) =
                (self.meshes.get(&item.geometry.id()), self.materials.get(&item.material.id()))
            else {
                continue;
            };
            let offset = (index as u64 * self.draw_stride) as wgpu::DynamicOffset;
            pass.set_bind_group(1, draw_bg, &[offset]);
            pass.set_bind_group(2, &material.bind_group, &[]);
            pass.set_vertex_buffer(0, mesh.vertex_buffer.slice(..));
            if item.material.wireframe() {
                pass.set_pipeline(&resources.wire_pipeline);
                pass.set_index_buffer(mesh.line_buffer.slice(..), wgpu::IndexFormat::Uint32);
                pass.draw_indexed(0..mesh.line_count, 0, 0..1);
            } else {
                pass.set_pipeline(&resources.triangle_pipeline);
                pass.set_index_buffer(mesh.triangle_buffer.slice(..), wgpu::IndexFormat::Uint32);
                pass.draw_indexed(0..mesh.triangle_count, 0, 0..1);
            }
        }
    }

    /// Returns false when the geometry was never uploaded or already freed.
    pub fn release_geometry(&mut self, id: GeometryId) -> bool {
        match self.meshes.remove(&id) {
            Some(mesh) => {
                mesh.destroy();
                true
            }
            None => false,
        }
    }

    pub fn release_material(&mut self, id: MaterialId) -> bool {
        match self.materials.remove(&id) {
            Some(material) => {
                material.buffer.destroy();
                true
            }
            None => false,
        }
    }

    /// Forgets every GPU object; used after the device itself was replaced.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
