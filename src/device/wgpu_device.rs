//! [`GraphicsDevice`] on top of `wgpu`.
//!
//! Draw calls are turned into pipeline objects lazily (one per program, state
//! and target format) and recorded. [`GraphicsDevice::present`] replays the
//! recording into one command encoder: consecutive operations on the same
//! target share a render pass and clears become the pass load operations.

use std::{
    collections::HashMap,
    num::NonZeroU64,
    sync::atomic::Ordering,
    time::Duration,
};

use wgpu::util::DeviceExt;

use super::{
    BlendMode, BufferId, BufferKind, ClearOps, CompareFunction, CullMode, DrawCall,
    FramebufferDesc, FramebufferId, GraphicsDevice, IndexFormat, ProgramId, ProgramSource,
    RenderState, StencilOp, TextureDesc, TextureId, TextureKind, TextureSlot, Topology,
};
use crate::{
    context::{Context, Presentation},
    data_structures::{geometry::Attribute, texture::Texture},
    error::{CompileError, DeviceError},
};

#[derive(Debug)]
struct GpuBuffer {
    buffer: wgpu::Buffer,
    kind: BufferKind,
    /// CPU copy of index data, kept to widen 8-bit indices.
    indices: Option<Vec<u8>>,
    widened: Option<wgpu::Buffer>,
}

#[derive(Debug)]
struct Program {
    label: String,
    module: wgpu::ShaderModule,
    attributes: Vec<Attribute>,
    textures: Vec<TextureSlot>,
    texture_layout: Option<wgpu::BindGroupLayout>,
    layout: wgpu::PipelineLayout,
}

#[derive(Debug)]
struct Target {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    format: wgpu::TextureFormat,
    depth: Option<Texture>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct StreamLayout {
    attribute: Attribute,
    per_instance: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct PipelineKey {
    program: ProgramId,
    state: RenderState,
    color_format: wgpu::TextureFormat,
    depth_format: Option<wgpu::TextureFormat>,
    streams: Vec<StreamLayout>,
}

#[derive(Debug)]
struct PendingDraw {
    target: Option<FramebufferId>,
    pipeline: wgpu::RenderPipeline,
    vertex_buffers: Vec<wgpu::Buffer>,
    index: Option<(wgpu::Buffer, wgpu::IndexFormat)>,
    first: u32,
    count: u32,
    instances: u32,
    uniforms: Vec<u8>,
    textures: Option<wgpu::BindGroup>,
    stencil_reference: u32,
}

#[derive(Debug)]
enum Op {
    Clear {
        target: Option<FramebufferId>,
        ops: ClearOps,
    },
    Draw(PendingDraw),
}

/// Render pass being assembled from consecutive ops.
struct PassPlan {
    target: Option<FramebufferId>,
    clear: ClearOps,
    draws: Vec<(PendingDraw, u32)>,
}

pub struct WgpuDevice {
    ctx: Context,
    next_id: u32,
    buffers: HashMap<BufferId, GpuBuffer>,
    textures: HashMap<TextureId, Texture>,
    targets: HashMap<FramebufferId, Target>,
    programs: HashMap<ProgramId, Program>,
    pipelines: HashMap<PipelineKey, Option<wgpu::RenderPipeline>>,
    bind_groups: HashMap<(ProgramId, Vec<(u32, TextureId)>), wgpu::BindGroup>,
    uniform_layout: wgpu::BindGroupLayout,
    surface_depth: Texture,
    fallback_2d: Texture,
    fallback_cube: Texture,
    zero: wgpu::Buffer,
    ops: Vec<Op>,
}

impl WgpuDevice {
    pub fn new(ctx: Context) -> Self {
        let (width, height) = ctx.surface_size();
        let uniform_layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("uniform_bind_group_layout"),
                entries: &[wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: true,
                        min_binding_size: None,
                    },
                    count: None,
                }],
            });
        let surface_depth =
            Texture::create_depth_texture(&ctx.device, [width, height], "surface_depth");
        let white = TextureDesc::color("fallback", 1, 1);
        let fallback_2d = Texture::from_desc(
            &ctx.device,
            &ctx.queue,
            &white,
            Some(&[255; 4]),
            ctx.float32_filterable,
        );
        let fallback_cube = Texture::from_desc(
            &ctx.device,
            &ctx.queue,
            &TextureDesc {
                kind: TextureKind::Cube,
                ..white
            },
            Some(&[255; 24]),
            ctx.float32_filterable,
        );
        let zero = Self::zero_buffer(&ctx.device, 1024);
        Self {
            ctx,
            next_id: 1,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            targets: HashMap::new(),
            programs: HashMap::new(),
            pipelines: HashMap::new(),
            bind_groups: HashMap::new(),
            uniform_layout,
            surface_depth,
            fallback_2d,
            fallback_cube,
            zero,
            ops: Vec::new(),
        }
    }

    pub async fn headless(width: u32, height: u32) -> anyhow::Result<Self> {
        Ok(Self::new(Context::headless(width, height).await?))
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    fn zero_buffer(device: &wgpu::Device, size: u64) -> wgpu::Buffer {
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("zero_attribute_buffer"),
            size,
            usage: wgpu::BufferUsages::VERTEX,
            // wgpu zero-initialises new buffers.
            mapped_at_creation: false,
        })
    }

    fn next(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn target_formats(
        &self,
        target: Option<FramebufferId>,
    ) -> Option<(wgpu::TextureFormat, Option<wgpu::TextureFormat>)> {
        match target {
            None => Some((self.ctx.surface_format(), Some(Texture::DEPTH_FORMAT))),
            Some(id) => self
                .targets
                .get(&id)
                .map(|t| (t.format, t.depth.as_ref().map(|d| d.format))),
        }
    }

    fn create_pipeline(&self, key: &PipelineKey, program: &Program) -> wgpu::RenderPipeline {
        let attributes: Vec<Vec<wgpu::VertexAttribute>> = key
            .streams
            .iter()
            .map(|stream| vertex_attributes(stream.attribute))
            .collect();
        let buffers: Vec<wgpu::VertexBufferLayout> = key
            .streams
            .iter()
            .zip(attributes.iter())
            .map(|(stream, attributes)| wgpu::VertexBufferLayout {
                array_stride: (stream.attribute.size() * 4) as wgpu::BufferAddress,
                step_mode: if stream.per_instance {
                    wgpu::VertexStepMode::Instance
                } else {
                    wgpu::VertexStepMode::Vertex
                },
                attributes,
            })
            .collect();

        let state = key.state;
        let depth_stencil = key.depth_format.map(|format| {
            let stencil = match state.stencil {
                Some(stencil) => {
                    let face = wgpu::StencilFaceState {
                        compare: compare_function(stencil.compare),
                        fail_op: wgpu::StencilOperation::Keep,
                        depth_fail_op: wgpu::StencilOperation::Keep,
                        pass_op: stencil_operation(stencil.pass),
                    };
                    wgpu::StencilState {
                        front: face,
                        back: face,
                        read_mask: 0xff,
                        write_mask: 0xff,
                    }
                }
                None => wgpu::StencilState::default(),
            };
            wgpu::DepthStencilState {
                format,
                depth_write_enabled: state.depth_write,
                depth_compare: if state.depth_test {
                    wgpu::CompareFunction::LessEqual
                } else {
                    wgpu::CompareFunction::Always
                },
                stencil,
                bias: wgpu::DepthBiasState::default(),
            }
        });

        self.ctx
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(&program.label),
                layout: Some(&program.layout),
                vertex: wgpu::VertexState {
                    module: &program.module,
                    entry_point: Some("vs_main"),
                    buffers: &buffers,
                    compilation_options: Default::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &program.module,
                    entry_point: Some("fs_main"),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: key.color_format,
                        blend: blend_state(state.blend),
                        write_mask: if state.color_write {
                            wgpu::ColorWrites::ALL
                        } else {
                            wgpu::ColorWrites::empty()
                        },
                    })],
                    compilation_options: Default::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: match state.topology {
                        Topology::Triangles => wgpu::PrimitiveTopology::TriangleList,
                        Topology::Lines => wgpu::PrimitiveTopology::LineList,
                    },
                    strip_index_format: None,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: match state.cull {
                        CullMode::None => None,
                        CullMode::Back => Some(wgpu::Face::Back),
                        CullMode::Front => Some(wgpu::Face::Front),
                    },
                    polygon_mode: wgpu::PolygonMode::Fill,
                    unclipped_depth: false,
                    conservative: false,
                },
                depth_stencil,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            })
    }

    fn pipeline(&mut self, key: PipelineKey) -> Option<wgpu::RenderPipeline> {
        if let Some(cached) = self.pipelines.get(&key) {
            return cached.clone();
        }
        let program = self.programs.get(&key.program)?;
        self.ctx
            .device
            .push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = self.create_pipeline(&key, program);
        let result = match futures::executor::block_on(self.ctx.device.pop_error_scope()) {
            Some(error) => {
                log::error!("{}: pipeline creation failed: {}", program.label, error);
                None
            }
            None => Some(pipeline),
        };
        self.pipelines.insert(key, result.clone());
        result
    }

    fn texture_bind_group(
        &mut self,
        program_id: ProgramId,
        bindings: &[super::TextureBinding],
    ) -> Option<wgpu::BindGroup> {
        let program = self.programs.get(&program_id)?;
        let layout = program.texture_layout.as_ref()?;
        let resolved: Vec<(u32, TextureId)> = program
            .textures
            .iter()
            .filter_map(|slot| {
                bindings
                    .iter()
                    .find(|b| b.slot == slot.slot)
                    .map(|b| (slot.slot, b.texture))
            })
            .collect();
        let key = (program_id, resolved);
        if let Some(group) = self.bind_groups.get(&key) {
            return Some(group.clone());
        }

        let mut entries = Vec::with_capacity(program.textures.len() * 2);
        for slot in &program.textures {
            let texture = key
                .1
                .iter()
                .find(|(s, _)| *s == slot.slot)
                .and_then(|(_, id)| self.textures.get(id))
                .unwrap_or(match slot.kind {
                    TextureKind::D2 => &self.fallback_2d,
                    TextureKind::Cube => &self.fallback_cube,
                });
            let sampler = texture
                .sampler
                .as_ref()
                .or(self.fallback_2d.sampler.as_ref())?;
            entries.push(wgpu::BindGroupEntry {
                binding: slot.slot * 2,
                resource: wgpu::BindingResource::TextureView(&texture.view),
            });
            entries.push(wgpu::BindGroupEntry {
                binding: slot.slot * 2 + 1,
                resource: wgpu::BindingResource::Sampler(sampler),
            });
        }
        let group = self
            .ctx
            .device
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(&program.label),
                layout,
                entries: &entries,
            });
        self.bind_groups.insert(key, group.clone());
        Some(group)
    }

    fn index_buffer(
        &mut self,
        binding: super::IndexBinding,
    ) -> Option<(wgpu::Buffer, wgpu::IndexFormat)> {
        let device = &self.ctx.device;
        let gpu = self.buffers.get_mut(&binding.buffer)?;
        match binding.format {
            IndexFormat::U16 => Some((gpu.buffer.clone(), wgpu::IndexFormat::Uint16)),
            IndexFormat::U32 => Some((gpu.buffer.clone(), wgpu::IndexFormat::Uint32)),
            // wgpu has no 8-bit index format.
            IndexFormat::U8 => {
                if gpu.widened.is_none() {
                    let indices: Vec<u32> = gpu
                        .indices
                        .as_deref()
                        .unwrap_or_default()
                        .iter()
                        .map(|&i| i as u32)
                        .collect();
                    let mut bytes = IndexFormat::U16.encode(&indices);
                    // Buffer sizes must stay 4-byte aligned.
                    bytes.resize(bytes.len().next_multiple_of(4).max(4), 0);
                    gpu.widened = Some(device.create_buffer_init(
                        &wgpu::util::BufferInitDescriptor {
                            label: Some("widened_index_buffer"),
                            contents: &bytes,
                            usage: wgpu::BufferUsages::INDEX,
                        },
                    ));
                }
                gpu.widened
                    .clone()
                    .map(|buffer| (buffer, wgpu::IndexFormat::Uint16))
            }
        }
    }

    fn ensure_zero_capacity(&mut self, size: u64) {
        if self.zero.size() < size {
            self.zero = Self::zero_buffer(&self.ctx.device, size.next_power_of_two());
        }
    }

    /// Encodes and submits every recorded op. `surface` is the view ops
    /// targeting the visible surface render into; without one they are dropped.
    fn flush(&mut self, surface: Option<wgpu::TextureView>) {
        let ops = std::mem::take(&mut self.ops);
        if ops.is_empty() {
            return;
        }

        let alignment = self.ctx.device.limits().min_uniform_buffer_offset_alignment as usize;
        let binding_size = ops
            .iter()
            .filter_map(|op| match op {
                Op::Draw(draw) => Some(draw.uniforms.len()),
                _ => None,
            })
            .max()
            .unwrap_or(0)
            .next_multiple_of(16)
            .max(16);

        let mut passes: Vec<PassPlan> = Vec::new();
        let mut uniform_data: Vec<u8> = Vec::new();
        for op in ops {
            match op {
                Op::Clear { target, ops } => match passes.last_mut() {
                    Some(pass) if pass.target == target && pass.draws.is_empty() => {
                        merge_clear(&mut pass.clear, &ops)
                    }
                    _ => passes.push(PassPlan {
                        target,
                        clear: ops,
                        draws: Vec::new(),
                    }),
                },
                Op::Draw(draw) => {
                    let offset = uniform_data.len().next_multiple_of(alignment);
                    uniform_data.resize(offset, 0);
                    uniform_data.extend_from_slice(&draw.uniforms);
                    let entry = (draw, offset as u32);
                    match passes.last_mut() {
                        Some(pass) if pass.target == entry.0.target => pass.draws.push(entry),
                        _ => passes.push(PassPlan {
                            target: entry.0.target,
                            clear: ClearOps::default(),
                            draws: vec![entry],
                        }),
                    }
                }
            }
        }
        let end = uniform_data.len().next_multiple_of(alignment) + binding_size;
        uniform_data.resize(end, 0);

        let device = &self.ctx.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let uniform_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("frame_uniforms"),
            contents: &uniform_data,
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let uniform_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("frame_uniform_bind_group"),
            layout: &self.uniform_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &uniform_buffer,
                    offset: 0,
                    size: NonZeroU64::new(binding_size as u64),
                }),
            }],
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Render Encoder"),
        });
        for pass in passes {
            let (view, depth) = match pass.target {
                None => match surface.as_ref() {
                    Some(view) => (view, Some(&self.surface_depth.view)),
                    None => {
                        log::warn!("dropping surface pass without an acquired surface");
                        continue;
                    }
                },
                Some(id) => match self.targets.get(&id) {
                    Some(target) => (&target.view, target.depth.as_ref().map(|d| &d.view)),
                    None => {
                        log::warn!("dropping pass into destroyed framebuffer {:?}", id);
                        continue;
                    }
                },
            };
            let load_color = match pass.clear.color {
                Some([r, g, b, a]) => wgpu::LoadOp::Clear(wgpu::Color {
                    r: r as f64,
                    g: g as f64,
                    b: b as f64,
                    a: a as f64,
                }),
                None => wgpu::LoadOp::Load,
            };
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Render Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: load_color,
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: depth.map(|view| {
                    wgpu::RenderPassDepthStencilAttachment {
                        view,
                        depth_ops: Some(wgpu::Operations {
                            load: pass
                                .clear
                                .depth
                                .map(wgpu::LoadOp::Clear)
                                .unwrap_or(wgpu::LoadOp::Load),
                            store: wgpu::StoreOp::Store,
                        }),
                        stencil_ops: Some(wgpu::Operations {
                            load: pass
                                .clear
                                .stencil
                                .map(wgpu::LoadOp::Clear)
                                .unwrap_or(wgpu::LoadOp::Load),
                            store: wgpu::StoreOp::Store,
                        }),
                    }
                }),
                ..Default::default()
            });

            for (draw, offset) in &pass.draws {
                render_pass.set_pipeline(&draw.pipeline);
                render_pass.set_bind_group(0, &uniform_group, &[*offset]);
                if let Some(textures) = &draw.textures {
                    render_pass.set_bind_group(1, textures, &[]);
                }
                for (slot, buffer) in draw.vertex_buffers.iter().enumerate() {
                    render_pass.set_vertex_buffer(slot as u32, buffer.slice(..));
                }
                render_pass.set_stencil_reference(draw.stencil_reference);
                let range = draw.first..draw.first + draw.count;
                match &draw.index {
                    Some((buffer, format)) => {
                        render_pass.set_index_buffer(buffer.slice(..), *format);
                        render_pass.draw_indexed(range, 0, 0..draw.instances);
                    }
                    None => render_pass.draw(range, 0..draw.instances),
                }
            }
        }
        self.ctx.queue.submit(std::iter::once(encoder.finish()));
        if let Some(error) = futures::executor::block_on(device.pop_error_scope()) {
            log::error!("frame submission failed: {}", error);
        }
    }

    fn read_texture(&self, texture: &wgpu::Texture) -> Result<Vec<u8>, DeviceError> {
        let format = texture.format();
        if format.block_copy_size(None) != Some(4) {
            return Err(DeviceError::Invalid {
                what: "read_pixels",
                reason: format!("cannot read back {:?}", format),
            });
        }
        let (width, height) = (texture.width(), texture.height());
        let unpadded = 4 * width;
        let padded = unpadded.next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        let device = &self.ctx.device;
        let output_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size: (padded * height) as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Readback Encoder"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                aspect: wgpu::TextureAspect::All,
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &output_buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.ctx.queue.submit(std::iter::once(encoder.finish()));

        let buffer_slice = output_buffer.slice(..);
        let (tx, rx) = futures_intrusive::channel::shared::oneshot_channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: Some(Duration::from_secs(3)),
            })
            .map_err(|e| DeviceError::Invalid {
                what: "read_pixels",
                reason: e.to_string(),
            })?;
        futures::executor::block_on(rx.receive())
            .ok_or_else(|| DeviceError::Invalid {
                what: "read_pixels",
                reason: "mapping was cancelled".to_string(),
            })?
            .map_err(|e| DeviceError::Invalid {
                what: "read_pixels",
                reason: e.to_string(),
            })?;

        let data = buffer_slice.get_mapped_range();
        let pixels = data
            .chunks(padded as usize)
            .flat_map(|row| &row[..unpadded as usize])
            .copied()
            .collect();
        drop(data);
        output_buffer.unmap();
        Ok(pixels)
    }
}

impl GraphicsDevice for WgpuDevice {
    fn create_buffer(&mut self, kind: BufferKind, data: &[u8]) -> Result<BufferId, DeviceError> {
        if self.is_lost() {
            return Err(DeviceError::ContextLost);
        }
        let usage = match kind {
            BufferKind::Vertex => wgpu::BufferUsages::VERTEX,
            BufferKind::Index => wgpu::BufferUsages::INDEX,
        } | wgpu::BufferUsages::COPY_DST;
        let mut contents = data.to_vec();
        contents.resize(contents.len().next_multiple_of(4).max(4), 0);
        let buffer = self
            .ctx
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(match kind {
                    BufferKind::Vertex => "Vertex Buffer",
                    BufferKind::Index => "Index Buffer",
                }),
                contents: &contents,
                usage,
            });
        let id = BufferId(self.next());
        self.buffers.insert(
            id,
            GpuBuffer {
                buffer,
                kind,
                indices: (kind == BufferKind::Index).then(|| data.to_vec()),
                widened: None,
            },
        );
        Ok(id)
    }

    fn update_buffer(&mut self, id: BufferId, data: &[u8]) -> Result<(), DeviceError> {
        if self.is_lost() {
            return Err(DeviceError::ContextLost);
        }
        let gpu = self
            .buffers
            .get_mut(&id)
            .ok_or(DeviceError::UnknownHandle { kind: "buffer", id: id.0 })?;
        if (data.len() as u64).next_multiple_of(4) > gpu.buffer.size() {
            return Err(DeviceError::Invalid {
                what: "buffer update",
                reason: format!("{} bytes exceed buffer size {}", data.len(), gpu.buffer.size()),
            });
        }
        let mut contents = data.to_vec();
        contents.resize(contents.len().next_multiple_of(4), 0);
        self.ctx.queue.write_buffer(&gpu.buffer, 0, &contents);
        if gpu.kind == BufferKind::Index {
            gpu.indices = Some(data.to_vec());
            gpu.widened = None;
        }
        Ok(())
    }

    fn destroy_buffer(&mut self, id: BufferId) {
        self.buffers.remove(&id);
    }

    fn create_texture(
        &mut self,
        desc: &TextureDesc,
        pixels: Option<&[u8]>,
    ) -> Result<TextureId, DeviceError> {
        if self.is_lost() {
            return Err(DeviceError::ContextLost);
        }
        if let Some(pixels) = pixels {
            if pixels.len() != desc.byte_len() {
                return Err(DeviceError::Invalid {
                    what: "texture data",
                    reason: format!("expected {} bytes, got {}", desc.byte_len(), pixels.len()),
                });
            }
        }
        let texture = Texture::from_desc(
            &self.ctx.device,
            &self.ctx.queue,
            desc,
            pixels,
            self.ctx.float32_filterable,
        );
        let id = TextureId(self.next());
        self.textures.insert(id, texture);
        Ok(id)
    }

    fn destroy_texture(&mut self, id: TextureId) {
        if self.textures.remove(&id).is_some() {
            self.bind_groups
                .retain(|(_, bound), _| !bound.iter().any(|(_, t)| *t == id));
        }
    }

    fn create_framebuffer(&mut self, desc: &FramebufferDesc) -> Result<FramebufferId, DeviceError> {
        if self.is_lost() {
            return Err(DeviceError::ContextLost);
        }
        let color = self
            .textures
            .get(&desc.color)
            .ok_or(DeviceError::UnknownHandle {
                kind: "texture",
                id: desc.color.0,
            })?;
        if !color
            .texture
            .usage()
            .contains(wgpu::TextureUsages::RENDER_ATTACHMENT)
        {
            return Err(DeviceError::Invalid {
                what: "framebuffer",
                reason: "colour texture was not created as a render target".to_string(),
            });
        }
        let depth = (desc.depth || desc.stencil).then(|| {
            Texture::create_depth_texture(
                &self.ctx.device,
                [color.size.0, color.size.1],
                "framebuffer_depth",
            )
        });
        let target = Target {
            texture: color.texture.clone(),
            view: color.view.clone(),
            format: color.format,
            depth,
        };
        let id = FramebufferId(self.next());
        self.targets.insert(id, target);
        Ok(id)
    }

    fn destroy_framebuffer(&mut self, id: FramebufferId) {
        self.targets.remove(&id);
    }

    fn create_program(&mut self, source: &ProgramSource) -> Result<ProgramId, CompileError> {
        if self.is_lost() {
            return Err(CompileError::ContextLost);
        }
        let device = &self.ctx.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(&source.label),
            source: wgpu::ShaderSource::Wgsl(source.source.as_str().into()),
        });
        if let Some(error) = futures::executor::block_on(device.pop_error_scope()) {
            return Err(CompileError::Compile {
                label: source.label.clone(),
                log: error.to_string(),
            });
        }

        let texture_layout = (!source.textures.is_empty()).then(|| {
            let entries: Vec<wgpu::BindGroupLayoutEntry> = source
                .textures
                .iter()
                .flat_map(|slot| texture_layout_entries(*slot))
                .collect();
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(&source.label),
                entries: &entries,
            })
        });
        let mut groups = vec![&self.uniform_layout];
        if let Some(layout) = texture_layout.as_ref() {
            groups.push(layout);
        }
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(&source.label),
            bind_group_layouts: &groups,
            push_constant_ranges: &[],
        });

        let program = Program {
            label: source.label.clone(),
            module,
            attributes: source.attributes.clone(),
            textures: source.textures.clone(),
            texture_layout,
            layout,
        };

        // Building one pipeline up front surfaces entry point and interface
        // mismatches as link errors instead of dropped draws.
        let key = PipelineKey {
            program: ProgramId(0),
            state: RenderState::opaque(),
            color_format: wgpu::TextureFormat::Rgba8Unorm,
            depth_format: Some(Texture::DEPTH_FORMAT),
            streams: program
                .attributes
                .iter()
                .map(|&attribute| StreamLayout {
                    attribute,
                    per_instance: attribute.default_per_instance(),
                })
                .collect(),
        };
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let _ = self.create_pipeline(&key, &program);
        if let Some(error) = futures::executor::block_on(self.ctx.device.pop_error_scope()) {
            return Err(CompileError::Link {
                label: source.label.clone(),
                log: error.to_string(),
            });
        }

        let id = ProgramId(self.next());
        self.programs.insert(id, program);
        Ok(id)
    }

    fn destroy_program(&mut self, id: ProgramId) {
        if self.programs.remove(&id).is_some() {
            self.pipelines.retain(|key, _| key.program != id);
            self.bind_groups.retain(|(program, _), _| *program != id);
        }
    }

    fn surface_size(&self) -> (u32, u32) {
        self.ctx.surface_size()
    }

    fn resize_surface(&mut self, width: u32, height: u32) {
        if self.surface_size() == (width.max(1), height.max(1)) {
            return;
        }
        self.ctx.resize(width, height);
        self.surface_depth =
            Texture::create_depth_texture(&self.ctx.device, [width, height], "surface_depth");
    }

    fn clear(&mut self, target: Option<FramebufferId>, ops: &ClearOps) {
        if self.is_lost() {
            return;
        }
        self.ops.push(Op::Clear { target, ops: *ops });
    }

    fn draw(&mut self, call: &DrawCall<'_>) {
        if self.is_lost() || call.count == 0 || call.instances == 0 {
            return;
        }
        let Some((color_format, depth_format)) = self.target_formats(call.target) else {
            log::warn!("draw into unknown framebuffer {:?}", call.target);
            return;
        };
        let Some(attributes) = self.programs.get(&call.program).map(|p| p.attributes.clone())
        else {
            log::warn!("draw with unknown program {:?}", call.program);
            return;
        };

        let mut streams = Vec::with_capacity(attributes.len());
        let mut vertex_buffers = Vec::with_capacity(attributes.len());
        for attribute in attributes {
            let bound = call
                .streams
                .iter()
                .find(|s| s.attribute == attribute)
                .and_then(|s| self.buffers.get(&s.buffer).map(|b| (s.per_instance, b)));
            match bound {
                Some((per_instance, gpu)) => {
                    streams.push(StreamLayout {
                        attribute,
                        per_instance,
                    });
                    vertex_buffers.push(gpu.buffer.clone());
                }
                None => {
                    // Missing inputs read zeros, one element per instance.
                    let size = (attribute.size() * 4) as u64 * call.instances as u64;
                    self.ensure_zero_capacity(size);
                    streams.push(StreamLayout {
                        attribute,
                        per_instance: true,
                    });
                    vertex_buffers.push(self.zero.clone());
                }
            }
        }

        let mut state = call.state;
        let stencil_reference = state.stencil.map(|s| s.reference).unwrap_or(0);
        if let Some(stencil) = state.stencil.as_mut() {
            stencil.reference = 0;
        }
        let key = PipelineKey {
            program: call.program,
            state,
            color_format,
            depth_format,
            streams,
        };
        let Some(pipeline) = self.pipeline(key) else {
            return;
        };
        let index = match call.index {
            Some(binding) => match self.index_buffer(binding) {
                Some(index) => Some(index),
                None => {
                    log::warn!("draw with unknown index buffer {:?}", binding.buffer);
                    return;
                }
            },
            None => None,
        };
        let textures = self.texture_bind_group(call.program, call.textures);

        self.ops.push(Op::Draw(PendingDraw {
            target: call.target,
            pipeline,
            vertex_buffers,
            index,
            first: call.first,
            count: call.count,
            instances: call.instances,
            uniforms: call.uniforms.to_vec(),
            textures,
            stencil_reference,
        }));
    }

    fn present(&mut self) -> Result<(), DeviceError> {
        if self.is_lost() {
            self.ops.clear();
            return Err(DeviceError::ContextLost);
        }
        match &self.ctx.presentation {
            Presentation::Window {
                surface, config, ..
            } => {
                let frame = match surface.get_current_texture() {
                    Ok(frame) => frame,
                    Err(wgpu::SurfaceError::OutOfMemory) => {
                        self.ctx.lost.store(true, Ordering::SeqCst);
                        self.ops.clear();
                        return Err(DeviceError::ContextLost);
                    }
                    Err(error @ (wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated)) => {
                        surface.configure(&self.ctx.device, config);
                        self.ops.clear();
                        return Err(DeviceError::Surface(error.to_string()));
                    }
                    Err(error) => {
                        self.ops.clear();
                        return Err(DeviceError::Surface(error.to_string()));
                    }
                };
                let view = frame
                    .texture
                    .create_view(&wgpu::TextureViewDescriptor::default());
                self.flush(Some(view));
                frame.present();
            }
            Presentation::Headless { texture, .. } => {
                let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
                self.flush(Some(view));
            }
        }
        Ok(())
    }

    fn read_pixels(&mut self, target: Option<FramebufferId>) -> Result<Vec<u8>, DeviceError> {
        if self.is_lost() {
            return Err(DeviceError::ContextLost);
        }
        let surface = match &self.ctx.presentation {
            Presentation::Headless { texture, .. } => Some(texture.clone()),
            Presentation::Window { .. } => None,
        };
        if !self.ops.is_empty() {
            let view = surface
                .as_ref()
                .map(|t| t.create_view(&wgpu::TextureViewDescriptor::default()));
            self.flush(view);
        }
        let texture = match target {
            None => surface.ok_or_else(|| {
                DeviceError::Surface("a window surface cannot be read back".to_string())
            })?,
            Some(id) => self
                .targets
                .get(&id)
                .map(|t| t.texture.clone())
                .ok_or(DeviceError::UnknownHandle {
                    kind: "framebuffer",
                    id: id.0,
                })?,
        };
        self.read_texture(&texture)
    }

    fn is_lost(&self) -> bool {
        self.ctx.lost.load(Ordering::SeqCst)
    }
}

fn merge_clear(into: &mut ClearOps, ops: &ClearOps) {
    if ops.color.is_some() {
        into.color = ops.color;
    }
    if ops.depth.is_some() {
        into.depth = ops.depth;
    }
    if ops.stencil.is_some() {
        into.stencil = ops.stencil;
    }
}

fn vertex_attributes(attribute: Attribute) -> Vec<wgpu::VertexAttribute> {
    let format = match attribute.size() {
        2 => wgpu::VertexFormat::Float32x2,
        3 => wgpu::VertexFormat::Float32x3,
        _ => wgpu::VertexFormat::Float32x4,
    };
    match attribute {
        // A mat4 takes four vec4 slots.
        Attribute::InstanceOffset => (0..4)
            .map(|column| wgpu::VertexAttribute {
                offset: (column * 16) as wgpu::BufferAddress,
                shader_location: attribute.slot() + column,
                format: wgpu::VertexFormat::Float32x4,
            })
            .collect(),
        _ => vec![wgpu::VertexAttribute {
            offset: 0,
            shader_location: attribute.slot(),
            format,
        }],
    }
}

fn texture_layout_entries(slot: TextureSlot) -> [wgpu::BindGroupLayoutEntry; 2] {
    [
        wgpu::BindGroupLayoutEntry {
            binding: slot.slot * 2,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                multisampled: false,
                view_dimension: match slot.kind {
                    TextureKind::D2 => wgpu::TextureViewDimension::D2,
                    TextureKind::Cube => wgpu::TextureViewDimension::Cube,
                },
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
            },
            count: None,
        },
        wgpu::BindGroupLayoutEntry {
            binding: slot.slot * 2 + 1,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
            count: None,
        },
    ]
}

// Float32 targets are not blendable, so Replace disables blending.
fn blend_state(blend: BlendMode) -> Option<wgpu::BlendState> {
    match blend {
        BlendMode::Replace => None,
        BlendMode::Alpha => Some(wgpu::BlendState::ALPHA_BLENDING),
        BlendMode::Additive => Some(wgpu::BlendState {
            color: wgpu::BlendComponent {
                src_factor: wgpu::BlendFactor::One,
                dst_factor: wgpu::BlendFactor::One,
                operation: wgpu::BlendOperation::Add,
            },
            alpha: wgpu::BlendComponent::OVER,
        }),
    }
}

fn compare_function(compare: CompareFunction) -> wgpu::CompareFunction {
    match compare {
        CompareFunction::Always => wgpu::CompareFunction::Always,
        CompareFunction::Never => wgpu::CompareFunction::Never,
        CompareFunction::Equal => wgpu::CompareFunction::Equal,
        CompareFunction::NotEqual => wgpu::CompareFunction::NotEqual,
        CompareFunction::Less => wgpu::CompareFunction::Less,
        CompareFunction::LessEqual => wgpu::CompareFunction::LessEqual,
        CompareFunction::Greater => wgpu::CompareFunction::Greater,
    }
}

fn stencil_operation(op: StencilOp) -> wgpu::StencilOperation {
    match op {
        StencilOp::Keep => wgpu::StencilOperation::Keep,
        StencilOp::Zero => wgpu::StencilOperation::Zero,
        StencilOp::Replace => wgpu::StencilOperation::Replace,
        StencilOp::IncrementClamp => wgpu::StencilOperation::IncrementClamp,
    }
}
