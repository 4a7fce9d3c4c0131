//! GPU capability interface.
//!
//! The renderer never talks to a graphics API directly. Everything it needs
//! (buffers, textures, framebuffers, programs, clears and draws) goes through
//! [`GraphicsDevice`]. Draw calls carry their complete fixed-function state so
//! an implementation can map them onto immutable pipeline objects.
//!
//! - [`wgpu_device::WgpuDevice`] renders through `wgpu` into a window surface or an
//!   offscreen surface texture.
//! - [`recording::RecordingDevice`] records every call and is used by tests and
//!   tooling that need to inspect what a frame would submit.

pub mod recording;
pub mod wgpu_device;

use crate::{
    data_structures::geometry::Attribute,
    error::{CompileError, DeviceError},
};

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);
    };
}

handle!(
    /// A vertex or index buffer owned by the device.
    BufferId
);
handle!(
    /// A 2D or cube texture owned by the device.
    TextureId
);
handle!(
    /// A render target: colour texture plus optional depth/stencil.
    FramebufferId
);
handle!(
    /// A linked shader program.
    ProgramId
);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Vertex,
    Index,
}

/// Element width of an index stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    U8,
    U16,
    U32,
}

impl IndexFormat {
    /// Width chosen by the number of indices in the stream.
    pub fn for_count(count: usize) -> Self {
        if count <= 256 {
            IndexFormat::U8
        } else if count <= 65536 {
            IndexFormat::U16
        } else {
            IndexFormat::U32
        }
    }

    /// Largest index value representable in this width.
    pub fn max_value(self) -> u32 {
        match self {
            IndexFormat::U8 => u8::MAX as u32,
            IndexFormat::U16 => u16::MAX as u32,
            IndexFormat::U32 => u32::MAX,
        }
    }

    pub fn byte_size(self) -> usize {
        match self {
            IndexFormat::U8 => 1,
            IndexFormat::U16 => 2,
            IndexFormat::U32 => 4,
        }
    }

    /// Packs indices into little-endian bytes of this width.
    pub fn encode(self, indices: &[u32]) -> Vec<u8> {
        match self {
            IndexFormat::U8 => indices.iter().map(|&i| i as u8).collect(),
            IndexFormat::U16 => indices
                .iter()
                .flat_map(|&i| (i as u16).to_le_bytes())
                .collect(),
            IndexFormat::U32 => bytemuck::cast_slice(indices).to_vec(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ColorFormat {
    Rgba8,
    Rgba16Float,
    Rgba32Float,
}

impl ColorFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            ColorFormat::Rgba8 => 4,
            ColorFormat::Rgba16Float => 8,
            ColorFormat::Rgba32Float => 16,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureKind {
    D2,
    /// Six layers in +X, -X, +Y, -Y, +Z, -Z order.
    Cube,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Filter {
    Linear,
    Nearest,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Wrap {
    Repeat,
    Clamp,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub kind: TextureKind,
    pub format: ColorFormat,
    pub filter: Filter,
    pub wrap: Wrap,
    /// Linear (non-sRGB) sampling, used for normal maps and data textures.
    pub linear: bool,
    /// Whether the texture can be rendered into.
    pub render_target: bool,
}

impl TextureDesc {
    pub fn color(label: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            label: label.into(),
            width,
            height,
            kind: TextureKind::D2,
            format: ColorFormat::Rgba8,
            filter: Filter::Linear,
            wrap: Wrap::Repeat,
            linear: false,
            render_target: false,
        }
    }

    /// Expected length of the initial pixel upload.
    pub fn byte_len(&self) -> usize {
        let layers = match self.kind {
            TextureKind::D2 => 1,
            TextureKind::Cube => 6,
        };
        self.width as usize * self.height as usize * self.format.bytes_per_pixel() * layers
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FramebufferDesc {
    pub color: TextureId,
    pub depth: bool,
    pub stencil: bool,
}

/// A texture unit declared by a program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureSlot {
    pub slot: u32,
    pub kind: TextureKind,
}

impl TextureSlot {
    pub fn d2(slot: u32) -> Self {
        Self {
            slot,
            kind: TextureKind::D2,
        }
    }

    pub fn cube(slot: u32) -> Self {
        Self {
            slot,
            kind: TextureKind::Cube,
        }
    }
}

/// Generated shader source handed to the device.
///
/// `source` is WGSL with `vs_main`/`fs_main` entry points, uniforms in
/// `@group(0) @binding(0)` and texture slot `n` at `@group(1)` bindings
/// `2n` (texture) and `2n + 1` (sampler). `attributes` lists the vertex
/// inputs the vertex stage reads so missing streams can be defaulted,
/// `textures` the slots the fragment stage samples.
#[derive(Clone, Debug, PartialEq)]
pub struct ProgramSource {
    pub label: String,
    pub source: String,
    pub attributes: Vec<Attribute>,
    pub textures: Vec<TextureSlot>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum BlendMode {
    #[default]
    Replace,
    /// `SRC_ALPHA, ONE_MINUS_SRC_ALPHA`
    Alpha,
    Additive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    None,
    #[default]
    Back,
    Front,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Topology {
    #[default]
    Triangles,
    Lines,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompareFunction {
    Always,
    Never,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
}

impl CompareFunction {
    pub fn passes(self, reference: u32, stored: u32) -> bool {
        match self {
            CompareFunction::Always => true,
            CompareFunction::Never => false,
            CompareFunction::Equal => reference == stored,
            CompareFunction::NotEqual => reference != stored,
            CompareFunction::Less => reference < stored,
            CompareFunction::LessEqual => reference <= stored,
            CompareFunction::Greater => reference > stored,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StencilOp {
    Keep,
    Zero,
    Replace,
    IncrementClamp,
}

impl StencilOp {
    pub fn apply(self, reference: u32, stored: u32) -> u32 {
        match self {
            StencilOp::Keep => stored,
            StencilOp::Zero => 0,
            StencilOp::Replace => reference,
            StencilOp::IncrementClamp => stored.saturating_add(1).min(u8::MAX as u32),
        }
    }
}

/// Stencil test applied to both faces. `pass` runs when the stencil and depth
/// tests pass; failing fragments keep the stored value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StencilState {
    pub compare: CompareFunction,
    pub reference: u32,
    pub pass: StencilOp,
}

impl StencilState {
    /// Marks every covered pixel with `reference`.
    pub fn mark(reference: u32) -> Self {
        Self {
            compare: CompareFunction::Always,
            reference,
            pass: StencilOp::Replace,
        }
    }

    /// Draws only where the stored value equals `reference`.
    pub fn only_where(reference: u32) -> Self {
        Self {
            compare: CompareFunction::Equal,
            reference,
            pass: StencilOp::Keep,
        }
    }
}

/// Fixed-function state of one draw.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RenderState {
    pub blend: BlendMode,
    pub color_write: bool,
    pub depth_test: bool,
    pub depth_write: bool,
    pub stencil: Option<StencilState>,
    pub cull: CullMode,
    pub topology: Topology,
}

impl RenderState {
    /// Depth-tested, depth-writing, back-face culled geometry.
    pub fn opaque() -> Self {
        Self {
            blend: BlendMode::Replace,
            color_write: true,
            depth_test: true,
            depth_write: true,
            stencil: None,
            cull: CullMode::Back,
            topology: Topology::Triangles,
        }
    }

    pub fn transparent() -> Self {
        Self {
            blend: BlendMode::Alpha,
            depth_write: false,
            ..Self::opaque()
        }
    }

    /// Full-screen quad: no depth, no culling.
    pub fn fullscreen() -> Self {
        Self {
            blend: BlendMode::Replace,
            color_write: true,
            depth_test: false,
            depth_write: false,
            stencil: None,
            cull: CullMode::None,
            topology: Topology::Triangles,
        }
    }

    pub fn with_blend(mut self, blend: BlendMode) -> Self {
        self.blend = blend;
        self
    }

    pub fn with_stencil(mut self, stencil: StencilState) -> Self {
        self.stencil = Some(stencil);
        self
    }

    pub fn with_cull(mut self, cull: CullMode) -> Self {
        self.cull = cull;
        self
    }

    pub fn without_color(mut self) -> Self {
        self.color_write = false;
        self
    }

    pub fn without_depth(mut self) -> Self {
        self.depth_test = false;
        self.depth_write = false;
        self
    }
}

impl Default for RenderState {
    fn default() -> Self {
        Self::opaque()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct ClearOps {
    pub color: Option<[f32; 4]>,
    pub depth: Option<f32>,
    pub stencil: Option<u32>,
}

impl ClearOps {
    pub fn all(color: [f32; 4]) -> Self {
        Self {
            color: Some(color),
            depth: Some(1.0),
            stencil: Some(0),
        }
    }

    pub fn depth_stencil() -> Self {
        Self {
            color: None,
            depth: Some(1.0),
            stencil: Some(0),
        }
    }
}

/// One bound vertex stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexStream {
    pub attribute: Attribute,
    pub buffer: BufferId,
    /// Advances once per instance instead of once per vertex.
    pub per_instance: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IndexBinding {
    pub buffer: BufferId,
    pub format: IndexFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureBinding {
    pub slot: u32,
    pub texture: TextureId,
}

/// A complete draw. `target == None` renders to the visible surface.
#[derive(Clone, Copy, Debug)]
pub struct DrawCall<'a> {
    pub target: Option<FramebufferId>,
    pub program: ProgramId,
    pub streams: &'a [VertexStream],
    pub index: Option<IndexBinding>,
    /// First index (indexed) or first vertex (non-indexed).
    pub first: u32,
    pub count: u32,
    pub instances: u32,
    pub uniforms: &'a [u8],
    pub textures: &'a [TextureBinding],
    pub state: RenderState,
}

/// Everything the renderer needs from a GPU.
///
/// Calls made while the context is lost must not panic: creation fails with
/// [`DeviceError::ContextLost`] and draws are dropped.
pub trait GraphicsDevice {
    fn create_buffer(&mut self, kind: BufferKind, data: &[u8]) -> Result<BufferId, DeviceError>;

    fn update_buffer(&mut self, id: BufferId, data: &[u8]) -> Result<(), DeviceError>;

    fn destroy_buffer(&mut self, id: BufferId);

    fn create_texture(
        &mut self,
        desc: &TextureDesc,
        pixels: Option<&[u8]>,
    ) -> Result<TextureId, DeviceError>;

    fn destroy_texture(&mut self, id: TextureId);

    fn create_framebuffer(&mut self, desc: &FramebufferDesc) -> Result<FramebufferId, DeviceError>;

    fn destroy_framebuffer(&mut self, id: FramebufferId);

    fn create_program(&mut self, source: &ProgramSource) -> Result<ProgramId, CompileError>;

    fn destroy_program(&mut self, id: ProgramId);

    /// Size of the visible surface in pixels.
    fn surface_size(&self) -> (u32, u32);

    /// Reconfigures the visible surface.
    fn resize_surface(&mut self, width: u32, height: u32);

    fn clear(&mut self, target: Option<FramebufferId>, ops: &ClearOps);

    fn draw(&mut self, call: &DrawCall<'_>);

    /// Submits everything recorded since the last present and shows the surface.
    fn present(&mut self) -> Result<(), DeviceError>;

    /// Reads back RGBA8 pixels, row-major, top row first.
    fn read_pixels(&mut self, target: Option<FramebufferId>) -> Result<Vec<u8>, DeviceError>;

    fn is_lost(&self) -> bool;
}
