//! A [`GraphicsDevice`] that records instead of rendering.
//!
//! Every call is appended to a command log. Tests use the log to check what a
//! frame submits: draw order, render state, resource lifetimes. An optional
//! rasterizer callback turns draws into covered pixels, which lets the device
//! track stencil contents and colour writes per target.

use std::collections::HashMap;

use super::{
    BufferId, BufferKind, ClearOps, DrawCall, FramebufferDesc, FramebufferId, GraphicsDevice,
    IndexBinding, ProgramId, ProgramSource, RenderState, TextureBinding, TextureDesc, TextureId,
    VertexStream,
};
use crate::error::{CompileError, DeviceError};

/// Owned copy of a [`DrawCall`].
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedDraw {
    pub target: Option<FramebufferId>,
    pub program: ProgramId,
    pub streams: Vec<VertexStream>,
    pub index: Option<IndexBinding>,
    pub first: u32,
    pub count: u32,
    pub instances: u32,
    pub uniforms: Vec<u8>,
    pub textures: Vec<TextureBinding>,
    pub state: RenderState,
}

impl RecordedDraw {
    fn from_call(call: &DrawCall<'_>) -> Self {
        Self {
            target: call.target,
            program: call.program,
            streams: call.streams.to_vec(),
            index: call.index,
            first: call.first,
            count: call.count,
            instances: call.instances,
            uniforms: call.uniforms.to_vec(),
            textures: call.textures.to_vec(),
            state: call.state,
        }
    }

    /// Decodes the uniform block as `T`, if it has exactly `T`'s size.
    pub fn uniforms_as<T: bytemuck::Pod>(&self) -> Option<T> {
        bytemuck::try_pod_read_unaligned(&self.uniforms).ok()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    CreateBuffer { id: BufferId, kind: BufferKind, len: usize },
    UpdateBuffer { id: BufferId, len: usize },
    DestroyBuffer(BufferId),
    CreateTexture { id: TextureId, desc: TextureDesc },
    DestroyTexture(TextureId),
    CreateFramebuffer { id: FramebufferId, desc: FramebufferDesc },
    DestroyFramebuffer(FramebufferId),
    CreateProgram { id: ProgramId, label: String },
    DestroyProgram(ProgramId),
    Clear { target: Option<FramebufferId>, ops: ClearOps },
    Draw(RecordedDraw),
    Present,
}

/// Maps a draw to the pixels it covers on its target.
pub type Rasterizer = Box<dyn Fn(&RecordedDraw) -> Vec<(u32, u32)>>;

#[derive(Default)]
struct TargetState {
    stencil: HashMap<(u32, u32), u32>,
    color_writes: HashMap<(u32, u32), u32>,
}

pub struct RecordingDevice {
    size: (u32, u32),
    next_id: u32,
    lost: bool,
    commands: Vec<Command>,
    buffers: HashMap<BufferId, Vec<u8>>,
    textures: HashMap<TextureId, (TextureDesc, Option<Vec<u8>>)>,
    framebuffers: HashMap<FramebufferId, FramebufferDesc>,
    programs: HashMap<ProgramId, ProgramSource>,
    failing: Vec<String>,
    rasterizer: Option<Rasterizer>,
    targets: HashMap<Option<FramebufferId>, TargetState>,
}

impl RecordingDevice {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            size: (width, height),
            next_id: 1,
            lost: false,
            commands: Vec::new(),
            buffers: HashMap::new(),
            textures: HashMap::new(),
            framebuffers: HashMap::new(),
            programs: HashMap::new(),
            failing: Vec::new(),
            rasterizer: None,
            targets: HashMap::new(),
        }
    }

    /// Programs whose source contains `needle` fail to compile.
    pub fn fail_compile_on(&mut self, needle: impl Into<String>) {
        self.failing.push(needle.into());
    }

    pub fn with_rasterizer<F>(mut self, rasterizer: F) -> Self
    where
        F: Fn(&RecordedDraw) -> Vec<(u32, u32)> + 'static,
    {
        self.rasterizer = Some(Box::new(rasterizer));
        self
    }

    /// Drops every resource, as a browser does when it reclaims a context.
    pub fn lose_context(&mut self) {
        log::warn!("recording device: context lost");
        self.lost = true;
        self.buffers.clear();
        self.textures.clear();
        self.framebuffers.clear();
        self.programs.clear();
        self.targets.clear();
    }

    pub fn restore_context(&mut self) {
        self.lost = false;
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn take_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }

    pub fn draws(&self) -> Vec<&RecordedDraw> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                Command::Draw(draw) => Some(draw),
                _ => None,
            })
            .collect()
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn program_count(&self) -> usize {
        self.programs.len()
    }

    pub fn program_source(&self, id: ProgramId) -> Option<&ProgramSource> {
        self.programs.get(&id)
    }

    pub fn texture_desc(&self, id: TextureId) -> Option<&TextureDesc> {
        self.textures.get(&id).map(|(desc, _)| desc)
    }

    pub fn texture_pixels(&self, id: TextureId) -> Option<&[u8]> {
        self.textures.get(&id).and_then(|(_, pixels)| pixels.as_deref())
    }

    pub fn framebuffer_desc(&self, id: FramebufferId) -> Option<&FramebufferDesc> {
        self.framebuffers.get(&id)
    }

    pub fn stencil_at(&self, target: Option<FramebufferId>, pixel: (u32, u32)) -> u32 {
        self.targets
            .get(&target)
            .and_then(|t| t.stencil.get(&pixel).copied())
            .unwrap_or(0)
    }

    /// How often each pixel of `target` received a colour write.
    pub fn color_writes(&self, target: Option<FramebufferId>) -> HashMap<(u32, u32), u32> {
        self.targets
            .get(&target)
            .map(|t| t.color_writes.clone())
            .unwrap_or_default()
    }

    pub fn reset_color_writes(&mut self) {
        self.targets
            .values_mut()
            .for_each(|t| t.color_writes.clear());
    }

    fn next(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn rasterize(&mut self, draw: &RecordedDraw) {
        let Some(rasterizer) = self.rasterizer.as_ref() else {
            return;
        };
        let pixels = rasterizer(draw);
        let target = self.targets.entry(draw.target).or_default();
        for pixel in pixels {
            if let Some(stencil) = draw.state.stencil {
                let stored = target.stencil.get(&pixel).copied().unwrap_or(0);
                if !stencil.compare.passes(stencil.reference, stored) {
                    continue;
                }
                target
                    .stencil
                    .insert(pixel, stencil.pass.apply(stencil.reference, stored));
            }
            if draw.state.color_write {
                *target.color_writes.entry(pixel).or_insert(0) += 1;
            }
        }
    }
}

impl GraphicsDevice for RecordingDevice {
    fn create_buffer(&mut self, kind: BufferKind, data: &[u8]) -> Result<BufferId, DeviceError> {
        if self.lost {
            return Err(DeviceError::ContextLost);
        }
        let id = BufferId(self.next());
        self.buffers.insert(id, data.to_vec());
        self.commands.push(Command::CreateBuffer {
            id,
            kind,
            len: data.len(),
        });
        Ok(id)
    }

    fn update_buffer(&mut self, id: BufferId, data: &[u8]) -> Result<(), DeviceError> {
        if self.lost {
            return Err(DeviceError::ContextLost);
        }
        let buffer = self
            .buffers
            .get_mut(&id)
            .ok_or(DeviceError::UnknownHandle { kind: "buffer", id: id.0 })?;
        *buffer = data.to_vec();
        self.commands.push(Command::UpdateBuffer { id, len: data.len() });
        Ok(())
    }

    fn destroy_buffer(&mut self, id: BufferId) {
        if self.buffers.remove(&id).is_some() {
            self.commands.push(Command::DestroyBuffer(id));
        }
    }

    fn create_texture(
        &mut self,
        desc: &TextureDesc,
        pixels: Option<&[u8]>,
    ) -> Result<TextureId, DeviceError> {
        if self.lost {
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
        let id = TextureId(self.next());
        self.textures
            .insert(id, (desc.clone(), pixels.map(|p| p.to_vec())));
        self.commands.push(Command::CreateTexture {
            id,
            desc: desc.clone(),
        });
        Ok(id)
    }

    fn destroy_texture(&mut self, id: TextureId) {
        if self.textures.remove(&id).is_some() {
            self.commands.push(Command::DestroyTexture(id));
        }
    }

    fn create_framebuffer(&mut self, desc: &FramebufferDesc) -> Result<FramebufferId, DeviceError> {
        if self.lost {
            return Err(DeviceError::ContextLost);
        }
        if !self.textures.contains_key(&desc.color) {
            return Err(DeviceError::UnknownHandle {
                kind: "texture",
                id: desc.color.0,
            });
        }
        let id = FramebufferId(self.next());
        self.framebuffers.insert(id, *desc);
        self.commands.push(Command::CreateFramebuffer { id, desc: *desc });
        Ok(id)
    }

    fn destroy_framebuffer(&mut self, id: FramebufferId) {
        if self.framebuffers.remove(&id).is_some() {
            self.targets.remove(&Some(id));
            self.commands.push(Command::DestroyFramebuffer(id));
        }
    }

    fn create_program(&mut self, source: &ProgramSource) -> Result<ProgramId, CompileError> {
        if self.lost {
            return Err(CompileError::ContextLost);
        }
        if let Some(needle) = self.failing.iter().find(|n| source.source.contains(n.as_str())) {
            return Err(CompileError::Compile {
                label: source.label.clone(),
                log: format!("error: rejected `{}`", needle),
            });
        }
        let id = ProgramId(self.next());
        self.programs.insert(id, source.clone());
        self.commands.push(Command::CreateProgram {
            id,
            label: source.label.clone(),
        });
        Ok(id)
    }

    fn destroy_program(&mut self, id: ProgramId) {
        if self.programs.remove(&id).is_some() {
            self.commands.push(Command::DestroyProgram(id));
        }
    }

    fn surface_size(&self) -> (u32, u32) {
        self.size
    }

    fn resize_surface(&mut self, width: u32, height: u32) {
        self.size = (width, height);
        self.targets.remove(&None);
    }

    fn clear(&mut self, target: Option<FramebufferId>, ops: &ClearOps) {
        if self.lost {
            return;
        }
        if let Some(stencil) = ops.stencil {
            let state = self.targets.entry(target).or_default();
            state.stencil.clear();
            if stencil != 0 {
                log::debug!("recording device: non-zero stencil clear is tracked as zero");
            }
        }
        self.commands.push(Command::Clear { target, ops: *ops });
    }

    fn draw(&mut self, call: &DrawCall<'_>) {
        if self.lost {
            return;
        }
        let draw = RecordedDraw::from_call(call);
        self.rasterize(&draw);
        self.commands.push(Command::Draw(draw));
    }

    fn present(&mut self) -> Result<(), DeviceError> {
        if self.lost {
            return Err(DeviceError::ContextLost);
        }
        self.commands.push(Command::Present);
        Ok(())
    }

    fn read_pixels(&mut self, target: Option<FramebufferId>) -> Result<Vec<u8>, DeviceError> {
        if self.lost {
            return Err(DeviceError::ContextLost);
        }
        let (width, height) = match target {
            Some(id) => {
                let desc = self
                    .framebuffers
                    .get(&id)
                    .ok_or(DeviceError::UnknownHandle { kind: "framebuffer", id: id.0 })?;
                let (tex, _) = self.textures.get(&desc.color).ok_or(DeviceError::UnknownHandle {
                    kind: "texture",
                    id: desc.color.0,
                })?;
                (tex.width, tex.height)
            }
            None => self.size,
        };
        Ok(vec![0; width as usize * height as usize * 4])
    }

    fn is_lost(&self) -> bool {
        self.lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CompareFunction, StencilOp, StencilState};

    fn draw_with(state: RenderState) -> DrawCall<'static> {
        DrawCall {
            target: None,
            program: ProgramId(0),
            streams: &[],
            index: None,
            first: 0,
            count: 3,
            instances: 1,
            uniforms: &[],
            textures: &[],
            state,
        }
    }

    #[test]
    fn lost_context_rejects_creation_and_drops_draws() {
        let mut device = RecordingDevice::new(4, 4);
        device.create_buffer(BufferKind::Vertex, &[0; 12]).unwrap();
        device.lose_context();
        assert_eq!(device.buffer_count(), 0);
        assert_eq!(
            device.create_buffer(BufferKind::Vertex, &[0; 12]),
            Err(DeviceError::ContextLost)
        );
        device.draw(&draw_with(RenderState::opaque()));
        assert!(device.draws().is_empty());
    }

    #[test]
    fn rasterizer_applies_stencil_test() {
        let mut device = RecordingDevice::new(4, 4).with_rasterizer(|_| vec![(1, 1), (2, 2)]);
        device.draw(&draw_with(
            RenderState::fullscreen().with_stencil(StencilState::mark(1)),
        ));
        assert_eq!(device.stencil_at(None, (1, 1)), 1);
        device.reset_color_writes();
        device.draw(&draw_with(RenderState::fullscreen().with_stencil(StencilState {
            compare: CompareFunction::Equal,
            reference: 0,
            pass: StencilOp::IncrementClamp,
        })));
        assert!(device.color_writes(None).is_empty());
    }
}
