//! Offscreen render targets.
//!
//! A [`Framebuffer`] is a logical handle: it owns a colour texture that later
//! passes sample from and, optionally, depth and stencil. Resizing or a
//! context restore replaces the GPU objects behind it while the handle stays
//! the same.

use crate::{
    device::{
        ColorFormat, Filter, FramebufferDesc, FramebufferId, GraphicsDevice, TextureDesc,
        TextureId, TextureKind, Wrap,
    },
    error::DeviceError,
};

#[derive(Clone, Debug, PartialEq)]
pub struct FramebufferOptions {
    pub format: ColorFormat,
    pub depth: bool,
    pub stencil: bool,
    pub filter: Filter,
}

impl Default for FramebufferOptions {
    fn default() -> Self {
        Self {
            format: ColorFormat::Rgba8,
            depth: true,
            stencil: true,
            filter: Filter::Linear,
        }
    }
}

impl FramebufferOptions {
    /// Colour only, for blur and composite targets.
    pub fn color_only() -> Self {
        Self {
            depth: false,
            stencil: false,
            ..Self::default()
        }
    }

    pub fn with_format(mut self, format: ColorFormat) -> Self {
        self.format = format;
        self
    }
}

/// The GPU handles behind a [`Framebuffer`] at one point in time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderTarget {
    pub framebuffer: FramebufferId,
    pub texture: TextureId,
    pub size: (u32, u32),
}

#[derive(Debug)]
pub struct Framebuffer {
    label: String,
    width: u32,
    height: u32,
    options: FramebufferOptions,
    gpu: Option<(FramebufferId, TextureId)>,
}

impl Framebuffer {
    pub fn new(
        device: &mut dyn GraphicsDevice,
        label: &str,
        width: u32,
        height: u32,
        options: FramebufferOptions,
    ) -> Result<Self, DeviceError> {
        let mut framebuffer = Self {
            label: label.to_string(),
            width: width.max(1),
            height: height.max(1),
            options,
            gpu: None,
        };
        framebuffer.create(device)?;
        Ok(framebuffer)
    }

    fn create(&mut self, device: &mut dyn GraphicsDevice) -> Result<(), DeviceError> {
        let color = device.create_texture(
            &TextureDesc {
                label: self.label.clone(),
                width: self.width,
                height: self.height,
                kind: TextureKind::D2,
                format: self.options.format,
                filter: self.options.filter,
                wrap: Wrap::Clamp,
                linear: true,
                render_target: true,
            },
            None,
        )?;
        let id = match device.create_framebuffer(&FramebufferDesc {
            color,
            depth: self.options.depth,
            stencil: self.options.stencil,
        }) {
            Ok(id) => id,
            Err(error) => {
                device.destroy_texture(color);
                return Err(error);
            }
        };
        self.gpu = Some((id, color));
        Ok(())
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn options(&self) -> &FramebufferOptions {
        &self.options
    }

    /// Render target handle. `None` until restored after a context loss.
    pub fn id(&self) -> Option<FramebufferId> {
        self.gpu.map(|(id, _)| id)
    }

    /// Colour texture to sample in later passes.
    pub fn texture(&self) -> Option<TextureId> {
        self.gpu.map(|(_, texture)| texture)
    }

    pub fn target(&self) -> Option<RenderTarget> {
        self.gpu.map(|(framebuffer, texture)| RenderTarget {
            framebuffer,
            texture,
            size: (self.width, self.height),
        })
    }

    /// Recreates the GPU objects at a new size. Returns `false` (and touches
    /// nothing) when the size is unchanged.
    pub fn resize(
        &mut self,
        device: &mut dyn GraphicsDevice,
        width: u32,
        height: u32,
    ) -> Result<bool, DeviceError> {
        let (width, height) = (width.max(1), height.max(1));
        if (width, height) == (self.width, self.height) && self.gpu.is_some() {
            return Ok(false);
        }
        self.destroy(device);
        self.width = width;
        self.height = height;
        self.create(device)?;
        Ok(true)
    }

    /// Forgets GPU objects after a context loss without touching the device.
    pub fn invalidate(&mut self) {
        self.gpu = None;
    }

    pub fn restore(&mut self, device: &mut dyn GraphicsDevice) -> Result<(), DeviceError> {
        if self.gpu.is_none() {
            self.create(device)?;
        }
        Ok(())
    }

    pub fn destroy(&mut self, device: &mut dyn GraphicsDevice) {
        if let Some((id, texture)) = self.gpu.take() {
            device.destroy_framebuffer(id);
            device.destroy_texture(texture);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::recording::{Command, RecordingDevice};

    #[test]
    fn same_size_resize_is_a_no_op() {
        let mut device = RecordingDevice::new(64, 64);
        let mut fb =
            Framebuffer::new(&mut device, "main", 64, 64, FramebufferOptions::default()).unwrap();
        let before = device.commands().len();
        assert!(!fb.resize(&mut device, 64, 64).unwrap());
        assert_eq!(device.commands().len(), before);
    }

    #[test]
    fn resize_keeps_options_and_replaces_objects() {
        let mut device = RecordingDevice::new(64, 64);
        let options = FramebufferOptions::color_only().with_format(ColorFormat::Rgba16Float);
        let mut fb = Framebuffer::new(&mut device, "blur", 64, 64, options).unwrap();
        let old = fb.id();
        assert!(fb.resize(&mut device, 32, 16).unwrap());
        assert_ne!(fb.id(), old);
        assert_eq!(fb.size(), (32, 16));
        let desc = device.texture_desc(fb.texture().unwrap()).unwrap();
        assert_eq!((desc.width, desc.height, desc.format), (32, 16, ColorFormat::Rgba16Float));
        assert!(device
            .commands()
            .iter()
            .any(|c| matches!(c, Command::DestroyFramebuffer(id) if Some(*id) == old)));
        assert_eq!(device.framebuffer_count(), 1);
    }
}
