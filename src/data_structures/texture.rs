//! wgpu textures backing device texture handles.
//!
//! This module provides [`Texture`], a wrapper around a wgpu texture with its
//! view and sampler, and helpers to create colour textures from a
//! [`TextureDesc`] and depth/stencil attachments for render targets.

use crate::device::{ColorFormat, Filter, TextureDesc, TextureKind, Wrap};

/// A GPU texture with a view and optional sampler.
///
/// Colour textures carry a sampler built from their [`TextureDesc`]; depth
/// attachments have none since they are never sampled.
#[derive(Clone, Debug)]
pub struct Texture {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub sampler: Option<wgpu::Sampler>,
    pub format: wgpu::TextureFormat,
    pub size: (u32, u32),
}

impl Texture {
    /// Combined depth and stencil format used by every render target.
    pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth24PlusStencil8;

    /// Create a depth/stencil attachment for a render target.
    ///
    /// # Arguments
    ///
    /// * `size` is [width, height] of the texture in pixels
    /// * `label` is used as a debug label for the GPU resource
    pub fn create_depth_texture(device: &wgpu::Device, size: [u32; 2], label: &str) -> Self {
        let extent = wgpu::Extent3d {
            width: size[0].max(1),
            height: size[1].max(1),
            depth_or_array_layers: 1,
        };
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: extent,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: Self::DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        Self {
            texture,
            view,
            sampler: None,
            format: Self::DEPTH_FORMAT,
            size: (extent.width, extent.height),
        }
    }

    /// Create a colour texture and upload `pixels` when given.
    ///
    /// Cube textures take their six faces back to back in `pixels`.
    /// `float32_filterable` tells whether the adapter can filter 32-bit float
    /// textures; without it `Rgba32Float` is stored at half precision.
    pub fn from_desc(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        desc: &TextureDesc,
        pixels: Option<&[u8]>,
        float32_filterable: bool,
    ) -> Self {
        let layers = match desc.kind {
            TextureKind::D2 => 1,
            TextureKind::Cube => 6,
        };
        let size = wgpu::Extent3d {
            width: desc.width.max(1),
            height: desc.height.max(1),
            depth_or_array_layers: layers,
        };
        let format = Self::color_format(desc, float32_filterable);
        let mut usage = wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST;
        if desc.render_target {
            usage |= wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC;
        }
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&desc.label),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        });

        if let Some(pixels) = pixels {
            let pixels = if format == wgpu::TextureFormat::Rgba16Float
                && desc.format == ColorFormat::Rgba32Float
            {
                narrow_to_half(pixels)
            } else {
                pixels.to_vec()
            };
            let bytes_per_pixel = format.block_copy_size(None).unwrap_or(4);
            queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    aspect: wgpu::TextureAspect::All,
                    texture: &texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                },
                &pixels,
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(bytes_per_pixel * size.width),
                    rows_per_image: Some(size.height),
                },
                size,
            );
        }

        let view = texture.create_view(&wgpu::TextureViewDescriptor {
            dimension: Some(match desc.kind {
                TextureKind::D2 => wgpu::TextureViewDimension::D2,
                TextureKind::Cube => wgpu::TextureViewDimension::Cube,
            }),
            ..Default::default()
        });
        let sampler = Some(create_sampler(device, desc.filter, desc.wrap));

        Self {
            texture,
            view,
            sampler,
            format,
            size: (size.width, size.height),
        }
    }

    fn color_format(desc: &TextureDesc, float32_filterable: bool) -> wgpu::TextureFormat {
        match desc.format {
            ColorFormat::Rgba8 if desc.linear || desc.render_target => {
                wgpu::TextureFormat::Rgba8Unorm
            }
            ColorFormat::Rgba8 => wgpu::TextureFormat::Rgba8UnormSrgb,
            ColorFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
            ColorFormat::Rgba32Float if float32_filterable => wgpu::TextureFormat::Rgba32Float,
            ColorFormat::Rgba32Float => {
                log::debug!(
                    "{}: 32-bit float filtering unavailable, storing as 16-bit",
                    desc.label
                );
                wgpu::TextureFormat::Rgba16Float
            }
        }
    }
}

pub fn create_sampler(device: &wgpu::Device, filter: Filter, wrap: Wrap) -> wgpu::Sampler {
    let address_mode = match wrap {
        Wrap::Repeat => wgpu::AddressMode::Repeat,
        Wrap::Clamp => wgpu::AddressMode::ClampToEdge,
    };
    let filter = match filter {
        Filter::Linear => wgpu::FilterMode::Linear,
        Filter::Nearest => wgpu::FilterMode::Nearest,
    };
    device.create_sampler(&wgpu::SamplerDescriptor {
        address_mode_u: address_mode,
        address_mode_v: address_mode,
        address_mode_w: address_mode,
        mag_filter: filter,
        min_filter: filter,
        mipmap_filter: wgpu::FilterMode::Nearest,
        ..Default::default()
    })
}

// f32 -> f16 bit pattern, flushing subnormals to zero.
fn narrow_to_half(pixels: &[u8]) -> Vec<u8> {
    pixels
        .chunks_exact(4)
        .flat_map(|chunk| {
            let bits = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            let sign = ((bits >> 16) & 0x8000) as u16;
            let exponent = ((bits >> 23) & 0xff) as i32 - 127 + 15;
            let mantissa = ((bits >> 13) & 0x3ff) as u16;
            let half = if exponent <= 0 {
                sign
            } else if exponent >= 0x1f {
                sign | 0x7c00
            } else {
                sign | ((exponent as u16) << 10) | mantissa
            };
            half.to_le_bytes()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::narrow_to_half;

    #[test]
    fn narrows_common_values() {
        let input: Vec<u8> = [1.0f32, -2.0, 0.0, 0.5]
            .iter()
            .flat_map(|f| f.to_le_bytes())
            .collect();
        let halves: Vec<u16> = narrow_to_half(&input)
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(halves, vec![0x3c00, 0xc000, 0x0000, 0x3800]);
    }
}
