//! wgpu instance, device and presentation target.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use anyhow::{Context as _, anyhow};
use winit::window::Window;

/// Where presented frames end up.
#[derive(Debug)]
pub enum Presentation {
    Window {
        window: Arc<Window>,
        surface: wgpu::Surface<'static>,
        config: wgpu::SurfaceConfiguration,
    },
    /// An offscreen texture standing in for the surface, used by golden tests
    /// and tooling without a display.
    Headless {
        texture: wgpu::Texture,
        format: wgpu::TextureFormat,
        size: (u32, u32),
    },
}

#[derive(Debug)]
pub struct Context {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub presentation: Presentation,
    /// Set from the device-lost callback.
    pub lost: Arc<AtomicBool>,
    pub float32_filterable: bool,
}

impl Context {
    pub async fn new(window: Arc<Window>) -> anyhow::Result<Self> {
        let size = window.inner_size();

        log::info!("wgpu setup");
        let instance = Self::instance();
        let surface = instance
            .create_surface(window.clone())
            .context("creating the window surface")?;
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::default(),
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .context("no compatible graphics adapter")?;
        let (device, queue, float32_filterable) = Self::request_device(&adapter).await?;

        let surface_caps = surface.get_capabilities(&adapter);
        // Colour math in the shaders assumes an sRGB surface.
        let surface_format = surface_caps
            .formats
            .iter()
            .copied()
            .find(|f| f.is_srgb())
            .or_else(|| surface_caps.formats.first().copied())
            .ok_or_else(|| anyhow!("surface reports no formats"))?;
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: surface_caps
                .present_modes
                .first()
                .copied()
                .unwrap_or(wgpu::PresentMode::Fifo),
            alpha_mode: surface_caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &config);

        Ok(Self::assemble(
            device,
            queue,
            Presentation::Window {
                window,
                surface,
                config,
            },
            float32_filterable,
        ))
    }

    /// A context rendering into an offscreen RGBA8 sRGB texture.
    pub async fn headless(width: u32, height: u32) -> anyhow::Result<Self> {
        log::info!("wgpu headless setup ({}x{})", width, height);
        let instance = Self::instance();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::default(),
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .context("no graphics adapter")?;
        let (device, queue, float32_filterable) = Self::request_device(&adapter).await?;
        let format = wgpu::TextureFormat::Rgba8UnormSrgb;
        let texture = Self::offscreen_texture(&device, format, width, height);
        Ok(Self::assemble(
            device,
            queue,
            Presentation::Headless {
                texture,
                format,
                size: (width.max(1), height.max(1)),
            },
            float32_filterable,
        ))
    }

    fn instance() -> wgpu::Instance {
        wgpu::Instance::new(&wgpu::InstanceDescriptor {
            #[cfg(not(target_arch = "wasm32"))]
            backends: wgpu::Backends::PRIMARY,
            #[cfg(target_arch = "wasm32")]
            backends: wgpu::Backends::GL,
            ..Default::default()
        })
    }

    async fn request_device(
        adapter: &wgpu::Adapter,
    ) -> anyhow::Result<(wgpu::Device, wgpu::Queue, bool)> {
        let float32_filterable = adapter
            .features()
            .contains(wgpu::Features::FLOAT32_FILTERABLE);
        let required_features = if float32_filterable {
            wgpu::Features::FLOAT32_FILTERABLE
        } else {
            wgpu::Features::empty()
        };
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("flow-vfx device"),
                required_features,
                // WebGL doesn't support all of wgpu's features.
                required_limits: if cfg!(target_arch = "wasm32") {
                    wgpu::Limits::downlevel_webgl2_defaults()
                } else {
                    wgpu::Limits::default()
                },
                memory_hints: Default::default(),
                trace: wgpu::Trace::Off,
                ..Default::default()
            })
            .await
            .context("requesting the device")?;
        Ok((device, queue, float32_filterable))
    }

    fn assemble(
        device: wgpu::Device,
        queue: wgpu::Queue,
        presentation: Presentation,
        float32_filterable: bool,
    ) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let flag = lost.clone();
        device.set_device_lost_callback(move |reason, message| {
            log::error!("device lost ({:?}): {}", reason, message);
            flag.store(true, Ordering::SeqCst);
        });
        Self {
            device,
            queue,
            presentation,
            lost,
            float32_filterable,
        }
    }

    pub(crate) fn offscreen_texture(
        device: &wgpu::Device,
        format: wgpu::TextureFormat,
        width: u32,
        height: u32,
    ) -> wgpu::Texture {
        device.create_texture(&wgpu::TextureDescriptor {
            label: Some("offscreen surface"),
            size: wgpu::Extent3d {
                width: width.max(1),
                height: height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        })
    }

    pub fn surface_format(&self) -> wgpu::TextureFormat {
        match &self.presentation {
            Presentation::Window { config, .. } => config.format,
            Presentation::Headless { format, .. } => *format,
        }
    }

    pub fn surface_size(&self) -> (u32, u32) {
        match &self.presentation {
            Presentation::Window { config, .. } => (config.width, config.height),
            Presentation::Headless { size, .. } => *size,
        }
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        let (width, height) = (width.max(1), height.max(1));
        match &mut self.presentation {
            Presentation::Window {
                surface, config, ..
            } => {
                config.width = width;
                config.height = height;
                surface.configure(&self.device, config);
            }
            Presentation::Headless {
                texture,
                format,
                size,
            } => {
                *texture = Self::offscreen_texture(&self.device, *format, width, height);
                *size = (width, height);
            }
        }
    }

    pub fn window(&self) -> Option<&Arc<Window>> {
        match &self.presentation {
            Presentation::Window { window, .. } => Some(window),
            Presentation::Headless { .. } => None,
        }
    }
}
