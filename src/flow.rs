//! Application host and event loop.
//!
//! [`run`] opens a window, builds a [`WgpuDevice`] for it and drives a
//! [`SceneFlow`] with winit events. Frames are event-driven: a redraw is
//! requested only when the scene, the pipeline options or a texture changed.
//!
//! # User-facing types
//!
//! - [`SceneFlow`] is the trait for applications that build and animate a scene
//! - [`FlowContext`] is what every hook gets to work with
//! - [`FlowConfig`] holds the initial camera and pipeline options
//!
//! # Lifecycle
//!
//! 1. `resumed` creates the window and, asynchronously on the web, the device
//! 2. `on_init` is called once to fill the scene
//! 3. window and device events go to `on_window_events` / `on_device_events`
//! 4. each redraw calls `on_update` and renders if something is dirty
//! 5. a lost context pauses rendering; a fresh device is built for the same
//!    window and every GPU object is restored on it

use std::{fmt::Debug, sync::Arc};

use cgmath::{Deg, Rad};
use instant::{Duration, Instant};
use winit::{
    application::ApplicationHandler,
    event::{DeviceEvent, DeviceId, WindowEvent},
    event_loop::{ActiveEventLoop, EventLoop, EventLoopProxy},
    window::{Window, WindowId},
};

use crate::{
    camera::{Camera, Projection},
    context::Context,
    device::{GraphicsDevice, wgpu_device::WgpuDevice},
    render::{FrameOutcome, PipelineOptions, RenderPipeline, Scene},
    resources::texture::TextureCache,
};

#[cfg(target_arch = "wasm32")]
use wasm_bindgen::prelude::*;

/// Mutable access to everything a flow may change.
pub struct FlowContext<'a> {
    pub device: &'a mut dyn GraphicsDevice,
    pub scene: &'a mut Scene,
    pub pipeline: &'a mut RenderPipeline,
    pub textures: &'a mut TextureCache,
}

/// An application rendered by the host.
///
/// Changing the scene through its `&mut` accessors or the pipeline options
/// through [`RenderPipeline::options_mut`] schedules the next frame.
pub trait SceneFlow {
    /// Builds geometry, objects and materials. An error ends the app.
    fn on_init(&mut self, ctx: &mut FlowContext<'_>) -> anyhow::Result<()>;

    /// Called before every frame with the time since the previous one.
    fn on_update(&mut self, _ctx: &mut FlowContext<'_>, _dt: Duration) {}

    fn on_window_events(&mut self, _ctx: &mut FlowContext<'_>, _event: &WindowEvent) {}

    fn on_device_events(&mut self, _ctx: &mut FlowContext<'_>, _event: &DeviceEvent) {}
}

#[derive(Clone, Debug)]
pub struct FlowConfig {
    pub title: String,
    pub options: PipelineOptions,
    pub camera: Camera,
    pub fovy: Rad<f32>,
    pub znear: f32,
    pub zfar: f32,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            title: "flow-vfx".to_string(),
            options: PipelineOptions::default(),
            camera: Camera::new((0.0, 2.0, 6.0), Deg(-90.0), Deg(-15.0)),
            fovy: Deg(45.0).into(),
            znear: 0.1,
            zfar: 100.0,
        }
    }
}

struct Host {
    device: WgpuDevice,
    scene: Scene,
    pipeline: RenderPipeline,
    textures: TextureCache,
}

impl Host {
    fn new(
        mut device: WgpuDevice,
        config: &FlowConfig,
        textures: TextureCache,
    ) -> anyhow::Result<Self> {
        let (width, height) = device.surface_size();
        let projection = Projection::new(width, height, config.fovy, config.znear, config.zfar);
        let scene = Scene::new(config.camera, projection);
        let pipeline = RenderPipeline::new(&mut device, config.options.clone())?;
        Ok(Self {
            device,
            scene,
            pipeline,
            textures,
        })
    }

    fn ctx(&mut self) -> FlowContext<'_> {
        FlowContext {
            device: &mut self.device,
            scene: &mut self.scene,
            pipeline: &mut self.pipeline,
            textures: &mut self.textures,
        }
    }
}

pub(crate) enum FlowEvent {
    /// A device for the window is ready, first or after a context loss.
    #[cfg_attr(not(target_arch = "wasm32"), allow(dead_code))]
    DeviceReady(Box<WgpuDevice>),
}

impl Debug for FlowEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeviceReady(_) => f.write_str("DeviceReady(WgpuDevice)"),
        }
    }
}

struct App {
    #[cfg(not(target_arch = "wasm32"))]
    async_runtime: tokio::runtime::Runtime,
    #[cfg_attr(not(target_arch = "wasm32"), allow(dead_code))]
    proxy: EventLoopProxy<FlowEvent>,
    config: FlowConfig,
    flow: Box<dyn SceneFlow>,
    window: Option<Arc<Window>>,
    host: Option<Host>,
    rebuilding: bool,
    last_time: Instant,
}

impl App {
    fn new(
        event_loop: &EventLoop<FlowEvent>,
        config: FlowConfig,
        flow: Box<dyn SceneFlow>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            #[cfg(not(target_arch = "wasm32"))]
            async_runtime: tokio::runtime::Runtime::new()?,
            proxy: event_loop.create_proxy(),
            config,
            flow,
            window: None,
            host: None,
            rebuilding: false,
            last_time: Instant::now(),
        })
    }

    /// Builds a device for `window`, blocking natively and through the event
    /// loop on the web.
    fn request_device(&mut self, event_loop: &ActiveEventLoop, window: Arc<Window>) {
        #[cfg(not(target_arch = "wasm32"))]
        {
            match self.async_runtime.block_on(Context::new(window)) {
                Ok(ctx) => self.device_ready(event_loop, WgpuDevice::new(ctx)),
                Err(error) => {
                    log::error!("cannot create graphics device: {:#}", error);
                    event_loop.exit();
                }
            }
        }

        #[cfg(target_arch = "wasm32")]
        {
            let _ = event_loop;
            let proxy = self.proxy.clone();
            wasm_bindgen_futures::spawn_local(async move {
                match Context::new(window).await {
                    Ok(ctx) => {
                        let device = Box::new(WgpuDevice::new(ctx));
                        if proxy.send_event(FlowEvent::DeviceReady(device)).is_err() {
                            log::error!("event loop closed before the device was ready");
                        }
                    }
                    Err(error) => log::error!("cannot create graphics device: {:#}", error),
                }
            });
        }
    }

    fn texture_cache(&self, window: Arc<Window>) -> anyhow::Result<TextureCache> {
        #[cfg(not(target_arch = "wasm32"))]
        let loader = crate::resources::FileLoader::new(
            std::path::Path::new("./").join("assets"),
            self.async_runtime.handle().clone(),
        );
        #[cfg(target_arch = "wasm32")]
        let loader = crate::resources::HttpLoader::assets()?;
        Ok(TextureCache::new(loader).with_notify(move || window.request_redraw()))
    }

    fn device_ready(&mut self, event_loop: &ActiveEventLoop, device: WgpuDevice) {
        let Some(window) = self.window.clone() else {
            return;
        };
        self.rebuilding = false;
        match self.host.as_mut() {
            Some(host) => {
                host.device = device;
                if let Err(error) =
                    host.pipeline
                        .restore(&mut host.device, &mut host.scene, &mut host.textures)
                {
                    log::error!("cannot restore the renderer: {}", error);
                    return;
                }
                let size = window.inner_size();
                if let Err(error) = host.pipeline.resize(
                    &mut host.device,
                    &mut host.scene,
                    size.width,
                    size.height,
                ) {
                    log::error!("cannot resize after restore: {}", error);
                }
            }
            None => {
                let host = self
                    .texture_cache(window.clone())
                    .and_then(|textures| Host::new(device, &self.config, textures));
                let mut host = match host {
                    Ok(host) => host,
                    Err(error) => {
                        log::error!("cannot set up the renderer: {:#}", error);
                        event_loop.exit();
                        return;
                    }
                };
                if let Err(error) = self.flow.on_init(&mut host.ctx()) {
                    log::error!("flow initialisation failed: {:#}", error);
                    event_loop.exit();
                    return;
                }
                self.host = Some(host);
            }
        }
        self.last_time = Instant::now();
        window.request_redraw();
    }

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        let (Some(host), Some(window)) = (self.host.as_mut(), self.window.clone()) else {
            return;
        };
        let now = Instant::now();
        let dt = now - self.last_time;
        self.last_time = now;
        self.flow.on_update(&mut host.ctx(), dt);

        match host
            .pipeline
            .render_frame(&mut host.device, &mut host.scene, &mut host.textures)
        {
            FrameOutcome::Rendered | FrameOutcome::Skipped => {
                if host.pipeline.needs_redraw(&host.scene) {
                    window.request_redraw();
                }
            }
            FrameOutcome::Paused => {
                if !self.rebuilding {
                    self.rebuilding = true;
                    log::warn!("rebuilding the graphics device");
                    self.request_device(event_loop, window);
                }
            }
        }
    }
}

impl ApplicationHandler<FlowEvent> for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        #[allow(unused_mut)]
        let mut window_attributes = Window::default_attributes().with_title(&self.config.title);

        #[cfg(target_arch = "wasm32")]
        {
            use winit::platform::web::WindowAttributesExtWebSys;

            const CANVAS_ID: &str = "canvas";

            let canvas = web_sys::window()
                .and_then(|window| window.document())
                .and_then(|document| document.get_element_by_id(CANVAS_ID))
                .map(|canvas| canvas.unchecked_into());
            window_attributes = window_attributes.with_canvas(canvas);
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(window) => Arc::new(window),
            Err(error) => {
                log::error!("cannot create window: {}", error);
                event_loop.exit();
                return;
            }
        };
        self.window = Some(window.clone());
        self.request_device(event_loop, window);
    }

    fn user_event(&mut self, event_loop: &ActiveEventLoop, event: FlowEvent) {
        let FlowEvent::DeviceReady(device) = event;
        self.device_ready(event_loop, *device);
    }

    fn device_event(
        &mut self,
        _event_loop: &ActiveEventLoop,
        _device_id: DeviceId,
        event: DeviceEvent,
    ) {
        if let Some(host) = self.host.as_mut() {
            self.flow.on_device_events(&mut host.ctx(), &event);
            if host.pipeline.needs_redraw(&host.scene) {
                if let Some(window) = &self.window {
                    window.request_redraw();
                }
            }
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: WindowEvent,
    ) {
        match &event {
            WindowEvent::CloseRequested => {
                if let Some(host) = self.host.as_mut() {
                    host.pipeline.destroy(&mut host.device);
                    host.textures.destroy(&mut host.device);
                    host.scene.destroy(&mut host.device);
                }
                event_loop.exit();
                return;
            }
            WindowEvent::Resized(size) => {
                if let Some(host) = self.host.as_mut() {
                    if let Err(error) =
                        host.pipeline
                            .resize(&mut host.device, &mut host.scene, size.width, size.height)
                    {
                        log::error!("resize failed: {}", error);
                    }
                }
            }
            WindowEvent::RedrawRequested => {
                self.redraw(event_loop);
                return;
            }
            _ => {}
        }
        if let Some(host) = self.host.as_mut() {
            self.flow.on_window_events(&mut host.ctx(), &event);
            if host.pipeline.needs_redraw(&host.scene) {
                if let Some(window) = &self.window {
                    window.request_redraw();
                }
            }
        }
    }
}

/// Opens a window and runs `flow` until the window is closed.
pub fn run(config: FlowConfig, flow: Box<dyn SceneFlow>) -> anyhow::Result<()> {
    #[cfg(not(target_arch = "wasm32"))]
    {
        if let Err(e) = env_logger::try_init() {
            println!("Warning: Could not initialize logger: {}", e);
        };
    }

    #[cfg(target_arch = "wasm32")]
    {
        console_log::init_with_level(log::Level::Info).unwrap_throw();
    }

    let event_loop: EventLoop<FlowEvent> = EventLoop::with_user_event().build()?;
    let mut app = App::new(&event_loop, config, flow)?;
    event_loop.run_app(&mut app)?;
    Ok(())
}
