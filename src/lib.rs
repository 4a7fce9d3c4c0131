//! flow-vfx
//!
//! A real-time scene-graph renderer with per-material shader variants and a
//! stencil-aware post-processing chain, running natively and on the web.
//! Everything GPU-facing goes through a small device interface so that
//! frames can be rendered with wgpu or recorded and inspected in tests.
//!
//! High-level modules
//! - `camera`: camera and perspective projection
//! - `context`: wgpu instance, device and presentation target
//! - `data_structures`: scene graph, geometry, materials and framebuffers
//! - `device`: the graphics device interface, its wgpu and recording backends
//! - `error`: error types shared by every module
//! - `flow`: winit host and scene lifecycle hooks
//! - `pipelines`: post-processing effects and their shaders
//! - `render`: scene description and frame orchestration
//! - `resources`: asset loaders and the texture cache
//! - `shaders`: shader preprocessing and the variant cache
//!

pub mod camera;
pub mod context;
pub mod data_structures;
pub mod device;
pub mod error;
pub mod flow;
pub mod pipelines;
pub mod render;
pub mod resources;
pub mod shaders;

// Re-exports commonly used types for convenience in downstream code.
pub use cgmath;
pub use winit::event::DeviceEvent;
pub use winit::event::WindowEvent;
