//! Engine data structures: scene graph, geometry, materials and render targets.
//!
//! - `scene_graph` holds the transform hierarchy
//! - `instance` holds local transforms and the packed per-instance data
//! - `geometry` contains GPU-resident vertex and index streams
//! - `material` contains surface properties and the shader feature key
//! - `framebuffer` contains offscreen render targets
//! - `texture` contains the wgpu texture wrapper used by the GPU device

pub mod framebuffer;
pub mod geometry;
pub mod instance;
pub mod material;
pub mod scene_graph;
pub mod texture;
