//! Shader program generation and caching.
//!
//! Material programs are generated from one WGSL template: each tag of a
//! [`Features`] set becomes a `#define` line in front of it and the
//! [`preprocess`] pass strips the blocks that do not apply. Effect programs
//! are fixed sources cached by name.

pub mod preprocess;

use std::collections::{HashMap, hash_map::Entry};

use crate::{
    data_structures::{geometry::Attribute, material::Features},
    device::{GraphicsDevice, ProgramId, ProgramSource, TextureSlot},
    error::CompileError,
};

pub use preprocess::preprocess;

const VARIANT_TEMPLATE: &str = include_str!("variant.wgsl");

/// Uniform block of every material variant.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct VariantUniform {
    pub model: [[f32; 4]; 4],
    pub view_proj: [[f32; 4]; 4],
    pub normal_matrix: [[f32; 4]; 4],
    pub camera_position: [f32; 4],
    pub light_position: [f32; 4],
    pub light_color: [f32; 4],
    pub ambient: [f32; 4],
    pub diffuse: [f32; 4],
    pub specular: [f32; 4],
    pub emissive: [f32; 4],
    pub wireframe_color: [f32; 4],
    pub clip_plane: [f32; 4],
    // x: shininess, y: opacity, z: wireframe width
    pub params: [f32; 4],
}

/// A fixed program used by a render pass. Its template may test `INSTANCED`.
#[derive(Clone, Debug)]
pub struct EffectSource {
    pub name: &'static str,
    pub template: &'static str,
    pub attributes: Vec<Attribute>,
    pub textures: Vec<TextureSlot>,
}

impl EffectSource {
    /// Full-screen pass sampling `textures` consecutive 2D slots.
    pub fn fullscreen(name: &'static str, template: &'static str, textures: u32) -> Self {
        Self {
            name,
            template,
            attributes: vec![Attribute::Position, Attribute::Uv],
            textures: (0..textures).map(TextureSlot::d2).collect(),
        }
    }

    /// Pass over scene geometry.
    pub fn mesh(name: &'static str, template: &'static str, attributes: Vec<Attribute>) -> Self {
        Self {
            name,
            template,
            attributes,
            textures: Vec::new(),
        }
    }
}

/// Feature set -> program. Failed compilations are cached as `None` so a
/// broken variant is reported once and its draws are skipped afterwards.
#[derive(Debug)]
pub struct ShaderVariantCache {
    template: String,
    variants: HashMap<Features, Option<ProgramId>>,
    effects: HashMap<(&'static str, bool), Option<ProgramId>>,
}

impl Default for ShaderVariantCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ShaderVariantCache {
    pub fn new() -> Self {
        Self::with_template(VARIANT_TEMPLATE)
    }

    pub fn with_template(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            variants: HashMap::new(),
            effects: HashMap::new(),
        }
    }

    /// Generated source for `features`, without compiling it.
    pub fn variant_source(&self, features: Features) -> Result<ProgramSource, CompileError> {
        let mut source = String::new();
        for tag in features.tags() {
            source.push_str("#define ");
            source.push_str(tag);
            source.push('\n');
        }
        source.push_str(&self.template);
        Ok(ProgramSource {
            label: format!("variant[{}]", features.tag_string()),
            source: preprocess(&source, [])?,
            attributes: features.vertex_attributes(),
            textures: features.texture_slots(),
        })
    }

    /// Compiled program for `features`, compiling on first request.
    pub fn get_program(
        &mut self,
        device: &mut dyn GraphicsDevice,
        features: Features,
    ) -> Option<ProgramId> {
        if let Some(program) = self.variants.get(&features) {
            return *program;
        }
        log::debug!("compiling shader variant [{}]", features);
        let result = self
            .variant_source(features)
            .and_then(|source| device.create_program(&source));
        let program = match result {
            Ok(program) => Some(program),
            // Not cached: the variant compiles again once the device is back.
            Err(CompileError::ContextLost) => return None,
            Err(error) => {
                log::error!("shader variant [{}] failed: {}", features, error);
                None
            }
        };
        match self.variants.entry(features) {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(entry) => *entry.insert(program),
        }
    }

    pub fn get_effect_program(
        &mut self,
        device: &mut dyn GraphicsDevice,
        effect: &EffectSource,
        instanced: bool,
    ) -> Option<ProgramId> {
        let key = (effect.name, instanced);
        if let Some(program) = self.effects.get(&key) {
            return *program;
        }
        log::debug!("compiling effect program {} (instanced: {})", effect.name, instanced);
        let defines: &[&str] = if instanced { &["INSTANCED"] } else { &[] };
        let mut attributes = effect.attributes.clone();
        if instanced {
            attributes.push(Attribute::InstanceOffset);
        }
        let result = preprocess(effect.template, defines.iter().copied()).and_then(|source| {
            device.create_program(&ProgramSource {
                label: effect.name.to_string(),
                source,
                attributes,
                textures: effect.textures.clone(),
            })
        });
        let program = match result {
            Ok(program) => Some(program),
            Err(CompileError::ContextLost) => return None,
            Err(error) => {
                log::error!("effect program {} failed: {}", effect.name, error);
                None
            }
        };
        *self.effects.entry(key).or_insert(program)
    }

    /// Number of cached material variants, failed ones included.
    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    /// Forgets every program after a context loss; the next request recompiles.
    pub fn invalidate(&mut self) {
        self.variants.clear();
        self.effects.clear();
    }

    pub fn destroy(&mut self, device: &mut dyn GraphicsDevice) {
        for program in self
            .variants
            .drain()
            .map(|(_, p)| p)
            .chain(self.effects.drain().map(|(_, p)| p))
            .flatten()
        {
            device.destroy_program(program);
        }
    }
}
