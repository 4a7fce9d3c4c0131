//! Materials and the feature key that selects a shader variant.
//!
//! A [`Material`] holds plain surface properties. The subset of properties
//! that changes which shader code is needed maps to a [`Features`] set; two
//! materials with the same set share one compiled program no matter how their
//! colours differ.

use std::{cell::Cell, fmt};

use bitflags::bitflags;

use crate::{data_structures::geometry::Attribute, device::TextureSlot};

bitflags! {
    /// Shader features. Declaration order is the precedence order of the
    /// feature key and of the `#define` lines in generated sources.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct Features: u32 {
        const CLIPPLANE = 1 << 0;
        const WIREFRAME = 1 << 1;
        const WIREFRAME_ONLY = 1 << 2;
        const VERTEX_COLOR = 1 << 3;
        const DIFFUSE_MAP = 1 << 4;
        const DIFFUSE_CUBE_MAP = 1 << 5;
        const ENV_MAP = 1 << 6;
        const LIGHT = 1 << 7;
        const NORMAL_MAP = 1 << 8;
        const AMBIENT_MAP = 1 << 9;
        const SPECULAR_MAP = 1 << 10;
        const EMISSIVE_MAP = 1 << 11;
        /// Geometry-derived: set by the renderer for instanced geometry.
        const INSTANCED = 1 << 12;
    }
}

/// Fixed texture units.
pub mod units {
    pub const DIFFUSE: u32 = 0;
    pub const NORMAL: u32 = 1;
    pub const AMBIENT: u32 = 2;
    pub const SPECULAR: u32 = 3;
    pub const EMISSIVE: u32 = 4;
    pub const ENVIRONMENT: u32 = 5;
}

impl Features {
    /// Tags in precedence order.
    pub fn tags(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.iter_names().map(|(name, _)| name)
    }

    /// Stable string key: the tags joined with `,`.
    pub fn tag_string(&self) -> String {
        self.tags().collect::<Vec<_>>().join(",")
    }

    /// Texture units a program with these features samples.
    pub fn texture_slots(&self) -> Vec<TextureSlot> {
        let mut slots = Vec::new();
        if self.contains(Features::DIFFUSE_MAP) {
            slots.push(TextureSlot::d2(units::DIFFUSE));
        } else if self.contains(Features::DIFFUSE_CUBE_MAP) {
            slots.push(TextureSlot::cube(units::DIFFUSE));
        }
        let maps = [
            (Features::NORMAL_MAP, units::NORMAL),
            (Features::AMBIENT_MAP, units::AMBIENT),
            (Features::SPECULAR_MAP, units::SPECULAR),
            (Features::EMISSIVE_MAP, units::EMISSIVE),
        ];
        for (feature, unit) in maps {
            if self.contains(feature) {
                slots.push(TextureSlot::d2(unit));
            }
        }
        if self.contains(Features::ENV_MAP) {
            slots.push(TextureSlot::cube(units::ENVIRONMENT));
        }
        slots
    }

    /// Vertex inputs a program with these features reads.
    pub fn vertex_attributes(&self) -> Vec<Attribute> {
        let mut attributes = vec![Attribute::Position];
        if self.intersects(Features::LIGHT | Features::ENV_MAP) {
            attributes.push(Attribute::Normal);
        }
        if self.intersects(
            Features::DIFFUSE_MAP
                | Features::NORMAL_MAP
                | Features::AMBIENT_MAP
                | Features::SPECULAR_MAP
                | Features::EMISSIVE_MAP,
        ) {
            attributes.push(Attribute::Uv);
        }
        if self.contains(Features::VERTEX_COLOR) {
            attributes.push(Attribute::Color);
        }
        if self.contains(Features::NORMAL_MAP) {
            attributes.push(Attribute::Tangent);
            attributes.push(Attribute::Bitangent);
        }
        if self.contains(Features::WIREFRAME) {
            attributes.push(Attribute::Barycentric);
        }
        if self.contains(Features::INSTANCED) {
            attributes.push(Attribute::InstanceOffset);
        }
        attributes
    }
}

impl fmt::Display for Features {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag_string())
    }
}

/// Where a texture comes from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ImageSource {
    Url(String),
    /// Faces in +X, -X, +Y, -Y, +Z, -Z order.
    Cube([String; 6]),
}

impl ImageSource {
    pub fn is_cube(&self) -> bool {
        matches!(self, ImageSource::Cube(_))
    }
}

impl From<&str> for ImageSource {
    fn from(url: &str) -> Self {
        ImageSource::Url(url.to_string())
    }
}

/// A texture the active feature set needs, with the unit it binds to.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MaterialImage<'a> {
    pub unit: u32,
    pub source: &'a ImageSource,
    pub normal_map: bool,
}

pub type Color = [f32; 4];

#[derive(Clone, Debug)]
pub struct Material {
    pub name: String,
    ambient_color: Color,
    diffuse_color: Color,
    specular_color: Color,
    emissive_color: Color,
    ambient_image: Option<ImageSource>,
    diffuse_image: Option<ImageSource>,
    specular_image: Option<ImageSource>,
    emissive_image: Option<ImageSource>,
    environment_image: Option<ImageSource>,
    normal_image: Option<ImageSource>,
    light: bool,
    double_sided: bool,
    shininess: f32,
    transparency: f32,
    wireframe: bool,
    wireframe_only: bool,
    wireframe_color: Color,
    wireframe_width: f32,
    clip_plane: Option<[f32; 4]>,
    vertex_color: bool,
    key: Cell<Features>,
    dirty: Cell<bool>,
}

impl Default for Material {
    fn default() -> Self {
        Self::new("default")
    }
}

// Feature setters compare first: rewriting a value never invalidates the key.
macro_rules! setter {
    ($(#[$meta:meta])* feature $set:ident, $get:ident, $field:ident: $ty:ty) => {
        $(#[$meta])*
        pub fn $set(&mut self, value: $ty) {
            if self.$field != value {
                self.$field = value;
                self.dirty.set(true);
            }
        }

        pub fn $get(&self) -> $ty {
            self.$field
        }
    };
    ($(#[$meta:meta])* $set:ident, $get:ident, $field:ident: $ty:ty) => {
        $(#[$meta])*
        pub fn $set(&mut self, value: $ty) {
            if self.$field != value {
                self.$field = value;
            }
        }

        pub fn $get(&self) -> $ty {
            self.$field
        }
    };
}

macro_rules! image_setter {
    ($set:ident, $get:ident, $field:ident) => {
        pub fn $set(&mut self, value: Option<ImageSource>) {
            if self.$field != value {
                self.$field = value;
                self.dirty.set(true);
            }
        }

        pub fn $get(&self) -> Option<&ImageSource> {
            self.$field.as_ref()
        }
    };
}

impl Material {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ambient_color: [0.2, 0.2, 0.2, 1.0],
            diffuse_color: [1.0, 1.0, 1.0, 1.0],
            specular_color: [1.0, 1.0, 1.0, 1.0],
            emissive_color: [0.0, 0.0, 0.0, 1.0],
            ambient_image: None,
            diffuse_image: None,
            specular_image: None,
            emissive_image: None,
            environment_image: None,
            normal_image: None,
            light: true,
            double_sided: false,
            shininess: 32.0,
            transparency: 1.0,
            wireframe: false,
            wireframe_only: false,
            wireframe_color: [0.0, 0.0, 0.0, 1.0],
            wireframe_width: 1.0,
            clip_plane: None,
            vertex_color: false,
            key: Cell::new(Features::empty()),
            dirty: Cell::new(true),
        }
    }

    setter!(set_ambient_color, ambient_color, ambient_color: Color);
    setter!(set_diffuse_color, diffuse_color, diffuse_color: Color);
    setter!(set_specular_color, specular_color, specular_color: Color);
    setter!(set_emissive_color, emissive_color, emissive_color: Color);
    setter!(set_double_sided, double_sided, double_sided: bool);
    setter!(set_shininess, shininess, shininess: f32);
    setter!(
        /// Opacity in `0..=1`. Anything below 1 is drawn in the transparent pass.
        set_transparency, transparency, transparency: f32
    );
    setter!(set_wireframe_color, wireframe_color, wireframe_color: Color);
    setter!(set_wireframe_width, wireframe_width, wireframe_width: f32);
    setter!(feature set_light, light, light: bool);
    setter!(feature set_wireframe, wireframe, wireframe: bool);
    setter!(
        /// Only takes effect while `wireframe` is set.
        feature set_wireframe_only, wireframe_only, wireframe_only: bool
    );
    setter!(feature set_vertex_color, vertex_color, vertex_color: bool);
    setter!(
        /// Plane `(a, b, c, d)`; fragments with `dot(n, p) + d < 0` are discarded.
        feature set_clip_plane, clip_plane, clip_plane: Option<[f32; 4]>
    );

    image_setter!(set_ambient_image, ambient_image, ambient_image);
    image_setter!(set_diffuse_image, diffuse_image, diffuse_image);
    image_setter!(set_specular_image, specular_image, specular_image);
    image_setter!(set_emissive_image, emissive_image, emissive_image);
    image_setter!(set_environment_image, environment_image, environment_image);
    image_setter!(set_normal_image, normal_image, normal_image);

    pub fn is_transparent(&self) -> bool {
        self.transparency < 1.0
    }

    /// The feature set, rebuilt only after a feature property changed.
    pub fn feature_key(&self) -> Features {
        if self.dirty.get() {
            self.key.set(self.build_key());
            self.dirty.set(false);
        }
        self.key.get()
    }

    fn build_key(&self) -> Features {
        let mut key = Features::empty();
        if self.clip_plane.is_some() {
            key |= Features::CLIPPLANE;
        }
        if self.wireframe {
            key |= Features::WIREFRAME;
            if self.wireframe_only {
                return key | Features::WIREFRAME_ONLY;
            }
        }
        if self.vertex_color {
            key |= Features::VERTEX_COLOR;
        }
        match &self.diffuse_image {
            Some(ImageSource::Url(_)) => key |= Features::DIFFUSE_MAP,
            Some(ImageSource::Cube(_)) => key |= Features::DIFFUSE_CUBE_MAP,
            None => {}
        }
        if self.environment_image.is_some() {
            key |= Features::ENV_MAP;
        }
        if self.light {
            key |= Features::LIGHT;
            let maps = [
                (&self.normal_image, Features::NORMAL_MAP),
                (&self.ambient_image, Features::AMBIENT_MAP),
                (&self.specular_image, Features::SPECULAR_MAP),
                (&self.emissive_image, Features::EMISSIVE_MAP),
            ];
            for (image, feature) in maps {
                if image.is_some() {
                    key |= feature;
                }
            }
        }
        key
    }

    /// Images the current feature key samples, with their texture units.
    pub fn images(&self) -> Vec<MaterialImage<'_>> {
        let key = self.feature_key();
        let candidates = [
            (
                Features::DIFFUSE_MAP | Features::DIFFUSE_CUBE_MAP,
                units::DIFFUSE,
                &self.diffuse_image,
            ),
            (Features::NORMAL_MAP, units::NORMAL, &self.normal_image),
            (Features::AMBIENT_MAP, units::AMBIENT, &self.ambient_image),
            (Features::SPECULAR_MAP, units::SPECULAR, &self.specular_image),
            (Features::EMISSIVE_MAP, units::EMISSIVE, &self.emissive_image),
            (Features::ENV_MAP, units::ENVIRONMENT, &self.environment_image),
        ];
        candidates
            .into_iter()
            .filter(|(feature, _, _)| key.intersects(*feature))
            .filter_map(|(_, unit, image)| {
                image.as_ref().map(|source| MaterialImage {
                    unit,
                    source,
                    normal_map: unit == units::NORMAL,
                })
            })
            .collect()
    }
}
