//! GPU-resident vertex and index data.
//!
//! A [`GeometryBuffer`] is built once per mesh shape and shared read-only by
//! every object drawn with that shape. Streams follow a fixed attribute schema
//! ([`Attribute`]); the CPU-side arrays are kept so the buffer can be rebuilt
//! after the device context was lost.

use crate::{
    device::{
        BufferId, BufferKind, DrawCall, FramebufferId, GraphicsDevice, IndexBinding, IndexFormat,
        ProgramId, RenderState, TextureBinding, VertexStream,
    },
    error::{DeviceError, GeometryError},
};

/// Vertex attribute schema: every stream has a fixed shader location and size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Attribute {
    Position,
    Normal,
    Uv,
    Color,
    Tangent,
    Bitangent,
    Barycentric,
    /// A 4x4 matrix per instance, bound as four vec4 locations.
    InstanceOffset,
}

impl Attribute {
    pub const ALL: [Attribute; 8] = [
        Attribute::Position,
        Attribute::Normal,
        Attribute::Uv,
        Attribute::Color,
        Attribute::Tangent,
        Attribute::Bitangent,
        Attribute::Barycentric,
        Attribute::InstanceOffset,
    ];

    /// Accepts the names produced by the geometry loaders (camelCase or snake_case).
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "position" => Some(Attribute::Position),
            "normal" => Some(Attribute::Normal),
            "uv" | "texcoord" => Some(Attribute::Uv),
            "color" => Some(Attribute::Color),
            "tangent" => Some(Attribute::Tangent),
            "bitangent" => Some(Attribute::Bitangent),
            "barycentric" => Some(Attribute::Barycentric),
            "instanceOffset" | "instance_offset" => Some(Attribute::InstanceOffset),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Attribute::Position => "position",
            Attribute::Normal => "normal",
            Attribute::Uv => "uv",
            Attribute::Color => "color",
            Attribute::Tangent => "tangent",
            Attribute::Bitangent => "bitangent",
            Attribute::Barycentric => "barycentric",
            Attribute::InstanceOffset => "instanceOffset",
        }
    }

    /// Number of floats per element.
    pub fn size(self) -> usize {
        match self {
            Attribute::Position => 3,
            Attribute::Normal => 3,
            Attribute::Uv => 2,
            Attribute::Color => 4,
            Attribute::Tangent => 3,
            Attribute::Bitangent => 3,
            Attribute::Barycentric => 3,
            Attribute::InstanceOffset => 16,
        }
    }

    /// First shader location. The instance matrix occupies `slot()..slot() + 4`.
    pub fn slot(self) -> u32 {
        match self {
            Attribute::Position => 0,
            Attribute::Normal => 1,
            Attribute::Uv => 2,
            Attribute::Color => 3,
            Attribute::Tangent => 4,
            Attribute::Bitangent => 5,
            Attribute::Barycentric => 6,
            Attribute::InstanceOffset => 7,
        }
    }

    pub fn default_per_instance(self) -> bool {
        matches!(self, Attribute::InstanceOffset)
    }
}

/// One `(offset, count)` range of a part, in indices (or vertices when unindexed).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrawRange {
    pub offset: u32,
    pub count: u32,
}

/// A sub-range of the buffer drawn with one material.
#[derive(Clone, Debug, PartialEq)]
pub struct Part {
    pub material: String,
    pub ranges: Vec<DrawRange>,
}

/// Raw arrays as produced by a geometry loader.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GeometryData {
    pub attributes: Vec<(String, Vec<f32>)>,
    pub indices: Option<Vec<u32>>,
    pub parts: Vec<Part>,
}

impl GeometryData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attribute(mut self, name: &str, data: Vec<f32>) -> Self {
        self.attributes.push((name.to_string(), data));
        self
    }

    pub fn with_indices(mut self, indices: Vec<u32>) -> Self {
        self.indices = Some(indices);
        self
    }

    pub fn with_part(mut self, material: &str, ranges: Vec<DrawRange>) -> Self {
        self.parts.push(Part {
            material: material.to_string(),
            ranges,
        });
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&[f32]> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, data)| data.as_slice())
    }

    /// Two triangles covering clip space with matching uvs (v grows downwards).
    pub fn fullscreen_quad() -> Self {
        #[rustfmt::skip]
        let positions = vec![
            -1.0, -1.0, 0.0,
             1.0, -1.0, 0.0,
             1.0,  1.0, 0.0,
            -1.0,  1.0, 0.0,
        ];
        #[rustfmt::skip]
        let uvs = vec![
            0.0, 1.0,
            1.0, 1.0,
            1.0, 0.0,
            0.0, 0.0,
        ];
        Self::new()
            .with_attribute("position", positions)
            .with_attribute("uv", uvs)
            .with_indices(vec![0, 1, 2, 0, 2, 3])
    }

    /// Axis-aligned cube of edge length `size` centered on the origin.
    pub fn cube(size: f32) -> Self {
        let h = size / 2.0;
        // (normal, u axis, v axis) per face
        let faces: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
            ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]),
            ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
            ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]),
            ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
            ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
            ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ];
        let mut positions = Vec::with_capacity(72);
        let mut normals = Vec::with_capacity(72);
        let mut uvs = Vec::with_capacity(48);
        let mut indices = Vec::with_capacity(36);
        for (face, (n, u, v)) in faces.iter().enumerate() {
            for (su, sv) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
                for axis in 0..3 {
                    positions.push((n[axis] + su * u[axis] + sv * v[axis]) * h);
                }
                normals.extend_from_slice(n);
                uvs.push((su + 1.0) / 2.0);
                uvs.push((1.0 - sv) / 2.0);
            }
            let base = face as u32 * 4;
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        Self::new()
            .with_attribute("position", positions)
            .with_attribute("normal", normals)
            .with_attribute("uv", uvs)
            .with_indices(indices)
    }

    /// Expands indexed triangles into a flat list and adds the barycentric
    /// stream wireframe rendering needs. Part ranges are kept valid because
    /// every index becomes exactly one vertex.
    pub fn with_wireframe_barycentrics(self) -> Self {
        let vertex_count = self
            .attribute("position")
            .map(|p| p.len() / 3)
            .unwrap_or(0);
        let order: Vec<u32> = match &self.indices {
            Some(indices) => indices.clone(),
            None => (0..vertex_count as u32).collect(),
        };
        let mut attributes = Vec::with_capacity(self.attributes.len() + 1);
        for (name, data) in self.attributes {
            let size = Attribute::from_name(&name).map(Attribute::size);
            let per_vertex =
                !Attribute::from_name(&name).is_some_and(|a| a.default_per_instance());
            match size {
                Some(size) if per_vertex => {
                    let expanded = order
                        .iter()
                        .flat_map(|&i| {
                            let start = i as usize * size;
                            data.get(start..start + size)
                                .map(|s| s.to_vec())
                                .unwrap_or_else(|| vec![0.0; size])
                        })
                        .collect();
                    attributes.push((name, expanded));
                }
                _ => attributes.push((name, data)),
            }
        }
        let barycentric = (0..order.len())
            .flat_map(|i| match i % 3 {
                0 => [1.0, 0.0, 0.0],
                1 => [0.0, 1.0, 0.0],
                _ => [0.0, 0.0, 1.0],
            })
            .collect();
        attributes.retain(|(name, _)| name != "barycentric");
        attributes.push(("barycentric".to_string(), barycentric));
        Self {
            attributes,
            indices: None,
            parts: self.parts,
        }
    }
}

/// Per-draw state handed to [`GeometryBuffer::draw`]. The part callback may
/// change any of it between parts.
#[derive(Clone, Debug)]
pub struct DrawParams {
    pub target: Option<FramebufferId>,
    pub program: ProgramId,
    pub uniforms: Vec<u8>,
    pub textures: Vec<TextureBinding>,
    pub state: RenderState,
}

impl DrawParams {
    pub fn new(target: Option<FramebufferId>, program: ProgramId, state: RenderState) -> Self {
        Self {
            target,
            program,
            uniforms: Vec::new(),
            textures: Vec::new(),
            state,
        }
    }
}

#[derive(Debug)]
struct Stream {
    attribute: Attribute,
    data: Vec<f32>,
    per_instance: bool,
    buffer: Option<BufferId>,
}

#[derive(Debug)]
struct IndexStream {
    data: Vec<u32>,
    format: IndexFormat,
    buffer: Option<BufferId>,
}

#[derive(Debug)]
pub struct GeometryBuffer {
    label: String,
    streams: Vec<Stream>,
    index: Option<IndexStream>,
    parts: Vec<Part>,
    vertex_count: u32,
    instance_count: Option<u32>,
}

impl GeometryBuffer {
    pub fn new(
        device: &mut dyn GraphicsDevice,
        label: &str,
        data: GeometryData,
    ) -> Result<Self, GeometryError> {
        let mut streams: Vec<Stream> = Vec::new();
        for (name, values) in data.attributes {
            let Some(attribute) = Attribute::from_name(&name) else {
                log::debug!("{}: ignoring unknown attribute `{}`", label, name);
                continue;
            };
            validate(&name, attribute, &values)?;
            streams.retain(|s| s.attribute != attribute);
            streams.push(Stream {
                attribute,
                data: values,
                per_instance: attribute.default_per_instance(),
                buffer: None,
            });
        }
        streams.sort_by_key(|s| s.attribute);

        let vertex_count = streams
            .iter()
            .find(|s| s.attribute == Attribute::Position)
            .map(|s| (s.data.len() / Attribute::Position.size()) as u32)
            .unwrap_or(0);
        for stream in streams.iter().filter(|s| !s.per_instance) {
            let count = stream.data.len() / stream.attribute.size();
            if count != vertex_count as usize {
                return Err(GeometryError::AttributeCount {
                    name: stream.attribute.name().to_string(),
                    count,
                    expected: vertex_count as usize,
                });
            }
        }
        let instance_count = instance_count_of(&streams);

        let index = data.indices.map(|indices| IndexStream {
            format: index_format(label, &indices),
            data: indices,
            buffer: None,
        });

        let mut geometry = Self {
            label: label.to_string(),
            streams,
            index,
            parts: data.parts,
            vertex_count,
            instance_count,
        };
        geometry.upload(device)?;
        Ok(geometry)
    }

    fn upload(&mut self, device: &mut dyn GraphicsDevice) -> Result<(), DeviceError> {
        for stream in self.streams.iter_mut() {
            if stream.buffer.is_none() {
                let bytes: &[u8] = bytemuck::cast_slice(&stream.data);
                stream.buffer = Some(device.create_buffer(BufferKind::Vertex, bytes)?);
            }
        }
        if let Some(index) = self.index.as_mut() {
            if index.buffer.is_none() {
                let bytes = index.format.encode(&index.data);
                index.buffer = Some(device.create_buffer(BufferKind::Index, &bytes)?);
            }
        }
        Ok(())
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn instance_count(&self) -> Option<u32> {
        self.instance_count
    }

    pub fn index_format(&self) -> Option<IndexFormat> {
        self.index.as_ref().map(|i| i.format)
    }

    pub fn has_attribute(&self, attribute: Attribute) -> bool {
        self.streams.iter().any(|s| s.attribute == attribute)
    }

    /// Number of elements a full draw covers.
    pub fn element_count(&self) -> u32 {
        match &self.index {
            Some(index) => index.data.len() as u32,
            None => self.vertex_count,
        }
    }

    pub fn attribute_data(&self, attribute: Attribute) -> Option<&[f32]> {
        self.streams
            .iter()
            .find(|s| s.attribute == attribute)
            .map(|s| s.data.as_slice())
    }

    /// Replaces or lazily creates one stream. Other streams keep their buffers.
    pub fn set_buffer_data(
        &mut self,
        device: &mut dyn GraphicsDevice,
        name: &str,
        data: Vec<f32>,
        instanced: bool,
    ) -> Result<(), GeometryError> {
        let Some(attribute) = Attribute::from_name(name) else {
            log::warn!("{}: cannot set unknown attribute `{}`", self.label, name);
            return Ok(());
        };
        validate(name, attribute, &data)?;
        let bytes: Vec<u8> = bytemuck::cast_slice(&data).to_vec();
        let per_instance = instanced || attribute.default_per_instance();

        match self.streams.iter_mut().find(|s| s.attribute == attribute) {
            Some(stream) => {
                let same_size = stream.data.len() == data.len();
                match stream.buffer {
                    Some(buffer) if same_size => device.update_buffer(buffer, &bytes)?,
                    Some(buffer) => {
                        device.destroy_buffer(buffer);
                        stream.buffer = Some(device.create_buffer(BufferKind::Vertex, &bytes)?);
                    }
                    None => {
                        stream.buffer = Some(device.create_buffer(BufferKind::Vertex, &bytes)?)
                    }
                }
                stream.data = data;
                stream.per_instance = per_instance;
            }
            None => {
                let buffer = device.create_buffer(BufferKind::Vertex, &bytes)?;
                self.streams.push(Stream {
                    attribute,
                    data,
                    per_instance,
                    buffer: Some(buffer),
                });
                self.streams.sort_by_key(|s| s.attribute);
            }
        }
        if attribute == Attribute::Position {
            self.vertex_count = (self
                .attribute_data(Attribute::Position)
                .map(|d| d.len())
                .unwrap_or(0)
                / Attribute::Position.size()) as u32;
        }
        self.instance_count = instance_count_of(&self.streams);
        Ok(())
    }

    fn bindings(&self) -> Option<(Vec<VertexStream>, Option<IndexBinding>)> {
        let mut streams = Vec::with_capacity(self.streams.len());
        for stream in &self.streams {
            streams.push(VertexStream {
                attribute: stream.attribute,
                buffer: stream.buffer?,
                per_instance: stream.per_instance,
            });
        }
        let index = match &self.index {
            Some(index) => Some(IndexBinding {
                buffer: index.buffer?,
                format: index.format,
            }),
            None => None,
        };
        Some((streams, index))
    }

    /// Draws every part (calling `on_part` first, which may adjust `params` or
    /// return `false` to skip the part), or the whole buffer when there are no
    /// parts. Returns the number of draw calls issued.
    pub fn draw<F>(
        &self,
        device: &mut dyn GraphicsDevice,
        params: &mut DrawParams,
        mut on_part: F,
    ) -> u32
    where
        F: FnMut(&Part, &mut DrawParams) -> bool,
    {
        let Some((streams, index)) = self.bindings() else {
            log::warn!("{}: drawing before GPU buffers were restored", self.label);
            return 0;
        };
        let instances = match self.instance_count {
            Some(0) => {
                log::warn!("{}: you attempted to render something with zero instances", self.label);
                return 0;
            }
            Some(n) => n,
            None => 1,
        };
        let mut issued = 0;
        let mut issue = |params: &DrawParams, first: u32, count: u32| {
            if count == 0 {
                return;
            }
            device.draw(&DrawCall {
                target: params.target,
                program: params.program,
                streams: &streams,
                index,
                first,
                count,
                instances,
                uniforms: &params.uniforms,
                textures: &params.textures,
                state: params.state,
            });
            issued += 1;
        };

        if self.parts.is_empty() {
            issue(params, 0, self.element_count());
        } else {
            for part in &self.parts {
                if !on_part(part, params) {
                    continue;
                }
                for range in &part.ranges {
                    issue(params, range.offset, range.count);
                }
            }
        }
        issued
    }

    /// Draws everything with one set of parameters.
    pub fn draw_all(&self, device: &mut dyn GraphicsDevice, params: &mut DrawParams) -> u32 {
        self.draw(device, params, |_, _| true)
    }

    /// Forgets GPU buffers after a context loss without touching the device.
    pub fn invalidate(&mut self) {
        self.streams.iter_mut().for_each(|s| s.buffer = None);
        if let Some(index) = self.index.as_mut() {
            index.buffer = None;
        }
    }

    /// Re-uploads every stream from the retained CPU copies.
    pub fn restore(&mut self, device: &mut dyn GraphicsDevice) -> Result<(), DeviceError> {
        self.upload(device)
    }

    pub fn destroy(&mut self, device: &mut dyn GraphicsDevice) {
        for stream in self.streams.iter_mut() {
            if let Some(buffer) = stream.buffer.take() {
                device.destroy_buffer(buffer);
            }
        }
        if let Some(buffer) = self.index.as_mut().and_then(|i| i.buffer.take()) {
            device.destroy_buffer(buffer);
        }
    }
}

fn validate(name: &str, attribute: Attribute, values: &[f32]) -> Result<(), GeometryError> {
    if values.len() % attribute.size() != 0 {
        return Err(GeometryError::AttributeSize {
            name: name.to_string(),
            len: values.len(),
            size: attribute.size(),
        });
    }
    Ok(())
}

fn instance_count_of(streams: &[Stream]) -> Option<u32> {
    streams
        .iter()
        .filter(|s| s.per_instance)
        .map(|s| (s.data.len() / s.attribute.size()) as u32)
        .min()
}

fn index_format(label: &str, indices: &[u32]) -> IndexFormat {
    let format = IndexFormat::for_count(indices.len());
    let max = indices.iter().copied().max().unwrap_or(0);
    if max <= format.max_value() {
        return format;
    }
    let widened = if max <= IndexFormat::U16.max_value() {
        IndexFormat::U16
    } else {
        IndexFormat::U32
    };
    log::warn!(
        "{}: index {} does not fit {:?} indices, widening to {:?}",
        label,
        max,
        format,
        widened
    );
    widened
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::recording::{Command, RecordingDevice};

    #[test]
    fn index_width_follows_index_count() {
        let mut device = RecordingDevice::new(64, 64);
        for (len, expected) in [
            (200, IndexFormat::U8),
            (40_000, IndexFormat::U16),
            (100_000, IndexFormat::U32),
        ] {
            let indices = (0..len as u32).map(|i| i % 3).collect();
            let data = GeometryData::new()
                .with_attribute("position", vec![0.0; 9])
                .with_indices(indices);
            let geometry = GeometryBuffer::new(&mut device, "indices", data).unwrap();
            assert_eq!(geometry.index_format(), Some(expected), "len {}", len);
        }
    }

    #[test]
    fn index_width_widens_for_large_values() {
        let mut device = RecordingDevice::new(64, 64);
        let data = GeometryData::new()
            .with_attribute("position", vec![0.0; 3 * 300])
            .with_indices(vec![0, 1, 299]);
        let geometry = GeometryBuffer::new(&mut device, "wide", data).unwrap();
        assert_eq!(geometry.index_format(), Some(IndexFormat::U16));
    }

    #[test]
    fn rejects_attribute_with_wrong_size() {
        let mut device = RecordingDevice::new(64, 64);
        let data = GeometryData::new()
            .with_attribute("position", vec![0.0; 9])
            .with_attribute("uv", vec![0.0; 5]);
        let err = GeometryBuffer::new(&mut device, "bad", data).unwrap_err();
        assert!(matches!(err, GeometryError::AttributeSize { size: 2, len: 5, .. }));
    }

    #[test]
    fn ignores_unknown_attributes() {
        let mut device = RecordingDevice::new(64, 64);
        let data = GeometryData::new()
            .with_attribute("position", vec![0.0; 9])
            .with_attribute("weights", vec![0.0; 7]);
        let geometry = GeometryBuffer::new(&mut device, "unknown", data).unwrap();
        assert!(geometry.has_attribute(Attribute::Position));
        assert_eq!(device.buffer_count(), 1);
    }

    #[test]
    fn parts_issue_one_draw_per_range_after_callback() {
        let mut device = RecordingDevice::new(64, 64);
        let data = GeometryData::cube(1.0)
            .with_part(
                "red",
                vec![
                    DrawRange { offset: 0, count: 6 },
                    DrawRange { offset: 12, count: 6 },
                ],
            )
            .with_part("blue", vec![DrawRange { offset: 6, count: 6 }]);
        let geometry = GeometryBuffer::new(&mut device, "parts", data).unwrap();
        let mut params = DrawParams::new(None, ProgramId(0), RenderState::opaque());
        let mut seen = Vec::new();
        let issued = geometry.draw(&mut device, &mut params, |part, params| {
            seen.push(part.material.clone());
            params.uniforms = part.material.as_bytes().to_vec();
            true
        });
        assert_eq!(issued, 3);
        assert_eq!(seen, vec!["red", "blue"]);
        let draws = device.draws();
        assert_eq!(draws[0].first, 0);
        assert_eq!(draws[1].first, 12);
        assert_eq!(draws[2].uniforms, b"blue".to_vec());
    }

    #[test]
    fn replacing_a_stream_keeps_other_bindings() {
        let mut device = RecordingDevice::new(64, 64);
        let mut geometry =
            GeometryBuffer::new(&mut device, "cube", GeometryData::cube(1.0)).unwrap();
        let normals_before = geometry.bindings().unwrap().0[1];
        geometry
            .set_buffer_data(&mut device, "uv", vec![0.5; 48], false)
            .unwrap();
        let after = geometry.bindings().unwrap().0;
        assert_eq!(after[1], normals_before);
        assert!(device
            .commands()
            .iter()
            .any(|c| matches!(c, Command::UpdateBuffer { .. })));
    }

    #[test]
    fn instance_stream_switches_to_instanced_draws() {
        let mut device = RecordingDevice::new(64, 64);
        let mut geometry =
            GeometryBuffer::new(&mut device, "cube", GeometryData::cube(1.0)).unwrap();
        let mut offsets = Vec::new();
        #[rustfmt::skip]
        let identity = [
            1.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ];
        for _ in 0..3 {
            offsets.extend_from_slice(&identity);
        }
        geometry
            .set_buffer_data(&mut device, "instanceOffset", offsets, true)
            .unwrap();
        assert_eq!(geometry.instance_count(), Some(3));
        let mut params = DrawParams::new(None, ProgramId(0), RenderState::opaque());
        geometry.draw_all(&mut device, &mut params);
        assert_eq!(device.draws()[0].instances, 3);
    }

    #[test]
    fn wireframe_expansion_adds_barycentrics() {
        let data = GeometryData::cube(1.0).with_wireframe_barycentrics();
        assert!(data.indices.is_none());
        assert_eq!(data.attribute("position").unwrap().len(), 36 * 3);
        let bary = data.attribute("barycentric").unwrap();
        assert_eq!(&bary[0..9], &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]);
    }
}
