//! URL-keyed textures with placeholder-then-swap loading.
//!
//! [`TextureCache::request`] hands back a [`TextureRef`] right away. Until the
//! image arrives the reference resolves to a 1x1 placeholder: white for
//! colour maps, a flat normal for normal maps. Loader callbacks only send a
//! message; [`TextureCache::drain`] swaps the real texture in on the render
//! thread. A failed load leaves a gray placeholder and is not retried.
//!
//! Decoded pixels are kept so that textures can be rebuilt after a context
//! loss. Every loss bumps an epoch and completions from older epochs are
//! dropped.

use std::{collections::HashMap, sync::Arc};

use futures::channel::mpsc;

use crate::{
    data_structures::material::ImageSource,
    device::{GraphicsDevice, TextureDesc, TextureId, TextureKind},
    error::{DeviceError, ResourceLoadError},
    resources::{AssetLoader, DecodedImage},
};

pub const PLACEHOLDER_COLOR: [u8; 4] = [255, 255, 255, 255];
pub const PLACEHOLDER_NORMAL: [u8; 4] = [127, 127, 255, 255];
pub const FAILED_COLOR: [u8; 4] = [128, 128, 128, 255];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureRef(usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadState {
    Loading,
    Ready,
    Failed,
}

#[derive(Debug)]
struct Entry {
    source: ImageSource,
    normal_map: bool,
    state: LoadState,
    texture: Option<TextureId>,
    /// One slot per face, filled as completions arrive.
    faces: Vec<Option<DecodedImage>>,
}

impl Entry {
    fn kind(&self) -> TextureKind {
        if self.source.is_cube() {
            TextureKind::Cube
        } else {
            TextureKind::D2
        }
    }

    fn label(&self) -> String {
        match &self.source {
            ImageSource::Url(url) => url.clone(),
            ImageSource::Cube(faces) => faces[0].clone(),
        }
    }

    fn placeholder_pixel(&self) -> [u8; 4] {
        match (self.state, self.normal_map) {
            (LoadState::Failed, _) => FAILED_COLOR,
            (_, true) => PLACEHOLDER_NORMAL,
            (_, false) => PLACEHOLDER_COLOR,
        }
    }
}

struct Completion {
    epoch: u64,
    entry: usize,
    face: usize,
    result: Result<DecodedImage, ResourceLoadError>,
}

pub struct TextureCache {
    loader: Box<dyn AssetLoader>,
    entries: Vec<Entry>,
    lookup: HashMap<(ImageSource, bool), TextureRef>,
    sender: mpsc::UnboundedSender<Completion>,
    receiver: mpsc::UnboundedReceiver<Completion>,
    epoch: u64,
    notify: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl TextureCache {
    pub fn new(loader: impl AssetLoader + 'static) -> Self {
        let (sender, receiver) = mpsc::unbounded();
        Self {
            loader: Box::new(loader),
            entries: Vec::new(),
            lookup: HashMap::new(),
            sender,
            receiver,
            epoch: 0,
            notify: None,
        }
    }

    /// Called from the loader's thread after each completion, e.g. to wake
    /// the event loop.
    pub fn with_notify(mut self, notify: impl Fn() + Send + Sync + 'static) -> Self {
        self.notify = Some(Arc::new(notify));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns the cached reference for `source`, starting a load on first
    /// request.
    pub fn request(
        &mut self,
        device: &mut dyn GraphicsDevice,
        source: &ImageSource,
        normal_map: bool,
    ) -> TextureRef {
        if let Some(texture) = self.lookup.get(&(source.clone(), normal_map)) {
            return *texture;
        }
        let faces = match source {
            ImageSource::Url(_) => 1,
            ImageSource::Cube(_) => 6,
        };
        let index = self.entries.len();
        self.entries.push(Entry {
            source: source.clone(),
            normal_map,
            state: LoadState::Loading,
            texture: None,
            faces: vec![None; faces],
        });
        let texture = TextureRef(index);
        self.lookup.insert((source.clone(), normal_map), texture);
        self.install_placeholder(device, index);
        self.fetch(index);
        texture
    }

    /// The texture to bind right now, `None` while the context is lost.
    pub fn texture(&self, texture: TextureRef) -> Option<TextureId> {
        self.entries.get(texture.0).and_then(|entry| entry.texture)
    }

    pub fn state(&self, texture: TextureRef) -> Option<LoadState> {
        self.entries.get(texture.0).map(|entry| entry.state)
    }

    /// Applies finished loads. Returns how many textures changed.
    pub fn drain(&mut self, device: &mut dyn GraphicsDevice) -> usize {
        let mut changed = 0;
        while let Ok(completion) = self.receiver.try_recv() {
            if completion.epoch != self.epoch {
                log::debug!("dropping texture completion from epoch {}", completion.epoch);
                continue;
            }
            let Some(entry) = self.entries.get_mut(completion.entry) else {
                continue;
            };
            if entry.state != LoadState::Loading {
                continue;
            }
            match completion.result {
                Ok(image) => {
                    if let Some(face) = entry.faces.get_mut(completion.face) {
                        *face = Some(image);
                    }
                    if entry.faces.iter().all(Option::is_some) {
                        self.finish(device, completion.entry);
                        changed += 1;
                    }
                }
                Err(error) => {
                    log::error!("{}", error);
                    self.fail(device, completion.entry);
                    changed += 1;
                }
            }
        }
        changed
    }

    fn fetch(&self, index: usize) {
        let Some(entry) = self.entries.get(index) else {
            return;
        };
        let urls: Vec<&str> = match &entry.source {
            ImageSource::Url(url) => vec![url.as_str()],
            ImageSource::Cube(faces) => faces.iter().map(String::as_str).collect(),
        };
        for (face, url) in urls.into_iter().enumerate() {
            let sender = self.sender.clone();
            let notify = self.notify.clone();
            let epoch = self.epoch;
            self.loader.fetch(
                url,
                Box::new(move |result| {
                    let completion = Completion {
                        epoch,
                        entry: index,
                        face,
                        result,
                    };
                    if sender.unbounded_send(completion).is_ok() {
                        if let Some(notify) = notify {
                            notify();
                        }
                    }
                }),
            );
        }
    }

    fn finish(&mut self, device: &mut dyn GraphicsDevice, index: usize) {
        let Some(entry) = self.entries.get_mut(index) else {
            return;
        };
        match upload(device, entry) {
            Ok(texture) => {
                if let Some(placeholder) = entry.texture.replace(texture) {
                    device.destroy_texture(placeholder);
                }
                entry.state = LoadState::Ready;
                log::debug!("texture {} ready", entry.label());
            }
            Err(DeviceError::ContextLost) => {
                // pixels are kept, restore uploads them
                entry.state = LoadState::Ready;
            }
            Err(error) => {
                log::error!("cannot upload texture {}: {}", entry.label(), error);
                self.fail(device, index);
            }
        }
    }

    fn fail(&mut self, device: &mut dyn GraphicsDevice, index: usize) {
        let Some(entry) = self.entries.get_mut(index) else {
            return;
        };
        entry.state = LoadState::Failed;
        entry.faces.iter_mut().for_each(|face| *face = None);
        if let Some(texture) = entry.texture.take() {
            device.destroy_texture(texture);
        }
        self.install_placeholder(device, index);
    }

    fn install_placeholder(&mut self, device: &mut dyn GraphicsDevice, index: usize) {
        let Some(entry) = self.entries.get_mut(index) else {
            return;
        };
        let kind = entry.kind();
        let desc = TextureDesc {
            kind,
            linear: entry.normal_map,
            ..TextureDesc::color(format!("{} (placeholder)", entry.label()), 1, 1)
        };
        let pixels = entry.placeholder_pixel().repeat(desc.byte_len() / 4);
        match device.create_texture(&desc, Some(&pixels)) {
            Ok(texture) => entry.texture = Some(texture),
            Err(DeviceError::ContextLost) => entry.texture = None,
            Err(error) => {
                log::error!("cannot create placeholder for {}: {}", entry.label(), error);
                entry.texture = None;
            }
        }
    }

    /// Forgets every texture handle after a context loss. In-flight loads
    /// become stale.
    pub fn invalidate(&mut self) {
        self.epoch += 1;
        for entry in &mut self.entries {
            entry.texture = None;
            if entry.state == LoadState::Loading {
                entry.faces.iter_mut().for_each(|face| *face = None);
            }
        }
    }

    /// Rebuilds textures from retained pixels and restarts unfinished loads.
    pub fn restore(&mut self, device: &mut dyn GraphicsDevice) {
        for index in 0..self.entries.len() {
            match self.entries[index].state {
                LoadState::Ready => self.finish(device, index),
                LoadState::Loading => {
                    self.install_placeholder(device, index);
                    self.fetch(index);
                }
                LoadState::Failed => self.install_placeholder(device, index),
            }
        }
    }

    pub fn destroy(&mut self, device: &mut dyn GraphicsDevice) {
        for entry in &mut self.entries {
            if let Some(texture) = entry.texture.take() {
                device.destroy_texture(texture);
            }
        }
        self.entries.clear();
        self.lookup.clear();
        self.epoch += 1;
    }
}

fn upload(device: &mut dyn GraphicsDevice, entry: &Entry) -> Result<TextureId, DeviceError> {
    let faces: Vec<&DecodedImage> = entry.faces.iter().flatten().collect();
    let Some(first) = faces.first() else {
        return Err(DeviceError::Invalid {
            what: "texture",
            reason: format!("{} has no pixels", entry.label()),
        });
    };
    let (width, height) = (first.width, first.height);
    if entry.kind() == TextureKind::Cube
        && (width != height || faces.iter().any(|f| (f.width, f.height) != (width, height)))
    {
        return Err(DeviceError::Invalid {
            what: "cube texture",
            reason: format!("faces of {} must be equal squares", entry.label()),
        });
    }
    let pixels: Vec<u8> = faces.iter().flat_map(|f| f.pixels.iter().copied()).collect();
    let desc = TextureDesc {
        kind: entry.kind(),
        linear: entry.normal_map,
        ..TextureDesc::color(entry.label(), width, height)
    };
    device.create_texture(&desc, Some(&pixels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{device::recording::RecordingDevice, resources::LoadCallback};
    use std::sync::Mutex;

    /// Holds callbacks until the test completes them.
    #[derive(Clone, Default)]
    struct DeferredLoader {
        pending: Arc<Mutex<Vec<(String, LoadCallback)>>>,
    }

    impl DeferredLoader {
        fn complete(&self, url: &str, result: Result<DecodedImage, ResourceLoadError>) {
            let mut pending = self.pending.lock().unwrap();
            let position = pending.iter().position(|(u, _)| u == url).unwrap();
            let (_, done) = pending.remove(position);
            done(result);
        }
    }

    impl AssetLoader for DeferredLoader {
        fn fetch(&self, url: &str, done: LoadCallback) {
            self.pending.lock().unwrap().push((url.to_string(), done));
        }
    }

    #[test]
    fn placeholder_is_swapped_after_drain() {
        let loader = DeferredLoader::default();
        let mut cache = TextureCache::new(loader.clone());
        let mut device = RecordingDevice::new(8, 8);
        let texture = cache.request(&mut device, &"a.png".into(), false);
        let placeholder = cache.texture(texture).unwrap();
        assert_eq!(cache.state(texture), Some(LoadState::Loading));
        assert_eq!(cache.request(&mut device, &"a.png".into(), false), texture);

        loader.complete("a.png", Ok(DecodedImage::solid([1, 2, 3, 4])));
        assert_eq!(cache.texture(texture), Some(placeholder));
        assert_eq!(cache.drain(&mut device), 1);
        assert_ne!(cache.texture(texture), Some(placeholder));
        assert_eq!(cache.state(texture), Some(LoadState::Ready));
        assert_eq!(device.texture_count(), 1);
    }

    #[test]
    fn failed_load_stays_gray() {
        let loader = DeferredLoader::default();
        let mut cache = TextureCache::new(loader.clone());
        let mut device = RecordingDevice::new(8, 8);
        let texture = cache.request(&mut device, &"missing.png".into(), true);
        loader.complete(
            "missing.png",
            Err(ResourceLoadError::Fetch {
                url: "missing.png".into(),
                reason: "404".into(),
            }),
        );
        assert_eq!(cache.drain(&mut device), 1);
        assert_eq!(cache.state(texture), Some(LoadState::Failed));
        assert!(cache.texture(texture).is_some());
        assert!(loader.pending.lock().unwrap().is_empty());
    }

    #[test]
    fn cube_waits_for_all_faces() {
        let loader = DeferredLoader::default();
        let mut cache = TextureCache::new(loader.clone());
        let mut device = RecordingDevice::new(8, 8);
        let faces = ["px", "nx", "py", "ny", "pz", "nz"].map(String::from);
        let texture = cache.request(&mut device, &ImageSource::Cube(faces.clone()), false);
        for face in &faces[..5] {
            loader.complete(face, Ok(DecodedImage::solid([0; 4])));
        }
        assert_eq!(cache.drain(&mut device), 0);
        loader.complete("nz", Ok(DecodedImage::solid([0; 4])));
        assert_eq!(cache.drain(&mut device), 1);
        assert_eq!(cache.state(texture), Some(LoadState::Ready));
    }

    #[test]
    fn completions_from_before_a_loss_are_dropped() {
        let loader = DeferredLoader::default();
        let mut cache = TextureCache::new(loader.clone());
        let mut device = RecordingDevice::new(8, 8);
        let texture = cache.request(&mut device, &"a.png".into(), false);

        device.lose_context();
        cache.invalidate();
        loader.complete("a.png", Ok(DecodedImage::solid([9; 4])));
        device.restore_context();
        cache.restore(&mut device);
        assert_eq!(cache.drain(&mut device), 0);
        assert_eq!(cache.state(texture), Some(LoadState::Loading));

        // restore issued a fresh request
        loader.complete("a.png", Ok(DecodedImage::solid([9; 4])));
        assert_eq!(cache.drain(&mut device), 1);
        assert_eq!(cache.state(texture), Some(LoadState::Ready));
    }

    #[test]
    fn ready_textures_are_rebuilt_from_retained_pixels() {
        let loader = DeferredLoader::default();
        let mut cache = TextureCache::new(loader.clone());
        let mut device = RecordingDevice::new(8, 8);
        let texture = cache.request(&mut device, &"a.png".into(), false);
        loader.complete("a.png", Ok(DecodedImage::solid([9; 4])));
        cache.drain(&mut device);

        device.lose_context();
        cache.invalidate();
        assert_eq!(cache.texture(texture), None);
        device.restore_context();
        cache.restore(&mut device);
        assert!(cache.texture(texture).is_some());
        assert!(loader.pending.lock().unwrap().is_empty());
    }
}
