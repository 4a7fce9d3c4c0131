//! Asset loading.
//!
//! Loaders fetch and decode images away from the frame loop and report back
//! through a callback. The [`texture::TextureCache`] turns those callbacks
//! into channel messages that the renderer drains at the start of a frame.

pub mod texture;

use std::{collections::HashMap, sync::Mutex};

use crate::error::ResourceLoadError;

/// An RGBA8 image, rows top to bottom.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl DecodedImage {
    pub fn decode(url: &str, bytes: &[u8]) -> Result<Self, ResourceLoadError> {
        let image = image::load_from_memory(bytes).map_err(|e| ResourceLoadError::Decode {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let rgba = image.to_rgba8();
        Ok(Self {
            width: rgba.width(),
            height: rgba.height(),
            pixels: rgba.into_raw(),
        })
    }

    /// A 1x1 image of one colour.
    pub fn solid(color: [u8; 4]) -> Self {
        Self {
            width: 1,
            height: 1,
            pixels: color.to_vec(),
        }
    }
}

pub type LoadCallback = Box<dyn FnOnce(Result<DecodedImage, ResourceLoadError>) + Send>;

/// Fetches and decodes images. `done` may run on any thread, at any time,
/// including before `fetch` returns. Failed loads are not retried.
pub trait AssetLoader {
    fn fetch(&self, url: &str, done: LoadCallback);
}

/// Reads files relative to an asset directory on tokio's blocking pool.
#[cfg(not(target_arch = "wasm32"))]
#[derive(Clone, Debug)]
pub struct FileLoader {
    root: std::path::PathBuf,
    runtime: tokio::runtime::Handle,
}

#[cfg(not(target_arch = "wasm32"))]
impl FileLoader {
    pub fn new(root: impl Into<std::path::PathBuf>, runtime: tokio::runtime::Handle) -> Self {
        Self {
            root: root.into(),
            runtime,
        }
    }

    /// Loader for `./assets` on the runtime the caller runs in.
    pub fn assets() -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()?;
        Ok(Self::new(std::path::Path::new("./").join("assets"), runtime))
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl AssetLoader for FileLoader {
    fn fetch(&self, url: &str, done: LoadCallback) {
        let path = self.root.join(url);
        let url = url.to_string();
        self.runtime.spawn_blocking(move || {
            let result = std::fs::read(&path)
                .map_err(|e| ResourceLoadError::Fetch {
                    url: url.clone(),
                    reason: e.to_string(),
                })
                .and_then(|bytes| DecodedImage::decode(&url, &bytes));
            done(result);
        });
    }
}

/// Fetches assets from `<origin>/assets/` in the browser.
#[cfg(target_arch = "wasm32")]
#[derive(Clone, Debug)]
pub struct HttpLoader {
    base: reqwest::Url,
}

#[cfg(target_arch = "wasm32")]
impl HttpLoader {
    pub fn new(base: reqwest::Url) -> Self {
        Self { base }
    }

    pub fn assets() -> anyhow::Result<Self> {
        let window = web_sys::window().ok_or_else(|| anyhow::anyhow!("no browser window"))?;
        let origin = window
            .location()
            .origin()
            .map_err(|_| anyhow::anyhow!("page has no origin"))?;
        Ok(Self::new(reqwest::Url::parse(&format!("{}/assets/", origin))?))
    }
}

#[cfg(target_arch = "wasm32")]
impl AssetLoader for HttpLoader {
    fn fetch(&self, url: &str, done: LoadCallback) {
        let name = url.to_string();
        let location = self.base.join(url);
        wasm_bindgen_futures::spawn_local(async move {
            let fetch_error = |reason: String| ResourceLoadError::Fetch {
                url: name.clone(),
                reason,
            };
            let bytes = match location {
                Ok(location) => match reqwest::get(location).await {
                    Ok(response) => response
                        .bytes()
                        .await
                        .map(|b| b.to_vec())
                        .map_err(|e| fetch_error(e.to_string())),
                    Err(e) => Err(fetch_error(e.to_string())),
                },
                Err(e) => Err(fetch_error(e.to_string())),
            };
            done(bytes.and_then(|bytes| DecodedImage::decode(&name, &bytes)));
        });
    }
}

/// Serves encoded images registered in memory, completing immediately.
#[derive(Debug, Default)]
pub struct MemoryLoader {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: &str, bytes: Vec<u8>) {
        if let Ok(mut files) = self.files.lock() {
            files.insert(url.to_string(), bytes);
        }
    }

    pub fn with_file(self, url: &str, bytes: Vec<u8>) -> Self {
        self.insert(url, bytes);
        self
    }
}

impl AssetLoader for MemoryLoader {
    fn fetch(&self, url: &str, done: LoadCallback) {
        let bytes = self
            .files
            .lock()
            .ok()
            .and_then(|files| files.get(url).cloned());
        let result = match bytes {
            Some(bytes) => DecodedImage::decode(url, &bytes),
            None => Err(ResourceLoadError::Fetch {
                url: url.to_string(),
                reason: "not found".to_string(),
            }),
        };
        done(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{io::Cursor, sync::mpsc};

    fn png(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
        let image = image::RgbaImage::from_pixel(width, height, image::Rgba(color));
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn memory_loader_decodes_registered_files() {
        let loader = MemoryLoader::new().with_file("red.png", png(2, 3, [255, 0, 0, 255]));
        let (tx, rx) = mpsc::channel();
        loader.fetch("red.png", Box::new(move |result| tx.send(result).unwrap()));
        let image = rx.recv().unwrap().unwrap();
        assert_eq!((image.width, image.height), (2, 3));
        assert_eq!(&image.pixels[..4], &[255, 0, 0, 255]);
    }

    #[test]
    fn missing_and_corrupt_files_report_errors() {
        let loader = MemoryLoader::new().with_file("bad.png", vec![1, 2, 3]);
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        loader.fetch("none.png", Box::new(move |result| tx.send(result).unwrap()));
        loader.fetch("bad.png", Box::new(move |result| tx2.send(result).unwrap()));
        assert!(matches!(rx.recv().unwrap(), Err(ResourceLoadError::Fetch { .. })));
        assert!(matches!(rx.recv().unwrap(), Err(ResourceLoadError::Decode { .. })));
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[tokio::test]
    async fn file_loader_reads_on_blocking_pool() {
        let dir = std::env::temp_dir().join(format!("flow-vfx-loader-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("blue.png"), png(1, 1, [0, 0, 255, 255])).unwrap();
        let loader = FileLoader::new(&dir, tokio::runtime::Handle::current());
        let (tx, rx) = futures::channel::oneshot::channel();
        loader.fetch("blue.png", Box::new(move |result| drop(tx.send(result))));
        let image = rx.await.unwrap().unwrap();
        assert_eq!(image.pixels, vec![0, 0, 255, 255]);
        std::fs::remove_dir_all(&dir).ok();
    }
}
