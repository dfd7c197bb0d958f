use image::RgbaImage;
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::debug;

use super::FallbackSource;
use crate::SourceReadError;

const IMAGE_EXTENSIONS: [&str; 8] = ["png", "jpg", "jpeg", "bmp", "gif", "webp", "tif", "tiff"];

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

fn decode(path: &Path) -> Result<RgbaImage, SourceReadError> {
    match image::open(path) {
        Ok(image) => Ok(image.into_rgba8()),
        Err(image::ImageError::IoError(e)) if e.kind() == io::ErrorKind::NotFound => {
            Err(SourceReadError::MissingFrame(path.to_path_buf()))
        }
        Err(e) => Err(e.into()),
    }
}

/// A single image served on every tick. Decoded on first use and then shared.
pub struct StaticImage {
    path: PathBuf,
    cached: Option<Arc<RgbaImage>>,
    served: u64,
}

impl StaticImage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: None,
            served: 0,
        }
    }
}

impl FallbackSource for StaticImage {
    fn next_frame(&mut self) -> Result<Arc<RgbaImage>, SourceReadError> {
        self.served += 1;

        if let Some(image) = &self.cached {
            return Ok(image.clone());
        }

        let image = Arc::new(decode(&self.path)?);
        debug!(
            "Decoded static image {} ({}x{})",
            self.path.display(),
            image.width(),
            image.height()
        );
        self.cached = Some(image.clone());
        Ok(image)
    }

    fn reset(&mut self) {
        self.served = 0;
    }

    fn position(&self) -> u64 {
        self.served
    }
}

/// A directory of images played in file name order.
pub struct ImageSequence {
    files: Vec<PathBuf>,
    looping: bool,
    cursor: usize,
    served: u64,
}

impl ImageSequence {
    pub fn open(dir: impl AsRef<Path>, looping: bool) -> io::Result<Self> {
        let dir = dir.as_ref();

        let mut files = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_image_file(path))
            .collect::<Vec<_>>();
        files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

        debug!("Image sequence {} has {} frames", dir.display(), files.len());

        Ok(Self {
            files,
            looping,
            cursor: 0,
            served: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FallbackSource for ImageSequence {
    fn next_frame(&mut self) -> Result<Arc<RgbaImage>, SourceReadError> {
        if self.cursor >= self.files.len() {
            if !self.looping || self.files.is_empty() {
                return Err(SourceReadError::EndOfStream);
            }
            self.cursor = 0;
        }

        let path = &self.files[self.cursor];
        self.cursor += 1;
        self.served += 1;

        decode(path).map(Arc::new)
    }

    fn reset(&mut self) {
        self.cursor = 0;
        self.served = 0;
    }

    fn position(&self) -> u64 {
        self.served
    }
}
