#[cfg(feature = "ffmpeg")]
mod ffmpeg_decoder;
mod still;
mod synthetic;
mod video;

#[cfg(feature = "ffmpeg")]
pub use ffmpeg_decoder::FfmpegDecoder;
pub use still::{ImageSequence, StaticImage};
pub use synthetic::{ColorBars, TestPattern};
pub use video::{GifDecoder, VideoDecoder, VideoLoop};

use image::RgbaImage;
use std::{path::Path, sync::Arc};

use crate::{RegistryError, Resolution, SourceReadError};

use super::registry::{FallbackSourceDefinition, SourceKind};

/// A frame producer used while the primary feed is unavailable.
///
/// `next_frame` advances the cursor by exactly one unit. A failed read still
/// consumes that unit so a single bad frame cannot stall the source.
pub trait FallbackSource: Send {
    fn next_frame(&mut self) -> Result<Arc<RgbaImage>, SourceReadError>;

    /// Moves the cursor back to the first frame.
    fn reset(&mut self);

    /// Frames handed out since the last reset.
    fn position(&self) -> u64;
}

#[derive(Debug, Clone)]
pub struct FallbackFrame {
    pub source: Arc<str>,
    /// Cursor position of the source after this frame was read.
    pub sequence: u64,
    /// Crossfade weight of the fallback at the time of the read.
    pub transition_progress: f64,
    pub image: Arc<RgbaImage>,
}

pub(crate) fn open_source(
    definition: &FallbackSourceDefinition,
    frame_size: Resolution,
) -> Result<Box<dyn FallbackSource>, RegistryError> {
    match definition.kind {
        SourceKind::ColorBars => Ok(Box::new(ColorBars::new(frame_size))),
        SourceKind::TestPattern => Ok(Box::new(TestPattern::new(frame_size))),
        SourceKind::StaticImage => {
            let path = backing_path(definition)?;
            if !path.is_file() {
                return Err(missing(definition, path));
            }
            Ok(Box::new(StaticImage::new(path)))
        }
        SourceKind::ImageSequence => {
            let path = backing_path(definition)?;
            if !path.is_dir() {
                return Err(missing(definition, path));
            }

            let sequence = ImageSequence::open(path, definition.looping).map_err(|e| {
                RegistryError::UnsupportedContainer {
                    name: definition.name.clone(),
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                }
            })?;
            if sequence.is_empty() {
                return Err(RegistryError::EmptyImageSequence {
                    name: definition.name.clone(),
                    path: path.to_path_buf(),
                });
            }
            Ok(Box::new(sequence))
        }
        SourceKind::VideoLoop => {
            let path = backing_path(definition)?;
            if !path.is_file() {
                return Err(missing(definition, path));
            }

            let decoder = open_decoder(path).map_err(|reason| {
                RegistryError::UnsupportedContainer {
                    name: definition.name.clone(),
                    path: path.to_path_buf(),
                    reason,
                }
            })?;
            Ok(Box::new(VideoLoop::new(decoder, definition.looping)))
        }
    }
}

fn backing_path(definition: &FallbackSourceDefinition) -> Result<&Path, RegistryError> {
    definition
        .path
        .as_deref()
        .ok_or_else(|| RegistryError::MissingBackingPath(definition.name.clone()))
}

fn missing(definition: &FallbackSourceDefinition, path: &Path) -> RegistryError {
    RegistryError::MissingBackingResource {
        name: definition.name.clone(),
        path: path.to_path_buf(),
    }
}

fn open_decoder(path: &Path) -> Result<Box<dyn VideoDecoder>, String> {
    let is_gif = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gif"));

    if is_gif {
        return GifDecoder::open(path)
            .map(|decoder| Box::new(decoder) as Box<dyn VideoDecoder>)
            .map_err(|e| e.to_string());
    }

    open_container(path)
}

#[cfg(feature = "ffmpeg")]
fn open_container(path: &Path) -> Result<Box<dyn VideoDecoder>, String> {
    FfmpegDecoder::open(path).map(|decoder| Box::new(decoder) as Box<dyn VideoDecoder>)
}

#[cfg(not(feature = "ffmpeg"))]
fn open_container(_path: &Path) -> Result<Box<dyn VideoDecoder>, String> {
    Err("only GIF video loops are supported without the ffmpeg feature".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_sources_need_no_path() {
        let size = Resolution::new(64, 36);

        let mut bars = open_source(&FallbackSourceDefinition::color_bars("bars"), size).unwrap();
        let frame = bars.next_frame().unwrap();
        assert_eq!(frame.dimensions(), (64, 36));

        let mut pattern =
            open_source(&FallbackSourceDefinition::test_pattern("pattern"), size).unwrap();
        pattern.next_frame().unwrap();
        pattern.next_frame().unwrap();
        assert_eq!(pattern.position(), 2);
        pattern.reset();
        assert_eq!(pattern.position(), 0);
    }

    #[test]
    fn file_backed_sources_need_a_path() {
        let mut definition = FallbackSourceDefinition::static_image("slate", "/nonexistent");
        definition.path = None;

        assert!(matches!(
            open_source(&definition, Resolution::HD_720P),
            Err(RegistryError::MissingBackingPath(name)) if name == "slate"
        ));
    }

    #[test]
    fn missing_files_are_rejected() {
        for definition in [
            FallbackSourceDefinition::static_image("a", "/nonexistent/slate.png"),
            FallbackSourceDefinition::image_sequence("b", "/nonexistent/frames"),
            FallbackSourceDefinition::video_loop("c", "/nonexistent/loop.gif"),
        ] {
            assert!(matches!(
                open_source(&definition, Resolution::HD_720P),
                Err(RegistryError::MissingBackingResource { .. })
            ));
        }
    }
}
