use image::{Rgba, RgbaImage};
use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::debug;

use super::FallbackSource;
use crate::SourceReadError;

/// Sequential frame access to a video container.
pub trait VideoDecoder: Send {
    /// Decodes the next frame. `None` at end of stream.
    fn next_frame(&mut self) -> Result<Option<RgbaImage>, SourceReadError>;

    fn rewind(&mut self) -> Result<(), SourceReadError>;

    fn dimensions(&self) -> (u32, u32);
}

/// Loops a decoded video. Rewinds lazily so `reset` never touches the disk.
pub struct VideoLoop {
    decoder: Box<dyn VideoDecoder>,
    looping: bool,
    rewind_pending: bool,
    ended: bool,
    served: u64,
}

impl VideoLoop {
    pub fn new(decoder: Box<dyn VideoDecoder>, looping: bool) -> Self {
        Self {
            decoder,
            looping,
            rewind_pending: false,
            ended: false,
            served: 0,
        }
    }

    fn read(&mut self) -> Result<Arc<RgbaImage>, SourceReadError> {
        if self.rewind_pending {
            self.decoder.rewind()?;
            self.rewind_pending = false;
        }

        if self.ended {
            return Err(SourceReadError::EndOfStream);
        }

        if let Some(frame) = self.decoder.next_frame()? {
            return Ok(Arc::new(frame));
        }

        if self.looping {
            self.decoder.rewind()?;
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(Arc::new(frame));
            }
        }

        self.ended = true;
        Err(SourceReadError::EndOfStream)
    }
}

impl FallbackSource for VideoLoop {
    fn next_frame(&mut self) -> Result<Arc<RgbaImage>, SourceReadError> {
        self.served += 1;
        self.read()
    }

    fn reset(&mut self) {
        self.rewind_pending = true;
        self.ended = false;
        self.served = 0;
    }

    fn position(&self) -> u64 {
        self.served
    }
}

enum Disposal {
    Clear {
        left: u32,
        top: u32,
        width: u32,
        height: u32,
    },
    Restore(RgbaImage),
}

/// Streaming GIF decoder that composites each frame onto a full canvas.
pub struct GifDecoder {
    path: PathBuf,
    decoder: gif::Decoder<BufReader<File>>,
    canvas: RgbaImage,
    pending: Option<Disposal>,
}

impl GifDecoder {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SourceReadError> {
        let path = path.into();
        let decoder = Self::read_info(&path)?;
        let canvas = RgbaImage::new(
            u32::from(decoder.width()).max(1),
            u32::from(decoder.height()).max(1),
        );

        debug!(
            "Opened GIF {} ({}x{})",
            path.display(),
            canvas.width(),
            canvas.height()
        );

        Ok(Self {
            path,
            decoder,
            canvas,
            pending: None,
        })
    }

    fn read_info(path: &Path) -> Result<gif::Decoder<BufReader<File>>, SourceReadError> {
        let file = BufReader::new(File::open(path)?);
        let mut options = gif::DecodeOptions::new();
        options.set_color_output(gif::ColorOutput::RGBA);
        Ok(options.read_info(file)?)
    }

    fn apply_pending_disposal(&mut self) {
        match self.pending.take() {
            Some(Disposal::Clear {
                left,
                top,
                width,
                height,
            }) => {
                for y in top..(top + height).min(self.canvas.height()) {
                    for x in left..(left + width).min(self.canvas.width()) {
                        self.canvas.put_pixel(x, y, Rgba([0, 0, 0, 0]));
                    }
                }
            }
            Some(Disposal::Restore(previous)) => self.canvas = previous,
            None => {}
        }
    }
}

impl VideoDecoder for GifDecoder {
    fn next_frame(&mut self) -> Result<Option<RgbaImage>, SourceReadError> {
        self.apply_pending_disposal();

        let Some(frame) = self.decoder.read_next_frame()? else {
            return Ok(None);
        };

        let left = u32::from(frame.left);
        let top = u32::from(frame.top);
        let width = u32::from(frame.width);
        let height = u32::from(frame.height);

        let restore = matches!(frame.dispose, gif::DisposalMethod::Previous)
            .then(|| self.canvas.clone());

        for (i, pixel) in frame.buffer.chunks_exact(4).enumerate() {
            if pixel[3] == 0 {
                continue;
            }
            let x = left + i as u32 % width.max(1);
            let y = top + i as u32 / width.max(1);
            if x < self.canvas.width() && y < self.canvas.height() {
                self.canvas
                    .put_pixel(x, y, Rgba([pixel[0], pixel[1], pixel[2], pixel[3]]));
            }
        }

        self.pending = match frame.dispose {
            gif::DisposalMethod::Background => Some(Disposal::Clear {
                left,
                top,
                width,
                height,
            }),
            gif::DisposalMethod::Previous => restore.map(Disposal::Restore),
            _ => None,
        };

        Ok(Some(self.canvas.clone()))
    }

    fn rewind(&mut self) -> Result<(), SourceReadError> {
        self.decoder = Self::read_info(&self.path)?;
        self.canvas = RgbaImage::new(self.canvas.width(), self.canvas.height());
        self.pending = None;
        Ok(())
    }

    fn dimensions(&self) -> (u32, u32) {
        self.canvas.dimensions()
    }
}
