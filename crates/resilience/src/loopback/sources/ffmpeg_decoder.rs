use ffmpeg::{
    codec as avcodec,
    format::{self as avformat, Pixel},
    frame as avframe,
    software::scaling,
    sys::EAGAIN,
    util as avutil,
};
use image::RgbaImage;
use std::path::{Path, PathBuf};
use tracing::*;

use super::VideoDecoder;
use crate::SourceReadError;

fn decode_error(e: ffmpeg::Error) -> SourceReadError {
    SourceReadError::Decode(e.to_string())
}

/// Decodes any container FFmpeg understands, converting frames to RGBA.
pub struct FfmpegDecoder {
    path: PathBuf,
    input: avformat::context::Input,
    decoder: avcodec::decoder::Video,
    scaler: scaling::Context,
    stream_index: usize,
    width: u32,
    height: u32,
    draining: bool,
}

impl FfmpegDecoder {
    pub fn open(path: &Path) -> Result<Self, String> {
        ffmpeg::init().map_err(|e| format!("init ffmpeg / {e}"))?;

        let input = ffmpeg::format::input(&path).map_err(|e| format!("open file / {e}"))?;

        let input_stream = input
            .streams()
            .best(avutil::media::Type::Video)
            .ok_or_else(|| "no video stream".to_string())?;
        let stream_index = input_stream.index();

        let mut decoder = avcodec::Context::from_parameters(input_stream.parameters())
            .map_err(|e| format!("decoder context / {e}"))?
            .decoder()
            .video()
            .map_err(|e| format!("video decoder / {e}"))?;
        decoder.set_time_base(input_stream.time_base());

        let width = decoder.width();
        let height = decoder.height();
        if width == 0 || height == 0 {
            return Err(format!("invalid video dimensions {width}x{height}"));
        }

        let scaler = scaling::Context::get(
            decoder.format(),
            width,
            height,
            Pixel::RGBA,
            width,
            height,
            scaling::Flags::BILINEAR,
        )
        .map_err(|e| format!("scaler / {e}"))?;

        info!(
            "Opened video loop {} ({width}x{height}, {:?})",
            path.display(),
            decoder.format()
        );

        Ok(Self {
            path: path.to_path_buf(),
            input,
            decoder,
            scaler,
            stream_index,
            width,
            height,
            draining: false,
        })
    }

    fn to_rgba(&mut self, frame: &avframe::Video) -> Result<RgbaImage, SourceReadError> {
        let mut converted = avframe::Video::empty();
        self.scaler.run(frame, &mut converted).map_err(decode_error)?;

        let row_bytes = self.width as usize * 4;
        let stride = converted.stride(0);
        let data = converted.data(0);

        let mut image = RgbaImage::new(self.width, self.height);
        for (y, row) in image.chunks_exact_mut(row_bytes).enumerate() {
            let start = y * stride;
            let Some(source) = data.get(start..start + row_bytes) else {
                return Err(SourceReadError::Decode(format!(
                    "short RGBA plane in {}",
                    self.path.display()
                )));
            };
            row.copy_from_slice(source);
        }

        Ok(image)
    }
}

impl VideoDecoder for FfmpegDecoder {
    fn next_frame(&mut self) -> Result<Option<RgbaImage>, SourceReadError> {
        let mut frame = avframe::Video::empty();

        loop {
            match self.decoder.receive_frame(&mut frame) {
                Ok(()) => return self.to_rgba(&frame).map(Some),
                Err(ffmpeg::Error::Eof) => return Ok(None),
                Err(ffmpeg::Error::Other { errno }) if errno == EAGAIN => {}
                Err(e) => return Err(decode_error(e)),
            }

            if self.draining {
                return Ok(None);
            }

            let Some((stream, packet)) = self.input.packets().next() else {
                self.draining = true;
                self.decoder.send_eof().map_err(decode_error)?;
                continue;
            };

            if stream.index() != self.stream_index {
                continue;
            }

            match self.decoder.send_packet(&packet) {
                Ok(_) => {}
                Err(ffmpeg::Error::Eof) => return Ok(None),
                Err(ffmpeg::Error::Other { errno }) if errno == EAGAIN => {}
                Err(e) => return Err(decode_error(e)),
            }
        }
    }

    fn rewind(&mut self) -> Result<(), SourceReadError> {
        self.input.seek(0, ..0).map_err(decode_error)?;
        self.decoder.flush();
        self.draining = false;
        debug!("Rewound video loop {}", self.path.display());
        Ok(())
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

unsafe impl Send for FfmpegDecoder {}
