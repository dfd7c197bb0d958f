use image::{Rgba, RgbaImage};
use std::sync::Arc;

use super::FallbackSource;
use crate::{Resolution, SourceReadError};

const SMPTE_BARS: [[u8; 3]; 8] = [
    [192, 192, 192],
    [192, 192, 0],
    [0, 192, 192],
    [0, 192, 0],
    [192, 0, 192],
    [192, 0, 0],
    [0, 0, 192],
    [0, 0, 0],
];

const BAND_COLOR: Rgba<u8> = Rgba([16, 16, 16, 255]);
const MARKER_COLOR: Rgba<u8> = Rgba([235, 235, 235, 255]);

/// SMPTE-style bars with a marker sweeping along the bottom band so a viewer
/// can tell the output is live.
pub struct ColorBars {
    base: RgbaImage,
    band_top: u32,
    frame: u64,
}

impl ColorBars {
    pub fn new(size: Resolution) -> Self {
        let width = size.width.max(1);
        let height = size.height.max(1);
        let band_top = height - (height / 5).clamp(1, height);
        let bar_width = (width / 8).max(1);

        let base = RgbaImage::from_fn(width, height, |x, y| {
            if y >= band_top {
                return BAND_COLOR;
            }
            let [r, g, b] = SMPTE_BARS[((x / bar_width) as usize).min(7)];
            Rgba([r, g, b, 255])
        });

        Self {
            base,
            band_top,
            frame: 0,
        }
    }

    fn marker_span(&self) -> (u32, u32) {
        let width = self.base.width();
        let marker_width = (width / 16).max(1);
        let travel = u64::from(width - marker_width + 1);
        let start = (self.frame * 4 % travel) as u32;
        (start, start + marker_width)
    }
}

impl FallbackSource for ColorBars {
    fn next_frame(&mut self) -> Result<Arc<RgbaImage>, SourceReadError> {
        let mut image = self.base.clone();
        let (start, end) = self.marker_span();

        for y in self.band_top..image.height() {
            for x in start..end {
                image.put_pixel(x, y, MARKER_COLOR);
            }
        }

        self.frame += 1;
        Ok(Arc::new(image))
    }

    fn reset(&mut self) {
        self.frame = 0;
    }

    fn position(&self) -> u64 {
        self.frame
    }
}

const CHECK_SIZE: u32 = 32;

/// Scrolling checkerboard with the frame number encoded as bits in the top
/// left corner.
pub struct TestPattern {
    size: Resolution,
    frame: u64,
}

impl TestPattern {
    pub fn new(size: Resolution) -> Self {
        Self {
            size: Resolution::new(size.width.max(1), size.height.max(1)),
            frame: 0,
        }
    }
}

impl FallbackSource for TestPattern {
    fn next_frame(&mut self) -> Result<Arc<RgbaImage>, SourceReadError> {
        let frame = self.frame;
        let scroll = (frame % u64::from(CHECK_SIZE * 2)) as u32;
        let counter = frame.to_le_bytes();

        let image = RgbaImage::from_fn(self.size.width, self.size.height, |x, y| {
            let value = if y < 64 && x < 256 {
                let bit = (counter[(x / 32) as usize] >> ((x % 32) / 4)) & 1;
                if bit == 1 { 255 } else { 0 }
            } else {
                let check_x = (x + scroll) / CHECK_SIZE;
                let check_y = y / CHECK_SIZE;
                if (check_x + check_y) % 2 == 0 { 255 } else { 0 }
            };
            Rgba([value, value, value, 255])
        });

        self.frame += 1;
        Ok(Arc::new(image))
    }

    fn reset(&mut self) {
        self.frame = 0;
    }

    fn position(&self) -> u64 {
        self.frame
    }
}
