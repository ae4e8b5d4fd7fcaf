use image::ImageReader;
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,

    #[error("failed to read image stream: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed image: {0}")]
    Malformed(#[from] image::ImageError),

    #[error("decoded image has no pixels ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },
}

/// Row-major RGB8 pixel grid. Width and height are always non-zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl DecodedImage {
    /// Wrap an RGB8 buffer, returning `None` if the dimensions are empty or
    /// do not match the buffer length.
    pub fn from_rgb(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)?
            .checked_mul(3)?;
        (width > 0 && height > 0 && pixels.len() == expected).then_some(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

/// Decode an encoded image (format sniffed from the bytes) into 3-channel RGB.
pub fn decode(bytes: &[u8]) -> Result<DecodedImage, DecodeError> {
    let _s = common::span_debug!("decode_image");

    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }

    let image = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .decode()?
        .into_rgb8();

    let (width, height) = image.dimensions();
    DecodedImage::from_rgb(width, height, image.into_raw())
        .ok_or(DecodeError::EmptyImage { width, height })
}
