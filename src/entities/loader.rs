//! Still image loader
//!
//! Decodes PNG, WebP, JPEG, GIF, TIFF and BMP through the `image` crate into
//! tightly packed RGBA8. Format is taken from the content when it can be
//! sniffed, otherwise from the extension.

use std::io::Cursor;
use std::path::Path;

use image::{DynamicImage, ImageFormat, ImageReader};
use log::debug;

use super::error::MediaError;

/// Decoded still image, `rgba.len() == width * height * 4`
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub width: usize,
    pub height: usize,
    pub rgba: Vec<u8>,
}

/// Image loader
pub struct Loader;

impl Loader {
    /// Open and decode a file from disk
    pub fn load(path: &Path) -> Result<DecodedImage, MediaError> {
        debug!("Loading image: {}", path.display());

        let reader = ImageReader::open(path)
            .map_err(|e| MediaError::Image(format!("Failed to open {}: {}", path.display(), e)))?
            .with_guessed_format()
            .map_err(|e| MediaError::Image(format!("Failed to read {}: {}", path.display(), e)))?;

        Self::decode(reader)
    }

    /// Decode an in-memory blob. `hint` supplies the extension when the
    /// content can't be sniffed.
    pub fn load_bytes(blob: &[u8], hint: &Path) -> Result<DecodedImage, MediaError> {
        debug!("Decoding image blob ({} bytes) for {}", blob.len(), hint.display());

        let mut reader = ImageReader::new(Cursor::new(blob))
            .with_guessed_format()
            .map_err(|e| MediaError::Image(format!("Failed to read blob: {}", e)))?;

        if reader.format().is_none() {
            if let Ok(format) = ImageFormat::from_path(hint) {
                reader.set_format(format);
            }
        }

        Self::decode(reader)
    }

    fn decode<R: std::io::BufRead + std::io::Seek>(
        reader: ImageReader<R>,
    ) -> Result<DecodedImage, MediaError> {
        if reader.format().is_none() {
            return Err(MediaError::Image("Unrecognized image format".to_string()));
        }

        let img = reader
            .decode()
            .map_err(|e| MediaError::Image(format!("Image decode error: {}", e)))?;

        Ok(Self::to_rgba(img))
    }

    fn to_rgba(img: DynamicImage) -> DecodedImage {
        let width = img.width() as usize;
        let height = img.height() as usize;

        // Convert to Rgba8
        let rgba = img.to_rgba8().into_raw();

        DecodedImage { width, height, rgba }
    }
}
