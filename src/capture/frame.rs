use std::fs;
use std::path::Path;

use image::{ImageFormat, RgbaImage, imageops};

use crate::capture::error::{CaptureError, Result};
use crate::capture::geometry::CropRegion;

/// One frame pulled from a capture source.
#[derive(Debug)]
pub struct CapturedFrame {
    pub width: u32,
    pub height: u32,
    image: RgbaImage,
}

/// A frame together with the logical position of its top-left corner.
#[derive(Debug)]
pub struct FrameCapture {
    pub frame: CapturedFrame,
    pub origin_x: i32,
    pub origin_y: i32,
}

impl CapturedFrame {
    pub fn from_rgba(image: RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            image,
        }
    }

    /// Decodes an image file written by a capture tool.
    pub fn load(path: &Path) -> Result<Self> {
        let image = image::open(path)?;
        Ok(Self::from_rgba(image.to_rgba8()))
    }

    /// Consumes the frame and returns only the pixels inside `region`.
    pub fn into_cropped(self, region: CropRegion) -> Result<RgbaImage> {
        if region.is_empty()
            || region.x + region.width > self.width
            || region.y + region.height > self.height
        {
            return Err(CaptureError::EmptyCrop);
        }

        Ok(imageops::crop_imm(&self.image, region.x, region.y, region.width, region.height).to_image())
    }
}

pub fn save_png(image: &RgbaImage, path: &Path) -> Result<()> {
    image.save_with_format(path, ImageFormat::Png)?;
    verify_image(path)
}

/// A screenshot counts as saved only if it can be read back as an image.
pub fn verify_image(path: &Path) -> Result<()> {
    verify_nonempty(path)?;
    image::open(path).map_err(|_| CaptureError::NoOutput(path.to_path_buf()))?;
    Ok(())
}

pub fn verify_nonempty(path: &Path) -> Result<()> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(()),
        _ => Err(CaptureError::NoOutput(path.to_path_buf())),
    }
}
