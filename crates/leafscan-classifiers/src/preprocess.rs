//! Image preprocessing into fixed-shape inference tensors
//!
//! The classifier's input layer is fixed at 128×128 RGB and its topology
//! rescales pixel values itself, so the tensors produced here stay in the
//! raw `0..=255` range. Rescaling here as well would transform pixels twice.

use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use leafscan_core::{Error, Result};
use std::path::Path;
use tracing::debug;

/// Spatial resolution the classifier was trained on
pub const IMAGE_SIZE: usize = 128;

/// Colour channels fed to the classifier
pub const CHANNELS: usize = 3;

/// A single preprocessed image, shape `(1, 128, 128, 3)`, dtype f32
#[derive(Debug, Clone)]
pub struct InferenceTensor {
    tensor: Tensor,
}

impl InferenceTensor {
    /// Wrap an NHWC tensor, checking the batch and channel dimensions
    pub fn new(tensor: Tensor) -> Result<Self> {
        match tensor.dims() {
            [1, _, _, CHANNELS] if tensor.dtype() == DType::F32 => Ok(Self { tensor }),
            dims => Err(Error::preprocess(format!(
                "expected f32 tensor of shape (1, H, W, {}), got {:?} {:?}",
                CHANNELS,
                dims,
                tensor.dtype()
            ))),
        }
    }

    /// Build a tensor from interleaved RGB values in row-major order
    pub fn from_rgb(pixels: Vec<f32>, height: usize, width: usize) -> Result<Self> {
        let tensor = Tensor::from_vec(pixels, (1, height, width, CHANNELS), &Device::Cpu)
            .map_err(|e| Error::preprocess(format!("Failed to build input tensor: {}", e)))?;
        Ok(Self { tensor })
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn shape(&self) -> &[usize] {
        self.tensor.dims()
    }

    /// Flattened pixel values in NHWC order
    pub fn to_vec(&self) -> Result<Vec<f32>> {
        self.tensor
            .flatten_all()
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(|e| Error::preprocess(format!("Failed to read tensor values: {}", e)))
    }
}

/// Converts arbitrary raster images into classifier input tensors.
///
/// Channel contract: RGB is used as is, alpha and any extra channel are
/// dropped, and single-channel images have their luminance replicated into
/// all three channels. Images with more than 8 bits per channel are scaled
/// to 8 bits first so the value range is always `0..=255`.
#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    size: u32,
    filter: FilterType,
}

impl ImagePreprocessor {
    pub fn new() -> Self {
        Self {
            size: IMAGE_SIZE as u32,
            filter: FilterType::CatmullRom,
        }
    }

    /// Decode and preprocess an image file
    pub fn preprocess(&self, path: impl AsRef<Path>) -> Result<InferenceTensor> {
        let path = path.as_ref();
        let image = ImageReader::open(path)
            .map_err(|e| Error::preprocess(format!("Failed to open {}: {}", path.display(), e)))?
            .with_guessed_format()
            .map_err(|e| Error::preprocess(format!("Failed to read {}: {}", path.display(), e)))?
            .decode()
            .map_err(|e| {
                Error::preprocess(format!("Failed to decode {}: {}", path.display(), e))
            })?;

        self.preprocess_image(&image)
    }

    /// Decode and preprocess an in-memory image
    pub fn preprocess_bytes(&self, bytes: &[u8]) -> Result<InferenceTensor> {
        let image = image::load_from_memory(bytes)
            .map_err(|e| Error::preprocess(format!("Failed to decode image: {}", e)))?;
        self.preprocess_image(&image)
    }

    /// Preprocess an already decoded image
    pub fn preprocess_image(&self, image: &DynamicImage) -> Result<InferenceTensor> {
        if image.width() == 0 || image.height() == 0 {
            return Err(Error::preprocess("image has no pixels"));
        }

        debug!(
            width = image.width(),
            height = image.height(),
            color = ?image.color(),
            "Preprocessing image"
        );

        let rgb = image.to_rgb8();
        let resized = image::imageops::resize(&rgb, self.size, self.size, self.filter);

        let pixels: Vec<f32> = resized.into_raw().into_iter().map(f32::from).collect();
        InferenceTensor::from_rgb(pixels, self.size as usize, self.size as usize)
    }
}

impl Default for ImagePreprocessor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage, Rgba, RgbaImage};

    fn pixel_at(values: &[f32], y: usize, x: usize) -> [f32; 3] {
        let base = (y * IMAGE_SIZE + x) * CHANNELS;
        [values[base], values[base + 1], values[base + 2]]
    }

    #[test]
    fn test_output_shape_and_raw_range() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(300, 200, Rgb([255, 10, 0])));
        let tensor = ImagePreprocessor::new().preprocess_image(&image).unwrap();

        assert_eq!(tensor.shape(), &[1, IMAGE_SIZE, IMAGE_SIZE, CHANNELS]);
        assert_eq!(tensor.tensor().dtype(), DType::F32);

        let values = tensor.to_vec().unwrap();
        assert_eq!(pixel_at(&values, 0, 0), [255.0, 10.0, 0.0]);
        assert_eq!(pixel_at(&values, 127, 127), [255.0, 10.0, 0.0]);
    }

    #[test]
    fn test_alpha_dropped() {
        let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(64, 64, Rgba([12, 34, 56, 0])));
        let values = ImagePreprocessor::new()
            .preprocess_image(&image)
            .unwrap()
            .to_vec()
            .unwrap();

        assert_eq!(values.len(), IMAGE_SIZE * IMAGE_SIZE * CHANNELS);
        assert_eq!(pixel_at(&values, 5, 9), [12.0, 34.0, 56.0]);
    }

    #[test]
    fn test_grayscale_replicated() {
        let image = DynamicImage::ImageLuma8(GrayImage::from_pixel(32, 48, Luma([77])));
        let values = ImagePreprocessor::new()
            .preprocess_image(&image)
            .unwrap()
            .to_vec()
            .unwrap();

        assert_eq!(pixel_at(&values, 64, 64), [77.0, 77.0, 77.0]);
    }

    #[test]
    fn test_corrupt_bytes_rejected() {
        let result = ImagePreprocessor::new().preprocess_bytes(b"definitely not a png");
        assert!(matches!(result, Err(Error::Preprocess(_))));
    }

    #[test]
    fn test_missing_file_rejected() {
        let result = ImagePreprocessor::new().preprocess("/nonexistent/leaf.jpg");
        assert!(matches!(result, Err(Error::Preprocess(_))));
    }

    #[test]
    fn test_file_with_misleading_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leaf.jpg");
        RgbImage::from_pixel(10, 10, Rgb([1, 2, 3]))
            .save_with_format(&path, image::ImageFormat::Png)
            .unwrap();

        let values = ImagePreprocessor::new().preprocess(&path).unwrap().to_vec().unwrap();
        assert_eq!(pixel_at(&values, 0, 0), [1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_inference_tensor_shape_checked() {
        let wrong = Tensor::zeros((1, 8, 8, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(InferenceTensor::new(wrong).is_err());

        let right = Tensor::zeros((1, 8, 8, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(InferenceTensor::new(right).is_ok());
    }
}
