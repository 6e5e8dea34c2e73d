//! The texture-ingestion contract `AddTexture` accepts (spec §3.1): the
//! embedder supplies already-decoded pixel data, never a file path. An impl
//! is provided for the `image` crate's `DynamicImage`; embedders needing
//! another decoder wrap it in a newtype to avoid the orphan rule.

pub trait ImageData {
  /// Returns r8g8b8a8 32-bit (4 byte) color array of pixels.
  fn into_rgba_32(&self) -> Vec<u8>;

  /// Returns (width, height) of the image.
  fn dimensions(&self) -> (u32, u32);
}

impl ImageData for image::DynamicImage {
  fn into_rgba_32(&self) -> Vec<u8> {
    self.to_rgba().into_vec()
  }

  fn dimensions(&self) -> (u32, u32) {
    match self {
      image::DynamicImage::ImageBgr8(img) => img.dimensions(),
      image::DynamicImage::ImageLuma8(img) => img.dimensions(),
      image::DynamicImage::ImageLumaA8(img) => img.dimensions(),
      image::DynamicImage::ImageRgb8(img) => img.dimensions(),
      image::DynamicImage::ImageRgba8(img) => img.dimensions(),
      image::DynamicImage::ImageBgra8(img) => img.dimensions(),
      image::DynamicImage::ImageLuma16(img) => img.dimensions(),
      image::DynamicImage::ImageLumaA16(img) => img.dimensions(),
      image::DynamicImage::ImageRgb16(img) => img.dimensions(),
      image::DynamicImage::ImageRgba16(img) => img.dimensions(),
    }
  }
}

/// Image data representing a single solid color, useful for placeholder or
/// default textures (missing-texture magenta, 1x1 white, etc).
pub struct Monocolor {
  inner: [u8; 4],
}

impl Monocolor {
  pub fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
    Monocolor { inner: [r, g, b, a] }
  }

  pub fn clear() -> Self {
    Self::new(0, 0, 0, 0)
  }
}

impl ImageData for Monocolor {
  fn into_rgba_32(&self) -> Vec<u8> {
    self.inner.to_vec()
  }

  fn dimensions(&self) -> (u32, u32) {
    (1, 1)
  }
}
