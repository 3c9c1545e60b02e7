use crate::utils::error::DetectError;
use crate::Result;
use axum::body::Bytes;
use image::{DynamicImage, GenericImageView, ImageFormat};
use ndarray::Array3;
use std::path::Path;

const ALLOWED_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Raw image bytes received from a client, not yet decoded.
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub name: String,
    pub data: Bytes,
}

pub struct ImageLoader;

impl ImageLoader {
    /// Format implied by a file name's extension, if it is one we accept.
    pub fn format_from_name(name: &str) -> Option<ImageFormat> {
        let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
        if !ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
            return None;
        }
        ImageFormat::from_extension(ext)
    }

    /// Format implied by a multipart content type.
    pub fn format_from_content_type(content_type: &str) -> Option<ImageFormat> {
        match content_type.trim().to_ascii_lowercase().as_str() {
            "image/jpeg" | "image/jpg" => Some(ImageFormat::Jpeg),
            "image/png" => Some(ImageFormat::Png),
            _ => None,
        }
    }

    /// Format of an upload, judged before its bytes are read.
    ///
    /// The file name decides when present. Otherwise the field name is tried,
    /// then the declared content type.
    pub fn check_upload(
        file_name: Option<&str>,
        field_name: Option<&str>,
        content_type: Option<&str>,
    ) -> Result<ImageFormat> {
        if let Some(file_name) = file_name.filter(|n| !n.is_empty()) {
            return Self::format_from_name(file_name).ok_or_else(|| {
                DetectError::UnsupportedFormat(format!(
                    "{} (accepted extensions: .jpg, .jpeg, .png)",
                    file_name
                ))
            });
        }

        field_name
            .and_then(Self::format_from_name)
            .or_else(|| content_type.and_then(Self::format_from_content_type))
            .ok_or_else(|| {
                DetectError::UnsupportedFormat(format!(
                    "cannot determine image type of field '{}' (content type {:?})",
                    field_name.unwrap_or("unknown"),
                    content_type
                ))
            })
    }

    /// Decode an upload after checking size and magic bytes.
    pub fn from_bytes(bytes: &[u8], max_size: usize) -> Result<DynamicImage> {
        if bytes.is_empty() {
            return Err(DetectError::InvalidInput("Empty file".to_string()));
        }
        if bytes.len() > max_size {
            return Err(DetectError::FileTooLarge(bytes.len(), max_size));
        }

        let format = Self::sniff_format(bytes)?;
        let image = image::load_from_memory_with_format(bytes, format)?;
        Self::validate_dimensions(&image)?;

        Ok(image)
    }

    pub fn from_path(path: &Path) -> Result<DynamicImage> {
        let name = path.to_string_lossy();
        if Self::format_from_name(&name).is_none() {
            return Err(DetectError::UnsupportedFormat(name.into_owned()));
        }
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes, usize::MAX)
    }

    /// The bytes must really be PNG or JPEG, whatever the name claimed.
    pub fn sniff_format(bytes: &[u8]) -> Result<ImageFormat> {
        match image::guess_format(bytes) {
            Ok(format @ (ImageFormat::Png | ImageFormat::Jpeg)) => Ok(format),
            Ok(other) => Err(DetectError::UnsupportedFormat(format!("{:?}", other))),
            Err(_) => Err(DetectError::UnsupportedFormat(
                "unrecognized image data".to_string(),
            )),
        }
    }

    pub fn validate_dimensions(image: &DynamicImage) -> Result<()> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(DetectError::InvalidInput(format!(
                "Image has no pixels: {}x{}",
                width, height
            )));
        }
        Ok(())
    }

    /// RGB image as a CHW float tensor in `[0, 1]`.
    pub fn to_tensor(image: &DynamicImage) -> Array3<f32> {
        let rgb = image.to_rgb8();
        let (width, height) = rgb.dimensions();

        let mut tensor = Array3::<f32>::zeros((3, height as usize, width as usize));
        for (x, y, pixel) in rgb.enumerate_pixels() {
            for c in 0..3 {
                tensor[[c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
            }
        }

        tensor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb, RgbImage};
    use std::io::Cursor;

    fn encode(image: &RgbImage, format: ImageFormat) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, format).unwrap();
        buf.into_inner()
    }

    #[test]
    fn accepts_only_jpeg_and_png_extensions() {
        assert_eq!(ImageLoader::format_from_name("lion.JPG"), Some(ImageFormat::Jpeg));
        assert_eq!(ImageLoader::format_from_name("lion.jpeg"), Some(ImageFormat::Jpeg));
        assert_eq!(ImageLoader::format_from_name("lion.png"), Some(ImageFormat::Png));
        assert_eq!(ImageLoader::format_from_name("lion.gif"), None);
        assert_eq!(ImageLoader::format_from_name("lion.bmp"), None);
        assert_eq!(ImageLoader::format_from_name("lion"), None);
    }

    #[test]
    fn file_name_takes_precedence_over_content_type() {
        let err = ImageLoader::check_upload(Some("notes.txt"), Some("file"), Some("image/png"));
        assert!(matches!(err, Err(DetectError::UnsupportedFormat(_))));

        let format = ImageLoader::check_upload(None, Some("file"), Some("image/png")).unwrap();
        assert_eq!(format, ImageFormat::Png);

        let format = ImageLoader::check_upload(None, Some("whiskers.jpg"), None).unwrap();
        assert_eq!(format, ImageFormat::Jpeg);

        assert!(ImageLoader::check_upload(None, Some("file"), Some("application/octet-stream")).is_err());
    }

    #[test]
    fn decodes_png_bytes() {
        let img: RgbImage = ImageBuffer::from_pixel(4, 3, Rgb([10, 20, 30]));
        let bytes = encode(&img, ImageFormat::Png);

        let decoded = ImageLoader::from_bytes(&bytes, 1024 * 1024).unwrap();
        assert_eq!(decoded.dimensions(), (4, 3));
    }

    #[test]
    fn rejects_oversized_and_foreign_payloads() {
        let img: RgbImage = ImageBuffer::from_pixel(4, 4, Rgb([0, 0, 0]));
        let bytes = encode(&img, ImageFormat::Png);

        assert!(matches!(
            ImageLoader::from_bytes(&bytes, 8),
            Err(DetectError::FileTooLarge(_, 8))
        ));
        assert!(matches!(
            ImageLoader::from_bytes(b"GIF89a........", 1024),
            Err(DetectError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            ImageLoader::from_bytes(&[], 1024),
            Err(DetectError::InvalidInput(_))
        ));
    }

    #[test]
    fn tensor_is_chw_and_normalized() {
        let mut img: RgbImage = ImageBuffer::new(2, 1);
        img.put_pixel(0, 0, Rgb([255, 0, 51]));
        img.put_pixel(1, 0, Rgb([0, 255, 0]));

        let tensor = ImageLoader::to_tensor(&DynamicImage::ImageRgb8(img));
        assert_eq!(tensor.shape(), &[3, 1, 2]);
        assert_eq!(tensor[[0, 0, 0]], 1.0);
        assert_eq!(tensor[[1, 0, 0]], 0.0);
        assert!((tensor[[2, 0, 0]] - 0.2).abs() < 1e-6);
        assert_eq!(tensor[[1, 0, 1]], 1.0);
    }
}
