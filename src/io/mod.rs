mod tum;

pub use tum::TumFrameSource;

use image::RgbImage;
use ndarray::Array3;

/// Converts a decoded RGB image into the `(height, width, 3)` layout the
/// pipeline uses.
pub fn rgb_into_array3(image: RgbImage) -> Array3<u8> {
    let (width, height) = image.dimensions();
    Array3::from_shape_vec((height as usize, width as usize, 3), image.into_raw())
        .expect("raw RGB buffer matches its dimensions")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb_layout() {
        let mut image = RgbImage::new(4, 2);
        image.put_pixel(3, 1, image::Rgb([7, 8, 9]));
        let array = rgb_into_array3(image);
        assert_eq!(array.shape(), &[2, 4, 3]);
        assert_eq!(array[[1, 3, 0]], 7);
        assert_eq!(array[[1, 3, 2]], 9);
    }
}
