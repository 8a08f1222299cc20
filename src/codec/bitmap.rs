//! # Column Bitmaps
//!
//! Column-major 1-bit bitmaps as the print head consumes them. Each column
//! is `column_bytes` bytes tall; bit 7 of the first byte is the topmost dot.
//!
//! ```text
//! byte 0   byte 1        byte 71
//! 7654321076543210 ... 76543210   ← one column, 576 dots top to bottom
//! ```

use image::GrayImage;
use rayon::prelude::*;

use crate::error::{Result, SdkError};

/// Column height of the standard 576-dot head, in bytes.
pub const DEFAULT_COLUMN_BYTES: usize = 72;

/// A column-major bitmap ready for row packing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnBitmap {
    column_bytes: usize,
    data: Vec<u8>,
}

impl ColumnBitmap {
    /// Wrap raw column data. `data.len()` must be a whole number of columns.
    pub fn new(column_bytes: usize, data: Vec<u8>) -> Result<Self> {
        if column_bytes == 0 || data.len() % column_bytes != 0 {
            return Err(SdkError::InvalidParameter(format!(
                "{} bytes cannot be split into {}-byte columns",
                data.len(),
                column_bytes
            )));
        }
        Ok(Self { column_bytes, data })
    }

    /// An all-white bitmap of `width` columns.
    pub fn blank(column_bytes: usize, width: usize) -> Result<Self> {
        Self::new(column_bytes, vec![0; column_bytes * width])
    }

    /// Threshold a grayscale image into a column bitmap.
    ///
    /// Image x becomes the column index, image y the dot within the column.
    /// Pixels darker than `threshold` print. The image may be shorter than the
    /// column (the rest stays white) but not taller.
    pub fn from_luma(image: &GrayImage, column_bytes: usize, threshold: u8) -> Result<Self> {
        let dots = column_bytes * 8;
        if image.height() as usize > dots {
            return Err(SdkError::InvalidParameter(format!(
                "image is {} px tall, the head has {} dots",
                image.height(),
                dots
            )));
        }

        let mut bitmap = Self::blank(column_bytes, image.width() as usize)?;
        bitmap
            .data
            .par_chunks_mut(column_bytes)
            .enumerate()
            .for_each(|(x, column)| {
                for y in 0..image.height() {
                    if image.get_pixel(x as u32, y).0[0] < threshold {
                        let y = y as usize;
                        column[y / 8] |= 0x80 >> (y % 8);
                    }
                }
            });

        Ok(bitmap)
    }

    /// Render back to a grayscale image (black dots on white) for previews.
    pub fn to_luma(&self) -> GrayImage {
        let height = (self.column_bytes * 8) as u32;
        GrayImage::from_fn(self.width() as u32, height, |x, y| {
            if self.dot(x as usize, y as usize) {
                image::Luma([0])
            } else {
                image::Luma([255])
            }
        })
    }

    /// Number of columns.
    pub fn width(&self) -> usize {
        self.data.len() / self.column_bytes
    }

    pub fn column_bytes(&self) -> usize {
        self.column_bytes
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Bytes of column `x`, or `None` past the right edge.
    pub fn column(&self, x: usize) -> Option<&[u8]> {
        self.data.chunks_exact(self.column_bytes).nth(x)
    }

    /// Whether dot (x, y) prints. Dots outside the bitmap never print.
    pub fn dot(&self, x: usize, y: usize) -> bool {
        self.column(x)
            .and_then(|column| column.get(y / 8))
            .is_some_and(|byte| byte & (0x80 >> (y % 8)) != 0)
    }

    /// Pack into the half-width device encoding.
    pub fn pack(&self) -> Result<Vec<u8>> {
        super::compress(&self.data, self.column_bytes)
    }

    /// Expand packed data back into a bitmap `width` columns wide.
    pub fn unpack(packed: &[u8], column_bytes: usize, width: usize) -> Result<Self> {
        let data = super::decompress(packed, column_bytes, width)?;
        Self::new(column_bytes, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_from_luma_sets_top_bit_first() {
        let mut img = GrayImage::from_pixel(2, 8, Luma([255]));
        img.put_pixel(0, 0, Luma([0]));
        img.put_pixel(1, 7, Luma([10]));

        let bitmap = ColumnBitmap::from_luma(&img, 1, 128).unwrap();
        assert_eq!(bitmap.width(), 2);
        assert_eq!(bitmap.as_bytes(), &[0x80, 0x01]);
        assert!(bitmap.dot(0, 0));
        assert!(bitmap.dot(1, 7));
        assert!(!bitmap.dot(1, 0));
    }

    #[test]
    fn test_from_luma_short_image_pads_white() {
        let img = GrayImage::from_pixel(1, 3, Luma([0]));
        let bitmap = ColumnBitmap::from_luma(&img, 2, 128).unwrap();
        assert_eq!(bitmap.as_bytes(), &[0xE0, 0x00]);
    }

    #[test]
    fn test_from_luma_rejects_tall_image() {
        let img = GrayImage::new(1, 17);
        assert!(ColumnBitmap::from_luma(&img, 2, 128).is_err());
    }

    #[test]
    fn test_pack_unpack_through_bitmap() {
        let bitmap = ColumnBitmap::new(2, vec![0x80, 0x00, 0x00, 0x01, 0xFF, 0xFF]).unwrap();
        let packed = bitmap.pack().unwrap();
        assert_eq!(packed, vec![0x80, 0x01, 0xFF, 0xFF]);

        let back = ColumnBitmap::unpack(&packed, 2, 3).unwrap();
        assert_eq!(back.as_bytes(), &[0x80, 0x01, 0x80, 0x01, 0xFF, 0xFF]);
    }

    #[test]
    fn test_to_luma_dimensions() {
        let bitmap = ColumnBitmap::blank(DEFAULT_COLUMN_BYTES, 4).unwrap();
        let img = bitmap.to_luma();
        assert_eq!(img.dimensions(), (4, 576));
        assert_eq!(img.get_pixel(0, 0).0[0], 255);
    }

    #[test]
    fn test_out_of_range_reads_are_blank() {
        let bitmap = ColumnBitmap::new(1, vec![0xFF, 0xFF]).unwrap();
        assert_eq!(bitmap.column(1), Some(&[0xFF][..]));
        assert_eq!(bitmap.column(2), None);
        assert!(bitmap.dot(1, 7));
        assert!(!bitmap.dot(2, 0));
        assert!(!bitmap.dot(0, 8));
    }

    #[test]
    fn test_ragged_data_rejected() {
        assert!(ColumnBitmap::new(72, vec![0; 100]).is_err());
        assert!(ColumnBitmap::new(0, vec![]).is_err());
    }
}
