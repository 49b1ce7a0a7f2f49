//! Owned RGB raster used as codec input.

use super::palette::Rgb;
use super::ImageError;

/// Row-major RGB bitmap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    pixels: Vec<Rgb>,
}

impl Bitmap {
    /// Create a bitmap filled with one color
    pub fn filled(width: u32, height: u32, color: Rgb) -> Self {
        Self {
            width,
            height,
            pixels: vec![color; width as usize * height as usize],
        }
    }

    /// Create a bitmap by evaluating `f(x, y)` for every pixel
    pub fn from_fn(width: u32, height: u32, mut f: impl FnMut(u32, u32) -> Rgb) -> Self {
        let mut pixels = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                pixels.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            pixels,
        }
    }

    /// Create a bitmap from packed `RGBRGB...` bytes
    pub fn from_rgb_bytes(width: u32, height: u32, bytes: &[u8]) -> Result<Self, ImageError> {
        let expected = width as usize * height as usize * 3;
        if bytes.len() != expected {
            return Err(ImageError::BufferSize {
                expected,
                actual: bytes.len(),
            });
        }
        let pixels = bytes
            .chunks_exact(3)
            .map(|px| Rgb::new(px[0], px[1], px[2]))
            .collect();
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Parse a binary PPM (`P6`, maxval 255) image
    pub fn from_ppm(data: &[u8]) -> Result<Self, ImageError> {
        let mut cursor = PpmCursor { data, pos: 0 };
        if cursor.token()? != "P6" {
            return Err(ImageError::InvalidPpm("missing P6 magic".to_string()));
        }
        let width = cursor.number()?;
        let height = cursor.number()?;
        let maxval = cursor.number()?;
        if maxval != 255 {
            return Err(ImageError::InvalidPpm(format!(
                "unsupported maxval {}",
                maxval
            )));
        }
        // Exactly one whitespace byte separates the header from the raster
        let start = cursor.pos + 1;
        let raster = data
            .get(start..)
            .ok_or_else(|| ImageError::InvalidPpm("truncated header".to_string()))?;
        let expected = width as usize * height as usize * 3;
        if raster.len() < expected {
            return Err(ImageError::BufferSize {
                expected,
                actual: raster.len(),
            });
        }
        Self::from_rgb_bytes(width, height, &raster[..expected])
    }

    /// Serialize as binary PPM
    pub fn to_ppm(&self) -> Vec<u8> {
        let mut out = format!("P6\n{} {}\n255\n", self.width, self.height).into_bytes();
        out.reserve(self.pixels.len() * 3);
        for px in &self.pixels {
            out.extend_from_slice(&[px.r, px.g, px.b]);
        }
        out
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Pixel at (x, y); `None` outside the raster
    pub fn get(&self, x: u32, y: u32) -> Option<Rgb> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels.get(self.index(x, y)).copied()
    }

    /// Overwrite the pixel at (x, y); out-of-range writes are ignored
    pub fn set(&mut self, x: u32, y: u32, color: Rgb) {
        if x >= self.width || y >= self.height {
            return;
        }
        let index = self.index(x, y);
        self.pixels[index] = color;
    }

    /// Pixels in row-major order
    pub fn pixels(&self) -> &[Rgb] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [Rgb] {
        &mut self.pixels
    }

    /// Rows of the bitmap, top to bottom
    pub fn rows(&self) -> impl Iterator<Item = &[Rgb]> {
        self.pixels.chunks(self.width.max(1) as usize)
    }

    fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }
}

struct PpmCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PpmCursor<'a> {
    fn skip_separators(&mut self) {
        while let Some(&b) = self.data.get(self.pos) {
            if b == b'#' {
                while let Some(&c) = self.data.get(self.pos) {
                    self.pos += 1;
                    if c == b'\n' {
                        break;
                    }
                }
            } else if b.is_ascii_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn token(&mut self) -> Result<&'a str, ImageError> {
        self.skip_separators();
        let start = self.pos;
        while let Some(&b) = self.data.get(self.pos) {
            if b.is_ascii_whitespace() {
                break;
            }
            self.pos += 1;
        }
        if start == self.pos {
            return Err(ImageError::InvalidPpm("truncated header".to_string()));
        }
        let data = self.data;
        std::str::from_utf8(&data[start..self.pos])
            .map_err(|_| ImageError::InvalidPpm("non-ASCII header".to_string()))
    }

    fn number(&mut self) -> Result<u32, ImageError> {
        let token = self.token()?;
        token
            .parse()
            .map_err(|_| ImageError::InvalidPpm(format!("invalid number '{}'", token)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rgb_bytes_size_check() {
        let result = Bitmap::from_rgb_bytes(2, 2, &[0u8; 11]);
        assert_eq!(
            result,
            Err(ImageError::BufferSize {
                expected: 12,
                actual: 11
            })
        );
    }

    #[test]
    fn test_get_set() {
        let mut bitmap = Bitmap::filled(4, 3, Rgb::WHITE);
        bitmap.set(3, 2, Rgb::RED);
        assert_eq!(bitmap.get(3, 2), Some(Rgb::RED));
        assert_eq!(bitmap.get(0, 0), Some(Rgb::WHITE));
        assert_eq!(bitmap.get(4, 0), None);
        bitmap.set(10, 10, Rgb::BLACK); // ignored
    }

    #[test]
    fn test_from_fn_row_major() {
        let bitmap = Bitmap::from_fn(3, 2, |x, y| Rgb::new(x as u8, y as u8, 0));
        assert_eq!(bitmap.pixels()[4], Rgb::new(1, 1, 0));
        assert_eq!(bitmap.rows().count(), 2);
    }

    #[test]
    fn test_ppm_parse() {
        let mut data = b"P6\n# comment\n2 1\n255\n".to_vec();
        data.extend_from_slice(&[255, 0, 0, 0, 0, 255]);
        let bitmap = Bitmap::from_ppm(&data).expect("valid ppm");
        assert_eq!(bitmap.width(), 2);
        assert_eq!(bitmap.height(), 1);
        assert_eq!(bitmap.get(0, 0), Some(Rgb::RED));
        assert_eq!(bitmap.get(1, 0), Some(Rgb::BLUE));
    }

    #[test]
    fn test_ppm_written_back_parses() {
        let bitmap = Bitmap::from_fn(5, 4, |x, y| Rgb::new(x as u8 * 40, y as u8 * 60, 7));
        let parsed = Bitmap::from_ppm(&bitmap.to_ppm()).expect("own output parses");
        assert_eq!(parsed, bitmap);
    }

    #[test]
    fn test_ppm_rejects_other_formats() {
        assert!(Bitmap::from_ppm(b"P3\n1 1\n255\n0 0 0").is_err());
        assert!(Bitmap::from_ppm(b"P6\n1 1\n65535\n").is_err());
        assert!(Bitmap::from_ppm(b"P6\n2 2\n255\n\x00\x00").is_err());
    }
}
