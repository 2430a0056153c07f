//! Tiny 3x5 bitmap font for overlay labels (timers, counts, coordinates).

use image::GenericImage;

const GLYPH_W: u32 = 3;
const GLYPH_H: u32 = 5;

/// Rows top to bottom, bit 2 is the leftmost column.
fn glyph(c: char) -> [u8; 5] {
    match c.to_ascii_uppercase() {
        '0' => [0b111, 0b101, 0b101, 0b101, 0b111],
        '1' => [0b010, 0b110, 0b010, 0b010, 0b111],
        '2' => [0b111, 0b001, 0b111, 0b100, 0b111],
        '3' => [0b111, 0b001, 0b111, 0b001, 0b111],
        '4' => [0b101, 0b101, 0b111, 0b001, 0b001],
        '5' => [0b111, 0b100, 0b111, 0b001, 0b111],
        '6' => [0b111, 0b100, 0b111, 0b101, 0b111],
        '7' => [0b111, 0b001, 0b001, 0b001, 0b001],
        '8' => [0b111, 0b101, 0b111, 0b101, 0b111],
        '9' => [0b111, 0b101, 0b111, 0b001, 0b111],
        'A' => [0b010, 0b101, 0b111, 0b101, 0b101],
        'B' => [0b110, 0b101, 0b110, 0b101, 0b110],
        'C' => [0b011, 0b100, 0b100, 0b100, 0b011],
        'D' => [0b110, 0b101, 0b101, 0b101, 0b110],
        'E' => [0b111, 0b100, 0b110, 0b100, 0b111],
        'F' => [0b111, 0b100, 0b110, 0b100, 0b100],
        'G' => [0b011, 0b100, 0b101, 0b101, 0b011],
        'H' => [0b101, 0b101, 0b111, 0b101, 0b101],
        'I' => [0b111, 0b010, 0b010, 0b010, 0b111],
        'J' => [0b001, 0b001, 0b001, 0b101, 0b010],
        'K' => [0b101, 0b101, 0b110, 0b101, 0b101],
        'L' => [0b100, 0b100, 0b100, 0b100, 0b111],
        'M' => [0b101, 0b111, 0b111, 0b101, 0b101],
        'N' => [0b110, 0b101, 0b101, 0b101, 0b101],
        'O' => [0b010, 0b101, 0b101, 0b101, 0b010],
        'P' => [0b110, 0b101, 0b110, 0b100, 0b100],
        'Q' => [0b010, 0b101, 0b101, 0b110, 0b011],
        'R' => [0b110, 0b101, 0b110, 0b101, 0b101],
        'S' => [0b011, 0b100, 0b010, 0b001, 0b110],
        'T' => [0b111, 0b010, 0b010, 0b010, 0b010],
        'U' => [0b101, 0b101, 0b101, 0b101, 0b111],
        'V' => [0b101, 0b101, 0b101, 0b101, 0b010],
        'W' => [0b101, 0b101, 0b111, 0b111, 0b101],
        'X' => [0b101, 0b101, 0b010, 0b101, 0b101],
        'Y' => [0b101, 0b101, 0b010, 0b010, 0b010],
        'Z' => [0b111, 0b001, 0b010, 0b100, 0b111],
        ':' => [0b000, 0b010, 0b000, 0b010, 0b000],
        '.' => [0b000, 0b000, 0b000, 0b000, 0b010],
        ',' => [0b000, 0b000, 0b000, 0b010, 0b100],
        '-' => [0b000, 0b000, 0b111, 0b000, 0b000],
        '(' => [0b001, 0b010, 0b010, 0b010, 0b001],
        ')' => [0b100, 0b010, 0b010, 0b010, 0b100],
        '/' => [0b001, 0b001, 0b010, 0b100, 0b100],
        '#' => [0b101, 0b111, 0b101, 0b111, 0b101],
        _ => [0; 5],
    }
}

/// Width in pixels of `text` rendered at `scale`.
pub fn text_width(text: &str, scale: u32) -> u32 {
    let n = text.chars().count() as u32;
    if n == 0 {
        return 0;
    }
    n * (GLYPH_W + 1) * scale - scale
}

pub fn text_height(scale: u32) -> u32 {
    GLYPH_H * scale
}

/// Draw `text` with its top-left corner at (`x`, `y`). Pixels off the image are skipped.
pub fn draw_text<I: GenericImage>(image: &mut I, text: &str, x: i32, y: i32, scale: u32, color: I::Pixel) {
    let scale = scale.max(1);
    let (width, height) = image.dimensions();
    let mut pen_x = x;
    for c in text.chars() {
        let rows = glyph(c);
        for (row, bits) in rows.iter().enumerate() {
            for col in 0..GLYPH_W {
                if bits & (0b100 >> col) == 0 {
                    continue;
                }
                for dy in 0..scale {
                    for dx in 0..scale {
                        let px = pen_x + (col * scale + dx) as i32;
                        let py = y + (row as u32 * scale + dy) as i32;
                        if px >= 0 && py >= 0 && (px as u32) < width && (py as u32) < height {
                            image.put_pixel(px as u32, py as u32, color);
                        }
                    }
                }
            }
        }
        pen_x += ((GLYPH_W + 1) * scale) as i32;
    }
}

/// `MM:SS.mmm`, or `MM:SS` without milliseconds.
pub fn format_clock(seconds: f64, with_millis: bool) -> String {
    let seconds = seconds.max(0.0);
    let whole = seconds.trunc() as u64;
    let minutes = whole / 60;
    let secs = whole % 60;
    if with_millis {
        let millis = ((seconds - seconds.trunc()) * 1000.0) as u64;
        format!("{minutes:02}:{secs:02}.{millis:03}")
    } else {
        format!("{minutes:02}:{secs:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    #[test]
    fn test_draw_one() {
        let mut image = GrayImage::new(5, 7);
        draw_text(&mut image, "1", 1, 1, 1, Luma([255]));
        // vertical stroke of the "1"
        for y in 1..=5 {
            assert_eq!(image.get_pixel(2, y).0, [255]);
        }
        // bottom bar spans three columns
        assert_eq!(image.get_pixel(1, 5).0, [255]);
        assert_eq!(image.get_pixel(3, 5).0, [255]);
        assert_eq!(image.get_pixel(3, 1).0, [0]);
    }

    #[test]
    fn test_clipped_text_does_not_panic() {
        let mut image = GrayImage::new(4, 4);
        draw_text(&mut image, "88:88", -2, -3, 2, Luma([200]));
        draw_text(&mut image, "X", 3, 3, 3, Luma([200]));
    }

    #[test]
    fn test_text_metrics() {
        assert_eq!(text_width("", 2), 0);
        assert_eq!(text_width("12", 1), 7);
        assert_eq!(text_width("12", 2), 14);
        assert_eq!(text_height(3), 15);
    }

    #[test]
    fn test_format_clock() {
        assert_eq!(format_clock(0.0, true), "00:00.000");
        assert_eq!(format_clock(75.25, true), "01:15.250");
        assert_eq!(format_clock(600.9, false), "10:00");
    }
}
