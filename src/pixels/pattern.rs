//! Diagnostic test pattern.

use crate::pixels::{Surface, BYTES_PER_PIXEL};

/// Width of the red frame around the pattern.
const BORDER: u32 = 3;

/// Horizontal grid line spacing.
const GRID_X: u32 = 64;

/// Vertical grid line spacing.
const GRID_Y: u32 = 32;

/// Fill a surface with the animated test pattern for `frame`.
pub fn fill(surface: &mut Surface<'_>, frame: u64) {
    let phase = (frame.wrapping_mul(3) & 0xFF) as u32;
    let (width, height) = (surface.width(), surface.height());
    let format = surface.format();

    for y in 0..height {
        let row = surface.row_mut(y);
        for (x, dst) in (0..width).zip(row.chunks_exact_mut(BYTES_PER_PIXEL)) {
            let (r, g, b) = if x < BORDER
                || y < BORDER
                || x + BORDER >= width
                || y + BORDER >= height
            {
                (255, 0, 0)
            } else if x % GRID_X == 0 || y % GRID_Y == 0 {
                (255, 255, 255)
            } else {
                ((x + phase) as u8, (y * 2 + phase) as u8, ((x ^ y) + phase) as u8)
            };

            dst.copy_from_slice(&format.encode(r, g, b));
        }
    }
}
