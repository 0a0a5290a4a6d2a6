//! Mouse cursor with save-under.
//!
//! The cursor is drawn last, straight into the back buffer. Before drawing,
//! the pixels underneath are captured; on the next frame they are restored
//! before anything else paints, so the cursor never leaves trails.

use alloc::vec::Vec;

use super::{rgb, Framebuffer, Rect};

pub const CURSOR_WIDTH: usize = 10;
pub const CURSOR_HEIGHT: usize = 16;

/// Arrow shape: 'X' = black outline, 'o' = white fill, ' ' = transparent.
static SHAPE: [&str; CURSOR_HEIGHT] = [
    "X         ",
    "XX        ",
    "XoX       ",
    "XooX      ",
    "XoooX     ",
    "XooooX    ",
    "XoooooX   ",
    "XooooooX  ",
    "XoooooooX ",
    "XooooooooX",
    "XooooooXXX",
    "XooXoooX  ",
    "XoX XoooX ",
    "XX  XoooX ",
    "X    XooX ",
    "      XX  ",
];

pub struct Cursor {
    saved: Vec<u32>,
    saved_rect: Option<Rect>,
}

impl Cursor {
    pub const fn new() -> Self {
        Self {
            saved: Vec::new(),
            saved_rect: None,
        }
    }

    /// Put back whatever the cursor covered last frame.
    pub fn restore_under(&mut self, fb: &mut Framebuffer) {
        if let Some(rect) = self.saved_rect.take() {
            fb.blit(rect.x, rect.y, rect.width, rect.height, &self.saved);
        }
    }

    /// Capture the pixels under `(x, y)` and draw the arrow on top.
    pub fn draw(&mut self, fb: &mut Framebuffer, x: i32, y: i32) {
        let rect = Rect::new(x, y, CURSOR_WIDTH as u32, CURSOR_HEIGHT as u32);
        fb.capture(rect, &mut self.saved);
        self.saved_rect = Some(rect);

        let outline = rgb(0, 0, 0);
        let fill = rgb(255, 255, 255);
        for (row, line) in SHAPE.iter().enumerate() {
            for (col, ch) in line.bytes().enumerate() {
                match ch {
                    b'X' => fb.put_pixel(x + col as i32, y + row as i32, outline),
                    b'o' => fb.put_pixel(x + col as i32, y + row as i32, fill),
                    _ => {}
                }
            }
        }
    }
}

impl Default for Cursor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphics::framebuffer::leaked_front_buffer;

    fn fb(w: usize, h: usize) -> Framebuffer {
        let front = leaked_front_buffer(w, h);
        // SAFETY: leaked buffer of w*h pixels.
        unsafe { Framebuffer::new(front, w, h) }
    }

    #[test]
    fn restore_after_draw_leaves_screen_unchanged() {
        let mut fb = fb(64, 64);
        fb.fill_rect(Rect::new(0, 0, 64, 64), 0x336699);
        let mut cursor = Cursor::new();

        cursor.draw(&mut fb, 20, 20);
        assert_ne!(fb.get_pixel(20, 20), 0x336699); // outline drawn

        cursor.restore_under(&mut fb);
        for y in 18..40 {
            for x in 18..32 {
                assert_eq!(fb.get_pixel(x, y), 0x336699);
            }
        }
    }

    #[test]
    fn draw_near_edge_clips_without_panic() {
        let mut fb = fb(32, 32);
        let mut cursor = Cursor::new();
        cursor.draw(&mut fb, 28, 28);
        cursor.restore_under(&mut fb);
        cursor.draw(&mut fb, -4, -4);
        cursor.restore_under(&mut fb);
    }

    #[test]
    fn moving_cursor_restores_old_position() {
        let mut fb = fb(64, 64);
        fb.fill_rect(Rect::new(0, 0, 64, 64), 0x101010);
        let mut cursor = Cursor::new();

        cursor.draw(&mut fb, 5, 5);
        cursor.restore_under(&mut fb);
        cursor.draw(&mut fb, 40, 40);

        // Old location is clean again.
        assert_eq!(fb.get_pixel(5, 5), 0x101010);
        // New location has the outline.
        assert_eq!(fb.get_pixel(40, 40), rgb(0, 0, 0));
    }
}
