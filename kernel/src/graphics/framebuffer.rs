//! Double-buffered framebuffer.
//!
//! All drawing lands in an owned back buffer; [`Framebuffer::present`]
//! copies the dirty bounding box to the display aperture in one pass, so
//! the visible frame is never half-painted. Dirty tracking is a running
//! bounding-box union, which matches how the compositor damages the screen
//! (a handful of window-sized rectangles per frame).

use alloc::vec;
use alloc::vec::Vec;

use super::{Color, Rect};

pub struct Framebuffer {
    width: usize,
    height: usize,
    /// Display aperture (VBE linear framebuffer, or a leaked buffer in
    /// tests). Touched only by `present`.
    front: *mut u32,
    back: Vec<u32>,
    dirty: Option<Rect>,
}

// SAFETY: the front pointer references memory that outlives the kernel and
// is only written while the compositor lock is held.
unsafe impl Send for Framebuffer {}

impl Framebuffer {
    /// # Safety
    /// `front` must point at `width * height` writable pixels that stay
    /// valid for the framebuffer's lifetime.
    pub unsafe fn new(front: *mut u32, width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            front,
            back: vec![0u32; width * height],
            dirty: None,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Whole-screen rectangle.
    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width as u32, self.height as u32)
    }

    fn clip(&self, rect: &Rect) -> Option<Rect> {
        rect.intersect(&self.bounds())
    }

    /// Extend the damage bounding box.
    pub fn mark_dirty(&mut self, rect: Rect) {
        let Some(clipped) = self.clip(&rect) else {
            return;
        };
        self.dirty = Some(match self.dirty {
            Some(d) => d.union(&clipped),
            None => clipped,
        });
    }

    /// Write one pixel into the back buffer.
    pub fn put_pixel(&mut self, x: i32, y: i32, color: Color) {
        if x < 0 || y < 0 || x >= self.width as i32 || y >= self.height as i32 {
            return;
        }
        self.back[y as usize * self.width + x as usize] = color;
        self.mark_dirty(Rect::new(x, y, 1, 1));
    }

    /// Read one back-buffer pixel (compositor save-under, tests).
    pub fn get_pixel(&self, x: i32, y: i32) -> Color {
        if x < 0 || y < 0 || x >= self.width as i32 || y >= self.height as i32 {
            return 0;
        }
        self.back[y as usize * self.width + x as usize]
    }

    /// Fill a rectangle in the back buffer.
    pub fn fill_rect(&mut self, rect: Rect, color: Color) {
        let Some(r) = self.clip(&rect) else { return };
        for y in r.y..r.bottom() {
            let row = y as usize * self.width;
            self.back[row + r.x as usize..row + r.right() as usize].fill(color);
        }
        self.mark_dirty(r);
    }

    /// Copy a pixel rectangle (row-major, `w` wide) into the back buffer.
    pub fn blit(&mut self, x: i32, y: i32, w: u32, h: u32, pixels: &[u32]) {
        let src_rect = Rect::new(x, y, w, h);
        let Some(r) = self.clip(&src_rect) else { return };
        for row in 0..r.height as i32 {
            let sy = (r.y - y + row) as usize;
            let sx = (r.x - x) as usize;
            let src_off = sy * w as usize + sx;
            let dst_off = (r.y + row) as usize * self.width + r.x as usize;
            let count = r.width as usize;
            self.back[dst_off..dst_off + count]
                .copy_from_slice(&pixels[src_off..src_off + count]);
        }
        self.mark_dirty(r);
    }

    /// Capture a back-buffer rectangle into `out` (row-major, rect.width
    /// wide). Out-of-bounds parts read as 0.
    pub fn capture(&self, rect: Rect, out: &mut Vec<u32>) {
        out.clear();
        out.resize(rect.width as usize * rect.height as usize, 0);
        let Some(r) = self.clip(&rect) else { return };
        for row in 0..r.height as i32 {
            let sy = (r.y + row) as usize;
            let dst_row = (r.y - rect.y + row) as usize;
            let dst_col = (r.x - rect.x) as usize;
            let src_off = sy * self.width + r.x as usize;
            let dst_off = dst_row * rect.width as usize + dst_col;
            let count = r.width as usize;
            out[dst_off..dst_off + count].copy_from_slice(&self.back[src_off..src_off + count]);
        }
    }

    /// Copy the dirty bounding box from back to front and clear the damage.
    pub fn present(&mut self) {
        let Some(dirty) = self.dirty.take() else {
            return;
        };
        for y in dirty.y..dirty.bottom() {
            let off = y as usize * self.width + dirty.x as usize;
            let count = dirty.width as usize;
            // SAFETY: `front` covers width*height pixels per the constructor
            // contract, and `dirty` is clipped to the screen bounds.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    self.back.as_ptr().add(off),
                    self.front.add(off),
                    count,
                );
            }
        }
    }

    /// Force a full-frame copy (used once after boot).
    pub fn present_all(&mut self) {
        self.dirty = Some(self.bounds());
        self.present();
    }

    /// Current damage, if any (tests, diagnostics).
    pub fn dirty_bounds(&self) -> Option<Rect> {
        self.dirty
    }

    /// Read a front-buffer pixel (tests verify presentation).
    pub fn front_pixel(&self, x: i32, y: i32) -> Color {
        if x < 0 || y < 0 || x >= self.width as i32 || y >= self.height as i32 {
            return 0;
        }
        // SAFETY: bounds-checked index into the front aperture.
        unsafe { *self.front.add(y as usize * self.width + x as usize) }
    }
}

/// Allocate a leaked front buffer for hosted tests and early bring-up.
pub fn leaked_front_buffer(width: usize, height: usize) -> *mut u32 {
    Vec::leak(vec![0u32; width * height]).as_mut_ptr()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fb(width: usize, height: usize) -> Framebuffer {
        let front = leaked_front_buffer(width, height);
        // SAFETY: leaked buffer of exactly width*height pixels.
        unsafe { Framebuffer::new(front, width, height) }
    }

    #[test]
    fn drawing_stays_in_back_until_present() {
        let mut fb = fb(32, 32);
        fb.fill_rect(Rect::new(0, 0, 4, 4), 0xFF0000);
        assert_eq!(fb.get_pixel(0, 0), 0xFF0000);
        assert_eq!(fb.front_pixel(0, 0), 0);
        fb.present();
        assert_eq!(fb.front_pixel(0, 0), 0xFF0000);
    }

    #[test]
    fn present_clears_damage() {
        let mut fb = fb(32, 32);
        fb.put_pixel(3, 3, 1);
        assert!(fb.dirty_bounds().is_some());
        fb.present();
        assert!(fb.dirty_bounds().is_none());
    }

    #[test]
    fn dirty_bounds_union_covers_all_damage() {
        let mut fb = fb(64, 64);
        fb.put_pixel(1, 1, 1);
        fb.put_pixel(50, 40, 1);
        let d = fb.dirty_bounds().unwrap();
        assert!(d.contains(1, 1));
        assert!(d.contains(50, 40));
    }

    #[test]
    fn fill_rect_clips_to_screen() {
        let mut fb = fb(8, 8);
        fb.fill_rect(Rect::new(-4, -4, 100, 100), 7);
        assert_eq!(fb.get_pixel(0, 0), 7);
        assert_eq!(fb.get_pixel(7, 7), 7);
    }

    #[test]
    fn blit_and_capture_round_trip() {
        let mut fb = fb(16, 16);
        let tile: Vec<u32> = (0..16).collect();
        fb.blit(4, 4, 4, 4, &tile);
        let mut out = Vec::new();
        fb.capture(Rect::new(4, 4, 4, 4), &mut out);
        assert_eq!(out, tile);
    }

    #[test]
    fn capture_pads_out_of_bounds_with_zero() {
        let mut fb = fb(8, 8);
        fb.fill_rect(Rect::new(0, 0, 8, 8), 9);
        let mut out = Vec::new();
        fb.capture(Rect::new(6, 6, 4, 4), &mut out);
        assert_eq!(out.len(), 16);
        assert_eq!(out[0], 9); // (6,6)
        assert_eq!(out[15], 0); // (9,9) off-screen
    }

    #[test]
    fn present_only_copies_dirty_box() {
        let mut fb = fb(16, 16);
        fb.fill_rect(Rect::new(0, 0, 16, 16), 5);
        fb.present();
        // Damage a single pixel; scribble the back elsewhere via direct
        // write without marking (simulating stale content is not possible
        // through the API, so just verify the dirty box shrinks).
        fb.put_pixel(2, 2, 6);
        let d = fb.dirty_bounds().unwrap();
        assert_eq!((d.width, d.height), (1, 1));
        fb.present();
        assert_eq!(fb.front_pixel(2, 2), 6);
    }
}
