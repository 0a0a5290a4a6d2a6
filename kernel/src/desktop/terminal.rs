//! Terminal cell grid.
//!
//! A fixed character matrix with a write cursor, scrollback-free upward
//! scrolling, and the handful of control characters the shell's line
//! editor relies on: newline, carriage return, backspace, and form feed
//! (clear). Rendering paints the grid through the bitmap font; the cursor
//! cell blinks on the timer's phase.

use alloc::vec;
use alloc::vec::Vec;

use crate::graphics::{font, rgb, Color, Framebuffer, Rect};

const FG: Color = rgb(0xD8, 0xD8, 0xD0);
const BG: Color = rgb(0x10, 0x14, 0x18);
const CURSOR_COLOR: Color = rgb(0xD8, 0xD8, 0x60);

pub struct Terminal {
    cols: usize,
    rows: usize,
    cells: Vec<u8>,
    cursor_col: usize,
    cursor_row: usize,
}

impl Terminal {
    pub fn new(cols: usize, rows: usize) -> Self {
        Self {
            cols,
            rows,
            cells: vec![b' '; cols * rows],
            cursor_col: 0,
            cursor_row: 0,
        }
    }

    /// Grid size that fits a pixel area.
    pub fn size_for(width: u32, height: u32) -> (usize, usize) {
        (
            (width as usize / font::GLYPH_WIDTH).max(1),
            (height as usize / font::GLYPH_HEIGHT).max(1),
        )
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cursor(&self) -> (usize, usize) {
        (self.cursor_col, self.cursor_row)
    }

    /// Character at a cell (tests and rendering).
    pub fn cell(&self, col: usize, row: usize) -> char {
        self.cells[row * self.cols + col] as char
    }

    /// Text content of one row, right-trimmed.
    pub fn row_text(&self, row: usize) -> alloc::string::String {
        let start = row * self.cols;
        let line: alloc::string::String = self.cells[start..start + self.cols]
            .iter()
            .map(|&b| b as char)
            .collect();
        alloc::string::String::from(line.trim_end())
    }

    pub fn clear(&mut self) {
        self.cells.fill(b' ');
        self.cursor_col = 0;
        self.cursor_row = 0;
    }

    fn scroll_up(&mut self) {
        self.cells.copy_within(self.cols.., 0);
        let last = (self.rows - 1) * self.cols;
        self.cells[last..].fill(b' ');
    }

    fn newline(&mut self) {
        self.cursor_col = 0;
        self.cursor_row += 1;
        if self.cursor_row == self.rows {
            self.scroll_up();
            self.cursor_row = self.rows - 1;
        }
    }

    pub fn put_char(&mut self, ch: char) {
        match ch {
            '\n' => self.newline(),
            '\r' => self.cursor_col = 0,
            '\u{8}' => {
                // Cursor-left; the shell repaints over old content itself.
                self.cursor_col = self.cursor_col.saturating_sub(1);
            }
            '\u{c}' => self.clear(),
            '\t' => {
                let next = (self.cursor_col / 8 + 1) * 8;
                while self.cursor_col < next.min(self.cols - 1) {
                    self.put_char(' ');
                }
            }
            ch if !ch.is_control() => {
                let byte = if ch.is_ascii() { ch as u8 } else { b'?' };
                self.cells[self.cursor_row * self.cols + self.cursor_col] = byte;
                self.cursor_col += 1;
                if self.cursor_col == self.cols {
                    self.newline();
                }
            }
            _ => {}
        }
    }

    pub fn write_str(&mut self, text: &str) {
        for ch in text.chars() {
            self.put_char(ch);
        }
    }

    /// Paint the grid into `area` on the back buffer.
    pub fn render(&self, fb: &mut Framebuffer, area: Rect) {
        fb.fill_rect(area, BG);
        for row in 0..self.rows {
            for col in 0..self.cols {
                let ch = self.cell(col, row);
                if ch != ' ' {
                    font::draw_char(
                        fb,
                        area.x + (col * font::GLYPH_WIDTH) as i32,
                        area.y + (row * font::GLYPH_HEIGHT) as i32,
                        ch,
                        FG,
                        None,
                    );
                }
            }
        }
        // Blinking block cursor.
        if crate::timer::blink_phase() {
            let cx = area.x + (self.cursor_col * font::GLYPH_WIDTH) as i32;
            let cy = area.y + (self.cursor_row * font::GLYPH_HEIGHT) as i32;
            fb.fill_rect(
                Rect::new(
                    cx,
                    cy,
                    font::GLYPH_WIDTH as u32,
                    font::GLYPH_HEIGHT as u32,
                ),
                CURSOR_COLOR,
            );
        }
    }
}

impl core::fmt::Write for Terminal {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        Terminal::write_str(self, s);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_lands_at_the_cursor() {
        let mut term = Terminal::new(20, 5);
        term.write_str("hi");
        assert_eq!(term.cell(0, 0), 'h');
        assert_eq!(term.cell(1, 0), 'i');
        assert_eq!(term.cursor(), (2, 0));
    }

    #[test]
    fn newline_moves_down_and_wraps_column() {
        let mut term = Terminal::new(4, 3);
        term.write_str("ab\ncd");
        assert_eq!(term.row_text(0), "ab");
        assert_eq!(term.row_text(1), "cd");

        // Writing past the last column wraps.
        term.clear();
        term.write_str("abcdef");
        assert_eq!(term.row_text(0), "abcd");
        assert_eq!(term.row_text(1), "ef");
    }

    #[test]
    fn bottom_line_scrolls_up() {
        let mut term = Terminal::new(8, 3);
        term.write_str("one\ntwo\nthree\nfour");
        assert_eq!(term.row_text(0), "two");
        assert_eq!(term.row_text(1), "three");
        assert_eq!(term.row_text(2), "four");
    }

    #[test]
    fn carriage_return_rewrites_the_line() {
        let mut term = Terminal::new(10, 2);
        term.write_str("aaaa\rbb");
        assert_eq!(term.row_text(0), "bbaa");
        assert_eq!(term.cursor(), (2, 0));
    }

    #[test]
    fn backspace_moves_cursor_left() {
        let mut term = Terminal::new(10, 2);
        term.write_str("abc\u{8}x");
        assert_eq!(term.row_text(0), "abx");
    }

    #[test]
    fn form_feed_clears_everything() {
        let mut term = Terminal::new(10, 3);
        term.write_str("junk\nmore");
        term.put_char('\u{c}');
        assert_eq!(term.cursor(), (0, 0));
        for row in 0..3 {
            assert_eq!(term.row_text(row), "");
        }
    }

    #[test]
    fn size_for_divides_pixels_by_glyphs() {
        assert_eq!(Terminal::size_for(160, 80), (20, 10));
    }
}
