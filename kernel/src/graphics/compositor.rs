//! Window compositor.
//!
//! Owns the framebuffer, the Z-ordered window list, and input routing. One
//! [`Compositor::compose`] call repaints exactly what changed: background
//! when the layout shifted, dirty windows back-to-front, a dragged window's
//! cached pixels instead of its redraw callback, then the cursor with
//! save-under, and finally a single dirty-rect copy to the display.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;

use bitflags::bitflags;

use super::cursor::Cursor;
use super::{font, rgb, Color, Framebuffer, Rect};
use crate::drivers::keyboard::KeyEvent;
use crate::drivers::mouse::MouseSnapshot;

/// Title bar height in pixels.
pub const TITLE_BAR_HEIGHT: u32 = 20;
/// Window border thickness.
pub const BORDER: u32 = 1;
/// Close button square, right-aligned in the title bar.
pub const CLOSE_SIZE: u32 = 14;
/// Taskbar height along the bottom edge.
pub const TASKBAR_HEIGHT: u32 = 24;

/// Value content caches are flooded with on destroy; any appearance on
/// screen means a stale cache was read.
pub const CACHE_POISON: u32 = 0xDEAD_BEEF;

const BACKGROUND: Color = rgb(0x2E, 0x52, 0x66);
const TITLE_FOCUSED: Color = rgb(0x2F, 0x6F, 0xAB);
const TITLE_UNFOCUSED: Color = rgb(0x55, 0x5A, 0x60);
const WINDOW_BODY: Color = rgb(0xE8, 0xE8, 0xE0);
const BORDER_COLOR: Color = rgb(0x10, 0x10, 0x10);
const CLOSE_COLOR: Color = rgb(0xC0, 0x3A, 0x2A);
const TASKBAR_COLOR: Color = rgb(0x1A, 0x1A, 0x22);
const TEXT_COLOR: Color = rgb(0xFF, 0xFF, 0xFF);

bitflags! {
    /// Per-window state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WindowFlags: u32 {
        const VISIBLE  = 1 << 0;
        const FOCUSED  = 1 << 1;
        const DIRTY    = 1 << 2;
        const DRAGGING = 1 << 3;
        const RESIZING = 1 << 4;
    }
}

pub type WindowId = u32;

/// Paints the window's content region. Receives the window (for geometry
/// and per-window state) and the framebuffer to draw into.
pub type RedrawFn = fn(&mut Window, &mut Framebuffer);

/// Invoked right before a window is destroyed.
pub type CloseFn = fn(&mut Window);

const KEY_QUEUE_CAP: usize = 64;

pub struct Window {
    pub id: WindowId,
    pub owner_pid: u32,
    pub x: i32,
    pub y: i32,
    pub prev_x: i32,
    pub prev_y: i32,
    /// Content area size (frame adds border + title bar).
    pub width: u32,
    pub height: u32,
    pub title: String,
    pub flags: WindowFlags,
    pub redraw: Option<RedrawFn>,
    pub on_close: Option<CloseFn>,
    key_queue: VecDeque<KeyEvent>,
    content_cache: Option<Vec<u32>>,
}

impl Window {
    /// Full frame: border + title bar + content.
    pub fn frame_rect(&self) -> Rect {
        Rect::new(
            self.x,
            self.y,
            self.width + 2 * BORDER,
            self.height + TITLE_BAR_HEIGHT + 2 * BORDER,
        )
    }

    /// Interior the owner draws into.
    pub fn content_rect(&self) -> Rect {
        Rect::new(
            self.x + BORDER as i32,
            self.y + (BORDER + TITLE_BAR_HEIGHT) as i32,
            self.width,
            self.height,
        )
    }

    pub fn title_bar_rect(&self) -> Rect {
        Rect::new(
            self.x + BORDER as i32,
            self.y + BORDER as i32,
            self.width,
            TITLE_BAR_HEIGHT,
        )
    }

    pub fn close_button_rect(&self) -> Rect {
        let bar = self.title_bar_rect();
        Rect::new(
            bar.right() - CLOSE_SIZE as i32 - 3,
            bar.y + 3,
            CLOSE_SIZE,
            CLOSE_SIZE,
        )
    }

    pub fn is_focused(&self) -> bool {
        self.flags.contains(WindowFlags::FOCUSED)
    }

    /// Queue a key for this window; oldest events drop on overflow.
    pub fn push_key(&mut self, event: KeyEvent) {
        if self.key_queue.len() == KEY_QUEUE_CAP {
            self.key_queue.pop_front();
        }
        self.key_queue.push_back(event);
    }

    pub fn pop_key(&mut self) -> Option<KeyEvent> {
        self.key_queue.pop_front()
    }
}

/// What a screen coordinate lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitSurface {
    CloseButton(WindowId),
    TitleBar(WindowId),
    Interior(WindowId),
    Taskbar,
    Background,
}

struct DragState {
    id: WindowId,
    grab_dx: i32,
    grab_dy: i32,
}

pub struct Compositor {
    fb: Framebuffer,
    /// Front-to-back Z order: index 0 is topmost.
    windows: Vec<Window>,
    next_id: WindowId,
    /// Set when geometry/Z/creation/destruction changed; the desktop loop
    /// resets it after compositing.
    layout_changed: bool,
    cursor: Cursor,
    cursor_pos: (i32, i32),
    drag: Option<DragState>,
}

impl Compositor {
    pub fn new(fb: Framebuffer) -> Self {
        let center = (fb.width() as i32 / 2, fb.height() as i32 / 2);
        Self {
            fb,
            windows: Vec::new(),
            next_id: 1,
            layout_changed: true,
            cursor: Cursor::new(),
            cursor_pos: center,
            drag: None,
        }
    }

    pub fn framebuffer(&mut self) -> &mut Framebuffer {
        &mut self.fb
    }

    pub fn screen_bounds(&self) -> Rect {
        self.fb.bounds()
    }

    // -- window list ------------------------------------------------------

    pub fn create_window(
        &mut self,
        title: &str,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        owner_pid: u32,
        redraw: Option<RedrawFn>,
        on_close: Option<CloseFn>,
    ) -> WindowId {
        let id = self.next_id;
        self.next_id += 1;

        for w in self.windows.iter_mut() {
            w.flags.remove(WindowFlags::FOCUSED);
        }
        let window = Window {
            id,
            owner_pid,
            x,
            y,
            prev_x: x,
            prev_y: y,
            width,
            height,
            title: String::from(title),
            flags: WindowFlags::VISIBLE | WindowFlags::FOCUSED | WindowFlags::DIRTY,
            redraw,
            on_close,
            key_queue: VecDeque::new(),
            content_cache: None,
        };
        self.windows.insert(0, window);
        self.layout_changed = true;
        id
    }

    /// Destroy a window: close callback, cache poisoned and dropped, focus
    /// handed to the next frontmost survivor.
    pub fn destroy_window(&mut self, id: WindowId) {
        let Some(pos) = self.windows.iter().position(|w| w.id == id) else {
            return;
        };
        let mut window = self.windows.remove(pos);
        if let Some(on_close) = window.on_close {
            on_close(&mut window);
        }
        if let Some(cache) = window.content_cache.as_mut() {
            cache.fill(CACHE_POISON);
        }
        window.content_cache = None;

        if self.drag.as_ref().is_some_and(|d| d.id == id) {
            self.drag = None;
        }
        if window.is_focused() {
            if let Some(front) = self.windows.first_mut() {
                front.flags.insert(WindowFlags::FOCUSED);
            }
        }
        self.layout_changed = true;
    }

    /// Bring `id` to the front and focus it.
    pub fn focus_window(&mut self, id: WindowId) {
        let Some(pos) = self.windows.iter().position(|w| w.id == id) else {
            return;
        };
        let mut window = self.windows.remove(pos);
        for w in self.windows.iter_mut() {
            w.flags.remove(WindowFlags::FOCUSED);
        }
        window.flags.insert(WindowFlags::FOCUSED | WindowFlags::DIRTY);
        self.windows.insert(0, window);
        self.layout_changed = true;
    }

    pub fn window_mut(&mut self, id: WindowId) -> Option<&mut Window> {
        self.windows.iter_mut().find(|w| w.id == id)
    }

    pub fn window(&self, id: WindowId) -> Option<&Window> {
        self.windows.iter().find(|w| w.id == id)
    }

    pub fn focused_window(&self) -> Option<WindowId> {
        self.windows.iter().find(|w| w.is_focused()).map(|w| w.id)
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    /// Titles front-to-back, for the taskbar and `windows` builtin.
    pub fn titles(&self) -> Vec<(WindowId, String)> {
        self.windows
            .iter()
            .map(|w| (w.id, w.title.clone()))
            .collect()
    }

    pub fn mark_dirty(&mut self, id: WindowId) {
        if let Some(w) = self.window_mut(id) {
            w.flags.insert(WindowFlags::DIRTY);
        }
    }

    pub fn layout_changed(&self) -> bool {
        self.layout_changed
    }

    /// Reset the layout flag; the desktop loop calls this after a
    /// composite pass.
    pub fn clear_layout_changed(&mut self) {
        self.layout_changed = false;
    }

    // -- input ------------------------------------------------------------

    /// Hit test front-to-back.
    pub fn hit_test(&self, x: i32, y: i32) -> HitSurface {
        for w in &self.windows {
            if !w.flags.contains(WindowFlags::VISIBLE) {
                continue;
            }
            if w.close_button_rect().contains(x, y) {
                return HitSurface::CloseButton(w.id);
            }
            if w.title_bar_rect().contains(x, y) {
                return HitSurface::TitleBar(w.id);
            }
            if w.frame_rect().contains(x, y) {
                return HitSurface::Interior(w.id);
            }
        }
        let screen = self.fb.bounds();
        if y >= screen.bottom() - TASKBAR_HEIGHT as i32 {
            return HitSurface::Taskbar;
        }
        HitSurface::Background
    }

    /// Route a mouse snapshot: drag handling, focus, close.
    pub fn handle_mouse(&mut self, snap: MouseSnapshot) {
        self.cursor_pos = (snap.x, snap.y);

        if snap.left_pressed() {
            match self.hit_test(snap.x, snap.y) {
                HitSurface::CloseButton(id) => self.destroy_window(id),
                HitSurface::TitleBar(id) => {
                    self.focus_window(id);
                    let grab = self.window_mut(id).map(|w| {
                        w.flags.insert(WindowFlags::DRAGGING);
                        (snap.x - w.x, snap.y - w.y)
                    });
                    if let Some((grab_dx, grab_dy)) = grab {
                        self.drag = Some(DragState {
                            id,
                            grab_dx,
                            grab_dy,
                        });
                        self.capture_drag_cache(id);
                    }
                }
                HitSurface::Interior(id) => self.focus_window(id),
                HitSurface::Taskbar | HitSurface::Background => {}
            }
        }

        if snap.left_held() {
            let drag = self.drag.as_ref().map(|d| (d.id, d.grab_dx, d.grab_dy));
            if let Some((id, grab_dx, grab_dy)) = drag {
                let nx = snap.x - grab_dx;
                let ny = snap.y - grab_dy;
                let mut moved = false;
                if let Some(w) = self.window_mut(id) {
                    if (nx, ny) != (w.x, w.y) {
                        w.prev_x = w.x;
                        w.prev_y = w.y;
                        w.x = nx;
                        w.y = ny;
                        moved = true;
                    }
                }
                if moved {
                    self.layout_changed = true;
                }
            }
        }

        if snap.left_released() {
            if let Some(drag) = self.drag.take() {
                if let Some(w) = self.window_mut(drag.id) {
                    w.flags.remove(WindowFlags::DRAGGING);
                    w.flags.insert(WindowFlags::DIRTY);
                    w.content_cache = None;
                }
                self.layout_changed = true;
            }
        }
    }

    /// Deliver a key event to the focused window's queue.
    pub fn route_key(&mut self, event: KeyEvent) {
        if let Some(w) = self.windows.iter_mut().find(|w| w.is_focused()) {
            w.push_key(event);
        }
    }

    /// Pop a queued key from one window.
    pub fn pop_key(&mut self, id: WindowId) -> Option<KeyEvent> {
        self.window_mut(id).and_then(|w| w.pop_key())
    }

    /// Snapshot the window's full frame so dragging can blit instead of
    /// re-rendering.
    fn capture_drag_cache(&mut self, id: WindowId) {
        // Repaint first so the cache holds current content, and lift the
        // cursor off so its pixels do not get baked in.
        self.compose();
        self.cursor.restore_under(&mut self.fb);
        let Some(pos) = self.windows.iter().position(|w| w.id == id) else {
            return;
        };
        let rect = self.windows[pos].frame_rect();
        let mut cache = Vec::new();
        self.fb.capture(rect, &mut cache);
        self.windows[pos].content_cache = Some(cache);
    }

    // -- painting ---------------------------------------------------------

    fn paint_decorations(fb: &mut Framebuffer, w: &Window) {
        let frame = w.frame_rect();
        fb.fill_rect(frame, BORDER_COLOR);

        let bar_color = if w.is_focused() {
            TITLE_FOCUSED
        } else {
            TITLE_UNFOCUSED
        };
        fb.fill_rect(w.title_bar_rect(), bar_color);

        let bar = w.title_bar_rect();
        let text_y = bar.y + (TITLE_BAR_HEIGHT as i32 - font::GLYPH_HEIGHT as i32) / 2;
        font::draw_text(fb, bar.x + 6, text_y, &w.title, TEXT_COLOR, None);

        let close = w.close_button_rect();
        fb.fill_rect(close, CLOSE_COLOR);
        font::draw_char(
            fb,
            close.x + (CLOSE_SIZE as i32 - font::GLYPH_WIDTH as i32) / 2,
            close.y + (CLOSE_SIZE as i32 - font::GLYPH_HEIGHT as i32) / 2,
            'x',
            TEXT_COLOR,
            None,
        );

        fb.fill_rect(w.content_rect(), WINDOW_BODY);
    }

    fn paint_taskbar(fb: &mut Framebuffer, windows: &[Window]) {
        let screen = fb.bounds();
        let bar = Rect::new(
            0,
            screen.bottom() - TASKBAR_HEIGHT as i32,
            screen.width,
            TASKBAR_HEIGHT,
        );
        fb.fill_rect(bar, TASKBAR_COLOR);

        let mut x = 8;
        let text_y = bar.y + (TASKBAR_HEIGHT as i32 - font::GLYPH_HEIGHT as i32) / 2;
        for w in windows.iter().rev() {
            let label_width = font::measure(&w.title) as i32 + 12;
            if x + label_width >= screen.width as i32 {
                break;
            }
            let color = if w.is_focused() {
                TITLE_FOCUSED
            } else {
                TASKBAR_COLOR
            };
            fb.fill_rect(
                Rect::new(x - 4, bar.y + 2, label_width as u32, TASKBAR_HEIGHT - 4),
                color,
            );
            font::draw_text(fb, x, text_y, &w.title, TEXT_COLOR, None);
            x += label_width + 8;
        }
    }

    /// The composition pass. See the module docs for the exact policy.
    pub fn compose(&mut self) {
        let fb = &mut self.fb;
        let windows = &mut self.windows;

        // (0) cursor comes off first so window painting cannot trap stale
        // save-under pixels.
        self.cursor.restore_under(fb);

        // (1) background when the layout changed.
        if self.layout_changed {
            fb.fill_rect(fb.bounds(), BACKGROUND);
            Self::paint_taskbar(fb, windows);
        }

        // (2)/(3) windows, back to front.
        let layout_changed = self.layout_changed;
        for w in windows.iter_mut().rev() {
            if !w.flags.contains(WindowFlags::VISIBLE) {
                continue;
            }
            let dragging = w.flags.contains(WindowFlags::DRAGGING);
            if dragging {
                if let Some(cache) = w.content_cache.as_ref() {
                    let frame = w.frame_rect();
                    fb.blit(frame.x, frame.y, frame.width, frame.height, cache);
                    continue;
                }
            }
            if w.flags.contains(WindowFlags::DIRTY) || layout_changed {
                Self::paint_decorations(fb, w);
                if let Some(redraw) = w.redraw {
                    redraw(w, fb);
                }
                w.flags.remove(WindowFlags::DIRTY);
            }
        }

        // (4) cursor back on top.
        let (cx, cy) = self.cursor_pos;
        self.cursor.draw(fb, cx, cy);

        // (5) publish the dirty bounding box.
        fb.present();
    }
}

// ---------------------------------------------------------------------------
// Kernel-global instance
// ---------------------------------------------------------------------------

use crate::sync::{GlobalState, IrqMutex};

static COMPOSITOR: GlobalState<IrqMutex<Compositor>> = GlobalState::new();

/// Install the compositor over the boot framebuffer.
pub fn init(fb: Framebuffer) {
    let width = fb.width() as i32;
    let height = fb.height() as i32;
    if COMPOSITOR.init(IrqMutex::new(Compositor::new(fb))).is_ok() {
        crate::drivers::mouse::set_bounds(width, height);
        log::info!("compositor: {}x{} ready", width, height);
    }
}

/// Run `f` against the compositor. Returns `None` before init.
pub fn with_compositor<R>(f: impl FnOnce(&mut Compositor) -> R) -> Option<R> {
    COMPOSITOR.with(|c| {
        let mut guard = c.lock();
        f(&mut guard)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphics::framebuffer::leaked_front_buffer;

    fn compositor(w: usize, h: usize) -> Compositor {
        let front = leaked_front_buffer(w, h);
        // SAFETY: leaked buffer of w*h pixels.
        let fb = unsafe { Framebuffer::new(front, w, h) };
        Compositor::new(fb)
    }

    fn plain_window(c: &mut Compositor, title: &str, x: i32, y: i32) -> WindowId {
        c.create_window(title, x, y, 120, 80, 0, None, None)
    }

    #[test]
    fn newest_window_is_front_and_focused() {
        let mut c = compositor(320, 240);
        let a = plain_window(&mut c, "a", 10, 10);
        let b = plain_window(&mut c, "b", 30, 30);
        assert_eq!(c.focused_window(), Some(b));
        assert!(!c.window(a).unwrap().is_focused());
        assert_eq!(c.titles()[0].0, b);
    }

    #[test]
    fn focus_moves_window_to_front() {
        let mut c = compositor(320, 240);
        let a = plain_window(&mut c, "a", 10, 10);
        let _b = plain_window(&mut c, "b", 30, 30);
        c.focus_window(a);
        assert_eq!(c.focused_window(), Some(a));
        assert_eq!(c.titles()[0].0, a);
        // Exactly one focused window, always.
        let focused = c.titles().iter().filter(|(id, _)| c.window(*id).unwrap().is_focused()).count();
        assert_eq!(focused, 1);
    }

    #[test]
    fn destroy_hands_focus_to_next_front() {
        let mut c = compositor(320, 240);
        let a = plain_window(&mut c, "a", 10, 10);
        let b = plain_window(&mut c, "b", 30, 30);
        c.destroy_window(b);
        assert_eq!(c.focused_window(), Some(a));
        assert_eq!(c.window_count(), 1);
    }

    #[test]
    fn hit_test_orders_surfaces() {
        let mut c = compositor(320, 240);
        let id = plain_window(&mut c, "w", 50, 50);
        let w = c.window(id).unwrap();
        let bar = w.title_bar_rect();
        let close = w.close_button_rect();
        let content = w.content_rect();

        assert_eq!(c.hit_test(close.x + 2, close.y + 2), HitSurface::CloseButton(id));
        assert_eq!(c.hit_test(bar.x + 2, bar.y + 2), HitSurface::TitleBar(id));
        assert_eq!(
            c.hit_test(content.x + 5, content.y + 5),
            HitSurface::Interior(id)
        );
        assert_eq!(c.hit_test(5, 5), HitSurface::Background);
        assert_eq!(c.hit_test(5, 239 - 2), HitSurface::Taskbar);
    }

    fn press_at(x: i32, y: i32) -> MouseSnapshot {
        MouseSnapshot {
            x,
            y,
            buttons: 1,
            prev_buttons: 0,
            scroll: 0,
        }
    }

    fn hold_at(x: i32, y: i32) -> MouseSnapshot {
        MouseSnapshot {
            x,
            y,
            buttons: 1,
            prev_buttons: 1,
            scroll: 0,
        }
    }

    fn release_at(x: i32, y: i32) -> MouseSnapshot {
        MouseSnapshot {
            x,
            y,
            buttons: 0,
            prev_buttons: 1,
            scroll: 0,
        }
    }

    #[test]
    fn title_drag_moves_window_without_redraw() {
        let mut c = compositor(320, 240);
        let id = plain_window(&mut c, "w", 50, 50);
        c.compose();
        c.clear_layout_changed();

        let bar = c.window(id).unwrap().title_bar_rect();
        c.handle_mouse(press_at(bar.x + 5, bar.y + 5));
        assert!(c.window(id).unwrap().flags.contains(WindowFlags::DRAGGING));

        c.handle_mouse(hold_at(bar.x + 45, bar.y + 25));
        let w = c.window(id).unwrap();
        assert_eq!((w.x, w.y), (90, 70));
        assert_eq!((w.prev_x, w.prev_y), (50, 50));

        c.handle_mouse(release_at(bar.x + 45, bar.y + 25));
        assert!(!c.window(id).unwrap().flags.contains(WindowFlags::DRAGGING));
    }

    #[test]
    fn close_button_press_destroys_window() {
        let mut c = compositor(320, 240);
        let id = plain_window(&mut c, "w", 50, 50);
        let close = c.window(id).unwrap().close_button_rect();
        c.handle_mouse(press_at(close.x + 2, close.y + 2));
        assert_eq!(c.window_count(), 0);
    }

    #[test]
    fn keys_go_to_focused_window_only() {
        let mut c = compositor(320, 240);
        let a = plain_window(&mut c, "a", 10, 10);
        let b = plain_window(&mut c, "b", 150, 10);

        let ev = KeyEvent {
            scancode: 0x1E,
            character: Some('a'),
            special: None,
            pressed: true,
            timestamp_ms: 0,
        };
        c.route_key(ev);
        assert!(c.pop_key(a).is_none());
        assert_eq!(c.pop_key(b).unwrap().character, Some('a'));
    }

    #[test]
    fn compose_presents_window_body() {
        let mut c = compositor(320, 240);
        let id = plain_window(&mut c, "w", 50, 50);
        c.compose();
        let content = c.window(id).unwrap().content_rect();
        let px = c
            .framebuffer()
            .front_pixel(content.x + 10, content.y + 10);
        assert_eq!(px, WINDOW_BODY);
    }

    #[test]
    fn redraw_callback_runs_for_dirty_windows() {
        use core::sync::atomic::{AtomicU32, Ordering};
        static CALLS: AtomicU32 = AtomicU32::new(0);
        fn painter(_w: &mut Window, _fb: &mut Framebuffer) {
            CALLS.fetch_add(1, Ordering::Relaxed);
        }

        let mut c = compositor(320, 240);
        let id = c.create_window("p", 10, 10, 50, 40, 0, Some(painter), None);
        c.compose();
        c.clear_layout_changed();
        let after_first = CALLS.load(Ordering::Relaxed);
        assert!(after_first >= 1);

        // Clean window: no further redraw.
        c.compose();
        assert_eq!(CALLS.load(Ordering::Relaxed), after_first);

        // Dirty again: repainted.
        c.mark_dirty(id);
        c.compose();
        assert_eq!(CALLS.load(Ordering::Relaxed), after_first + 1);
    }

    #[test]
    fn destroyed_cache_never_reaches_the_screen() {
        let mut c = compositor(320, 240);
        let id = plain_window(&mut c, "w", 40, 40);
        c.compose();
        c.clear_layout_changed();

        // Start a drag so a content cache exists.
        let bar = c.window(id).unwrap().title_bar_rect();
        c.handle_mouse(press_at(bar.x + 4, bar.y + 4));
        assert!(c.window(id).unwrap().content_cache.is_some());

        c.destroy_window(id);
        c.compose();

        let fb = c.framebuffer();
        for y in 0..240 {
            for x in 0..320 {
                assert_ne!(fb.front_pixel(x, y), CACHE_POISON);
            }
        }
    }

    #[test]
    fn on_close_callback_fires() {
        use core::sync::atomic::{AtomicU32, Ordering};
        static CLOSED: AtomicU32 = AtomicU32::new(0);
        fn closer(_w: &mut Window) {
            CLOSED.fetch_add(1, Ordering::Relaxed);
        }

        let mut c = compositor(320, 240);
        let id = c.create_window("w", 10, 10, 50, 40, 0, None, Some(closer));
        c.destroy_window(id);
        assert_eq!(CLOSED.load(Ordering::Relaxed), 1);
    }
}
