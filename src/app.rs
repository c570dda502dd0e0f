// Application state module
// The window/image controller: opacity, locks, target size and scrolling

use crate::image_loader::{self, ImageData, LoadError};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};

/// Static text shown by the help popup
pub const HELP_TEXT: &str = "\
________TRANSPARENCY_________
Press 1-9 to set transparency (1=10%, 9=90%)
Press '0' to reset transparency

_______IMAGE RESIZING________
Drag from the top left corner to resize image
Press 'l' to toggle resizing lock

_________SCROLLING__________
Scroll using mouse wheel
Press 'k' to toggle scroll lock

__________WINDOW____________
Right-click for the menu (Open, Help, Exit)
Drag the middle of the window to move it
Press Escape to close

_________QUESTIONS?__________
visit ware-research on github
https://github.com/ware-research";

/// One wheel notch scrolls this fraction of the window height
const SCROLL_UNITS_PER_WINDOW: u32 = 10;

/// Keyboard input, already translated from the compositor's keysyms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Char(char),
    Escape,
    F1,
    Other,
}

/// Work the shell has to do in response to an input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    OpenImage,
    ShowHelp,
    /// Close whatever popup is open, or exit if none is
    Cancel,
    Exit,
}

/// Context menu entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuItem {
    Open,
    Help,
    Exit,
}

impl MenuItem {
    pub const ALL: [MenuItem; 3] = [MenuItem::Open, MenuItem::Help, MenuItem::Exit];

    pub fn label(self) -> &'static str {
        match self {
            MenuItem::Open => "Open...",
            MenuItem::Help => "Help",
            MenuItem::Exit => "Exit",
        }
    }

    pub fn command(self) -> Command {
        match self {
            MenuItem::Open => Command::OpenImage,
            MenuItem::Help => Command::ShowHelp,
            MenuItem::Exit => Command::Exit,
        }
    }
}

/// Main application state
pub struct AppState {
    /// The loaded image, as decoded
    image: Option<ImageData>,
    /// Copy of `image` with its alpha channel set from the opacity
    display: Option<ImageData>,
    /// Bumped whenever `display` is rebuilt
    display_generation: u64,
    /// Image opacity (0.0 - 1.0)
    opacity: f32,
    /// Window-level opacity. A layer surface has no window alpha and the
    /// image pixels already carry the opacity, so this is only reported.
    window_alpha: f32,
    lock_resize: bool,
    lock_scroll: bool,
    /// Current window size
    window_size: (u32, u32),
    /// Size the image is drawn at, from the last resize pass
    target_size: Option<(u32, u32)>,
    /// Vertical scroll position in pixels
    scroll_offset: u32,
    needs_redraw: bool,
}

impl AppState {
    /// Create a new application state
    pub fn new(opacity: f32) -> Self {
        Self {
            image: None,
            display: None,
            display_generation: 0,
            opacity: opacity.clamp(0.0, 1.0),
            window_alpha: 1.0,
            lock_resize: false,
            lock_scroll: false,
            window_size: (0, 0),
            target_size: None,
            scroll_offset: 0,
            needs_redraw: false,
        }
    }

    pub fn has_image(&self) -> bool {
        self.image.is_some()
    }

    #[cfg(test)]
    pub fn image(&self) -> Option<&ImageData> {
        self.image.as_ref()
    }

    /// The image as it is drawn: alpha replaced, at `target_size`
    pub fn display_image(&self) -> Option<&ImageData> {
        self.display.as_ref()
    }

    pub fn display_generation(&self) -> u64 {
        self.display_generation
    }

    pub fn opacity(&self) -> f32 {
        self.opacity
    }

    /// Alpha carried by every displayed image pixel
    pub fn image_alpha(&self) -> u8 {
        image_loader::alpha_for_opacity(self.opacity)
    }

    pub fn window_alpha(&self) -> f32 {
        self.window_alpha
    }

    pub fn resize_locked(&self) -> bool {
        self.lock_resize
    }

    pub fn scroll_locked(&self) -> bool {
        self.lock_scroll
    }

    pub fn window_size(&self) -> (u32, u32) {
        self.window_size
    }

    pub fn target_size(&self) -> Option<(u32, u32)> {
        self.target_size
    }

    pub fn scroll_offset(&self) -> u32 {
        self.scroll_offset
    }

    /// Return and clear the pending redraw flag
    pub fn take_redraw(&mut self) -> bool {
        std::mem::take(&mut self.needs_redraw)
    }

    /// Load an image from disk and show it. On failure nothing changes.
    pub fn load_path(&mut self, path: &Path) -> Result<(), LoadError> {
        let image = image_loader::load_image(path)?;
        info!(
            "Image loaded: {} ({}x{} pixels)",
            path.display(),
            image.width,
            image.height
        );
        self.set_image(image);
        Ok(())
    }

    /// Apply the result of the open-file dialog. Returns whether a new
    /// image is now shown; a cancelled dialog or a failed load changes
    /// nothing.
    pub fn open_picked(&mut self, picked: Option<PathBuf>) -> bool {
        let Some(path) = picked else {
            info!("Open dialog cancelled");
            return false;
        };
        match self.load_path(&path) {
            Ok(()) => true,
            Err(e) => {
                warn!("Error loading image: {:#}", anyhow::Error::from(e));
                false
            }
        }
    }

    /// Replace the current image
    pub fn set_image(&mut self, image: ImageData) {
        self.image = Some(image);
        // A size computed for the previous image would distort this one
        self.target_size = None;
        self.scroll_offset = 0;
        self.update_opacity();
    }

    /// Set the opacity and refresh the displayed image
    pub fn set_opacity(&mut self, opacity: f32) {
        self.opacity = opacity.clamp(0.0, 1.0);
        info!("Opacity set to {:.1}", self.opacity);
        self.update_opacity();
    }

    /// Rebuild the display copy with the current opacity, then force a
    /// resize pass so the transparent background is masked again
    pub fn update_opacity(&mut self) {
        let Some(image) = self.image.as_ref() else {
            return;
        };

        self.display = Some(image.with_alpha(self.image_alpha()));
        self.display_generation += 1;
        self.window_alpha = self.opacity;
        self.needs_redraw = true;

        self.resize_image(None);
    }

    /// The window changed size
    pub fn on_window_resize(&mut self, width: u32, height: u32) {
        debug!("Window resized to {}x{}", width, height);
        self.window_size = (width, height);
        self.resize_image(Some(width));
    }

    /// Recompute the image size from the window width, keeping the aspect
    /// ratio. With the resize lock on the previous size is kept and the
    /// image is only redrawn.
    pub fn resize_image(&mut self, window_width: Option<u32>) {
        if let Some(width) = window_width {
            self.window_size.0 = width;
        }
        let Some(image) = self.image.as_ref() else {
            return;
        };

        let target = match self.target_size {
            Some(size) if self.lock_resize => size,
            _ => {
                let new_width = self.window_size.0.max(1);
                let new_height = ((new_width as f32 / image.aspect_ratio()) as u32).max(1);
                (new_width, new_height)
            }
        };

        if self.target_size != Some(target) {
            debug!("Image target size {}x{}", target.0, target.1);
        }
        self.target_size = Some(target);
        self.scroll_offset = self.scroll_offset.min(self.max_scroll());
        self.needs_redraw = true;
    }

    /// Largest scroll offset for the current scroll region
    fn max_scroll(&self) -> u32 {
        match self.target_size {
            Some((_, height)) => height.saturating_sub(self.window_size.1),
            None => 0,
        }
    }

    pub fn toggle_resize_lock(&mut self) {
        self.lock_resize = !self.lock_resize;
        info!("Resize lock {}", if self.lock_resize { "on" } else { "off" });
    }

    pub fn toggle_scroll_lock(&mut self) {
        self.lock_scroll = !self.lock_scroll;
        info!("Scroll lock {}", if self.lock_scroll { "on" } else { "off" });
    }

    /// Handle a key press
    pub fn on_key_press(&mut self, key: Key) -> Option<Command> {
        match key {
            Key::Char(c) => match c.to_digit(10) {
                Some(0) => {
                    self.set_opacity(1.0);
                    None
                }
                Some(digit) => {
                    self.set_opacity(digit as f32 / 10.0);
                    None
                }
                None => match c.to_ascii_lowercase() {
                    'l' => {
                        self.toggle_resize_lock();
                        None
                    }
                    'k' => {
                        self.toggle_scroll_lock();
                        None
                    }
                    'o' => Some(Command::OpenImage),
                    'h' => Some(Command::ShowHelp),
                    _ => None,
                },
            },
            Key::Escape => Some(Command::Cancel),
            Key::F1 => Some(Command::ShowHelp),
            Key::Other => None,
        }
    }

    /// Scroll by `notches` wheel steps (positive scrolls down). Returns
    /// whether the scroll position changed.
    pub fn on_mouse_wheel(&mut self, notches: i32) -> bool {
        if self.lock_scroll || self.image.is_none() || notches == 0 {
            return false;
        }

        let unit = (self.window_size.1 / SCROLL_UNITS_PER_WINDOW).max(1) as i64;
        let offset = self.scroll_offset as i64 + notches as i64 * unit;
        let offset = offset.clamp(0, self.max_scroll() as i64) as u32;

        if offset == self.scroll_offset {
            return false;
        }
        debug!("Scrolled to {}", offset);
        self.scroll_offset = offset;
        self.needs_redraw = true;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn image(width: u32, height: u32) -> ImageData {
        ImageData::from_rgba(RgbaImage::from_pixel(width, height, Rgba([10, 20, 30, 255])))
    }

    fn state_with_image(width: u32, height: u32) -> AppState {
        let mut state = AppState::new(1.0);
        state.on_window_resize(400, 300);
        state.set_image(image(width, height));
        state
    }

    #[test]
    fn test_digits_set_opacity() {
        let mut state = state_with_image(40, 20);
        for d in 1..=9u32 {
            let c = char::from_digit(d, 10).unwrap();
            assert_eq!(state.on_key_press(Key::Char(c)), None);

            let expected = d as f32 / 10.0;
            assert_eq!(state.opacity(), expected);
            assert_eq!(state.window_alpha(), expected);

            let alpha = (255.0 * expected).round() as u8;
            assert_eq!(state.image_alpha(), alpha);
            let display = state.display_image().unwrap();
            assert!(display.rgba_data.chunks_exact(4).all(|p| p[3] == alpha));
        }
    }

    #[test]
    fn test_zero_resets_opacity() {
        let mut state = state_with_image(40, 20);
        state.on_key_press(Key::Char('3'));
        assert_eq!(state.opacity(), 0.3);
        state.on_key_press(Key::Char('0'));
        assert_eq!(state.opacity(), 1.0);
        assert_eq!(state.display_image().unwrap().alpha_at(0, 0), 255);

        let mut fresh = AppState::new(0.25);
        fresh.on_key_press(Key::Char('0'));
        assert_eq!(fresh.opacity(), 1.0);
    }

    #[test]
    fn test_opacity_without_image() {
        let mut state = AppState::new(1.0);
        state.on_key_press(Key::Char('4'));
        assert_eq!(state.opacity(), 0.4);
        assert!(state.display_image().is_none());
        assert!(state.target_size().is_none());
    }

    #[test]
    fn test_failed_load_keeps_image() {
        let mut state = state_with_image(40, 20);
        let generation = state.display_generation();

        assert!(state.load_path(Path::new("/nonexistent/seethru.png")).is_err());
        assert!(state.load_path(Path::new("/tmp/notes.txt")).is_err());

        let kept = state.image().unwrap();
        assert_eq!((kept.width, kept.height), (40, 20));
        assert_eq!(state.display_generation(), generation);
        assert_eq!(state.target_size(), Some((400, 200)));
    }

    #[test]
    fn test_cancelled_dialog_keeps_image() {
        let mut state = state_with_image(40, 20);
        state.on_key_press(Key::Char('6'));
        let generation = state.display_generation();

        assert!(!state.open_picked(None));
        let kept = state.image().unwrap();
        assert_eq!((kept.width, kept.height), (40, 20));
        assert_eq!(state.display_generation(), generation);
        assert_eq!(state.target_size(), Some((400, 200)));
        assert_eq!(state.opacity(), 0.6);

        assert!(!state.open_picked(Some(PathBuf::from("/nonexistent/seethru.jpg"))));
        assert_eq!(state.display_generation(), generation);
    }

    #[test]
    fn test_load_path_replaces_image() {
        let path = std::env::temp_dir().join(format!("seethru-{}-app.png", std::process::id()));
        RgbaImage::from_pixel(30, 60, Rgba([0, 0, 0, 255]))
            .save(&path)
            .unwrap();

        let mut state = state_with_image(40, 20);
        state.load_path(&path).unwrap();
        let image = state.image().unwrap();
        assert_eq!((image.width, image.height), (30, 60));
        assert_eq!(state.target_size(), Some((400, 800)));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_unlocked_resize_keeps_aspect_ratio() {
        let mut state = state_with_image(640, 480);
        for width in [40, 123, 400, 999, 1920] {
            state.on_window_resize(width, 300);
            let (w, h) = state.target_size().unwrap();
            assert_eq!(w, width);
            let expected = 480.0 / 640.0;
            assert!((h as f32 / w as f32 - expected).abs() < 1.0 / w as f32 + 1e-6);
        }
    }

    #[test]
    fn test_resize_lock_keeps_size() {
        let mut state = state_with_image(200, 100);
        assert_eq!(state.target_size(), Some((400, 200)));

        state.on_key_press(Key::Char('l'));
        assert!(state.resize_locked());
        state.on_window_resize(800, 300);
        assert_eq!(state.target_size(), Some((400, 200)));

        // Opacity refresh goes through the resize pass but keeps the size
        state.on_key_press(Key::Char('5'));
        assert_eq!(state.target_size(), Some((400, 200)));
        assert!(state.take_redraw());

        state.on_key_press(Key::Char('L'));
        assert!(!state.resize_locked());
        state.on_window_resize(800, 300);
        assert_eq!(state.target_size(), Some((800, 400)));
    }

    #[test]
    fn test_resize_lock_on_new_image_computes_once() {
        let mut state = state_with_image(200, 100);
        state.toggle_resize_lock();
        state.set_image(image(100, 100));
        assert_eq!(state.target_size(), Some((400, 400)));
    }

    #[test]
    fn test_scroll() {
        let mut state = state_with_image(100, 200);
        // 400x800 image in a 400x300 window
        assert_eq!(state.target_size(), Some((400, 800)));

        assert!(state.on_mouse_wheel(1));
        assert_eq!(state.scroll_offset(), 30);
        assert!(state.on_mouse_wheel(100));
        assert_eq!(state.scroll_offset(), 500);
        assert!(!state.on_mouse_wheel(1));
        assert!(state.on_mouse_wheel(-3));
        assert_eq!(state.scroll_offset(), 410);

        // Growing the window shrinks the scroll region
        state.toggle_resize_lock();
        state.on_window_resize(400, 700);
        assert_eq!(state.scroll_offset(), 100);
    }

    #[test]
    fn test_scroll_lock_and_no_image() {
        let mut state = state_with_image(100, 200);
        state.on_key_press(Key::Char('k'));
        assert!(state.scroll_locked());
        assert!(!state.on_mouse_wheel(1));
        assert_eq!(state.scroll_offset(), 0);

        let mut empty = AppState::new(1.0);
        empty.on_window_resize(400, 300);
        assert!(!empty.on_mouse_wheel(1));
        assert_eq!(empty.scroll_offset(), 0);
    }

    #[test]
    fn test_help_text_sections() {
        for heading in ["TRANSPARENCY", "IMAGE RESIZING", "SCROLLING", "WINDOW", "QUESTIONS?"] {
            assert!(HELP_TEXT.contains(heading), "missing {heading}");
        }
        assert!(HELP_TEXT.ends_with("https://github.com/ware-research"));
    }

    #[test]
    fn test_commands() {
        let mut state = AppState::new(1.0);
        assert_eq!(state.on_key_press(Key::Char('o')), Some(Command::OpenImage));
        assert_eq!(state.on_key_press(Key::Char('h')), Some(Command::ShowHelp));
        assert_eq!(state.on_key_press(Key::F1), Some(Command::ShowHelp));
        assert_eq!(state.on_key_press(Key::Escape), Some(Command::Cancel));
        assert_eq!(state.on_key_press(Key::Char('x')), None);
        assert_eq!(state.on_key_press(Key::Other), None);
        assert_eq!(MenuItem::Exit.command(), Command::Exit);
        assert_eq!(MenuItem::Open.command(), Command::OpenImage);
    }
}
