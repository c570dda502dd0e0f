// Wayland integration module
// Handles all Wayland-specific functionality using smithay-client-toolkit

use crate::app::{AppState, Command, Key, MenuItem, HELP_TEXT};
use crate::cpu_renderer::{self, Canvas, Placement};
use crate::image_loader::{ImageData, SUPPORTED_EXTENSIONS};
use crate::text::TextRenderer;
use crate::wgpu_renderer::WgpuRenderer;
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use smithay_client_toolkit::{
    compositor::{CompositorHandler, CompositorState},
    delegate_compositor, delegate_keyboard, delegate_layer, delegate_output, delegate_pointer,
    delegate_registry, delegate_seat, delegate_shm,
    output::{OutputHandler, OutputState},
    registry::{ProvidesRegistryState, RegistryState},
    registry_handlers,
    seat::{
        keyboard::{KeyEvent, KeyboardHandler, Keysym, Modifiers},
        pointer::{PointerEvent, PointerEventKind, PointerHandler},
        Capability, SeatHandler, SeatState,
    },
    shell::{
        wlr_layer::{
            Anchor, KeyboardInteractivity, Layer, LayerShell, LayerShellHandler, LayerSurface,
            LayerSurfaceConfigure,
        },
        WaylandSurface,
    },
    shm::{
        slot::{Buffer, SlotPool},
        Shm, ShmHandler,
    },
};
use std::time::{Duration, Instant};
use wayland_client::{
    globals::registry_queue_init,
    protocol::{wl_keyboard, wl_output, wl_pointer, wl_seat, wl_shm, wl_surface},
    Connection, Proxy, QueueHandle,
};

/// Mouse button constants
const BTN_LEFT: u32 = 272;
const BTN_RIGHT: u32 = 273;

/// Resize edge detection margin in pixels
const RESIZE_MARGIN: f64 = 10.0;

/// Minimum window size
const MIN_SIZE: u32 = 40;

/// Maximum window size to prevent buffer allocation failures
const MAX_SIZE: u32 = 4096;

/// Maximum buffer size (64MB to avoid Wayland buffer issues)
const MAX_BUFFER_SIZE: usize = 64 * 1024 * 1024;

/// Window size when started without an image
const EMPTY_WINDOW_SIZE: (u32, u32) = (400, 300);

/// Delay between the window appearing and the startup file dialog
const STARTUP_OPEN_DELAY: Duration = Duration::from_millis(500);

/// Menu geometry
const MENU_ITEM_HEIGHT: u32 = 25;
const MENU_WIDTH: u32 = 140;

/// Font sizes in pixels
const MENU_FONT_SIZE: f32 = 14.0;
const HELP_FONT_SIZE: f32 = 14.0;
const HELP_PADDING: u32 = 16;

/// Colours (straight alpha, BGRA)
const MENU_BG: [u8; 4] = [60, 60, 60, 230];
const MENU_HOVER_BG: [u8; 4] = [180, 180, 80, 230];
const MENU_BORDER: [u8; 4] = [100, 100, 100, 255];
const TEXT_COLOR: [u8; 4] = [255, 255, 255, 255];
const PLACEHOLDER_BG: [u8; 4] = [40, 40, 40, 120];
const HELP_BG: [u8; 4] = [40, 40, 40, 240];

/// Resize direction flags
#[derive(Debug, Clone, Copy, PartialEq)]
enum ResizeEdge {
    None,
    Top,
    Bottom,
    Left,
    Right,
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

impl ResizeEdge {
    fn left(self) -> bool {
        matches!(self, Self::Left | Self::TopLeft | Self::BottomLeft)
    }

    fn right(self) -> bool {
        matches!(self, Self::Right | Self::TopRight | Self::BottomRight)
    }

    fn top(self) -> bool {
        matches!(self, Self::Top | Self::TopLeft | Self::TopRight)
    }

    fn bottom(self) -> bool {
        matches!(self, Self::Bottom | Self::BottomLeft | Self::BottomRight)
    }
}

/// Context menu state
#[derive(Debug, Clone, Copy, PartialEq)]
enum MenuState {
    Hidden,
    Visible,
}

/// The read-only help popup, a second layer surface
struct HelpPopup {
    layer_surface: LayerSurface,
    pool: Option<SlotPool>,
    buffer: Option<Buffer>,
    width: u32,
    height: u32,
}

/// A rendered image frame kept for redraws that only change the menu
struct CachedFrame {
    placement: Placement,
    generation: u64,
    size: (u32, u32),
    data: Vec<u8>,
}

/// Main Wayland application state
struct WaylandApp {
    // Registry state
    registry_state: RegistryState,
    // Seat state for input handling
    seat_state: SeatState,
    // Output state for display info
    output_state: OutputState,
    // Shared memory for buffer allocation
    shm: Shm,
    // Layer shell for overlay windows
    layer_shell: LayerShell,
    // Compositor state
    compositor_state: CompositorState,

    // Wayland display pointer (for GPU rendering)
    display_ptr: *mut std::ffi::c_void,

    // Image, opacity, locks and scrolling
    state: AppState,
    should_exit: bool,

    // Display dimensions for size limiting
    display_width: u32,
    display_height: u32,

    // Surface and buffer management
    layer_surface: Option<LayerSurface>,
    pool: Option<SlotPool>,
    buffer: Option<Buffer>,
    width: u32,
    height: u32,
    configured: bool,

    // Window position (margins from top-left)
    margin_left: i32,
    margin_top: i32,

    // Pointer state, surface-local
    pointer_pos: (f64, f64),
    pointer_on_help: bool,

    // Dragging state, in output coordinates
    dragging: bool,
    drag_start_pos: (f64, f64),
    drag_start_margin: (i32, i32),

    // Resizing state, in output coordinates
    resizing: bool,
    resize_edge: ResizeEdge,
    resize_start_pos: (f64, f64),
    resize_start_size: (u32, u32),
    resize_start_margin: (i32, i32),

    // Context menu
    menu_state: MenuState,
    menu_pos: (i32, i32),
    menu_hover_item: Option<usize>,

    help: Option<HelpPopup>,
    text: Option<TextRenderer>,

    // Redraw flag
    needs_redraw: bool,

    cached_frame: Option<CachedFrame>,
    // Frame rate limiting for resize
    last_resize_draw: Option<Instant>,

    // One-shot startup dialog
    startup_prompt_pending: bool,
    startup_open_at: Option<Instant>,

    // GPU rendering
    use_gpu: bool,
    gpu_renderer: Option<WgpuRenderer>,
    gpu_initialized: bool,
}

impl WaylandApp {
    /// Create a new Wayland application
    #[allow(clippy::too_many_arguments)]
    fn new(
        registry_state: RegistryState,
        seat_state: SeatState,
        output_state: OutputState,
        shm: Shm,
        layer_shell: LayerShell,
        compositor_state: CompositorState,
        display_ptr: *mut std::ffi::c_void,
        state: AppState,
        use_gpu: bool,
    ) -> Self {
        let startup_prompt_pending = !state.has_image();
        Self {
            registry_state,
            seat_state,
            output_state,
            shm,
            layer_shell,
            compositor_state,
            display_ptr,
            state,
            should_exit: false,
            display_width: 1920,
            display_height: 1080,
            layer_surface: None,
            pool: None,
            buffer: None,
            width: 0,
            height: 0,
            configured: false,
            margin_left: 100,
            margin_top: 100,
            pointer_pos: (0.0, 0.0),
            pointer_on_help: false,
            dragging: false,
            drag_start_pos: (0.0, 0.0),
            drag_start_margin: (0, 0),
            resizing: false,
            resize_edge: ResizeEdge::None,
            resize_start_pos: (0.0, 0.0),
            resize_start_size: (0, 0),
            resize_start_margin: (0, 0),
            menu_state: MenuState::Hidden,
            menu_pos: (0, 0),
            menu_hover_item: None,
            help: None,
            text: None,
            needs_redraw: false,
            cached_frame: None,
            last_resize_draw: None,
            startup_prompt_pending,
            startup_open_at: None,
            use_gpu,
            gpu_renderer: None,
            gpu_initialized: false,
        }
    }

    /// Pointer position in output coordinates
    fn global_pointer_pos(&self) -> (f64, f64) {
        (
            self.pointer_pos.0 + self.margin_left as f64,
            self.pointer_pos.1 + self.margin_top as f64,
        )
    }

    /// Run a command produced by a key press or menu click
    fn run_command(&mut self, qh: &QueueHandle<Self>, command: Command) {
        match command {
            Command::OpenImage => self.open_image(qh),
            Command::ShowHelp => self.show_help(qh),
            Command::Cancel => {
                if self.help.is_some() {
                    self.close_help();
                } else if self.menu_state == MenuState::Visible {
                    self.menu_state = MenuState::Hidden;
                    self.needs_redraw = true;
                } else {
                    info!("Exit key pressed");
                    self.should_exit = true;
                }
            }
            Command::Exit => {
                info!("Exit requested");
                self.should_exit = true;
            }
        }
    }

    /// Ask for an image with the native file dialog and show it. A cancelled
    /// dialog or a failed load leaves the current image in place.
    fn open_image(&mut self, qh: &QueueHandle<Self>) {
        let picked = rfd::FileDialog::new()
            .set_title("Open image")
            .add_filter("Image files", SUPPORTED_EXTENSIONS)
            .pick_file();

        if self.state.open_picked(picked) {
            self.fit_height_to_image();
            self.needs_redraw = true;
            self.draw(qh);
        }
    }

    /// Grow or shrink the window vertically to the image's height
    fn fit_height_to_image(&mut self) {
        let Some((_, target_height)) = self.state.target_size() else {
            return;
        };
        let height = target_height.clamp(MIN_SIZE, self.display_height.clamp(MIN_SIZE, MAX_SIZE));
        if height != self.height {
            self.height = height;
            self.state.on_window_resize(self.width, self.height);
            self.update_size();
        }
    }

    /// Open the help popup, centred on the output
    fn show_help(&mut self, qh: &QueueHandle<Self>) {
        if self.help.is_some() {
            return;
        }

        let text = self.text.get_or_insert_with(TextRenderer::new);
        let (text_w, text_h) = text.measure(HELP_TEXT, HELP_FONT_SIZE);
        let width = (text_w + HELP_PADDING * 2).clamp(200, MAX_SIZE);
        let height = (text_h + HELP_PADDING * 2).clamp(100, MAX_SIZE);

        let surface = self.compositor_state.create_surface(qh);
        let layer_surface = self.layer_shell.create_layer_surface(
            qh,
            surface,
            Layer::Overlay,
            Some("seethru-help"),
            None,
        );
        layer_surface.set_size(width, height);
        layer_surface.set_keyboard_interactivity(KeyboardInteractivity::OnDemand);
        layer_surface.commit();

        info!("Showing help");
        self.help = Some(HelpPopup {
            layer_surface,
            pool: None,
            buffer: None,
            width,
            height,
        });
    }

    fn close_help(&mut self) {
        if self.help.take().is_some() {
            debug!("Help closed");
        }
        self.pointer_on_help = false;
    }

    fn is_help_surface(&self, surface: &wl_surface::WlSurface) -> bool {
        self.help
            .as_ref()
            .is_some_and(|help| help.layer_surface.wl_surface() == surface)
    }

    /// Handle menu item selection
    fn handle_menu_action(&mut self, qh: &QueueHandle<Self>, item: usize) {
        self.menu_state = MenuState::Hidden;
        self.needs_redraw = true;
        if let Some(item) = MenuItem::ALL.get(item) {
            info!("Menu: {} selected", item.label());
            self.draw(qh);
            self.run_command(qh, item.command());
        }
    }

    /// Update window position using layer shell margins
    fn update_position(&mut self) {
        if let Some(ref layer_surface) = self.layer_surface {
            layer_surface.set_anchor(Anchor::TOP | Anchor::LEFT);
            layer_surface.set_margin(self.margin_top, 0, 0, self.margin_left);
            layer_surface.commit();
        }
    }

    /// Update window size with optional frame rate limiting
    fn update_size(&mut self) {
        // Frame rate limiting during resize
        const MIN_FRAME_INTERVAL_MS: u128 = 25;

        if self.resizing {
            if let Some(last_draw) = self.last_resize_draw {
                if last_draw.elapsed().as_millis() < MIN_FRAME_INTERVAL_MS {
                    // Skip this frame, just update layer shell size
                    if let Some(ref layer_surface) = self.layer_surface {
                        layer_surface.set_size(self.width, self.height);
                        layer_surface.commit();
                    }
                    return;
                }
            }
            self.last_resize_draw = Some(Instant::now());
        }

        if let Some(ref layer_surface) = self.layer_surface {
            layer_surface.set_size(self.width, self.height);
            layer_surface.commit();
        }
        // Reset pool to force buffer recreation
        self.pool = None;
        self.needs_redraw = true;
    }

    /// Initialize GPU renderer from Wayland surface
    fn init_gpu_renderer(&mut self) {
        if self.gpu_initialized {
            return;
        }

        let Some(layer_surface) = &self.layer_surface else {
            warn!("Cannot init GPU: no layer surface");
            return;
        };

        // With wayland-backend's client_system feature, ObjectId::as_ptr()
        // yields the libwayland proxy
        let surface_ptr = layer_surface.wl_surface().id().as_ptr() as *mut std::ffi::c_void;
        let display_ptr = self.display_ptr;

        if display_ptr.is_null() {
            warn!("Display pointer is null, falling back to CPU rendering");
            self.use_gpu = false;
            return;
        }

        info!("Initializing GPU renderer ({}x{})", self.width, self.height);

        match WgpuRenderer::new(display_ptr, surface_ptr, self.width, self.height) {
            Ok(renderer) => {
                self.gpu_renderer = Some(renderer);
                self.gpu_initialized = true;
                info!("GPU renderer initialized successfully");
            }
            Err(e) => {
                warn!("Failed to initialize GPU renderer: {:?}", e);
                warn!("Falling back to CPU rendering");
                self.use_gpu = false;
            }
        }
    }

    /// Where the image goes in the window
    fn placement(&self) -> Option<Placement> {
        let (width, height) = self.state.target_size()?;
        Some(Placement {
            width,
            height,
            scroll_offset: self.state.scroll_offset(),
        })
    }

    /// Draw the current frame
    fn draw(&mut self, _qh: &QueueHandle<Self>) {
        if !self.configured || self.layer_surface.is_none() {
            return;
        }

        // The GPU path only draws the image; the menu and the empty-window
        // placeholder go through the CPU path
        let gpu_ready = self.use_gpu && self.gpu_renderer.is_some();
        if gpu_ready && self.menu_state != MenuState::Visible && self.state.has_image() {
            if self.draw_gpu() {
                return;
            }
            warn!("GPU rendering failed, falling back to CPU");
        }

        self.draw_cpu();
    }

    /// Draw using GPU (wgpu)
    fn draw_gpu(&mut self) -> bool {
        let Some(placement) = self.placement() else {
            return false;
        };
        let (Some(renderer), Some(display)) =
            (self.gpu_renderer.as_mut(), self.state.display_image())
        else {
            return false;
        };

        renderer.resize(self.width, self.height);
        if !renderer.sync_texture(display, self.state.display_generation()) {
            self.use_gpu = false;
            return false;
        }

        match renderer.render(placement) {
            Ok(true) => {
                if let Some(ref layer_surface) = self.layer_surface {
                    layer_surface.wl_surface().commit();
                }
                self.needs_redraw = false;
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!("GPU render error: {:?}", e);
                false
            }
        }
    }

    /// Draw using CPU (shared memory buffer)
    fn draw_cpu(&mut self) {
        // Clamp window size to prevent buffer allocation failures
        self.width = self.width.clamp(MIN_SIZE, MAX_SIZE);
        self.height = self.height.clamp(MIN_SIZE, MAX_SIZE);

        let width = self.width;
        let height = self.height;

        let stride = width as i32 * 4;
        let buffer_size = (stride * height as i32) as usize;

        if buffer_size > MAX_BUFFER_SIZE {
            error!(
                "Buffer size too large: {} bytes, max: {} bytes",
                buffer_size, MAX_BUFFER_SIZE
            );
            // Scale down to fit; the next frame uses the new size
            let scale = (MAX_BUFFER_SIZE as f32 / buffer_size as f32).sqrt();
            self.width = (width as f32 * scale) as u32;
            self.height = (height as f32 * scale) as u32;
            self.state.on_window_resize(self.width, self.height);
            self.update_size();
            return;
        }

        let placement = self.placement();
        let Some(pool) = ensure_pool(&mut self.pool, &self.shm, buffer_size) else {
            return;
        };

        let (buffer, canvas_data) =
            match pool.create_buffer(width as i32, height as i32, stride, wl_shm::Format::Argb8888) {
                Ok(buf) => buf,
                Err(e) => {
                    error!("Failed to create buffer {}x{}: {}", width, height, e);
                    return;
                }
            };

        let mut canvas = Canvas::new(canvas_data, width, height);

        match (self.state.display_image(), placement) {
            (Some(display), Some(placement)) if self.resizing => {
                // Fast nearest-neighbor during resize for responsiveness
                cpu_renderer::render_image_fast(&mut canvas, display, placement);
            }
            (Some(display), Some(placement)) => {
                let generation = self.state.display_generation();
                let hit = self.cached_frame.as_ref().filter(|cached| {
                    cached.placement == placement
                        && cached.generation == generation
                        && cached.size == (width, height)
                });
                match hit {
                    Some(cached) => canvas.copy_from(&cached.data),
                    None => {
                        cpu_renderer::render_image(&mut canvas, display, placement);
                        self.cached_frame = Some(CachedFrame {
                            placement,
                            generation,
                            size: (width, height),
                            data: canvas.as_bytes().to_vec(),
                        });
                    }
                }
            }
            _ => {
                let text = self.text.get_or_insert_with(TextRenderer::new);
                render_placeholder(&mut canvas, text);
            }
        }

        if self.menu_state == MenuState::Visible {
            let text = self.text.get_or_insert_with(TextRenderer::new);
            render_menu(&mut canvas, text, self.menu_pos, self.menu_hover_item);
        }

        cpu_renderer::render_resize_border(&mut canvas, RESIZE_MARGIN as u32);

        let Some(layer_surface) = self.layer_surface.as_ref() else {
            return;
        };
        let surface = layer_surface.wl_surface();
        if let Err(e) = buffer.attach_to(surface) {
            error!("Failed to attach buffer: {}", e);
            return;
        }
        surface.damage_buffer(0, 0, width as i32, height as i32);
        surface.commit();

        self.buffer = Some(buffer);
        self.needs_redraw = false;
    }

    /// Draw the help popup
    fn draw_help(&mut self) {
        let Some(help) = self.help.as_mut() else {
            return;
        };
        let (width, height) = (help.width, help.height);
        let stride = width as i32 * 4;
        let buffer_size = (stride * height as i32) as usize;

        let Some(pool) = ensure_pool(&mut help.pool, &self.shm, buffer_size) else {
            return;
        };
        let (buffer, canvas_data) =
            match pool.create_buffer(width as i32, height as i32, stride, wl_shm::Format::Argb8888) {
                Ok(buf) => buf,
                Err(e) => {
                    error!("Failed to create help buffer {}x{}: {}", width, height, e);
                    return;
                }
            };

        let mut canvas = Canvas::new(canvas_data, width, height);
        canvas.fill_rect(0, 0, width, height, HELP_BG);
        canvas.stroke_rect(0, 0, width, height, MENU_BORDER);
        let text = self.text.get_or_insert_with(TextRenderer::new);
        text.draw(
            &mut canvas,
            HELP_PADDING as i32,
            HELP_PADDING as i32,
            HELP_TEXT,
            HELP_FONT_SIZE,
            TEXT_COLOR,
        );

        let surface = help.layer_surface.wl_surface();
        if let Err(e) = buffer.attach_to(surface) {
            error!("Failed to attach help buffer: {}", e);
            return;
        }
        surface.damage_buffer(0, 0, width as i32, height as i32);
        surface.commit();
        help.buffer = Some(buffer);
    }

    fn handle_key(&mut self, qh: &QueueHandle<Self>, key: Key) {
        if let Some(command) = self.state.on_key_press(key) {
            self.run_command(qh, command);
        }
        if self.state.take_redraw() {
            self.needs_redraw = true;
            debug!(
                "opacity {:.1} (window {:.1}), resize lock {}, scroll lock {}",
                self.state.opacity(),
                self.state.window_alpha(),
                self.state.resize_locked(),
                self.state.scroll_locked()
            );
        }
        if self.needs_redraw {
            self.draw(qh);
        }
    }

    fn handle_pointer_motion(&mut self, x: f64, y: f64) {
        self.pointer_pos = (x, y);

        // Update menu hover state
        if self.menu_state == MenuState::Visible {
            let prev_hover = self.menu_hover_item;
            self.menu_hover_item = menu_item_at(self.menu_pos, x, y);
            if prev_hover != self.menu_hover_item {
                self.needs_redraw = true;
            }
        }

        let (gx, gy) = self.global_pointer_pos();

        if self.dragging {
            self.margin_left = self.drag_start_margin.0 + (gx - self.drag_start_pos.0) as i32;
            self.margin_top = self.drag_start_margin.1 + (gy - self.drag_start_pos.1) as i32;
            self.update_position();
        }

        if self.resizing {
            let dx = (gx - self.resize_start_pos.0) as i32;
            let dy = (gy - self.resize_start_pos.1) as i32;
            let (new_w, new_h, new_ml, new_mt) = resize_window(
                self.resize_edge,
                self.resize_start_size,
                self.resize_start_margin,
                dx,
                dy,
            );

            if (new_w, new_h) != (self.width, self.height) {
                self.width = new_w;
                self.height = new_h;
                self.margin_left = new_ml;
                self.margin_top = new_mt;
                self.state.on_window_resize(new_w, new_h);
                self.update_position();
                self.update_size();
            }
        }
    }

    fn handle_left_press(&mut self, qh: &QueueHandle<Self>) {
        let (x, y) = self.pointer_pos;

        if self.menu_state == MenuState::Visible {
            match menu_item_at(self.menu_pos, x, y) {
                Some(item) => {
                    self.handle_menu_action(qh, item);
                    return;
                }
                None => {
                    // Close menu if clicking outside
                    self.menu_state = MenuState::Hidden;
                    self.needs_redraw = true;
                    self.draw(qh);
                }
            }
        }

        let edge = detect_resize_edge(self.width, self.height, x, y);
        if edge != ResizeEdge::None {
            self.resizing = true;
            self.resize_edge = edge;
            self.resize_start_pos = self.global_pointer_pos();
            self.resize_start_size = (self.width, self.height);
            self.resize_start_margin = (self.margin_left, self.margin_top);
        } else {
            // Start dragging for window move
            self.dragging = true;
            self.drag_start_pos = self.global_pointer_pos();
            self.drag_start_margin = (self.margin_left, self.margin_top);
        }
    }

    fn show_menu(&mut self, qh: &QueueHandle<Self>) {
        let (x, y) = self.pointer_pos;
        self.menu_state = MenuState::Visible;
        self.menu_pos = clamp_menu_pos((x as i32, y as i32), self.width, self.height);
        self.menu_hover_item = menu_item_at(self.menu_pos, x, y);
        self.needs_redraw = true;
        self.draw(qh);
    }
}

/// Create the slot pool on first use and grow it when needed
fn ensure_pool<'a>(
    pool: &'a mut Option<SlotPool>,
    shm: &Shm,
    buffer_size: usize,
) -> Option<&'a mut SlotPool> {
    if pool.is_none() {
        match SlotPool::new(buffer_size, shm) {
            Ok(created) => *pool = Some(created),
            Err(e) => {
                error!(
                    "Failed to create slot pool: {}. Buffer size: {} bytes",
                    e, buffer_size
                );
                return None;
            }
        }
    }

    let slot_pool = pool.as_mut()?;
    if slot_pool.len() < buffer_size {
        if let Err(e) = slot_pool.resize(buffer_size) {
            error!("Failed to resize pool to {} bytes: {}", buffer_size, e);
            *pool = None;
            return None;
        }
    }
    pool.as_mut()
}

/// Hint shown while no image is loaded
fn render_placeholder(canvas: &mut Canvas, text: &mut TextRenderer) {
    let (width, height) = (canvas.width(), canvas.height());
    canvas.fill_rect(0, 0, width, height, PLACEHOLDER_BG);
    text.draw(canvas, 12, 12, "Right-click to open an image", MENU_FONT_SIZE, TEXT_COLOR);
}

/// Render the context menu
fn render_menu(
    canvas: &mut Canvas,
    text: &mut TextRenderer,
    menu_pos: (i32, i32),
    menu_hover_item: Option<usize>,
) {
    let (menu_x, menu_y) = menu_pos;

    for (i, item) in MenuItem::ALL.iter().enumerate() {
        let item_y = menu_y + (i as u32 * MENU_ITEM_HEIGHT) as i32;
        let bg = if menu_hover_item == Some(i) {
            MENU_HOVER_BG
        } else {
            MENU_BG
        };
        canvas.fill_rect(menu_x, item_y, MENU_WIDTH, MENU_ITEM_HEIGHT, bg);
        text.draw(
            canvas,
            menu_x + 10,
            item_y + 4,
            item.label(),
            MENU_FONT_SIZE,
            TEXT_COLOR,
        );
    }

    let menu_height = MenuItem::ALL.len() as u32 * MENU_ITEM_HEIGHT;
    canvas.stroke_rect(menu_x, menu_y, MENU_WIDTH, menu_height, MENU_BORDER);
}

/// Index of the menu item under (x, y)
fn menu_item_at(menu_pos: (i32, i32), x: f64, y: f64) -> Option<usize> {
    let menu_x = menu_pos.0 as f64;
    let menu_y = menu_pos.1 as f64;
    let menu_h = (MenuItem::ALL.len() as u32 * MENU_ITEM_HEIGHT) as f64;

    if x >= menu_x && x < menu_x + MENU_WIDTH as f64 && y >= menu_y && y < menu_y + menu_h {
        Some(((y - menu_y) / MENU_ITEM_HEIGHT as f64) as usize)
    } else {
        None
    }
}

/// Keep the menu inside the window where possible
fn clamp_menu_pos(pos: (i32, i32), width: u32, height: u32) -> (i32, i32) {
    let menu_height = (MenuItem::ALL.len() as u32 * MENU_ITEM_HEIGHT) as i32;
    let x = pos.0.min(width as i32 - MENU_WIDTH as i32).max(0);
    let y = pos.1.min(height as i32 - menu_height).max(0);
    (x, y)
}

/// Detect which resize edge the pointer is near
fn detect_resize_edge(width: u32, height: u32, x: f64, y: f64) -> ResizeEdge {
    let w = width as f64;
    let h = height as f64;

    let near_left = x < RESIZE_MARGIN;
    let near_right = x > w - RESIZE_MARGIN;
    let near_top = y < RESIZE_MARGIN;
    let near_bottom = y > h - RESIZE_MARGIN;

    match (near_left, near_right, near_top, near_bottom) {
        (true, false, true, false) => ResizeEdge::TopLeft,
        (false, true, true, false) => ResizeEdge::TopRight,
        (true, false, false, true) => ResizeEdge::BottomLeft,
        (false, true, false, true) => ResizeEdge::BottomRight,
        (true, false, false, false) => ResizeEdge::Left,
        (false, true, false, false) => ResizeEdge::Right,
        (false, false, true, false) => ResizeEdge::Top,
        (false, false, false, true) => ResizeEdge::Bottom,
        _ => ResizeEdge::None,
    }
}

/// New window size and margins for a resize drag of (dx, dy) pixels.
/// Dragging a left or top edge keeps the opposite edge in place.
fn resize_window(
    edge: ResizeEdge,
    start_size: (u32, u32),
    start_margin: (i32, i32),
    dx: i32,
    dy: i32,
) -> (u32, u32, i32, i32) {
    let (start_w, start_h) = start_size;
    let (start_ml, start_mt) = start_margin;
    let (mut new_w, mut new_h) = (start_w, start_h);

    if edge.left() {
        new_w = (start_w as i32 - dx).max(MIN_SIZE as i32) as u32;
    } else if edge.right() {
        new_w = (start_w as i32 + dx).max(MIN_SIZE as i32) as u32;
    }
    if edge.top() {
        new_h = (start_h as i32 - dy).max(MIN_SIZE as i32) as u32;
    } else if edge.bottom() {
        new_h = (start_h as i32 + dy).max(MIN_SIZE as i32) as u32;
    }

    new_w = new_w.min(MAX_SIZE);
    new_h = new_h.min(MAX_SIZE);

    // Check if resulting buffer would be too large
    let potential_buffer_size = new_w as usize * new_h as usize * 4;
    if potential_buffer_size > MAX_BUFFER_SIZE {
        let scale = (MAX_BUFFER_SIZE as f32 / potential_buffer_size as f32).sqrt();
        new_w = (new_w as f32 * scale) as u32;
        new_h = (new_h as f32 * scale) as u32;
        info!("Window size capped to {}x{}", new_w, new_h);
    }

    let new_ml = if edge.left() {
        start_ml + (start_w as i32 - new_w as i32)
    } else {
        start_ml
    };
    let new_mt = if edge.top() {
        start_mt + (start_h as i32 - new_h as i32)
    } else {
        start_mt
    };

    (new_w, new_h, new_ml, new_mt)
}

fn translate_key(event: &KeyEvent) -> Key {
    match event.keysym {
        Keysym::Escape => Key::Escape,
        Keysym::F1 => Key::F1,
        _ => event
            .utf8
            .as_deref()
            .and_then(|s| s.chars().next())
            .map(Key::Char)
            .unwrap_or(Key::Other),
    }
}

// Implement required traits for smithay-client-toolkit

impl CompositorHandler for WaylandApp {
    fn scale_factor_changed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _new_factor: i32,
    ) {
        debug!("Scale factor changed");
    }

    fn transform_changed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _new_transform: wl_output::Transform,
    ) {
        debug!("Transform changed");
    }

    fn frame(
        &mut self,
        _conn: &Connection,
        qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _time: u32,
    ) {
        if self.needs_redraw {
            self.draw(qh);
        }
    }

    fn surface_enter(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _output: &wl_output::WlOutput,
    ) {
    }

    fn surface_leave(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _output: &wl_output::WlOutput,
    ) {
    }
}

impl OutputHandler for WaylandApp {
    fn output_state(&mut self) -> &mut OutputState {
        &mut self.output_state
    }

    fn new_output(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _output: wl_output::WlOutput,
    ) {
        debug!("New output detected");
    }

    fn update_output(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _output: wl_output::WlOutput,
    ) {
        debug!("Output updated");
    }

    fn output_destroyed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _output: wl_output::WlOutput,
    ) {
        debug!("Output destroyed");
    }
}

impl LayerShellHandler for WaylandApp {
    fn closed(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, layer: &LayerSurface) {
        if self.is_help_surface(layer.wl_surface()) {
            self.close_help();
            return;
        }
        info!("Layer surface closed");
        self.should_exit = true;
    }

    fn configure(
        &mut self,
        _conn: &Connection,
        qh: &QueueHandle<Self>,
        layer: &LayerSurface,
        configure: LayerSurfaceConfigure,
        _serial: u32,
    ) {
        debug!("Layer surface configured: {:?}", configure);

        if self.is_help_surface(layer.wl_surface()) {
            if let Some(help) = self.help.as_mut() {
                if configure.new_size.0 > 0 && configure.new_size.1 > 0 {
                    help.width = configure.new_size.0;
                    help.height = configure.new_size.1;
                }
            }
            self.draw_help();
            return;
        }

        // While the user drags, our own size wins over the compositor's
        if !self.dragging && !self.resizing {
            if configure.new_size.0 > 0 {
                self.width = configure.new_size.0;
            }
            if configure.new_size.1 > 0 {
                self.height = configure.new_size.1;
            }
        } else if let Some(ref layer_surface) = self.layer_surface {
            layer_surface.set_size(self.width, self.height);
            layer_surface.commit();
        }

        if (self.width, self.height) != self.state.window_size() {
            self.state.on_window_resize(self.width, self.height);
        }

        if !self.configured && self.startup_prompt_pending {
            self.startup_prompt_pending = false;
            self.startup_open_at = Some(Instant::now() + STARTUP_OPEN_DELAY);
        }
        self.configured = true;
        self.needs_redraw = true;

        if self.use_gpu && !self.gpu_initialized {
            self.init_gpu_renderer();
        }

        self.draw(qh);
    }
}

impl SeatHandler for WaylandApp {
    fn seat_state(&mut self) -> &mut SeatState {
        &mut self.seat_state
    }

    fn new_seat(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, _seat: wl_seat::WlSeat) {
        debug!("New seat");
    }

    fn new_capability(
        &mut self,
        _conn: &Connection,
        qh: &QueueHandle<Self>,
        seat: wl_seat::WlSeat,
        capability: Capability,
    ) {
        debug!("New capability: {:?}", capability);

        if capability == Capability::Keyboard {
            if let Err(e) = self.seat_state.get_keyboard(qh, &seat, None) {
                error!("Failed to get keyboard: {}", e);
            }
        }
        if capability == Capability::Pointer {
            if let Err(e) = self.seat_state.get_pointer(qh, &seat) {
                error!("Failed to get pointer: {}", e);
            }
        }
    }

    fn remove_capability(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _seat: wl_seat::WlSeat,
        _capability: Capability,
    ) {
        debug!("Capability removed");
    }

    fn remove_seat(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, _seat: wl_seat::WlSeat) {
        debug!("Seat removed");
    }
}

impl KeyboardHandler for WaylandApp {
    fn enter(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _keyboard: &wl_keyboard::WlKeyboard,
        _surface: &wl_surface::WlSurface,
        _serial: u32,
        _raw: &[u32],
        _keysyms: &[Keysym],
    ) {
        debug!("Keyboard entered surface");
    }

    fn leave(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _keyboard: &wl_keyboard::WlKeyboard,
        _surface: &wl_surface::WlSurface,
        _serial: u32,
    ) {
        debug!("Keyboard left surface");
    }

    fn press_key(
        &mut self,
        _conn: &Connection,
        qh: &QueueHandle<Self>,
        _keyboard: &wl_keyboard::WlKeyboard,
        _serial: u32,
        event: KeyEvent,
    ) {
        debug!("Key pressed: {:?}", event.keysym);
        self.handle_key(qh, translate_key(&event));
    }

    fn release_key(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _keyboard: &wl_keyboard::WlKeyboard,
        _serial: u32,
        _event: KeyEvent,
    ) {
    }

    fn update_modifiers(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _keyboard: &wl_keyboard::WlKeyboard,
        _serial: u32,
        _modifiers: Modifiers,
        _layout: u32,
    ) {
    }
}

impl PointerHandler for WaylandApp {
    fn pointer_frame(
        &mut self,
        _conn: &Connection,
        qh: &QueueHandle<Self>,
        _pointer: &wl_pointer::WlPointer,
        events: &[PointerEvent],
    ) {
        for event in events {
            let on_help = self.is_help_surface(&event.surface);

            match event.kind {
                PointerEventKind::Enter { .. } => {
                    debug!("Pointer entered");
                    self.pointer_on_help = on_help;
                }
                PointerEventKind::Leave { .. } => {
                    debug!("Pointer left");
                    if !on_help {
                        self.dragging = false;
                        self.resizing = false;
                    }
                }
                PointerEventKind::Motion { .. } if !on_help => {
                    let (x, y) = event.position;
                    self.handle_pointer_motion(x, y);
                    if self.needs_redraw && !self.resizing {
                        self.draw(qh);
                    }
                }
                PointerEventKind::Press { .. } if on_help => {
                    // Any click dismisses the help popup
                    self.close_help();
                }
                PointerEventKind::Press { button, .. } => {
                    debug!("Pointer button pressed: {}", button);
                    if button == BTN_LEFT {
                        self.handle_left_press(qh);
                    } else if button == BTN_RIGHT {
                        self.show_menu(qh);
                    }
                }
                PointerEventKind::Release { button, .. } if !on_help => {
                    if button == BTN_LEFT {
                        let was_resizing = self.resizing;

                        self.dragging = false;
                        self.resizing = false;
                        self.resize_edge = ResizeEdge::None;

                        if was_resizing {
                            // Full quality redraw at the final size
                            self.needs_redraw = true;
                            self.draw(qh);
                        }
                    }
                }
                PointerEventKind::Axis { vertical, .. } if !on_help => {
                    if vertical.absolute != 0.0 {
                        let notches = if vertical.absolute > 0.0 { 1 } else { -1 };
                        if self.state.on_mouse_wheel(notches) {
                            self.needs_redraw = true;
                            self.draw(qh);
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

impl ShmHandler for WaylandApp {
    fn shm_state(&mut self) -> &mut Shm {
        &mut self.shm
    }
}

impl ProvidesRegistryState for WaylandApp {
    fn registry(&mut self) -> &mut RegistryState {
        &mut self.registry_state
    }

    registry_handlers![OutputState, SeatState];
}

// Delegate macros
delegate_compositor!(WaylandApp);
delegate_output!(WaylandApp);
delegate_layer!(WaylandApp);
delegate_seat!(WaylandApp);
delegate_keyboard!(WaylandApp);
delegate_pointer!(WaylandApp);
delegate_shm!(WaylandApp);
delegate_registry!(WaylandApp);

/// Run the Wayland application
pub fn run(image: Option<ImageData>, opacity: f32, use_gpu: bool) -> Result<()> {
    info!("Connecting to Wayland display");

    let conn = Connection::connect_to_env().context("Failed to connect to Wayland display")?;

    let (globals, mut event_queue) =
        registry_queue_init(&conn).context("Failed to initialize registry")?;
    let qh = event_queue.handle();

    let compositor_state =
        CompositorState::bind(&globals, &qh).context("Failed to bind compositor")?;
    let layer_shell = LayerShell::bind(&globals, &qh).context("Failed to bind layer shell")?;
    let shm = Shm::bind(&globals, &qh).context("Failed to bind shm")?;

    // Get the display pointer for GPU rendering
    let display_ptr = conn.backend().display_ptr() as *mut std::ffi::c_void;

    let mut state = AppState::new(opacity);
    let initial_image_size = image.as_ref().map(|image| (image.width, image.height));
    if let Some(image) = image {
        state.set_image(image);
    }

    let mut app = WaylandApp::new(
        RegistryState::new(&globals),
        SeatState::new(&globals, &qh),
        OutputState::new(&globals, &qh),
        shm,
        layer_shell,
        compositor_state,
        display_ptr,
        state,
        use_gpu,
    );

    // Dispatch once to get output info
    event_queue.roundtrip(&mut app)?;

    let (display_width, display_height) = get_display_dimensions(&app.output_state);
    app.display_width = display_width;
    app.display_height = display_height;
    info!("Display dimensions: {}x{}", display_width, display_height);

    // Limit the window to 20% of the screen area
    let (target_width, target_height) = match initial_image_size {
        Some((img_width, img_height)) => {
            let size =
                calculate_limited_size(img_width, img_height, display_width, display_height, 0.20);
            info!(
                "Image size: {}x{} -> Window size: {}x{}",
                img_width, img_height, size.0, size.1
            );
            size
        }
        None => EMPTY_WINDOW_SIZE,
    };
    let target_width = target_width.clamp(MIN_SIZE, MAX_SIZE);
    let target_height = target_height.clamp(MIN_SIZE, MAX_SIZE);

    // Centered initial position
    app.margin_left = (display_width.saturating_sub(target_width) / 2) as i32;
    app.margin_top = (display_height.saturating_sub(target_height) / 2) as i32;
    app.width = target_width;
    app.height = target_height;
    app.state.on_window_resize(target_width, target_height);

    let surface = app.compositor_state.create_surface(&qh);
    let layer_surface = app.layer_shell.create_layer_surface(
        &qh,
        surface,
        Layer::Overlay,
        Some("seethru"),
        None,
    );

    layer_surface.set_anchor(Anchor::TOP | Anchor::LEFT);
    layer_surface.set_margin(app.margin_top, 0, 0, app.margin_left);
    layer_surface.set_size(target_width, target_height);
    layer_surface.set_keyboard_interactivity(KeyboardInteractivity::OnDemand);

    // Commit the surface to trigger configure
    layer_surface.commit();

    app.layer_surface = Some(layer_surface);

    info!("Starting event loop");
    info!("Controls: 1-9/0 opacity, l resize lock, k scroll lock, right-click for menu");

    loop {
        event_queue.blocking_dispatch(&mut app)?;

        if app.should_exit {
            info!("Exiting application");
            break;
        }

        // One-shot timer: the first configure armed it, fire once the window is up
        if let Some(open_at) = app.startup_open_at.take() {
            conn.flush().context("Failed to flush Wayland connection")?;
            std::thread::sleep(open_at.saturating_duration_since(Instant::now()));
            app.open_image(&qh);
        }
    }

    Ok(())
}

/// Get display dimensions from the output state
fn get_display_dimensions(output_state: &OutputState) -> (u32, u32) {
    for output in output_state.outputs() {
        if let Some(info) = output_state.info(&output) {
            if let Some(mode) = info.modes.iter().find(|m| m.current) {
                return (mode.dimensions.0 as u32, mode.dimensions.1 as u32);
            }
            if let Some(mode) = info.modes.first() {
                return (mode.dimensions.0 as u32, mode.dimensions.1 as u32);
            }
        }
    }
    (1920, 1080)
}

/// Calculate the display size limited to a percentage of screen area
fn calculate_limited_size(
    img_width: u32,
    img_height: u32,
    screen_width: u32,
    screen_height: u32,
    max_screen_fraction: f32,
) -> (u32, u32) {
    let max_width = (screen_width as f32 * max_screen_fraction.sqrt()) as u32;
    let max_height = (screen_height as f32 * max_screen_fraction.sqrt()) as u32;

    if img_width <= max_width && img_height <= max_height {
        return (img_width, img_height);
    }

    let scale_x = max_width as f32 / img_width as f32;
    let scale_y = max_height as f32 / img_height as f32;
    let scale = scale_x.min(scale_y);

    let new_width = (img_width as f32 * scale) as u32;
    let new_height = (img_height as f32 * scale) as u32;

    (new_width.max(1), new_height.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limited_size_small_image_unchanged() {
        assert_eq!(calculate_limited_size(300, 200, 1920, 1080, 0.20), (300, 200));
    }

    #[test]
    fn test_limited_size_keeps_ratio() {
        let (w, h) = calculate_limited_size(4000, 2000, 1920, 1080, 0.20);
        assert!(w <= 859 && h <= 483);
        assert!((w as f32 / h as f32 - 2.0).abs() < 0.01);
    }

    #[test]
    fn test_detect_resize_edge() {
        assert_eq!(detect_resize_edge(200, 100, 2.0, 2.0), ResizeEdge::TopLeft);
        assert_eq!(detect_resize_edge(200, 100, 198.0, 98.0), ResizeEdge::BottomRight);
        assert_eq!(detect_resize_edge(200, 100, 100.0, 2.0), ResizeEdge::Top);
        assert_eq!(detect_resize_edge(200, 100, 100.0, 50.0), ResizeEdge::None);
    }

    #[test]
    fn test_resize_from_top_left_keeps_bottom_right() {
        let (w, h, ml, mt) = resize_window(ResizeEdge::TopLeft, (200, 100), (50, 60), -30, -10);
        assert_eq!((w, h), (230, 110));
        assert_eq!((ml, mt), (20, 50));
        // Bottom-right corner stays put
        assert_eq!(ml + w as i32, 250);
        assert_eq!(mt + h as i32, 160);
    }

    #[test]
    fn test_resize_respects_minimum() {
        let (w, h, ml, _) = resize_window(ResizeEdge::Left, (100, 100), (0, 0), 500, 0);
        assert_eq!((w, h), (MIN_SIZE, 100));
        assert_eq!(ml, 100 - MIN_SIZE as i32);

        let (w, h, _, _) = resize_window(ResizeEdge::BottomRight, (100, 100), (0, 0), -500, -500);
        assert_eq!((w, h), (MIN_SIZE, MIN_SIZE));
    }

    #[test]
    fn test_resize_right_edge_only_changes_width() {
        let (w, h, ml, mt) = resize_window(ResizeEdge::Right, (100, 80), (5, 6), 40, 99);
        assert_eq!((w, h, ml, mt), (140, 80, 5, 6));
    }

    #[test]
    fn test_menu_hit_testing() {
        let pos = (10, 20);
        assert_eq!(menu_item_at(pos, 15.0, 25.0), Some(0));
        assert_eq!(menu_item_at(pos, 15.0, 20.0 + MENU_ITEM_HEIGHT as f64 * 2.5), Some(2));
        assert_eq!(menu_item_at(pos, 5.0, 25.0), None);
        assert_eq!(menu_item_at(pos, 15.0, 20.0 + MENU_ITEM_HEIGHT as f64 * 3.0), None);
    }

    #[test]
    fn test_menu_stays_in_window() {
        assert_eq!(clamp_menu_pos((390, 290), 400, 300), (260, 225));
        assert_eq!(clamp_menu_pos((5, 5), 400, 300), (5, 5));
        // Window smaller than the menu
        assert_eq!(clamp_menu_pos((20, 20), 60, 40), (0, 0));
    }
}
