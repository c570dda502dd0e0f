// seethru - A see-through image overlay for Wayland
// Shows an image above all windows with adjustable opacity, for tracing and reference

mod app;
mod cli;
mod cpu_renderer;
mod image_loader;
mod text;
mod wayland;
mod wgpu_renderer;

use anyhow::{Context, Result};
use log::info;

fn main() -> Result<()> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = cli::parse_args();

    info!(
        "Starting seethru with image: {:?}, opacity: {}",
        args.image_path, args.opacity
    );

    // An image named on the command line must load; without one the
    // window opens empty and asks for a file
    let image = match &args.image_path {
        Some(path) => {
            let image = image_loader::load_image(path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            info!("Image loaded: {}x{} pixels", image.width, image.height);
            Some(image)
        }
        None => None,
    };

    info!("Using layer-shell overlay mode (GPU: {})", args.use_gpu);
    wayland::run(image, args.opacity, args.use_gpu)
}
