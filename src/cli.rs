// Command line interface module
// Handles parsing of command line arguments

use clap::Parser;
use std::path::PathBuf;

/// seethru - A see-through image overlay for tracing on Wayland
#[derive(Parser, Debug)]
#[command(name = "seethru")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to a PNG or JPEG image (a file dialog opens when omitted)
    #[arg(value_name = "IMAGE")]
    pub image_path: Option<PathBuf>,

    /// Initial opacity of the image (0.0 - 1.0)
    #[arg(short, long, default_value = "1.0", value_parser = parse_opacity)]
    pub opacity: f32,

    /// Disable GPU rendering and use CPU rendering only
    #[arg(long, default_value = "false")]
    pub cpu: bool,
}

/// Parsed arguments
#[derive(Debug)]
pub struct ParsedArgs {
    pub image_path: Option<PathBuf>,
    pub opacity: f32,
    /// Use GPU rendering (default true, set to false with --cpu)
    pub use_gpu: bool,
}

/// Parse opacity value and ensure it's within valid range
fn parse_opacity(s: &str) -> Result<f32, String> {
    let opacity: f32 = s.parse().map_err(|_| "Invalid opacity value")?;
    if !(0.0..=1.0).contains(&opacity) {
        return Err("Opacity must be between 0.0 and 1.0".to_string());
    }
    Ok(opacity)
}

impl From<Args> for ParsedArgs {
    fn from(args: Args) -> Self {
        Self {
            image_path: args.image_path,
            opacity: args.opacity,
            use_gpu: !args.cpu, // GPU is default, --cpu disables it
        }
    }
}

/// Parse command line arguments
pub fn parse_args() -> ParsedArgs {
    Args::parse().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opacity_range() {
        assert_eq!(parse_opacity("0.5"), Ok(0.5));
        assert_eq!(parse_opacity("0"), Ok(0.0));
        assert_eq!(parse_opacity("1"), Ok(1.0));
        assert!(parse_opacity("1.5").is_err());
        assert!(parse_opacity("-0.1").is_err());
        assert!(parse_opacity("half").is_err());
    }

    #[test]
    fn test_defaults_without_image() {
        let args: ParsedArgs = Args::try_parse_from(["seethru"]).unwrap().into();
        assert!(args.image_path.is_none());
        assert_eq!(args.opacity, 1.0);
        assert!(args.use_gpu);
    }

    #[test]
    fn test_image_and_flags() {
        let args: ParsedArgs =
            Args::try_parse_from(["seethru", "plan.png", "--opacity", "0.3", "--cpu"])
                .unwrap()
                .into();
        assert_eq!(args.image_path, Some(PathBuf::from("plan.png")));
        assert_eq!(args.opacity, 0.3);
        assert!(!args.use_gpu);
    }
}
