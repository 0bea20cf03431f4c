//! # Engine Configuration
//!
//! Surface geometry, render-context zoom levels, date rendering and logging.
//!
//! ## Usage
//!
//! ```
//! use diploma::config::EngineConfig;
//!
//! let config = EngineConfig::default();
//! assert_eq!(config.export_zoom, 4.0);
//! assert_eq!(config.surface_width, 842);
//! ```
//!
//! Every field has a default, so a config file only needs the keys it
//! overrides:
//!
//! ```json
//! { "surface_width": 1123, "surface_height": 794, "dates": { "format": "%d.%m.%Y" } }
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::DiplomaError;

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Logical surface width (edit canvas pixels).
    pub surface_width: u32,
    /// Logical surface height (edit canvas pixels).
    pub surface_height: u32,
    /// Zoom of the per-recipient thumbnail grid.
    pub preview_zoom: f64,
    /// Zoom of full-resolution exports.
    pub export_zoom: f64,
    /// Multiplier of the thumbnail sent along with a template save.
    pub save_thumbnail_multiplier: f64,
    /// Supersampling factor for PDF first-page rasterization.
    pub pdf_scale: f64,
    /// Largest raster a payload may decode to, in pixels.
    pub max_raster_pixels: u64,
    /// Fail a recipient export when any of its fields failed to render.
    pub strict_exports: bool,
    /// Recipient exports rendered at the same time.
    pub export_concurrency: usize,
    /// Extra directories scanned for fonts, in addition to system fonts.
    pub font_dirs: Vec<PathBuf>,
    /// How `${tournament.date}` and export filenames render dates.
    pub dates: DateStyle,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Calendar date rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DateStyle {
    /// chrono format pattern for `${tournament.date}`.
    pub format: String,
    /// Offset from UTC, in minutes, of the calendar the date is read in.
    pub utc_offset_minutes: i32,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "diploma=debug,warn").
    pub level: String,

    /// Whether to output structured JSON logs.
    pub json: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            // A4 landscape at 72 dpi
            surface_width: 842,
            surface_height: 595,
            preview_zoom: 0.3033,
            export_zoom: 4.0,
            save_thumbnail_multiplier: 0.2,
            pdf_scale: 2.0,
            max_raster_pixels: crate::loader::DEFAULT_MAX_PIXELS,
            strict_exports: true,
            export_concurrency: std::thread::available_parallelism().map_or(4, |n| n.get()),
            font_dirs: Vec::new(),
            dates: DateStyle::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for DateStyle {
    fn default() -> Self {
        Self {
            format: "%-m/%-d/%Y".to_string(),
            utc_offset_minutes: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl EngineConfig {
    /// Load a configuration from a JSON file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, DiplomaError> {
        let raw = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&raw).map_err(|e| {
            DiplomaError::Configuration(format!("Invalid config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject geometry that cannot produce a raster.
    pub fn validate(&self) -> Result<(), DiplomaError> {
        if self.surface_width == 0 || self.surface_height == 0 {
            return Err(DiplomaError::Configuration(
                "surface dimensions must be non-zero".to_string(),
            ));
        }
        if self.max_raster_pixels == 0 || self.export_concurrency == 0 {
            return Err(DiplomaError::Configuration(
                "max_raster_pixels and export_concurrency must be non-zero".to_string(),
            ));
        }
        for (name, zoom) in [
            ("preview_zoom", self.preview_zoom),
            ("export_zoom", self.export_zoom),
            ("save_thumbnail_multiplier", self.save_thumbnail_multiplier),
            ("pdf_scale", self.pdf_scale),
        ] {
            if !(zoom.is_finite() && zoom > 0.0) {
                return Err(DiplomaError::Configuration(format!(
                    "{} must be a positive number, got {}",
                    name, zoom
                )));
            }
        }
        Ok(())
    }
}
