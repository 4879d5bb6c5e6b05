//! Reservoir configuration
//!
//! Tunable constants of the prefetch and eviction policy. Configuration can
//! be loaded from a file, environment variables, or created programmatically.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

/// Environment variable overriding [`ReservoirConfig::corona_margin`]
pub const ENV_CORONA_MARGIN: &str = "TILE_RESERVOIR_CORONA_MARGIN";

/// Environment variable overriding [`ReservoirConfig::tile_threshold`]
pub const ENV_TILE_THRESHOLD: &str = "TILE_RESERVOIR_TILE_THRESHOLD";

/// Environment variable overriding [`ReservoirConfig::area_threshold`]
pub const ENV_AREA_THRESHOLD: &str = "TILE_RESERVOIR_AREA_THRESHOLD";

/// Policy constants for a [`TileReservoir`](crate::TileReservoir).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReservoirConfig {
    /// Pixels the viewport is grown by on each side to form the corona
    pub corona_margin: i32,

    /// Combined old+new viewport area, in tiles, below which prefetching is skipped
    pub tile_threshold: u32,

    /// Overlap ratio below which a viewport change triggers a corona prefetch
    pub area_threshold: f64,
}

impl Default for ReservoirConfig {
    fn default() -> Self {
        Self {
            corona_margin: 300,
            tile_threshold: 10,
            area_threshold: 0.2,
        }
    }
}

impl ReservoirConfig {
    /// Creates a configuration from explicit values.
    ///
    /// # Errors
    /// Returns an error if the values fail [`validate`](Self::validate).
    pub fn new(
        corona_margin: i32,
        tile_threshold: u32,
        area_threshold: f64,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            corona_margin,
            tile_threshold,
            area_threshold,
        };
        config.validate()?;
        Ok(config)
    }

    /// Sets the corona margin in pixels.
    pub fn with_corona_margin(mut self, margin: i32) -> Self {
        self.corona_margin = margin;
        self
    }

    /// Sets the tile-count threshold.
    pub fn with_tile_threshold(mut self, tiles: u32) -> Self {
        self.tile_threshold = tiles;
        self
    }

    /// Sets the overlap ratio threshold.
    pub fn with_area_threshold(mut self, ratio: f64) -> Self {
        self.area_threshold = ratio;
        self
    }

    /// Checks that every value is in range.
    ///
    /// # Errors
    /// Returns [`ConfigError::OutOfRange`] naming the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.corona_margin < 0 {
            return Err(ConfigError::OutOfRange {
                key: "corona_margin",
                value: self.corona_margin.to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.area_threshold) {
            return Err(ConfigError::OutOfRange {
                key: "area_threshold",
                value: self.area_threshold.to_string(),
            });
        }
        Ok(())
    }

    /// Loads configuration from environment variables on top of the defaults.
    ///
    /// Environment variables:
    /// - `TILE_RESERVOIR_CORONA_MARGIN`: corona margin in pixels (default: 300)
    /// - `TILE_RESERVOIR_TILE_THRESHOLD`: tile-count threshold (default: 10)
    /// - `TILE_RESERVOIR_AREA_THRESHOLD`: overlap ratio threshold (default: 0.2)
    ///
    /// # Errors
    /// Returns an error if any variable is unparsable or out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().merge_env()
    }

    /// Applies environment variable overrides to this configuration.
    ///
    /// # Errors
    /// Returns an error if any variable is unparsable or out of range.
    pub fn merge_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(val) = std::env::var(ENV_CORONA_MARGIN) {
            self.corona_margin = parse_value(ENV_CORONA_MARGIN, &val)?;
        }

        if let Ok(val) = std::env::var(ENV_TILE_THRESHOLD) {
            self.tile_threshold = parse_value(ENV_TILE_THRESHOLD, &val)?;
        }

        if let Ok(val) = std::env::var(ENV_AREA_THRESHOLD) {
            self.area_threshold = parse_value(ENV_AREA_THRESHOLD, &val)?;
        }

        self.validate()?;
        Ok(self)
    }

    /// Loads configuration from a `key = value` file.
    ///
    /// Expected file format:
    /// ```text
    /// # comments are ignored
    /// corona_margin = 300
    /// tile_threshold = 10
    /// area_threshold = 0.2
    /// ```
    ///
    /// Missing keys keep their defaults; unknown keys are ignored.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or a value is invalid.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::parse(&contents)
    }

    /// Parses configuration from the `key = value` format.
    ///
    /// # Errors
    /// Returns an error if a value is unparsable or out of range.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim().trim_matches('"');

            match key {
                "corona_margin" => config.corona_margin = parse_value("corona_margin", value)?,
                "tile_threshold" => config.tile_threshold = parse_value("tile_threshold", value)?,
                "area_threshold" => config.area_threshold = parse_value("area_threshold", value)?,
                _ => {}
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Saves configuration to a file readable by [`from_file`](Self::from_file).
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path.as_ref(), self.to_config_string())?;
        Ok(())
    }

    fn to_config_string(&self) -> String {
        format!(
            "# Tile reservoir configuration\n\
             corona_margin = {}\n\
             tile_threshold = {}\n\
             area_threshold = {}\n",
            self.corona_margin, self.tile_threshold, self.area_threshold
        )
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Errors that can occur during configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A value could not be parsed
    #[error("invalid value {value:?} for configuration key {key}")]
    InvalidValue { key: String, value: String },

    /// A value parsed but is outside its allowed range
    #[error("value {value} is out of range for configuration key {key}")]
    OutOfRange { key: &'static str, value: String },

    /// Reading or writing a configuration file failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
