use serde::Deserialize;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub address: String,
    /// Seconds to wait for an upstream fetch or for an image to settle.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// When set, local images are read from this directory instead of over HTTP.
    #[serde(default)]
    pub static_root: Option<String>,
    #[serde(default)]
    pub compression: CompressionConfig,
}

fn default_timeout() -> u64 {
    30
}

impl AppConfig {
    /// True when images would be fetched over HTTP from this very server,
    /// which serves none, so every pipeline would fall back to the original.
    pub fn fetches_from_self(&self) -> bool {
        if self.static_root.is_some() {
            return false;
        }
        let Ok(origin) = self.compression.origin_url() else {
            return false;
        };
        let local = match origin.host_str() {
            Some("localhost" | "127.0.0.1" | "0.0.0.0") => true,
            Some(host) => host == self.address,
            None => false,
        };
        local && origin.port_or_known_default() == Some(self.port)
    }
}

/// Static settings for the image interceptor.
///
/// Immutable once the service is built.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CompressionConfig {
    /// Lossy quality of the final re-encode, 0.0 to 1.0.
    pub quality: f32,
    pub max_width: u32,
    pub max_height: u32,
    /// Images whose natural width AND height are both below these are left alone.
    pub min_width: u32,
    pub min_height: u32,
    pub exclude_paths: Vec<String>,
    pub exclude_extensions: Vec<String>,
    pub opt_out_key: String,
    pub opt_out_value: String,
    pub debug: bool,
    /// Origin that counts as "local". Relative URLs are resolved against it.
    pub origin: String,
    /// Quality of the first raster export, before the bounded re-encode.
    pub export_quality: f32,
    /// Largest raster surface we agree to allocate.
    pub max_canvas_pixels: u64,
    /// Queue duplicate assignments behind the running pipeline instead of
    /// handing them the original URL.
    pub coalesce_in_flight: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            quality: 0.8,
            max_width: 1920,
            max_height: 1080,
            min_width: 300,
            min_height: 300,
            exclude_paths: vec!["/favicon".to_string(), "/icons/".to_string()],
            exclude_extensions: vec![".svg".to_string(), ".gif".to_string(), ".ico".to_string()],
            opt_out_key: "nocompress".to_string(),
            opt_out_value: "true".to_string(),
            debug: false,
            origin: "http://localhost:8000".to_string(),
            export_quality: 0.92,
            max_canvas_pixels: 16384 * 16384,
            coalesce_in_flight: false,
        }
    }
}

impl CompressionConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: CompressionConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.quality) {
            return Err(ConfigError::Invalid(format!(
                "quality must be between 0 and 1, got {}",
                self.quality
            )));
        }
        if !(0.0..=1.0).contains(&self.export_quality) {
            return Err(ConfigError::Invalid(format!(
                "export_quality must be between 0 and 1, got {}",
                self.export_quality
            )));
        }
        if self.max_width == 0 || self.max_height == 0 {
            return Err(ConfigError::Invalid("max_width and max_height must be non-zero".to_string()));
        }
        if self.min_width > self.max_width || self.min_height > self.max_height {
            return Err(ConfigError::Invalid(format!(
                "minimum size {}x{} exceeds maximum size {}x{}",
                self.min_width, self.min_height, self.max_width, self.max_height
            )));
        }
        if self.opt_out_key.is_empty() {
            return Err(ConfigError::Invalid("opt_out_key must not be empty".to_string()));
        }
        self.origin_url()?;
        Ok(())
    }

    pub fn origin_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.origin)
            .map_err(|e| ConfigError::Invalid(format!("origin '{}' is not a valid URL: {}", self.origin, e)))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(ConfigError::Invalid(format!("origin scheme must be http or https, got '{}'", other))),
        }
    }

    /// The `key=value` pair that marks a URL as opted out.
    pub fn opt_out_marker(&self) -> String {
        format!("{}={}", self.opt_out_key, self.opt_out_value)
    }

    /// JPEG encoders take quality as 1..=100.
    pub fn jpeg_quality(&self) -> u8 {
        to_jpeg_quality(self.quality)
    }

    pub fn export_jpeg_quality(&self) -> u8 {
        to_jpeg_quality(self.export_quality)
    }
}

fn to_jpeg_quality(quality: f32) -> u8 {
    ((quality * 100.0).round() as i32).clamp(1, 100) as u8
}
