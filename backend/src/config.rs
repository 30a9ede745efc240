use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DEFAULT_CONFIG_PATH: &str = "config/analysis.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub image: ImageConfig,
    pub uncertainty: UncertaintyConfig,
    pub severity: SeverityConfig,
    pub fusion: FusionConfig,
    pub assessor: AssessorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub input_size: u32,
    pub max_bytes: usize,
    pub min_dimension: u32,
    pub max_dimension: u32,
}

/// Thresholds consulted by the uncertainty detector and by Stage A of fusion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UncertaintyConfig {
    pub high_confidence_threshold: f32,
    pub low_confidence_threshold: f32,
    pub uncertainty_band_lower: f32,
    pub uncertainty_band_upper: f32,
    pub texture_variance_low: f32,
    pub texture_variance_high: f32,
    pub confidence_texture_mismatch_threshold: f32,
    pub min_uncertainty_factors: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityConfig {
    pub severe_threshold: f32,
    pub moderate_threshold: f32,
}

/// Bars an external verdict must clear before it may change the local decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub negative_override_confidence: f32,
    pub positive_override_confidence: f32,
    pub positive_override_min_probability: f32,
    pub positive_unconditional_confidence: f32,
    pub uncertain_positive_confidence: f32,
    pub uncertain_negative_confidence: f32,
    pub borderline_lower: f32,
    pub borderline_upper: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssessorConfig {
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("models/eczema_detector.pt"),
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            input_size: 224,
            max_bytes: 10 * 1024 * 1024,
            min_dimension: 50,
            max_dimension: 10_000,
        }
    }
}

impl Default for UncertaintyConfig {
    fn default() -> Self {
        Self {
            high_confidence_threshold: 0.60,
            low_confidence_threshold: 0.40,
            uncertainty_band_lower: 0.40,
            uncertainty_band_upper: 0.60,
            texture_variance_low: 10.0,
            texture_variance_high: 5000.0,
            confidence_texture_mismatch_threshold: 0.15,
            min_uncertainty_factors: 2,
        }
    }
}

impl Default for SeverityConfig {
    fn default() -> Self {
        Self {
            severe_threshold: 0.85,
            moderate_threshold: 0.70,
        }
    }
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            negative_override_confidence: 0.90,
            positive_override_confidence: 0.70,
            positive_override_min_probability: 0.15,
            positive_unconditional_confidence: 0.80,
            uncertain_positive_confidence: 0.65,
            uncertain_negative_confidence: 0.70,
            borderline_lower: 0.20,
            borderline_upper: 0.40,
        }
    }
}

impl Default for AssessorConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gemma-3-27b-it".into(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".into(),
            timeout_secs: 30,
            max_retries: 2,
            backoff_base_ms: 1000,
        }
    }
}

impl ServiceConfig {
    /// Defaults, then the YAML file (if any), then environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("ANALYSIS_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(config_str: &str) -> Result<Self, ConfigError> {
        let config: ServiceConfig = serde_yaml::from_str(config_str)?;
        Ok(config)
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = &lookup;
        override_with(lookup, "HOST", &mut self.server.host)?;
        override_with(lookup, "PORT", &mut self.server.port)?;
        override_with(lookup, "MODEL_PATH", &mut self.model.path)?;
        override_with(lookup, "MODEL_INPUT_SIZE", &mut self.image.input_size)?;

        let u = &mut self.uncertainty;
        override_with(lookup, "HIGH_CONFIDENCE_THRESHOLD", &mut u.high_confidence_threshold)?;
        override_with(lookup, "LOW_CONFIDENCE_THRESHOLD", &mut u.low_confidence_threshold)?;
        override_with(lookup, "UNCERTAINTY_BAND_LOWER", &mut u.uncertainty_band_lower)?;
        override_with(lookup, "UNCERTAINTY_BAND_UPPER", &mut u.uncertainty_band_upper)?;
        override_with(lookup, "TEXTURE_VARIANCE_LOW", &mut u.texture_variance_low)?;
        override_with(lookup, "TEXTURE_VARIANCE_HIGH", &mut u.texture_variance_high)?;
        override_with(
            lookup,
            "CONFIDENCE_TEXTURE_MISMATCH",
            &mut u.confidence_texture_mismatch_threshold,
        )?;
        override_with(lookup, "MIN_UNCERTAINTY_FACTORS", &mut u.min_uncertainty_factors)?;

        let a = &mut self.assessor;
        if let Some(key) = lookup("GEMINI_API_KEY").filter(|k| !k.trim().is_empty()) {
            a.api_key = Some(key);
        }
        override_with(lookup, "GEMINI_MODEL", &mut a.model)?;
        override_with(lookup, "GEMINI_BASE_URL", &mut a.base_url)?;
        override_with(lookup, "ASSESSOR_TIMEOUT_SECS", &mut a.timeout_secs)?;
        override_with(lookup, "ASSESSOR_MAX_RETRIES", &mut a.max_retries)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let u = &self.uncertainty;
        for (name, value) in [
            ("high_confidence_threshold", u.high_confidence_threshold),
            ("low_confidence_threshold", u.low_confidence_threshold),
            ("uncertainty_band_lower", u.uncertainty_band_lower),
            ("uncertainty_band_upper", u.uncertainty_band_upper),
            ("confidence_texture_mismatch_threshold", u.confidence_texture_mismatch_threshold),
            ("severe_threshold", self.severity.severe_threshold),
            ("moderate_threshold", self.severity.moderate_threshold),
            ("negative_override_confidence", self.fusion.negative_override_confidence),
            ("positive_override_confidence", self.fusion.positive_override_confidence),
            ("positive_override_min_probability", self.fusion.positive_override_min_probability),
            ("positive_unconditional_confidence", self.fusion.positive_unconditional_confidence),
            ("uncertain_positive_confidence", self.fusion.uncertain_positive_confidence),
            ("uncertain_negative_confidence", self.fusion.uncertain_negative_confidence),
            ("borderline_lower", self.fusion.borderline_lower),
            ("borderline_upper", self.fusion.borderline_upper),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if u.low_confidence_threshold > u.high_confidence_threshold {
            return Err(ConfigError::Invalid(
                "low_confidence_threshold exceeds high_confidence_threshold".into(),
            ));
        }
        if u.uncertainty_band_lower > u.uncertainty_band_upper {
            return Err(ConfigError::Invalid(
                "uncertainty_band_lower exceeds uncertainty_band_upper".into(),
            ));
        }
        if u.texture_variance_low > u.texture_variance_high {
            return Err(ConfigError::Invalid(
                "texture_variance_low exceeds texture_variance_high".into(),
            ));
        }
        if self.severity.moderate_threshold > self.severity.severe_threshold {
            return Err(ConfigError::Invalid(
                "moderate_threshold exceeds severe_threshold".into(),
            ));
        }
        if self.fusion.borderline_lower > self.fusion.borderline_upper {
            return Err(ConfigError::Invalid(
                "borderline_lower exceeds borderline_upper".into(),
            ));
        }
        if self.image.input_size == 0 {
            return Err(ConfigError::Invalid("image.input_size must be positive".into()));
        }
        if self.image.min_dimension > self.image.max_dimension {
            return Err(ConfigError::Invalid(
                "image.min_dimension exceeds image.max_dimension".into(),
            ));
        }
        if self.assessor.max_retries > 5 {
            return Err(ConfigError::Invalid(
                "assessor.max_retries must not exceed 5".into(),
            ));
        }
        url::Url::parse(&self.assessor.base_url).map_err(|e| {
            ConfigError::Invalid(format!("assessor.base_url is not a valid URL: {}", e))
        })?;
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn override_with<F, T>(lookup: &F, key: &'static str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value: raw })?;
    }
    Ok(())
}
