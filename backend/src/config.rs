use std::collections::HashMap;
use std::env;
use std::time::Duration;
use url::Url;

use crate::storage::uploader::MAX_UPLOAD_ATTEMPTS;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
    pub max_bytes: usize,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_UPLOAD_ATTEMPTS,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(30),
            max_bytes: 50 * 1024 * 1024,
        }
    }
}

impl UploadPolicy {
    /// Longest a single upload can take: every attempt timing out plus the
    /// largest backoff, jitter included, between attempts.
    pub fn worst_case(&self) -> Duration {
        let attempts = self.max_attempts.clamp(1, MAX_UPLOAD_ATTEMPTS);
        let pause = self.max_delay + self.base_delay / 2;
        self.attempt_timeout * attempts + pause * (attempts - 1)
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub bucket: String,
    pub region: String,
    pub endpoint_url: Option<String>,
    pub public_base_url: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TableConfig {
    pub submissions_table: String,
    pub provenance_table: String,
}

#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub base_url: Url,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_in_flight: usize,
    pub stage_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 4,
            stage_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReportConfig {
    pub facility_name: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            facility_name: "Medical Screening Service".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub jwt_secret: String,
    pub storage: StorageConfig,
    pub tables: TableConfig,
    pub inference: InferenceConfig,
    pub upload: UploadPolicy,
    pub pipeline: PipelineConfig,
    pub report: ReportConfig,
}

struct Settings {
    file: HashMap<String, String>,
}

impl Settings {
    fn get(&self, key: &'static str) -> Option<String> {
        env::var(key)
            .ok()
            .or_else(|| self.file.get(key).cloned())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.get(key).ok_or(ConfigError::Missing(key))
    }

    fn parsed<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid {
                key,
                reason: e.to_string(),
            }),
            None => Ok(default),
        }
    }
}

fn yaml_scalar(value: serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl AppConfig {
    /// Defaults, then `PIPELINE_CONFIG_FILE`, then `.env`, then the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        let file = match env::var("PIPELINE_CONFIG_FILE") {
            Ok(path) => Self::read_file_layer(&path)?,
            Err(_) => HashMap::new(),
        };
        Self::from_settings(Settings { file })
    }

    fn read_file_layer(path: &str) -> Result<HashMap<String, String>, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        Self::parse_file_layer(&raw)
    }

    fn parse_file_layer(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
        // Keys mirror the environment variable names, case-insensitively.
        let layer: HashMap<String, serde_yaml::Value> = serde_yaml::from_str(raw)?;
        Ok(layer
            .into_iter()
            .filter_map(|(k, v)| yaml_scalar(v).map(|v| (k.to_ascii_uppercase(), v)))
            .collect())
    }

    fn from_settings(settings: Settings) -> Result<Self, ConfigError> {
        let upload_defaults = UploadPolicy::default();
        let pipeline_defaults = PipelineConfig::default();

        let max_attempts: u32 = settings.parsed("UPLOAD_MAX_ATTEMPTS", upload_defaults.max_attempts)?;
        if !(1..=MAX_UPLOAD_ATTEMPTS).contains(&max_attempts) {
            return Err(ConfigError::Invalid {
                key: "UPLOAD_MAX_ATTEMPTS",
                reason: format!("must be between 1 and {}", MAX_UPLOAD_ATTEMPTS),
            });
        }

        let max_in_flight: usize =
            settings.parsed("PIPELINE_MAX_IN_FLIGHT", pipeline_defaults.max_in_flight)?;
        if max_in_flight == 0 {
            return Err(ConfigError::Invalid {
                key: "PIPELINE_MAX_IN_FLIGHT",
                reason: "must be at least 1".to_string(),
            });
        }

        let base_url_raw = settings.required("INFERENCE_BASE_URL")?;
        let base_url = Url::parse(&base_url_raw).map_err(|e| ConfigError::Invalid {
            key: "INFERENCE_BASE_URL",
            reason: e.to_string(),
        })?;

        let upload = UploadPolicy {
            max_attempts,
            base_delay: Duration::from_millis(settings.parsed(
                "UPLOAD_BASE_DELAY_MS",
                upload_defaults.base_delay.as_millis() as u64,
            )?),
            max_delay: Duration::from_millis(settings.parsed(
                "UPLOAD_MAX_DELAY_MS",
                upload_defaults.max_delay.as_millis() as u64,
            )?),
            attempt_timeout: Duration::from_secs(settings.parsed(
                "UPLOAD_ATTEMPT_TIMEOUT_SECS",
                upload_defaults.attempt_timeout.as_secs(),
            )?),
            max_bytes: settings.parsed("UPLOAD_MAX_BYTES", upload_defaults.max_bytes)?,
        };
        let stage_timeout = Duration::from_secs(settings.parsed(
            "STAGE_TIMEOUT_SECS",
            pipeline_defaults.stage_timeout.as_secs(),
        )?);
        if stage_timeout < upload.worst_case() {
            return Err(ConfigError::Invalid {
                key: "STAGE_TIMEOUT_SECS",
                reason: format!(
                    "must cover a full upload with retries ({}s)",
                    upload.worst_case().as_secs_f64().ceil()
                ),
            });
        }

        let jwt_secret = settings.required("JWT_SECRET")?;
        if jwt_secret.len() < 16 {
            return Err(ConfigError::Invalid {
                key: "JWT_SECRET",
                reason: "must be at least 16 characters".to_string(),
            });
        }

        Ok(Self {
            port: settings.parsed("PORT", 8081)?,
            jwt_secret,
            storage: StorageConfig {
                bucket: settings.required("S3_BUCKET_NAME")?,
                region: settings
                    .get("AWS_REGION")
                    .unwrap_or_else(|| "us-east-1".to_string()),
                endpoint_url: settings.get("S3_ENDPOINT_URL"),
                public_base_url: settings.get("S3_PUBLIC_BASE_URL"),
                access_key_id: settings.get("AWS_ACCESS_KEY_ID"),
                secret_access_key: settings.get("AWS_SECRET_ACCESS_KEY"),
            },
            tables: TableConfig {
                submissions_table: settings.required("DYNAMODB_SUBMISSIONS_TABLE")?,
                provenance_table: settings.required("DYNAMODB_PROVENANCE_TABLE")?,
            },
            inference: InferenceConfig {
                base_url,
                api_key: settings.get("INFERENCE_API_KEY"),
                timeout: Duration::from_secs(settings.parsed("INFERENCE_TIMEOUT_SECS", 60)?),
            },
            upload,
            pipeline: PipelineConfig {
                max_in_flight,
                stage_timeout,
            },
            report: ReportConfig {
                facility_name: settings
                    .get("REPORT_FACILITY_NAME")
                    .unwrap_or_else(|| ReportConfig::default().facility_name),
            },
        })
    }
}
