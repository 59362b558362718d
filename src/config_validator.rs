// Configuration validation
//
// Every environment parameter the service reads is declared once in
// `CONFIG_PARAMS` with its type, range and severity. `ConfigValidator`
// checks the current environment against that registry at startup so that
// a typo in the config file fails loudly instead of silently falling back to
// a default.

use std::env;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::str::FromStr;

use log::{error, info, warn};

/// Parameter types and their constraints
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConfigType {
    Text,
    Boolean,
    Integer { min: u64, max: u64 },
    Float { min: f64, max: f64 },
    IpAddress,
    Port,
    SocketAddress,
    /// Must name an existing file
    FilePath,
    /// Must name an existing directory
    DirectoryPath,
    Enum(&'static [&'static str]),
}

/// Validation severity levels
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValidationLevel {
    /// Startup is refused when invalid
    Critical,
    /// Reported as an error, startup is refused
    Standard,
    /// Reported only
    Warning,
}

#[derive(Debug, Clone)]
pub struct ConfigParam {
    pub name: &'static str,
    pub description: &'static str,
    pub param_type: ConfigType,
    pub default_value: Option<&'static str>,
    pub validation_level: ValidationLevel,
}

const fn param(
    name: &'static str,
    description: &'static str,
    param_type: ConfigType,
    default_value: Option<&'static str>,
    validation_level: ValidationLevel,
) -> ConfigParam {
    ConfigParam {
        name,
        description,
        param_type,
        default_value,
        validation_level,
    }
}

use ConfigType::*;
use ValidationLevel::*;

pub const CONFIG_PARAMS: &[ConfigParam] = &[
    // Server
    param("JOBS_API_HOST", "Host IP address for the API server", IpAddress, Some("127.0.0.1"), Critical),
    param("JOBS_API_PORT", "Port for the API server", Port, Some("8181"), Critical),
    param("JOBS_API_TIMEOUT", "Client disconnect timeout in seconds", Integer { min: 1, max: 3600 }, Some("480"), Standard),
    param("JOBS_API_KEEPALIVE", "Keep-alive timeout in seconds", Integer { min: 1, max: 3600 }, Some("480"), Standard),
    param("JOBS_API_WORKERS", "HTTP workers (0 = one per CPU)", Integer { min: 0, max: 64 }, Some("0"), Standard),
    // Storage
    param("JOBS_DATA_DIR", "Directory of job records and batch records", Text, None, Standard),
    param("JOBS_UPLOAD_DIR", "Directory of upload descriptors", Text, None, Standard),
    param("JOBS_WORK_DIR", "Scratch directory for engine output", Text, None, Standard),
    // Engines
    param("WHISPER_CMD", "Speech-to-text command", FilePath, None, Warning),
    param("WHISPER_MODELS_DIR", "Directory containing one sub-directory per model variant", DirectoryPath, None, Warning),
    param("DIARIZE_CMD", "Diarization command (diarization disabled when unset)", FilePath, None, Warning),
    param("WHISPER_HF_TOKEN_FILE", "File holding the HuggingFace token for diarization", FilePath, None, Warning),
    param("WHISPER_DEVICE", "Inference device", Enum(&["cuda", "cpu"]), Some("cuda"), Standard),
    param("WHISPER_DEVICE_INDEX", "Inference device index", Integer { min: 0, max: 16 }, Some("0"), Standard),
    param("WHISPER_MODEL", "Default speech-to-text model variant", Text, Some("large-v3"), Standard),
    param("WHISPER_LANGUAGE", "Default language code (empty = detect)", Text, None, Warning),
    param("DIARIZATION_MODEL", "Default diarization model variant", Text, None, Warning),
    // Job lifecycle
    param("JOBS_STALL_THRESHOLD_SECONDS", "Seconds without progress before a job is reported stalled", Integer { min: 10, max: 86400 }, Some("300"), Standard),
    param("JOBS_CHECKPOINT_RETRY_ATTEMPTS", "Checkpoint write attempts before a job fails", Integer { min: 1, max: 20 }, Some("3"), Standard),
    param("JOBS_CHECKPOINT_RETRY_BACKOFF_MS", "Backoff step between checkpoint write attempts", Integer { min: 0, max: 60000 }, Some("200"), Standard),
    param("JOBS_BATCH_START_CONCURRENCY", "Chunk jobs an auto-start batch runs at once", Integer { min: 1, max: 64 }, Some("1"), Standard),
    param("RESUME_ON_STARTUP", "Resume jobs interrupted by a previous process", Boolean, Some("true"), Standard),
    // Metrics
    param("JOBS_METRICS_ENABLED", "Enable metrics collection", Boolean, Some("true"), Standard),
    param("JOBS_METRICS_BACKEND", "Metrics backend", Enum(&["prometheus", "statsd", "none", "disabled"]), Some("prometheus"), Standard),
    param("JOBS_METRICS_ENDPOINT", "StatsD endpoint (host:port)", SocketAddress, None, Standard),
    param("JOBS_METRICS_PREFIX", "Prefix of every metric name", Text, None, Warning),
    param("JOBS_METRICS_SAMPLE_RATE", "StatsD sample rate", Float { min: 0.0, max: 1.0 }, None, Standard),
];

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigErrorType {
    InvalidValue,
    InvalidFormat,
    InvalidRange,
    FileNotFound,
    DirectoryNotFound,
    Required,
}

#[derive(Debug, Clone)]
pub struct ConfigValidationError {
    pub field: String,
    pub value: String,
    pub error_type: ConfigErrorType,
    pub message: String,
    pub suggestion: Option<String>,
}

impl ConfigValidationError {
    fn new(field: &str, value: &str, error_type: ConfigErrorType, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            value: value.to_string(),
            error_type,
            message: message.into(),
            suggestion: None,
        }
    }

    fn suggest(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Configuration error in '{}' ({:?}): {} (value: '{}')",
            self.field, self.error_type, self.message, self.value
        )?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " - Suggestion: {}", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for ConfigValidationError {}

pub type ValidationResult<T> = Result<T, ConfigValidationError>;

#[derive(Debug, Default)]
pub struct ValidationResults {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationResults {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn report(&mut self, level: ValidationLevel, error: ConfigValidationError) {
        match level {
            Critical | Standard => self.errors.push(error),
            Warning => self.warnings.push(error),
        }
    }

    pub fn print_summary(&self) {
        if !self.errors.is_empty() {
            error!("Configuration validation found {} error(s):", self.errors.len());
            for (i, err) in self.errors.iter().enumerate() {
                error!("  {}. {}", i + 1, err);
            }
        }
        if !self.warnings.is_empty() {
            warn!("Configuration validation found {} warning(s):", self.warnings.len());
            for (i, w) in self.warnings.iter().enumerate() {
                warn!("  {}. {}", i + 1, w);
            }
        }
        if self.is_valid() {
            info!(
                "Configuration validation passed with {} warning(s)",
                self.warnings.len()
            );
        }
    }
}

/// Checks for single values
pub mod validators {
    use super::*;

    pub fn validate_boolean(field: &str, value: &str) -> ValidationResult<bool> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigValidationError::new(
                field,
                value,
                ConfigErrorType::InvalidValue,
                "Invalid boolean value",
            )
            .suggest("Use 'true' or 'false'")),
        }
    }

    pub fn validate_integer(field: &str, value: &str, min: u64, max: u64) -> ValidationResult<u64> {
        let parsed = value.trim().parse::<u64>().map_err(|_| {
            ConfigValidationError::new(
                field,
                value,
                ConfigErrorType::InvalidFormat,
                "Invalid integer format",
            )
            .suggest("Use a non-negative integer")
        })?;
        if parsed < min || parsed > max {
            return Err(ConfigValidationError::new(
                field,
                value,
                ConfigErrorType::InvalidRange,
                format!("Value must be between {} and {}", min, max),
            ));
        }
        Ok(parsed)
    }

    pub fn validate_float(field: &str, value: &str, min: f64, max: f64) -> ValidationResult<f64> {
        let parsed = value.trim().parse::<f64>().map_err(|_| {
            ConfigValidationError::new(
                field,
                value,
                ConfigErrorType::InvalidFormat,
                "Invalid number format",
            )
        })?;
        if !(min..=max).contains(&parsed) {
            return Err(ConfigValidationError::new(
                field,
                value,
                ConfigErrorType::InvalidRange,
                format!("Value must be between {} and {}", min, max),
            ));
        }
        Ok(parsed)
    }

    /// Case-insensitive membership
    pub fn validate_enum(field: &str, value: &str, valid_values: &[&str]) -> ValidationResult<String> {
        let lowered = value.to_lowercase();
        if valid_values.iter().any(|v| v.to_lowercase() == lowered) {
            Ok(lowered)
        } else {
            Err(ConfigValidationError::new(
                field,
                value,
                ConfigErrorType::InvalidValue,
                format!("Invalid value, must be one of: {}", valid_values.join(", ")),
            ))
        }
    }

    pub fn validate_ip_address(field: &str, value: &str) -> ValidationResult<IpAddr> {
        IpAddr::from_str(value).map_err(|_| {
            ConfigValidationError::new(
                field,
                value,
                ConfigErrorType::InvalidFormat,
                "Invalid IP address format",
            )
            .suggest("Use a valid IPv4 or IPv6 address (e.g., 127.0.0.1 or ::1)")
        })
    }

    pub fn validate_port(field: &str, value: &str) -> ValidationResult<u16> {
        match value.parse::<u16>() {
            Ok(0) => Err(ConfigValidationError::new(
                field,
                value,
                ConfigErrorType::InvalidRange,
                "Port number cannot be 0",
            )),
            Ok(port) => Ok(port),
            Err(_) => Err(ConfigValidationError::new(
                field,
                value,
                ConfigErrorType::InvalidFormat,
                "Invalid port number format",
            )
            .suggest("Use a number between 1 and 65535")),
        }
    }

    pub fn validate_socket_address(field: &str, value: &str) -> ValidationResult<SocketAddr> {
        SocketAddr::from_str(value).map_err(|_| {
            ConfigValidationError::new(
                field,
                value,
                ConfigErrorType::InvalidFormat,
                "Invalid socket address format",
            )
            .suggest("Use format 'host:port' (e.g., 127.0.0.1:8125)")
        })
    }

    pub fn validate_file_exists(field: &str, value: &str) -> ValidationResult<()> {
        if Path::new(value).is_file() {
            Ok(())
        } else {
            Err(ConfigValidationError::new(
                field,
                value,
                ConfigErrorType::FileNotFound,
                "File does not exist",
            ))
        }
    }

    pub fn validate_directory_exists(field: &str, value: &str) -> ValidationResult<()> {
        if Path::new(value).is_dir() {
            Ok(())
        } else {
            Err(ConfigValidationError::new(
                field,
                value,
                ConfigErrorType::DirectoryNotFound,
                "Directory does not exist",
            )
            .suggest("Create the directory or fix the path"))
        }
    }
}

/// Check one value against its declared type
pub fn validate_value(param: &ConfigParam, value: &str) -> ValidationResult<()> {
    use validators::*;
    match param.param_type {
        Text => Ok(()),
        Boolean => validate_boolean(param.name, value).map(|_| ()),
        Integer { min, max } => validate_integer(param.name, value, min, max).map(|_| ()),
        Float { min, max } => validate_float(param.name, value, min, max).map(|_| ()),
        IpAddress => validate_ip_address(param.name, value).map(|_| ()),
        Port => validate_port(param.name, value).map(|_| ()),
        SocketAddress => validate_socket_address(param.name, value).map(|_| ()),
        FilePath => validate_file_exists(param.name, value),
        DirectoryPath => validate_directory_exists(param.name, value),
        Enum(valid) => validate_enum(param.name, value, valid).map(|_| ()),
    }
}

pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the current environment.
    ///
    /// Unset parameters fall back to their defaults and are not reported.
    pub fn validate() -> Result<ValidationResults, ValidationResults> {
        Self::validate_with(|name| env::var(name).ok())
    }

    /// Validate values looked up through `lookup`
    pub fn validate_with<F>(lookup: F) -> Result<ValidationResults, ValidationResults>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut results = ValidationResults::default();
        info!("Validating configuration ({} parameters)", CONFIG_PARAMS.len());

        for param in CONFIG_PARAMS {
            let value = match lookup(param.name) {
                Some(value) if !value.is_empty() => value,
                _ => continue,
            };
            if let Err(e) = validate_value(param, &value) {
                results.report(param.validation_level, e);
            }
        }
        Self::validate_cross_dependencies(&mut results, &lookup);

        results.print_summary();
        if results.is_valid() {
            Ok(results)
        } else {
            Err(results)
        }
    }

    fn validate_cross_dependencies<F>(results: &mut ValidationResults, lookup: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend = lookup("JOBS_METRICS_BACKEND").unwrap_or_default().to_lowercase();
        if backend == "statsd" && lookup("JOBS_METRICS_ENDPOINT").is_none() {
            results.warnings.push(
                ConfigValidationError::new(
                    "JOBS_METRICS_ENDPOINT",
                    "",
                    ConfigErrorType::Required,
                    "No StatsD endpoint configured, STATSD_HOST/STATSD_PORT or 127.0.0.1:8125 will be used",
                )
                .suggest("Set JOBS_METRICS_ENDPOINT"),
            );
        }

        if lookup("DIARIZE_CMD").is_some() && lookup("WHISPER_HF_TOKEN_FILE").is_none() {
            results.warnings.push(ConfigValidationError::new(
                "WHISPER_HF_TOKEN_FILE",
                "",
                ConfigErrorType::Required,
                "Diarization is enabled but no HuggingFace token file is configured",
            ));
        }
    }

    /// Sample configuration file listing every parameter
    pub fn generate_sample_config() -> String {
        let mut output = String::from("# Transcription job service configuration\n\n");
        for param in CONFIG_PARAMS {
            output.push_str(&format!("# {}\n", param.description));
            match param.default_value {
                Some(default) => output.push_str(&format!("{} = \"{}\"\n\n", param.name, default)),
                None => output.push_str(&format!("# {} = \"\"\n\n", param.name)),
            }
        }
        output
    }
}
