use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub motors: MotorConfig,
    #[serde(default)]
    pub qr: QrConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// IPv4 prefix in CIDR form allowed to reach the server, in addition to loopback.
    #[serde(default = "default_allowed_network")]
    pub allowed_network: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "default_vid_command")]
    pub vid_command: String,
    #[serde(default = "default_list_command")]
    pub list_command: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_framerate")]
    pub framerate: u32,
    #[serde(default = "default_quality")]
    pub quality: u32,
    #[serde(default = "default_true")]
    pub hflip: bool,
    #[serde(default = "default_true")]
    pub vflip: bool,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
}

/// L298N wiring in BCM numbering.
#[derive(Debug, Clone, Deserialize)]
pub struct MotorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_left_in1")]
    pub left_in1: u8,
    #[serde(default = "default_left_in2")]
    pub left_in2: u8,
    #[serde(default = "default_right_in3")]
    pub right_in3: u8,
    #[serde(default = "default_right_in4")]
    pub right_in4: u8,
    #[serde(default = "default_left_en")]
    pub left_en: u8,
    #[serde(default = "default_right_en")]
    pub right_en: u8,
    #[serde(default = "default_pwm_frequency")]
    pub pwm_frequency_hz: f64,
    #[serde(default = "default_speed")]
    pub default_speed: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QrConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allowed_network: default_allowed_network(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            vid_command: default_vid_command(),
            list_command: default_list_command(),
            width: default_width(),
            height: default_height(),
            framerate: default_framerate(),
            quality: default_quality(),
            hflip: true,
            vflip: true,
            startup_timeout_secs: default_startup_timeout(),
        }
    }
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            left_in1: default_left_in1(),
            left_in2: default_left_in2(),
            right_in3: default_right_in3(),
            right_in4: default_right_in4(),
            left_en: default_left_en(),
            right_en: default_right_en(),
            pwm_frequency_hz: default_pwm_frequency(),
            default_speed: default_speed(),
        }
    }
}

impl Default for QrConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    5000
}
fn default_allowed_network() -> String {
    "192.168.1.0/24".into()
}
fn default_vid_command() -> String {
    "rpicam-vid".into()
}
fn default_list_command() -> String {
    "rpicam-hello".into()
}
fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}
fn default_framerate() -> u32 {
    15
}
fn default_quality() -> u32 {
    80
}
fn default_true() -> bool {
    true
}
fn default_startup_timeout() -> u64 {
    10
}
fn default_left_in1() -> u8 {
    17
}
fn default_left_in2() -> u8 {
    27
}
fn default_right_in3() -> u8 {
    22
}
fn default_right_in4() -> u8 {
    23
}
fn default_left_en() -> u8 {
    18
}
fn default_right_en() -> u8 {
    24
}
fn default_pwm_frequency() -> f64 {
    1000.0
}
fn default_speed() -> u8 {
    80
}
fn default_log_level() -> String {
    "info".into()
}
