use std::time::Duration;

use crate::audio::BinaryFormat;

#[derive(Debug, Clone)]
pub struct Config {
    // Media endpoint
    pub ws_url: String,
    pub ws_token: &'static str,
    pub connect_timeout_ms: u64,
    pub keepalive_secs: u64,
    pub outbound_queue: usize,

    // Audio devices
    pub capture_device: &'static str,
    pub playback_device: &'static str,
    pub buffer_multiplier: u32,
    pub mixer_card: &'static str,
    pub mixer_control: &'static str,
    pub binary_format: BinaryFormat,
    pub playback_queue: usize,

    // Control channel to the UI process
    pub control_local_ip: &'static str,
    pub control_local_port: u16,
    pub control_remote_ip: &'static str,
    pub control_remote_port: u16,
    pub control_buffer_size: usize,
    pub auto_grant_microphone: bool,
}

impl Config {
    /// Build the configuration from the env vars exported by build.rs.
    /// Every value comes from config.toml at compile time.
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            ws_url: env!("WS_URL").to_string(),
            ws_token: env!("WS_TOKEN"),
            connect_timeout_ms: env!("CONNECT_TIMEOUT_MS")
                .parse()
                .map_err(|_| "Failed to parse CONNECT_TIMEOUT_MS")?,
            keepalive_secs: env!("KEEPALIVE_SECS")
                .parse()
                .map_err(|_| "Failed to parse KEEPALIVE_SECS")?,
            outbound_queue: env!("OUTBOUND_QUEUE")
                .parse()
                .map_err(|_| "Failed to parse OUTBOUND_QUEUE")?,

            capture_device: env!("CAPTURE_DEVICE"),
            playback_device: env!("PLAYBACK_DEVICE"),
            buffer_multiplier: env!("BUFFER_MULTIPLIER")
                .parse()
                .map_err(|_| "Failed to parse BUFFER_MULTIPLIER")?,
            mixer_card: env!("MIXER_CARD"),
            mixer_control: env!("MIXER_CONTROL"),
            binary_format: env!("BINARY_FORMAT")
                .parse()
                .map_err(|_| "Failed to parse BINARY_FORMAT")?,
            playback_queue: env!("PLAYBACK_QUEUE")
                .parse()
                .map_err(|_| "Failed to parse PLAYBACK_QUEUE")?,

            control_local_ip: env!("CONTROL_LOCAL_IP"),
            control_local_port: env!("CONTROL_LOCAL_PORT")
                .parse()
                .map_err(|_| "Failed to parse CONTROL_LOCAL_PORT")?,
            control_remote_ip: env!("CONTROL_REMOTE_IP"),
            control_remote_port: env!("CONTROL_REMOTE_PORT")
                .parse()
                .map_err(|_| "Failed to parse CONTROL_REMOTE_PORT")?,
            control_buffer_size: env!("CONTROL_BUFFER_SIZE")
                .parse()
                .map_err(|_| "Failed to parse CONTROL_BUFFER_SIZE")?,
            auto_grant_microphone: env!("AUTO_GRANT_MICROPHONE")
                .parse()
                .map_err(|_| "Failed to parse AUTO_GRANT_MICROPHONE")?,
        })
    }

    /// Runtime overrides on top of the compiled-in values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("CALLBRIDGE_WS_URL") {
            if !url.trim().is_empty() {
                log::info!("Media endpoint overridden from environment: {}", url);
                self.ws_url = url.trim().to_string();
            }
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    /// Bearer token for the media endpoint, if one is configured.
    pub fn token(&self) -> Option<&str> {
        if self.ws_token.is_empty() {
            None
        } else {
            Some(self.ws_token)
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new().expect("Failed to create default Config from build-time environment variables")
    }
}
