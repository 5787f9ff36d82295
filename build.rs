use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Deserialize)]
struct Config {
    application: Application,
    network: Network,
    audio: Audio,
    control: Control,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Network {
    ws_url: String,
    ws_token: String,
    connect_timeout_ms: u64,
    keepalive_secs: u64,
    outbound_queue: usize,
}

#[derive(Deserialize)]
struct Audio {
    capture_device: String,
    playback_device: String,
    buffer_multiplier: u32,
    mixer_card: String,
    mixer_control: String,
    binary_format: String,
    playback_queue: usize,
}

#[derive(Deserialize)]
struct Control {
    local_ip: String,
    local_port: u16,
    remote_ip: String,
    remote_port: u16,
    buffer_size: usize,
    auto_grant_microphone: bool,
}

// Read config.toml at compile time and export it as rustc env vars
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // Media endpoint
    println!("cargo:rustc-env=WS_URL={}", config.network.ws_url);
    println!("cargo:rustc-env=WS_TOKEN={}", config.network.ws_token);
    println!("cargo:rustc-env=CONNECT_TIMEOUT_MS={}", config.network.connect_timeout_ms);
    println!("cargo:rustc-env=KEEPALIVE_SECS={}", config.network.keepalive_secs);
    println!("cargo:rustc-env=OUTBOUND_QUEUE={}", config.network.outbound_queue);

    // Audio devices
    println!("cargo:rustc-env=CAPTURE_DEVICE={}", config.audio.capture_device);
    println!("cargo:rustc-env=PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=BUFFER_MULTIPLIER={}", config.audio.buffer_multiplier);
    println!("cargo:rustc-env=MIXER_CARD={}", config.audio.mixer_card);
    println!("cargo:rustc-env=MIXER_CONTROL={}", config.audio.mixer_control);
    println!("cargo:rustc-env=BINARY_FORMAT={}", config.audio.binary_format);
    println!("cargo:rustc-env=PLAYBACK_QUEUE={}", config.audio.playback_queue);

    // Control channel to the UI process
    println!("cargo:rustc-env=CONTROL_LOCAL_IP={}", config.control.local_ip);
    println!("cargo:rustc-env=CONTROL_LOCAL_PORT={}", config.control.local_port);
    println!("cargo:rustc-env=CONTROL_REMOTE_IP={}", config.control.remote_ip);
    println!("cargo:rustc-env=CONTROL_REMOTE_PORT={}", config.control.remote_port);
    println!("cargo:rustc-env=CONTROL_BUFFER_SIZE={}", config.control.buffer_size);
    println!(
        "cargo:rustc-env=AUTO_GRANT_MICROPHONE={}",
        config.control.auto_grant_microphone
    );
}
