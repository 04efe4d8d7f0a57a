//! Preference persistence using dconf
//!
//! Preferences are stored in dconf under `/com/echolink/recorder/`. Nothing
//! about recordings is kept here.

use log::error;

const DCONF_PATH: &str = "/com/echolink/recorder/";

/// Keys for dconf settings
mod keys {
    pub const VOLUME: &str = "volume";
    pub const NOISE_COMMAND: &str = "noise-command";
}

fn key(name: &str) -> String {
    format!("{}{}", DCONF_PATH, name)
}

/// Get the last playback volume (0-100) from dconf
pub fn get_volume() -> Option<i64> {
    dconf_rs::get_string(&key(keys::VOLUME))
        .ok()
        .and_then(|v| parse_volume(&v))
}

/// Save the playback volume (0-100) to dconf
pub fn set_volume(percent: i64) {
    let value = percent.clamp(0, 100).to_string();
    if let Err(e) = dconf_rs::set_string(&key(keys::VOLUME), &value) {
        error!("Failed to save volume to dconf: {}", e);
    }
}

/// Get the external noise reduction command from dconf
pub fn get_noise_command() -> Option<String> {
    dconf_rs::get_string(&key(keys::NOISE_COMMAND))
        .ok()
        .filter(|command| !command.trim().is_empty())
}

/// Save the external noise reduction command to dconf
pub fn set_noise_command(command: &str) {
    if let Err(e) = dconf_rs::set_string(&key(keys::NOISE_COMMAND), command) {
        error!("Failed to save noise command to dconf: {}", e);
    }
}

fn parse_volume(value: &str) -> Option<i64> {
    value.trim().parse::<i64>().ok().map(|v| v.clamp(0, 100))
}
