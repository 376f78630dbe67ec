//! Playback policy flags and their TOML round-trip.
//!
//! The embedding application owns where the file lives and when it is written;
//! this module only defines the model, defaults, and a sanitize pass.

/// Playback behavior flags read by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct PlaybackConfig {
    /// Play items in a shuffled order instead of tree order.
    #[serde(default)]
    pub random: bool,
    /// Wrap to the first item after the last one in sequential mode.
    #[serde(default)]
    pub repeat: bool,
    /// Wrap the whole play order after the last entry.
    #[serde(rename = "loop", default)]
    pub loop_all: bool,
    /// Do not chain into the next item after one finishes naturally.
    #[serde(default)]
    pub play_and_stop: bool,
    /// Request process exit when the playlist runs out.
    #[serde(default)]
    pub play_and_exit: bool,
    /// Carry the downstream output pipeline across consecutive items.
    #[serde(default)]
    pub keep_output: bool,
    /// Bounded idle wait while a session is dying, in milliseconds.
    #[serde(default = "default_idle_sleep_ms")]
    pub idle_sleep_ms: u64,
}

fn default_idle_sleep_ms() -> u64 {
    10
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            random: false,
            repeat: false,
            loop_all: false,
            play_and_stop: false,
            play_and_exit: false,
            keep_output: false,
            idle_sleep_ms: default_idle_sleep_ms(),
        }
    }
}

/// Clamps out-of-range values to something the scheduler can run with.
pub fn sanitize_config(mut config: PlaybackConfig) -> PlaybackConfig {
    config.idle_sleep_ms = config.idle_sleep_ms.clamp(1, 100);
    config
}

impl PlaybackConfig {
    /// Parses flags from TOML text, falling back to defaults for absent keys.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str::<PlaybackConfig>(text).map(sanitize_config)
    }

    /// Serializes the flags back to TOML text.
    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = PlaybackConfig::from_toml_str("").expect("empty config must parse");
        assert_eq!(config, PlaybackConfig::default());
        assert_eq!(config.idle_sleep_ms, 10);
    }

    #[test]
    fn loop_key_maps_to_loop_all() {
        let config = PlaybackConfig::from_toml_str("loop = true\nrandom = true\n")
            .expect("config must parse");
        assert!(config.loop_all);
        assert!(config.random);
        assert!(!config.repeat);
    }

    #[test]
    fn round_trip_preserves_flags() {
        let mut config = PlaybackConfig::default();
        config.play_and_exit = true;
        config.keep_output = true;
        let text = config.to_toml_string().expect("config must serialize");
        let parsed = PlaybackConfig::from_toml_str(&text).expect("config must re-parse");
        assert_eq!(parsed, config);
    }

    #[test]
    fn sanitize_clamps_idle_sleep() {
        let config =
            PlaybackConfig::from_toml_str("idle_sleep_ms = 0").expect("config must parse");
        assert_eq!(config.idle_sleep_ms, 1);
        let config =
            PlaybackConfig::from_toml_str("idle_sleep_ms = 5000").expect("config must parse");
        assert_eq!(config.idle_sleep_ms, 100);
    }
}
