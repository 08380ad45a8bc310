// Copyright 2024 The Reposync Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! User-level configuration: where object stores, branch registries, and
//! the metadata database live on disk, and who commits are attributed to.
//! Loaded from `$XDG_CONFIG_HOME/reposync/config.toml` (or the platform
//! equivalent via `dirs`), overridable by environment variables — the same
//! layering the wider corpus uses for its own user settings.

use std::env;
use std::path::PathBuf;

const TOO_MUCH_CONFIG_ERROR: &str =
    "both $XDG_CONFIG_HOME/reposync/config.toml and $HOME/.reposyncconfig were found, please remove one";

#[derive(Debug, Clone)]
pub struct Settings {
    config: config::Config,
}

impl Settings {
    pub fn from_config(config: config::Config) -> Self {
        Settings { config }
    }

    /// Loads the layered config: platform config dir, then a legacy
    /// dotfile fallback (refusing to pick one silently if both exist),
    /// then `REPOSYNC_*` environment overrides.
    pub fn for_user() -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        let loaded_from_config_dir = match dirs::config_dir() {
            None => false,
            Some(config_dir) => {
                let p = config_dir.join("reposync/config.toml");
                let exists = p.exists();
                builder = builder.add_source(
                    config::File::from(p).required(false).format(config::FileFormat::Toml),
                );
                exists
            }
        };

        if let Some(home_dir) = dirs::home_dir() {
            let p = home_dir.join(".reposyncconfig");
            if loaded_from_config_dir && p.exists() {
                return Err(config::ConfigError::Message(TOO_MUCH_CONFIG_ERROR.to_string()));
            }
            builder = builder.add_source(
                config::File::from(p).required(false).format(config::FileFormat::Toml),
            );
        }

        if let Ok(value) = env::var("REPOSYNC_USER_NAME") {
            builder = builder.set_override("user.name", value)?;
        }
        if let Ok(value) = env::var("REPOSYNC_USER_EMAIL") {
            builder = builder.set_override("user.email", value)?;
        }

        Ok(Settings::from_config(builder.build()?))
    }

    pub fn creator_name(&self) -> String {
        self.config.get_string("user.name").unwrap_or_else(|_| "unknown".to_string())
    }

    pub fn creator_email(&self) -> String {
        self.config.get_string("user.email").unwrap_or_else(|_| "unknown@example.com".to_string())
    }

    /// Root directory for everything reposync writes (objects, branches,
    /// the metadata DB), defaulting to the platform data dir.
    pub fn data_dir(&self) -> PathBuf {
        if let Ok(p) = self.config.get_string("data-dir") {
            return PathBuf::from(p);
        }
        dirs::data_dir().unwrap_or_else(env::temp_dir).join("reposync")
    }
}

/// Installs a `tracing` subscriber honoring `RUST_LOG`, defaulting to
/// `info` when unset. Call once at process startup.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_falls_back_to_defaults() {
        let settings = Settings::from_config(config::Config::builder().build().unwrap());
        assert_eq!(settings.creator_name(), "unknown");
        assert_eq!(settings.creator_email(), "unknown@example.com");
    }

    #[test]
    fn explicit_override_wins() {
        let config = config::Config::builder()
            .set_override("user.name", "Ada Lovelace")
            .unwrap()
            .build()
            .unwrap();
        let settings = Settings::from_config(config);
        assert_eq!(settings.creator_name(), "Ada Lovelace");
    }
}
