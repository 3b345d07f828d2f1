// SPDX-FileCopyrightText: 2025 Jörg Thalheim
// SPDX-License-Identifier: MIT

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{IoContext, Result, ScdError};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "CARDAGENT_CONFIG";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Never talk to a card daemon; every card operation fails
    pub disable_scdaemon: bool,

    /// Card daemon program to spawn
    pub scdaemon_program: PathBuf,

    /// Configuration root shared with the daemon
    pub homedir: PathBuf,

    /// Ask the daemon to signal card events with SIGUSR2
    pub event_signal: bool,

    /// Running without a terminal; the daemon's stderr is not inherited
    pub running_detached: bool,

    /// Report connection reuse and daemon starts at info level
    pub verbose: bool,

    /// Log level
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let homedir = std::env::var_os("GNUPGHOME")
            .filter(|home| !home.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_homedir);
        Self {
            disable_scdaemon: false,
            scdaemon_program: PathBuf::from("/usr/lib/gnupg/scdaemon"),
            homedir,
            event_signal: false,
            running_detached: false,
            verbose: false,
            log_level: "info".to_string(),
        }
    }
}

/// `$HOME/.gnupg`, the configuration root the daemon assumes on its own.
pub fn default_homedir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_default()
        .join(".gnupg")
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .io_context(|| format!("Failed to read config file at {}", path.display()))?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file named by `CARDAGENT_CONFIG`, or fall back to defaults.
    pub fn load() -> Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(Path::new(&path)),
            Err(_) => Ok(Self::default()),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.scdaemon_program.as_os_str().is_empty() {
            return Err(ScdError::config("scdaemon_program must not be empty"));
        }
        Ok(())
    }

    pub fn uses_default_homedir(&self) -> bool {
        self.homedir == default_homedir()
    }

    /// Extra daemon arguments selecting a non-default configuration root.
    pub fn homedir_args(&self) -> Result<Vec<String>> {
        if self.uses_default_homedir() {
            return Ok(Vec::new());
        }
        let absolute = std::path::absolute(&self.homedir).io_context(|| {
            format!("Failed to resolve home directory {}", self.homedir.display())
        })?;
        Ok(vec![
            "--homedir".to_string(),
            absolute.to_string_lossy().into_owned(),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert!(!config.disable_scdaemon);
        assert!(!config.event_signal);
        assert_eq!(config.log_level, "info");
        assert_eq!(
            config.scdaemon_program,
            PathBuf::from("/usr/lib/gnupg/scdaemon")
        );
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "disable_scdaemon = true\nhomedir = \"/tmp/cardagent-home\""
        )
        .unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert!(config.disable_scdaemon);
        assert_eq!(config.homedir, PathBuf::from("/tmp/cardagent-home"));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn rejects_empty_program() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "scdaemon_program = \"\"").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ScdError::Config(_))
        ));
    }

    #[test]
    fn rejects_bad_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "verbose = maybe").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ScdError::Toml(_))
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::from_file(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ScdError::Io { .. })));
    }

    #[test]
    fn homedir_args() {
        let config = Config {
            homedir: default_homedir(),
            ..Config::default()
        };
        assert!(config.uses_default_homedir());
        assert!(config.homedir_args().unwrap().is_empty());

        let config = Config {
            homedir: PathBuf::from("/srv/keys"),
            ..Config::default()
        };
        assert_eq!(
            config.homedir_args().unwrap(),
            vec!["--homedir".to_string(), "/srv/keys".to_string()]
        );
    }
}
