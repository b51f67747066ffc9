// Copyright (c) 2024 Leela Aurelia, git@elia.garden
//
// Unless otherwise noted, this file is released and thus subject to the
// terms of the Mozilla Public License Version 2.0 (MPL-2.0) or the
// GNU General Public License Version 3 (GPL-3).
// If a copy of these licenses was not distributed with this file, you can
// obtain them at https://mozilla.org/MPL/2.0/ and http://www.gnu.org/licenses/.

use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter},
    path::Path,
};

use common::SystemConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not access config file: {0}")]
    Io(#[from] io::Error),
    #[error("config file is corrupt: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("could not serialize config: {0}")]
    Encode(#[from] bincode::error::EncodeError),
}

pub fn load(path: &Path) -> Result<SystemConfig, ConfigError> {
    let file = File::open(path)?;
    let config = bincode::serde::decode_from_std_read(
        &mut BufReader::new(file),
        bincode::config::legacy(),
    )?;
    Ok(config)
}

pub fn save(config: &SystemConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    bincode::serde::encode_into_std_write(config, &mut BufWriter::new(file), bincode::config::legacy())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saved_config_loads_back() {
        let path = std::env::temp_dir().join(format!("ctr-headless-{}/config.bin", std::process::id()));
        let config = SystemConfig {
            enable_core_2: true,
            cpu_clock_percentage: 50,
            ..SystemConfig::default()
        };
        save(&config, &path).unwrap();
        assert_eq!(config, load(&path).unwrap());
        fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn missing_file_is_io_error() {
        let result = load(Path::new("/nonexistent/ctr-headless/config.bin"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
