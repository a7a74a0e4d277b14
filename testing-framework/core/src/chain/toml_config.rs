use toml::{Table, Value};

use crate::substrate::{EngineError, VolumeFiles};

#[derive(Debug, thiserror::Error)]
pub enum TomlConfigError {
    #[error("failed to access {path} in volume {volume}: {source}")]
    Volume {
        volume: String,
        path: String,
        #[source]
        source: EngineError,
    },
    #[error("{path} is not valid toml: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to render {path}: {source}")]
    Render {
        path: String,
        #[source]
        source: toml::ser::Error,
    },
}

/// Deep-merges `overrides` into `base`. Tables merge key by key; any other
/// value replaces what was there.
pub fn merge_toml(base: &mut Table, overrides: &Table) {
    for (key, value) in overrides {
        match (base.get_mut(key), value) {
            (Some(Value::Table(existing)), Value::Table(patch)) => merge_toml(existing, patch),
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Reads `rel_path` from `volume`, merges `overrides` and writes it back.
pub async fn modify_toml_file(
    files: &VolumeFiles,
    volume: &str,
    rel_path: &str,
    overrides: &Table,
) -> Result<(), TomlConfigError> {
    let volume_error = |source| TomlConfigError::Volume {
        volume: volume.to_owned(),
        path: rel_path.to_owned(),
        source,
    };

    let raw = files.read_file(volume, rel_path).await.map_err(volume_error)?;
    let mut table: Table =
        toml::from_str(&String::from_utf8_lossy(&raw)).map_err(|source| TomlConfigError::Parse {
            path: rel_path.to_owned(),
            source,
        })?;
    merge_toml(&mut table, overrides);
    let rendered = toml::to_string(&table).map_err(|source| TomlConfigError::Render {
        path: rel_path.to_owned(),
        source,
    })?;
    files
        .write_file(volume, rel_path, rendered.as_bytes())
        .await
        .map_err(volume_error)
}
