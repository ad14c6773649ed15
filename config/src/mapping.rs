//! Loads a key/value mapping from a directory holding one file per key.
//!
//! The file name is the key and the trimmed file contents are the value.
//! This is the layout of a mounted ConfigMap, so hidden entries (the
//! `..data` and `..<timestamp>` bookkeeping of the volume) are skipped
//! while the per-key symlinks at the top level are followed.

use std::{
    collections::BTreeMap,
    fmt::Display,
    fs, io,
    path::{Path, PathBuf},
    str::FromStr,
};

use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Error, Debug)]
pub enum MappingError {
    #[error("failed to read mapping directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read mapping entry {path}: {source}")]
    ReadEntry {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid key `{key}` in {path}: {reason}")]
    InvalidKey {
        path: PathBuf,
        key: String,
        reason: String,
    },

    #[error("invalid value `{value}` in {path}: {reason}")]
    InvalidValue {
        path: PathBuf,
        value: String,
        reason: String,
    },
}

/// Reads every entry of `dir` into a map.
///
/// Entries that cannot be read or parsed are logged and left out; an
/// unreadable directory yields an empty map.
pub fn load<K, V>(dir: &Path) -> BTreeMap<K, V>
where
    K: FromStr + Ord,
    K::Err: Display,
    V: FromStr,
    V::Err: Display,
{
    let mut mapping = BTreeMap::new();

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(source) => {
            error!(
                "{}",
                MappingError::ReadDir {
                    path: dir.to_path_buf(),
                    source,
                }
            );
            return mapping;
        }
    };

    for entry in entries {
        let path = match entry {
            Ok(entry) => entry.path(),
            Err(source) => {
                warn!(
                    "{}",
                    MappingError::ReadDir {
                        path: dir.to_path_buf(),
                        source,
                    }
                );
                continue;
            }
        };

        match parse_entry::<K, V>(&path) {
            Ok(Some((key, value))) => {
                mapping.insert(key, value);
            }
            Ok(None) => {}
            Err(e) => warn!("skipping mapping entry: {e}"),
        }
    }

    debug!(dir = %dir.display(), entries = mapping.len(), "loaded mapping");
    mapping
}

fn parse_entry<K, V>(path: &Path) -> Result<Option<(K, V)>, MappingError>
where
    K: FromStr,
    K::Err: Display,
    V: FromStr,
    V::Err: Display,
{
    let Some(key) = path.file_name().and_then(|name| name.to_str()) else {
        return Err(MappingError::InvalidKey {
            path: path.to_path_buf(),
            key: path.display().to_string(),
            reason: "file name is not valid UTF-8".to_owned(),
        });
    };

    if key.starts_with('.') || !path.is_file() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path).map_err(|source| MappingError::ReadEntry {
        path: path.to_path_buf(),
        source,
    })?;
    let value = contents.trim();

    let parsed_key = key.parse::<K>().map_err(|e| MappingError::InvalidKey {
        path: path.to_path_buf(),
        key: key.to_owned(),
        reason: e.to_string(),
    })?;
    let parsed_value = value.parse::<V>().map_err(|e| MappingError::InvalidValue {
        path: path.to_path_buf(),
        value: value.to_owned(),
        reason: e.to_string(),
    })?;

    Ok(Some((parsed_key, parsed_value)))
}

#[cfg(test)]
mod tests {
    use std::{net::Ipv4Addr, num::NonZeroU32, os::unix};

    use super::*;

    #[test]
    fn load_trims_values() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("10.32.0.5"), "203.0.113.10\n").unwrap();
        fs::write(dir.path().join("10.32.0.6"), "  203.0.113.11  ").unwrap();

        let mapping: BTreeMap<Ipv4Addr, Ipv4Addr> = load(dir.path());

        assert_eq!(mapping.len(), 2);
        assert_eq!(
            mapping[&Ipv4Addr::new(10, 32, 0, 5)],
            Ipv4Addr::new(203, 0, 113, 10)
        );
        assert_eq!(
            mapping[&Ipv4Addr::new(10, 32, 0, 6)],
            Ipv4Addr::new(203, 0, 113, 11)
        );
    }

    #[test]
    fn load_skips_invalid_entries() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("203.0.113.10"), "100").unwrap();
        fs::write(dir.path().join("203.0.113.11"), "0").unwrap();
        fs::write(dir.path().join("203.0.113.12"), "not-a-number").unwrap();
        fs::write(dir.path().join("not-an-ip"), "101").unwrap();

        let mapping: BTreeMap<Ipv4Addr, NonZeroU32> = load(dir.path());

        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping[&Ipv4Addr::new(203, 0, 113, 10)].get(), 100);
    }

    #[test]
    fn load_follows_configmap_layout() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("..2024_01_01_00_00_00.000000000");
        fs::create_dir(&data).unwrap();
        fs::write(data.join("10.32.0.5"), "203.0.113.10").unwrap();
        unix::fs::symlink(&data, dir.path().join("..data")).unwrap();
        unix::fs::symlink(
            dir.path().join("..data").join("10.32.0.5"),
            dir.path().join("10.32.0.5"),
        )
        .unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();

        let mapping: BTreeMap<Ipv4Addr, Ipv4Addr> = load(dir.path());

        assert_eq!(mapping.len(), 1);
        assert_eq!(
            mapping[&Ipv4Addr::new(10, 32, 0, 5)],
            Ipv4Addr::new(203, 0, 113, 10)
        );
    }

    #[test]
    fn load_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();

        let mapping: BTreeMap<Ipv4Addr, Ipv4Addr> = load(&dir.path().join("missing"));

        assert!(mapping.is_empty());
    }
}
