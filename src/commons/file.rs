//! Helper functions for dealing with files.

use std::fs;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use log::trace;
use serde::Serialize;
use serde::de::DeserializeOwned;
use super::error::SetupIoError;


pub fn create_dir(dir: &Path) -> Result<(), SetupIoError> {
    if !dir.is_dir() {
        fs::create_dir_all(dir).map_err(|e| {
            SetupIoError::new(
                format!("could not create dir: {}", dir.display()), e
            )
        })?;
    }
    Ok(())
}

pub fn create_file_with_path(path: &Path) -> Result<File, SetupIoError> {
    if !path.exists() {
        if let Some(parent) = path.parent() {
            trace!("Creating path: {}", parent.display());
            fs::create_dir_all(parent).map_err(|e| {
                SetupIoError::new(
                    format!(
                        "Could not create dir path for: {}",
                        parent.display()
                    ),
                    e,
                )
            })?;
        }
    }
    File::create(path).map_err(|e| {
        SetupIoError::new(
            format!("Could not create file: {}", path.display()), e
        )
    })
}

/// Saves a file, creating parent dirs as needed
pub fn save(content: &[u8], full_path: &Path) -> Result<(), SetupIoError> {
    let mut f = create_file_with_path(full_path)?;
    f.write_all(content).map_err(|e| {
        SetupIoError::new(
            format!("Could not write to: {}", full_path.display()), e
        )
    })?;

    trace!("Saved file: {}", full_path.display());
    Ok(())
}

/// Saves a file through a temporary file in the same directory that is
/// renamed over the target, so readers never see partial content.
pub fn save_atomic(
    content: &[u8], full_path: &Path
) -> Result<(), SetupIoError> {
    let dir = match full_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    create_dir(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| {
        SetupIoError::new(
            format!("Could not create temp file in: {}", dir.display()), e
        )
    })?;
    tmp.write_all(content).map_err(|e| {
        SetupIoError::new(
            format!("Could not write temp file for: {}", full_path.display()),
            e,
        )
    })?;
    tmp.persist(full_path).map_err(|e| {
        SetupIoError::new(
            format!("Could not replace: {}", full_path.display()), e.error
        )
    })?;

    trace!("Saved file: {}", full_path.display());
    Ok(())
}

/// Saves an object as pretty printed json.
pub fn save_json<O: Serialize>(
    object: &O, full_path: &Path
) -> Result<(), SetupIoError> {
    let json = serde_json::to_string_pretty(object).map_err(|e| {
        SetupIoError::new(
            format!("Could not serialize for: {}", full_path.display()),
            std::io::Error::other(e),
        )
    })?;
    save_atomic(json.as_bytes(), full_path)
}

/// Loads a file and deserializes it as json for the expected type.
pub fn load_json<O: DeserializeOwned>(
    full_path: &Path
) -> Result<O, SetupIoError> {
    let bytes = read(full_path)?;
    serde_json::from_slice(&bytes).map_err(|e| {
        SetupIoError::new(
            format!("Could not parse JSON in: {}", full_path.display()),
            std::io::Error::other(e),
        )
    })
}

/// Reads a file to bytes
pub fn read(path: &Path) -> Result<Vec<u8>, SetupIoError> {
    let mut f = File::open(path).map_err(|e| {
        SetupIoError::new(format!("Could not open: '{}'", path.display()), e)
    })?;
    let mut bytes = Vec::new();
    f.read_to_end(&mut bytes).map_err(|e| {
        SetupIoError::new(format!("Could not read: {}", path.display()), e)
    })?;
    Ok(bytes)
}

/// Reads a file to a string
pub fn read_to_string(path: &Path) -> Result<String, SetupIoError> {
    fs::read_to_string(path).map_err(|e| {
        SetupIoError::new(format!("Could not read: {}", path.display()), e)
    })
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("CS.cfg");

        save_atomic(b"a=1\n", &path).unwrap();
        save_atomic(b"a=2\n", &path).unwrap();

        assert_eq!(read_to_string(&path).unwrap(), "a=2\n");
        let entries = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);
    }
}
