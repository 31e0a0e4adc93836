//! Sysfs GPIO pin reader

use std::fs;
use std::path::PathBuf;

use vd_error::{Result, VerdantError};

use super::PinReader;

/// Reads `<root>/gpio<pin>/value` (legacy sysfs GPIO interface)
///
/// The device id is only used in error messages; pins are global numbers.
#[derive(Debug, Clone)]
pub struct SysfsPinReader {
    root: PathBuf,
}

impl SysfsPinReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for SysfsPinReader {
    fn default() -> Self {
        Self::new("/sys/class/gpio")
    }
}

impl PinReader for SysfsPinReader {
    fn read(&self, device_id: &str, pin: u32) -> Result<bool> {
        let path = self.root.join(format!("gpio{}", pin)).join("value");
        let content = fs::read_to_string(&path).map_err(|e| VerdantError::FileRead { path: path.clone(), source: e })?;
        match content.trim() {
            "1" => Ok(true),
            "0" => Ok(false),
            other => Err(VerdantError::measurement(
                device_id,
                format!("unexpected pin {} value '{}'", pin, other),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_reads_levels() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("gpio17")).unwrap();
        fs::write(dir.path().join("gpio17").join("value"), "1\n").unwrap();
        let reader = SysfsPinReader::new(dir.path());
        assert!(reader.read("board", 17).unwrap());

        fs::write(dir.path().join("gpio17").join("value"), "0\n").unwrap();
        assert!(!reader.read("board", 17).unwrap());
        assert!(reader.read("board", 4).is_err());
    }
}
