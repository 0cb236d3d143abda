//! Saving configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::{AppResult, DaqError};

/// On-disk encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SavingFormat {
    /// ESRF Data Format: ASCII header block + raw pixels
    #[default]
    Edf,
    /// Pixel bytes only
    Raw,
    /// 16-bit grayscale TIFF (`storage_tiff` feature)
    Tiff,
}

impl SavingFormat {
    /// Whether this build can write the format.
    pub fn is_available(&self) -> bool {
        match self {
            SavingFormat::Edf | SavingFormat::Raw => true,
            SavingFormat::Tiff => cfg!(feature = "storage_tiff"),
        }
    }

    /// Conventional file suffix.
    pub fn default_suffix(&self) -> &'static str {
        match self {
            SavingFormat::Edf => ".edf",
            SavingFormat::Raw => ".raw",
            SavingFormat::Tiff => ".tiff",
        }
    }
}

impl fmt::Display for SavingFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SavingFormat::Edf => write!(f, "edf"),
            SavingFormat::Raw => write!(f, "raw"),
            SavingFormat::Tiff => write!(f, "tiff"),
        }
    }
}

/// How frames map to files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SavingMode {
    /// One file per frame, numbered by sequence
    #[default]
    OneFilePerFrame,
    /// `frames_per_file` consecutive frames per file
    MultiFrameBatch,
    /// Frames are drained and released without being written
    Manual,
}

/// What to do when the target file already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverwritePolicy {
    /// Fail with `FileExists` and fault the session
    #[default]
    Abort,
    /// Truncate and rewrite
    Overwrite,
    /// Append after the existing content
    Append,
}

/// Where and how frames are persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SavingConfig {
    /// Output directory
    pub directory: PathBuf,
    /// File encoding
    pub format: SavingFormat,
    /// File name prefix
    pub prefix: String,
    /// File name suffix, including the dot
    pub suffix: String,
    /// Frame to file mapping
    pub mode: SavingMode,
    /// Existing file handling
    pub overwrite_policy: OverwritePolicy,
    /// Frames per file in `MultiFrameBatch` mode
    pub frames_per_file: usize,
    /// Index of the first file
    pub next_number: u64,
    /// Zero padding of the file index
    pub index_width: usize,
}

impl Default for SavingConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            format: SavingFormat::Edf,
            prefix: "ultra_".to_string(),
            suffix: ".edf".to_string(),
            mode: SavingMode::OneFilePerFrame,
            overwrite_policy: OverwritePolicy::Abort,
            frames_per_file: 100,
            next_number: 0,
            index_width: 4,
        }
    }
}

impl SavingConfig {
    /// `{prefix}{index:0width}{suffix}`
    pub fn file_name(&self, index: u64) -> String {
        format!(
            "{}{:0width$}{}",
            self.prefix,
            index,
            self.suffix,
            width = self.index_width
        )
    }

    /// Full path of the file with `index`.
    pub fn file_path(&self, index: u64) -> PathBuf {
        self.directory.join(self.file_name(index))
    }

    /// Check the combination of format, mode and policy. The directory itself
    /// is checked by the controller when the configuration is applied.
    pub fn validate(&self) -> AppResult<()> {
        if !self.format.is_available() {
            return Err(DaqError::InvalidConfig(format!(
                "format '{}' is not available in this build",
                self.format
            )));
        }
        if self.format == SavingFormat::Tiff {
            if self.mode == SavingMode::MultiFrameBatch {
                return Err(DaqError::InvalidConfig(
                    "tiff files hold a single frame".into(),
                ));
            }
            if self.overwrite_policy == OverwritePolicy::Append {
                return Err(DaqError::InvalidConfig(
                    "tiff files cannot be appended to".into(),
                ));
            }
        }
        if self.frames_per_file == 0 {
            return Err(DaqError::InvalidConfig(
                "frames_per_file must be > 0".into(),
            ));
        }
        if self.prefix.contains(['/', '\\']) || self.suffix.contains(['/', '\\']) {
            return Err(DaqError::InvalidConfig(
                "prefix and suffix must not contain path separators".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_padding() {
        let config = SavingConfig::default();
        assert_eq!(config.file_name(0), "ultra_0000.edf");
        assert_eq!(config.file_name(42), "ultra_0042.edf");

        let config = SavingConfig {
            index_width: 2,
            prefix: "scan_".into(),
            suffix: ".raw".into(),
            ..Default::default()
        };
        assert_eq!(config.file_name(7), "scan_07.raw");
        assert_eq!(config.file_name(123), "scan_123.raw");
    }

    #[test]
    fn test_validate_rejects_bad_combinations() {
        assert!(SavingConfig::default().validate().is_ok());

        let zero_batch = SavingConfig {
            frames_per_file: 0,
            ..Default::default()
        };
        assert!(zero_batch.validate().is_err());

        let bad_prefix = SavingConfig {
            prefix: "../x".into(),
            ..Default::default()
        };
        assert!(bad_prefix.validate().is_err());

        let tiff_batch = SavingConfig {
            format: SavingFormat::Tiff,
            mode: SavingMode::MultiFrameBatch,
            ..Default::default()
        };
        assert!(matches!(
            tiff_batch.validate(),
            Err(DaqError::InvalidConfig(_))
        ));
    }

    #[cfg(not(feature = "storage_tiff"))]
    #[test]
    fn test_tiff_unavailable_without_feature() {
        let config = SavingConfig {
            format: SavingFormat::Tiff,
            suffix: ".tiff".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&SavingMode::MultiFrameBatch).unwrap();
        assert_eq!(json, "\"multi_frame_batch\"");
        let policy: OverwritePolicy = serde_json::from_str("\"append\"").unwrap();
        assert_eq!(policy, OverwritePolicy::Append);
    }
}
