// src/print_data.rs - Staging and validation of slice bundles
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::error::ErrorCode;
use crate::layers::PrintOverrides;

/// Name of the optional per-print override file inside a bundle.
const SETTINGS_FILE: &str = "printsettings.toml";

#[derive(Debug, Error)]
pub enum PrintDataError {
    #[error("no print data available")]
    NoData,
    #[error("invalid print data: {0}")]
    Invalid(String),
    #[error("could not stage print data: {0}")]
    Stage(std::io::Error),
    #[error("could not read print settings: {0}")]
    Settings(String),
    #[error("could not move print data into place: {0}")]
    Move(std::io::Error),
    #[error("could not remove old print data: {0}")]
    Remove(std::io::Error),
}

impl PrintDataError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PrintDataError::NoData => ErrorCode::NoPrintDataAvailable,
            PrintDataError::Invalid(_) => ErrorCode::InvalidPrintData,
            PrintDataError::Stage(_) => ErrorCode::PrintDataStageError,
            PrintDataError::Settings(_) => ErrorCode::PrintDataSettings,
            PrintDataError::Move(_) => ErrorCode::PrintDataMove,
            PrintDataError::Remove(_) => ErrorCode::PrintDataRemove,
        }
    }
}

/// A validated bundle sitting in the active print directory.
#[derive(Debug)]
pub struct ActivePrint {
    dir: PathBuf,
    num_layers: u32,
    overrides: PrintOverrides,
}

impl ActivePrint {
    pub fn num_layers(&self) -> u32 {
        self.num_layers
    }

    pub fn overrides(&self) -> &PrintOverrides {
        &self.overrides
    }

    pub fn slice_path(&self, layer: u32) -> Option<PathBuf> {
        if layer == 0 || layer > self.num_layers {
            return None;
        }
        let path = self.dir.join(format!("slice_{layer}.png"));
        path.exists().then_some(path)
    }
}

/// Moves incoming slice bundles into the active print directory and answers
/// what is currently printable.
///
/// A bundle is a directory of `slice_1.png .. slice_N.png` plus an optional
/// `printsettings.toml` of per-print overrides.
pub struct PrintDataManager {
    download_dir: PathBuf,
    print_dir: PathBuf,
}

impl PrintDataManager {
    pub fn new(download_dir: &str, print_dir: &str) -> Self {
        Self {
            download_dir: PathBuf::from(download_dir),
            print_dir: PathBuf::from(print_dir),
        }
    }

    /// Validate the newest bundle in the download directory and move it
    /// into place, replacing whatever was staged before.
    pub fn process_incoming(&self) -> Result<(), PrintDataError> {
        let bundle = self.find_incoming()?;
        validate_bundle(&bundle)?;

        if self.print_dir.exists() {
            fs::remove_dir_all(&self.print_dir).map_err(PrintDataError::Remove)?;
        }
        if let Some(parent) = self.print_dir.parent() {
            fs::create_dir_all(parent).map_err(PrintDataError::Stage)?;
        }
        fs::rename(&bundle, &self.print_dir).map_err(PrintDataError::Move)?;
        tracing::info!("staged print data from {}", bundle.display());
        Ok(())
    }

    /// Open the staged bundle for printing.
    pub fn active(&self) -> Result<ActivePrint, PrintDataError> {
        let num_layers = validate_bundle(&self.print_dir)?;
        let overrides = load_overrides(&self.print_dir)?;
        Ok(ActivePrint {
            dir: self.print_dir.clone(),
            num_layers,
            overrides,
        })
    }

    /// Re-read only the override file of the staged bundle.
    pub fn reload_overrides(&self) -> Result<PrintOverrides, PrintDataError> {
        if !self.print_dir.exists() {
            return Err(PrintDataError::NoData);
        }
        load_overrides(&self.print_dir)
    }

    /// Discard the staged bundle.
    pub fn clear(&self) -> Result<(), PrintDataError> {
        if self.print_dir.exists() {
            fs::remove_dir_all(&self.print_dir).map_err(PrintDataError::Remove)?;
        }
        Ok(())
    }

    fn find_incoming(&self) -> Result<PathBuf, PrintDataError> {
        let entries = match fs::read_dir(&self.download_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PrintDataError::NoData);
            }
            Err(e) => return Err(PrintDataError::Stage(e)),
        };
        let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
        for entry in entries {
            let entry = entry.map_err(PrintDataError::Stage)?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .map_err(PrintDataError::Stage)?;
            if newest.as_ref().is_none_or(|(t, _)| modified > *t) {
                newest = Some((modified, path));
            }
        }
        newest.map(|(_, p)| p).ok_or(PrintDataError::NoData)
    }
}

/// Check the slice numbering is 1..=N with no gaps; returns N.
fn validate_bundle(dir: &Path) -> Result<u32, PrintDataError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PrintDataError::NoData);
        }
        Err(e) => return Err(PrintDataError::Stage(e)),
    };
    let mut count = 0u32;
    let mut max = 0u32;
    for entry in entries {
        let entry = entry.map_err(PrintDataError::Stage)?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(num) = name
            .strip_prefix("slice_")
            .and_then(|rest| rest.strip_suffix(".png"))
        else {
            continue;
        };
        let num: u32 = num
            .parse()
            .map_err(|_| PrintDataError::Invalid(format!("bad slice name {name}")))?;
        if num == 0 {
            return Err(PrintDataError::Invalid("slices are 1-indexed".into()));
        }
        count += 1;
        max = max.max(num);
    }
    if count == 0 {
        return Err(PrintDataError::NoData);
    }
    if max != count {
        return Err(PrintDataError::Invalid(format!(
            "expected slices 1..={count}, highest is {max}"
        )));
    }
    Ok(count)
}

fn load_overrides(dir: &Path) -> Result<PrintOverrides, PrintDataError> {
    let path = dir.join(SETTINGS_FILE);
    if !path.exists() {
        return Ok(PrintOverrides::default());
    }
    let contents =
        fs::read_to_string(&path).map_err(|e| PrintDataError::Settings(e.to_string()))?;
    toml::from_str(&contents).map_err(|e| PrintDataError::Settings(e.to_string()))
}
