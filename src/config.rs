//! Purpose: Load the JSON run configuration and apply command-line overrides.
//! Exports: `Config`, `TableDef`, `ConfigOverrides`, `RunOptions`, `default_workers`.
//! Role: Pre-run validation; every failure here is `ErrorKind::Config`.
//! Invariants: The source directory must exist; the output directory is created.
//! Invariants: A worker budget of zero means "half the cores, rounded up".
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::core::encode::Format;
use crate::core::error::{Error, ErrorKind};

pub const DEFAULT_CONFIG: &str = "conf.json";
pub const DEFAULT_HOOK_DIR: &str = "hook";

/// One exported table.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct TableDef {
    pub name: String,
    /// Workbook path, relative to the source directory.
    pub excel: String,
    /// Sheet name; defaults to the table name.
    #[serde(default)]
    pub sheet: String,
    #[serde(default)]
    pub is_map: bool,
    #[serde(default)]
    pub one_row_one_file: bool,
}

impl TableDef {
    pub fn new(name: impl Into<String>, excel: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            excel: excel.into(),
            sheet: String::new(),
            is_map: false,
            one_row_one_file: false,
        }
    }

    pub fn with_sheet(mut self, sheet: impl Into<String>) -> Self {
        self.sheet = sheet.into();
        self
    }

    pub fn map_shaped(mut self) -> Self {
        self.is_map = true;
        self
    }

    pub fn one_row_one_file(mut self) -> Self {
        self.one_row_one_file = true;
        self
    }

    pub fn sheet_name(&self) -> &str {
        if self.sheet.is_empty() {
            &self.name
        } else {
            &self.sheet
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub src_dir: Option<PathBuf>,
    pub out_dir: Option<PathBuf>,
    pub hook_dir: Option<PathBuf>,
    #[serde(default)]
    pub format: Format,
    #[serde(default)]
    pub cpu: usize,
    #[serde(default)]
    pub data_def: Vec<TableDef>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path).map_err(|err| {
            Error::new(ErrorKind::Config)
                .with_message("failed to read config")
                .with_path(path)
                .with_hint(format!("Create {DEFAULT_CONFIG} or pass --conf <path>."))
                .with_source(err)
        })?;
        Self::parse(&text).map_err(|err| err.with_path(path))
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        serde_json::from_str(text).map_err(|err| {
            Error::new(ErrorKind::Config)
                .with_message(format!("invalid config: {err}"))
                .with_source(err)
        })
    }

    /// Merges overrides and checks the directories.
    pub fn resolve(self, overrides: ConfigOverrides) -> Result<RunOptions, Error> {
        let src_dir = overrides.src.or(self.src_dir).ok_or_else(|| {
            Error::new(ErrorKind::Config)
                .with_message("no source directory configured")
                .with_hint("Set `src_dir` in the config or pass --src <dir>.")
        })?;
        if !src_dir.is_dir() {
            return Err(Error::new(ErrorKind::Config)
                .with_message("source directory does not exist")
                .with_path(&src_dir));
        }
        let out_dir = overrides.out.or(self.out_dir).ok_or_else(|| {
            Error::new(ErrorKind::Config)
                .with_message("no output directory configured")
                .with_hint("Set `out_dir` in the config or pass --out <dir>.")
        })?;
        fs::create_dir_all(&out_dir).map_err(|err| {
            Error::new(ErrorKind::Config)
                .with_message("failed to create output directory")
                .with_path(&out_dir)
                .with_source(err)
        })?;

        for def in &self.data_def {
            if def.name.trim().is_empty() || def.excel.trim().is_empty() {
                return Err(Error::new(ErrorKind::Config)
                    .with_message("table definitions need a `name` and an `excel` path"));
            }
        }

        let cpu = overrides.cpu.unwrap_or(self.cpu);
        Ok(RunOptions {
            src_dir,
            out_dir,
            hook_dir: overrides
                .hook_dir
                .or(self.hook_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_HOOK_DIR)),
            format: overrides.format.unwrap_or(self.format),
            workers: if cpu == 0 { default_workers() } else { cpu },
            only: overrides.names,
            tables: self.data_def,
        })
    }
}

/// Command-line values that win over the config file.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub cpu: Option<usize>,
    pub src: Option<PathBuf>,
    pub out: Option<PathBuf>,
    pub hook_dir: Option<PathBuf>,
    pub format: Option<Format>,
    pub names: Vec<String>,
}

/// Fully resolved settings for one export run.
#[derive(Clone, Debug)]
pub struct RunOptions {
    pub src_dir: PathBuf,
    pub out_dir: PathBuf,
    pub hook_dir: PathBuf,
    pub format: Format,
    pub workers: usize,
    /// Subset of table names to export; empty means all.
    pub only: Vec<String>,
    pub tables: Vec<TableDef>,
}

pub fn default_workers() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cores.div_ceil(2)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{Config, ConfigOverrides, default_workers};
    use crate::core::encode::Format;
    use crate::core::error::ErrorKind;

    #[test]
    fn parses_table_definitions_with_defaults() {
        let config = Config::parse(
            r#"{
                "src_dir": "tables", "out_dir": "out",
                "data_def": [
                    {"name": "Item", "excel": "Item.xlsx"},
                    {"name": "Global", "excel": "Global.xlsx", "sheet": "G", "is_map": true}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(config.format, Format::Lua);
        assert_eq!(config.cpu, 0);
        assert_eq!(config.data_def[0].sheet_name(), "Item");
        assert!(!config.data_def[0].one_row_one_file);
        assert_eq!(config.data_def[1].sheet_name(), "G");
        assert!(config.data_def[1].is_map);
    }

    #[test]
    fn bad_json_is_a_config_error() {
        let err = Config::parse("{\"data_def\": 3}").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        let err = Config::parse("{\"format\": \"xml\"}").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn overrides_win_and_directories_are_checked() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config::parse(r#"{"src_dir": "/definitely/missing", "cpu": 3}"#).unwrap();

        let err = config.clone().resolve(ConfigOverrides::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);

        let out = dir.path().join("nested/out");
        let options = config
            .resolve(ConfigOverrides {
                src: Some(dir.path().to_path_buf()),
                out: Some(out.clone()),
                format: Some(Format::Json),
                names: vec!["Item".to_string()],
                ..ConfigOverrides::default()
            })
            .unwrap();
        assert!(out.is_dir());
        assert_eq!(options.workers, 3);
        assert_eq!(options.format, Format::Json);
        assert_eq!(options.hook_dir, PathBuf::from("hook"));
        assert_eq!(options.only, ["Item"]);
    }

    #[test]
    fn zero_cpu_means_half_the_cores() {
        assert!(default_workers() >= 1);
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config::parse("{}").unwrap();
        let options = config
            .resolve(ConfigOverrides {
                src: Some(dir.path().to_path_buf()),
                out: Some(dir.path().to_path_buf()),
                ..ConfigOverrides::default()
            })
            .unwrap();
        assert_eq!(options.workers, default_workers());
    }
}
