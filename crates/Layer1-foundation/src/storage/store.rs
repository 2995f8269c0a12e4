//! 설정 파일 저장소 (TOML / JSON)

use crate::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};

/// File format, picked from the file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Toml,
    Json,
}

impl FileFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => FileFormat::Json,
            _ => FileFormat::Toml,
        }
    }
}

/// 설정 파일 저장소
#[derive(Debug, Clone)]
pub struct FileStore {
    base_dir: PathBuf,
}

impl FileStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// 글로벌 설정 (<config_dir>/labterm/)
    pub fn global() -> Result<Self> {
        let dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Cannot find config directory".to_string()))?
            .join("labterm");
        Ok(Self::new(dir))
    }

    /// 프로젝트 설정 (.labterm/)
    pub fn project(root: impl Into<PathBuf>) -> Self {
        Self::new(root.into().join(".labterm"))
    }

    /// 현재 디렉토리 프로젝트 설정
    pub fn current_project() -> Result<Self> {
        let cwd = std::env::current_dir()
            .map_err(|e| Error::Config(format!("Cannot get current directory: {}", e)))?;
        Ok(Self::project(cwd))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn file_path(&self, filename: &str) -> PathBuf {
        self.base_dir.join(filename)
    }

    fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            std::fs::create_dir_all(&self.base_dir)
                .map_err(|e| Error::Config(format!("Failed to create directory: {}", e)))?;
        }
        Ok(())
    }

    /// 파일 로드
    pub fn load<T: DeserializeOwned>(&self, filename: &str) -> Result<T> {
        load_path(&self.file_path(filename))
    }

    /// 파일 로드 (Optional)
    pub fn load_optional<T: DeserializeOwned>(&self, filename: &str) -> Result<Option<T>> {
        let path = self.file_path(filename);
        if !path.exists() {
            return Ok(None);
        }
        load_path(&path).map(Some)
    }

    /// Load the first of `filenames` that exists
    pub fn load_first<T: DeserializeOwned>(&self, filenames: &[&str]) -> Result<Option<T>> {
        for name in filenames {
            if let Some(value) = self.load_optional(name)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// 파일 저장
    pub fn save<T: Serialize>(&self, filename: &str, data: &T) -> Result<()> {
        self.ensure_dir()?;
        let path = self.file_path(filename);
        let content = match FileFormat::from_path(&path) {
            FileFormat::Json => serde_json::to_string_pretty(data)
                .map_err(|e| Error::Config(format!("Failed to serialize: {}", e)))?,
            FileFormat::Toml => toml::to_string_pretty(data)
                .map_err(|e| Error::Config(format!("Failed to serialize: {}", e)))?,
        };
        std::fs::write(&path, content)
            .map_err(|e| Error::Config(format!("Failed to write {}: {}", path.display(), e)))
    }

    /// 파일 존재 여부
    pub fn exists(&self, filename: &str) -> bool {
        self.file_path(filename).exists()
    }
}

/// Load one file, format chosen by extension
pub fn load_path<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
    match FileFormat::from_path(path) {
        FileFormat::Json => serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e))),
        FileFormat::Toml => toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e))),
    }
}
