//! Photos stored as files named after the phone number, e.g.
//! `+491701234567.jpg`, `0049 170 1234567.png` or `0170 1234567.jpg`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use super::{normalize_phone, phone_digits, PhotoSource};

const EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];

pub struct PhotoDirectory {
    region: String,
    index: HashMap<String, PathBuf>,
}

impl PhotoDirectory {
    /// Index the photos under `root`. File names in national form are read
    /// with `region` as the default country.
    pub fn open(root: &Path, region: &str) -> Result<Self> {
        let entries = std::fs::read_dir(root)
            .with_context(|| format!("failed to read photo directory {}", root.display()))?;

        let mut index = HashMap::new();
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let known = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if !known {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let Some(key) = index_key(stem, region) else {
                debug!(path = %path.display(), "photo file name is not a phone number");
                continue;
            };
            index.entry(key).or_insert(path);
        }

        info!(path = %root.display(), photos = index.len(), "indexed photo directory");
        Ok(Self {
            region: region.to_string(),
            index,
        })
    }
}

fn index_key(raw: &str, region: &str) -> Option<String> {
    let digits = phone_digits(&normalize_phone(raw, region)?);
    (!digits.is_empty()).then_some(digits)
}

#[async_trait]
impl PhotoSource for PhotoDirectory {
    fn name(&self) -> &str {
        "directory"
    }

    async fn find_photo(&self, phone: &str) -> Result<Option<Vec<u8>>> {
        let Some(path) = index_key(phone, &self.region).and_then(|key| self.index.get(&key))
        else {
            return Ok(None);
        };
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read photo {}", path.display()))?;
        Ok(Some(data))
    }
}
