//! Photos recovered from a browser HAR capture of WhatsApp Web.
//!
//! Profile pictures show up as image responses whose request URL embeds the
//! phone number of the account. The archive is indexed once on load.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use tracing::{debug, info};

use super::{phone_digits, PhotoSource};

#[derive(Debug, Deserialize)]
struct Har {
    log: HarLog,
}

#[derive(Debug, Default, Deserialize)]
struct HarLog {
    #[serde(default)]
    entries: Vec<HarEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct HarEntry {
    #[serde(default)]
    request: HarRequest,
    #[serde(default)]
    response: HarResponse,
}

#[derive(Debug, Default, Deserialize)]
struct HarRequest {
    #[serde(default)]
    url: String,
}

#[derive(Debug, Default, Deserialize)]
struct HarResponse {
    #[serde(default)]
    content: HarContent,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HarContent {
    #[serde(default)]
    mime_type: String,
    text: Option<String>,
    encoding: Option<String>,
}

/// Image bodies from a HAR file, keyed by request URL.
#[derive(Debug, Default)]
pub struct HarArchive {
    images: Vec<(String, Vec<u8>)>,
}

impl HarArchive {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read HAR file {}", path.display()))?;
        let archive = Self::from_json(&text)
            .with_context(|| format!("failed to parse HAR file {}", path.display()))?;
        info!(
            path = %path.display(),
            images = archive.images.len(),
            "loaded HAR archive"
        );
        Ok(archive)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let har: Har = serde_json::from_str(text).context("not a HAR document")?;

        let mut images = Vec::new();
        for entry in har.log.entries {
            let content = entry.response.content;
            if !content.mime_type.starts_with("image/") {
                continue;
            }
            let Some(body) = content.text.filter(|text| !text.is_empty()) else {
                continue;
            };
            let data = if content.encoding.as_deref() == Some("base64") {
                match STANDARD.decode(body.trim()) {
                    Ok(data) => data,
                    Err(err) => {
                        debug!(
                            url = %entry.request.url,
                            error = %err,
                            "skipping undecodable HAR body"
                        );
                        continue;
                    }
                }
            } else {
                body.into_bytes()
            };
            images.push((entry.request.url, data));
        }

        Ok(Self { images })
    }

    fn lookup(&self, phone: &str) -> Option<&[u8]> {
        let digits = phone_digits(phone);
        if digits.is_empty() {
            return None;
        }
        self.images
            .iter()
            .find(|(url, _)| url.contains(&digits))
            .map(|(_, data)| data.as_slice())
    }
}

#[async_trait]
impl PhotoSource for HarArchive {
    fn name(&self) -> &str {
        "whatsapp"
    }

    async fn find_photo(&self, phone: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lookup(phone).map(<[u8]>::to_vec))
    }
}
