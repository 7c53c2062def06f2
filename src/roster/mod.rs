//! Roster export loading.
//!
//! The club publishes its member list as a `;`-separated CSV file. This
//! module fetches it (over HTTP or from disk), splits it into rows and hands
//! every row to [`parsers::parse_record`].

pub mod parsers;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::{Client, Url};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::config::RosterConfig;
use crate::contact::Contact;

use self::parsers::{parse_record, RosterRow, RosterSettings, COLUMN_COUNT};

const USER_AGENT: &str = concat!("rosterdav/", env!("CARGO_PKG_VERSION"));

/// Anything that can produce the freshly parsed roster.
#[allow(async_fn_in_trait)]
pub trait RosterSource {
    async fn fetch_roster(&self) -> Result<Vec<Contact>>;
}

/// Roster downloaded from `{url}{file_name}`.
pub struct HttpRoster {
    client: Client,
    url: Url,
    username: Option<String>,
    password: Option<String>,
    settings: RosterSettings,
}

impl HttpRoster {
    pub fn new(
        base_url: &str,
        file_name: &str,
        username: Option<String>,
        password: Option<String>,
        settings: RosterSettings,
    ) -> Result<Self> {
        let base = Url::parse(base_url).with_context(|| format!("invalid roster URL: {base_url}"))?;
        let url = base
            .join(file_name)
            .with_context(|| format!("invalid roster file name: {file_name}"))?;
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(60))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            url,
            username,
            password,
            settings,
        })
    }
}

impl RosterSource for HttpRoster {
    async fn fetch_roster(&self) -> Result<Vec<Contact>> {
        debug!("Downloading roster from: {}", self.url);
        let mut request = self.client.get(self.url.clone());
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("failed to download roster from {}", self.url))?;

        let status = response.status();
        if !status.is_success() {
            bail!("roster download failed: {} answered {}", self.url, status);
        }

        let bytes = response.bytes().await.context("failed to read roster body")?;
        let text = String::from_utf8(bytes.to_vec()).context("roster is not valid UTF-8")?;
        Ok(parse_roster(&text, &self.settings, current_year()))
    }
}

/// Roster read from a local export.
pub struct FileRoster {
    path: PathBuf,
    settings: RosterSettings,
}

impl FileRoster {
    pub fn new(path: impl Into<PathBuf>, settings: RosterSettings) -> Self {
        Self {
            path: path.into(),
            settings,
        }
    }
}

impl RosterSource for FileRoster {
    async fn fetch_roster(&self) -> Result<Vec<Contact>> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read roster {}", self.path.display()))?;
        Ok(parse_roster(&text, &self.settings, current_year()))
    }
}

/// Either configured source, picked at runtime.
pub enum ConfiguredRoster {
    Http(HttpRoster),
    File(FileRoster),
}

impl ConfiguredRoster {
    /// A path given on the command line wins over the configured source.
    pub fn from_config(config: &RosterConfig, override_path: Option<PathBuf>) -> Result<Self> {
        let settings = config.settings();
        if let Some(path) = override_path.or_else(|| config.path.clone()) {
            return Ok(ConfiguredRoster::File(FileRoster::new(path, settings)));
        }
        let Some(url) = &config.url else {
            bail!("no roster source configured: set [roster] url or path, or pass --roster");
        };
        Ok(ConfiguredRoster::Http(HttpRoster::new(
            url,
            &config.file_name,
            config.username.clone(),
            config.resolve_password()?,
            settings,
        )?))
    }
}

impl RosterSource for ConfiguredRoster {
    async fn fetch_roster(&self) -> Result<Vec<Contact>> {
        match self {
            ConfiguredRoster::Http(source) => source.fetch_roster().await,
            ConfiguredRoster::File(source) => source.fetch_roster().await,
        }
    }
}

fn current_year() -> i32 {
    OffsetDateTime::now_utc().year()
}

/// Parse the whole export. The first row is the header.
pub fn parse_roster(text: &str, settings: &RosterSettings, current_year: i32) -> Vec<Contact> {
    let rows = split_csv(text);
    let mut contacts = Vec::new();

    for (index, fields) in rows.into_iter().enumerate().skip(1) {
        if fields.iter().all(|field| field.trim().is_empty()) {
            continue;
        }
        if fields.len() < COLUMN_COUNT {
            debug!(row = index + 1, columns = fields.len(), "short roster row");
        }
        contacts.push(parse_record(
            &RosterRow::from_fields(&fields),
            settings,
            current_year,
        ));
    }

    info!(count = contacts.len(), "parsed roster");
    contacts
}

/// Split `;`-separated text with double-quote quoting into rows of fields.
pub fn split_csv(text: &str) -> Vec<Vec<String>> {
    let text = text.trim_start_matches('\u{feff}');
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if quoted {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => quoted = false,
                _ => field.push(c),
            }
            continue;
        }

        match c {
            '"' => quoted = true,
            ';' => row.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            _ => field.push(c),
        }
    }

    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }

    rows
}
