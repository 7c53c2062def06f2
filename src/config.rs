use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use directories::BaseDirs;
use serde::Deserialize;
use tracing::warn;

use crate::roster::parsers::RosterSettings;

const CONFIG_FILE_NAME: &str = "config.toml";
const APP_NAME: &str = "rosterdav";
const DEFAULT_ROSTER_FILE: &str = "latest_Akadressen_CSV.csv";

#[derive(Debug, Clone)]
pub struct Config {
    pub config_path: PathBuf,
    pub staging_dir: PathBuf,
    pub phone_region: String,
    pub remote: RemoteConfig,
    pub roster: RosterConfig,
    pub photos: PhotosConfig,
}

// =============================================================================
// Remote collection
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub url: String,
    pub username: String,
    pub password: Option<String>,
    /// Environment variable holding the password.
    pub password_env: Option<String>,
    pub timeout_secs: u64,
    pub max_connections: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            username: String::new(),
            password: None,
            password_env: None,
            timeout_secs: 20,
            max_connections: 5,
        }
    }
}

impl RemoteConfig {
    pub fn resolve_password(&self) -> Result<Option<String>> {
        resolve_secret(self.password.as_deref(), self.password_env.as_deref(), "remote")
    }
}

// =============================================================================
// Roster export
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RosterConfig {
    /// Base URL of the directory holding the export.
    pub url: Option<String>,
    pub file_name: String,
    /// Local export, used instead of `url`.
    pub path: Option<PathBuf>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub password_env: Option<String>,
    pub organization: String,
    pub club_name: String,
    pub area_code: String,
}

impl Default for RosterConfig {
    fn default() -> Self {
        let settings = RosterSettings::default();
        Self {
            url: None,
            file_name: DEFAULT_ROSTER_FILE.to_string(),
            path: None,
            username: None,
            password: None,
            password_env: None,
            organization: settings.organization,
            club_name: settings.club_name,
            area_code: settings.area_code,
        }
    }
}

impl RosterConfig {
    pub fn settings(&self) -> RosterSettings {
        RosterSettings {
            organization: self.organization.clone(),
            club_name: self.club_name.clone(),
            area_code: self.area_code.clone(),
        }
    }

    pub fn resolve_password(&self) -> Result<Option<String>> {
        resolve_secret(self.password.as_deref(), self.password_env.as_deref(), "roster")
    }
}

// =============================================================================
// Photo sources
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PhotosConfig {
    pub max_downloads: usize,
    pub whatsapp_har: Option<PathBuf>,
    pub directory: Option<PathBuf>,
}

impl Default for PhotosConfig {
    fn default() -> Self {
        Self {
            max_downloads: 5,
            whatsapp_har: None,
            directory: None,
        }
    }
}

impl PhotosConfig {
    pub fn has_sources(&self) -> bool {
        self.whatsapp_har.is_some() || self.directory.is_some()
    }
}

fn resolve_secret(
    inline: Option<&str>,
    env: Option<&str>,
    section: &str,
) -> Result<Option<String>> {
    if let Some(var) = env {
        let value = std::env::var(var).with_context(|| {
            format!("{section}.password_env names `{var}`, which is not set")
        })?;
        return Ok(Some(value));
    }
    Ok(inline.map(str::to_string))
}

/// Expand ~ to home directory in paths
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = home::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

// =============================================================================
// Loading
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    staging_dir: Option<PathBuf>,
    phone_region: Option<String>,
    remote: RemoteConfig,
    roster: RosterConfig,
    photos: PhotosConfig,
}

fn config_root() -> Result<PathBuf> {
    let base = BaseDirs::new().context("unable to determine base directories")?;
    Ok(base.config_dir().join(APP_NAME))
}

pub fn config_path() -> Result<PathBuf> {
    Ok(config_root()?.join(CONFIG_FILE_NAME))
}

/// Load the configuration from `path`, or from the default location.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(path) => expand_tilde(path),
        None => config_path()?,
    };
    if !path.exists() {
        bail!(
            "configuration file not found at {}. Please create it as per docs.",
            path.display()
        );
    }

    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read configuration file at {}", path.display()))?;
    parse(&raw, path)
}

fn parse(raw: &str, path: PathBuf) -> Result<Config> {
    let value: toml::Value = toml::from_str(raw)
        .with_context(|| format!("failed to parse {} as TOML", path.display()))?;

    warn_unknown_keys(&value);

    let cfg_file: ConfigFile = value
        .try_into()
        .with_context(|| format!("failed to deserialize config from {}", path.display()))?;

    let staging_dir = cfg_file
        .staging_dir
        .map(|dir| expand_tilde(&dir))
        .ok_or_else(|| anyhow!("`staging_dir` must be specified in configuration"))?;

    let phone_region = cfg_file
        .phone_region
        .as_ref()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(|value| value.to_ascii_uppercase())
        .unwrap_or_else(|| "DE".to_string());

    let remote = cfg_file.remote;
    if remote.url.trim().is_empty() {
        bail!("`remote.url` must be specified in configuration");
    }
    if remote.max_connections == 0 {
        bail!("`remote.max_connections` must be at least 1");
    }

    let mut roster = cfg_file.roster;
    roster.path = roster.path.map(|p| expand_tilde(&p));
    if let Some(url) = &roster.url {
        if !url.ends_with('/') {
            roster.url = Some(format!("{url}/"));
        }
    }

    let mut photos = cfg_file.photos;
    photos.whatsapp_har = photos.whatsapp_har.map(|p| expand_tilde(&p));
    photos.directory = photos.directory.map(|p| expand_tilde(&p));

    Ok(Config {
        config_path: path,
        staging_dir,
        phone_region,
        remote,
        roster,
        photos,
    })
}

// =============================================================================
// Unknown key warnings
// =============================================================================

fn warn_unknown_keys(value: &toml::Value) {
    let Some(table) = value.as_table() else {
        return;
    };

    let known = HashSet::from(["staging_dir", "phone_region", "remote", "roster", "photos"]);

    for key in table.keys() {
        if !known.contains(key.as_str()) {
            warn!("unknown configuration key `{}`", key);
        }
    }

    if let Some(v) = table.get("remote") {
        warn_unknown_in_section(
            v,
            "remote",
            &[
                "url",
                "username",
                "password",
                "password_env",
                "timeout_secs",
                "max_connections",
            ],
        );
    }
    if let Some(v) = table.get("roster") {
        warn_unknown_in_section(
            v,
            "roster",
            &[
                "url",
                "file_name",
                "path",
                "username",
                "password",
                "password_env",
                "organization",
                "club_name",
                "area_code",
            ],
        );
    }
    if let Some(v) = table.get("photos") {
        warn_unknown_in_section(v, "photos", &["max_downloads", "whatsapp_har", "directory"]);
    }
}

fn warn_unknown_in_section(value: &toml::Value, section: &str, known: &[&str]) {
    let Some(table) = value.as_table() else {
        return;
    };
    let known_set: HashSet<&str> = known.iter().copied().collect();
    for key in table.keys() {
        if !known_set.contains(key.as_str()) {
            warn!("unknown configuration key `{}.{}`", section, key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MINIMAL: &str = r#"
staging_dir = "/tmp/club"

[remote]
url = "https://cloud.example.org/dav/club/"
username = "me"
password = "secret"
"#;

    #[test]
    fn test_defaults_are_applied() {
        let config = parse(MINIMAL, PathBuf::from("config.toml")).unwrap();
        assert_eq!(config.staging_dir, PathBuf::from("/tmp/club"));
        assert_eq!(config.phone_region, "DE");
        assert_eq!(config.remote.timeout_secs, 20);
        assert_eq!(config.remote.max_connections, 5);
        assert_eq!(config.roster.file_name, "latest_Akadressen_CSV.csv");
        assert_eq!(config.roster.settings(), RosterSettings::default());
        assert_eq!(config.photos.max_downloads, 5);
        assert!(!config.photos.has_sources());
        assert_eq!(
            config.remote.resolve_password().unwrap().as_deref(),
            Some("secret")
        );
    }

    #[test]
    fn test_full_config() {
        let raw = r#"
staging_dir = "~/club"
phone_region = " at "
unexpected = 1

[remote]
url = "https://cloud.example.org/dav/club/"
username = "me"
max_connections = 2
timeout_secs = 5

[roster]
url = "https://club.example.org/files"
username = "member"
area_code = "030"
club_name = "Orchester"

[photos]
max_downloads = 3
directory = "/srv/photos"
"#;
        let config = parse(raw, PathBuf::from("config.toml")).unwrap();
        assert_eq!(config.phone_region, "AT");
        assert_eq!(config.remote.max_connections, 2);
        assert_eq!(config.remote.timeout_secs, 5);
        assert_eq!(
            config.roster.url.as_deref(),
            Some("https://club.example.org/files/")
        );
        let settings = config.roster.settings();
        assert_eq!(settings.area_code, "030");
        assert_eq!(settings.club_name, "Orchester");
        assert_eq!(settings.organization, "AkaBlas e.V.");
        assert_eq!(config.photos.directory, Some(PathBuf::from("/srv/photos")));
        assert!(config.photos.has_sources());
        if let Some(home) = home::home_dir() {
            assert_eq!(config.staging_dir, home.join("club"));
        }
    }

    #[test]
    fn test_missing_required_keys() {
        let err = parse("[remote]\nurl = \"https://x/\"\n", PathBuf::from("c.toml")).unwrap_err();
        assert!(err.to_string().contains("staging_dir"));

        let err = parse("staging_dir = \"/tmp\"\n", PathBuf::from("c.toml")).unwrap_err();
        assert!(err.to_string().contains("remote.url"));
    }

    #[test]
    fn test_password_env() {
        let var = "ROSTERDAV_TEST_PASSWORD_ENV";
        std::env::set_var(var, "from-env");
        let remote = RemoteConfig {
            password: Some("inline".into()),
            password_env: Some(var.into()),
            ..RemoteConfig::default()
        };
        assert_eq!(remote.resolve_password().unwrap().as_deref(), Some("from-env"));

        let missing = RosterConfig {
            password_env: Some("ROSTERDAV_TEST_UNSET_VARIABLE".into()),
            ..RosterConfig::default()
        };
        assert!(missing.resolve_password().is_err());
    }

    #[test]
    fn test_load_from_explicit_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, MINIMAL).unwrap();
        let config = load(Some(&path)).unwrap();
        assert_eq!(config.config_path, path);

        let err = load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(err.to_string().contains("configuration file not found"));
    }
}
