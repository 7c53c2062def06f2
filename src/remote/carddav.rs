//! CardDAV client over plain HTTP requests.
//!
//! Only the primitives the sync needs are implemented: a depth-1 `PROPFIND`
//! listing of one collection, `GET` of a single resource and conditional
//! `PUT`. No discovery is attempted; the configured URL must point at the
//! address book collection itself.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Context, Result as AnyResult};
use reqwest::header::{HeaderMap, CONTENT_TYPE, ETAG, IF_MATCH};
use reqwest::{Client, Method, StatusCode, Url};
use tracing::{debug, info, warn};

use crate::config::RemoteConfig;
use crate::contact::Contact;
use crate::error::{ConflictReason, Result, SyncError};
use crate::remote::{Remote, RemoteState, VersionTag};
use crate::vcard_io::{self, FormatError};

/// Content types a listing entry must carry to count as a contact.
pub const ACCEPTED_CONTENT_TYPES: [&str; 4] = [
    "text/vcard",
    "text/vcard; charset=utf-8",
    "text/x-vcard",
    "text/x-vcard; charset=utf-8",
];

const USER_AGENT: &str = concat!("rosterdav/", env!("CARGO_PKG_VERSION"));
const VCARD_SUFFIX: &str = ".vcf";
const DAV_NAMESPACE: &str = "DAV:";

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8" ?>
<d:propfind xmlns:d="DAV:">
    <d:prop>
        <d:getcontenttype/>
        <d:getetag/>
    </d:prop>
</d:propfind>"#;

/// CardDAV client bound to one collection.
pub struct CardDavClient {
    http: Client,
    collection: Url,
    username: String,
    password: Option<String>,
    state: RemoteState,
    concurrency: usize,
}

impl CardDavClient {
    pub fn new(
        collection_url: &str,
        username: impl Into<String>,
        password: Option<String>,
        timeout: Duration,
        concurrency: usize,
    ) -> AnyResult<Self> {
        let mut collection = collection_url.trim().to_string();
        if !collection.ends_with('/') {
            collection.push('/');
        }
        let collection = Url::parse(&collection)
            .with_context(|| format!("invalid collection URL: {collection_url}"))?;

        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;

        info!("CardDAV client initialized for: {}", collection);

        Ok(Self {
            http,
            collection,
            username: username.into(),
            password,
            state: RemoteState::new(),
            concurrency: concurrency.max(1),
        })
    }

    pub fn from_config(config: &RemoteConfig) -> AnyResult<Self> {
        let password = config.resolve_password()?;
        Self::new(
            &config.url,
            config.username.clone(),
            password,
            Duration::from_secs(config.timeout_secs),
            config.max_connections,
        )
    }

    fn resource_url(&self, identity: &str) -> Result<Url> {
        let name = urlencoding::encode(identity);
        self.collection
            .join(&format!("{name}{VCARD_SUFFIX}"))
            .map_err(|err| SyncError::Transport {
                target: identity.to_string(),
                status: None,
                message: format!("cannot build resource URL: {err}"),
            })
    }
}

impl Remote for CardDavClient {
    async fn list_identities(&self, clear: bool) -> Result<BTreeSet<String>> {
        let target = self.collection.to_string();
        let method = Method::from_bytes(b"PROPFIND")
            .map_err(|err| SyncError::Protocol(err.to_string()))?;

        debug!("Listing collection: {}", target);

        let response = self
            .http
            .request(method, self.collection.clone())
            .basic_auth(&self.username, self.password.as_deref())
            .header(CONTENT_TYPE, "application/xml; charset=utf-8")
            .header("Depth", "1")
            .body(PROPFIND_BODY)
            .send()
            .await
            .map_err(|err| SyncError::transport(&target, err))?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = %status, "listing request failed");
            return Err(SyncError::status(&target, status));
        }

        let body = response
            .text()
            .await
            .map_err(|err| SyncError::transport(&target, err))?;
        let entries = parse_listing(&body)?;
        let identities: BTreeSet<String> =
            entries.iter().map(|(identity, _)| identity.clone()).collect();

        self.state.apply_listing(entries, clear).await;
        info!(count = identities.len(), clear, "listed remote contacts");
        Ok(identities)
    }

    async fn fetch(&self, identity: &str) -> Result<(Contact, Vec<u8>)> {
        let url = self.resource_url(identity)?;
        debug!(identity = %identity, "fetching contact");

        let response = self
            .http
            .get(url)
            .basic_auth(&self.username, self.password.as_deref())
            .send()
            .await
            .map_err(|err| SyncError::transport(identity, err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::status(identity, status));
        }

        let tag = version_from_headers(response.headers());
        let payload = response
            .bytes()
            .await
            .map_err(|err| SyncError::transport(identity, err))?
            .to_vec();

        let mut contact = vcard_io::decode(&payload).map_err(|source| SyncError::Format {
            identity: identity.to_string(),
            source,
        })?;

        if contact.uid.is_empty() {
            contact.uid = identity.to_string();
        } else if contact.uid != identity {
            warn!(
                identity = %identity,
                uid = %contact.uid,
                "UID differs from resource name; keeping the resource name"
            );
            contact.uid = identity.to_string();
        }

        self.state.record(identity, tag).await;
        Ok((contact, payload))
    }

    async fn write(&self, contact: &Contact, require_match: bool) -> Result<()> {
        let identity = contact.uid.as_str();
        if identity.is_empty() {
            return Err(SyncError::Format {
                identity: contact.display_name(),
                source: FormatError::MissingUid,
            });
        }

        let precondition = if require_match {
            match self.state.version(identity).await {
                Some(tag) => Some(tag),
                None => {
                    warn!(
                        identity = %identity,
                        "refusing conditional write without a known version"
                    );
                    return Err(SyncError::Conflict {
                        identity: identity.to_string(),
                        reason: ConflictReason::NoKnownVersion,
                    });
                }
            }
        } else {
            None
        };

        let url = self.resource_url(identity)?;
        let mut request = self
            .http
            .put(url)
            .basic_auth(&self.username, self.password.as_deref())
            .header(CONTENT_TYPE, "text/vcard; charset=utf-8");
        if let Some(tag) = &precondition {
            request = request.header(IF_MATCH, tag.as_str());
        }

        debug!(identity = %identity, conditional = precondition.is_some(), "writing contact");

        let response = request
            .body(vcard_io::encode(contact))
            .send()
            .await
            .map_err(|err| SyncError::transport(identity, err))?;

        let status = response.status();
        if status == StatusCode::PRECONDITION_FAILED {
            warn!(identity = %identity, "remote contact changed since it was downloaded");
            return Err(SyncError::Conflict {
                identity: identity.to_string(),
                reason: ConflictReason::RemoteChanged,
            });
        }
        if !status.is_success() {
            return Err(SyncError::status(identity, status));
        }

        self.state
            .record(identity, version_from_headers(response.headers()))
            .await;
        info!(identity = %identity, "wrote contact");
        Ok(())
    }

    fn state(&self) -> &RemoteState {
        &self.state
    }

    fn concurrency(&self) -> usize {
        self.concurrency
    }
}

/// `ETag`, falling back to Nextcloud's `OC-ETag`.
fn version_from_headers(headers: &HeaderMap) -> Option<VersionTag> {
    [ETAG.as_str(), "oc-etag"]
        .into_iter()
        .filter_map(|name| headers.get(name))
        .filter_map(|value| value.to_str().ok())
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

fn is_dav(node: &roxmltree::Node, name: &str) -> bool {
    node.is_element()
        && node.tag_name().name() == name
        && node.tag_name().namespace() == Some(DAV_NAMESPACE)
}

fn is_accepted_content_type(value: &str) -> bool {
    let normalized: String = value
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();
    ACCEPTED_CONTENT_TYPES
        .iter()
        .any(|accepted| accepted.replace(' ', "") == normalized)
}

/// Identity from an href: last path segment without the `.vcf` suffix.
/// Last path segment of `href` without the `.vcf` suffix, percent-decoded.
fn identity_from_href(href: &str) -> Option<String> {
    let segment = href.trim_end_matches('/').rsplit('/').next()?;
    let segment = segment.strip_suffix(VCARD_SUFFIX).unwrap_or(segment);
    let identity = match urlencoding::decode(segment) {
        Ok(decoded) => decoded.into_owned(),
        Err(err) => {
            debug!(href = %href, error = %err, "href is not valid UTF-8 once decoded");
            segment.to_string()
        }
    };
    (!identity.is_empty()).then_some(identity)
}

/// Parse a multistatus listing into `(identity, version tag)` pairs.
pub fn parse_listing(body: &str) -> Result<Vec<(String, Option<VersionTag>)>> {
    let doc = roxmltree::Document::parse(body)
        .map_err(|err| SyncError::Protocol(format!("invalid XML: {err}")))?;

    let mut entries = Vec::new();

    for response in doc.descendants().filter(|n| is_dav(n, "response")) {
        let href = response
            .descendants()
            .find(|n| is_dav(n, "href"))
            .and_then(|n| n.text())
            .map(str::trim)
            .filter(|href| !href.is_empty())
            .ok_or_else(|| SyncError::Protocol("listing entry without href".to_string()))?;

        let accepted = response
            .descendants()
            .filter(|n| is_dav(n, "getcontenttype"))
            .filter_map(|n| n.text())
            .any(is_accepted_content_type);
        if !accepted {
            continue;
        }

        let Some(identity) = identity_from_href(href) else {
            debug!(href = %href, "skipping entry without a resource name");
            continue;
        };

        let tag = response
            .descendants()
            .filter(|n| is_dav(n, "getetag"))
            .filter_map(|n| n.text())
            .map(str::trim)
            .find(|tag| !tag.is_empty())
            .map(str::to_string);

        entries.push((identity, tag));
    }

    Ok(entries)
}
