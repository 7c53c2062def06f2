//! The reviewable location: one vCard file per contact in a plain directory
//! the operator can inspect and edit between pipeline phases.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, info, warn};

use crate::contact::{new_identity, Contact, ContactSet};
use crate::remote::VersionMap;
use crate::vcard_io;

/// Version tags observed by the last download, next to the staged files.
const VERSIONS_FILE: &str = ".versions.json";

/// Load/save access to a staged contact set.
pub trait ContactStore {
    fn load_all(&self) -> Result<ContactSet>;
    fn save_all(&mut self, contacts: &ContactSet) -> Result<()>;

    /// `None` when no download has recorded versions yet.
    fn load_versions(&self) -> Result<Option<VersionMap>>;
    fn save_versions(&mut self, versions: &VersionMap) -> Result<()>;
}

/// File-backed store rooted at one directory.
#[derive(Debug, Clone)]
pub struct StagingDir {
    root: PathBuf,
}

impl StagingDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Decode every staged file, keyed by identity. Files without a UID get
    /// a fresh identity.
    fn load_with_paths(&self) -> Result<BTreeMap<String, (PathBuf, Contact)>> {
        let mut loaded: BTreeMap<String, (PathBuf, Contact)> = BTreeMap::new();
        if !self.root.exists() {
            return Ok(loaded);
        }

        let mut files = list_vcf_files(&self.root)?;
        files.sort();

        for path in files {
            let bytes =
                fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
            let mut contact = vcard_io::decode(&bytes)
                .with_context(|| format!("failed to parse vCard file {}", path.display()))?;

            if contact.uid.trim().is_empty() {
                contact.uid = new_identity();
                info!(
                    path = %path.display(),
                    identity = %contact.uid,
                    "staged contact had no UID; assigned a new identity"
                );
            }

            if let Some((previous, _)) = loaded.get(&contact.uid) {
                bail!(
                    "duplicate UID {} in {} and {}",
                    contact.uid,
                    previous.display(),
                    path.display()
                );
            }
            loaded.insert(contact.uid.clone(), (path, contact));
        }

        Ok(loaded)
    }
}

impl ContactStore for StagingDir {
    fn load_all(&self) -> Result<ContactSet> {
        let loaded = self.load_with_paths()?;
        debug!(count = loaded.len(), root = %self.root.display(), "loaded staged contacts");
        Ok(loaded.into_values().map(|(_, contact)| contact).collect())
    }

    fn save_all(&mut self, contacts: &ContactSet) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create directory: {}", self.root.display()))?;

        let mut current: HashMap<String, PathBuf> = HashMap::new();
        let mut used_names: HashSet<String> = HashSet::new();
        for path in list_vcf_files(&self.root)? {
            let uid = fs::read(&path)
                .ok()
                .and_then(|bytes| vcard_io::decode(&bytes).ok())
                .map(|contact| contact.uid)
                .filter(|uid| !uid.is_empty());
            match uid {
                Some(uid) if contacts.contains(&uid) => {
                    current.insert(uid, path);
                }
                // Operator-owned files that are not part of this save keep
                // their names.
                _ => {
                    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                        used_names.insert(name.to_string());
                    }
                }
            }
        }

        for contact in contacts.iter() {
            let name = select_filename(contact, &mut used_names);
            let target = self.root.join(&name);
            let bytes = vcard_io::encode(contact);

            let unchanged = fs::read(&target).map(|old| old == bytes).unwrap_or(false);
            if !unchanged {
                write_atomic(&target, &bytes)?;
            }

            if let Some(previous) = current.get(&contact.uid) {
                if *previous != target && previous.exists() {
                    fs::remove_file(previous).with_context(|| {
                        format!("failed to remove renamed file {}", previous.display())
                    })?;
                    debug!(
                        from = %previous.display(),
                        to = %target.display(),
                        "staged file renamed"
                    );
                }
            }
        }

        info!(count = contacts.len(), root = %self.root.display(), "saved staged contacts");
        Ok(())
    }

    fn load_versions(&self) -> Result<Option<VersionMap>> {
        let path = self.root.join(VERSIONS_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let versions = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse version file {}", path.display()))?;
        Ok(Some(versions))
    }

    fn save_versions(&mut self, versions: &VersionMap) -> Result<()> {
        let data =
            serde_json::to_vec_pretty(versions).context("failed to serialize version tags")?;
        write_atomic(&self.root.join(VERSIONS_FILE), &data)?;
        debug!(count = versions.len(), "saved version tags");
        Ok(())
    }
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    contacts: ContactSet,
    versions: Option<VersionMap>,
    saves: usize,
}

impl MemoryStore {
    pub fn new(contacts: ContactSet) -> Self {
        Self {
            contacts,
            versions: None,
            saves: 0,
        }
    }

    /// Stand-in for an operator editing the staged files.
    pub fn contacts_mut(&mut self) -> &mut ContactSet {
        &mut self.contacts
    }

    pub fn saves(&self) -> usize {
        self.saves
    }
}

impl ContactStore for MemoryStore {
    fn load_all(&self) -> Result<ContactSet> {
        Ok(self.contacts.clone())
    }

    fn save_all(&mut self, contacts: &ContactSet) -> Result<()> {
        self.contacts = contacts.clone();
        self.saves += 1;
        Ok(())
    }

    fn load_versions(&self) -> Result<Option<VersionMap>> {
        Ok(self.versions.clone())
    }

    fn save_versions(&mut self, versions: &VersionMap) -> Result<()> {
        self.versions = Some(versions.clone());
        Ok(())
    }
}

/// `{family}[+{suffix}]_{prefix+}{given}[+{additional}].vcf`
pub fn file_name_for(contact: &Contact) -> String {
    let name = &contact.name;
    let family = [name.family.trim(), name.suffix.trim()]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let given = [name.prefix.trim(), name.given.trim(), name.additional.trim()]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    let stem = if family.is_empty() && given.is_empty() {
        contact.uid.clone()
    } else {
        format!("{family}_{given}")
    };

    format!("{}.vcf", sanitize_filename(&stem))
}

fn select_filename(contact: &Contact, used_names: &mut HashSet<String>) -> String {
    let preferred = file_name_for(contact);
    if used_names.insert(preferred.clone()) {
        return preferred;
    }

    let stem = preferred.trim_end_matches(".vcf");
    let short: String = contact.uid.chars().take(8).collect();
    for suffix in [short.as_str(), contact.uid.as_str()] {
        let candidate = format!("{stem}~{}.vcf", sanitize_filename(suffix));
        if used_names.insert(candidate.clone()) {
            warn!(identity = %contact.uid, file = %candidate, "file name already taken");
            return candidate;
        }
    }

    let mut counter = 1u32;
    loop {
        let candidate = format!("{stem}~{}-{counter}.vcf", sanitize_filename(&contact.uid));
        if used_names.insert(candidate.clone()) {
            return candidate;
        }
        counter += 1;
    }
}

fn sanitize_filename(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            ' ' => '+',
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            _ => c,
        })
        .collect()
}

pub fn list_vcf_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    collect_vcf(root, &mut files)?;
    Ok(files)
}

fn collect_vcf(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in
        fs::read_dir(dir).with_context(|| format!("failed to read directory {}", dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        let hidden = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.starts_with('.'))
            .unwrap_or(false);
        if hidden {
            continue;
        }
        if path.is_dir() {
            collect_vcf(&path, files)?;
        } else if path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("vcf"))
            .unwrap_or(false)
        {
            files.push(path);
        }
    }
    Ok(())
}

pub fn write_atomic(target: &Path, data: &[u8]) -> Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| anyhow!("target path has no parent: {}", target.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent dir {}", parent.display()))?;

    let file_name = target
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("contact.vcf");
    let mut counter: u32 = 0;
    let temp_path = loop {
        let candidate = if counter == 0 {
            parent.join(format!(".{file_name}.tmp"))
        } else {
            parent.join(format!(".{file_name}.{counter}.tmp"))
        };
        if !candidate.exists() {
            break candidate;
        }
        counter += 1;
    };

    {
        use std::fs::OpenOptions;
        use std::io::Write;

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .with_context(|| {
                format!(
                    "failed to create temporary file {} for atomic write",
                    temp_path.display()
                )
            })?;

        file.write_all(data)
            .with_context(|| format!("failed to write temporary file {}", temp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync temporary file {}", temp_path.display()))?;
    }

    fs::rename(&temp_path, target).with_context(|| {
        format!(
            "failed to rename temporary file {} to {}",
            temp_path.display(),
            target.display()
        )
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::Name;
    use tempfile::TempDir;

    fn person(uid: &str, given: &str, family: &str) -> Contact {
        let mut contact = Contact::new(uid);
        contact.name = Name::new(given, family);
        contact
    }

    #[test]
    fn test_file_name_for_full_name() {
        let mut contact = person("u1", "Anna Lena", "von Berg");
        contact.name.prefix = "Dr.".into();
        contact.name.suffix = "Jr.".into();
        contact.name.additional = "Maria".into();
        assert_eq!(
            file_name_for(&contact),
            "von+Berg+Jr._Dr.+Anna+Lena+Maria.vcf"
        );
        assert_eq!(file_name_for(&person("u2", "A", "B/C")), "B_C_A.vcf");
        assert_eq!(file_name_for(&Contact::new("only-uid")), "only-uid.vcf");
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut store = StagingDir::new(dir.path());
        let contacts: ContactSet = vec![person("u1", "Jane", "Doe"), person("u2", "Max", "Muster")]
            .into_iter()
            .collect();

        store.save_all(&contacts).unwrap();
        assert!(dir.path().join("Doe_Jane.vcf").exists());
        assert!(dir.path().join("Muster_Max.vcf").exists());

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get("u1").unwrap().name.given, "Jane");
    }

    #[test]
    fn test_colliding_names_get_identity_suffix() {
        let dir = TempDir::new().unwrap();
        let mut store = StagingDir::new(dir.path());
        let contacts: ContactSet = vec![
            person("aaaaaaaa-1111", "Jane", "Doe"),
            person("bbbbbbbb-2222", "Jane", "Doe"),
        ]
        .into_iter()
        .collect();

        store.save_all(&contacts).unwrap();
        assert!(dir.path().join("Doe_Jane.vcf").exists());
        assert!(dir.path().join("Doe_Jane~bbbbbbbb.vcf").exists());
        assert_eq!(store.load_all().unwrap().len(), 2);
    }

    #[test]
    fn test_rename_removes_old_file_and_keeps_foreign_files() {
        let dir = TempDir::new().unwrap();
        let mut store = StagingDir::new(dir.path());
        store
            .save_all(&vec![person("u1", "Jane", "Doe")].into_iter().collect())
            .unwrap();
        fs::write(
            dir.path().join("manual.vcf"),
            "BEGIN:VCARD\r\nVERSION:3.0\r\nUID:manual\r\nFN:Manual\r\nEND:VCARD\r\n",
        )
        .unwrap();

        store
            .save_all(&vec![person("u1", "Jane", "Smith")].into_iter().collect())
            .unwrap();

        assert!(!dir.path().join("Doe_Jane.vcf").exists());
        assert!(dir.path().join("Smith_Jane.vcf").exists());
        assert!(dir.path().join("manual.vcf").exists());
        assert_eq!(store.load_all().unwrap().len(), 2);
    }

    #[test]
    fn test_load_assigns_identity_and_rejects_duplicates() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("new.vcf"),
            "BEGIN:VCARD\r\nVERSION:3.0\r\nFN:New Person\r\nN:Person;New;;;\r\nEND:VCARD\r\n",
        )
        .unwrap();
        let store = StagingDir::new(dir.path());
        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(!loaded.iter().next().unwrap().uid.is_empty());

        let dup = "BEGIN:VCARD\r\nVERSION:3.0\r\nUID:same\r\nEND:VCARD\r\n";
        fs::write(dir.path().join("a.vcf"), dup).unwrap();
        fs::write(dir.path().join("b.vcf"), dup).unwrap();
        let err = store.load_all().unwrap_err();
        assert!(err.to_string().contains("duplicate UID same"));
    }

    #[test]
    fn test_load_reports_undecodable_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("broken.vcf"), "not a card").unwrap();
        let err = StagingDir::new(dir.path()).load_all().unwrap_err();
        assert!(format!("{err:#}").contains("broken.vcf"));
    }

    #[test]
    fn test_missing_directory_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = StagingDir::new(dir.path().join("absent"));
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_versions_persist_beside_staged_files() {
        let dir = TempDir::new().unwrap();
        let mut store = StagingDir::new(dir.path());
        assert_eq!(store.load_versions().unwrap(), None);

        store
            .save_all(&vec![person("u1", "Jane", "Doe")].into_iter().collect())
            .unwrap();
        let versions: VersionMap = [
            ("u1".to_string(), Some("\"e1\"".to_string())),
            ("u2".to_string(), None),
        ]
        .into_iter()
        .collect();
        store.save_versions(&versions).unwrap();

        let reopened = StagingDir::new(dir.path());
        assert_eq!(reopened.load_versions().unwrap(), Some(versions));
        assert!(dir.path().join(".versions.json").exists());
        assert_eq!(reopened.load_all().unwrap().len(), 1);
    }

    #[test]
    fn test_corrupt_version_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(".versions.json"), "{not json").unwrap();
        let err = StagingDir::new(dir.path()).load_versions().unwrap_err();
        assert!(err.to_string().contains("failed to parse version file"));
    }

    #[test]
    fn test_memory_store_counts_saves() {
        let mut store = MemoryStore::default();
        store
            .save_all(&vec![Contact::new("x")].into_iter().collect())
            .unwrap();
        store.contacts_mut().remove("x");
        assert!(store.load_all().unwrap().is_empty());
        assert_eq!(store.saves(), 1);
    }
}
