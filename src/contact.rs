//! Contact data model shared by the codec, the merge engine, the staging
//! area and the remote client.

use std::collections::btree_map;
use std::collections::BTreeMap;

use time::Date;
use uuid::Uuid;

/// vCard version a contact was read as. Encoding writes the same version
/// back so that server-side cards keep their dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VcardVersion {
    #[default]
    V3,
    V4,
}

impl VcardVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            VcardVersion::V3 => "3.0",
            VcardVersion::V4 => "4.0",
        }
    }
}

/// A property parameter such as `TYPE=CELL,VOICE`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Param {
    pub name: String,
    pub values: Vec<String>,
}

impl Param {
    pub fn new(name: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn single(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, vec![value.into()])
    }
}

fn has_type(params: &[Param], wanted: &str) -> bool {
    params
        .iter()
        .filter(|param| param.name.eq_ignore_ascii_case("TYPE"))
        .flat_map(|param| param.values.iter())
        .any(|value| value.trim().eq_ignore_ascii_case(wanted))
}

/// Structured name (the vCard `N` property).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Name {
    pub family: String,
    pub given: String,
    pub additional: String,
    pub prefix: String,
    pub suffix: String,
}

impl Name {
    pub fn new(given: impl Into<String>, family: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            given: given.into(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        [
            &self.family,
            &self.given,
            &self.additional,
            &self.prefix,
            &self.suffix,
        ]
        .iter()
        .all(|part| part.trim().is_empty())
    }

    /// "prefix given additional family suffix", skipping empty components.
    pub fn display(&self) -> String {
        [
            self.prefix.trim(),
            self.given.trim(),
            self.additional.trim(),
            self.family.trim(),
            self.suffix.trim(),
        ]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
    }
}

/// Postal address. Empty strings mean "not set".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Address {
    pub po_box: String,
    pub street: String,
    pub house_number: String,
    pub additional: String,
    pub zip: String,
    pub city: String,
    pub state: String,
    pub country: String,
    pub params: Vec<Param>,
}

impl Address {
    pub fn is_empty(&self) -> bool {
        [
            &self.po_box,
            &self.street,
            &self.house_number,
            &self.additional,
            &self.zip,
            &self.city,
            &self.state,
            &self.country,
        ]
        .iter()
        .all(|part| part.trim().is_empty())
    }

    /// Street line as written in the vCard street component.
    pub fn street_line(&self) -> String {
        match (self.street.is_empty(), self.house_number.is_empty()) {
            (false, false) => format!("{} {}", self.street, self.house_number),
            (false, true) => self.street.clone(),
            (true, false) => self.house_number.clone(),
            (true, true) => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Phone {
    pub group: Option<String>,
    pub number: String,
    pub params: Vec<Param>,
}

impl Phone {
    pub fn mobile(number: impl Into<String>) -> Self {
        Self {
            group: None,
            number: number.into(),
            params: vec![Param::single("TYPE", "CELL")],
        }
    }

    pub fn landline(number: impl Into<String>) -> Self {
        Self {
            group: None,
            number: number.into(),
            params: vec![Param::single("TYPE", "HOME")],
        }
    }

    pub fn is_mobile(&self) -> bool {
        has_type(&self.params, "CELL")
    }

    pub fn is_landline(&self) -> bool {
        !self.is_mobile() && has_type(&self.params, "HOME")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Email {
    pub group: Option<String>,
    pub address: String,
    pub params: Vec<Param>,
}

impl Email {
    pub fn internet(address: impl Into<String>) -> Self {
        Self {
            group: None,
            address: address.into(),
            params: vec![Param::single("TYPE", "INTERNET")],
        }
    }
}

/// Inline photo. Always transported base64-encoded.
#[derive(Clone, PartialEq, Eq)]
pub struct Photo {
    pub media_type: String,
    pub data: Vec<u8>,
}

impl std::fmt::Debug for Photo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Photo")
            .field("media_type", &self.media_type)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// A property line the model does not interpret. Kept verbatim so that
/// manual edits and server-side additions survive a rewrite.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawProperty {
    pub group: Option<String>,
    pub name: String,
    /// Everything between the property name and the colon, without the
    /// leading semicolon.
    pub params: String,
    /// The still-escaped value.
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Contact {
    /// Identity token. Assigned once, never regenerated.
    pub uid: String,
    pub version: VcardVersion,
    pub formatted_name: String,
    pub name: Name,
    pub nickname: Option<String>,
    pub birthday: Option<Date>,
    /// Organization name followed by units (`ORG:Club;Trumpet`).
    pub organization: Vec<String>,
    pub note: Option<String>,
    pub address: Option<Address>,
    pub phones: Vec<Phone>,
    pub email: Option<Email>,
    pub photo: Option<Photo>,
    pub extra: Vec<RawProperty>,
}

impl Contact {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            ..Self::default()
        }
    }

    pub fn display_name(&self) -> String {
        if !self.formatted_name.trim().is_empty() {
            return self.formatted_name.trim().to_string();
        }
        let display = self.name.display();
        if display.is_empty() {
            self.uid.clone()
        } else {
            display
        }
    }

    pub fn mobile(&self) -> Option<&Phone> {
        self.phones.iter().find(|phone| phone.is_mobile())
    }

    pub fn landline(&self) -> Option<&Phone> {
        self.phones.iter().find(|phone| phone.is_landline())
    }
}

pub fn new_identity() -> String {
    Uuid::new_v4().to_string()
}

/// Contacts keyed by identity token. Iteration order is the identity order,
/// which keeps every consumer deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContactSet {
    contacts: BTreeMap<String, Contact>,
}

impl ContactSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn get(&self, identity: &str) -> Option<&Contact> {
        self.contacts.get(identity)
    }

    pub fn get_mut(&mut self, identity: &str) -> Option<&mut Contact> {
        self.contacts.get_mut(identity)
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.contacts.contains_key(identity)
    }

    /// Insert or replace the contact stored under its identity.
    pub fn insert(&mut self, contact: Contact) -> Option<Contact> {
        self.contacts.insert(contact.uid.clone(), contact)
    }

    pub fn remove(&mut self, identity: &str) -> Option<Contact> {
        self.contacts.remove(identity)
    }

    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.contacts.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.values()
    }
}

impl FromIterator<Contact> for ContactSet {
    fn from_iter<I: IntoIterator<Item = Contact>>(iter: I) -> Self {
        let mut set = ContactSet::new();
        for contact in iter {
            set.insert(contact);
        }
        set
    }
}

impl IntoIterator for ContactSet {
    type Item = Contact;
    type IntoIter = btree_map::IntoValues<String, Contact>;

    fn into_iter(self) -> Self::IntoIter {
        self.contacts.into_values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_display_skips_empty_parts() {
        let name = Name {
            family: "Doe".into(),
            given: "Jane".into(),
            prefix: "Dr.".into(),
            ..Name::default()
        };
        assert_eq!(name.display(), "Dr. Jane Doe");
        assert!(!name.is_empty());
        assert!(Name::default().is_empty());
    }

    #[test]
    fn test_phone_kinds() {
        assert!(Phone::mobile("0170 1234").is_mobile());
        assert!(!Phone::mobile("0170 1234").is_landline());
        assert!(Phone::landline("0531/1234").is_landline());

        let both = Phone {
            group: None,
            number: "1".into(),
            params: vec![Param::new("type", vec!["home".into(), "cell".into()])],
        };
        assert!(both.is_mobile());
        assert!(!both.is_landline());
    }

    #[test]
    fn test_contact_set_keyed_by_identity() {
        let mut set = ContactSet::new();
        let mut first = Contact::new("b");
        first.formatted_name = "First".into();
        set.insert(first);
        set.insert(Contact::new("a"));

        let mut replacement = Contact::new("b");
        replacement.formatted_name = "Second".into();
        let previous = set.insert(replacement);

        assert_eq!(previous.map(|c| c.formatted_name), Some("First".to_string()));
        assert_eq!(set.len(), 2);
        assert_eq!(set.identities().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_display_name_fallbacks() {
        let mut contact = Contact::new("uid-1");
        assert_eq!(contact.display_name(), "uid-1");
        contact.name = Name::new("Jane", "Doe");
        assert_eq!(contact.display_name(), "Jane Doe");
        contact.formatted_name = "Jane (JD) Doe".into();
        assert_eq!(contact.display_name(), "Jane (JD) Doe");
    }

    #[test]
    fn test_address_street_line() {
        let address = Address {
            street: "Musterstraße".into(),
            house_number: "12a".into(),
            ..Address::default()
        };
        assert_eq!(address.street_line(), "Musterstraße 12a");
        assert!(Address::default().is_empty());
    }
}
