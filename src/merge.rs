//! Reconcile freshly parsed roster records with the contacts already on the
//! server.
//!
//! Records are matched by a normalized "given family" key. A matched record
//! only ever adds or overwrites fields; anything it leaves empty is kept from
//! the existing contact. Nothing is deleted here.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::contact::{new_identity, Contact, ContactSet, Phone};

#[derive(Debug, Default)]
pub struct MergeOutcome {
    pub contacts: ContactSet,
    /// Existing identities whose fields changed.
    pub updated: Vec<String>,
    /// Identities minted for unmatched records.
    pub created: Vec<String>,
}

impl MergeOutcome {
    pub fn unchanged(&self) -> usize {
        self.contacts.len() - self.updated.len() - self.created.len()
    }
}

/// Case-insensitive, whitespace-collapsed "given family". `None` when the
/// contact has neither.
pub fn match_key(contact: &Contact) -> Option<String> {
    let joined = format!("{} {}", contact.name.given, contact.name.family);
    let key = joined
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    (!key.is_empty()).then_some(key)
}

pub fn merge(existing: ContactSet, incoming: Vec<Contact>) -> MergeOutcome {
    let mut contacts = existing;
    let mut index: HashMap<String, String> = HashMap::new();

    for contact in contacts.iter() {
        let Some(key) = match_key(contact) else {
            continue;
        };
        match index.get(&key) {
            // Identity order: the lowest identity wins.
            Some(kept) => warn!(
                key = %key,
                kept = %kept,
                ignored = %contact.uid,
                "several existing contacts share a name; matching only the first"
            ),
            None => {
                index.insert(key, contact.uid.clone());
            }
        }
    }

    let mut originals: HashMap<String, Contact> = HashMap::new();
    let mut created: Vec<String> = Vec::new();

    for record in incoming {
        let key = match_key(&record);
        // Records without a usable name are recognized by identity alone.
        let matched = key
            .as_ref()
            .and_then(|key| index.get(key))
            .cloned()
            .or_else(|| {
                (!record.uid.is_empty() && contacts.contains(&record.uid))
                    .then(|| record.uid.clone())
            });

        match matched.and_then(|identity| contacts.get_mut(&identity)) {
            Some(target) => {
                if !created.contains(&target.uid) && !originals.contains_key(&target.uid) {
                    originals.insert(target.uid.clone(), target.clone());
                }
                debug!(identity = %target.uid, "merging roster record into existing contact");
                fuse(target, record);
            }
            None => {
                let mut contact = record;
                if contact.uid.is_empty() {
                    contact.uid = new_identity();
                }
                debug!(identity = %contact.uid, name = %contact.display_name(), "new contact");
                if let Some(key) = key {
                    index.insert(key, contact.uid.clone());
                }
                created.push(contact.uid.clone());
                contacts.insert(contact);
            }
        }
    }

    let mut updated: Vec<String> = originals
        .into_iter()
        .filter(|(identity, original)| contacts.get(identity) != Some(original))
        .map(|(identity, _)| identity)
        .collect();
    updated.sort();
    created.sort();

    MergeOutcome {
        contacts,
        updated,
        created,
    }
}

fn overwrite(target: &mut String, incoming: String) {
    let incoming = incoming.trim();
    if !incoming.is_empty() {
        *target = incoming.to_string();
    }
}

fn overwrite_option<T>(target: &mut Option<T>, incoming: Option<T>) {
    if incoming.is_some() {
        *target = incoming;
    }
}

/// Replace the number of the first phone of the same kind, keeping its
/// parameters, or append the incoming phone.
fn fuse_phone(phones: &mut Vec<Phone>, incoming: Phone, same_kind: fn(&Phone) -> bool) {
    if incoming.number.trim().is_empty() {
        return;
    }
    match phones.iter_mut().find(|phone| same_kind(phone)) {
        Some(existing) => existing.number = incoming.number,
        None => phones.push(incoming),
    }
}

fn fuse(target: &mut Contact, incoming: Contact) {
    overwrite(&mut target.formatted_name, incoming.formatted_name);

    let name = incoming.name;
    overwrite(&mut target.name.family, name.family);
    overwrite(&mut target.name.given, name.given);
    overwrite(&mut target.name.additional, name.additional);
    overwrite(&mut target.name.prefix, name.prefix);
    overwrite(&mut target.name.suffix, name.suffix);

    overwrite_option(
        &mut target.nickname,
        incoming.nickname.filter(|nick| !nick.trim().is_empty()),
    );
    overwrite_option(&mut target.birthday, incoming.birthday);
    overwrite_option(
        &mut target.note,
        incoming.note.filter(|note| !note.trim().is_empty()),
    );

    if incoming.organization.iter().any(|unit| !unit.trim().is_empty()) {
        target.organization = incoming.organization;
    }

    if let Some(mut address) = incoming.address.filter(|address| !address.is_empty()) {
        if address.params.is_empty() {
            if let Some(previous) = &target.address {
                address.params = previous.params.clone();
            }
        }
        target.address = Some(address);
    }

    for phone in incoming.phones {
        if phone.is_mobile() {
            fuse_phone(&mut target.phones, phone, Phone::is_mobile);
        } else if phone.is_landline() {
            fuse_phone(&mut target.phones, phone, Phone::is_landline);
        } else if !target.phones.iter().any(|p| p.number == phone.number) {
            target.phones.push(phone);
        }
    }

    if let Some(email) = incoming.email.filter(|email| !email.address.trim().is_empty()) {
        match &mut target.email {
            Some(existing) => existing.address = email.address,
            None => target.email = Some(email),
        }
    }

    overwrite_option(&mut target.photo, incoming.photo);

    for raw in incoming.extra {
        if !target.extra.contains(&raw) {
            target.extra.push(raw);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::{Address, Email, Name, Param, Photo};
    use time::macros::date;

    fn person(uid: &str, given: &str, family: &str) -> Contact {
        let mut contact = Contact::new(uid);
        contact.name = Name::new(given, family);
        contact.formatted_name = format!("{given} {family}");
        contact
    }

    fn roster_row(given: &str, family: &str) -> Contact {
        let mut contact = person(&new_identity(), given, family);
        contact.birthday = Some(date!(1990 - 02 - 01));
        contact.phones.push(Phone::mobile("+491701234567"));
        contact.email = Some(Email::internet("new@example.org"));
        contact.organization = vec!["AkaBlas e.V.".into(), "Trompete".into()];
        contact
    }

    #[test]
    fn test_match_key_normalizes() {
        assert_eq!(
            match_key(&person("a", "Jane", "Doe")),
            match_key(&person("b", "  jane ", "  DOE  "))
        );
        assert_eq!(match_key(&Contact::new("x")), None);
    }

    #[test]
    fn test_normalized_names_fuse_into_one_contact() {
        let existing: ContactSet = vec![person("srv-1", "Jane", "Doe")].into_iter().collect();
        let mut incoming = person("", "  jane ", "  doe ");
        incoming.name.given = "  jane   ".into();
        incoming.name.family = " doe ".into();
        incoming.formatted_name = String::new();

        let outcome = merge(existing, vec![incoming]);
        assert_eq!(outcome.contacts.len(), 1);
        assert!(outcome.created.is_empty());
        assert!(outcome.contacts.contains("srv-1"));
    }

    #[test]
    fn test_merge_keeps_existing_photo_and_curated_fields() {
        let mut curated = person("srv-1", "Jane", "Doe");
        curated.photo = Some(Photo {
            media_type: "image/jpeg".into(),
            data: vec![1, 2, 3],
        });
        curated.note = Some("manual note".into());
        curated.phones.push(Phone {
            group: Some("item1".into()),
            number: "0170 000".into(),
            params: vec![Param::new("TYPE", vec!["CELL".into(), "PREF".into()])],
        });
        curated.email = Some(Email {
            group: None,
            address: "old@example.org".into(),
            params: vec![Param::single("TYPE", "HOME")],
        });
        let existing: ContactSet = vec![curated].into_iter().collect();

        let outcome = merge(existing, vec![roster_row("Jane", "Doe")]);
        let merged = outcome.contacts.get("srv-1").unwrap();

        assert_eq!(merged.photo.as_ref().unwrap().data, vec![1, 2, 3]);
        assert_eq!(merged.note.as_deref(), Some("manual note"));
        assert_eq!(merged.phones.len(), 1);
        assert_eq!(merged.phones[0].number, "+491701234567");
        assert_eq!(merged.phones[0].group.as_deref(), Some("item1"));
        let email = merged.email.as_ref().unwrap();
        assert_eq!(email.address, "new@example.org");
        assert_eq!(email.params, vec![Param::single("TYPE", "HOME")]);
        assert_eq!(merged.birthday, Some(date!(1990 - 02 - 01)));
        assert_eq!(outcome.updated, vec!["srv-1"]);
    }

    #[test]
    fn test_unmatched_records_become_new_contacts() {
        let existing: ContactSet = vec![person("srv-1", "Jane", "Doe")].into_iter().collect();
        let row = roster_row("Max", "Mustermann");
        let row_uid = row.uid.clone();

        let outcome = merge(existing, vec![row]);
        assert_eq!(outcome.contacts.len(), 2);
        assert_eq!(outcome.created, vec![row_uid.clone()]);
        assert!(outcome.updated.is_empty());
        assert_eq!(outcome.unchanged(), 1);
        assert!(outcome.contacts.contains(&row_uid));
    }

    #[test]
    fn test_duplicate_rows_fuse_into_one_new_contact() {
        let mut first = roster_row("Max", "Mustermann");
        first.email = None;
        let second = roster_row("max", "mustermann");
        let outcome = merge(ContactSet::new(), vec![first, second]);
        assert_eq!(outcome.contacts.len(), 1);
        assert_eq!(outcome.created.len(), 1);
        let contact = outcome.contacts.iter().next().unwrap();
        assert_eq!(contact.email.as_ref().unwrap().address, "new@example.org");
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut existing_contact = person("srv-1", "Jane", "Doe");
        existing_contact.address = Some(Address {
            street: "Altweg".into(),
            house_number: "1".into(),
            params: vec![Param::single("TYPE", "HOME")],
            ..Address::default()
        });
        let existing: ContactSet = vec![existing_contact, person("srv-2", "Erika", "Muster")]
            .into_iter()
            .collect();

        let mut jane = roster_row("Jane", "Doe");
        jane.address = Some(Address {
            street: "Neuweg".into(),
            house_number: "5".into(),
            city: "Braunschweig".into(),
            ..Address::default()
        });
        let incoming = vec![jane, roster_row("Max", "Mustermann")];

        let once = merge(existing.clone(), incoming.clone());
        let again = merge(existing, incoming.clone());
        assert_eq!(once.contacts, again.contacts);

        let twice = merge(once.contacts.clone(), incoming);
        assert_eq!(twice.contacts, once.contacts);
        assert!(twice.updated.is_empty());
        assert!(twice.created.is_empty());

        let address = once.contacts.get("srv-1").unwrap().address.clone().unwrap();
        assert_eq!(address.street, "Neuweg");
        assert_eq!(address.params, vec![Param::single("TYPE", "HOME")]);
    }

    #[test]
    fn test_nameless_record_is_merged_once() {
        let mut record = Contact::new("row-mail");
        record.email = Some(Email::internet("nobody@example.org"));
        assert_eq!(match_key(&record), None);

        let once = merge(ContactSet::new(), vec![record.clone()]);
        assert_eq!(once.created, vec!["row-mail"]);

        let twice = merge(once.contacts.clone(), vec![record]);
        assert_eq!(twice.contacts.len(), 1);
        assert_eq!(twice.contacts, once.contacts);
        assert!(twice.created.is_empty());
        assert!(twice.updated.is_empty());
    }

    #[test]
    fn test_existing_contacts_without_match_are_retained() {
        let existing: ContactSet = vec![person("srv-1", "Jane", "Doe"), Contact::new("srv-2")]
            .into_iter()
            .collect();
        let outcome = merge(existing.clone(), Vec::new());
        assert_eq!(outcome.contacts, existing);
        assert_eq!(outcome.unchanged(), 2);
    }
}
