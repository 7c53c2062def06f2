//! vCard codec: turns server payloads and staged files into [`Contact`]s and
//! back.
//!
//! Both 3.0 (what most CardDAV servers store) and 4.0 cards are accepted.
//! Properties the model does not interpret are carried through verbatim as
//! [`RawProperty`] values, so an encode after a decode only rewrites the
//! fields this crate actually touches.

use std::sync::LazyLock;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use regex::Regex;
use thiserror::Error;
use time::{Date, Month};
use tracing::warn;

use crate::contact::{
    Address, Contact, Email, Name, Param, Phone, Photo, RawProperty, VcardVersion,
};

const BEGIN_VCARD: &str = "BEGIN:VCARD";
const END_VCARD: &str = "END:VCARD";
const FOLD_WIDTH: usize = 75;

static STREET_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.*\S) (\d\S*)$").expect("valid street pattern"));

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("payload is not valid UTF-8: {0}")]
    NotUtf8(#[from] std::str::Utf8Error),
    #[error("no BEGIN:VCARD block found")]
    NoCard,
    #[error("vCard is missing END:VCARD")]
    Unterminated,
    #[error("line {line}: malformed property `{content}`")]
    MalformedLine { line: usize, content: String },
    #[error("unsupported vCard version `{0}`")]
    UnsupportedVersion(String),
    #[error("invalid quoted-printable data: {0}")]
    QuotedPrintable(String),
    #[error("invalid inline photo: {0}")]
    Photo(String),
    #[error("contact has no UID")]
    MissingUid,
}

/// Decode the first vCard found in `bytes`.
pub fn decode(bytes: &[u8]) -> Result<Contact, FormatError> {
    let text = std::str::from_utf8(bytes)?;
    let text = text.trim_start_matches('\u{feff}');

    let mut cards = split_cards(text)?;
    if cards.is_empty() {
        return Err(FormatError::NoCard);
    }
    if cards.len() > 1 {
        warn!(cards = cards.len(), "payload contained several vCards; using the first");
    }
    let card = cards.swap_remove(0);
    decode_card(&card)
}

/// Encode a contact as a single vCard with CRLF line endings.
pub fn encode(contact: &Contact) -> Vec<u8> {
    let mut lines: Vec<String> = Vec::new();
    lines.push(BEGIN_VCARD.to_string());
    lines.push(format!("VERSION:{}", contact.version.as_str()));

    if !contact.uid.is_empty() {
        lines.push(format!("UID:{}", escape_text(&contact.uid)));
    }

    let formatted_name = if contact.formatted_name.trim().is_empty() {
        contact.name.display()
    } else {
        contact.formatted_name.clone()
    };
    lines.push(format!("FN:{}", escape_text(&formatted_name)));

    let name = &contact.name;
    lines.push(format!(
        "N:{}",
        join_structured(&[
            &name.family,
            &name.given,
            &name.additional,
            &name.prefix,
            &name.suffix,
        ])
    ));

    if let Some(nickname) = &contact.nickname {
        lines.push(format!("NICKNAME:{}", escape_text(nickname)));
    }

    if let Some(birthday) = contact.birthday {
        lines.push(format!("BDAY:{}", format_date(birthday, contact.version)));
    }

    if !contact.organization.is_empty() {
        let parts: Vec<&String> = contact.organization.iter().collect();
        lines.push(format!("ORG:{}", join_structured(&parts)));
    }

    if let Some(note) = &contact.note {
        lines.push(format!("NOTE:{}", escape_text(note)));
    }

    if let Some(address) = &contact.address {
        let street_line = address.street_line();
        lines.push(format_property_line(
            None,
            "ADR",
            &address.params,
            &join_structured(&[
                &address.po_box,
                &address.additional,
                &street_line,
                &address.city,
                &address.state,
                &address.zip,
                &address.country,
            ]),
        ));
    }

    for phone in &contact.phones {
        lines.push(format_property_line(
            phone.group.as_deref(),
            "TEL",
            &phone.params,
            &escape_text(&phone.number),
        ));
    }

    if let Some(email) = &contact.email {
        lines.push(format_property_line(
            email.group.as_deref(),
            "EMAIL",
            &email.params,
            &escape_text(&email.address),
        ));
    }

    for raw in &contact.extra {
        let mut line = String::new();
        if let Some(group) = &raw.group {
            line.push_str(group);
            line.push('.');
        }
        line.push_str(&raw.name);
        if !raw.params.is_empty() {
            line.push(';');
            line.push_str(&raw.params);
        }
        line.push(':');
        line.push_str(&raw.value);
        lines.push(line);
    }

    if let Some(photo) = &contact.photo {
        lines.push(format_photo(photo, contact.version));
    }

    lines.push(END_VCARD.to_string());

    let mut output = String::new();
    for line in lines {
        output.push_str(&fold_line(&line));
    }
    output.into_bytes()
}

fn split_cards(content: &str) -> Result<Vec<Vec<String>>, FormatError> {
    let mut cards: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut inside = false;
    let mut depth = 0usize;

    for raw_line in content.lines() {
        let line = raw_line.trim_end_matches('\r');
        if line.eq_ignore_ascii_case(BEGIN_VCARD) {
            if inside {
                // Nested cards (e.g. AGENT) stay part of the outer card.
                depth += 1;
                current.push(line.to_string());
                continue;
            }
            inside = true;
        }

        if inside {
            current.push(line.to_string());
            if line.eq_ignore_ascii_case(END_VCARD) {
                if depth > 0 {
                    depth -= 1;
                    continue;
                }
                cards.push(std::mem::take(&mut current));
                inside = false;
            }
        }
    }

    if inside {
        return Err(FormatError::Unterminated);
    }

    Ok(cards)
}

fn unfold_lines(lines: &[String]) -> Vec<String> {
    let mut unfolded: Vec<String> = Vec::new();
    for line in lines {
        let mut handled = false;
        if let Some(last) = unfolded.last_mut() {
            if line.starts_with(' ') || line.starts_with('\t') {
                if last.ends_with('=') && has_quoted_printable_encoding(last) {
                    last.pop();
                }
                last.push_str(&line[1..]);
                handled = true;
            } else if last.ends_with('=') && has_quoted_printable_encoding(last) {
                last.pop();
                last.push_str(line);
                handled = true;
            }
        }

        if !handled {
            unfolded.push(line.clone());
        }
    }
    unfolded
}

fn has_quoted_printable_encoding(line: &str) -> bool {
    let Some((prefix, _)) = line.split_once(':') else {
        return false;
    };
    prefix.split(';').skip(1).any(|part| {
        let trimmed = part.trim();
        match trimmed.split_once('=') {
            Some((name, value)) => {
                name.trim().eq_ignore_ascii_case("ENCODING")
                    && value.trim().eq_ignore_ascii_case("QUOTED-PRINTABLE")
            }
            None => trimmed.eq_ignore_ascii_case("QUOTED-PRINTABLE"),
        }
    })
}

/// One unfolded content line, split into its parts.
struct ContentLine {
    group: Option<String>,
    name: String,
    raw_params: String,
    params: Vec<Param>,
    value: String,
}

impl ContentLine {
    fn upper_name(&self) -> String {
        self.name.to_ascii_uppercase()
    }

    fn param_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.params
            .iter()
            .filter(move |param| param.name.eq_ignore_ascii_case(name))
            .flat_map(|param| param.values.iter().map(String::as_str))
    }

    fn has_param_value(&self, name: &str, wanted: &str) -> bool {
        self.param_values(name)
            .any(|value| value.eq_ignore_ascii_case(wanted))
    }

    fn is_quoted_printable(&self) -> bool {
        self.has_param_value("ENCODING", "QUOTED-PRINTABLE")
    }

    /// Parameters worth keeping on a typed field.
    fn retained_params(&self) -> Vec<Param> {
        self.params
            .iter()
            .filter(|param| {
                !param.name.eq_ignore_ascii_case("ENCODING")
                    && !param.name.eq_ignore_ascii_case("CHARSET")
            })
            .cloned()
            .collect()
    }

    fn into_raw(self) -> RawProperty {
        RawProperty {
            group: self.group,
            name: self.name,
            params: self.raw_params,
            value: self.value,
        }
    }
}

fn parse_content_line(line: &str, number: usize) -> Result<ContentLine, FormatError> {
    let malformed = || FormatError::MalformedLine {
        line: number,
        content: line.chars().take(60).collect(),
    };

    let colon = find_unquoted(line, ':').ok_or_else(malformed)?;
    let (lhs, value) = (&line[..colon], &line[colon + 1..]);

    let mut segments = split_unquoted(lhs, ';').into_iter();
    let property = segments.next().ok_or_else(malformed)?;
    let (group, name) = match property.split_once('.') {
        Some((group, name)) => (Some(group.to_string()), name),
        None => (None, property),
    };

    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(malformed());
    }

    let raw_params = match lhs.find(';') {
        Some(pos) if find_unquoted(lhs, ';') == Some(pos) => lhs[pos + 1..].to_string(),
        _ => String::new(),
    };

    let params = segments
        .filter(|segment| !segment.trim().is_empty())
        .map(|segment| match segment.split_once('=') {
            Some((param_name, values)) => Param::new(
                param_name.trim().to_ascii_uppercase(),
                split_unquoted(values, ',')
                    .into_iter()
                    .map(clean_quotes)
                    .collect(),
            ),
            // vCard 2.1 style bare parameters are type values.
            None => {
                let bare = segment.trim();
                if bare.eq_ignore_ascii_case("QUOTED-PRINTABLE")
                    || bare.eq_ignore_ascii_case("BASE64")
                {
                    Param::single("ENCODING", bare.to_ascii_uppercase())
                } else {
                    Param::single("TYPE", bare)
                }
            }
        })
        .collect();

    Ok(ContentLine {
        group,
        name: name.to_string(),
        raw_params,
        params,
        value: value.to_string(),
    })
}

fn decode_card(lines: &[String]) -> Result<Contact, FormatError> {
    let unfolded = unfold_lines(lines);
    let mut contact = Contact::default();
    let mut seen_fn = false;
    let mut seen_name = false;
    let mut depth = 0usize;

    for (index, line) in unfolded.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut content = parse_content_line(line, index + 1)?;
        let upper = content.upper_name();

        if upper == "BEGIN" {
            if index > 0 {
                depth += 1;
                contact.extra.push(content.into_raw());
            }
            continue;
        }
        if upper == "END" {
            if depth > 0 {
                depth -= 1;
                contact.extra.push(content.into_raw());
            }
            continue;
        }
        if depth > 0 {
            contact.extra.push(content.into_raw());
            continue;
        }

        if content.is_quoted_printable() {
            content.value = decode_quoted_printable(&content.value)?;
        }

        match upper.as_str() {
            "VERSION" => {
                contact.version = match content.value.trim() {
                    "4.0" => VcardVersion::V4,
                    "3.0" | "2.1" => VcardVersion::V3,
                    other => return Err(FormatError::UnsupportedVersion(other.to_string())),
                };
            }
            "UID" if contact.uid.is_empty() => {
                contact.uid = unescape_text(content.value.trim());
            }
            "FN" if !seen_fn => {
                contact.formatted_name = unescape_text(&content.value);
                seen_fn = true;
            }
            "N" if !seen_name => {
                let mut parts = split_structured(&content.value).into_iter();
                contact.name = Name {
                    family: parts.next().unwrap_or_default(),
                    given: parts.next().unwrap_or_default(),
                    additional: parts.next().unwrap_or_default(),
                    prefix: parts.next().unwrap_or_default(),
                    suffix: parts.next().unwrap_or_default(),
                };
                seen_name = true;
            }
            "NICKNAME" if contact.nickname.is_none() => {
                contact.nickname = Some(unescape_text(&content.value));
            }
            "BDAY" if contact.birthday.is_none() && content.params.is_empty() => {
                match parse_date(&content.value) {
                    Some(date) => contact.birthday = Some(date),
                    None => contact.extra.push(content.into_raw()),
                }
            }
            "ORG" if contact.organization.is_empty() => {
                contact.organization = split_structured(&content.value);
            }
            "NOTE" if contact.note.is_none() => {
                contact.note = Some(unescape_text(&content.value));
            }
            "ADR" if contact.address.is_none() => {
                contact.address = Some(parse_address(&content));
            }
            "TEL" => {
                contact.phones.push(Phone {
                    group: content.group.clone(),
                    number: unescape_text(content.value.trim()),
                    params: content.retained_params(),
                });
            }
            "EMAIL" if contact.email.is_none() => {
                contact.email = Some(Email {
                    group: content.group.clone(),
                    address: unescape_text(content.value.trim()),
                    params: content.retained_params(),
                });
            }
            "PHOTO" if contact.photo.is_none() => match parse_photo(&content)? {
                Some(photo) => contact.photo = Some(photo),
                None => contact.extra.push(content.into_raw()),
            },
            _ => contact.extra.push(content.into_raw()),
        }
    }

    Ok(contact)
}

fn parse_address(content: &ContentLine) -> Address {
    let mut parts = split_structured(&content.value).into_iter();
    let po_box = parts.next().unwrap_or_default();
    let additional = parts.next().unwrap_or_default();
    let street_line = parts.next().unwrap_or_default();
    let city = parts.next().unwrap_or_default();
    let state = parts.next().unwrap_or_default();
    let zip = parts.next().unwrap_or_default();
    let country = parts.next().unwrap_or_default();

    let (street, house_number) = match STREET_NUMBER.captures(&street_line) {
        Some(caps) => (caps[1].to_string(), caps[2].to_string()),
        None => (street_line, String::new()),
    };

    Address {
        po_box,
        street,
        house_number,
        additional,
        zip,
        city,
        state,
        country,
        params: content.retained_params(),
    }
}

fn parse_photo(content: &ContentLine) -> Result<Option<Photo>, FormatError> {
    let value = content.value.trim();

    if let Some(rest) = value.strip_prefix("data:") {
        let Some((header, payload)) = rest.split_once(',') else {
            return Err(FormatError::Photo("data URI without payload".to_string()));
        };
        let Some(media_type) = header.strip_suffix(";base64") else {
            return Ok(None);
        };
        let data = decode_base64(payload)?;
        let media_type = if media_type.is_empty() {
            "image/jpeg".to_string()
        } else {
            media_type.to_ascii_lowercase()
        };
        return Ok(Some(Photo { media_type, data }));
    }

    let inline = content.has_param_value("ENCODING", "B")
        || content.has_param_value("ENCODING", "BASE64");
    if !inline {
        return Ok(None);
    }

    let media_type = content
        .param_values("TYPE")
        .next()
        .map(media_type_from_type_param)
        .unwrap_or_else(|| "image/jpeg".to_string());
    let data = decode_base64(value)?;
    Ok(Some(Photo { media_type, data }))
}

fn decode_base64(payload: &str) -> Result<Vec<u8>, FormatError> {
    let cleaned: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(cleaned.as_bytes())
        .map_err(|err| FormatError::Photo(err.to_string()))
}

fn media_type_from_type_param(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.contains('/') {
        return trimmed.to_ascii_lowercase();
    }
    match trimmed.to_ascii_uppercase().as_str() {
        "JPEG" | "JPG" => "image/jpeg".to_string(),
        other => format!("image/{}", other.to_ascii_lowercase()),
    }
}

fn format_photo(photo: &Photo, version: VcardVersion) -> String {
    let encoded = STANDARD.encode(&photo.data);
    match version {
        VcardVersion::V3 => {
            let kind = photo
                .media_type
                .strip_prefix("image/")
                .unwrap_or(&photo.media_type)
                .to_ascii_uppercase();
            format!("PHOTO;ENCODING=b;TYPE={kind}:{encoded}")
        }
        VcardVersion::V4 => format!("PHOTO:data:{};base64,{encoded}", photo.media_type),
    }
}

/// Accepts `YYYY-MM-DD`, `YYYYMMDD` and date-times starting with either.
pub(crate) fn parse_date(value: &str) -> Option<Date> {
    let value = value.trim();
    let date_part = value.split('T').next().unwrap_or(value);
    let digits: String = date_part.chars().filter(|c| *c != '-').collect();
    if digits.len() != 8 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if date_part.contains('-') && date_part.len() != 10 {
        return None;
    }
    let year: i32 = digits[0..4].parse().ok()?;
    let month: u8 = digits[4..6].parse().ok()?;
    let day: u8 = digits[6..8].parse().ok()?;
    Date::from_calendar_date(year, Month::try_from(month).ok()?, day).ok()
}

fn format_date(date: Date, version: VcardVersion) -> String {
    let month = u8::from(date.month());
    match version {
        VcardVersion::V3 => format!("{:04}-{:02}-{:02}", date.year(), month, date.day()),
        VcardVersion::V4 => format!("{:04}{:02}{:02}", date.year(), month, date.day()),
    }
}

fn format_property_line(group: Option<&str>, name: &str, params: &[Param], value: &str) -> String {
    let mut buffer = String::new();
    if let Some(group) = group {
        buffer.push_str(group);
        buffer.push('.');
    }
    buffer.push_str(name);
    for param in params {
        buffer.push(';');
        buffer.push_str(&param.name);
        if !param.values.is_empty() {
            buffer.push('=');
            let values: Vec<String> = param
                .values
                .iter()
                .map(|value| format_param_value(value))
                .collect();
            buffer.push_str(&values.join(","));
        }
    }
    buffer.push(':');
    buffer.push_str(value);
    buffer
}

fn format_param_value(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.contains(',') || trimmed.contains(';') || trimmed.contains(':') {
        format!("\"{}\"", trimmed.replace('"', "'"))
    } else {
        trimmed.to_string()
    }
}

fn clean_quotes(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.starts_with('"') && trimmed.ends_with('"') && trimmed.len() >= 2 {
        trimmed[1..trimmed.len() - 1].to_string()
    } else {
        trimmed.to_string()
    }
}

fn find_unquoted(input: &str, needle: char) -> Option<usize> {
    let mut quoted = false;
    for (index, c) in input.char_indices() {
        if c == '"' {
            quoted = !quoted;
        } else if c == needle && !quoted {
            return Some(index);
        }
    }
    None
}

fn split_unquoted(input: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quoted = false;
    let mut start = 0;
    for (index, c) in input.char_indices() {
        if c == '"' {
            quoted = !quoted;
        } else if c == separator && !quoted {
            parts.push(&input[start..index]);
            start = index + c.len_utf8();
        }
    }
    parts.push(&input[start..]);
    parts
}

/// Split a structured value (`N`, `ADR`, `ORG`) on unescaped semicolons and
/// unescape each component.
fn split_structured(value: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ';' => parts.push(unescape_text(&std::mem::take(&mut current))),
            _ => current.push(c),
        }
    }
    parts.push(unescape_text(&current));
    parts
}

fn join_structured<S: AsRef<str>>(parts: &[S]) -> String {
    parts
        .iter()
        .map(|part| escape_text(part.as_ref()))
        .collect::<Vec<_>>()
        .join(";")
}

pub(crate) fn escape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => {}
            ',' => out.push_str("\\,"),
            ';' => out.push_str("\\;"),
            _ => out.push(c),
        }
    }
    out
}

pub(crate) fn unescape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(other @ ('\\' | ',' | ';' | ':')) => out.push(other),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Fold a content line at 75 octets without splitting a UTF-8 sequence.
fn fold_line(line: &str) -> String {
    let mut out = String::with_capacity(line.len() + line.len() / FOLD_WIDTH * 3 + 2);
    let mut width = 0usize;
    let mut limit = FOLD_WIDTH;
    for c in line.chars() {
        let len = c.len_utf8();
        if width + len > limit {
            out.push_str("\r\n ");
            width = 0;
            limit = FOLD_WIDTH - 1;
        }
        out.push(c);
        width += len;
    }
    out.push_str("\r\n");
    out
}

fn decode_quoted_printable(input: &str) -> Result<String, FormatError> {
    let bytes_in = input.as_bytes();
    let mut bytes: Vec<u8> = Vec::with_capacity(bytes_in.len());
    let mut i = 0usize;

    while i < bytes_in.len() {
        match bytes_in[i] {
            b'=' => {
                if i + 1 >= bytes_in.len() {
                    // Trailing soft line break
                    break;
                }
                if i + 2 >= bytes_in.len() {
                    return Err(FormatError::QuotedPrintable(
                        "truncated escape".to_string(),
                    ));
                }
                let high = (bytes_in[i + 1] as char).to_digit(16);
                let low = (bytes_in[i + 2] as char).to_digit(16);
                match (high, low) {
                    (Some(high), Some(low)) => bytes.push(((high << 4) | low) as u8),
                    _ => {
                        return Err(FormatError::QuotedPrintable(format!(
                            "invalid escape at offset {i}"
                        )))
                    }
                }
                i += 3;
            }
            byte => {
                bytes.push(byte);
                i += 1;
            }
        }
    }

    String::from_utf8(bytes).map_err(|err| FormatError::QuotedPrintable(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    fn full_contact() -> Contact {
        Contact {
            uid: "0b7f3c1e-5d2a-4a8e-9a51-5f0f6d2c1a77".into(),
            version: VcardVersion::V3,
            formatted_name: "Jane (JD) Doe".into(),
            name: Name {
                family: "Doe".into(),
                given: "Jane".into(),
                additional: "Mary".into(),
                prefix: "Dr.".into(),
                suffix: "Jr.".into(),
            },
            nickname: Some("JD".into()),
            birthday: Some(date!(1990 - 02 - 01)),
            organization: vec!["AkaBlas e.V.".into(), "Trompete".into()],
            note: Some("Bei AkaBlas seit 2010.\nSpielt Trompete; gern, laut.".into()),
            address: Some(Address {
                po_box: "PO 7".into(),
                street: "Musterstraße".into(),
                house_number: "12a".into(),
                additional: "Hinterhaus".into(),
                zip: "38106".into(),
                city: "Braunschweig".into(),
                state: "Niedersachsen".into(),
                country: "Deutschland".into(),
                params: vec![Param::single("TYPE", "HOME")],
            }),
            phones: vec![Phone::mobile("0170 1234567"), Phone::landline("0531/123456")],
            email: Some(Email::internet("jane@example.org")),
            photo: Some(Photo {
                media_type: "image/png".into(),
                data: vec![0x89, 0x50, 0x4e, 0x47, 0, 1, 2, 3, 250, 251],
            }),
            extra: vec![RawProperty {
                group: Some("item1".into()),
                name: "X-ABLabel".into(),
                params: String::new(),
                value: "Orchester".into(),
            }],
        }
    }

    #[test]
    fn test_round_trip_with_every_field() {
        let contact = full_contact();
        let decoded = decode(&encode(&contact)).expect("decodes");
        assert_eq!(decoded, contact);
    }

    #[test]
    fn test_round_trip_version_four() {
        let mut contact = full_contact();
        contact.version = VcardVersion::V4;
        let encoded = encode(&contact);
        let text = String::from_utf8(encoded.clone()).unwrap();
        assert!(text.contains("BDAY:19900201"));
        assert!(text.contains("PHOTO:data:image/png;base64,"));
        assert_eq!(decode(&encoded).unwrap(), contact);
    }

    #[test]
    fn test_decode_nextcloud_card() {
        let card = "BEGIN:VCARD\r\n\
VERSION:3.0\r\n\
PRODID:-//Sabre//Sabre VObject 4.4.2//EN\r\n\
UID:abc-123\r\n\
FN:Max Mustermann\r\n\
N:Mustermann;Max;;;\r\n\
TEL;TYPE=CELL:+49 170 1234567\r\n\
TEL;TYPE=WORK,VOICE:0531 999\r\n\
EMAIL;TYPE=INTERNET:max@example.org\r\n\
EMAIL;TYPE=WORK:max@work.example\r\n\
ADR;TYPE=HOME:;;Hauptstraße 5;Braunschweig;;38100;\r\n\
PHOTO;ENCODING=b;TYPE=JPEG:/9j/4AAQ\r\n\
 SkZJRg==\r\n\
REV:2023-01-01T00:00:00Z\r\n\
END:VCARD\r\n";

        let contact = decode(card.as_bytes()).unwrap();
        assert_eq!(contact.uid, "abc-123");
        assert_eq!(contact.version, VcardVersion::V3);
        assert_eq!(contact.name, Name::new("Max", "Mustermann"));
        assert_eq!(contact.phones.len(), 2);
        assert!(contact.phones[0].is_mobile());
        assert!(!contact.phones[1].is_mobile());
        assert_eq!(contact.email.as_ref().unwrap().address, "max@example.org");
        let address = contact.address.as_ref().unwrap();
        assert_eq!(address.street, "Hauptstraße");
        assert_eq!(address.house_number, "5");
        assert_eq!(address.zip, "38100");
        let photo = contact.photo.as_ref().unwrap();
        assert_eq!(photo.media_type, "image/jpeg");
        assert_eq!(&photo.data[..3], &[0xff, 0xd8, 0xff]);

        let extra_names: Vec<&str> = contact.extra.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(extra_names, vec!["PRODID", "EMAIL", "REV"]);
    }

    #[test]
    fn test_unknown_properties_survive_reencode() {
        let card = "BEGIN:VCARD\r\nVERSION:3.0\r\nUID:u1\r\nFN:A B\r\nN:B;A;;;\r\n\
CATEGORIES:Orchester,Vorstand\r\nX-CUSTOM;X-PARAM=\"a:b\":keep\\, me\r\nEND:VCARD\r\n";
        let contact = decode(card.as_bytes()).unwrap();
        let text = String::from_utf8(encode(&contact)).unwrap();
        assert!(text.contains("CATEGORIES:Orchester,Vorstand\r\n"));
        assert!(text.contains("X-CUSTOM;X-PARAM=\"a:b\":keep\\, me\r\n"));
        assert_eq!(decode(text.as_bytes()).unwrap(), contact);
    }

    #[test]
    fn test_long_lines_are_folded() {
        let mut contact = Contact::new("u1");
        contact.note = Some("ä".repeat(100));
        let text = String::from_utf8(encode(&contact)).unwrap();
        for line in text.split("\r\n") {
            assert!(line.len() <= FOLD_WIDTH, "line too long: {}", line.len());
        }
        assert_eq!(decode(text.as_bytes()).unwrap().note, contact.note);
    }

    #[test]
    fn test_fn_derived_from_name_when_empty() {
        let mut contact = Contact::new("u1");
        contact.name = Name::new("Jane", "Doe");
        let decoded = decode(&encode(&contact)).unwrap();
        assert_eq!(decoded.formatted_name, "Jane Doe");
    }

    #[test]
    fn test_quoted_printable_values_are_decoded() {
        let card = "BEGIN:VCARD\r\nVERSION:2.1\r\n\
                    N;ENCODING=QUOTED-PRINTABLE;CHARSET=UTF-8:M=C3=BCller;J=\r\nens;;;\r\n\
                    END:VCARD\r\n";
        let contact = decode(card.as_bytes()).unwrap();
        assert_eq!(contact.name.family, "Müller");
        assert_eq!(contact.name.given, "Jens");
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(matches!(decode(b"hello"), Err(FormatError::NoCard)));
        assert!(matches!(
            decode(b"BEGIN:VCARD\r\nFN:x\r\n"),
            Err(FormatError::Unterminated)
        ));
        assert!(matches!(
            decode(b"BEGIN:VCARD\r\nthis line has no colon\r\nEND:VCARD\r\n"),
            Err(FormatError::MalformedLine { line: 2, .. })
        ));
        assert!(matches!(
            decode(&[0xff, 0xfe, 0x00]),
            Err(FormatError::NotUtf8(_))
        ));
        assert!(matches!(
            decode(b"BEGIN:VCARD\r\nVERSION:9.9\r\nEND:VCARD\r\n"),
            Err(FormatError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_unparseable_birthday_is_kept_verbatim() {
        let card = "BEGIN:VCARD\r\nVERSION:3.0\r\nUID:u1\r\nBDAY:--0201\r\nEND:VCARD\r\n";
        let contact = decode(card.as_bytes()).unwrap();
        assert!(contact.birthday.is_none());
        assert_eq!(contact.extra[0].name, "BDAY");
        assert_eq!(contact.extra[0].value, "--0201");
    }

    #[test]
    fn test_escape_round_trip() {
        let value = "a,b;c\\d\ne";
        assert_eq!(unescape_text(&escape_text(value)), value);
        assert_eq!(escape_text(value), "a\\,b\\;c\\\\d\\ne");
    }

    #[test]
    fn test_parse_date_variants() {
        assert_eq!(parse_date("1990-02-01"), Some(date!(1990 - 02 - 01)));
        assert_eq!(parse_date("19900201"), Some(date!(1990 - 02 - 01)));
        assert_eq!(parse_date("1990-02-01T00:00:00Z"), Some(date!(1990 - 02 - 01)));
        assert_eq!(parse_date("1990-02-30"), None);
        assert_eq!(parse_date("--0201"), None);
    }
}
