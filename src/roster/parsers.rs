//! Field parsers for roster rows.
//!
//! The heuristics are lossy by nature. Each multi-step parser tries a strict
//! pattern first, then a best-effort split, and finally keeps the whole input
//! in one field; rows that reach the last tier are logged.

use std::sync::LazyLock;

use regex::Regex;
use time::{Date, Month};
use tracing::warn;

use crate::contact::{new_identity, Address, Contact, Email, Name, Phone};

pub const COLUMN_COUNT: usize = 12;

static LEADING_WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\w) (\w)").expect("valid pattern"));
static TRAILING_WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\w) ([^\W\d])\b").expect("valid pattern"));
static NICKNAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^)]+)\(").expect("valid pattern"));
static GIVEN_IN_PARENS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(([^)]+)\)").expect("valid pattern"));
static BRUNSWICK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bBS\b").expect("valid pattern"));
static STREET_FIRST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<street>[^,\d]*[^,\d ]) +(?P<number>\d[^,]*?) *(?:, *(?P<additional>.+))?$")
        .expect("valid pattern")
});
static NUMBER_FIRST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<number>\d[^, ]*) +(?P<street>[^,\d]*[^,\d ]) *(?:, *(?P<additional>.+))?$")
        .expect("valid pattern")
});

const INSTRUMENTS: &[(&str, &str)] = &[
    ("flö", "Flöte"),
    ("kla", "Klarinette"),
    ("obe", "Oboe"),
    ("hlz", "Holz"),
    ("sax", "Saxophon"),
    ("asx", "Altsaxophon"),
    ("tsx", "Tenorsaxophon"),
    ("fag", "Fagott"),
    ("trp", "Trompete"),
    ("flü", "Flügelhorn"),
    ("Flügelhorn", "Flügelhorn"),
    ("flügelhorn", "Flügelhorn"),
    ("teh", "Tenorhorn"),
    ("hrn", "Horn"),
    ("pos", "Posaune"),
    ("tub", "Tuba"),
    ("tpd", "Topfdeckel"),
    ("git", "Gitarre"),
    ("bss", "E-Bass"),
];

/// Per-club values that end up in generated fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterSettings {
    pub organization: String,
    pub club_name: String,
    pub area_code: String,
}

impl Default for RosterSettings {
    fn default() -> Self {
        Self {
            organization: "AkaBlas e.V.".to_string(),
            club_name: "AkaBlas".to_string(),
            area_code: "0531".to_string(),
        }
    }
}

/// One roster line, columns in export order. Empty strings are missing
/// values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterRow {
    pub family_name: String,
    pub given_name: String,
    pub nickname: String,
    pub date_of_birth: String,
    pub street: String,
    pub zip_code: String,
    pub city_state: String,
    pub landline: String,
    pub mobile: String,
    pub email: String,
    pub instrument: String,
    pub joined: String,
}

impl RosterRow {
    /// Build a row from CSV fields. Missing trailing columns count as empty.
    pub fn from_fields(fields: &[String]) -> Self {
        let field = |index: usize| {
            fields
                .get(index)
                .map(|f| f.trim().to_string())
                .unwrap_or_default()
        };
        Self {
            family_name: field(0),
            given_name: field(1),
            nickname: field(2),
            date_of_birth: field(3),
            street: field(4),
            zip_code: field(5),
            city_state: field(6),
            landline: field(7),
            mobile: field(8),
            email: field(9),
            instrument: field(10),
            joined: field(11),
        }
    }
}

/// Split street, house number and additional line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreetParts {
    pub street: String,
    pub house_number: String,
    pub additional: String,
}

pub fn remove_whitespaces(input: &str) -> String {
    let glued = LEADING_WHITESPACE.replace_all(input, "${1}${2}");
    TRAILING_WHITESPACE
        .replace_all(&glued, "${1}${2}")
        .into_owned()
}

/// Returns `(given, family, nickname)`.
pub fn extract_names(input: &str) -> (String, String, Option<String>) {
    let input = input.trim();
    let nickname = NICKNAME
        .captures(input)
        .map(|caps| caps[1].trim().to_string())
        .filter(|nick| !nick.is_empty());

    if let Some(caps) = GIVEN_IN_PARENS.captures(input) {
        let given = caps[1].trim().to_string();
        let family = input.rsplit(')').next().unwrap_or_default().trim().to_string();
        return (given, family, nickname);
    }

    let names: Vec<&str> = input.split_whitespace().collect();
    if names.len() >= 2 {
        let (given, family) = if names.iter().all(|name| is_upper(name)) {
            let split = names.len() - 1;
            (names[..split].join(" "), names[split].to_string())
        } else {
            // The family name starts right before the first lowercase word.
            let mut idx = names.len() as isize - 1;
            if let Some(pos) = names.iter().position(|name| is_lower(name)) {
                idx = pos as isize - 1;
            }
            let split = if idx < 0 {
                (names.len() as isize + idx) as usize
            } else {
                idx as usize
            };
            (names[..split].join(" "), names[split..].join(" "))
        };
        if !given.is_empty() {
            return (given, family, nickname);
        }
    }

    warn!(name = %input, "could not split name; using it as family name");
    (String::new(), input.to_string(), nickname)
}

fn is_upper(word: &str) -> bool {
    word.chars().any(char::is_alphabetic) && !word.chars().any(char::is_lowercase)
}

fn is_lower(word: &str) -> bool {
    word.chars().any(char::is_alphabetic) && !word.chars().any(char::is_uppercase)
}

fn month_from_name(name: &str) -> Option<Month> {
    let name = name.trim().trim_end_matches('.').to_lowercase();
    let month = match name.as_str() {
        "jan" | "januar" | "january" | "jän" | "jänner" => Month::January,
        "feb" | "februar" | "february" => Month::February,
        "mar" | "mär" | "mrz" | "märz" | "march" => Month::March,
        "apr" | "april" => Month::April,
        "mai" | "may" => Month::May,
        "jun" | "juni" | "june" => Month::June,
        "jul" | "juli" | "july" => Month::July,
        "aug" | "august" => Month::August,
        "sep" | "sept" | "september" => Month::September,
        "okt" | "oct" | "oktober" | "october" => Month::October,
        "nov" | "november" => Month::November,
        "dez" | "dec" | "dezember" | "december" => Month::December,
        _ => return None,
    };
    Some(month)
}

/// Two-digit years land in the current century; any year after
/// `current_year` is moved back by 100 years.
fn correct_century(year: i32, two_digit: bool, current_year: i32) -> i32 {
    let year = if two_digit { 2000 + year } else { year };
    if year > current_year {
        year - 100
    } else {
        year
    }
}

fn parse_year_token(token: &str, current_year: i32) -> Option<i32> {
    let token = token.trim();
    if !token.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let value: i32 = token.parse().ok()?;
    match token.len() {
        2 => Some(correct_century(value, true, current_year)),
        4 => Some(correct_century(value, false, current_year)),
        _ => None,
    }
}

/// Parse `d.m.yyyy`, `d.m.yy`, `yyyy-mm-dd` and `d. Month yyyy`.
pub fn string_to_date(input: &str, current_year: i32) -> Option<Date> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    let build = |year: i32, month: Month, day: &str| -> Option<Date> {
        let day: u8 = day.trim().trim_end_matches('.').parse().ok()?;
        Date::from_calendar_date(year, month, day).ok()
    };

    if let Some((year, rest)) = input.split_once('-') {
        let mut parts = rest.splitn(2, '-');
        let (month, day) = (parts.next()?, parts.next()?);
        if year.len() != 4 {
            return None;
        }
        let year = parse_year_token(year, current_year)?;
        let month = Month::try_from(month.trim().parse::<u8>().ok()?).ok()?;
        return build(year, month, day);
    }

    let numeric: Vec<&str> = input.split('.').map(str::trim).collect();
    let all_digits = numeric
        .iter()
        .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    if numeric.len() == 3 && all_digits {
        let year = parse_year_token(numeric[2], current_year)?;
        let month = Month::try_from(numeric[1].parse::<u8>().ok()?).ok()?;
        return build(year, month, numeric[0]);
    }

    let words: Vec<&str> = input.split_whitespace().collect();
    if words.len() == 3 {
        let month = month_from_name(words[1])?;
        let year = parse_year_token(words[2], current_year)?;
        return build(year, month, words[0]);
    }

    None
}

/// Year from a plain year (`1998`, `98`) or from a full date.
pub fn parse_year(input: &str, current_year: i32) -> Option<i32> {
    let input = input.trim();
    let input = input.strip_suffix(".0").unwrap_or(input);
    parse_year_token(input, current_year)
        .or_else(|| string_to_date(input, current_year).map(|date| date.year()))
}

/// Local numbers (first digit not `0`) get the area code prefix.
pub fn phone_number(input: &str, area_code: &str) -> Option<String> {
    let input = input.trim();
    let first = input.chars().next()?;
    if first.is_ascii_digit() && first != '0' {
        Some(format!("{area_code}/{input}"))
    } else {
        Some(input.to_string())
    }
}

pub fn expand_brunswick(input: &str) -> String {
    BRUNSWICK
        .replace_all(&remove_whitespaces(input), "Braunschweig")
        .into_owned()
}

/// `City, State` split on the first comma.
pub fn split_city_state(input: &str) -> (String, String) {
    match input.split_once(',') {
        Some((city, state)) => (city.trim().to_string(), state.trim().to_string()),
        None => (input.trim().to_string(), String::new()),
    }
}

pub fn parse_street(input: &str) -> StreetParts {
    let input = input.trim();
    if input.is_empty() {
        return StreetParts::default();
    }

    for pattern in [&*STREET_FIRST, &*NUMBER_FIRST] {
        if let Some(caps) = pattern.captures(input) {
            let group = |name: &str| {
                caps.name(name)
                    .map(|m| m.as_str().trim().to_string())
                    .unwrap_or_default()
            };
            return StreetParts {
                street: group("street"),
                house_number: group("number"),
                additional: group("additional"),
            };
        }
    }

    if let Some((street, additional)) = input.split_once(',') {
        return StreetParts {
            street: street.trim().to_string(),
            house_number: String::new(),
            additional: additional.trim().to_string(),
        };
    }

    warn!(street = %input, "could not split street line; keeping it whole");
    StreetParts {
        street: input.to_string(),
        ..StreetParts::default()
    }
}

pub fn string_to_instrument(input: &str) -> String {
    INSTRUMENTS
        .iter()
        .find(|(abbreviation, _)| *abbreviation == input)
        .map(|(_, full)| full.to_string())
        .unwrap_or_else(|| input.to_string())
}

fn build_note(club: &str, joined: Option<i32>, instrument: &str) -> Option<String> {
    match (joined, instrument.is_empty()) {
        (Some(year), false) => Some(format!("Bei {club} seit {year}. Spielt {instrument}.")),
        (Some(year), true) => Some(format!("Bei {club} seit {year}")),
        (None, false) => Some(format!("Spielt {instrument} bei {club}.")),
        (None, true) => None,
    }
}

/// Turn one roster row into a contact with a fresh identity.
pub fn parse_record(row: &RosterRow, settings: &RosterSettings, current_year: i32) -> Contact {
    let mut family = remove_whitespaces(&row.family_name);
    let mut given = remove_whitespaces(&row.given_name);
    let mut nickname = remove_whitespaces(&row.nickname);

    if given.is_empty() && !family.is_empty() {
        let (extracted_given, extracted_family, extracted_nick) = extract_names(&family);
        given = extracted_given;
        family = extracted_family;
        if nickname.is_empty() {
            nickname = extracted_nick.unwrap_or_default();
        }
    }

    let birthday = if row.date_of_birth.is_empty() {
        None
    } else {
        let parsed = string_to_date(&row.date_of_birth, current_year);
        if parsed.is_none() {
            warn!(value = %row.date_of_birth, name = %family, "unparseable date of birth dropped");
        }
        parsed
    };

    let instrument = string_to_instrument(&remove_whitespaces(&row.instrument));
    let joined = if row.joined.is_empty() {
        None
    } else {
        parse_year(&remove_whitespaces(&row.joined), current_year)
    };

    let (city, state) = split_city_state(&expand_brunswick(&row.city_state));
    let street = parse_street(&remove_whitespaces(&row.street));
    let zip = row.zip_code.trim();
    let zip = zip.strip_suffix(".0").unwrap_or(zip).to_string();

    let mut contact = Contact::new(new_identity());
    contact.formatted_name = if nickname.is_empty() {
        format!("{given} {family}")
    } else {
        format!("{given} ({nickname}) {family}")
    }
    .trim()
    .to_string();
    contact.name = Name::new(given, family);
    contact.nickname = (!nickname.is_empty()).then_some(nickname);
    contact.birthday = birthday;

    contact.organization = vec![settings.organization.clone()];
    if !instrument.is_empty() {
        contact.organization.push(instrument.clone());
    }
    contact.note = build_note(&settings.club_name, joined, &instrument);

    let address = Address {
        street: street.street,
        house_number: street.house_number,
        additional: street.additional,
        zip,
        city,
        state,
        ..Address::default()
    };
    if !address.is_empty() {
        contact.address = Some(address);
    }

    if let Some(mobile) = phone_number(&remove_whitespaces(&row.mobile), &settings.area_code) {
        contact.phones.push(Phone::mobile(mobile));
    }
    if let Some(landline) = phone_number(&row.landline, &settings.area_code) {
        contact.phones.push(Phone::landline(landline));
    }
    if !row.email.trim().is_empty() {
        contact.email = Some(Email::internet(row.email.trim()));
    }

    contact
}
