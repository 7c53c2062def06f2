//! Profile photo enrichment.
//!
//! Photos are looked up by normalized phone number in one or more
//! [`PhotoSource`]s. Contacts that already carry a photo are never touched.

pub mod directory;
pub mod har;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use image::imageops::FilterType;
use image::{GenericImageView, ImageFormat};
use indicatif::ProgressBar;
use rlibphonenumber::{PhoneNumberFormat, PHONE_NUMBER_UTIL};
use tracing::{debug, info, warn};

use crate::contact::{Contact, Photo};

pub use self::directory::PhotoDirectory;
pub use self::har::HarArchive;

const MAX_PHOTO_DIMENSION: u32 = 256;

/// A place that may know a profile photo for a phone number.
#[async_trait]
pub trait PhotoSource: Send + Sync {
    /// Short label for logs.
    fn name(&self) -> &str;

    /// `phone` is in E.164 form (`+491701234567`).
    async fn find_photo(&self, phone: &str) -> Result<Option<Vec<u8>>>;
}

/// E.164 form of `raw`, or a separator-stripped fallback when the number
/// cannot be parsed.
pub fn normalize_phone(raw: &str, region: &str) -> Option<String> {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix("tel:")
        .or_else(|| trimmed.strip_prefix("TEL:"))
        .unwrap_or(trimmed);
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(parsed) = PHONE_NUMBER_UTIL.parse(trimmed, region) {
        return Some(
            PHONE_NUMBER_UTIL
                .format(&parsed, PhoneNumberFormat::E164)
                .into_owned(),
        );
    }

    let stripped: String = trimmed
        .chars()
        .filter(|c| !matches!(c, ' ' | '/' | '-' | '(' | ')' | '.'))
        .collect();
    if stripped.is_empty() {
        return None;
    }
    match stripped.strip_prefix("00") {
        Some(rest) => Some(format!("+{rest}")),
        None => Some(stripped),
    }
}

/// Digits of a phone number, without `+` or separators.
pub(crate) fn phone_digits(phone: &str) -> String {
    phone.chars().filter(char::is_ascii_digit).collect()
}

fn media_type_for(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Png => "image/png",
        ImageFormat::Gif => "image/gif",
        ImageFormat::WebP => "image/webp",
        _ => "image/jpeg",
    }
}

/// Downscale to at most 256x256 and re-encode as JPEG. Data the image crate
/// cannot decode is kept as is, labelled by its magic bytes.
pub fn prepare_photo(data: Vec<u8>) -> Result<Photo> {
    let image = match image::load_from_memory(&data) {
        Ok(image) => image,
        Err(err) => {
            let media_type = image::guess_format(&data)
                .map(media_type_for)
                .unwrap_or("image/jpeg");
            debug!(error = %err, media_type, "keeping photo undecoded");
            return Ok(Photo {
                media_type: media_type.to_string(),
                data,
            });
        }
    };

    let (width, height) = image.dimensions();
    let image = if width > MAX_PHOTO_DIMENSION || height > MAX_PHOTO_DIMENSION {
        image.resize(MAX_PHOTO_DIMENSION, MAX_PHOTO_DIMENSION, FilterType::Lanczos3)
    } else {
        image
    };

    let mut jpeg_data = Vec::new();
    {
        let mut cursor = std::io::Cursor::new(&mut jpeg_data);
        image
            .to_rgb8()
            .write_to(&mut cursor, ImageFormat::Jpeg)
            .context("failed to encode photo as JPEG")?;
    }

    Ok(Photo {
        media_type: "image/jpeg".to_string(),
        data: jpeg_data,
    })
}

/// Ask every source for each phone number of the contact, first hit wins.
async fn lookup(sources: &[Box<dyn PhotoSource>], phones: &[String]) -> Option<Vec<u8>> {
    for phone in phones {
        for source in sources {
            match source.find_photo(phone).await {
                Ok(Some(data)) => {
                    debug!(source = source.name(), phone = %phone, "photo found");
                    return Some(data);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(
                        source = source.name(),
                        phone = %phone,
                        error = %err,
                        "photo lookup failed"
                    );
                }
            }
        }
    }
    None
}

/// Attach photos to contacts that have none. Returns the number of contacts
/// that received one.
pub async fn enrich<F>(
    contacts: &mut [Contact],
    sources: &[Box<dyn PhotoSource>],
    region: &str,
    limit: usize,
    skip: F,
    progress: &ProgressBar,
) -> usize
where
    F: Fn(&Contact) -> bool,
{
    if sources.is_empty() {
        return 0;
    }

    let candidates: Vec<(usize, Vec<String>)> = contacts
        .iter()
        .enumerate()
        .filter(|(_, contact)| contact.photo.is_none() && !skip(contact))
        .map(|(index, contact)| {
            let phones = contact
                .phones
                .iter()
                .filter_map(|phone| normalize_phone(&phone.number, region))
                .collect::<Vec<_>>();
            (index, phones)
        })
        .filter(|(_, phones)| !phones.is_empty())
        .collect();

    progress.set_length(candidates.len() as u64);

    let found: Vec<(usize, Option<Vec<u8>>)> = stream::iter(candidates)
        .map(|(index, phones)| async move {
            let data = lookup(sources, &phones).await;
            progress.inc(1);
            (index, data)
        })
        .buffer_unordered(limit.max(1))
        .collect()
        .await;

    let mut enriched = 0;
    for (index, data) in found {
        let Some(data) = data else { continue };
        let Some(contact) = contacts.get_mut(index) else {
            continue;
        };
        match prepare_photo(data) {
            Ok(photo) => {
                contact.photo = Some(photo);
                enriched += 1;
            }
            Err(err) => {
                warn!(identity = %contact.uid, error = %err, "discarding unusable photo");
            }
        }
    }

    info!(enriched, "photo enrichment finished");
    enriched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::Phone;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct FakeSource {
        photos: HashMap<String, Vec<u8>>,
    }

    #[async_trait]
    impl PhotoSource for FakeSource {
        fn name(&self) -> &str {
            "fake"
        }

        async fn find_photo(&self, phone: &str) -> Result<Option<Vec<u8>>> {
            Ok(self.photos.get(phone).cloned())
        }
    }

    struct BrokenSource;

    #[async_trait]
    impl PhotoSource for BrokenSource {
        fn name(&self) -> &str {
            "broken"
        }

        async fn find_photo(&self, _phone: &str) -> Result<Option<Vec<u8>>> {
            anyhow::bail!("unavailable")
        }
    }

    #[derive(Default)]
    struct Gauge {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    /// Answers every lookup after a delay, recording overlap.
    struct SlowSource(Arc<Gauge>);

    #[async_trait]
    impl PhotoSource for SlowSource {
        fn name(&self) -> &str {
            "slow"
        }

        async fn find_photo(&self, _phone: &str) -> Result<Option<Vec<u8>>> {
            let now = self.0.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.0.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = image::RgbImage::new(width, height);
        let mut data = Vec::new();
        image
            .write_to(&mut std::io::Cursor::new(&mut data), ImageFormat::Png)
            .unwrap();
        data
    }

    fn member(uid: &str, mobile: &str) -> Contact {
        let mut contact = Contact::new(uid);
        contact.phones.push(Phone::mobile(mobile));
        contact
    }

    #[test]
    fn test_normalize_phone() {
        assert_eq!(
            normalize_phone("0170 1234567", "DE").as_deref(),
            Some("+491701234567")
        );
        assert_eq!(
            normalize_phone("0049 170 1234567", "DE").as_deref(),
            Some("+491701234567")
        );
        assert_eq!(
            normalize_phone("+49 (170) 123-4567", "DE").as_deref(),
            Some("+491701234567")
        );
        assert_eq!(normalize_phone("   ", "DE"), None);
    }

    #[test]
    fn test_prepare_photo_downscales_to_jpeg() {
        let photo = prepare_photo(png_bytes(600, 300)).unwrap();
        assert_eq!(photo.media_type, "image/jpeg");
        let decoded = image::load_from_memory(&photo.data).unwrap();
        assert_eq!(decoded.dimensions(), (256, 128));
    }

    #[test]
    fn test_prepare_photo_keeps_undecodable_data() {
        let gif_header = b"GIF89a\x01\x00\x01\x00".to_vec();
        let photo = prepare_photo(gif_header.clone()).unwrap();
        assert_eq!(photo.media_type, "image/gif");
        assert_eq!(photo.data, gif_header);
    }

    #[tokio::test]
    async fn test_enrich_attaches_first_hit_and_respects_skip() {
        let mut photos = HashMap::new();
        photos.insert("+491701234567".to_string(), png_bytes(10, 10));
        photos.insert("+491709999999".to_string(), png_bytes(10, 10));
        let fake = FakeSource { photos };
        let sources: Vec<Box<dyn PhotoSource>> = vec![Box::new(BrokenSource), Box::new(fake)];

        let mut already = member("c", "0170 1234567");
        already.photo = Some(Photo {
            media_type: "image/png".into(),
            data: vec![9],
        });
        let mut contacts = vec![
            member("a", "0170 1234567"),
            member("b", "0170 9999999"),
            already,
            member("d", "0170 5555555"),
        ];

        let enriched = enrich(
            &mut contacts,
            &sources,
            "DE",
            2,
            |contact| contact.uid == "b",
            &ProgressBar::hidden(),
        )
        .await;

        assert_eq!(enriched, 1);
        assert_eq!(contacts[0].photo.as_ref().unwrap().media_type, "image/jpeg");
        assert!(contacts[1].photo.is_none());
        assert_eq!(contacts[2].photo.as_ref().unwrap().data, vec![9]);
        assert!(contacts[3].photo.is_none());
    }

    #[tokio::test]
    async fn test_enrich_stays_within_download_limit() {
        let gauge = Arc::new(Gauge::default());
        let sources: Vec<Box<dyn PhotoSource>> = vec![Box::new(SlowSource(gauge.clone()))];
        let mut contacts: Vec<Contact> = (0..10)
            .map(|i| member(&format!("m{i}"), &format!("0170 123456{i}")))
            .collect();
        let progress = ProgressBar::hidden();

        let enriched = enrich(&mut contacts, &sources, "DE", 3, |_| false, &progress).await;

        assert_eq!(enriched, 0);
        assert_eq!(progress.position(), 10);
        let peak = gauge.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak in-flight lookups was {peak}");
        assert!(peak > 1, "lookups never overlapped");
    }
}
