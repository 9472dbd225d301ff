use std::io::Cursor;

use chrono::{DateTime, NaiveDateTime, Utc};
use exif::{In, Reader, Tag};

/// The EXIF fields the library keeps.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExtractedExif {
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub taken_at: Option<DateTime<Utc>>,
}

/// Best-effort EXIF read; `None` when the file carries no EXIF block.
pub fn extract(bytes: &[u8]) -> Option<ExtractedExif> {
    let reader = match Reader::new().read_from_container(&mut Cursor::new(bytes)) {
        Ok(reader) => reader,
        Err(e) => {
            tracing::debug!("No EXIF data: {e}");
            return None;
        }
    };

    let text = |tag: Tag| {
        reader
            .get_field(tag, In::PRIMARY)
            .map(|f| clean_string(&f.display_value().to_string()))
            .filter(|s| !s.is_empty())
    };

    Some(ExtractedExif {
        camera_make: text(Tag::Make),
        camera_model: text(Tag::Model),
        taken_at: [Tag::DateTimeOriginal, Tag::DateTimeDigitized, Tag::DateTime]
            .into_iter()
            .filter_map(text)
            .find_map(|s| parse_datetime(&s)),
    })
}

/// Strip quotes, NUL padding and trailing array entries from an EXIF string.
fn clean_string(value: &str) -> String {
    value
        .replace('\0', "")
        .split(',')
        .next()
        .unwrap_or("")
        .trim()
        .trim_matches('"')
        .trim()
        .to_string()
}

/// EXIF timestamps carry no zone; they are stored as UTC.
fn parse_datetime(value: &str) -> Option<DateTime<Utc>> {
    ["%Y:%m:%d %H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .into_iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}
