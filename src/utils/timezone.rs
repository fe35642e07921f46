use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;

/// Parse an IANA timezone name such as `Asia/Bangkok`
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.trim()
        .parse::<Tz>()
        .map_err(|e| anyhow!("unknown timezone '{}': {}", name, e))
}

/// Get current time in the store's timezone
pub fn store_now(tz: Tz) -> DateTime<Tz> {
    Utc::now().with_timezone(&tz)
}

/// Compact local timestamp used in document codes
pub fn document_stamp(tz: Tz) -> String {
    store_now(tz).format("%Y%m%d%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Offset;

    #[test]
    fn test_bangkok_timezone() {
        let tz = parse_timezone("Asia/Bangkok").unwrap();
        let bangkok_time = store_now(tz);

        // Bangkok should be 7 hours ahead of UTC
        let diff = bangkok_time.offset().fix().local_minus_utc();
        assert_eq!(diff, 7 * 3600);
    }

    #[test]
    fn test_unknown_timezone() {
        assert!(parse_timezone("Mars/Olympus_Mons").is_err());
    }

    #[test]
    fn test_document_stamp_format() {
        let stamp = document_stamp(chrono_tz::Tz::UTC);
        assert_eq!(stamp.len(), 14);
        assert!(stamp.chars().all(|c| c.is_ascii_digit()));
    }
}
