//! Identifier generation for pipeline runs and knowledge entries.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use kbingest_shared::string_hash32;
use uuid::Uuid;

/// Characters of the encoded URL kept in entry ids.
const URL_FRAGMENT_LEN: usize = 12;

fn random8() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// `proc_<ms>_<rand8>_<hash32>`; the hash lets log lines be grouped by URL.
pub fn operation_id(url: &str) -> String {
    format!(
        "proc_{}_{}_{:x}",
        Utc::now().timestamp_millis(),
        random8(),
        string_hash32(url)
    )
}

/// `entry_<ms>_<rand8>_<url fragment>`.
pub fn entry_id(url: &str) -> String {
    let encoded = URL_SAFE_NO_PAD.encode(url.as_bytes());
    let fragment: String = encoded.chars().take(URL_FRAGMENT_LEN).collect();
    format!(
        "entry_{}_{}_{}",
        Utc::now().timestamp_millis(),
        random8(),
        fragment
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_ids_are_unique_and_shaped() {
        let a = operation_id("https://a.com/");
        let b = operation_id("https://a.com/");
        assert_ne!(a, b);

        let parts: Vec<&str> = a.split('_').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "proc");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 8);
        assert_eq!(parts[3], format!("{:x}", string_hash32("https://a.com/")));
    }

    #[test]
    fn entry_ids_embed_url_fragment() {
        let id = entry_id("https://a.com/docs");
        assert!(id.starts_with("entry_"));
        let expected: String = URL_SAFE_NO_PAD
            .encode("https://a.com/docs")
            .chars()
            .take(12)
            .collect();
        assert!(id.ends_with(&expected));
    }
}
