//! Label keys and label-value helpers
//!
//! Deletion requests are correlated with their backup through labels, so
//! every value written here must be a valid Kubernetes label value.

use std::fmt::Write;

/// Label carrying the (possibly shortened) name of the targeted backup
pub const BACKUP_NAME_LABEL: &str = "velero.io/backup-name";

/// Label carrying the UID of the targeted backup
pub const BACKUP_UID_LABEL: &str = "velero.io/backup-uid";

/// Maximum length of a Kubernetes label value
pub const MAX_LABEL_VALUE_LEN: usize = 63;

/// Number of hex characters appended to a shortened label value
const LABEL_HASH_LEN: usize = 6;

/// Turn an arbitrary string into a valid, deterministic label value.
///
/// Values that already fit are returned unchanged. Longer values keep their
/// first 57 characters and gain the first 6 hex characters of the SHA-256
/// digest of the full value.
pub fn label_value(input: &str) -> String {
    if input.len() <= MAX_LABEL_VALUE_LEN {
        return input.to_string();
    }

    let digest = aws_lc_rs::digest::digest(&aws_lc_rs::digest::SHA256, input.as_bytes());
    let hex = digest.as_ref()[..LABEL_HASH_LEN / 2]
        .iter()
        .fold(String::with_capacity(LABEL_HASH_LEN), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        });

    let keep = MAX_LABEL_VALUE_LEN - LABEL_HASH_LEN;
    let mut cut = keep;
    while !input.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", &input[..cut], hex)
}

/// Selector matching every request that targets the named backup
pub fn backup_name_selector(backup_name: &str) -> String {
    format!("{}={}", BACKUP_NAME_LABEL, label_value(backup_name))
}

/// Selector matching requests by backup name and UID
pub fn backup_name_uid_selector(backup_name: &str, uid: &str) -> String {
    format!(
        "{}={},{}={}",
        BACKUP_NAME_LABEL,
        label_value(backup_name),
        BACKUP_UID_LABEL,
        label_value(uid)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_values_pass_through() {
        assert_eq!(label_value("backup-1"), "backup-1");
        let exact = "a".repeat(MAX_LABEL_VALUE_LEN);
        assert_eq!(label_value(&exact), exact);
    }

    #[test]
    fn long_values_are_shortened_with_hash_suffix() {
        let long = "the-really-long-backup-name-that-is-much-more-than-63-characters";
        let shortened = label_value(long);
        assert_eq!(
            shortened,
            "the-really-long-backup-name-that-is-much-more-than-63-cha6ca4bc"
        );
        assert_eq!(shortened.len(), MAX_LABEL_VALUE_LEN);
    }

    #[test]
    fn shortening_is_deterministic_and_distinguishes_inputs() {
        let a = format!("{}-a", "x".repeat(70));
        let b = format!("{}-b", "x".repeat(70));
        assert_eq!(label_value(&a), label_value(&a));
        assert_ne!(label_value(&a), label_value(&b));
    }

    #[test]
    fn selectors_use_shortened_values() {
        assert_eq!(
            backup_name_selector("foo"),
            "velero.io/backup-name=foo"
        );
        assert_eq!(
            backup_name_uid_selector("foo", "uid-1"),
            "velero.io/backup-name=foo,velero.io/backup-uid=uid-1"
        );

        let long = "the-really-long-backup-name-that-is-much-more-than-63-characters";
        assert!(backup_name_selector(long).ends_with("cha6ca4bc"));
    }
}
