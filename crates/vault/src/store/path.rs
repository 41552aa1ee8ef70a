//! Secret path validation, record ids and one-level key listing.

use std::{collections::BTreeSet, sync::LazyLock};

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::error::VaultError;

static SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("path segment pattern is valid"));

/// Check a secret path relative to its SDB, e.g. `db/creds`.
///
/// # Errors
///
/// Returns [`VaultError::InvalidRequest`] for empty paths, leading or
/// trailing slashes, empty or dot segments and characters outside
/// `[A-Za-z0-9._-]`.
pub fn validate_path(path: &str) -> Result<(), VaultError> {
    if path.is_empty() {
        return Err(VaultError::InvalidRequest("path must not be empty".into()));
    }
    for segment in path.split('/') {
        if segment == "." || segment == ".." || !SEGMENT.is_match(segment) {
            return Err(VaultError::InvalidRequest(format!("invalid path: {path}")));
        }
    }
    Ok(())
}

/// Normalize a listing prefix: empty stays empty, anything else must be a
/// valid path and gets a trailing `/`.
pub fn folder_prefix(path: &str) -> Result<String, VaultError> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    validate_path(trimmed)?;
    Ok(format!("{trimmed}/"))
}

/// Deterministic numeric record id for `path`.
///
/// Only a storage key; collisions are tolerated because records are always
/// addressed by `(sdb_id, path)`.
pub fn secure_data_id(path: &str) -> u64 {
    let digest = Sha256::digest(path.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// Immediate children of `prefix` among `paths`. Folders end with `/`.
pub fn child_keys<'a>(prefix: &str, paths: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
    paths
        .into_iter()
        .filter_map(|p| p.strip_prefix(prefix))
        .filter(|rest| !rest.is_empty())
        .map(|rest| match rest.find('/') {
            Some(idx) => rest[..=idx].to_owned(),
            None => rest.to_owned(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_paths() {
        for ok in ["db", "db/creds", "app-1/prod_v2/api.key"] {
            assert!(validate_path(ok).is_ok(), "{ok}");
        }
    }

    #[test]
    fn rejects_bad_paths() {
        for bad in ["", "/db", "db/", "db//creds", "db/../x", "./db", "db creds", "db/€"] {
            assert!(validate_path(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn folder_prefix_normalizes() {
        assert_eq!(folder_prefix("").unwrap(), "");
        assert_eq!(folder_prefix("db").unwrap(), "db/");
        assert_eq!(folder_prefix("db/").unwrap(), "db/");
        assert!(folder_prefix("../db").is_err());
    }

    #[test]
    fn ids_are_deterministic() {
        assert_eq!(secure_data_id("db/creds"), secure_data_id("db/creds"));
        assert_ne!(secure_data_id("db/creds"), secure_data_id("db/cred"));
    }

    #[test]
    fn children_are_one_level() {
        let paths = ["db/creds", "db/replica/creds", "db/replica/admin", "api/key", "db2"];
        let root = child_keys("", paths);
        assert_eq!(
            root,
            BTreeSet::from(["api/".to_owned(), "db/".to_owned(), "db2".to_owned()])
        );
        let db = child_keys("db/", paths);
        assert_eq!(db, BTreeSet::from(["creds".to_owned(), "replica/".to_owned()]));
    }
}
