//! Auth Profile Discovery
//!
//! Scans the configured auth-profile directory and derives one
//! `AuthProfile` per `*.json` file found there. Filenames ignored:
//! anything starting with `auth_state_` (transient).
//!
//! The filename → email derivation is a single consolidated rule:
//! split the filename stem on `_`,
//! locate the literal marker token `at`, join the tokens before it with
//! `.` as the local part, join the non-numeric tokens after it with `.`
//! as the domain, and format as `local@domain`. Names that don't match
//! are logged and skipped, not guessed.

use std::fs;
use std::path::Path;
use std::time::SystemTime;

use crate::error::GatewayError;
use crate::types::AuthProfile;

/// Derive an email address from an auth-profile filename stem.
///
/// Example: `john_doe_at_gmail_com_1234.json` → `john.doe@gmail.com`.
/// Returns `None` if the stem contains no `at` marker token.
pub fn extract_email_from_filename(stem: &str) -> Option<String> {
    let tokens: Vec<&str> = stem.split('_').collect();
    let at_index = tokens.iter().position(|t| *t == "at")?;
    if at_index == 0 || at_index == tokens.len() - 1 {
        return None;
    }

    let local = tokens[..at_index].join(".");
    let domain_tokens: Vec<&str> = tokens[at_index + 1..]
        .iter()
        .filter(|t| !t.chars().all(|c| c.is_ascii_digit()))
        .copied()
        .collect();
    if local.is_empty() || domain_tokens.is_empty() {
        return None;
    }

    Some(format!("{}@{}", local, domain_tokens.join(".")))
}

fn is_valid_filename(name: &str) -> bool {
    !name.starts_with("auth_state_")
        && name.ends_with(".json")
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '.' || c == '-' || c == '_')
}

/// Scan `dir` for auth profile files. Returns `ConfigError` if the
/// directory cannot be read; a missing optional directory should be
/// checked by the caller before calling this (returns an empty list is
/// not attempted when the directory itself is absent/unreadable).
pub fn discover_profiles(dir: &Path) -> Result<Vec<AuthProfile>, GatewayError> {
    let entries = fs::read_dir(dir)
        .map_err(|e| GatewayError::Config(format!("cannot read auth profiles dir {}: {e}", dir.display())))?;

    let mut profiles = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !is_valid_filename(name) {
            continue;
        }
        let stem = name.trim_end_matches(".json");
        let email = extract_email_from_filename(stem);
        if email.is_none() {
            tracing::warn!(file = %name, "auth profile filename did not match the email pattern, skipping email derivation");
        }
        let last_updated = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);

        profiles.push(AuthProfile {
            id: stem.to_string(),
            email,
            file_path: path,
            last_updated,
            valid: true,
        });
    }

    profiles.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(profiles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    #[test]
    fn extracts_simple_email() {
        assert_eq!(
            extract_email_from_filename("john_doe_at_gmail_com"),
            Some("john.doe@gmail.com".to_string())
        );
    }

    #[test]
    fn drops_trailing_numeric_tokens() {
        assert_eq!(
            extract_email_from_filename("jane_at_example_com_1699999999"),
            Some("jane@example.com".to_string())
        );
    }

    #[test]
    fn returns_none_without_marker() {
        assert_eq!(extract_email_from_filename("no_marker_here"), None);
    }

    #[test]
    fn returns_none_when_marker_is_boundary_token() {
        assert_eq!(extract_email_from_filename("at_gmail_com"), None);
        assert_eq!(extract_email_from_filename("john_doe_at"), None);
    }

    #[test]
    fn ignores_transient_auth_state_files() {
        assert!(!is_valid_filename("auth_state_20240101.json"));
        assert!(is_valid_filename("john_at_example_com.json"));
    }

    #[test]
    fn discover_profiles_scans_directory_and_sorts() {
        let dir = std::env::temp_dir().join(format!("gateway-profile-test-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();

        File::create(dir.join("zed_at_example_com.json"))
            .unwrap()
            .write_all(b"{}")
            .unwrap();
        File::create(dir.join("abe_at_example_com.json"))
            .unwrap()
            .write_all(b"{}")
            .unwrap();
        File::create(dir.join("auth_state_stale.json"))
            .unwrap()
            .write_all(b"{}")
            .unwrap();
        File::create(dir.join("notes.txt")).unwrap().write_all(b"x").unwrap();

        let profiles = discover_profiles(&dir).unwrap();
        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[0].id, "abe_at_example_com");
        assert_eq!(profiles[0].email.as_deref(), Some("abe@example.com"));
        assert_eq!(profiles[1].id, "zed_at_example_com");

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn discover_profiles_errors_on_unreadable_dir() {
        let dir = std::env::temp_dir().join(format!("gateway-profile-missing-{}", uuid::Uuid::new_v4()));
        let result = discover_profiles(&dir);
        assert!(result.is_err());
    }
}
