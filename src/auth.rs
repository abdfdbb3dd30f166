use std::path::PathBuf;

use color_eyre::eyre::{WrapErr, eyre};
use russh::keys::PublicKey;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tokio::fs;

// One user record, read from `<auth directory>/<username>.yaml` at
// authentication time.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct UserRecord {
    pub(crate) password: Option<String>,
    pub(crate) authorized_keys: Vec<String>,
    pub(crate) allowed_bindings: Vec<String>,
}

pub(crate) struct UserStore {
    directory: PathBuf,
}

impl UserStore {
    pub(crate) fn new(directory: PathBuf) -> Self {
        UserStore { directory }
    }

    pub(crate) async fn load(&self, user: &str) -> color_eyre::Result<UserRecord> {
        // Usernames come from the network; never let them walk the tree.
        if user.is_empty() || user.contains(['/', '\\']) || user.contains("..") {
            return Err(eyre!("invalid username"));
        }
        let path = self.directory.join(format!("{user}.yaml"));
        let contents = fs::read_to_string(&path)
            .await
            .wrap_err_with(|| format!("no user record at {}", path.display()))?;
        serde_yaml::from_str(&contents)
            .wrap_err_with(|| format!("invalid user record at {}", path.display()))
    }
}

// Compares two byte strings in constant time. Unequal lengths still pay
// for a full comparison so length mismatches are not a timing oracle.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        let _ = a.ct_eq(a);
        return false;
    }
    a.ct_eq(b).into()
}

pub(crate) fn verify_password(record: &UserRecord, offered: &str) -> bool {
    match record.password.as_deref() {
        Some(expected) if !expected.is_empty() => {
            constant_time_eq(expected.as_bytes(), offered.as_bytes())
        }
        _ => {
            let _ = offered.as_bytes().ct_eq(offered.as_bytes());
            false
        }
    }
}

pub(crate) fn verify_public_key(record: &UserRecord, offered: &PublicKey) -> bool {
    let Ok(offered) = offered.to_bytes() else {
        return false;
    };
    record.authorized_keys.iter().any(|line| {
        PublicKey::from_openssh(line)
            .ok()
            .and_then(|key| key.to_bytes().ok())
            .is_some_and(|authorized| constant_time_eq(&authorized, &offered))
    })
}
