//! Disk persistence: one JSON file per auth entry, 0600, in the auth dir.
//! Entries flagged `runtime_only` never touch the disk.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::entry::Auth;

#[derive(Debug, Clone)]
pub struct AuthStore {
    dir: PathBuf,
}

impl AuthStore {
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `{provider}-{label-or-id}.json`, with path-hostile characters mapped
    /// to underscores.
    pub fn file_name_for(auth: &Auth) -> String {
        let tag = if auth.label.is_empty() {
            auth.id.as_str()
        } else {
            auth.label.as_str()
        };
        let sanitized: String = tag
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}-{}.json", auth.provider, sanitized)
    }

    pub fn save(&self, auth: &Auth) -> io::Result<()> {
        if auth.is_runtime_only() {
            debug!(auth_id = %auth.id, "runtime-only auth, skipping persistence");
            return Ok(());
        }
        let file_name = if auth.file_name.is_empty() {
            Self::file_name_for(auth)
        } else {
            auth.file_name.clone()
        };
        let path = self.dir.join(&file_name);
        let payload = serde_json::to_vec_pretty(auth)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        fs::write(&path, payload)?;
        restrict_permissions(&path)?;
        debug!(auth_id = %auth.id, path = %path.display(), "auth persisted");
        Ok(())
    }

    pub fn delete(&self, file_name: &str) -> io::Result<()> {
        if file_name.is_empty() {
            return Ok(());
        }
        let path = self.dir.join(file_name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Load every parseable auth file. Corrupt files are logged and skipped;
    /// one bad file must not take the directory down.
    pub fn load_all(&self) -> io::Result<Vec<Auth>> {
        let mut auths = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().to_string();
            match fs::read(&path) {
                Ok(bytes) => match serde_json::from_slice::<Auth>(&bytes) {
                    Ok(mut auth) => {
                        auth.file_name = file_name;
                        auths.push(auth);
                    }
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "skipping unparseable auth file");
                    }
                },
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable auth file");
                }
            }
        }
        auths.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(auths)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str, provider: &str, label: &str) -> Auth {
        let mut auth = Auth::new(id, provider);
        auth.label = label.to_string();
        auth.metadata.access_token = Some("tok".to_string());
        auth
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = AuthStore::new(dir.path()).unwrap();

        let auth = sample("c1", "claude", "work account");
        store.save(&auth).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "c1");
        assert_eq!(loaded[0].file_name, "claude-work_account.json");
        assert_eq!(loaded[0].metadata.access_token.as_deref(), Some("tok"));
    }

    #[cfg(unix)]
    #[test]
    fn saved_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = AuthStore::new(dir.path()).unwrap();
        let auth = sample("c1", "claude", "a");
        store.save(&auth).unwrap();

        let path = dir.path().join("claude-a.json");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn runtime_only_entries_are_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = AuthStore::new(dir.path()).unwrap();
        let mut auth = sample("t1", "vertex", "svc");
        auth.attributes
            .insert("runtime_only".to_string(), "true".to_string());
        store.save(&auth).unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn corrupt_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = AuthStore::new(dir.path()).unwrap();
        std::fs::write(dir.path().join("broken.json"), b"{nope").unwrap();
        store.save(&sample("ok", "gemini", "g")).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "ok");
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = AuthStore::new(dir.path()).unwrap();
        store.delete("missing.json").unwrap();
    }
}
