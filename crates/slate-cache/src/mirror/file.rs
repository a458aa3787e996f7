use super::{LocalMirror, MirrorError, MirrorKey};
use async_trait::async_trait;
use slate_core::UserId;
use std::fmt::Write as _;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::trace;

/// Mirror stored as one JSON file per collection under `<root>/<user>/`
///
/// Writes go to a temporary file in the same directory and are renamed into
/// place, so a crash mid-write leaves the previous document intact.
#[derive(Debug, Clone)]
pub struct FileMirror {
    root: PathBuf,
}

impl FileMirror {
    /// Mirror rooted at `root`; directories are created on first write
    #[must_use]
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Root directory
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn user_dir(&self, user: &UserId) -> PathBuf {
        self.root.join(encode_segment(user.as_str()))
    }

    fn path_for(&self, key: &MirrorKey) -> PathBuf {
        self.user_dir(&key.user)
            .join(format!("{}.json", encode_segment(&key.collection)))
    }
}

/// Encode a path segment without collisions
///
/// ASCII alphanumerics and `-` pass through; every other byte becomes `_`
/// plus two hex digits. The empty string is a lone `_`, never a valid escape.
fn encode_segment(segment: &str) -> String {
    if segment.is_empty() {
        return "_".to_string();
    }
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "_{byte:02x}");
        }
    }
    out
}

/// Inverse of [`encode_segment`]; `None` for names it never produces
fn decode_segment(encoded: &str) -> Option<String> {
    if encoded == "_" {
        return Some(String::new());
    }
    let mut bytes = Vec::with_capacity(encoded.len());
    let mut rest = encoded.as_bytes();
    while let Some((&byte, tail)) = rest.split_first() {
        if byte == b'_' {
            let hex = std::str::from_utf8(tail.get(..2)?).ok()?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
            rest = &tail[2..];
        } else {
            bytes.push(byte);
            rest = tail;
        }
    }
    String::from_utf8(bytes).ok()
}

fn write_atomic(dir: &Path, path: &Path, document: &[u8]) -> Result<(), MirrorError> {
    std::fs::create_dir_all(dir).map_err(|e| MirrorError::io(dir, e))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| MirrorError::io(dir, e))?;
    tmp.write_all(document).map_err(|e| MirrorError::io(tmp.path(), e))?;
    tmp.as_file().sync_all().map_err(|e| MirrorError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| MirrorError::io(path, e.error))?;
    Ok(())
}

#[async_trait]
impl LocalMirror for FileMirror {
    async fn load_raw(&self, key: &MirrorKey) -> Result<Option<String>, MirrorError> {
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MirrorError::io(path, e)),
        }
    }

    async fn save_raw(&self, key: &MirrorKey, document: String) -> Result<(), MirrorError> {
        let dir = self.user_dir(&key.user);
        let path = self.path_for(key);
        trace!(path = %path.display(), bytes = document.len(), "writing mirror document");

        tokio::task::spawn_blocking(move || write_atomic(&dir, &path, document.as_bytes()))
            .await
            .map_err(|e| MirrorError::Unavailable(e.to_string()))?
    }

    async fn clear_user(&self, user: &UserId) -> Result<usize, MirrorError> {
        let collections = self.collections(user).await?;
        let dir = self.user_dir(user);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(collections.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(MirrorError::io(dir, e)),
        }
    }

    async fn collections(&self, user: &UserId) -> Result<Vec<String>, MirrorError> {
        let dir = self.user_dir(user);
        let mut reader = match tokio::fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(MirrorError::io(dir, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = reader.next_entry().await.map_err(|e| MirrorError::io(&dir, e))? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(name) = path.file_stem().and_then(|s| s.to_str()).and_then(decode_segment) {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_document_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = FileMirror::new(dir.path());
        let key = MirrorKey::new(UserId::new("u1"), "tasks");
        assert!(mirror.load_raw(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_replaces_and_clear_removes() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = FileMirror::new(dir.path());
        let user = UserId::new("u1");
        let key = MirrorKey::new(user.clone(), "tasks");

        mirror.save_raw(&key, "first".into()).await.unwrap();
        mirror.save_raw(&key, "second".into()).await.unwrap();
        assert_eq!(mirror.load_raw(&key).await.unwrap().as_deref(), Some("second"));
        assert_eq!(mirror.collections(&user).await.unwrap(), vec!["tasks".to_string()]);

        assert_eq!(mirror.clear_user(&user).await.unwrap(), 1);
        assert!(mirror.load_raw(&key).await.unwrap().is_none());
    }

    #[test]
    fn user_ids_cannot_escape_root() {
        let mirror = FileMirror::new("/srv/mirror");
        let key = MirrorKey::new(UserId::new("../etc"), "passwd");
        assert!(mirror.path_for(&key).starts_with("/srv/mirror"));
        assert_eq!(encode_segment("../etc"), "_2e_2e_2fetc");
    }

    #[test]
    fn segment_encoding_is_reversible() {
        for segment in ["tasks", "a.b", "a_b", "", "_", "ünïcode", "sub-0001"] {
            assert_eq!(decode_segment(&encode_segment(segment)).as_deref(), Some(segment));
        }
        assert_ne!(encode_segment("a.b"), encode_segment("a_b"));
        assert_eq!(decode_segment("_zz"), None);
    }

    #[tokio::test]
    async fn similar_user_ids_keep_separate_mirrors() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = FileMirror::new(dir.path());
        let dotted = UserId::new("a.b");
        let underscored = UserId::new("a_b");
        mirror
            .save_raw(&MirrorKey::new(dotted.clone(), "reward_usage"), "dotted".into())
            .await
            .unwrap();
        mirror
            .save_raw(&MirrorKey::new(underscored.clone(), "tasks"), "underscored".into())
            .await
            .unwrap();

        assert_eq!(mirror.collections(&dotted).await.unwrap(), vec!["reward_usage".to_string()]);
        assert_eq!(mirror.clear_user(&dotted).await.unwrap(), 1);

        let kept = mirror.load_raw(&MirrorKey::new(underscored, "tasks")).await.unwrap();
        assert_eq!(kept.as_deref(), Some("underscored"));
    }
}
