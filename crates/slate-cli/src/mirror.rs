//! File mirror tooling

use slate_cache::{FileMirror, MirrorEntryInfo, MirrorError, MirrorStore};
use slate_core::UserId;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Mirror rooted at `dir`
#[must_use]
pub fn open(dir: &Path, ttl: Duration) -> MirrorStore {
    MirrorStore::new(Arc::new(FileMirror::new(dir)), ttl)
}

/// Stored collections of `user`
///
/// # Errors
/// The directory could not be read
pub async fn inspect(mirror: &MirrorStore, user: &UserId) -> Result<Vec<MirrorEntryInfo>, MirrorError> {
    mirror.inspect(user).await
}

/// Remove every collection of `user`; returns how many were removed
///
/// # Errors
/// A document could not be removed
pub async fn clear(mirror: &MirrorStore, user: &UserId) -> Result<usize, MirrorError> {
    mirror.clear_for_user(user).await
}

/// One line per collection
#[must_use]
pub fn render(user: &UserId, entries: &[MirrorEntryInfo]) -> String {
    let mut out = String::new();
    if entries.is_empty() {
        let _ = writeln!(out, "No mirrored collections for {user}");
        return out;
    }
    let _ = writeln!(out, "Mirrored collections for {user}:");
    for entry in entries {
        let saved = entry
            .saved_at
            .map_or_else(|| "unreadable".to_string(), |at| at.to_rfc3339());
        let _ = writeln!(
            out,
            "  {:<12} {:>8} bytes  saved {saved}{}",
            entry.collection,
            entry.bytes,
            if entry.expired { "  (expired)" } else { "" }
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn inspect_then_clear() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = open(dir.path(), Duration::from_secs(60));
        let user = UserId::new("sub");
        mirror.save(&user, "tasks", &vec!["a", "b"]).await;
        mirror.save(&user, "rules", &Vec::<String>::new()).await;

        let entries = inspect(&mirror, &user).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|entry| !entry.expired));
        let text = render(&user, &entries);
        assert!(text.contains("tasks"));

        assert_eq!(clear(&mirror, &user).await.unwrap(), 2);
        assert!(inspect(&mirror, &user).await.unwrap().is_empty());
    }

    #[test]
    fn render_empty_mirror() {
        let text = render(&UserId::new("sub"), &[]);
        assert_eq!(text, "No mirrored collections for sub\n");
    }
}
