use super::{LocalMirror, MirrorError, MirrorKey};
use async_trait::async_trait;
use moka::future::Cache;
use slate_core::UserId;
use std::fmt;
use std::time::Duration;

/// In-process mirror backed by a moka cache with time-to-live
#[derive(Clone)]
pub struct MemoryMirror {
    documents: Cache<MirrorKey, String>,
}

impl MemoryMirror {
    /// Mirror whose documents are evicted after `ttl`
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            documents: Cache::builder().time_to_live(ttl).build(),
        }
    }

    fn keys_of(&self, user: &UserId) -> Vec<MirrorKey> {
        self.documents
            .iter()
            .filter(|(key, _)| &key.user == user)
            .map(|(key, _)| (*key).clone())
            .collect()
    }
}

impl fmt::Debug for MemoryMirror {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryMirror")
            .field("entries", &self.documents.entry_count())
            .finish()
    }
}

#[async_trait]
impl LocalMirror for MemoryMirror {
    async fn load_raw(&self, key: &MirrorKey) -> Result<Option<String>, MirrorError> {
        Ok(self.documents.get(key).await)
    }

    async fn save_raw(&self, key: &MirrorKey, document: String) -> Result<(), MirrorError> {
        self.documents.insert(key.clone(), document).await;
        Ok(())
    }

    async fn clear_user(&self, user: &UserId) -> Result<usize, MirrorError> {
        let keys = self.keys_of(user);
        for key in &keys {
            self.documents.invalidate(key).await;
        }
        Ok(keys.len())
    }

    async fn collections(&self, user: &UserId) -> Result<Vec<String>, MirrorError> {
        let mut names: Vec<String> = self
            .keys_of(user)
            .into_iter()
            .map(|key| key.collection)
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clear_user_leaves_other_users() {
        let mirror = MemoryMirror::new(Duration::from_secs(60));
        let a = MirrorKey::new(UserId::new("a"), "tasks");
        let b = MirrorKey::new(UserId::new("b"), "tasks");
        mirror.save_raw(&a, "a".into()).await.unwrap();
        mirror.save_raw(&b, "b".into()).await.unwrap();

        assert_eq!(mirror.clear_user(&UserId::new("a")).await.unwrap(), 1);
        assert!(mirror.load_raw(&a).await.unwrap().is_none());
        assert_eq!(mirror.load_raw(&b).await.unwrap().as_deref(), Some("b"));
    }
}
