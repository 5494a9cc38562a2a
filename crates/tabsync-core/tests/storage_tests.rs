//! Shared storage flavours and the token store on top of them.

use std::sync::Arc;

use tabsync_core::token_store::{AUTH_KEY, SESSION_KEY};
use tabsync_core::{
    FileStorage, MemoryStorage, SessionMetadata, SharedStorage, StorageChange, TokenStore,
};
use tabsync_protocol::AuthToken;

fn token() -> AuthToken {
    AuthToken {
        token: "a.b.c".into(),
        expires_at_ms: 1,
        refresh_token: Some("rt".into()),
        refresh_expires_at_ms: None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MemoryStorage
// ─────────────────────────────────────────────────────────────────────────────

mod memory {
    use super::*;

    #[tokio::test]
    async fn clones_share_items_and_change_events() {
        let storage = MemoryStorage::new();
        let sibling = storage.clone();
        let mut changes = sibling.subscribe();

        storage.set_item("k", "v1").unwrap();
        storage.set_item("k", "v1").unwrap();
        storage.remove_item("k").unwrap();
        storage.remove_item("k").unwrap();

        assert_eq!(
            changes.recv().await.unwrap(),
            StorageChange {
                key: "k".into(),
                old_value: None,
                new_value: Some("v1".into()),
            }
        );
        assert_eq!(
            changes.recv().await.unwrap(),
            StorageChange {
                key: "k".into(),
                old_value: Some("v1".into()),
                new_value: None,
            }
        );
        // Writes that change nothing produce no events
        assert!(changes.try_recv().is_err());
        assert!(sibling.is_empty());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FileStorage
// ─────────────────────────────────────────────────────────────────────────────

mod file {
    use super::*;

    #[test]
    fn items_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("storage.json");

        let storage = FileStorage::open(&path).unwrap();
        storage.set_item("tabsync.auth", r#"{"token":"x"}"#).unwrap();
        storage.set_item("other", "1").unwrap();
        storage.remove_item("other").unwrap();
        drop(storage);

        let reopened = FileStorage::open(&path).unwrap();
        assert_eq!(reopened.get_item("tabsync.auth").as_deref(), Some(r#"{"token":"x"}"#));
        assert!(reopened.get_item("other").is_none());
        assert_eq!(reopened.path(), path.as_path());
    }

    #[test]
    fn corrupt_file_opens_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        std::fs::write(&path, "{ not json").unwrap();

        let storage = FileStorage::open(&path).unwrap();

        assert!(storage.get_item("tabsync.auth").is_none());
        storage.set_item("k", "v").unwrap();
        assert_eq!(FileStorage::open(&path).unwrap().get_item("k").as_deref(), Some("v"));
    }

    #[test]
    fn default_path_lives_under_a_tabsync_directory() {
        let path = FileStorage::default_path();
        assert!(path.ends_with("tabsync/storage.json"));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TokenStore
// ─────────────────────────────────────────────────────────────────────────────

mod token_store {
    use super::*;

    #[test]
    fn pair_is_written_as_one_record() {
        let storage = MemoryStorage::new();
        let store = TokenStore::new(Arc::new(storage.clone()));

        store.write(&token()).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&storage.get_item(AUTH_KEY).unwrap()).unwrap();
        assert_eq!(raw, serde_json::json!({ "token": "a.b.c", "refreshToken": "rt" }));
        let stored = store.read().unwrap();
        assert_eq!(stored.refresh_token.as_deref(), Some("rt"));
        assert!(store.has_tokens());
    }

    #[test]
    fn clear_removes_tokens_and_session_metadata() {
        let storage = MemoryStorage::new();
        let store = TokenStore::new(Arc::new(storage.clone()));
        store.write(&token()).unwrap();
        store
            .write_session_metadata(&SessionMetadata {
                user_id: "user-1".into(),
                session_id: "s".into(),
                login_at_ms: 1,
            })
            .unwrap();
        assert_eq!(store.session_metadata().unwrap().user_id, "user-1");

        store.clear().unwrap();

        assert!(!store.has_tokens());
        assert!(store.session_metadata().is_none());
        assert!(storage.get_item(SESSION_KEY).is_none());
    }

    #[test]
    fn unreadable_record_reads_as_absent() {
        let storage = MemoryStorage::new();
        storage.set_item(AUTH_KEY, "[1,2,3]").unwrap();
        let store = TokenStore::new(Arc::new(storage));

        assert!(store.read().is_none());
        assert!(store.has_tokens());
    }
}
