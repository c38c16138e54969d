// Integration tests for the secure store over a SQLite file

use authguard::credentials::encryption;
use authguard::store::{Migration, SecretBackend, SecureCredentialStore, SqliteBackend};
use authguard::{Credential, StoreError};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tempfile::TempDir;

fn test_key() -> String {
    BASE64.encode([9u8; 32])
}

fn open_store(dir: &TempDir, key: &str) -> (SqliteBackend, SecureCredentialStore) {
    let backend = SqliteBackend::open(dir.path().join("secrets.db")).unwrap();
    let store = SecureCredentialStore::new(Arc::new(backend.clone()), key).unwrap();
    (backend, store)
}

#[tokio::test]
async fn test_values_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let credential = Credential::new(
        "access",
        Utc::now() + Duration::hours(1),
        Some("refresh".to_string()),
    );

    {
        let (_, store) = open_store(&dir, &test_key());
        store.save_credential(&credential, "session").await.unwrap();
        store.save(b"other", "api-key").await.unwrap();
    }

    let (backend, store) = open_store(&dir, &test_key());
    assert_eq!(
        store.load_credential("session").await.unwrap(),
        Some(credential)
    );
    assert_eq!(store.load("api-key").await.unwrap(), Some(b"other".to_vec()));
    assert_eq!(backend.keys().unwrap(), vec!["api-key", "session"]);
}

#[tokio::test]
async fn test_file_holds_only_ciphertext() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, store) = open_store(&dir, &test_key());

    store.save(b"super-secret-value", "k").await.unwrap();

    let raw = backend.read("k").await.unwrap().unwrap();
    assert!(encryption::is_sealed(&raw));
    assert!(!raw
        .windows(b"super-secret-value".len())
        .any(|w| w == b"super-secret-value"));
}

#[tokio::test]
async fn test_legacy_plaintext_migrated_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, store) = open_store(&dir, &test_key());
    backend.insert_raw("legacy", b"plain-old-token").unwrap();

    let loaded = store.load_detailed("legacy").await.unwrap().unwrap();
    assert_eq!(loaded.data, b"plain-old-token".to_vec());
    assert_eq!(loaded.migration, Migration::Migrated);

    let raw = backend.read("legacy").await.unwrap().unwrap();
    assert!(encryption::is_sealed(&raw));

    // Second load sees a sealed record
    let loaded = store.load_detailed("legacy").await.unwrap().unwrap();
    assert_eq!(loaded.migration, Migration::NotNeeded);
}

#[tokio::test]
async fn test_wrong_master_key_cannot_decode() {
    let dir = tempfile::tempdir().unwrap();
    {
        let (_, store) = open_store(&dir, &test_key());
        store.save(b"value", "k").await.unwrap();
    }

    let (_, store) = open_store(&dir, &BASE64.encode([1u8; 32]));
    assert!(matches!(
        store.load("k").await,
        Err(StoreError::DecodingFailed(_))
    ));
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, store) = open_store(&dir, &test_key());

    store.save(b"value", "k").await.unwrap();
    store.delete("k").await.unwrap();
    store.delete("k").await.unwrap();

    assert_eq!(store.load("k").await.unwrap(), None);
    assert!(backend.keys().unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_saves_last_write_wins() {
    let dir = tempfile::tempdir().unwrap();
    let (_, store) = open_store(&dir, &test_key());
    let store = Arc::new(store);

    let writers: Vec<_> = (0..8)
        .map(|i| {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.save(format!("v{}", i).as_bytes(), "k").await })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap().unwrap();
    }

    let value = String::from_utf8(store.load("k").await.unwrap().unwrap()).unwrap();
    assert!(value.starts_with('v'));
}
