use super::base_config;
use crate::backend::BackendPool;
use crate::config::{CACHE_BACKEND_FILE, CACHE_BACKEND_MEMORY};
use crate::error::CoreError;
use crate::roster_cache::cache_backends;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::tempdir;

#[test]
fn first_valid_candidate_wins() {
    let pool: BackendPool<String> = BackendPool::new()
        .with_candidate("broken", |_context| {
            Err(CoreError::Connection("down".to_string()))
        })
        .with_candidate("local", |context| Ok(Arc::new(format!("local:{}", context))));

    let resource = pool.get("ctx-1").expect("resource");
    assert_eq!(resource.as_str(), "local:ctx-1");
    assert_eq!(pool.backend_name("ctx-1").as_deref(), Some("local"));
    assert_eq!(pool.candidate_names(), vec!["broken", "local"]);
}

#[test]
fn resources_are_cached_per_context() {
    let built = Arc::new(AtomicUsize::new(0));
    let counter = built.clone();
    let pool: BackendPool<usize> = BackendPool::new().with_candidate("counting", move |_context| {
        Ok(Arc::new(counter.fetch_add(1, Ordering::SeqCst)))
    });

    let first = pool.get("a").expect("a");
    let again = pool.get("a").expect("a again");
    let other = pool.get("b").expect("b");
    assert!(Arc::ptr_eq(&first, &again));
    assert_ne!(*first, *other);
    assert_eq!(built.load(Ordering::SeqCst), 2);
    assert_eq!(pool.len(), 2);

    assert!(pool.release("a"));
    assert!(!pool.release("a"));
    pool.get("a").expect("rebuilt");
    assert_eq!(built.load(Ordering::SeqCst), 3);
}

#[test]
fn no_candidate_is_an_error() {
    let pool: BackendPool<String> = BackendPool::new().with_candidate("broken", |_context| {
        Err(CoreError::Connection("down".to_string()))
    });
    assert!(matches!(
        pool.get("ctx"),
        Err(CoreError::NoBackendAvailable(context)) if context == "ctx"
    ));
    assert!(pool.is_empty());
}

#[test]
fn file_cache_falls_back_to_memory() {
    let dir = tempdir().expect("tempdir");
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"x").expect("write");
    let mut config = base_config(dir.path());
    config.cache_dir = blocker.join("cache");

    let pool = cache_backends(&config);
    assert_eq!(pool.candidate_names(), vec![CACHE_BACKEND_FILE, CACHE_BACKEND_MEMORY]);
    pool.get("acct/1").expect("fallback");
    assert_eq!(pool.backend_name("acct/1").as_deref(), Some(CACHE_BACKEND_MEMORY));
}

#[test]
fn file_cache_preferred_when_usable() {
    let dir = tempdir().expect("tempdir");
    let pool = cache_backends(&base_config(dir.path()));
    pool.get("acct/1").expect("file");
    assert_eq!(pool.backend_name("acct/1").as_deref(), Some(CACHE_BACKEND_FILE));
}
