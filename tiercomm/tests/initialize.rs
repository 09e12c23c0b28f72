//! Process-global initialization. Kept to a single test: the state is a
//! process-wide singleton and test binaries share one process.

use std::sync::Arc;

use tiercomm::{
    global_state, initialize, initialize_with, is_initialized, LaunchEnv, LocalBackend,
    LocalFabric, MemoryStore, TierCommConfig, TierCommError,
};

#[tokio::test]
async fn test_initialize_once() {
    let fabric = LocalFabric::from_config(&TierCommConfig::default());
    let backend = || Arc::new(LocalBackend::new(Arc::clone(&fabric)));

    assert!(!is_initialized());
    assert!(matches!(global_state(), Err(TierCommError::NotInitialized)));

    // A failed attempt leaves the process uninitialized.
    let err = initialize(backend(), "tcp://10.0.0.1:29500", None)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, TierCommError::InvalidInitMethod(_)));
    assert!(!is_initialized());

    let first = initialize_with(
        backend(),
        Arc::new(MemoryStore::new()),
        LaunchEnv::default(),
        TierCommConfig::default(),
        None,
    )
    .await
    .unwrap();
    assert!(is_initialized());
    assert_eq!(first.global_communicator().size(), 1);

    let again = initialize_with(
        backend(),
        Arc::new(MemoryStore::new()),
        LaunchEnv::default(),
        TierCommConfig::default(),
        None,
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(again, TierCommError::RepeatedInitialization));

    let again = initialize(backend(), "dist://", None).await.err().unwrap();
    assert!(matches!(again, TierCommError::RepeatedInitialization));

    // The original state is untouched.
    let current = global_state().unwrap();
    assert!(std::ptr::eq(first, current));
    assert_eq!(
        current.global_communicator().unique_id(),
        first.global_communicator().unique_id()
    );
}
