//! Operation Engine scenarios that bypass the wire/dispatcher entirely,
//! calling the `ops::*` free functions directly against a fresh [`Engine`].

mod support;

use fsdev::{ops, Kind, ROOT_NODE_ID};
use support::make_engine;

/// Boundary: a write whose payload exceeds the negotiated `max_write` is
/// rejected before it ever reaches the backend.
#[tokio::test]
async fn write_exceeding_max_write_is_invalid() {
    let (_backend, engine) = make_engine().await;
    let (node, _attr) = ops::mknod(
        engine.pool(),
        engine.channel(),
        ROOT_NODE_ID,
        std::ffi::OsStr::new("big"),
        0o644,
        0,
        0,
    )
    .await
    .unwrap();
    let handle = ops::open(engine.pool(), engine.channel(), node, 0)
        .await
        .unwrap();

    let payload = vec![0u8; 9];
    let err = ops::write(
        engine.pool(),
        engine.channel(),
        node,
        handle,
        0,
        payload,
        8,
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), Kind::Invalid);
}

/// Round-trip: a lookup's extra reference must be forgotten explicitly;
/// forgetting fewer times than the outstanding refcount leaves the node
/// alive, and forgetting the rest lets a fresh `mknod` reuse the name.
#[tokio::test]
async fn lookup_refcount_round_trips() {
    let (backend, engine) = make_engine().await;
    let name = std::ffi::OsStr::new("tracked");
    let (node, _) = ops::mknod(engine.pool(), engine.channel(), ROOT_NODE_ID, name, 0o644, 0, 0)
        .await
        .unwrap();
    assert_eq!(backend.lookup_refs(node), 1);

    let (looked_up, _) = ops::lookup(engine.pool(), engine.channel(), ROOT_NODE_ID, name)
        .await
        .unwrap();
    assert_eq!(looked_up, node);
    assert_eq!(backend.lookup_refs(node), 2);

    ops::forget(engine.pool(), engine.channel(), node, 1).await.unwrap();
    assert_eq!(backend.lookup_refs(node), 1, "node survives one outstanding ref");

    ops::forget(engine.pool(), engine.channel(), node, 1).await.unwrap();
    assert_eq!(backend.lookup_refs(node), 0);

    // The name is free again now that the backend dropped the inode.
    let (recreated, _) = ops::mknod(engine.pool(), engine.channel(), ROOT_NODE_ID, name, 0o644, 0, 0)
        .await
        .unwrap();
    assert_ne!(recreated, node, "backend mints a fresh inode number");
}

/// Round-trip: `open` then `release` on the same handle both succeed, and
/// releasing doesn't disturb the node's identity for a later `open`.
#[tokio::test]
async fn open_release_round_trips() {
    let (_backend, engine) = make_engine().await;
    let (node, _) = ops::mknod(
        engine.pool(),
        engine.channel(),
        ROOT_NODE_ID,
        std::ffi::OsStr::new("handle-test"),
        0o644,
        0,
        0,
    )
    .await
    .unwrap();

    let handle = ops::open(engine.pool(), engine.channel(), node, 0)
        .await
        .unwrap();
    ops::release(engine.pool(), engine.channel(), node, handle)
        .await
        .unwrap();

    let second = ops::open(engine.pool(), engine.channel(), node, 0)
        .await
        .unwrap();
    ops::release(engine.pool(), engine.channel(), node, second)
        .await
        .unwrap();
}

/// A zero-size read is rejected by `ops::read` itself, without ever
/// reaching the backend.
#[tokio::test]
async fn zero_size_read_is_invalid_at_engine_layer() {
    let (_backend, engine) = make_engine().await;
    let (node, _) = ops::mknod(
        engine.pool(),
        engine.channel(),
        ROOT_NODE_ID,
        std::ffi::OsStr::new("empty"),
        0o644,
        0,
        0,
    )
    .await
    .unwrap();
    let handle = ops::open(engine.pool(), engine.channel(), node, 0)
        .await
        .unwrap();

    let err = ops::read(engine.pool(), engine.channel(), node, handle, 0, 0)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Kind::Invalid);
}

/// `mknod` against a name that already exists surfaces `Exists` rather
/// than silently overwriting the prior entry.
#[tokio::test]
async fn mknod_duplicate_name_conflicts() {
    let (_backend, engine) = make_engine().await;
    let name = std::ffi::OsStr::new("dup");
    ops::mknod(engine.pool(), engine.channel(), ROOT_NODE_ID, name, 0o644, 0, 0)
        .await
        .unwrap();

    let err = ops::mknod(engine.pool(), engine.channel(), ROOT_NODE_ID, name, 0o644, 0, 0)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Kind::Exists);
}
