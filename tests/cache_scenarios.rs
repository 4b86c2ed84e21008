//! End-to-end scenarios for the size-bounded cache overlay.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tierfs::{util, LocalFs, MemoryFs, OpenFlags, SizeCacheFs, Vfs, VfsFile};

fn tiers() -> (Arc<MemoryFs>, Arc<MemoryFs>) {
    (Arc::new(MemoryFs::new()), Arc::new(MemoryFs::new()))
}

async fn overlay(base: Arc<dyn Vfs>, cache: Arc<dyn Vfs>, capacity: u64) -> SizeCacheFs {
    SizeCacheFs::new(base, cache, capacity, Duration::ZERO)
        .await
        .unwrap()
}

async fn put(fs: &SizeCacheFs, name: &str, data: &[u8]) {
    let mut f = fs.create(Path::new(name)).await.unwrap();
    f.write(data).await.unwrap();
    f.close().await.unwrap();
}

#[tokio::test]
async fn size_accounting() {
    let (base, cache) = tiers();
    let fs = overlay(base, cache, 1_000_000_000).await;

    for i in 0..10 {
        put(&fs, &format!("{i}.txt"), b"0123456789").await;
    }
    assert_eq!(fs.current_size(), 100);

    for i in 0..5 {
        fs.remove(Path::new(&format!("{i}.txt"))).await.unwrap();
    }
    assert_eq!(fs.current_size(), 50);
}

#[tokio::test]
async fn lru_eviction() {
    let (base, cache) = tiers();
    let fs = overlay(base, cache, 100).await;

    for i in 0..11 {
        put(&fs, &format!("{i}.txt"), b"0123456789").await;
    }
    assert_eq!(fs.current_size(), 100);
    // 0.txt was the least recently used entry
    assert!(!fs.is_cached(Path::new("0.txt")));
    assert!(fs.is_cached(Path::new("10.txt")));

    // only 4 of these removes touch cached files
    for i in 0..5 {
        fs.remove(Path::new(&format!("{i}.txt"))).await.unwrap();
    }
    assert_eq!(fs.current_size(), 60);
}

#[tokio::test]
async fn pinning_across_eviction() {
    let (base, cache) = tiers();
    let fs = overlay(base, cache, 100).await;

    let mut open_file = fs.create(Path::new("0.txt")).await.unwrap();

    for i in 1..11 {
        put(&fs, &format!("{i}.txt"), b"0123456789").await;
    }
    assert_eq!(fs.current_size(), 100);
    // still open, therefore detached
    assert!(!fs.is_cached(Path::new("0.txt")));

    open_file.write(b"0123456789").await.unwrap();
    open_file.write(b"0123456789").await.unwrap();
    open_file.close().await.unwrap();

    // re-attach evicted two 10-byte entries to fit the 20-byte file
    assert_eq!(fs.current_size(), 100);
    assert!(fs.is_cached(Path::new("0.txt")));

    for i in 0..5 {
        fs.remove(Path::new(&format!("{i}.txt"))).await.unwrap();
    }
    assert_eq!(fs.current_size(), 60);
}

#[tokio::test]
async fn in_place_update_accounting() {
    let (base, cache) = tiers();
    let fs = overlay(base, cache, 100).await;

    put(&fs, "0.txt", b"0123456789").await;
    assert_eq!(fs.current_size(), 10);

    let mut f = fs
        .open_with(Path::new("0.txt"), OpenFlags::append(), 0o644)
        .await
        .unwrap();
    // detached for the whole open window
    assert_eq!(fs.current_size(), 0);
    f.write(b"0123456789").await.unwrap();
    assert_eq!(fs.current_size(), 0);
    f.close().await.unwrap();
    assert_eq!(fs.current_size(), 20);

    let data = util::read_all(&fs, Path::new("0.txt")).await.unwrap();
    assert_eq!(data, b"01234567890123456789");
}

#[tokio::test]
async fn index_persistence() {
    let (base, cache) = tiers();

    let fs = overlay(base.clone(), cache.clone(), 100).await;
    for i in 0..10 {
        put(&fs, &format!("{i}.txt"), b"0123456789").await;
    }
    assert_eq!(fs.current_size(), 100);

    // walk-based reconstruction: no index file has been written yet
    let rebuilt = overlay(base.clone(), cache.clone(), 100).await;
    assert_eq!(rebuilt.current_size(), 100);

    // persist, then load the written index
    rebuilt.close().await.unwrap();
    let reloaded = overlay(base, cache, 100).await;
    assert_eq!(reloaded.current_size(), 100);
    for i in 0..10 {
        assert!(reloaded.is_cached(Path::new(&format!("{i}.txt"))));
    }
}

#[tokio::test]
async fn remove_recursive_with_open_file() {
    let (base, cache) = tiers();
    let fs = overlay(base, cache, 100).await;

    let mut open_file = fs.create(Path::new("open.txt")).await.unwrap();
    open_file.write(b"0123456789").await.unwrap();

    for i in 0..10 {
        put(&fs, &format!("tmp/a/{i}.txt"), b"0123456789").await;
    }
    for i in 0..10 {
        put(&fs, &format!("tmp/b/{i}.txt"), b"0123456789").await;
    }

    fs.remove_all(Path::new("tmp")).await.unwrap();
    // only open.txt survives, and it is detached
    assert_eq!(fs.current_size(), 0);

    open_file.close().await.unwrap();
    assert_eq!(fs.current_size(), 10);
}

#[tokio::test]
async fn read_after_eviction() {
    let (base, cache) = tiers();
    let fs = overlay(base, cache, 10).await;

    put(&fs, "0.txt", b"0123456789").await;
    put(&fs, "1.txt", b"0123456789").await;
    assert!(!fs.is_cached(Path::new("0.txt")));

    // the evicted file is repopulated from base on open
    let mut f = fs.open(Path::new("0.txt")).await.unwrap();
    let data = util::read_to_end(&mut *f).await.unwrap();
    f.close().await.unwrap();
    assert_eq!(data, b"0123456789");
}

#[tokio::test]
async fn budget_holds_after_every_close() {
    let (base, cache) = tiers();
    let fs = overlay(base, cache, 50).await;

    for i in 0..20 {
        let name = format!("f{i}.bin");
        let payload = vec![b'x'; 7 + (i % 5)];
        put(&fs, &name, &payload).await;
        assert!(
            fs.current_size() <= 50,
            "budget exceeded after closing {name}: {}",
            fs.current_size()
        );
    }
}

#[tokio::test]
async fn read_your_writes_across_handles() {
    let (base, cache) = tiers();
    let fs = overlay(base, cache, 1_000).await;

    put(&fs, "doc.txt", b"first").await;
    let data = util::read_all(&fs, Path::new("doc.txt")).await.unwrap();
    assert_eq!(data, b"first");

    put(&fs, "doc.txt", b"second, longer").await;
    let data = util::read_all(&fs, Path::new("doc.txt")).await.unwrap();
    assert_eq!(data, b"second, longer");
    assert_eq!(fs.current_size(), 14);
}

#[tokio::test]
async fn stat_after_remove_is_not_found() {
    let (base, cache) = tiers();
    let fs = overlay(base, cache, 1_000).await;

    put(&fs, "gone.txt", b"0123456789").await;
    fs.remove(Path::new("gone.txt")).await.unwrap();

    let err = fs.stat(Path::new("gone.txt")).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn stat_size_matches_read_length() {
    let (base, cache) = tiers();
    let fs = overlay(base, cache, 1_000).await;

    put(&fs, "sized.txt", b"exactly-18-bytes!!").await;
    let attr = fs.stat(Path::new("sized.txt")).await.unwrap();
    let data = util::read_all(&fs, Path::new("sized.txt")).await.unwrap();
    assert_eq!(attr.size as usize, data.len());
}

#[tokio::test]
async fn cold_open_populates_from_base() {
    let (base, cache) = tiers();
    // seed base directly, bypassing the overlay
    util::write_all(&*base, Path::new("seeded/data.txt"), b"from base")
        .await
        .unwrap();

    let fs = overlay(base, cache.clone(), 1_000).await;
    assert_eq!(fs.current_size(), 0);

    let data = util::read_all(&fs, Path::new("seeded/data.txt"))
        .await
        .unwrap();
    assert_eq!(data, b"from base");
    assert_eq!(fs.current_size(), 9);
    // the copy landed in the cache tier
    assert_eq!(
        util::read_all(&*cache, Path::new("seeded/data.txt"))
            .await
            .unwrap(),
        b"from base"
    );
}

#[tokio::test]
async fn corrupt_index_falls_back_to_walk() {
    let (base, cache) = tiers();

    let fs = overlay(base.clone(), cache.clone(), 1_000).await;
    for i in 0..3 {
        put(&fs, &format!("{i}.txt"), b"0123456789").await;
    }
    fs.close().await.unwrap();

    // clobber the sentinel
    util::write_all(&*cache, Path::new(tierfs::INDEX_FILE), b"not json at all")
        .await
        .unwrap();

    let recovered = overlay(base, cache, 1_000).await;
    assert_eq!(recovered.current_size(), 30);
}

#[tokio::test]
async fn stale_index_entries_are_reconciled() {
    let (base, cache) = tiers();

    let fs = overlay(base.clone(), cache.clone(), 1_000).await;
    for name in ["keep.txt", "vanish.txt"] {
        put(&fs, name, b"0123456789").await;
    }
    fs.close().await.unwrap();

    // one cache file disappears behind the overlay's back, another shows up
    cache.remove(Path::new("vanish.txt")).await.unwrap();
    util::write_all(&*cache, Path::new("surprise.txt"), b"12345")
        .await
        .unwrap();

    let reloaded = overlay(base, cache, 1_000).await;
    assert!(reloaded.is_cached(Path::new("keep.txt")));
    assert!(!reloaded.is_cached(Path::new("vanish.txt")));
    assert!(reloaded.is_cached(Path::new("surprise.txt")));
    assert_eq!(reloaded.current_size(), 15);
}

#[tokio::test]
async fn local_disk_tiers() {
    let base_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let base: Arc<dyn Vfs> = Arc::new(LocalFs::new(base_dir.path()));
    let cache: Arc<dyn Vfs> = Arc::new(LocalFs::new(cache_dir.path()));

    let fs = overlay(base.clone(), cache, 30).await;

    for i in 0..4 {
        put(&fs, &format!("disk/{i}.txt"), b"0123456789").await;
    }
    // 4 files, budget of 30: the oldest was evicted
    assert_eq!(fs.current_size(), 30);
    assert!(!fs.is_cached(Path::new("disk/0.txt")));

    // evicted content still reads back through base
    let data = util::read_all(&fs, Path::new("disk/0.txt")).await.unwrap();
    assert_eq!(data, b"0123456789");

    // everything is durable in the base directory
    for i in 0..4 {
        let on_disk = std::fs::read(base_dir.path().join(format!("disk/{i}.txt"))).unwrap();
        assert_eq!(on_disk, b"0123456789");
    }
}

#[tokio::test]
async fn concurrent_writers_settle_under_budget() {
    let (base, cache) = tiers();
    let fs = Arc::new(overlay(base, cache, 200).await);

    let mut tasks = Vec::new();
    for worker in 0..8 {
        let fs = Arc::clone(&fs);
        tasks.push(tokio::spawn(async move {
            for round in 0..5 {
                let name = format!("w{worker}/r{round}.txt");
                let mut f = fs.create(Path::new(&name)).await.unwrap();
                f.write(b"0123456789").await.unwrap();
                f.close().await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(fs.current_size() <= 200);

    // every file is readable regardless of eviction
    for worker in 0..8 {
        for round in 0..5 {
            let name = format!("w{worker}/r{round}.txt");
            let data = util::read_all(&*fs, Path::new(&name)).await.unwrap();
            assert_eq!(data, b"0123456789");
        }
    }
    assert!(fs.current_size() <= 200);
}
