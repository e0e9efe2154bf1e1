use std::collections::HashSet;
use std::time::Instant;

use tracing::{debug, warn};

use crate::state::TransferItem;
use crate::storage::{ListEntry, ObjectStore};

/// Walks every bucket depth-first (folders before sibling objects, each
/// group in byte order) and returns the flat list of objects with dense
/// ordinals `0..N`.
///
/// A failed listing is logged and its branch treated as empty.
pub async fn build_index(store: &dyn ObjectStore, buckets: &[String]) -> Vec<TransferItem> {
    let started = Instant::now();
    let mut acc = Vec::new();
    let mut listing_failures = 0u64;

    for bucket in buckets {
        let before = acc.len();
        walk_bucket(store, bucket, &mut acc, &mut listing_failures).await;
        debug!(
            event = "index.bucket",
            bucket = %bucket,
            objects = (acc.len() - before) as u64,
            "index.bucket"
        );
    }

    let mut seen = HashSet::new();
    acc.retain(|item: &TransferItem| seen.insert((item.bucket.clone(), item.path.clone())));

    for (ordinal, item) in acc.iter_mut().enumerate() {
        item.ordinal = ordinal as u64;
    }

    debug!(
        event = "index.finish",
        buckets = buckets.len() as u64,
        objects = acc.len() as u64,
        listing_failures,
        duration_ms = started.elapsed().as_millis() as u64,
        "index.finish"
    );
    acc
}

async fn walk_bucket(
    store: &dyn ObjectStore,
    bucket: &str,
    acc: &mut Vec<TransferItem>,
    listing_failures: &mut u64,
) {
    // Explicit stack instead of async recursion. Each frame holds the
    // entries of one folder still to visit, reversed so `pop` yields them in
    // traversal order.
    let mut stack: Vec<(String, Vec<ListEntry>)> = Vec::new();
    if let Some(root) = list_sorted(store, bucket, "", listing_failures).await {
        stack.push((String::new(), root));
    }

    while let Some((folder, entries)) = stack.last_mut() {
        let Some(entry) = entries.pop() else {
            stack.pop();
            continue;
        };
        let full = join_path(folder, &entry.name);

        if entry.is_folder {
            if let Some(children) = list_sorted(store, bucket, &full, listing_failures).await {
                stack.push((full, children));
            }
        } else {
            acc.push(TransferItem::new(
                bucket,
                full,
                entry.size_bytes,
                entry.last_modified,
            ));
        }
    }
}

async fn list_sorted(
    store: &dyn ObjectStore,
    bucket: &str,
    folder: &str,
    listing_failures: &mut u64,
) -> Option<Vec<ListEntry>> {
    match store.list_entries(bucket, folder).await {
        Ok(mut entries) => {
            entries.retain(|e| !e.name.is_empty());
            entries.sort_by(|a, b| {
                b.is_folder
                    .cmp(&a.is_folder)
                    .then_with(|| a.name.as_bytes().cmp(b.name.as_bytes()))
            });
            entries.reverse();
            Some(entries)
        }
        Err(e) => {
            *listing_failures += 1;
            warn!(
                event = "index.listing_failed",
                provider = store.provider(),
                bucket,
                folder,
                error = %e,
                "index.listing_failed"
            );
            None
        }
    }
}

fn join_path(folder: &str, name: &str) -> String {
    let name = name.trim_matches('/');
    if folder.is_empty() {
        name.to_string()
    } else {
        format!("{folder}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;

    fn paths(items: &[TransferItem]) -> Vec<(&str, &str, u64)> {
        items
            .iter()
            .map(|i| (i.bucket.as_str(), i.path.as_str(), i.ordinal))
            .collect()
    }

    #[tokio::test]
    async fn folders_come_before_root_level_siblings() {
        let storage = InMemoryStorage::new()
            .with_object("b", "x/a.txt", &[0; 10])
            .with_object("b", "x/b.txt", &[0; 20])
            .with_object("b", "c.txt", &[0; 5]);

        let items = build_index(&storage, &["b".to_string()]).await;
        assert_eq!(
            paths(&items),
            vec![("b", "x/a.txt", 0), ("b", "x/b.txt", 1), ("b", "c.txt", 2)]
        );
        assert_eq!(items[0].size_bytes, 10);
        assert_eq!(items[1].size_bytes, 20);
        assert_eq!(items[2].size_bytes, 5);
    }

    #[tokio::test]
    async fn nested_folders_are_depth_first_across_buckets() {
        let storage = InMemoryStorage::new()
            .with_object("b1", "a/z/deep.bin", b"1")
            .with_object("b1", "a/top.bin", b"2")
            .with_object("b1", "b/x.bin", b"3")
            .with_object("b2", "only.bin", b"4");

        let items = build_index(&storage, &["b1".to_string(), "b2".to_string()]).await;
        assert_eq!(
            paths(&items),
            vec![
                ("b1", "a/z/deep.bin", 0),
                ("b1", "a/top.bin", 1),
                ("b1", "b/x.bin", 2),
                ("b2", "only.bin", 3),
            ]
        );
    }

    #[tokio::test]
    async fn failed_bucket_listing_is_treated_as_empty() {
        let storage = InMemoryStorage::new().with_object("ok", "f.txt", b"x");
        let items = build_index(&storage, &["missing".to_string(), "ok".to_string()]).await;
        assert_eq!(paths(&items), vec![("ok", "f.txt", 0)]);
    }

    #[tokio::test]
    async fn reindexing_unchanged_backend_is_stable() {
        let storage = InMemoryStorage::new()
            .with_object("b", "x/a.txt", b"a")
            .with_object("b", "y/b.txt", b"b")
            .with_object("b", "c.txt", b"c");
        let buckets = vec!["b".to_string()];

        let first = build_index(&storage, &buckets).await;
        let second = build_index(&storage, &buckets).await;
        assert_eq!(first, second);
        let ordinals: Vec<u64> = first.iter().map(|i| i.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
    }
}
