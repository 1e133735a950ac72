// Paged listing semantics against the in-process KV.
//
// Principles:
// 1. State-based verification, no mocks
// 2. Cursor pages skip exactly one leading key (the cursor itself)
// 3. The pager concatenates pages into one consistent listing

use banfleet_kv::memory::MemoryKv;
use banfleet_kv::{ListOption, ListPager, Lister, WatchEvent, WatchOption, Watcher};

fn seeded(count: usize) -> MemoryKv {
    let kv = MemoryKv::new();
    for i in 0..count {
        kv.put(format!("/items/{i:03}"), format!("value-{i}"));
    }
    kv
}

#[tokio::test]
async fn page_size_zero_or_negative_is_an_error() {
    let kv = seeded(3);
    for size in [0, -1] {
        let result = kv
            .list(ListOption { prefix: "/items/".into(), size, ..Default::default() })
            .await;
        assert!(result.is_err(), "size {size} must be rejected");
    }
}

#[tokio::test]
async fn cursor_pages_are_disjoint_and_complete() {
    let kv = seeded(7);
    let mut seen = Vec::new();
    let mut cursor = String::new();

    loop {
        let page = kv
            .list(ListOption {
                prefix: "/items/".into(),
                size: 3,
                cursor: cursor.clone(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total_count, 7);
        seen.extend(page.items.iter().map(|(k, _)| k.clone()));
        if !page.more() {
            break;
        }
        cursor = page.next_cursor.clone();
    }

    let expected: Vec<String> = (0..7).map(|i| format!("/items/{i:03}")).collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn pager_drives_list_to_exhaustion() {
    let kv = seeded(25);
    let pager = ListPager::new(4);
    let list = pager
        .list(&kv, ListOption { prefix: "/items/".into(), ..Default::default() })
        .await
        .unwrap();

    assert_eq!(list.items.len(), 25);
    assert!(!list.more());
    assert_eq!(list.total_count, 25);
}

#[tokio::test]
async fn stopped_watch_closes_the_event_channel() {
    let kv = seeded(0);
    let mut handle = kv
        .watch(WatchOption { prefix: "/items/".into(), revision: 0 })
        .await
        .unwrap();

    kv.put("/items/a", "1");
    assert!(matches!(handle.recv().await, Some(WatchEvent::Put { .. })));

    handle.stop();
    kv.put("/items/b", "2"); // dropped: watcher is cancelled
    assert!(handle.recv().await.is_none());
}
