use super::*;

fn key(s: &str) -> EntityKey {
    EntityKey::from(s)
}

#[test]
fn first_acquire_joins_and_repeat_is_unchanged() {
    let mut rooms = RoomSet::new();
    assert_eq!(rooms.acquire(&key("a")), RoomChange::Joined);
    assert_eq!(rooms.acquire(&key("a")), RoomChange::Unchanged);
    assert_eq!(rooms.holders(&key("a")), 2);
    assert_eq!(rooms.len(), 1);
}

#[test]
fn last_release_leaves() {
    let mut rooms = RoomSet::new();
    rooms.acquire(&key("a"));
    rooms.acquire(&key("a"));
    assert_eq!(rooms.release(&key("a")), RoomChange::Unchanged);
    assert!(rooms.contains(&key("a")));
    assert_eq!(rooms.release(&key("a")), RoomChange::Left);
    assert!(!rooms.contains(&key("a")));
    assert!(rooms.is_empty());
}

#[test]
fn release_of_unknown_key_is_reported() {
    let mut rooms = RoomSet::new();
    assert_eq!(rooms.release(&key("ghost")), RoomChange::Unknown);
    assert_eq!(rooms.holders(&key("ghost")), 0);
}

#[test]
fn keys_are_sorted_and_clear_empties() {
    let mut rooms = RoomSet::new();
    rooms.acquire(&key("b"));
    rooms.acquire(&key("a"));
    let keys: Vec<_> = rooms.keys().map(EntityKey::as_str).collect();
    assert_eq!(keys, vec!["a", "b"]);
    rooms.clear();
    assert!(rooms.is_empty());
}
