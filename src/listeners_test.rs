use std::sync::Mutex;

use super::*;

fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&'static str) -> UpdateCallback) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let make = {
        let log = Arc::clone(&log);
        move |tag: &'static str| -> UpdateCallback {
            let log = Arc::clone(&log);
            Arc::new(move |update: &EntityUpdate| {
                log.lock().unwrap().push(format!("{tag}:{}", update.entity_id));
            })
        }
    };
    (log, make)
}

fn deliver(registry: &ListenerRegistry, update: &EntityUpdate) {
    for cb in registry.matching(&update.entity_id) {
        cb(update);
    }
}

#[test]
fn entity_listener_only_sees_its_key() {
    let (log, make) = recorder();
    let mut registry = ListenerRegistry::new();
    registry.register(ListenerScope::Entity("a".into()), make("A"));

    deliver(&registry, &EntityUpdate::status("a", "confirmed"));
    deliver(&registry, &EntityUpdate::status("b", "confirmed"));

    assert_eq!(*log.lock().unwrap(), vec!["A:a"]);
}

#[test]
fn broadcast_listener_sees_everything_after_entity_listeners() {
    let (log, make) = recorder();
    let mut registry = ListenerRegistry::new();
    registry.register(ListenerScope::Broadcast, make("all"));
    registry.register(ListenerScope::Entity("a".into()), make("A"));

    deliver(&registry, &EntityUpdate::status("a", "x"));
    deliver(&registry, &EntityUpdate::status("b", "x"));

    assert_eq!(*log.lock().unwrap(), vec!["A:a", "all:a", "all:b"]);
}

#[test]
fn remove_stops_delivery_and_prunes_empty_entity_slots() {
    let (log, make) = recorder();
    let mut registry = ListenerRegistry::new();
    let a = registry.register(ListenerScope::Entity("a".into()), make("A"));
    let all = registry.register(ListenerScope::Broadcast, make("all"));
    assert_eq!(registry.len(), 2);

    assert!(registry.remove(a));
    assert!(registry.remove(all));
    assert!(!registry.remove(a));
    assert!(registry.is_empty());
    assert!(registry.by_entity.is_empty());

    deliver(&registry, &EntityUpdate::status("a", "x"));
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn two_listeners_on_same_key_each_get_one_call() {
    let (log, make) = recorder();
    let mut registry = ListenerRegistry::new();
    registry.register(ListenerScope::Entity("a".into()), make("one"));
    registry.register(ListenerScope::Entity("a".into()), make("two"));

    deliver(&registry, &EntityUpdate::status("a", "x"));
    assert_eq!(*log.lock().unwrap(), vec!["one:a", "two:a"]);
}

#[test]
fn ids_are_unique_across_scopes() {
    let (_log, make) = recorder();
    let mut registry = ListenerRegistry::new();
    let a = registry.register(ListenerScope::Broadcast, make("x"));
    let b = registry.register(ListenerScope::Entity("k".into()), make("y"));
    assert_ne!(a, b);
}
