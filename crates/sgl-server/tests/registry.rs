use sgl_protocol::ClientId;
use sgl_server::{ConnectionRegistry, GlBackend, SoftwareBackend, SoftwareContext};

fn registry() -> (SoftwareBackend, ConnectionRegistry<SoftwareContext>) {
    (SoftwareBackend::new(), ConnectionRegistry::new())
}

#[test]
fn add_current_remove() {
    let (mut backend, mut reg) = registry();
    reg.add(&mut backend, ClientId(1), (3, 3)).unwrap();
    reg.add(&mut backend, ClientId(2), (3, 3)).unwrap();
    assert_eq!(reg.len(), 2);
    assert_eq!(reg.active(), None);

    let conn = reg.current(&mut backend, ClientId(2)).unwrap().unwrap();
    assert_eq!(conn.id, ClientId(2));
    assert_eq!(reg.active(), Some(ClientId(2)));
    assert!(backend.has_current());

    assert!(reg.remove(&mut backend, ClientId(1)));
    assert_eq!(reg.active(), Some(ClientId(2)));

    // Destroying the active context detaches it.
    assert!(reg.remove(&mut backend, ClientId(2)));
    assert_eq!(reg.active(), None);
    assert!(!backend.has_current());
    assert!(reg.is_empty());
    assert_eq!(backend.live_contexts(), 0);
}

#[test]
fn removing_an_unknown_id_is_a_no_op() {
    let (mut backend, mut reg) = registry();
    reg.add(&mut backend, ClientId(5), (3, 3)).unwrap();
    assert!(!reg.remove(&mut backend, ClientId(6)));
    assert_eq!(reg.len(), 1);
    assert!(reg.current(&mut backend, ClientId(6)).unwrap().is_none());
}

#[test]
fn re_adding_replaces_the_stale_context() {
    let (mut backend, mut reg) = registry();
    reg.add(&mut backend, ClientId(1), (3, 3)).unwrap();
    reg.current(&mut backend, ClientId(1)).unwrap();
    reg.add(&mut backend, ClientId(1), (3, 3)).unwrap();

    assert_eq!(reg.len(), 1);
    assert_eq!(backend.contexts_created(), 2);
    assert_eq!(backend.live_contexts(), 1);
    assert_eq!(reg.active(), None);
}

#[test]
fn next_round_robins_in_id_order() {
    let (mut backend, mut reg) = registry();
    assert_eq!(reg.next(), None);
    for id in [3, 1, 2] {
        reg.add(&mut backend, ClientId(id), (3, 3)).unwrap();
    }
    let order: Vec<u32> = (0..5).filter_map(|_| reg.next()).map(|id| id.0).collect();
    assert_eq!(order, vec![1, 2, 3, 1, 2]);

    reg.remove(&mut backend, ClientId(2));
    assert_eq!(reg.next(), Some(ClientId(3)));
}

#[test]
fn unsupported_versions_are_refused() {
    let (mut backend, mut reg) = registry();
    assert!(reg.add(&mut backend, ClientId(1), (9, 0)).is_err());
    assert!(reg.is_empty());

    let mut ctx = backend.create_context((2, 1)).unwrap();
    backend.resize(&mut ctx, 8, 8).unwrap();
    assert_eq!(ctx.size(), (8, 8));
    backend.destroy_context(ctx);
}
