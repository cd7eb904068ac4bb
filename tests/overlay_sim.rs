//! Whole-overlay behavior on the in-memory network: joins, floods, routing.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use bst_overlay::error::ProtocolError;
use bst_overlay::protocol::dispatcher::{Action, Dispatcher, DropReason};
use bst_overlay::protocol::handshake::{absorb_chat_info, absorb_connect_resp, chat_info_request};
use bst_overlay::protocol::membership::{Membership, NodePhase};
use bst_overlay::protocol::message::{Side, INF, ROOT_LOW_BOUND};
use common::{addr, Sim};

fn build(count: u16) -> Sim {
    let mut sim = Sim::new();
    let root = sim.add_root(9000, 50_000_000_000);
    for port in 9001..9000 + count {
        sim.join(port, root, None);
    }
    sim
}

#[test]
fn test_four_node_scenario() {
    let mut sim = Sim::new();
    let root = sim.add_root(9000, 50);
    let b = sim.join(9001, root, Some(30));
    let c = sim.join(9002, root, Some(70));
    let d = sim.join(9003, root, Some(40));

    assert_eq!(b.parent, 50);
    assert_eq!(c.parent, 50);
    assert_eq!(d.parent, 30, "40 lands under 30 after one relay");

    let root_view = sim.snapshot(root);
    assert_eq!(root_view.left, Some(30));
    assert_eq!(root_view.right, Some(70));
    assert_eq!((root_view.low_bound, root_view.up_bound), (ROOT_LOW_BOUND, INF));

    let b_view = sim.snapshot(addr(9001));
    assert_eq!((b_view.low_bound, b_view.up_bound), (ROOT_LOW_BOUND, 50));
    assert_eq!(b_view.right, Some(40));
    assert_eq!(b_view.side, Some(Side::Left));

    let c_view = sim.snapshot(addr(9002));
    assert_eq!((c_view.low_bound, c_view.up_bound), (50, INF));
    assert_eq!(c_view.neighbor, Some(30));

    let d_view = sim.snapshot(addr(9003));
    assert_eq!((d_view.low_bound, d_view.up_bound), (30, 50));
    assert_eq!(d_view.side, Some(Side::Right));
    assert_eq!(d_view.parent, Some(30));
    assert_eq!(d_view.phase, NodePhase::Attached);

    // Every table ends up with the same four entries
    for view in sim.snapshots() {
        let mut ids: Vec<_> = view.connected.values().map(|p| p.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![30, 40, 50, 70], "table of {}", view.host);
    }
    assert_eq!(sim.node(root).pending_returns(), 0);
}

#[test]
fn test_join_through_leaf_climbs_to_root() {
    let mut sim = Sim::new();
    let root = sim.add_root(9000, 50);
    sim.join(9001, root, Some(30));

    let joined = sim.join(9002, addr(9001), Some(80));
    assert_eq!(joined.parent, 50);

    let view = sim.snapshot(addr(9002));
    assert_eq!((view.low_bound, view.up_bound), (50, INF));
    assert_eq!(sim.snapshot(root).right, Some(80));
    assert_eq!(sim.node(addr(9001)).pending_returns(), 0);
}

#[test]
fn test_ranges_nest_along_every_edge() {
    let sim = build(24);

    let views = sim.snapshots();
    for view in &views {
        let id = view.id.unwrap();
        assert!(view.low_bound < id && id < view.up_bound, "{id} outside its range");

        let Some(parent_id) = view.parent else {
            assert!(view.is_root);
            continue;
        };
        let parent = views.iter().find(|v| v.id == Some(parent_id)).unwrap();
        let expected = match view.side.unwrap() {
            Side::Left => (parent.low_bound, parent_id),
            Side::Right => (parent_id, parent.up_bound),
        };
        assert_eq!((view.low_bound, view.up_bound), expected);
        match view.side.unwrap() {
            Side::Left => assert_eq!(parent.left, Some(id)),
            Side::Right => assert_eq!(parent.right, Some(id)),
        }
    }
}

#[test]
fn test_identifiers_unique_in_every_table() {
    let sim = build(32);
    for view in sim.snapshots() {
        let mut ids: Vec<_> = view.connected.values().map(|p| p.id).collect();
        let total = ids.len();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), total);
        assert_eq!(total, 32);
    }
}

#[test]
fn test_broadcast_reaches_every_node_exactly_once() {
    let mut sim = build(16);
    let hosts: Vec<_> = sim.nodes.keys().copied().collect();

    for announcer in &hosts {
        sim.reset_logs();
        let user = sim.node(*announcer).membership().id().unwrap();
        sim.announce(*announcer);

        for host in &hosts {
            let expected = usize::from(host != announcer);
            assert_eq!(
                sim.new_user_copies(*host, user),
                expected,
                "copies of {user} at {host}"
            );
        }
        assert_eq!(sim.forwards, hosts.len() - 1);
        assert!(sim.drops.is_empty(), "{:?}", sim.drops);
    }
}

#[test]
fn test_unicast_between_every_pair() {
    let mut sim = build(10);
    let hosts: Vec<_> = sim.nodes.keys().copied().collect();

    for from in &hosts {
        for to in &hosts {
            if from == to {
                continue;
            }
            sim.reset_logs();
            let text = format!("{from} -> {to}");
            sim.send_message(*from, *to, &text);

            let delivered = sim.delivered.get(to).cloned().unwrap_or_default();
            assert_eq!(delivered.len(), 1, "{text}");
            assert_eq!(delivered[0].text, text);
            assert_eq!(delivered[0].from_host, *from);
            assert_eq!(
                delivered[0].from_id,
                sim.node(*from).membership().id()
            );
            assert!(sim.delivered.keys().all(|host| host == to));
            // Bounded by tree height both ways
            assert!(sim.forwards <= 2 * hosts.len());
        }
    }
}

#[test]
fn test_message_to_self_is_delivered_locally() {
    let mut sim = build(3);
    let root = addr(9000);
    sim.send_message(root, root, "echo");
    assert_eq!(sim.delivered[&root][0].text, "echo");
    assert_eq!(sim.forwards, 0);
}

#[test]
fn test_attach_race_has_single_winner() {
    let mut sim = Sim::new();
    let root = sim.add_root(9000, 50);

    let mut first = Membership::new(addr(9001), None);
    let mut second = Membership::new(addr(9002), None);
    for (membership, id) in [(&mut first, 30), (&mut second, 20)] {
        let response = sim.request(membership.host(), root, chat_info_request(membership, root));
        absorb_chat_info(membership, response, Some(id)).unwrap();
    }

    // Both learn the same empty slot before either claims it
    let place_first = sim.find_place(&first, root);
    let place_second = sim.find_place(&second, root);
    assert_eq!(place_first, place_second);

    let ok = sim.connect(&first, &place_first);
    let err = sim.connect(&second, &place_second);
    assert_eq!(absorb_connect_resp(&mut first, &place_first, ok).unwrap(), 50);
    assert!(matches!(
        absorb_connect_resp(&mut second, &place_second, err),
        Err(ProtocolError::SlotOccupied)
    ));

    sim.nodes.insert(addr(9001), Dispatcher::new(first));
    sim.announce(addr(9001));

    // The loser searches again and lands one level down
    let (place, response) = sim.find_and_connect(&second, root);
    assert_eq!(absorb_connect_resp(&mut second, &place, response).unwrap(), 30);
    assert_eq!((place.low_bound, place.up_bound), (ROOT_LOW_BOUND, 30));
    assert_eq!(place.side, Side::Left);
    assert_eq!(sim.snapshot(root).left, Some(30));
    assert_eq!(sim.snapshot(addr(9001)).left, Some(20));
}

#[test]
fn test_link_without_address_is_unknown_peer() {
    let mut membership = Membership::new(addr(9000), None);
    membership.become_root(50);
    membership.set_child(Side::Left, 30);
    let mut node = Dispatcher::new(membership);

    let actions = node.announce();
    assert_eq!(actions, vec![Action::Drop(DropReason::UnknownPeer(30))]);
}
