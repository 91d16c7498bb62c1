// Copyright 2022 Oxide Computer Company

//! Entity lifecycle: delete cascades and their exact event ordering.

use pa::core::{Advp, NodeId};
use pa::rules::StaticRule;

use crate::harness::*;

/// Removing a link drives published, applied and assigned down in that
/// order on the dependent pair, each exactly once.
#[test]
fn s4_delete_cascade_ordering() {
    let clock = FakeClock::new();
    let mut core = new_core(&clock);
    core.set_node_id(NodeId::from(1));
    let rule = StaticRule::new(p("2001:db8:0:5::/64"), 4, 200).unwrap();
    core.rule_add(Box::new(rule));

    let l1 = core.link_add("L1", None);
    let dp = core.dp_add(p("2001:db8::/56"), "dp1", None);
    settle(&mut core, &clock);
    let i = core.ldp_info(core.ldp(l1, dp).unwrap()).unwrap();
    assert!(i.assigned && i.published && i.applied);

    let (rec, events) = Recorder::new();
    core.user_register(Box::new(rec));
    core.link_del(l1);

    let seen: Vec<(Kind, bool)> = events
        .borrow()
        .iter()
        .map(|e| (e.kind, e.value))
        .collect();
    assert_eq!(
        seen,
        vec![
            (Kind::Published, false),
            (Kind::Applied, false),
            (Kind::Assigned, false),
        ]
    );
    // the pair itself is gone
    assert!(core.ldp(l1, dp).is_none());
    assert_invariants(&core);
}

/// A delegated-prefix removal cascades the same way and frees every
/// dependent pair.
#[test]
fn dp_delete_cascades_all_links() {
    let clock = FakeClock::new();
    let mut core = new_core(&clock);
    core.set_node_id(NodeId::from(1));

    let l1 = core.link_add("L1", None);
    let l2 = core.link_add("L2", None);
    let dp = core.dp_add(p("2001:db8::/56"), "dp1", None);
    core.advp_add(Advp {
        node_id: NodeId::from(2),
        prefix: p("2001:db8:0:1::/64"),
        priority: 2,
        link: Some(l1),
    })
    .unwrap();
    settle(&mut core, &clock);

    let (rec, events) = Recorder::new();
    core.user_register(Box::new(rec));
    core.dp_del(dp);

    // only the accepted pair had flags to drop
    let seen: Vec<(Kind, bool)> = events
        .borrow()
        .iter()
        .map(|e| (e.kind, e.value))
        .collect();
    assert_eq!(
        seen,
        vec![(Kind::Applied, false), (Kind::Assigned, false)]
    );
    assert!(core.ldp(l1, dp).is_none());
    assert!(core.ldp(l2, dp).is_none());
}

/// The C suite's smoke sequence: entities can come and go in any order,
/// and a fully emptied core has nothing scheduled.
#[test]
fn add_remove_everything_leaves_no_timers() -> Result<(), anyhow::Error> {
    let clock = FakeClock::new();
    let mut core = new_core(&clock);

    core.set_node_id(NodeId::from(0x111111));
    core.set_flooding_delay(20_000)?;
    core.set_flooding_delay(5_000)?;

    let l1 = core.link_add("L1", None);
    let d1 = core.dp_add(p("2001:db8:0:100::/56"), "d1", None);
    let l2 = core.link_add("L2", None);
    let d2 = core.dp_add(p("2001:db8:1:100::/56"), "d2", None);
    core.set_node_id(NodeId::from(0x222222));
    core.set_flooding_delay(10_000)?;

    core.link_del(l1);
    core.dp_del(d1);
    let l1 = core.link_add("L1", None);
    let d1 = core.dp_add(p("2001:db8:0:100::/56"), "d1", None);

    let pp1 = core.advp_add(Advp {
        node_id: NodeId::from(0x111111),
        prefix: p("2001:db8:0:101::/64"),
        priority: 1,
        link: Some(l1),
    })?;
    let pp2 = core.advp_add(Advp {
        node_id: NodeId::from(0x333333),
        prefix: p("2001:db8:1:101::/64"),
        priority: 1,
        link: Some(l2),
    })?;
    core.advp_update(
        pp1,
        Advp {
            node_id: NodeId::from(0x111111),
            prefix: p("2001:db8:0:101::/64"),
            priority: 3,
            link: Some(l1),
        },
    )?;
    core.advp_del(pp1);
    core.advp_del(pp2);

    settle(&mut core, &clock);
    assert_invariants(&core);

    core.dp_del(d1);
    core.link_del(l1);
    core.dp_del(d2);
    core.link_del(l2);

    assert_eq!(core.next_deadline(), None);
    Ok(())
}

/// Freed space wakes blocked siblings: with a /64 delegated prefix only
/// one of two links can hold the single /64, and deleting the winner
/// hands it to the other.
#[test]
fn unassign_reschedules_blocked_sibling() {
    let clock = FakeClock::new();
    let mut core = new_core(&clock);
    core.set_node_id(NodeId::from(1));
    core.rule_add(Box::new(
        pa::rules::RandomRule::new(2, 100, 64).unwrap().seeded(b"n1"),
    ));

    let l1 = core.link_add("L1", None);
    let l2 = core.link_add("L2", None);
    let dp = core.dp_add(p("2001:db8:0:1::/64"), "tiny", None);
    settle(&mut core, &clock);

    let a = core.ldp_info(core.ldp(l1, dp).unwrap()).unwrap();
    let b = core.ldp_info(core.ldp(l2, dp).unwrap()).unwrap();
    assert!(a.assigned ^ b.assigned, "exactly one side can win");

    let (winner, loser) = if a.assigned {
        (l1, l2)
    } else {
        (l2, l1)
    };
    core.link_del(winner);
    settle(&mut core, &clock);
    let i = core.ldp_info(core.ldp(loser, dp).unwrap()).unwrap();
    assert!(i.assigned && i.published);
    assert_eq!(i.prefix, p("2001:db8:0:1::/64"));
    assert_invariants(&core);
}
