// Copyright 2022 Oxide Computer Company

//! End-to-end convergence scenarios driven through the virtual clock.

use std::cell::Cell;
use std::rc::Rc;

use pa::core::{Advp, NodeId};
use pa::rules::{
    AdoptRule, PairCtx, RandomRule, Rule, RuleAction, RuleCtx, StaticRule,
};
use pa::RUN_DELAY;

use crate::harness::*;

fn advp(node: u64, prefix: &str, priority: u8, link: Option<pa::core::LinkId>) -> Advp {
    Advp {
        node_id: NodeId::from(node),
        prefix: p(prefix),
        priority,
        link,
    }
}

/// A single peer advertisement on our link is accepted, installed after
/// the apply window, and never published locally.
#[test]
fn s1_passive_accept() {
    let clock = FakeClock::new();
    let mut core = new_core(&clock);
    core.set_node_id(NodeId::from(1));

    let l1 = core.link_add("L1", None);
    let dp = core.dp_add(p("2001:db8::/56"), "dp1", None);
    core.advp_add(advp(2, "2001:db8:0:1::/64", 2, Some(l1))).unwrap();

    let ldp = core.ldp(l1, dp).unwrap();

    // the prefix is accepted at the routine run but applies only after a
    // full quiet period of twice the flooding delay
    run_until(&mut core, &clock, RUN_DELAY + 2 * 10_000 - 1);
    let i = core.ldp_info(ldp).unwrap();
    assert!(i.assigned && !i.applied);

    run_until(&mut core, &clock, RUN_DELAY + 2 * 10_000);
    let i = core.ldp_info(ldp).unwrap();
    assert!(i.assigned);
    assert!(i.applied);
    assert!(!i.published);
    assert_eq!(i.prefix, p("2001:db8:0:1::/64"));
    assert_invariants(&core);
}

/// Between equal-priority peers the higher node id wins.
#[test]
fn s2_tie_break_by_node_id() {
    let clock = FakeClock::new();
    let mut core = new_core(&clock);
    core.set_node_id(NodeId::from(1));

    let l1 = core.link_add("L1", None);
    let dp = core.dp_add(p("2001:db8::/56"), "dp1", None);
    core.advp_add(advp(2, "2001:db8:0:2::/64", 3, Some(l1))).unwrap();
    core.advp_add(advp(3, "2001:db8:0:3::/64", 3, Some(l1))).unwrap();

    settle(&mut core, &clock);
    let i = core.ldp_info(core.ldp(l1, dp).unwrap()).unwrap();
    assert!(i.assigned && i.applied && !i.published);
    assert_eq!(i.prefix, p("2001:db8:0:3::/64"));
    assert_invariants(&core);
}

/// A stronger advertisement for a different sub-prefix tears the old
/// acceptance down and the new prefix re-applies after another window.
#[test]
fn s3_preemption() {
    let clock = FakeClock::new();
    let mut core = new_core(&clock);
    core.set_node_id(NodeId::from(1));

    let l1 = core.link_add("L1", None);
    let dp = core.dp_add(p("2001:db8::/56"), "dp1", None);
    let ldp_id;
    core.advp_add(advp(2, "2001:db8:0:1::/64", 2, Some(l1))).unwrap();
    settle(&mut core, &clock);
    ldp_id = core.ldp(l1, dp).unwrap();
    assert!(core.ldp_info(ldp_id).unwrap().applied);

    let (rec, events) = Recorder::new();
    core.user_register(Box::new(rec));

    core.advp_add(advp(2, "2001:db8:0:7::/64", 3, Some(l1))).unwrap();
    settle(&mut core, &clock);

    let i = core.ldp_info(ldp_id).unwrap();
    assert!(i.assigned && i.applied && !i.published);
    assert_eq!(i.prefix, p("2001:db8:0:7::/64"));

    let seen: Vec<(Kind, bool)> = events
        .borrow()
        .iter()
        .map(|e| (e.kind, e.value))
        .collect();
    assert_eq!(
        seen,
        vec![
            (Kind::Applied, false),
            (Kind::Assigned, false),
            (Kind::Assigned, true),
            (Kind::Applied, true),
        ]
    );
    assert_invariants(&core);
}

/// When the backing advertisement vanishes and nothing adopts, the orphan
/// is destroyed.
#[test]
fn orphan_without_adopt_rule_is_destroyed() {
    let clock = FakeClock::new();
    let mut core = new_core(&clock);
    core.set_node_id(NodeId::from(1));

    let l1 = core.link_add("L1", None);
    let dp = core.dp_add(p("2001:db8::/56"), "dp1", None);
    let a = core.advp_add(advp(2, "2001:db8:0:1::/64", 2, Some(l1))).unwrap();
    settle(&mut core, &clock);

    core.advp_del(a);
    settle(&mut core, &clock);
    let i = core.ldp_info(core.ldp(l1, dp).unwrap()).unwrap();
    assert!(!i.assigned);
    assert_invariants(&core);
}

/// With the adopt rule in place the orphan survives and gets published
/// under the rule's priorities.
#[test]
fn adopt_rule_claims_orphan() {
    let clock = FakeClock::new();
    let mut core = new_core(&clock);
    core.set_node_id(NodeId::from(1));
    core.rule_add(Box::new(AdoptRule::new(5, 50).unwrap()));

    let l1 = core.link_add("L1", None);
    let dp = core.dp_add(p("2001:db8::/56"), "dp1", None);
    let a = core.advp_add(advp(2, "2001:db8:0:1::/64", 2, Some(l1))).unwrap();
    settle(&mut core, &clock);

    core.advp_del(a);
    settle(&mut core, &clock);
    let i = core.ldp_info(core.ldp(l1, dp).unwrap()).unwrap();
    assert!(i.assigned && i.published && i.applied);
    assert_eq!(i.prefix, p("2001:db8:0:1::/64"));
    assert_eq!(i.priority, 5);
    assert_eq!(i.rule_priority, 50);
    assert_invariants(&core);
}

/// With nothing advertised the random rule backs off, then publishes a
/// desired-length prefix inside the delegated prefix.
#[test]
fn random_rule_converges() {
    let clock = FakeClock::new();
    let mut core = new_core(&clock);
    core.set_node_id(NodeId::from(1));
    core.rule_add(Box::new(
        RandomRule::new(2, 100, 64).unwrap().seeded(b"node-1"),
    ));

    let l1 = core.link_add("L1", None);
    let dp = core.dp_add(p("2001:db8::/56"), "dp1", None);
    settle(&mut core, &clock);

    let i = core.ldp_info(core.ldp(l1, dp).unwrap()).unwrap();
    assert!(i.assigned && i.published && i.applied);
    assert_eq!(i.prefix.len(), 64);
    assert!(i.dp_prefix.contains(&i.prefix));
    assert_eq!(i.priority, 2);
    assert_eq!(i.rule_priority, 100);
    assert_invariants(&core);
}

/// Two links under one delegated prefix pick disjoint prefixes.
#[test]
fn random_rule_two_links_disjoint() {
    let clock = FakeClock::new();
    let mut core = new_core(&clock);
    core.set_node_id(NodeId::from(1));
    core.rule_add(Box::new(
        RandomRule::new(2, 100, 64).unwrap().seeded(b"node-1"),
    ));

    let l1 = core.link_add("L1", None);
    let l2 = core.link_add("L2", None);
    let dp = core.dp_add(p("2001:db8::/56"), "dp1", None);
    settle(&mut core, &clock);

    let a = core.ldp_info(core.ldp(l1, dp).unwrap()).unwrap();
    let b = core.ldp_info(core.ldp(l2, dp).unwrap()).unwrap();
    assert!(a.assigned && b.assigned);
    assert!(!a.prefix.overlaps(&b.prefix));
    assert_invariants(&core);
}

struct CountingRule {
    calls: Rc<Cell<usize>>,
}

impl Rule for CountingRule {
    fn name(&self) -> &str {
        "counting"
    }

    fn max_priority(&self, _pair: &PairCtx, _ctx: &RuleCtx) -> u16 {
        self.calls.set(self.calls.get() + 1);
        0
    }

    fn evaluate(
        &mut self,
        _pair: &PairCtx,
        _best: u16,
        _ctx: &mut RuleCtx,
    ) -> RuleAction {
        RuleAction::NoMatch
    }
}

/// Any number of advertisement updates inside the debounce window fold
/// into a single routine run.
#[test]
fn debounced_routine_runs_once() {
    let clock = FakeClock::new();
    let mut core = new_core(&clock);
    core.set_node_id(NodeId::from(1));
    let calls = Rc::new(Cell::new(0usize));
    core.rule_add(Box::new(CountingRule {
        calls: calls.clone(),
    }));

    let l1 = core.link_add("L1", None);
    core.dp_add(p("2001:db8::/56"), "dp1", None);
    let a = core.advp_add(advp(2, "2001:db8:0:1::/64", 2, Some(l1))).unwrap();
    settle(&mut core, &clock);

    calls.set(0);
    for _ in 0..5 {
        core.advp_update(a, advp(2, "2001:db8:0:1::/64", 2, Some(l1)))
            .unwrap();
    }
    settle(&mut core, &clock);
    assert_eq!(calls.get(), 1);
}

/// Raising the flooding delay pushes a pending apply window out by twice
/// the difference; lowering it caps the remainder.
#[test]
fn flooding_delay_rescales_apply_window() {
    let clock = FakeClock::new();
    let mut core = new_core(&clock);
    core.set_node_id(NodeId::from(1));
    let rule = StaticRule::new(p("2001:db8:0:5::/64"), 4, 200).unwrap();
    core.rule_add(Box::new(rule));

    core.link_add("L1", None);
    core.dp_add(p("2001:db8::/56"), "dp1", None);

    // run just the routine: the publication is in, the apply window pends
    run_until(&mut core, &clock, RUN_DELAY);
    assert_eq!(core.next_deadline(), Some(RUN_DELAY + 20_000));

    core.set_flooding_delay(12_000).unwrap();
    assert_eq!(core.next_deadline(), Some(RUN_DELAY + 24_000));

    core.set_flooding_delay(1_000).unwrap();
    assert_eq!(core.next_deadline(), Some(RUN_DELAY + 2_000));

    settle(&mut core, &clock);
    assert_invariants(&core);
}

/// A node id change reschedules the routine everywhere.
#[test]
fn node_id_change_reschedules() {
    let clock = FakeClock::new();
    let mut core = new_core(&clock);
    core.set_node_id(NodeId::from(1));

    let l1 = core.link_add("L1", None);
    core.dp_add(p("2001:db8::/56"), "dp1", None);
    core.advp_add(advp(2, "2001:db8:0:1::/64", 2, Some(l1))).unwrap();
    settle(&mut core, &clock);
    assert_eq!(core.next_deadline(), None);

    core.set_node_id(NodeId::from(4));
    assert!(core.next_deadline().is_some());
    settle(&mut core, &clock);
    assert_invariants(&core);
}

/// The flooding delay must fit the doubled 32-bit arithmetic.
#[test]
fn flooding_delay_range_checked() {
    let clock = FakeClock::new();
    let mut core = new_core(&clock);
    assert!(core.set_flooding_delay(1 << 31).is_err());
    assert!(core.set_flooding_delay((1 << 31) - 1).is_ok());
}

/// A filtered rule only fires on the pairs its filter accepts; removing
/// it clears the back-reference but keeps the publication alive.
#[test]
fn filtered_rule_scope_and_removal() {
    let clock = FakeClock::new();
    let mut core = new_core(&clock);
    core.set_node_id(NodeId::from(1));

    let l1 = core.link_add("L1", None);
    let l2 = core.link_add("L2", None);
    let dp = core.dp_add(p("2001:db8::/56"), "dp1", None);
    let rid = core.rule_add_filtered(
        Box::new(StaticRule::new(p("2001:db8:0:5::/64"), 4, 200).unwrap()),
        pa::filters::Filter::Basic {
            link: Some(l1),
            dp: None,
        },
    );
    settle(&mut core, &clock);

    let a = core.ldp_info(core.ldp(l1, dp).unwrap()).unwrap();
    let b = core.ldp_info(core.ldp(l2, dp).unwrap()).unwrap();
    assert!(a.published);
    assert_eq!(a.rule, Some(rid));
    assert!(!b.assigned, "the filter keeps the rule off the other link");

    core.rule_del(rid);
    settle(&mut core, &clock);
    let a = core.ldp_info(core.ldp(l1, dp).unwrap()).unwrap();
    assert!(a.published, "publication outlives its rule");
    assert_eq!(a.rule, None);
    assert_invariants(&core);
}

struct DestroyRule {
    armed: Rc<Cell<bool>>,
    rule_priority: u16,
}

impl Rule for DestroyRule {
    fn name(&self) -> &str {
        "destroy"
    }

    fn max_priority(&self, pair: &PairCtx, _ctx: &RuleCtx) -> u16 {
        if self.armed.get() && (pair.published || pair.adopting) {
            self.rule_priority
        } else {
            0
        }
    }

    fn evaluate(
        &mut self,
        _pair: &PairCtx,
        best: u16,
        _ctx: &mut RuleCtx,
    ) -> RuleAction {
        if self.rule_priority <= best {
            return RuleAction::NoMatch;
        }
        RuleAction::Destroy {
            rule_priority: self.rule_priority,
        }
    }
}

/// A destroy outcome from a higher-priority rule tears the publication
/// down entirely.
#[test]
fn destroy_action_unassigns() {
    let clock = FakeClock::new();
    let mut core = new_core(&clock);
    core.set_node_id(NodeId::from(1));

    let armed = Rc::new(Cell::new(false));
    let rule = StaticRule::new(p("2001:db8:0:5::/64"), 4, 200).unwrap();
    core.rule_add(Box::new(rule));
    core.rule_add(Box::new(DestroyRule {
        armed: armed.clone(),
        rule_priority: 300,
    }));

    let l1 = core.link_add("L1", None);
    let dp = core.dp_add(p("2001:db8::/56"), "dp1", None);
    settle(&mut core, &clock);
    assert!(core.ldp_info(core.ldp(l1, dp).unwrap()).unwrap().published);

    armed.set(true);
    core.set_node_id(NodeId::from(2));
    settle(&mut core, &clock);
    let i = core.ldp_info(core.ldp(l1, dp).unwrap()).unwrap();
    assert!(!i.assigned && !i.published && !i.applied);
    assert_invariants(&core);
}
