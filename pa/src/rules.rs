// Copyright 2022 Oxide Computer Company

//! Pluggable assignment policies.
//!
//! Each routine run probes every registered rule for the best rule
//! priority it could reach on the pair, then matches them in descending
//! order; a rule is accepted only when it beats the best match seen so
//! far, and the walk stops once no remaining rule can. The winning
//! action drives the pair's next transition.

use std::collections::BTreeMap;
use std::ops::ControlFlow;

use slog::{debug, Logger};

use crate::core::{Advp, AdvpId, DpId, Entry, LdpId, LinkId, NodeId, RuleId};
use crate::entropy::RandomSource;
use crate::error::Error;
use crate::prefix::Prefix;
use crate::store::Store;
use crate::trie::Trie;

/// The strongest peer advertisement backing a pair, computed at the top of
/// every routine run.
#[derive(Debug, Clone, Copy)]
pub struct BestAssignment {
    pub advp: AdvpId,
    pub prefix: Prefix,
    pub priority: u8,
    pub node_id: NodeId,
}

/// Pair state snapshot handed to rules. `valid`, `backoff` and `best` are
/// the routine's transient view.
#[derive(Debug, Clone)]
pub struct PairCtx {
    pub ldp: LdpId,
    pub link: LinkId,
    pub dp: DpId,
    pub link_name: String,
    pub link_tag: Option<u32>,
    pub dp_name: String,
    pub dp_tag: Option<u32>,
    pub dp_prefix: Prefix,
    pub assigned: Option<Prefix>,
    pub published: bool,
    pub applied: bool,
    pub adopting: bool,
    pub valid: bool,
    pub backoff: bool,
    pub best: Option<BestAssignment>,
    pub priority: u8,
    pub rule_priority: u16,
    pub rule: Option<RuleId>,
}

/// Read access to the machinery rules may consult while matching.
pub struct RuleCtx<'a> {
    pub trie: &'a Trie<Entry>,
    pub advps: &'a BTreeMap<AdvpId, Advp>,
    pub node_id: NodeId,
    pub flooding_delay: u32,
    pub rng: &'a mut dyn RandomSource,
    pub store: Option<&'a Store>,
    pub log: &'a Logger,
}

impl RuleCtx<'_> {
    /// True iff a peer advertisement overlapping `prefix` would beat a
    /// local publication at `priority`.
    pub fn peer_blocks(&self, prefix: Prefix, priority: u8) -> bool {
        let mut blocked = false;
        self.trie.walk_updown(prefix, &mut |_, e| {
            if let Entry::Advertised(aid) = e {
                let a = &self.advps[aid];
                if a.priority > priority
                    || (a.priority == priority && a.node_id > self.node_id)
                {
                    blocked = true;
                    return ControlFlow::Break(());
                }
            }
            ControlFlow::Continue(())
        });
        blocked
    }

    /// True iff another pair's assignment overlaps `prefix`.
    pub fn assigned_elsewhere(&self, prefix: Prefix, this: LdpId) -> bool {
        let mut hit = false;
        self.trie.walk_updown(prefix, &mut |_, e| {
            if let Entry::Assigned(id) = e {
                if *id != this {
                    hit = true;
                    return ControlFlow::Break(());
                }
            }
            ControlFlow::Continue(())
        });
        hit
    }

    fn backoff_window(&mut self) -> u64 {
        let span = 2 * u64::from(self.flooding_delay);
        if span == 0 {
            0
        } else {
            u64::from(self.rng.random()) % (span + 1)
        }
    }
}

/// Outcome of a rule match. Every accepted outcome carries the rule
/// priority that competes in the match pass; zero is reserved and never
/// accepted.
#[derive(Debug, Clone, Copy)]
pub enum RuleAction {
    NoMatch,
    /// Wait before creating anything; the rule picks the delay.
    Backoff { delay: u64, rule_priority: u16 },
    /// Claim an orphaned assignment after the adoption window.
    Adopt { priority: u8, rule_priority: u16 },
    /// Assign and publish the given prefix.
    Publish {
        prefix: Prefix,
        priority: u8,
        rule_priority: u16,
    },
    /// Tear the current publication or adoption down.
    Destroy { rule_priority: u16 },
}

impl RuleAction {
    pub fn rule_priority(&self) -> Option<u16> {
        match self {
            RuleAction::NoMatch => None,
            RuleAction::Backoff { rule_priority, .. }
            | RuleAction::Adopt { rule_priority, .. }
            | RuleAction::Publish { rule_priority, .. }
            | RuleAction::Destroy { rule_priority } => Some(*rule_priority),
        }
    }
}

pub trait Rule {
    fn name(&self) -> &str;

    /// The best rule priority this rule could return for the pair, 0 when
    /// it will not match. Keep this cheap; it runs on every probe.
    fn max_priority(&self, pair: &PairCtx, ctx: &RuleCtx) -> u16;

    /// Attempt a match. `best` is the strongest rule priority accepted so
    /// far; an action that cannot beat it is discarded.
    fn evaluate(
        &mut self,
        pair: &PairCtx,
        best: u16,
        ctx: &mut RuleCtx,
    ) -> RuleAction;
}

// ---- adopt ---------------------------------------------------------------

/// Adopts an assigned, globally valid prefix that nobody advertises and
/// nobody published, instead of letting the routine destroy it.
pub struct AdoptRule {
    pub priority: u8,
    pub rule_priority: u16,
}

impl AdoptRule {
    pub fn new(priority: u8, rule_priority: u16) -> Result<Self, Error> {
        if rule_priority == 0 {
            return Err(Error::InvalidRulePriority);
        }
        Ok(Self {
            priority,
            rule_priority,
        })
    }
}

impl Rule for AdoptRule {
    fn name(&self) -> &str {
        "adopt"
    }

    fn max_priority(&self, pair: &PairCtx, _ctx: &RuleCtx) -> u16 {
        if pair.assigned.is_some()
            && !pair.published
            && pair.best.is_none()
            && pair.valid
        {
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
        RuleAction::Adopt {
            priority: self.priority,
            rule_priority: self.rule_priority,
        }
    }
}

// ---- random --------------------------------------------------------------

/// Counts, per maximal-available-prefix length, how many such prefixes the
/// delegated prefix still offers. Lengths beyond `desired_plen` cannot
/// host a desired-length assignment and are ignored.
pub fn count_available(
    trie: &Trie<Entry>,
    dp: Prefix,
    desired_plen: u8,
) -> Vec<u16> {
    let mut counts = vec![0u16; usize::from(desired_plen) + 1];
    trie.walk_available(dp, &mut |a| {
        if a.len() <= desired_plen {
            let c = &mut counts[usize::from(a.len())];
            *c = c.saturating_add(1);
        }
        ControlFlow::Continue(())
    });
    counts
}

/// Candidate subset of desired-length prefixes, accumulated from the
/// smallest available blocks upward until `set_size` candidates are in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSubset {
    /// Smallest maximal-prefix length reached by the accumulation.
    pub min_plen: u8,
    /// When the target was hit inside the `min_plen` level: how many
    /// desired-length slots of that level are in the set. Zero means the
    /// level is in wholesale.
    pub overflow: u64,
    /// Total number of candidates in the set.
    pub found: u64,
}

pub fn candidate_subset(
    counts: &[u16],
    desired_plen: u8,
    set_size: u16,
) -> CandidateSubset {
    let target = u64::from(set_size);
    let mut acc = 0u64;
    let mut min_plen = desired_plen;
    let mut overflow = 0u64;
    for p in (0..=desired_plen).rev() {
        let c = u64::from(counts[usize::from(p)]);
        if c == 0 {
            continue;
        }
        let slots = c
            .checked_shl(u32::from(desired_plen - p))
            .unwrap_or(u64::MAX);
        if acc.saturating_add(slots) >= target {
            min_plen = p;
            let take = target - acc;
            overflow = if take < slots { take } else { 0 };
            acc = target;
            break;
        }
        acc += slots;
        min_plen = p;
    }
    CandidateSubset {
        min_plen,
        overflow,
        found: acc,
    }
}

/// Picks a fresh prefix of the desired length at random when a pair has
/// nothing valid: first a creation backoff, then a handful of seeded
/// pseudo-random tentatives, then a uniform pick among the candidate
/// subset.
pub struct RandomRule {
    pub priority: u8,
    pub rule_priority: u16,
    pub desired_plen: u8,
    pub random_set_size: u16,
    pub pseudo_random_tentatives: u16,
    pub seed: Vec<u8>,
}

impl RandomRule {
    pub fn new(
        priority: u8,
        rule_priority: u16,
        desired_plen: u8,
    ) -> Result<Self, Error> {
        if rule_priority == 0 {
            return Err(Error::InvalidRulePriority);
        }
        Ok(Self {
            priority,
            rule_priority,
            desired_plen,
            random_set_size: 32,
            pseudo_random_tentatives: 10,
            seed: Vec::new(),
        })
    }

    pub fn seeded(mut self, seed: &[u8]) -> Self {
        self.seed = seed.to_vec();
        self
    }

    fn pick(&self, pair: &PairCtx, ctx: &mut RuleCtx) -> Option<Prefix> {
        let dp = pair.dp_prefix;
        if self.desired_plen < dp.len() {
            return None;
        }
        let counts = count_available(ctx.trie, dp, self.desired_plen);
        let sub =
            candidate_subset(&counts, self.desired_plen, self.random_set_size);
        if sub.found == 0 {
            return None;
        }

        for i in 0..self.pseudo_random_tentatives {
            let bytes = ctx.rng.prand(
                &self.seed,
                u32::from(i),
                u32::from(self.desired_plen),
            );
            let cand = dp
                .fill(u128::from_be_bytes(bytes), self.desired_plen);
            if let Some(avail) = ctx.trie.max_available_within(dp, cand) {
                // the containing free block must be small enough to sit in
                // the candidate subset
                if avail.len() >= sub.min_plen {
                    debug!(ctx.log, "tentative hit";
                        "prefix" => %cand, "tentative" => i);
                    return Some(cand);
                }
            }
        }

        // uniform pick of the k-th candidate, resolved against the
        // available walk
        let mut k = u64::from(ctx.rng.random()) % sub.found;
        let mut level_budget =
            if sub.overflow > 0 { sub.overflow } else { u64::MAX };
        let mut chosen = None;
        let desired = self.desired_plen;
        ctx.trie.walk_available(dp, &mut |a| {
            if a.len() > desired || a.len() < sub.min_plen {
                return ControlFlow::Continue(());
            }
            let mut cap = 1u64
                .checked_shl(u32::from(desired - a.len()))
                .unwrap_or(u64::MAX);
            if a.len() == sub.min_plen {
                if level_budget == 0 {
                    return ControlFlow::Continue(());
                }
                cap = cap.min(level_budget);
                level_budget -= cap;
            }
            if k < cap {
                let bits = (k as u128) << (128 - u32::from(desired));
                chosen = Some(Prefix::from_bits(a.bits() | bits, desired));
                return ControlFlow::Break(());
            }
            k -= cap;
            ControlFlow::Continue(())
        });
        chosen
    }
}

impl Rule for RandomRule {
    fn name(&self) -> &str {
        "random"
    }

    fn max_priority(&self, pair: &PairCtx, _ctx: &RuleCtx) -> u16 {
        if pair.best.is_none() && (!pair.valid || !pair.published) {
            self.rule_priority
        } else {
            0
        }
    }

    fn evaluate(
        &mut self,
        pair: &PairCtx,
        best: u16,
        ctx: &mut RuleCtx,
    ) -> RuleAction {
        if self.rule_priority <= best {
            return RuleAction::NoMatch;
        }
        if !pair.backoff {
            return RuleAction::Backoff {
                delay: ctx.backoff_window(),
                rule_priority: self.rule_priority,
            };
        }
        match self.pick(pair, ctx) {
            Some(prefix) => RuleAction::Publish {
                prefix,
                priority: self.priority,
                rule_priority: self.rule_priority,
            },
            None => RuleAction::NoMatch,
        }
    }
}

// ---- static --------------------------------------------------------------

/// Insists on one configured prefix. Peers advertising with a priority at
/// or above `override_priority` win; below it they are overridden. A local
/// publication is overridden only below `override_rule_priority`. With
/// `safety` unset the rule keeps publishing even against a stronger peer,
/// which can loop between nodes with symmetric configuration.
pub struct StaticRule {
    pub prefix: Prefix,
    pub priority: u8,
    pub rule_priority: u16,
    pub override_priority: u8,
    pub override_rule_priority: u16,
    pub safety: bool,
}

impl StaticRule {
    pub fn new(
        prefix: Prefix,
        priority: u8,
        rule_priority: u16,
    ) -> Result<Self, Error> {
        if rule_priority == 0 {
            return Err(Error::InvalidRulePriority);
        }
        Ok(Self {
            prefix,
            priority,
            rule_priority,
            override_priority: 0,
            override_rule_priority: 0,
            safety: true,
        })
    }
}

impl Rule for StaticRule {
    fn name(&self) -> &str {
        "static"
    }

    fn max_priority(&self, pair: &PairCtx, _ctx: &RuleCtx) -> u16 {
        if pair.dp_prefix.contains(&self.prefix) {
            self.rule_priority
        } else {
            0
        }
    }

    fn evaluate(
        &mut self,
        pair: &PairCtx,
        best: u16,
        ctx: &mut RuleCtx,
    ) -> RuleAction {
        if self.rule_priority <= best
            || !pair.dp_prefix.contains(&self.prefix)
        {
            return RuleAction::NoMatch;
        }
        let ours = pair.assigned == Some(self.prefix);
        // an existing local publication of something else may only be
        // displaced below the override rule priority
        if pair.published
            && !ours
            && pair.rule_priority >= self.override_rule_priority
        {
            return RuleAction::NoMatch;
        }
        // a peer advertising at or above the override priority cannot be
        // displaced; with safety on, decline rather than fight it
        let mut strongest: Option<u8> = None;
        ctx.trie.walk_updown(self.prefix, &mut |_, e| {
            if let Entry::Advertised(aid) = e {
                let a = &ctx.advps[aid];
                strongest = Some(strongest.map_or(a.priority, |s| s.max(a.priority)));
            }
            ControlFlow::Continue(())
        });
        if let Some(peer) = strongest {
            if self.safety && peer >= self.override_priority {
                return RuleAction::NoMatch;
            }
        }
        RuleAction::Publish {
            prefix: self.prefix,
            priority: self.priority,
            rule_priority: self.rule_priority,
        }
    }
}
