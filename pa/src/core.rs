// Copyright 2022 Oxide Computer Company

//! Entity registry and per-pair assignment state machine.
//!
//! The [`Core`] owns every record and hands out opaque ids. One
//! (Link, Delegated Prefix) pair — the LDP — exists for every combination
//! of registered links and delegated prefixes; the assignment routine
//! converges each pair to at most one assigned prefix against whatever the
//! peers advertise.
//!
//! Nothing here blocks or spawns: embedders read [`Core::next_deadline`]
//! and call [`Core::poll`] when that moment arrives. All waiting is
//! expressed through the two per-pair timers (routine debounce and the
//! multiplexed backoff slot).

use std::collections::BTreeMap;
use std::fmt;
use std::mem;
use std::ops::ControlFlow;
use std::rc::Rc;

use slog::{debug, info, o, warn, Logger};

use crate::clock::Clock;
use crate::entropy::RandomSource;
use crate::error::Error;
use crate::filters::Filter;
use crate::prefix::Prefix;
use crate::rules::{BestAssignment, PairCtx, Rule, RuleAction, RuleCtx};
use crate::store::{Store, StoreConfig};
use crate::trie::Trie;
use crate::{DEFAULT_FLOODING_DELAY, NODE_ID_LEN, RUN_DELAY};

/// Opaque node identity, compared lexicographically; the higher value wins
/// priority ties between advertisements.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeId(pub [u8; NODE_ID_LEN]);

impl From<u64> for NodeId {
    fn from(v: u64) -> Self {
        NodeId(v.to_be_bytes())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkId(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DpId(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LdpId(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AdvpId(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuleId(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UserId(pub(crate) u64);

/// Element stored in the prefix trie. Locally assigned and peer-advertised
/// prefixes share the index so one walk observes both kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    Assigned(LdpId),
    Advertised(AdvpId),
}

struct Link {
    name: String,
    tag: Option<u32>,
    ldps: Vec<LdpId>,
}

struct Dp {
    prefix: Prefix,
    name: String,
    tag: Option<u32>,
    ldps: Vec<LdpId>,
}

/// A peer's advertised prefix, as reported by the flooding layer.
#[derive(Debug, Clone)]
pub struct Advp {
    pub node_id: NodeId,
    pub prefix: Prefix,
    pub priority: u8,
    pub link: Option<LinkId>,
}

struct Ldp {
    link: LinkId,
    dp: DpId,
    assigned: bool,
    published: bool,
    applied: bool,
    adopting: bool,
    // transient, meaningful only while the routine runs
    valid: bool,
    backoff: bool,
    best: Option<BestAssignment>,
    // last assigned prefix; still readable from callbacks after assigned
    // drops back to false
    prefix: Prefix,
    priority: u8,
    rule_priority: u16,
    rule: Option<RuleId>,
    routine_at: Option<u64>,
    backoff_at: Option<u64>,
}

impl Ldp {
    fn new(link: LinkId, dp: DpId) -> Self {
        Ldp {
            link,
            dp,
            assigned: false,
            published: false,
            applied: false,
            adopting: false,
            valid: false,
            backoff: false,
            best: None,
            prefix: Prefix::ROOT,
            priority: 0,
            rule_priority: 0,
            rule: None,
            routine_at: None,
            backoff_at: None,
        }
    }
}

/// Owned snapshot of a pair, handed to user callbacks and returned by
/// [`Core::ldp_info`]. The prefix and priorities keep their last value
/// while the matching flag transitions to false.
#[derive(Debug, Clone)]
pub struct LdpInfo {
    pub ldp: LdpId,
    pub link: LinkId,
    pub dp: DpId,
    pub link_name: String,
    pub dp_prefix: Prefix,
    pub prefix: Prefix,
    pub assigned: bool,
    pub published: bool,
    pub applied: bool,
    pub adopting: bool,
    pub priority: u8,
    pub rule_priority: u16,
    pub rule: Option<RuleId>,
}

/// Subscriber notified when a pair's assigned, published or applied flag
/// changes. Callbacks are not invoked for pair creation or teardown
/// bookkeeping, only for flag transitions.
pub trait User {
    fn assigned(&mut self, _ldp: &LdpInfo) {}
    fn published(&mut self, _ldp: &LdpInfo) {}
    fn applied(&mut self, _ldp: &LdpInfo) {}
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flag {
    Assigned,
    Published,
    Applied,
}

struct RuleEntry {
    id: RuleId,
    filter: Option<Filter>,
    rule: Box<dyn Rule>,
}

enum Timer {
    Routine(LdpId),
    Backoff(LdpId),
    StoreSave,
    StoreToken,
}

pub struct Core {
    trie: Trie<Entry>,
    node_id: NodeId,
    flooding_delay: u32,
    links: BTreeMap<LinkId, Link>,
    dps: BTreeMap<DpId, Dp>,
    ldps: BTreeMap<LdpId, Ldp>,
    advps: BTreeMap<AdvpId, Advp>,
    rules: Vec<RuleEntry>,
    users: BTreeMap<UserId, Box<dyn User>>,
    store: Option<Store>,
    clock: Rc<dyn Clock>,
    rng: Box<dyn RandomSource>,
    log: Logger,
    next_id: u64,
}

impl Core {
    pub fn new(
        clock: Rc<dyn Clock>,
        rng: Box<dyn RandomSource>,
        log: Logger,
    ) -> Self {
        Core {
            trie: Trie::new(),
            node_id: NodeId::default(),
            flooding_delay: DEFAULT_FLOODING_DELAY,
            links: BTreeMap::new(),
            dps: BTreeMap::new(),
            ldps: BTreeMap::new(),
            advps: BTreeMap::new(),
            rules: Vec::new(),
            users: BTreeMap::new(),
            store: None,
            clock,
            rng,
            log,
            next_id: 1,
        }
    }

    fn alloc(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn flooding_delay(&self) -> u32 {
        self.flooding_delay
    }

    /// Changing the node id reschedules every pair: the precedence
    /// predicate depends on it.
    pub fn set_node_id(&mut self, id: NodeId) {
        if id == self.node_id {
            return;
        }
        info!(self.log, "node id changed"; "node_id" => %id);
        self.node_id = id;
        self.schedule_all();
    }

    /// Adjusts the flooding delay and rescales pending apply windows: a
    /// raise extends each deadline by twice the difference, a lowering
    /// caps the remaining wait at twice the new delay.
    pub fn set_flooding_delay(&mut self, delay: u32) -> Result<(), Error> {
        if delay >= 1 << 31 {
            return Err(Error::InvalidFloodingDelay(delay));
        }
        let old = self.flooding_delay;
        if delay == old {
            return Ok(());
        }
        let now = self.clock.now();
        for ldp in self.ldps.values_mut() {
            if !ldp.published {
                continue;
            }
            if let Some(at) = ldp.backoff_at {
                if delay > old {
                    ldp.backoff_at = Some(at + 2 * u64::from(delay - old));
                } else {
                    let cap = now + 2 * u64::from(delay);
                    if at > cap {
                        ldp.backoff_at = Some(cap);
                    }
                }
            }
        }
        self.flooding_delay = delay;
        Ok(())
    }

    // ---- links and delegated prefixes -----------------------------------

    pub fn link_add(&mut self, name: &str, tag: Option<u32>) -> LinkId {
        let id = LinkId(self.alloc());
        self.links.insert(
            id,
            Link {
                name: name.to_string(),
                tag,
                ldps: Vec::new(),
            },
        );
        let dps: Vec<DpId> = self.dps.keys().copied().collect();
        for dp in dps {
            self.ldp_create(id, dp);
        }
        debug!(self.log, "link added"; "link" => name);
        id
    }

    pub fn link_del(&mut self, link: LinkId) {
        let ldps = match self.links.get(&link) {
            Some(l) => l.ldps.clone(),
            None => return,
        };
        // public phase: users observe published, applied, assigned dropping
        // in that order on every dependent pair
        for &id in &ldps {
            self.set_flag(id, Flag::Published, false);
            self.set_flag(id, Flag::Applied, false);
            self.unassign(id);
        }
        // private phase: free the pairs without further events
        for &id in &ldps {
            self.ldp_destroy(id);
        }
        if let Some(l) = self.links.remove(&link) {
            debug!(self.log, "link removed"; "link" => l.name);
        }
    }

    /// Registers a delegated prefix the node may sub-assign. Delegated
    /// prefixes handed to one core must not overlap each other; behaviour
    /// under overlapping delegations is unspecified.
    pub fn dp_add(
        &mut self,
        prefix: Prefix,
        name: &str,
        tag: Option<u32>,
    ) -> DpId {
        let id = DpId(self.alloc());
        self.dps.insert(
            id,
            Dp {
                prefix,
                name: name.to_string(),
                tag,
                ldps: Vec::new(),
            },
        );
        let links: Vec<LinkId> = self.links.keys().copied().collect();
        for link in links {
            self.ldp_create(link, id);
        }
        debug!(self.log, "delegated prefix added";
            "dp" => name, "prefix" => %prefix);
        id
    }

    pub fn dp_del(&mut self, dp: DpId) {
        let ldps = match self.dps.get(&dp) {
            Some(d) => d.ldps.clone(),
            None => return,
        };
        for &id in &ldps {
            self.set_flag(id, Flag::Published, false);
            self.set_flag(id, Flag::Applied, false);
            self.unassign(id);
        }
        for &id in &ldps {
            self.ldp_destroy(id);
        }
        if let Some(d) = self.dps.remove(&dp) {
            debug!(self.log, "delegated prefix removed"; "dp" => d.name);
        }
    }

    fn ldp_create(&mut self, link: LinkId, dp: DpId) {
        let id = LdpId(self.alloc());
        self.ldps.insert(id, Ldp::new(link, dp));
        if let Some(l) = self.links.get_mut(&link) {
            l.ldps.push(id);
        }
        if let Some(d) = self.dps.get_mut(&dp) {
            d.ldps.push(id);
        }
        self.schedule_routine(id);
    }

    fn ldp_destroy(&mut self, id: LdpId) {
        let ldp = match self.ldps.remove(&id) {
            Some(l) => l,
            None => return,
        };
        debug_assert!(!ldp.assigned);
        if let Some(l) = self.links.get_mut(&ldp.link) {
            l.ldps.retain(|x| *x != id);
        }
        if let Some(d) = self.dps.get_mut(&ldp.dp) {
            d.ldps.retain(|x| *x != id);
        }
    }

    // ---- advertised prefixes --------------------------------------------

    /// Records a peer advertisement and reschedules every pair whose
    /// delegated prefix overlaps it.
    pub fn advp_add(&mut self, advp: Advp) -> Result<AdvpId, Error> {
        let id = AdvpId(self.alloc());
        self.trie.insert(advp.prefix, Entry::Advertised(id))?;
        debug!(self.log, "advertisement added";
            "prefix" => %advp.prefix,
            "node_id" => %advp.node_id,
            "priority" => advp.priority);
        let prefix = advp.prefix;
        self.advps.insert(id, advp);
        self.schedule_overlapping(prefix);
        Ok(id)
    }

    /// Replaces the content of a previously added advertisement.
    pub fn advp_update(&mut self, id: AdvpId, advp: Advp) -> Result<(), Error> {
        let old_prefix = match self.advps.get(&id) {
            Some(old) => old.prefix,
            None => return Ok(()),
        };
        if old_prefix != advp.prefix {
            self.trie.remove(old_prefix, Entry::Advertised(id));
            self.trie.insert(advp.prefix, Entry::Advertised(id))?;
            self.schedule_overlapping(old_prefix);
        }
        let prefix = advp.prefix;
        self.advps.insert(id, advp);
        self.schedule_overlapping(prefix);
        Ok(())
    }

    pub fn advp_del(&mut self, id: AdvpId) {
        if let Some(advp) = self.advps.remove(&id) {
            self.trie.remove(advp.prefix, Entry::Advertised(id));
            debug!(self.log, "advertisement removed";
                "prefix" => %advp.prefix, "node_id" => %advp.node_id);
            self.schedule_overlapping(advp.prefix);
        }
    }

    // ---- rules and users ------------------------------------------------

    pub fn rule_add(&mut self, rule: Box<dyn Rule>) -> RuleId {
        self.rule_insert(rule, None)
    }

    /// Adds a rule evaluated only on pairs the filter accepts.
    pub fn rule_add_filtered(
        &mut self,
        rule: Box<dyn Rule>,
        filter: Filter,
    ) -> RuleId {
        self.rule_insert(rule, Some(filter))
    }

    fn rule_insert(
        &mut self,
        rule: Box<dyn Rule>,
        filter: Option<Filter>,
    ) -> RuleId {
        let id = RuleId(self.alloc());
        debug!(self.log, "rule added"; "rule" => rule.name());
        self.rules.push(RuleEntry { id, filter, rule });
        self.schedule_all();
        id
    }

    /// Removes a rule. Pairs published through it keep their publication
    /// but lose the back-reference.
    pub fn rule_del(&mut self, id: RuleId) -> Option<Box<dyn Rule>> {
        let i = self.rules.iter().position(|r| r.id == id)?;
        let entry = self.rules.remove(i);
        for ldp in self.ldps.values_mut() {
            if ldp.rule == Some(id) {
                ldp.rule = None;
            }
        }
        self.schedule_all();
        debug!(self.log, "rule removed"; "rule" => entry.rule.name());
        Some(entry.rule)
    }

    pub fn user_register(&mut self, user: Box<dyn User>) -> UserId {
        let id = UserId(self.alloc());
        self.users.insert(id, user);
        id
    }

    pub fn user_unregister(&mut self, id: UserId) -> Option<Box<dyn User>> {
        self.users.remove(&id)
    }

    // ---- storage --------------------------------------------------------

    /// Attaches the stable-storage cache. It registers for applied
    /// notifications internally and feeds the storage rule.
    pub fn store_attach(&mut self, config: StoreConfig) {
        let log = self.log.new(o!("unit" => "store"));
        self.store = Some(Store::new(config, log));
    }

    pub fn store(&self) -> Option<&Store> {
        self.store.as_ref()
    }

    /// Points the cache at its backing file and loads it. Entries read
    /// from the file count as fresher than anything already cached.
    pub fn store_set_file(&mut self, path: &std::path::Path) -> Result<(), Error> {
        let now = self.clock.now();
        match self.store.as_mut() {
            Some(s) => s.set_file(path, now),
            None => Ok(()),
        }
    }

    /// Binds a link into the cache under its registered name, absorbing
    /// any prefixes parked on a same-named private record.
    pub fn store_link_add(&mut self, link: LinkId, max_prefixes: u32) {
        let name = match self.links.get(&link) {
            Some(l) => l.name.clone(),
            None => return,
        };
        let now = self.clock.now();
        if let Some(s) = self.store.as_mut() {
            s.link_add(link, &name, max_prefixes, now);
        }
    }

    pub fn store_link_remove(&mut self, link: LinkId) {
        if let Some(s) = self.store.as_mut() {
            s.link_remove(link);
        }
    }

    // ---- inspection -----------------------------------------------------

    pub fn ldp(&self, link: LinkId, dp: DpId) -> Option<LdpId> {
        self.ldps
            .iter()
            .find(|(_, l)| l.link == link && l.dp == dp)
            .map(|(id, _)| *id)
    }

    pub fn ldp_ids(&self) -> Vec<LdpId> {
        self.ldps.keys().copied().collect()
    }

    pub fn ldp_info(&self, id: LdpId) -> Option<LdpInfo> {
        self.ldps.get(&id)?;
        Some(self.info(id))
    }

    fn info(&self, id: LdpId) -> LdpInfo {
        let l = &self.ldps[&id];
        LdpInfo {
            ldp: id,
            link: l.link,
            dp: l.dp,
            link_name: self.links[&l.link].name.clone(),
            dp_prefix: self.dps[&l.dp].prefix,
            prefix: l.prefix,
            assigned: l.assigned,
            published: l.published,
            applied: l.applied,
            adopting: l.adopting,
            priority: l.priority,
            rule_priority: l.rule_priority,
            rule: l.rule,
        }
    }

    // ---- timers ---------------------------------------------------------

    /// Earliest pending deadline across every pair and the storage cache,
    /// if any.
    pub fn next_deadline(&self) -> Option<u64> {
        let mut best: Option<u64> = None;
        let mut take = |d: Option<u64>| {
            if let Some(d) = d {
                best = Some(match best {
                    Some(b) => b.min(d),
                    None => d,
                });
            }
        };
        for ldp in self.ldps.values() {
            take(ldp.routine_at);
            take(ldp.backoff_at);
        }
        if let Some(s) = &self.store {
            take(s.save_deadline());
            take(s.token_deadline());
        }
        best
    }

    /// Runs every timer due at the clock's current time, in deadline
    /// order.
    pub fn poll(&mut self) {
        loop {
            let now = self.clock.now();
            let due = match self.earliest_timer() {
                Some((at, t)) if at <= now => t,
                _ => break,
            };
            match due {
                Timer::Routine(id) => {
                    if let Some(l) = self.ldps.get_mut(&id) {
                        l.routine_at = None;
                    }
                    self.routine(id, false);
                }
                Timer::Backoff(id) => {
                    if let Some(l) = self.ldps.get_mut(&id) {
                        l.backoff_at = None;
                    }
                    self.backoff_expired(id);
                }
                Timer::StoreSave => {
                    if let Some(s) = self.store.as_mut() {
                        s.on_save_timer(now);
                    }
                }
                Timer::StoreToken => {
                    if let Some(s) = self.store.as_mut() {
                        s.on_token_timer(now);
                    }
                }
            }
        }
    }

    fn earliest_timer(&self) -> Option<(u64, Timer)> {
        let mut best: Option<(u64, Timer)> = None;
        let mut take = |d: Option<u64>, t: Timer| {
            if let Some(d) = d {
                match &best {
                    Some((b, _)) if *b <= d => {}
                    _ => best = Some((d, t)),
                }
            }
        };
        for (&id, ldp) in &self.ldps {
            take(ldp.routine_at, Timer::Routine(id));
            take(ldp.backoff_at, Timer::Backoff(id));
        }
        if let Some(s) = &self.store {
            take(s.save_deadline(), Timer::StoreSave);
            take(s.token_deadline(), Timer::StoreToken);
        }
        best
    }

    /// Debounced routine scheduling: arms the routine timer unless one is
    /// already pending. The routine never runs synchronously.
    fn schedule_routine(&mut self, id: LdpId) {
        let now = self.clock.now();
        if let Some(l) = self.ldps.get_mut(&id) {
            if l.routine_at.is_none() {
                l.routine_at = Some(now + RUN_DELAY);
            }
        }
    }

    fn schedule_all(&mut self) {
        let ids: Vec<LdpId> = self.ldps.keys().copied().collect();
        for id in ids {
            self.schedule_routine(id);
        }
    }

    fn schedule_overlapping(&mut self, prefix: Prefix) {
        let mut ids = Vec::new();
        for dp in self.dps.values() {
            if dp.prefix.overlaps(&prefix) {
                ids.extend_from_slice(&dp.ldps);
            }
        }
        for id in ids {
            self.schedule_routine(id);
        }
    }

    // The backoff slot is multiplexed: adoption promotion when adopting,
    // the apply window while an assigned prefix awaits installation, and
    // the creation backoff otherwise.
    fn backoff_expired(&mut self, id: LdpId) {
        let (adopting, assigned, applied) = match self.ldps.get(&id) {
            Some(l) => (l.adopting, l.assigned, l.applied),
            None => return,
        };
        if adopting {
            if let Some(l) = self.ldps.get_mut(&id) {
                l.adopting = false;
            }
            info!(self.log, "adopted"; "pair" => %self.info(id).prefix);
            self.set_flag(id, Flag::Published, true);
            let now = self.clock.now();
            if let Some(l) = self.ldps.get_mut(&id) {
                if !l.applied {
                    l.backoff_at =
                        Some(now + 2 * u64::from(self.flooding_delay));
                }
            }
        } else if assigned && !applied {
            // the apply window elapsed without contradiction, for a
            // published prefix or one accepted from a peer alike
            self.set_flag(id, Flag::Applied, true);
        } else if !assigned {
            self.routine(id, true);
        }
    }

    // ---- notifications --------------------------------------------------

    fn set_flag(&mut self, id: LdpId, flag: Flag, value: bool) {
        let changed = match self.ldps.get_mut(&id) {
            Some(l) => {
                let f = match flag {
                    Flag::Assigned => &mut l.assigned,
                    Flag::Published => &mut l.published,
                    Flag::Applied => &mut l.applied,
                };
                if *f == value {
                    false
                } else {
                    *f = value;
                    true
                }
            }
            None => false,
        };
        if changed {
            self.notify(id, flag);
        }
    }

    fn notify(&mut self, id: LdpId, flag: Flag) {
        let info = self.info(id);
        let mut users = mem::take(&mut self.users);
        for user in users.values_mut() {
            match flag {
                Flag::Assigned => user.assigned(&info),
                Flag::Published => user.published(&info),
                Flag::Applied => user.applied(&info),
            }
        }
        self.users = users;
        if flag == Flag::Applied && info.applied {
            let now = self.clock.now();
            if let Some(s) = self.store.as_mut() {
                s.cache_applied(&info, now);
            }
        }
    }

    // ---- assignment primitives ------------------------------------------

    fn assign(&mut self, id: LdpId, prefix: Prefix) -> bool {
        let l = match self.ldps.get_mut(&id) {
            Some(l) => l,
            None => return false,
        };
        if l.assigned {
            return false;
        }
        l.prefix = prefix;
        if let Err(e) = self.trie.insert(prefix, Entry::Assigned(id)) {
            warn!(self.log, "assignment conflicts in trie"; "err" => %e);
            return false;
        }
        self.set_flag(id, Flag::Assigned, true);
        true
    }

    /// Tears an assignment down: applied and published drop first (one
    /// notification per transitioning flag), the backoff timer dies, the
    /// trie entry goes away, then assigned drops. Unassigned siblings on
    /// the same delegated prefix get rescheduled since freed space may
    /// unblock them.
    fn unassign(&mut self, id: LdpId) {
        match self.ldps.get(&id) {
            Some(l) if l.assigned => {}
            _ => return,
        }
        self.set_flag(id, Flag::Applied, false);
        self.set_flag(id, Flag::Published, false);
        let (prefix, dp) = {
            let l = match self.ldps.get_mut(&id) {
                Some(l) => l,
                None => return,
            };
            l.backoff_at = None;
            l.adopting = false;
            (l.prefix, l.dp)
        };
        self.trie.remove(prefix, Entry::Assigned(id));
        debug!(self.log, "unassigned"; "prefix" => %prefix);
        self.set_flag(id, Flag::Assigned, false);

        let siblings: Vec<LdpId> = match self.dps.get(&dp) {
            Some(d) => d
                .ldps
                .iter()
                .copied()
                .filter(|s| *s != id && !self.ldps[s].assigned)
                .collect(),
            None => Vec::new(),
        };
        for s in siblings {
            self.schedule_routine(s);
        }
    }

    // ---- precedence and selection ---------------------------------------

    // Does the advertisement (priority, node_id) precede this pair's
    // current publication?
    fn precedes(&self, priority: u8, node_id: NodeId, ldp: &Ldp) -> bool {
        !ldp.published
            || priority > ldp.priority
            || (priority == ldp.priority && node_id > self.node_id)
    }

    /// The highest-precedence peer advertisement on this pair's link,
    /// contained in its delegated prefix — or None if nothing beats the
    /// current publication.
    fn best_assignment(&self, id: LdpId) -> Option<BestAssignment> {
        let l = &self.ldps[&id];
        let dp_prefix = self.dps[&l.dp].prefix;
        let mut best: Option<BestAssignment> = None;
        self.trie.walk_updown(dp_prefix, &mut |pfx, e| {
            if let Entry::Advertised(aid) = e {
                let a = &self.advps[aid];
                if a.link == Some(l.link) && dp_prefix.contains(&a.prefix) {
                    let better = match &best {
                        None => true,
                        Some(b) => {
                            (a.priority, a.node_id) > (b.priority, b.node_id)
                        }
                    };
                    if better {
                        best = Some(BestAssignment {
                            advp: *aid,
                            prefix: pfx,
                            priority: a.priority,
                            node_id: a.node_id,
                        });
                    }
                }
            }
            ControlFlow::Continue(())
        });
        let b = best?;
        if self.precedes(b.priority, b.node_id, l) {
            Some(b)
        } else {
            None
        }
    }

    // A currently assigned pair is globally valid iff no advertisement
    // overlapping its prefix — on any link — precedes it.
    fn globally_valid(&self, id: LdpId) -> bool {
        let l = &self.ldps[&id];
        let mut ok = true;
        self.trie.walk_updown(l.prefix, &mut |_, e| {
            if let Entry::Advertised(aid) = e {
                let a = &self.advps[aid];
                if self.precedes(a.priority, a.node_id, l) {
                    ok = false;
                    return ControlFlow::Break(());
                }
            }
            ControlFlow::Continue(())
        });
        ok
    }

    // ---- the routine ----------------------------------------------------

    fn routine(&mut self, id: LdpId, backoff: bool) {
        if !self.ldps.contains_key(&id) {
            return;
        }
        let best = self.best_assignment(id);
        let assigned = self.ldps[&id].assigned;
        let valid = assigned
            && match &best {
                Some(b) => self.ldps[&id].prefix == b.prefix,
                None => self.globally_valid(id),
            };
        if let Some(l) = self.ldps.get_mut(&id) {
            l.best = best;
            l.valid = valid;
            l.backoff = backoff;
        }

        // an invalid assignment goes away before anything else happens
        if assigned && !valid {
            self.unassign(id);
        }

        // the preceding peer takes publication over; the prefix itself
        // stays (and stays applied) since it matches
        {
            let l = &self.ldps[&id];
            if l.assigned && l.best.is_some() && l.published {
                self.set_flag(id, Flag::Published, false);
            }
        }

        // accept the best assignment's prefix
        let accept = {
            let l = &self.ldps[&id];
            if !l.assigned {
                l.best
            } else {
                None
            }
        };
        if let Some(b) = accept {
            if self.assign(id, b.prefix) {
                info!(self.log, "accepted peer assignment";
                    "prefix" => %b.prefix, "node_id" => %b.node_id);
                let now = self.clock.now();
                let delay = 2 * u64::from(self.flooding_delay);
                if let Some(l) = self.ldps.get_mut(&id) {
                    if !l.applied {
                        l.backoff_at = Some(now + delay);
                    }
                }
            }
        }

        // let the rules speak
        if let Some((action, rule)) = self.rule_pass(id) {
            self.apply_rule_action(id, action, rule);
        }

        // an orphan nobody adopted and no peer backs has to go
        {
            let l = &self.ldps[&id];
            if l.assigned && !l.published && !l.adopting && l.best.is_none() {
                self.unassign(id);
            }
        }

        if let Some(l) = self.ldps.get_mut(&id) {
            l.best = None;
            l.valid = false;
            l.backoff = false;
        }
    }

    fn pair_ctx(&self, id: LdpId) -> PairCtx {
        let l = &self.ldps[&id];
        let link = &self.links[&l.link];
        let dp = &self.dps[&l.dp];
        PairCtx {
            ldp: id,
            link: l.link,
            dp: l.dp,
            link_name: link.name.clone(),
            link_tag: link.tag,
            dp_name: dp.name.clone(),
            dp_tag: dp.tag,
            dp_prefix: dp.prefix,
            assigned: l.assigned.then_some(l.prefix),
            published: l.published,
            applied: l.applied,
            adopting: l.adopting,
            valid: l.valid,
            backoff: l.backoff,
            best: l.best,
            priority: l.priority,
            rule_priority: l.rule_priority,
            rule: l.rule,
        }
    }

    // Two-step rule protocol: probe every rule for the best priority it
    // could reach, then match in descending order until no remaining rule
    // can beat the best accepted match.
    fn rule_pass(&mut self, id: LdpId) -> Option<(RuleAction, RuleId)> {
        if self.rules.is_empty() {
            return None;
        }
        let mut rules = mem::take(&mut self.rules);
        let pair = self.pair_ctx(id);
        let mut ctx = RuleCtx {
            trie: &self.trie,
            advps: &self.advps,
            node_id: self.node_id,
            flooding_delay: self.flooding_delay,
            rng: &mut *self.rng,
            store: self.store.as_ref(),
            log: &self.log,
        };

        let mut probes: Vec<(usize, u16)> = Vec::new();
        for (i, entry) in rules.iter().enumerate() {
            if let Some(f) = &entry.filter {
                if !f.accepts(&pair) {
                    continue;
                }
            }
            let mp = entry.rule.max_priority(&pair, &ctx);
            if mp > 0 {
                probes.push((i, mp));
            }
        }
        // stable sort keeps registration order between equal probes
        probes.sort_by(|a, b| b.1.cmp(&a.1));

        let mut best_prio: u16 = 0;
        let mut winner: Option<(RuleAction, RuleId)> = None;
        for (i, mp) in probes {
            if mp <= best_prio {
                break;
            }
            let action = rules[i].rule.evaluate(&pair, best_prio, &mut ctx);
            if let Some(rp) = action.rule_priority() {
                if rp > best_prio {
                    best_prio = rp;
                    winner = Some((action, rules[i].id));
                }
            }
        }
        self.rules = rules;
        winner
    }

    fn apply_rule_action(&mut self, id: LdpId, action: RuleAction, rule: RuleId) {
        match action {
            RuleAction::NoMatch => {}
            RuleAction::Backoff { delay, .. } => {
                let now = self.clock.now();
                if let Some(l) = self.ldps.get_mut(&id) {
                    if !l.assigned {
                        l.backoff_at = Some(now + delay);
                    }
                }
            }
            RuleAction::Adopt {
                priority,
                rule_priority,
            } => {
                let ok = match self.ldps.get(&id) {
                    Some(l) => l.assigned && !l.published && l.best.is_none(),
                    None => false,
                };
                if !ok {
                    return;
                }
                let window = 2 * u64::from(self.flooding_delay);
                let jitter = if window == 0 {
                    0
                } else {
                    u64::from(self.rng.random()) % (window + 1)
                };
                let now = self.clock.now();
                if let Some(l) = self.ldps.get_mut(&id) {
                    l.adopting = true;
                    l.priority = priority;
                    l.rule_priority = rule_priority;
                    l.rule = Some(rule);
                    l.backoff_at = Some(now + jitter);
                }
                debug!(self.log, "adopting"; "prefix" => %self.ldps[&id].prefix);
            }
            RuleAction::Publish {
                prefix,
                priority,
                rule_priority,
            } => {
                let dp = match self.ldps.get(&id) {
                    Some(l) => l.dp,
                    None => return,
                };
                if !self.dps[&dp].prefix.contains(&prefix) {
                    warn!(self.log, "rule proposed a prefix outside the dp";
                        "prefix" => %prefix);
                    return;
                }
                {
                    let l = &self.ldps[&id];
                    if l.assigned && l.prefix != prefix {
                        self.unassign(id);
                    }
                }
                if !self.ldps[&id].assigned && !self.assign(id, prefix) {
                    return;
                }
                if let Some(l) = self.ldps.get_mut(&id) {
                    l.priority = priority;
                    l.rule_priority = rule_priority;
                    l.rule = Some(rule);
                    l.adopting = false;
                }
                self.set_flag(id, Flag::Published, true);
                let now = self.clock.now();
                let delay = 2 * u64::from(self.flooding_delay);
                if let Some(l) = self.ldps.get_mut(&id) {
                    l.backoff_at =
                        if l.applied { None } else { Some(now + delay) };
                }
                info!(self.log, "published"; "prefix" => %prefix,
                    "priority" => priority, "rule_priority" => rule_priority);
            }
            RuleAction::Destroy { .. } => {
                let ok = match self.ldps.get(&id) {
                    Some(l) => l.published || l.adopting,
                    None => false,
                };
                if ok {
                    self.unassign(id);
                }
            }
        }
    }
}
