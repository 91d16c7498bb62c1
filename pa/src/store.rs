// Copyright 2022 Oxide Computer Company

//! Stable-storage cache: remembers which prefixes were applied on which
//! link so later runs can favour them over fresh random picks.
//!
//! The cache keeps one MRU list of (link, prefix) entries; the per-link
//! order is the global order restricted to that link, since inserts and
//! touches move an entry to the front of both. Persistence is a plain
//! text file, written oldest to newest so a subsequent load reproduces
//! the order, behind a save debounce and a small write-token bucket.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use slog::{debug, info, warn, Logger};

use crate::core::{LdpInfo, LinkId};
use crate::error::Error;
use crate::prefix::Prefix;
use crate::rules::{PairCtx, Rule, RuleAction, RuleCtx};

/// Write-token bucket bounds.
pub const WTOKENS_MAX: u32 = 10;
pub const WTOKENS_DEFAULT: u32 = 10;

const BANNER: &str = "# Prefix assignment stable storage.\n\
                      # Downstream prefixes are listed from oldest to most recently used.\n";

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Global cap on cached prefixes; 0 means unlimited.
    pub max_prefixes: u32,
    /// Debounce between a cache change and the write attempt.
    pub save_delay: u64,
    /// Time between write-token refills.
    pub token_delay: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            max_prefixes: 128,
            save_delay: 10_000,
            token_delay: 300_000,
        }
    }
}

struct StoreLink {
    link: Option<LinkId>,
    name: String,
    /// Per-link cap; 0 means unlimited.
    max_prefixes: u32,
    count: u32,
}

struct CachedPrefix {
    slot: u64,
    prefix: Prefix,
}

pub struct Store {
    links: BTreeMap<u64, StoreLink>,
    next_slot: u64,
    /// Newest first.
    entries: Vec<CachedPrefix>,
    max_prefixes: u32,
    filepath: Option<PathBuf>,
    dirty: bool,
    tokens: u32,
    save_delay: u64,
    token_delay: u64,
    save_at: Option<u64>,
    token_at: Option<u64>,
    log: Logger,
}

impl Store {
    pub fn new(config: StoreConfig, log: Logger) -> Self {
        Store {
            links: BTreeMap::new(),
            next_slot: 1,
            entries: Vec::new(),
            max_prefixes: config.max_prefixes,
            filepath: None,
            dirty: false,
            tokens: WTOKENS_DEFAULT,
            save_delay: config.save_delay,
            token_delay: config.token_delay,
            save_at: None,
            token_at: None,
            log,
        }
    }

    // ---- inspection -----------------------------------------------------

    pub fn n_prefixes(&self) -> usize {
        self.entries.len()
    }

    /// Every cached (link name, prefix), newest first.
    pub fn cached(&self) -> Vec<(String, Prefix)> {
        self.entries
            .iter()
            .map(|e| (self.links[&e.slot].name.clone(), e.prefix))
            .collect()
    }

    /// Cached prefixes of a bound link, newest first.
    pub fn prefixes_for_link(&self, link: LinkId) -> Vec<Prefix> {
        match self.slot_of_link(link) {
            Some(slot) => self
                .entries
                .iter()
                .filter(|e| e.slot == slot)
                .map(|e| e.prefix)
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn save_deadline(&self) -> Option<u64> {
        self.save_at
    }

    pub fn token_deadline(&self) -> Option<u64> {
        self.token_at
    }

    fn slot_of_link(&self, link: LinkId) -> Option<u64> {
        self.links
            .iter()
            .find(|(_, l)| l.link == Some(link))
            .map(|(s, _)| *s)
    }

    fn slot_of_name(&self, name: &str) -> Option<u64> {
        self.links
            .iter()
            .find(|(_, l)| l.name == name)
            .map(|(s, _)| *s)
    }

    // ---- link registration ----------------------------------------------

    /// Binds a core link into the cache. Prefixes parked on a same-named
    /// private record are adopted, freshest kept within the new cap.
    pub fn link_add(
        &mut self,
        link: LinkId,
        name: &str,
        max_prefixes: u32,
        now: u64,
    ) {
        let slot = match self.slot_of_name(name) {
            Some(slot) => slot,
            None => self.slot_create(name),
        };
        if let Some(l) = self.links.get_mut(&slot) {
            l.link = Some(link);
            l.max_prefixes = max_prefixes;
        }
        self.enforce_link_cap(slot, now);
        self.enforce_global_cap(now);
    }

    /// Unbinds a link. Surviving prefixes stay parked on a private record
    /// under the link's storage name.
    pub fn link_remove(&mut self, link: LinkId) {
        let slot = match self.slot_of_link(link) {
            Some(s) => s,
            None => return,
        };
        let empty = match self.links.get(&slot) {
            Some(l) => l.count == 0,
            None => return,
        };
        if empty {
            self.links.remove(&slot);
        } else if let Some(l) = self.links.get_mut(&slot) {
            l.link = None;
            l.max_prefixes = 0;
        }
    }

    fn slot_create(&mut self, name: &str) -> u64 {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.links.insert(
            slot,
            StoreLink {
                link: None,
                name: name.to_string(),
                max_prefixes: 0,
                count: 0,
            },
        );
        slot
    }

    // ---- caching --------------------------------------------------------

    /// Applied-notification hook: remembers the prefix under the pair's
    /// link name, parking it on a private record when the link is not
    /// registered here.
    pub(crate) fn cache_applied(&mut self, info: &LdpInfo, now: u64) {
        let slot = match self.slot_of_link(info.link) {
            Some(s) => s,
            None => match self.slot_of_name(&info.link_name) {
                Some(s) => s,
                None => self.slot_create(&info.link_name),
            },
        };
        self.cache(slot, info.prefix, now);
    }

    fn cache(&mut self, slot: u64, prefix: Prefix, now: u64) {
        if let Some(i) = self
            .entries
            .iter()
            .position(|e| e.slot == slot && e.prefix == prefix)
        {
            if i != 0 {
                let e = self.entries.remove(i);
                self.entries.insert(0, e);
            }
            self.mark_dirty(now);
            return;
        }
        self.entries.insert(0, CachedPrefix { slot, prefix });
        if let Some(l) = self.links.get_mut(&slot) {
            l.count += 1;
        }
        self.enforce_link_cap(slot, now);
        self.enforce_global_cap(now);
        self.mark_dirty(now);
    }

    fn enforce_link_cap(&mut self, slot: u64, now: u64) {
        loop {
            let over = match self.links.get(&slot) {
                Some(l) => l.max_prefixes != 0 && l.count > l.max_prefixes,
                None => false,
            };
            if !over {
                break;
            }
            let oldest = self
                .entries
                .iter()
                .rposition(|e| e.slot == slot);
            match oldest {
                Some(i) => self.uncache(i, now),
                None => break,
            }
        }
    }

    fn enforce_global_cap(&mut self, now: u64) {
        while self.max_prefixes != 0
            && self.entries.len() > self.max_prefixes as usize
        {
            self.uncache(self.entries.len() - 1, now);
        }
    }

    fn uncache(&mut self, index: usize, now: u64) {
        let e = self.entries.remove(index);
        let drop_slot = match self.links.get_mut(&e.slot) {
            Some(l) => {
                l.count -= 1;
                l.count == 0 && l.link.is_none()
            }
            None => false,
        };
        if drop_slot {
            self.links.remove(&e.slot);
        }
        self.mark_dirty(now);
    }

    fn mark_dirty(&mut self, now: u64) {
        self.dirty = true;
        if self.save_at.is_none() {
            self.save_at = Some(now + self.save_delay);
        }
    }

    // ---- persistence ----------------------------------------------------

    /// Points the cache at its backing file and loads it. Loaded entries
    /// count as fresher than anything already cached.
    pub fn set_file(&mut self, path: &Path, now: u64) -> Result<(), Error> {
        self.filepath = Some(path.to_path_buf());
        let had_entries = !self.entries.is_empty();
        let r = self.load(now);
        if had_entries {
            // the merged cache differs from what the file holds
            self.mark_dirty(now);
        }
        r
    }

    fn load(&mut self, now: u64) -> Result<(), Error> {
        let path = match &self.filepath {
            Some(p) => p.clone(),
            None => return Ok(()),
        };
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(self.log, "no storage file yet";
                    "path" => %path.display());
                return Ok(());
            }
            Err(e) => {
                warn!(self.log, "storage read failed";
                    "path" => %path.display(), "err" => %e);
                return Err(Error::Io(e));
            }
        };
        let mut rejected = 0usize;
        for (lineno, line) in text.lines().enumerate() {
            let t = line.trim();
            if t.is_empty() || t.starts_with('#') {
                continue;
            }
            match self.parse_line(t) {
                Some((name, prefix)) => {
                    let slot = match self.slot_of_name(&name) {
                        Some(s) => s,
                        None => self.slot_create(&name),
                    };
                    self.cache(slot, prefix, now);
                }
                None => {
                    warn!(self.log, "bad storage line";
                        "line" => lineno + 1, "content" => t);
                    rejected += 1;
                }
            }
        }
        // loading alone does not dirty the cache
        if rejected == 0 {
            self.dirty = false;
            self.save_at = None;
        }
        info!(self.log, "storage loaded";
            "path" => %path.display(), "prefixes" => self.entries.len());
        if rejected > 0 {
            Err(Error::StorageParse { rejected })
        } else {
            Ok(())
        }
    }

    fn parse_line(&self, line: &str) -> Option<(String, Prefix)> {
        let mut it = line.split_whitespace();
        if it.next()? != "prefix" {
            return None;
        }
        let name = it.next()?;
        let prefix: Prefix = it.next()?.parse().ok()?;
        if it.next().is_some() {
            return None;
        }
        Some((name.to_string(), prefix))
    }

    fn write_file(&self) -> Result<(), Error> {
        let path = match &self.filepath {
            Some(p) => p,
            None => return Ok(()),
        };
        let f = fs::File::create(path)?;
        let mut w = BufWriter::new(f);
        w.write_all(BANNER.as_bytes())?;
        for e in self.entries.iter().rev() {
            writeln!(w, "prefix {} {}", self.links[&e.slot].name, e.prefix)?;
        }
        w.flush()?;
        Ok(())
    }

    // ---- timers ---------------------------------------------------------

    pub(crate) fn on_save_timer(&mut self, now: u64) {
        self.save_at = None;
        if self.dirty {
            self.try_save(now);
        }
    }

    pub(crate) fn on_token_timer(&mut self, now: u64) {
        self.token_at = None;
        if self.tokens < WTOKENS_MAX {
            self.tokens += 1;
            if self.tokens < WTOKENS_MAX {
                self.token_at = Some(now + self.token_delay);
            }
        }
        // a save starved of tokens is still pending
        if self.dirty && self.save_at.is_none() {
            self.try_save(now);
        }
    }

    fn try_save(&mut self, now: u64) {
        if self.tokens == 0 {
            debug!(self.log, "save deferred, no write token");
            return;
        }
        self.tokens -= 1;
        if self.token_at.is_none() {
            self.token_at = Some(now + self.token_delay);
        }
        match self.write_file() {
            Ok(()) => {
                self.dirty = false;
                info!(self.log, "storage saved";
                    "prefixes" => self.entries.len());
            }
            Err(e) => {
                warn!(self.log, "storage save failed"; "err" => %e);
                // keep dirty; retry after another debounce
                self.save_at = Some(now + self.save_delay);
            }
        }
    }
}

// ---- storage rule --------------------------------------------------------

/// Proposes the most recently applied cached prefix for the pair's link,
/// skipping entries that no longer fit the delegated prefix or that a
/// stronger peer or another pair already claims.
pub struct StoreRule {
    pub priority: u8,
    pub rule_priority: u16,
}

impl StoreRule {
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

impl Rule for StoreRule {
    fn name(&self) -> &str {
        "storage"
    }

    fn max_priority(&self, pair: &PairCtx, ctx: &RuleCtx) -> u16 {
        let has_cached = ctx
            .store
            .map(|s| !s.prefixes_for_link(pair.link).is_empty())
            .unwrap_or(false);
        if has_cached && pair.assigned.is_none() && pair.best.is_none() {
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
        if self.rule_priority <= best || pair.assigned.is_some() {
            return RuleAction::NoMatch;
        }
        if !pair.backoff {
            let span = 2 * u64::from(ctx.flooding_delay);
            let delay = if span == 0 {
                0
            } else {
                u64::from(ctx.rng.random()) % (span + 1)
            };
            return RuleAction::Backoff {
                delay,
                rule_priority: self.rule_priority,
            };
        }
        let candidates = match ctx.store {
            Some(s) => s.prefixes_for_link(pair.link),
            None => return RuleAction::NoMatch,
        };
        for prefix in candidates {
            if !pair.dp_prefix.contains(&prefix) {
                continue;
            }
            if ctx.peer_blocks(prefix, self.priority) {
                continue;
            }
            if ctx.assigned_elsewhere(prefix, pair.ldp) {
                continue;
            }
            return RuleAction::Publish {
                prefix,
                priority: self.priority,
                rule_priority: self.rule_priority,
            };
        }
        RuleAction::NoMatch
    }
}
