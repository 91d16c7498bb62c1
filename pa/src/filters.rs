// Copyright 2022 Oxide Computer Company

//! Boolean filter trees gating rule evaluation.
//!
//! A rule registered with a filter is only ever probed on pairs the filter
//! accepts. Leaves match a concrete link or delegated prefix, or the
//! opaque type tags their owner attached; combinators compose with
//! optional negation.

use crate::core::{DpId, LinkId};
use crate::rules::PairCtx;

#[derive(Debug, Clone)]
pub enum Filter {
    /// Accepts pairs on the given link and/or delegated prefix; a None
    /// side matches anything.
    Basic {
        link: Option<LinkId>,
        dp: Option<DpId>,
    },
    /// Accepts pairs whose link/dp carries the given type tag.
    Type {
        link_tag: Option<u32>,
        dp_tag: Option<u32>,
    },
    /// Accepts iff every sub-filter accepts; empty accepts.
    And { negate: bool, filters: Vec<Filter> },
    /// Accepts iff any sub-filter accepts; empty rejects.
    Or { negate: bool, filters: Vec<Filter> },
}

impl Filter {
    pub fn accepts(&self, pair: &PairCtx) -> bool {
        match self {
            Filter::Basic { link, dp } => {
                if let Some(l) = link {
                    if *l != pair.link {
                        return false;
                    }
                }
                if let Some(d) = dp {
                    if *d != pair.dp {
                        return false;
                    }
                }
                true
            }
            Filter::Type { link_tag, dp_tag } => {
                if let Some(t) = link_tag {
                    if pair.link_tag != Some(*t) {
                        return false;
                    }
                }
                if let Some(t) = dp_tag {
                    if pair.dp_tag != Some(*t) {
                        return false;
                    }
                }
                true
            }
            Filter::And { negate, filters } => {
                let r = filters.iter().all(|f| f.accepts(pair));
                r != *negate
            }
            Filter::Or { negate, filters } => {
                let r = filters.iter().any(|f| f.accepts(pair));
                r != *negate
            }
        }
    }
}
