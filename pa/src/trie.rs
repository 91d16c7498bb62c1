// Copyright 2022 Oxide Computer Company

//! Compressed binary trie over prefixes of up to 128 bits.
//!
//! Each node may hold several elements (a multiset in insertion order), so
//! locally assigned and peer-advertised prefixes can share one index and be
//! observed in a single walk. The trie owns nothing but the element values
//! it is given; callers keep the enclosing records.

use std::ops::ControlFlow;

use crate::error::Error;
use crate::prefix::Prefix;

struct Node<T> {
    prefix: Prefix,
    elems: Vec<T>,
    children: [Option<Box<Node<T>>>; 2],
}

impl<T> Node<T> {
    fn leaf(prefix: Prefix, elem: T) -> Box<Node<T>> {
        Box::new(Node {
            prefix,
            elems: vec![elem],
            children: [None, None],
        })
    }

    fn child_count(&self) -> usize {
        self.children.iter().filter(|c| c.is_some()).count()
    }
}

pub struct Trie<T> {
    root: Option<Box<Node<T>>>,
    count: usize,
}

impl<T: PartialEq + Copy> Default for Trie<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: PartialEq + Copy> Trie<T> {
    pub fn new() -> Self {
        Trie {
            root: None,
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Links `elem` at `prefix`. Distinct elements may share a prefix;
    /// linking the exact same (prefix, element) pair twice is an error.
    pub fn insert(&mut self, prefix: Prefix, elem: T) -> Result<(), Error> {
        Self::insert_at(&mut self.root, prefix, elem)?;
        self.count += 1;
        Ok(())
    }

    fn insert_at(
        slot: &mut Option<Box<Node<T>>>,
        p: Prefix,
        elem: T,
    ) -> Result<(), Error> {
        let n = match slot {
            None => {
                *slot = Some(Node::leaf(p, elem));
                return Ok(());
            }
            Some(n) => n,
        };
        let cl = n.prefix.common_len(&p);
        if cl == n.prefix.len() && cl == p.len() {
            // same prefix
            if n.elems.contains(&elem) {
                return Err(Error::DuplicateEntry(p));
            }
            n.elems.push(elem);
            Ok(())
        } else if cl == n.prefix.len() {
            // p extends this node
            let b = p.bit(cl) as usize;
            Self::insert_at(&mut n.children[b], p, elem)
        } else if cl == p.len() {
            // this node extends p; put p above it
            let mut new = Node::leaf(p, elem);
            if let Some(old) = slot.take() {
                let b = old.prefix.bit(cl) as usize;
                new.children[b] = Some(old);
            }
            *slot = Some(new);
            Ok(())
        } else {
            // diverge below the common prefix; fork at a branch node
            let mut branch = Box::new(Node {
                prefix: p.truncate(cl),
                elems: Vec::new(),
                children: [None, None],
            });
            if let Some(old) = slot.take() {
                let b = old.prefix.bit(cl) as usize;
                branch.children[b] = Some(old);
            }
            branch.children[p.bit(cl) as usize] = Some(Node::leaf(p, elem));
            *slot = Some(branch);
            Ok(())
        }
    }

    /// Unlinks a previously inserted (prefix, element) pair. Returns false
    /// if the pair is not present.
    pub fn remove(&mut self, prefix: Prefix, elem: T) -> bool {
        let hit = Self::remove_at(&mut self.root, prefix, elem);
        if hit {
            self.count -= 1;
        }
        hit
    }

    fn remove_at(slot: &mut Option<Box<Node<T>>>, p: Prefix, elem: T) -> bool {
        let n = match slot {
            None => return false,
            Some(n) => n,
        };
        let cl = n.prefix.common_len(&p);
        let hit = if cl == n.prefix.len() && cl == p.len() {
            match n.elems.iter().position(|e| *e == elem) {
                Some(i) => {
                    n.elems.remove(i);
                    true
                }
                None => false,
            }
        } else if cl == n.prefix.len() {
            Self::remove_at(&mut n.children[p.bit(cl) as usize], p, elem)
        } else {
            false
        };
        if hit {
            Self::collapse(slot);
        }
        hit
    }

    // Splice out nodes that no longer carry elements and fan out to fewer
    // than two children.
    fn collapse(slot: &mut Option<Box<Node<T>>>) {
        let n = match slot {
            None => return,
            Some(n) => n,
        };
        if !n.elems.is_empty() || n.child_count() == 2 {
            return;
        }
        if let Some(mut old) = slot.take() {
            *slot = old.children.iter_mut().find_map(|c| c.take());
        }
    }

    /// Visits every element whose prefix contains, equals, or falls within
    /// `root`.
    pub fn walk_updown<F>(&self, root: Prefix, f: &mut F) -> ControlFlow<()>
    where
        F: FnMut(Prefix, &T) -> ControlFlow<()>,
    {
        let mut cur = self.root.as_deref();
        while let Some(n) = cur {
            let cl = n.prefix.common_len(&root);
            if cl < n.prefix.len().min(root.len()) {
                break;
            }
            if n.prefix.len() >= root.len() {
                // n and everything below it sits within root
                return Self::walk_all(Some(n), f);
            }
            for e in &n.elems {
                f(n.prefix, e)?;
            }
            cur = n.children[root.bit(n.prefix.len()) as usize].as_deref();
        }
        ControlFlow::Continue(())
    }

    fn walk_all<F>(node: Option<&Node<T>>, f: &mut F) -> ControlFlow<()>
    where
        F: FnMut(Prefix, &T) -> ControlFlow<()>,
    {
        let n = match node {
            None => return ControlFlow::Continue(()),
            Some(n) => n,
        };
        for e in &n.elems {
            f(n.prefix, e)?;
        }
        for c in &n.children {
            Self::walk_all(c.as_deref(), f)?;
        }
        ControlFlow::Continue(())
    }

    /// Enumerates the maximal sub-prefixes of `root` that contain no stored
    /// element and are covered by none. The yielded prefixes are disjoint
    /// and tile the free space exactly.
    pub fn walk_available<F>(&self, root: Prefix, f: &mut F) -> ControlFlow<()>
    where
        F: FnMut(Prefix) -> ControlFlow<()>,
    {
        let mut cur = self.root.as_deref();
        loop {
            let n = match cur {
                None => return f(root),
                Some(n) => n,
            };
            let cl = n.prefix.common_len(&root);
            if cl < n.prefix.len().min(root.len()) {
                return f(root);
            }
            if n.prefix.len() >= root.len() {
                return Self::avail_down(root, Some(n), f);
            }
            if !n.elems.is_empty() {
                // an entry above root covers all of it
                return ControlFlow::Continue(());
            }
            cur = n.children[root.bit(n.prefix.len()) as usize].as_deref();
        }
    }

    // `q` contains `node.prefix` when node is present.
    fn avail_down<F>(
        q: Prefix,
        node: Option<&Node<T>>,
        f: &mut F,
    ) -> ControlFlow<()>
    where
        F: FnMut(Prefix) -> ControlFlow<()>,
    {
        let n = match node {
            None => return f(q),
            Some(n) => n,
        };
        // halves peeled off between q and the node are wholly free
        for d in q.len()..n.prefix.len() {
            let sib = n.prefix.truncate(d).child(!n.prefix.bit(d));
            f(sib)?;
        }
        if !n.elems.is_empty() || n.prefix.len() == 128 {
            return ControlFlow::Continue(());
        }
        for b in [false, true] {
            Self::avail_down(
                n.prefix.child(b),
                n.children[b as usize].as_deref(),
                f,
            )?;
        }
        ControlFlow::Continue(())
    }

    /// True iff some element's prefix is contained in `q` (including at `q`
    /// itself).
    pub fn any_within(&self, q: Prefix) -> bool {
        let mut cur = self.root.as_deref();
        while let Some(n) = cur {
            let cl = n.prefix.common_len(&q);
            if cl < n.prefix.len().min(q.len()) {
                return false;
            }
            if n.prefix.len() >= q.len() {
                // nodes exist only where elements exist at or below them
                return true;
            }
            cur = n.children[q.bit(n.prefix.len()) as usize].as_deref();
        }
        false
    }

    /// True iff some element's prefix contains `q` (including at `q`).
    pub fn covered_by(&self, q: Prefix) -> bool {
        let mut cur = self.root.as_deref();
        while let Some(n) = cur {
            let cl = n.prefix.common_len(&q);
            if cl < n.prefix.len().min(q.len()) || n.prefix.len() > q.len() {
                return false;
            }
            if !n.elems.is_empty() {
                return true;
            }
            if n.prefix.len() == q.len() {
                return false;
            }
            cur = n.children[q.bit(n.prefix.len()) as usize].as_deref();
        }
        false
    }

    /// The largest free prefix within `bound` that contains `q`, or None if
    /// `q` itself is occupied or covered.
    pub fn max_available_within(
        &self,
        bound: Prefix,
        q: Prefix,
    ) -> Option<Prefix> {
        debug_assert!(bound.contains(&q));
        if self.covered_by(q) {
            return None;
        }
        for d in bound.len()..=q.len() {
            let a = q.truncate(d);
            if !self.any_within(a) {
                return Some(a);
            }
        }
        None
    }
}
