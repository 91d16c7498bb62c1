// Copyright 2022 Oxide Computer Company

//! Virtual-time harness: a manually advanced clock, deterministic random
//! material and an event-recording user, so every scenario runs in
//! simulated milliseconds and asserts on exact transition sequences.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use slog::{o, Discard, Logger};

use pa::clock::Clock;
use pa::core::{Core, LdpInfo, User};
use pa::entropy::{md5_prand, RandomSource};
use pa::prefix::Prefix;

pub struct FakeClock {
    now: Cell<u64>,
}

impl FakeClock {
    pub fn new() -> Rc<FakeClock> {
        Rc::new(FakeClock { now: Cell::new(0) })
    }

    pub fn set(&self, t: u64) {
        assert!(t >= self.now.get(), "time cannot move to the past");
        self.now.set(t);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> u64 {
        self.now.get()
    }
}

/// Uniform source pinned to zero: every backoff and adoption window
/// collapses, which keeps scenario timing exact. The pseudo-random hash
/// stays real (and deterministic).
pub struct ZeroRandom;

impl RandomSource for ZeroRandom {
    fn random(&mut self) -> u32 {
        0
    }

    fn prand(&mut self, seed: &[u8], ctr0: u32, ctr1: u32) -> [u8; 16] {
        md5_prand(seed, ctr0, ctr1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Assigned,
    Published,
    Applied,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: Kind,
    pub value: bool,
    pub link_name: String,
    pub prefix: Prefix,
}

pub type EventLog = Rc<RefCell<Vec<Event>>>;

/// User that records every transition it sees.
pub struct Recorder {
    pub events: EventLog,
}

impl Recorder {
    pub fn new() -> (Recorder, EventLog) {
        let events: EventLog = Rc::new(RefCell::new(Vec::new()));
        (
            Recorder {
                events: events.clone(),
            },
            events,
        )
    }

    fn push(&mut self, kind: Kind, value: bool, info: &LdpInfo) {
        self.events.borrow_mut().push(Event {
            kind,
            value,
            link_name: info.link_name.clone(),
            prefix: info.prefix,
        });
    }
}

impl Default for Recorder {
    fn default() -> Self {
        Recorder::new().0
    }
}

impl User for Recorder {
    fn assigned(&mut self, info: &LdpInfo) {
        self.push(Kind::Assigned, info.assigned, info);
    }

    fn published(&mut self, info: &LdpInfo) {
        self.push(Kind::Published, info.published, info);
    }

    fn applied(&mut self, info: &LdpInfo) {
        self.push(Kind::Applied, info.applied, info);
    }
}

/// Discards by default; set PA_TEST_LOG for full terminal output while
/// chasing a failure.
pub fn test_logger() -> Logger {
    if std::env::var_os("PA_TEST_LOG").is_some() {
        pa::term_logger()
    } else {
        Logger::root(Discard, o!())
    }
}

pub fn new_core(clock: &Rc<FakeClock>) -> Core {
    Core::new(clock.clone(), Box::new(ZeroRandom), test_logger())
}

/// Runs every timer due up to and including `until`, advancing the clock
/// to each deadline in order, then leaves the clock at `until`.
pub fn run_until(core: &mut Core, clock: &FakeClock, until: u64) {
    while let Some(d) = core.next_deadline() {
        if d > until {
            break;
        }
        if d > clock.now() {
            clock.set(d);
        }
        core.poll();
    }
    if until > clock.now() {
        clock.set(until);
    }
}

/// Runs until the core goes quiescent. Bails out if it will not.
pub fn settle(core: &mut Core, clock: &FakeClock) {
    for _ in 0..1_000 {
        let d = match core.next_deadline() {
            Some(d) => d,
            None => return,
        };
        if d > clock.now() {
            clock.set(d);
        }
        core.poll();
    }
    panic!("core did not settle");
}

/// Structural invariants that must hold after any operation sequence.
pub fn assert_invariants(core: &Core) {
    for id in core.ldp_ids() {
        let i = core.ldp_info(id).unwrap();
        assert!(!i.published || i.assigned, "published implies assigned");
        assert!(!i.applied || i.assigned, "applied implies assigned");
        assert!(
            !i.adopting || (i.assigned && !i.published),
            "adopting implies assigned and unpublished"
        );
        if i.assigned {
            assert!(
                i.dp_prefix.contains(&i.prefix),
                "assignment escapes its delegated prefix"
            );
        }
    }
}

pub fn p(s: &str) -> Prefix {
    s.parse().unwrap()
}
