//! Tasks: units of pending work bound to one zone.

use std::cmp::Ordering;
use std::fmt;

use crate::common::datetime::UnixTime;
use crate::zone::ZoneKey;

/// The ceiling for per-zone retry backoff.
pub const MAX_BACKOFF_SECS: u64 = 3600;

/// The backoff that follows `current` after one more failure.
///
/// Starts at one second, doubles on every consecutive failure and is capped
/// at [`MAX_BACKOFF_SECS`].
pub fn next_backoff(current: u64) -> u64 {
    if current == 0 {
        1
    } else {
        current.saturating_mul(2).min(MAX_BACKOFF_SECS)
    }
}

//----------- Stage ------------------------------------------------------------

/// A position in the signing pipeline.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Nothing to do for this zone.
    None,

    /// Read the zone from its inbound adapter.
    Read,

    /// Add the DNSKEY records from the signer configuration.
    AddKeys,

    /// Generate denial-of-existence (NSEC/NSEC3) records.
    Nsecify,

    /// Generate signatures.
    Sign,

    /// Audit the signed zone.
    Audit,

    /// Write the signed zone to its outbound adapter.
    Write,
}

impl Stage {
    /// The stage that follows a successful pass through this one.
    ///
    /// `None` both for [`Stage::Write`] (completion is handled by the
    /// driver, which schedules the next full re-sign) and for
    /// [`Stage::None`].
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::None => None,
            Stage::Read => Some(Stage::AddKeys),
            Stage::AddKeys => Some(Stage::Nsecify),
            Stage::Nsecify => Some(Stage::Sign),
            Stage::Sign => Some(Stage::Audit),
            Stage::Audit => Some(Stage::Write),
            Stage::Write => None,
        }
    }

    /// Describe the stage the way operators see it in the task dump.
    pub fn describe(self) -> &'static str {
        match self {
            Stage::None => "do nothing with",
            Stage::Read => "read and sign",
            Stage::AddKeys => "add keys and sign",
            Stage::Nsecify => "nsecify and sign",
            Stage::Sign => "sign",
            Stage::Audit => "audit",
            Stage::Write => "output signed",
        }
    }

    /// The integer form used by task backup files.
    pub fn to_int(self) -> u8 {
        match self {
            Stage::None => 0,
            Stage::Read => 1,
            Stage::AddKeys => 2,
            Stage::Nsecify => 3,
            Stage::Sign => 4,
            Stage::Audit => 5,
            Stage::Write => 6,
        }
    }

    /// Parse the integer form from a task backup file.
    ///
    /// Unrecognized values yield `None`; recovery treats them as corruption
    /// and falls back to a full re-sign from [`Stage::Read`].
    pub fn from_int(value: u8) -> Option<Stage> {
        Some(match value {
            0 => Stage::None,
            1 => Stage::Read,
            2 => Stage::AddKeys,
            3 => Stage::Nsecify,
            4 => Stage::Sign,
            5 => Stage::Audit,
            6 => Stage::Write,
            _ => return None,
        })
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

//----------- Task -------------------------------------------------------------

/// A unit of pending work bound to one zone.
///
/// At most one task per zone exists in the task list at any time; the list
/// enforces this on insertion.
#[derive(Clone, Debug)]
pub struct Task {
    /// The pipeline stage to run next.
    pub stage: Stage,

    /// When the task becomes eligible to run.
    pub when: UnixTime,

    /// Run immediately, regardless of `when`.  Cleared when popped.
    pub flush: bool,

    /// The backoff applied after the most recent failure, for persistence
    /// and diagnostics.  The authoritative counter lives on the zone.
    pub backoff: u64,

    /// The zone this task belongs to.
    pub zone: ZoneKey,
}

impl Task {
    pub fn new(stage: Stage, when: UnixTime, zone: ZoneKey) -> Self {
        Self {
            stage,
            when,
            flush: false,
            backoff: 0,
            zone,
        }
    }

    /// The key this task sorts under in the task list.
    pub fn sort_key(&self) -> TaskKey {
        TaskKey {
            flush: self.flush,
            when: self.when,
            zone: self.zone.clone(),
        }
    }

    /// One line of the operator-facing task dump.
    ///
    /// Flushed tasks display the current time, since that is when they will
    /// effectively run.
    pub fn describe(&self, now: UnixTime) -> String {
        let when = if self.flush { now } else { self.when };
        format!("On {} I will {} zone {}", when, self.stage, self.zone)
    }
}

//----------- TaskKey ----------------------------------------------------------

/// The sort key of a task.
///
/// Flushed tasks order before all timed ones; timed tasks order by due time;
/// ties are broken by canonical zone-name order, with the class as a final
/// tie-break so the key is a strict total order.  The stage is deliberately
/// not part of the order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskKey {
    pub flush: bool,
    pub when: UnixTime,
    pub zone: ZoneKey,
}

impl Ord for TaskKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // 'true' must sort first, hence the operand swap.
        other
            .flush
            .cmp(&self.flush)
            .then_with(|| self.when.cmp(&other.when))
            .then_with(|| self.zone.name.cmp(&other.zone.name))
            .then_with(|| self.zone.class.cmp(&other.zone.class))
    }
}

impl PartialOrd for TaskKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zone::ZoneKey;

    fn key(name: &str, when: u64, flush: bool) -> TaskKey {
        TaskKey {
            flush,
            when: UnixTime::from_secs(when),
            zone: ZoneKey::from_str_in(name).unwrap(),
        }
    }

    #[test]
    fn backoff_growth_and_cap() {
        let mut backoff = 0;
        let mut seen = Vec::new();
        for _ in 0..14 {
            backoff = next_backoff(backoff);
            seen.push(backoff);
        }
        assert_eq!(
            seen,
            vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 1024, 2048, 3600, 3600]
        );
    }

    #[test]
    fn stage_progression() {
        assert_eq!(Stage::Read.next(), Some(Stage::AddKeys));
        assert_eq!(Stage::AddKeys.next(), Some(Stage::Nsecify));
        assert_eq!(Stage::Nsecify.next(), Some(Stage::Sign));
        assert_eq!(Stage::Sign.next(), Some(Stage::Audit));
        assert_eq!(Stage::Audit.next(), Some(Stage::Write));
        assert_eq!(Stage::Write.next(), None);
        assert_eq!(Stage::None.next(), None);
    }

    #[test]
    fn stage_int_round_trip() {
        for i in 0..=6 {
            assert_eq!(Stage::from_int(i).unwrap().to_int(), i);
        }
        assert_eq!(Stage::from_int(7), None);
        assert_eq!(Stage::from_int(255), None);
    }

    #[test]
    fn flushed_tasks_sort_first() {
        let flushed = key("zzz.example", 9_000, true);
        let timed = key("aaa.example", 1_000, false);
        assert!(flushed < timed);
    }

    #[test]
    fn timed_tasks_sort_by_due_time_then_name() {
        let early = key("b.example", 1_000, false);
        let late = key("a.example", 2_000, false);
        assert!(early < late);

        // Equal due times fall back to canonical name order: a parent
        // domain sorts before its subdomains.
        let parent = key("example.com", 1_000, false);
        let child = key("a.example.com", 1_000, false);
        assert!(parent < child);

        let a = key("a.example.com", 1_000, false);
        let b = key("b.example.com", 1_000, false);
        assert!(a < b);
    }
}
