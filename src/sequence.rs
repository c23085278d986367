//! Replication sequence arithmetic.
//!
//! planet.osm.org numbers its daily changefiles consecutively from the first
//! day one was published (the *epoch*). The diff for day `d` therefore has
//! sequence number `days_between(epoch, d) + 1`, rendered as nine
//! zero-padded digits and split into three path segments:
//!
//! ```text
//! 2012-09-12  →  000000001  →  000/000/001.osc.gz
//! 2024-01-01  →  000004129  →  000/004/129.osc.gz
//! ```
//!
//! All functions here are pure; "today" is always passed in.

use anyhow::Result;
use chrono::{Days, NaiveDate};
use std::fmt;

use crate::error::PipelineError;

/// A daily replication sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceNumber(u32);

impl SequenceNumber {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// The `aaa/bbb/ccc` path of this sequence under `replication/day/`.
    pub fn path_segments(&self) -> [String; 3] {
        let digits = self.to_string();
        [
            digits[0..3].to_string(),
            digits[3..6].to_string(),
            digits[6..9].to_string(),
        ]
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:09}", self.0)
    }
}

/// Maps calendar days to replication sequence numbers relative to a fixed epoch.
#[derive(Debug, Clone, Copy)]
pub struct SequenceClock {
    epoch: NaiveDate,
}

impl SequenceClock {
    pub fn new(epoch: NaiveDate) -> Self {
        Self { epoch }
    }

    pub fn epoch(&self) -> NaiveDate {
        self.epoch
    }

    /// Sequence number of the diff published for `day`.
    pub fn sequence_for_day(&self, day: NaiveDate) -> Result<SequenceNumber> {
        let offset = (day - self.epoch).num_days();
        if offset < 0 {
            return Err(PipelineError::BeforeEpoch {
                day,
                epoch: self.epoch,
            }
            .into());
        }
        Ok(SequenceNumber((offset + 1) as u32))
    }

    /// Inverse of [`sequence_for_day`](Self::sequence_for_day).
    pub fn day_for_sequence(&self, sequence: SequenceNumber) -> Option<NaiveDate> {
        let offset = sequence.value().checked_sub(1)?;
        self.epoch.checked_add_days(Days::new(offset as u64))
    }

    /// The day following `last_applied`, except that a cursor older than the
    /// day before the epoch is moved to `epoch - 1` so replication starts at
    /// the very first published diff.
    pub fn next_day_to_process(&self, last_applied: NaiveDate) -> NaiveDate {
        let day_before_epoch = self.epoch.pred_opt().unwrap_or(self.epoch);
        if (self.epoch - last_applied).num_days() > 1 {
            day_before_epoch
        } else {
            last_applied.succ_opt().unwrap_or(last_applied)
        }
    }

    /// The day whose diff should be fetched next. Never earlier than the epoch.
    pub fn target_day(&self, last_applied: NaiveDate) -> NaiveDate {
        self.next_day_to_process(last_applied).max(self.epoch)
    }

    /// True when at most one day separates `last_applied` from `today`.
    pub fn is_up_to_date(&self, last_applied: NaiveDate, today: NaiveDate) -> bool {
        (today - last_applied).num_days() <= 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn clock() -> SequenceClock {
        SequenceClock::new(day("2012-09-12"))
    }

    #[test]
    fn test_epoch_is_sequence_one() {
        let seq = clock().sequence_for_day(day("2012-09-12")).unwrap();
        assert_eq!(seq.to_string(), "000000001");
        assert_eq!(seq.path_segments(), ["000", "000", "001"]);
    }

    #[test]
    fn test_known_sequence() {
        // 4128 days between 2012-09-12 and 2024-01-01
        let seq = clock().sequence_for_day(day("2024-01-01")).unwrap();
        assert_eq!(seq.to_string(), "000004129");
        assert_eq!(seq.path_segments(), ["000", "004", "129"]);
        assert_eq!(clock().day_for_sequence(seq), Some(day("2024-01-01")));
    }

    #[test]
    fn test_before_epoch_is_error() {
        let err = clock().sequence_for_day(day("2012-09-11")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::BeforeEpoch { .. })
        ));
    }

    #[test]
    fn test_cursor_long_before_epoch() {
        let c = clock();
        let next = c.next_day_to_process(day("2012-09-10"));
        assert_eq!(next, day("2012-09-11"));
        let following = next.succ_opt().unwrap();
        assert_eq!(c.sequence_for_day(following).unwrap().to_string(), "000000001");
        assert_eq!(c.target_day(day("2012-09-10")), day("2012-09-12"));
    }

    #[test]
    fn test_cursor_day_before_epoch() {
        let c = clock();
        assert_eq!(c.next_day_to_process(day("2012-09-11")), day("2012-09-12"));
        assert_eq!(c.target_day(day("2012-09-11")), day("2012-09-12"));
    }

    #[test]
    fn test_regular_next_day() {
        assert_eq!(
            clock().next_day_to_process(day("2020-02-28")),
            day("2020-02-29")
        );
    }

    #[test]
    fn test_up_to_date() {
        let c = clock();
        assert!(c.is_up_to_date(day("2024-03-09"), day("2024-03-10")));
        assert!(c.is_up_to_date(day("2024-03-10"), day("2024-03-10")));
        assert!(!c.is_up_to_date(day("2024-03-08"), day("2024-03-10")));
    }

    proptest! {
        #[test]
        fn sequence_is_nine_digits_and_increasing(offset in 0u32..300_000) {
            let c = clock();
            let d = c.epoch() + Days::new(offset as u64);
            let a = c.sequence_for_day(d).unwrap();
            let b = c.sequence_for_day(d + Days::new(1)).unwrap();
            prop_assert_eq!(a.to_string().len(), 9);
            prop_assert!(b > a);
            prop_assert_eq!(c.day_for_sequence(a), Some(d));
        }

        #[test]
        fn catch_up_terminates(start in 0i64..8000, lag in 0i64..4000) {
            let c = clock();
            let base = day("2008-01-01");
            let mut last = base + chrono::Duration::days(start);
            let today = c.epoch().max(last) + chrono::Duration::days(lag);
            let bound = (today - last).num_days().max(0);
            let mut steps = 0;
            while !c.is_up_to_date(last, today) {
                last = c.target_day(last);
                steps += 1;
                prop_assert!(steps <= bound);
            }
        }
    }
}
