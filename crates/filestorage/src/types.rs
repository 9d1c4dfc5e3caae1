// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Object and transaction identifiers.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// An 8-byte object identifier, ordered as a big-endian unsigned integer.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Oid(pub u64);

impl Oid {
    /// The root object, from which pack garbage collection starts tracing.
    pub const ROOT: Oid = Oid(0);

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Oid(u64::from_be_bytes(bytes))
    }

    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl Display for Oid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

impl From<u64> for Oid {
    fn from(value: u64) -> Self {
        Oid(value)
    }
}

/// An 8-byte transaction identifier.
///
/// Tids double as commit timestamps. The high four bytes count minutes since
/// 1900-01-01T00:00Z using a fixed 31-day month, the low four bytes hold the
/// second within that minute scaled by `2^32 / 60`. Comparing tids as integers
/// therefore orders them in time.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Tid(pub u64);

const SECONDS_SCALE: f64 = (1u64 << 32) as f64 / 60.0;

impl Tid {
    /// "No revision": the expected tid for an object that does not exist yet.
    pub const ZERO: Tid = Tid(0);
    pub const MAX: Tid = Tid(u64::MAX);

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Tid(u64::from_be_bytes(bytes))
    }

    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        let year = (dt.year() - 1900).max(0) as u64;
        let minutes = ((((year * 12 + dt.month0() as u64) * 31 + dt.day0() as u64) * 24
            + dt.hour() as u64)
            * 60)
            + dt.minute() as u64;
        let seconds = dt.second() as f64 + dt.nanosecond().min(999_999_999) as f64 / 1e9;
        let fraction = (seconds * SECONDS_SCALE).min(u32::MAX as f64) as u64;
        Tid(((minutes & 0xffff_ffff) << 32) | fraction)
    }

    /// The wall-clock time this tid encodes, if it names a valid calendar date.
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        let mut minutes = self.0 >> 32;
        let minute = (minutes % 60) as u32;
        minutes /= 60;
        let hour = (minutes % 24) as u32;
        minutes /= 24;
        let day = (minutes % 31) as u32 + 1;
        minutes /= 31;
        let month = (minutes % 12) as u32 + 1;
        let year = (minutes / 12) as i32 + 1900;
        let seconds = (self.0 & 0xffff_ffff) as f64 / SECONDS_SCALE;
        let base = Utc
            .with_ymd_and_hms(year, month, day, hour, minute, 0)
            .single()?;
        Some(base + chrono::Duration::nanoseconds((seconds * 1e9) as i64))
    }

    /// The smallest tid that is both at least `self` and strictly above `previous`. `None`
    /// once `previous` is the largest tid.
    pub fn later_than(self, previous: Tid) -> Option<Tid> {
        if self > previous {
            Some(self)
        } else {
            previous.0.checked_add(1).map(Tid)
        }
    }

    /// A fresh tid for a transaction committing after `previous`.
    pub fn next_after(previous: Tid) -> Option<Tid> {
        Tid::now().later_than(previous)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl Display for Tid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

impl From<u64> for Tid {
    fn from(value: u64) -> Self {
        Tid(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tid_orders_by_time() {
        let earlier = Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 59).unwrap();
        let later = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert!(Tid::from_datetime(earlier) < Tid::from_datetime(later));
    }

    #[test]
    fn test_tid_datetime_to_the_second() {
        let dt = Utc.with_ymd_and_hms(2025, 3, 14, 15, 9, 26).unwrap();
        let back = Tid::from_datetime(dt).to_datetime().unwrap();
        assert_eq!(back.date_naive(), dt.date_naive());
        assert_eq!(back.hour(), 15);
        assert_eq!(back.minute(), 9);
        // The fraction loses a few nanoseconds, never a whole second.
        assert!((back - dt).num_milliseconds().abs() < 1);
    }

    #[test]
    fn test_later_than() {
        let t = Tid(1000);
        assert_eq!(t.later_than(Tid(10)), Some(t));
        assert_eq!(t.later_than(Tid(1000)), Some(Tid(1001)));
        assert_eq!(t.later_than(Tid(5000)), Some(Tid(5001)));
        assert!(Tid::next_after(Tid::now()).unwrap() > Tid::ZERO);
    }

    #[test]
    fn test_tid_space_runs_out() {
        assert_eq!(Tid(5).later_than(Tid::MAX), None);
        assert_eq!(Tid::MAX.later_than(Tid(u64::MAX - 1)), Some(Tid::MAX));
        assert_eq!(Tid::next_after(Tid::MAX), None);
    }

    #[test]
    fn test_big_endian_bytes() {
        let oid = Oid(0x0102_0304_0506_0708);
        assert_eq!(oid.to_bytes(), [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(Oid::from_bytes(oid.to_bytes()), oid);
        assert_eq!(format!("{oid}"), "0x0102030405060708");
        assert!(Oid(1) < Oid(256));
    }
}
