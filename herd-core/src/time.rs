//! Timestamps used for execution log naming

use chrono::{DateTime, Local};
use std::fmt;

/// A point in local time with the two renderings used by execution logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(DateTime<Local>);

impl Timestamp {
    pub fn now() -> Self {
        Self(Local::now())
    }

    pub fn from_datetime(datetime: DateTime<Local>) -> Self {
        Self(datetime)
    }

    /// Fixed-width `yyyymmddhhmmss`
    pub fn unformatted(&self) -> String {
        self.0.format("%Y%m%d%H%M%S").to_string()
    }

    /// Display form `yyyy-mm-dd hh:mm:ss`
    pub fn formatted(&self) -> String {
        self.0.format("%Y-%m-%d %H:%M:%S").to_string()
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::now()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.formatted())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_renderings() {
        let datetime = Local.with_ymd_and_hms(2024, 3, 7, 9, 5, 1).unwrap();
        let ts = Timestamp::from_datetime(datetime);
        assert_eq!(ts.unformatted(), "20240307090501");
        assert_eq!(ts.formatted(), "2024-03-07 09:05:01");
        assert_eq!(ts.unformatted().len(), 14);
    }
}
