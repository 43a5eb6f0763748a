use chrono::{Duration, NaiveDateTime};

use crate::{
    config::DataSourceConfig,
    error::{ConfigError, LockstepResult},
};

/// The closed interval `[start, end]` a data source is sampled from for a
/// given target datetime.
///
/// The window is shifted by the source's availability offset instead of
/// shifting the data timestamps: `end = target − offset`,
/// `start = end − window`. A bar stamped at the target datetime whose
/// availability is delayed by `offset_seconds` therefore never appears in
/// the fetched frame — identically in backtest and live. Both ends are
/// inclusive to match bar-at-target OHLCV semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl FetchWindow {
    /// Computes the window for `target`. `offset_seconds` may be negative
    /// (the window shifts forward); `window_seconds` must be positive.
    pub fn for_target(
        target: NaiveDateTime,
        offset_seconds: i64,
        window_seconds: i64,
    ) -> LockstepResult<Self> {
        if window_seconds <= 0 {
            return Err(ConfigError::Invalid(format!(
                "window_seconds must be positive, got {window_seconds}"
            ))
            .into());
        }

        let end = target - Duration::seconds(offset_seconds);
        let start = end - Duration::seconds(window_seconds);
        Ok(Self { start, end })
    }

    pub fn for_source(target: NaiveDateTime, config: &DataSourceConfig) -> LockstepResult<Self> {
        Self::for_target(target, config.offset_seconds, config.window_seconds)
    }

    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        ts >= self.start && ts <= self.end
    }
}
