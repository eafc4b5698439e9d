//! Per-run facts injected into transform instructions and the report.

use chrono::{Months, NaiveDate, Utc};

use newsfeed_shared::RunConfig;

/// `today`, the recency window, and the topics that steer scoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub today: NaiveDate,
    pub timeframe_months: u32,
    pub focus_areas: String,
}

impl RunContext {
    pub fn new(today: NaiveDate, timeframe_months: u32, focus_areas: impl Into<String>) -> Self {
        Self {
            today,
            timeframe_months,
            focus_areas: focus_areas.into(),
        }
    }

    /// Context for a run starting now.
    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(
            Utc::now().date_naive(),
            config.timeframe_months,
            config.focus_areas.clone(),
        )
    }

    /// First day of the recency window.
    pub fn window_start(&self) -> NaiveDate {
        self.today
            .checked_sub_months(Months::new(self.timeframe_months))
            .unwrap_or(NaiveDate::MIN)
    }

    /// Human range, e.g. `Feb 18 - Oct 18, 2026`.
    pub fn date_range(&self) -> String {
        format!(
            "{} - {}",
            self.window_start().format("%b %d"),
            self.today.format("%b %d, %Y")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_range_spans_timeframe() {
        let ctx = RunContext::new(
            NaiveDate::from_ymd_opt(2026, 10, 18).unwrap(),
            8,
            "european politics",
        );
        assert_eq!(ctx.window_start(), NaiveDate::from_ymd_opt(2026, 2, 18).unwrap());
        assert_eq!(ctx.date_range(), "Feb 18 - Oct 18, 2026");
    }

    #[test]
    fn month_end_clamps() {
        let ctx = RunContext::new(NaiveDate::from_ymd_opt(2025, 3, 31).unwrap(), 1, "x");
        assert_eq!(ctx.window_start(), NaiveDate::from_ymd_opt(2025, 2, 28).unwrap());
    }
}
