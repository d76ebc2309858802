//! Point-in-time roll-up windows for node and account statistics.

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Period {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeriodStats {
    pub egress: u64,
    pub period: Period,
}

/// Four fixed windows relative to a reference instant: current day,
/// current ISO week (Monday start), current month, and the whole of the
/// previous month. Overlapping windows all accrue.
#[derive(Debug, Clone, PartialEq)]
pub struct Stats {
    pub previous_month: PeriodStats,
    pub current_month: PeriodStats,
    pub current_week: PeriodStats,
    pub current_day: PeriodStats,
}

fn utc_midnight(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0)
        .single()
        .expect("valid UTC calendar date")
}

impl Stats {
    pub fn new(now: DateTime<Utc>) -> Self {
        let (year, month, day) = (now.year(), now.month(), now.day());

        let current_month_start = utc_midnight(year, month, 1);
        let (prev_year, prev_month) = if month == 1 {
            (year - 1, 12)
        } else {
            (year, month - 1)
        };
        let previous_month_start = utc_midnight(prev_year, prev_month, 1);
        let previous_month_end = current_month_start - Duration::seconds(1);

        let current_day_start = utc_midnight(year, month, day);
        // Monday-start week; Sunday counts as day seven.
        let days_from_monday = now.weekday().num_days_from_monday() as i64;
        let current_week_start = current_day_start - Duration::days(days_from_monday);

        Self {
            previous_month: PeriodStats {
                egress: 0,
                period: Period {
                    from: previous_month_start,
                    to: previous_month_end,
                },
            },
            current_month: PeriodStats {
                egress: 0,
                period: Period {
                    from: current_month_start,
                    to: now,
                },
            },
            current_week: PeriodStats {
                egress: 0,
                period: Period {
                    from: current_week_start,
                    to: now,
                },
            },
            current_day: PeriodStats {
                egress: 0,
                period: Period {
                    from: current_day_start,
                    to: now,
                },
            },
        }
    }

    /// The earliest instant any window covers; source queries start here.
    pub fn earliest(&self) -> DateTime<Utc> {
        self.previous_month.period.from
    }

    /// Accrue `egress` into every window containing `when`.
    pub fn add_egress(&mut self, egress: u64, when: DateTime<Utc>) {
        if when >= self.previous_month.period.from && when < self.current_month.period.from {
            self.previous_month.egress += egress;
        }
        if when >= self.current_month.period.from {
            self.current_month.egress += egress;
        }
        if when >= self.current_week.period.from {
            self.current_week.egress += egress;
        }
        if when >= self.current_day.period.from {
            self.current_day.egress += egress;
        }
    }
}
