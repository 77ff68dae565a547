//! Billing period resolution
//!
//! Computes the accounting window usage is counted against. Trial accounts
//! use a window ending at `trial_end_date`; active subscriptions use a
//! 30-day window anchored at `current_period_end`; everything else falls
//! back to the current calendar month so usage can still be recorded while
//! billing state is indeterminate.
//!
//! Every account resolves to *some* window; this module never fails.

use time::{Duration, Month, OffsetDateTime, Time};

use avaolo_shared::SubscriptionStatus;

use crate::accounts::FarmerBillingData;

/// Length of the rolling window for active subscriptions.
pub const ACTIVE_PERIOD_DAYS: i64 = 30;

/// The currently active accounting window for one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingPeriod {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
}

/// Resolve the billing period for an account at `now`.
///
/// `trial_days` is the configured trial length; it drives both the trial
/// gating check and the trial usage window so the two cannot drift apart.
pub fn resolve_period(
    account: &FarmerBillingData,
    trial_days: i64,
    now: OffsetDateTime,
) -> BillingPeriod {
    match account.subscription_status {
        SubscriptionStatus::Trial => {
            if let Some(end) = account.trial_end_date {
                return BillingPeriod {
                    start: end - Duration::days(trial_days),
                    end,
                };
            }
        }
        SubscriptionStatus::Active => {
            if let Some(end) = account.current_period_end {
                return BillingPeriod {
                    start: end - Duration::days(ACTIVE_PERIOD_DAYS),
                    end,
                };
            }
        }
        _ => {}
    }
    calendar_month_window(now)
}

/// First of the current month to first of the next month.
pub fn calendar_month_window(now: OffsetDateTime) -> BillingPeriod {
    // Day 1 is valid for every month; the fallbacks are unreachable but keep
    // this path panic-free.
    let start = now
        .replace_day(1)
        .unwrap_or(now)
        .replace_time(Time::MIDNIGHT);

    let end = match start.month() {
        Month::December => start
            .replace_year(start.year() + 1)
            .and_then(|d| d.replace_month(Month::January)),
        m => start.replace_month(m.next()),
    }
    .unwrap_or(start + Duration::days(ACTIVE_PERIOD_DAYS));

    BillingPeriod { start, end }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avaolo_shared::SubscriptionStatus;
    use time::macros::datetime;
    use uuid::Uuid;

    fn account(status: SubscriptionStatus) -> FarmerBillingData {
        FarmerBillingData {
            farmer_id: Uuid::new_v4(),
            subscription_status: status,
            trial_end_date: None,
            current_period_end: None,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            linked_to_farmer_id: None,
        }
    }

    #[test]
    fn test_trial_window_anchored_at_trial_end() {
        let mut a = account(SubscriptionStatus::Trial);
        a.trial_end_date = Some(datetime!(2025-06-10 12:00 UTC));

        let period = resolve_period(&a, 7, datetime!(2025-06-05 00:00 UTC));
        assert_eq!(period.end, datetime!(2025-06-10 12:00 UTC));
        assert_eq!(period.start, datetime!(2025-06-03 12:00 UTC));
    }

    #[test]
    fn test_trial_window_uses_configured_length() {
        let mut a = account(SubscriptionStatus::Trial);
        a.trial_end_date = Some(datetime!(2025-06-10 12:00 UTC));

        let period = resolve_period(&a, 14, datetime!(2025-06-05 00:00 UTC));
        assert_eq!(period.start, datetime!(2025-05-27 12:00 UTC));
    }

    #[test]
    fn test_active_window_is_thirty_days() {
        let mut a = account(SubscriptionStatus::Active);
        a.current_period_end = Some(datetime!(2025-07-01 00:00 UTC));

        let period = resolve_period(&a, 7, datetime!(2025-06-15 00:00 UTC));
        assert_eq!(period.end, datetime!(2025-07-01 00:00 UTC));
        assert_eq!(period.start, datetime!(2025-06-01 00:00 UTC));
    }

    #[test]
    fn test_canceled_falls_back_to_calendar_month() {
        let a = account(SubscriptionStatus::Canceled);

        let period = resolve_period(&a, 7, datetime!(2025-06-15 09:30 UTC));
        assert_eq!(period.start, datetime!(2025-06-01 00:00 UTC));
        assert_eq!(period.end, datetime!(2025-07-01 00:00 UTC));
    }

    #[test]
    fn test_trial_without_end_date_falls_back() {
        let a = account(SubscriptionStatus::Trial);

        let period = resolve_period(&a, 7, datetime!(2025-02-10 00:00 UTC));
        assert_eq!(period.start, datetime!(2025-02-01 00:00 UTC));
        assert_eq!(period.end, datetime!(2025-03-01 00:00 UTC));
    }

    #[test]
    fn test_calendar_month_rolls_over_year() {
        let period = calendar_month_window(datetime!(2025-12-20 18:00 UTC));
        assert_eq!(period.start, datetime!(2025-12-01 00:00 UTC));
        assert_eq!(period.end, datetime!(2026-01-01 00:00 UTC));
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let mut a = account(SubscriptionStatus::Active);
        a.current_period_end = Some(datetime!(2025-07-01 00:00 UTC));

        let now = datetime!(2025-06-15 00:00 UTC);
        assert_eq!(resolve_period(&a, 7, now), resolve_period(&a, 7, now));
    }
}
