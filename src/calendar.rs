use crate::http::build_client;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use reqwest::Client;
use std::collections::HashMap;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;

/// All deadline arithmetic runs on Moscow wall-clock time regardless of the
/// host timezone. MSK has no DST, so a plain offset shift is exact.
fn msk_offset() -> Duration {
    Duration::hours(3)
}

/// Applications accepted after this hour roll over to the next working day.
const CUTOFF_HOUR: u32 = 16;

const CACHE_TTL_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum CalendarError {
    #[error("day classifier request failed: {0}")]
    Request(String),
    #[error("day classifier returned unrecognized code `{0}`")]
    UnknownCode(String),
}

/// External classification of a calendar day. The production impl talks to
/// isdayoff.ru; tests substitute a fixed weekday calendar.
#[async_trait]
pub trait DayClassifier: Send + Sync {
    async fn day_code(&self, date: NaiveDate) -> Result<u8, CalendarError>;
}

#[derive(Debug, Clone)]
pub struct IsDayOffClient {
    base_url: String,
    http: Client,
}

impl IsDayOffClient {
    pub fn from_env() -> Self {
        let base_url = std::env::var("ISDAYOFF_BASE_URL")
            .unwrap_or_else(|_| "https://isdayoff.ru".to_string());
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: build_client(),
        }
    }
}

#[async_trait]
impl DayClassifier for IsDayOffClient {
    async fn day_code(&self, date: NaiveDate) -> Result<u8, CalendarError> {
        let url = format!(
            "{}/api/getdata?year={}&month={:02}&day={:02}&cc=ru",
            self.base_url,
            date.year(),
            date.month(),
            date.day()
        );
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| CalendarError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(CalendarError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|err| CalendarError::Request(err.to_string()))?;
        let trimmed = body.trim();
        trimmed
            .parse::<u8>()
            .map_err(|_| CalendarError::UnknownCode(trimmed.to_string()))
    }
}

/// Permit duration category. Six- and twelve-month permits share the same
/// ten-working-day processing window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermitCategory {
    Temporary,
    Yearly,
}

pub fn resolve_category(raw: &str) -> Option<PermitCategory> {
    match raw.trim().to_lowercase().as_str() {
        "временный" => Some(PermitCategory::Temporary),
        "6 месяцев" | "12 месяцев" => Some(PermitCategory::Yearly),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct ReadyAt {
    #[allow(dead_code)]
    pub at: DateTime<Utc>,
    pub formatted: String,
}

struct CachedDay {
    working: bool,
    fetched_at: Instant,
}

/// Computes the expected "permit ready" instant from the submission instant
/// and the permit category, counting only working days as classified by the
/// injected [`DayClassifier`]. Classifier failures propagate: a deadline
/// must not be computed by assuming every day is a working day.
pub struct DeadlineCalculator<D: DayClassifier> {
    classifier: D,
    cache: Mutex<HashMap<NaiveDate, CachedDay>>,
}

impl<D: DayClassifier> DeadlineCalculator<D> {
    pub fn new(classifier: D) -> Self {
        Self {
            classifier,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn compute_ready_at(
        &self,
        submitted_at: DateTime<Utc>,
        category: PermitCategory,
    ) -> Result<ReadyAt, CalendarError> {
        let submitted_msk = to_msk(submitted_at);
        let after_cutoff = submitted_msk.hour() >= CUTOFF_HOUR;
        let submitted_on_workday = self.is_working_day(submitted_msk.date()).await?;
        let rolled_over = !submitted_on_workday || after_cutoff;

        let ready_msk = match category {
            PermitCategory::Temporary => {
                if rolled_over {
                    self.next_workday_at_cutoff(submitted_msk.date()).await?
                } else {
                    self.add_workdays(submitted_msk, 1).await?
                }
            }
            PermitCategory::Yearly => {
                let baseline = if rolled_over {
                    self.next_workday_at_cutoff(submitted_msk.date()).await?
                } else {
                    submitted_msk
                };
                self.add_workdays(baseline, 10).await?
            }
        };

        Ok(ReadyAt {
            at: from_msk(ready_msk),
            formatted: format_msk(ready_msk),
        })
    }

    async fn is_working_day(&self, date: NaiveDate) -> Result<bool, CalendarError> {
        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.get(&date)
                && entry.fetched_at.elapsed().as_secs() < CACHE_TTL_SECS
            {
                return Ok(entry.working);
            }
        }

        let code = self.classifier.day_code(date).await?;
        // 0 = working, 2 = shortened, 4 = working under special regime;
        // 1 = day off. Anything else is a classifier-level error code.
        let working = match code {
            0 | 2 | 4 => true,
            1 => false,
            other => return Err(CalendarError::UnknownCode(other.to_string())),
        };

        let mut cache = self.cache.lock().await;
        cache.insert(
            date,
            CachedDay {
                working,
                fetched_at: Instant::now(),
            },
        );
        Ok(working)
    }

    async fn next_workday_at_cutoff(
        &self,
        from: NaiveDate,
    ) -> Result<NaiveDateTime, CalendarError> {
        let mut cursor = from;
        loop {
            cursor += Duration::days(1);
            if self.is_working_day(cursor).await? {
                return Ok(cursor
                    .and_hms_opt(CUTOFF_HOUR, 0, 0)
                    .unwrap_or_else(|| cursor.and_time(Default::default())));
            }
        }
    }

    async fn add_workdays(
        &self,
        base: NaiveDateTime,
        days: u32,
    ) -> Result<NaiveDateTime, CalendarError> {
        let mut cursor = base;
        let mut added = 0;
        while added < days {
            cursor += Duration::days(1);
            if self.is_working_day(cursor.date()).await? {
                added += 1;
            }
        }
        Ok(cursor)
    }
}

fn to_msk(instant: DateTime<Utc>) -> NaiveDateTime {
    (instant + msk_offset()).naive_utc()
}

fn from_msk(local: NaiveDateTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&(local - msk_offset()))
}

fn format_msk(local: NaiveDateTime) -> String {
    format!("{} (МСК)", local.format("%Y-%m-%d %H:%M"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Plain weekday calendar: Sat/Sun off, everything else working.
    struct WeekdayCalendar {
        calls: AtomicUsize,
    }

    impl WeekdayCalendar {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DayClassifier for WeekdayCalendar {
        async fn day_code(&self, date: NaiveDate) -> Result<u8, CalendarError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match date.weekday() {
                Weekday::Sat | Weekday::Sun => Ok(1),
                _ => Ok(0),
            }
        }
    }

    struct BrokenCalendar;

    #[async_trait]
    impl DayClassifier for BrokenCalendar {
        async fn day_code(&self, _date: NaiveDate) -> Result<u8, CalendarError> {
            Err(CalendarError::Request("connection refused".into()))
        }
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[tokio::test]
    async fn temporary_before_cutoff_adds_one_working_day() {
        let calc = DeadlineCalculator::new(WeekdayCalendar::new());
        // Wednesday 2026-03-04 10:00 MSK == 07:00 UTC
        let ready = calc
            .compute_ready_at(utc(2026, 3, 4, 7, 0), PermitCategory::Temporary)
            .await
            .expect("ready at");
        assert_eq!(ready.formatted, "2026-03-05 10:00 (МСК)");
        assert_eq!(ready.at, utc(2026, 3, 5, 7, 0));
    }

    #[tokio::test]
    async fn temporary_after_cutoff_rolls_to_next_workday_at_16() {
        let calc = DeadlineCalculator::new(WeekdayCalendar::new());
        // Friday 2026-03-06 17:30 MSK == 14:30 UTC
        let ready = calc
            .compute_ready_at(utc(2026, 3, 6, 14, 30), PermitCategory::Temporary)
            .await
            .expect("ready at");
        assert_eq!(ready.formatted, "2026-03-09 16:00 (МСК)");
    }

    #[tokio::test]
    async fn temporary_on_day_off_rolls_to_next_workday_at_16() {
        let calc = DeadlineCalculator::new(WeekdayCalendar::new());
        // Saturday 2026-03-07 11:00 MSK
        let ready = calc
            .compute_ready_at(utc(2026, 3, 7, 8, 0), PermitCategory::Temporary)
            .await
            .expect("ready at");
        assert_eq!(ready.formatted, "2026-03-09 16:00 (МСК)");
    }

    #[tokio::test]
    async fn yearly_counts_ten_working_days() {
        let calc = DeadlineCalculator::new(WeekdayCalendar::new());
        // Monday 2026-03-02 09:00 MSK; two weekends in between.
        let ready = calc
            .compute_ready_at(utc(2026, 3, 2, 6, 0), PermitCategory::Yearly)
            .await
            .expect("ready at");
        assert_eq!(ready.formatted, "2026-03-16 09:00 (МСК)");
    }

    #[tokio::test]
    async fn classifier_calls_are_cached_per_day() {
        let calc = DeadlineCalculator::new(WeekdayCalendar::new());
        let submitted = utc(2026, 3, 4, 7, 0);
        calc.compute_ready_at(submitted, PermitCategory::Temporary)
            .await
            .expect("first");
        let after_first = calc.classifier.calls.load(Ordering::SeqCst);
        calc.compute_ready_at(submitted, PermitCategory::Temporary)
            .await
            .expect("second");
        assert_eq!(calc.classifier.calls.load(Ordering::SeqCst), after_first);
    }

    #[tokio::test]
    async fn classifier_failure_propagates() {
        let calc = DeadlineCalculator::new(BrokenCalendar);
        let err = calc
            .compute_ready_at(utc(2026, 3, 4, 7, 0), PermitCategory::Temporary)
            .await
            .expect_err("must fail loudly");
        assert!(matches!(err, CalendarError::Request(_)));
    }

    #[test]
    fn category_resolution() {
        assert_eq!(resolve_category("Временный"), Some(PermitCategory::Temporary));
        assert_eq!(resolve_category("6 месяцев"), Some(PermitCategory::Yearly));
        assert_eq!(resolve_category("12 месяцев"), Some(PermitCategory::Yearly));
        assert_eq!(resolve_category("разовый"), None);
        assert_eq!(resolve_category(""), None);
    }
}
