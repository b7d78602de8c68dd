use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use crate::error::SdkError;
use crate::util::lock_unpoisoned;

pub const DEFAULT_SKEW_THRESHOLD: Duration = Duration::from_secs(4 * 60);

/// Signed distance between the local clock and the server clock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClockOffset {
    millis: i64,
}

impl ClockOffset {
    pub const ZERO: Self = Self { millis: 0 };

    pub const fn from_millis(millis: i64) -> Self {
        Self { millis }
    }

    /// `later - earlier`, negative when `later` is actually earlier.
    pub fn between(later: SystemTime, earlier: SystemTime) -> Self {
        let millis = match later.duration_since(earlier) {
            Ok(ahead) => saturating_millis(ahead),
            Err(behind) => saturating_millis(behind.duration()).saturating_neg(),
        };
        Self { millis }
    }

    pub const fn as_millis(self) -> i64 {
        self.millis
    }

    pub const fn is_zero(self) -> bool {
        self.millis == 0
    }

    pub fn magnitude(self) -> Duration {
        Duration::from_millis(self.millis.unsigned_abs())
    }

    pub fn apply(self, time: SystemTime) -> SystemTime {
        let shift = self.magnitude();
        if self.millis >= 0 {
            time.checked_add(shift).unwrap_or(time)
        } else {
            time.checked_sub(shift).unwrap_or(time)
        }
    }
}

impl std::fmt::Display for ClockOffset {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}ms", self.millis)
    }
}

fn saturating_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[derive(Debug, Default)]
struct SkewInner {
    offset: ClockOffset,
    has_been_set: bool,
}

/// Client-wide clock offset applied to every signing time.
///
/// Lives as long as the client (or longer, when shared between clients) and
/// is only cleared by [`ClockSkewState::reset`].
#[derive(Debug, Default)]
pub struct ClockSkewState {
    inner: Mutex<SkewInner>,
}

impl ClockSkewState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(&self) -> ClockOffset {
        lock_unpoisoned(&self.inner).offset
    }

    pub fn has_been_set(&self) -> bool {
        lock_unpoisoned(&self.inner).has_been_set
    }

    pub fn set(&self, offset: ClockOffset) -> ClockOffset {
        let mut inner = lock_unpoisoned(&self.inner);
        let previous = inner.offset;
        inner.offset = offset;
        inner.has_been_set = true;
        previous
    }

    pub fn reset(&self) {
        let mut inner = lock_unpoisoned(&self.inner);
        *inner = SkewInner::default();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SkewCorrection {
    pub previous: ClockOffset,
    pub offset: ClockOffset,
    /// How far the server date was from the time the attempt was signed at.
    pub signing_delta: ClockOffset,
}

#[derive(Clone, Copy, Debug)]
pub struct ClockSkewCorrector {
    threshold: Duration,
    enabled: bool,
}

impl ClockSkewCorrector {
    pub fn new() -> Self {
        Self {
            threshold: DEFAULT_SKEW_THRESHOLD,
            enabled: true,
        }
    }

    pub fn threshold(mut self, threshold: Duration) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn configured_threshold(&self) -> Duration {
        self.threshold
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Inspects a failed attempt and updates `state` when the server's
    /// `Date` disagrees with the attempt's signing time by more than the
    /// threshold.
    ///
    /// `signing_time` must be the already-corrected time the attempt was
    /// signed at, so a client that already carries the right offset does not
    /// correct again.
    pub fn observe(
        &self,
        state: &ClockSkewState,
        error: &SdkError,
        signing_time: SystemTime,
        received_at: SystemTime,
    ) -> Option<SkewCorrection> {
        if !self.enabled || !error.is_clock_skew_candidate() {
            return None;
        }
        let server_date = error.server_date()?;

        let signing_delta = ClockOffset::between(server_date, signing_time);
        if signing_delta.magnitude() <= self.threshold {
            return None;
        }

        let offset = ClockOffset::between(server_date, received_at);
        let previous = state.set(offset);
        Some(SkewCorrection {
            previous,
            offset,
            signing_delta,
        })
    }
}

impl Default for ClockSkewCorrector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use http::header::DATE;
    use http::{HeaderMap, HeaderValue, StatusCode};

    use super::{ClockOffset, ClockSkewCorrector, ClockSkewState};
    use crate::error::{ErrorKind, SdkError};

    fn base_time() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    fn failure_with_date(kind: ErrorKind, status: u16, date: SystemTime) -> SdkError {
        let mut headers = HeaderMap::new();
        headers.insert(
            DATE,
            HeaderValue::from_str(&httpdate::fmt_http_date(date)).unwrap(),
        );
        SdkError::new(kind, "rejected")
            .with_status(StatusCode::from_u16(status).unwrap())
            .with_response_headers(headers)
    }

    #[test]
    fn offset_between_is_signed() {
        let now = base_time();
        let ahead = now + Duration::from_secs(3600);
        assert_eq!(ClockOffset::between(ahead, now).as_millis(), 3_600_000);
        assert_eq!(ClockOffset::between(now, ahead).as_millis(), -3_600_000);
        assert_eq!(ClockOffset::from_millis(-1_000).apply(now), now - Duration::from_secs(1));
    }

    #[test]
    fn server_an_hour_ahead_sets_the_offset() {
        let now = base_time();
        let server = now + Duration::from_secs(3600);
        let state = ClockSkewState::new();
        let error = failure_with_date(ErrorKind::ClientFault, 400, server);

        let correction = ClockSkewCorrector::new()
            .observe(&state, &error, now, now)
            .expect("an hour of skew should be corrected");
        assert_eq!(correction.previous, ClockOffset::ZERO);
        assert_eq!(correction.offset.as_millis(), 3_600_000);
        assert_eq!(state.offset().as_millis(), 3_600_000);
        assert!(state.has_been_set());
    }

    #[test]
    fn skew_within_threshold_is_ignored() {
        let now = base_time();
        let state = ClockSkewState::new();
        let error =
            failure_with_date(ErrorKind::ClientFault, 400, now + Duration::from_secs(120));

        assert!(ClockSkewCorrector::new().observe(&state, &error, now, now).is_none());
        assert!(!state.has_been_set());
        assert!(state.offset().is_zero());
    }

    #[test]
    fn corrected_signing_time_does_not_correct_again() {
        let now = base_time();
        let server = now + Duration::from_secs(3600);
        let state = ClockSkewState::new();
        state.set(ClockOffset::between(server, now));
        let error = failure_with_date(ErrorKind::SignatureOrClockSkew, 403, server);

        let signing_time = state.offset().apply(now);
        assert!(
            ClockSkewCorrector::new()
                .observe(&state, &error, signing_time, now)
                .is_none()
        );
    }

    #[test]
    fn moved_server_clock_corrects_again() {
        let now = base_time();
        let state = ClockSkewState::new();
        state.set(ClockOffset::from_millis(3_600_000));
        let server = now - Duration::from_secs(3600);
        let error = failure_with_date(ErrorKind::SignatureOrClockSkew, 401, server);

        let signing_time = state.offset().apply(now);
        let correction = ClockSkewCorrector::new()
            .observe(&state, &error, signing_time, now)
            .expect("server clock moved");
        assert_eq!(correction.previous.as_millis(), 3_600_000);
        assert_eq!(state.offset().as_millis(), -3_600_000);
    }

    #[test]
    fn ineligible_errors_and_disabled_corrector_leave_state_alone() {
        let now = base_time();
        let server = now + Duration::from_secs(3600);
        let state = ClockSkewState::new();

        let not_found = failure_with_date(ErrorKind::ClientFault, 404, server);
        assert!(ClockSkewCorrector::new().observe(&state, &not_found, now, now).is_none());

        let server_fault = failure_with_date(ErrorKind::ServerFault, 500, server);
        assert!(ClockSkewCorrector::new().observe(&state, &server_fault, now, now).is_none());

        let eligible = failure_with_date(ErrorKind::ClientFault, 400, server);
        assert!(
            ClockSkewCorrector::new()
                .enabled(false)
                .observe(&state, &eligible, now, now)
                .is_none()
        );
        assert!(!state.has_been_set());
    }

    #[test]
    fn missing_date_header_is_not_corrected() {
        let now = base_time();
        let state = ClockSkewState::new();
        let error = SdkError::new(ErrorKind::SignatureOrClockSkew, "expired")
            .with_status(StatusCode::FORBIDDEN);
        assert!(ClockSkewCorrector::new().observe(&state, &error, now, now).is_none());
    }

    #[test]
    fn reset_clears_offset() {
        let state = ClockSkewState::new();
        state.set(ClockOffset::from_millis(42));
        state.reset();
        assert!(state.offset().is_zero());
        assert!(!state.has_been_set());
    }
}
