//! Timestamp window enforcement.
//!
//! Stale batches get a 204 silent drop: the event is not an error, but the
//! client must not retry it.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampCheck {
    /// Within the window, or legitimately absent.
    Valid(Option<i64>),
    /// Production requires a timestamp alongside a signature.
    MissingRequired,
    /// Outside the ±W window; silently dropped.
    Stale,
}

pub fn check_timestamp(
    header: Option<&str>,
    signature_present: bool,
    is_production: bool,
    now_ms: i64,
    window_ms: i64,
) -> TimestampCheck {
    let parsed = header.and_then(|v| v.trim().parse::<i64>().ok());

    let Some(timestamp) = parsed else {
        if is_production && signature_present {
            return TimestampCheck::MissingRequired;
        }
        return TimestampCheck::Valid(None);
    };

    if (now_ms - timestamp).abs() > window_ms {
        return TimestampCheck::Stale;
    }
    TimestampCheck::Valid(Some(timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;
    const WINDOW: i64 = 300_000;

    #[test]
    fn test_exactly_at_window_is_accepted() {
        let at_edge = (NOW - WINDOW).to_string();
        assert_eq!(
            check_timestamp(Some(&at_edge), true, true, NOW, WINDOW),
            TimestampCheck::Valid(Some(NOW - WINDOW))
        );
    }

    #[test]
    fn test_one_ms_past_window_is_stale() {
        let past = (NOW - WINDOW - 1).to_string();
        assert_eq!(
            check_timestamp(Some(&past), true, true, NOW, WINDOW),
            TimestampCheck::Stale
        );
        // Future skew is symmetric.
        let future = (NOW + WINDOW + 1).to_string();
        assert_eq!(
            check_timestamp(Some(&future), true, true, NOW, WINDOW),
            TimestampCheck::Stale
        );
    }

    #[test]
    fn test_missing_with_signature_in_production() {
        assert_eq!(
            check_timestamp(None, true, true, NOW, WINDOW),
            TimestampCheck::MissingRequired
        );
        // Unsigned production request: absence is tolerated here (the
        // signature gate already ran).
        assert_eq!(
            check_timestamp(None, false, true, NOW, WINDOW),
            TimestampCheck::Valid(None)
        );
        // Non-production tolerates absence either way.
        assert_eq!(
            check_timestamp(None, true, false, NOW, WINDOW),
            TimestampCheck::Valid(None)
        );
    }

    #[test]
    fn test_unparseable_treated_as_missing() {
        assert_eq!(
            check_timestamp(Some("garbage"), true, true, NOW, WINDOW),
            TimestampCheck::MissingRequired
        );
        assert_eq!(
            check_timestamp(Some("garbage"), false, false, NOW, WINDOW),
            TimestampCheck::Valid(None)
        );
    }
}
