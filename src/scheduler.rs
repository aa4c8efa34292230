//! Renewal scheduler (§4.6, node side): computes and tracks `renew_at`.
//!
//! Resolves REDESIGN FLAG R5 (was Q5): the safety margin is
//! `min(7 days, 10% of certificate validity)`, overridable via
//! `NodeConfig::renewal_safety_margin_days`.

use crate::error::CodecError;
use crate::types::Certificate;
use chrono::{DateTime, Duration, Utc};

/// Retry horizon for an outstanding CSR with no answer yet (§4.6).
pub const RETRY_HORIZON: Duration = Duration::hours(1);

const MAX_SAFETY_MARGIN_DAYS: i64 = 7;

/// Compute `renew_at` for an installed node certificate, or `now` when no
/// node credential exists yet (trigger immediately).
pub fn renew_at(
    node_cert: Option<&Certificate>,
    safety_margin_override_days: Option<u32>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, CodecError> {
    let Some(cert) = node_cert else {
        return Ok(now);
    };
    let not_after = cert.not_after()?;
    let margin = match safety_margin_override_days {
        Some(days) => Duration::days(days as i64),
        None => safety_margin(cert.not_before()?, not_after),
    };
    Ok(not_after - margin)
}

/// `min(7 days, 10% of total validity)` (R5).
fn safety_margin(not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> Duration {
    let validity = not_after - not_before;
    let ten_percent = Duration::seconds(validity.num_seconds() / 10);
    std::cmp::min(Duration::days(MAX_SAFETY_MARGIN_DAYS), ten_percent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_certificate_renews_immediately() {
        let now = Utc::now();
        assert_eq!(renew_at(None, None, now).unwrap(), now);
    }

    #[test]
    fn thirty_day_cert_uses_ten_percent_margin() {
        let not_before = Utc::now();
        let not_after = not_before + Duration::days(30);
        let margin = safety_margin(not_before, not_after);
        assert_eq!(margin, Duration::days(3));
    }

    #[test]
    fn ninety_day_cert_uses_seven_day_cap() {
        let not_before = Utc::now();
        let not_after = not_before + Duration::days(90);
        let margin = safety_margin(not_before, not_after);
        assert_eq!(margin, Duration::days(7));
    }
}
