use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Recurring interval a service is billed on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum BillingCycle {
    Monthly,
    Quarterly,
    SemiAnnually,
    Annually,
    Biennially,
    Triennially,
}

impl BillingCycle {
    pub const ALL: [BillingCycle; 6] = [
        BillingCycle::Monthly,
        BillingCycle::Quarterly,
        BillingCycle::SemiAnnually,
        BillingCycle::Annually,
        BillingCycle::Biennially,
        BillingCycle::Triennially,
    ];

    pub fn months(self) -> u32 {
        match self {
            BillingCycle::Monthly => 1,
            BillingCycle::Quarterly => 3,
            BillingCycle::SemiAnnually => 6,
            BillingCycle::Annually => 12,
            BillingCycle::Biennially => 24,
            BillingCycle::Triennially => 36,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Quarterly => "quarterly",
            BillingCycle::SemiAnnually => "semi-annually",
            BillingCycle::Annually => "annually",
            BillingCycle::Biennially => "biennially",
            BillingCycle::Triennially => "triennially",
        }
    }

    /// Parse a stored cycle name, falling back to monthly for anything
    /// unrecognised. The fallback is logged so bad rows get noticed.
    pub fn parse_lenient(value: &str) -> BillingCycle {
        match value.parse() {
            Ok(cycle) => cycle,
            Err(_) => {
                tracing::warn!(cycle = %value, "Unknown billing cycle, treating as monthly");
                BillingCycle::Monthly
            }
        }
    }

    /// Advance `from` by one period. Day-of-month overflow clamps to the last
    /// day of the target month (Jan 31 + 1 month = Feb 28/29).
    pub fn advance(self, from: DateTime<Utc>) -> DateTime<Utc> {
        from.checked_add_months(Months::new(self.months()))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownBillingCycle(pub String);

impl fmt::Display for UnknownBillingCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown billing cycle '{}'", self.0)
    }
}

impl std::error::Error for UnknownBillingCycle {}

impl FromStr for BillingCycle {
    type Err = UnknownBillingCycle;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "monthly" => Ok(BillingCycle::Monthly),
            "quarterly" => Ok(BillingCycle::Quarterly),
            "semi-annually" | "semiannually" => Ok(BillingCycle::SemiAnnually),
            "annually" => Ok(BillingCycle::Annually),
            "biennially" => Ok(BillingCycle::Biennially),
            "triennially" => Ok(BillingCycle::Triennially),
            _ => Err(UnknownBillingCycle(s.to_string())),
        }
    }
}

/// Next due date for a cycle given by name. Unknown names advance one month.
pub fn add_billing_period(from: DateTime<Utc>, cycle: &str) -> DateTime<Utc> {
    BillingCycle::parse_lenient(cycle).advance(from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_quarterly_advance() {
        assert_eq!(add_billing_period(date(2024, 1, 15), "quarterly"), date(2024, 4, 15));
    }

    #[test]
    fn test_month_end_clamps() {
        assert_eq!(add_billing_period(date(2024, 1, 31), "monthly"), date(2024, 2, 29));
        assert_eq!(add_billing_period(date(2023, 1, 31), "monthly"), date(2023, 2, 28));
        assert_eq!(add_billing_period(date(2024, 2, 29), "annually"), date(2025, 2, 28));
    }

    #[test]
    fn test_every_cycle() {
        let start = date(2024, 3, 10);
        assert_eq!(add_billing_period(start, "monthly"), date(2024, 4, 10));
        assert_eq!(add_billing_period(start, "semi-annually"), date(2024, 9, 10));
        assert_eq!(add_billing_period(start, "annually"), date(2025, 3, 10));
        assert_eq!(add_billing_period(start, "biennially"), date(2026, 3, 10));
        assert_eq!(add_billing_period(start, "triennially"), date(2027, 3, 10));
    }

    #[test]
    fn test_unknown_cycle_falls_back_to_monthly() {
        assert_eq!(add_billing_period(date(2024, 5, 1), "fortnightly"), date(2024, 6, 1));
        assert!("fortnightly".parse::<BillingCycle>().is_err());
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&BillingCycle::SemiAnnually).unwrap();
        assert_eq!(json, "\"semi-annually\"");
        assert_eq!("Semi_Annually".parse::<BillingCycle>().unwrap(), BillingCycle::SemiAnnually);
    }
}
