//! East Africa Time helpers. Daraja timestamps and customer-facing dates are
//! all in EAT (UTC+3, no daylight saving).

use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};

const EAT_OFFSET_SECS: i32 = 3 * 3600;
const DARAJA_FORMAT: &str = "%Y%m%d%H%M%S";

pub fn eat() -> FixedOffset {
    FixedOffset::east_opt(EAT_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

/// `YYYYMMDDHHmmss` in EAT, as Daraja expects in STK requests.
pub fn daraja_timestamp(at: DateTime<Utc>) -> String {
    at.with_timezone(&eat()).format(DARAJA_FORMAT).to_string()
}

/// Parses a Daraja `TransactionDate` (EAT) into UTC.
pub fn parse_daraja_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw.trim(), DARAJA_FORMAT).ok()?;
    eat()
        .from_local_datetime(&naive)
        .single()
        .map(|local| local.with_timezone(&Utc))
}

/// Kick-off time as printed on tickets and SMS, e.g. `Sat 14 Mar 2026, 15:00 EAT`.
pub fn display_kickoff(at: DateTime<Utc>) -> String {
    format!("{} EAT", at.with_timezone(&eat()).format("%a %d %b %Y, %H:%M"))
}
