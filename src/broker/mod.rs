//! Embedded in-process message broker: subject routing with queue groups,
//! sled-backed durable streams and a supervised lifecycle. The bus client
//! connects to this core when the broker is enabled.

pub mod core;
pub mod lifecycle;

pub use self::core::BrokerCore;
pub use lifecycle::EmbeddedBroker;

use crate::{Error, Result};

/// Parse a storage/memory cap of the form `<n>{B|KB|MB|GB|TB}`.
pub fn parse_size(raw: &str) -> Result<u64> {
    let trimmed = raw.trim().to_uppercase();
    let (digits, multiplier) = if let Some(n) = trimmed.strip_suffix("TB") {
        (n, 1_u64 << 40)
    } else if let Some(n) = trimmed.strip_suffix("GB") {
        (n, 1_u64 << 30)
    } else if let Some(n) = trimmed.strip_suffix("MB") {
        (n, 1_u64 << 20)
    } else if let Some(n) = trimmed.strip_suffix("KB") {
        (n, 1_u64 << 10)
    } else if let Some(n) = trimmed.strip_suffix('B') {
        (n, 1_u64)
    } else {
        return Err(Error::Validation {
            field: "size".to_string(),
            reason: format!("'{raw}' has no size unit (B|KB|MB|GB|TB)"),
        });
    };

    let value: u64 = digits.trim().parse().map_err(|_| Error::Validation {
        field: "size".to_string(),
        reason: format!("'{raw}' is not a number with a size unit"),
    })?;
    value.checked_mul(multiplier).ok_or_else(|| Error::Validation {
        field: "size".to_string(),
        reason: format!("'{raw}' overflows"),
    })
}
