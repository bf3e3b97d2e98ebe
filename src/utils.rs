//! # Utility Functions
//!
//! Common utility functions used throughout the swap engine.

use crate::error::{SwapError, SwapResult};

/// Shorten `value` to `head...tail` when it is longer than both plus the ellipsis
fn ellipsize(value: &str, head: usize, tail: usize) -> String {
    if value.len() <= head + tail + 3 || !value.is_ascii() {
        return value.to_string();
    }
    format!("{}...{}", &value[..head], &value[value.len() - tail..])
}

/// Address display helpers
pub mod address {
    use crate::config::ui::{ADDRESS_DISPLAY_PREFIX, ADDRESS_DISPLAY_SUFFIX};

    /// e.g. `tb1qrp33...0sl5k7`
    pub fn format_short(address: &str) -> String {
        super::ellipsize(address, ADDRESS_DISPLAY_PREFIX, ADDRESS_DISPLAY_SUFFIX)
    }
}

/// Transaction id helpers
pub mod txid {
    use super::*;
    use crate::config::ui::{TXID_DISPLAY_PREFIX, TXID_DISPLAY_SUFFIX};

    pub fn format_short(txid: &str) -> String {
        ellipsize(txid, TXID_DISPLAY_PREFIX, TXID_DISPLAY_SUFFIX)
    }

    /// Validate a Bitcoin transaction ID (64 hex characters)
    pub fn validate(txid: &str) -> SwapResult<()> {
        if txid.len() != 64 {
            return Err(SwapError::transaction(format!(
                "Transaction ID must be 64 characters, got {}",
                txid.len()
            )));
        }

        if !txid.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(SwapError::transaction(
                "Transaction ID must contain only hexadecimal characters",
            ));
        }

        Ok(())
    }
}

/// Amount formatting utilities
pub mod amount {
    use bitcoin::Amount;

    /// `50000 sats (0.00050000 BTC)`
    pub fn format_dual(sats: u64) -> String {
        format!("{} sats ({:.8} BTC)", sats, Amount::from_sat(sats).to_btc())
    }

    /// Format a wei amount as ETH with up to 18 decimals, trailing zeros trimmed
    pub fn format_wei(wei: u128) -> String {
        const WEI_PER_ETH: u128 = 1_000_000_000_000_000_000;
        let whole = wei / WEI_PER_ETH;
        let fraction = wei % WEI_PER_ETH;
        if fraction == 0 {
            return format!("{} ETH", whole);
        }
        let digits = format!("{:018}", fraction);
        format!("{}.{} ETH", whole, digits.trim_end_matches('0'))
    }
}

/// Time utilities
pub mod time {
    use chrono::{DateTime, Utc};

    /// Format a timestamp for display
    pub fn format_timestamp(datetime: &DateTime<Utc>) -> String {
        datetime.format("%Y-%m-%d %H:%M:%S UTC").to_string()
    }

    /// Format a UNIX timestamp (seconds) for display
    pub fn format_unix(seconds: u64) -> String {
        match DateTime::<Utc>::from_timestamp(seconds as i64, 0) {
            Some(datetime) => format_timestamp(&datetime),
            None => format!("{} (out of range)", seconds),
        }
    }

    /// `now + seconds` as a 32-bit unix time, `None` once it no longer fits
    pub fn unix_after(now: &DateTime<Utc>, seconds: u32) -> Option<u32> {
        u32::try_from(now.timestamp()).ok()?.checked_add(seconds)
    }

    /// `1h 2m 5s`, leading zero units dropped
    pub fn format_duration(total_seconds: u64) -> String {
        let units = [
            (total_seconds / 3_600, "h"),
            (total_seconds / 60 % 60, "m"),
            (total_seconds % 60, "s"),
        ];
        let first = units.iter().position(|(value, _)| *value > 0).unwrap_or(2);
        units[first..]
            .iter()
            .map(|(value, unit)| format!("{}{}", value, unit))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// File system utilities
pub mod fs {
    use super::*;
    use crate::config::files::TEMP_EXTENSION;
    use std::fs;
    use std::io::Write;
    use std::path::Path;

    /// Ensure directory exists, create if it doesn't
    pub fn ensure_dir_exists(path: &Path) -> SwapResult<()> {
        if !path.exists() {
            fs::create_dir_all(path)?;
        }
        Ok(())
    }

    /// Replace `path` with `content` atomically.
    ///
    /// The content is written and synced to a sibling temp file which is then
    /// renamed over the target, so readers see either the old or the new
    /// file, never a partial one.
    pub fn write_file_atomic(path: &Path, content: &[u8]) -> SwapResult<()> {
        let temp_path = path.with_extension(TEMP_EXTENSION);
        {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(content)?;
            file.sync_all()?;
        }
        if let Err(e) = fs::rename(&temp_path, path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }
        Ok(())
    }
}

/// Retry utilities
pub mod retry {
    use crate::config::network::{MAX_RETRY_ATTEMPTS, RETRY_DELAY};
    use std::future::Future;
    use tokio::time::sleep;

    /// Retry an async operation with exponential backoff.
    ///
    /// Errors for which `should_retry` is false are returned immediately.
    pub async fn with_backoff<F, Fut, T, E, R>(
        label: &str,
        should_retry: R,
        mut operation: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        R: Fn(&E) -> bool,
    {
        let mut attempts = 0;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(error) => {
                    attempts += 1;
                    if attempts >= MAX_RETRY_ATTEMPTS || !should_retry(&error) {
                        return Err(error);
                    }

                    let delay = RETRY_DELAY * 2_u32.pow(attempts - 1);
                    log::warn!(
                        "{} failed (attempt {}), retrying in {:?}: {}",
                        label,
                        attempts,
                        delay,
                        error
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}
