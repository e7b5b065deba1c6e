//! Retry delay and scheduling constraints for the next attempt

use crate::conditions::SystemState;
use chrono::{DateTime, Utc};
use rand::Rng;
use segdl_types::{DownloadInfo, NetworkType, Settings, StatusCode};
use std::time::Duration;

/// Conditions the scheduler must wait for before running a download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constraints {
    pub network: NetworkType,
    pub requires_charging: bool,
    pub requires_battery_not_low: bool,
}

impl Constraints {
    /// The download's own override merged with global settings
    pub fn for_download(info: &DownloadInfo, settings: &Settings) -> Self {
        let network = if info.unmetered_only || settings.unmetered_only {
            NetworkType::Unmetered
        } else if !settings.enable_roaming {
            NetworkType::NotRoaming
        } else {
            NetworkType::Any
        };

        Self {
            network,
            requires_charging: settings.only_charging,
            requires_battery_not_low: settings.battery_control,
        }
    }

    pub fn satisfied_by(&self, state: &SystemState) -> bool {
        let net = &state.network;
        let network_ok = net.connected
            && match self.network {
                NetworkType::Any => true,
                NetworkType::Unmetered => !net.metered,
                NetworkType::NotRoaming => !net.roaming,
            };

        network_ok
            && (!self.requires_charging || state.power.charging)
            && (!self.requires_battery_not_low || !state.power.battery_low)
    }
}

/// Scale `delay` by a random factor in `[1.0, 1.5)`
pub fn fuzz(delay: Duration, rng: &mut impl Rng) -> Duration {
    delay.mul_f64(rng.random_range(1.0..1.5))
}

/// Raw (unfuzzed) delay for the next attempt after `num_failed` failures
pub fn raw_delay(info: &DownloadInfo, settings: &Settings) -> Duration {
    if let Some(ms) = info.retry_after {
        return Duration::from_millis(ms);
    }
    let exponent = info.num_failed.max(1) - 1;
    let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
    settings.retry_base_delay().saturating_mul(factor)
}

/// Delay from `now` until the next attempt of `info` may start.
///
/// Only downloads waiting to retry are delayed; the delay counts from the
/// moment the status was set and never goes below zero.
pub fn next_attempt_delay(
    info: &DownloadInfo,
    settings: &Settings,
    now: DateTime<Utc>,
    rng: &mut impl Rng,
) -> Duration {
    if info.status_code != StatusCode::WaitingToRetry {
        return Duration::ZERO;
    }

    let delay = fuzz(raw_delay(info, settings), rng);
    let elapsed = (now - info.last_modify).to_std().unwrap_or(Duration::ZERO);
    delay.saturating_sub(elapsed)
}
