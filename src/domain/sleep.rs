use std::fmt;

use super::state::VehicleState;

/// Why a parked vehicle cannot be allowed to fall asleep right now.
/// Evaluated in priority order; `None` means the sleep gate may suspend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepBlockReason {
    UserPresent,
    SentryMode,
    Preconditioning,
    ClimateOn,
    DoorsOpen,
    TrunkOpen,
    FrunkOpen,
    WindowsOpen,
    Unlocked,
    PowerUsage,
    DownloadingUpdate,
}

impl SleepBlockReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserPresent => "user_present",
            Self::SentryMode => "sentry_mode",
            Self::Preconditioning => "preconditioning",
            Self::ClimateOn => "climate_on",
            Self::DoorsOpen => "doors_open",
            Self::TrunkOpen => "trunk_open",
            Self::FrunkOpen => "frunk_open",
            Self::WindowsOpen => "windows_open",
            Self::Unlocked => "unlocked",
            Self::PowerUsage => "power_usage",
            Self::DownloadingUpdate => "downloading_update",
        }
    }
}

impl fmt::Display for SleepBlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scans the snapshot for the highest-priority sleep blocker. `unlocked`
/// only counts when the deployment opted into `require_not_unlocked`.
pub fn evaluate(snapshot: &VehicleState, require_not_unlocked: bool) -> Option<SleepBlockReason> {
    if snapshot.is_user_present {
        return Some(SleepBlockReason::UserPresent);
    }
    if snapshot.sentry_mode {
        return Some(SleepBlockReason::SentryMode);
    }
    if snapshot.is_preconditioning {
        return Some(SleepBlockReason::Preconditioning);
    }
    if snapshot.is_climate_on {
        return Some(SleepBlockReason::ClimateOn);
    }
    if snapshot.doors_open {
        return Some(SleepBlockReason::DoorsOpen);
    }
    if snapshot.trunk_open {
        return Some(SleepBlockReason::TrunkOpen);
    }
    if snapshot.frunk_open {
        return Some(SleepBlockReason::FrunkOpen);
    }
    if snapshot.windows_open {
        return Some(SleepBlockReason::WindowsOpen);
    }
    if require_not_unlocked && !snapshot.locked {
        return Some(SleepBlockReason::Unlocked);
    }
    if snapshot.power_kw > 0 {
        return Some(SleepBlockReason::PowerUsage);
    }
    if snapshot.software_update_status == "downloading"
        && snapshot.software_update_download_perc < 100
    {
        return Some(SleepBlockReason::DownloadingUpdate);
    }
    None
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use crate::domain::state::{VehicleState, VehicleStateKind};

    use super::{SleepBlockReason, evaluate};

    fn idle_snapshot() -> VehicleState {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let mut snapshot = VehicleState::new(1, VehicleStateKind::Online, now);
        snapshot.locked = true;
        snapshot
    }

    #[test]
    fn idle_locked_vehicle_has_no_blocker() {
        assert_eq!(evaluate(&idle_snapshot(), false), None);
        assert_eq!(evaluate(&idle_snapshot(), true), None);
    }

    #[test]
    fn user_present_outranks_everything() {
        let mut snapshot = idle_snapshot();
        snapshot.is_user_present = true;
        snapshot.sentry_mode = true;
        snapshot.doors_open = true;
        snapshot.power_kw = 5;
        assert_eq!(
            evaluate(&snapshot, false),
            Some(SleepBlockReason::UserPresent)
        );
    }

    #[test]
    fn priority_order_holds_across_the_eleven_conditions() {
        let mut snapshot = idle_snapshot();
        snapshot.locked = false;
        snapshot.sentry_mode = true;
        snapshot.is_preconditioning = true;
        snapshot.is_climate_on = true;
        snapshot.doors_open = true;
        snapshot.trunk_open = true;
        snapshot.frunk_open = true;
        snapshot.windows_open = true;
        snapshot.power_kw = 2;
        snapshot.software_update_status = "downloading".to_string();
        snapshot.software_update_download_perc = 40;

        let expected = [
            SleepBlockReason::SentryMode,
            SleepBlockReason::Preconditioning,
            SleepBlockReason::ClimateOn,
            SleepBlockReason::DoorsOpen,
            SleepBlockReason::TrunkOpen,
            SleepBlockReason::FrunkOpen,
            SleepBlockReason::WindowsOpen,
            SleepBlockReason::Unlocked,
            SleepBlockReason::PowerUsage,
            SleepBlockReason::DownloadingUpdate,
        ];
        for reason in expected {
            assert_eq!(evaluate(&snapshot, true), Some(reason), "expected {reason}");
            match reason {
                SleepBlockReason::SentryMode => snapshot.sentry_mode = false,
                SleepBlockReason::Preconditioning => snapshot.is_preconditioning = false,
                SleepBlockReason::ClimateOn => snapshot.is_climate_on = false,
                SleepBlockReason::DoorsOpen => snapshot.doors_open = false,
                SleepBlockReason::TrunkOpen => snapshot.trunk_open = false,
                SleepBlockReason::FrunkOpen => snapshot.frunk_open = false,
                SleepBlockReason::WindowsOpen => snapshot.windows_open = false,
                SleepBlockReason::Unlocked => snapshot.locked = true,
                SleepBlockReason::PowerUsage => snapshot.power_kw = 0,
                SleepBlockReason::DownloadingUpdate => {
                    snapshot.software_update_download_perc = 100
                }
                SleepBlockReason::UserPresent => unreachable!(),
            }
        }
        assert_eq!(evaluate(&snapshot, true), None);
    }

    #[test]
    fn unlocked_only_blocks_when_configured() {
        let mut snapshot = idle_snapshot();
        snapshot.locked = false;
        assert_eq!(evaluate(&snapshot, false), None);
        assert_eq!(evaluate(&snapshot, true), Some(SleepBlockReason::Unlocked));
    }

    #[test]
    fn finished_download_does_not_block() {
        let mut snapshot = idle_snapshot();
        snapshot.software_update_status = "downloading".to_string();
        snapshot.software_update_download_perc = 100;
        assert_eq!(evaluate(&snapshot, false), None);

        snapshot.software_update_status = "installing".to_string();
        snapshot.software_update_download_perc = 10;
        assert_eq!(evaluate(&snapshot, false), None);
    }

    #[test]
    fn negative_power_is_not_a_blocker() {
        let mut snapshot = idle_snapshot();
        snapshot.power_kw = -12;
        assert_eq!(evaluate(&snapshot, false), None);
    }
}
