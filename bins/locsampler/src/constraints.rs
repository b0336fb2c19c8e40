use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use loc_core::cfg::{DeviceCfg, ProbeKind};
use loc_core::job::Constraint;
use tracing::trace;

/// Answers whether a device condition currently holds.
pub trait ConstraintProbe: Send + Sync {
    fn is_met(&self, constraint: Constraint) -> bool;
}

/// Fixed answers, flipped by config or tests.
#[derive(Debug)]
pub struct StaticProbe {
    battery_low: AtomicBool,
    network_available: AtomicBool,
}

impl StaticProbe {
    pub fn new(battery_low: bool, network_available: bool) -> Self {
        Self {
            battery_low: AtomicBool::new(battery_low),
            network_available: AtomicBool::new(network_available),
        }
    }

    pub fn set_battery_low(&self, low: bool) {
        self.battery_low.store(low, Ordering::SeqCst);
    }

    pub fn set_network_available(&self, up: bool) {
        self.network_available.store(up, Ordering::SeqCst);
    }
}

impl ConstraintProbe for StaticProbe {
    fn is_met(&self, constraint: Constraint) -> bool {
        match constraint {
            Constraint::BatteryNotLow => !self.battery_low.load(Ordering::SeqCst),
            Constraint::NetworkAvailable => self.network_available.load(Ordering::SeqCst),
        }
    }
}

/// Reads Linux sysfs: `power_supply/*/{type,capacity,status}` and
/// `net/*/operstate`.
#[derive(Debug, Clone)]
pub struct SysfsProbe {
    power_root: PathBuf,
    net_root: PathBuf,
    low_percent: u8,
}

impl SysfsProbe {
    pub fn new(low_percent: u8) -> Self {
        Self::with_roots("/sys/class/power_supply", "/sys/class/net", low_percent)
    }

    pub fn with_roots(
        power_root: impl Into<PathBuf>,
        net_root: impl Into<PathBuf>,
        low_percent: u8,
    ) -> Self {
        Self { power_root: power_root.into(), net_root: net_root.into(), low_percent }
    }

    /// Low only when some discharging battery sits under the threshold.
    /// No battery at all (desktop, VM) counts as not low.
    fn battery_low(&self) -> bool {
        let Ok(entries) = fs::read_dir(&self.power_root) else { return false };
        for entry in entries.flatten() {
            let dir = entry.path();
            if read_trimmed(&dir.join("type")).as_deref() != Some("Battery") {
                continue;
            }
            let status = read_trimmed(&dir.join("status"));
            if matches!(status.as_deref(), Some("Charging") | Some("Full")) {
                continue;
            }
            let capacity = read_trimmed(&dir.join("capacity")).and_then(|s| s.parse::<u8>().ok());
            trace!(battery = %dir.display(), ?capacity, "battery probe");
            if capacity.is_some_and(|c| c < self.low_percent) {
                return true;
            }
        }
        false
    }

    fn network_up(&self) -> bool {
        let Ok(entries) = fs::read_dir(&self.net_root) else { return false };
        entries.flatten().any(|entry| {
            entry.file_name() != "lo"
                && read_trimmed(&entry.path().join("operstate")).as_deref() == Some("up")
        })
    }
}

impl ConstraintProbe for SysfsProbe {
    fn is_met(&self, constraint: Constraint) -> bool {
        match constraint {
            Constraint::BatteryNotLow => !self.battery_low(),
            Constraint::NetworkAvailable => self.network_up(),
        }
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

/// Probe selected by the `[device]` config section.
pub fn from_cfg(cfg: &DeviceCfg) -> Arc<dyn ConstraintProbe> {
    match cfg.probe {
        ProbeKind::Sysfs => Arc::new(SysfsProbe::new(cfg.battery_low_percent)),
        ProbeKind::Static => Arc::new(StaticProbe::new(cfg.battery_low, cfg.network_available)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, file: &str, body: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(file), body).unwrap();
    }

    fn battery(root: &Path, name: &str, capacity: u8, status: &str) {
        let dir = root.join(name);
        write(&dir, "type", "Battery\n");
        write(&dir, "capacity", &format!("{capacity}\n"));
        write(&dir, "status", &format!("{status}\n"));
    }

    #[test]
    fn battery_threshold_and_charging() {
        let tmp = tempfile::tempdir().unwrap();
        let power = tmp.path().join("power");
        let probe = SysfsProbe::with_roots(&power, tmp.path().join("net"), 15);

        // no power_supply dir at all
        assert!(probe.is_met(Constraint::BatteryNotLow));

        write(&power.join("AC"), "type", "Mains\n");
        battery(&power, "BAT0", 40, "Discharging");
        assert!(probe.is_met(Constraint::BatteryNotLow));

        battery(&power, "BAT0", 9, "Discharging");
        assert!(!probe.is_met(Constraint::BatteryNotLow));

        battery(&power, "BAT0", 9, "Charging");
        assert!(probe.is_met(Constraint::BatteryNotLow));
    }

    #[test]
    fn network_ignores_loopback() {
        let tmp = tempfile::tempdir().unwrap();
        let net = tmp.path().join("net");
        let probe = SysfsProbe::with_roots(tmp.path().join("power"), &net, 15);

        write(&net.join("lo"), "operstate", "up\n");
        write(&net.join("eth0"), "operstate", "down\n");
        assert!(!probe.is_met(Constraint::NetworkAvailable));

        write(&net.join("wlan0"), "operstate", "up\n");
        assert!(probe.is_met(Constraint::NetworkAvailable));
    }

    #[test]
    fn static_probe_flags() {
        let probe = StaticProbe::new(true, false);
        assert!(!probe.is_met(Constraint::BatteryNotLow));
        assert!(!probe.is_met(Constraint::NetworkAvailable));
        probe.set_battery_low(false);
        probe.set_network_available(true);
        assert!(probe.is_met(Constraint::BatteryNotLow));
        assert!(probe.is_met(Constraint::NetworkAvailable));
    }
}
