//! Hardware sensor sampling.
//!
//! Once a second the daemon samples the platform's thermal files and
//! the system load, formats the readings, and pushes them to active
//! clients. Readings that fail to sample simply disappear from the
//! table.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bondcast_common::models::NotificationKind;

use crate::notify;
use crate::server::{now_ms, Server, ACTIVE_TO};

/// SoC temperature above which the operator gets a standing warning,
/// in millidegrees.
const SOC_TEMP_CRITICAL: i64 = 95_000;

/// Thermal sample files per platform tag.
fn thermal_paths(platform: &str) -> Vec<(&'static str, &'static str)> {
    match platform {
        "rk3588" => vec![
            ("SoC temperature", "/sys/class/thermal/thermal_zone0/temp"),
            ("GPU temperature", "/sys/class/thermal/thermal_zone5/temp"),
        ],
        "jetson" => vec![(
            "SoC temperature",
            "/sys/devices/virtual/thermal/thermal_zone1/temp",
        )],
        _ => vec![("SoC temperature", "/sys/class/thermal/thermal_zone0/temp")],
    }
}

/// Format millidegrees the way the UI shows them.
pub fn format_temp(millidegrees: i64) -> String {
    format!("{:.1} °C", millidegrees as f64 / 1000.0)
}

fn sample(platform: &str) -> (BTreeMap<String, String>, Option<i64>) {
    let mut readings = BTreeMap::new();
    let mut soc_temp = None;

    for (label, path) in thermal_paths(platform) {
        if let Some(milli) = std::fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
        {
            if label == "SoC temperature" {
                soc_temp = Some(milli);
            }
            readings.insert(label.to_string(), format_temp(milli));
        }
    }

    let mut sys = sysinfo::System::new();
    sys.refresh_cpu_all();
    sys.refresh_memory();
    readings.insert(
        "CPU usage".to_string(),
        format!("{:.0}%", sys.global_cpu_usage()),
    );
    readings.insert(
        "Memory used".to_string(),
        format!("{} MB", sys.used_memory() / 1_048_576),
    );

    (readings, soc_temp)
}

pub async fn run_monitor(server: Arc<Server>) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tick.tick().await;
        let (readings, soc_temp) = sample(&server.setup.platform);
        let mut core = server.core.lock().await;
        core.sensors = readings;
        let value = serde_json::to_value(&core.sensors).expect("sensors");
        core.broadcast_active("sensors", &value, now_ms() - ACTIVE_TO);

        // Standing warning while the SoC runs critically hot. The
        // bus rate-limits the once-a-second refresh.
        match soc_temp {
            Some(milli) if milli >= SOC_TEMP_CRITICAL => {
                let msg = format!("SoC temperature critical: {}", format_temp(milli));
                notify::send(
                    &mut core,
                    None,
                    "soc_temp",
                    NotificationKind::Warning,
                    &msg,
                    0,
                    true,
                    false,
                );
            }
            _ => notify::remove(&mut core, "soc_temp"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperatures_format_to_one_decimal() {
        assert_eq!(format_temp(54_321), "54.3 °C");
        assert_eq!(format_temp(7_000), "7.0 °C");
        assert_eq!(format_temp(-1_500), "-1.5 °C");
    }

    #[test]
    fn every_platform_samples_at_least_the_soc() {
        for platform in ["rk3588", "jetson", "unknown-board"] {
            assert!(!thermal_paths(platform).is_empty());
        }
    }
}
