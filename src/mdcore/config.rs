//! Configuration (spec.md §6 "External Interfaces" env vars; SPEC_FULL.md
//! ambient-stack section). A small, explicit struct built once at startup
//! from the process environment, the way the teacher's `main.rs` reads
//! `RUST_LOG` directly rather than threading a config object through every
//! call — here there's more than one variable, so it earns a struct.

use crate::mdcore::error::MdError;
use anyhow::Result;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Home-host identity policy used by incremental assembly (spec.md
    /// §4.4, §4.7).
    pub homehost: Option<String>,
    /// External command exec'd on alert-worthy monitor events.
    pub alert_command: Option<String>,
    /// Mail recipient for alert-worthy monitor events lacking a command.
    pub mail_to: Option<String>,
    /// Poll interval for the monitor loop.
    pub monitor_interval: Duration,
    /// Path to the name/UUID map file (spec.md §4.7).
    pub map_path: String,
    /// `MDADM_NO_UDEV=1` — disable udev integration, fall back to the
    /// `/proc/mdstat` poll path for event detection (spec.md §4.6, §6).
    pub no_udev: bool,
    /// `MDADM_CONF_AUTO` — prepended to the config file's AUTO line.
    pub conf_auto: Option<String>,
    /// `IMSM_NO_PLATFORM=1` — skip the platform OROM/EFI capability query
    /// during create validation (spec.md §4.3 step 8).
    pub imsm_no_platform: bool,
    /// `IMSM_DEVNAME_AS_SERIAL=1` — substitute `/dev/name` for a member's
    /// reported serial (test aid; spec.md §6).
    pub imsm_devname_as_serial: bool,
}

fn env_flag(name: &str) -> bool {
    env::var(name).map(|v| v == "1").unwrap_or(false)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let monitor_interval = match env::var("MDCORE_MONITOR_INTERVAL_SECS") {
            Ok(raw) => {
                let secs: u64 = raw.parse().map_err(|_| MdError::Config(format!("MDCORE_MONITOR_INTERVAL_SECS {:?} is not a number", raw)))?;
                Duration::from_secs(secs)
            }
            Err(_) => Duration::from_secs(60),
        };
        Ok(Config {
            homehost: env::var("MDCORE_HOMEHOST").ok(),
            alert_command: env::var("MDCORE_ALERT_COMMAND").ok(),
            mail_to: env::var("MDCORE_MAIL_TO").ok(),
            monitor_interval,
            map_path: env::var("MDCORE_MAP_PATH").unwrap_or_else(|_| "/run/mdadm/map".to_string()),
            no_udev: env_flag("MDADM_NO_UDEV"),
            conf_auto: env::var("MDADM_CONF_AUTO").ok(),
            imsm_no_platform: env_flag("IMSM_NO_PLATFORM"),
            imsm_devname_as_serial: env_flag("IMSM_DEVNAME_AS_SERIAL"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_env_unset() {
        env::remove_var("MDCORE_MONITOR_INTERVAL_SECS");
        env::remove_var("MDCORE_MAP_PATH");
        env::remove_var("MDADM_NO_UDEV");
        env::remove_var("IMSM_NO_PLATFORM");
        env::remove_var("IMSM_DEVNAME_AS_SERIAL");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.monitor_interval, Duration::from_secs(60));
        assert_eq!(cfg.map_path, "/run/mdadm/map");
        assert!(!cfg.no_udev);
        assert!(!cfg.imsm_no_platform);
        assert!(!cfg.imsm_devname_as_serial);
        assert!(cfg.conf_auto.is_none());
    }

    #[test]
    fn rejects_non_numeric_interval() {
        env::set_var("MDCORE_MONITOR_INTERVAL_SECS", "soon");
        let result = Config::from_env();
        env::remove_var("MDCORE_MONITOR_INTERVAL_SECS");
        assert!(result.is_err());
    }

    #[test]
    fn reads_spec_mandated_env_vars() {
        env::set_var("MDADM_NO_UDEV", "1");
        env::set_var("MDADM_CONF_AUTO", "+1.x");
        env::set_var("IMSM_NO_PLATFORM", "1");
        env::set_var("IMSM_DEVNAME_AS_SERIAL", "1");
        let cfg = Config::from_env().unwrap();
        env::remove_var("MDADM_NO_UDEV");
        env::remove_var("MDADM_CONF_AUTO");
        env::remove_var("IMSM_NO_PLATFORM");
        env::remove_var("IMSM_DEVNAME_AS_SERIAL");
        assert!(cfg.no_udev);
        assert_eq!(cfg.conf_auto.as_deref(), Some("+1.x"));
        assert!(cfg.imsm_no_platform);
        assert!(cfg.imsm_devname_as_serial);
    }
}
