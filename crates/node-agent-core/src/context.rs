//! Identity and timing of the node the agent runs on.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

/// Node identity and boot time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerProperties {
    /// Fully qualified domain name reported to the manager.
    pub fqdn: String,
    /// Short node name.
    pub nodename: String,
    /// When the node booted.
    pub boot_time: DateTime<Utc>,
}

impl ServerProperties {
    /// Create properties from explicit values.
    #[must_use]
    pub fn new(fqdn: impl Into<String>, nodename: impl Into<String>, boot_time: DateTime<Utc>) -> Self {
        Self {
            fqdn: fqdn.into(),
            nodename: nodename.into(),
            boot_time,
        }
    }

    /// Detect the host name and boot time of the running system.
    ///
    /// Falls back to `localhost` and the current time when either cannot
    /// be determined.
    #[must_use]
    pub fn detect() -> Self {
        let fqdn = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        let nodename = fqdn.split('.').next().unwrap_or(&fqdn).to_string();
        let boot_time = std::fs::read_to_string("/proc/stat")
            .ok()
            .and_then(|stat| parse_boot_time(&stat))
            .unwrap_or_else(|| {
                tracing::warn!("Unable to read boot time, using current time");
                Utc::now()
            });

        Self {
            fqdn,
            nodename,
            boot_time,
        }
    }
}

/// Extract `btime` from the contents of `/proc/stat`.
#[must_use]
pub fn parse_boot_time(stat: &str) -> Option<DateTime<Utc>> {
    let secs = stat
        .lines()
        .find_map(|line| line.strip_prefix("btime "))?
        .trim()
        .parse::<i64>()
        .ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

/// Format a timestamp the way the manager expects: ISO-8601, microseconds, `Z`.
#[must_use]
pub fn wire_timestamp(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}
