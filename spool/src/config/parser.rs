//! INI parsing logic for converting `Ini` -> `Settings`.
//!
//! This is the single place where INI key names are mapped to struct
//! fields. Parsing starts from `Settings::default()` and overlays any
//! values found in the file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use ini::Ini;

use super::settings::{FairShareBounds, ListenAddr, Settings};
use super::ConfigError;
use crate::types::Family;

pub(super) fn parse_ini(ini: &Ini) -> Result<Settings, ConfigError> {
    let mut settings = Settings::default();

    // [lrs] section
    if let Some(section) = ini.section(Some("lrs")) {
        if let Some(v) = section.get("lock_file") {
            settings.lrs.lock_file = PathBuf::from(v.trim());
        }
        if let Some(v) = section.get("mount_prefix") {
            settings.lrs.mount_prefix = v.trim().to_string();
        }
        if let Some(v) = section.get("families") {
            settings.lrs.families = parse_csv(v)
                .iter()
                .map(|f| f.parse::<Family>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| invalid("lrs", "families", v, e.message()))?;
        }
        if let Some(v) = section.get("listen") {
            settings.lrs.listen = parse_listen(v)?;
        }
        if let Some(v) = section.get("max_dispatch_delay_ms") {
            settings.lrs.max_dispatch_delay = parse_ms("lrs", "max_dispatch_delay_ms", v)?;
        }
    }

    // [io_sched_<family>] sections
    for family in [Family::Tape, Family::Dir, Family::Rados] {
        let name = format!("io_sched_{family}");
        if let Some(section) = ini.section(Some(name.as_str())) {
            let mut io = settings.io_sched_for(family);
            if let Some(v) = section.get("dispatch_algo") {
                io.dispatch_algo = v
                    .parse()
                    .map_err(|e: String| invalid(&name, "dispatch_algo", v, &e))?;
            }
            if let Some(v) = section.get("read_algo") {
                io.read_algo = v
                    .parse()
                    .map_err(|e: String| invalid(&name, "read_algo", v, &e))?;
            }
            settings.io_sched.insert(family, io);
        }
    }

    // [scsi] section
    if let Some(section) = ini.section(Some("scsi")) {
        if let Some(v) = section.get("retry_count") {
            settings.scsi.retry.count = parse_num("scsi", "retry_count", v)?;
        }
        if let Some(v) = section.get("retry_short") {
            settings.scsi.retry.short_delay =
                Duration::from_secs(parse_num("scsi", "retry_short", v)?);
        }
        if let Some(v) = section.get("retry_long") {
            settings.scsi.retry.long_delay =
                Duration::from_secs(parse_num("scsi", "retry_long", v)?);
        }
        if let Some(v) = section.get("query_timeout_ms") {
            settings.scsi.query_timeout = parse_ms("scsi", "query_timeout_ms", v)?;
        }
        if let Some(v) = section.get("move_timeout_ms") {
            settings.scsi.move_timeout = parse_ms("scsi", "move_timeout_ms", v)?;
        }
        if let Some(v) = section.get("inquiry_timeout_ms") {
            settings.scsi.inquiry_timeout = parse_ms("scsi", "inquiry_timeout_ms", v)?;
        }
        if let Some(v) = section.get("max_element_status") {
            settings.scsi.max_element_status = parse_num("scsi", "max_element_status", v)?;
        }
    }

    // [sync_<family>] sections
    for family in [Family::Tape, Family::Dir, Family::Rados] {
        let name = format!("sync_{family}");
        if let Some(section) = ini.section(Some(name.as_str())) {
            let mut sync = settings.sync_for(family);
            if let Some(v) = section.get("time_ms") {
                sync.time = parse_ms(&name, "time_ms", v)?;
            }
            if let Some(v) = section.get("nb_req") {
                sync.nb_req = parse_num(&name, "nb_req", v)?;
            }
            if let Some(v) = section.get("wsize_kb") {
                sync.wsize_kb = parse_num(&name, "wsize_kb", v)?;
            }
            settings.sync.insert(family, sync);
        }
    }

    // [ltfs] section
    if let Some(section) = ini.section(Some("ltfs")) {
        if let Some(v) = section.get("cmd_mount") {
            settings.ltfs.cmd_mount = v.trim().to_string();
        }
        if let Some(v) = section.get("cmd_umount") {
            settings.ltfs.cmd_umount = v.trim().to_string();
        }
        if let Some(v) = section.get("cmd_format") {
            settings.ltfs.cmd_format = v.trim().to_string();
        }
    }

    // [tlc] section
    if let Some(section) = ini.section(Some("tlc")) {
        if let Some(v) = section.get("hostname") {
            settings.tlc.hostname = v.trim().to_string();
        }
        if let Some(v) = section.get("port") {
            settings.tlc.port = parse_num("tlc", "port", v)?;
        }
    }

    // [tape_model] section
    if let Some(section) = ini.section(Some("tape_model")) {
        if let Some(v) = section.get("supported_list") {
            settings.tape_model.supported_list = parse_csv(v);
        }
    }

    // [drive_type "<techno>_drive"] sections; the mapping is
    // case-sensitive on model strings.
    let mut drive_models = HashMap::new();
    for (name, properties) in ini.iter() {
        let Some(name) = name else { continue };
        let Some(techno) = drive_type_techno(name) else {
            continue;
        };
        if let Some(v) = properties.get("models") {
            drive_models.insert(techno.to_string(), parse_csv(v));
        }
    }
    settings.tape_model.drive_models = drive_models;

    // [fair_share "<techno>"] sections
    for (name, properties) in ini.iter() {
        let Some(name) = name else { continue };
        let Some(techno) = quoted_suffix(name, "fair_share") else {
            continue;
        };
        let mut bounds = FairShareBounds::default();
        if let Some(v) = properties.get("min") {
            bounds.min = parse_triple(name, "min", v)?;
        }
        if let Some(v) = properties.get("max") {
            bounds.max = parse_triple(name, "max", v)?;
        }
        settings.fair_share.insert(techno.to_string(), bounds);
    }

    Ok(settings)
}

/// Extracts `<techno>` from a section named `drive_type "<techno>_drive"`.
fn drive_type_techno(section: &str) -> Option<&str> {
    quoted_suffix(section, "drive_type").and_then(|s| s.strip_suffix("_drive"))
}

/// Extracts the quoted part of a section named `<prefix> "<value>"`.
fn quoted_suffix<'a>(section: &'a str, prefix: &str) -> Option<&'a str> {
    section
        .strip_prefix(prefix)?
        .trim_start()
        .strip_prefix('"')?
        .strip_suffix('"')
}

fn parse_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_listen(value: &str) -> Result<ListenAddr, ConfigError> {
    let value = value.trim();
    if value.starts_with('/') {
        return Ok(ListenAddr::Unix(PathBuf::from(value)));
    }
    let (host, port) = value.rsplit_once(':').ok_or_else(|| {
        invalid(
            "lrs",
            "listen",
            value,
            "expected a socket path or host:port",
        )
    })?;
    let port = port
        .parse::<u16>()
        .map_err(|_| invalid("lrs", "listen", value, "port must be in [0, 65535]"))?;
    Ok(ListenAddr::Tcp {
        host: host.to_string(),
        port,
    })
}

fn parse_triple(section: &str, key: &str, value: &str) -> Result<[u32; 3], ConfigError> {
    let parts = parse_csv(value);
    if parts.len() != 3 {
        return Err(invalid(
            section,
            key,
            value,
            "expected three comma-separated counts (format,write,read)",
        ));
    }
    let mut out = [0u32; 3];
    for (slot, part) in out.iter_mut().zip(&parts) {
        *slot = part
            .parse()
            .map_err(|_| invalid(section, key, value, "counts must be non-negative integers"))?;
    }
    Ok(out)
}

fn parse_num<T: std::str::FromStr>(section: &str, key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(section, key, value, "must be a non-negative integer"))
}

fn parse_ms(section: &str, key: &str, value: &str) -> Result<Duration, ConfigError> {
    Ok(Duration::from_millis(parse_num(section, key, value)?))
}

fn invalid(section: &str, key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchAlgo;

    const SAMPLE: &str = r#"
[lrs]
lock_file = /tmp/spoold.lock
mount_prefix = /mnt/spool.
families = tape,dir
listen = /tmp/spoold.socket
max_dispatch_delay_ms = 2000

[io_sched_tape]
dispatch_algo = fair_share
read_algo = grouped_read

[scsi]
retry_count = 3
retry_short = 2
retry_long = 10
query_timeout_ms = 500
move_timeout_ms = 60000
max_element_status = 42

[sync_tape]
time_ms = 5000
nb_req = 10
wsize_kb = 2048

[tlc]
hostname = tlc.example.com
port = 20007

[tape_model]
supported_list = LTO5,LTO6

[drive_type "LTO5_drive"]
models = ULTRIUM-TD5,ULT3580-TD5

[drive_type "LTO6_drive"]
models = ULTRIUM-TD6

[fair_share "LTO5"]
min = 0,0,0
max = 0,1,1
"#;

    #[test]
    fn test_parse_full_sample() {
        let settings = Settings::parse_str(SAMPLE).unwrap();

        assert_eq!(settings.lrs.lock_file, PathBuf::from("/tmp/spoold.lock"));
        assert_eq!(settings.lrs.families, vec![Family::Tape, Family::Dir]);
        assert_eq!(
            settings.lrs.listen,
            ListenAddr::Unix(PathBuf::from("/tmp/spoold.socket"))
        );
        assert_eq!(settings.lrs.max_dispatch_delay, Duration::from_secs(2));

        let io = settings.io_sched_for(Family::Tape);
        assert_eq!(io.dispatch_algo, DispatchAlgo::FairShare);
        assert_eq!(io.read_algo, DispatchAlgo::GroupedRead);
        // Family without a section falls back to fifo.
        assert_eq!(
            settings.io_sched_for(Family::Dir).dispatch_algo,
            DispatchAlgo::Fifo
        );

        assert_eq!(settings.scsi.retry.count, 3);
        assert_eq!(settings.scsi.retry.short_delay, Duration::from_secs(2));
        assert_eq!(settings.scsi.move_timeout, Duration::from_secs(60));
        assert_eq!(settings.scsi.max_element_status, 42);

        let sync = settings.sync_for(Family::Tape);
        assert_eq!(sync.time, Duration::from_secs(5));
        assert_eq!(sync.nb_req, 10);
        assert_eq!(sync.wsize_kb, 2048);

        assert_eq!(settings.tlc.hostname, "tlc.example.com");
        assert_eq!(settings.tlc.port, 20007);
    }

    #[test]
    fn test_parse_drive_type_sections() {
        let settings = Settings::parse_str(SAMPLE).unwrap();
        assert_eq!(settings.tape_model.techno_of_model("ULT3580-TD5"), Some("LTO5"));
        assert_eq!(settings.tape_model.techno_of_model("ULTRIUM-TD6"), Some("LTO6"));
        assert_eq!(settings.tape_model.techno_of_model("ULTRIUM-td6"), None);
    }

    #[test]
    fn test_parse_fair_share_bounds() {
        let settings = Settings::parse_str(SAMPLE).unwrap();
        let bounds = settings.fair_share.get("LTO5").unwrap();
        assert_eq!(bounds.min, [0, 0, 0]);
        assert_eq!(bounds.max, [0, 1, 1]);
    }

    #[test]
    fn test_parse_tcp_listen() {
        let settings =
            Settings::parse_str("[lrs]\nlisten = 0.0.0.0:7712\n").unwrap();
        assert_eq!(
            settings.lrs.listen,
            ListenAddr::Tcp {
                host: "0.0.0.0".to_string(),
                port: 7712
            }
        );
    }

    #[test]
    fn test_invalid_port_is_rejected() {
        let err = Settings::parse_str("[lrs]\nlisten = host:99999\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_invalid_dispatch_algo_is_rejected() {
        let err =
            Settings::parse_str("[io_sched_tape]\ndispatch_algo = lottery\n").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("io_sched_tape"));
        assert!(text.contains("lottery"));
    }

    #[test]
    fn test_invalid_fair_share_triple() {
        let err = Settings::parse_str("[fair_share \"LTO5\"]\nmax = 1,2\n").unwrap_err();
        assert!(err.to_string().contains("three comma-separated"));
    }

    #[test]
    fn test_unknown_family_is_rejected() {
        let err = Settings::parse_str("[lrs]\nfamilies = tape,floppy\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
