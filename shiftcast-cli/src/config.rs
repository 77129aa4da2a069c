//! TOML config file layered under the CLI flags. Every field is optional;
//! anything absent falls back to the engine defaults, except the upstream
//! playlist URL, which must come from the file or `--url`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;
use shiftcast_engine::config::{FillerPolicy, ObserverStrategy, RelayConfig};

use crate::cli::Args;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    upstream: UpstreamSection,
    relay: RelaySection,
    sink: SinkSection,
    consumer: ConsumerSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct UpstreamSection {
    playlist_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RelaySection {
    work_dir: Option<PathBuf>,
    target_delay_secs: Option<u64>,
    drift_tolerance_secs: Option<u64>,
    buffer_segments: Option<usize>,
    segment_duration_secs: Option<u64>,
    neglect_ceiling_secs: Option<u64>,
    restart_interval_secs: Option<u64>,
    poll_interval_secs: Option<u64>,
    min_segment_bytes: Option<u64>,
    /// Substituting a pre-encoded silent segment instead of repeating the
    /// last good payload on failed downloads.
    silence_path: Option<PathBuf>,
    observer: Option<ObserverSection>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ObserverSection {
    ProcFd,
    LogTail,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SinkSection {
    host: Option<String>,
    port: Option<u16>,
    mount: Option<String>,
    user: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConsumerSection {
    program: Option<PathBuf>,
    extra_args: Option<Vec<String>>,
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("shiftcast").join("config.toml"))
}

/// Resolve the effective relay configuration: engine defaults, overlaid by
/// the config file, overlaid by CLI flags.
pub fn load(args: &Args) -> anyhow::Result<RelayConfig> {
    let path = args.config.clone().or_else(default_config_path);
    let file = match &path {
        Some(p) if p.exists() => {
            let raw = std::fs::read_to_string(p)
                .with_context(|| format!("reading config {}", p.display()))?;
            toml::from_str(&raw).with_context(|| format!("parsing config {}", p.display()))?
        }
        Some(p) if args.config.is_some() => bail!("config file {} does not exist", p.display()),
        _ => FileConfig::default(),
    };
    build(file, args)
}

fn build(file: FileConfig, args: &Args) -> anyhow::Result<RelayConfig> {
    let Some(playlist_url) = args.url.clone().or(file.upstream.playlist_url) else {
        bail!("no upstream playlist URL; set [upstream].playlist_url or pass --url");
    };
    let relay = file.relay;
    let work_dir = args
        .work_dir
        .clone()
        .or(relay.work_dir)
        .unwrap_or_else(|| std::env::temp_dir().join("shiftcast"));

    let mut config = RelayConfig::new(playlist_url, work_dir);

    if let Some(secs) = args.delay.or(relay.target_delay_secs) {
        config.output.target_delay = Duration::from_secs(secs);
    }
    if let Some(secs) = relay.drift_tolerance_secs {
        config.output.drift_tolerance = Duration::from_secs(secs);
    }
    if let Some(secs) = relay.restart_interval_secs {
        if secs > 0 && Duration::from_secs(secs) <= config.output.target_delay {
            bail!("restart interval must be larger than the target delay");
        }
        config.output.restart_interval = (secs > 0).then(|| Duration::from_secs(secs));
    }
    if let Some(n) = relay.buffer_segments {
        config.buffer.size = n;
    }
    if let Some(secs) = relay.segment_duration_secs {
        config.buffer.segment_duration = Duration::from_secs(secs);
    }
    if let Some(secs) = relay.neglect_ceiling_secs {
        config.buffer.neglect_ceiling = Duration::from_secs(secs);
    }
    if let Some(secs) = relay.poll_interval_secs {
        config.poller.poll_interval = Duration::from_secs(secs);
    }
    if let Some(bytes) = relay.min_segment_bytes {
        config.downloader.min_segment_bytes = bytes;
    }
    if let Some(path) = relay.silence_path {
        config.downloader.filler = FillerPolicy::Silence { path };
    }
    if let Some(observer) = relay.observer {
        config.output.observer = match observer {
            ObserverSection::ProcFd => ObserverStrategy::ProcFd,
            ObserverSection::LogTail => ObserverStrategy::LogTail,
        };
    }

    if let Some(host) = file.sink.host {
        config.sink.host = host;
    }
    if let Some(port) = file.sink.port {
        config.sink.port = port;
    }
    if let Some(mount) = file.sink.mount {
        config.sink.mount = mount;
    }
    if let Some(user) = file.sink.user {
        config.sink.user = user;
    }
    if let Some(password) = file.sink.password {
        config.sink.password = password;
    }

    if let Some(program) = file.consumer.program {
        config.output.consumer.program = program;
    }
    if let Some(extra_args) = file.consumer.extra_args {
        config.output.consumer.extra_args = extra_args;
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(list: &[&str]) -> Args {
        Args::parse_from([&["shiftcast", "run"], list].concat())
    }

    #[test]
    fn file_values_flow_into_engine_config() {
        let file: FileConfig = toml::from_str(
            r#"
            [upstream]
            playlist_url = "https://stream.example.net/live.m3u8"

            [relay]
            target_delay_secs = 7200
            buffer_segments = 1800
            silence_path = "/var/lib/shiftcast/silence.ts"
            observer = "log-tail"

            [sink]
            host = "cast.example.net"
            port = 8010
            mount = "timeshift"
            password = "hackme"

            [consumer]
            program = "/usr/bin/ffmpeg"
            "#,
        )
        .expect("toml");

        let config = build(file, &args(&[])).expect("build");
        assert_eq!(config.upstream.playlist_url, "https://stream.example.net/live.m3u8");
        assert_eq!(config.output.target_delay, Duration::from_secs(7200));
        assert_eq!(config.buffer.size, 1800);
        assert_eq!(config.output.observer, ObserverStrategy::LogTail);
        assert_eq!(
            config.downloader.filler,
            FillerPolicy::Silence {
                path: "/var/lib/shiftcast/silence.ts".into()
            }
        );
        assert_eq!(config.sink.host, "cast.example.net");
        assert_eq!(config.sink.port, 8010);
        assert_eq!(config.output.consumer.program, PathBuf::from("/usr/bin/ffmpeg"));
    }

    #[test]
    fn cli_flags_override_the_file() {
        let file: FileConfig = toml::from_str(
            r#"
            [upstream]
            playlist_url = "https://a.example.net/live.m3u8"
            [relay]
            target_delay_secs = 3600
            "#,
        )
        .expect("toml");

        let config = build(
            file,
            &args(&["--url", "https://b.example.net/live.m3u8", "--delay", "60"]),
        )
        .expect("build");
        assert_eq!(config.upstream.playlist_url, "https://b.example.net/live.m3u8");
        assert_eq!(config.output.target_delay, Duration::from_secs(60));
    }

    #[test]
    fn missing_url_is_rejected() {
        let err = build(FileConfig::default(), &args(&[])).expect_err("should fail");
        assert!(err.to_string().contains("playlist URL"));
    }

    #[test]
    fn restart_interval_must_exceed_delay() {
        let file: FileConfig = toml::from_str(
            r#"
            [upstream]
            playlist_url = "https://a.example.net/live.m3u8"
            [relay]
            target_delay_secs = 3600
            restart_interval_secs = 60
            "#,
        )
        .expect("toml");
        assert!(build(file, &args(&[])).is_err());
    }
}
