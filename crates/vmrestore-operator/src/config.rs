//! Command-line and environment configuration for the operator

use std::time::Duration;

use clap::Parser;
use vmrestore_common::telemetry::LogFormat;

/// Default number of restores reconciled in parallel
pub const DEFAULT_CONCURRENCY: u16 = 4;

/// vmrestore - restores virtual machines from VirtualMachineSnapshots
#[derive(Parser, Debug)]
#[command(name = "vmrestore-operator", version, about, long_about = None)]
pub struct Cli {
    /// Print the CRD manifests as YAML and exit
    #[arg(long)]
    pub crd: bool,

    /// Install or update the CRDs with server-side apply before starting
    #[arg(long, env = "VMRESTORE_INSTALL_CRDS")]
    pub install_crds: bool,

    /// Maximum number of restores reconciled concurrently
    #[arg(long, env = "VMRESTORE_CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY)]
    pub concurrency: u16,

    /// Only watch restores in this namespace (default: all namespaces)
    #[arg(long, env = "VMRESTORE_NAMESPACE")]
    pub namespace: Option<String>,

    /// Seconds between re-checks while a restore waits on external state
    #[arg(
        long,
        env = "VMRESTORE_RESYNC_SECS",
        default_value_t = vmrestore_controller::DEFAULT_RESYNC_SECS
    )]
    pub resync_secs: u64,

    /// Log output format: json or text
    #[arg(long, env = "VMRESTORE_LOG_FORMAT", default_value = "json", value_parser = parse_log_format)]
    pub log_format: LogFormat,
}

impl Cli {
    /// Resync interval as a duration
    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_secs)
    }
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    match value.to_ascii_lowercase().as_str() {
        "json" => Ok(LogFormat::Json),
        "text" => Ok(LogFormat::Text),
        other => Err(format!("unknown log format {other:?}, expected json or text")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["vmrestore-operator"]).unwrap();
        assert!(!cli.crd);
        assert!(!cli.install_crds);
        assert_eq!(cli.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(cli.namespace, None);
        assert_eq!(cli.resync(), Duration::from_secs(60));
        assert_eq!(cli.log_format, LogFormat::Json);
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "vmrestore-operator",
            "--install-crds",
            "--concurrency",
            "8",
            "--namespace",
            "vms",
            "--resync-secs",
            "15",
            "--log-format",
            "TEXT",
        ])
        .unwrap();
        assert!(cli.install_crds);
        assert_eq!(cli.concurrency, 8);
        assert_eq!(cli.namespace.as_deref(), Some("vms"));
        assert_eq!(cli.resync(), Duration::from_secs(15));
        assert_eq!(cli.log_format, LogFormat::Text);
    }

    #[test]
    fn rejects_unknown_log_format() {
        let err = Cli::try_parse_from(["vmrestore-operator", "--log-format", "xml"]).unwrap_err();
        assert!(err.to_string().contains("unknown log format"));
    }

    #[test]
    fn rejects_negative_concurrency() {
        assert!(Cli::try_parse_from(["vmrestore-operator", "--concurrency", "-1"]).is_err());
    }
}
