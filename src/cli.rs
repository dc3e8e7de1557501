//! Command-line surface: Docker connectivity, label discovery tuning,
//! and the ambient knobs (save folder, history limit, shutdown grace)
//! needed to run the scheduler as a standalone process.

use std::path::PathBuf;

#[derive(Debug, clap::Parser)]
#[command(name = "ofelia", version, about = "Container-aware job scheduler")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    Run(RunArgs),
}

#[derive(Debug, Clone, clap::Parser)]
pub struct RunArgs {
    #[arg(long, env = "LABEL_PREFIXES", default_values = ["ofelia"], value_delimiter = ',')]
    pub label_prefixes: Vec<String>,

    #[arg(long, env = "CONTAINER_LABEL_SELECTOR")]
    pub container_label_selector: Option<String>,

    #[arg(long, env = "DOCKER_HOST", default_value = "unix:///var/run/docker.sock")]
    pub docker_host: String,

    /// Permits `job-local` (host-process) jobs discovered via labels.
    /// Off by default: a container should not be able to schedule work
    /// on the host it doesn't control.
    #[arg(long, env = "ALLOW_HOST_JOBS", default_value_t = false)]
    pub allow_host_jobs: bool,

    #[arg(long, env = "SAVE_FOLDER")]
    pub save_folder: Option<PathBuf>,

    #[arg(long, env = "HISTORY_LIMIT", default_value_t = ofelia::execution::DEFAULT_HISTORY_LIMIT)]
    pub history_limit: usize,

    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value_t = 10)]
    pub shutdown_grace_secs: u64,

    #[arg(long, env = "RECONCILE_INTERVAL_SECS", default_value_t = 10)]
    pub reconcile_interval_secs: u64,

    /// Path to an external job-definitions file. Parsing its format is
    /// out of scope; when set, jobs must be injected through a
    /// `StaticSource` by an embedding caller instead.
    #[arg(long, env = "CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    #[arg(long, env = "SLACK_WEBHOOK")]
    pub slack_webhook: Option<String>,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as clap::Parser>::parse()
    }
}

/// `key=value`, as accepted by `--container-label-selector`.
pub fn parse_label_selector(s: &str) -> anyhow::Result<(String, String)> {
    let mut split = s.splitn(2, '=');
    let key = split
        .next()
        .ok_or_else(|| anyhow::anyhow!("invalid label selector: {s}"))?;
    let value = split
        .next()
        .ok_or_else(|| anyhow::anyhow!("invalid label selector '{s}': expected key=value"))?;
    Ok((key.to_string(), value.to_string()))
}
