//! Startup configuration: positional CLI arguments with environment-variable
//! fallback, CLI winning. Required values that are missing or invalid fail
//! the process with a descriptive message before anything starts listening.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;

const ABOUT: &str = r#"
A horizontally scalable file-operation service. Exposes JSON-RPC 2.0
procedures over HTTP for manipulating a single rooted directory tree;
concurrent appends are serialized fleet-wide through an external
Redis-compatible lock coordinator.
"#;

#[derive(Parser)]
#[command(name = "fos", version, about = ABOUT, long_about = None)]
pub struct Cli {
    /// Directory that bounds all file operations. Falls back to FOS_ROOT_DIR.
    #[arg(value_name = "ROOT_DIR")]
    pub root_dir: Option<Utf8PathBuf>,

    /// Lock coordinator hostname. Falls back to FOS_REDIS_HOST.
    #[arg(value_name = "REDIS_HOST")]
    pub redis_host: Option<String>,

    /// Lock coordinator port. Falls back to FOS_REDIS_PORT.
    #[arg(value_name = "REDIS_PORT")]
    pub redis_port: Option<u16>,

    /// Lock coordinator password. Falls back to FOS_REDIS_PASSWORD.
    #[arg(value_name = "REDIS_PASSWORD")]
    pub redis_password: Option<String>,

    /// Address for the HTTP listener.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// URL path serving the RPC endpoint.
    #[arg(long, default_value = "/fos")]
    pub rpc_path: String,

    /// Deadline for a single RPC operation.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s")]
    pub request_timeout: Duration,
}

pub struct Config {
    pub root_dir: Utf8PathBuf,
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_password: String,
    pub listen: SocketAddr,
    pub rpc_path: String,
    pub request_timeout: Duration,
}

impl Config {
    const ROOT_DIR_ENV: &'static str = "FOS_ROOT_DIR";
    const REDIS_HOST_ENV: &'static str = "FOS_REDIS_HOST";
    const REDIS_PORT_ENV: &'static str = "FOS_REDIS_PORT";
    const REDIS_PASSWORD_ENV: &'static str = "FOS_REDIS_PASSWORD";

    pub fn load(cli: Cli) -> anyhow::Result<Self> {
        let root_dir = match cli.root_dir {
            Some(dir) => dir,
            None => required(Self::ROOT_DIR_ENV)?.into(),
        };
        let redis_host = match cli.redis_host {
            Some(host) => host,
            None => required(Self::REDIS_HOST_ENV)?,
        };
        let redis_port = match cli.redis_port {
            Some(port) => port,
            None => required(Self::REDIS_PORT_ENV)?
                .parse::<u16>()
                .with_context(|| format!("parsing {}", Self::REDIS_PORT_ENV))?,
        };
        anyhow::ensure!(redis_port != 0, "coordinator port must be 1-65535");
        let redis_password = match cli.redis_password {
            Some(password) => password,
            None => required(Self::REDIS_PASSWORD_ENV)?,
        };
        anyhow::ensure!(!redis_host.is_empty(), "coordinator host must not be empty");

        Ok(Self {
            root_dir,
            redis_host,
            redis_port,
            redis_password,
            listen: cli.listen,
            rpc_path: cli.rpc_path,
            request_timeout: cli.request_timeout,
        })
    }
}

fn required(env_name: &str) -> anyhow::Result<String> {
    std::env::var(env_name)
        .with_context(|| format!("missing required argument (set it on the command line, or via `{env_name}`)"))
}
