//! Command-line arguments (§A.3/§A.4). Grounded on the teacher's `Args`
//! struct in `src/main.rs`: `clap::Parser` derive, repeatable `-v`/`-q`
//! counters folded into a `tracing::Level`.

use std::path::PathBuf;

use clap::Parser;

use crate::capture::driver::{resolve_mode, DEFAULT_MODE_INDEX};

#[derive(Parser, Debug)]
#[command(name = "avcapd", about = "SDI/HDMI capture daemon: fans out video and audio to local peers")]
pub struct Args {
    /// Daemonize: single fork, stdio redirected to /dev/null.
    #[arg(short = 'D', long)]
    pub daemonize: bool,

    /// Unix-domain socket path template ('%d' is replaced with the pid).
    #[arg(short = 'n', long = "uds-template", default_value = "/tmp/wtv_bmd_%d")]
    pub uds_template: String,

    /// Capture display mode: an index or a canonical name (see MODE_NAMES).
    #[arg(short = 'm', long = "mode", default_value = "14")]
    pub mode: String,

    /// GPU render node to open.
    #[arg(long = "render-node", default_value = "/dev/dri/renderD128")]
    pub render_node: PathBuf,

    /// Increase log verbosity (repeatable).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Decrease log verbosity (repeatable).
    #[arg(short = 'q', long, action = clap::ArgAction::Count)]
    pub quiet: u8,
}

impl Args {
    pub fn uds_path(&self, pid: u32) -> PathBuf {
        PathBuf::from(self.uds_template.replace("%d", &pid.to_string()))
    }

    pub fn mode_index(&self) -> crate::error::Result<usize> {
        resolve_mode(&self.mode)
    }

    /// Fold the verbosity counters into a `tracing` level, `info` being the
    /// baseline (mirrors the teacher's log-level derivation in `main.rs`).
    pub fn tracing_level(&self) -> tracing::Level {
        let net = self.verbose as i8 - self.quiet as i8;
        match net {
            i8::MIN..=-2 => tracing::Level::ERROR,
            -1 => tracing::Level::WARN,
            0 => tracing::Level::INFO,
            1 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uds_template_substitutes_pid() {
        let args = Args {
            daemonize: false,
            uds_template: "/tmp/wtv_bmd_%d".to_string(),
            mode: "14".to_string(),
            render_node: PathBuf::from("/dev/dri/renderD128"),
            verbose: 0,
            quiet: 0,
        };
        assert_eq!(args.uds_path(4321), PathBuf::from("/tmp/wtv_bmd_4321"));
    }

    #[test]
    fn default_mode_resolves_to_720p59_94() {
        let args = Args {
            daemonize: false,
            uds_template: "/tmp/wtv_bmd_%d".to_string(),
            mode: "14".to_string(),
            render_node: PathBuf::from("/dev/dri/renderD128"),
            verbose: 0,
            quiet: 0,
        };
        assert_eq!(args.mode_index().unwrap(), DEFAULT_MODE_INDEX);
    }

    #[test]
    fn verbosity_counters_fold_to_level() {
        let mut args = Args {
            daemonize: false,
            uds_template: String::new(),
            mode: "14".to_string(),
            render_node: PathBuf::from("/dev/dri/renderD128"),
            verbose: 0,
            quiet: 0,
        };
        assert_eq!(args.tracing_level(), tracing::Level::INFO);
        args.verbose = 2;
        assert_eq!(args.tracing_level(), tracing::Level::TRACE);
        args.verbose = 0;
        args.quiet = 2;
        assert_eq!(args.tracing_level(), tracing::Level::ERROR);
    }
}
