//! Command-line arguments

use std::path::PathBuf;

use clap::{ArgAction, Parser};

/// Racing DNS forwarder with per-upstream response policies
#[derive(Debug, Parser)]
#[command(name = "racedns", version, disable_version_flag = true)]
pub struct Args {
    /// Load configuration from this file
    #[arg(short = 'c', long = "config", value_name = "PATH", default_value = "config.json")]
    pub config: PathBuf,

    /// Write a configuration template here and exit
    #[arg(long = "gen", value_name = "PATH")]
    pub generate: Option<PathBuf>,

    /// Log at debug level
    #[arg(long)]
    pub debug: bool,

    /// Log errors only
    #[arg(long)]
    pub quiet: bool,

    /// Change the working directory before loading the config
    #[arg(long = "dir", value_name = "PATH")]
    pub dir: Option<PathBuf>,

    /// Change the working directory to the executable's directory
    #[arg(long = "dir2exe")]
    pub dir_follow_executable: bool,

    /// Limit the number of worker threads
    #[arg(long = "cpu", value_name = "N")]
    pub cpu: Option<usize>,

    /// Print version and exit
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    version: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["racedns"]);
        assert_eq!(args.config, PathBuf::from("config.json"));
        assert!(args.generate.is_none());
        assert!(!args.debug);
        assert!(!args.quiet);
        assert!(args.cpu.is_none());
    }

    #[test]
    fn test_flags() {
        let args = Args::parse_from([
            "racedns", "-c", "/etc/racedns.json", "--debug", "--cpu", "4",
        ]);
        assert_eq!(args.config, PathBuf::from("/etc/racedns.json"));
        assert!(args.debug);
        assert_eq!(args.cpu, Some(4));
    }

    #[test]
    fn test_gen_flag() {
        let args = Args::parse_from(["racedns", "--gen", "template.json"]);
        assert_eq!(args.generate, Some(PathBuf::from("template.json")));
    }
}
