use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "coffer",
    about = "Coffer: ranged, optionally encrypted content storage",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file
    #[arg(short, long, global = true, default_value = "coffer.toml")]
    pub config: PathBuf,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Store a file (or stdin with `-`) and print its reference
    Put(PutArgs),
    /// Write stored content, or a range of it, to stdout or a file
    Get(GetArgs),
    /// Show the size and key rows of stored content
    Stat(RefArgs),
    /// Remove stored content and its keys
    Rm(RefArgs),
    /// List the key rows of encrypted content
    Keys(RefArgs),
    /// Wrap the content key with every configured encrypting key
    Rewrap(RefArgs),
    /// Remove the key row of one wrapping key
    Revoke(RevokeArgs),
    /// Write a configuration with a freshly generated wrapping key
    InitConfig(InitConfigArgs),
}

#[derive(Args)]
pub struct PutArgs {
    pub file: PathBuf,
}

#[derive(Args)]
pub struct GetArgs {
    pub reference: String,
    /// HTTP-style range, e.g. `bytes=0-99`, `bytes=100-` or `bytes=-50`
    #[arg(short, long)]
    pub range: Option<String>,
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Args)]
pub struct RefArgs {
    pub reference: String,
}

#[derive(Args)]
pub struct RevokeArgs {
    pub reference: String,
    pub wrapping_key_id: String,
}

#[derive(Args)]
pub struct InitConfigArgs {
    /// Directory holding the content and key stores
    #[arg(long, default_value = "./coffer-data")]
    pub root: PathBuf,
    /// Overwrite an existing configuration file
    #[arg(long)]
    pub force: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_put() {
        let cli = Cli::try_parse_from(["coffer", "put", "notes.txt"]).unwrap();
        if let Command::Put(args) = cli.command {
            assert_eq!(args.file, PathBuf::from("notes.txt"));
        } else { panic!("wrong command"); }
        assert_eq!(cli.config, PathBuf::from("coffer.toml"));
    }

    #[test]
    fn parse_get_with_range() {
        let cli = Cli::try_parse_from(["coffer", "get", "abc", "--range", "bytes=5-7", "-o", "out.bin"]).unwrap();
        if let Command::Get(args) = cli.command {
            assert_eq!(args.reference, "abc");
            assert_eq!(args.range, Some("bytes=5-7".into()));
            assert_eq!(args.output, Some(PathBuf::from("out.bin")));
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_revoke() {
        let cli = Cli::try_parse_from(["coffer", "revoke", "abc", "kek-old"]).unwrap();
        if let Command::Revoke(args) = cli.command {
            assert_eq!(args.wrapping_key_id, "kek-old");
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_init_config() {
        let cli = Cli::try_parse_from(["coffer", "init-config", "--force"]).unwrap();
        if let Command::InitConfig(args) = cli.command {
            assert!(args.force);
            assert_eq!(args.root, PathBuf::from("./coffer-data"));
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_global_flags() {
        let cli = Cli::try_parse_from(["coffer", "stat", "abc", "--config", "/etc/coffer.toml", "-v", "--format", "json"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.format, OutputFormat::Json));
        assert_eq!(cli.config, PathBuf::from("/etc/coffer.toml"));
        assert!(matches!(cli.command, Command::Stat(_)));
    }
}
