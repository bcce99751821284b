//! CLI command definitions and dispatch.

mod build;
mod info;
mod version;

use clap::{Parser, Subcommand};
use kiln_core::KilnError;

/// Kiln - builds container images from a Kilnfile.
#[derive(Parser)]
#[command(name = "kiln", version, about)]
pub struct Cli {
    /// Debug output, including everything build containers print
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    pub json: bool,

    /// Force colored output even when stdout is not a terminal
    #[arg(long, global = true)]
    pub colors: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Build an image from a Kilnfile
    Build(build::BuildArgs),
    /// Show engine and cache information
    Info(info::InfoArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Dispatch a parsed CLI command to its handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Build(args) => build::execute(args, cli.verbose).await,
        Command::Info(args) => info::execute(args).await,
        Command::Version(args) => version::execute(args).await,
    }
}

/// Process exit status for a failed command: 2 when the user interrupted
/// the build, 1 otherwise.
pub fn exit_code(err: &(dyn std::error::Error + 'static)) -> i32 {
    match err.downcast_ref::<KilnError>() {
        Some(KilnError::Interrupted) => 2,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_build_flags() {
        let cli = Cli::try_parse_from([
            "kiln",
            "--verbose",
            "build",
            "-f",
            "Kilnfile.prod",
            "--var",
            "Version=1.2",
            "--var",
            "Env=prod",
            "--vars",
            "vars.yml",
            "--no-cache",
            "--push",
            "--attach",
            "--id",
            "app",
            "ctx",
        ])
        .unwrap();

        assert!(cli.verbose);
        let Command::Build(args) = cli.command else {
            panic!("expected build command");
        };
        assert_eq!(args.path, "ctx");
        assert_eq!(args.file, "Kilnfile.prod");
        assert_eq!(args.var, vec!["Version=1.2", "Env=prod"]);
        assert_eq!(args.vars.len(), 1);
        assert!(args.no_cache);
        assert!(args.push);
        assert!(args.attach);
        assert!(!args.pull);
        assert_eq!(args.id.as_deref(), Some("app"));
    }

    #[test]
    fn test_parse_build_defaults() {
        let cli = Cli::try_parse_from(["kiln", "build"]).unwrap();
        let Command::Build(args) = cli.command else {
            panic!("expected build command");
        };
        assert_eq!(args.path, ".");
        assert_eq!(args.file, "Kilnfile");
        assert!(!args.no_cache);
        assert!(args.cache_dir.is_none());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["kiln", "build", "--json"]).unwrap();
        assert!(cli.json);
    }

    #[test]
    fn test_exit_code() {
        let interrupted: Box<dyn std::error::Error> = Box::new(KilnError::Interrupted);
        assert_eq!(exit_code(interrupted.as_ref()), 2);

        let failed: Box<dyn std::error::Error> =
            Box::new(KilnError::BuildError("boom".to_string()));
        assert_eq!(exit_code(failed.as_ref()), 1);

        let plain: Box<dyn std::error::Error> = "bad args".into();
        assert_eq!(exit_code(plain.as_ref()), 1);
    }
}
