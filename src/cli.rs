use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Gradestack - Unattended provisioner for Debian-based autograding images
#[derive(Parser)]
#[command(name = "gradestack")]
#[command(about = "Converges a Debian-family machine to a provisioning manifest")]
#[command(version)]
pub struct Cli {
    /// Dry-run mode: print the plan without making changes.
    ///
    /// In this mode the machine is probed and every step's disposition is
    /// printed, but nothing executes. Probing needs no privileges, so dry
    /// runs work unprivileged and skip the preflight gate.
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Converge the machine to the manifest (the default with no subcommand)
    Apply {
        /// Path to a manifest file (defaults to the built-in manifest)
        #[arg(short, long)]
        manifest: Option<PathBuf>,

        /// Write the effective manifest to a file and exit
        #[arg(long)]
        save_manifest: Option<PathBuf>,

        /// Skip the preflight gate (root, required binaries, distro, network)
        #[arg(long)]
        skip_preflight: bool,
    },
    /// Probe the machine and print the plan without executing anything
    Plan {
        /// Path to a manifest file (defaults to the built-in manifest)
        #[arg(short, long)]
        manifest: Option<PathBuf>,
    },
    /// Validate a manifest file
    Validate {
        /// Path to the manifest file to validate
        #[arg(short, long)]
        manifest: PathBuf,
    },
    /// Run a single pipeline slice
    Step {
        /// Pipeline slice to run
        #[arg(value_enum)]
        name: StepName,

        /// Path to a manifest file (defaults to the built-in manifest)
        #[arg(short, long)]
        manifest: Option<PathBuf>,
    },
}

/// Pipeline slices addressable by `step`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StepName {
    /// Install the fixed system packages (refreshes the index when stale)
    Packages,
    /// Download and install the pinned document converter
    Converter,
    /// Download and run the environment manager installer, then persist PATH
    EnvManager,
    /// Create the named environment from the dependency-specification file
    Environment,
    /// Install the shell integration hooks
    ShellHooks,
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_no_args() {
        // Running with no args should succeed (defaults to apply)
        let result = Cli::try_parse_from(["gradestack"]);
        assert!(result.is_ok());
        let cli = result.unwrap();
        assert!(cli.command.is_none());
        assert!(!cli.dry_run);
    }

    #[test]
    fn test_cli_apply_with_manifest() {
        let result = Cli::try_parse_from([
            "gradestack",
            "apply",
            "--manifest",
            "/path/to/manifest.json",
        ]);
        assert!(result.is_ok());
        let cli = result.unwrap();
        match cli.command {
            Some(Commands::Apply { manifest, .. }) => {
                assert_eq!(manifest.unwrap().to_str().unwrap(), "/path/to/manifest.json");
            }
            _ => panic!("Expected Apply command"),
        }
    }

    #[test]
    fn test_cli_apply_save_manifest() {
        let result = Cli::try_parse_from([
            "gradestack",
            "apply",
            "--save-manifest",
            "/tmp/manifest.json",
        ]);
        assert!(result.is_ok());
        let cli = result.unwrap();
        match cli.command {
            Some(Commands::Apply {
                save_manifest,
                skip_preflight,
                ..
            }) => {
                assert_eq!(save_manifest.unwrap().to_str().unwrap(), "/tmp/manifest.json");
                assert!(!skip_preflight);
            }
            _ => panic!("Expected Apply command"),
        }
    }

    #[test]
    fn test_cli_apply_skip_preflight() {
        let result = Cli::try_parse_from(["gradestack", "apply", "--skip-preflight"]);
        assert!(result.is_ok());
        match result.unwrap().command {
            Some(Commands::Apply { skip_preflight, .. }) => assert!(skip_preflight),
            _ => panic!("Expected Apply command"),
        }
    }

    #[test]
    fn test_cli_global_dry_run() {
        let result = Cli::try_parse_from(["gradestack", "apply", "--dry-run"]);
        assert!(result.is_ok());
        assert!(result.unwrap().dry_run);

        // Global flag also parses before the subcommand
        let result = Cli::try_parse_from(["gradestack", "--dry-run", "plan"]);
        assert!(result.is_ok());
        assert!(result.unwrap().dry_run);
    }

    #[test]
    fn test_cli_validate_command() {
        let result = Cli::try_parse_from([
            "gradestack",
            "validate",
            "--manifest",
            "/path/to/manifest.json",
        ]);
        assert!(result.is_ok());
        let cli = result.unwrap();
        match cli.command {
            Some(Commands::Validate { manifest }) => {
                assert_eq!(manifest.to_str().unwrap(), "/path/to/manifest.json");
            }
            _ => panic!("Expected Validate command"),
        }
    }

    #[test]
    fn test_cli_validate_requires_manifest() {
        let result = Cli::try_parse_from(["gradestack", "validate"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_step_names() {
        for (arg, expected) in [
            ("packages", StepName::Packages),
            ("converter", StepName::Converter),
            ("env-manager", StepName::EnvManager),
            ("environment", StepName::Environment),
            ("shell-hooks", StepName::ShellHooks),
        ] {
            let result = Cli::try_parse_from(["gradestack", "step", arg]);
            assert!(result.is_ok(), "step {} should parse", arg);
            match result.unwrap().command {
                Some(Commands::Step { name, .. }) => assert_eq!(name, expected),
                _ => panic!("Expected Step command"),
            }
        }
    }

    #[test]
    fn test_cli_step_rejects_unknown_slice() {
        let result = Cli::try_parse_from(["gradestack", "step", "kernel"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_step_with_manifest() {
        let result = Cli::try_parse_from([
            "gradestack",
            "step",
            "environment",
            "--manifest",
            "/etc/gradestack.json",
        ]);
        assert!(result.is_ok());
        match result.unwrap().command {
            Some(Commands::Step { name, manifest }) => {
                assert_eq!(name, StepName::Environment);
                assert_eq!(manifest.unwrap().to_str().unwrap(), "/etc/gradestack.json");
            }
            _ => panic!("Expected Step command"),
        }
    }
}
