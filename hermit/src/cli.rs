//! All the clap stuff for parsing/documenting the cli

use camino::Utf8PathBuf;
use clap::{
    builder::{PossibleValuesParser, TypedValueParser},
    Args, Parser, Subcommand,
};
use tracing::level_filters::LevelFilter;

#[derive(Parser, Clone, Debug)]
#[clap(version)]
#[clap(bin_name = "hermit")]
/// Hermetic, per-project tool environments.
///
/// Hermit materializes the tools a project declares, at pinned versions, into
/// the project's own bin/ directory. See 'init', 'install' and 'activate' for
/// the three most important subcommands.
pub struct Cli {
    /// Subcommands
    #[clap(subcommand)]
    pub command: Commands,

    /// How verbose logging should be (log level)
    #[clap(long, short = 'v')]
    #[clap(default_value_t = LevelFilter::WARN)]
    #[clap(value_parser = PossibleValuesParser::new(["off", "error", "warn", "info", "debug", "trace"]).map(|s| s.parse::<LevelFilter>().expect("possible values are valid")))]
    #[clap(help_heading = "GLOBAL OPTIONS", global = true)]
    pub verbose: LevelFilter,

    /// The environment directory to operate on
    ///
    /// Defaults to $HERMIT_ENV, or the nearest ancestor of the working
    /// directory containing bin/hermit.hcl.
    #[clap(long, short = 'e')]
    #[clap(help_heading = "GLOBAL OPTIONS", global = true)]
    pub env: Option<Utf8PathBuf>,

    /// Override the global state directory
    #[clap(long, hide = true)]
    #[clap(help_heading = "GLOBAL OPTIONS", global = true)]
    pub state_dir: Option<Utf8PathBuf>,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Initialize a hermit environment in a directory
    Init(InitArgs),

    /// Install packages into the environment
    Install(InstallArgs),

    /// Uninstall packages from the environment
    Uninstall(UninstallArgs),

    /// Upgrade packages: channels re-check their origin, versions move to
    /// the latest release
    Upgrade(UpgradeArgs),

    /// List installed packages
    List(ListArgs),

    /// Search for packages across the environment's sources
    Search(SearchArgs),

    /// Show detailed information about packages
    Info(InfoArgs),

    /// Show or set environment variables
    ///
    /// With no arguments prints the fully-activated variable set. With a name
    /// prints one value. With a name and a value, persists an override into
    /// bin/hermit.hcl.
    Env(EnvArgs),

    /// Execute a binary from the environment, replacing this process
    Exec(ExecArgs),

    /// Print the shell fragment that activates the environment
    ///
    /// Usually evaluated for you by bin/activate-hermit.
    Activate(ActivateArgs),

    /// Print the shell fragment that deactivates the environment
    #[clap(hide = true)]
    Deactivate(DeactivateArgs),

    /// Sync the environment's manifest sources
    Sync(SyncArgs),

    /// Remove hermit artifacts: binary farms, packages, the download cache
    Clean(CleanArgs),

    /// Run a package's self-test
    Test(TestArgs),

    /// Validate manifest sources, the environment, or generated scripts
    Validate(ValidateArgs),

    /// Dump the package database as JSON
    #[clap(hide = true)]
    DumpDb(DumpDbArgs),
}

#[derive(Args, Clone, Debug)]
pub struct InitArgs {
    /// Directory to initialize (defaults to the working directory)
    pub dir: Option<Utf8PathBuf>,

    /// Don't `git add` the generated files, even inside a git work tree
    #[clap(long)]
    pub no_git: bool,

    /// Manifest sources for the new environment
    #[clap(long)]
    pub sources: Vec<String>,

    /// Base URL the proxy script points users at when hermit is missing
    #[clap(long)]
    pub dist_url: Option<String>,

    /// Materialize IntelliJ plugin configuration
    #[clap(long, hide = true)]
    pub idea: bool,
}

#[derive(Args, Clone, Debug)]
pub struct InstallArgs {
    /// Packages to install (e.g. go, go-1.20, node@latest, gotool*)
    #[clap(required = true)]
    pub packages: Vec<String>,
}

#[derive(Args, Clone, Debug)]
pub struct UninstallArgs {
    /// Packages to uninstall
    #[clap(required = true)]
    pub packages: Vec<String>,
}

#[derive(Args, Clone, Debug)]
pub struct UpgradeArgs {
    /// Packages to upgrade (defaults to everything installed)
    pub packages: Vec<String>,
}

#[derive(Args, Clone, Debug)]
pub struct ListArgs {
    /// Only print references, one per line
    #[clap(long, short = 's')]
    pub short: bool,
}

#[derive(Args, Clone, Debug)]
pub struct SearchArgs {
    /// Only print references, one per line
    #[clap(long, short = 's')]
    pub short: bool,

    /// Match the pattern as an exact package name rather than a regex
    #[clap(long, short = 'e')]
    pub exact: bool,

    /// Regex applied to package names; empty lists everything
    pub pattern: Option<String>,
}

#[derive(Args, Clone, Debug)]
pub struct InfoArgs {
    /// Packages to describe
    #[clap(required = true)]
    pub packages: Vec<String>,
}

#[derive(Args, Clone, Debug)]
pub struct EnvArgs {
    /// Don't apply the parent process environment
    #[clap(long)]
    pub raw: bool,

    /// Print the serialized activation ops instead of variables
    #[clap(long, hide = true)]
    pub ops: bool,

    /// Variable to print (or set)
    pub name: Option<String>,

    /// Value to persist into bin/hermit.hcl
    pub value: Option<String>,
}

#[derive(Args, Clone, Debug)]
pub struct ExecArgs {
    /// The binary to execute, as linked in bin/
    pub binary: String,

    /// Arguments passed through to the binary
    #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

#[derive(Args, Clone, Debug)]
pub struct ActivateArgs {
    /// The environment directory to activate (defaults to discovery)
    pub dir: Option<Utf8PathBuf>,

    /// Shell syntax to emit (bash, zsh, fish); defaults to $SHELL
    #[clap(long)]
    pub shell: Option<String>,

    /// Suppress the prompt modification
    #[clap(long)]
    pub no_prompt: bool,
}

#[derive(Args, Clone, Debug)]
pub struct DeactivateArgs {
    /// Shell syntax to emit (bash, zsh, fish); defaults to $SHELL
    #[clap(long)]
    pub shell: Option<String>,
}

#[derive(Args, Clone, Debug)]
pub struct SyncArgs {}

#[derive(Args, Clone, Debug)]
pub struct CleanArgs {
    /// Remove per-package binary symlink farms
    #[clap(long, short = 'b')]
    pub binaries: bool,

    /// Remove extracted packages
    #[clap(long, short = 'p')]
    pub packages: bool,

    /// Remove the download cache
    #[clap(long, short = 'c')]
    pub cache: bool,

    /// Remove everything
    #[clap(long, short = 'a')]
    pub all: bool,
}

#[derive(Args, Clone, Debug)]
pub struct TestArgs {
    /// Packages whose manifest `test` command should run
    #[clap(required = true)]
    pub packages: Vec<String>,
}

#[derive(Args, Clone, Debug)]
pub struct ValidateArgs {
    #[clap(subcommand)]
    pub target: ValidateTarget,
}

#[derive(Subcommand, Clone, Debug)]
pub enum ValidateTarget {
    /// Validate every manifest in a source resolves on at least one core
    /// platform
    Source {
        /// The source URI to validate
        uri: String,

        /// Also probe each resolved source URL for reachability
        #[clap(long)]
        check_sources: bool,
    },
    /// Re-resolve every package installed in the environment
    Env,
    /// Check that the generated scripts in bin/ are current
    Script {
        /// Path to bin/hermit or bin/activate-hermit
        path: Utf8PathBuf,
    },
}

#[derive(Args, Clone, Debug)]
pub struct DumpDbArgs {}
