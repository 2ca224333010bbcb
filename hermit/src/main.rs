#![deny(missing_docs)]

//! CLI binary interface for hermit

use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use comfy_table::Table;
use console::Term;
use hermit::config::EnvConfig;
use hermit::environment::{self, Environment};
use hermit::envars;
use hermit::errors::{HermitError, HermitResult};
use hermit::manifest::loader::Loader;
use hermit::manifest::resolver::Resolver;
use hermit::manifest::selector::Selector;
use hermit::platform::{Platform, CORE_PLATFORMS};
use hermit::shell::{self, ActivationConfig, Shell};
use hermit::sources::Sources;
use hermit::state::{State, StateConfig};

use crate::cli::{
    ActivateArgs, CleanArgs, Cli, Commands, DeactivateArgs, EnvArgs, ExecArgs, InfoArgs,
    InitArgs, InstallArgs, ListArgs, SearchArgs, SyncArgs, TestArgs, UninstallArgs, UpgradeArgs,
    ValidateArgs, ValidateTarget,
};

mod cli;

fn main() {
    let cli = Cli::parse();
    init_miette();
    init_tracing(&cli);
    if let Err(report) = real_main(&cli) {
        // single-line summary normally; the full cause chain shows at -v debug
        eprintln!("{report:?}");
        std::process::exit(1);
    }
}

fn init_miette() {
    miette::set_hook(Box::new(move |_| {
        Box::new(miette::MietteHandlerOpts::new().width(120).build())
    }))
    .expect("failed to initialize error handler");
}

fn init_tracing(cli: &Cli) {
    tracing_subscriber::fmt::fmt()
        .with_max_level(cli.verbose)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .with_ansi(console::colors_enabled_stderr())
        .init();
}

fn real_main(cli: &Cli) -> Result<(), miette::Report> {
    let state = open_state(cli)?;
    match &cli.command {
        Commands::Init(args) => cmd_init(args),
        Commands::Install(args) => cmd_install(cli, &state, args),
        Commands::Uninstall(args) => cmd_uninstall(cli, &state, args),
        Commands::Upgrade(args) => cmd_upgrade(cli, &state, args),
        Commands::List(args) => cmd_list(cli, &state, args),
        Commands::Search(args) => cmd_search(cli, &state, args),
        Commands::Info(args) => cmd_info(cli, &state, args),
        Commands::Env(args) => cmd_env(cli, &state, args),
        Commands::Exec(args) => cmd_exec(cli, &state, args),
        Commands::Activate(args) => cmd_activate(cli, &state, args),
        Commands::Deactivate(args) => cmd_deactivate(args),
        Commands::Sync(args) => cmd_sync(cli, &state, args),
        Commands::Clean(args) => cmd_clean(&state, args),
        Commands::Test(args) => cmd_test(cli, &state, args),
        Commands::Validate(args) => cmd_validate(cli, &state, args),
        Commands::DumpDb(_) => {
            let mut out = std::io::stdout();
            state.db().dump(&mut out)?;
            Ok(())
        }
    }
}

fn open_state(cli: &Cli) -> HermitResult<State> {
    let root = match &cli.state_dir {
        Some(dir) => dir.clone(),
        None => State::default_root()?,
    };
    State::open(root, StateConfig::default())
}

/// Locate the environment: `--env`, `$HERMIT_ENV`, or the nearest ancestor of
/// the working directory containing a hermit `bin/`.
fn discover_env_dir(cli: &Cli) -> HermitResult<Utf8PathBuf> {
    if let Some(dir) = &cli.env {
        return Ok(dir.clone());
    }
    if let Ok(dir) = std::env::var("HERMIT_ENV") {
        return Ok(Utf8PathBuf::from(dir));
    }
    let start = Utf8PathBuf::try_from(std::env::current_dir()?)?;
    let mut dir = start.clone();
    loop {
        if dir.join("bin").join("hermit.hcl").exists() || dir.join("bin").join("hermit").exists()
        {
            return Ok(dir);
        }
        if !dir.pop() {
            return Err(HermitError::NotAnEnvironment { dir: start });
        }
    }
}

fn open_env(cli: &Cli, state: &State) -> HermitResult<Environment> {
    let dir = discover_env_dir(cli)?;
    Environment::open(state.clone(), &dir)
}

fn print_messages(messages: &[String]) {
    let term = Term::stderr();
    for message in messages {
        let _ = term.write_line(&term.style().cyan().apply_to(message).to_string());
    }
}

fn cmd_init(args: &InitArgs) -> Result<(), miette::Report> {
    let dir = match &args.dir {
        Some(dir) => dir.clone(),
        None => Utf8PathBuf::try_from(std::env::current_dir().map_err(HermitError::Io)?)
            .map_err(HermitError::from)?,
    };
    let config = EnvConfig {
        env: Vec::new(),
        sources: if args.sources.is_empty() { None } else { Some(args.sources.clone()) },
        manage_git: !args.no_git,
        idea: args.idea,
    };
    Environment::init(&dir, &config, args.dist_url.as_deref())?;
    Ok(())
}

fn cmd_install(cli: &Cli, state: &State, args: &InstallArgs) -> Result<(), miette::Report> {
    let env = open_env(cli, state)?;
    for selector in &args.packages {
        let selector: Selector = selector.parse()?;
        for mut package in env.resolve_each(&selector)? {
            let changes = env.install(&mut package)?;
            print_messages(&changes.messages);
            println!("{}", package.reference);
        }
    }
    Ok(())
}

fn cmd_uninstall(cli: &Cli, state: &State, args: &UninstallArgs) -> Result<(), miette::Report> {
    let env = open_env(cli, state)?;
    for selector in &args.packages {
        let selector: Selector = selector.parse()?;
        let matching: Vec<_> = env
            .installed_refs()?
            .into_iter()
            .filter(|reference| selector.matches(reference))
            .collect();
        if matching.is_empty() {
            return Err(HermitError::UnknownPackage { selector: selector.to_string() }.into());
        }
        for reference in matching {
            let package = env.resolve(&Selector::exact(reference))?;
            let changes = env.uninstall(&package)?;
            print_messages(&changes.messages);
        }
    }
    Ok(())
}

fn cmd_upgrade(cli: &Cli, state: &State, args: &UpgradeArgs) -> Result<(), miette::Report> {
    let env = open_env(cli, state)?;
    let references = if args.packages.is_empty() {
        env.installed_refs()?
    } else {
        let mut references = Vec::new();
        for selector in &args.packages {
            let selector: Selector = selector.parse()?;
            let matching: Vec<_> = env
                .installed_refs()?
                .into_iter()
                .filter(|reference| selector.matches(reference))
                .collect();
            if matching.is_empty() {
                return Err(
                    HermitError::UnknownPackage { selector: selector.to_string() }.into()
                );
            }
            references.extend(matching);
        }
        references
    };
    for reference in references {
        let mut package = env.resolve(&Selector::exact(reference))?;
        let changes = env.upgrade(&mut package)?;
        print_messages(&changes.messages);
    }
    Ok(())
}

fn cmd_list(cli: &Cli, state: &State, args: &ListArgs) -> Result<(), miette::Report> {
    let env = open_env(cli, state)?;
    let packages = env.installed_packages()?;
    if args.short {
        for package in packages {
            println!("{}", package.reference);
        }
        return Ok(());
    }
    let mut table = Table::new();
    table.set_header(vec!["Ref", "Description"]);
    for package in packages {
        table.add_row(vec![package.reference.string(), package.description]);
    }
    println!("{table}");
    Ok(())
}

fn cmd_search(cli: &Cli, state: &State, args: &SearchArgs) -> Result<(), miette::Report> {
    let env = open_env(cli, state)?;
    let pattern = match (&args.pattern, args.exact) {
        (Some(pattern), true) => format!("^{}$", regex::escape(pattern)),
        (Some(pattern), false) => pattern.clone(),
        (None, _) => String::new(),
    };
    let pattern = regex::Regex::new(&pattern)
        .map_err(|err| HermitError::msg(format!("invalid search pattern: {err}")))?;
    let packages = env.resolver().search(&pattern)?;
    if args.short {
        for package in packages {
            println!("{}", package.reference);
        }
        return Ok(());
    }
    let mut table = Table::new();
    table.set_header(vec!["Ref", "Description"]);
    for package in packages {
        table.add_row(vec![package.reference.string(), package.description]);
    }
    println!("{table}");
    Ok(())
}

fn cmd_info(cli: &Cli, state: &State, args: &InfoArgs) -> Result<(), miette::Report> {
    let env = open_env(cli, state)?;
    let mut out = Term::stdout();
    for selector in &args.packages {
        let selector: Selector = selector.parse()?;
        let package = env.resolve(&selector)?;
        writeln!(out, "Name: {}", package.reference.name).map_err(HermitError::Io)?;
        writeln!(out, "Reference: {}", package.reference).map_err(HermitError::Io)?;
        writeln!(out, "Description: {}", package.description).map_err(HermitError::Io)?;
        writeln!(out, "State: {:?}", package.state).map_err(HermitError::Io)?;
        writeln!(out, "Source: {}", package.source).map_err(HermitError::Io)?;
        if !package.binaries.is_empty() {
            writeln!(out, "Binaries: {}", package.binaries.join(" ")).map_err(HermitError::Io)?;
        }
        if !package.requires.is_empty() {
            writeln!(out, "Requires: {}", package.requires.join(" ")).map_err(HermitError::Io)?;
        }
        if !package.provides.is_empty() {
            writeln!(out, "Provides: {}", package.provides.join(" ")).map_err(HermitError::Io)?;
        }
        for warning in &package.warnings {
            writeln!(out, "Warning: {warning}").map_err(HermitError::Io)?;
        }
        writeln!(out).map_err(HermitError::Io)?;
    }
    Ok(())
}

fn cmd_env(cli: &Cli, state: &State, args: &EnvArgs) -> Result<(), miette::Report> {
    let env = open_env(cli, state)?;
    if args.ops {
        println!("{}", envars::marshal_ops(&env.activation_ops()?)?);
        return Ok(());
    }
    match (&args.name, &args.value) {
        (Some(name), Some(value)) => {
            let path = env.bin_dir().join("hermit.hcl");
            let mut config = EnvConfig::load(&path)?;
            config.set_env(name, value);
            config.save(&path)?;
            Ok(())
        }
        (Some(name), None) => {
            let vars = env.envars(!args.raw)?;
            if let Some(value) = vars.get(name) {
                println!("{value}");
            }
            Ok(())
        }
        (None, _) => {
            for (key, value) in env.envars(!args.raw)? {
                println!("{key}={value}");
            }
            Ok(())
        }
    }
}

fn cmd_exec(cli: &Cli, state: &State, args: &ExecArgs) -> Result<(), miette::Report> {
    let env = open_env(cli, state)?;
    // returns only on failure
    env.exec(&args.binary, &args.args)?;
    Ok(())
}

fn cmd_activate(cli: &Cli, state: &State, args: &ActivateArgs) -> Result<(), miette::Report> {
    let dir = match &args.dir {
        Some(dir) => dir.clone(),
        None => discover_env_dir(cli)?,
    };
    let env = Environment::open(state.clone(), &dir)?;
    if let Err(err) = env.sync(false) {
        tracing::warn!("source sync failed, continuing with cached manifests: {err}");
    }

    let shell = parse_shell(args.shell.as_deref())?;
    let ops = env.activation_ops()?;
    let mut transform =
        envars::Transform::new(env.root().as_str(), environment::process_env());
    transform.apply_all(&ops);

    let prompt = if args.no_prompt {
        String::new()
    } else {
        env.root().file_name().unwrap_or("hermit").to_string()
    };
    let config = ActivationConfig {
        root: env.root().to_owned(),
        prompt,
        env: transform.changed(true),
    };
    let mut out = std::io::stdout();
    shell::activation(&mut out, shell, &config, &ops)?;
    Ok(())
}

fn cmd_deactivate(args: &DeactivateArgs) -> Result<(), miette::Report> {
    let shell = parse_shell(args.shell.as_deref())?;
    let blob = std::env::var("HERMIT_ENV_OPS")
        .map_err(|_| HermitError::msg("HERMIT_ENV_OPS is not set; is an environment active?"))?;
    let ops = envars::unmarshal_ops(&blob)?;
    let root = std::env::var("HERMIT_ENV").unwrap_or_default();
    let changes = shell::deactivation_changes(&environment::process_env(), &ops, &root);
    let mut out = std::io::stdout();
    shell::deactivation(&mut out, shell, &changes)?;
    Ok(())
}

fn parse_shell(explicit: Option<&str>) -> HermitResult<Shell> {
    match explicit {
        Some(name) => name.parse(),
        None => Shell::detect(),
    }
}

fn cmd_sync(cli: &Cli, state: &State, _args: &SyncArgs) -> Result<(), miette::Report> {
    let env = open_env(cli, state)?;
    // explicit sync always bypasses the per-source rate limit
    env.sync(true)?;
    Ok(())
}

fn cmd_clean(state: &State, args: &CleanArgs) -> Result<(), miette::Report> {
    let mut any = false;
    if args.binaries || args.all {
        state.clean_binaries()?;
        any = true;
    }
    if args.packages || args.all {
        state.clean_packages()?;
        any = true;
    }
    if args.cache || args.all {
        state.clean_cache()?;
        any = true;
    }
    if !any {
        return Err(HermitError::msg("pass at least one of -b, -p, -c or -a").into());
    }
    Ok(())
}

fn cmd_test(cli: &Cli, state: &State, args: &TestArgs) -> Result<(), miette::Report> {
    let env = open_env(cli, state)?;
    for selector in &args.packages {
        let selector: Selector = selector.parse()?;
        for mut package in env.resolve_each(&selector)? {
            env.test(&mut package)?;
        }
    }
    Ok(())
}

fn cmd_validate(cli: &Cli, state: &State, args: &ValidateArgs) -> Result<(), miette::Report> {
    match &args.target {
        ValidateTarget::Source { uri, check_sources } => {
            cmd_validate_source(state, uri, *check_sources)
        }
        ValidateTarget::Env => {
            let env = open_env(cli, state)?;
            for reference in env.installed_refs()? {
                let package = env.resolve(&Selector::exact(reference.clone()))?;
                package.ensure_supported(Platform::host())?;
                for warning in env.validate_manifest(&reference.name, false)? {
                    eprintln!("{reference}: warning: {warning}");
                }
                println!("{reference}: ok");
            }
            Ok(())
        }
        ValidateTarget::Script { path } => cmd_validate_script(path),
    }
}

fn cmd_validate_source(
    state: &State,
    uri: &str,
    check_sources: bool,
) -> Result<(), miette::Report> {
    let sources =
        Sources::new(state.sources_dir(), state.client().clone(), &[uri.to_string()]);
    sources.sync(true)?;
    let resolver = Resolver::new(
        Loader::new(sources),
        Platform::host(),
        state.pkg_dir(),
        None,
    );
    let mut failures = 0usize;
    for name in resolver.loader().all_names()? {
        let mut warnings = Vec::new();
        let mut succeeded = 0usize;
        for platform in CORE_PLATFORMS {
            let platform_resolver = resolver.for_platform(platform);
            match platform_resolver.resolve(&Selector::Name(name.clone())) {
                Ok(package) => {
                    succeeded += 1;
                    if check_sources {
                        if let Err(err) = state.cache().validate(&package.source) {
                            warnings.push(format!("{platform}: {} unreachable: {err}", package.source));
                        }
                    }
                }
                Err(err) => warnings.push(format!("{platform}: {err}")),
            }
        }
        for warning in &warnings {
            eprintln!("{name}: warning: {warning}");
        }
        if succeeded == 0 {
            eprintln!("{name}: error: does not resolve on any core platform");
            failures += 1;
        }
    }
    if failures > 0 {
        return Err(
            HermitError::msg(format!("{failures} manifests failed validation")).into()
        );
    }
    Ok(())
}

/// Generated scripts carry a marker line; anything else, or a stale copy
/// missing the proxy exec line, fails validation.
fn cmd_validate_script(path: &Utf8Path) -> Result<(), miette::Report> {
    let text = std::fs::read_to_string(path).map_err(HermitError::Io)?;
    if !text.contains("THIS FILE IS GENERATED BY HERMIT") {
        return Err(HermitError::msg(format!("{path} is not a hermit-generated script")).into());
    }
    let name = path.file_name().unwrap_or_default();
    let expected = match name {
        "hermit" => "exec \"$HERMIT_EXE\" exec",
        "activate-hermit" => "hermit\" activate",
        other => {
            return Err(HermitError::msg(format!("unknown hermit script {other:?}")).into())
        }
    };
    if !text.contains(expected) {
        return Err(HermitError::msg(format!(
            "{path} is out of date; run 'hermit init' to regenerate it"
        ))
        .into());
    }
    println!("{path}: ok");
    Ok(())
}
