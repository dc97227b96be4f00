mod deps;
mod interrupt;
mod process;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use prebuilt_cache::{
    ArtifactName, CacheError, CacheOutcome, CacheResolver, LocalCacheStore, RemoteCacheProvider,
    RemoteProvider, Resolution, ResolverOptions,
};
use prebuilt_config::{EnvSnapshot, LoggingConfig, PrebuiltConfig};
use prebuilt_fingerprint::{FingerprintOptions, FingerprintResult, Platform, SourceCollector};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use crate::deps::CommandDependencyResolver;

#[derive(Parser)]
#[command(
    name = "prebuilt",
    version,
    about = "Fingerprint native builds and reuse cached artifacts"
)]
struct Cli {
    /// Project root (defaults to the current directory)
    #[arg(long, global = true, default_value = ".")]
    project: PathBuf,
    /// Config file; overrides discovery and PREBUILT_CONFIG_PATH
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// More logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    /// Emit JSON suitable for CI
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the fingerprint of a platform's native inputs
    Fingerprint(FingerprintArgs),
    /// Look up a cached build, locally then remotely
    Resolve(ResolveArgs),
    /// Cache a freshly built artifact
    Store(StoreArgs),
    /// Reuse a cached build, or run the build command and cache its output
    Build(BuildArgs),
    /// Manage the local artifact cache
    Cache(CacheArgs),
}

#[derive(Args)]
struct FingerprintArgs {
    /// `android` or `ios`
    #[arg(long)]
    platform: String,
    /// Also print the per-source breakdown
    #[arg(long)]
    debug: bool,
}

#[derive(Args)]
struct TargetArgs {
    /// `android` or `ios`
    #[arg(long)]
    platform: String,
    /// Build qualifier that is part of the artifact name (repeatable)
    #[arg(long = "trait", value_name = "TRAIT")]
    traits: Vec<String>,
    /// Never consult or update the remote cache
    #[arg(long)]
    local_only: bool,
}

#[derive(Args)]
struct ResolveArgs {
    #[command(flatten)]
    target: TargetArgs,
    /// Exit with status 1 when nothing is cached
    #[arg(long)]
    fail_on_miss: bool,
}

#[derive(Args)]
struct StoreArgs {
    #[command(flatten)]
    target: TargetArgs,
    /// Built artifact (file or directory)
    path: PathBuf,
}

#[derive(Args)]
struct BuildArgs {
    #[command(flatten)]
    target: TargetArgs,
    /// Where the build command leaves its artifact (relative to the project)
    #[arg(long)]
    output: PathBuf,
    /// The real build command
    #[arg(last = true, required = true, value_name = "COMMAND")]
    command: Vec<String>,
}

#[derive(Args)]
struct CacheArgs {
    #[command(subcommand)]
    command: CacheCommand,
}

#[derive(Subcommand)]
enum CacheCommand {
    /// List cached artifacts
    List,
    /// Remove one artifact
    Remove {
        name: String,
        /// Also delete every remote copy
        #[arg(long)]
        remote: bool,
    },
    /// Remove every cached artifact
    Clean,
}

fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            2
        }
    };

    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<i32> {
    let session = Session::open(&cli)?;
    let json = cli.json;

    match cli.command {
        Command::Fingerprint(args) => {
            let platform = parse_platform(&args.platform)?;
            let result = session
                .collector()?
                .fingerprint(&session.fingerprint_options(platform))?;
            print_fingerprint(platform, &result, args.debug, json)?;
            Ok(0)
        }
        Command::Resolve(args) => {
            let platform = parse_platform(&args.target.platform)?;
            let resolver = session.resolver(args.target.local_only)?;
            let resolution = resolver.resolve_artifact(
                platform,
                &args.target.traits,
                &session.fingerprint_options(platform),
            )?;
            print_resolution(&resolution, json)?;
            let missed = resolution.outcome == CacheOutcome::NotFound;
            Ok(if missed && args.fail_on_miss { 1 } else { 0 })
        }
        Command::Store(args) => {
            let platform = parse_platform(&args.target.platform)?;
            let built = session.project_root.join(&args.path);
            if !built.exists() {
                bail!("artifact {} does not exist", built.display());
            }
            let resolver = session.resolver(args.target.local_only)?;
            let fingerprint =
                resolver.fingerprint(platform, &session.fingerprint_options(platform))?;
            let name = resolver.artifact_name(platform, &args.target.traits, &fingerprint.hash);
            let path = resolver.store_artifact(&name, &built);
            print_stored(&name, &path, json)?;
            Ok(0)
        }
        Command::Build(args) => {
            let platform = parse_platform(&args.target.platform)?;
            let resolver = session.resolver(args.target.local_only)?;
            let output = session.project_root.join(&args.output);
            let result = resolver.resolve_or_build(
                platform,
                &args.target.traits,
                &session.fingerprint_options(platform),
                |name| {
                    tracing::debug!(%name, "no cached build; running build command");
                    run_build(&args.command, &session.project_root, &output, &session.cancel)
                },
            );
            match result {
                Ok(resolution) => {
                    print_resolution(&resolution, json)?;
                    Ok(0)
                }
                Err(CacheError::Build { source }) => {
                    eprintln!("error: build failed: {source}");
                    Ok(1)
                }
                Err(err) => Err(err.into()),
            }
        }
        Command::Cache(args) => {
            let store = session.store();
            match args.command {
                CacheCommand::List => {
                    let entries = store.list()?;
                    if json {
                        print_json(&entries)?;
                    } else if entries.is_empty() {
                        println!("cache: empty ({})", store.root().display());
                    } else {
                        for entry in &entries {
                            println!("{}\t{}\t{}", entry.name, entry.size_bytes, entry.path.display());
                        }
                    }
                }
                CacheCommand::Remove { name, remote } => {
                    let Some(name) = ArtifactName::parse(&name) else {
                        bail!("`{name}` is not a valid artifact name");
                    };
                    let removed_local = store.remove(&name)?;
                    let removed_remote = remote && session.delete_remote(&name)?;
                    if json {
                        print_json(&serde_json::json!({
                            "name": name,
                            "removedLocal": removed_local,
                            "removedRemote": removed_remote,
                        }))?;
                    } else {
                        println!(
                            "{name}: local {}, remote {}",
                            removed_or_absent(removed_local),
                            if remote { removed_or_absent(removed_remote) } else { "untouched" }
                        );
                    }
                }
                CacheCommand::Clean => {
                    let removed = store.clean()?;
                    if json {
                        print_json(&serde_json::json!({ "removed": removed }))?;
                    } else {
                        println!("cache: removed {removed} entries from {}", store.root().display());
                    }
                }
            }
            Ok(0)
        }
    }
}

/// Everything derived once per invocation: project root, config, credentials
/// and the interrupt token.
struct Session {
    project_root: PathBuf,
    config: PrebuiltConfig,
    env: EnvSnapshot,
    deps: CommandDependencyResolver,
    cancel: CancellationToken,
}

impl Session {
    fn open(cli: &Cli) -> Result<Self> {
        let project_root = std::fs::canonicalize(&cli.project)
            .with_context(|| format!("project root {} is not usable", cli.project.display()))?;

        let mut env = EnvSnapshot::capture();
        if let Some(path) = &cli.config {
            env.config_path = Some(std::path::absolute(path)?);
        }

        // Config warnings are emitted before the configured subscriber exists.
        let bootstrap = tracing_subscriber::fmt()
            .with_writer(io::stderr)
            .with_max_level(tracing::Level::WARN)
            .finish();
        let (config, config_path) = tracing::subscriber::with_default(bootstrap, || {
            prebuilt_config::load_for_project(&project_root, &env)
        })?;

        prebuilt_config::init_tracing(&logging_config(&config.logging, cli.verbose));
        if let Some(path) = &config_path {
            tracing::debug!(path = %path.display(), "using config file");
        }

        let cancel = CancellationToken::new();
        interrupt::install(cancel.clone());
        let deps = CommandDependencyResolver::new(&config.dependencies, cancel.clone());

        Ok(Self {
            project_root,
            config,
            env,
            deps,
            cancel,
        })
    }

    fn fingerprint_options(&self, platform: Platform) -> FingerprintOptions {
        FingerprintOptions::new(platform)
            .with_extra_sources(self.config.fingerprint.extra_sources.iter().cloned())
            .with_ignore_paths(self.config.fingerprint.ignore_paths.iter().cloned())
    }

    fn collector(&self) -> Result<SourceCollector<'_, CommandDependencyResolver>> {
        let mut collector = SourceCollector::new(&self.project_root, &self.deps)?;
        if let Some(manifest) = &self.config.fingerprint.framework_manifest {
            collector = collector.with_framework_manifest(manifest);
        }
        Ok(collector)
    }

    fn store(&self) -> LocalCacheStore {
        LocalCacheStore::new(self.config.cache_dir(&self.project_root, &self.env))
    }

    /// The configured remote provider. A provider that cannot be constructed
    /// is reported and replaced by no provider.
    fn provider(&self) -> Result<RemoteProvider> {
        let selection = self.config.remote_selection(&self.env)?;
        Ok(RemoteProvider::from_selection(&selection).unwrap_or_else(|err| {
            tracing::warn!(
                provider = selection.name(),
                error = %err,
                "remote cache unavailable; continuing without it"
            );
            RemoteProvider::Disabled
        }))
    }

    fn resolver(&self, local_only: bool) -> Result<CacheResolver<'_, CommandDependencyResolver>> {
        let mut options = ResolverOptions {
            tool_prefix: self.config.tool_prefix.clone(),
            remote_lookup: self.config.cache.remote_lookup,
            upload: self.config.cache.upload,
        };
        if local_only {
            options = options.local_only();
        }
        let provider = if options.remote_lookup || options.upload {
            self.provider()?
        } else {
            RemoteProvider::Disabled
        };

        Ok(CacheResolver::new(self.collector()?, self.store(), provider)
            .with_options(options)
            .with_cancel_token(self.cancel.clone()))
    }

    fn delete_remote(&self, name: &ArtifactName) -> Result<bool> {
        let provider = self.provider()?;
        if !provider.is_enabled() {
            tracing::warn!("no remote cache configured; nothing deleted remotely");
            return Ok(false);
        }
        Ok(provider.delete(name, &self.cancel)?)
    }
}

fn logging_config(configured: &LoggingConfig, verbose: u8) -> LoggingConfig {
    let level = match verbose {
        0 => configured.level.clone(),
        1 => "debug".to_owned(),
        _ => "trace".to_owned(),
    };
    LoggingConfig {
        level,
        json: configured.json,
    }
}

fn parse_platform(raw: &str) -> Result<Platform> {
    Ok(raw.parse::<Platform>()?)
}

fn run_build(
    command: &[String],
    project_root: &Path,
    output: &Path,
    cancel: &CancellationToken,
) -> io::Result<PathBuf> {
    let status = process::run_inherited(command, project_root, cancel)?;
    if !status.success() {
        return Err(io::Error::other(format!(
            "`{}` exited with {status}",
            command.join(" ")
        )));
    }
    if !output.exists() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("build succeeded but {} does not exist", output.display()),
        ));
    }
    Ok(output.to_path_buf())
}

fn removed_or_absent(removed: bool) -> &'static str {
    if removed {
        "removed"
    } else {
        "absent"
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FingerprintReport<'a> {
    platform: Platform,
    #[serde(flatten)]
    result: &'a FingerprintResult,
}

fn print_fingerprint(
    platform: Platform,
    result: &FingerprintResult,
    debug: bool,
    json: bool,
) -> Result<()> {
    if json {
        return print_json(&FingerprintReport { platform, result });
    }

    println!("{}", result.hash);
    if debug {
        for source in &result.sources {
            println!(
                "  {:<11} {}  {}  [{}]",
                source.kind.as_str(),
                source.contribution_hash,
                source.identity,
                source.reasons.join(", ")
            );
        }
    }
    Ok(())
}

fn print_resolution(resolution: &Resolution, json: bool) -> Result<()> {
    if json {
        return print_json(resolution);
    }

    match &resolution.outcome {
        CacheOutcome::LocalHit { path } => println!("local-hit {}", path.display()),
        CacheOutcome::RemoteHit { path } => println!("remote-hit {}", path.display()),
        CacheOutcome::Built { path } => println!("built {}", path.display()),
        CacheOutcome::NotFound => println!("not-found {}", resolution.name),
    }
    Ok(())
}

fn print_stored(name: &ArtifactName, path: &Path, json: bool) -> Result<()> {
    if json {
        return print_json(&serde_json::json!({ "name": name, "path": path }));
    }
    println!("stored {name} {}", path.display());
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value)?;
    println!("{out}");
    Ok(())
}
