//! `kiln build` command - Build an image from a Kilnfile.
//!
//! Renders the Kilnfile with the given variables, compiles it into a plan
//! and runs it against the local container engine.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use kiln_core::config::{default_cache_dir, AuthConfig, BuildConfig, DEFAULT_KILNFILE};
use kiln_core::error::short_id;
use kiln_core::units::format_size;
use kiln_core::vars::{render, Vars};
use kiln_core::State;
use kiln_runtime::build::context::read_dockerignore;
use kiln_runtime::{Build, CacheFs, DockerClient, EngineClient, Kilnfile, Plan};

/// `-f -` reads the Kilnfile from stdin.
const STDIN_FILE: &str = "-";

#[derive(Args)]
pub struct BuildArgs {
    /// Build context directory (contains the Kilnfile and source files)
    #[arg(default_value = ".")]
    pub path: String,

    /// Kilnfile name, relative to the context directory, or `-` for stdin
    #[arg(short = 'f', long = "file", default_value = DEFAULT_KILNFILE)]
    pub file: String,

    /// Set a template variable (KEY=VALUE), can be repeated
    #[arg(long = "var", value_name = "KEY=VALUE")]
    pub var: Vec<String>,

    /// Load template variables from a JSON or YAML file, can be repeated
    #[arg(long = "vars", value_name = "FILE")]
    pub vars: Vec<PathBuf>,

    /// Don't use the cache
    #[arg(long)]
    pub no_cache: bool,

    /// Ignore cached results and overwrite them
    #[arg(long)]
    pub reload_cache: bool,

    /// Cache directory (default: ~/.kiln/cache)
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Push images on PUSH (otherwise they are only tagged)
    #[arg(long)]
    pub push: bool,

    /// Always pull base images
    #[arg(long)]
    pub pull: bool,

    /// Run ATTACH steps
    #[arg(long)]
    pub attach: bool,

    /// Remove intermediate images that were not tagged
    #[arg(long)]
    pub no_garbage: bool,

    /// Build identifier used to name volume and exports containers
    #[arg(long)]
    pub id: Option<String>,

    /// Write artifact files for pushed images into this directory
    #[arg(long)]
    pub artifacts_path: Option<PathBuf>,

    /// Registry credentials (USER:PASSWORD)
    #[arg(long)]
    pub auth: Option<String>,

    /// Print the rendered Kilnfile and exit
    #[arg(long)]
    pub print: bool,
}

pub async fn execute(args: BuildArgs, verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let mut stdin = std::io::stdin();
    execute_with_input(args, verbose, &mut stdin).await
}

async fn execute_with_input<R: Read>(
    args: BuildArgs,
    verbose: bool,
    input: &mut R,
) -> Result<(), Box<dyn std::error::Error>> {
    let (context_dir, rendered) = load_kilnfile(&args, input)?;

    if args.print {
        print!("{rendered}");
        return Ok(());
    }

    let kilnfile = Kilnfile::parse(&rendered)?;

    let auth = match &args.auth {
        Some(raw) => Some(
            AuthConfig::parse(raw).ok_or("Invalid --auth, expected USER:PASSWORD")?,
        ),
        None => None,
    };

    let config = BuildConfig {
        dockerignore: read_dockerignore(&context_dir)?,
        kilnfile_name: args.file.clone(),
        context_dir,
        id: args.id.clone(),
        artifacts_path: args.artifacts_path.clone(),
        pull: args.pull,
        no_garbage: args.no_garbage,
        attach: args.attach,
        verbose,
        no_cache: args.no_cache,
        reload_cache: args.reload_cache,
        push: args.push,
        auth,
    };

    let docker = DockerClient::connect(config.auth.as_ref())?;
    docker.ping().await?;
    let client: Arc<dyn EngineClient> = Arc::new(docker);
    let no_cache = config.no_cache;
    let mut build = Build::new(config, client);

    if !no_cache {
        let cache_dir = args.cache_dir.clone().unwrap_or_else(default_cache_dir);
        tracing::debug!(dir = %cache_dir.display(), "Using cache");
        build = build.with_cache(Arc::new(CacheFs::new(&cache_dir)?));
    }

    let plan = Plan::new(kilnfile.instructions, true);
    let result = build.run(plan, State::default()).await;

    if let Err(e) = result {
        if !build.image_id().is_empty() {
            tracing::info!("Last image: {}", short_id(build.image_id()));
        }
        return Err(e.into());
    }

    tracing::info!(
        "Successfully built {} | final size {} (+{} from the base image)",
        short_id(build.image_id()),
        format_size(build.virtual_size()),
        format_size(build.produced_size()),
    );

    Ok(())
}

/// Resolve the context, read the Kilnfile (from `input` for `-f -`) and
/// render it with the command line variables.
fn load_kilnfile<R: Read>(
    args: &BuildArgs,
    input: &mut R,
) -> Result<(PathBuf, String), Box<dyn std::error::Error>> {
    let context_dir = PathBuf::from(&args.path)
        .canonicalize()
        .map_err(|e| format!("Invalid build context path '{}': {}", args.path, e))?;

    if !context_dir.is_dir() {
        return Err(format!(
            "Build context '{}' is not a directory",
            context_dir.display()
        )
        .into());
    }

    let template = if args.file == STDIN_FILE {
        let mut content = String::new();
        input
            .read_to_string(&mut content)
            .map_err(|e| format!("Failed to read Kilnfile from stdin: {}", e))?;
        content
    } else {
        let kilnfile_path = resolve_kilnfile(&context_dir, &args.file);
        std::fs::read_to_string(&kilnfile_path)
            .map_err(|e| format!("Failed to read {}: {}", kilnfile_path.display(), e))?
    };

    let vars = load_vars(&args.vars, &args.var)?;
    let rendered = render(&template, &vars)?;
    Ok((context_dir, rendered))
}

/// Absolute paths are used as given, others are relative to the context.
fn resolve_kilnfile(context_dir: &Path, file: &str) -> PathBuf {
    let path = PathBuf::from(file);
    if path.is_absolute() {
        path
    } else {
        context_dir.join(path)
    }
}

/// Variables from files in order, then `--var` assignments on top.
fn load_vars(files: &[PathBuf], assignments: &[String]) -> Result<Vars, Box<dyn std::error::Error>> {
    let mut vars = Vars::new();
    for file in files {
        vars.merge(Vars::from_file(file)?);
    }
    vars.merge(Vars::from_assignments(assignments)?);
    Ok(vars)
}
