use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use wikimirror_core::api::{MediaWikiClient, MediaWikiClientConfig};
use wikimirror_core::config::load_config;
use wikimirror_core::link_cache::{LinkCache, invalidate_all};
use wikimirror_core::migrate::{open_mirror, run_migrations, table_row_counts};
use wikimirror_core::replay::{QueryParams, QueryReplay};
use wikimirror_core::runtime::{
    MIGRATIONS_POLICY_MESSAGE, PathOverrides, ResolutionContext, ResolvedPaths, init_layout,
    resolve_paths,
};
use wikimirror_core::sync::{SyncOptions, grab_one, sync_mirror};
use wikimirror_core::timestamp::SystemClock;

#[derive(Debug, Parser)]
#[command(
    name = "wikimirror",
    version,
    about = "Incremental relational mirror of a MediaWiki site"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, help = "Log at debug level")]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the state directory and a default config.
    Init(InitArgs),
    Db(DbArgs),
    /// Bring the whole mirror up to date.
    Sync(SyncArgs),
    /// Run one grabber.
    Grab(GrabArgs),
    #[command(name = "link-cache")]
    LinkCache(LinkCacheArgs),
    /// Answer an API-style query from the mirror, e.g. `list=recentchanges rcdir=newer`.
    Query(QueryArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
}

#[derive(Debug, Args)]
struct DbArgs {
    #[command(subcommand)]
    command: DbSubcommand,
}

#[derive(Debug, Subcommand)]
enum DbSubcommand {
    Migrate,
    Stats,
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[arg(long, help = "Do not recompute derived link tables")]
    skip_link_cache: bool,
    #[arg(long, help = "Fetch revision text")]
    with_content: bool,
    #[arg(long, help = "Run even when the remote has no newer changes")]
    force: bool,
}

#[derive(Debug, Args)]
struct GrabArgs {
    #[arg(value_name = "ENTITY", help = "Grabber name, e.g. pages or recentchanges")]
    entity: String,
    #[arg(long, help = "Discard mirrored rows and insert from scratch")]
    rebuild: bool,
    #[arg(long, help = "Store revision text while grabbing revisions")]
    with_content: bool,
}

#[derive(Debug, Args)]
struct LinkCacheArgs {
    #[command(subcommand)]
    command: LinkCacheSubcommand,
}

#[derive(Debug, Subcommand)]
enum LinkCacheSubcommand {
    Update,
    #[command(name = "invalidate-all")]
    InvalidateAll,
}

#[derive(Debug, Args)]
struct QueryArgs {
    #[arg(value_name = "KEY=VALUE", required = true)]
    params: Vec<String>,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Db(DbArgs { command })) => match command {
            DbSubcommand::Migrate => run_db_migrate(&runtime),
            DbSubcommand::Stats => run_db_stats(&runtime),
        },
        Some(Commands::Sync(args)) => run_sync(&runtime, args),
        Some(Commands::Grab(args)) => run_grab(&runtime, args),
        Some(Commands::LinkCache(LinkCacheArgs { command })) => match command {
            LinkCacheSubcommand::Update => run_link_cache_update(&runtime),
            LinkCacheSubcommand::InvalidateAll => run_link_cache_invalidate(&runtime),
        },
        Some(Commands::Query(args)) => run_query(&runtime, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("WIKIMIRROR_LOG").unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(&paths, args.force)?;

    println!("Initialized wikimirror runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    println!("next: {MIGRATIONS_POLICY_MESSAGE}");
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_migrate(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = run_migrations(&paths)?;

    println!("db migrate");
    println!("db_path: {}", normalize_path(&paths.db_path));
    if report.applied.is_empty() {
        println!("applied: <none>");
    }
    for migration in &report.applied {
        println!("applied: v{:03} {}", migration.version, migration.name);
    }
    println!("current_version: {}", report.current_version);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_stats(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let connection = open_mirror(&paths)?;

    println!("db stats");
    println!("db_path: {}", normalize_path(&paths.db_path));
    let size = std::fs::metadata(&paths.db_path)
        .map(|metadata| metadata.len().to_string())
        .unwrap_or_else(|_| "n/a".to_string());
    println!("db_size_bytes: {size}");
    for (table, rows) in table_row_counts(&connection)? {
        println!("table.{table}: {rows}");
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_sync(runtime: &RuntimeOptions, args: SyncArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let mut options = SyncOptions::from_config(&config);
    options.with_content |= args.with_content;
    options.update_link_cache &= !args.skip_link_cache;
    options.force = args.force;

    let mut connection = open_mirror(&paths)?;
    let mut api = MediaWikiClient::new(MediaWikiClientConfig::from_config(&config))?;
    let report = sync_mirror(&mut connection, &mut api, &SystemClock, &options)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_grab(runtime: &RuntimeOptions, args: GrabArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let mut options = SyncOptions::from_config(&config);
    options.with_content |= args.with_content;

    let mut connection = open_mirror(&paths)?;
    let mut api = MediaWikiClient::new(MediaWikiClientConfig::from_config(&config))?;
    let report = grab_one(
        &mut connection,
        &mut api,
        &SystemClock,
        &args.entity,
        args.rebuild,
        &options,
    )?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_link_cache_update(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let mut connection = open_mirror(&paths)?;
    let report = LinkCache::new(config.link_cache.content_cache_capacity).update(&mut connection)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_link_cache_invalidate(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let connection = open_mirror(&paths)?;
    let cleared = invalidate_all(&connection)?;
    println!("cleared_markers: {cleared}");
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_query(runtime: &RuntimeOptions, args: QueryArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let connection = open_mirror(&paths)?;
    let params = QueryParams::parse_pairs(&args.params)?;
    let replay = QueryReplay::new(&connection)?;
    let results = replay
        .query(&params)
        .with_context(|| format!("query {} failed", args.params.join(" ")))?;
    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        if let Err(error) = dotenvy::from_path_override(&project_env) {
            tracing::warn!(path = %normalize_path(&project_env), %error, "failed to load project .env");
        }
    }

    resolve_paths(&context, &overrides)
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
