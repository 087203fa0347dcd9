use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use scriptman_core::config::{ManagerConfig, SiteInfo, load_config};
use scriptman_core::engine::{EditAction, EditReport, Engine, EngineStore, MoveReport};
use scriptman_core::import::{Import, ImportKind, TARGETS, target_page};
use scriptman_core::service::{MediaWikiClient, MediaWikiClientConfig};
use scriptman_core::summary::StringTables;
use similar::TextDiff;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "scriptman",
    version,
    about = "Manage user script installs across MediaWiki skin pages"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH", help = "Config file path")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Compute edits but submit nothing")]
    dry_run: bool,
    #[arg(long, global = true, help = "Emit machine-readable JSON")]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "List installed references on one or all targets")]
    List(ListArgs),
    #[command(about = "Add a script reference to a target page")]
    Install(InstallArgs),
    #[command(about = "Remove a script reference from a target page")]
    Uninstall(ScriptArgs),
    #[command(about = "Comment a script reference back in")]
    Enable(ScriptArgs),
    #[command(about = "Comment a script reference out")]
    Disable(ScriptArgs),
    #[command(name = "move", about = "Relocate a reference to another target")]
    Move(MoveArgs),
    #[command(about = "Rewrite every recognized statement into canonical form")]
    Normalize(NormalizeArgs),
    #[command(about = "Run a script under the latency capture wrapper")]
    Capture(CaptureArgs),
    #[command(about = "Restore a captured script to a plain statement")]
    Decapture(ScriptArgs),
}

#[derive(Debug, Clone)]
struct Globals {
    config: Option<PathBuf>,
    dry_run: bool,
    json: bool,
}

impl Globals {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            config: cli.config.clone(),
            dry_run: cli.dry_run,
            json: cli.json,
        }
    }
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(short = 't', long, value_name = "TARGET", help = "Restrict to one target")]
    target: Option<String>,
}

#[derive(Debug, Args)]
struct ScriptArgs {
    /// Page title, URL, or page title on another wiki with --wiki.
    script: String,
    #[arg(long, value_name = "WIKI", help = "Source wiki, e.g. de.wikipedia")]
    wiki: Option<String>,
    #[arg(short = 't', long, default_value = "common")]
    target: String,
}

#[derive(Debug, Args)]
struct InstallArgs {
    #[command(flatten)]
    script: ScriptArgs,
    #[arg(long, help = "Install commented out")]
    disabled: bool,
}

#[derive(Debug, Args)]
struct MoveArgs {
    #[command(flatten)]
    script: ScriptArgs,
    /// Target the reference moves to.
    new_target: String,
}

#[derive(Debug, Args)]
struct NormalizeArgs {
    #[arg(short = 't', long, default_value = "common")]
    target: String,
}

#[derive(Debug, Args)]
struct CaptureArgs {
    #[command(flatten)]
    script: ScriptArgs,
    #[arg(long, value_name = "NAME", help = "Display name shown by the capture harness")]
    name: Option<String>,
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = Cli::parse();
    let globals = Globals::from_cli(&cli);

    match cli.command {
        Some(Commands::List(args)) => run_list(&globals, args),
        Some(Commands::Install(args)) => run_install(&globals, args),
        Some(Commands::Uninstall(args)) => run_uninstall(&globals, args),
        Some(Commands::Enable(args)) => run_set_disabled(&globals, args, false),
        Some(Commands::Disable(args)) => run_set_disabled(&globals, args, true),
        Some(Commands::Move(args)) => run_move(&globals, args),
        Some(Commands::Normalize(args)) => run_normalize(&globals, args),
        Some(Commands::Capture(args)) => run_capture(&globals, args),
        Some(Commands::Decapture(args)) => run_decapture(&globals, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

struct Runtime {
    engine: Engine<MediaWikiClient>,
    site: SiteInfo,
}

fn build_runtime(globals: &Globals) -> Result<Runtime> {
    let config_path = globals
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("scriptman.toml"));
    let config = load_config(&config_path)?;
    let site = config.site_info();
    if site.user.is_empty() {
        bail!("no account configured; set site.user in scriptman.toml or SCRIPTMAN_USER");
    }

    let user_agent = config.user_agent();
    let api_url = home_api_url(&config, &site);
    debug!(api_url, cross_api_url = config.cross_api_url(), "resolved endpoints");
    let mut home = MediaWikiClient::new(MediaWikiClientConfig::new(&api_url, &user_agent))?;
    let mut cross =
        MediaWikiClient::new(MediaWikiClientConfig::new(&config.cross_api_url(), &user_agent))?;

    if let (Ok(username), Ok(password)) = (env::var("WIKI_BOT_USER"), env::var("WIKI_BOT_PASS")) {
        home.login(&username, &password)
            .context("login to home wiki failed")?;
        cross
            .login(&username, &password)
            .context("login to cross-site wiki failed")?;
    }

    let store = Arc::new(EngineStore::new(
        site.clone(),
        StringTables::english_defaults(),
    ));
    let engine = Engine::new(store, home, cross).dry_run(globals.dry_run);
    Ok(Runtime { engine, site })
}

fn home_api_url(config: &ManagerConfig, site: &SiteInfo) -> String {
    config
        .api_url()
        .unwrap_or_else(|| format!("https://{}.org/w/api.php", site.home_wiki))
}

fn validate_target(target: &str) -> Result<()> {
    if TARGETS.contains(&target) {
        return Ok(());
    }
    bail!("unknown target {target:?}; expected one of {}", TARGETS.join(", "));
}

fn parse_script(args: &ScriptArgs, site: &SiteInfo) -> Result<Import> {
    validate_target(&args.target)?;
    let spec = args.script.trim();
    if spec.is_empty() {
        bail!("empty script reference");
    }
    let import = if spec.starts_with("http://") || spec.starts_with("https://") || spec.starts_with("//")
    {
        Import::of_url(spec, args.target.clone(), site)
    } else if let Some(wiki) = &args.wiki {
        Import::of_cross_wiki(spec, wiki.clone(), args.target.clone(), site)
    } else {
        Import::of_local(spec, args.target.clone())
    };
    Ok(import)
}

fn run_list(globals: &Globals, args: ListArgs) -> Result<()> {
    let mut runtime = build_runtime(globals)?;
    let targets: Vec<&str> = match &args.target {
        Some(target) => {
            validate_target(target)?;
            vec![target.as_str()]
        }
        None => TARGETS.to_vec(),
    };

    let mut rows = Vec::new();
    for target in targets {
        let imports = runtime.engine.imports(target)?;
        let captured = runtime.engine.capture_items(target)?;
        if globals.json {
            for import in &imports {
                rows.push(serde_json::json!({
                    "target": target,
                    "kind": kind_label(import.kind()),
                    "name": import.name(),
                    "disabled": import.disabled,
                    "captured": false,
                }));
            }
            for item in &captured {
                rows.push(serde_json::json!({
                    "target": target,
                    "kind": "captured",
                    "name": item.name,
                    "key": item.key,
                    "captured": true,
                }));
            }
            continue;
        }

        if imports.is_empty() && captured.is_empty() {
            continue;
        }
        println!("{}", target_page(&runtime.site.user, target));
        for import in &imports {
            let state = if import.disabled { " (disabled)" } else { "" };
            println!("  [{}] {}{}", kind_label(import.kind()), import.name(), state);
        }
        for item in &captured {
            println!("  [captured] {}", item.name);
        }
    }

    if globals.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    }
    Ok(())
}

fn run_install(globals: &Globals, args: InstallArgs) -> Result<()> {
    let mut runtime = build_runtime(globals)?;
    let mut import = parse_script(&args.script, &runtime.site)?;
    import.disabled = args.disabled;
    let report = runtime.engine.install(&import)?;
    print_report(globals, &report)
}

fn run_uninstall(globals: &Globals, args: ScriptArgs) -> Result<()> {
    let mut runtime = build_runtime(globals)?;
    let import = parse_script(&args, &runtime.site)?;
    let report = runtime.engine.uninstall(&import)?;
    print_report(globals, &report)
}

fn run_set_disabled(globals: &Globals, args: ScriptArgs, disabled: bool) -> Result<()> {
    let mut runtime = build_runtime(globals)?;
    let import = parse_script(&args, &runtime.site)?;
    let report = runtime.engine.set_disabled(&import, disabled)?;
    print_report(globals, &report)
}

fn run_move(globals: &Globals, args: MoveArgs) -> Result<()> {
    let mut runtime = build_runtime(globals)?;
    validate_target(&args.new_target)?;
    let import = parse_script(&args.script, &runtime.site)?;
    if args.new_target == import.target {
        bail!("{} is already on {}", import.name(), import.target);
    }
    let MoveReport { installed, removed } = runtime.engine.move_to(&import, &args.new_target)?;
    print_report(globals, &installed)?;
    print_report(globals, &removed)
}

fn run_normalize(globals: &Globals, args: NormalizeArgs) -> Result<()> {
    let mut runtime = build_runtime(globals)?;
    validate_target(&args.target)?;
    let report = runtime.engine.normalize(&args.target)?;
    print_report(globals, &report)
}

fn run_capture(globals: &Globals, args: CaptureArgs) -> Result<()> {
    let mut runtime = build_runtime(globals)?;
    let import = parse_script(&args.script, &runtime.site)?;
    let display_name = args
        .name
        .clone()
        .unwrap_or_else(|| import.name().to_string());
    let report = runtime.engine.capture(&import, &display_name)?;
    print_report(globals, &report)
}

fn run_decapture(globals: &Globals, args: ScriptArgs) -> Result<()> {
    let mut runtime = build_runtime(globals)?;
    let import = parse_script(&args, &runtime.site)?;
    let report = runtime.engine.decapture(&import)?;
    print_report(globals, &report)
}

fn kind_label(kind: ImportKind) -> &'static str {
    match kind {
        ImportKind::Local => "local",
        ImportKind::CrossWiki => "cross-wiki",
        ImportKind::Url => "url",
    }
}

fn action_label(action: EditAction) -> &'static str {
    match action {
        EditAction::Saved => "saved",
        EditAction::Appended => "appended",
        EditAction::NoChange => "no change",
        EditAction::Planned => "planned (dry run)",
    }
}

fn print_report(globals: &Globals, report: &EditReport) -> Result<()> {
    if globals.json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("title: {}", report.title);
    println!("action: {}", action_label(report.action));
    if let Some(summary) = &report.summary {
        println!("summary: {summary}");
    }
    if let Some(pending) = &report.pending {
        let diff = TextDiff::from_lines(&pending.old_text, &pending.new_text);
        print!(
            "{}",
            diff.unified_diff()
                .context_radius(2)
                .header("current", "planned")
        );
    }
    Ok(())
}
