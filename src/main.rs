use std::{
    env,
    path::{Path, PathBuf},
    process,
};

use anyhow::bail;
use clap::{Args, Parser, Subcommand};
use ruleflow::{
    app::{App, STEP_NAMES},
    config::{ConfigManager, EnvConfigManager, Settings},
    context::{ContextBuilder, Specification},
    envelope::Envelope,
    flow::{FinalResult, GraphDefinition, Request, WorkflowGraph},
    logger::init_tracing,
    payload::ExtractedEntityPayload,
};
use serde_json::json;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "ruleflow",
    about = "Compile data rules into SQL views and ingest web content",
    version
)]
struct Cli {
    /// Working directory holding `config/.env` and `logs/`. Defaults to $RULEFLOW_ROOT or `.`
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Log level directive (e.g. error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compile a natural-language rule into a registered view
    Rule(RuleArgs),

    /// Fetch a page and upsert the entities found on it
    Ingest { url: String },

    /// Workflow graph tools
    Graph(GraphArgs),

    /// Print the grounded prompt built for TEXT
    Context { text: String },

    /// Emit JSON Schema for the envelope, entity payload and workflow graph
    Schema,
}

#[derive(Args, Debug)]
struct RuleArgs {
    /// Stable rule code in lowercase snake case; the view is `rule_<code>`
    #[arg(long)]
    code: String,
    #[arg(long)]
    name: Option<String>,
    #[arg(long, default_value = "")]
    description: String,
    /// The rule in plain English
    text: String,
}

#[derive(Args, Debug)]
struct GraphArgs {
    #[command(subcommand)]
    command: GraphCommands,
}

#[derive(Subcommand, Debug)]
enum GraphCommands {
    Validate { file: PathBuf },
}

/// Resolve the working directory from the flag, the environment or the current directory.
fn resolve_root_dir(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| env::var("RULEFLOW_ROOT").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."))
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let root = resolve_root_dir(cli.root);

    match cli.command {
        Commands::Rule(args) => {
            let name = args.name.unwrap_or_else(|| args.code.clone());
            let request = Request::rule(&args.code, &name, &args.description, &args.text);
            run(root, &cli.log_level, request).await
        }
        Commands::Ingest { url } => run(root, &cli.log_level, Request::content(&url)).await,
        Commands::Graph(graph) => match graph.command {
            GraphCommands::Validate { file } => {
                let graph = WorkflowGraph::load(&file)?;
                graph.validate(&STEP_NAMES)?;
                if graph.has_cycle() {
                    println!("Graph contains a cycle; requests on it are bounded by the hop limit.");
                }
                println!("✅ Workflow graph is valid.");
                Ok(())
            }
        },
        Commands::Context { text } => {
            let settings = load_settings(&root).await?;
            let specification = match &settings.specification_path {
                Some(path) => Specification::load(path)?,
                None => Specification::bundled()?,
            };
            let prompt = ContextBuilder::new(specification.into()).build_context(&text);
            println!("{}\n---\n{}", prompt.system, prompt.user);
            Ok(())
        }
        Commands::Schema => {
            let schemas = json!({
                "envelope": schemars::schema_for!(Envelope),
                "payload": schemars::schema_for!(ExtractedEntityPayload),
                "workflow": schemars::schema_for!(GraphDefinition),
            });
            println!("{}", serde_json::to_string_pretty(&schemas)?);
            Ok(())
        }
    }
}

async fn load_settings(root: &Path) -> anyhow::Result<Settings> {
    let config = ConfigManager(EnvConfigManager::new(root.join("config").join(".env")));
    Ok(Settings::load(&config).await?)
}

async fn run(root: PathBuf, log_level: &str, request: Request) -> anyhow::Result<()> {
    init_tracing(&root.join("logs"), "ruleflow.log", "ruleflow-requests.json", log_level)?;
    info!(root = %root.display(), flow_kind = %request.flow_kind, "ruleflow starting");

    let settings = load_settings(&root).await?;
    let app = match App::bootstrap(&settings).await {
        Ok(app) => app,
        Err(err) => {
            error!("Failed to bootstrap ruleflow: {err:#}");
            return Err(err);
        }
    };

    let result: FinalResult = tokio::select! {
        result = app.supervisor().process(request) => result?,
        _ = tokio::signal::ctrl_c() => bail!("interrupted"),
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.is_success() {
        eprintln!("Request ended at `{}`: {}", result.terminal, result.envelope.reason());
        process::exit(2);
    }
    Ok(())
}
