//! Kiln CLI - list, run and validate workflows

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::{Map, Value};

use kiln::error::{FixSuggestion, KilnError, Result};
use kiln::inventory::{self, build_inventory, InventoryEntry, InventoryRoots, Source};
use kiln::manifest::{load_workflow_manifest, ManifestCatalog, Step};
use kiln::prefs::{self, Preferences, PreferencesSource};

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Kiln - composable workflows for coding agents")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List workflows and MCP servers
    List {
        /// Include overridden and archived entries
        #[arg(long)]
        all: bool,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Run a workflow by name or manifest path
    Run {
        /// Workflow name, or path to a .workflow.yaml file
        target: String,

        /// Workflow argument (repeatable)
        #[arg(short = 'a', long = "arg", value_name = "KEY=VALUE")]
        args: Vec<String>,
    },

    /// Validate a workflow manifest (parse only)
    Validate {
        /// Path to .workflow.yaml file
        file: PathBuf,
    },

    /// Show effective preferences
    Config,
}

#[tokio::main]
async fn main() {
    // Load .env file (ignore if not present)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match prefs::init_global() {
        Ok(_) => match cli.command {
            Commands::List { all, json } => list(all, json),
            Commands::Run { target, args } => run(&target, &args).await,
            Commands::Validate { file } => validate(&file),
            Commands::Config => show_config(),
        },
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        if let Some(suggestion) = e.fix_suggestion() {
            eprintln!("  {} {}", "Fix:".yellow(), suggestion);
        }
        std::process::exit(1);
    }
}

fn list(all: bool, json: bool) -> Result<()> {
    let inventory = build_inventory(&InventoryRoots::default_install());

    for diagnostic in &inventory.diagnostics {
        eprintln!(
            "{} skipped {} ({}): {}",
            "warning:".yellow().bold(),
            diagnostic.path.display(),
            diagnostic.source,
            diagnostic.reason
        );
    }

    let (workflows, mcps) = if all {
        (inventory.workflows.clone(), inventory.mcp_scripts.clone())
    } else {
        (
            inventory::active_workflows(&inventory),
            inventory::active_mcps(&inventory),
        )
    };

    if json {
        let out = serde_json::json!({
            "workflows": workflows,
            "mcpScripts": mcps,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let disabled = prefs::global().snapshot();
    print_section("Workflows", &workflows, |name| disabled.is_workflow_disabled(name));
    println!();
    print_section("MCP servers", &mcps, |_| false);
    Ok(())
}

fn print_section(title: &str, entries: &[InventoryEntry], is_disabled: impl Fn(&str) -> bool) {
    println!("{}", title.cyan().bold());
    if entries.is_empty() {
        println!("  {}", "(none)".dimmed());
        return;
    }

    let width = entries.iter().map(|e| e.name.len()).max().unwrap_or(0);
    for entry in entries {
        let tier = format!("{:8}", entry.source.as_str());
        let source = match entry.source {
            Source::Builtin => tier.blue(),
            Source::User => tier.green(),
            Source::Archived => tier.dimmed(),
        };
        let mut line = format!(
            "  {:width$}  {}  {}",
            entry.name,
            source,
            entry.description,
            width = width
        );
        if is_disabled(&entry.name) {
            line.push_str(&format!(" {}", "(disabled)".red()));
        }
        println!("{}", line);
    }
}

/// A bare name is always an inventory lookup, even when a file of that name exists
fn looks_like_path(target: &str) -> bool {
    target.ends_with(".yaml")
        || target.ends_with(".yml")
        || target.contains(std::path::MAIN_SEPARATOR)
}

/// `-a key=value` pairs into a JSON object; values stay strings for coercion
fn parse_cli_args(pairs: &[String]) -> Result<Value> {
    let mut map = Map::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(KilnError::ArgValidation {
                workflow: "(cli)".to_string(),
                arg: pair.clone(),
                expected: "KEY=VALUE".to_string(),
                reason: "missing '='".to_string(),
            });
        };
        map.insert(key.trim().to_string(), Value::String(value.to_string()));
    }
    Ok(Value::Object(map))
}

async fn run(target: &str, pairs: &[String]) -> Result<()> {
    let args = parse_cli_args(pairs)?;
    let catalog = ManifestCatalog::new(InventoryRoots::default_install());
    let snapshot = prefs::global().snapshot();

    let definition = if looks_like_path(target) {
        catalog.load_path(Path::new(target)).await?
    } else {
        if snapshot.is_workflow_disabled(target) {
            return Err(KilnError::WorkflowDisabled {
                name: target.to_string(),
            });
        }
        catalog.load(target).await?
    };

    if snapshot.is_workflow_disabled(definition.name()) {
        return Err(KilnError::WorkflowDisabled {
            name: definition.name().to_string(),
        });
    }

    println!(
        "{} Running {} | agent: {}",
        "→".cyan(),
        definition.name().cyan().bold(),
        snapshot.preferred_agent().cyan()
    );

    definition.execute(args).await?;

    println!("{} {} completed", "✓".green(), definition.name());
    Ok(())
}

fn validate(file: &Path) -> Result<()> {
    let manifest = load_workflow_manifest(file)?;

    let count = |pred: fn(&Step) -> bool| manifest.steps.iter().filter(|s| pred(s)).count();

    println!("{} Workflow '{}' is valid", "✓".green(), manifest.name);
    if !manifest.description.is_empty() {
        println!("  Description: {}", manifest.description);
    }
    println!("  Args: {}", manifest.args.len());
    println!("  Subflows: {}", manifest.subflows.len());
    println!(
        "  Steps: {} ({} exec, {} subflow, {} log)",
        manifest.steps.len(),
        count(|s| matches!(s, Step::Exec { .. })),
        count(|s| matches!(s, Step::Subflow { .. })),
        count(|s| matches!(s, Step::Log { .. })),
    );
    Ok(())
}

fn show_config() -> Result<()> {
    let cwd = std::env::current_dir()?;
    let effective = Preferences::load_layered()?;
    let snapshot = effective.snapshot();

    println!("{}", "Config files".cyan().bold());
    for path in [Preferences::config_path(), Preferences::project_config_path(&cwd)] {
        let marker = if path.exists() { "✓".green() } else { "-".dimmed() };
        println!("  {} {}", marker, path.display());
    }

    println!();
    println!("{}", "Effective".cyan().bold());
    println!("  preferred_agent: {}", snapshot.preferred_agent());
    println!("  max_attempts: {}", snapshot.retry_config().max_attempts);
    let disabled: Vec<&str> = snapshot
        .disabled_workflows()
        .iter()
        .map(String::as_str)
        .collect();
    println!(
        "  disabled_workflows: {}",
        if disabled.is_empty() {
            "(none)".to_string()
        } else {
            disabled.join(", ")
        }
    );
    Ok(())
}
