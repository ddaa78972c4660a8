//! Operator CLI for a node tree database.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use nodetree::config::{default_config_path, default_database_path};
use nodetree::logging::init_logging;
use nodetree::{
    AssetId, AssetTree, HierarchyId, MembershipOutcome, Node, NodeId, ReassignReport,
    ReconcileReport, TreeOptions,
};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(
    name = "nodetree",
    version,
    about = "Inspect and edit a node tree with cached asset counts",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(flatten)]
    open: OpenArgs,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[arg(
        long,
        global = true,
        default_value = "warn",
        env = "NODETREE_LOG",
        help = "Log filter directive (e.g. info, nodetree=debug)"
    )]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct OpenArgs {
    #[arg(long, global = true, env = "NODETREE_DB", value_name = "FILE", help = "Database file")]
    db: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = "NODETREE_CONFIG",
        value_name = "FILE",
        help = "Config file (defaults to the user config dir)"
    )]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a hierarchy and its root node.
    Init {
        /// Hierarchy name, also the root node's value.
        name: String,
    },
    /// Ensure every node along a `/a/b/c` path exists.
    Mkdir {
        /// Hierarchy id.
        hierarchy: i64,
        /// Slash-separated node values below the root.
        path: String,
    },
    /// Create an asset.
    Asset {
        /// Hierarchy id.
        hierarchy: i64,
        /// Asset name.
        name: String,
        /// Nodes to attach to (root when omitted).
        #[arg(long = "node", value_name = "NODE_ID")]
        nodes: Vec<i64>,
    },
    /// Attach assets to a node.
    Attach {
        /// Node id.
        node: i64,
        /// Asset ids.
        #[arg(required = true)]
        assets: Vec<i64>,
    },
    /// Detach assets from a node.
    Detach {
        /// Node id.
        node: i64,
        /// Asset ids.
        #[arg(required = true)]
        assets: Vec<i64>,
    },
    /// Move assets from all of their nodes to one node.
    Reassign {
        /// Target node id.
        target: i64,
        /// Asset ids.
        #[arg(required = true)]
        assets: Vec<i64>,
    },
    /// Show a node's cached and recomputed subtree asset count.
    Count {
        /// Node id.
        node: i64,
    },
    /// Recompute and repair every count of a hierarchy.
    Reconcile {
        /// Hierarchy id.
        hierarchy: i64,
        /// Report drift without writing.
        #[arg(long)]
        check: bool,
    },
    /// Print a hierarchy's nodes with their cached counts.
    Tree {
        /// Hierarchy id.
        hierarchy: i64,
    },
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Serialize)]
struct CountReport {
    node: NodeId,
    key: String,
    cached: i64,
    computed: usize,
}

#[derive(Serialize)]
struct Created {
    hierarchy: HierarchyId,
    root: Node,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let config_path = match cli.open.config.clone() {
        Some(path) => Some(path),
        None => default_config_path().filter(|p| p.exists()),
    };
    let opts = match config_path.as_deref() {
        Some(path) => TreeOptions::load(path)?,
        None => TreeOptions::default(),
    };
    let db = match (cli.open.db.clone(), config_path.as_deref()) {
        (Some(db), _) => db,
        (None, Some(path)) => default_database_path(path)?
            .ok_or("no database given; pass --db or set [database] default in the config")?,
        (None, None) => return Err("no database given; pass --db or set NODETREE_DB".into()),
    };
    let tree = AssetTree::open(&db, opts)?;
    let format = cli.format;

    match cli.command {
        Command::Init { name } => {
            let (hierarchy, root) = tree.create_hierarchy(&name)?;
            let created = Created {
                hierarchy: hierarchy.id,
                root,
            };
            emit(format, &created, |c| {
                println!("hierarchy {} root {} ({})", c.hierarchy, c.root.key, c.root.id)
            })?;
        }
        Command::Mkdir { hierarchy, path } => {
            let node = tree.create_nodes_by_full_value(HierarchyId(hierarchy), &path)?;
            emit(format, &node, print_node)?;
        }
        Command::Asset {
            hierarchy,
            name,
            nodes,
        } => {
            let nodes: Vec<NodeId> = nodes.into_iter().map(NodeId).collect();
            let asset = tree.create_asset(HierarchyId(hierarchy), &name, &nodes)?;
            emit(format, &asset, |a| println!("asset {} {}", a.id, a.name))?;
        }
        Command::Attach { node, assets } => {
            let outcome = tree.attach_assets(NodeId(node), &asset_ids(assets))?;
            emit(format, &outcome, |o| print_outcome("attached", o))?;
        }
        Command::Detach { node, assets } => {
            let outcome = tree.detach_assets(NodeId(node), &asset_ids(assets))?;
            emit(format, &outcome, |o| print_outcome("detached", o))?;
        }
        Command::Reassign { target, assets } => {
            let report = tree.reassign_assets(&asset_ids(assets), NodeId(target))?;
            emit(format, &report, print_reassign)?;
        }
        Command::Count { node } => {
            let id = NodeId(node);
            let found = tree.node(id)?.ok_or("node not found")?;
            let report = CountReport {
                node: id,
                key: found.key.to_string(),
                cached: found.assets_amount,
                computed: tree.subtree_asset_count(id)?,
            };
            emit(format, &report, |r| {
                println!("{} cached={} computed={}", r.key, r.cached, r.computed)
            })?;
        }
        Command::Reconcile { hierarchy, check } => {
            let hierarchy = HierarchyId(hierarchy);
            let report = if check {
                tree.check_consistency(hierarchy)?
            } else {
                tree.run_reconciliation(hierarchy)?
            };
            emit(format, &report, print_reconcile)?;
        }
        Command::Tree { hierarchy } => {
            let nodes = tree.nodes(HierarchyId(hierarchy))?;
            emit(format, &nodes, |nodes| {
                for node in nodes {
                    let indent = "  ".repeat(node.key.depth().saturating_sub(1));
                    println!("{indent}{} [{}] {}", node.value, node.key, node.assets_amount);
                }
            })?;
        }
    }
    tree.flush_reconciliation();
    Ok(())
}

fn asset_ids(raw: Vec<i64>) -> Vec<AssetId> {
    raw.into_iter().map(AssetId).collect()
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(&T),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(value),
    }
    Ok(())
}

fn print_node(node: &Node) {
    println!("{} {} {}", node.id, node.key, node.full_value);
}

fn print_outcome(verb: &str, outcome: &MembershipOutcome) {
    println!("{verb} {} rows", outcome.rows_changed());
    for change in &outcome.rehomed {
        println!("  asset {} moved to root", change.asset_id);
    }
    if outcome.deferred {
        println!("  counts deferred to reconciliation");
    }
}

fn print_reassign(report: &ReassignReport) {
    println!(
        "moved {} assets to node {} (removed {} rows, added {})",
        report.moved.len(),
        report.target,
        report.rows_removed,
        report.rows_added
    );
}

fn print_reconcile(report: &ReconcileReport) {
    println!(
        "hierarchy {}: {} nodes, {} assets, {}",
        report.hierarchy,
        report.nodes_checked,
        report.assets_checked,
        if report.clean { "clean" } else { "drift found" }
    );
    for drift in &report.drift {
        println!("  {} cached={} computed={}", drift.key, drift.cached, drift.computed);
    }
    for asset in &report.orphans {
        println!("  orphan asset {asset}");
    }
    for finding in &report.findings {
        println!("  [{:?}] {}", finding.severity, finding.message);
    }
}
