use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use context_tree::config::{AppConfig, SearchConfig, TreeConfig, WatcherConfig};
use context_tree::controller::{BrowserController, VisibleNode};
use context_tree::error::{self, BrowserError};
use context_tree::event::{self, BrowserEvent};
use context_tree::fs::ignore::PatternIgnore;
use context_tree::fs::tree::{NodeKind, TreeStore};
use context_tree::logging;
use context_tree::NoopContext;

/// Print a project file tree the way the context browser sees it.
#[derive(Parser, Debug)]
#[command(name = "ctree", version, about)]
struct Cli {
    /// Root directory (defaults to current directory)
    #[arg(default_value = ".")]
    path: PathBuf,

    /// Config file (overrides $CTX_TREE_CONFIG and the default locations)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Show dotfiles
    #[arg(long)]
    hidden: bool,

    /// Do not flag entries matched by the ignore patterns
    #[arg(long)]
    no_ignore: bool,

    /// Print search results for this query instead of the tree
    #[arg(long, value_name = "QUERY")]
    search: Option<String>,

    /// Restrict search results to these extensions (comma separated)
    #[arg(long, value_delimiter = ',', value_name = "EXT")]
    types: Vec<String>,

    /// Expand a directory, relative to the root (repeatable)
    #[arg(long, value_name = "DIR")]
    expand: Vec<PathBuf>,

    /// Mark a file as already in context, relative to the root (repeatable)
    #[arg(long, value_name = "FILE")]
    context: Vec<PathBuf>,

    /// Keep running and reprint whenever the tree changes on disk
    #[arg(long)]
    watch: bool,

    /// Emit JSON instead of an indented listing
    #[arg(long)]
    json: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Partial config carrying only what was set on the command line.
    fn overrides(&self) -> AppConfig {
        AppConfig {
            tree: TreeConfig {
                show_hidden: self.hidden.then_some(true),
                respect_ignore_rules: self.no_ignore.then_some(false),
                ignore_patterns: None,
            },
            watcher: WatcherConfig {
                enabled: self.watch.then_some(true),
                ..Default::default()
            },
            search: SearchConfig {
                file_types: (!self.types.is_empty()).then(|| self.types.clone()),
            },
        }
    }
}

#[tokio::main]
async fn main() -> error::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    let config = AppConfig::load(cli.config.as_deref(), Some(&cli.overrides()));

    let root = cli.path.canonicalize().map_err(|_| {
        BrowserError::InvalidPath(format!("{} does not exist", cli.path.display()))
    })?;

    let ignore = Arc::new(PatternIgnore::new(config.ignore_patterns()));
    let store = TreeStore::with_ignore_rules(ignore);
    let (events, mut event_rx) = event::channel();
    let mut browser = BrowserController::new(store, Box::new(NoopContext), events)
        .with_scan_options(config.scan_options())
        .with_watch_settings(config.watch_settings());

    let known_context: HashSet<PathBuf> = cli.context.iter().map(|p| root.join(p)).collect();
    browser
        .load_directory_with_context(&root, known_context)
        .await?;

    for dir in &cli.expand {
        let target = root.join(dir);
        if browser.state().expanded.contains(&target) {
            continue;
        }
        if let Err(e) = browser.toggle_directory(&target).await {
            warn!(path = %target.display(), error = %e, "cannot expand");
        }
    }

    let search_options = config.search_options();
    if cli.search.is_some() || !search_options.is_empty() {
        let query = cli.search.clone().unwrap_or_default();
        let results = browser.search_files(&query, search_options);
        info!(query = %query, results = results.len(), "search finished");
    }

    print_view(browser.visible_nodes(), cli.json)?;
    drain_events(&mut event_rx);

    if !(cli.watch && config.watcher_enabled()) {
        return Ok(());
    }

    if !start_watching(&mut browser) {
        return Ok(());
    }
    info!(root = %root.display(), "watching for changes, Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            applied = browser.next_watch_batch() => {
                match applied {
                    Ok(0) => continue,
                    Ok(n) => debug!(dirs = n, "refreshed"),
                    Err(e) => warn!(error = %e, "refresh failed"),
                }
                print_view(browser.visible_nodes(), cli.json)?;
                drain_events(&mut event_rx);
            }
        }
    }

    browser.disable_file_system_watching();
    Ok(())
}

/// Enable watching, degrading to a one-shot listing when it is unavailable.
fn start_watching(browser: &mut BrowserController) -> bool {
    match browser.enable_file_system_watching() {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "watcher unavailable, not watching for changes");
            false
        }
    }
}

/// Log queued notifications; the CLI has no other listener.
fn drain_events(rx: &mut mpsc::UnboundedReceiver<BrowserEvent>) {
    while let Ok(event) = rx.try_recv() {
        match &event {
            BrowserEvent::TreeLoaded { nodes } => debug!(visible = nodes.len(), "tree loaded"),
            BrowserEvent::SearchCompleted { query, results } => {
                debug!(query = %query, results = results.len(), "search completed")
            }
            other => debug!(event = ?other, "browser event"),
        }
    }
}

fn print_view(nodes: &[VisibleNode], json: bool) -> error::Result<()> {
    if json {
        let out = serde_json::to_string_pretty(nodes).map_err(std::io::Error::from)?;
        println!("{}", out);
        return Ok(());
    }
    for node in nodes {
        println!("{}", render_row(node));
    }
    Ok(())
}

fn render_row(node: &VisibleNode) -> String {
    let indent = "  ".repeat(node.depth);
    let marker = match (node.kind, node.is_expanded) {
        (NodeKind::Directory, true) => "▾ ",
        (NodeKind::Directory, false) => "▸ ",
        (NodeKind::File, _) => "  ",
    };
    let mut row = format!("{}{}{}", indent, marker, node.name);
    if node.kind == NodeKind::Directory {
        row.push('/');
    }
    if node.is_in_context {
        row.push_str(" [ctx]");
    }
    if node.is_ignored {
        row.push_str(" (ignored)");
    }
    row
}
