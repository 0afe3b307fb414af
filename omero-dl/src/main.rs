use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::Context;
use omero_core::{DatasetId, ImageId, OmeroClient, ProjectId};
use omero_dl::download::{ProgressObserver, ProgressThrottle};
use omero_dl::explorer::load_explorer;
use omero_dl::hierarchy::{Entity, NodeId, Tree};
use omero_dl::highlight::Highlights;
use omero_dl::session::Session;
use omero_dl::settings::Settings;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum CliMode {
    #[default]
    Run,
    ShowSettings,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct CliOptions {
    mode: CliMode,
    show_tree: bool,
    additions: Vec<Entity>,
    destination: Option<PathBuf>,
    download: bool,
}

fn parse_cli<I>(args: I) -> anyhow::Result<CliOptions>
where
    I: IntoIterator<Item = String>,
{
    let mut options = CliOptions::default();
    let mut args = args.into_iter().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--tree" => options.show_tree = true,
            "--add" => {
                let value = args.next().context("--add expects KIND:ID")?;
                options.additions.push(parse_entity(&value)?);
            }
            "--dest" => {
                let value = args.next().context("--dest expects a directory")?;
                options.destination = Some(PathBuf::from(value));
            }
            "--download" => options.download = true,
            "--show-settings" => options.mode = CliMode::ShowSettings,
            "--help" | "-h" => options.mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    if !options.download && options.additions.is_empty() {
        options.show_tree = true;
    }
    Ok(options)
}

fn parse_entity(value: &str) -> anyhow::Result<Entity> {
    let (kind, id) = value
        .split_once(':')
        .with_context(|| format!("expected KIND:ID, got {value:?}"))?;
    let id: i64 = id
        .trim()
        .parse()
        .with_context(|| format!("invalid id in {value:?}"))?;
    match kind.trim().to_ascii_lowercase().as_str() {
        "project" => Ok(Entity::Project(ProjectId(id))),
        "dataset" => Ok(Entity::Dataset(DatasetId(id))),
        "image" => Ok(Entity::Image(ImageId(id))),
        other => anyhow::bail!("unsupported kind {other:?}; use project, dataset or image"),
    }
}

/// Indented outline of `tree`, prefixed with highlight markers when given.
fn render_tree(tree: &Tree, highlights: Option<&Highlights>) -> String {
    fn visit(
        tree: &Tree,
        node: NodeId,
        depth: usize,
        highlights: Option<&Highlights>,
        out: &mut String,
    ) {
        let Some(current) = tree.get(node) else {
            return;
        };
        let marker = highlights.map_or("", |highlights| highlights.get(node).marker());
        let _ = writeln!(
            out,
            "{:indent$}{marker}{sep}{} {} ({})",
            "",
            current.kind().as_str(),
            current.name(),
            current.entity(),
            indent = depth * 2,
            sep = if marker.is_empty() { "" } else { " " },
        );
        for child in current.children() {
            visit(tree, *child, depth + 1, highlights, out);
        }
    }

    let mut out = String::new();
    for root in tree.roots() {
        visit(tree, *root, 0, highlights, &mut out);
    }
    out
}

#[derive(Default)]
struct LogObserver {
    throttle: ProgressThrottle,
}

impl ProgressObserver for LogObserver {
    fn on_overall_progress(&mut self, done: usize, total: usize) {
        self.throttle.reset();
        info!(done, total, "filesets");
    }

    fn on_file_progress(&mut self, done: u64, total: u64) {
        if self.throttle.should_emit(done, total) {
            info!(done, total, "bytes");
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let options = parse_cli(std::env::args())?;
    match options.mode {
        CliMode::Help => {
            println!("Usage: omero-dl [--tree] [--add KIND:ID]... [--dest DIR] [--download]");
            println!("  --tree            Print the explorer and queue with selection markers");
            println!("  --add KIND:ID     Queue a project, dataset or image (repeatable)");
            println!("  --dest DIR        Download destination (default OMERO_DOWNLOAD_DIR)");
            println!("  --download        Download every queued fileset");
            println!("  --show-settings   Print the effective configuration and exit");
            return Ok(());
        }
        CliMode::ShowSettings => {
            let settings = Settings::from_env()?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
            return Ok(());
        }
        CliMode::Run => {}
    }

    let settings = Settings::from_env()?;
    let client = OmeroClient::with_base_url(&settings.web_url, settings.require_session()?)?
        .with_page_size(settings.page_size);
    let explorer = load_explorer(&client)
        .await
        .context("failed to load projects")?;
    let mut session = Session::new(explorer);

    for entity in &options.additions {
        let summary = session
            .select_entity(entity, &client)
            .await
            .with_context(|| format!("failed to queue {entity}"))?;
        info!(%entity, images = summary.images_added, "queued");
    }

    if options.show_tree {
        print!("{}", render_tree(session.explorer(), Some(session.highlights())));
        if !session.queue().is_empty() {
            println!("-- queue --");
            print!("{}", render_tree(session.queue().tree(), None));
        }
    }

    if options.download {
        let destination = options.destination.unwrap_or(settings.download_dir);
        let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                on_interrupt.cancel();
            }
        });

        let mut run = session
            .start_download(&client, &destination)
            .await?
            .with_cancellation(cancel)
            .with_observer(Box::new(LogObserver::default()));
        let state = run.run_to_end().await?;
        drop(run);
        session.finish_download()?;
        info!(
            filesets = state.overall_completed,
            destination = %destination.display(),
            "download complete"
        );
    }
    Ok(())
}
