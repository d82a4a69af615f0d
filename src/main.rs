use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use image::ColorType;
use log::{error, info, warn};
use simplelog::{Config, LevelFilter, WriteLogger};

use pdfpager::panic_handler::initialize_panic_handler;
use pdfpager::pdf::{
    Action, DocumentEngine, LinkRect, LoadStatus, MupdfEngine, PixelFormat, Point,
    RenderResponse, RenderedPage, Rotation, Viewport, device_links,
};
use pdfpager::settings;
use pdfpager::viewer::{LinkAction, Viewer, ViewerConfig};

/// How long `render` waits for any single page
const RENDER_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Parser)]
#[command(
    name = "pdfpager",
    about = "Render PDF pages on demand and resolve link taps",
    version
)]
struct Cli {
    /// Settings file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Where to write the log
    #[arg(long, global = true, default_value = "pdfpager.log")]
    log_file: PathBuf,

    /// Log at info level instead of debug
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show page count and page sizes
    Info {
        /// PDF file
        file: PathBuf,
    },

    /// Render pages to PNG files
    Render {
        /// PDF file
        file: PathBuf,

        /// Viewport width in pixels
        #[arg(long)]
        width: u32,

        /// Viewport height in pixels
        #[arg(long)]
        height: u32,

        /// Display density (1.0 = 72 dpi)
        #[arg(long, default_value_t = 1.0)]
        density: f32,

        /// Page index (0-based), may be repeated; defaults to the first page
        #[arg(short, long = "page")]
        pages: Vec<usize>,

        /// Output directory
        #[arg(short, long)]
        out: PathBuf,
    },

    /// List the links of a page in device pixels
    Links {
        /// PDF file
        file: PathBuf,

        /// Page index (0-based)
        #[arg(short, long, default_value_t = 0)]
        page: usize,

        #[arg(long)]
        width: u32,

        #[arg(long)]
        height: u32,

        /// Clockwise rotation in degrees (0, 90, 180, 270)
        #[arg(long, default_value_t = 0)]
        rotation: i32,
    },

    /// Resolve a tap on a page
    Tap {
        /// PDF file
        file: PathBuf,

        /// Page index (0-based)
        #[arg(short, long, default_value_t = 0)]
        page: usize,

        #[arg(long)]
        width: u32,

        #[arg(long)]
        height: u32,

        #[arg(long)]
        x: f32,

        #[arg(long)]
        y: f32,

        /// Open external links in the browser
        #[arg(long)]
        open: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.quiet {
        LevelFilter::Info
    } else {
        LevelFilter::Debug
    };
    WriteLogger::init(level, Config::default(), File::create(&cli.log_file)?)?;

    initialize_panic_handler();

    info!("Starting pdfpager");

    if let Some(path) = &cli.config {
        settings::set_config_path(path);
    }
    settings::load_settings();

    let result = run(cli.command);
    if let Err(err) = &result {
        error!("Application error: {err:?}");
    }

    info!("Shutting down pdfpager");
    result
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Info { file } => info_command(&file),
        Commands::Render {
            file,
            width,
            height,
            density,
            pages,
            out,
        } => render_command(&file, Viewport::new(width, height, density), &pages, &out),
        Commands::Links {
            file,
            page,
            width,
            height,
            rotation,
        } => links_command(&file, page, width, height, rotation),
        Commands::Tap {
            file,
            page,
            width,
            height,
            x,
            y,
            open,
        } => tap_command(&file, page, width, height, Point::new(x, y), open),
    }
}

fn engine() -> Arc<dyn DocumentEngine> {
    Arc::new(MupdfEngine::new(settings::get_document_workers()))
}

/// Viewer with `file` loaded at `viewport`
fn open_viewer(file: &Path, viewport: Viewport) -> Result<Viewer> {
    let mut viewer = Viewer::new(engine(), ViewerConfig::from_settings());
    viewer.dispatch(Action::SetViewport(viewport));
    viewer.dispatch(Action::LoadDocument(file.to_path_buf()));

    if viewer.wait_loaded(RENDER_TIMEOUT) != LoadStatus::Ready {
        let state = viewer.state();
        bail!(
            "{}",
            state
                .error
                .unwrap_or_else(|| format!("{} did not load", file.display()))
        );
    }
    Ok(viewer)
}

fn info_command(file: &Path) -> Result<()> {
    let source = engine().open_document(file)?;
    println!("{}: {} pages", file.display(), source.page_count());
    for page in 0..source.page_count() {
        let size = source.page_size(page)?;
        println!("  page {page}: {:.1} x {:.1}", size.width, size.height);
    }
    Ok(())
}

fn render_command(file: &Path, viewport: Viewport, pages: &[usize], out: &Path) -> Result<()> {
    let mut viewer = open_viewer(file, viewport)?;
    fs::create_dir_all(out).with_context(|| format!("creating {}", out.display()))?;

    let pages = if pages.is_empty() { &[0][..] } else { pages };
    let mut waiting = HashSet::new();
    for &page in pages {
        if let Some(id) = viewer.request_page(page) {
            waiting.insert(id);
        }
    }

    let mut failures = 0;
    while !waiting.is_empty() {
        let Some(response) = viewer.wait_page(RENDER_TIMEOUT) else {
            bail!("timed out waiting for {} pages", waiting.len());
        };
        if !waiting.remove(&response.id()) {
            // Prefetch or link lookup triggered by the viewer itself
            continue;
        }

        match response {
            RenderResponse::Page { page, .. } => {
                let path = out.join(format!("page-{}.png", page.key().page));
                save_png(&page, &path)?;
                println!("{}", path.display());
            }
            RenderResponse::Error { key, error, .. } => {
                warn!("page {} failed: {error}", key.page);
                eprintln!("page {}: {error}", key.page);
                failures += 1;
            }
            RenderResponse::Cancelled(_) | RenderResponse::Links { .. } => {}
        }
    }

    if failures > 0 {
        bail!("{failures} pages failed to render");
    }
    Ok(())
}

fn save_png(page: &RenderedPage, path: &Path) -> Result<()> {
    let color = match page.format() {
        PixelFormat::Rgb8 => ColorType::Rgb8,
        PixelFormat::Rgba8 => ColorType::Rgba8,
    };
    image::save_buffer(path, page.pixels(), page.width(), page.height(), color)
        .with_context(|| format!("writing {}", path.display()))
}

fn links_command(file: &Path, page: usize, width: u32, height: u32, degrees: i32) -> Result<()> {
    let rotation =
        Rotation::from_degrees(degrees).context("rotation must be 0, 90, 180 or 270")?;
    let source = engine().open_document(file)?;
    let links = device_links(source.as_ref(), page, width, height, rotation)?;

    if links.is_empty() {
        println!("no links on page {page}");
    }
    for (index, link) in links.iter().enumerate() {
        println!("{index}: {}", describe_link(link));
    }
    Ok(())
}

fn tap_command(
    file: &Path,
    page: usize,
    width: u32,
    height: u32,
    point: Point,
    open: bool,
) -> Result<()> {
    let mut viewer = open_viewer(file, Viewport::new(width, height, 1.0))?;
    viewer.dispatch(Action::GoToPage(page));

    let Some(link) = viewer.tap_blocking(page, point, RENDER_TIMEOUT)? else {
        println!("no link at ({}, {})", point.x, point.y);
        return Ok(());
    };
    println!("hit {}", describe_link(&link));

    match viewer.activate_link(&link) {
        Some(LinkAction::GoToPage(target)) => println!("go to page {target}"),
        Some(LinkAction::OpenUri(uri)) if open => {
            info!("opening {uri}");
            open::that(&uri).with_context(|| format!("opening {uri}"))?;
        }
        Some(LinkAction::OpenUri(uri)) => println!("open {uri}"),
        None => println!("link has no usable target"),
    }
    Ok(())
}

fn describe_link(link: &LinkRect) -> String {
    let b = link.bounds;
    let target = match (&link.destination_page, &link.target_uri) {
        (Some(page), _) => format!("page {page}"),
        (None, Some(uri)) => uri.clone(),
        (None, None) => "-".to_string(),
    };
    format!(
        "[{:.1}, {:.1}, {:.1}, {:.1}] -> {target}",
        b.left, b.top, b.right, b.bottom
    )
}
