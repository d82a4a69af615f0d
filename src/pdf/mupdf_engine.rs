//! MuPDF document engine
//!
//! A MuPDF document handle cannot be shared between threads, so every open
//! document gets a small pool of worker threads that each open their own
//! handle and pull jobs from one shared queue. Callers block on a per-job
//! reply channel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use flume::{Receiver, Sender};
use log::{debug, error};
use mupdf::{Colorspace, Document, Matrix, Pixmap};

use super::engine::{DocumentEngine, RenderSource, check_page};
use super::request::RenderError;
use super::types::{Bitmap, PageLink, PageRect, PageSize, PixelFormat};

/// Resolution MuPDF assumes for a scale of 1.0
const BASE_DPI: f32 = 72.0;

/// Opens PDF files with MuPDF
#[derive(Clone, Debug)]
pub struct MupdfEngine {
    workers_per_document: usize,
}

impl MupdfEngine {
    #[must_use]
    pub fn new(workers_per_document: usize) -> Self {
        Self {
            workers_per_document: workers_per_document.max(1),
        }
    }
}

impl Default for MupdfEngine {
    fn default() -> Self {
        Self::new(2)
    }
}

impl DocumentEngine for MupdfEngine {
    fn open_document(&self, path: &Path) -> Result<Arc<dyn RenderSource>, RenderError> {
        let source: Arc<dyn RenderSource> =
            Arc::new(MupdfSource::open(path, self.workers_per_document)?);
        Ok(source)
    }
}

enum Job {
    Render {
        page: usize,
        width: u32,
        height: u32,
        density: f32,
        reply: Sender<Result<Bitmap, RenderError>>,
    },
    PageSize {
        page: usize,
        reply: Sender<Result<PageSize, RenderError>>,
    },
    Links {
        page: usize,
        reply: Sender<Result<Vec<PageLink>, RenderError>>,
    },
    Shutdown,
}

impl Job {
    fn fail(self, e: RenderError) {
        match self {
            Job::Render { reply, .. } => {
                let _ = reply.send(Err(e));
            }
            Job::PageSize { reply, .. } => {
                let _ = reply.send(Err(e));
            }
            Job::Links { reply, .. } => {
                let _ = reply.send(Err(e));
            }
            Job::Shutdown => {}
        }
    }
}

/// One open PDF served by a worker pool
pub struct MupdfSource {
    path: PathBuf,
    page_count: usize,
    page_sizes: Mutex<HashMap<usize, PageSize>>,
    jobs: Sender<Job>,
    num_workers: usize,
}

impl MupdfSource {
    /// Open `path`, validating it on the calling thread before starting workers
    pub fn open(path: &Path, num_workers: usize) -> Result<Self, RenderError> {
        let page_count = {
            let doc = open_document(path)?;
            let count = doc
                .page_count()
                .map_err(|e| RenderError::open(path, e.to_string()))?;
            usize::try_from(count).unwrap_or(0)
        };
        if page_count == 0 {
            return Err(RenderError::open(path, "document has no pages"));
        }

        let (jobs_tx, jobs_rx) = flume::unbounded();
        let num_workers = num_workers.max(1);
        for _ in 0..num_workers {
            let rx = jobs_rx.clone();
            let worker_path = path.to_path_buf();
            std::thread::spawn(move || document_worker(&worker_path, rx));
        }

        debug!(
            "opened {} ({page_count} pages, {num_workers} workers)",
            path.display()
        );
        Ok(Self {
            path: path.to_path_buf(),
            page_count,
            page_sizes: Mutex::new(HashMap::new()),
            jobs: jobs_tx,
            num_workers,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn request<T>(
        &self,
        make_job: impl FnOnce(Sender<Result<T, RenderError>>) -> Job,
    ) -> Result<T, RenderError> {
        let (reply_tx, reply_rx) = flume::bounded(1);
        self.jobs
            .send(make_job(reply_tx))
            .map_err(|_| RenderError::failure("render workers have shut down"))?;
        reply_rx
            .recv()
            .map_err(|_| RenderError::failure("render worker exited mid-job"))?
    }
}

impl RenderSource for MupdfSource {
    fn page_count(&self) -> usize {
        self.page_count
    }

    fn page_size(&self, page: usize) -> Result<PageSize, RenderError> {
        check_page(page, self.page_count)?;
        if let Some(size) = self
            .page_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&page)
        {
            return Ok(*size);
        }

        let size = self.request(|reply| Job::PageSize { page, reply })?;
        self.page_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(page, size);
        Ok(size)
    }

    fn render_page(
        &self,
        page: usize,
        width: u32,
        height: u32,
        density: f32,
    ) -> Result<Bitmap, RenderError> {
        check_page(page, self.page_count)?;
        self.request(|reply| Job::Render {
            page,
            width,
            height,
            density,
            reply,
        })
    }

    fn page_links(&self, page: usize) -> Result<Vec<PageLink>, RenderError> {
        check_page(page, self.page_count)?;
        self.request(|reply| Job::Links { page, reply })
    }
}

impl Drop for MupdfSource {
    fn drop(&mut self) {
        for _ in 0..self.num_workers {
            let _ = self.jobs.send(Job::Shutdown);
        }
        debug!("closed {}", self.path.display());
    }
}

fn open_document(path: &Path) -> Result<Document, RenderError> {
    Document::open(path.to_string_lossy().as_ref())
        .map_err(|e| RenderError::open(path, e.to_string()))
}

/// Worker loop owning one MuPDF handle
fn document_worker(path: &Path, jobs: Receiver<Job>) {
    let doc = open_document(path);
    if let Err(e) = &doc {
        error!("render worker could not open document: {e}");
    }

    for job in jobs {
        if matches!(job, Job::Shutdown) {
            break;
        }
        match &doc {
            Ok(doc) => run_job(doc, job),
            Err(e) => job.fail(e.clone()),
        }
    }
}

fn run_job(doc: &Document, job: Job) {
    match job {
        Job::Render {
            page,
            width,
            height,
            density,
            reply,
        } => {
            let _ = reply.send(render_page(doc, page, width, height, density));
        }
        Job::PageSize { page, reply } => {
            let _ = reply.send(page_size(doc, page));
        }
        Job::Links { page, reply } => {
            let _ = reply.send(page_links(doc, page));
        }
        Job::Shutdown => {}
    }
}

fn load_page(doc: &Document, page_num: usize) -> Result<mupdf::Page, RenderError> {
    let index = i32::try_from(page_num)
        .map_err(|_| RenderError::failure(format!("page {page_num} exceeds engine range")))?;
    Ok(doc.load_page(index)?)
}

fn page_size(doc: &Document, page_num: usize) -> Result<PageSize, RenderError> {
    let bounds = load_page(doc, page_num)?.bounds()?;
    Ok(PageSize::new(bounds.x1 - bounds.x0, bounds.y1 - bounds.y0))
}

/// Render a single page stretched to exactly `width x height`
pub fn render_page(
    doc: &Document,
    page_num: usize,
    width: u32,
    height: u32,
    density: f32,
) -> Result<Bitmap, RenderError> {
    let page = load_page(doc, page_num)?;

    let bounds = page.bounds()?;
    let (page_width, page_height) = (bounds.x1 - bounds.x0, bounds.y1 - bounds.y0);
    if page_width <= 0.0 || page_height <= 0.0 {
        return Err(RenderError::failure(format!(
            "page {page_num} has empty bounds"
        )));
    }

    let transform = Matrix::new_scale(width as f32 / page_width, height as f32 / page_height);
    let rgb = Colorspace::device_rgb();
    let mut pixmap = page.to_pixmap(&transform, &rgb, false, true)?;

    let dpi = (BASE_DPI * density).round() as i32;
    pixmap.set_resolution(dpi, dpi);

    let pixels = pixmap_to_rgb(&pixmap, width, height)?;

    Ok(Bitmap {
        format: PixelFormat::Rgb8,
        width,
        height,
        pixels,
    })
}

/// Copy a pixmap into an exact-size RGB buffer.
///
/// MuPDF rounds the transformed page outward, so the pixmap can be a pixel
/// off in either direction; extra pixels are clipped and missing ones stay
/// white.
fn pixmap_to_rgb(pixmap: &Pixmap, width: u32, height: u32) -> Result<Vec<u8>, RenderError> {
    let n = pixmap.n() as usize;
    if n < 3 {
        return Err(RenderError::failure(format!(
            "Unsupported pixmap format: {n} channels"
        )));
    }

    let src_width = pixmap.width() as usize;
    let src_height = pixmap.height() as usize;
    let stride = pixmap.stride() as usize;
    let samples = pixmap.samples();
    let row_bytes = src_width * n;
    let expected_min = stride.saturating_mul(src_height);
    if samples.len() < expected_min || row_bytes > stride {
        return Err(RenderError::failure("Pixmap buffer size mismatch"));
    }

    let (width, height) = (width as usize, height as usize);
    let copy_width = src_width.min(width);
    let copy_height = src_height.min(height);

    let mut out = vec![0xFF; width * height * 3];
    for y in 0..copy_height {
        let row_start = y * stride;
        let row = &samples[row_start..row_start + copy_width * n];
        let dst_start = y * width * 3;
        let dst = &mut out[dst_start..dst_start + copy_width * 3];
        if n == 3 {
            dst.copy_from_slice(row);
        } else {
            for (to, px) in dst.chunks_exact_mut(3).zip(row.chunks_exact(n)) {
                to.copy_from_slice(&px[..3]);
            }
        }
    }

    Ok(out)
}

/// Links with a destination or URI, relative to the page origin
fn page_links(doc: &Document, page_num: usize) -> Result<Vec<PageLink>, RenderError> {
    let page = load_page(doc, page_num)?;
    let origin = page.bounds()?;

    Ok(page
        .links()?
        .filter_map(|link| {
            let dest_page = link.dest.as_ref().map(|dest| dest.loc.page_number as usize);
            let uri = Some(link.uri.clone()).filter(|uri| !uri.is_empty());
            if dest_page.is_none() && uri.is_none() {
                return None;
            }

            let rect = link.bounds;
            if rect.is_empty() {
                return None;
            }

            Some(PageLink {
                uri,
                dest_page,
                bounds: PageRect::new(
                    rect.x0.min(rect.x1) - origin.x0,
                    rect.y0.min(rect.y1) - origin.y0,
                    rect.x0.max(rect.x1) - origin.x0,
                    rect.y0.max(rect.y1) - origin.y0,
                ),
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_a_document_open_error() {
        let engine = MupdfEngine::new(1);
        let err = match engine.open_document(Path::new("/nonexistent/never.pdf")) {
            Err(e) => e,
            Ok(_) => panic!("opening a missing file should fail"),
        };
        assert!(matches!(err, RenderError::DocumentOpen { .. }));
    }

    #[test]
    fn garbage_file_is_a_document_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.pdf");
        std::fs::write(&path, b"this is not a pdf").unwrap();

        let engine = MupdfEngine::new(1);
        assert!(matches!(
            engine.open_document(&path),
            Err(RenderError::DocumentOpen { .. })
        ));
    }
}
