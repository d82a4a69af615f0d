//! Render worker - runs in separate thread(s)

use std::sync::Arc;

use flume::{Receiver, Sender};
use log::debug;

use super::links::device_links;
use super::render_cache::PageRenderCache;
use super::request::{CancelToken, RenderRequest, RenderResponse, RequestId};
use super::types::RenderKey;

/// Main worker function - runs in a dedicated thread
#[expect(
    clippy::needless_pass_by_value,
    reason = "Values moved into thread, need ownership"
)]
pub fn render_worker(
    requests: Receiver<RenderRequest>,
    responses: Sender<RenderResponse>,
    cache: Arc<PageRenderCache>,
) {
    for request in requests {
        match request {
            RenderRequest::Page { id, key, cancel }
            | RenderRequest::Prefetch { id, key, cancel } => {
                handle_page_request(id, &key, &cancel, &cache, &responses);
            }

            RenderRequest::Links { id, key } => {
                let links = cache
                    .source(key.document)
                    .and_then(|source| {
                        device_links(
                            source.as_ref(),
                            key.page,
                            key.width,
                            key.height,
                            key.rotation,
                        )
                    })
                    .map(Arc::from);
                let _ = responses.send(RenderResponse::Links { id, key, links });
            }

            RenderRequest::Shutdown => break,
        }
    }
}

fn handle_page_request(
    id: RequestId,
    key: &RenderKey,
    cancel: &CancelToken,
    cache: &PageRenderCache,
    responses: &Sender<RenderResponse>,
) {
    if !cancel.start() {
        debug!("skipping cancelled request {id:?} for page {}", key.page);
        let _ = responses.send(RenderResponse::Cancelled(id));
        return;
    }

    let response = match cache.get(key) {
        Ok(page) => RenderResponse::Page { id, page },
        Err(error) => RenderResponse::Error {
            id,
            key: key.clone(),
            error,
        },
    };
    let _ = responses.send(response);
}
