use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pdfpager::pdf::{
    Action, LoadStatus, PageLink, PageRect, Point, RenderError, RenderKey, RenderResponse,
    Viewport,
};
use pdfpager::test_utils::{FAKE_PAGE_SIZE, FakeEngine, FakeSource};
use pdfpager::{LinkAction, TapOutcome, Viewer, ViewerConfig};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Viewport the size of a fake page, so device pixels equal points
fn page_viewport() -> Viewport {
    Viewport::new(
        FAKE_PAGE_SIZE.width as u32,
        FAKE_PAGE_SIZE.height as u32,
        1.0,
    )
}

fn config() -> ViewerConfig {
    ViewerConfig {
        cache_budget_bytes: 64 << 20,
        render_workers: 2,
        prefetch_radius: 1,
        max_zoom: 5.0,
        link_cache_capacity: 8,
    }
}

fn linked_source() -> FakeSource {
    FakeSource::new(3).with_links(
        0,
        vec![
            PageLink {
                uri: Some("https://example.com/".into()),
                dest_page: None,
                bounds: PageRect::new(0.0, 0.0, 306.0, 396.0),
            },
            PageLink {
                uri: None,
                dest_page: Some(2),
                bounds: PageRect::new(306.0, 396.0, 612.0, 792.0),
            },
            PageLink {
                uri: None,
                dest_page: Some(40),
                bounds: PageRect::new(0.0, 396.0, 306.0, 792.0),
            },
        ],
    )
}

fn open_viewer(engine: &Arc<FakeEngine>, path: &str) -> Viewer {
    let mut viewer = Viewer::new(engine.clone(), config());
    viewer.dispatch(Action::SetViewport(page_viewport()));
    viewer.dispatch(Action::LoadDocument(path.into()));
    viewer.wait_loaded(TIMEOUT);
    viewer
}

#[test]
fn load_reports_loading_then_ready() {
    let engine = Arc::new(FakeEngine::new());
    engine.add("a.pdf", FakeSource::new(3));
    let mut viewer = Viewer::new(engine.clone(), config());
    let updates = viewer.subscribe();

    viewer.dispatch(Action::LoadDocument("a.pdf".into()));
    assert_eq!(viewer.wait_loaded(TIMEOUT), LoadStatus::Ready);

    let mut statuses: Vec<LoadStatus> = updates.try_iter().map(|s| s.load_status).collect();
    statuses.dedup();
    assert_eq!(
        statuses,
        vec![LoadStatus::Init, LoadStatus::Loading, LoadStatus::Ready]
    );

    let state = viewer.state();
    assert_eq!(state.page_count, 3);
    assert_eq!(state.current_page, 0);
    assert!(state.document.is_some());
    assert_eq!(engine.open_count(), 1);
}

#[test]
fn unopenable_document_is_a_load_error() {
    let engine = Arc::new(FakeEngine::new());
    let viewer = open_viewer(&engine, "missing.pdf");

    let state = viewer.state();
    assert_eq!(state.load_status, LoadStatus::Error);
    assert!(state.error.unwrap().contains("no such document"));
    assert_eq!(viewer.fetch_page(0), Err(RenderError::NotReady));
}

#[test]
fn fetch_page_renders_at_the_viewport() {
    let engine = Arc::new(FakeEngine::new());
    engine.add("a.pdf", FakeSource::new(2));
    let viewer = open_viewer(&engine, "a.pdf");

    let page = viewer.fetch_page(1).unwrap();
    let vp = page_viewport();
    assert_eq!((page.width(), page.height()), (vp.width, vp.height));
    assert_eq!(page.key().page, 1);

    let again = viewer.fetch_page(1).unwrap();
    assert!(Arc::ptr_eq(&page, &again));
}

#[test]
fn fetch_before_layout_is_not_ready() {
    let engine = Arc::new(FakeEngine::new());
    engine.add("a.pdf", FakeSource::new(2));
    let mut viewer = Viewer::new(engine.clone(), config());
    viewer.dispatch(Action::LoadDocument("a.pdf".into()));

    assert_eq!(viewer.wait_loaded(TIMEOUT), LoadStatus::Ready);
    assert_eq!(viewer.fetch_page(0), Err(RenderError::NotReady));
}

#[test]
fn fetch_past_the_end_is_out_of_range() {
    let engine = Arc::new(FakeEngine::new());
    engine.add("a.pdf", FakeSource::new(2));
    let viewer = open_viewer(&engine, "a.pdf");

    assert_eq!(
        viewer.fetch_page(2),
        Err(RenderError::PageIndexOutOfRange {
            page: 2,
            page_count: 2
        })
    );
}

#[test]
fn current_page_and_neighbours_render_in_the_background() {
    let engine = Arc::new(FakeEngine::new());
    let source = engine.add("a.pdf", FakeSource::new(5));
    let mut viewer = open_viewer(&engine, "a.pdf");

    // The current page and one prefetch
    let mut pages = Vec::new();
    while let Some(response) = viewer.wait_page(TIMEOUT) {
        if let RenderResponse::Page { page, .. } = response {
            pages.push(page.key().page);
        }
        if viewer.pending_renders() == 0 {
            break;
        }
    }
    pages.sort_unstable();
    assert_eq!(pages, vec![0, 1]);

    let doc = viewer.state().document.unwrap();
    let vp = page_viewport();
    assert!(
        viewer
            .cache()
            .contains(&RenderKey::new(doc, 1, vp.width, vp.height, vp.density))
    );

    // Fetching the prefetched page does not render again
    viewer.fetch_page(1).unwrap();
    assert_eq!(source.render_count_for(1), 1);
}

#[test]
fn loading_another_document_closes_the_first() {
    let engine = Arc::new(FakeEngine::new());
    engine.add("a.pdf", FakeSource::new(2));
    engine.add("b.pdf", FakeSource::new(4));
    let mut viewer = open_viewer(&engine, "a.pdf");
    let first = viewer.state().document.unwrap();
    viewer.fetch_page(0).unwrap();

    viewer.dispatch(Action::LoadDocument("b.pdf".into()));
    assert!(!viewer.cache().is_open(first));
    assert_eq!(viewer.wait_loaded(TIMEOUT), LoadStatus::Ready);

    let state = viewer.state();
    assert_ne!(state.document, Some(first));
    assert_eq!(state.page_count, 4);
    assert!(!viewer.cache().is_open(first));
}

#[test]
fn close_document_returns_to_init() {
    let engine = Arc::new(FakeEngine::new());
    engine.add("a.pdf", FakeSource::new(2));
    let mut viewer = open_viewer(&engine, "a.pdf");
    let doc = viewer.state().document.unwrap();

    viewer.dispatch(Action::CloseDocument);

    assert_eq!(viewer.state().load_status, LoadStatus::Init);
    assert!(!viewer.cache().is_open(doc));
    assert_eq!(viewer.fetch_page(0), Err(RenderError::NotReady));
}

#[test]
fn paging_is_clamped() {
    let engine = Arc::new(FakeEngine::new());
    engine.add("a.pdf", FakeSource::new(3));
    let mut viewer = open_viewer(&engine, "a.pdf");

    viewer.dispatch(Action::GoToPage(10));
    assert_eq!(viewer.state().current_page, 2);
    viewer.dispatch(Action::NextPage);
    assert_eq!(viewer.state().current_page, 2);
    viewer.dispatch(Action::PrevPage);
    assert_eq!(viewer.state().current_page, 1);
}

#[test]
fn zoom_locks_paging_until_reset() {
    let engine = Arc::new(FakeEngine::new());
    engine.add("a.pdf", FakeSource::new(3));
    let mut viewer = open_viewer(&engine, "a.pdf");

    viewer.dispatch(Action::SetZoom(2.5));
    assert!(!viewer.state().scroll_enabled());
    viewer.dispatch(Action::SetZoom(1.0));
    assert!(viewer.state().scroll_enabled());
}

#[test]
fn tap_resolves_external_link() {
    let engine = Arc::new(FakeEngine::new());
    engine.add("a.pdf", linked_source());
    let mut viewer = open_viewer(&engine, "a.pdf");

    let link = viewer
        .tap_blocking(0, Point::new(100.0, 100.0), TIMEOUT)
        .unwrap()
        .unwrap();
    assert_eq!(link.target_uri.as_deref(), Some("https://example.com/"));
    assert_eq!(
        viewer.activate_link(&link),
        Some(LinkAction::OpenUri("https://example.com/".into()))
    );
    assert_eq!(viewer.state().current_page, 0);
}

#[test]
fn tap_on_internal_link_moves_to_its_page() {
    let engine = Arc::new(FakeEngine::new());
    engine.add("a.pdf", linked_source());
    let mut viewer = open_viewer(&engine, "a.pdf");

    let link = viewer
        .tap_blocking(0, Point::new(400.0, 500.0), TIMEOUT)
        .unwrap()
        .unwrap();
    assert_eq!(viewer.activate_link(&link), Some(LinkAction::GoToPage(2)));
    assert_eq!(viewer.state().current_page, 2);
}

#[test]
fn internal_link_past_the_end_is_ignored() {
    let engine = Arc::new(FakeEngine::new());
    engine.add("a.pdf", linked_source());
    let mut viewer = open_viewer(&engine, "a.pdf");

    let link = viewer
        .tap_blocking(0, Point::new(100.0, 500.0), TIMEOUT)
        .unwrap()
        .unwrap();
    assert_eq!(link.destination_page, Some(40));
    assert_eq!(viewer.activate_link(&link), None);
    assert_eq!(viewer.state().current_page, 0);
}

#[test]
fn tap_on_shared_edge_hits_nothing() {
    let engine = Arc::new(FakeEngine::new());
    engine.add("a.pdf", linked_source());
    let mut viewer = open_viewer(&engine, "a.pdf");

    let mut tap = |page, x, y| {
        viewer
            .tap_blocking(page, Point::new(x, y), TIMEOUT)
            .unwrap()
    };
    assert_eq!(tap(0, 306.0, 100.0), None);
    assert_eq!(tap(1, 100.0, 100.0), None);
}

#[test]
fn tap_scales_links_to_a_smaller_viewport() {
    let engine = Arc::new(FakeEngine::new());
    engine.add("a.pdf", linked_source());
    let mut viewer = open_viewer(&engine, "a.pdf");
    viewer.dispatch(Action::SetViewport(Viewport::new(306, 396, 2.0)));

    // (200, 250) lies in the lower right quarter at half size
    let link = viewer
        .tap_blocking(0, Point::new(200.0, 250.0), TIMEOUT)
        .unwrap()
        .unwrap();
    assert_eq!(link.destination_page, Some(2));
}

#[test]
fn dispatch_returns_while_the_open_is_still_running() {
    let engine = Arc::new(FakeEngine::new());
    engine.add("a.pdf", FakeSource::new(3));
    let gate = engine.hold_opens();
    let mut viewer = Viewer::new(engine.clone(), config());
    viewer.dispatch(Action::SetViewport(page_viewport()));

    viewer.dispatch(Action::LoadDocument("a.pdf".into()));

    // The open is parked on the loader thread
    assert_eq!(gate.wait_started(), Some(0));
    assert_eq!(viewer.state().load_status, LoadStatus::Loading);
    assert!(viewer.poll_pages().is_empty());
    assert_eq!(viewer.fetch_page(0), Err(RenderError::NotReady));
    assert_eq!(viewer.tap(0, Point::new(1.0, 1.0)), Err(RenderError::NotReady));

    gate.release_one();
    assert_eq!(viewer.wait_loaded(TIMEOUT), LoadStatus::Ready);
    assert_eq!(viewer.state().page_count, 3);
}

#[test]
fn superseded_load_is_discarded() {
    let engine = Arc::new(FakeEngine::new());
    engine.add("a.pdf", FakeSource::new(2));
    engine.add("b.pdf", FakeSource::new(4));
    let gate = engine.hold_opens();
    let mut viewer = Viewer::new(engine.clone(), config());

    viewer.dispatch(Action::LoadDocument("a.pdf".into()));
    viewer.dispatch(Action::LoadDocument("b.pdf".into()));
    assert!(gate.wait_started().is_some());
    assert!(gate.wait_started().is_some());
    gate.release_one();
    gate.release_one();

    assert_eq!(viewer.wait_loaded(TIMEOUT), LoadStatus::Ready);
    // Give the first open time to report, then drain it
    thread::sleep(Duration::from_millis(100));
    viewer.poll_pages();

    let state = viewer.state();
    assert_eq!(state.document_path.as_deref(), Some(Path::new("b.pdf")));
    assert_eq!(state.page_count, 4);
    assert_eq!(engine.open_count(), 2);
}

#[test]
fn close_during_load_stays_closed() {
    let engine = Arc::new(FakeEngine::new());
    engine.add("a.pdf", FakeSource::new(2));
    let gate = engine.hold_opens();
    let mut viewer = Viewer::new(engine.clone(), config());

    viewer.dispatch(Action::LoadDocument("a.pdf".into()));
    assert_eq!(gate.wait_started(), Some(0));
    viewer.dispatch(Action::CloseDocument);
    gate.release_one();

    thread::sleep(Duration::from_millis(100));
    viewer.poll_pages();
    assert_eq!(viewer.state().load_status, LoadStatus::Init);
    assert!(viewer.state().document.is_none());
}

#[test]
fn tap_before_links_arrive_is_pending() {
    let engine = Arc::new(FakeEngine::new());
    engine.add("a.pdf", linked_source());
    let mut viewer = open_viewer(&engine, "a.pdf");

    // Only the current page's links are fetched on load
    let point = Point::new(100.0, 100.0);
    assert_eq!(viewer.tap(1, point), Ok(TapOutcome::Pending));

    let mut outcome = TapOutcome::Pending;
    while outcome == TapOutcome::Pending {
        assert!(viewer.wait_page(TIMEOUT).is_some(), "links never arrived");
        outcome = viewer.tap(1, point).unwrap();
    }
    assert_eq!(outcome, TapOutcome::Miss);
}

#[test]
fn tap_past_the_last_page_is_out_of_range() {
    let engine = Arc::new(FakeEngine::new());
    engine.add("a.pdf", linked_source());
    let mut viewer = open_viewer(&engine, "a.pdf");

    assert_eq!(
        viewer.tap(3, Point::new(1.0, 1.0)),
        Err(RenderError::PageIndexOutOfRange {
            page: 3,
            page_count: 3
        })
    );
}
