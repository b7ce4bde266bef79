use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pagevisor::render::{BatchStop, MIN_MEMORY_BUDGET, SessionState, footprint};
use pagevisor::test_utils::test_helpers::{FakeCodec, Harness, UNREADABLE, document};
use pagevisor::{Document, MemoryPageCache, PageImage, RenderError, RenderScheduler};

#[test]
fn twelve_pages_render_in_batches_of_five() {
    let h = Harness::new(12, 5, 5);

    let opened = h.scheduler.open_initial(&document("report")).unwrap();
    assert_eq!(opened.rendered_count(), 5);
    assert_eq!(opened.total_pages, 12);
    assert_eq!(opened.state, SessionState::Partial);

    let second = h.scheduler.extend_batch("report");
    assert_eq!(second.requested, 5..10);
    assert_eq!(second.rendered(), 5);
    assert_eq!(h.scheduler.snapshot("report").unwrap().rendered_count(), 10);
    assert_eq!(h.scheduler.state("report"), SessionState::Partial);

    let third = h.scheduler.extend_batch("report");
    assert_eq!(third.requested, 10..12);
    assert_eq!(third.rendered(), 2);
    assert_eq!(third.stop, BatchStop::Completed);
    let snapshot = h.scheduler.snapshot("report").unwrap();
    assert_eq!(snapshot.rendered_count(), 12);
    assert_eq!(snapshot.state, SessionState::Full);

    let fourth = h.scheduler.extend_batch("report");
    assert_eq!(fourth.stop, BatchStop::Idle);
    assert_eq!(fourth.rendered(), 0);

    assert_eq!(h.script.renders(), 12);
    assert_eq!(h.script.rendered_indices(), (0..12).collect::<Vec<_>>());
    assert_eq!(h.script.open_handles(), 0, "handle released once full");
}

#[test]
fn short_document_is_full_after_open() {
    let h = Harness::new(3, 5, 5);

    let opened = h.scheduler.open_initial(&document("leaflet")).unwrap();
    assert_eq!(opened.rendered_count(), 3);
    assert!(opened.is_full());
    assert_eq!(h.script.open_handles(), 0);

    let renders = h.script.renders();
    let report = h.scheduler.extend_batch("leaflet");
    assert_eq!(report.stop, BatchStop::Idle);
    assert_eq!(h.script.renders(), renders);
    assert_eq!(h.script.opens(), 1);
}

#[test]
fn empty_document_opens_full() {
    let h = Harness::new(0, 5, 5);
    let opened = h.scheduler.open_initial(&document("blank")).unwrap();
    assert_eq!(opened.total_pages, 0);
    assert!(opened.is_full());
    assert_eq!(opened.resolution(), None);
    assert_eq!(h.script.renders(), 0);
}

#[test]
fn out_of_memory_stops_batch_and_keeps_earlier_pages() {
    let h = Harness::new(12, 5, 5);
    h.scheduler.open_initial(&document("atlas")).unwrap();
    let budget = h.scheduler.memory().budget();
    h.script.oom_once_at(7);

    let report = h.scheduler.extend_batch("atlas");
    assert_eq!(report.stop, BatchStop::OutOfMemory { page: 7 });
    assert_eq!(
        report.pages.iter().map(|p| p.index).collect::<Vec<_>>(),
        vec![5, 6]
    );
    let snapshot = h.scheduler.snapshot("atlas").unwrap();
    assert_eq!(snapshot.rendered_count(), 7);
    assert_eq!(snapshot.state, SessionState::Partial);
    assert!(h.scheduler.store().exists("atlas", 5));
    assert!(h.scheduler.store().exists("atlas", 6));
    assert!(!h.scheduler.store().exists("atlas", 7));
    assert_eq!(h.scheduler.memory().budget(), budget / 2);

    // The failed page is retried on the next batch
    let retry = h.scheduler.extend_batch("atlas");
    assert_eq!(retry.requested, 7..12);
    assert_eq!(retry.stop, BatchStop::Completed);
    assert!(h.scheduler.snapshot("atlas").unwrap().is_full());
}

#[test]
fn failing_page_is_skipped() {
    let h = Harness::new(6, 5, 5);
    h.script.fail_page(2);

    let opened = h.scheduler.open_initial(&document("torn")).unwrap();
    let indices: Vec<usize> = opened.pages.iter().map(|p| p.index).collect();
    assert_eq!(indices, vec![0, 1, 3, 4]);

    let report = h.scheduler.extend_batch("torn");
    assert_eq!(report.requested, 5..6);
    let snapshot = h.scheduler.snapshot("torn").unwrap();
    assert_eq!(snapshot.rendered_count(), 5);
    assert!(snapshot.is_full());
}

#[test]
fn close_during_extend_abandons_the_batch() {
    let h = Harness::new(12, 5, 5);
    h.scheduler.open_initial(&document("manual")).unwrap();
    let (reached, release) = h.script.gate_at(6);

    let extender = {
        let scheduler = Arc::clone(&h.scheduler);
        thread::spawn(move || scheduler.extend_batch("manual"))
    };
    reached.recv().unwrap();

    let closer = {
        let scheduler = Arc::clone(&h.scheduler);
        thread::spawn(move || scheduler.close("manual"))
    };
    while h.scheduler.state("manual") != SessionState::Unopened {
        thread::sleep(Duration::from_millis(1));
    }
    release.send(()).unwrap();

    let report = extender.join().unwrap();
    closer.join().unwrap().unwrap();

    assert_eq!(report.stop, BatchStop::Cancelled);
    assert_eq!(
        report.pages.iter().map(|p| p.index).collect::<Vec<_>>(),
        vec![5, 6]
    );
    assert_eq!(h.script.rendered_indices().last(), Some(&6));
    assert_eq!(h.scheduler.store().stored_pages("manual"), 0);
    assert!(h.scheduler.memory().is_empty());
    assert_eq!(h.script.open_handles(), 0);

    // Reopening starts from scratch
    let reopened = h.scheduler.open_initial(&document("manual")).unwrap();
    assert_eq!(reopened.rendered_count(), 5);
    assert_eq!(h.script.opens(), 2);
    assert_eq!(&h.script.rendered_indices()[7..], &[0, 1, 2, 3, 4]);
}

#[test]
fn rendered_count_only_grows_and_never_exceeds_total() {
    let h = Harness::new(23, 4, 3);
    let mut last = h
        .scheduler
        .open_initial(&document("long"))
        .unwrap()
        .rendered_count();

    for _ in 0..12 {
        h.scheduler.extend_batch("long");
        let snapshot = h.scheduler.snapshot("long").unwrap();
        assert!(snapshot.rendered_count() >= last);
        assert!(snapshot.rendered_count() <= snapshot.total_pages);
        assert!(
            snapshot
                .pages
                .windows(2)
                .all(|pair| pair[0].index < pair[1].index)
        );
        last = snapshot.rendered_count();
    }
    assert_eq!(last, 23);
}

#[test]
fn snapshots_handed_out_earlier_are_prefixes() {
    let h = Harness::new(10, 5, 5);
    let early = h.scheduler.open_initial(&document("log")).unwrap();
    h.scheduler.extend_batch("log");
    let late = h.scheduler.snapshot("log").unwrap();

    assert_eq!(early.rendered_count(), 5);
    assert_eq!(&late.pages[..5], &early.pages[..]);
}

#[test]
fn pages_already_on_disk_skip_the_codec() {
    let h = Harness::new(8, 5, 5);
    let doc = document("cached");
    let rendered = h.scheduler.open_initial(&doc).unwrap();
    let written: Vec<_> = rendered
        .pages
        .iter()
        .map(|p| std::fs::metadata(&p.path).unwrap().modified().unwrap())
        .collect();

    // A second scheduler over the same cache root finds the pages
    let codec = FakeCodec::with_pages(8);
    let script = Arc::clone(&codec.script);
    let memory = Arc::new(MemoryPageCache::new(1 << 20));
    let scheduler =
        RenderScheduler::new(codec, h.dir.path(), memory, h.scheduler.config()).unwrap();

    let reopened = scheduler.open_initial(&doc).unwrap();
    assert_eq!(reopened.rendered_count(), 5);
    assert_eq!(script.renders(), 0);
    let unchanged: Vec<_> = reopened
        .pages
        .iter()
        .map(|p| std::fs::metadata(&p.path).unwrap().modified().unwrap())
        .collect();
    assert_eq!(written, unchanged);
}

#[test]
fn memory_cache_stays_within_budget() {
    let page = footprint(&PageImage::new(16, 24));
    let budget = page * 3 + page / 2;
    let h = Harness::with_budget(12, 5, 5, budget);

    h.scheduler.open_initial(&document("big")).unwrap();
    while h.scheduler.extend_batch("big").stop != BatchStop::Idle {}

    let memory = h.scheduler.memory();
    assert!(memory.bytes_used() <= budget);
    assert_eq!(memory.len(), 3);
    assert!(memory.stats().evictions >= 9);

    // Evicted pages are still readable from disk
    let snapshot = h.scheduler.snapshot("big").unwrap();
    let first = h.scheduler.page_image(&snapshot.pages[0].path).unwrap();
    assert_eq!(first.get_pixel(0, 0).0[0], 0);
    assert_eq!(first.dimensions(), (16, 24));
    assert_eq!(snapshot.resolution(), Some((16, 24)));
}

#[test]
fn unreadable_source_is_reported_and_retryable() {
    let h = Harness::new(4, 5, 5);
    let broken = Document::from_bytes("scan", UNREADABLE);

    let err = h.scheduler.open_initial(&broken).unwrap_err();
    assert!(matches!(err, RenderError::SourceUnavailable { .. }));
    assert_eq!(h.scheduler.state("scan"), SessionState::Unopened);

    let opened = h.scheduler.open_initial(&document("scan")).unwrap();
    assert!(opened.is_full());
}

#[test]
fn missing_source_path_is_reported() {
    let h = Harness::new(4, 5, 5);
    let missing = Document::from_path("ghost", h.dir.path().join("ghost.pdf"));
    let err = h.scheduler.open_initial(&missing).unwrap_err();
    assert!(matches!(err, RenderError::SourceUnavailable { .. }));
    assert!(h.scheduler.open_documents().is_empty());
}

#[test]
fn documents_render_independently() {
    let h = Harness::new(12, 5, 5);
    h.scheduler.open_initial(&document("left")).unwrap();
    h.scheduler.open_initial(&document("right")).unwrap();

    let workers: Vec<_> = ["left", "right"]
        .into_iter()
        .map(|name| {
            let scheduler = Arc::clone(&h.scheduler);
            thread::spawn(move || {
                while scheduler.extend_batch(name).stop != BatchStop::Idle {}
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(h.scheduler.snapshot("left").unwrap().is_full());
    assert!(h.scheduler.snapshot("right").unwrap().is_full());
    assert_eq!(h.scheduler.open_documents(), vec!["left", "right"]);

    h.scheduler.close("left").unwrap();
    assert_eq!(h.scheduler.store().stored_pages("left"), 0);
    assert_eq!(h.scheduler.store().stored_pages("right"), 12);
}

fn entry_names(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.file_name().to_string_lossy().to_string())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

#[test]
fn names_that_sanitize_alike_keep_separate_pages() {
    let h = Harness::new(4, 5, 5);
    h.scheduler.open_initial(&document("a/b")).unwrap();
    assert_eq!(h.script.renders(), 4);

    let other = h.scheduler.open_initial(&document("a_b")).unwrap();
    assert_eq!(h.script.renders(), 8, "second document rendered by the codec");
    let first = h.scheduler.snapshot("a/b").unwrap();
    assert_ne!(first.pages[0].path, other.pages[0].path);

    h.scheduler.close("a_b").unwrap();
    assert_eq!(h.scheduler.store().stored_pages("a/b"), 4);
    assert!(first.pages.iter().all(|page| page.path.is_file()));
}

#[test]
fn close_removes_pages_and_staged_copy_without_leftovers() {
    let h = Harness::new(4, 5, 5);
    h.scheduler.open_initial(&document("keep")).unwrap();
    h.scheduler.open_initial(&document("drop")).unwrap();
    let staged = h.dir.path().join("staged");
    assert_eq!(entry_names(&staged).len(), 2);

    h.scheduler.close("drop").unwrap();

    let pages = entry_names(h.scheduler.store().base_dir());
    assert_eq!(pages.len(), 1, "only the open document remains: {pages:?}");
    assert!(pages[0].starts_with("keep-"));
    let staged_names = entry_names(&staged);
    assert_eq!(staged_names.len(), 1);
    assert!(staged_names[0].starts_with("keep-"));

    // Closing again is harmless
    h.scheduler.close("drop").unwrap();
    assert_eq!(h.scheduler.store().stored_pages("keep"), 4);
}

#[test]
fn concurrent_opens_share_one_session() {
    let h = Harness::new(12, 5, 5);
    let (reached, release) = h.script.gate_at(2);

    let first = {
        let scheduler = Arc::clone(&h.scheduler);
        thread::spawn(move || scheduler.open_initial(&document("shared")))
    };
    reached.recv().unwrap();
    assert_eq!(h.scheduler.state("shared"), SessionState::Opening);

    let second = {
        let scheduler = Arc::clone(&h.scheduler);
        thread::spawn(move || scheduler.open_initial(&document("shared")))
    };
    thread::sleep(Duration::from_millis(20));
    release.send(()).unwrap();

    let opened = first.join().unwrap().unwrap();
    let joined = second.join().unwrap().unwrap();
    assert_eq!(h.script.opens(), 1);
    assert_eq!(h.script.renders(), 5);
    assert_eq!(opened.rendered_count(), 5);
    assert_eq!(joined.rendered_count(), 5);
    assert_eq!(&opened.pages[..], &joined.pages[..]);
    assert_eq!(joined.state, SessionState::Partial);
}

#[test]
fn joining_a_failed_open_reports_source_unavailable() {
    let h = Harness::new(4, 5, 5);
    let (reached, release) = h.script.gate_open();

    let first = {
        let scheduler = Arc::clone(&h.scheduler);
        thread::spawn(move || scheduler.open_initial(&Document::from_bytes("scan", UNREADABLE)))
    };
    reached.recv().unwrap();

    let second = {
        let scheduler = Arc::clone(&h.scheduler);
        thread::spawn(move || scheduler.open_initial(&Document::from_bytes("scan", UNREADABLE)))
    };
    thread::sleep(Duration::from_millis(20));
    release.send(()).unwrap();

    for result in [first.join().unwrap(), second.join().unwrap()] {
        assert!(matches!(result, Err(RenderError::SourceUnavailable { .. })));
    }
    assert_eq!(h.script.opens(), 0);
    assert_eq!(h.scheduler.state("scan"), SessionState::Unopened);
    assert!(h.scheduler.open_documents().is_empty());
}

#[test]
fn repeated_out_of_memory_keeps_a_minimum_budget() {
    let h = Harness::with_budget(12, 5, 5, MIN_MEMORY_BUDGET + MIN_MEMORY_BUDGET / 4);
    h.scheduler.open_initial(&document("tight")).unwrap();

    for _ in 0..4 {
        h.script.oom_once_at(5);
        let report = h.scheduler.extend_batch("tight");
        assert_eq!(report.stop, BatchStop::OutOfMemory { page: 5 });
        assert_eq!(h.scheduler.memory().budget(), MIN_MEMORY_BUDGET);
    }

    let report = h.scheduler.extend_batch("tight");
    assert_eq!(report.stop, BatchStop::Completed);
    assert_eq!(h.scheduler.memory().len(), 10);
}
