mod common;

use std::sync::Arc;

use fipe_core::crawl::Scheduler;
use fipe_core::sink::RecordSink;

use common::{world_in, DeadSessionFactory, Fixture, MockSessionFactory};

use tempfile::tempdir;

const SIX_BRANDS: &[(&str, &[(&str, &[&str])])] = &[
    ("HONDA", &[("M1", &["2024"]), ("M2", &["2024"])]),
    ("YAMAHA", &[("M1", &["2024"]), ("M2", &["2024"])]),
    ("SUZUKI", &[("M1", &["2024"]), ("M2", &["2024"])]),
    ("KAWASAKI", &[("M1", &["2024"]), ("M2", &["2024"])]),
    ("BMW", &[("M1", &["2024"]), ("M2", &["2024"])]),
    ("DUCATI", &[("M1", &["2024"]), ("M2", &["2024"])]),
];

fn brand_labels() -> Vec<String> {
    SIX_BRANDS
        .iter()
        .map(|(brand, _)| (*brand).to_string())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_complete_every_entry_exactly_once() {
    let dir = tempdir().unwrap();
    let world = world_in(dir.path());
    let fixture = Fixture::new(SIX_BRANDS);
    let scheduler = Scheduler::new(
        Arc::new(MockSessionFactory::new(Arc::clone(&fixture))),
        Arc::clone(&world.ctx),
    );

    let summary = scheduler.run(brand_labels(), 3).await;

    assert_eq!(summary.entries_total, 6);
    assert_eq!(summary.entries_completed, 6);
    assert_eq!(summary.entries_failed, 0);
    assert_eq!(summary.entries_remaining, 0);
    assert_eq!(summary.records_appended, 12);
    assert_eq!(world.sink.count().await.unwrap(), 12);

    let snapshot = world.checkpoint.load().await.unwrap();
    assert_eq!(snapshot.completed.len(), 6);
    for (brand, models) in SIX_BRANDS {
        assert_eq!(snapshot.completed_mids(brand).len(), models.len());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn more_workers_than_entries_is_harmless() {
    let dir = tempdir().unwrap();
    let world = world_in(dir.path());
    let fixture = Fixture::new(&[
        ("HONDA", &[("M1", &["2024"])]),
        ("YAMAHA", &[("M1", &["2024"])]),
    ]);
    let scheduler = Scheduler::new(
        Arc::new(MockSessionFactory::new(fixture)),
        Arc::clone(&world.ctx),
    );

    let summary = scheduler
        .run(vec!["HONDA".to_string(), "YAMAHA".to_string()], 8)
        .await;

    assert_eq!(summary.entries_completed, 2);
    assert_eq!(summary.entries_remaining, 0);
    assert_eq!(world.sink.count().await.unwrap(), 2);
}

#[tokio::test]
async fn failed_entry_is_logged_and_the_worker_moves_on() {
    let dir = tempdir().unwrap();
    let world = world_in(dir.path());
    // GHOST is queued but does not exist in the catalog, so its brand
    // selection exhausts retries.
    let fixture = Fixture::new(&[
        ("HONDA", &[("M1", &["2024"])]),
        ("YAMAHA", &[("M1", &["2024"])]),
    ]);
    let scheduler = Scheduler::new(
        Arc::new(MockSessionFactory::new(Arc::clone(&fixture))),
        Arc::clone(&world.ctx),
    );

    let summary = scheduler
        .run(
            vec![
                "HONDA".to_string(),
                "GHOST".to_string(),
                "YAMAHA".to_string(),
            ],
            1,
        )
        .await;

    assert_eq!(summary.entries_completed, 2);
    assert_eq!(summary.entries_failed, 1);
    assert_eq!(summary.failures[0].brand, "GHOST");
    assert_eq!(summary.entries_remaining, 0);

    let snapshot = world.checkpoint.load().await.unwrap();
    assert!(!snapshot.is_entry_done("GHOST"));
    assert!(snapshot.is_entry_done("HONDA"));
    assert!(snapshot.is_entry_done("YAMAHA"));
}

#[tokio::test]
async fn stop_request_drains_no_further_entries() {
    let dir = tempdir().unwrap();
    let world = world_in(dir.path());
    let fixture = Fixture::new(SIX_BRANDS);
    let scheduler = Scheduler::new(
        Arc::new(MockSessionFactory::new(fixture)),
        Arc::clone(&world.ctx),
    );

    world.ctx.stop_handle().request_stop();
    let summary = scheduler.run(brand_labels(), 2).await;

    assert!(summary.stopped);
    assert_eq!(summary.entries_completed, 0);
    assert_eq!(summary.entries_remaining, 6);
    assert_eq!(world.sink.count().await.unwrap(), 0);
}

#[tokio::test]
async fn worker_retires_after_repeated_session_failures() {
    let dir = tempdir().unwrap();
    let world = world_in(dir.path());
    let scheduler = Scheduler::new(Arc::new(DeadSessionFactory), Arc::clone(&world.ctx));

    let entries: Vec<String> = ["A", "B", "C", "D"].iter().map(|s| s.to_string()).collect();
    let summary = scheduler.run(entries, 1).await;

    // Two entries abandoned, then the third consecutive failure retires
    // the only worker, which puts its entry back on the queue.
    assert_eq!(summary.entries_failed, 2);
    assert_eq!(summary.entries_remaining, 2);
    assert_eq!(summary.entries_completed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rerun_after_complete_crawl_fast_skips_everything() {
    let dir = tempdir().unwrap();
    let world = world_in(dir.path());
    let fixture = Fixture::new(SIX_BRANDS);
    let scheduler = Scheduler::new(
        Arc::new(MockSessionFactory::new(Arc::clone(&fixture))),
        Arc::clone(&world.ctx),
    );

    let first = scheduler.run(brand_labels(), 2).await;
    assert_eq!(first.entries_completed, 6);
    let searches_after_first = fixture.search_count();

    let second = scheduler.run(brand_labels(), 2).await;
    assert_eq!(second.entries_fast_skipped, 6);
    assert_eq!(second.entries_completed, 0);
    assert_eq!(fixture.search_count(), searches_after_first);
}
