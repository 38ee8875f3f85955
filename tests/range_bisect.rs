//! End-to-end runs over a mirror on disk, with the real local transport and launcher.

mod common;

use build_bisect::engine::{CommandLauncher, LocalDownloader};
use build_bisect::model::{
    BisectEvent, BisectMode, BisectOptions, FetchConfig, ResultCode, Verdict,
};
use build_bisect::orchestrator::{Collaborators, Outcome, RunController};
use common::*;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn mirror(root: &Path, keys: &[&str]) -> FetchConfig {
    let config = fetch_config(root);
    for key in keys {
        let dir = config.mirror.join(key);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(&config.file_name), format!("build {key}")).unwrap();
    }
    config
}

fn controller() -> RunController {
    RunController::new(Collaborators {
        downloader: Arc::new(LocalDownloader),
        launcher: Arc::new(CommandLauncher::new(None, false)),
    })
}

const DAYS: [&str; 9] = [
    "2024-01-01",
    "2024-01-02",
    "2024-01-03",
    "2024-01-04",
    "2024-01-05",
    "2024-01-06",
    "2024-01-07",
    "2024-01-08",
    "2024-01-09",
];

#[tokio::test]
async fn date_range_converges_on_first_bad_day() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = mirror(dir.path(), &DAYS);
    config.persist = true;
    let dest_dir = config.dest_dir.clone();
    let options = BisectOptions {
        mode: BisectMode::Date,
        start: "2024-01-01".into(),
        end: "2024-01-09".into(),
        find_fix: false,
    };

    let mut controller = controller();
    controller.bisect(config, &options).await.unwrap();
    let events = drive(&mut controller, |build| {
        assert!(build.path.as_ref().is_some_and(|p| p.is_file()));
        if build.key.as_str() >= "2024-01-06" {
            Verdict::Bad
        } else {
            Verdict::Good
        }
    })
    .await;

    assert_eq!(finished_codes(&events), vec![ResultCode::Finished]);
    let summary = controller.outcome().and_then(Outcome::summary).unwrap();
    assert_eq!(summary.first, "2024-01-05");
    assert_eq!(summary.last, "2024-01-06");
    assert_eq!(
        summary
            .last_app_info
            .as_ref()
            .and_then(|info| info.get("build_key"))
            .map(String::as_str),
        Some("2024-01-06")
    );
    let fetched = std::fs::read_to_string(dest_dir.join("2024-01-06--app.bin")).unwrap();
    assert_eq!(fetched, "build 2024-01-06");
}

#[tokio::test]
async fn find_fix_walks_the_other_way() {
    let dir = tempfile::tempdir().unwrap();
    let config = mirror(dir.path(), &DAYS);
    let options = BisectOptions {
        mode: BisectMode::Date,
        start: "2024-01-01".into(),
        end: "2024-01-09".into(),
        find_fix: true,
    };

    let mut controller = controller();
    controller.bisect(config, &options).await.unwrap();
    // Broken until the 3rd, fixed from then on.
    drive(&mut controller, |build| {
        if build.key.as_str() >= "2024-01-03" {
            Verdict::Good
        } else {
            Verdict::Bad
        }
    })
    .await;

    let summary = controller.outcome().and_then(Outcome::summary).unwrap();
    assert!(summary.find_fix);
    assert_eq!(summary.first, "2024-01-02");
    assert_eq!(summary.last, "2024-01-03");
}

#[tokio::test]
async fn revision_range_from_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let revs = ["a1f3", "b2c4", "c3d5", "d4e6", "e5f7"];
    let config = mirror(dir.path(), &revs);
    std::fs::write(
        config.mirror.join("revisions.txt"),
        "# oldest first\na1f3\nb2c4\nc3d5\n\nd4e6\ne5f7\n",
    )
    .unwrap();
    let options = BisectOptions {
        mode: BisectMode::Revision,
        start: "a1".into(),
        end: "e5f7".into(),
        find_fix: false,
    };

    let mut controller = controller();
    controller.bisect(config, &options).await.unwrap();
    drive(&mut controller, |build| {
        if build.key == "a1f3" || build.key == "b2c4" {
            Verdict::Good
        } else {
            Verdict::Bad
        }
    })
    .await;

    let summary = controller.outcome().and_then(Outcome::summary).unwrap();
    assert_eq!(summary.first, "b2c4");
    assert_eq!(summary.last, "c3d5");
}

#[tokio::test]
async fn empty_mirror_is_not_enough_data() {
    let dir = tempfile::tempdir().unwrap();
    let config = mirror(dir.path(), &[]);
    let options = BisectOptions {
        mode: BisectMode::Date,
        start: "2024-01-01".into(),
        end: "2024-01-09".into(),
        find_fix: false,
    };

    let mut controller = controller();
    controller.bisect(config, &options).await.unwrap();
    let events = drive(&mut controller, |_| Verdict::Good).await;

    assert_eq!(finished_codes(&events), vec![ResultCode::NoData]);
    assert_eq!(controller.outcome(), Some(&Outcome::NotEnoughData));
}

#[tokio::test]
async fn invalid_range_is_an_exception() {
    let dir = tempfile::tempdir().unwrap();
    let config = mirror(dir.path(), &DAYS);
    let options = BisectOptions {
        mode: BisectMode::Date,
        start: "2024-01-09".into(),
        end: "2024-01-01".into(),
        find_fix: false,
    };

    let mut controller = controller();
    controller.bisect(config, &options).await.unwrap();
    let events = drive(&mut controller, |_| Verdict::Good).await;

    assert_eq!(finished_codes(&events), vec![ResultCode::Exception]);
    assert!(controller
        .last_error()
        .is_some_and(|e| e.contains("must be before")));
}

#[tokio::test]
async fn stop_kills_a_waited_on_command() {
    let dir = tempfile::tempdir().unwrap();
    let config = mirror(dir.path(), &DAYS);
    let options = BisectOptions {
        mode: BisectMode::Date,
        start: "2024-01-01".into(),
        end: "2024-01-09".into(),
        find_fix: false,
    };

    let mut controller = RunController::new(Collaborators {
        downloader: Arc::new(LocalDownloader),
        launcher: Arc::new(CommandLauncher::new(Some("sleep 30".into()), true)),
    });
    controller.bisect(config, &options).await.unwrap();
    wait_for(&mut controller, |ev| {
        matches!(ev, BisectEvent::DownloadFinished { .. })
    })
    .await;
    // Give the worker time to start the command.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    tokio::time::timeout(TEST_TIMEOUT, controller.stop())
        .await
        .expect("stop hung");
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "stop took {:?}",
        started.elapsed()
    );
    assert!(!controller.is_active());
    assert!(controller.outcome().is_none());
}
