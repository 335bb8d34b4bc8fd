mod common;

use common::*;
use partfetch_core::{
    get_available_space, merge_parts, DiskBudgetGuard, FetchError, HoldParts, TransferMode,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, ResponseTemplate};

#[tokio::test]
async fn test_split_download_is_byte_identical() {
    let h = Harness::new(4096).await;
    let body = test_body(10_000);
    mount_file(&h.server, "movie.bin", body.clone(), true).await;

    let file = h.remote_file("movie.bin", 10_000);
    let handler = Arc::new(CollectParts::default());
    let outcome = h
        .engine
        .download(&file, 2, handler.clone(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.mode, TransferMode::Split);
    assert_eq!(outcome.parts.len(), 3);
    assert_eq!(outcome.fetched_bytes, 10_000);
    assert_eq!(handler.indices(), vec![0, 1, 2]);

    let mut joined = Vec::new();
    for part in &outcome.parts {
        joined.extend(tokio::fs::read(&part.path).await.unwrap());
    }
    assert_eq!(joined, *body);
    assert_eq!(
        files_in(h.dir.path()),
        vec!["movie.part001.bin", "movie.part002.bin", "movie.part003.bin"]
    );

    let mut ranges: Vec<String> = requests(&h.server, "GET", "movie.bin")
        .await
        .iter()
        .filter_map(range_header)
        .collect();
    ranges.sort();
    assert_eq!(ranges, vec!["bytes=0-4095", "bytes=4096-8191", "bytes=8192-9999"]);
    // Delivered parts stay reserved until a consumer releases them
    assert_eq!(h.disk.used(), 10_000);
}

#[tokio::test]
async fn test_complete_file_is_not_fetched_again() {
    let h = Harness::new(4096).await;
    mount_file(&h.server, "movie.bin", test_body(10_000), true).await;
    let file = h.remote_file("movie.bin", 10_000);

    h.engine
        .download(&file, 2, Arc::new(CollectParts::default()), CancellationToken::new())
        .await
        .unwrap();
    let before = h.server.received_requests().await.unwrap().len();

    let handler = Arc::new(CollectParts::default());
    let outcome = h
        .engine
        .download(&file, 2, handler.clone(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.mode, TransferMode::Cached);
    assert_eq!(outcome.fetched_bytes, 0);
    assert_eq!(handler.indices(), vec![0, 1, 2]);
    assert_eq!(h.server.received_requests().await.unwrap().len(), before);
}

#[tokio::test]
async fn test_resume_from_any_offset_is_byte_identical() {
    for k in [0usize, 1, 1_234, 4_095] {
        let h = Harness::new(4096).await;
        let body = test_body(8192);
        mount_file(&h.server, "f.bin", body.clone(), true).await;

        // Second part was interrupted after k bytes
        tokio::fs::write(h.path("f.part002.bin.partial"), &body[4096..4096 + k])
            .await
            .unwrap();

        let file = h.remote_file("f.bin", 8192);
        let outcome = h
            .engine
            .download(&file, 2, Arc::new(CollectParts::default()), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.fetched_bytes, 8192 - k as u64);
        let second = tokio::fs::read(h.path("f.part002.bin")).await.unwrap();
        assert_eq!(second, body[4096..]);
        assert!(!h.path("f.part002.bin.partial").exists());

        let ranges: Vec<String> = requests(&h.server, "GET", "f.bin")
            .await
            .iter()
            .filter_map(range_header)
            .collect();
        assert!(ranges.contains(&format!("bytes={}-8191", 4096 + k)), "k={k}: {ranges:?}");
    }
}

#[tokio::test]
async fn test_oversized_partial_is_restarted() {
    let h = Harness::new(1 << 20).await;
    let body = test_body(3000);
    mount_file(&h.server, "f.bin", body.clone(), true).await;
    tokio::fs::write(h.path("f.bin.partial"), vec![0u8; 5000]).await.unwrap();

    let file = h.remote_file("f.bin", 3000);
    h.engine
        .download(&file, 1, Arc::new(CollectParts::default()), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(tokio::fs::read(h.path("f.bin")).await.unwrap(), *body);
    let ranges: Vec<String> = requests(&h.server, "GET", "f.bin")
        .await
        .iter()
        .filter_map(range_header)
        .collect();
    assert_eq!(ranges, vec!["bytes=0-2999"]);
}

#[tokio::test]
async fn test_no_range_support_uses_single_plain_get() {
    let h = Harness::new(4096).await;
    let body = test_body(10_000);
    mount_file(&h.server, "plain.bin", body.clone(), false).await;

    let file = h.remote_file("plain.bin", 10_000);
    let handler = Arc::new(CollectParts::default());
    let outcome = h
        .engine
        .download(&file, 4, handler.clone(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.mode, TransferMode::Sequential);
    let gets = requests(&h.server, "GET", "plain.bin").await;
    assert_eq!(gets.len(), 1);
    assert!(gets.iter().all(|r| range_header(r).is_none()));
    assert_eq!(tokio::fs::read(h.path("plain.bin")).await.unwrap(), *body);
    assert_eq!(handler.indices(), vec![0]);
}

#[tokio::test]
async fn test_empty_file_is_one_empty_part() {
    let h = Harness::new(4096).await;
    mount_file(&h.server, "empty.bin", test_body(0), true).await;

    let file = h.remote_file("empty.bin", 0);
    let handler = Arc::new(CollectParts::default());
    let outcome = h
        .engine
        .download(&file, 2, handler.clone(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.mode, TransferMode::Sequential);
    assert_eq!(outcome.total_bytes, 0);
    assert_eq!(outcome.parts.len(), 1);
    assert!(outcome.parts[0].range.is_empty());
    assert_eq!(outcome.parts[0].range.end(), None);
    assert_eq!(handler.parts.lock()[0].len, 0);
    assert_eq!(tokio::fs::read(h.path("empty.bin")).await.unwrap().len(), 0);
    assert_eq!(h.disk.used(), 0);
}

#[tokio::test]
async fn test_below_ceiling_is_one_part() {
    let h = Harness::new(4096).await;
    mount_file(&h.server, "small.bin", test_body(3000), true).await;

    let file = h.remote_file("small.bin", 3000);
    let outcome = h
        .engine
        .download(&file, 4, Arc::new(CollectParts::default()), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.mode, TransferMode::Single);
    assert_eq!(requests(&h.server, "GET", "small.bin").await.len(), 1);
    assert_eq!(files_in(h.dir.path()), vec!["small.bin"]);
}

#[tokio::test]
async fn test_transient_error_is_retried() {
    let h = Harness::new(1 << 20).await;
    let body = test_body(2000);
    mount_head(&h.server, "flaky.bin", &body, true).await;
    Mock::given(method("GET"))
        .and(path("/download/flaky.bin"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/download/flaky.bin"))
        .respond_with(RangeResponder::new(body.clone()))
        .mount(&h.server)
        .await;

    let file = h.remote_file("flaky.bin", 2000);
    h.engine
        .download(&file, 1, Arc::new(CollectParts::default()), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(requests(&h.server, "GET", "flaky.bin").await.len(), 2);
    assert_eq!(tokio::fs::read(h.path("flaky.bin")).await.unwrap(), *body);
}

#[tokio::test]
async fn test_client_error_is_terminal_and_cleans_up() {
    let h = Harness::new(1 << 20).await;
    let body = test_body(2000);
    mount_head(&h.server, "gone.bin", &body, true).await;
    Mock::given(method("GET"))
        .and(path("/download/gone.bin"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&h.server)
        .await;

    let file = h.remote_file("gone.bin", 2000);
    let err = h
        .engine
        .download(&file, 1, Arc::new(CollectParts::default()), CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        FetchError::Download { file, part, source } => {
            assert_eq!(file, "gone.bin");
            assert_eq!(part, 0);
            assert!(matches!(*source, FetchError::Server { status: 404, .. }));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(requests(&h.server, "GET", "gone.bin").await.len(), 1);
    assert!(files_in(h.dir.path()).is_empty());
    assert_eq!(h.disk.used(), 0);
}

#[tokio::test]
async fn test_rejected_token_is_refreshed() {
    let h = Harness::new(1 << 20).await;
    let body = test_body(1500);
    Mock::given(method("POST"))
        .and(path("/accounts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "ok",
            "data": {"token": "fresh-token"}
        })))
        .expect(1)
        .mount(&h.server)
        .await;
    mount_head(&h.server, "auth.bin", &body, true).await;
    Mock::given(method("GET"))
        .and(path("/download/auth.bin"))
        .and(header("cookie", "accountToken=test-token"))
        .respond_with(ResponseTemplate::new(401))
        .with_priority(1)
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/download/auth.bin"))
        .and(header("cookie", "accountToken=fresh-token"))
        .respond_with(RangeResponder::new(body.clone()))
        .mount(&h.server)
        .await;

    let file = h.remote_file("auth.bin", 1500);
    h.engine
        .download(&file, 1, Arc::new(CollectParts::default()), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(h.tokens.issued_count(), 1);
    assert_eq!(tokio::fs::read(h.path("auth.bin")).await.unwrap(), *body);
}

#[tokio::test]
async fn test_resume_needs_room_only_for_missing_bytes() {
    let body = test_body(30_000);
    let mut roomy = true;
    let h = Harness::with_disk(1 << 20, |dir| {
        std::fs::write(dir.join("f.bin.partial"), &body[..20_000]).unwrap();
        let free = get_available_space(dir).unwrap();
        roomy = free > 1 << 20;
        // 15_000 more bytes may land on the filesystem
        DiskBudgetGuard::new(u64::MAX).with_fs_probe(dir, free.saturating_sub(15_000))
    })
    .await;
    if !roomy {
        return;
    }
    mount_file(&h.server, "f.bin", body.clone(), true).await;

    let file = h.remote_file("f.bin", 30_000);
    let outcome = h
        .engine
        .download(&file, 1, Arc::new(CollectParts::default()), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.fetched_bytes, 10_000);
    assert_eq!(tokio::fs::read(h.path("f.bin")).await.unwrap(), *body);
    assert_eq!(h.disk.used(), 30_000);
    assert_eq!(h.disk.pending(), 0);
}

#[tokio::test]
async fn test_disk_budget_vetoes_before_writing() {
    let h = Harness::with_budget(4096, 5000).await;
    mount_file(&h.server, "big.bin", test_body(10_000), true).await;

    let file = h.remote_file("big.bin", 10_000);
    let err = h
        .engine
        .download(&file, 1, Arc::new(CollectParts::default()), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::DiskFull { .. }), "{err:?}");
    assert!(h.disk.used() <= 5000);
    // Exactly one part made it; the vetoed ones never touched the disk
    assert_eq!(requests(&h.server, "GET", "big.bin").await.len(), 1);
    assert!(files_in(h.dir.path()).iter().all(|n| !n.ends_with(".partial")));
}

#[tokio::test]
async fn test_cancel_stops_new_parts() {
    struct CancelOnFirst {
        cancel: CancellationToken,
        inner: CollectParts,
    }

    #[async_trait::async_trait]
    impl partfetch_core::PartReadyHandler for CancelOnFirst {
        async fn on_part_ready(&self, part: partfetch_types::ReadyPart) -> Result<(), FetchError> {
            self.cancel.cancel();
            self.inner.on_part_ready(part).await
        }
    }

    let h = Harness::new(4096).await;
    mount_file(&h.server, "c.bin", test_body(12_288), true).await;
    let cancel = CancellationToken::new();
    let handler = Arc::new(CancelOnFirst {
        cancel: cancel.clone(),
        inner: CollectParts::default(),
    });

    let file = h.remote_file("c.bin", 12_288);
    let err = h.engine.download(&file, 1, handler, cancel).await.unwrap_err();

    assert!(matches!(err, FetchError::Cancelled));
    assert_eq!(requests(&h.server, "GET", "c.bin").await.len(), 1);
    for name in files_in(h.dir.path()) {
        assert!(!name.ends_with(".partial"), "{name} left behind");
        let len = std::fs::metadata(h.path(&name)).unwrap().len();
        assert!(len <= 4096);
    }
}

#[tokio::test]
async fn test_cancel_interrupts_inflight_requests() {
    let h = Harness::new(4096).await;
    let body = test_body(8192);
    mount_head(&h.server, "slow.bin", &body, true).await;
    Mock::given(method("GET"))
        .and(path("/download/slow.bin"))
        .respond_with(RangeResponder::delayed(body, Duration::from_secs(30)))
        .mount(&h.server)
        .await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let file = h.remote_file("slow.bin", 8192);
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        h.engine
            .download(&file, 2, Arc::new(CollectParts::default()), cancel),
    )
    .await
    .expect("cancel should interrupt the transfer");

    assert!(matches!(result, Err(FetchError::Cancelled)));
    let issued = requests(&h.server, "GET", "slow.bin").await.len();
    assert!(issued <= 2);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(requests(&h.server, "GET", "slow.bin").await.len(), issued);
    assert!(files_in(h.dir.path()).is_empty());
    assert_eq!(h.disk.used(), 0);
}

#[tokio::test]
async fn test_same_destination_is_busy() {
    let h = Harness::new(4096).await;
    mount_file(&h.server, "dup.bin", test_body(5000), true).await;
    let file = h.remote_file("dup.bin", 5000);

    let (first, second) = tokio::join!(
        h.engine
            .download(&file, 1, Arc::new(CollectParts::default()), CancellationToken::new()),
        h.engine
            .download(&file, 1, Arc::new(CollectParts::default()), CancellationToken::new()),
    );

    assert!(first.is_ok());
    assert!(matches!(second, Err(FetchError::DestinationBusy(_))));
}

#[tokio::test]
async fn test_held_parts_merge_into_original() {
    let h = Harness::new(4096).await;
    let body = test_body(10_000);
    mount_file(&h.server, "m.bin", body.clone(), true).await;

    let file = h.remote_file("m.bin", 10_000);
    let outcome = h
        .engine
        .download(&file, 2, Arc::new(HoldParts), CancellationToken::new())
        .await
        .unwrap();
    let merged = merge_parts(&outcome.parts, &file.dest_path, &h.disk).await.unwrap();

    assert_eq!(tokio::fs::read(&merged).await.unwrap(), *body);
    assert_eq!(files_in(h.dir.path()), vec!["m.bin"]);
    assert_eq!(h.disk.used(), 10_000);
}
