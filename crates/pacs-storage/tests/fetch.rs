mod common;

use async_trait::async_trait;
use bytes::Bytes;
use common::{image_header, open_device, reopen_device};
use pacs_core::{
    ErrorKind, Identifier, LoadingMode, PacsError, PixelHandle, RemoteReference, Result,
};
use pacs_storage::{DeviceStoreFactory, FetchService, LocalFetchService, RemotePixelSource};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 计数的远程像素来源
#[derive(Default)]
struct StubSource {
    calls: AtomicUsize,
    delay: Option<Duration>,
}

#[async_trait]
impl RemotePixelSource for StubSource {
    async fn fetch_pixels(&self, reference: &RemoteReference) -> Result<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(Bytes::from(format!("remote:{}", reference.describe())))
    }
}

async fn store_remote_image(dev: &common::TestDevice, sop: &str) -> Identifier {
    let mut session = dev.factory.create_composite_store_session().unwrap();
    let id = session
        .store_remote(
            &image_header("1.2.3", "1.2.3.1", sop),
            RemoteReference::Wado {
                uri: format!("http://archive/wado/{}", sop),
            },
        )
        .await
        .unwrap();
    session.commit().await.unwrap();
    id
}

#[tokio::test]
async fn test_lazy_mode_returns_deferred_reference() {
    let dev = open_device().await;
    let id = store_remote_image(&dev, "1.2.3.1.1").await;
    let source = Arc::new(StubSource::default());
    let service = LocalFetchService::new(dev.device.clone(), source.clone(), Duration::from_secs(1));

    let results = service
        .fetch_as_stream(&[id], LoadingMode::Lazy, false)
        .await
        .unwrap();
    assert!(matches!(
        results[0].images[0].pixels[0],
        PixelHandle::Deferred(RemoteReference::Wado { .. })
    ));
    assert_eq!(source.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_eager_mode_downloads_once() {
    let dev = open_device().await;
    let id = store_remote_image(&dev, "1.2.3.1.1").await;
    let source = Arc::new(StubSource::default());
    let service = LocalFetchService::new(dev.device.clone(), source.clone(), Duration::from_secs(1));

    for _ in 0..2 {
        let results = service
            .fetch_as_stream(&[id.clone()], LoadingMode::Eager, false)
            .await
            .unwrap();
        let span = results[0].images[0].pixels[0].as_local().unwrap().clone();
        assert_eq!(
            span.read_all().await.unwrap(),
            b"remote:http://archive/wado/1.2.3.1.1"
        );
    }
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);

    // 重新存储后缓存失效
    store_remote_image(&dev, "1.2.3.1.1").await;
    service
        .fetch_as_stream(&[id], LoadingMode::Eager, false)
        .await
        .unwrap();
    assert_eq!(source.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_remote_timeout_is_transport_error() {
    let dev = open_device().await;
    let id = store_remote_image(&dev, "1.2.3.1.1").await;
    let source = Arc::new(StubSource {
        calls: AtomicUsize::new(0),
        delay: Some(Duration::from_secs(5)),
    });
    let service = LocalFetchService::new(dev.device.clone(), source, Duration::from_millis(50));

    let err = service
        .fetch_as_stream(&[id], LoadingMode::Eager, false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_truncated_pixel_file_is_data_corrupt() {
    let dev = open_device().await;
    let mut session = dev.factory.create_composite_store_session().unwrap();
    let id = session
        .store_with_pixels(&image_header("1.2.3", "1.2.3.1", "1.2.3.1.1"), &[9u8; 64])
        .await
        .unwrap();
    session.commit().await.unwrap();

    let record = dev.device.index().get(&id).await.unwrap().unwrap();
    let pixel_path = match record.pixel_location {
        Some(pacs_core::PixelLocation::File { path, .. }) => path,
        other => panic!("unexpected location {:?}", other),
    };
    std::fs::write(&pixel_path, [9u8; 10]).unwrap();

    let service = LocalFetchService::new(
        dev.device.clone(),
        Arc::new(StubSource::default()),
        Duration::from_secs(1),
    );
    let err = service
        .fetch_as_stream(&[id.clone()], LoadingMode::Eager, false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DataCorrupt);
    assert!(!err.is_retryable());

    // 跳过像素时只需要头部
    let results = service
        .fetch_as_stream(&[id], LoadingMode::Eager, true)
        .await
        .unwrap();
    assert!(results[0].images[0].pixels.is_empty());
}

#[tokio::test]
async fn test_study_request_groups_by_series() {
    let dev = open_device().await;
    let mut session = dev.factory.create_composite_store_session().unwrap();
    for (series, sop) in [
        ("1.2.3.1", "1.2.3.1.1"),
        ("1.2.3.1", "1.2.3.1.2"),
        ("1.2.3.2", "1.2.3.2.1"),
    ] {
        session
            .store_with_pixels(&image_header("1.2.3", series, sop), sop.as_bytes())
            .await
            .unwrap();
    }
    session.commit().await.unwrap();

    let service = LocalFetchService::new(
        dev.device.clone(),
        Arc::new(StubSource::default()),
        Duration::from_secs(1),
    );
    let mut results = service
        .fetch_as_stream(&[Identifier::study("1.2.3")], LoadingMode::Eager, false)
        .await
        .unwrap();
    results.sort_by(|a, b| a.series.cmp(&b.series));
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].images.len(), 2);
    assert_eq!(results[1].images.len(), 1);

    // 同一序列的影像合并为一条
    let merged = service
        .fetch_as_stream(
            &[
                Identifier::image("1.2.3", "1.2.3.1", "1.2.3.1.2"),
                Identifier::image("1.2.3", "1.2.3.1", "1.2.3.1.1"),
            ],
            LoadingMode::Eager,
            false,
        )
        .await
        .unwrap();
    assert_eq!(merged.len(), 1);
    let sops: Vec<_> = merged[0]
        .images
        .iter()
        .map(|i| i.identifier.sop_instance_uid().unwrap().to_string())
        .collect();
    assert_eq!(sops, vec!["1.2.3.1.2", "1.2.3.1.1"]);
}

#[tokio::test]
async fn test_unknown_identifier_is_not_found() {
    let dev = open_device().await;
    let service = LocalFetchService::new(
        dev.device.clone(),
        Arc::new(StubSource::default()),
        Duration::from_secs(1),
    );
    let err = service
        .fetch_as_stream(&[Identifier::series("9.9", "9.9.9")], LoadingMode::Lazy, false)
        .await
        .unwrap_err();
    assert!(matches!(err, PacsError::NotFound(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fetch_during_recommit_returns_one_committed_version() {
    let dev = common::open_file_backed_device().await;
    let header = image_header("1.2.3", "1.2.3.1", "1.2.3.1.1");
    let mut session = dev.factory.create_composite_store_session().unwrap();
    let id = session.store_with_pixels(&header, &[0u8; 16]).await.unwrap();
    session.commit().await.unwrap();

    let factory = dev.factory.clone();
    let writer = tokio::spawn(async move {
        for version in 1..=10u8 {
            let mut session = factory.create_composite_store_session().unwrap();
            session.store_with_pixels(&header, &[version; 16]).await.unwrap();
            session.commit().await.unwrap();
        }
    });

    let service = LocalFetchService::new(
        dev.device.clone(),
        Arc::new(StubSource::default()),
        Duration::from_secs(1),
    );
    let mut fetches = 0;
    while !writer.is_finished() {
        let results = service
            .fetch_as_stream(&[id.clone()], LoadingMode::Eager, false)
            .await
            .unwrap();
        let image = &results[0].images[0];
        assert_eq!(image.pixels.len(), 1);
        assert_eq!(image.pixels[0].as_local().unwrap().length, 16);
        fetches += 1;
    }
    writer.await.unwrap();
    assert!(fetches > 0);

    let results = service
        .fetch_as_stream(&[id], LoadingMode::Eager, false)
        .await
        .unwrap();
    let span = results[0].images[0].pixels[0].as_local().unwrap();
    assert_eq!(span.read_all().await.unwrap(), vec![10u8; 16]);
}

#[tokio::test]
async fn test_missing_pixel_file_is_data_corrupt() {
    let dev = open_device().await;
    let mut session = dev.factory.create_composite_store_session().unwrap();
    let id = session
        .store_with_pixels(&image_header("1.2.3", "1.2.3.1", "1.2.3.1.1"), &[3u8; 8])
        .await
        .unwrap();
    session.commit().await.unwrap();

    let record = dev.device.index().get(&id).await.unwrap().unwrap();
    if let Some(pacs_core::PixelLocation::File { path, .. }) = record.pixel_location {
        std::fs::remove_file(path).unwrap();
    }
    let service = LocalFetchService::new(
        dev.device.clone(),
        Arc::new(StubSource::default()),
        Duration::from_secs(1),
    );
    let err = service
        .fetch_as_stream(&[id], LoadingMode::Eager, false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DataCorrupt);
}

#[tokio::test]
async fn test_fetch_copies_removed_on_close_and_reopen() {
    let dev = open_device().await;
    let fetch_dir = dev.device.staging_area().join("fetch");
    std::fs::create_dir_all(&fetch_dir).unwrap();
    std::fs::write(fetch_dir.join("pixels-stale.pix"), b"stale").unwrap();

    dev.device.close().await;
    assert!(!fetch_dir.exists());
    assert!(dev.device.staging_area().exists());

    // 进程异常退出留下的副本在下次打开时清理
    std::fs::create_dir_all(&fetch_dir).unwrap();
    std::fs::write(fetch_dir.join("pixels-stale.pix"), b"stale").unwrap();
    let reopened = reopen_device(&dev).await;
    assert!(!fetch_dir.exists());
    assert!(dev.data_dir().exists());
    reopened.close().await;
}
