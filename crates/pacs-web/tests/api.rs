use pacs_config::{AttributeCatalog, ConfigSchemaReader, StorageConfig};
use pacs_core::{tags, Attributes, ErrorKind, Identifier, LoadingMode, RemoteReference};
use pacs_storage::{
    DeviceStoreFactory, FetchService, LocalDeviceStoreFactory, LocalFetchService, RemoteFetchClient,
    StorageDevice, WadoPixelSource,
};
use pacs_web::{create_app, AppState};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const SCHEMA: &str = r#"
[levels.study]
fast_access = ["PatientID"]

[levels.series]
fast_access = ["Modality"]

[levels.image]
fast_access = ["InstanceNumber"]
"#;

struct Archive {
    _dir: TempDir,
    device: Arc<StorageDevice>,
    base_url: String,
}

/// 启动一个归档并在随机端口上提供HTTP服务
async fn start_archive(wado_base_url: Option<String>) -> Archive {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig {
        device_name: "web-test".to_string(),
        root_path: dir.path().display().to_string(),
        staging_path: None,
        database_url: "sqlite::memory:".to_string(),
        max_connections: 1,
    };
    let catalog = Arc::new(AttributeCatalog::load(&ConfigSchemaReader::from_toml_str(SCHEMA)).unwrap());
    let device = StorageDevice::open(&config, catalog).await.unwrap();
    let fetch = Arc::new(LocalFetchService::new(
        device.clone(),
        Arc::new(WadoPixelSource::new(wado_base_url)),
        Duration::from_secs(5),
    ));
    let app = create_app(AppState {
        device: device.clone(),
        fetch,
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(pacs_web::server::serve(listener, app));

    Archive {
        _dir: dir,
        device,
        base_url,
    }
}

fn header(sop: &str, frames: Option<&str>) -> Attributes {
    let header = Attributes::new()
        .with(tags::STUDY_INSTANCE_UID, "1.2.3")
        .with(tags::SERIES_INSTANCE_UID, "1.2.3.1")
        .with(tags::SOP_INSTANCE_UID, sop)
        .with(tags::SOP_CLASS_UID, "1.2.840.10008.5.1.4.1.1.7")
        .with(tags::PATIENT_ID, "PAT001")
        .with(tags::MODALITY, "OT")
        .with(tags::INSTANCE_NUMBER, "1");
    match frames {
        Some(n) => header.with(tags::NUMBER_OF_FRAMES, n),
        None => header,
    }
}

async fn store_image(device: &Arc<StorageDevice>, sop: &str, pixels: &[u8]) -> Identifier {
    let factory = LocalDeviceStoreFactory::new(device.clone());
    let mut session = factory.create_composite_store_session().unwrap();
    let id = session.store_with_pixels(&header(sop, None), pixels).await.unwrap();
    session.commit().await.unwrap();
    id
}

#[tokio::test]
async fn test_health() {
    let archive = start_archive(None).await;
    let body: serde_json::Value = reqwest::get(format!("{}/health", archive.base_url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["device"], "web-test");
}

#[tokio::test]
async fn test_remote_client_fetches_local_spans() {
    let archive = start_archive(None).await;
    let id = store_image(&archive.device, "1.2.3.1.1", b"abcd").await;

    let client = RemoteFetchClient::new(&archive.base_url, Duration::from_secs(5)).unwrap();
    let results = client
        .fetch_as_stream(&[id.clone()], LoadingMode::Eager, false)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].images[0].identifier, id);
    let span = results[0].images[0].pixels[0].as_local().unwrap();
    assert_eq!(span.read_all().await.unwrap(), b"abcd");
}

#[tokio::test]
async fn test_remote_client_rebuilds_error_kind() {
    let archive = start_archive(None).await;
    let client = RemoteFetchClient::new(&archive.base_url, Duration::from_secs(5)).unwrap();

    let err = client
        .fetch_as_stream(
            &[Identifier::image("9.9", "9.9.1", "9.9.1.1")],
            LoadingMode::Eager,
            false,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_wado_frame_retrieve() {
    let archive = start_archive(None).await;
    let factory = LocalDeviceStoreFactory::new(archive.device.clone());
    let mut session = factory
        .create_multi_frame_store_session(header("1.2.3.1.2", Some("2")))
        .unwrap();
    session
        .store_frame(&Attributes::new().with(tags::INSTANCE_NUMBER, "1"), b"first")
        .unwrap();
    session
        .store_frame(&Attributes::new().with(tags::INSTANCE_NUMBER, "2"), b"second")
        .unwrap();
    session.commit().await.unwrap();

    let url = format!(
        "{}/wado/studies/1.2.3/series/1.2.3.1/instances/1.2.3.1.2/frames",
        archive.base_url
    );
    let response = reqwest::get(format!("{}/2", url)).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "application/octet-stream"
    );
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"second");

    let response = reqwest::get(format!("{}/3", url)).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["kind"], "not_found");

    let response = reqwest::get(format!("{}/0", url)).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_wado_single_frame_image() {
    let archive = start_archive(None).await;
    store_image(&archive.device, "1.2.3.1.3", b"only").await;

    let url = format!(
        "{}/wado/studies/1.2.3/series/1.2.3.1/instances/1.2.3.1.3/frames",
        archive.base_url
    );
    let response = reqwest::get(format!("{}/1", url)).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"only");

    let response = reqwest::get(format!("{}/2", url)).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_archive_as_wado_source() {
    let origin = start_archive(None).await;
    store_image(&origin.device, "1.2.3.1.1", b"pixels").await;

    let proxy = start_archive(Some(origin.base_url.clone())).await;
    let factory = LocalDeviceStoreFactory::new(proxy.device.clone());
    let mut session = factory.create_composite_store_session().unwrap();
    let id = session
        .store_remote(
            &header("1.2.3.1.1", None),
            RemoteReference::Wado {
                uri: "wado/studies/1.2.3/series/1.2.3.1/instances/1.2.3.1.1/frames/1".to_string(),
            },
        )
        .await
        .unwrap();
    session.commit().await.unwrap();

    let client = RemoteFetchClient::new(&proxy.base_url, Duration::from_secs(5)).unwrap();
    let lazy = client
        .fetch_as_stream(&[id.clone()], LoadingMode::Lazy, false)
        .await
        .unwrap();
    assert!(lazy[0].images[0].pixels[0].as_local().is_none());

    let eager = client
        .fetch_as_stream(&[id], LoadingMode::Eager, false)
        .await
        .unwrap();
    let span = eager[0].images[0].pixels[0].as_local().unwrap();
    assert_eq!(span.read_all().await.unwrap(), b"pixels");
}
