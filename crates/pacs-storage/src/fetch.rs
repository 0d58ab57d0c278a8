//! 像素解析与获取服务
//!
//! 给定标识，确认头部与像素在本地可寻址，按序列返回读取位置，调用方无需关心后端。

use crate::device::StorageDevice;
use async_trait::async_trait;
use bytes::Bytes;
use pacs_config::FetchConfig;
use pacs_core::utils::unique_file_name;
use pacs_core::{
    EntityType, FetchInformation, FetchRequest, Identifier, ImageFetchInformation, Level,
    LoadingMode, PacsError, PixelHandle, PixelLocation, PixelSpan, RemoteReference, Result,
};
use pacs_database::{EntityRecord, IndexSnapshot};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// 远程像素在数据块存储中的缓存名
pub(crate) const PIXEL_CACHE_BLOB: &str = "pixels";
/// 计划中的文件被并发提交替换时重新读取索引的次数上限
const RESOLVE_ATTEMPTS: usize = 3;

/// FetchAsStream 服务接口，进程内实现与远程调用桩共用
#[async_trait]
pub trait FetchService: Send + Sync {
    async fn fetch_as_stream(
        &self,
        identifiers: &[Identifier],
        loading_mode: LoadingMode,
        skip_loading_frames: bool,
    ) -> Result<Vec<FetchInformation>>;

    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<FetchInformation>> {
        self.fetch_as_stream(
            &request.identifiers,
            request.loading_mode,
            request.skip_loading_frames,
        )
        .await
    }
}

/// 远程像素来源（WADO或云影像服务）
#[async_trait]
pub trait RemotePixelSource: Send + Sync {
    async fn fetch_pixels(&self, reference: &RemoteReference) -> Result<Bytes>;
}

/// 基于HTTP的远程像素来源
#[derive(Debug, Clone)]
pub struct WadoPixelSource {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl WadoPixelSource {
    /// `base_url` 用于解析相对WADO地址与云影像引用
    pub fn new(base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
        }
    }

    fn resolve_url(&self, reference: &RemoteReference) -> Result<String> {
        match reference {
            RemoteReference::Wado { uri } if uri.starts_with("http://") || uri.starts_with("https://") => {
                Ok(uri.clone())
            }
            RemoteReference::Wado { uri: path } | RemoteReference::Ahli { reference: path } => {
                let base = self.base_url.as_ref().ok_or_else(|| {
                    PacsError::transport(format!("未配置远端归档地址，无法解析: {}", path))
                })?;
                Ok(format!("{}/{}", base, path.trim_start_matches('/')))
            }
        }
    }
}

#[async_trait]
impl RemotePixelSource for WadoPixelSource {
    async fn fetch_pixels(&self, reference: &RemoteReference) -> Result<Bytes> {
        let url = self.resolve_url(reference)?;
        debug!("GET {}", url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| PacsError::transport(format!("请求 {} 失败: {}", url, e)))?;
        response
            .bytes()
            .await
            .map_err(|e| PacsError::transport(format!("读取 {} 响应失败: {}", url, e)))
    }
}

/// 序列内被请求的影像
#[derive(Debug)]
struct ImageSelection {
    image: Identifier,
    /// `None` 表示全部帧
    frames: Option<Vec<u32>>,
}

#[derive(Debug, Default)]
struct SeriesSelection {
    whole: bool,
    images: Vec<ImageSelection>,
}

impl SeriesSelection {
    fn add_image(&mut self, image: Identifier, frame: Option<u32>) {
        match self.images.iter_mut().find(|s| s.image == image) {
            Some(selection) => match frame {
                None => selection.frames = None,
                Some(index) => {
                    if let Some(frames) = selection.frames.as_mut() {
                        if !frames.contains(&index) {
                            frames.push(index);
                        }
                    }
                }
            },
            None => self.images.push(ImageSelection {
                image,
                frames: frame.map(|f| vec![f]),
            }),
        }
    }
}

fn selection_for<'a>(
    groups: &'a mut Vec<(Identifier, SeriesSelection)>,
    series: Identifier,
) -> &'a mut SeriesSelection {
    let position = match groups.iter().position(|(s, _)| *s == series) {
        Some(position) => position,
        None => {
            groups.push((series, SeriesSelection::default()));
            groups.len() - 1
        }
    };
    &mut groups[position].1
}

/// 进程内获取服务
pub struct LocalFetchService {
    device: Arc<StorageDevice>,
    remote: Arc<dyn RemotePixelSource>,
    remote_timeout: Duration,
}

impl LocalFetchService {
    pub fn new(
        device: Arc<StorageDevice>,
        remote: Arc<dyn RemotePixelSource>,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            device,
            remote,
            remote_timeout,
        }
    }

    pub fn from_config(device: Arc<StorageDevice>, config: &FetchConfig) -> Self {
        Self::new(
            device,
            Arc::new(WadoPixelSource::new(config.wado_base_url.clone())),
            config.remote_timeout(),
        )
    }

    fn series_of(identifier: &Identifier) -> Result<Identifier> {
        identifier
            .series_identifier()
            .ok_or_else(|| PacsError::Validation(format!("标识缺少序列: {}", identifier)))
    }

    /// 在一个只读快照中读出本次请求涉及的全部记录
    async fn plan(&self, identifiers: &[Identifier], skip_loading_frames: bool) -> Result<Vec<PlannedSeries>> {
        let mut snapshot = self.device.index().snapshot().await?;
        let planned = plan_in(&mut snapshot, identifiers, skip_loading_frames).await;
        snapshot.finish().await?;
        planned
    }

    /// 把计划解析为读取位置，计划中的文件已被后来的提交替换时返回 `None`
    async fn resolve(
        &self,
        plan: Vec<PlannedSeries>,
        loading_mode: LoadingMode,
    ) -> Result<Option<Vec<FetchInformation>>> {
        let mut results = Vec::with_capacity(plan.len());
        for planned in plan {
            let mut images = Vec::with_capacity(planned.images.len());
            for image in planned.images {
                match self.resolve_image(image, loading_mode).await? {
                    Some(info) => images.push(info),
                    None => return Ok(None),
                }
            }
            debug!("Resolved {} images for {}", images.len(), planned.series);
            results.push(FetchInformation {
                series: planned.series,
                images,
            });
        }
        Ok(Some(results))
    }

    async fn resolve_image(
        &self,
        planned: PlannedImage,
        loading_mode: LoadingMode,
    ) -> Result<Option<ImageFetchInformation>> {
        let PlannedImage { record, frames } = planned;
        let header_path = record.header_path.clone().ok_or_else(|| {
            PacsError::data_corrupt(format!("{} 缺少头部文件", record.identifier))
        })?;
        let Some(header_size) = file_size(&header_path).await? else {
            return Ok(None);
        };

        let mut pixels = Vec::new();
        let sources: Vec<(&Identifier, Option<&PixelLocation>)> = match &frames {
            Some(frames) => frames
                .iter()
                .map(|f| (&f.identifier, f.pixel_location.as_ref()))
                .collect(),
            None => vec![(&record.identifier, record.pixel_location.as_ref())],
        };
        for (identifier, location) in sources {
            let Some(location) = location else {
                continue;
            };
            match self.resolve_location(identifier, location, loading_mode).await? {
                Some(handle) => pixels.push(handle),
                None => return Ok(None),
            }
        }

        Ok(Some(ImageFetchInformation {
            identifier: record.identifier,
            entity_type: record.entity_type,
            header: PixelSpan::new(header_path, 0, header_size),
            pixels,
            translation_status: record.translation_status,
        }))
    }

    /// 把一个像素位置解析为本地可读句柄
    async fn resolve_location(
        &self,
        identifier: &Identifier,
        location: &PixelLocation,
        loading_mode: LoadingMode,
    ) -> Result<Option<PixelHandle>> {
        match location {
            PixelLocation::File {
                path,
                offset,
                length,
                ..
            } => {
                let Some(size) = file_size(path).await? else {
                    return Ok(None);
                };
                if offset.checked_add(*length).map_or(true, |end| end > size) {
                    return Err(PacsError::data_corrupt(format!(
                        "像素范围越过文件末尾: {:?} offset={} length={} file_size={}",
                        path, offset, length, size
                    )));
                }
                Ok(Some(PixelHandle::Local(PixelSpan::new(path.clone(), *offset, *length))))
            }
            PixelLocation::InMemory(info) => {
                let bytes = self.device.memory().read(info)?;
                let path = self.materialize(&bytes).await?;
                Ok(Some(PixelHandle::Local(PixelSpan::new(path, 0, bytes.len() as u64))))
            }
            PixelLocation::Remote(reference) => match loading_mode {
                LoadingMode::Lazy => Ok(Some(PixelHandle::Deferred(reference.clone()))),
                LoadingMode::Eager => self.download(identifier, reference).await.map(Some),
            },
        }
    }

    /// 下载远程像素到本地缓存，已缓存时直接使用
    async fn download(&self, identifier: &Identifier, reference: &RemoteReference) -> Result<PixelHandle> {
        let blob = self.device.blob();
        if blob.exists(Some(identifier), PIXEL_CACHE_BLOB).await? {
            debug!("Remote pixels for {} served from cache", identifier);
        } else {
            info!(
                "Downloading remote pixels for {} from {}",
                identifier,
                reference.describe()
            );
            let data = tokio::time::timeout(self.remote_timeout, self.remote.fetch_pixels(reference))
                .await
                .map_err(|_| {
                    PacsError::transport(format!(
                        "获取远程像素超时 ({:?}): {}",
                        self.remote_timeout,
                        reference.describe()
                    ))
                })??;
            blob.store(Some(identifier), PIXEL_CACHE_BLOB, data).await?;
        }

        match blob.local_path(Some(identifier), PIXEL_CACHE_BLOB) {
            Some(path) => {
                let length = tokio::fs::metadata(&path).await?.len();
                Ok(PixelHandle::Local(PixelSpan::new(path, 0, length)))
            }
            None => {
                let data = blob.fetch(Some(identifier), PIXEL_CACHE_BLOB).await?;
                let path = self.materialize(&data).await?;
                Ok(PixelHandle::Local(PixelSpan::new(path, 0, data.len() as u64)))
            }
        }
    }

    /// 写入设备的获取副本目录，设备关闭时统一删除
    async fn materialize(&self, data: &[u8]) -> Result<PathBuf> {
        let dir = self.device.fetch_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(unique_file_name("pixels", "pix"));
        tokio::fs::write(&path, data).await?;
        Ok(path)
    }
}

#[async_trait]
impl FetchService for LocalFetchService {
    async fn fetch_as_stream(
        &self,
        identifiers: &[Identifier],
        loading_mode: LoadingMode,
        skip_loading_frames: bool,
    ) -> Result<Vec<FetchInformation>> {
        info!(
            "FetchAsStream: {} identifiers, mode {:?}, skip frames {}",
            identifiers.len(),
            loading_mode,
            skip_loading_frames
        );
        for attempt in 1..=RESOLVE_ATTEMPTS {
            let plan = self.plan(identifiers, skip_loading_frames).await?;
            if let Some(results) = self.resolve(plan, loading_mode).await? {
                return Ok(results);
            }
            debug!("Files superseded during fetch, re-reading index (attempt {})", attempt);
        }
        Err(PacsError::data_corrupt(format!(
            "索引引用的文件不存在，已重试 {} 次",
            RESOLVE_ATTEMPTS
        )))
    }
}

/// 快照中读出的一张影像
#[derive(Debug)]
struct PlannedImage {
    record: EntityRecord,
    /// 多帧影像被选中的帧；`None` 表示使用影像自身的像素位置
    frames: Option<Vec<EntityRecord>>,
}

#[derive(Debug)]
struct PlannedSeries {
    series: Identifier,
    images: Vec<PlannedImage>,
}

async fn require(snapshot: &mut IndexSnapshot, identifier: &Identifier) -> Result<EntityRecord> {
    snapshot
        .get(identifier)
        .await?
        .ok_or_else(|| PacsError::NotFound(format!("实体不存在: {}", identifier)))
}

async fn plan_in(
    snapshot: &mut IndexSnapshot,
    identifiers: &[Identifier],
    skip_loading_frames: bool,
) -> Result<Vec<PlannedSeries>> {
    let mut groups: Vec<(Identifier, SeriesSelection)> = Vec::new();
    for identifier in identifiers {
        require(snapshot, identifier).await?;
        match identifier.level() {
            Level::Study | Level::Patient => {
                for series in snapshot.series_in_study(identifier.study_uid()).await? {
                    selection_for(&mut groups, series.identifier).whole = true;
                }
            }
            Level::Series => selection_for(&mut groups, identifier.clone()).whole = true,
            Level::Image => {
                selection_for(&mut groups, LocalFetchService::series_of(identifier)?)
                    .add_image(identifier.clone(), None);
            }
            Level::Frame => {
                let image = identifier.parent().ok_or_else(|| {
                    PacsError::Validation(format!("帧标识缺少影像: {}", identifier))
                })?;
                selection_for(&mut groups, LocalFetchService::series_of(identifier)?)
                    .add_image(image, identifier.frame_index());
            }
        }
    }

    let mut plan = Vec::with_capacity(groups.len());
    for (series, selection) in groups {
        let wanted: Vec<(EntityRecord, Option<Vec<u32>>)> = if selection.whole {
            snapshot
                .images_in_series(&series)
                .await?
                .into_iter()
                .map(|record| (record, None))
                .collect()
        } else {
            let mut records = Vec::with_capacity(selection.images.len());
            for image in selection.images {
                records.push((require(snapshot, &image.image).await?, image.frames));
            }
            records
        };

        let mut images = Vec::with_capacity(wanted.len());
        for (record, frame_filter) in wanted {
            let frames = if skip_loading_frames {
                Some(Vec::new())
            } else if record.entity_type == EntityType::MFImage {
                let frame_records = snapshot.frames_of(&record.identifier).await?;
                if frame_records.is_empty() {
                    None
                } else {
                    Some(
                        frame_records
                            .into_iter()
                            .filter(|frame| match (&frame_filter, frame.identifier.frame_index()) {
                                (Some(filter), Some(index)) => filter.contains(&index),
                                _ => true,
                            })
                            .collect(),
                    )
                }
            } else {
                None
            };
            images.push(PlannedImage { record, frames });
        }
        plan.push(PlannedSeries { series, images });
    }
    Ok(plan)
}

/// 文件不存在时返回 `None`
async fn file_size(path: &Path) -> Result<Option<u64>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta.len())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(PacsError::data_corrupt(format!("无法访问文件 {:?}: {}", path, e))),
    }
}
