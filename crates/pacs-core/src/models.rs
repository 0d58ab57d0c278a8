//! 核心数据模型定义
//!
//! 实体层级: Study → Series → Image → Frame

use crate::attributes::{tags, Attributes};
use crate::error::{PacsError, Result};
use crate::utils::is_valid_dicom_uid;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 属性目录的层级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Patient,
    Study,
    Series,
    Image,
    Frame,
}

impl Level {
    pub const ALL: [Level; 5] = [
        Level::Patient,
        Level::Study,
        Level::Series,
        Level::Image,
        Level::Frame,
    ];
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Level::Patient => "patient",
            Level::Study => "study",
            Level::Series => "series",
            Level::Image => "image",
            Level::Frame => "frame",
        };
        f.write_str(name)
    }
}

/// 实体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    None,
    Study,
    Series,
    /// 单帧影像
    SFImage,
    /// 多帧影像
    MFImage,
    /// 非影像叶子对象（结构化报告、文档等）
    Leaf,
    Frame,
    Unknown,
}

impl EntityType {
    /// 实体所在的层级，`None`/`Unknown` 没有层级
    pub fn level(&self) -> Option<Level> {
        match self {
            EntityType::Study => Some(Level::Study),
            EntityType::Series => Some(Level::Series),
            EntityType::SFImage | EntityType::MFImage | EntityType::Leaf => Some(Level::Image),
            EntityType::Frame => Some(Level::Frame),
            EntityType::None | EntityType::Unknown => None,
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(
            self,
            EntityType::SFImage | EntityType::MFImage | EntityType::Leaf
        )
    }

    /// 父实体必须满足的类型约束
    pub fn accepts_parent(&self, parent: EntityType) -> bool {
        match self {
            EntityType::Study => parent == EntityType::None,
            EntityType::Series => parent == EntityType::Study,
            EntityType::SFImage | EntityType::MFImage | EntityType::Leaf => {
                parent == EntityType::Series
            }
            EntityType::Frame => parent == EntityType::MFImage,
            EntityType::None | EntityType::Unknown => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::None => "NONE",
            EntityType::Study => "STUDY",
            EntityType::Series => "SERIES",
            EntityType::SFImage => "SF_IMAGE",
            EntityType::MFImage => "MF_IMAGE",
            EntityType::Leaf => "LEAF",
            EntityType::Frame => "FRAME",
            EntityType::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> EntityType {
        match s {
            "NONE" => EntityType::None,
            "STUDY" => EntityType::Study,
            "SERIES" => EntityType::Series,
            "SF_IMAGE" => EntityType::SFImage,
            "MF_IMAGE" => EntityType::MFImage,
            "LEAF" => EntityType::Leaf,
            "FRAME" => EntityType::Frame,
            _ => EntityType::Unknown,
        }
    }
}

/// 归档内实体的不可变标识
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier {
    study_uid: String,
    series_uid: Option<String>,
    sop_instance_uid: Option<String>,
    frame_index: Option<u32>,
}

impl Identifier {
    pub fn study(study_uid: impl Into<String>) -> Self {
        Self {
            study_uid: study_uid.into(),
            series_uid: None,
            sop_instance_uid: None,
            frame_index: None,
        }
    }

    pub fn series(study_uid: impl Into<String>, series_uid: impl Into<String>) -> Self {
        Self {
            series_uid: Some(series_uid.into()),
            ..Self::study(study_uid)
        }
    }

    pub fn image(
        study_uid: impl Into<String>,
        series_uid: impl Into<String>,
        sop_instance_uid: impl Into<String>,
    ) -> Self {
        Self {
            sop_instance_uid: Some(sop_instance_uid.into()),
            ..Self::series(study_uid, series_uid)
        }
    }

    /// 帧序号从0开始
    pub fn frame(&self, frame_index: u32) -> Result<Self> {
        if self.level() != Level::Image {
            return Err(PacsError::Validation(format!(
                "只有影像标识可以派生帧标识: {}",
                self
            )));
        }
        Ok(Self {
            frame_index: Some(frame_index),
            ..self.clone()
        })
    }

    /// 从属性中提取给定层级的标识
    ///
    /// 每个UID都必须符合 DICOM 语法，之后才会被用作暂存或归档文件名的一部分。
    pub fn from_attributes(level: Level, attrs: &Attributes) -> Result<Self> {
        let require = |tag, name: &str| {
            let uid = attrs
                .get_trimmed(tag)
                .ok_or_else(|| PacsError::Validation(format!("缺少 {}", name)))?;
            if !is_valid_dicom_uid(uid) {
                return Err(PacsError::Validation(format!("{} 不是有效的UID: {:?}", name, uid)));
            }
            Ok(uid.to_string())
        };
        let study = require(tags::STUDY_INSTANCE_UID, "Study Instance UID")?;
        match level {
            Level::Study => Ok(Self::study(study)),
            Level::Series => Ok(Self::series(
                study,
                require(tags::SERIES_INSTANCE_UID, "Series Instance UID")?,
            )),
            Level::Image => Ok(Self::image(
                study,
                require(tags::SERIES_INSTANCE_UID, "Series Instance UID")?,
                require(tags::SOP_INSTANCE_UID, "SOP Instance UID")?,
            )),
            Level::Patient | Level::Frame => Err(PacsError::Validation(format!(
                "无法从属性推导 {} 层级标识",
                level
            ))),
        }
    }

    pub fn study_uid(&self) -> &str {
        &self.study_uid
    }

    pub fn series_uid(&self) -> Option<&str> {
        self.series_uid.as_deref()
    }

    pub fn sop_instance_uid(&self) -> Option<&str> {
        self.sop_instance_uid.as_deref()
    }

    pub fn frame_index(&self) -> Option<u32> {
        self.frame_index
    }

    pub fn level(&self) -> Level {
        match (&self.series_uid, &self.sop_instance_uid, self.frame_index) {
            (None, _, _) => Level::Study,
            (Some(_), None, _) => Level::Series,
            (Some(_), Some(_), None) => Level::Image,
            (Some(_), Some(_), Some(_)) => Level::Frame,
        }
    }

    pub fn parent(&self) -> Option<Identifier> {
        let mut parent = self.clone();
        match self.level() {
            Level::Frame => parent.frame_index = None,
            Level::Image => parent.sop_instance_uid = None,
            Level::Series => parent.series_uid = None,
            Level::Study | Level::Patient => return None,
        }
        Some(parent)
    }

    pub fn study_identifier(&self) -> Identifier {
        Identifier::study(self.study_uid.clone())
    }

    /// 所属序列标识，检查级标识没有序列
    pub fn series_identifier(&self) -> Option<Identifier> {
        self.series_uid
            .as_ref()
            .map(|s| Identifier::series(self.study_uid.clone(), s.clone()))
    }

    /// 索引主键 `study/series/sop/frame`
    pub fn key(&self) -> String {
        let mut key = self.study_uid.clone();
        if let Some(series) = &self.series_uid {
            key.push('/');
            key.push_str(series);
        }
        if let Some(sop) = &self.sop_instance_uid {
            key.push('/');
            key.push_str(sop);
        }
        if let Some(frame) = self.frame_index {
            key.push('/');
            key.push_str(&frame.to_string());
        }
        key
    }

    pub fn from_key(key: &str) -> Result<Self> {
        let parts: Vec<&str> = key.split('/').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(PacsError::Validation(format!("无效的实体键: {}", key)));
        }
        match parts.as_slice() {
            [study] => Ok(Self::study(*study)),
            [study, series] => Ok(Self::series(*study, *series)),
            [study, series, sop] => Ok(Self::image(*study, *series, *sop)),
            [study, series, sop, frame] => {
                let index = frame
                    .parse::<u32>()
                    .map_err(|_| PacsError::Validation(format!("无效的帧序号: {}", key)))?;
                Self::image(*study, *series, *sop).frame(index)
            }
            _ => Err(PacsError::Validation(format!("无效的实体键: {}", key))),
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.level(), self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_hierarchy() {
        let image = Identifier::image("1.2.3", "1.2.3.4", "1.2.3.4.5");
        assert_eq!(image.level(), Level::Image);
        let frame = image.frame(2).unwrap();
        assert_eq!(frame.level(), Level::Frame);
        assert_eq!(frame.parent().unwrap(), image);
        assert_eq!(
            image.parent().unwrap(),
            Identifier::series("1.2.3", "1.2.3.4")
        );
        assert_eq!(
            frame.series_identifier().unwrap(),
            Identifier::series("1.2.3", "1.2.3.4")
        );
        assert!(Identifier::study("1.2.3").parent().is_none());
        assert!(Identifier::study("1.2.3").frame(0).is_err());
    }

    #[test]
    fn test_identifier_key_round_trip() {
        let frame = Identifier::image("1.2", "1.2.3", "1.2.3.4").frame(7).unwrap();
        assert_eq!(frame.key(), "1.2/1.2.3/1.2.3.4/7");
        assert_eq!(Identifier::from_key(&frame.key()).unwrap(), frame);
        assert!(Identifier::from_key("1.2//3").is_err());
        assert!(Identifier::from_key("1/2/3/x").is_err());
    }

    #[test]
    fn test_identifier_from_attributes() {
        let attrs = Attributes::new()
            .with(tags::STUDY_INSTANCE_UID, "1.2")
            .with(tags::SERIES_INSTANCE_UID, "1.2.3");
        let series = Identifier::from_attributes(Level::Series, &attrs).unwrap();
        assert_eq!(series, Identifier::series("1.2", "1.2.3"));
        assert!(Identifier::from_attributes(Level::Image, &attrs).is_err());
    }

    #[test]
    fn test_identifier_from_attributes_rejects_path_like_uid() {
        let attrs = Attributes::new()
            .with(tags::STUDY_INSTANCE_UID, "1.2")
            .with(tags::SERIES_INSTANCE_UID, "1.2.3")
            .with(tags::SOP_INSTANCE_UID, "../../escaped/owned");
        assert!(matches!(
            Identifier::from_attributes(Level::Image, &attrs),
            Err(PacsError::Validation(_))
        ));

        let attrs = attrs.with(tags::SOP_INSTANCE_UID, "1.2.3.4").with(tags::STUDY_INSTANCE_UID, "1.2/3");
        assert!(Identifier::from_attributes(Level::Study, &attrs).is_err());
    }

    #[test]
    fn test_entity_parent_rules() {
        assert!(EntityType::Frame.accepts_parent(EntityType::MFImage));
        assert!(!EntityType::Frame.accepts_parent(EntityType::SFImage));
        assert!(EntityType::SFImage.accepts_parent(EntityType::Series));
        assert_eq!(EntityType::parse(EntityType::MFImage.as_str()), EntityType::MFImage);
        assert_eq!(EntityType::Leaf.level(), Some(Level::Image));
        assert_eq!(EntityType::Unknown.level(), None);
    }
}
