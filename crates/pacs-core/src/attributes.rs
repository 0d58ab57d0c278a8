//! DICOM属性集合
//!
//! 存储会话只把DICOM头看作以标签为键的属性包，不关心标签语义。

use crate::error::{PacsError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// DICOM标签 (group, element)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DicomTag(pub u16, pub u16);

impl DicomTag {
    pub const fn new(group: u16, element: u16) -> Self {
        Self(group, element)
    }

    pub fn group(&self) -> u16 {
        self.0
    }

    pub fn element(&self) -> u16 {
        self.1
    }
}

impl fmt::Display for DicomTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:04X},{:04X})", self.0, self.1)
    }
}

impl FromStr for DicomTag {
    type Err = PacsError;

    /// 支持 `(gggg,eeee)`、`gggg,eeee` 与 `ggggeeee` 三种写法
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim().trim_start_matches('(').trim_end_matches(')');
        let (group, element) = match trimmed.split_once(',') {
            Some((g, e)) => (g.trim(), e.trim()),
            None if trimmed.len() == 8 => trimmed.split_at(4),
            None => return Err(PacsError::Validation(format!("无效的DICOM标签: {}", s))),
        };
        if group.len() != 4 || element.len() != 4 {
            return Err(PacsError::Validation(format!("无效的DICOM标签: {}", s)));
        }
        let group = u16::from_str_radix(group, 16)
            .map_err(|_| PacsError::Validation(format!("无效的DICOM标签组: {}", s)))?;
        let element = u16::from_str_radix(element, 16)
            .map_err(|_| PacsError::Validation(format!("无效的DICOM标签元素: {}", s)))?;
        Ok(DicomTag(group, element))
    }
}

impl Serialize for DicomTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DicomTag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// 常用标签
pub mod tags {
    use super::DicomTag;

    pub const TRANSFER_SYNTAX_UID: DicomTag = DicomTag(0x0002, 0x0010);
    pub const SOP_CLASS_UID: DicomTag = DicomTag(0x0008, 0x0016);
    pub const SOP_INSTANCE_UID: DicomTag = DicomTag(0x0008, 0x0018);
    pub const STUDY_DATE: DicomTag = DicomTag(0x0008, 0x0020);
    pub const ACCESSION_NUMBER: DicomTag = DicomTag(0x0008, 0x0050);
    pub const MODALITY: DicomTag = DicomTag(0x0008, 0x0060);
    pub const STUDY_DESCRIPTION: DicomTag = DicomTag(0x0008, 0x1030);
    pub const PATIENT_NAME: DicomTag = DicomTag(0x0010, 0x0010);
    pub const PATIENT_ID: DicomTag = DicomTag(0x0010, 0x0020);
    pub const STUDY_INSTANCE_UID: DicomTag = DicomTag(0x0020, 0x000D);
    pub const SERIES_INSTANCE_UID: DicomTag = DicomTag(0x0020, 0x000E);
    pub const SERIES_NUMBER: DicomTag = DicomTag(0x0020, 0x0011);
    pub const INSTANCE_NUMBER: DicomTag = DicomTag(0x0020, 0x0013);
    pub const NUMBER_OF_FRAMES: DicomTag = DicomTag(0x0028, 0x0008);
    pub const ROWS: DicomTag = DicomTag(0x0028, 0x0010);
    pub const COLUMNS: DicomTag = DicomTag(0x0028, 0x0011);
    pub const BITS_ALLOCATED: DicomTag = DicomTag(0x0028, 0x0100);
    pub const PIXEL_REPRESENTATION: DicomTag = DicomTag(0x0028, 0x0103);
    pub const PIXEL_DATA: DicomTag = DicomTag(0x7FE0, 0x0010);
}

/// 以标签为键的DICOM属性包，值统一按DICOM文本形式保存
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes {
    values: BTreeMap<DicomTag, String>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tag: DicomTag) -> Option<&str> {
        self.values.get(&tag).map(String::as_str)
    }

    /// 获取去除首尾空白与填充字符后的非空值
    pub fn get_trimmed(&self, tag: DicomTag) -> Option<&str> {
        self.get(tag)
            .map(|v| v.trim_matches(|c: char| c.is_whitespace() || c == '\0'))
            .filter(|v| !v.is_empty())
    }

    pub fn set(&mut self, tag: DicomTag, value: impl Into<String>) {
        self.values.insert(tag, value.into());
    }

    pub fn with(mut self, tag: DicomTag, value: impl Into<String>) -> Self {
        self.set(tag, value);
        self
    }

    pub fn remove(&mut self, tag: DicomTag) -> Option<String> {
        self.values.remove(&tag)
    }

    pub fn contains(&self, tag: DicomTag) -> bool {
        self.values.contains_key(&tag)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DicomTag, &str)> {
        self.values.iter().map(|(t, v)| (*t, v.as_str()))
    }

    /// 用 `other` 中的值覆盖当前值
    pub fn merge(&mut self, other: &Attributes) {
        for (tag, value) in other.iter() {
            self.set(tag, value);
        }
    }

    /// 只保留给定标签的子集，缺失的标签直接跳过
    pub fn subset(&self, tags: &[DicomTag]) -> Attributes {
        let mut out = Attributes::new();
        for tag in tags {
            if let Some(v) = self.get(*tag) {
                out.set(*tag, v);
            }
        }
        out
    }
}

impl FromIterator<(DicomTag, String)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (DicomTag, String)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_parse_formats() {
        let expected = DicomTag(0x0010, 0x0020);
        assert_eq!("(0010,0020)".parse::<DicomTag>().unwrap(), expected);
        assert_eq!("0010,0020".parse::<DicomTag>().unwrap(), expected);
        assert_eq!("00100020".parse::<DicomTag>().unwrap(), expected);
        assert_eq!("7fe0,0010".parse::<DicomTag>().unwrap(), tags::PIXEL_DATA);
        assert!("0010".parse::<DicomTag>().is_err());
        assert!("zz10,0020".parse::<DicomTag>().is_err());
        assert_eq!(expected.to_string(), "(0010,0020)");
    }

    #[test]
    fn test_attributes_json_uses_tag_strings() {
        let attrs = Attributes::new().with(tags::PATIENT_ID, "P001");
        let json = serde_json::to_string(&attrs).unwrap();
        assert_eq!(json, r#"{"(0010,0020)":"P001"}"#);
        let back: Attributes = serde_json::from_str(&json).unwrap();
        assert_eq!(back, attrs);
    }

    #[test]
    fn test_merge_and_subset() {
        let mut base = Attributes::new()
            .with(tags::PATIENT_ID, "P001")
            .with(tags::MODALITY, "CT");
        base.merge(&Attributes::new().with(tags::MODALITY, "MR"));
        assert_eq!(base.get(tags::MODALITY), Some("MR"));

        let sub = base.subset(&[tags::MODALITY, tags::STUDY_DATE]);
        assert_eq!(sub.len(), 1);
        assert_eq!(sub.get(tags::MODALITY), Some("MR"));
    }

    #[test]
    fn test_get_trimmed_strips_padding() {
        let attrs = Attributes::new().with(tags::SOP_INSTANCE_UID, "1.2.3\0");
        assert_eq!(attrs.get_trimmed(tags::SOP_INSTANCE_UID), Some("1.2.3"));
        let blank = Attributes::new().with(tags::PATIENT_ID, "  ");
        assert_eq!(blank.get_trimmed(tags::PATIENT_ID), None);
    }
}
