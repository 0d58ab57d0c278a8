//! 像素数据元素定位
//!
//! 用 dicom-rs 的有状态解码器逐个跳过顶层数据元素，找到 (7FE0,0010) 的值在文件中的
//! 精确偏移与长度，不读取像素内容。嵌套序列中的图标像素不会被误认。

use crate::transfer_syntax::TransferSyntaxManager;
use dicom::core::header::{DataElementHeader, SequenceItemHeader};
use dicom::core::Tag;
use dicom::object::FileMetaTable;
use dicom_encoding::text::SpecificCharacterSet;
use dicom_parser::{StatefulDecode, StatefulDecoder};
use pacs_core::{PacsError, Result};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::debug;

const PREAMBLE_LEN: u64 = 128;
/// 魔数之后的 (0002,0000) 组长度元素
const GROUP_LENGTH_ELEMENT_LEN: u64 = 12;
/// 显式VR长格式元素头的长度，也是任何元素头的上限
const MAX_HEADER_LEN: u64 = 12;

const ITEM_DELIMITATION: Tag = Tag(0xFFFE, 0xE00D);
const PIXEL_DATA: Tag = Tag(0x7FE0, 0x0010);

/// 像素数据元素的值在文件中的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelDataElement {
    pub offset: u64,
    pub length: u64,
    /// 封装像素：范围覆盖全部片段（含条目头），不含序列结束符
    pub encapsulated: bool,
}

/// 定位结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedComposite {
    pub transfer_syntax_uid: String,
    pub pixel: Option<PixelDataElement>,
    pub file_size: u64,
}

/// 在 Part 10 文件中定位像素数据，只读取像素之前的字节
pub fn locate_pixel_data(path: &Path) -> Result<LocatedComposite> {
    let file = File::open(path)?;
    let file_size = file.metadata()?.len();
    locate_in_reader(BufReader::new(file), file_size, &path.display().to_string())
}

/// 在任意顺序读取源上定位像素数据，`file_size` 为源的总长度
pub fn locate_in_reader<R: Read>(mut reader: R, file_size: u64, source: &str) -> Result<LocatedComposite> {
    if file_size < PREAMBLE_LEN + 4 {
        return Err(PacsError::TruncatedSource {
            path: source.to_string(),
            declared: PREAMBLE_LEN + 4,
            actual: file_size,
        });
    }
    let mut preamble = [0u8; PREAMBLE_LEN as usize];
    reader.read_exact(&mut preamble)?;

    let meta = FileMetaTable::from_reader(&mut reader)
        .map_err(|e| PacsError::data_corrupt(format!("{} 不是有效的DICOM Part 10文件: {}", source, e)))?;
    let transfer_syntax_uid = meta.transfer_syntax().to_string();
    let dataset_start =
        PREAMBLE_LEN + 4 + GROUP_LENGTH_ELEMENT_LEN + u64::from(meta.information_group_length);

    let ts = TransferSyntaxManager::new().lookup(&transfer_syntax_uid)?;
    let decoder = StatefulDecoder::new_with(reader, ts, SpecificCharacterSet::default(), dataset_start)
        .map_err(|e| PacsError::data_corrupt(format!("{} 无法解码传输语法 {}: {}", source, ts.name(), e)))?;

    let mut walker = ElementWalker {
        decoder,
        file_size,
        source,
    };
    let pixel = walker.find_pixel_data()?;
    if let Some(pixel) = &pixel {
        debug!(
            "Located pixel data in {}: offset={} length={}",
            source, pixel.offset, pixel.length
        );
    }
    Ok(LocatedComposite {
        transfer_syntax_uid,
        pixel,
        file_size,
    })
}

struct ElementWalker<'a, D> {
    decoder: D,
    file_size: u64,
    source: &'a str,
}

impl<'a, D: StatefulDecode> ElementWalker<'a, D> {
    fn truncated(&self, declared: u64) -> PacsError {
        PacsError::TruncatedSource {
            path: self.source.to_string(),
            declared,
            actual: self.file_size,
        }
    }

    fn remaining(&self) -> u64 {
        self.file_size.saturating_sub(self.decoder.position())
    }

    fn header(&mut self) -> Result<DataElementHeader> {
        let position = self.decoder.position();
        self.decoder.decode_header().map_err(|e| {
            if self.remaining() < MAX_HEADER_LEN {
                self.truncated(position + MAX_HEADER_LEN)
            } else {
                PacsError::data_corrupt(format!("{} 在偏移 {} 处元素头无效: {}", self.source, position, e))
            }
        })
    }

    fn item_header(&mut self) -> Result<SequenceItemHeader> {
        let position = self.decoder.position();
        if self.remaining() < 8 {
            return Err(self.truncated(position + 8));
        }
        self.decoder.decode_item_header().map_err(|e| {
            PacsError::data_corrupt(format!("{} 在偏移 {} 处条目头无效: {}", self.source, position, e))
        })
    }

    /// 跳过定长的值，越过文件末尾时报告截断
    fn skip(&mut self, length: u32) -> Result<()> {
        let declared = self.decoder.position() + u64::from(length);
        if declared > self.file_size {
            return Err(self.truncated(declared));
        }
        self.decoder
            .skip_bytes(length)
            .map_err(|e| PacsError::data_corrupt(format!("{} 读取失败: {}", self.source, e)))
    }

    /// 未定义长度的值只可能是序列（包括隐式VR或UN包裹的序列）
    fn skip_value(&mut self, header: &DataElementHeader) -> Result<()> {
        match header.len.get() {
            Some(length) => self.skip(length),
            None => self.skip_sequence(),
        }
    }

    fn skip_sequence(&mut self) -> Result<()> {
        loop {
            match self.item_header()? {
                SequenceItemHeader::SequenceDelimiter => return Ok(()),
                SequenceItemHeader::Item { len } => match len.get() {
                    Some(length) => self.skip(length)?,
                    None => self.skip_item_dataset()?,
                },
                SequenceItemHeader::ItemDelimiter => {
                    return Err(PacsError::data_corrupt(format!(
                        "{} 的序列中出现多余的条目结束符",
                        self.source
                    )))
                }
            }
        }
    }

    fn skip_item_dataset(&mut self) -> Result<()> {
        loop {
            let header = self.header()?;
            if header.tag == ITEM_DELIMITATION {
                return Ok(());
            }
            self.skip_value(&header)?;
        }
    }

    /// 封装像素：返回片段区结束位置（序列结束符之前）
    fn skip_fragments(&mut self) -> Result<u64> {
        loop {
            let start = self.decoder.position();
            match self.item_header()? {
                SequenceItemHeader::SequenceDelimiter => return Ok(start),
                SequenceItemHeader::Item { len } => match len.get() {
                    Some(length) => self.skip(length)?,
                    None => {
                        return Err(PacsError::data_corrupt(format!(
                            "{} 的像素片段长度未定义",
                            self.source
                        )))
                    }
                },
                SequenceItemHeader::ItemDelimiter => {
                    return Err(PacsError::data_corrupt(format!(
                        "{} 的封装像素中出现条目结束符",
                        self.source
                    )))
                }
            }
        }
    }

    fn find_pixel_data(&mut self) -> Result<Option<PixelDataElement>> {
        while self.remaining() > 0 {
            let header = self.header()?;
            if header.tag != PIXEL_DATA {
                self.skip_value(&header)?;
                continue;
            }

            let offset = self.decoder.position();
            return Ok(Some(match header.len.get() {
                Some(length) => {
                    let declared = offset + u64::from(length);
                    if declared > self.file_size {
                        return Err(self.truncated(declared));
                    }
                    PixelDataElement {
                        offset,
                        length: u64::from(length),
                        encapsulated: false,
                    }
                }
                None => {
                    let end = self.skip_fragments()?;
                    PixelDataElement {
                        offset,
                        length: end - offset,
                        encapsulated: true,
                    }
                }
            }));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer_syntax::transfer_syntax_uids;
    use dicom::core::value::{DataSetSequence, PixelFragmentSequence, Value};
    use dicom::core::{DataElement, Length, PrimitiveValue, VR};
    use dicom::object::{FileMetaTableBuilder, InMemDicomObject};

    fn patient() -> DataElement<InMemDicomObject> {
        DataElement::new(Tag(0x0010, 0x0020), VR::LO, PrimitiveValue::from("P001"))
    }

    fn native_pixels(bytes: &[u8]) -> DataElement<InMemDicomObject> {
        DataElement::new(PIXEL_DATA, VR::OB, PrimitiveValue::from(bytes.to_vec()))
    }

    fn write(dir: &Path, name: &str, ts: &str, elements: Vec<DataElement<InMemDicomObject>>) -> std::path::PathBuf {
        let path = dir.join(name);
        InMemDicomObject::from_element_iter(elements)
            .with_meta(
                FileMetaTableBuilder::new()
                    .transfer_syntax(ts)
                    .media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.7")
                    .media_storage_sop_instance_uid("1.2.3.4.5"),
            )
            .unwrap()
            .write_to_file(&path)
            .unwrap();
        path
    }

    fn value_at(path: &Path, pixel: &PixelDataElement) -> Vec<u8> {
        let data = std::fs::read(path).unwrap();
        data[pixel.offset as usize..(pixel.offset + pixel.length) as usize].to_vec()
    }

    #[test]
    fn test_explicit_little_endian_pixel_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "ele.dcm",
            transfer_syntax_uids::EXPLICIT_VR_LITTLE_ENDIAN,
            vec![patient(), native_pixels(&[1, 2, 3, 4, 5, 6])],
        );
        let located = locate_pixel_data(&path).unwrap();
        assert_eq!(located.transfer_syntax_uid, transfer_syntax_uids::EXPLICIT_VR_LITTLE_ENDIAN);
        let pixel = located.pixel.unwrap();
        assert_eq!(pixel.length, 6);
        assert_eq!(pixel.offset, located.file_size - 6);
        assert!(!pixel.encapsulated);
        assert_eq!(value_at(&path, &pixel), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_implicit_vr_and_big_endian() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "ile.dcm",
            transfer_syntax_uids::IMPLICIT_VR_LITTLE_ENDIAN,
            vec![patient(), native_pixels(&[9, 9])],
        );
        let pixel = locate_pixel_data(&path).unwrap().pixel.unwrap();
        assert_eq!(value_at(&path, &pixel), vec![9, 9]);

        let path = write(
            dir.path(),
            "ebe.dcm",
            transfer_syntax_uids::EXPLICIT_VR_BIG_ENDIAN,
            vec![patient(), native_pixels(&[7, 7, 7, 7])],
        );
        let pixel = locate_pixel_data(&path).unwrap().pixel.unwrap();
        assert_eq!(pixel.length, 4);
        assert_eq!(value_at(&path, &pixel), vec![7, 7, 7, 7]);
    }

    #[test]
    fn test_nested_icon_pixel_data_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let icon = InMemDicomObject::from_element_iter([native_pixels(&[0xAA, 0xAA])]);
        let icon_sequence = DataElement::new(
            Tag(0x0088, 0x0200),
            VR::SQ,
            Value::from(DataSetSequence::new(vec![icon], Length::UNDEFINED)),
        );
        let path = write(
            dir.path(),
            "icon.dcm",
            transfer_syntax_uids::EXPLICIT_VR_LITTLE_ENDIAN,
            vec![icon_sequence, native_pixels(&[1, 2, 3, 4])],
        );
        let pixel = locate_pixel_data(&path).unwrap().pixel.unwrap();
        assert_eq!(pixel.length, 4);
        assert_eq!(value_at(&path, &pixel), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_encapsulated_fragments() {
        let dir = tempfile::tempdir().unwrap();
        let fragments = DataElement::new(
            PIXEL_DATA,
            VR::OB,
            Value::from(PixelFragmentSequence::new(
                Vec::<u32>::new(),
                vec![vec![0xFF, 0xD8, 0xFF, 0xD9]],
            )),
        );
        let path = write(
            dir.path(),
            "jpeg.dcm",
            transfer_syntax_uids::JPEG_BASELINE,
            vec![patient(), fragments],
        );
        let located = locate_pixel_data(&path).unwrap();
        let pixel = located.pixel.unwrap();
        assert!(pixel.encapsulated);
        // 空偏移表条目 + 一个片段条目，其后只剩 8 字节的序列结束符
        assert_eq!(pixel.length, 8 + 8 + 4);
        assert_eq!(pixel.offset + pixel.length + 8, located.file_size);
        assert_eq!(&value_at(&path, &pixel)[16..], &[0xFF, 0xD8, 0xFF, 0xD9]);
    }

    #[test]
    fn test_truncated_pixel_value_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "cut.dcm",
            transfer_syntax_uids::EXPLICIT_VR_LITTLE_ENDIAN,
            vec![native_pixels(&[1, 2, 3, 4, 5, 6, 7, 8])],
        );
        let data = std::fs::read(&path).unwrap();
        let cut = data.len() as u64 - 3;
        std::fs::write(&path, &data[..cut as usize]).unwrap();

        match locate_pixel_data(&path) {
            Err(PacsError::TruncatedSource {
                declared, actual, ..
            }) => {
                assert_eq!(actual, cut);
                assert_eq!(declared, cut + 3);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_missing_magic_is_data_corrupt() {
        let bytes = vec![0u8; 200];
        assert!(matches!(
            locate_in_reader(bytes.as_slice(), bytes.len() as u64, "x"),
            Err(PacsError::DataCorrupt(_))
        ));
    }

    #[test]
    fn test_short_file_is_truncated() {
        let bytes = vec![0u8; 64];
        assert!(matches!(
            locate_in_reader(bytes.as_slice(), bytes.len() as u64, "short"),
            Err(PacsError::TruncatedSource { declared: 132, actual: 64, .. })
        ));
    }

    #[test]
    fn test_no_pixel_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "sr.dcm",
            transfer_syntax_uids::EXPLICIT_VR_LITTLE_ENDIAN,
            vec![patient()],
        );
        assert!(locate_pixel_data(&path).unwrap().pixel.is_none());
    }
}
