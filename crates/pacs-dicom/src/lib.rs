//! # DICOM复合对象模块
//!
//! 复合对象读取、像素数据精确定位、头部写入与验证，以及像素转换策略。

pub mod locator;
pub mod parser;
pub mod transfer_syntax;
pub mod translation;
pub mod validator;
pub mod writer;

pub use locator::{locate_in_reader, locate_pixel_data, LocatedComposite, PixelDataElement};
pub use parser::{CompositeObject, DicomParser};
pub use transfer_syntax::TransferSyntaxManager;
pub use translation::TranslationPolicy;
pub use validator::{DicomValidator, ValidationResult};
pub use writer::{write_composite, write_header};
