//! # PACS Core
//!
//! 存储会话层的核心模块：错误分类、实体标识、属性包与像素位置模型。

pub mod attributes;
pub mod error;
pub mod fetch;
pub mod models;
pub mod pixel;
pub mod utils;

pub use attributes::{tags, Attributes, DicomTag};
pub use error::{ErrorBody, ErrorKind, PacsError, Result};
pub use fetch::*;
pub use models::*;
pub use pixel::*;
