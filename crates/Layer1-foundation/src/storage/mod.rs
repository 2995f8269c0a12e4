//! Storage module for labterm
//!
//! - `store`: TOML/JSON 설정 파일 저장/로드

mod store;

pub use store::{load_path, FileFormat, FileStore};
