//! 시장 데이터 도메인 모델.

mod directory;
mod market_data;

pub use directory::*;
pub use market_data::*;
