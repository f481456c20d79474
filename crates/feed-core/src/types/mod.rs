//! 데이터 키와 캐시 정책.

mod data_key;
mod policy;

pub use data_key::*;
pub use policy::*;
