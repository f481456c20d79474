//! CLI 명령어 구현 모듈.

pub mod query;
pub mod stream;

use serde::Serialize;

/// 결과를 JSON으로 출력합니다.
pub fn print_json<T: Serialize + ?Sized>(value: &T, compact: bool) -> anyhow::Result<()> {
    let text = if compact {
        serde_json::to_string(value)?
    } else {
        serde_json::to_string_pretty(value)?
    };
    println!("{}", text);
    Ok(())
}
