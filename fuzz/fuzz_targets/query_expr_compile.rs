#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else { return };
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else { return };

    if let Ok((_expr, bytes)) = query_expr::compile(&value) {
        let _ = query_expr::deserialize(&bytes);
    }
});
