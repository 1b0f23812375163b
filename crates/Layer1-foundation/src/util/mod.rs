//! Small shared helpers

pub mod hash;

pub use hash::{compute_hash, hash_json, normalize_json, CompositeKey};

/// 바이트를 읽기 쉬운 형식으로 변환
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// 부호 있는 바이트 변화량 표시 (+1.00 MB / -512 B)
pub fn format_bytes_delta(delta: i64) -> String {
    let sign = if delta < 0 { "-" } else { "+" };
    format!("{}{}", sign, format_bytes(delta.unsigned_abs()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn test_format_bytes_delta() {
        assert_eq!(format_bytes_delta(-512), "-512 B");
        assert_eq!(format_bytes_delta(1024 * 1024), "+1.00 MB");
    }
}
