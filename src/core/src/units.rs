/// Format a byte count for build progress output.
pub fn format_size(bytes: i64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * KB;
    const GB: f64 = 1024.0 * MB;

    let sign = if bytes < 0 { "-" } else { "" };
    let abs = bytes.unsigned_abs() as f64;
    if abs >= GB {
        format!("{}{:.1} GB", sign, abs / GB)
    } else if abs >= MB {
        format!("{}{:.1} MB", sign, abs / MB)
    } else if abs >= KB {
        format!("{}{:.1} KB", sign, abs / KB)
    } else {
        format!("{}{} B", sign, abs)
    }
}
