//! Formatted output helpers for CLI commands.

/// Formats a size given in MiB (e.g., "512 MiB", "2.0 GiB").
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_mib(mib: u64) -> String {
    const GIB: u64 = 1024;

    if mib >= GIB {
        format!("{:.1} GiB", mib as f64 / GIB as f64)
    } else {
        format!("{mib} MiB")
    }
}

/// Prints aligned `label: value` rows.
pub fn print_fields(rows: &[(&str, String)]) {
    let width = rows.iter().map(|(label, _)| label.len()).max().unwrap_or(0);
    for (label, value) in rows {
        println!("{label:<width$}  {value}");
    }
}
