use std::{fs, io::Write, path::Path};

const RESULTS_PATH: &str = "crates/attention/benchmarks/RESULTS.md";

pub fn format_markdown_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut table = format!("| {} |\n", headers.join(" | "));
    table.push_str(&format!(
        "| {} |\n",
        headers.iter().map(|_| "---").collect::<Vec<_>>().join(" | ")
    ));
    for row in rows {
        table.push_str(&format!("| {} |\n", row.join(" | ")));
    }
    table
}

/// Human-readable tokens per second.
pub fn format_rate(tokens_sec: f64) -> String {
    if tokens_sec >= 1e6 {
        format!("{:.2} M", tokens_sec / 1e6)
    } else if tokens_sec >= 1e3 {
        format!("{:.2} K", tokens_sec / 1e3)
    } else {
        format!("{tokens_sec:.2}")
    }
}

/// Replaces (or appends) the marked `section` of the results file.
pub fn update_results(section: &str, content: &str) -> std::io::Result<()> {
    let tag = section.to_uppercase();
    let start_marker = format!("<!-- {tag}_START -->");
    let end_marker = format!("<!-- {tag}_END -->");

    let path = Path::new(RESULTS_PATH);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut body = if path.exists() {
        fs::read_to_string(path)?
    } else {
        "# Local Attention Benchmarks\n\n".to_string()
    };

    let block = format!("{start_marker}\n{content}\n{end_marker}");
    match (body.find(&start_marker), body.find(&end_marker)) {
        (Some(start), Some(end)) => body.replace_range(start..end + end_marker.len(), &block),
        _ => {
            if !body.ends_with('\n') {
                body.push('\n');
            }
            body.push_str(&block);
            body.push('\n');
        }
    }

    fs::File::create(path)?.write_all(body.as_bytes())
}
