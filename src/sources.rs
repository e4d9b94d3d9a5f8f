use std::fmt::Write as _;

use anyhow::Result;

use crate::config::{Config, CursorMode, WatermarkMode};

/// Table of configured sources and whether their collector input exists.
pub fn format_sources(config: &Config) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<16} {:<12} {:<10} {:<11} {:<8} ORIGIN",
        "SOURCE", "TAG", "CURSOR", "WATERMARK", "STATUS"
    );
    for (name, source) in &config.sources {
        let cursor = match source.cursor {
            CursorMode::FromDate => "from_date",
            CursorMode::Offset => "offset",
            CursorMode::None => "none",
        };
        let watermark = match source.watermark {
            WatermarkMode::Index => "index",
            WatermarkMode::Checkpoint => "checkpoint",
        };
        let status = if source.path.exists() { "OK" } else { "MISSING" };
        let _ = writeln!(
            out,
            "{:<16} {:<12} {:<10} {:<11} {:<8} {}",
            name,
            source.source_tag(name),
            cursor,
            watermark,
            status,
            source.origin
        );
    }
    if config.sources.is_empty() {
        out.push_str("(no sources configured)\n");
    }
    out
}

pub fn list_sources(config: &Config) -> Result<()> {
    print!("{}", format_sources(config));
    Ok(())
}
