//! Message bodies shared by the sinks.

use std::fmt::Write;

use crate::archiver::{Collect, Destination};
use crate::reduxer::Bundles;

/// Title for a group of records of one source: the captured page title when
/// there is one, the source URL otherwise.
#[must_use]
pub fn title(cols: &[Collect], bundles: &Bundles) -> String {
    let Some(first) = cols.first() else {
        return String::new();
    };
    bundles
        .load(&first.src)
        .and_then(|bundle| bundle.title)
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| first.src.clone())
}

/// Markdown listing each slot's destination or failure.
#[must_use]
pub fn markdown(cols: &[Collect], bundles: &Bundles) -> String {
    let mut out = String::new();
    let Some(first) = cols.first() else {
        return out;
    };

    let _ = writeln!(out, "**{}**", escape(&title(cols, bundles)));
    let _ = writeln!(out, "Source: <{}>", first.src);
    out.push('\n');

    for col in cols {
        match &col.dst {
            Destination::Archived(dst) => {
                let _ = writeln!(out, "- {}: <{dst}>", col.slot.name());
            }
            Destination::Failed(reason) => {
                let _ = writeln!(out, "- {}: failed ({})", col.slot.name(), escape(reason));
            }
        }
    }

    if let Some(bundle) = bundles.load(&first.src) {
        let remote: Vec<(&str, &str)> = [
            ("Screenshot", bundle.artifact.img.remote.as_deref()),
            ("PDF", bundle.artifact.pdf.remote.as_deref()),
            ("HTML", bundle.artifact.raw.remote.as_deref()),
            ("Text", bundle.artifact.txt.remote.as_deref()),
        ]
        .into_iter()
        .filter_map(|(label, url)| url.map(|u| (label, u)))
        .collect();

        if !remote.is_empty() {
            out.push('\n');
            let links: Vec<String> = remote
                .iter()
                .map(|(label, url)| format!("[{label}](<{url}>)"))
                .collect();
            let _ = writeln!(out, "Artifacts: {}", links.join(" · "));
        }
    }

    out
}

/// Shorten `s` to at most `max` characters, marking the cut.
#[must_use]
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut cut: String = s.chars().take(max.saturating_sub(1)).collect();
    cut.push('…');
    cut
}

fn escape(s: &str) -> String {
    s.replace('*', "\\*").replace('_', "\\_").replace('`', "\\`")
}
