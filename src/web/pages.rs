//! HTML pages of the web ingress.

use maud::{html, Markup, PreEscaped, DOCTYPE};

use crate::archiver::{group_by_src, Collect, Destination};

const STYLE: &str = r"
body { font-family: system-ui, sans-serif; max-width: 48rem; margin: 2rem auto; padding: 0 1rem; }
textarea { width: 100%; min-height: 8rem; }
.failed { color: #a33; }
table { border-collapse: collapse; width: 100%; }
td, th { text-align: left; padding: 0.25rem 0.5rem; border-bottom: 1px solid #ddd; }
";

fn layout(title: &str, content: Markup) -> Markup {
    html! {
        (DOCTYPE)
        html lang="en" {
            head {
                meta charset="UTF-8";
                meta name="viewport" content="width=device-width, initial-scale=1.0";
                title { (title) " - Wayback" }
                style { (PreEscaped(STYLE)) }
            }
            body {
                header {
                    nav { a href="/" { strong { "Wayback" } } }
                }
                main { (content) }
            }
        }
    }
}

/// Submission form.
pub fn home(slots: &[&str]) -> Markup {
    layout(
        "Archive",
        html! {
            h1 { "Archive a page" }
            p { "Archived to: " (slots.join(", ")) }
            form method="post" action="/wayback" {
                label for="text" { "Text or URLs" }
                textarea id="text" name="text" required placeholder="https://example.com/" {}
                button type="submit" { "Archive" }
            }
        },
    )
}

/// One table per source, one row per slot.
pub fn results(cols: &[Collect]) -> Markup {
    layout(
        "Results",
        html! {
            h1 { "Results" }
            @for (src, records) in group_by_src(cols) {
                section {
                    h2 { a href=(src) { (src) } }
                    table {
                        @for col in records {
                            tr {
                                th { (col.slot.name()) }
                                @match &col.dst {
                                    Destination::Archived(dst) => td { a href=(dst) { (dst) } },
                                    Destination::Failed(reason) => td class="failed" { (reason) },
                                }
                            }
                        }
                    }
                }
            }
            p { a href="/" { "Archive another" } }
        },
    )
}

/// Plain message page, used for errors and timeouts.
pub fn notice(title: &str, message: &str) -> Markup {
    layout(
        title,
        html! {
            h1 { (title) }
            p { (message) }
            p { a href="/" { "Back" } }
        },
    )
}
