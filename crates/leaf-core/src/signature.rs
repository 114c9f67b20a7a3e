//! Canonical query signatures.
//!
//! The signature seeds the noise generator, so two restatements of the same query must produce
//! the same string. Panel order and concept order within a sub-panel are normalised. Sub-panel
//! order within a panel is kept as given, because sub-panel position can carry sequence meaning.

use crate::panel::Panel;

/// Returns the canonical signature of a query.
///
/// Concept ids inside each sub-panel are sorted and comma-joined, the sub-panel strings are
/// comma-joined in their original order, and the resulting per-panel strings are sorted and
/// comma-joined. An empty query yields an empty string.
pub fn canonicalize(panels: &[Panel]) -> String {
    let mut per_panel: Vec<String> = panels.iter().map(panel_signature).collect();
    per_panel.sort_unstable();
    per_panel.join(",")
}

fn panel_signature(panel: &Panel) -> String {
    panel
        .sub_panels
        .iter()
        .map(|sub_panel| {
            let mut ids: Vec<&str> = sub_panel
                .panel_items
                .iter()
                .map(|item| item.concept.id.as_str())
                .collect();
            ids.sort_unstable();
            ids.join(",")
        })
        .collect::<Vec<_>>()
        .join(",")
}
