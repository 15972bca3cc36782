use serde::{Deserialize, Serialize};

/// Base edge, in pixels, for named aspect ratios: the longer side of a
/// placed node is always `BASE_SIZE` unless explicit dimensions are given.
pub const BASE_SIZE: u32 = 1024;

/// Batch inserts arrange left-to-right, ten nodes per row.
pub const GRID_COLUMNS: usize = 10;

/// Gap, in pixels, between neighbouring nodes of a batch grid.
pub const GRID_SPACING: u32 = 50;

/// Hard ceiling on an insertable payload.
pub const MAX_IMAGE_BYTES: usize = 50 * 1024 * 1024;

pub const MAX_NODE_NAME_CHARS: usize = 50;

const FALLBACK_NODE_NAME: &str = "Untitled";

/// Where the canvas is currently looking. Placement is always expressed
/// relative to this center.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub center_x: f64,
    pub center_y: f64,
}

impl Viewport {
    pub fn new(center_x: f64, center_y: f64) -> Self {
        Self { center_x, center_y }
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self::new(0.0, 0.0)
    }
}

/// One selected image the UI wants placed. Consumed exactly once by the
/// ingestion pipeline; batch fields are either both present or both absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertionRequest {
    pub image_bytes: Vec<u8>,
    pub prompt: String,
    pub aspect_ratio: Option<String>,
    pub custom_width: Option<u32>,
    pub custom_height: Option<u32>,
    pub batch_index: Option<usize>,
    pub batch_total: Option<usize>,
}

impl InsertionRequest {
    pub fn single(image_bytes: Vec<u8>, prompt: impl Into<String>) -> Self {
        Self {
            image_bytes,
            prompt: prompt.into(),
            aspect_ratio: None,
            custom_width: None,
            custom_height: None,
            batch_index: None,
            batch_total: None,
        }
    }

    pub fn is_batch(&self) -> bool {
        self.batch_index.is_some() && self.batch_total.is_some()
    }

    pub fn custom_size(&self) -> Option<(u32, u32)> {
        match (self.custom_width, self.custom_height) {
            (Some(width), Some(height)) if width > 0 && height > 0 => Some((width, height)),
            _ => None,
        }
    }
}

/// A rectangle placed on the canvas, ready for the canvas collaborator to
/// materialize with the decoded image as its fill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacedNode {
    pub name: String,
    pub x: i64,
    pub y: i64,
    pub width: u32,
    pub height: u32,
}

/// Target node size, by priority: explicit custom dimensions, then a named
/// `w:h` ratio against the 1024 base edge, then the 1024 square.
pub fn resolve_target_size(aspect_ratio: Option<&str>, custom: Option<(u32, u32)>) -> (u32, u32) {
    if let Some((width, height)) = custom {
        return (width, height);
    }
    aspect_ratio
        .and_then(ratio_dimensions)
        .unwrap_or((BASE_SIZE, BASE_SIZE))
}

/// Pixel dimensions for a `w:h` label: longer edge pinned to `BASE_SIZE`,
/// shorter edge rounded proportionally. Returns None for anything that is
/// not two positive integers around a colon (including `"custom"`).
pub fn ratio_dimensions(label: &str) -> Option<(u32, u32)> {
    let (w, h) = label.trim().split_once(':')?;
    let w: u32 = w.trim().parse().ok()?;
    let h: u32 = h.trim().parse().ok()?;
    if w == 0 || h == 0 {
        return None;
    }
    let base = f64::from(BASE_SIZE);
    if w > h {
        let height = (base * f64::from(h) / f64::from(w)).round() as u32;
        Some((BASE_SIZE, height))
    } else if h > w {
        let width = (base * f64::from(w) / f64::from(h)).round() as u32;
        Some((width, BASE_SIZE))
    } else {
        Some((BASE_SIZE, BASE_SIZE))
    }
}

/// Column/row of a batch slot in the fixed-width grid.
pub fn grid_cell(batch_index: usize) -> (usize, usize) {
    (batch_index % GRID_COLUMNS, batch_index / GRID_COLUMNS)
}

/// Top-left position for a single insert: node centered on the viewport.
pub fn single_position(viewport: &Viewport, width: u32, height: u32) -> (i64, i64) {
    let x = viewport.center_x - f64::from(width) / 2.0;
    let y = viewport.center_y - f64::from(height) / 2.0;
    (x.round() as i64, y.round() as i64)
}

/// Top-left position for one slot of a batch grid: rows grow downward from
/// the viewport center, the full row width is centered horizontally.
pub fn batch_position(
    viewport: &Viewport,
    batch_index: usize,
    width: u32,
    height: u32,
) -> (i64, i64) {
    let (col, row) = grid_cell(batch_index);
    let pitch_x = f64::from(width + GRID_SPACING);
    let pitch_y = f64::from(height + GRID_SPACING);
    let x = viewport.center_x - (GRID_COLUMNS as f64 * pitch_x) / 2.0 + col as f64 * pitch_x;
    let y = viewport.center_y - f64::from(height) / 2.0 + row as f64 * pitch_y;
    (x.round() as i64, y.round() as i64)
}

/// Display name derived from the originating prompt: word/space/hyphen
/// characters only, whitespace collapsed, at most 50 chars.
pub fn clean_node_name(prompt: &str) -> String {
    let filtered: String = prompt
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-' || c.is_whitespace())
        .collect();
    let collapsed = filtered.split_whitespace().collect::<Vec<_>>().join(" ");
    let truncated: String = collapsed.chars().take(MAX_NODE_NAME_CHARS).collect();
    if truncated.is_empty() {
        FALLBACK_NODE_NAME.to_string()
    } else {
        truncated
    }
}

/// Node name including the two-digit 1-based suffix for batch items.
pub fn node_display_name(prompt: &str, batch_index: Option<usize>) -> String {
    let base = clean_node_name(prompt);
    match batch_index {
        Some(index) => format!("{base} {:02}", index + 1),
        None => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_ratios_pin_the_longer_edge_to_base() {
        assert_eq!(ratio_dimensions("16:9"), Some((1024, 576)));
        assert_eq!(ratio_dimensions("9:16"), Some((576, 1024)));
        assert_eq!(ratio_dimensions("4:3"), Some((1024, 768)));
        assert_eq!(ratio_dimensions("3:4"), Some((768, 1024)));
        assert_eq!(ratio_dimensions("1:1"), Some((1024, 1024)));
    }

    #[test]
    fn malformed_ratio_labels_are_rejected() {
        assert_eq!(ratio_dimensions("custom"), None);
        assert_eq!(ratio_dimensions("16x9"), None);
        assert_eq!(ratio_dimensions("0:9"), None);
        assert_eq!(ratio_dimensions(":"), None);
    }

    #[test]
    fn custom_dimensions_win_over_ratio_and_default() {
        assert_eq!(
            resolve_target_size(Some("16:9"), Some((640, 480))),
            (640, 480)
        );
        assert_eq!(resolve_target_size(Some("9:16"), None), (576, 1024));
        assert_eq!(resolve_target_size(None, None), (1024, 1024));
        assert_eq!(resolve_target_size(Some("custom"), None), (1024, 1024));
    }

    #[test]
    fn grid_cell_wraps_every_ten_slots() {
        assert_eq!(grid_cell(0), (0, 0));
        assert_eq!(grid_cell(9), (9, 0));
        assert_eq!(grid_cell(10), (0, 1));
        assert_eq!(grid_cell(23), (3, 2));
    }

    #[test]
    fn single_insert_centers_on_viewport() {
        let viewport = Viewport::new(100.0, 200.0);
        assert_eq!(single_position(&viewport, 1024, 576), (-412, -88));
    }

    #[test]
    fn batch_positions_step_by_dimension_plus_gap() {
        let viewport = Viewport::default();
        let (x0, y0) = batch_position(&viewport, 0, 100, 100);
        let (x1, _) = batch_position(&viewport, 1, 100, 100);
        let (x10, y10) = batch_position(&viewport, 10, 100, 100);
        assert_eq!(x1 - x0, 150);
        assert_eq!(x10, x0);
        assert_eq!(y10 - y0, 150);
    }

    #[test]
    fn batch_row_is_horizontally_centered() {
        let viewport = Viewport::default();
        let (x0, _) = batch_position(&viewport, 0, 100, 100);
        assert_eq!(x0, -750);
    }

    #[test]
    fn node_names_are_sanitized_and_collapsed() {
        assert_eq!(clean_node_name("A Cat! @Night (v2)"), "A Cat Night v2");
        assert_eq!(
            node_display_name("A Cat! @Night (v2)", Some(0)),
            "A Cat Night v2 01"
        );
        assert_eq!(
            node_display_name("A Cat! @Night (v2)", Some(11)),
            "A Cat Night v2 12"
        );
    }

    #[test]
    fn node_names_truncate_to_fifty_chars() {
        let long = "word ".repeat(30);
        assert_eq!(clean_node_name(&long).chars().count(), MAX_NODE_NAME_CHARS);
    }

    #[test]
    fn unusable_prompts_fall_back_to_untitled() {
        assert_eq!(clean_node_name(""), "Untitled");
        assert_eq!(clean_node_name("!!! ???"), "Untitled");
    }
}
