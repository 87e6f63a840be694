// grid.rs — Spatially bucketed catalog of tracked stereo features.
//
// The image is partitioned into grid_row × grid_col rectangular cells;
// each cell holds the features whose *left-image* position fell inside it
// when the store was (re)filled. Cell membership is recomputed every
// frame from the current positions, so drift within a frame never moves
// a record between cells mid-pipeline.
//
// The per-cell discipline enforces the resource bounds: admission sorts
// candidates by detector response and fills up to the per-cell minimum;
// pruning sorts by lifetime and truncates to the per-cell maximum,
// keeping the longest-tracked features.

use crate::Point2;

/// Monotonically increasing feature identifier, never reused within a
/// process lifetime.
pub type FeatureId = u64;

/// A stereo-verified tracked feature.
#[derive(Debug, Clone)]
pub struct FeatureRecord {
    pub id: FeatureId,
    /// Detector response at admission time.
    pub response: f32,
    /// Number of consecutive frames this feature has survived every
    /// rejection stage; 1 on admission.
    pub lifetime: u32,
    /// Left-image pixel position.
    pub cam0_point: Point2,
    /// Right-image pixel position (stereo correspondence of cam0_point).
    pub cam1_point: Point2,
}

/// Grid-bucketed feature store for one frame.
pub struct GridStore {
    /// Row-major cells: `cells[row * cols + col]`.
    cells: Vec<Vec<FeatureRecord>>,
    rows: usize,
    cols: usize,
    /// Cell dimensions in pixels, derived from the frame size by integer
    /// division (the last row/column absorbs the remainder).
    cell_width: usize,
    cell_height: usize,
}

impl GridStore {
    /// Create an empty store for a frame of the given pixel dimensions.
    pub fn new(rows: usize, cols: usize, img_width: usize, img_height: usize) -> Self {
        assert!(rows > 0 && cols > 0, "grid must have at least one cell");
        assert!(
            img_width >= cols && img_height >= rows,
            "image {img_width}×{img_height} smaller than grid {cols}×{rows}"
        );
        GridStore {
            cells: (0..rows * cols).map(|_| Vec::new()).collect(),
            rows,
            cols,
            cell_width: img_width / cols,
            cell_height: img_height / rows,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    /// Cell code (row-major) for a left-image pixel position. Row and
    /// column are clamped so bottom/right-edge pixels land in the last
    /// cell rather than past the grid.
    pub fn cell_code(&self, pt: &Point2) -> usize {
        let row = ((pt.y.max(0.0) as usize) / self.cell_height).min(self.rows - 1);
        let col = ((pt.x.max(0.0) as usize) / self.cell_width).min(self.cols - 1);
        row * self.cols + col
    }

    /// Append a record to the cell containing its left-image position.
    pub fn insert(&mut self, record: FeatureRecord) {
        let code = self.cell_code(&record.cam0_point);
        self.cells[code].push(record);
    }

    /// Features in one cell, in insertion/sort order.
    pub fn cell(&self, code: usize) -> &[FeatureRecord] {
        &self.cells[code]
    }

    /// Stable descending sort of one cell by detector response.
    pub fn sort_cell_by_response(&mut self, code: usize) {
        self.cells[code].sort_by(|a, b| b.response.total_cmp(&a.response));
    }

    /// Stable descending sort of one cell by lifetime.
    pub fn sort_cell_by_lifetime(&mut self, code: usize) {
        self.cells[code].sort_by(|a, b| b.lifetime.cmp(&a.lifetime));
    }

    /// Truncate one cell to at most `cap` records after a lifetime sort,
    /// retaining the longest-tracked features.
    pub fn prune_cell(&mut self, code: usize, cap: usize) {
        if self.cells[code].len() > cap {
            self.sort_cell_by_lifetime(code);
            self.cells[code].truncate(cap);
        }
    }

    /// Iterate all records, cell-major (row-major cells, insertion order
    /// within each cell). This is the published feature order.
    pub fn iter(&self) -> impl Iterator<Item = &FeatureRecord> {
        self.cells.iter().flatten()
    }

    /// Total number of stored features.
    pub fn count(&self) -> usize {
        self.cells.iter().map(Vec::len).sum()
    }

    /// Drop all records but keep cell allocations, and re-derive the cell
    /// geometry for the next frame's dimensions.
    pub fn reset(&mut self, img_width: usize, img_height: usize) {
        for cell in &mut self.cells {
            cell.clear();
        }
        self.cell_width = img_width / self.cols;
        self.cell_height = img_height / self.rows;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: FeatureId, x: f64, y: f64, response: f32, lifetime: u32) -> FeatureRecord {
        FeatureRecord {
            id,
            response,
            lifetime,
            cam0_point: Point2::new(x, y),
            cam1_point: Point2::new(x - 5.0, y),
        }
    }

    #[test]
    fn test_cell_code_row_major() {
        // 4×4 grid over 640×480: cells are 160×120.
        let store = GridStore::new(4, 4, 640, 480);
        assert_eq!(store.cell_code(&Point2::new(0.0, 0.0)), 0);
        assert_eq!(store.cell_code(&Point2::new(200.0, 50.0)), 1);
        assert_eq!(store.cell_code(&Point2::new(50.0, 130.0)), 4);
        assert_eq!(store.cell_code(&Point2::new(630.0, 470.0)), 15);
    }

    #[test]
    fn test_cell_code_clamps_edges() {
        // 3×3 grid over 100×100: cell edge 33, so coordinates ≥ 99 would
        // index row/col 3 without clamping.
        let store = GridStore::new(3, 3, 100, 100);
        assert_eq!(store.cell_code(&Point2::new(99.9, 99.9)), 8);
        assert_eq!(store.cell_code(&Point2::new(-0.5, 0.0)), 0);
    }

    #[test]
    fn test_insert_and_count() {
        let mut store = GridStore::new(4, 4, 640, 480);
        store.insert(record(1, 10.0, 10.0, 50.0, 1));
        store.insert(record(2, 15.0, 12.0, 60.0, 1));
        store.insert(record(3, 600.0, 400.0, 40.0, 1));

        assert_eq!(store.count(), 3);
        assert_eq!(store.cell(0).len(), 2);
        assert_eq!(store.cell(15).len(), 1);
    }

    #[test]
    fn test_sort_by_response_descending() {
        let mut store = GridStore::new(2, 2, 100, 100);
        store.insert(record(1, 10.0, 10.0, 30.0, 1));
        store.insert(record(2, 12.0, 10.0, 90.0, 1));
        store.insert(record(3, 14.0, 10.0, 60.0, 1));

        store.sort_cell_by_response(0);
        let ids: Vec<FeatureId> = store.cell(0).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn test_prune_retains_longest_lived() {
        let mut store = GridStore::new(2, 2, 100, 100);
        store.insert(record(1, 10.0, 10.0, 99.0, 2));
        store.insert(record(2, 12.0, 10.0, 10.0, 9));
        store.insert(record(3, 14.0, 10.0, 50.0, 5));
        store.insert(record(4, 16.0, 10.0, 80.0, 1));

        store.prune_cell(0, 2);
        let ids: Vec<FeatureId> = store.cell(0).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2, 3], "pruning keeps the oldest features");
    }

    #[test]
    fn test_prune_no_op_under_cap() {
        let mut store = GridStore::new(2, 2, 100, 100);
        store.insert(record(1, 10.0, 10.0, 99.0, 2));
        store.prune_cell(0, 4);
        assert_eq!(store.cell(0).len(), 1);
    }

    #[test]
    fn test_reset_clears_and_rederives_geometry() {
        let mut store = GridStore::new(4, 4, 640, 480);
        store.insert(record(1, 10.0, 10.0, 50.0, 1));
        assert_eq!(store.count(), 1);

        store.reset(320, 240);
        assert_eq!(store.count(), 0);
        // New geometry: 80×60 cells.
        assert_eq!(store.cell_code(&Point2::new(100.0, 70.0)), 5);
    }

    #[test]
    fn test_iter_is_cell_major() {
        let mut store = GridStore::new(2, 2, 100, 100);
        store.insert(record(10, 60.0, 60.0, 1.0, 1)); // cell 3
        store.insert(record(11, 10.0, 10.0, 1.0, 1)); // cell 0
        store.insert(record(12, 60.0, 10.0, 1.0, 1)); // cell 1

        let ids: Vec<FeatureId> = store.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![11, 12, 10]);
    }
}
