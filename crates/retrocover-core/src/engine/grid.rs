//! Dense in-memory rasters for the reference backend.

/// A single-band grid: row-major f64 values plus a validity mask.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    pub width: usize,
    pub height: usize,
    data: Vec<f64>,
    mask: Vec<bool>,
}

impl Grid {
    /// A grid filled with `value`, valid everywhere.
    pub fn filled(width: usize, height: usize, value: f64) -> Self {
        Self {
            width,
            height,
            data: vec![value; width * height],
            mask: vec![true; width * height],
        }
    }

    /// Build from row-major values, valid everywhere.
    pub fn from_values(width: usize, height: usize, values: Vec<f64>) -> Self {
        assert_eq!(values.len(), width * height, "value count must match grid shape");
        Self {
            width,
            height,
            mask: vec![true; values.len()],
            data: values,
        }
    }

    #[inline]
    fn idx(&self, row: usize, col: usize) -> usize {
        row * self.width + col
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[self.idx(row, col)]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        let i = self.idx(row, col);
        self.data[i] = value;
        self.mask[i] = true;
    }

    #[inline]
    pub fn is_valid(&self, row: usize, col: usize) -> bool {
        self.mask[self.idx(row, col)]
    }

    #[inline]
    pub fn set_invalid(&mut self, row: usize, col: usize) {
        let i = self.idx(row, col);
        self.mask[i] = false;
    }

    /// Number of valid pixels.
    pub fn valid_count(&self) -> usize {
        self.mask.iter().filter(|&&m| m).count()
    }

    /// Valid values in row-major order.
    pub fn valid_values(&self) -> impl Iterator<Item = f64> + '_ {
        self.data
            .iter()
            .zip(self.mask.iter())
            .filter_map(|(&v, &m)| m.then_some(v))
    }
}

/// An ordered set of named bands sharing one shape.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GridStack {
    bands: Vec<(String, Grid)>,
}

impl GridStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(name: impl Into<String>, grid: Grid) -> Self {
        let mut stack = Self::new();
        stack.push(name, grid);
        stack
    }

    pub fn push(&mut self, name: impl Into<String>, grid: Grid) {
        if let Some((_, first)) = self.bands.first() {
            assert_eq!(
                (first.width, first.height),
                (grid.width, grid.height),
                "all bands in a stack must share one shape"
            );
        }
        self.bands.push((name.into(), grid));
    }

    pub fn len(&self) -> usize {
        self.bands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }

    pub fn band(&self, name: &str) -> Option<&Grid> {
        self.bands.iter().find(|(n, _)| n == name).map(|(_, g)| g)
    }

    pub fn band_at(&self, index: usize) -> Option<(&str, &Grid)> {
        self.bands.get(index).map(|(n, g)| (n.as_str(), g))
    }

    pub fn band_names(&self) -> Vec<&str> {
        self.bands.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Grid)> {
        self.bands.iter().map(|(n, g)| (n.as_str(), g))
    }

    pub fn into_bands(self) -> Vec<(String, Grid)> {
        self.bands
    }
}
