//! Recursive expression-graph evaluator over dense grids.
//!
//! This is the reference semantics of every graph node: arithmetic with
//! mask propagation, clipping, the focal-mode filter, connected-component
//! sizing, band argmax, Horn-method slope, and classifier application.

use std::collections::BTreeMap;

use crate::engine::forest::Forest;
use crate::engine::grid::{Grid, GridStack};
use crate::engine::GridGeometry;
use crate::error::{Error, Result};
use crate::raster::expr::{BandSelector, BinaryOp, Expr, UnaryOp};

pub(crate) struct EvalContext<'a> {
    pub assets: &'a BTreeMap<String, GridStack>,
    pub geometry: &'a GridGeometry,
}

pub(crate) fn eval(expr: &Expr, ctx: &EvalContext) -> Result<GridStack> {
    match expr {
        Expr::Source { asset } => ctx
            .assets
            .get(asset)
            .cloned()
            .ok_or_else(|| Error::UnknownAsset(asset.clone())),

        Expr::Constant { value } => Ok(GridStack::single(
            "constant",
            Grid::filled(ctx.geometry.width, ctx.geometry.height, *value),
        )),

        Expr::PixelLonLat => {
            let (w, h) = (ctx.geometry.width, ctx.geometry.height);
            let mut lon = Grid::filled(w, h, 0.0);
            let mut lat = Grid::filled(w, h, 0.0);
            for r in 0..h {
                for c in 0..w {
                    lon.set(r, c, ctx.geometry.lon_at(c));
                    lat.set(r, c, ctx.geometry.lat_at(r));
                }
            }
            let mut out = GridStack::new();
            out.push("longitude", lon);
            out.push("latitude", lat);
            Ok(out)
        }

        Expr::Slope { input } => {
            let stack = eval(input, ctx)?;
            let (_, elev) = stack
                .band_at(0)
                .ok_or_else(|| Error::Compute("slope input has no bands".into()))?;
            Ok(GridStack::single("slope", horn_slope(elev, ctx.geometry.cellsize_m())))
        }

        Expr::Unary { input, op } => {
            let stack = eval(input, ctx)?;
            Ok(map_stack(&stack, |v| match op {
                UnaryOp::ToFloat => Some(v),
                UnaryOp::ToInt => Some(v.trunc()),
                UnaryOp::ToByte => Some(v.trunc().clamp(0.0, 255.0)),
            }))
        }

        Expr::Binary { lhs, rhs, op } => {
            let left = eval(lhs, ctx)?;
            let right = eval(rhs, ctx)?;
            binary(&left, &right, *op)
        }

        Expr::Clamp { input, lo, hi } => {
            let stack = eval(input, ctx)?;
            let (lo, hi) = (*lo, *hi);
            Ok(map_stack(&stack, move |v| Some(v.clamp(lo, hi))))
        }

        Expr::Select { input, selector } => {
            let stack = eval(input, ctx)?;
            select(&stack, selector)
        }

        Expr::Rename { input, names } => {
            let stack = eval(input, ctx)?;
            if stack.len() != names.len() {
                return Err(Error::Compute(format!(
                    "rename expects {} names for bands {:?}",
                    stack.len(),
                    stack.band_names()
                )));
            }
            let mut out = GridStack::new();
            for ((_, grid), name) in stack.into_bands().into_iter().zip(names) {
                out.push(name.clone(), grid);
            }
            Ok(out)
        }

        Expr::Cat { parts } => {
            let mut out = GridStack::new();
            for part in parts {
                for (name, grid) in eval(part, ctx)?.into_bands() {
                    out.push(name, grid);
                }
            }
            Ok(out)
        }

        Expr::UpdateMask { input, mask } => {
            let stack = eval(input, ctx)?;
            let mask_stack = eval(mask, ctx)?;
            let (_, m) = mask_stack
                .band_at(0)
                .ok_or_else(|| Error::Compute("mask image has no bands".into()))?;
            let mut out = GridStack::new();
            for (name, grid) in stack.iter() {
                let mut g = grid.clone();
                for r in 0..g.height {
                    for c in 0..g.width {
                        if !m.is_valid(r, c) || m.get(r, c) == 0.0 {
                            g.set_invalid(r, c);
                        }
                    }
                }
                out.push(name, g);
            }
            Ok(out)
        }

        Expr::Unmask { input, fallback } => {
            let stack = eval(input, ctx)?;
            let fb = eval(fallback, ctx)?;
            if fb.len() != 1 && fb.len() != stack.len() {
                return Err(Error::Compute(format!(
                    "unmask fallback has {} bands, input has {}",
                    fb.len(),
                    stack.len()
                )));
            }
            let mut out = GridStack::new();
            for (i, (name, grid)) in stack.iter().enumerate() {
                let (_, fill) = if fb.len() == 1 {
                    fb.band_at(0).expect("non-empty")
                } else {
                    fb.band_at(i).expect("aligned")
                };
                let mut g = grid.clone();
                for r in 0..g.height {
                    for c in 0..g.width {
                        if !grid.is_valid(r, c) && fill.is_valid(r, c) {
                            g.set(r, c, fill.get(r, c));
                        }
                    }
                }
                out.push(name, g);
            }
            Ok(out)
        }

        Expr::Clip { input, region } => {
            let stack = eval(input, ctx)?;
            let mut out = GridStack::new();
            for (name, grid) in stack.iter() {
                let mut g = grid.clone();
                for r in 0..g.height {
                    for c in 0..g.width {
                        if !region.contains(ctx.geometry.lon_at(c), ctx.geometry.lat_at(r)) {
                            g.set_invalid(r, c);
                        }
                    }
                }
                out.push(name, g);
            }
            Ok(out)
        }

        Expr::FocalMode { input, radius } => {
            let stack = eval(input, ctx)?;
            let mut out = GridStack::new();
            for (name, grid) in stack.iter() {
                out.push(name, focal_mode(grid, *radius as isize));
            }
            Ok(out)
        }

        Expr::ConnectedPixelCount { input, max_size, eight_connected } => {
            let stack = eval(input, ctx)?;
            let mut out = GridStack::new();
            for (name, grid) in stack.iter() {
                out.push(name, connected_pixel_count(grid, *max_size, *eight_connected));
            }
            Ok(out)
        }

        Expr::BandArgmax { input } => {
            let stack = eval(input, ctx)?;
            if stack.is_empty() {
                return Err(Error::Compute("argmax over an image with no bands".into()));
            }
            let (w, h) = grid_shape(&stack);
            let mut out = Grid::filled(w, h, 0.0);
            for r in 0..h {
                for c in 0..w {
                    let mut best: Option<(usize, f64)> = None;
                    let mut all_valid = true;
                    for (i, (_, grid)) in stack.iter().enumerate() {
                        if !grid.is_valid(r, c) {
                            all_valid = false;
                            break;
                        }
                        let v = grid.get(r, c);
                        // Strict comparison: exact ties keep the lowest index.
                        if best.map_or(true, |(_, b)| v > b) {
                            best = Some((i, v));
                        }
                    }
                    match (all_valid, best) {
                        (true, Some((i, _))) => out.set(r, c, i as f64),
                        _ => out.set_invalid(r, c),
                    }
                }
            }
            Ok(GridStack::single("argmax", out))
        }

        Expr::Classify { input, model } => {
            let stack = eval(input, ctx)?;
            let forest = model
                .payload::<Forest>()
                .ok_or_else(|| Error::Compute("model payload is not a local forest".into()))?;

            let mut feature_grids = Vec::with_capacity(model.feature_names().len());
            for name in model.feature_names() {
                let grid = stack.band(name).ok_or_else(|| {
                    Error::Compute(format!(
                        "classify input is missing feature band {name:?}; has {:?}",
                        stack.band_names()
                    ))
                })?;
                feature_grids.push(grid);
            }

            let (w, h) = grid_shape(&stack);
            let mut class_grids: Vec<Grid> = forest
                .classes()
                .iter()
                .map(|_| Grid::filled(w, h, 0.0))
                .collect();
            let mut features = vec![0.0f64; feature_grids.len()];

            for r in 0..h {
                for c in 0..w {
                    let valid = feature_grids.iter().all(|g| g.is_valid(r, c));
                    if valid {
                        for (slot, grid) in features.iter_mut().zip(&feature_grids) {
                            *slot = grid.get(r, c);
                        }
                        let probs = forest.predict_proba(&features);
                        for (grid, p) in class_grids.iter_mut().zip(&probs) {
                            grid.set(r, c, *p);
                        }
                    } else {
                        for grid in class_grids.iter_mut() {
                            grid.set_invalid(r, c);
                        }
                    }
                }
            }

            let mut out = GridStack::new();
            for (class, grid) in forest.classes().iter().zip(class_grids) {
                out.push(format!("k{class}"), grid);
            }
            Ok(out)
        }
    }
}

fn grid_shape(stack: &GridStack) -> (usize, usize) {
    stack
        .band_at(0)
        .map(|(_, g)| (g.width, g.height))
        .unwrap_or((0, 0))
}

/// Apply a per-pixel function to every band, masking `None` outputs.
fn map_stack(stack: &GridStack, f: impl Fn(f64) -> Option<f64>) -> GridStack {
    let mut out = GridStack::new();
    for (name, grid) in stack.iter() {
        let mut g = grid.clone();
        for r in 0..g.height {
            for c in 0..g.width {
                if grid.is_valid(r, c) {
                    match f(grid.get(r, c)) {
                        Some(v) => g.set(r, c, v),
                        None => g.set_invalid(r, c),
                    }
                }
            }
        }
        out.push(name, g);
    }
    out
}

fn select(stack: &GridStack, selector: &BandSelector) -> Result<GridStack> {
    let pick_name = |name: &str| -> Result<GridStack> {
        stack
            .band(name)
            .map(|g| GridStack::single(name, g.clone()))
            .ok_or_else(|| {
                Error::Compute(format!(
                    "no band named {name:?}; image has {:?}",
                    stack.band_names()
                ))
            })
    };

    match selector {
        BandSelector::Index(i) => {
            let (name, grid) = stack.band_at(*i).ok_or_else(|| {
                Error::Compute(format!(
                    "band index {i} out of range for bands {:?}",
                    stack.band_names()
                ))
            })?;
            Ok(GridStack::single(name, grid.clone()))
        }
        BandSelector::Name(name) => pick_name(name),
        BandSelector::Names(names) => {
            let mut out = GridStack::new();
            for name in names {
                for (n, g) in pick_name(name)?.into_bands() {
                    out.push(n, g);
                }
            }
            Ok(out)
        }
    }
}

fn binary(lhs: &GridStack, rhs: &GridStack, op: BinaryOp) -> Result<GridStack> {
    let pairs: Vec<(&str, &Grid, &Grid)> = if lhs.len() == rhs.len() {
        lhs.iter()
            .zip(rhs.iter())
            .map(|((name, l), (_, r))| (name, l, r))
            .collect()
    } else if lhs.len() == 1 && rhs.len() > 1 {
        let (_, l) = lhs.band_at(0).expect("non-empty");
        rhs.iter().map(|(name, r)| (name, l, r)).collect()
    } else if rhs.len() == 1 && lhs.len() > 1 {
        let (_, r) = rhs.band_at(0).expect("non-empty");
        lhs.iter().map(|(name, l)| (name, l, r)).collect()
    } else {
        return Err(Error::Compute(format!(
            "band count mismatch: {:?} vs {:?}",
            lhs.band_names(),
            rhs.band_names()
        )));
    };

    let mut out = GridStack::new();
    for (name, l, r) in pairs {
        let mut g = Grid::filled(l.width, l.height, 0.0);
        for row in 0..l.height {
            for col in 0..l.width {
                if !(l.is_valid(row, col) && r.is_valid(row, col)) {
                    g.set_invalid(row, col);
                    continue;
                }
                let (a, b) = (l.get(row, col), r.get(row, col));
                let v = match op {
                    BinaryOp::Add => Some(a + b),
                    BinaryOp::Subtract => Some(a - b),
                    BinaryOp::Multiply => Some(a * b),
                    BinaryOp::Divide => (b != 0.0).then(|| a / b),
                    BinaryOp::Eq => Some(bool_pixel(a == b)),
                    BinaryOp::Gte => Some(bool_pixel(a >= b)),
                    BinaryOp::Lte => Some(bool_pixel(a <= b)),
                    BinaryOp::And => Some(bool_pixel(a != 0.0 && b != 0.0)),
                    BinaryOp::Or => Some(bool_pixel(a != 0.0 || b != 0.0)),
                };
                match v {
                    Some(v) => g.set(row, col, v),
                    None => g.set_invalid(row, col),
                }
            }
        }
        out.push(name, g);
    }
    Ok(out)
}

#[inline]
fn bool_pixel(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

/// Majority vote over the square (2r+1)² window of valid neighbors,
/// center included. Ties resolve to the smallest value; masked centers
/// stay masked, so the filter never changes coverage.
fn focal_mode(grid: &Grid, radius: isize) -> Grid {
    let mut out = grid.clone();
    for r in 0..grid.height as isize {
        for c in 0..grid.width as isize {
            if !grid.is_valid(r as usize, c as usize) {
                continue;
            }
            let mut counts: BTreeMap<i64, u32> = BTreeMap::new();
            for dr in -radius..=radius {
                for dc in -radius..=radius {
                    let (nr, nc) = (r + dr, c + dc);
                    if nr < 0 || nc < 0 || nr >= grid.height as isize || nc >= grid.width as isize
                    {
                        continue;
                    }
                    let (nr, nc) = (nr as usize, nc as usize);
                    if grid.is_valid(nr, nc) {
                        // Categorical values; keyed at millis precision so
                        // float class ids bucket exactly.
                        *counts.entry((grid.get(nr, nc) * 1000.0).round() as i64).or_insert(0) +=
                            1;
                    }
                }
            }
            // BTreeMap iterates value-ascending and min_by_key keeps the
            // first minimum, so count ties resolve to the smallest value.
            if let Some((&value, _)) =
                counts.iter().min_by_key(|(_, &n)| std::cmp::Reverse(n))
            {
                out.set(r as usize, c as usize, value as f64 / 1000.0);
            }
        }
    }
    out
}

/// Per-pixel size of the same-value connected component, counted up to
/// `max_size`. Invalid pixels belong to no component and stay masked.
fn connected_pixel_count(grid: &Grid, max_size: u32, eight_connected: bool) -> Grid {
    let (w, h) = (grid.width, grid.height);
    let offsets: &[(isize, isize)] = if eight_connected {
        &[(-1, -1), (-1, 0), (-1, 1), (0, -1), (0, 1), (1, -1), (1, 0), (1, 1)]
    } else {
        &[(-1, 0), (0, -1), (0, 1), (1, 0)]
    };

    let mut component = vec![usize::MAX; w * h];
    let mut sizes: Vec<u32> = Vec::new();

    for start in 0..w * h {
        if component[start] != usize::MAX || !grid.is_valid(start / w, start % w) {
            continue;
        }
        let id = sizes.len();
        let value = grid.get(start / w, start % w);
        let mut queue = vec![start];
        component[start] = id;
        let mut size = 0u32;
        while let Some(at) = queue.pop() {
            size += 1;
            let (r, c) = ((at / w) as isize, (at % w) as isize);
            for &(dr, dc) in offsets {
                let (nr, nc) = (r + dr, c + dc);
                if nr < 0 || nc < 0 || nr >= h as isize || nc >= w as isize {
                    continue;
                }
                let ni = nr as usize * w + nc as usize;
                if component[ni] == usize::MAX
                    && grid.is_valid(nr as usize, nc as usize)
                    && grid.get(nr as usize, nc as usize) == value
                {
                    component[ni] = id;
                    queue.push(ni);
                }
            }
        }
        sizes.push(size.min(max_size));
    }

    let mut out = Grid::filled(w, h, 0.0);
    for r in 0..h {
        for c in 0..w {
            match component[r * w + c] {
                usize::MAX => out.set_invalid(r, c),
                id => out.set(r, c, f64::from(sizes[id])),
            }
        }
    }
    out
}

/// Horn (1981) 3×3 slope in degrees. Border pixels and pixels with any
/// masked neighbor are masked.
fn horn_slope(elev: &Grid, cellsize: f64) -> Grid {
    let (w, h) = (elev.width, elev.height);
    let mut out = Grid::filled(w, h, 0.0);
    for r in 0..h {
        for c in 0..w {
            out.set_invalid(r, c);
        }
    }
    if w < 3 || h < 3 {
        return out;
    }
    for r in 1..h - 1 {
        'cols: for c in 1..w - 1 {
            for dr in -1isize..=1 {
                for dc in -1isize..=1 {
                    if !elev.is_valid((r as isize + dr) as usize, (c as isize + dc) as usize) {
                        continue 'cols;
                    }
                }
            }
            let nw = elev.get(r - 1, c - 1);
            let n = elev.get(r - 1, c);
            let ne = elev.get(r - 1, c + 1);
            let wv = elev.get(r, c - 1);
            let e = elev.get(r, c + 1);
            let sw = elev.get(r + 1, c - 1);
            let s = elev.get(r + 1, c);
            let se = elev.get(r + 1, c + 1);

            let dz_dx = ((ne + 2.0 * e + se) - (nw + 2.0 * wv + sw)) / (8.0 * cellsize);
            let dz_dy = ((nw + 2.0 * n + ne) - (sw + 2.0 * s + se)) / (8.0 * cellsize);
            let slope_deg = (dz_dx * dz_dx + dz_dy * dz_dy).sqrt().atan().to_degrees();
            out.set(r, c, slope_deg);
        }
    }
    out
}
