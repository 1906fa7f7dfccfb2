//! Checkerboard interior-corner detection.
//!
//! 1. ChESS saddle response on a 16-sample ring (radius 5) over a lightly
//!    blurred grayscale image.
//! 2. Greedy non-maximum suppression above a fraction of the peak response.
//! 3. Lattice assembly: grow a grid from a seed near the candidate centroid,
//!    predicting each neighbour from locally measured step vectors.
//! 4. Gradient-orthogonality sub-pixel refinement (the `cornerSubPix` idea).
//!
//! Corners come back row-major, `rows` rows of `cols` corners, with the
//! column axis pointing right and a right-handed (non-mirrored) layout, so
//! every view of the same board yields consistent correspondences.

use std::collections::{HashMap, VecDeque};

use image::{GrayImage, ImageBuffer, Luma};
use imageproc::filter::gaussian_blur_f32;
use imageproc::gradients::{horizontal_sobel, vertical_sobel};
use nalgebra::{Matrix2, Point2, Vector2};

const RING: [(i32, i32); 16] = [
    (0, 5),
    (2, 5),
    (4, 4),
    (5, 2),
    (5, 0),
    (5, -2),
    (4, -4),
    (2, -5),
    (0, -5),
    (-2, -5),
    (-4, -4),
    (-5, -2),
    (-5, 0),
    (-5, 2),
    (-4, 4),
    (-2, 5),
];
const RING_RADIUS: i32 = 5;
const RELATIVE_THRESHOLD: f32 = 0.2;
const NMS_RADIUS: f64 = 5.0;
const GRID_TOLERANCE: f64 = 0.35;
const MAX_SEEDS: usize = 12;
const SUBPIX_RADIUS: i32 = 5;
const SUBPIX_ITERS: usize = 20;
/// Images larger than this along either side are searched at reduced scale.
const DETECT_MAX_SIDE: u32 = 1400;

/// Interior corner counts of the calibration target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PatternSize {
    pub rows: usize,
    pub cols: usize,
}

impl PatternSize {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    pub fn corner_count(&self) -> usize {
        self.rows * self.cols
    }

    /// Planar object points at unit spacing, row-major, `(col, row)`.
    pub fn object_points(&self) -> Vec<Point2<f64>> {
        (0..self.rows)
            .flat_map(|i| (0..self.cols).map(move |j| Point2::new(j as f64, i as f64)))
            .collect()
    }
}

impl Default for PatternSize {
    fn default() -> Self {
        Self { rows: 7, cols: 10 }
    }
}

/// Returns the `rows * cols` interior corners in row-major order, or `None`
/// when no complete grid of that size is found.
pub fn find_corners(gray: &GrayImage, pattern: PatternSize) -> Option<Vec<Point2<f64>>> {
    if pattern.rows < 2 || pattern.cols < 2 {
        return None;
    }
    let (w, h) = gray.dimensions();
    let factor = w.max(h).div_ceil(DETECT_MAX_SIDE).max(1);

    let coarse = if factor > 1 {
        image::imageops::resize(
            gray,
            w / factor,
            h / factor,
            image::imageops::FilterType::Triangle,
        )
    } else {
        gray.clone()
    };

    let blurred = gaussian_blur_f32(&coarse, 1.0);
    let response = chess_response(&blurred);
    let candidates = suppress(&response, pattern.corner_count() * 4);
    if candidates.len() < pattern.corner_count() {
        log::debug!(
            "{} corner candidates, {} needed",
            candidates.len(),
            pattern.corner_count()
        );
        return None;
    }

    let grid = assemble_grid(&candidates, pattern)?;
    let scale = factor as f64;
    let full = if factor > 1 {
        gaussian_blur_f32(gray, 1.0)
    } else {
        blurred
    };
    let refiner = SubPixel::new(&full);
    Some(
        grid.into_iter()
            .map(|p| {
                // coarse pixel centres map to (x + 0.5) * f - 0.5 at full res
                let p = Point2::new((p.x + 0.5) * scale - 0.5, (p.y + 0.5) * scale - 0.5);
                refiner.refine(p)
            })
            .collect(),
    )
}

fn chess_response(img: &GrayImage) -> ImageBuffer<Luma<f32>, Vec<f32>> {
    let (w, h) = img.dimensions();
    let mut out = ImageBuffer::new(w, h);
    let r = RING_RADIUS;
    if w as i32 <= 2 * r || h as i32 <= 2 * r {
        return out;
    }
    let px = |x: i32, y: i32| img.get_pixel(x as u32, y as u32)[0] as f32;

    for y in r..h as i32 - r {
        for x in r..w as i32 - r {
            let mut s = [0f32; 16];
            for (k, (dx, dy)) in RING.iter().enumerate() {
                s[k] = px(x + dx, y + dy);
            }
            let sum_resp: f32 = (0..4)
                .map(|n| ((s[n] + s[n + 8]) - (s[n + 4] + s[n + 12])).abs())
                .sum();
            let diff_resp: f32 = (0..8).map(|n| (s[n] - s[n + 8]).abs()).sum();
            let ring_mean = s.iter().sum::<f32>() / 16.0;
            let local_mean =
                (px(x, y) + px(x - 1, y) + px(x + 1, y) + px(x, y - 1) + px(x, y + 1)) / 5.0;
            let resp = sum_resp - diff_resp - 16.0 * (ring_mean - local_mean).abs();
            out.put_pixel(x as u32, y as u32, Luma([resp.max(0.0)]));
        }
    }
    out
}

/// Strongest-first greedy suppression; keeps at most `limit` peaks.
fn suppress(response: &ImageBuffer<Luma<f32>, Vec<f32>>, limit: usize) -> Vec<Point2<f64>> {
    let peak = response.pixels().map(|p| p[0]).fold(0f32, f32::max);
    if peak <= 0.0 {
        return Vec::new();
    }
    let floor = peak * RELATIVE_THRESHOLD;

    let mut raw: Vec<(f32, u32, u32)> = response
        .enumerate_pixels()
        .filter(|(_, _, p)| p[0] > floor)
        .map(|(x, y, p)| (p[0], x, y))
        .collect();
    raw.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut kept: Vec<Point2<f64>> = Vec::new();
    for (_, x, y) in raw {
        let p = Point2::new(x as f64, y as f64);
        if kept.iter().all(|q| (*q - p).norm() >= NMS_RADIUS) {
            kept.push(p);
            if kept.len() >= limit {
                break;
            }
        }
    }
    kept
}

fn nearest(points: &[Point2<f64>], target: Point2<f64>, used: &[bool]) -> Option<(usize, f64)> {
    points
        .iter()
        .enumerate()
        .filter(|(i, _)| !used[*i])
        .map(|(i, p)| (i, (*p - target).norm()))
        .min_by(|a, b| a.1.total_cmp(&b.1))
}

/// Two roughly perpendicular step vectors of similar length at `seed`.
fn seed_steps(points: &[Point2<f64>], seed: usize) -> Option<(Vector2<f64>, Vector2<f64>)> {
    let origin = points[seed];
    let mut by_dist: Vec<Vector2<f64>> = points
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != seed)
        .map(|(_, p)| *p - origin)
        .collect();
    by_dist.sort_by(|a, b| a.norm().total_cmp(&b.norm()));
    by_dist.truncate(8);

    let u = *by_dist.first()?;
    let best_v = by_dist
        .iter()
        .skip(1)
        .filter(|v| {
            let ratio = v.norm() / u.norm();
            (0.6..1.6).contains(&ratio)
        })
        .min_by(|a, b| {
            let ca = (a.dot(&u) / (a.norm() * u.norm())).abs();
            let cb = (b.dot(&u) / (b.norm() * u.norm())).abs();
            ca.total_cmp(&cb)
        })?;
    let cos = (best_v.dot(&u) / (best_v.norm() * u.norm())).abs();
    (cos < 0.5).then_some((u, *best_v))
}

fn grow(points: &[Point2<f64>], seed: usize) -> Option<HashMap<(i32, i32), usize>> {
    let (u0, v0) = seed_steps(points, seed)?;
    let mut used = vec![false; points.len()];
    let mut grid: HashMap<(i32, i32), usize> = HashMap::new();
    let mut steps: HashMap<(i32, i32), (Vector2<f64>, Vector2<f64>)> = HashMap::new();
    let mut queue = VecDeque::new();

    used[seed] = true;
    grid.insert((0, 0), seed);
    steps.insert((0, 0), (u0, v0));
    queue.push_back((0, 0));

    while let Some(cell) = queue.pop_front() {
        let (u, v) = steps[&cell];
        let here = points[grid[&cell]];
        let moves = [((1, 0), u), ((-1, 0), -u), ((0, 1), v), ((0, -1), -v)];
        for ((di, dj), step) in moves {
            let next = (cell.0 + di, cell.1 + dj);
            if grid.contains_key(&next) {
                continue;
            }
            let predicted = here + step;
            let tol = GRID_TOLERANCE * u.norm().min(v.norm());
            let Some((idx, dist)) = nearest(points, predicted, &used) else {
                continue;
            };
            if dist > tol {
                continue;
            }
            let actual = points[idx] - here;
            let local = if di != 0 {
                (actual * di as f64, v)
            } else {
                (u, actual * dj as f64)
            };
            used[idx] = true;
            grid.insert(next, idx);
            steps.insert(next, local);
            queue.push_back(next);
        }
    }
    Some(grid)
}

fn assemble_grid(points: &[Point2<f64>], pattern: PatternSize) -> Option<Vec<Point2<f64>>> {
    let n = points.len() as f64;
    let centroid = points
        .iter()
        .fold(Vector2::zeros(), |acc, p| acc + p.coords)
        / n;
    let mut seeds: Vec<usize> = (0..points.len()).collect();
    seeds.sort_by(|&a, &b| {
        (points[a].coords - centroid)
            .norm()
            .total_cmp(&(points[b].coords - centroid).norm())
    });

    for &seed in seeds.iter().take(MAX_SEEDS) {
        let Some(grid) = grow(points, seed) else {
            continue;
        };
        if let Some(ordered) = order_grid(points, &grid, pattern) {
            return Some(ordered);
        }
    }
    None
}

/// Checks the grown lattice has exactly the pattern's shape and orders it.
fn order_grid(
    points: &[Point2<f64>],
    grid: &HashMap<(i32, i32), usize>,
    pattern: PatternSize,
) -> Option<Vec<Point2<f64>>> {
    if grid.len() != pattern.corner_count() {
        return None;
    }
    let imin = grid.keys().map(|k| k.0).min()?;
    let imax = grid.keys().map(|k| k.0).max()?;
    let jmin = grid.keys().map(|k| k.1).min()?;
    let jmax = grid.keys().map(|k| k.1).max()?;
    let (ni, nj) = ((imax - imin + 1) as usize, (jmax - jmin + 1) as usize);

    // lattice axis `i` runs along u, `j` along v
    let at = |i: i32, j: i32| grid.get(&(i + imin, j + jmin)).map(|&k| points[k]);
    let i_is_col = if (ni, nj) == (pattern.cols, pattern.rows) {
        true
    } else if (ni, nj) == (pattern.rows, pattern.cols) {
        false
    } else {
        return None;
    };
    let corner = |c: i32, r: i32| if i_is_col { at(c, r) } else { at(r, c) };

    let (cols, rows) = (pattern.cols as i32, pattern.rows as i32);
    let col_axis = corner(cols - 1, 0)? - corner(0, 0)?;
    let row_axis = corner(0, rows - 1)? - corner(0, 0)?;
    // y points down, so a non-mirrored layout has a positive perp product
    let mirror_rows = col_axis.perp(&row_axis) < 0.0;
    let flip_all = col_axis.x < 0.0;

    let mut out = Vec::with_capacity(pattern.corner_count());
    for r in 0..rows {
        for c in 0..cols {
            let r = if mirror_rows { rows - 1 - r } else { r };
            let (c, r) = if flip_all {
                (cols - 1 - c, rows - 1 - r)
            } else {
                (c, r)
            };
            out.push(corner(c, r)?);
        }
    }
    Some(out)
}

struct SubPixel {
    gx: ImageBuffer<Luma<i16>, Vec<i16>>,
    gy: ImageBuffer<Luma<i16>, Vec<i16>>,
}

impl SubPixel {
    fn new(img: &GrayImage) -> Self {
        Self {
            gx: horizontal_sobel(img),
            gy: vertical_sobel(img),
        }
    }

    /// Solves sum(g g^T) q = sum(g g^T) p over a window; every gradient in the
    /// window is orthogonal to the vector from the corner to its pixel.
    fn refine(&self, start: Point2<f64>) -> Point2<f64> {
        let (w, h) = self.gx.dimensions();
        let r = SUBPIX_RADIUS;
        let sigma2 = (r as f64 * 0.75).powi(2);
        let mut q = start;

        for _ in 0..SUBPIX_ITERS {
            let (cx, cy) = (q.x.round() as i32, q.y.round() as i32);
            if cx - r < 1 || cy - r < 1 || cx + r >= w as i32 - 1 || cy + r >= h as i32 - 1 {
                return q;
            }
            let mut a = Matrix2::<f64>::zeros();
            let mut b = Vector2::<f64>::zeros();
            for dy in -r..=r {
                for dx in -r..=r {
                    let (x, y) = ((cx + dx) as u32, (cy + dy) as u32);
                    let g = Vector2::new(
                        self.gx.get_pixel(x, y)[0] as f64,
                        self.gy.get_pixel(x, y)[0] as f64,
                    );
                    let wgt = (-((dx * dx + dy * dy) as f64) / (2.0 * sigma2)).exp();
                    let ggt = g * g.transpose() * wgt;
                    a += ggt;
                    b += ggt * Vector2::new(x as f64, y as f64);
                }
            }
            let Some(next) = a.try_inverse().map(|inv| inv * b) else {
                return q;
            };
            let next = Point2::from(next);
            if (next - start).norm() > r as f64 {
                return start;
            }
            let moved = (next - q).norm();
            q = next;
            if moved < 0.01 {
                break;
            }
        }
        q
    }
}
