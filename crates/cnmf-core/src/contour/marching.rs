use std::collections::HashMap;

use ndarray::Array2;

/// A cell edge carrying an iso-line crossing.
///
/// `H(r, c)` joins grid nodes (r, c) and (r, c + 1); `V(r, c)` joins
/// (r, c) and (r + 1, c).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum EdgeKey {
    H(usize, usize),
    V(usize, usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Side {
    Top,
    Right,
    Bottom,
    Left,
}

impl Side {
    fn key(self, r: usize, c: usize) -> EdgeKey {
        match self {
            Side::Top => EdgeKey::H(r, c),
            Side::Bottom => EdgeKey::H(r + 1, c),
            Side::Left => EdgeKey::V(r, c),
            Side::Right => EdgeKey::V(r, c + 1),
        }
    }
}

/// Segments of one cell for a corner pattern.
///
/// Bits: top-left = 8, top-right = 4, bottom-right = 2, bottom-left = 1,
/// set when the corner lies below the level. For the two saddle patterns
/// `centre_below` picks the connectivity.
fn cell_segments(case: u8, centre_below: bool) -> &'static [(Side, Side)] {
    use Side::*;
    match case {
        1 | 14 => &[(Left, Bottom)],
        2 | 13 => &[(Bottom, Right)],
        3 | 12 => &[(Left, Right)],
        4 | 11 => &[(Top, Right)],
        6 | 9 => &[(Top, Bottom)],
        7 | 8 => &[(Top, Left)],
        5 if centre_below => &[(Left, Top), (Bottom, Right)],
        5 => &[(Top, Right), (Left, Bottom)],
        10 if centre_below => &[(Top, Right), (Left, Bottom)],
        10 => &[(Left, Top), (Bottom, Right)],
        _ => &[],
    }
}

/// Linear interpolation of the level crossing along an edge, as `[x, y]`
/// in grid coordinates.
fn crossing(grid: &Array2<f64>, edge: EdgeKey, level: f64) -> [f64; 2] {
    let (r0, c0, r1, c1) = match edge {
        EdgeKey::H(r, c) => (r, c, r, c + 1),
        EdgeKey::V(r, c) => (r, c, r + 1, c),
    };
    let (a, b) = (grid[[r0, c0]], grid[[r1, c1]]);
    let t = if b == a { 0.5 } else { (level - a) / (b - a) };
    let x = c0 as f64 + t * (c1 as f64 - c0 as f64);
    let y = r0 as f64 + t * (r1 as f64 - r0 as f64);
    [x, y]
}

/// Trace the first closed iso-line of `grid` at `level`.
///
/// A node is inside when its value is strictly below `level`. Cells are
/// visited in row-major order and the contour through the first segment
/// found is followed until it returns to its start. The returned ring is
/// closed (last point equals first) and uses `[x, y]` = `[col, row]` grid
/// coordinates. Returns `None` when the level does not cross the grid or
/// the line reaches the grid boundary.
pub fn first_closed_contour(grid: &Array2<f64>, level: f64) -> Option<Vec<[f64; 2]>> {
    let (rows, cols) = grid.dim();
    if rows < 2 || cols < 2 {
        return None;
    }

    let below = |r: usize, c: usize| grid[[r, c]] < level;
    let mut links: HashMap<EdgeKey, [Option<EdgeKey>; 2]> = HashMap::new();
    let mut first: Option<(EdgeKey, EdgeKey)> = None;

    for r in 0..rows - 1 {
        for c in 0..cols - 1 {
            let case = (u8::from(below(r, c)) << 3)
                | (u8::from(below(r, c + 1)) << 2)
                | (u8::from(below(r + 1, c + 1)) << 1)
                | u8::from(below(r + 1, c));
            if case == 0 || case == 15 {
                continue;
            }
            let centre = (grid[[r, c]] + grid[[r, c + 1]] + grid[[r + 1, c + 1]] + grid[[r + 1, c]])
                / 4.0;
            for &(s0, s1) in cell_segments(case, centre < level) {
                let (e0, e1) = (s0.key(r, c), s1.key(r, c));
                link(&mut links, e0, e1);
                link(&mut links, e1, e0);
                first.get_or_insert((e0, e1));
            }
        }
    }

    let (start, mut current) = first?;
    let mut previous = start;
    let mut ring = vec![crossing(grid, start, level)];
    // Each edge is visited at most once on a closed ring.
    for _ in 0..links.len() {
        if current == start {
            ring.push(ring[0]);
            return Some(ring);
        }
        ring.push(crossing(grid, current, level));
        let next = links
            .get(&current)?
            .iter()
            .flatten()
            .copied()
            .find(|&e| e != previous)?;
        previous = current;
        current = next;
    }
    None
}

fn link(links: &mut HashMap<EdgeKey, [Option<EdgeKey>; 2]>, from: EdgeKey, to: EdgeKey) {
    let slots = links.entry(from).or_insert([None, None]);
    if slots[0].is_none() {
        slots[0] = Some(to);
    } else if slots[1].is_none() {
        slots[1] = Some(to);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_low_node_gives_diamond() {
        let mut grid = Array2::from_elem((3, 3), 1.0);
        grid[[1, 1]] = 0.0;
        let ring = first_closed_contour(&grid, 0.5).unwrap();
        assert_eq!(ring.len(), 5);
        assert_eq!(ring.first(), ring.last());
        for p in &ring {
            let d = (p[0] - 1.0).abs() + (p[1] - 1.0).abs();
            assert!((d - 0.5).abs() < 1e-12, "point {p:?} off the diamond");
        }
    }

    #[test]
    fn test_flat_grid_has_no_contour() {
        let grid = Array2::from_elem((4, 4), 1.0);
        assert!(first_closed_contour(&grid, 0.5).is_none());
    }

    #[test]
    fn test_interpolation_position() {
        let mut grid = Array2::from_elem((3, 4), 1.0);
        grid[[1, 1]] = 0.0;
        grid[[1, 2]] = 0.0;
        let ring = first_closed_contour(&grid, 0.25).unwrap();
        // Crossing between (1, 0)=1.0 and (1, 1)=0.0 sits at x = 0.75.
        assert!(ring.iter().any(|p| (p[0] - 0.75).abs() < 1e-12 && (p[1] - 1.0).abs() < 1e-12));
        assert_eq!(ring.first(), ring.last());
    }

    #[test]
    fn test_saddle_joined_when_centre_low() {
        // Diagonal lows with a low centre merge into one ring.
        let mut grid = Array2::from_elem((4, 4), 1.0);
        grid[[1, 1]] = 0.0;
        grid[[2, 2]] = 0.0;
        // Centre mean is 0.5 for both levels.
        let joined = first_closed_contour(&grid, 0.6).unwrap();
        let split = first_closed_contour(&grid, 0.4).unwrap();
        assert_eq!(joined.len(), 9);
        assert_eq!(split.len(), 5);
    }
}
