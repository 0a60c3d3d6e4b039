use anyhow::Result;
use rand::distr::Uniform;
use rand::prelude::*;

/// Candidates tried around an active point before it is retired.
pub const DEFAULT_ATTEMPTS: usize = 30;

/// Bridson Poisson-disk sampling in `[0, width) x [0, height)`.
///
/// Every pair of returned points is at least `min_gap` apart.
pub fn generate_points(
    min_gap: f32,
    width: f32,
    height: f32,
    attempts: usize,
    rng: &mut StdRng,
) -> Result<Vec<(f32, f32)>> {
    if min_gap <= 0.0 || width <= 0.0 || height <= 0.0 {
        anyhow::bail!("Poisson sampling needs a positive gap and area (gap {}, {}x{}).", min_gap, width, height);
    }
    let cell_size = min_gap / std::f32::consts::SQRT_2;
    let cols = (width / cell_size).ceil() as usize;
    let rows = (height / cell_size).ceil() as usize;
    let mut lookup: Vec<Option<usize>> = vec![None; cols * rows];

    let unit = Uniform::new(0.0f32, 1.0f32)?;
    let angle_dist = Uniform::new(0.0f32, 2.0 * std::f32::consts::PI)?;
    let radius_dist = Uniform::new(min_gap, 2.0 * min_gap)?;

    let slot = |x: f32, y: f32| -> (usize, usize) {
        (((x / cell_size) as usize).min(cols - 1), ((y / cell_size) as usize).min(rows - 1))
    };

    let mut points = Vec::new();
    let mut active = Vec::new();

    let first = (rng.sample(unit) * width, rng.sample(unit) * height);
    let (c, r) = slot(first.0, first.1);
    lookup[r * cols + c] = Some(0);
    points.push(first);
    active.push(0usize);

    let min_gap_sq = min_gap * min_gap;
    while !active.is_empty() {
        let active_slot = rng.random_range(0..active.len());
        let current = points[active[active_slot]];
        let mut found = false;

        for _ in 0..attempts {
            let angle: f32 = rng.sample(angle_dist);
            let radius: f32 = rng.sample(radius_dist);
            let x = current.0 + angle.cos() * radius;
            let y = current.1 + angle.sin() * radius;
            if x < 0.0 || x >= width || y < 0.0 || y >= height {
                continue;
            }

            let (cc, cr) = slot(x, y);
            let too_close = (cc.saturating_sub(2)..=(cc + 2).min(cols - 1)).any(|nc| {
                (cr.saturating_sub(2)..=(cr + 2).min(rows - 1)).any(|nr| {
                    lookup[nr * cols + nc].is_some_and(|p| {
                        let (px, py) = points[p];
                        (x - px) * (x - px) + (y - py) * (y - py) < min_gap_sq
                    })
                })
            });
            if too_close {
                continue;
            }

            lookup[cr * cols + cc] = Some(points.len());
            active.push(points.len());
            points.push((x, y));
            found = true;
            break;
        }

        if !found {
            active.swap_remove(active_slot);
        }
    }

    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn points_respect_gap_and_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let points = generate_points(1.5, 20.0, 10.0, DEFAULT_ATTEMPTS, &mut rng).unwrap();
        assert!(points.len() > 20);
        for (i, a) in points.iter().enumerate() {
            assert!(a.0 >= 0.0 && a.0 < 20.0 && a.1 >= 0.0 && a.1 < 10.0);
            for b in &points[i + 1..] {
                let d = ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt();
                assert!(d >= 1.5 - 1e-4);
            }
        }
    }

    #[test]
    fn same_seed_same_points() {
        let a = generate_points(2.0, 10.0, 10.0, DEFAULT_ATTEMPTS, &mut StdRng::seed_from_u64(1)).unwrap();
        let b = generate_points(2.0, 10.0, 10.0, DEFAULT_ATTEMPTS, &mut StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_zero_gap() {
        assert!(generate_points(0.0, 10.0, 10.0, DEFAULT_ATTEMPTS, &mut StdRng::seed_from_u64(1)).is_err());
    }
}
