use std::sync::atomic::{AtomicUsize, Ordering};

use ndarray::{s, Array1, Array2, ArrayView2, ArrayView3};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::cache::RecordingDims;
use crate::error::{CnmfError, Result};
use crate::factorization::{
    patched_pixel_budget, CnmfOptions, Factorization, MergeInput, PatchComponents,
};

use super::bundle::ResultBundle;
use super::orchestrator::RunContext;
use super::patches::{patch_grid, Patch};
use super::single::order;
use super::types::PipelineStage;

/// Patch-decomposed factorization: solve overlapping patches in parallel,
/// combine them, then merge and refine globally.
pub(super) fn run(ctx: &RunContext<'_>) -> Result<ResultBundle> {
    let lib = ctx.library;
    let pool = ctx.pool;
    let stages = &ctx.stages;
    let yr = ctx.recording.flat()?;
    let cube = ctx.recording.cube()?;
    let dims = ctx.recording.dims();
    let workers = pool.workers();
    let opts = CnmfOptions::patched(ctx.config, dims, workers, ctx.p, ctx.n_components);

    let patch_cfg = &ctx.config.patches;
    let patches = patch_grid(dims.height, dims.width, patch_cfg.half_size, patch_cfg.stride)?;
    info!(
        patches = patches.len(),
        side = 2 * patch_cfg.half_size + 1,
        stride = patch_cfg.stride,
        components_per_patch = opts.init.k,
        "Patch grid ready"
    );

    let per_patch = stages.run(PipelineStage::PatchFactorization, Some(patches.len()), || {
        let reporter = stages.reporter();
        let done = AtomicUsize::new(0);
        let solved: Vec<PatchComponents> = pool.install(|| {
            patches
                .par_iter()
                .map(|patch| {
                    let result = solve_patch(lib, yr, cube, patch, &opts);
                    reporter.advance(done.fetch_add(1, Ordering::Relaxed) + 1);
                    result
                })
                .collect::<Result<Vec<_>>>()
        })?;
        lift_patches(&solved, &patches, dims)
    })?;

    let reduced = stages.run(PipelineStage::PatchReduction, None, || {
        pool.install(|| lib.reduce_patches(yr, &per_patch, &patches, &opts))
    })?;
    info!(
        before = per_patch.n_components(),
        after = reduced.n_components(),
        "Combined patch components"
    );

    let budget = patched_pixel_budget(dims, workers, patch_cfg.memory_safety_frames);
    let global = opts.for_global_refinement(reduced.n_components(), budget);
    debug!(pixels_per_process = budget, "Global update budget");

    let merged = stages.run(PipelineStage::Merging, None, || {
        // No deconvolution has happened yet, so the traces stand in for S.
        let input = MergeInput {
            a: &reduced.a,
            b: &reduced.b,
            c: &reduced.c,
            f: &reduced.f,
            s: &reduced.c,
            sn: &reduced.sn,
            bl: None,
            c1: None,
            neurons_sn: None,
            g: None,
        };
        pool.install(|| lib.merge_components(yr, input, &global))
    })?;
    info!(
        before = reduced.n_components(),
        after = merged.n_components(),
        groups = merged.merged.len(),
        "Merged overlapping components"
    );

    let refined = stages.run(PipelineStage::RefineSpatial, None, || {
        pool.install(|| lib.update_spatial(yr, &merged.c, &reduced.f, &merged.a, &reduced.sn, &global))
    })?;
    let final_temporal = stages.run(PipelineStage::RefineTemporal, None, || {
        pool.install(|| {
            lib.update_temporal(yr, &refined.a, &refined.b, &refined.c, &reduced.f, &global)
        })
    })?;

    let bundle = ResultBundle {
        a: refined.a,
        c: final_temporal.c,
        yra: final_temporal.yra,
        s: final_temporal.s,
        bl: final_temporal.bl,
    };
    order(ctx, bundle)
}

/// Preprocess, initialize and update one patch on the calling worker.
/// The result is in patch-local pixel coordinates.
fn solve_patch(
    lib: &dyn Factorization,
    yr: ArrayView2<'_, f32>,
    cube: ArrayView3<'_, f32>,
    patch: &Patch,
    opts: &CnmfOptions,
) -> Result<PatchComponents> {
    let frame_height = opts.dims.height;
    let local_yr = patch.flat_rows(&yr, frame_height);
    let local_cube = patch.cube_view(cube);
    let popts = opts.for_patch(patch);

    let noise = lib.preprocess(local_yr.view(), &popts)?;
    let init = lib.initialize_components(local_cube, &popts)?;
    let spatial = lib.update_spatial(local_yr.view(), &init.c, &init.f, &init.a, &noise.sn, &popts)?;
    let temporal = lib.update_temporal(
        local_yr.view(),
        &spatial.a,
        &spatial.b,
        &spatial.c,
        &init.f,
        &popts,
    )?;
    debug!(
        patch = patch.index,
        rows = ?patch.rows,
        cols = ?patch.cols,
        components = spatial.a.ncols(),
        "Patch solved"
    );
    Ok(PatchComponents {
        a: spatial.a,
        c: temporal.c,
        b: spatial.b,
        f: temporal.f,
        sn: noise.sn,
    })
}

/// Lift patch-local estimates into full-frame pixel coordinates and stack
/// them. Footprints and backgrounds get one column per patch component;
/// pixel noise is averaged where patches overlap.
pub fn lift_patches(
    solved: &[PatchComponents],
    patches: &[Patch],
    dims: RecordingDims,
) -> Result<PatchComponents> {
    let pixels = dims.pixels();
    for (local, patch) in solved.iter().zip(patches) {
        let n = patch.pixels();
        let shapes_ok = local.a.nrows() == n
            && local.b.nrows() == n
            && local.sn.len() == n
            && local.c.dim() == (local.a.ncols(), dims.frames)
            && local.f.dim() == (local.b.ncols(), dims.frames);
        if !shapes_ok {
            return Err(CnmfError::DimensionMismatch(format!(
                "patch {} ({} pixels): A {:?}, b {:?}, C {:?}, f {:?}, sn {}",
                patch.index,
                n,
                local.a.dim(),
                local.b.dim(),
                local.c.dim(),
                local.f.dim(),
                local.sn.len()
            )));
        }
    }

    let k_total: usize = solved.iter().map(|p| p.a.ncols()).sum();
    let nb_total: usize = solved.iter().map(|p| p.b.ncols()).sum();
    let mut a = Array2::<f64>::zeros((pixels, k_total));
    let mut b = Array2::<f64>::zeros((pixels, nb_total));
    let mut c = Array2::<f64>::zeros((k_total, dims.frames));
    let mut f = Array2::<f64>::zeros((nb_total, dims.frames));
    let mut sn_sum = Array1::<f64>::zeros(pixels);
    let mut sn_count = Array1::<f64>::zeros(pixels);

    let (mut k_off, mut b_off) = (0, 0);
    for (local, patch) in solved.iter().zip(patches) {
        let (k, nb) = (local.a.ncols(), local.b.ncols());
        for (l, g) in patch.global_indices(dims.height).into_iter().enumerate() {
            a.slice_mut(s![g, k_off..k_off + k]).assign(&local.a.row(l));
            b.slice_mut(s![g, b_off..b_off + nb]).assign(&local.b.row(l));
            sn_sum[g] += local.sn[l];
            sn_count[g] += 1.0;
        }
        c.slice_mut(s![k_off..k_off + k, ..]).assign(&local.c);
        f.slice_mut(s![b_off..b_off + nb, ..]).assign(&local.f);
        k_off += k;
        b_off += nb;
    }

    let sn = Array1::from_iter(
        sn_sum
            .iter()
            .zip(&sn_count)
            .map(|(&s, &n)| if n > 0.0 { s / n } else { 0.0 }),
    );
    Ok(PatchComponents { a, c, b, f, sn })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lift_patches_places_footprints_and_averages_noise() {
        let dims = RecordingDims {
            height: 3,
            width: 3,
            frames: 2,
        };
        let patches = vec![
            Patch {
                index: 0,
                rows: 0..3,
                cols: 0..2,
            },
            Patch {
                index: 1,
                rows: 0..3,
                cols: 1..3,
            },
        ];
        let local = |value: f64| PatchComponents {
            a: Array2::from_elem((6, 1), value),
            c: Array2::from_elem((1, 2), value),
            b: Array2::zeros((6, 1)),
            f: Array2::zeros((1, 2)),
            sn: Array1::from_elem(6, value),
        };
        let lifted = lift_patches(&[local(1.0), local(3.0)], &patches, dims).unwrap();
        assert_eq!(lifted.a.dim(), (9, 2));
        // column 0 of the frame belongs only to patch 0
        assert_eq!(lifted.a[[0, 0]], 1.0);
        assert_eq!(lifted.a[[0, 1]], 0.0);
        // column 2 only to patch 1
        assert_eq!(lifted.a[[8, 1]], 3.0);
        assert_eq!(lifted.a[[8, 0]], 0.0);
        // column 1 is shared: noise is averaged
        assert_eq!(lifted.sn[4], 2.0);
        assert_eq!(lifted.sn[0], 1.0);
        assert_eq!(lifted.c.row(1).to_vec(), vec![3.0, 3.0]);
    }

    #[test]
    fn test_lift_patches_rejects_wrong_shape() {
        let dims = RecordingDims {
            height: 2,
            width: 2,
            frames: 1,
        };
        let patch = Patch {
            index: 0,
            rows: 0..2,
            cols: 0..2,
        };
        let bad = PatchComponents {
            a: Array2::zeros((3, 1)),
            c: Array2::zeros((1, 1)),
            b: Array2::zeros((4, 1)),
            f: Array2::zeros((1, 1)),
            sn: Array1::zeros(4),
        };
        assert!(lift_patches(&[bad], &[patch], dims).is_err());
    }
}
