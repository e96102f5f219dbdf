use tracing::info;

use crate::error::Result;
use crate::factorization::{validate_permutation, CnmfOptions, MergeInput};

use super::bundle::ResultBundle;
use super::checkpoint::ComponentOrder;
use super::orchestrator::RunContext;
use super::types::PipelineStage;

/// Whole-frame factorization: preprocess, initialize, update, merge,
/// update again, order.
pub(super) fn run(ctx: &RunContext<'_>) -> Result<ResultBundle> {
    let lib = ctx.library;
    let pool = ctx.pool;
    let stages = &ctx.stages;
    let yr = ctx.recording.flat()?;
    let cube = ctx.recording.cube()?;
    let opts = CnmfOptions::single_pass(
        ctx.config,
        ctx.recording.dims(),
        pool.workers(),
        ctx.p,
        ctx.n_components,
    );

    let noise = stages.run(PipelineStage::Preprocessing, None, || {
        pool.install(|| lib.preprocess(yr, &opts))
    })?;
    let init = stages.run(PipelineStage::Initialization, None, || {
        pool.install(|| lib.initialize_components(cube, &opts))
    })?;
    let spatial = stages.run(PipelineStage::SpatialUpdate, None, || {
        pool.install(|| lib.update_spatial(yr, &init.c, &init.f, &init.a, &noise.sn, &opts))
    })?;
    let temporal = stages.run(PipelineStage::TemporalUpdate, None, || {
        pool.install(|| lib.update_temporal(yr, &spatial.a, &spatial.b, &spatial.c, &init.f, &opts))
    })?;

    let merged = stages.run(PipelineStage::Merging, None, || {
        let input = MergeInput {
            a: &spatial.a,
            b: &spatial.b,
            c: &temporal.c,
            f: &temporal.f,
            s: &temporal.s,
            sn: &noise.sn,
            bl: Some(&temporal.bl),
            c1: Some(&temporal.c1),
            neurons_sn: Some(&temporal.neurons_sn),
            g: Some(&temporal.g),
        };
        pool.install(|| lib.merge_components(yr, input, &opts))
    })?;
    info!(
        before = spatial.a.ncols(),
        after = merged.n_components(),
        groups = merged.merged.len(),
        "Merged overlapping components"
    );

    let refined = stages.run(PipelineStage::RefineSpatial, None, || {
        pool.install(|| lib.update_spatial(yr, &merged.c, &temporal.f, &merged.a, &noise.sn, &opts))
    })?;
    let final_temporal = stages.run(PipelineStage::RefineTemporal, None, || {
        pool.install(|| {
            lib.update_temporal(yr, &refined.a, &refined.b, &refined.c, &temporal.f, &opts)
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

/// Ask the library for a significance ordering and apply it to every
/// per-component field.
pub(super) fn order(ctx: &RunContext<'_>, bundle: ResultBundle) -> Result<ResultBundle> {
    let lib = ctx.library;
    let ComponentOrder(order) = ctx.stages.run(PipelineStage::Ordering, None, || {
        ctx.pool
            .install(|| lib.order_components(&bundle.a, &bundle.c))
            .map(ComponentOrder)
    })?;
    validate_permutation(&order, bundle.n_components())?;
    Ok(bundle.reordered(&order))
}
