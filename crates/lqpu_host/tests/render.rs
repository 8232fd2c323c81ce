use lqpu_core::{LqpuError, PollLimit, SessionConfig, Strategy};
use lqpu_host::fractal::{render_reference, simulated_kernel};
use lqpu_host::mandel::{BatchFailed, MandelArgs, RenderOptions, SENTINEL, render};
use lqpu_host::program;
use lqpu_io::{NpyWriter, load_npy};
use lqpu_sim::{Completion, FaultPoint, FirmwareCall, SimFirmware};
use std::time::Duration;

fn args(width: usize, height: usize) -> MandelArgs {
    MandelArgs {
        re_min: -2.0,
        re_max: 1.0,
        im_min: -1.5,
        width,
        height,
        max_iter: 100,
        max_value: 4.0,
    }
}

fn mailbox(timeout_ms: u64) -> Strategy {
    Strategy::Mailbox {
        timeout: Duration::from_millis(timeout_ms),
        flush: false,
    }
}

fn mandel_sim() -> SimFirmware {
    let sim = SimFirmware::default();
    sim.set_kernel(simulated_kernel());
    sim
}

fn collect(
    sim: &SimFirmware,
    strategy: Strategy,
    args: &MandelArgs,
    units: u32,
    options: RenderOptions,
) -> anyhow::Result<Vec<u32>> {
    let mut field = Vec::new();
    render(
        sim.clone(),
        &sim.session_config(strategy),
        args,
        units,
        &program::program(),
        options,
        |band| {
            assert_eq!(band.len(), units as usize * args.width);
            field.extend_from_slice(band);
            Ok(())
        },
    )?;
    Ok(field)
}

#[test]
fn single_band_writes_every_pixel() {
    let sim = mandel_sim();
    let a = args(16, 12);
    let field = collect(&sim, mailbox(2000), &a, 12, RenderOptions::default()).unwrap();

    assert_eq!(field.len(), 16 * 12);
    assert!(field.iter().all(|&n| n != SENTINEL && n <= a.max_iter));
    assert_eq!(field, render_reference(&a));
    assert!(!sim.is_claimed());
    assert_eq!(sim.live_allocations(), 0);
}

#[test]
fn bands_cover_the_field_in_row_order() {
    let sim = mandel_sim();
    let a = args(64, 48);
    let field = collect(&sim, mailbox(2000), &a, 12, RenderOptions::default()).unwrap();
    assert_eq!(field, render_reference(&a));

    let executes = sim
        .calls()
        .iter()
        .filter(|c| matches!(c, FirmwareCall::ExecuteQpu { num: 12, .. }))
        .count();
    assert_eq!(executes, 4);
}

#[test]
fn direct_strategy_matches_reference() {
    let sim = mandel_sim();
    let a = args(32, 32);
    let strategy = Strategy::Direct {
        limit: PollLimit::Unbounded,
    };
    let field = collect(&sim, strategy, &a, 16, RenderOptions::default()).unwrap();
    assert_eq!(field, render_reference(&a));
}

#[test]
fn debug_and_counters_do_not_change_result() {
    let sim = mandel_sim();
    let a = args(16, 24);
    let options = RenderOptions {
        debug: true,
        perf_counters: true,
    };
    let mut field = Vec::new();
    let summary = render(
        sim.clone(),
        &sim.session_config(mailbox(2000)),
        &a,
        12,
        &program::program(),
        options,
        |band| {
            field.extend_from_slice(band);
            Ok(())
        },
    )
    .unwrap();

    assert_eq!(field, render_reference(&a));
    assert_eq!(summary.batches.count, 2);
    let counters = summary.counters.unwrap();
    assert_eq!(counters.values.len(), 10);
}

#[test]
fn invalid_shapes_fail_before_any_firmware_call() {
    let sim = mandel_sim();
    let err = collect(&sim, mailbox(2000), &args(15, 12), 12, RenderOptions::default())
        .unwrap_err()
        .to_string();
    assert!(err.starts_with("Invalid width!"), "{err}");

    let err = collect(&sim, mailbox(2000), &args(16, 13), 12, RenderOptions::default())
        .unwrap_err()
        .to_string();
    assert!(err.starts_with("Invalid height!"), "{err}");

    assert!(sim.calls().is_empty());
}

#[test]
fn acquisition_failure_surfaces_status() {
    let sim = mandel_sim();
    sim.fail(FaultPoint::MemAlloc);
    let err = collect(&sim, mailbox(2000), &args(16, 12), 12, RenderOptions::default())
        .unwrap_err();
    let lqpu = err.downcast_ref::<LqpuError>().unwrap();
    assert_eq!(*lqpu, LqpuError::OutOfMemory);
    assert_eq!(lqpu.status(), Some(3));
    assert!(err.downcast_ref::<BatchFailed>().is_none());
    assert!(!sim.is_claimed());
}

#[test]
fn timeout_aborts_remaining_bands() {
    let sim = mandel_sim();
    sim.set_kernel(|_| Completion::Never);
    let mut bands = 0;
    let a = args(16, 36);
    let err = render(
        sim.clone(),
        &sim.session_config(mailbox(50)),
        &a,
        12,
        &program::program(),
        RenderOptions::default(),
        |_| {
            bands += 1;
            Ok(())
        },
    )
    .unwrap_err();

    assert_eq!(bands, 0);
    assert_eq!(err.downcast_ref::<LqpuError>(), Some(&LqpuError::Timeout));
    let batch = err.downcast_ref::<BatchFailed>().unwrap();
    assert_eq!((batch.band, batch.bands), (0, 3));
    assert!(batch.elapsed >= Duration::from_millis(50));
    assert!(format!("{err:#}").starts_with("batch 0 of 3 failed"));
    let executes = sim
        .calls()
        .iter()
        .filter(|c| matches!(c, FirmwareCall::ExecuteQpu { .. }))
        .count();
    assert_eq!(executes, 1);
    assert!(!sim.is_enabled());
    assert_eq!(sim.live_allocations(), 0);
}

#[test]
fn sink_failure_releases_session() {
    let sim = mandel_sim();
    let err = render(
        sim.clone(),
        &sim.session_config(mailbox(2000)),
        &args(16, 24),
        12,
        &program::program(),
        RenderOptions::default(),
        |_| anyhow::bail!("disk full"),
    )
    .unwrap_err();
    assert!(format!("{err:#}").contains("disk full"));
    assert_eq!(err.downcast_ref::<BatchFailed>().map(|b| b.band), Some(0));
    assert!(!sim.is_claimed());
}

#[test]
fn bypassing_l2_allocates_direct_memory() {
    let sim = mandel_sim();
    let a = args(16, 12);
    let config = SessionConfig {
        use_l2_cache: false,
        ..sim.session_config(mailbox(2000))
    };
    let mut field = Vec::new();
    render(
        sim.clone(),
        &config,
        &a,
        12,
        &program::program(),
        RenderOptions::default(),
        |band| {
            field.extend_from_slice(band);
            Ok(())
        },
    )
    .unwrap();

    assert!(
        sim.calls()
            .iter()
            .any(|c| matches!(c, FirmwareCall::MemAlloc { flags: 0x4, .. }))
    );
    assert_eq!(field, render_reference(&a));
}

#[test]
fn bands_stream_into_npy_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("field.npy");
    let sim = mandel_sim();
    let a = args(32, 24);

    let mut writer = NpyWriter::create(&path, a.height, a.width).unwrap();
    render(
        sim.clone(),
        &sim.session_config(mailbox(2000)),
        &a,
        12,
        &program::program(),
        RenderOptions::default(),
        |band| writer.write_rows(band),
    )
    .unwrap();
    writer.finish().unwrap();

    let loaded = load_npy(&path).unwrap();
    assert_eq!((loaded.rows, loaded.cols), (24, 32));
    assert_eq!(loaded.data, render_reference(&a));
}
