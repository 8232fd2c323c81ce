use lqpu_common::records::RegionHeader;
use lqpu_core::dispatch::encode_words;
use lqpu_core::{
    Discovery, DispatchLayout, LayoutPlan, LqpuError, ParameterBlock, PollLimit, ProgramImage,
    SessionConfig, SharedRegion, Strategy,
};
use lqpu_sim::{Completion, FaultPoint, FirmwareCall, SIM_CHANNEL, SimFirmware};
use rand::Rng;
use std::time::{Duration, Instant};

const PERI: (u32, u32) = (0x2000_0000, 0x0100_0000);
const TILE_WORDS: usize = 16;

#[derive(Debug)]
struct TileParams {
    unit: u32,
    output: u32,
}

impl ParameterBlock for TileParams {
    const SIZE: usize = 8;

    fn encode(&self, out: &mut [u8]) {
        encode_words(out, &[self.unit, self.output]);
    }
}

/// Writes `unit + 1` into every word of the unit's tile.
fn tile_kernel(sim: &SimFirmware) {
    sim.set_kernel(|ctx| {
        let params = ctx.uniforms(2);
        for w in 0..TILE_WORDS as u32 {
            ctx.write(params[1] + 4 * w, params[0] + 1);
        }
        Completion::Done
    });
}

fn mailbox() -> Strategy {
    Strategy::Mailbox {
        timeout: Duration::from_millis(2000),
        flush: false,
    }
}

fn plan(program: &ProgramImage<'_>, units: u32) -> LayoutPlan {
    LayoutPlan::new::<TileParams>(program, units, TILE_WORDS * 4, false)
}

#[test]
fn random_sizes_yield_aligned_regions_large_enough() {
    let mut rng = rand::thread_rng();
    let sim = SimFirmware::default();
    let config = sim.session_config(mailbox());

    for _ in 0..64 {
        let size = rng.gen_range(1..=512 * 1024);
        let region = SharedRegion::allocate(sim.clone(), &config, size).unwrap();
        assert!(region.payload_size() >= size);
        assert!(region.size() >= size + RegionHeader::SPAN);
        assert_eq!(region.size() % 4096, 0);
        assert_eq!(region.base().bus % 4096, 0);
        assert_eq!(region.payload_cursor().unwrap().offset() % 16, 0);
        region.release();
        assert_eq!(sim.live_allocations(), 0);
    }
}

#[test]
fn header_mirrors_session_state() {
    let sim = SimFirmware::default();
    let region = SharedRegion::allocate(sim.clone(), &sim.session_config(mailbox()), 100).unwrap();
    let header = region.header();

    assert_eq!(header.channel, SIM_CHANNEL);
    assert_eq!(header.handle, region.handle().get());
    assert_eq!(header.size, 4096);
    assert_eq!(header.bus_base, region.base().bus);
    assert_eq!(header.peri_size, PERI.1);
}

#[test]
fn each_failed_step_rolls_back_everything_before_it() {
    let acquired = [
        FirmwareCall::Claim,
        FirmwareCall::Enable(true),
        FirmwareCall::MemAlloc {
            size: 4096,
            align: 4096,
            flags: 0xC,
        },
        FirmwareCall::MapRegisters {
            phys: PERI.0,
            size: PERI.1,
        },
        FirmwareCall::MemLock(1),
        FirmwareCall::MapMemory { phys: 0, size: 4096 },
    ];

    for (step, point) in FaultPoint::ALL.into_iter().enumerate() {
        let sim = SimFirmware::default();
        sim.fail(point);
        let err = SharedRegion::allocate(sim.clone(), &sim.session_config(mailbox()), 100)
            .unwrap_err();

        let (expected_err, rollback) = match point {
            FaultPoint::Claim => (LqpuError::AlreadyClaimed, vec![]),
            FaultPoint::Enable => (LqpuError::EnableFailed, vec![FirmwareCall::Unclaim]),
            FaultPoint::MemAlloc => (
                LqpuError::OutOfMemory,
                vec![FirmwareCall::Enable(false), FirmwareCall::Unclaim],
            ),
            FaultPoint::MapRegisters => (
                LqpuError::PeripheralMapFailed,
                vec![
                    FirmwareCall::MemFree(1),
                    FirmwareCall::Enable(false),
                    FirmwareCall::Unclaim,
                ],
            ),
            FaultPoint::MemLock => (
                LqpuError::LockFailed(1),
                vec![
                    FirmwareCall::UnmapRegisters,
                    FirmwareCall::MemFree(1),
                    FirmwareCall::Enable(false),
                    FirmwareCall::Unclaim,
                ],
            ),
            FaultPoint::MapMemory => (
                LqpuError::RegionMapFailed(0),
                vec![
                    FirmwareCall::MemUnlock(1),
                    FirmwareCall::UnmapRegisters,
                    FirmwareCall::MemFree(1),
                    FirmwareCall::Enable(false),
                    FirmwareCall::Unclaim,
                ],
            ),
            other => unreachable!("{other:?} is not an acquisition step"),
        };
        assert_eq!(err, expected_err, "fault at {point:?}");

        let mut expected = acquired[..=step].to_vec();
        expected.extend(rollback);
        assert_eq!(sim.calls(), expected, "fault at {point:?}");

        assert!(!sim.is_claimed());
        assert!(!sim.is_enabled());
        assert_eq!(sim.live_allocations(), 0);
    }
}

#[test]
fn failure_codes_match_status_table() {
    assert_eq!(LqpuError::EnableFailed.status(), Some(1));
    assert_eq!(LqpuError::OutOfMemory.status(), Some(3));
    assert_eq!(LqpuError::LockFailed(1).status(), Some(3));
    assert_eq!(LqpuError::PeripheralMapFailed.status(), Some(4));
    assert_eq!(LqpuError::RegionMapFailed(0).status(), Some(4));
}

#[test]
fn release_unwinds_in_reverse_order() {
    let sim = SimFirmware::default();
    let region = SharedRegion::allocate(sim.clone(), &sim.session_config(mailbox()), 5000).unwrap();
    let handle = region.handle().get();
    sim.clear_calls();

    region.release();

    assert_eq!(
        sim.calls(),
        vec![
            FirmwareCall::UnmapRegisters,
            FirmwareCall::UnmapMemory { phys: 0, size: 8192 },
            FirmwareCall::MemUnlock(handle),
            FirmwareCall::MemFree(handle),
            FirmwareCall::Enable(false),
            FirmwareCall::Unclaim,
        ]
    );
    assert!(!sim.is_claimed());
    assert!(!sim.is_enabled());
}

#[test]
fn second_session_is_refused_while_first_lives() {
    let sim = SimFirmware::default();
    let config = sim.session_config(mailbox());
    let first = SharedRegion::allocate(sim.clone(), &config, 64).unwrap();

    assert_eq!(
        SharedRegion::allocate(sim.clone(), &config, 64).unwrap_err(),
        LqpuError::AlreadyClaimed
    );
    assert!(sim.is_enabled(), "refused session must not touch the live one");

    drop(first);
    let again = SharedRegion::allocate(sim.clone(), &config, 64).unwrap();
    again.release();
}

#[test]
fn precondition_errors_reach_no_firmware() {
    let sim = SimFirmware::default();
    assert_eq!(
        SharedRegion::allocate(sim.clone(), &sim.session_config(mailbox()), 0).unwrap_err(),
        LqpuError::EmptyRequest
    );

    let strict = SessionConfig {
        discovery: Discovery::Probe {
            library: "liblqpu-missing-host.so".into(),
            strict: true,
        },
        ..sim.session_config(mailbox())
    };
    let err = SharedRegion::allocate(sim.clone(), &strict, 64).unwrap_err();
    assert_eq!(err, LqpuError::LibraryMissing);
    assert_eq!(err.status(), Some(2));
    assert!(sim.calls().is_empty());
}

#[test]
fn sizes_past_the_firmware_limit_fail_without_calls() {
    let sim = SimFirmware::default();
    let config = sim.session_config(mailbox());
    for size in [usize::MAX, usize::MAX - RegionHeader::SPAN, u32::MAX as usize] {
        assert_eq!(
            SharedRegion::allocate(sim.clone(), &config, size).unwrap_err(),
            LqpuError::OutOfMemory,
            "size {size:#x}"
        );
    }
    assert!(sim.calls().is_empty());
}

#[test]
fn payload_is_laid_out_only_once() {
    let sim = SimFirmware::default();
    let region = SharedRegion::allocate(sim.clone(), &sim.session_config(mailbox()), 4096).unwrap();
    let code = [0u8; 16];
    let program = ProgramImage::new(&code);

    let mut cursor = region.payload_cursor().unwrap();
    let layout = DispatchLayout::build(&mut cursor, &program, &plan(&program, 2), |b| TileParams {
        unit: b.unit,
        output: b.output_bus,
    })
    .unwrap();

    assert_eq!(region.payload_cursor().unwrap_err(), LqpuError::AlreadyLaidOut);
    let first = layout.dispatch_message(0).unwrap();
    assert_eq!(sim.read_bus(layout.message_bus()), Some(first.uniforms_bus));
    assert_eq!(sim.read_bus(first.uniforms_bus), Some(0));
}

#[test]
fn message_addresses_follow_cursor_offsets() {
    let sim = SimFirmware::default();
    let region = SharedRegion::allocate(sim.clone(), &sim.session_config(mailbox()), 4096).unwrap();
    let code = [0u8; 24];
    let program = ProgramImage::new(&code);
    let base = region.base().bus;

    let mut cursor = region.payload_cursor().unwrap();
    let start = cursor.offset() as u32;
    let layout = DispatchLayout::build(&mut cursor, &program, &plan(&program, 5), |b| TileParams {
        unit: b.unit,
        output: b.output_bus,
    })
    .unwrap();

    let code_bus = base + start;
    let params_bus = code_bus + 32;
    let messages_bus = params_bus + 5 * 8;
    assert_eq!(layout.message_bus(), messages_bus);
    for unit in 0..5 {
        let msg = layout.dispatch_message(unit).unwrap();
        assert_eq!(msg.code_bus, code_bus);
        assert_eq!(msg.uniforms_bus, params_bus + unit * 8);
        // The accelerator sees the same bytes through the bus address.
        assert_eq!(sim.read_bus(messages_bus + unit * 8), Some(msg.uniforms_bus));
        assert_eq!(sim.read_bus(msg.uniforms_bus), Some(unit));
    }
}

fn run_tiles(strategy: Strategy, units: u32) {
    let sim = SimFirmware::default();
    tile_kernel(&sim);
    let program_bytes = [0u8; 16];
    let program = ProgramImage::new(&program_bytes);
    let plan = plan(&program, units);

    let region =
        SharedRegion::allocate(
            sim.clone(),
            &sim.session_config(strategy),
            plan.required_size().unwrap(),
        )
            .unwrap();
    let mut cursor = region.payload_cursor().unwrap();
    let mut layout = DispatchLayout::build(&mut cursor, &program, &plan, |b| TileParams {
        unit: b.unit,
        output: b.output_bus,
    })
    .unwrap();

    layout.fill_output(u32::MAX);
    region.execute(layout.message_bus(), units).unwrap();

    let mut tile = [0u32; TILE_WORDS];
    for unit in 0..units {
        layout.read_tile(unit, &mut tile).unwrap();
        assert!(tile.iter().all(|&w| w == unit + 1), "unit {unit}: {tile:?}");
    }
}

#[test]
fn mailbox_execution_writes_every_tile() {
    run_tiles(mailbox(), 12);
}

#[test]
fn direct_execution_writes_every_tile() {
    run_tiles(
        Strategy::Direct {
            limit: PollLimit::Unbounded,
        },
        12,
    );
    run_tiles(
        Strategy::Direct {
            limit: PollLimit::Spins(10),
        },
        16,
    );
}

#[test]
fn mailbox_timeout_returns_within_bound() {
    let sim = SimFirmware::default();
    sim.set_kernel(|_| Completion::Never);
    let strategy = Strategy::Mailbox {
        timeout: Duration::from_millis(100),
        flush: false,
    };
    let program = ProgramImage::new(&[0u8; 16]);
    let plan = plan(&program, 4);
    let region =
        SharedRegion::allocate(
            sim.clone(),
            &sim.session_config(strategy),
            plan.required_size().unwrap(),
        )
            .unwrap();
    let mut cursor = region.payload_cursor().unwrap();
    let layout = DispatchLayout::build(&mut cursor, &program, &plan, |b| TileParams {
        unit: b.unit,
        output: b.output_bus,
    })
    .unwrap();

    let start = Instant::now();
    let err = region.execute(layout.message_bus(), 4).unwrap_err();
    let elapsed = start.elapsed();

    assert_eq!(err, LqpuError::Timeout);
    assert_eq!(err.status(), Some(0x8000_0000));
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(2000), "took {elapsed:?}");
}

#[test]
fn direct_poll_limit_turns_hang_into_timeout() {
    let sim = SimFirmware::default();
    sim.set_kernel(|ctx| {
        if ctx.unit() == 2 {
            Completion::Never
        } else {
            Completion::Done
        }
    });
    let strategy = Strategy::Direct {
        limit: PollLimit::Deadline(Duration::from_millis(50)),
    };
    let program = ProgramImage::new(&[0u8; 16]);
    let plan = plan(&program, 3);
    let region =
        SharedRegion::allocate(
            sim.clone(),
            &sim.session_config(strategy),
            plan.required_size().unwrap(),
        )
            .unwrap();
    let mut cursor = region.payload_cursor().unwrap();
    let layout = DispatchLayout::build(&mut cursor, &program, &plan, |b| TileParams {
        unit: b.unit,
        output: b.output_bus,
    })
    .unwrap();

    assert_eq!(
        region.execute(layout.message_bus(), 3),
        Err(LqpuError::Timeout)
    );
    assert_eq!(region.registers().completed(), 2);
}

#[test]
fn messages_outside_the_region_are_refused() {
    let sim = SimFirmware::default();
    let config = sim.session_config(Strategy::Direct {
        limit: PollLimit::Spins(1),
    });
    let region = SharedRegion::allocate(sim.clone(), &config, 64).unwrap();
    let outside = region.base().bus + region.size() as u32;
    assert_eq!(
        region.execute(outside, 1),
        Err(LqpuError::OutsideRegion(outside))
    );
    assert_eq!(region.execute(region.base().bus, 0), Err(LqpuError::UnitCount(0)));
}
