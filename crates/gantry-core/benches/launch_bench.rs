//! Benchmark: host-side launch overhead (argument marshaling, context scope,
//! driver dispatch) against the simulated driver.

use std::sync::Arc;
use std::time::Instant;

use gantry_core::{marshal, Argument, BlockSize, GridSize, Module, Runtime, SchedulingPolicy};
use gantry_driver::SimDriver;

fn bench_marshal(args: &[Argument<'_>], iters: usize) -> f64 {
    let start = Instant::now();
    for _ in 0..iters {
        let _ = marshal(args).unwrap();
    }
    start.elapsed().as_secs_f64() / iters as f64
}

fn main() {
    println!("=== Gantry Launch Benchmark (simulated driver) ===\n");

    let sim = Arc::new(SimDriver::new(1));
    sim.register_kernel("noop", |_, _| Ok(()));
    let runtime = Runtime::initialize(sim.clone()).unwrap();
    let ctx = runtime
        .device(0)
        .unwrap()
        .create_context(SchedulingPolicy::Spin)
        .unwrap();
    let module = Module::load_image(&ctx, b"bench image").unwrap();
    let mut kernel = module.function("noop").unwrap();
    let block = BlockSize::new(256, 1, 1).unwrap();
    kernel.set_block_size(block);
    kernel.set_grid_size(GridSize::to_fit(block, 1 << 20, 1));
    let data = ctx.alloc(1 << 12).unwrap();

    let arg_counts = [1usize, 4, 16, 64];
    let iters = 20_000;

    println!("{:<8} {:>16} {:>16} {:>10}", "Args", "Marshal (us)", "Launch (us)", "Bytes");
    println!("{}", "-".repeat(54));

    for &count in &arg_counts {
        let args: Vec<Argument<'_>> = (0..count)
            .map(|i| match i % 3 {
                0 => Argument::Pointer(&data),
                1 => Argument::Integer(i as i32),
                _ => Argument::Float(i as f32 * 0.5),
            })
            .collect();
        let bytes = marshal(&args).unwrap().size();
        let marshal_secs = bench_marshal(&args, iters);

        sim.clear_calls();
        let start = Instant::now();
        for _ in 0..iters {
            unsafe { kernel.call(&args).unwrap() };
        }
        let launch_secs = start.elapsed().as_secs_f64() / iters as f64;

        println!(
            "{:<8} {:>16.3} {:>16.3} {:>10}",
            count,
            marshal_secs * 1e6,
            launch_secs * 1e6,
            bytes
        );
    }

    println!("\nlaunches recorded: {}", sim.launches().len());
}
