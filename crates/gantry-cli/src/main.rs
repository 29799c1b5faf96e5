use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use gantry_compile::Compiler;
use gantry_core::{
    Argument, BlockSize, Context, Cubin, DevicePointer, Error, Event, GridSize, Module,
    NativeFloatArray2D, NativeIntArray, Result, Runtime, RuntimeConfig,
};
use gantry_driver::SimDriver;

mod kernels;

#[derive(Parser)]
#[command(
    name = "gantry",
    about = "Gantry CUDA driver toolkit",
    long_about = "Device enumeration and kernel launch demos over the CUDA driver API.\n\nUse --sim to run against the in-process simulated driver on machines without a GPU.",
    version,
)]
struct Cli {
    /// JSON runtime config (driver library, scheduling, device, nvcc, arch)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Use the simulated driver instead of libcuda
    #[arg(long, global = true)]
    sim: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// List devices and their properties
    Info {
        /// Print properties as JSON
        #[arg(long)]
        json: bool,
    },
    /// Pinned async round trip through an increment kernel, timed with events
    Increment {
        /// Number of integers
        #[arg(long, default_value = "16777216")]
        size: usize,
        /// Value added to every element
        #[arg(long, default_value = "25")]
        value: i32,
        /// Precompiled cubin exporting increment_kernel (compiled with nvcc otherwise)
        #[arg(long)]
        cubin: Option<PathBuf>,
    },
    /// Two-dimensional launch computing a Mandelbrot escape-time image
    Mandelbrot {
        #[arg(long, default_value = "1000")]
        width: usize,
        #[arg(long, default_value = "1000")]
        height: usize,
        /// Iteration cap per pixel
        #[arg(long, default_value = "1000")]
        max_iterations: i32,
        /// Dynamic shared memory per block, in bytes
        #[arg(long, default_value = "0")]
        shared_mem: u32,
        /// Precompiled cubin exporting squarecmplx (compiled with nvcc otherwise)
        #[arg(long)]
        cubin: Option<PathBuf>,
        /// Write the result as raw little-endian f32, row-major
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

/// Where kernels come from for one invocation.
struct Session {
    runtime: Runtime,
    config: RuntimeConfig,
    sim: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => RuntimeConfig::from_json_file(path)?,
        None => RuntimeConfig::default(),
    }
    .with_env();
    let session = open(config, cli.sim)?;

    match cli.command {
        Commands::Info { json } => cmd_info(&session, json),
        Commands::Increment { size, value, cubin } => {
            cmd_increment(&session, size, value, cubin.as_deref())
        }
        Commands::Mandelbrot { width, height, max_iterations, shared_mem, cubin, output } => {
            let image = cmd_mandelbrot(
                &session,
                width,
                height,
                max_iterations,
                shared_mem,
                cubin.as_deref(),
            )?;
            if let Some(path) = output {
                std::fs::write(&path, image.buffer().bytes()?)?;
                println!("Wrote {}x{} f32 image to {}", width, height, path.display());
            }
            Ok(())
        }
    }
}

fn open(config: RuntimeConfig, sim: bool) -> Result<Session> {
    let runtime = if sim {
        let driver = Arc::new(SimDriver::new(1));
        kernels::register_sim(&driver);
        Runtime::initialize(driver)?
    } else {
        Runtime::from_config(&config)?
    };
    Ok(Session { runtime, config, sim })
}

impl Session {
    fn context(&self) -> Result<Context> {
        let device = self.runtime.select_device(&self.config.device)?;
        let name = device.properties()?.name;
        println!("Using device {} ({name})", device.ordinal());
        device.create_context(self.config.scheduling)
    }

    /// Load from `cubin` if given; otherwise compile `source`, or hand the
    /// source to the simulated driver as-is.
    fn module(&self, ctx: &Context, cubin: Option<&Path>, source: &str) -> Result<Module> {
        if let Some(path) = cubin {
            println!("Loading kernel from {}", path.display());
            return ctx.load_module(&Cubin::new(path));
        }
        if self.sim {
            return Module::load_image(ctx, source.as_bytes());
        }
        println!("Compiling kernel");
        let compiled = Compiler::from_config(&self.config).compile(source)?;
        tracing::debug!(log = compiled.log(), "nvcc finished");
        println!("Loading kernel");
        ctx.load_module(compiled.cubin())
    }
}

fn cmd_info(session: &Session, json: bool) -> Result<()> {
    let runtime = &session.runtime;
    let mut props = Vec::new();
    for device in runtime.devices() {
        props.push(device.properties()?);
    }
    let chosen = runtime.select_device(&session.config.device)?;

    if json {
        let doc = serde_json::json!({
            "driver": runtime.driver().name(),
            "selected": chosen.ordinal(),
            "devices": props,
        });
        let text = serde_json::to_string_pretty(&doc).map_err(|e| Error::Config(e.to_string()))?;
        println!("{text}");
        return Ok(());
    }

    println!("Driver: {}", runtime.driver().name());
    println!("Devices: {}\n", runtime.device_count());
    for (ordinal, p) in props.iter().enumerate() {
        let marker = if ordinal as u32 == chosen.ordinal() { "*" } else { " " };
        println!("{marker} [{ordinal}] {}", p.name);
        println!("      SMs:            {}", p.multiprocessor_count);
        println!("      Clock:          {} MHz", p.clock_rate_khz / 1000);
        println!("      Memory:         {} MiB", p.total_memory >> 20);
        println!("      Threads/block:  {}", p.max_threads_per_block);
        println!("      Shared/block:   {} KiB", p.shared_memory_per_block >> 10);
        println!("      Warp size:      {}", p.warp_size);
    }
    Ok(())
}

fn cmd_increment(session: &Session, size: usize, value: i32, cubin: Option<&Path>) -> Result<()> {
    let n = i32::try_from(size)
        .map_err(|_| Error::InputConstraint(format!("size {size} does not fit a kernel int")))?;
    let ctx = session.context()?;
    let module = session.module(&ctx, cubin, kernels::INCREMENT_SOURCE)?;
    let mut kernel = module.function(kernels::INCREMENT)?;

    println!("Allocating page-locked input");
    let mut input = NativeIntArray::pinned(&ctx, size)?;
    input.copy_from_slice(&(0..n).collect::<Vec<_>>())?;

    let block = BlockSize::new(256, 1, 1)?;
    kernel.set_block_size(block);
    kernel.set_grid_size(GridSize::to_fit(block, n as u32, 1));

    println!("Loading input and calling kernel");
    let stream = ctx.default_stream();
    let cpu_start = Instant::now();
    let start = ctx.record_default_event()?;
    let data = unsafe { DevicePointer::to_device_async(&ctx, input.buffer(), stream)? };
    unsafe {
        kernel.call(&[
            Argument::Pointer(&data),
            Argument::Integer(value),
            Argument::Integer(n),
        ])?;
        data.copy_to_async(input.buffer_mut(), stream)?;
    }
    let cpu_time = cpu_start.elapsed();
    let stop = ctx.record_default_event()?;

    let mut polls = 0u64;
    while !stop.is_reached()? {
        polls += 1;
    }
    let gpu_ms = Event::elapsed_time(&start, &stop)?;

    println!("Time spent in CPU: {:.3} ms", cpu_time.as_secs_f64() * 1e3);
    println!("Time spent in GPU: {gpu_ms:.3} ms");
    println!("Polls while waiting: {polls}");

    let out = input.to_vec()?;
    if let Some((i, v)) = out
        .iter()
        .enumerate()
        .find(|&(i, &v)| v != (i as i32).wrapping_add(value))
    {
        return Err(Error::InvalidState(format!("GPU data incorrect: value at {i} is {v}")));
    }
    println!("GPU data correct");
    Ok(())
}

fn cmd_mandelbrot(
    session: &Session,
    width: usize,
    height: usize,
    max_iterations: i32,
    shared_mem: u32,
    cubin: Option<&Path>,
) -> Result<NativeFloatArray2D> {
    let (res_x, res_y) = match (i32::try_from(width), i32::try_from(height)) {
        (Ok(x), Ok(y)) if x > 0 && y > 0 => (x, y),
        _ => {
            return Err(Error::InputConstraint(format!(
                "image size {width}x{height} out of range"
            )))
        }
    };
    let ctx = session.context()?;
    let module = session.module(&ctx, cubin, kernels::MANDELBROT_SOURCE)?;
    let mut kernel = module.function(kernels::MANDELBROT)?;

    println!("Allocating input");
    let mut real = NativeFloatArray2D::new(width, height)?;
    let mut imaginary = NativeFloatArray2D::new(width, height)?;
    for y in 0..height {
        for x in 0..width {
            real.set(x, y, -2.0 + x as f32 * (4.0 / width as f32))?;
            imaginary.set(x, y, -2.0 + y as f32 * (4.0 / height as f32))?;
        }
    }
    let real_gpu = DevicePointer::to_device(&ctx, real.buffer())?;
    let imaginary_gpu = DevicePointer::to_device(&ctx, imaginary.buffer())?;

    println!("Calling kernel");
    let block = BlockSize::new(16, 16, 1)?;
    kernel.set_block_size(block);
    kernel.set_grid_size(GridSize::to_fit(block, res_x as u32, res_y as u32));
    kernel.set_shared_memory(shared_mem);
    let started = Instant::now();
    unsafe {
        kernel.call(&[
            Argument::Pointer(&real_gpu),
            Argument::Pointer(&imaginary_gpu),
            Argument::Integer(res_x),
            Argument::Integer(res_y),
            Argument::Integer(max_iterations),
        ])?;
    }
    ctx.synchronize()?;
    let elapsed = started.elapsed();

    println!("Retrieving data");
    real_gpu.copy_to(real.buffer_mut())?;

    let values = real.as_array().to_vec()?;
    let inside = values.iter().filter(|&&v| v == kernels::INSIDE).count();
    let escaped = values.iter().copied().filter(|&v| v != kernels::INSIDE);
    let (lo, hi) = escaped.fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    println!("Kernel time: {:.3} ms", elapsed.as_secs_f64() * 1e3);
    println!(
        "{width}x{height}: {inside} inside, {} escaped (escape values {lo:.2}..{hi:.2})",
        values.len() - inside
    );
    Ok(real)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sim_session() -> Session {
        open(RuntimeConfig::default(), true).unwrap()
    }

    #[test]
    fn test_increment_sim() {
        cmd_increment(&sim_session(), 1000, 25, None).unwrap();
    }

    #[test]
    fn test_mandelbrot_sim() {
        let image = cmd_mandelbrot(&sim_session(), 40, 30, 200, 33, None).unwrap();
        // Left edge (re = -2) escapes except on the real axis; the centre is inside.
        assert_eq!(image.get(20, 15).unwrap(), kernels::INSIDE);
        assert!(image.get(0, 0).unwrap() != kernels::INSIDE);
    }

    #[test]
    fn test_mandelbrot_rejects_empty_image() {
        let err = cmd_mandelbrot(&sim_session(), 0, 10, 10, 0, None).unwrap_err();
        assert!(matches!(err, Error::InputConstraint(_)));
    }

    #[test]
    fn test_info_sim() {
        cmd_info(&sim_session(), false).unwrap();
        cmd_info(&sim_session(), true).unwrap();
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::parse_from(["gantry", "--sim", "increment", "--size", "512"]);
        assert!(cli.sim);
        assert!(matches!(cli.command, Commands::Increment { size: 512, value: 25, .. }));
    }
}
