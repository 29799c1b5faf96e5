//! Demo kernels: CUDA source for the real driver, host emulations for `--sim`.

use gantry_driver::status::{CuResult, CUDA_ERROR_ILLEGAL_ADDRESS, CUDA_ERROR_INVALID_VALUE};
use gantry_driver::{SimDriver, SimLaunch, SimMemory};

pub const INCREMENT: &str = "increment_kernel";
pub const MANDELBROT: &str = "squarecmplx";

pub const INCREMENT_SOURCE: &str = r#"
extern "C" __global__ void increment_kernel(int *g_data, int inc_value, int n)
{
    int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx < n) g_data[idx] = g_data[idx] + inc_value;
}
"#;

pub const MANDELBROT_SOURCE: &str = r#"
extern "C" __global__ void squarecmplx(float *real, float *imaginary,
                                       int resX, int resY, int maxItr)
{
    int x = blockIdx.x * blockDim.x + threadIdx.x;
    int y = blockIdx.y * blockDim.y + threadIdx.y;
    if (x >= resX || y >= resY) return;
    int index = x + y * resX;
    float initRx = real[index];
    float initIm = imaginary[index];
    float rx = initRx, im = initIm;
    int i;
    for (i = 0; i < maxItr; i++) {
        float oldrx = rx;
        rx = rx * rx - im * im + initRx;
        im = 2 * oldrx * im + initIm;
        if (rx * rx + im * im > 4) break;
    }
    for (int j = 0; j < 3; j++) {
        float oldrx = rx;
        rx = rx * rx - im * im + initRx;
        im = 2 * oldrx * im + initIm;
    }
    if (i == maxItr) {
        real[index] = -101;
    } else {
        real[index] = ((float)i) + 1 - (logf(logf(sqrtf(rx * rx + im * im)))) / (logf(2));
    }
}
"#;

/// Value written for points that never escape.
pub const INSIDE: f32 = -101.0;

const PTR: usize = std::mem::size_of::<usize>();

/// Register host emulations of both demo kernels.
pub fn register_sim(sim: &SimDriver) {
    sim.register_kernel(INCREMENT, increment);
    sim.register_kernel(MANDELBROT, squarecmplx);
}

fn increment(mem: &mut SimMemory, launch: &SimLaunch) -> Result<(), CuResult> {
    let data = launch.param_ptr(0)?;
    let value = launch.param_i32(PTR)?;
    let n = launch.param_i32(PTR + 4)?.max(0) as usize;
    let n = n.min(launch.thread_count());
    let bytes = mem.read_mut(data, words(n)?)?;
    for chunk in bytes.chunks_exact_mut(4) {
        let v = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        chunk.copy_from_slice(&v.wrapping_add(value).to_le_bytes());
    }
    Ok(())
}

fn squarecmplx(mem: &mut SimMemory, launch: &SimLaunch) -> Result<(), CuResult> {
    let real = launch.param_ptr(0)?;
    let imaginary = launch.param_ptr(PTR)?;
    let res_x = launch.param_i32(2 * PTR)?;
    let res_y = launch.param_i32(2 * PTR + 4)?;
    let max_itr = launch.param_i32(2 * PTR + 8)?;
    if res_x < 0 || res_y < 0 {
        return Err(CUDA_ERROR_ILLEGAL_ADDRESS);
    }
    let width = (res_x as usize).min(span(launch.grid.0, launch.block.0));
    let height = (res_y as usize).min(span(launch.grid.1, launch.block.1));
    let pixels = (res_x as usize)
        .checked_mul(res_y as usize)
        .ok_or(CUDA_ERROR_INVALID_VALUE)?;

    let im_bytes = mem.read(imaginary, words(pixels)?)?.to_vec();
    let re_bytes = mem.read_mut(real, words(pixels)?)?;
    for y in 0..height {
        for x in 0..width {
            let index = (x + y * res_x as usize) * 4;
            let init_rx = f32::from_le_bytes(word(&re_bytes[index..]));
            let init_im = f32::from_le_bytes(word(&im_bytes[index..]));
            let value = escape_value(init_rx, init_im, max_itr);
            re_bytes[index..index + 4].copy_from_slice(&value.to_le_bytes());
        }
    }
    Ok(())
}

/// Threads launched along one axis.
fn span(grid: u32, block: u32) -> usize {
    (grid as usize).saturating_mul(block as usize)
}

/// Byte length of `n` 32-bit values.
fn words(n: usize) -> Result<usize, CuResult> {
    n.checked_mul(4).ok_or(CUDA_ERROR_INVALID_VALUE)
}

fn word(bytes: &[u8]) -> [u8; 4] {
    [bytes[0], bytes[1], bytes[2], bytes[3]]
}

/// Smoothed escape count for `c = init_rx + i * init_im`.
pub fn escape_value(init_rx: f32, init_im: f32, max_itr: i32) -> f32 {
    let (mut rx, mut im) = (init_rx, init_im);
    let mut i = 0;
    while i < max_itr {
        let old = rx;
        rx = rx * rx - im * im + init_rx;
        im = 2.0 * old * im + init_im;
        if rx * rx + im * im > 4.0 {
            break;
        }
        i += 1;
    }
    for _ in 0..3 {
        let old = rx;
        rx = rx * rx - im * im + init_rx;
        im = 2.0 * old * im + init_im;
    }
    if i == max_itr {
        INSIDE
    } else {
        i as f32 + 1.0 - (rx * rx + im * im).sqrt().ln().ln() / 2f32.ln()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_is_inside() {
        assert_eq!(escape_value(0.0, 0.0, 500), INSIDE);
    }

    #[test]
    fn test_far_point_escapes_immediately() {
        let v = escape_value(2.0, 2.0, 500);
        assert!(v != INSIDE);
        assert!(v < 2.0);
    }

    #[test]
    fn test_oversized_extents_do_not_overflow() {
        assert_eq!(span(u32::MAX, u32::MAX), (u32::MAX as usize).saturating_mul(u32::MAX as usize));
        assert_eq!(words(usize::MAX), Err(CUDA_ERROR_INVALID_VALUE));
        assert_eq!(words(16), Ok(64));
    }

    #[test]
    fn test_sources_name_their_entry_points() {
        assert!(INCREMENT_SOURCE.contains(INCREMENT));
        assert!(MANDELBROT_SOURCE.contains(MANDELBROT));
    }
}
