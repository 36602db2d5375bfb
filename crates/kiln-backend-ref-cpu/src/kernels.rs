//! Competing matmul kernel implementations.
//!
//! All variants compute the same `a[m,k] @ b[k,n]` product; they differ only
//! in traversal, which is exactly what the tuner is meant to distinguish.
//! The `debug-*` variants exist for pool tests: one aborts the worker
//! process, one fails cleanly, one reports the worker's device visibility.

use anyhow::{ensure, Result};
use kiln::KernelDef;

pub const MATMUL_OP: &str = "matmul";

pub const VARIANT_NAIVE: &str = "naive";
pub const VARIANT_TRANSPOSED: &str = "transposed";
pub const VARIANT_BLOCKED: &str = "blocked";

/// Aborts the worker process mid-job.
pub const VARIANT_CRASH: &str = "debug-crash";
/// Fails the job with a normal error.
pub const VARIANT_FAIL: &str = "debug-fail";
/// Replies with the worker's device-visibility value instead of a timing.
pub const VARIANT_SHOW_DEVICES: &str = "debug-show-devices";

const BLOCK: usize = 32;

/// The candidate set raced for every matmul lowering.
pub fn matmul_candidates() -> Vec<KernelDef> {
    [VARIANT_NAIVE, VARIANT_TRANSPOSED, VARIANT_BLOCKED]
        .iter()
        .map(|variant| KernelDef::new(MATMUL_OP, *variant))
        .collect()
}

/// Runs one matmul variant.
pub fn run_matmul(
    variant: &str,
    a: &[f32],
    b: &[f32],
    m: usize,
    k: usize,
    n: usize,
) -> Result<Vec<f32>> {
    ensure!(a.len() == m * k, "lhs buffer is {} elements, expected {}", a.len(), m * k);
    ensure!(b.len() == k * n, "rhs buffer is {} elements, expected {}", b.len(), k * n);
    match variant {
        VARIANT_NAIVE => Ok(matmul_naive(a, b, m, k, n)),
        VARIANT_TRANSPOSED => Ok(matmul_transposed(a, b, m, k, n)),
        VARIANT_BLOCKED => Ok(matmul_blocked(a, b, m, k, n)),
        other => anyhow::bail!("unknown matmul variant `{other}`"),
    }
}

fn matmul_naive(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; m * n];
    for i in 0..m {
        for j in 0..n {
            let mut acc = 0.0f32;
            for p in 0..k {
                acc += a[i * k + p] * b[p * n + j];
            }
            out[i * n + j] = acc;
        }
    }
    out
}

/// Packs `b` column-major first so the inner loop walks two contiguous rows.
fn matmul_transposed(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    let mut bt = vec![0.0f32; n * k];
    for p in 0..k {
        for j in 0..n {
            bt[j * k + p] = b[p * n + j];
        }
    }
    let mut out = vec![0.0f32; m * n];
    for i in 0..m {
        let row = &a[i * k..(i + 1) * k];
        for j in 0..n {
            let col = &bt[j * k..(j + 1) * k];
            out[i * n + j] = row.iter().zip(col).map(|(x, y)| x * y).sum();
        }
    }
    out
}

fn matmul_blocked(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; m * n];
    for i0 in (0..m).step_by(BLOCK) {
        for p0 in (0..k).step_by(BLOCK) {
            for j0 in (0..n).step_by(BLOCK) {
                for i in i0..(i0 + BLOCK).min(m) {
                    for p in p0..(p0 + BLOCK).min(k) {
                        let lhs = a[i * k + p];
                        for j in j0..(j0 + BLOCK).min(n) {
                            out[i * n + j] += lhs * b[p * n + j];
                        }
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(m: usize, k: usize, n: usize) -> (Vec<f32>, Vec<f32>) {
        let a = (0..m * k).map(|i| (i % 7) as f32 - 3.0).collect();
        let b = (0..k * n).map(|i| (i % 5) as f32 * 0.5).collect();
        (a, b)
    }

    #[test]
    fn variants_agree_with_naive() {
        let (m, k, n) = (7, 33, 5);
        let (a, b) = fixture(m, k, n);
        let reference = run_matmul(VARIANT_NAIVE, &a, &b, m, k, n).unwrap();
        for variant in [VARIANT_TRANSPOSED, VARIANT_BLOCKED] {
            let result = run_matmul(variant, &a, &b, m, k, n).unwrap();
            for (idx, (x, y)) in reference.iter().zip(&result).enumerate() {
                assert!(
                    (x - y).abs() < 1e-4,
                    "{variant} diverges from naive at {idx}: {x} vs {y}"
                );
            }
        }
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let err = run_matmul(VARIANT_NAIVE, &[1.0; 4], &[1.0; 4], 3, 3, 3).unwrap_err();
        assert!(err.to_string().contains("expected"));
    }
}
