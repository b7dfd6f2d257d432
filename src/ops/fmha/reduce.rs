//! Post-kernel elementwise passes of the backward call: summing per-query-head
//! key/value gradients down to the shared heads, and casting f32 gradient shadows
//! back into the input dtype. Both run as ordinary jobs on the call's stream.

use crate::error::{Error, Result};
use crate::runtime::StreamConfig;
use crate::tensor::{read_f32, write_f32, Tensor};
use rayon::prelude::*;

fn check_same_shape(src: &[usize], dst: &[usize], what: &'static str) -> Result<()> {
    if src != dst {
        return Err(Error::invalid_argument(
            what,
            format!("source shape {src:?} does not match destination {dst:?}"),
        ));
    }
    Ok(())
}

/// Read every element of `src`, sum runs of `groups` consecutive source elements
/// (in row-major order) and write one destination element per run.
fn enqueue_reduce(
    config: &StreamConfig<'_>,
    name: &'static str,
    src: Tensor,
    dst: Tensor,
    groups: usize,
) -> Result<()> {
    config.stream.launch_with(config, name, move || {
        let values: Vec<f32> = {
            let guard = src.storage().read()?;
            let bytes: &[u8] = &guard;
            let dtype = src.dtype();
            src.storage_indices()
                .par_chunks(groups.max(1))
                .map(|chunk| chunk.iter().map(|&i| read_f32(dtype, bytes, i)).sum())
                .collect()
        };
        let dtype = dst.dtype();
        let mut bytes = dst.storage().write()?;
        for (i, v) in dst.storage_indices().into_iter().zip(values) {
            write_f32(dtype, &mut bytes, i, v);
        }
        Ok(())
    })
}

/// `dst[b, n, h, d] = Σ_r tmp[b, n, h * ratio + r, d]` for `[B, N, Hq, D]` temporaries
/// and `[B, N, Hkv, D]` destinations.
pub fn sum_head_groups(config: &StreamConfig<'_>, tmp: &Tensor, dst: &Tensor) -> Result<()> {
    let (hq, hkv) = (tmp.size(2), dst.size(2));
    if hkv == 0 || hq % hkv != 0 {
        return Err(Error::invalid_argument(
            "dst",
            format!("{hq} query heads do not divide into {hkv} heads"),
        ));
    }
    let ratio = hq / hkv;
    // the ratio axis becomes innermost so each destination element owns a run
    let grouped = tmp.unflatten(2, &[hkv, ratio])?;
    let s = grouped.strides();
    let sh = grouped.shape();
    let moved = Tensor::from_parts(
        std::sync::Arc::clone(grouped.storage()),
        vec![sh[0], sh[1], sh[2], sh[4], sh[3]],
        vec![s[0], s[1], s[2], s[4], s[3]],
        grouped.storage_offset(),
    )?;
    check_same_shape(&moved.shape()[..4], dst.shape(), "dst")?;
    tracing::trace!(hq, hkv, "reducing shared-head gradients");
    enqueue_reduce(config, "fmha_bwd_head_reduce", moved, dst.clone(), ratio)
}

/// Elementwise cast-copy of `src` into `dst`.
pub fn copy_cast(config: &StreamConfig<'_>, src: &Tensor, dst: &Tensor) -> Result<()> {
    check_same_shape(src.shape(), dst.shape(), "dst")?;
    enqueue_reduce(config, "fmha_bwd_copy_back", src.clone(), dst.clone(), 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Stream;
    use crate::tensor::{DType, Device};

    #[test]
    fn test_sum_head_groups() {
        let (b, n, hq, hkv, d) = (1, 2, 4, 2, 3);
        let values: Vec<f32> = (0..b * n * hq * d).map(|i| i as f32).collect();
        let device = Device::accelerator();
        let tmp = Tensor::from_f32(&values, &[b, n, hq, d], DType::F32, device).unwrap();
        let dst = Tensor::zeros(&[b, n, hkv, d], DType::F32, device);
        let stream = Stream::new();
        sum_head_groups(&StreamConfig::new(&stream), &tmp, &dst).unwrap();
        stream.synchronize().unwrap();

        let got = dst.to_vec_f32().unwrap();
        for s in 0..n {
            for h in 0..hkv {
                for c in 0..d {
                    let at = |qh: usize| values[(s * hq + qh) * d + c];
                    let want = at(2 * h) + at(2 * h + 1);
                    assert_eq!(got[(s * hkv + h) * d + c], want);
                }
            }
        }
    }

    #[test]
    fn test_copy_cast_into_strided_view() {
        let device = Device::accelerator();
        let src = Tensor::from_f32(&[0.5, 1.5, -2.0, 3.25], &[2, 2], DType::F32, device).unwrap();
        let backing = Tensor::zeros(&[2, 4], DType::BF16, device);
        let dst = backing.narrow(1, 1, 2).unwrap();
        let stream = Stream::new();
        copy_cast(&StreamConfig::new(&stream), &src, &dst).unwrap();
        stream.synchronize().unwrap();
        assert_eq!(dst.to_vec_f32().unwrap(), vec![0.5, 1.5, -2.0, 3.25]);
        assert_eq!(backing.to_vec_f32().unwrap()[0], 0.0);
    }
}
