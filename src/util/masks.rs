// SPDX-License-Identifier: MIT OR Apache-2.0

//! Attention masks.

use candle_core::{DType, Device, Tensor};

use crate::error::Result;

/// Create an additive causal mask.
///
/// # Shapes
/// - returns: `[1, 1, seq_len, seq_len]`
///
/// Future positions are set to `-inf`, everything else to `0`.
///
/// # Errors
///
/// Returns [`IiaError::Model`](crate::IiaError::Model) if tensor creation fails.
pub fn create_causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let mut mask_data = vec![0.0_f32; seq_len * seq_len];
    for i in 0..seq_len {
        for j in (i + 1)..seq_len {
            // idx is always < seq_len * seq_len by construction
            if let Some(cell) = mask_data.get_mut(i * seq_len + j) {
                *cell = f32::NEG_INFINITY;
            }
        }
    }
    Ok(Tensor::from_vec(mask_data, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn upper_triangle_is_masked() {
        let mask = create_causal_mask(3, &Device::Cpu, DType::F32).unwrap();
        let rows = mask.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(rows[0][0], 0.0);
        assert!(rows[0][1].is_infinite());
        assert!(rows[1][2].is_infinite());
        assert_eq!(rows[2][0], 0.0);
        assert_eq!(rows[2][2], 0.0);
    }
}
