use candle_core::Tensor;
use crate::error::{Error, Result};
use crate::tensor::constant::BATCH_DIM;
use crate::tensor::operations::gather_rows;

/// Axis order of cached keys.
///
/// Values are always `(rows, heads, seq, head_dim)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyLayout {
    /// Keys are `(rows, heads, seq, head_dim)`
    HeadDimLast,
    /// Keys are `(rows, heads, head_dim, seq)`
    SeqLast,
}

impl KeyLayout {
    fn key_seq_dim(&self) -> usize {
        match self {
            KeyLayout::HeadDimLast => 2,
            KeyLayout::SeqLast => 3,
        }
    }
}

const VALUE_SEQ_DIM: usize = 2;

/// Per-layer `(keys, values)` returned by an engine for reuse on the next step.
///
/// Tensors may also come flattened as `(rows * heads, _, _)`; they are
/// viewed per row before any row operation.
#[derive(Debug, Clone)]
pub struct LayerCache {
    layers: Vec<(Tensor, Tensor)>,
    layout: KeyLayout,
}

impl LayerCache {
    pub fn new(layers: Vec<(Tensor, Tensor)>, layout: KeyLayout) -> Self {
        Self { layers, layout }
    }

    pub fn layers(&self) -> &[(Tensor, Tensor)] {
        &self.layers
    }

    pub fn layout(&self) -> KeyLayout {
        self.layout
    }

    /// Gathers `keep` rows and keeps the last `past_len` positions of each layer.
    pub(crate) fn filter(&self, rows: usize, keep: &[usize], past_len: usize) -> Result<Self> {
        let seq_dim = self.layout.key_seq_dim();
        let layers = self
            .layers
            .iter()
            .map(|(keys, values)| {
                let keys = gather_rows(&per_row(keys, rows)?, keep)?;
                let values = gather_rows(&per_row(values, rows)?, keep)?;
                Ok((
                    last_positions(&keys, seq_dim, past_len)?,
                    last_positions(&values, VALUE_SEQ_DIM, past_len)?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers, layout: self.layout })
    }

    /// Stacks caches row-wise, right-aligning each one's last `past_len`
    /// positions inside `target_past_len` zero-padded positions.
    ///
    /// `parts` holds `(cache, rows, past_len)` per merged batch, in row order.
    pub(crate) fn concatenate(
        parts: &[(&LayerCache, usize, usize)],
        target_past_len: usize,
    ) -> Result<Self> {
        let (first, _, _) = parts
            .first()
            .ok_or_else(|| Error::InvalidArgument("no caches to concatenate".into()))?;
        let layout = first.layout;
        let depth = first.layers.len();
        if parts.iter().any(|(cache, _, _)| cache.layout != layout || cache.layers.len() != depth) {
            return Err(Error::InvalidArgument("caches have different layouts or depths".into()));
        }

        let seq_dim = layout.key_seq_dim();
        let mut layers = Vec::with_capacity(depth);
        for layer in 0..depth {
            let mut keys = Vec::with_capacity(parts.len());
            let mut values = Vec::with_capacity(parts.len());
            for (cache, rows, past_len) in parts {
                let (k, v) = &cache.layers[layer];
                keys.push(right_align(&per_row(k, *rows)?, seq_dim, *past_len, target_past_len)?);
                let v = per_row(v, *rows)?;
                values.push(right_align(&v, VALUE_SEQ_DIM, *past_len, target_past_len)?);
            }
            layers.push((Tensor::cat(&keys, BATCH_DIM)?, Tensor::cat(&values, BATCH_DIM)?));
        }
        Ok(Self { layers, layout })
    }
}

/// Views a flattened `(rows * heads, a, b)` tensor as `(rows, heads, a, b)`.
fn per_row(tensor: &Tensor, rows: usize) -> Result<Tensor> {
    match tensor.rank() {
        4 => Ok(tensor.clone()),
        3 => {
            let (flat, a, b) = tensor.dims3()?;
            if rows == 0 || flat % rows != 0 {
                return Err(Error::Engine(format!(
                    "cache tensor with leading dimension {flat} does not split into {rows} rows"
                )));
            }
            Ok(tensor.reshape((rows, flat / rows, a, b))?)
        }
        rank => Err(Error::Engine(format!("cache tensors must have rank 3 or 4, got {rank}"))),
    }
}

fn last_positions(tensor: &Tensor, dim: usize, len: usize) -> Result<Tensor> {
    let size = tensor.dim(dim)?;
    let len = len.min(size);
    Ok(tensor.narrow(dim, size - len, len)?)
}

fn right_align(tensor: &Tensor, dim: usize, len: usize, target: usize) -> Result<Tensor> {
    let tail = last_positions(tensor, dim, len.min(target))?;
    let padding = target - tail.dim(dim)?;
    if padding == 0 {
        return Ok(tail);
    }
    let mut shape = tail.dims().to_vec();
    shape[dim] = padding;
    let zeros = Tensor::zeros(shape, tail.dtype(), tail.device())?;
    Ok(Tensor::cat(&[&zeros, &tail], dim)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    // Row r, position p holds r * 10 + p so moves are easy to follow.
    fn keyed(rows: usize, seq: usize) -> Tensor {
        let data = (0..rows)
            .flat_map(|r| (0..seq).map(move |p| (r * 10 + p) as f32))
            .collect::<Vec<_>>();
        Tensor::from_vec(data, (rows, 1, seq, 1), &Device::Cpu).unwrap()
    }

    fn flat(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn test_filter_gathers_and_time_slices() {
        let cache = LayerCache::new(vec![(keyed(3, 4), keyed(3, 4))], KeyLayout::HeadDimLast);
        let filtered = cache.filter(3, &[2, 0], 2).unwrap();
        let (keys, values) = &filtered.layers()[0];
        assert_eq!(keys.dims(), &[2, 1, 2, 1]);
        assert_eq!(flat(keys), vec![22., 23., 2., 3.]);
        assert_eq!(flat(values), vec![22., 23., 2., 3.]);
    }

    #[test]
    fn test_filter_seq_last_keys() {
        let keys = keyed(2, 3).transpose(2, 3).unwrap().contiguous().unwrap();
        let cache = LayerCache::new(vec![(keys, keyed(2, 3))], KeyLayout::SeqLast);
        let filtered = cache.filter(2, &[1], 1).unwrap();
        let (keys, values) = &filtered.layers()[0];
        assert_eq!(keys.dims(), &[1, 1, 1, 1]);
        assert_eq!(flat(keys), vec![12.]);
        assert_eq!(flat(values), vec![12.]);
    }

    #[test]
    fn test_filter_accepts_flattened_rows() {
        let keys = keyed(2, 3).reshape((2, 3, 1)).unwrap();
        let cache = LayerCache::new(vec![(keys.clone(), keys)], KeyLayout::HeadDimLast);
        let filtered = cache.filter(2, &[1], 3).unwrap();
        assert_eq!(flat(&filtered.layers()[0].0), vec![10., 11., 12.]);

        let bad = LayerCache::new(vec![(keyed(1, 3).reshape((3, 1)).unwrap(), keyed(1, 3))], KeyLayout::HeadDimLast);
        assert!(bad.filter(1, &[0], 1).is_err());
    }

    #[test]
    fn test_concatenate_right_aligns() {
        let short = LayerCache::new(vec![(keyed(1, 2), keyed(1, 2))], KeyLayout::HeadDimLast);
        let long = LayerCache::new(vec![(keyed(2, 3), keyed(2, 3))], KeyLayout::HeadDimLast);
        let merged = LayerCache::concatenate(&[(&short, 1, 1), (&long, 2, 3)], 3).unwrap();
        let (keys, _) = &merged.layers()[0];
        assert_eq!(keys.dims(), &[3, 1, 3, 1]);
        assert_eq!(flat(keys), vec![0., 0., 1., 0., 1., 2., 10., 11., 12.]);
    }

    #[test]
    fn test_concatenate_rejects_mixed_layouts() {
        let a = LayerCache::new(vec![(keyed(1, 2), keyed(1, 2))], KeyLayout::HeadDimLast);
        let b = LayerCache::new(vec![(keyed(1, 2), keyed(1, 2))], KeyLayout::SeqLast);
        assert!(LayerCache::concatenate(&[(&a, 1, 1), (&b, 1, 1)], 1).is_err());
        assert!(LayerCache::concatenate(&[], 1).is_err());
    }

    #[test]
    fn test_right_align_pads_with_zeros() {
        let t = Tensor::ones((1, 1, 2, 1), DType::F32, &Device::Cpu).unwrap();
        let aligned = right_align(&t, 2, 2, 4).unwrap();
        assert_eq!(flat(&aligned), vec![0., 0., 1., 1.]);
    }
}
