use candle_core::{DType, Device, Tensor, D};
use crate::error::{Error, Result};
use super::constant::{BATCH_DIM, POSITION_SENTINEL, SEQ_DIM};

/// Concatenates `(rows, _)` tensors along the sequence dimension.
///
/// Zero width parts are skipped, so callers can build windows out of
/// optional leading or trailing padding without special casing.
pub(crate) fn cat_columns(parts: &[Tensor]) -> Result<Tensor> {
    let non_empty: Vec<&Tensor> = parts
        .iter()
        .filter(|part| part.dims().get(SEQ_DIM).copied().unwrap_or(0) > 0)
        .collect();
    match non_empty.as_slice() {
        [] => parts
            .first()
            .cloned()
            .ok_or_else(|| Error::InvalidArgument("no columns to concatenate".into())),
        [single] => Ok((*single).clone()),
        many => Ok(Tensor::cat(many, SEQ_DIM)?),
    }
}

/// Returns `len` columns of `tensor` starting at `start`, or `None` for an empty window.
fn columns(tensor: &Tensor, start: usize, len: usize) -> Result<Option<Tensor>> {
    if len == 0 {
        return Ok(None);
    }
    Ok(Some(tensor.narrow(SEQ_DIM, start, len)?))
}

fn zero_columns(rows: usize, width: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    Ok(Tensor::zeros((rows, width), dtype, device)?)
}

/// Surrounds a `(rows, cols)` tensor with `left` and `right` zero columns.
///
/// Used to re-anchor attention masks when the shared `max_input_length`
/// or the right slack of a batch changes.
pub(crate) fn pad_columns(tensor: &Tensor, left: usize, right: usize) -> Result<Tensor> {
    let rows = tensor.dim(BATCH_DIM)?;
    let mut parts = Vec::with_capacity(3);
    if left > 0 {
        parts.push(zero_columns(rows, left, tensor.dtype(), tensor.device())?);
    }
    parts.push(tensor.clone());
    if right > 0 {
        parts.push(zero_columns(rows, right, tensor.dtype(), tensor.device())?);
    }
    cat_columns(&parts)
}

/// Gathers `rows` of `tensor` along the batch dimension, in the given order.
pub(crate) fn gather_rows(tensor: &Tensor, rows: &[usize]) -> Result<Tensor> {
    let indices = rows.iter().map(|&row| row as u32).collect::<Vec<_>>();
    let indices = Tensor::from_vec(indices, rows.len(), tensor.device())?;
    Ok(tensor.index_select(&indices, BATCH_DIM)?)
}

/// Takes the `len` columns that end right before `end`.
pub(crate) fn window_ending_at(tensor: &Tensor, end: usize, len: usize) -> Result<Tensor> {
    let start = end.checked_sub(len).ok_or_else(|| {
        Error::InvalidArgument(format!("window of {len} columns does not fit before column {end}"))
    })?;
    Ok(tensor.narrow(SEQ_DIM, start, len)?)
}

/// Sets every row of column `col` of an attention mask to `1`.
pub(crate) fn activate_column(mask: &Tensor, col: usize) -> Result<Tensor> {
    let (rows, width) = mask.dims2()?;
    if col >= width {
        return Err(Error::InvalidArgument(format!(
            "cannot activate column {col} of a mask with {width} columns"
        )));
    }
    let mut parts = Vec::with_capacity(3);
    parts.extend(columns(mask, 0, col)?);
    parts.push(Tensor::ones((rows, 1), mask.dtype(), mask.device())?);
    parts.extend(columns(mask, col + 1, width - col - 1)?);
    cat_columns(&parts)
}

/// Advances position indices by one, keeping only the last column.
pub(crate) fn next_positions(position_ids: &Tensor) -> Result<Tensor> {
    let width = position_ids.dim(SEQ_DIM)?;
    let last = position_ids.narrow(SEQ_DIM, width - 1, 1)?;
    Ok(last.affine(1.0, 1.0)?)
}

/// Builds position indices from left-padded mask rows.
///
/// Each active column gets the count of active columns before it; padded
/// columns get [`POSITION_SENTINEL`].
pub(crate) fn positions_from_mask(mask_rows: &[Vec<u32>]) -> Vec<i64> {
    mask_rows
        .iter()
        .flat_map(|row| {
            let mut seen = 0i64;
            row.iter()
                .map(|&active| {
                    seen += active as i64;
                    if active == 0 { POSITION_SENTINEL } else { seen - 1 }
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Numerically stable log-softmax over the last dimension, in `f32`.
pub(crate) fn log_softmax(logits: &Tensor) -> Result<Tensor> {
    let logits = logits.to_dtype(DType::F32)?;
    let max = logits.max_keepdim(D::Minus1)?;
    let shifted = logits.broadcast_sub(&max)?;
    let log_sum = shifted.exp()?.sum_keepdim(D::Minus1)?.log()?;
    Ok(shifted.broadcast_sub(&log_sum)?)
}
