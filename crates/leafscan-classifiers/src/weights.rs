//! Matching artifact tensors to the parameters a topology expects
//!
//! Native artifacts store tensors under the exact `<layer>.<param>` keys and
//! need no help. Older artifacts may use other names (Keras style
//! `conv1/kernel:0`, `gamma`, `moving_mean`) or other memory layouts
//! (HWIO convolution kernels, `(in, out)` dense kernels). The functions here
//! map such tensors onto [`ParamSlot`]s, either by position or by name.

use crate::topology::{ParamLayout, ParamSlot};
use candle_core::{DType, Tensor};
use leafscan_core::{Error, Result};
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::debug;

/// Assign tensors to slots by position.
///
/// Artifact keys are sorted naturally (`layer_2` before `layer_10`) and
/// zipped with the slots in topology order. Counts must match exactly.
pub fn assign_by_position(
    slots: &[ParamSlot],
    tensors: &[(String, Tensor)],
) -> Result<HashMap<String, Tensor>> {
    if slots.len() != tensors.len() {
        return Err(Error::model(format!(
            "topology expects {} parameter tensors, artifact has {}",
            slots.len(),
            tensors.len()
        )));
    }

    let mut ordered: Vec<&(String, Tensor)> = tensors.iter().collect();
    ordered.sort_by(|a, b| natural_cmp(&a.0, &b.0));

    let mut assigned = HashMap::with_capacity(slots.len());
    for (slot, (key, tensor)) in slots.iter().zip(ordered) {
        let adapted = adapt_layout(tensor, slot).ok_or_else(|| {
            Error::model(format!(
                "tensor '{}' with shape {:?} cannot fill '{}' {:?}",
                key,
                tensor.dims(),
                slot.key(),
                slot.shape
            ))
        })?;
        debug!(from = %key, to = %slot.key(), "Assigned tensor by position");
        assigned.insert(slot.key(), adapted);
    }

    Ok(assigned)
}

/// Assign tensors to slots by name, accepting common aliases
pub fn assign_by_name(
    slots: &[ParamSlot],
    tensors: &[(String, Tensor)],
) -> Result<HashMap<String, Tensor>> {
    let normalized: Vec<(String, &Tensor)> = tensors
        .iter()
        .map(|(key, tensor)| (normalize_key(key), tensor))
        .collect();

    let mut assigned = HashMap::with_capacity(slots.len());
    for slot in slots {
        let tensor = find_by_name(slot, &normalized).ok_or_else(|| {
            Error::model(format!("no tensor found for parameter '{}'", slot.key()))
        })?;
        let adapted = adapt_layout(tensor, slot).ok_or_else(|| {
            Error::model(format!(
                "tensor for '{}' has shape {:?}, expected {:?}",
                slot.key(),
                tensor.dims(),
                slot.shape
            ))
        })?;
        assigned.insert(slot.key(), adapted);
    }

    Ok(assigned)
}

/// Strip `:0` suffixes and use `.` as the only separator
fn normalize_key(key: &str) -> String {
    let key = key.strip_suffix(":0").unwrap_or(key);
    key.replace('/', ".")
}

fn aliases(slot: &ParamSlot) -> &'static [&'static str] {
    match (slot.param, slot.layout) {
        ("weight", ParamLayout::Vector) => &["weight", "gamma"],
        ("weight", ParamLayout::Depthwise { .. }) => &["weight", "depthwise_kernel", "kernel"],
        ("weight", _) => &["weight", "kernel"],
        ("bias", _) => &["bias", "beta"],
        ("running_mean", _) => &["running_mean", "moving_mean"],
        ("running_var", _) => &["running_var", "moving_variance"],
        _ => &[],
    }
}

fn find_by_name<'a>(slot: &ParamSlot, tensors: &[(String, &'a Tensor)]) -> Option<&'a Tensor> {
    for alias in aliases(slot) {
        let wanted = format!("{}.{}", slot.layer, alias);
        let found = tensors.iter().find(|(key, _)| {
            key == &wanted
                || key
                    .strip_suffix(wanted.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        });
        if let Some((_, tensor)) = found {
            return Some(tensor);
        }
    }
    None
}

/// Convert a tensor into the slot's expected layout, if any known
/// translation fits
pub fn adapt_layout(tensor: &Tensor, slot: &ParamSlot) -> Option<Tensor> {
    let tensor = tensor.to_dtype(DType::F32).ok()?;
    if tensor.dims() == slot.shape.as_slice() {
        return Some(tensor);
    }

    let candidate = match (slot.layout, tensor.rank()) {
        // (in, out) -> (out, in)
        (ParamLayout::Dense, 2) => tensor.t().ok()?,
        // (kh, kw, in, out) -> (out, in, kh, kw)
        (ParamLayout::Conv, 4) => tensor.permute((3, 2, 0, 1)).ok()?,
        // (kh, kw, in, m) -> (in, m, kh, kw) -> (in * m, 1, kh, kw)
        (ParamLayout::Depthwise { .. }, 4) => {
            let (kh, kw, channels, multiplier) = tensor.dims4().ok()?;
            tensor
                .permute((2, 3, 0, 1))
                .ok()?
                .contiguous()
                .ok()?
                .reshape((channels * multiplier, 1, kh, kw))
                .ok()?
        }
        _ => return None,
    };

    if candidate.dims() == slot.shape.as_slice() {
        candidate.contiguous().ok()
    } else {
        None
    }
}

/// Compare strings treating runs of digits as numbers
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (mut a, mut b) = (a, b);
    loop {
        match (a.chars().next(), b.chars().next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let a_len = a.find(|c: char| !c.is_ascii_digit()).unwrap_or(a.len());
                let b_len = b.find(|c: char| !c.is_ascii_digit()).unwrap_or(b.len());
                let (a_num, b_num) = (a[..a_len].trim_start_matches('0'), b[..b_len].trim_start_matches('0'));

                let ord = a_num
                    .len()
                    .cmp(&b_num.len())
                    .then_with(|| a_num.cmp(b_num))
                    .then_with(|| a_len.cmp(&b_len));
                if ord != Ordering::Equal {
                    return ord;
                }
                a = &a[a_len..];
                b = &b[b_len..];
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(&y);
                }
                a = &a[x.len_utf8()..];
                b = &b[y.len_utf8()..];
            }
        }
    }
}
