use crate::common::*;

/// Pairwise IoU of two box sets in `[cy, cx, h, w]` layout.
///
/// Inputs are `[n, 4]` and `[m, 4]` tensors, and the output is `[n, m]`.
/// Pairs with empty union score zero.
pub fn pairwise_iou(lhs: &Tensor, rhs: &Tensor) -> Result<Tensor> {
    let (_, lhs_entries) = lhs.size2()?;
    let (_, rhs_entries) = rhs.size2()?;
    ensure!(
        lhs_entries == 4 && rhs_entries == 4,
        "expect boxes in [n, 4] shape"
    );

    let to_tlbr = |boxes: &Tensor| {
        let cy = boxes.i((.., 0));
        let cx = boxes.i((.., 1));
        let h = boxes.i((.., 2));
        let w = boxes.i((.., 3));
        let t = &cy - &h / 2.0;
        let l = &cx - &w / 2.0;
        let b = &cy + &h / 2.0;
        let r = &cx + &w / 2.0;
        (t, l, b, r, h * w)
    };

    let (lhs_t, lhs_l, lhs_b, lhs_r, lhs_area) = to_tlbr(lhs);
    let (rhs_t, rhs_l, rhs_b, rhs_r, rhs_area) = to_tlbr(rhs);

    // broadcast to [n, m]
    let col = |tensor: Tensor| tensor.unsqueeze(1);
    let row = |tensor: Tensor| tensor.unsqueeze(0);

    let max_t = col(lhs_t).maximum(&row(rhs_t));
    let max_l = col(lhs_l).maximum(&row(rhs_l));
    let min_b = col(lhs_b).minimum(&row(rhs_b));
    let min_r = col(lhs_r).minimum(&row(rhs_r));

    let inter_h = (min_b - max_t).clamp_min(0.0);
    let inter_w = (min_r - max_l).clamp_min(0.0);
    let inter_area = inter_h * inter_w;
    let union_area = col(lhs_area) + row(rhs_area) - &inter_area;

    let iou = inter_area / union_area.clamp_min(f32::EPSILON as f64);
    Ok(iou)
}
