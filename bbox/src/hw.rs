use crate::common::*;

/// A box size without position, such as an anchor prior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HW<T> {
    h: T,
    w: T,
}

impl<T> HW<T>
where
    T: Num + PartialOrd + Copy,
{
    pub fn try_from_hw(hw: [T; 2]) -> Result<Self> {
        let [h, w] = hw;
        let zero = T::zero();
        ensure!(
            h >= zero && w >= zero,
            "height and width parameters must be non-negative"
        );
        Ok(Self { h, w })
    }

    pub fn area(&self) -> T {
        self.w * self.h
    }

    pub fn w(&self) -> T {
        self.w
    }

    pub fn h(&self) -> T {
        self.h
    }
}

impl<T> HW<T>
where
    T: Float,
{
    /// IoU of two boxes sharing the same center.
    ///
    /// Only the shapes are compared. It fails if both sizes are degenerate.
    pub fn try_centered_iou_with(&self, other: &HW<T>) -> Result<T> {
        let inter_area = self.h.min(other.h) * self.w.min(other.w);
        let union_area = self.area() + other.area() - inter_area;
        ensure!(
            union_area > T::zero(),
            "IoU is undefined for sizes with non-positive union area"
        );
        Ok(inter_area / union_area)
    }
}
