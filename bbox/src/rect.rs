use super::{CyCxHW, TLBR};
use crate::common::*;

/// The generic rectangle.
pub trait Rect {
    type Type;

    fn t(&self) -> Self::Type;
    fn l(&self) -> Self::Type;
    fn b(&self) -> Self::Type;
    fn r(&self) -> Self::Type;
    fn cy(&self) -> Self::Type;
    fn cx(&self) -> Self::Type;
    fn h(&self) -> Self::Type;
    fn w(&self) -> Self::Type;

    fn try_from_tlbr(tlbr: [Self::Type; 4]) -> Result<Self>
    where
        Self: Sized;

    fn try_from_cycxhw(cycxhw: [Self::Type; 4]) -> Result<Self>
    where
        Self: Sized;
}

pub trait RectNum: Rect
where
    Self::Type: Num + PartialOrd,
{
    fn cycxhw(&self) -> [Self::Type; 4] {
        [self.cy(), self.cx(), self.h(), self.w()]
    }

    fn tlbr(&self) -> [Self::Type; 4] {
        [self.t(), self.l(), self.b(), self.r()]
    }

    fn hw(&self) -> [Self::Type; 2] {
        [self.h(), self.w()]
    }

    fn to_cycxhw(&self) -> CyCxHW<Self::Type> {
        CyCxHW {
            cy: self.cy(),
            cx: self.cx(),
            h: self.h(),
            w: self.w(),
        }
    }

    fn to_tlbr(&self) -> TLBR<Self::Type> {
        TLBR {
            t: self.t(),
            l: self.l(),
            b: self.b(),
            r: self.r(),
        }
    }

    fn area(&self) -> <Self::Type as Mul<Self::Type>>::Output
    where
        Self::Type: Mul<Self::Type>,
    {
        self.h() * self.w()
    }
}

pub trait RectFloat: RectNum
where
    Self::Type: Float,
{
    /// Compute the overlapping region, or `None` if the rectangles are disjoint.
    fn intersect_with<R>(&self, other: &R) -> Option<TLBR<Self::Type>>
    where
        R: Rect<Type = Self::Type>,
    {
        let t = self.t().max(other.t());
        let l = self.l().max(other.l());
        let b = self.b().min(other.b());
        let r = self.r().min(other.r());
        (b > t && r > l).then(|| TLBR { t, l, b, r })
    }

    fn intersection_area_with<R>(&self, other: &R) -> Self::Type
    where
        R: Rect<Type = Self::Type>,
    {
        self.intersect_with(other)
            .map(|rect| rect.area())
            .unwrap_or_else(Self::Type::zero)
    }

    /// Intersection over union.
    ///
    /// It fails if the union area is not positive, which only happens when
    /// both rectangles are degenerate.
    fn try_iou_with<R>(&self, other: &R) -> Result<Self::Type>
    where
        R: Rect<Type = Self::Type>,
    {
        let inter_area = self.intersection_area_with(other);
        let union_area = self.h() * self.w() + other.h() * other.w() - inter_area;
        ensure!(
            union_area > Self::Type::zero(),
            "IoU is undefined for rectangles with non-positive union area"
        );
        Ok(inter_area / union_area)
    }
}

impl<T> RectNum for T
where
    T: Rect,
    T::Type: Num + PartialOrd,
{
}

impl<T> RectFloat for T
where
    T: Rect,
    T::Type: Float,
{
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn identical_rects_have_unit_iou() -> Result<()> {
        let lhs = CyCxHW::try_from_cycxhw([0.5, 0.5, 0.1, 0.2])?;
        let rhs = CyCxHW::try_from_cycxhw([0.5, 0.5, 0.1, 0.2])?;
        assert_abs_diff_eq!(lhs.try_iou_with(&rhs)?, 1.0, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn disjoint_rects_have_zero_iou() -> Result<()> {
        let lhs = TLBR::try_from_tlbr([0.0, 0.0, 0.2, 0.2])?;
        let rhs = TLBR::try_from_tlbr([0.5, 0.5, 0.7, 0.7])?;
        assert!(lhs.intersect_with(&rhs).is_none());
        assert_eq!(lhs.intersection_area_with(&rhs), 0.0);
        assert_abs_diff_eq!(lhs.try_iou_with(&rhs)?, 0.0);
        Ok(())
    }

    #[test]
    fn partial_overlap_iou() -> Result<()> {
        // two unit squares shifted by half a side
        let lhs = TLBR::try_from_tlbr([0.0, 0.0, 1.0, 1.0])?;
        let rhs = TLBR::try_from_tlbr([0.0, 0.5, 1.0, 1.5])?;
        assert_abs_diff_eq!(lhs.try_iou_with(&rhs)?, 0.5 / 1.5, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn degenerate_union_is_rejected() -> Result<()> {
        let lhs = CyCxHW::try_from_cycxhw([0.5, 0.5, 0.0, 0.0])?;
        let rhs = CyCxHW::try_from_cycxhw([0.2, 0.2, 0.0, 0.3])?;
        assert!(lhs.try_iou_with(&rhs).is_err());
        Ok(())
    }
}
