use super::{Rect, TLBR};
use crate::common::*;

/// Bounding box in CyCxHW format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CyCxHW<T> {
    pub(crate) cy: T,
    pub(crate) cx: T,
    pub(crate) h: T,
    pub(crate) w: T,
}

impl<T> CyCxHW<T>
where
    T: Copy + Num + PartialOrd,
{
    /// Scale the box coordinates independently along each axis.
    ///
    /// It is used to convert between pixel and ratio units.
    pub fn try_scale_hw(&self, scale_h: T, scale_w: T) -> Result<Self> {
        let zero = T::zero();
        ensure!(
            scale_h > zero && scale_w > zero,
            "scaling factor must be positive"
        );

        let Self { cy, cx, h, w } = *self;
        Ok(Self {
            cy: cy * scale_h,
            cx: cx * scale_w,
            h: h * scale_h,
            w: w * scale_w,
        })
    }
}

impl<T> Rect for CyCxHW<T>
where
    T: Copy + Num + PartialOrd,
{
    type Type = T;

    fn t(&self) -> Self::Type {
        let two = T::one() + T::one();
        self.cy - self.h / two
    }

    fn l(&self) -> Self::Type {
        let two = T::one() + T::one();
        self.cx - self.w / two
    }

    fn b(&self) -> Self::Type {
        let two = T::one() + T::one();
        self.cy + self.h / two
    }

    fn r(&self) -> Self::Type {
        let two = T::one() + T::one();
        self.cx + self.w / two
    }

    fn cy(&self) -> Self::Type {
        self.cy
    }

    fn cx(&self) -> Self::Type {
        self.cx
    }

    fn h(&self) -> Self::Type {
        self.h
    }

    fn w(&self) -> Self::Type {
        self.w
    }

    fn try_from_tlbr(tlbr: [T; 4]) -> Result<Self> {
        let [t, l, b, r] = tlbr;
        let zero = T::zero();
        let two = T::one() + T::one();
        let h = b - t;
        let w = r - l;
        ensure!(
            h >= zero && w >= zero,
            "box height and width must be non-negative"
        );

        Ok(Self {
            cy: t + h / two,
            cx: l + w / two,
            h,
            w,
        })
    }

    fn try_from_cycxhw(cycxhw: [T; 4]) -> Result<Self> {
        let [cy, cx, h, w] = cycxhw;
        let zero = T::zero();
        ensure!(
            h >= zero && w >= zero,
            "box height and width must be non-negative"
        );

        Ok(Self { cy, cx, h, w })
    }
}

impl<T> From<&TLBR<T>> for CyCxHW<T>
where
    T: Copy + Num,
{
    fn from(from: &TLBR<T>) -> Self {
        let two = T::one() + T::one();
        let TLBR { t, l, b, r } = *from;
        let h = b - t;
        let w = r - l;
        Self {
            cy: t + h / two,
            cx: l + w / two,
            h,
            w,
        }
    }
}

impl<T> From<TLBR<T>> for CyCxHW<T>
where
    T: Copy + Num,
{
    fn from(from: TLBR<T>) -> Self {
        Self::from(&from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RectNum;
    use approx::assert_abs_diff_eq;

    #[test]
    fn tlbr_conversion() -> Result<()> {
        let bbox = CyCxHW::try_from_tlbr([0.2, 0.1, 0.6, 0.5])?;
        let [cy, cx, h, w] = bbox.cycxhw();
        assert_abs_diff_eq!(cy, 0.4, epsilon = 1e-12);
        assert_abs_diff_eq!(cx, 0.3, epsilon = 1e-12);
        assert_abs_diff_eq!(h, 0.4, epsilon = 1e-12);
        assert_abs_diff_eq!(w, 0.4, epsilon = 1e-12);

        let [t, l, b, r] = bbox.tlbr();
        assert_abs_diff_eq!(t, 0.2, epsilon = 1e-12);
        assert_abs_diff_eq!(l, 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(b, 0.6, epsilon = 1e-12);
        assert_abs_diff_eq!(r, 0.5, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn negative_size_is_rejected() {
        assert!(CyCxHW::try_from_cycxhw([0.5, 0.5, -0.1, 0.1]).is_err());
        assert!(CyCxHW::try_from_tlbr([0.5, 0.5, 0.4, 0.6]).is_err());
    }

    #[test]
    fn scale_to_ratio_units() -> Result<()> {
        let pixel = CyCxHW::try_from_cycxhw([208.0, 104.0, 41.6, 83.2])?;
        let ratio = pixel.try_scale_hw(1.0 / 416.0, 1.0 / 416.0)?;
        let [cy, cx, h, w] = ratio.cycxhw();
        assert_abs_diff_eq!(cy, 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(cx, 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(h, 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(w, 0.2, epsilon = 1e-12);
        assert!(pixel.try_scale_hw(0.0, 1.0).is_err());
        Ok(())
    }
}
