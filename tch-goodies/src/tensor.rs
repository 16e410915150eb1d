use crate::common::*;

pub trait TensorExt {
    fn is_empty(&self) -> bool;

    fn f_sum_tensors<T>(tensors: impl IntoIterator<Item = T>) -> Result<Tensor>
    where
        T: Borrow<Tensor>,
    {
        let mut iter = tensors.into_iter();
        let first = iter
            .next()
            .ok_or_else(|| format_err!("the input iterator must not be empty"))?
            .borrow()
            .shallow_clone();
        let sum = iter.try_fold(first, |lhs, rhs| lhs.f_add(rhs.borrow()))?;
        Ok(sum)
    }

    /// Fill the `[top, bottom) x [left, right)` region of a `[C, H, W]` or
    /// `[B, C, H, W]` image with a `[C]` color.
    fn f_fill_rect_(
        &mut self,
        top: i64,
        left: i64,
        bottom: i64,
        right: i64,
        color: &Tensor,
    ) -> Result<Tensor>;

    /// Draw the outline of a rectangle with the given stroke width.
    fn f_draw_rect_(
        &mut self,
        top: i64,
        left: i64,
        bottom: i64,
        right: i64,
        stroke: usize,
        color: &Tensor,
    ) -> Result<Tensor>;
}

impl TensorExt for Tensor {
    fn is_empty(&self) -> bool {
        self.numel() == 0
    }

    fn f_fill_rect_(
        &mut self,
        top: i64,
        left: i64,
        bottom: i64,
        right: i64,
        color: &Tensor,
    ) -> Result<Tensor> {
        tch::no_grad(|| -> Result<_> {
            match *self.size().as_slice() {
                [_bsize, n_channels, _height, _width] => {
                    ensure!(
                        color.size1()? == n_channels,
                        "the number of channels of input and color tensors do not match"
                    );
                    let mut rect = self.i((.., .., top..bottom, left..right));
                    let expanded_color = color.f_view([1, n_channels, 1, 1])?.f_expand_as(&rect)?;
                    rect.f_copy_(&expanded_color)?;
                }
                [n_channels, _height, _width] => {
                    ensure!(
                        color.size1()? == n_channels,
                        "the number of channels of input and color tensors do not match"
                    );
                    let mut rect = self.i((.., top..bottom, left..right));
                    let expanded_color = color.f_view([n_channels, 1, 1])?.f_expand_as(&rect)?;
                    rect.f_copy_(&expanded_color)?;
                }
                _ => bail!("invalid shape: expect three or four dims"),
            }
            Ok(())
        })?;

        Ok(self.shallow_clone())
    }

    fn f_draw_rect_(
        &mut self,
        t: i64,
        l: i64,
        b: i64,
        r: i64,
        stroke: usize,
        color: &Tensor,
    ) -> Result<Tensor> {
        let (height, width) = match *self.size().as_slice() {
            [_b, _c, h, w] => (h, w),
            [_c, h, w] => (h, w),
            _ => bail!("invalid shape: expect three or four dimensions"),
        };
        ensure!(stroke > 0, "stroke must be positive");

        let half_stroke = (stroke / 2) as i64;
        let stroke = stroke as i64;
        let clamp_h = |value: i64| value.max(0).min(height);
        let clamp_w = |value: i64| value.max(0).min(width);

        let outer_t = clamp_h(t - half_stroke);
        let outer_l = clamp_w(l - half_stroke);
        let outer_b = clamp_h(b + half_stroke);
        let outer_r = clamp_w(r + half_stroke);
        let inner_t = clamp_h(t - half_stroke + stroke);
        let inner_l = clamp_w(l - half_stroke + stroke);
        let inner_b = clamp_h(b + half_stroke - stroke);
        let inner_r = clamp_w(r + half_stroke - stroke);

        // top, left, bottom and right edges
        let _ = self.f_fill_rect_(outer_t, outer_l, inner_t, outer_r, color)?;
        let _ = self.f_fill_rect_(outer_t, outer_l, outer_b, inner_l, color)?;
        let _ = self.f_fill_rect_(inner_b, outer_l, outer_b, outer_r, color)?;
        let _ = self.f_fill_rect_(outer_t, inner_r, outer_b, outer_r, color)?;

        Ok(self.shallow_clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_tensors() -> Result<()> {
        let tensors = vec![Tensor::from(1.0f32), Tensor::from(2.0f32), Tensor::from(3.5f32)];
        let sum = Tensor::f_sum_tensors(&tensors)?;
        assert!((f32::from(&sum) - 6.5).abs() < 1e-6);
        assert!(Tensor::f_sum_tensors(Vec::<Tensor>::new()).is_err());
        Ok(())
    }

    #[test]
    fn draw_rect_outline() -> Result<()> {
        let mut image = Tensor::zeros(&[3, 10, 10], (Kind::Float, Device::Cpu));
        let color = Tensor::of_slice(&[1.0f32, 0.5, 0.0]);
        let _ = image.f_draw_rect_(2, 2, 8, 8, 2, &color)?;

        // the edge is painted and the interior is untouched
        let edge = f32::from(image.i((0, 2, 5)));
        let inner = f32::from(image.i((0, 5, 5)));
        assert!((edge - 1.0).abs() < 1e-6);
        assert!(inner.abs() < 1e-6);

        let green = f32::from(image.i((1, 5, 2)));
        assert!((green - 0.5).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn draw_rect_rejects_bad_color() {
        let mut image = Tensor::zeros(&[3, 10, 10], (Kind::Float, Device::Cpu));
        let color = Tensor::of_slice(&[1.0f32, 0.5]);
        assert!(image.f_draw_rect_(2, 2, 8, 8, 2, &color).is_err());
    }
}
