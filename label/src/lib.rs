//! Ground truth labels and the label file format.

use anyhow::{ensure, format_err, Context as _, Result};
use bbox::{prelude::*, CyCxHW, TLBR};
use noisy_float::prelude::*;
use num_traits::Num;
use std::path::PathBuf;

/// A bounding box paired with a class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label<R, C>
where
    R: Rect,
{
    pub rect: R,
    pub class: C,
}

/// A label in ratio units, where image height and width are both 1.
pub type RatioLabel = Label<CyCxHW<R64>, usize>;

impl<R, C> Label<R, C>
where
    R: Rect,
    R::Type: Num + PartialOrd,
{
    pub fn cycxhw(&self) -> [R::Type; 4] {
        self.rect.cycxhw()
    }
}

impl RatioLabel {
    /// Build a label from a class id and center/size coordinates in `[x, y, w, h]` order.
    pub fn from_xywh(class: usize, xywh: [f64; 4]) -> Result<Self> {
        let [x, y, w, h] = xywh;
        ensure!(
            xywh.iter().all(|value| value.is_finite()),
            "box coordinates must be finite, but get {:?}",
            xywh
        );
        let rect = CyCxHW::try_from_cycxhw([r64(y), r64(x), r64(h), r64(w)])?;
        Ok(Self { rect, class })
    }
}

/// One line of a label file.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelRecord {
    pub image_file: PathBuf,
    pub image_size: [usize; 2],
    pub labels: Vec<RatioLabel>,
}

/// Parse a label line.
///
/// The line is whitespace separated in the form
/// `image_file image_height image_width [xmin ymin xmax ymax class_id]*`
/// where box coordinates are in pixels.
pub fn parse_label_line(line: &str) -> Result<LabelRecord> {
    let mut tokens = line.split_whitespace();
    let image_file: PathBuf = tokens
        .next()
        .ok_or_else(|| format_err!("empty label line"))?
        .into();
    let mut next_usize = |name: &str| -> Result<usize> {
        let token = tokens
            .next()
            .ok_or_else(|| format_err!("missing {}", name))?;
        token
            .parse()
            .with_context(|| format!("invalid {} '{}'", name, token))
    };
    let image_h = next_usize("image height")?;
    let image_w = next_usize("image width")?;
    ensure!(
        image_h > 0 && image_w > 0,
        "image size must be positive, but get {}x{}",
        image_h,
        image_w
    );

    let rest: Vec<_> = tokens.collect();
    ensure!(
        rest.len() % 5 == 0,
        "expect groups of 'xmin ymin xmax ymax class_id', but get {} trailing tokens",
        rest.len() % 5
    );

    let labels: Vec<_> = rest
        .chunks(5)
        .map(|group| -> Result<_> {
            let coords: Vec<f64> = group[0..4]
                .iter()
                .map(|token| {
                    token
                        .parse()
                        .with_context(|| format!("invalid box coordinate '{}'", token))
                })
                .collect::<Result<_>>()?;
            ensure!(
                coords.iter().all(|value| value.is_finite()),
                "box coordinates must be finite, but get {:?}",
                coords
            );
            let class: usize = group[4]
                .parse()
                .with_context(|| format!("invalid class id '{}'", group[4]))?;
            let (xmin, ymin, xmax, ymax) = (coords[0], coords[1], coords[2], coords[3]);

            let pixel_rect = TLBR::try_from_tlbr([r64(ymin), r64(xmin), r64(ymax), r64(xmax)])
                .with_context(|| format!("invalid box {:?}", coords))?;
            let rect = CyCxHW::from(pixel_rect)
                .try_scale_hw(r64(1.0 / image_h as f64), r64(1.0 / image_w as f64))?;

            Ok(Label { rect, class })
        })
        .collect::<Result<_>>()?;

    Ok(LabelRecord {
        image_file,
        image_size: [image_h, image_w],
        labels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn parse_line_with_boxes() -> Result<()> {
        let record = parse_label_line("images/0001.jpg 200 400 100 50 300 150 7 0 0 40 20 0")?;
        assert_eq!(record.image_file, PathBuf::from("images/0001.jpg"));
        assert_eq!(record.image_size, [200, 400]);
        assert_eq!(record.labels.len(), 2);

        let first = &record.labels[0];
        assert_eq!(first.class, 7);
        let [cy, cx, h, w] = first.cycxhw();
        assert_abs_diff_eq!(cy.raw(), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(cx.raw(), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(h.raw(), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(w.raw(), 0.5, epsilon = 1e-12);

        let second = &record.labels[1];
        assert_eq!(second.class, 0);
        let [cy, cx, h, w] = second.cycxhw();
        assert_abs_diff_eq!(cy.raw(), 0.05, epsilon = 1e-12);
        assert_abs_diff_eq!(cx.raw(), 0.05, epsilon = 1e-12);
        assert_abs_diff_eq!(h.raw(), 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(w.raw(), 0.1, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn parse_line_without_boxes() -> Result<()> {
        let record = parse_label_line("background.png 416 416")?;
        assert!(record.labels.is_empty());
        Ok(())
    }

    #[test]
    fn reject_malformed_lines() {
        assert!(parse_label_line("").is_err());
        assert!(parse_label_line("a.jpg 416").is_err());
        assert!(parse_label_line("a.jpg 416 416 1 2 3").is_err());
        assert!(parse_label_line("a.jpg 416 416 10 10 5 20 1").is_err());
        assert!(parse_label_line("a.jpg 416 416 1 2 3 4 cat").is_err());
        assert!(parse_label_line("a.jpg 0 416").is_err());
    }

    #[test]
    fn label_from_xywh() -> Result<()> {
        let label = RatioLabel::from_xywh(2, [0.25, 0.75, 0.1, 0.2])?;
        let [cy, cx, h, w] = label.cycxhw();
        assert_eq!(label.class, 2);
        assert_abs_diff_eq!(cy.raw(), 0.75);
        assert_abs_diff_eq!(cx.raw(), 0.25);
        assert_abs_diff_eq!(h.raw(), 0.2);
        assert_abs_diff_eq!(w.raw(), 0.1);
        assert!(RatioLabel::from_xywh(0, [f64::NAN, 0.5, 0.1, 0.1]).is_err());
        assert!(RatioLabel::from_xywh(0, [0.5, 0.5, -0.1, 0.1]).is_err());
        Ok(())
    }
}
