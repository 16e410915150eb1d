//! Qualitative evaluation on a fixed test image.

use crate::{common::*, data::load_image};

const STROKE: usize = 2;

/// Runs detection on a test image and saves the annotated result.
#[derive(Debug)]
pub struct TestImageEvaluator {
    image: Tensor,
    output_dir: PathBuf,
    inference: YoloInference,
}

impl TestImageEvaluator {
    /// Load the test image resized to the network input size.
    pub fn new(
        image_file: &Path,
        output_dir: PathBuf,
        geometry: Arc<Geometry>,
        confidence_thresh: R64,
    ) -> Result<Self> {
        let input_size = [geometry.input_h(), geometry.input_w()];
        let image = load_image(image_file, input_size)?;
        let inference = YoloInferenceInit { confidence_thresh }.build(geometry)?;
        std::fs::create_dir_all(&output_dir)
            .with_context(|| format!("failed to create '{}'", output_dir.display()))?;

        Ok(Self {
            image,
            output_dir,
            inference,
        })
    }

    /// Detect objects on the test image and save `epoch-<epoch>-result.jpg`.
    pub fn evaluate<M>(&self, model: &mut M, device: Device, epoch: usize) -> Result<PathBuf>
    where
        M: DetectionModel,
    {
        let predictions =
            tch::no_grad(|| model.forward_t(&self.image.to_device(device).unsqueeze(0), false))?;
        let detections = self.inference.forward(&predictions)?;
        let detections = detections.into_iter().next().unwrap_or_default();
        info!("epoch {}: {} detections on test image", epoch, detections.len());

        let mut canvas = self.image.copy();
        draw_detections(&mut canvas, &detections)?;

        let path = self
            .output_dir
            .join(format!("epoch-{}-result.jpg", epoch));
        let canvas = (canvas * 255.0).clamp(0.0, 255.0).to_kind(Kind::Uint8);
        vision::image::save(&canvas, &path)
            .with_context(|| format!("failed to save '{}'", path.display()))?;
        Ok(path)
    }
}

/// Draw detection boxes on a `[3, height, width]` float image.
pub fn draw_detections(image: &mut Tensor, detections: &[Detection]) -> Result<()> {
    let (_channels, height, width) = image.size3()?;
    let color = Tensor::of_slice(&[1f32, 1.0, 0.0]);

    for detection in detections {
        let [t, l, b, r] = detection.rect.tlbr();
        let _ = image.f_draw_rect_(
            (t.raw() * height as f64) as i64,
            (l.raw() * width as f64) as i64,
            (b.raw() * height as f64) as i64,
            (r.raw() * width as f64) as i64,
            STROKE,
            &color,
        )?;
    }
    Ok(())
}
