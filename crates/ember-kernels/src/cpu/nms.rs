use ember_engine::{ElementType, EngineError, Kernel, KernelContext, Node, Result};

/// Greedy non-maximum suppression per batch and class
///
/// Inputs: boxes `[B, N, 4]`, scores `[B, C, N]`, then the optional scalars
/// max_output_boxes_per_class (int64, default 0), iou_threshold (default 0)
/// and score_threshold (no filtering when absent). Output is int64 `[K, 3]`
/// of (batch, class, box) in selection order.
pub struct NonMaxSuppression {
    center_point_box: bool,
}

impl NonMaxSuppression {
    /// # Errors
    /// Returns `InvalidArgument` when `center_point_box` isn't 0 or 1
    pub fn from_node(node: &Node) -> Result<NonMaxSuppression> {
        match node.attr_int("center_point_box").unwrap_or(0) {
            0 => Ok(NonMaxSuppression {
                center_point_box: false,
            }),
            1 => Ok(NonMaxSuppression {
                center_point_box: true,
            }),
            other => Err(EngineError::InvalidArgument(format!(
                "center_point_box only supports 0 or 1, got {}",
                other
            ))),
        }
    }

    /// (x_min, y_min, x_max, y_max) of box `index`
    fn corners(&self, boxes: &[f32], index: usize) -> (f32, f32, f32, f32) {
        let b = &boxes[index * 4..index * 4 + 4];
        if self.center_point_box {
            let (half_w, half_h) = (b[2] / 2.0, b[3] / 2.0);
            (b[0] - half_w, b[1] - half_h, b[0] + half_w, b[1] + half_h)
        } else {
            // [y1, x1, y2, x2], either corner may come first
            (
                b[1].min(b[3]),
                b[0].min(b[2]),
                b[1].max(b[3]),
                b[0].max(b[2]),
            )
        }
    }

    fn suppresses(&self, boxes: &[f32], kept: usize, candidate: usize, iou_threshold: f32) -> bool {
        let (ax0, ay0, ax1, ay1) = self.corners(boxes, kept);
        let (bx0, by0, bx1, by1) = self.corners(boxes, candidate);

        let width = (ax1.min(bx1) - ax0.max(bx0)).max(0.0);
        let height = (ay1.min(by1) - ay0.max(by0)).max(0.0);
        let intersection = width * height;
        if intersection <= 0.0 {
            return false;
        }
        let area_a = (ax1 - ax0) * (ay1 - ay0);
        let area_b = (bx1 - bx0) * (by1 - by0);
        let union = area_a + area_b - intersection;
        if area_a <= 0.0 || area_b <= 0.0 || union <= 0.0 {
            return false;
        }
        intersection / union > iou_threshold
    }
}

fn optional_scalar<T: ember_engine::TensorElement>(
    ctx: &KernelContext,
    index: usize,
    what: &str,
) -> Result<Option<T>> {
    match ctx.input(index) {
        None => Ok(None),
        Some(t) if t.is_empty() => Ok(None),
        Some(t) if t.len() == 1 => Ok(Some(t.as_slice::<T>()?[0])),
        Some(t) => Err(EngineError::InvalidArgument(format!(
            "{} must be a scalar, got shape {:?}",
            what,
            t.shape()
        ))),
    }
}

impl Kernel for NonMaxSuppression {
    fn compute(&self, ctx: &mut KernelContext) -> Result<()> {
        let boxes_tensor = ctx.required_input(0)?.clone();
        let scores_tensor = ctx.required_input(1)?.clone();
        let (bs, ss) = (boxes_tensor.shape(), scores_tensor.shape());
        if bs.len() != 3 || bs[2] != 4 {
            return Err(EngineError::InvalidArgument(format!(
                "boxes must be [batches, boxes, 4], got {:?}",
                bs
            )));
        }
        if ss.len() != 3 || ss[0] != bs[0] || ss[2] != bs[1] {
            return Err(EngineError::InvalidArgument(format!(
                "scores must be [batches, classes, boxes] matching boxes {:?}, got {:?}",
                bs, ss
            )));
        }
        let (batches, classes, count) = (ss[0], ss[1], ss[2]);

        let max_per_class = optional_scalar::<i64>(ctx, 2, "max_output_boxes_per_class")?.unwrap_or(0);
        let iou_threshold = optional_scalar::<f32>(ctx, 3, "iou_threshold")?.unwrap_or(0.0);
        let score_threshold = optional_scalar::<f32>(ctx, 4, "score_threshold")?;
        if !(0.0..=1.0).contains(&iou_threshold) {
            return Err(EngineError::InvalidArgument(format!(
                "iou_threshold must be in [0, 1], got {}",
                iou_threshold
            )));
        }

        let boxes = boxes_tensor.as_slice::<f32>()?;
        let scores = scores_tensor.as_slice::<f32>()?;
        let mut selected: Vec<[i64; 3]> = Vec::new();

        if max_per_class > 0 {
            let limit = max_per_class as usize;
            for batch in 0..batches {
                let batch_boxes = &boxes[batch * count * 4..(batch + 1) * count * 4];
                for class in 0..classes {
                    let offset = (batch * classes + class) * count;
                    let class_scores = &scores[offset..offset + count];

                    let mut candidates: Vec<usize> = (0..count)
                        .filter(|&i| score_threshold.is_none_or(|t| class_scores[i] > t))
                        .collect();
                    // highest score first, lower index wins ties
                    candidates.sort_by(|&a, &b| {
                        class_scores[b]
                            .partial_cmp(&class_scores[a])
                            .unwrap_or(std::cmp::Ordering::Equal)
                    });

                    let mut kept: Vec<usize> = Vec::new();
                    for candidate in candidates {
                        if kept.len() >= limit {
                            break;
                        }
                        if kept
                            .iter()
                            .all(|&k| !self.suppresses(batch_boxes, k, candidate, iou_threshold))
                        {
                            kept.push(candidate);
                        }
                    }
                    selected.extend(
                        kept.into_iter()
                            .map(|b| [batch as i64, class as i64, b as i64]),
                    );
                }
            }
        }

        let out = ctx
            .output(0, &[selected.len(), 3], ElementType::Int64)?
            .as_mut_slice::<i64>()?;
        for (row, triple) in out.chunks_exact_mut(3).zip(&selected) {
            row.copy_from_slice(triple);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_engine::{Allocator, Attribute, Tensor};

    fn nms(center: i64, inputs: Vec<Option<Tensor>>) -> Result<Vec<i64>> {
        let node = Node::new("NonMaxSuppression", &["b", "s"], &["y"])
            .with_attribute("center_point_box", Attribute::Int(center));
        let kernel = NonMaxSuppression::from_node(&node)?;
        let mut ctx = KernelContext::new("nms", inputs, 1, Allocator::host());
        kernel.compute(&mut ctx)?;
        ctx.into_outputs()?.remove(0).to_vec::<i64>()
    }

    fn corner_boxes() -> Tensor {
        Tensor::from_slice(
            &[1, 6, 4],
            &[
                0.0f32, 0.0, 1.0, 1.0, //
                0.0, 0.1, 1.0, 1.1, //
                0.0, -0.1, 1.0, 0.9, //
                0.0, 10.0, 1.0, 11.0, //
                0.0, 10.1, 1.0, 11.1, //
                0.0, 100.0, 1.0, 101.0,
            ],
        )
        .unwrap()
    }

    fn scores() -> Tensor {
        Tensor::from_slice(&[1, 1, 6], &[0.9f32, 0.75, 0.6, 0.95, 0.5, 0.3]).unwrap()
    }

    #[test]
    fn test_suppresses_overlapping_boxes() {
        let out = nms(
            0,
            vec![
                Some(corner_boxes()),
                Some(scores()),
                Some(Tensor::scalar(3i64).unwrap()),
                Some(Tensor::scalar(0.5f32).unwrap()),
                Some(Tensor::scalar(0.0f32).unwrap()),
            ],
        )
        .unwrap();
        assert_eq!(out, vec![0, 0, 3, 0, 0, 0, 0, 0, 5]);
    }

    #[test]
    fn test_score_threshold_and_limit() {
        let out = nms(
            0,
            vec![
                Some(corner_boxes()),
                Some(scores()),
                Some(Tensor::scalar(2i64).unwrap()),
                Some(Tensor::scalar(0.5f32).unwrap()),
                Some(Tensor::scalar(0.92f32).unwrap()),
            ],
        )
        .unwrap();
        assert_eq!(out, vec![0, 0, 3]);
    }

    #[test]
    fn test_no_max_output_selects_nothing() {
        let out = nms(0, vec![Some(corner_boxes()), Some(scores())]).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_center_point_format() {
        let boxes = Tensor::from_slice(
            &[1, 2, 4],
            &[0.5f32, 0.5, 1.0, 1.0, 0.5, 0.6, 1.0, 1.0],
        )
        .unwrap();
        let scores = Tensor::from_slice(&[1, 1, 2], &[0.9f32, 0.8]).unwrap();
        let out = nms(
            1,
            vec![
                Some(boxes),
                Some(scores),
                Some(Tensor::scalar(2i64).unwrap()),
                Some(Tensor::scalar(0.5f32).unwrap()),
            ],
        )
        .unwrap();
        assert_eq!(out, vec![0, 0, 0]);
    }

    #[test]
    fn test_bad_center_point_box_rejected_at_creation() {
        let node = Node::new("NonMaxSuppression", &["b", "s"], &["y"])
            .with_attribute("center_point_box", Attribute::Int(2));
        assert!(NonMaxSuppression::from_node(&node).is_err());
    }
}
