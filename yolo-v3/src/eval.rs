//! Detection decoding, non-max suppression and average precision.

use crate::{
    bbox::{LabeledBox, RatioRect},
    common::*,
    dataset::BatchGenerator,
    model::{YoloV3, NUM_ANCHORS_PER_SCALE, NUM_SCALES, STRIDES},
};

/// One decoded detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Detection {
    pub rect: RatioRect,
    pub class: usize,
    pub confidence: R64,
}

#[derive(Debug, Clone)]
pub struct MapEvaluatorInit {
    /// The 9 anchor sizes in pixels, coarsest scale first, matching the
    /// loss configuration.
    pub anchors: Vec<(R64, R64)>,
    /// Detections match ground truth at or above this IoU.
    pub iou_threshold: R64,
    pub confidence_threshold: R64,
    pub nms_threshold: R64,
}

impl MapEvaluatorInit {
    pub fn new(anchors: Vec<(R64, R64)>) -> Self {
        Self {
            anchors,
            iou_threshold: r64(0.5),
            confidence_threshold: r64(0.5),
            nms_threshold: r64(0.45),
        }
    }

    pub fn build(self) -> Result<MapEvaluator> {
        let Self {
            anchors,
            iou_threshold,
            confidence_threshold,
            nms_threshold,
        } = self;

        ensure!(
            anchors.len() == NUM_SCALES * NUM_ANCHORS_PER_SCALE,
            "expect {} anchors, get {}",
            NUM_SCALES * NUM_ANCHORS_PER_SCALE,
            anchors.len()
        );
        ensure!(
            [iou_threshold, confidence_threshold, nms_threshold]
                .iter()
                .all(|thresh| (0.0..=1.0).contains(&thresh.raw())),
            "thresholds must be in range [0, 1]"
        );

        Ok(MapEvaluator {
            anchors,
            iou_threshold,
            confidence_threshold,
            nms_threshold,
        })
    }
}

/// Computes per-class average precision of a model over a dataset.
#[derive(Debug)]
pub struct MapEvaluator {
    anchors: Vec<(R64, R64)>,
    iou_threshold: R64,
    confidence_threshold: R64,
    nms_threshold: R64,
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

impl MapEvaluator {
    /// Runs the model over every record of the generator and returns the
    /// average precision per class index.
    pub fn evaluate(
        &self,
        model: &YoloV3,
        generator: &BatchGenerator,
    ) -> Result<IndexMap<usize, R64>> {
        let num_classes = generator.classes().len();
        let net_size = generator.fixed_net_size();
        let batch_size = generator.batch_size();

        let mut detections: Vec<(usize, Detection)> = vec![];
        let mut ground_truth: Vec<(usize, LabeledBox)> = vec![];

        let indexes: Vec<usize> = (0..generator.num_records()).collect();
        for (batch_index, chunk) in indexes.chunks(batch_size).enumerate() {
            let batch = generator.load_batch(chunk, net_size)?;
            let outputs = tch::no_grad(|| model.forward_t(&batch.images, false))?;
            let decoded = self.decode(&outputs)?;

            for (offset, (image_dets, image_gts)) in
                izip!(decoded, &batch.bboxes).enumerate()
            {
                let image = batch_index * batch_size + offset;
                let image_dets = self.non_max_suppression(image_dets);
                detections.extend(image_dets.into_iter().map(|det| (image, det)));
                ground_truth.extend(image_gts.iter().map(|&labeled| (image, labeled)));
            }
        }

        Ok(self.average_precisions(num_classes, &detections, &ground_truth))
    }

    /// Decodes raw detection maps into per-image candidate detections
    /// above the confidence threshold.
    fn decode(&self, predictions: &[Tensor; NUM_SCALES]) -> Result<Vec<Vec<Detection>>> {
        let num_anchors = NUM_ANCHORS_PER_SCALE as i64;
        let batch_size = predictions[0].size4()?.0;
        let mut decoded: Vec<Vec<Detection>> = (0..batch_size).map(|_| vec![]).collect();

        for (scale, prediction) in predictions.iter().enumerate() {
            let (b, channels, grid, _) = prediction.size4()?;
            let num_outputs = channels / num_anchors;
            let num_classes = (num_outputs - 5) as usize;
            let net_size = (STRIDES[scale] * grid) as f64;

            let values: Vec<f32> = Vec::from(
                &prediction
                    .view([b, num_anchors, num_outputs, grid, grid])
                    .permute(&[0, 1, 3, 4, 2])
                    .contiguous()
                    .to_device(Device::Cpu)
                    .view([-1]),
            );

            let grid = grid as usize;
            let num_outputs = num_outputs as usize;
            for image in 0..b as usize {
                for anchor in 0..NUM_ANCHORS_PER_SCALE {
                    let (anchor_w, anchor_h) =
                        self.anchors[scale * NUM_ANCHORS_PER_SCALE + anchor];
                    for gy in 0..grid {
                        for gx in 0..grid {
                            let base = ((((image * NUM_ANCHORS_PER_SCALE + anchor) * grid
                                + gy)
                                * grid)
                                + gx)
                                * num_outputs;
                            let objectness = sigmoid(values[base + 4]);
                            if (objectness as f64) <= self.confidence_threshold.raw() {
                                continue;
                            }

                            let (class, class_score) = (0..num_classes)
                                .map(|class| (class, sigmoid(values[base + 5 + class])))
                                .max_by(|(_, lhs), (_, rhs)| {
                                    lhs.partial_cmp(rhs).unwrap_or(Ordering::Equal)
                                })
                                .expect("the class list cannot be empty");
                            let confidence = (objectness * class_score) as f64;
                            if confidence <= self.confidence_threshold.raw() {
                                continue;
                            }

                            let cx = (sigmoid(values[base]) as f64 + gx as f64) / grid as f64;
                            let cy =
                                (sigmoid(values[base + 1]) as f64 + gy as f64) / grid as f64;
                            let w = (values[base + 2] as f64).exp() * anchor_w.raw() / net_size;
                            let h =
                                (values[base + 3] as f64).exp() * anchor_h.raw() / net_size;

                            let clamp = |value: f64| value.max(0.0).min(1.0);
                            let rect = match RatioRect::try_new(
                                r64(clamp(cy - h / 2.0)),
                                r64(clamp(cx - w / 2.0)),
                                r64(clamp(cy + h / 2.0)),
                                r64(clamp(cx + w / 2.0)),
                            ) {
                                Ok(rect) => rect,
                                Err(_) => continue,
                            };
                            if rect.area() == 0.0 {
                                continue;
                            }

                            decoded[image].push(Detection {
                                rect,
                                class,
                                confidence: r64(confidence),
                            });
                        }
                    }
                }
            }
        }

        Ok(decoded)
    }

    /// Greedy per-class non-max suppression, highest confidence first.
    pub fn non_max_suppression(&self, mut detections: Vec<Detection>) -> Vec<Detection> {
        detections.sort_by_key(|det| -det.confidence);

        let mut kept: Vec<Detection> = vec![];
        for det in detections {
            let suppressed = kept.iter().any(|prev| {
                prev.class == det.class && prev.rect.iou(&det.rect) >= self.nms_threshold
            });
            if !suppressed {
                kept.push(det);
            }
        }
        kept
    }

    /// Computes per-class average precision with greedy matching at the
    /// IoU threshold: each ground truth box matches at most one detection,
    /// in order of decreasing confidence.
    pub fn average_precisions(
        &self,
        num_classes: usize,
        detections: &[(usize, Detection)],
        ground_truth: &[(usize, LabeledBox)],
    ) -> IndexMap<usize, R64> {
        (0..num_classes)
            .map(|class| {
                let mut class_dets: Vec<_> = detections
                    .iter()
                    .filter(|(_, det)| det.class == class)
                    .collect();
                class_dets.sort_by_key(|(_, det)| -det.confidence);

                let mut gt_by_image: HashMap<usize, Vec<(RatioRect, bool)>> = HashMap::new();
                ground_truth
                    .iter()
                    .filter(|(_, labeled)| labeled.class == class)
                    .for_each(|&(image, labeled)| {
                        gt_by_image
                            .entry(image)
                            .or_default()
                            .push((labeled.rect, false));
                    });
                let num_gt: usize = gt_by_image.values().map(|boxes| boxes.len()).sum();
                if num_gt == 0 {
                    return (class, r64(0.0));
                }

                let mut acc_tp = 0usize;
                let mut acc_fp = 0usize;
                let (recalls, precisions): (Vec<_>, Vec<_>) = class_dets
                    .into_iter()
                    .map(|&(image, ref det)| {
                        let matched = gt_by_image.get_mut(&image).and_then(|boxes| {
                            let (best, best_iou) = boxes
                                .iter_mut()
                                .map(|entry| {
                                    let iou = entry.0.iou(&det.rect);
                                    (entry, iou)
                                })
                                .max_by_key(|&(_, iou)| iou)?;
                            (best_iou >= self.iou_threshold && !best.1).then(|| {
                                best.1 = true;
                            })
                        });

                        if matched.is_some() {
                            acc_tp += 1;
                        } else {
                            acc_fp += 1;
                        }
                        (
                            r64(acc_tp as f64 / num_gt as f64),
                            r64(acc_tp as f64 / (acc_tp + acc_fp) as f64),
                        )
                    })
                    .unzip();

                (class, compute_ap(&recalls, &precisions))
            })
            .collect()
    }
}

/// Average precision of a precision/recall curve by the continuous VOC
/// integral: the area under the precision envelope over recall.
///
/// The inputs must be ordered by non-decreasing recall.
pub fn compute_ap(recalls: &[R64], precisions: &[R64]) -> R64 {
    debug_assert_eq!(recalls.len(), precisions.len());

    // sentinel values at both ends
    let mrec: Vec<_> = iter::once(r64(0.0))
        .chain(recalls.iter().copied())
        .chain(iter::once(r64(1.0)))
        .collect();
    let mut mpre: Vec<_> = iter::once(r64(0.0))
        .chain(precisions.iter().copied())
        .chain(iter::once(r64(0.0)))
        .collect();

    // precision envelope
    for index in (0..mpre.len() - 1).rev() {
        mpre[index] = mpre[index].max(mpre[index + 1]);
    }

    izip!(&mrec[..mrec.len() - 1], &mrec[1..], &mpre[1..])
        .filter(|(prev, curr, _)| prev != curr)
        .map(|(&prev, &curr, &precision)| (curr - prev) * precision)
        .sum()
}

/// Mean over the per-class average precisions.
pub fn mean_average_precision(average_precisions: &IndexMap<usize, R64>) -> R64 {
    if average_precisions.is_empty() {
        return r64(0.0);
    }
    let sum: R64 = average_precisions.values().copied().sum();
    sum / average_precisions.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::abs_diff_eq;

    fn test_evaluator() -> MapEvaluator {
        let anchors = vec![(r64(100.0), r64(100.0)); 9];
        MapEvaluatorInit::new(anchors).build().unwrap()
    }

    fn rect(t: f64, l: f64, b: f64, r: f64) -> RatioRect {
        RatioRect::try_new(r64(t), r64(l), r64(b), r64(r)).unwrap()
    }

    #[test]
    fn ap_of_perfect_detector_is_one() {
        let ap = compute_ap(&[r64(0.5), r64(1.0)], &[r64(1.0), r64(1.0)]);
        assert_eq!(ap, r64(1.0));
    }

    #[test]
    fn ap_of_partial_recall() {
        // one true positive out of two ground truths
        let ap = compute_ap(&[r64(0.5)], &[r64(1.0)]);
        assert_eq!(ap, r64(0.5));
    }

    #[test]
    fn ap_envelope_flattens_precision_dips() {
        let recalls = [r64(0.25), r64(0.5), r64(0.5), r64(0.75)];
        let precisions = [r64(1.0), r64(0.5), r64(0.66), r64(0.75)];
        // envelope is 1.0 until recall 0.25, then 0.75 until 0.75
        let ap = compute_ap(&recalls, &precisions);
        assert!(abs_diff_eq!(
            ap.raw(),
            0.25 * 1.0 + 0.5 * 0.75,
            epsilon = 1e-9
        ));
    }

    #[test]
    fn nms_suppresses_overlapping_same_class_boxes() {
        let evaluator = test_evaluator();
        let detections = vec![
            Detection {
                rect: rect(0.1, 0.1, 0.5, 0.5),
                class: 0,
                confidence: r64(0.8),
            },
            Detection {
                rect: rect(0.1, 0.1, 0.5, 0.52),
                class: 0,
                confidence: r64(0.9),
            },
            Detection {
                rect: rect(0.1, 0.1, 0.5, 0.5),
                class: 1,
                confidence: r64(0.7),
            },
        ];

        let kept = evaluator.non_max_suppression(detections);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, r64(0.9));
        assert_eq!(kept[0].class, 0);
        assert_eq!(kept[1].class, 1);
    }

    #[test]
    fn average_precision_counts_each_ground_truth_once() {
        let evaluator = test_evaluator();
        let gt_rect = rect(0.2, 0.2, 0.6, 0.6);
        let ground_truth = vec![
            (0, LabeledBox { rect: gt_rect, class: 0 }),
            (1, LabeledBox { rect: gt_rect, class: 0 }),
        ];
        // two detections on the same ground truth, one of them a duplicate
        let detections = vec![
            (
                0,
                Detection {
                    rect: gt_rect,
                    class: 0,
                    confidence: r64(0.9),
                },
            ),
            (
                0,
                Detection {
                    rect: rect(0.2, 0.2, 0.6, 0.61),
                    class: 0,
                    confidence: r64(0.8),
                },
            ),
        ];

        let aps = evaluator.average_precisions(1, &detections, &ground_truth);
        // precision/recall: (1.0, 0.5) then (0.5, 0.5), ap = 0.5
        assert_eq!(aps[&0], r64(0.5));
    }

    #[test]
    fn unmatched_classes_score_zero() {
        let evaluator = test_evaluator();
        let ground_truth = vec![(
            0,
            LabeledBox {
                rect: rect(0.2, 0.2, 0.6, 0.6),
                class: 1,
            },
        )];

        let aps = evaluator.average_precisions(2, &[], &ground_truth);
        assert_eq!(aps.len(), 2);
        assert_eq!(aps[&0], r64(0.0));
        assert_eq!(aps[&1], r64(0.0));
    }

    #[test]
    fn mean_ap_averages_classes() {
        let aps: IndexMap<usize, R64> =
            vec![(0, r64(1.0)), (1, r64(0.5))].into_iter().collect();
        assert_eq!(mean_average_precision(&aps), r64(0.75));
    }
}
