//! The YOLOv3 training loss.

use crate::{
    bbox::LabeledBox,
    common::*,
    model::{NUM_ANCHORS_PER_SCALE, NUM_SCALES, STRIDES},
};

#[derive(Debug, Clone)]
pub struct YoloLossInit {
    pub num_classes: usize,
    /// The 9 anchor sizes in pixels, `(width, height)` pairs ordered from
    /// the coarsest scale to the finest, 3 anchors per scale.
    pub anchors: Vec<(R64, R64)>,
    /// Predictions overlapping any ground truth box above this threshold
    /// are excluded from the no-objectness penalty.
    pub ignore_thresh: R64,
}

impl YoloLossInit {
    pub fn build(self) -> Result<YoloLoss> {
        let Self {
            num_classes,
            anchors,
            ignore_thresh,
        } = self;

        ensure!(num_classes > 0, "num_classes must be positive");
        ensure!(
            anchors.len() == NUM_SCALES * NUM_ANCHORS_PER_SCALE,
            "expect {} anchors, get {}",
            NUM_SCALES * NUM_ANCHORS_PER_SCALE,
            anchors.len()
        );
        ensure!(
            anchors.iter().all(|&(w, h)| w > 0.0 && h > 0.0),
            "anchor sizes must be positive"
        );
        ensure!(
            (0.0..=1.0).contains(&ignore_thresh.raw()),
            "ignore_thresh must be in range [0, 1]"
        );

        Ok(YoloLoss {
            num_classes,
            anchors,
            ignore_thresh,
        })
    }
}

#[derive(Debug)]
pub struct YoloLoss {
    num_classes: usize,
    anchors: Vec<(R64, R64)>,
    ignore_thresh: R64,
}

/// Loss components of one batch. The driver optimizes `total_loss`
/// directly.
#[derive(Debug)]
pub struct YoloLossOutput {
    pub total_loss: Tensor,
    pub coord_loss: Tensor,
    pub objectness_loss: Tensor,
    pub classification_loss: Tensor,
}

/// Ground truth bound to one anchor slot of one grid cell.
#[derive(Debug, Clone, PartialEq)]
struct Assignment {
    image: usize,
    anchor: usize,
    gy: i64,
    gx: i64,
    tx: f32,
    ty: f32,
    tw: f32,
    th: f32,
    class: usize,
    /// Coordinate loss weight, `2 - w * h`, emphasizing small boxes.
    scale_weight: f32,
}

fn wh_iou(w1: f64, h1: f64, w2: f64, h2: f64) -> f64 {
    let intersection = w1.min(w2) * h1.min(h2);
    intersection / (w1 * h1 + w2 * h2 - intersection)
}

/// Pairwise IoU between two box lists in (cx, cy, w, h) format.
fn box_iou_cxcywh(lhs: &Tensor, rhs: &Tensor) -> Tensor {
    // [m, 1]
    let l_cx = lhs.i((.., 0..1));
    let l_cy = lhs.i((.., 1..2));
    let l_w = lhs.i((.., 2..3));
    let l_h = lhs.i((.., 3..4));
    // [1, n]
    let r_cx = rhs.i((.., 0..1)).transpose(0, 1);
    let r_cy = rhs.i((.., 1..2)).transpose(0, 1);
    let r_w = rhs.i((.., 2..3)).transpose(0, 1);
    let r_h = rhs.i((.., 3..4)).transpose(0, 1);

    let inter_l = (&l_cx - &l_w / 2.0).maximum(&(&r_cx - &r_w / 2.0));
    let inter_r = (&l_cx + &l_w / 2.0).minimum(&(&r_cx + &r_w / 2.0));
    let inter_t = (&l_cy - &l_h / 2.0).maximum(&(&r_cy - &r_h / 2.0));
    let inter_b = (&l_cy + &l_h / 2.0).minimum(&(&r_cy + &r_h / 2.0));

    let intersection = (inter_r - inter_l).clamp_min(0.0) * (inter_b - inter_t).clamp_min(0.0);
    let l_area = &l_w * &l_h;
    let r_area = &r_w * &r_h;
    &intersection / (l_area + r_area - &intersection + 1e-16)
}

impl YoloLoss {
    /// Computes the loss of raw detection maps against per-image ground
    /// truth. `net_size` is the pixel size the batch was resized to.
    pub fn forward(
        &self,
        predictions: &[Tensor; NUM_SCALES],
        ground_truth: &[Vec<LabeledBox>],
        net_size: i64,
    ) -> Result<YoloLossOutput> {
        let device = predictions[0].device();
        let batch_size = ground_truth.len();
        let num_classes = self.num_classes;
        let num_outputs = 5 + num_classes as i64;
        let num_anchors = NUM_ANCHORS_PER_SCALE as i64;

        let assignments = self.assign_targets(ground_truth, net_size);

        let mut coord_loss = Tensor::zeros(&[], (Kind::Float, device));
        let mut objectness_loss = Tensor::zeros(&[], (Kind::Float, device));
        let mut classification_loss = Tensor::zeros(&[], (Kind::Float, device));

        for (scale, prediction) in predictions.iter().enumerate() {
            let grid = net_size / STRIDES[scale];
            let (b, channels, height, width) = prediction.size4()?;
            ensure!(
                b == batch_size as i64
                    && channels == num_anchors * num_outputs
                    && height == grid
                    && width == grid,
                "invalid prediction shape {:?} at scale {}",
                prediction.size(),
                scale
            );

            // [b, na, g, g, 5 + nc]
            let prediction = prediction
                .view([b, num_anchors, num_outputs, grid, grid])
                .permute(&[0, 1, 3, 4, 2]);
            let pred_xy = prediction.i((.., .., .., .., 0..2));
            let pred_wh = prediction.i((.., .., .., .., 2..4));
            let pred_obj = prediction.i((.., .., .., .., 4));
            let pred_class = prediction.i((.., .., .., .., 5..));

            // build target tensors
            let cells = (batch_size * NUM_ANCHORS_PER_SCALE) * (grid * grid) as usize;
            let mut t_xy = vec![0f32; cells * 2];
            let mut t_wh = vec![0f32; cells * 2];
            let mut t_obj = vec![0f32; cells];
            let mut t_class = vec![0f32; cells * num_classes];
            let mut t_mask = vec![0f32; cells];
            let mut t_scale = vec![0f32; cells];

            for assignment in &assignments[scale] {
                let Assignment {
                    image,
                    anchor,
                    gy,
                    gx,
                    tx,
                    ty,
                    tw,
                    th,
                    class,
                    scale_weight,
                } = *assignment;
                let cell = ((image * NUM_ANCHORS_PER_SCALE + anchor) * (grid * grid) as usize)
                    + (gy * grid + gx) as usize;

                t_xy[cell * 2] = tx;
                t_xy[cell * 2 + 1] = ty;
                t_wh[cell * 2] = tw;
                t_wh[cell * 2 + 1] = th;
                t_obj[cell] = 1.0;
                t_class[cell * num_classes + class] = 1.0;
                t_mask[cell] = 1.0;
                t_scale[cell] = scale_weight;
            }

            let t_xy = Tensor::of_slice(&t_xy)
                .view([b, num_anchors, grid, grid, 2])
                .to_device(device);
            let t_wh = Tensor::of_slice(&t_wh)
                .view([b, num_anchors, grid, grid, 2])
                .to_device(device);
            let t_obj = Tensor::of_slice(&t_obj)
                .view([b, num_anchors, grid, grid])
                .to_device(device);
            let t_class = Tensor::of_slice(&t_class)
                .view([b, num_anchors, grid, grid, num_classes as i64])
                .to_device(device);
            let t_mask = Tensor::of_slice(&t_mask)
                .view([b, num_anchors, grid, grid])
                .to_device(device);
            let t_scale = Tensor::of_slice(&t_scale)
                .view([b, num_anchors, grid, grid])
                .to_device(device);

            // objectness weight: positives always count, negatives are
            // dropped where a decoded prediction overlaps ground truth
            // above the ignore threshold
            let obj_weight = {
                let ignore =
                    self.ignore_mask(&pred_xy, &pred_wh, ground_truth, scale, grid, device);
                t_obj.maximum(&(ignore.neg() + 1.0))
            };

            let coord = {
                let xy_loss = pred_xy.binary_cross_entropy_with_logits::<&Tensor>(
                    &t_xy,
                    None,
                    None,
                    Reduction::None,
                ) * t_scale.unsqueeze(-1);
                let wh_diff = (&pred_wh - &t_wh) * t_mask.unsqueeze(-1);
                let wh_loss = (&wh_diff * &wh_diff) * t_scale.unsqueeze(-1) * 0.5;
                xy_loss.sum(Kind::Float) + wh_loss.sum(Kind::Float)
            };
            let objectness = (pred_obj.binary_cross_entropy_with_logits::<&Tensor>(
                &t_obj,
                None,
                None,
                Reduction::None,
            ) * obj_weight)
                .sum(Kind::Float);
            let classification = (pred_class.binary_cross_entropy_with_logits::<&Tensor>(
                &t_class,
                None,
                None,
                Reduction::None,
            ) * t_mask.unsqueeze(-1))
            .sum(Kind::Float);

            coord_loss = coord_loss + coord;
            objectness_loss = objectness_loss + objectness;
            classification_loss = classification_loss + classification;
        }

        let coord_loss = coord_loss / batch_size as f64;
        let objectness_loss = objectness_loss / batch_size as f64;
        let classification_loss = classification_loss / batch_size as f64;
        let total_loss = &coord_loss + &objectness_loss + &classification_loss;

        Ok(YoloLossOutput {
            total_loss,
            coord_loss,
            objectness_loss,
            classification_loss,
        })
    }

    /// Binds each ground truth box to the anchor slot with the best
    /// width/height IoU among all 9 anchors, which also selects the scale.
    fn assign_targets(
        &self,
        ground_truth: &[Vec<LabeledBox>],
        net_size: i64,
    ) -> [Vec<Assignment>; NUM_SCALES] {
        let mut per_scale: [Vec<Assignment>; NUM_SCALES] = Default::default();

        for (image, boxes) in ground_truth.iter().enumerate() {
            for labeled in boxes {
                let w = labeled.rect.w().raw();
                let h = labeled.rect.h().raw();
                if w <= 0.0 || h <= 0.0 {
                    continue;
                }
                let w_px = w * net_size as f64;
                let h_px = h * net_size as f64;

                let (best_anchor, _) = self
                    .anchors
                    .iter()
                    .enumerate()
                    .map(|(index, &(aw, ah))| {
                        (index, r64(wh_iou(w_px, h_px, aw.raw(), ah.raw())))
                    })
                    .max_by_key(|&(_index, iou)| iou)
                    .unwrap();
                let scale = best_anchor / NUM_ANCHORS_PER_SCALE;
                let anchor = best_anchor % NUM_ANCHORS_PER_SCALE;
                let (anchor_w, anchor_h) = self.anchors[best_anchor];

                let grid = (net_size / STRIDES[scale]) as f64;
                let cx = labeled.rect.cx().raw() * grid;
                let cy = labeled.rect.cy().raw() * grid;
                let gx = (cx.floor() as i64).min(grid as i64 - 1);
                let gy = (cy.floor() as i64).min(grid as i64 - 1);

                per_scale[scale].push(Assignment {
                    image,
                    anchor,
                    gy,
                    gx,
                    tx: (cx - gx as f64) as f32,
                    ty: (cy - gy as f64) as f32,
                    tw: (w_px / anchor_w.raw()).ln() as f32,
                    th: (h_px / anchor_h.raw()).ln() as f32,
                    class: labeled.class,
                    scale_weight: (2.0 - w * h) as f32,
                });
            }
        }

        per_scale
    }

    /// Marks cells whose decoded prediction overlaps any ground truth box
    /// of its image above the ignore threshold. The result is detached
    /// from the autograd graph.
    fn ignore_mask(
        &self,
        pred_xy: &Tensor,
        pred_wh: &Tensor,
        ground_truth: &[Vec<LabeledBox>],
        scale: usize,
        grid: i64,
        device: Device,
    ) -> Tensor {
        tch::no_grad(|| {
            let num_anchors = NUM_ANCHORS_PER_SCALE as i64;
            let grid_x = Tensor::arange(grid, (Kind::Float, device)).view([1, 1, 1, grid]);
            let grid_y = Tensor::arange(grid, (Kind::Float, device)).view([1, 1, grid, 1]);

            // anchor sizes of this scale in ratio units of the net size
            let net_size = (STRIDES[scale] * grid) as f64;
            let anchor_range =
                scale * NUM_ANCHORS_PER_SCALE..(scale + 1) * NUM_ANCHORS_PER_SCALE;
            let (anchor_w, anchor_h): (Vec<f32>, Vec<f32>) = self.anchors[anchor_range]
                .iter()
                .map(|&(w, h)| ((w.raw() / net_size) as f32, (h.raw() / net_size) as f32))
                .unzip();
            let anchor_w = Tensor::of_slice(&anchor_w)
                .view([1, num_anchors, 1, 1])
                .to_device(device);
            let anchor_h = Tensor::of_slice(&anchor_h)
                .view([1, num_anchors, 1, 1])
                .to_device(device);

            let sigmoid_xy = pred_xy.sigmoid();
            let bx = (sigmoid_xy.i((.., .., .., .., 0)) + grid_x) / grid as f64;
            let by = (sigmoid_xy.i((.., .., .., .., 1)) + grid_y) / grid as f64;
            let bw = pred_wh.i((.., .., .., .., 0)).exp() * anchor_w;
            let bh = pred_wh.i((.., .., .., .., 1)).exp() * anchor_h;
            // [b, na, g, g, 4]
            let pred_boxes = Tensor::stack(&[bx, by, bw, bh], 4);

            let rows: Vec<_> = ground_truth
                .iter()
                .enumerate()
                .map(|(image, boxes)| {
                    if boxes.is_empty() {
                        return Tensor::zeros(
                            &[num_anchors, grid, grid],
                            (Kind::Float, device),
                        );
                    }

                    let gt: Vec<f32> = boxes
                        .iter()
                        .flat_map(|labeled| {
                            [
                                labeled.rect.cx().raw() as f32,
                                labeled.rect.cy().raw() as f32,
                                labeled.rect.w().raw() as f32,
                                labeled.rect.h().raw() as f32,
                            ]
                        })
                        .collect();
                    let gt = Tensor::of_slice(&gt)
                        .view([boxes.len() as i64, 4])
                        .to_device(device);

                    let pred = pred_boxes.i(image as i64).reshape(&[-1, 4]);
                    let iou = box_iou_cxcywh(&pred, &gt);
                    let max_iou = iou.amax(&[1], false);
                    max_iou
                        .gt(self.ignore_thresh.raw())
                        .to_kind(Kind::Float)
                        .view([num_anchors, grid, grid])
                })
                .collect();

            Tensor::stack(&rows, 0)
        })
    }
}
