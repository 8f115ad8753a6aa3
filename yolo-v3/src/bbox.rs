//! Bounding box types in ratio units.

use crate::common::*;

/// Bounding box in TLBR format, in ratio units of the image size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RatioRect {
    t: R64,
    l: R64,
    b: R64,
    r: R64,
}

impl RatioRect {
    pub fn try_new(t: R64, l: R64, b: R64, r: R64) -> Result<Self> {
        ensure!(
            (0.0..=1.0).contains(&t.raw())
                && (0.0..=1.0).contains(&l.raw())
                && (0.0..=1.0).contains(&b.raw())
                && (0.0..=1.0).contains(&r.raw()),
            "box coordinates must be in range [0, 1], get tlbr = ({}, {}, {}, {})",
            t,
            l,
            b,
            r
        );
        ensure!(
            t <= b && l <= r,
            "invalid box extents, get tlbr = ({}, {}, {}, {})",
            t,
            l,
            b,
            r
        );
        Ok(Self { t, l, b, r })
    }

    /// Converts a pixel-unit TLBR box to ratio units, clamping to the image boundary.
    pub fn from_pixel_tlbr(t: f64, l: f64, b: f64, r: f64, height: f64, width: f64) -> Result<Self> {
        ensure!(height > 0.0 && width > 0.0, "invalid image size {}x{}", height, width);
        let clamp = |val: f64, max: f64| val.max(0.0).min(max);
        Self::try_new(
            r64(clamp(t, height) / height),
            r64(clamp(l, width) / width),
            r64(clamp(b, height) / height),
            r64(clamp(r, width) / width),
        )
    }

    pub fn t(&self) -> R64 {
        self.t
    }

    pub fn l(&self) -> R64 {
        self.l
    }

    pub fn b(&self) -> R64 {
        self.b
    }

    pub fn r(&self) -> R64 {
        self.r
    }

    pub fn h(&self) -> R64 {
        self.b - self.t
    }

    pub fn w(&self) -> R64 {
        self.r - self.l
    }

    pub fn cy(&self) -> R64 {
        self.t + self.h() / 2.0
    }

    pub fn cx(&self) -> R64 {
        self.l + self.w() / 2.0
    }

    pub fn area(&self) -> R64 {
        self.h() * self.w()
    }

    pub fn intersection_area(&self, other: &Self) -> R64 {
        let t = self.t.max(other.t);
        let l = self.l.max(other.l);
        let b = self.b.min(other.b);
        let r = self.r.min(other.r);
        (b - t).max(r64(0.0)) * (r - l).max(r64(0.0))
    }

    pub fn iou(&self, other: &Self) -> R64 {
        let inter = self.intersection_area(other);
        let union = self.area() + other.area() - inter;
        if union == 0.0 {
            r64(0.0)
        } else {
            inter / union
        }
    }
}

/// A ground truth box paired with its class index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LabeledBox {
    pub rect: RatioRect,
    pub class: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::abs_diff_eq;

    #[test]
    fn rect_validation() {
        assert!(RatioRect::try_new(r64(0.0), r64(0.0), r64(1.0), r64(1.0)).is_ok());
        assert!(RatioRect::try_new(r64(0.5), r64(0.5), r64(0.2), r64(0.8)).is_err());
        assert!(RatioRect::try_new(r64(0.0), r64(0.0), r64(1.5), r64(1.0)).is_err());
    }

    #[test]
    fn pixel_to_ratio_clamps_to_image() -> Result<()> {
        let rect = RatioRect::from_pixel_tlbr(-10.0, 0.0, 50.0, 250.0, 100.0, 200.0)?;
        assert_eq!(rect.t(), r64(0.0));
        assert_eq!(rect.b(), r64(0.5));
        assert_eq!(rect.r(), r64(1.0));
        Ok(())
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() -> Result<()> {
        let lhs = RatioRect::try_new(r64(0.0), r64(0.0), r64(0.2), r64(0.2))?;
        let rhs = RatioRect::try_new(r64(0.5), r64(0.5), r64(0.9), r64(0.9))?;
        assert_eq!(lhs.iou(&rhs), r64(0.0));
        Ok(())
    }

    #[test]
    fn iou_of_identical_boxes_is_one() -> Result<()> {
        let rect = RatioRect::try_new(r64(0.1), r64(0.2), r64(0.6), r64(0.8))?;
        assert_eq!(rect.iou(&rect), r64(1.0));
        Ok(())
    }

    #[test]
    fn iou_of_half_overlapping_boxes() -> Result<()> {
        let lhs = RatioRect::try_new(r64(0.0), r64(0.0), r64(0.4), r64(0.4))?;
        let rhs = RatioRect::try_new(r64(0.0), r64(0.2), r64(0.4), r64(0.6))?;
        // intersection 0.4 * 0.2, union 2 * 0.16 - 0.08
        assert!(abs_diff_eq!(lhs.iou(&rhs).raw(), 1.0 / 3.0, epsilon = 1e-9));
        Ok(())
    }
}
