use super::ImageAnnotation;
use crate::{bbox::LabeledBox, common::*};

/// Ratio between the network input size and the coarsest output grid.
pub const DOWNSAMPLE: i64 = 32;

/// Number of batches between two network input size draws.
const NET_SIZE_REDRAW_PERIOD: usize = 10;

#[derive(Debug, Clone)]
pub struct BatchGeneratorInit {
    pub records: Vec<Arc<ImageAnnotation>>,
    pub classes: Arc<IndexSet<String>>,
    pub batch_size: usize,
    pub min_net_size: usize,
    pub max_net_size: usize,
    pub max_box_per_image: usize,
    /// Reshuffle the record order on every pass.
    pub shuffle: bool,
    /// Redraw the network input size periodically. When disabled, every
    /// batch uses the fixed size derived from `max_net_size`.
    pub random_net_size: bool,
}

impl BatchGeneratorInit {
    pub fn build(self) -> Result<BatchGenerator> {
        let Self {
            records,
            classes,
            batch_size,
            min_net_size,
            max_net_size,
            max_box_per_image,
            shuffle,
            random_net_size,
        } = self;

        ensure!(!records.is_empty(), "the record list must be non-empty");
        ensure!(batch_size > 0, "batch_size must be positive");
        ensure!(max_box_per_image > 0, "max_box_per_image must be positive");
        ensure!(
            min_net_size as i64 >= DOWNSAMPLE && min_net_size <= max_net_size,
            "invalid network input size bounds [{}, {}]",
            min_net_size,
            max_net_size
        );

        Ok(BatchGenerator {
            records: Arc::new(records),
            classes,
            batch_size,
            min_net_size: min_net_size as i64,
            max_net_size: max_net_size as i64,
            max_box_per_image,
            shuffle,
            random_net_size,
        })
    }
}

/// Prepares image/ground-truth batches from a list of annotated images.
#[derive(Debug, Clone)]
pub struct BatchGenerator {
    records: Arc<Vec<Arc<ImageAnnotation>>>,
    classes: Arc<IndexSet<String>>,
    batch_size: usize,
    min_net_size: i64,
    max_net_size: i64,
    max_box_per_image: usize,
    shuffle: bool,
    random_net_size: bool,
}

/// A batch of images with their ground truth boxes.
#[derive(Debug)]
pub struct Batch {
    /// Image pixels in `[batch, 3, size, size]` shape, scaled to `[0, 1]`.
    pub images: Tensor,
    /// Per-image ground truth.
    pub bboxes: Vec<Vec<LabeledBox>>,
    /// The network input size the images were resized to.
    pub net_size: i64,
}

impl BatchGenerator {
    /// The number of batches per pass over the records.
    pub fn len(&self) -> usize {
        (self.num_records() + self.batch_size - 1) / self.batch_size
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn num_records(&self) -> usize {
        self.records.len()
    }

    pub fn records(&self) -> &[Arc<ImageAnnotation>] {
        &self.records
    }

    pub fn classes(&self) -> &IndexSet<String> {
        &self.classes
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Batches of record indexes for one pass, covering every record once.
    pub fn epoch_plan(&self, rng: &mut impl Rng) -> Vec<Vec<usize>> {
        let mut indexes: Vec<_> = (0..self.num_records()).collect();
        if self.shuffle {
            indexes.shuffle(rng);
        }
        indexes
            .chunks(self.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    /// The network input size per batch of one pass. The size is redrawn
    /// every few batches when `random_net_size` is set.
    pub fn net_size_plan(&self, num_batches: usize, rng: &mut impl Rng) -> Vec<i64> {
        if !self.random_net_size {
            return vec![self.fixed_net_size(); num_batches];
        }

        let mut current = self.fixed_net_size();
        (0..num_batches)
            .map(|batch_index| {
                if batch_index % NET_SIZE_REDRAW_PERIOD == 0 {
                    current = self.draw_net_size(rng);
                }
                current
            })
            .collect()
    }

    /// The largest valid input size, a multiple of the downsample ratio.
    pub fn fixed_net_size(&self) -> i64 {
        self.max_net_size / DOWNSAMPLE * DOWNSAMPLE
    }

    fn draw_net_size(&self, rng: &mut impl Rng) -> i64 {
        let min_grid = (self.min_net_size + DOWNSAMPLE - 1) / DOWNSAMPLE;
        let max_grid = self.max_net_size / DOWNSAMPLE;
        rng.gen_range(min_grid..=max_grid) * DOWNSAMPLE
    }

    /// Loads and resizes the images of one batch and binds ground truth
    /// class names to class indexes. Boxes with names outside the class set
    /// are dropped; at most `max_box_per_image` boxes are kept per image,
    /// preferring larger ones.
    pub fn load_batch(&self, indexes: &[usize], net_size: i64) -> Result<Batch> {
        ensure!(!indexes.is_empty(), "the batch must be non-empty");

        let pairs: Vec<_> = indexes
            .iter()
            .map(|&index| -> Result<_> {
                let record = &self.records[index];
                let image = vision::image::load(&record.path)
                    .with_context(|| format!("failed to load image {}", record.path.display()))?;
                let image = vision::image::resize(&image, net_size, net_size)?
                    .to_kind(Kind::Float)
                    / 255.0;

                Ok((image, self.bind_boxes(record)))
            })
            .try_collect()?;
        let (image_vec, bboxes): (Vec<_>, Vec<_>) = pairs.into_iter().unzip();

        Ok(Batch {
            images: Tensor::stack(&image_vec, 0),
            bboxes,
            net_size,
        })
    }

    /// Binds ground truth class names to class indexes and caps the box
    /// count. Boxes with names outside the class set are dropped.
    fn bind_boxes(&self, record: &ImageAnnotation) -> Vec<LabeledBox> {
        let mut boxes: Vec<_> = record
            .objects
            .iter()
            .filter_map(|object| {
                let class = self.classes.get_index_of(&object.name)?;
                Some(LabeledBox {
                    rect: object.rect,
                    class,
                })
            })
            .collect();

        if boxes.len() > self.max_box_per_image {
            warn!(
                "{} carries {} boxes, keeping the {} largest",
                record.path.display(),
                boxes.len(),
                self.max_box_per_image
            );
            boxes.sort_by_key(|labeled| -labeled.rect.area());
            boxes.truncate(self.max_box_per_image);
        }

        boxes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bbox::RatioRect, dataset::NamedBox};

    fn dummy_records(count: usize) -> Vec<Arc<ImageAnnotation>> {
        (0..count)
            .map(|index| {
                Arc::new(ImageAnnotation {
                    path: PathBuf::from(format!("{:06}.jpg", index)),
                    height: 416,
                    width: 416,
                    objects: vec![NamedBox {
                        name: "cat".into(),
                        rect: RatioRect::try_new(r64(0.1), r64(0.1), r64(0.5), r64(0.5)).unwrap(),
                    }],
                })
            })
            .collect()
    }

    fn generator(count: usize, batch_size: usize) -> BatchGenerator {
        BatchGeneratorInit {
            records: dummy_records(count),
            classes: Arc::new(iter::once("cat".to_owned()).collect()),
            batch_size,
            min_net_size: 288,
            max_net_size: 448,
            max_box_per_image: 30,
            shuffle: true,
            random_net_size: true,
        }
        .build()
        .unwrap()
    }

    #[test]
    fn len_rounds_up() {
        assert_eq!(generator(10, 4).len(), 3);
        assert_eq!(generator(8, 4).len(), 2);
        assert_eq!(generator(3, 4).len(), 1);
    }

    #[test]
    fn built_generator_is_never_empty() {
        assert!(!generator(1, 4).is_empty());
    }

    #[test]
    fn bind_boxes_caps_at_max_box_per_image_preferring_larger() {
        let rect = |size: f64| {
            RatioRect::try_new(r64(0.0), r64(0.0), r64(size), r64(size)).unwrap()
        };
        let record = ImageAnnotation {
            path: PathBuf::from("000000.jpg"),
            height: 416,
            width: 416,
            objects: vec![
                NamedBox {
                    name: "cat".into(),
                    rect: rect(0.2),
                },
                NamedBox {
                    name: "cat".into(),
                    rect: rect(0.8),
                },
                NamedBox {
                    name: "cat".into(),
                    rect: rect(0.5),
                },
                // not in the class set, always dropped
                NamedBox {
                    name: "horse".into(),
                    rect: rect(0.9),
                },
            ],
        };

        let generator = BatchGeneratorInit {
            records: dummy_records(1),
            classes: Arc::new(iter::once("cat".to_owned()).collect()),
            batch_size: 1,
            min_net_size: 288,
            max_net_size: 448,
            max_box_per_image: 2,
            shuffle: false,
            random_net_size: false,
        }
        .build()
        .unwrap();

        let boxes = generator.bind_boxes(&record);
        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0].rect.w(), r64(0.8));
        assert_eq!(boxes[1].rect.w(), r64(0.5));
        assert!(boxes.iter().all(|labeled| labeled.class == 0));
    }

    #[test]
    fn epoch_plan_covers_every_record_once() {
        let generator = generator(23, 4);
        let mut rng = StdRng::seed_from_u64(42);
        let plan = generator.epoch_plan(&mut rng);
        assert_eq!(plan.len(), generator.len());

        let mut indexes: Vec<_> = plan.into_iter().flatten().collect();
        indexes.sort_unstable();
        assert_eq!(indexes, (0..23).collect::<Vec<_>>());
    }

    #[test]
    fn net_sizes_are_multiples_of_downsample_within_bounds() {
        let generator = generator(100, 4);
        let mut rng = StdRng::seed_from_u64(42);
        let sizes = generator.net_size_plan(25, &mut rng);
        assert_eq!(sizes.len(), 25);
        for size in sizes {
            assert_eq!(size % DOWNSAMPLE, 0);
            assert!((288..=448).contains(&size));
        }
    }

    #[test]
    fn fixed_net_size_rounds_down() {
        let generator = BatchGeneratorInit {
            records: dummy_records(1),
            classes: Arc::new(iter::once("cat".to_owned()).collect()),
            batch_size: 1,
            min_net_size: 288,
            max_net_size: 450,
            max_box_per_image: 30,
            shuffle: false,
            random_net_size: false,
        }
        .build()
        .unwrap();
        assert_eq!(generator.fixed_net_size(), 448);
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(generator.net_size_plan(3, &mut rng), vec![448; 3]);
    }
}
