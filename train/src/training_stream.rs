//! The batch feeding task.

use crate::{common::*, message::TrainingMessage};

/// The number of parallel batch loading workers.
pub const NUM_WORKERS: usize = 3;
/// The capacity of the batch channel to the training worker.
pub const CHANNEL_SIZE: usize = 8;

#[derive(Debug, Clone)]
struct LoadJob {
    is_train: bool,
    indexes: Vec<usize>,
    net_size: i64,
}

/// Produces the training and validation batches of every epoch and feeds
/// them through a bounded channel.
#[derive(Debug, Clone)]
pub struct TrainingStream {
    train: BatchGenerator,
    valid: BatchGenerator,
    train_times: usize,
    valid_times: usize,
    num_epochs: usize,
}

impl TrainingStream {
    pub fn new(
        train: BatchGenerator,
        valid: BatchGenerator,
        train_times: usize,
        valid_times: usize,
        num_epochs: usize,
    ) -> Self {
        Self {
            train,
            valid,
            train_times,
            valid_times,
            num_epochs,
        }
    }

    /// Streams every batch of every epoch into the channel. Image loading
    /// runs on blocking threads, several batches ahead of the consumer.
    ///
    /// A dropped receiver stops the feeder without error; the training
    /// worker drops its end when early stopping fires.
    pub async fn feed(self, tx: mpsc::Sender<TrainingMessage>) -> Result<()> {
        let mut rng = StdRng::from_entropy();

        'epochs: for epoch in 0..self.num_epochs {
            let jobs = self.epoch_jobs(&mut rng);

            let train = self.train.clone();
            let valid = self.valid.clone();
            let mut batches =
                stream::iter(jobs.into_iter().map(Fallible::Ok)).try_par_then(
                    NUM_WORKERS,
                    move |job| {
                        let generator = if job.is_train {
                            train.clone()
                        } else {
                            valid.clone()
                        };

                        async move {
                            let LoadJob {
                                is_train,
                                indexes,
                                net_size,
                            } = job;
                            let batch = tokio::task::spawn_blocking(move || {
                                generator.load_batch(&indexes, net_size)
                            })
                            .await??;
                            Fallible::Ok((is_train, batch))
                        }
                    },
                );

            while let Some(result) = batches.next().await {
                let (is_train, batch) = result?;
                let message = if is_train {
                    TrainingMessage::Train { epoch, batch }
                } else {
                    TrainingMessage::Validate { epoch, batch }
                };
                if tx.send(message).await.is_err() {
                    break 'epochs;
                }
            }

            if tx.send(TrainingMessage::EpochEnd { epoch }).await.is_err() {
                break;
            }
        }

        Ok(())
    }

    /// Plans one epoch: `train_times` shuffled passes over the training
    /// set followed by `valid_times` passes over the validation set.
    fn epoch_jobs(&self, rng: &mut impl Rng) -> Vec<LoadJob> {
        let mut jobs = vec![];

        for _ in 0..self.train_times {
            let plan = self.train.epoch_plan(rng);
            let net_sizes = self.train.net_size_plan(plan.len(), rng);
            jobs.extend(
                izip!(plan, net_sizes).map(|(indexes, net_size)| LoadJob {
                    is_train: true,
                    indexes,
                    net_size,
                }),
            );
        }

        for _ in 0..self.valid_times {
            let plan = self.valid.epoch_plan(rng);
            let net_sizes = self.valid.net_size_plan(plan.len(), rng);
            jobs.extend(
                izip!(plan, net_sizes).map(|(indexes, net_size)| LoadJob {
                    is_train: false,
                    indexes,
                    net_size,
                }),
            );
        }

        jobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yolo_v3::bbox::RatioRect;
    use yolo_v3::dataset::NamedBox;

    fn generator(count: usize, batch_size: usize, random_net_size: bool) -> BatchGenerator {
        let records = (0..count)
            .map(|index| {
                Arc::new(ImageAnnotation {
                    path: PathBuf::from(format!("{:06}.jpg", index)),
                    height: 416,
                    width: 416,
                    objects: vec![NamedBox {
                        name: "cat".into(),
                        rect: RatioRect::try_new(r64(0.1), r64(0.1), r64(0.5), r64(0.5))
                            .unwrap(),
                    }],
                })
            })
            .collect();

        BatchGeneratorInit {
            records,
            classes: Arc::new(std::iter::once("cat".to_owned()).collect()),
            batch_size,
            min_net_size: 288,
            max_net_size: 448,
            max_box_per_image: 30,
            shuffle: true,
            random_net_size,
        }
        .build()
        .unwrap()
    }

    #[test]
    fn epoch_jobs_cover_both_sets_in_order() {
        let stream = TrainingStream::new(generator(10, 4, true), generator(4, 4, false), 2, 1, 1);
        let mut rng = StdRng::seed_from_u64(42);
        let jobs = stream.epoch_jobs(&mut rng);

        // 2 passes of 3 training batches, then 1 validation batch
        assert_eq!(jobs.len(), 7);
        assert!(jobs[..6].iter().all(|job| job.is_train));
        assert!(!jobs[6].is_train);
        assert_eq!(jobs[6].net_size, 448);
    }
}
