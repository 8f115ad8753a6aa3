//! The training worker.

use crate::{
    common::*,
    config::Config,
    message::{LoggingMessage, TrainingMessage},
    utils::{self, EarlyStopping, LrScheduler, RateCounter},
};

/// Runs the fit loop on a blocking thread, draining batches from the
/// feeding task until the epochs run out or early stopping fires.
pub fn training_worker(
    config: Arc<Config>,
    classes: Arc<IndexSet<String>>,
    warmup_batches: usize,
    mut data_rx: mpsc::Receiver<TrainingMessage>,
    logging_tx: broadcast::Sender<LoggingMessage>,
) -> Result<()> {
    let device = config.train.device;
    info!("use device {:?}", device);

    // init model and loss
    const DUMMY_LR: f64 = 1.0;

    let mut vs = nn::VarStore::new(device);
    let root = vs.root();
    let model = YoloV3Init {
        num_classes: classes.len(),
    }
    .build(&root / "model")?;
    let yolo_loss = YoloLossInit {
        num_classes: classes.len(),
        anchors: config.anchor_pairs(),
        ignore_thresh: config.train.ignore_thresh,
    }
    .build()?;
    let mut optimizer = nn::Adam {
        beta1: 0.9,
        beta2: 0.999,
        wd: 0.0,
    }
    .build(&vs, DUMMY_LR)?;

    utils::load_initial_weights(&mut vs, &config.train.saved_weights_name)?;

    let mut lr_scheduler = LrScheduler::new(config.train.learning_rate.raw(), warmup_batches)?;
    optimizer.set_lr(lr_scheduler.lr());

    // training
    info!("start training");
    let mut early_stopping = EarlyStopping::default();
    let mut best_val_loss = f64::INFINITY;
    let mut rate_counter = RateCounter::with_second_interval();
    let runtime = tokio::runtime::Builder::new_current_thread().build()?;

    let mut training_step = 0;
    let mut val_loss_sum = 0.0;
    let mut val_batch_count = 0usize;

    while let Some(message) = runtime.block_on(data_rx.recv()) {
        match message {
            TrainingMessage::Train { epoch, batch } => {
                let Batch {
                    images,
                    bboxes,
                    net_size,
                } = batch;
                let images = images.to_device(device);

                // forward-backward pass
                let output = model.forward_t(&images, true)?;
                let losses = yolo_loss.forward(&output, &bboxes, net_size)?;
                optimizer.backward_step(&losses.total_loss);

                let total_loss = f64::from(&losses.total_loss);
                if config.train.debug {
                    info!(
                        "epoch: {}\tstep: {}\tloss: {:.5}\tcoord: {:.5}\tobj: {:.5}\tclass: {:.5}",
                        epoch,
                        training_step,
                        total_loss,
                        f64::from(&losses.coord_loss),
                        f64::from(&losses.objectness_loss),
                        f64::from(&losses.classification_loss),
                    );
                }

                // send to logger
                for (tag, value) in [
                    ("train/total_loss", total_loss),
                    ("train/coord_loss", f64::from(&losses.coord_loss)),
                    ("train/objectness_loss", f64::from(&losses.objectness_loss)),
                    (
                        "train/classification_loss",
                        f64::from(&losses.classification_loss),
                    ),
                    ("params/learning_rate", lr_scheduler.lr()),
                ] {
                    logging_tx
                        .send(LoggingMessage::new_scalar(tag, training_step, value))
                        .map_err(|_err| format_err!("cannot send message to logger"))?;
                }

                // update lr
                optimizer.set_lr(lr_scheduler.next());
                training_step += 1;

                rate_counter.add(config.train.batch_size.get());
                if let Some((batch_rate, record_rate)) = rate_counter.rates() {
                    info!(
                        "epoch: {}\tstep: {}\tlr: {:.7}\t{:.2} batches/s\t{:.2} records/s",
                        epoch,
                        training_step,
                        lr_scheduler.lr(),
                        batch_rate,
                        record_rate
                    );
                }
            }
            TrainingMessage::Validate { epoch: _, batch } => {
                let Batch {
                    images,
                    bboxes,
                    net_size,
                } = batch;
                let images = images.to_device(device);

                let losses = tch::no_grad(|| -> Result<_> {
                    let output = model.forward_t(&images, false)?;
                    yolo_loss.forward(&output, &bboxes, net_size)
                })?;

                val_loss_sum += f64::from(&losses.total_loss);
                val_batch_count += 1;
            }
            TrainingMessage::EpochEnd { epoch } => {
                ensure!(val_batch_count > 0, "no validation batches in epoch {}", epoch);
                let val_loss = val_loss_sum / val_batch_count as f64;
                val_loss_sum = 0.0;
                val_batch_count = 0;

                info!("epoch: {}\tvalidation loss: {:.5}", epoch, val_loss);
                logging_tx
                    .send(LoggingMessage::new_scalar("valid/loss", epoch, val_loss))
                    .map_err(|_err| format_err!("cannot send message to logger"))?;

                if val_loss < best_val_loss {
                    best_val_loss = val_loss;
                    utils::save_checkpoint(&vs, &config.train.saved_weights_name, val_loss)?;
                }

                if early_stopping.update(val_loss) {
                    info!("validation loss stopped improving, stopping early");
                    break;
                }
            }
        }
    }

    info!(
        "training finished after {} steps, best validation loss {:.5}",
        training_step, best_val_loss
    );
    Ok(())
}
