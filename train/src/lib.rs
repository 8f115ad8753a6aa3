//! YOLOv3 training program.

pub mod common;
pub mod config;
pub mod data;
pub mod logging;
pub mod message;
pub mod train;
pub mod training_stream;
pub mod utils;

use crate::{common::*, data::TrainingData, training_stream::TrainingStream};

/// The entry of the training program.
pub async fn start(config: Arc<config::Config>) -> Result<()> {
    let start_time = Local::now();

    // load dataset
    info!("loading dataset");
    let mut rng = StdRng::from_entropy();
    let TrainingData {
        train,
        valid,
        classes,
    } = TrainingData::load(&config, &mut rng)?.ok_or_else(|| {
        format_err!("some configured labels have no annotation, revise the 'labels' list")
    })?;
    info!(
        "{} training and {} validation records over {} classes: {:?}",
        train.len(),
        valid.len(),
        classes.len(),
        classes
    );

    let train_generator = BatchGeneratorInit {
        records: train,
        classes: classes.clone(),
        batch_size: config.train.batch_size.get(),
        min_net_size: config.model.min_input_size.get(),
        max_net_size: config.model.max_input_size.get(),
        max_box_per_image: config.model.max_box_per_image.get(),
        shuffle: true,
        random_net_size: true,
    }
    .build()?;
    let valid_generator = BatchGeneratorInit {
        records: valid,
        classes: classes.clone(),
        batch_size: config.train.batch_size.get(),
        min_net_size: config.model.min_input_size.get(),
        max_net_size: config.model.max_input_size.get(),
        max_box_per_image: config.model.max_box_per_image.get(),
        shuffle: true,
        random_net_size: false,
    }
    .build()?;

    let warmup_batches = utils::warmup_schedule(
        config.train.saved_weights_name.is_file(),
        config.train.warmup_epochs,
        config.train.train_times.get(),
        train_generator.len(),
        config.valid.valid_times.get(),
        valid_generator.len(),
    );
    info!("warm up the learning rate over {} batches", warmup_batches);

    // create the logging dir and save a config copy
    let logging_dir = Arc::new(
        config
            .train
            .tensorboard_dir
            .join(format!("{}", start_time.format(utils::FILE_STRFTIME))),
    );
    tokio::fs::create_dir_all(&*logging_dir).await?;
    {
        let path = logging_dir.join("config.json");
        let text = serde_json::to_string_pretty(&*config)?;
        tokio::fs::write(&path, text).await?;
    }

    // create channels
    let (logging_tx, logging_rx) = broadcast::channel(64);
    let (data_tx, data_rx) = mpsc::channel(training_stream::CHANNEL_SIZE);

    // logging worker
    let logging_future = logging::logging_worker(logging_dir.clone(), logging_rx);

    // feeding worker
    let num_epochs = config.train.nb_epochs + config.train.warmup_epochs;
    let feeder_future = tokio::task::spawn(
        TrainingStream::new(
            train_generator.clone(),
            valid_generator.clone(),
            config.train.train_times.get(),
            config.valid.valid_times.get(),
            num_epochs,
        )
        .feed(data_tx),
    )
    .map(|result| Fallible::Ok(result??));

    // training worker
    let training_future = {
        let config = config.clone();
        let classes = classes.clone();
        let logging_tx = logging_tx.clone();

        tokio::task::spawn_blocking(move || {
            train::training_worker(config, classes, warmup_batches, data_rx, logging_tx)
        })
        .map(|result| Fallible::Ok(result??))
    };

    // the logger exits once every sender is gone
    drop(logging_tx);

    futures::try_join!(feeder_future, training_future, logging_future)?;

    // reload the best checkpoint into a fresh model and persist it
    info!("reloading the best checkpoint");
    let device = config.train.device;
    let mut inference_vs = nn::VarStore::new(device);
    let model = YoloV3Init {
        num_classes: classes.len(),
    }
    .build(&inference_vs.root() / "model")?;
    if config.train.saved_weights_name.is_file() {
        inference_vs.load_partial(&config.train.saved_weights_name)?;
    } else {
        warn!("no checkpoint was saved during training, evaluating the random initialization");
    }
    inference_vs.save(&config.train.saved_weights_name)?;

    // evaluate
    info!("evaluating on the validation set");
    let average_precisions = {
        let evaluator = MapEvaluatorInit::new(config.anchor_pairs()).build()?;
        tokio::task::spawn_blocking(move || evaluator.evaluate(&model, &valid_generator))
            .await??
    };

    for (&class, ap) in &average_precisions {
        let name = classes
            .get_index(class)
            .map(String::as_str)
            .unwrap_or("<unknown>");
        info!("{:<20} AP {:.4}", name, ap.raw());
    }
    info!(
        "mAP: {:.4}",
        eval::mean_average_precision(&average_precisions).raw()
    );

    Ok(())
}
