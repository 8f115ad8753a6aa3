//! TensorBoard scalar logging worker.

use crate::{common::*, message::LoggingMessage, utils::RateCounter};
use async_std::{fs::File, io::BufWriter};

/// The scalar logging worker.
#[derive(Debug)]
pub struct LoggingWorker {
    event_writer: EventWriter<BufWriter<File>>,
    rate_counter: RateCounter,
    rx: broadcast::Receiver<LoggingMessage>,
}

impl LoggingWorker {
    async fn new(
        logging_dir: Arc<PathBuf>,
        rx: broadcast::Receiver<LoggingMessage>,
    ) -> Result<Self> {
        let event_dir = logging_dir.join("events");
        let event_path_prefix = event_dir
            .join("yolo-v3")
            .into_os_string()
            .into_string()
            .map_err(|_| format_err!("the logging directory must be valid UTF-8"))?;

        tokio::fs::create_dir_all(&event_dir).await?;

        let event_writer = EventWriterInit::default()
            .from_prefix_async(event_path_prefix, None)
            .await?;
        let rate_counter = RateCounter::with_second_interval();

        Ok(Self {
            event_writer,
            rate_counter,
            rx,
        })
    }

    /// Drains the broadcast channel and writes scalar events until every
    /// sender is dropped.
    async fn start(mut self) -> Result<()> {
        loop {
            let LoggingMessage { tag, step, value } = match self.rx.recv().await {
                Ok(msg) => msg,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };

            self.event_writer
                .write_scalar_async(tag.into_owned(), step as i64, value as f32)
                .await?;

            self.rate_counter.add(1);
            if let Some((rate, _)) = self.rate_counter.rates() {
                info!("logged {:.2} events/s", rate);
            }
        }

        Ok(())
    }
}

pub async fn logging_worker(
    logging_dir: Arc<PathBuf>,
    rx: broadcast::Receiver<LoggingMessage>,
) -> Result<()> {
    LoggingWorker::new(logging_dir, rx).await?.start().await
}
