use std::path::Path;

use async_compression::tokio::bufread::GzipDecoder;
use csv_async::{AsyncReaderBuilder, Trim};
use futures::StreamExt;
use itertools::Itertools;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{RowMapper, Window};
use crate::error::ReadError;

pub(super) async fn produce(
    path: &Path,
    delimiter: u8,
    gzip: bool,
    skip_rows: usize,
    window_rows: usize,
    tx: &mpsc::Sender<Window>,
) -> Result<(), ReadError> {
    let file = tokio::fs::File::open(path).await?;
    let source: Box<dyn AsyncRead + Unpin + Send> = if gzip {
        Box::new(GzipDecoder::new(tokio::io::BufReader::new(file)))
    } else {
        Box::new(file)
    };

    let mut reader = AsyncReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(Trim::All)
        .create_reader(source);

    let headers = match reader.headers().await {
        Ok(headers) => headers.clone(),
        Err(e) => return Err(ReadError::parse(path, e)),
    };
    if headers.is_empty() {
        return Ok(());
    }
    let mapper = RowMapper::new(&headers);

    let mut stream = reader.records().skip(skip_rows).chunks(window_rows);
    while let Some(batch) = stream.next().await {
        let records = batch
            .into_iter()
            .filter_map(|row| match row {
                Ok(row) => mapper.map(&row),
                Err(e) => {
                    warn!(?path, error = %e, "Ignoring row that failed to parse");
                    None
                }
            })
            .collect_vec();

        if tx.send(Ok(records)).await.is_err() {
            debug!(?path, "Reader dropped, stopping");
            return Ok(());
        }
    }

    Ok(())
}
