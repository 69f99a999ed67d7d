// Chunked JSON streaming utilities
use crate::domain::sweep::SweepRecord;
use crate::infrastructure::http_response::brotli_compress;
use crate::infrastructure::plot_feed::PlotFeed;
use axum::body::Body;
use axum::http::{Response, StatusCode, header};
use axum::response::IntoResponse;
use bytes::{BufMut, Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::Stream;
use serde::Serialize;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

/// Create a chunked streaming response, one length-prefixed JSON message per chunk
pub fn chunked_json_stream<S, T>(stream: S, compress: bool) -> Result<Response<Body>, StatusCode>
where
    S: Stream<Item = T> + Send + 'static,
    T: Serialize + Send + Sync + 'static,
{
    let byte_stream = stream.then(move |msg| async move { serialize_chunk(&msg, compress).await });

    let body = Body::from_stream(byte_stream);

    // Chunks are compressed individually, so no Content-Encoding header: the
    // HTTP stream itself is not Brotli.
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson-chunked")
        .header(header::TRANSFER_ENCODING, "chunked")
        .body(body)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Serialize a single message to a chunk: 4-byte big-endian length, then payload
pub async fn serialize_chunk<T: Serialize>(msg: &T, compress: bool) -> Result<Bytes, std::io::Error> {
    let json = serde_json::to_vec(msg).map_err(std::io::Error::other)?;

    let payload = if compress {
        brotli_compress(&json).await?
    } else {
        json
    };

    let length = payload.len() as u32;
    let mut chunk = BytesMut::with_capacity(4 + payload.len());
    chunk.put_u32(length);
    chunk.put_slice(&payload);

    Ok(chunk.freeze())
}

/// Stream the feed's records so far, then each new record as it lands
pub async fn stream_from_feed(feed: PlotFeed, compress: bool) -> impl IntoResponse {
    let (history, live) = feed.subscribe().await;
    let mut live = BroadcastStream::new(live);

    let stream = async_stream::stream! {
        for record in history {
            yield record;
        }
        while let Some(next) = live.next().await {
            match next {
                Ok(record) => {
                    yield record;
                }
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    tracing::warn!("Plot stream viewer lagged, {} records skipped", missed);
                }
            }
        }
    };

    match chunked_json_stream::<_, SweepRecord>(stream, compress) {
        Ok(response) => response,
        Err(status) => status.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_chunk_is_length_prefixed() {
        let chunk = serialize_chunk(&serde_json::json!({"setpoint": 20.5}), false)
            .await
            .unwrap();

        let payload = br#"{"setpoint":20.5}"#;
        assert_eq!(&chunk[..4], &(payload.len() as u32).to_be_bytes());
        assert_eq!(&chunk[4..], payload);
    }

    #[tokio::test]
    async fn test_compressed_chunk_length_matches_payload() {
        let chunk = serialize_chunk(&vec![0.5_f64; 64], true).await.unwrap();
        let length = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as usize;
        assert_eq!(length, chunk.len() - 4);
    }
}
