use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use tollgate_http::{parse_chunk_len, BodyMode, CodecError, CodecLimits, WireReader};

/// Stream a message body from `source` to `sink` in lockstep, so a slow
/// reader on either side throttles the other. Nothing is buffered beyond
/// the reader's pull-ahead.
pub(crate) async fn relay_body<R, W>(
    source: &mut WireReader<R>,
    sink: &mut W,
    mode: BodyMode,
    limits: &CodecLimits,
) -> Result<u64, CodecError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match mode {
        BodyMode::None => {
            // The caller wrote the head into the sink; a bodyless message
            // still has to reach the wire before the next read blocks.
            sink.flush().await.map_err(CodecError::Io)?;
            Ok(0)
        }
        BodyMode::ContentLength(length) => relay_exact(source, sink, length).await,
        BodyMode::Chunked => relay_chunked(source, sink, limits).await,
        BodyMode::CloseDelimited => relay_until_eof(source, sink).await,
    }
}

async fn relay_exact<R, W>(
    source: &mut WireReader<R>,
    sink: &mut W,
    length: u64,
) -> Result<u64, CodecError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = length;
    while remaining > 0 {
        if source.buffered().is_empty() {
            let read = source.read_some().await?;
            if read == 0 {
                return Err(CodecError::UnexpectedEof(
                    "stream closed mid-body".to_string(),
                ));
            }
        }
        let chunk = source.split_buffered(remaining as usize);
        sink.write_all(&chunk).await.map_err(CodecError::Io)?;
        remaining -= chunk.len() as u64;
    }
    sink.flush().await.map_err(CodecError::Io)?;
    Ok(length)
}

async fn relay_chunked<R, W>(
    source: &mut WireReader<R>,
    sink: &mut W,
    limits: &CodecLimits,
) -> Result<u64, CodecError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0_u64;
    loop {
        let size_line = source
            .read_until(b"\r\n", limits.max_line_bytes)
            .await?
            .ok_or_else(|| {
                CodecError::UnexpectedEof("stream closed inside chunked body".to_string())
            })?;
        let chunk_len = parse_chunk_len(&size_line)?;
        sink.write_all(&size_line).await.map_err(CodecError::Io)?;

        if chunk_len == 0 {
            // Trailer block line by line through the terminal blank line.
            loop {
                let line = source
                    .read_until(b"\r\n", limits.max_line_bytes)
                    .await?
                    .ok_or_else(|| {
                        CodecError::UnexpectedEof(
                            "stream closed inside chunked trailers".to_string(),
                        )
                    })?;
                sink.write_all(&line).await.map_err(CodecError::Io)?;
                if line == b"\r\n" {
                    break;
                }
            }
            sink.flush().await.map_err(CodecError::Io)?;
            return Ok(total);
        }

        total += relay_exact(source, sink, chunk_len).await?;
        let terminator = source.read_exact(2).await?;
        if terminator != b"\r\n" {
            return Err(CodecError::MalformedRequest(
                "invalid chunk terminator".to_string(),
            ));
        }
        sink.write_all(&terminator).await.map_err(CodecError::Io)?;
    }
}

async fn relay_until_eof<R, W>(
    source: &mut WireReader<R>,
    sink: &mut W,
) -> Result<u64, CodecError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0_u64;
    loop {
        let buffered = source.take_buffered();
        if !buffered.is_empty() {
            sink.write_all(&buffered).await.map_err(CodecError::Io)?;
            total += buffered.len() as u64;
        }
        if source.read_some().await? == 0 {
            break;
        }
    }
    sink.flush().await.map_err(CodecError::Io)?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use tollgate_http::{BodyMode, CodecLimits, WireReader};

    use super::relay_body;

    #[tokio::test]
    async fn relays_exact_length_and_leaves_the_rest() {
        let input: &[u8] = b"hello worldTRAILING";
        let mut source = WireReader::new(input);
        let mut sink = Vec::new();
        let relayed = relay_body(
            &mut source,
            &mut sink,
            BodyMode::ContentLength(11),
            &CodecLimits::default(),
        )
        .await
        .expect("relay");
        assert_eq!(relayed, 11);
        assert_eq!(sink, b"hello world");
        assert_eq!(source.buffered(), b"TRAILING");
    }

    #[tokio::test]
    async fn relays_chunked_framing_verbatim() {
        let input: &[u8] = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Sum: ok\r\n\r\nNEXT";
        let mut source = WireReader::new(input);
        let mut sink = Vec::new();
        let relayed = relay_body(
            &mut source,
            &mut sink,
            BodyMode::Chunked,
            &CodecLimits::default(),
        )
        .await
        .expect("relay");
        assert_eq!(relayed, 9);
        assert_eq!(sink, b"4\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Sum: ok\r\n\r\n");
        assert_eq!(source.buffered(), b"NEXT");
    }

    #[tokio::test]
    async fn relays_close_delimited_to_eof() {
        let input: &[u8] = b"stream until the end";
        let mut source = WireReader::new(input);
        let mut sink = Vec::new();
        let relayed = relay_body(
            &mut source,
            &mut sink,
            BodyMode::CloseDelimited,
            &CodecLimits::default(),
        )
        .await
        .expect("relay");
        assert_eq!(relayed, input.len() as u64);
        assert_eq!(sink, input);
    }
}
