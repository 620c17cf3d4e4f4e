//! Length-prefixed framing shared by the relay and overlay transports.
//!
//! Wire format: [4-byte LE length][payload bytes]

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, data: &[u8]) -> Result<()> {
    anyhow::ensure!(
        data.len() <= MAX_FRAME_SIZE,
        "frame too large: {} bytes",
        data.len()
    );
    let len = (data.len() as u32).to_le_bytes();
    writer.write_all(&len).await.context("write length")?;
    writer.write_all(data).await.context("write payload")?;
    writer.flush().await.context("flush")?;
    Ok(())
}

pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .context("read length")?;
    let len = u32::from_le_bytes(len_buf) as usize;
    anyhow::ensure!(len <= MAX_FRAME_SIZE, "frame too large: {len} bytes");

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await.context("read payload")?;
    Ok(data)
}

/// Write a value as a single JSON frame.
pub async fn write_json<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let data = serde_json::to_vec(value).context("encode json frame")?;
    write_frame(writer, &data).await
}

/// Read a single JSON frame.
pub async fn read_json<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    let data = read_frame(reader).await?;
    serde_json::from_slice(&data).context("decode json frame")
}
