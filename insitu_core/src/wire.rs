//! Wire encodings for the rendezvous socket and group-channel messages.
//!
//! Everything is little-endian. No version field, no magic number.
//!
//! ```text
//! Rendezvous:     [len: i32][len bytes of UTF-8 port name]
//! Bounds / query: [lx ly lz ux uy uz: f32 x 6]            (24 bytes)
//! Count:          [n: i32]                                (4 bytes)
//! Payload:        [n * stride f32]
//! ```

use crate::bounds::Box3;
use crate::error::{InSituError, Result};
use insitu_env::PortName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest port name accepted on the rendezvous socket.
pub const MAX_PORT_NAME_LEN: usize = 1024;

/// Size of an encoded [`Box3`].
pub const BOX_BYTES: usize = 24;

/// Size of an encoded count.
pub const COUNT_BYTES: usize = 4;

/// Reads one length-prefixed port name.
///
/// The declared length must be in `1..=MAX_PORT_NAME_LEN`, the sender must
/// deliver exactly that many bytes before closing, and the bytes must be
/// UTF-8. Anything else is a [`InSituError::Protocol`].
pub async fn read_port_name<R>(reader: &mut R) -> Result<PortName>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; COUNT_BYTES];
    reader
        .read_exact(&mut prefix)
        .await
        .map_err(|e| InSituError::protocol(format!("short read on length prefix: {}", e)))?;

    let declared = i32::from_le_bytes(prefix);
    if declared <= 0 || declared as usize > MAX_PORT_NAME_LEN {
        return Err(InSituError::protocol(format!(
            "declared port name length {} outside 1..={}",
            declared, MAX_PORT_NAME_LEN
        )));
    }
    let declared = declared as usize;

    let mut bytes = Vec::with_capacity(declared);
    reader
        .take(declared as u64)
        .read_to_end(&mut bytes)
        .await
        .map_err(|e| InSituError::protocol(format!("read failed on port name: {}", e)))?;

    if bytes.len() != declared {
        return Err(InSituError::protocol(format!(
            "declared {} bytes of port name but read {}",
            declared,
            bytes.len()
        )));
    }

    String::from_utf8(bytes)
        .map(PortName::from)
        .map_err(|e| InSituError::protocol(format!("port name is not UTF-8: {}", e)))
}

/// Writes one length-prefixed port name and flushes.
pub async fn write_port_name<W>(writer: &mut W, name: &PortName) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if name.is_empty() || name.len() > MAX_PORT_NAME_LEN {
        return Err(InSituError::protocol(format!(
            "port name length {} outside 1..={}",
            name.len(),
            MAX_PORT_NAME_LEN
        )));
    }

    let mut frame = Vec::with_capacity(COUNT_BYTES + name.len());
    frame.extend_from_slice(&(name.len() as i32).to_le_bytes());
    frame.extend_from_slice(name.as_str().as_bytes());

    writer
        .write_all(&frame)
        .await
        .map_err(|e| InSituError::protocol(format!("failed to send port name: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| InSituError::protocol(format!("failed to flush port name: {}", e)))
}

pub fn encode_box(b: &Box3) -> Vec<u8> {
    encode_floats(&b.to_array())
}

pub fn decode_box(data: &[u8]) -> Result<Box3> {
    if data.len() != BOX_BYTES {
        return Err(InSituError::protocol(format!(
            "expected a {}-byte box, got {} bytes",
            BOX_BYTES,
            data.len()
        )));
    }
    let mut values = [0f32; 6];
    for (value, chunk) in values.iter_mut().zip(data.chunks_exact(4)) {
        *value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Ok(Box3::from_array(values))
}

/// Encodes a record or query count as an `i32`.
pub fn encode_count(count: usize) -> Result<Vec<u8>> {
    let count = i32::try_from(count)
        .map_err(|_| InSituError::protocol(format!("count {} does not fit in an i32", count)))?;
    Ok(count.to_le_bytes().to_vec())
}

pub fn decode_count(data: &[u8]) -> Result<usize> {
    let bytes: [u8; COUNT_BYTES] = data.try_into().map_err(|_| {
        InSituError::protocol(format!(
            "expected a {}-byte count, got {} bytes",
            COUNT_BYTES,
            data.len()
        ))
    })?;
    let count = i32::from_le_bytes(bytes);
    usize::try_from(count).map_err(|_| InSituError::protocol(format!("negative count {}", count)))
}

/// Encodes a signed value (client ids, including the new-client sentinel).
pub fn encode_i32(value: i32) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

pub fn decode_i32(data: &[u8]) -> Result<i32> {
    let bytes: [u8; 4] = data.try_into().map_err(|_| {
        InSituError::protocol(format!("expected a 4-byte integer, got {} bytes", data.len()))
    })?;
    Ok(i32::from_le_bytes(bytes))
}

pub fn encode_floats(values: &[f32]) -> Vec<u8> {
    let mut data = Vec::with_capacity(values.len() * 4);
    for value in values {
        data.extend_from_slice(&value.to_le_bytes());
    }
    data
}

pub fn decode_floats(data: &[u8]) -> Result<Vec<f32>> {
    if data.len() % 4 != 0 {
        return Err(InSituError::protocol(format!(
            "float payload of {} bytes is not a multiple of 4",
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_port_name_frame_layout() {
        let mut frame = Vec::new();
        write_port_name(&mut frame, &PortName::from("local://a")).await.unwrap();

        assert_eq!(&frame[0..4], &9i32.to_le_bytes());
        assert_eq!(&frame[4..], b"local://a");

        let mut reader = frame.as_slice();
        assert_eq!(read_port_name(&mut reader).await.unwrap().as_str(), "local://a");
    }

    #[tokio::test]
    async fn test_short_payload_is_protocol_error() {
        let mut frame = 50i32.to_le_bytes().to_vec();
        frame.extend_from_slice(&[b'x'; 10]);

        let mut reader = frame.as_slice();
        let err = read_port_name(&mut reader).await.unwrap_err();
        assert!(matches!(err, InSituError::Protocol(ref m) if m.contains("declared 50")));
    }

    #[tokio::test]
    async fn test_length_limits() {
        for declared in [0i32, -3, (MAX_PORT_NAME_LEN + 1) as i32] {
            let frame = declared.to_le_bytes().to_vec();
            let mut reader = frame.as_slice();
            assert!(matches!(
                read_port_name(&mut reader).await,
                Err(InSituError::Protocol(_))
            ));
        }

        let mut reader: &[u8] = &[1, 0];
        assert!(read_port_name(&mut reader).await.is_err());

        let mut sink = Vec::new();
        assert!(write_port_name(&mut sink, &PortName::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_utf8_rejected() {
        let mut frame = 2i32.to_le_bytes().to_vec();
        frame.extend_from_slice(&[0xff, 0xfe]);
        let mut reader = frame.as_slice();
        assert!(read_port_name(&mut reader).await.is_err());
    }

    #[test]
    fn test_box_layout() {
        let b = Box3::from_corners([1.0, 2.0, 3.0], [4.0, 5.0, 6.0]);
        let data = encode_box(&b);

        assert_eq!(data.len(), BOX_BYTES);
        assert_eq!(&data[12..16], &4.0f32.to_le_bytes());
        assert_eq!(decode_box(&data).unwrap(), b);
        assert!(decode_box(&data[..20]).is_err());
    }

    #[test]
    fn test_counts() {
        assert_eq!(decode_count(&encode_count(300).unwrap()).unwrap(), 300);
        assert!(decode_count(&(-1i32).to_le_bytes()).is_err());
        assert!(decode_count(&[0, 0]).is_err());
        assert!(encode_count(i32::MAX as usize + 1).is_err());
        assert_eq!(decode_i32(&encode_i32(-1)).unwrap(), -1);
    }

    #[test]
    fn test_float_payload_must_be_whole() {
        assert!(decode_floats(&[0u8; 7]).is_err());
        assert_eq!(decode_floats(&encode_floats(&[0.5, -2.0])).unwrap(), vec![0.5, -2.0]);
    }
}
