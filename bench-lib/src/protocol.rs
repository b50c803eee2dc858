//! Fixed-size, big-endian wire frames exchanged between client and server.
//!
//! A connection carries a stream of [`Request`] frames from the client and
//! a stream of [`Response`] frames back. Requests on one connection may be
//! pipelined; the server answers them in arrival order.

use std::{
    io,
    time::{SystemTime, UNIX_EPOCH},
};

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::work::Work;

pub const REQUEST_SIZE: usize = 25;
pub const RESPONSE_SIZE: usize = 9;

/// Nanoseconds since the UNIX epoch.
///
/// Only used as informational payload, latency is measured
/// with a monotonic clock on the client.
pub fn unix_time_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    /// Sequence number, unique per connection.
    pub id: u64,
    pub send_time: u64,
    pub work: Work,
}

/// A request frame that was read in full but carries an unknown work id.
///
/// The frame boundary is intact so the connection can keep going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownWork {
    pub id: u64,
    pub work_id: u8,
}

impl Request {
    pub fn encode(&self) -> [u8; REQUEST_SIZE] {
        let mut buf = [0u8; REQUEST_SIZE];
        buf[0..8].copy_from_slice(&self.id.to_be_bytes());
        buf[8..16].copy_from_slice(&self.send_time.to_be_bytes());
        buf[16] = self.work.wire_id();
        buf[17..25].copy_from_slice(&self.work.wire_param().to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; REQUEST_SIZE]) -> Result<Self, UnknownWork> {
        let id = read_u64(buf, 0);
        let send_time = read_u64(buf, 8);
        let work_id = buf[16];
        let param = read_u64(buf, 17);

        match Work::from_wire(work_id, param) {
            Some(work) => Ok(Self {
                id,
                send_time,
                work,
            }),
            None => Err(UnknownWork { id, work_id }),
        }
    }

    /// Read the next request frame.
    ///
    /// `Ok(None)` signals a clean EOF on a frame boundary.
    pub async fn read_from<R>(reader: &mut R) -> io::Result<Option<Result<Self, UnknownWork>>>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; REQUEST_SIZE];
        if !read_frame(reader, &mut buf).await? {
            return Ok(None);
        }
        Ok(Some(Self::decode(&buf)))
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.encode()).await
    }
}

/// Terminal status of a request as decided by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Completed,
    TimedOut,
    Errored,
}

impl Status {
    fn to_byte(self) -> u8 {
        match self {
            Self::Completed => 0,
            Self::TimedOut => 1,
            Self::Errored => 2,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Completed),
            1 => Some(Self::TimedOut),
            2 => Some(Self::Errored),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    /// Echo of [`Request::id`].
    pub id: u64,
    pub status: Status,
}

impl Response {
    pub fn encode(&self) -> [u8; RESPONSE_SIZE] {
        let mut buf = [0u8; RESPONSE_SIZE];
        buf[0..8].copy_from_slice(&self.id.to_be_bytes());
        buf[8] = self.status.to_byte();
        buf
    }

    pub fn decode(buf: &[u8; RESPONSE_SIZE]) -> io::Result<Self> {
        let id = read_u64(buf, 0);
        let status = Status::from_byte(buf[8]).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid response status byte {} for request #{id}", buf[8]),
            )
        })?;
        Ok(Self { id, status })
    }

    /// Read the next response frame.
    ///
    /// `Ok(None)` signals a clean EOF on a frame boundary.
    pub async fn read_from<R>(reader: &mut R) -> io::Result<Option<Self>>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; RESPONSE_SIZE];
        if !read_frame(reader, &mut buf).await? {
            return Ok(None);
        }
        Self::decode(&buf).map(Some)
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.encode()).await
    }
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_be_bytes(bytes)
}

/// Fill `buf` completely. Returns `false` on EOF before the first byte,
/// and an `UnexpectedEof` error when the frame got cut off midway.
async fn read_frame<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("frame cut off after {filled} of {} bytes", buf.len()),
            ));
        }
        filled += n;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_layout() {
        let req = Request {
            id: 1,
            send_time: 2,
            work: Work::Sleep { micros: 3 },
        };
        let buf = req.encode();
        assert_eq!(&buf[0..8], &1u64.to_be_bytes());
        assert_eq!(&buf[8..16], &2u64.to_be_bytes());
        assert_eq!(buf[16], 2);
        assert_eq!(&buf[17..25], &3u64.to_be_bytes());
        assert_eq!(Request::decode(&buf), Ok(req));
    }

    #[test]
    fn unknown_work_keeps_request_id() {
        let mut buf = Request {
            id: 42,
            send_time: 0,
            work: Work::Noop,
        }
        .encode();
        buf[16] = 9;
        assert_eq!(
            Request::decode(&buf),
            Err(UnknownWork {
                id: 42,
                work_id: 9
            })
        );
    }

    #[test]
    fn invalid_status_is_rejected() {
        let mut buf = Response {
            id: 7,
            status: Status::TimedOut,
        }
        .encode();
        assert_eq!(buf[8], 1);
        buf[8] = 3;
        let err = Response::decode(&buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn read_frames_from_stream() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let first = Request {
            id: 1,
            send_time: unix_time_nanos(),
            work: Work::Busy { iterations: 10 },
        };
        first.write_to(&mut client).await.unwrap();
        client.write_all(&[0u8; 4]).await.unwrap();
        drop(client);

        let got = Request::read_from(&mut server).await.unwrap();
        assert_eq!(got, Some(Ok(first)));

        let err = Request::read_from(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn clean_eof_on_frame_boundary() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert_eq!(Response::read_from(&mut server).await.unwrap(), None);
    }
}
