//! Binary encoding of [`Fcall`] and stream framing.
//!
//! Every frame is `size[4] type[1] tag[2] payload`, little-endian, with
//! `size` counting the whole frame including itself.

use bytes::BytesMut;
use log::trace;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{DecodeError, EncodeError, Error};
use crate::fcall::{Fcall, Msg};
use crate::message::{
    Message, dump_hex, read_bytes, read_qid, read_str, read_u8, read_u16, read_u32, read_u64,
};
use crate::protocol::{DEFAULT_MSIZE, HEADER_SIZE, MAXWELEM, MsgType, Perm};

/// Encode a message into one complete frame.
///
/// Nothing is produced unless the whole message is valid.
pub fn encode(fcall: &Fcall) -> Result<Vec<u8>, EncodeError> {
    fcall.validate()?;
    let mut msg = Message::new(fcall.msg_type(), fcall.tag);
    match &fcall.body {
        Msg::Tversion { msize, version } | Msg::Rversion { msize, version } => {
            msg.push_u32(*msize);
            msg.push_str(version);
        }
        Msg::Tauth { afid, uname, aname } => {
            msg.push_u32(*afid);
            msg.push_str(uname);
            msg.push_str(aname);
        }
        Msg::Rauth { aqid } => msg.push_qid(aqid),
        Msg::Tattach {
            fid,
            afid,
            uname,
            aname,
        } => {
            msg.push_u32(*fid);
            msg.push_u32(*afid);
            msg.push_str(uname);
            msg.push_str(aname);
        }
        Msg::Rattach { qid } => msg.push_qid(qid),
        Msg::Rerror { ename } => msg.push_str(ename),
        Msg::Tflush { oldtag } => msg.push_u16(*oldtag),
        Msg::Twalk { fid, newfid, wname } => {
            msg.push_u32(*fid);
            msg.push_u32(*newfid);
            msg.push_u16(wname.len() as u16);
            for name in wname {
                msg.push_str(name);
            }
        }
        Msg::Rwalk { wqid } => {
            msg.push_u16(wqid.len() as u16);
            for qid in wqid {
                msg.push_qid(qid);
            }
        }
        Msg::Topen { fid, mode } => {
            msg.push_u32(*fid);
            msg.push_u8(*mode);
        }
        Msg::Ropen { qid, iounit } | Msg::Rcreate { qid, iounit } => {
            msg.push_qid(qid);
            msg.push_u32(*iounit);
        }
        Msg::Tcreate {
            fid,
            name,
            perm,
            mode,
        } => {
            msg.push_u32(*fid);
            msg.push_str(name);
            msg.push_u32(perm.bits());
            msg.push_u8(*mode);
        }
        Msg::Tread { fid, offset, count } => {
            msg.push_u32(*fid);
            msg.push_u64(*offset);
            msg.push_u32(*count);
        }
        Msg::Rread { data } => {
            msg.push_u32(data.len() as u32);
            msg.push_bytes(data);
        }
        Msg::Twrite { fid, offset, data } => {
            msg.push_u32(*fid);
            msg.push_u64(*offset);
            msg.push_u32(data.len() as u32);
            msg.push_bytes(data);
        }
        Msg::Rwrite { count } => msg.push_u32(*count),
        Msg::Tclunk { fid } | Msg::Tremove { fid } | Msg::Tstat { fid } => msg.push_u32(*fid),
        Msg::Rstat { stat } => {
            msg.push_u16(stat.len() as u16);
            msg.push_bytes(stat);
        }
        Msg::Twstat { fid, stat } => {
            msg.push_u32(*fid);
            msg.push_u16(stat.len() as u16);
            msg.push_bytes(stat);
        }
        Msg::Rflush | Msg::Rclunk | Msg::Rremove | Msg::Rwstat => {}
    }
    let frame = msg.finish();
    if u32::try_from(frame.len()).is_err() {
        return Err(EncodeError::PayloadTooLarge {
            msg: fcall.msg_type(),
            len: frame.len(),
        });
    }
    Ok(frame)
}

/// Declared size of the frame at the start of `buf`, if the size field is there.
pub fn frame_len(buf: &[u8]) -> Option<usize> {
    let raw = buf.get(..4)?;
    Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize)
}

/// Decode exactly one frame occupying the whole of `buf`.
pub fn decode(buf: &[u8]) -> Result<Fcall, DecodeError> {
    let Some(size) = frame_len(buf) else {
        return Err(DecodeError::Incomplete {
            needed: HEADER_SIZE,
            available: buf.len(),
        });
    };
    if size < HEADER_SIZE {
        return Err(DecodeError::Malformed("frame size smaller than header"));
    }
    if buf.len() < size {
        return Err(DecodeError::Incomplete {
            needed: size,
            available: buf.len(),
        });
    }
    if buf.len() > size {
        return Err(DecodeError::TrailingBytes(buf.len() - size));
    }

    let mut offset = 4;
    let raw_type = read_u8(buf, &mut offset)?;
    let msg_type = MsgType::from_repr(raw_type).ok_or(DecodeError::UnknownMessageType(raw_type))?;
    let tag = read_u16(buf, &mut offset)?;
    let body = decode_body(msg_type, buf, &mut offset)?;
    if offset != buf.len() {
        trace!("{} leftover: {}", msg_type, dump_hex(&buf[offset..]));
        return Err(DecodeError::Malformed("payload longer than its fields"));
    }

    let fcall = Fcall::new(tag, body);
    fcall.validate()?;
    Ok(fcall)
}

fn decode_body(msg_type: MsgType, buf: &[u8], offset: &mut usize) -> Result<Msg, DecodeError> {
    let body = match msg_type {
        MsgType::Tversion => Msg::Tversion {
            msize: read_u32(buf, offset)?,
            version: read_str(buf, offset)?,
        },
        MsgType::Rversion => Msg::Rversion {
            msize: read_u32(buf, offset)?,
            version: read_str(buf, offset)?,
        },
        MsgType::Tauth => Msg::Tauth {
            afid: read_u32(buf, offset)?,
            uname: read_str(buf, offset)?,
            aname: read_str(buf, offset)?,
        },
        MsgType::Rauth => Msg::Rauth {
            aqid: read_qid(buf, offset)?,
        },
        MsgType::Tattach => Msg::Tattach {
            fid: read_u32(buf, offset)?,
            afid: read_u32(buf, offset)?,
            uname: read_str(buf, offset)?,
            aname: read_str(buf, offset)?,
        },
        MsgType::Rattach => Msg::Rattach {
            qid: read_qid(buf, offset)?,
        },
        MsgType::Rerror => Msg::Rerror {
            ename: read_str(buf, offset)?,
        },
        MsgType::Tflush => Msg::Tflush {
            oldtag: read_u16(buf, offset)?,
        },
        MsgType::Rflush => Msg::Rflush,
        MsgType::Twalk => {
            let fid = read_u32(buf, offset)?;
            let newfid = read_u32(buf, offset)?;
            let count = read_walk_count(buf, offset)?;
            let mut wname = Vec::with_capacity(count);
            for _ in 0..count {
                wname.push(read_str(buf, offset)?);
            }
            Msg::Twalk { fid, newfid, wname }
        }
        MsgType::Rwalk => {
            let count = read_walk_count(buf, offset)?;
            let mut wqid = Vec::with_capacity(count);
            for _ in 0..count {
                wqid.push(read_qid(buf, offset)?);
            }
            Msg::Rwalk { wqid }
        }
        MsgType::Topen => Msg::Topen {
            fid: read_u32(buf, offset)?,
            mode: read_u8(buf, offset)?,
        },
        MsgType::Ropen => Msg::Ropen {
            qid: read_qid(buf, offset)?,
            iounit: read_u32(buf, offset)?,
        },
        MsgType::Tcreate => Msg::Tcreate {
            fid: read_u32(buf, offset)?,
            name: read_str(buf, offset)?,
            perm: Perm::from_bits_retain(read_u32(buf, offset)?),
            mode: read_u8(buf, offset)?,
        },
        MsgType::Rcreate => Msg::Rcreate {
            qid: read_qid(buf, offset)?,
            iounit: read_u32(buf, offset)?,
        },
        MsgType::Tread => Msg::Tread {
            fid: read_u32(buf, offset)?,
            offset: read_u64(buf, offset)?,
            count: read_u32(buf, offset)?,
        },
        MsgType::Rread => {
            let count = read_u32(buf, offset)? as usize;
            Msg::Rread {
                data: read_bytes(buf, offset, count)?.to_vec(),
            }
        }
        MsgType::Twrite => {
            let fid = read_u32(buf, offset)?;
            let file_offset = read_u64(buf, offset)?;
            let count = read_u32(buf, offset)? as usize;
            Msg::Twrite {
                fid,
                offset: file_offset,
                data: read_bytes(buf, offset, count)?.to_vec(),
            }
        }
        MsgType::Rwrite => Msg::Rwrite {
            count: read_u32(buf, offset)?,
        },
        MsgType::Tclunk => Msg::Tclunk {
            fid: read_u32(buf, offset)?,
        },
        MsgType::Rclunk => Msg::Rclunk,
        MsgType::Tremove => Msg::Tremove {
            fid: read_u32(buf, offset)?,
        },
        MsgType::Rremove => Msg::Rremove,
        MsgType::Tstat => Msg::Tstat {
            fid: read_u32(buf, offset)?,
        },
        MsgType::Rstat => {
            let len = read_u16(buf, offset)? as usize;
            Msg::Rstat {
                stat: read_bytes(buf, offset, len)?.to_vec(),
            }
        }
        MsgType::Twstat => {
            let fid = read_u32(buf, offset)?;
            let len = read_u16(buf, offset)? as usize;
            Msg::Twstat {
                fid,
                stat: read_bytes(buf, offset, len)?.to_vec(),
            }
        }
        MsgType::Rwstat => Msg::Rwstat,
    };
    Ok(body)
}

fn read_walk_count(buf: &[u8], offset: &mut usize) -> Result<usize, DecodeError> {
    let count = read_u16(buf, offset)? as usize;
    if count > MAXWELEM {
        return Err(DecodeError::Malformed("too many walk elements"));
    }
    Ok(count)
}

/// Stream framing for [`Fcall`]s over a byte stream.
///
/// Frames larger than `max_size` are rejected before they are buffered.
#[derive(Debug, Clone)]
pub struct FcallCodec {
    max_size: usize,
}

impl FcallCodec {
    pub fn new(max_size: u32) -> Self {
        Self {
            max_size: max_size as usize,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn set_max_size(&mut self, max_size: u32) {
        self.max_size = max_size as usize;
    }
}

impl Default for FcallCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MSIZE)
    }
}

impl Decoder for FcallCodec {
    type Item = Fcall;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Fcall>, DecodeError> {
        let Some(size) = frame_len(src) else {
            return Ok(None);
        };
        if size > self.max_size {
            return Err(DecodeError::FrameTooLarge {
                size,
                max: self.max_size,
            });
        }
        if size < HEADER_SIZE {
            return Err(DecodeError::Malformed("frame size smaller than header"));
        }
        if src.len() < size {
            src.reserve(size - src.len());
            return Ok(None);
        }
        let frame = src.split_to(size);
        decode(&frame).map(Some)
    }
}

impl Encoder<Fcall> for FcallCodec {
    type Error = Error;

    fn encode(&mut self, item: Fcall, dst: &mut BytesMut) -> Result<(), Error> {
        let frame = encode(&item)?;
        if frame.len() > self.max_size {
            return Err(EncodeError::FrameTooLarge {
                size: frame.len(),
                max: self.max_size,
            }
            .into());
        }
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{NOFID, NOTAG, Qid, QidType};
    use crate::stat::Dir;

    fn every_message() -> Vec<Fcall> {
        let qid = Qid::new(0x0102_0304_0506_0708, 7, QidType::DIR | QidType::APPEND);
        let stat = Dir {
            qid,
            name: "etc".into(),
            uid: "glenda".into(),
            ..Default::default()
        }
        .encode()
        .unwrap();
        vec![
            Fcall::new(NOTAG, Msg::Tversion { msize: 8216, version: "9P2000".into() }),
            Fcall::new(NOTAG, Msg::Rversion { msize: 8192, version: "9P2000".into() }),
            Fcall::new(1, Msg::Tauth { afid: 9, uname: "glenda".into(), aname: "".into() }),
            Fcall::new(1, Msg::Rauth { aqid: Qid::new(5, 0, QidType::AUTH) }),
            Fcall::new(2, Msg::Tattach { fid: 0, afid: NOFID, uname: "glenda".into(), aname: "/".into() }),
            Fcall::new(2, Msg::Rattach { qid }),
            Fcall::new(3, Msg::error("file not found")),
            Fcall::new(4, Msg::Tflush { oldtag: 3 }),
            Fcall::new(4, Msg::Rflush),
            Fcall::new(5, Msg::Twalk { fid: 0, newfid: 1, wname: vec!["usr".into(), "glenda".into(), "lib".into()] }),
            Fcall::new(5, Msg::Rwalk { wqid: vec![qid, Qid::new(3, 1, QidType::FILE)] }),
            Fcall::new(6, Msg::Topen { fid: 1, mode: 2 }),
            Fcall::new(6, Msg::Ropen { qid, iounit: 8168 }),
            Fcall::new(7, Msg::Tcreate { fid: 1, name: "new".into(), perm: Perm::DIR | Perm::from_bits_retain(0o755), mode: 0 }),
            Fcall::new(7, Msg::Rcreate { qid, iounit: 0 }),
            Fcall::new(8, Msg::Tread { fid: 1, offset: u64::MAX - 1, count: 4096 }),
            Fcall::new(8, Msg::Rread { data: b"hello world".to_vec() }),
            Fcall::new(9, Msg::Twrite { fid: 1, offset: 11, data: vec![0, 1, 2, 255] }),
            Fcall::new(9, Msg::Rwrite { count: 4 }),
            Fcall::new(10, Msg::Tclunk { fid: 1 }),
            Fcall::new(10, Msg::Rclunk),
            Fcall::new(11, Msg::Tremove { fid: 2 }),
            Fcall::new(11, Msg::Rremove),
            Fcall::new(12, Msg::Tstat { fid: 0 }),
            Fcall::new(12, Msg::Rstat { stat: stat.clone() }),
            Fcall::new(13, Msg::Twstat { fid: 0, stat }),
            Fcall::new(13, Msg::Rwstat),
        ]
    }

    #[test]
    fn round_trip_every_opcode() {
        let calls = every_message();
        assert_eq!(calls.len(), 27);
        for call in calls {
            let frame = encode(&call).unwrap();
            assert_eq!(frame_len(&frame), Some(frame.len()));
            assert_eq!(frame[4], call.msg_type() as u8);
            assert_eq!(decode(&frame).unwrap(), call, "{}", call);
        }
    }

    #[test]
    fn version_bytes() {
        let call = Fcall::new(NOTAG, Msg::Tversion { msize: 8192, version: "9P2000".into() });
        let frame = encode(&call).unwrap();
        assert_eq!(
            frame,
            vec![
                19, 0, 0, 0, 100, 0xff, 0xff, 0x00, 0x20, 0, 0, 6, 0, b'9', b'P', b'2', b'0',
                b'0', b'0'
            ]
        );
    }

    #[test]
    fn walk_bytes() {
        let call = Fcall::new(
            1,
            Msg::Rwalk {
                wqid: vec![Qid::new(2, 1, QidType::DIR)],
            },
        );
        let frame = encode(&call).unwrap();
        assert_eq!(frame.len(), 7 + 2 + 13);
        assert_eq!(&frame[7..9], &[1, 0]);
        assert_eq!(frame[9], 0x80);
        assert_eq!(&frame[10..14], &[1, 0, 0, 0]);
        assert_eq!(&frame[14..22], &[2, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn short_buffer_is_incomplete() {
        let frame = encode(&Fcall::new(3, Msg::Tclunk { fid: 4 })).unwrap();
        for cut in 0..frame.len() {
            let err = decode(&frame[..cut]).unwrap_err();
            assert!(err.is_incomplete(), "cut {}: {}", cut, err);
        }
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut frame = encode(&Fcall::new(3, Msg::Rclunk)).unwrap();
        frame.push(0);
        assert!(matches!(decode(&frame), Err(DecodeError::TrailingBytes(1))));
    }

    #[test]
    fn unknown_opcode() {
        let frame = [7, 0, 0, 0, 127, 1, 0];
        assert!(matches!(
            decode(&frame),
            Err(DecodeError::UnknownMessageType(127))
        ));
        let frame = [7, 0, 0, 0, 99, 1, 0];
        assert!(matches!(
            decode(&frame),
            Err(DecodeError::UnknownMessageType(99))
        ));
    }

    #[test]
    fn overlong_field_is_malformed() {
        // Rerror claiming a 200 byte ename inside a 12 byte frame
        let frame = [12, 0, 0, 0, 106, 1, 0, 200, 0, b'o', b'o', b'p'];
        assert!(matches!(decode(&frame), Err(DecodeError::Malformed(_))));
        // Rread count larger than the frame
        let frame = [13, 0, 0, 0, 116, 1, 0, 9, 0, 0, 0, b'a', b'b'];
        assert!(matches!(decode(&frame), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn undersized_frame_is_malformed() {
        let frame = [3, 0, 0, 0];
        assert!(matches!(decode(&frame), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn leftover_payload_is_malformed() {
        let mut frame = encode(&Fcall::new(3, Msg::Tclunk { fid: 4 })).unwrap();
        frame.push(0);
        frame[0] += 1;
        assert!(matches!(decode(&frame), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn too_many_walk_elements_on_the_wire() {
        let mut msg = Message::new(MsgType::Twalk, 1);
        msg.push_u32(0);
        msg.push_u32(1);
        msg.push_u16(17);
        for _ in 0..17 {
            msg.push_str("a");
        }
        assert!(matches!(
            decode(&msg.finish()),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn invalid_decoded_message() {
        let mut msg = Message::new(MsgType::Tclunk, 1);
        msg.push_u32(NOFID);
        assert!(matches!(
            decode(&msg.finish()),
            Err(DecodeError::Invalid(EncodeError::MissingField { field: "fid", .. }))
        ));
    }

    #[test]
    fn encode_rejects_without_output() {
        let call = Fcall::new(
            1,
            Msg::Twalk {
                fid: 0,
                newfid: 1,
                wname: vec![String::new(); MAXWELEM + 1],
            },
        );
        assert!(matches!(
            encode(&call),
            Err(EncodeError::TooManyWalkElements { .. })
        ));
    }

    #[test]
    fn stream_codec_waits_for_whole_frames() {
        let mut codec = FcallCodec::default();
        let first = Fcall::new(1, Msg::Tstat { fid: 2 });
        let second = Fcall::new(2, Msg::Rread { data: vec![1; 32] });
        let mut wire = BytesMut::new();
        codec.encode(first.clone(), &mut wire).unwrap();
        codec.encode(second.clone(), &mut wire).unwrap();

        let mut src = BytesMut::new();
        let mut out = Vec::new();
        for byte in wire.iter() {
            src.extend_from_slice(&[*byte]);
            if let Some(call) = codec.decode(&mut src).unwrap() {
                out.push(call);
            }
        }
        assert_eq!(out, vec![first, second]);
        assert!(src.is_empty());
    }

    #[test]
    fn stream_codec_limits_frame_size() {
        let mut codec = FcallCodec::new(64);
        let mut src = BytesMut::from(&[0x00, 0x10, 0x00, 0x00][..]);
        assert!(matches!(
            codec.decode(&mut src),
            Err(DecodeError::FrameTooLarge { size: 4096, max: 64 })
        ));
        let mut dst = BytesMut::new();
        let big = Fcall::new(1, Msg::Rread { data: vec![0; 100] });
        assert!(matches!(
            codec.encode(big, &mut dst),
            Err(Error::Encode(EncodeError::FrameTooLarge { size: 111, max: 64 }))
        ));
        assert!(dst.is_empty());
        let unset = Fcall::new(1, Msg::Tclunk { fid: NOFID });
        assert!(matches!(
            codec.encode(unset, &mut dst),
            Err(Error::Encode(EncodeError::MissingField { .. }))
        ));
    }
}
