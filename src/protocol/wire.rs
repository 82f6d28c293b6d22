use arrayref::array_ref;
use byteorder::{ByteOrder, LittleEndian};
use rkyv::{
    bytecheck::CheckBytes,
    de::deserializers::SharedDeserializeMap,
    ser::serializers::AllocSerializer,
    validation::validators::DefaultValidator,
    AlignedVec, Archive, Deserialize, Serialize,
};

use super::status::StatusReport;
use crate::{ClassId, Error, Id, MethodId, ObjectId, NOT_ASSOCIATED};

/// Command header is five little-endian u32 words:
///
/// `code | class_id | method_id | object_id | payload_len`
///
/// followed by `payload_len` bytes. The payload carries the name for the
/// association commands and the archived argument for `Invoke`; every other
/// command has an empty payload. Unused id slots hold [`NOT_ASSOCIATED`].
pub const HEADER_LEN: usize = 20;

/// Largest frame any transport carries, header included.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const NO_PAYLOAD: &[u8] = &[];

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandCode {
    Stop = 0,
    AssociateClass = 1,
    AssociateMethod = 2,
    Create = 3,
    Invoke = 4,
    Destroy = 5,
    InvokeGather = 6,
    Dump = 7,
}

impl TryFrom<u32> for CommandCode {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => CommandCode::Stop,
            1 => CommandCode::AssociateClass,
            2 => CommandCode::AssociateMethod,
            3 => CommandCode::Create,
            4 => CommandCode::Invoke,
            5 => CommandCode::Destroy,
            6 => CommandCode::InvokeGather,
            7 => CommandCode::Dump,
            other => {
                return Err(Error::MalformedCommand(format!(
                    "unknown command code {other}"
                )))
            }
        })
    }
}

/// One protocol step, broadcast from the controller to every worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    AssociateClass { name: String, id: ClassId },
    AssociateMethod { name: String, id: MethodId },
    Create { class_id: ClassId, object_id: ObjectId },
    Invoke {
        class_id: ClassId,
        method_id: MethodId,
        object_id: ObjectId,
        argument: Vec<u8>,
    },
    /// Like `Invoke`, but every worker sends the method's output back.
    InvokeGather {
        class_id: ClassId,
        method_id: MethodId,
        object_id: ObjectId,
    },
    Destroy { class_id: ClassId, object_id: ObjectId },
    /// Every worker logs its object table and sends back its live ids.
    Dump,
    Stop,
}

impl Command {
    pub fn code(&self) -> CommandCode {
        match self {
            Command::AssociateClass { .. } => CommandCode::AssociateClass,
            Command::AssociateMethod { .. } => CommandCode::AssociateMethod,
            Command::Create { .. } => CommandCode::Create,
            Command::Invoke { .. } => CommandCode::Invoke,
            Command::InvokeGather { .. } => CommandCode::InvokeGather,
            Command::Destroy { .. } => CommandCode::Destroy,
            Command::Dump => CommandCode::Dump,
            Command::Stop => CommandCode::Stop,
        }
    }

    /// Whether the workers answer this command with a [`Reply`]. Commands
    /// that carry results back always do, `Stop` never does, the rest only
    /// when the status channel is enabled.
    pub fn expects_reply(&self, status_channel: bool) -> bool {
        match self {
            Command::InvokeGather { .. } | Command::Dump => true,
            Command::Stop => false,
            _ => status_channel,
        }
    }

    /// Fails with [`Error::Encode`] when the payload would push the frame
    /// over [`MAX_FRAME_LEN`]; nothing has been sent at that point.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let n = NOT_ASSOCIATED;
        let (class_id, method_id, object_id, payload): (Id, Id, Id, &[u8]) = match self {
            Command::AssociateClass { name, id } => (*id, n, n, name.as_bytes()),
            Command::AssociateMethod { name, id } => (n, *id, n, name.as_bytes()),
            Command::Create {
                class_id,
                object_id,
            } => (*class_id, n, *object_id, NO_PAYLOAD),
            Command::Invoke {
                class_id,
                method_id,
                object_id,
                argument,
            } => (*class_id, *method_id, *object_id, argument.as_slice()),
            Command::InvokeGather {
                class_id,
                method_id,
                object_id,
            } => (*class_id, *method_id, *object_id, NO_PAYLOAD),
            Command::Destroy {
                class_id,
                object_id,
            } => (*class_id, n, *object_id, NO_PAYLOAD),
            Command::Dump | Command::Stop => (n, n, n, NO_PAYLOAD),
        };

        if payload.len() > MAX_FRAME_LEN - HEADER_LEN {
            return Err(Error::Encode);
        }

        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
        buf.resize(HEADER_LEN, 0);
        LittleEndian::write_u32(&mut buf[0..4], self.code() as u32);
        LittleEndian::write_u32(&mut buf[4..8], class_id);
        LittleEndian::write_u32(&mut buf[8..12], method_id);
        LittleEndian::write_u32(&mut buf[12..16], object_id);
        LittleEndian::write_u32(&mut buf[16..20], payload.len() as u32);
        buf.extend_from_slice(payload);
        Ok(buf)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, Error> {
        if frame.len() < HEADER_LEN {
            return Err(Error::MalformedCommand(format!(
                "frame of {} bytes is shorter than the header",
                frame.len()
            )));
        }
        let header = array_ref![frame, 0, HEADER_LEN];
        let code = CommandCode::try_from(LittleEndian::read_u32(&header[0..4]))?;
        let class_id = LittleEndian::read_u32(&header[4..8]);
        let method_id = LittleEndian::read_u32(&header[8..12]);
        let object_id = LittleEndian::read_u32(&header[12..16]);
        let payload_len = LittleEndian::read_u32(&header[16..20]) as usize;

        let payload = &frame[HEADER_LEN..];
        if payload.len() != payload_len {
            return Err(Error::MalformedCommand(format!(
                "header announces {payload_len} payload bytes, frame carries {}",
                payload.len()
            )));
        }

        let header_only = !matches!(
            code,
            CommandCode::AssociateClass | CommandCode::AssociateMethod | CommandCode::Invoke
        );
        if header_only && payload_len != 0 {
            return Err(Error::MalformedCommand(format!(
                "{code:?} carries {payload_len} unexpected payload bytes"
            )));
        }

        let name = || {
            String::from_utf8(payload.to_vec())
                .map_err(|_| Error::MalformedCommand("name is not valid utf-8".into()))
        };

        Ok(match code {
            CommandCode::Stop => Command::Stop,
            CommandCode::AssociateClass => Command::AssociateClass {
                name: name()?,
                id: class_id,
            },
            CommandCode::AssociateMethod => Command::AssociateMethod {
                name: name()?,
                id: method_id,
            },
            CommandCode::Create => Command::Create {
                class_id,
                object_id,
            },
            CommandCode::Invoke => Command::Invoke {
                class_id,
                method_id,
                object_id,
                argument: payload.to_vec(),
            },
            CommandCode::InvokeGather => Command::InvokeGather {
                class_id,
                method_id,
                object_id,
            },
            CommandCode::Destroy => Command::Destroy {
                class_id,
                object_id,
            },
            CommandCode::Dump => Command::Dump,
        })
    }
}

/// What a worker sends back to the controller after applying a command.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub struct Reply {
    pub status: StatusReport,
    /// Archived method output for `InvokeGather`, archived ids for `Dump`.
    pub payload: Vec<u8>,
}

/// Values that can travel inside a frame: method arguments, gathered
/// outputs, replies. Anything rkyv can archive and validate qualifies.
pub trait Payload: Sized {
    fn to_payload(&self) -> Result<Vec<u8>, Error>;
    fn from_payload(bytes: &[u8]) -> Result<Self, Error>;
}

impl<T> Payload for T
where
    T: Archive + Serialize<AllocSerializer<256>>,
    T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, SharedDeserializeMap>,
{
    fn to_payload(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<_, 256>(self)
            .map(|bytes| bytes.to_vec())
            .map_err(|_| Error::Encode)
    }

    fn from_payload(bytes: &[u8]) -> Result<Self, Error> {
        // frames come off the wire unaligned
        let mut aligned = AlignedVec::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<T>(&aligned).map_err(|_| Error::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn association_carries_name_in_payload() {
        let command = Command::AssociateMethod {
            name: "Counter::increment()".into(),
            id: 3,
        };
        let frame = command.encode().unwrap();
        assert_eq!(frame.len(), HEADER_LEN + "Counter::increment()".len());
        assert_eq!(LittleEndian::read_u32(&frame[0..4]), 2);
        assert_eq!(LittleEndian::read_u32(&frame[4..8]), NOT_ASSOCIATED);
        assert_eq!(LittleEndian::read_u32(&frame[8..12]), 3);
        assert_eq!(Command::decode(&frame).unwrap(), command);
    }

    #[test]
    fn invoke_argument_rides_in_the_same_frame() {
        let argument = 42u64.to_payload().unwrap();
        let command = Command::Invoke {
            class_id: 0,
            method_id: 1,
            object_id: 7,
            argument: argument.clone(),
        };
        match Command::decode(&command.encode().unwrap()).unwrap() {
            Command::Invoke {
                object_id,
                argument: decoded,
                ..
            } => {
                assert_eq!(object_id, 7);
                assert_eq!(u64::from_payload(&decoded).unwrap(), 42);
            }
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn stop_fills_unused_slots_with_sentinel() {
        let frame = Command::Stop.encode().unwrap();
        assert_eq!(frame.len(), HEADER_LEN);
        for word in frame[4..16].chunks(4) {
            assert_eq!(LittleEndian::read_u32(word), NOT_ASSOCIATED);
        }
    }

    #[test]
    fn rejects_truncated_and_unknown_frames() {
        assert!(matches!(
            Command::decode(&[0u8; 7]),
            Err(Error::MalformedCommand(_))
        ));

        let mut frame = Command::Dump.encode().unwrap();
        LittleEndian::write_u32(&mut frame[0..4], 99);
        assert!(matches!(
            Command::decode(&frame),
            Err(Error::MalformedCommand(_))
        ));

        let mut frame = Command::AssociateClass {
            name: "Counter".into(),
            id: 0,
        }
        .encode()
        .unwrap();
        frame.pop();
        assert!(matches!(
            Command::decode(&frame),
            Err(Error::MalformedCommand(_))
        ));
    }

    #[test]
    fn header_only_commands_reject_a_payload() {
        let mut frame = Command::Destroy {
            class_id: 0,
            object_id: 4,
        }
        .encode()
        .unwrap();
        LittleEndian::write_u32(&mut frame[16..20], 2);
        frame.extend_from_slice(&[1, 2]);
        assert!(matches!(
            Command::decode(&frame),
            Err(Error::MalformedCommand(_))
        ));

        let mut frame = Command::Stop.encode().unwrap();
        LittleEndian::write_u32(&mut frame[16..20], 1);
        frame.push(0);
        assert!(matches!(
            Command::decode(&frame),
            Err(Error::MalformedCommand(_))
        ));
    }

    #[test]
    fn oversized_argument_is_refused_before_framing() {
        let command = Command::Invoke {
            class_id: 0,
            method_id: 0,
            object_id: 0,
            argument: vec![0u8; MAX_FRAME_LEN - HEADER_LEN + 1],
        };
        assert!(matches!(command.encode(), Err(Error::Encode)));

        let command = Command::Invoke {
            class_id: 0,
            method_id: 0,
            object_id: 0,
            argument: vec![0u8; MAX_FRAME_LEN - HEADER_LEN],
        };
        assert_eq!(command.encode().unwrap().len(), MAX_FRAME_LEN);
    }

    #[test]
    fn only_result_commands_reply_without_status_channel() {
        assert!(Command::Dump.expects_reply(false));
        assert!(Command::InvokeGather {
            class_id: 0,
            method_id: 0,
            object_id: 0
        }
        .expects_reply(false));
        assert!(!Command::Stop.expects_reply(true));
        assert!(Command::Destroy {
            class_id: 0,
            object_id: 0
        }
        .expects_reply(true));
    }

    #[test]
    fn reply_survives_unaligned_buffer() {
        let reply = Reply {
            status: StatusReport::UserError("bad value".into()),
            payload: vec![1, 2, 3],
        };
        let mut shifted = vec![0u8];
        shifted.extend(reply.to_payload().unwrap());
        assert_eq!(Reply::from_payload(&shifted[1..]).unwrap(), reply);
    }
}
