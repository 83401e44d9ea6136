//! Framing of forwarded calls.
//!
//! A frame is the opcode byte followed by the call's [`CallHeader`].

use zerocopy::{AsBytes, FromBytes};

use crate::{
    error::TransportError,
    protocol::{
        opcode, AdvanceFrame, CallHeader, CloseFile, DefineDescriptor, Exit, FreeDescriptor,
        OpenFile, Opcode, ReadDarray, SetFrame, SyncFile, WriteDarrayMulti,
    },
};

#[derive(Debug)]
pub enum Call<'a> {
    DefineDescriptor(&'a DefineDescriptor),
    FreeDescriptor(&'a FreeDescriptor),
    OpenFile(&'a OpenFile),
    CloseFile(&'a CloseFile),
    SyncFile(&'a SyncFile),
    WriteDarrayMulti(&'a WriteDarrayMulti),
    ReadDarray(&'a ReadDarray),
    SetFrame(&'a SetFrame),
    AdvanceFrame(&'a AdvanceFrame),
    Exit(&'a Exit),
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum CallValidationError {
    #[error("Invalid opcode: {0}")]
    InvalidOpcode(Opcode),

    #[error("Frame carries opcode {actual}, expected {expected}")]
    OpcodeMismatch { expected: Opcode, actual: Opcode },

    #[error("Invalid frame size: expected {expected}, got {actual}")]
    InvalidFrameSize { expected: usize, actual: usize },
}

impl From<CallValidationError> for TransportError {
    fn from(err: CallValidationError) -> Self {
        tracing::debug!(%err, "rejected call frame");
        TransportError::Malformed("call frame")
    }
}

pub(crate) fn encode<T: CallHeader>(header: &T) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + std::mem::size_of::<T>());
    frame.push(T::opcode());
    frame.extend_from_slice(header.as_bytes());
    frame
}

fn header_ref<T: CallHeader>(frame: &[u8]) -> Result<&T, CallValidationError> {
    let size = std::mem::size_of::<T>();
    frame
        .get(1..)
        .and_then(T::ref_from)
        .ok_or(CallValidationError::InvalidFrameSize {
            expected: 1 + size,
            actual: frame.len(),
        })
}

/// Parses a frame received for the call announced as `expected`.
pub(crate) fn validate(frame: &[u8], expected: Opcode) -> Result<Call, CallValidationError> {
    let actual = *frame
        .first()
        .ok_or(CallValidationError::InvalidFrameSize {
            expected: 1,
            actual: 0,
        })?;
    if actual != expected {
        return Err(CallValidationError::OpcodeMismatch { expected, actual });
    }

    match actual {
        opcode::DEFINE_DESCRIPTOR => Ok(Call::DefineDescriptor(header_ref(frame)?)),
        opcode::FREE_DESCRIPTOR => Ok(Call::FreeDescriptor(header_ref(frame)?)),
        opcode::OPEN_FILE => Ok(Call::OpenFile(header_ref(frame)?)),
        opcode::CLOSE_FILE => Ok(Call::CloseFile(header_ref(frame)?)),
        opcode::SYNC_FILE => Ok(Call::SyncFile(header_ref(frame)?)),
        opcode::WRITE_DARRAY_MULTI => Ok(Call::WriteDarrayMulti(header_ref(frame)?)),
        opcode::READ_DARRAY => Ok(Call::ReadDarray(header_ref(frame)?)),
        opcode::SET_FRAME => Ok(Call::SetFrame(header_ref(frame)?)),
        opcode::ADVANCE_FRAME => Ok(Call::AdvanceFrame(header_ref(frame)?)),
        opcode::EXIT => Ok(Call::Exit(header_ref(frame)?)),
        _ => Err(CallValidationError::InvalidOpcode(actual)),
    }
}

#[cfg(test)]
mod test {
    use zerocopy::byteorder::network_endian::{U32, U64};

    use super::*;

    #[test]
    fn frames_carry_their_header() {
        let frame = encode(&SetFrame {
            file: U32::new(3),
            var: U32::new(7),
            frame: U64::new(42),
        });
        assert_eq!(frame[0], opcode::SET_FRAME);
        assert_eq!(frame.len(), 1 + 16);

        match validate(&frame, opcode::SET_FRAME).unwrap() {
            Call::SetFrame(header) => {
                assert_eq!(header.file.get(), 3);
                assert_eq!(header.var.get(), 7);
                assert_eq!(header.frame.get(), 42);
            }
            call => panic!("unexpected call {call:?}"),
        }

        let exit = encode(&Exit {});
        assert!(matches!(validate(&exit, opcode::EXIT), Ok(Call::Exit(_))));
    }

    #[test]
    fn malformed_frames_are_rejected() {
        let frame = encode(&CloseFile { file: U32::new(1) });

        assert_eq!(
            validate(&frame, opcode::SYNC_FILE).unwrap_err(),
            CallValidationError::OpcodeMismatch {
                expected: opcode::SYNC_FILE,
                actual: opcode::CLOSE_FILE
            }
        );
        assert_eq!(
            validate(&frame[..3], opcode::CLOSE_FILE).unwrap_err(),
            CallValidationError::InvalidFrameSize {
                expected: 5,
                actual: 3
            }
        );
        assert_eq!(
            validate(&[77], 77).unwrap_err(),
            CallValidationError::InvalidOpcode(77)
        );
        assert!(validate(&[], opcode::EXIT).is_err());

        let err: TransportError = CallValidationError::InvalidOpcode(0).into();
        assert!(matches!(err, TransportError::Malformed(_)));
    }
}
