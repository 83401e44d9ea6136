use zerocopy::{byteorder::network_endian::*, AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::error::TransportError;

pub type Opcode = u8;

pub mod opcode {
    use super::Opcode;

    pub const DEFINE_DESCRIPTOR: Opcode = 1;
    pub const FREE_DESCRIPTOR: Opcode = 2;
    pub const OPEN_FILE: Opcode = 3;
    pub const CLOSE_FILE: Opcode = 4;
    pub const SYNC_FILE: Opcode = 5;
    pub const WRITE_DARRAY_MULTI: Opcode = 6;
    pub const READ_DARRAY: Opcode = 7;
    pub const SET_FRAME: Opcode = 8;
    pub const ADVANCE_FRAME: Opcode = 9;
    pub const EXIT: Opcode = 255;
}

/// The fixed-size argument block of a forwarded call.
///
/// An argument frame is the opcode byte followed by the header. Payloads of
/// variable length travel as separate messages, each preceded by a message
/// holding its length.
pub trait CallHeader: AsBytes + FromBytes + FromZeroes + Unaligned {
    fn opcode() -> Opcode;
}

macro_rules! impl_call_header {
    ($call:ident) => {
        paste::paste! {
            impl CallHeader for $call {
                fn opcode() -> Opcode {
                    opcode::[< $call:snake:upper >]
                }
            }
        }
    };
}

#[derive(Debug, FromBytes, AsBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct DefineDescriptor {
    pub descriptor: U32,
    pub element: u8,
    pub ndims: U16,
    pub tasks: U32,
    pub fill_tasks: U32,
    pub needs_fill: u8,
}
impl_call_header!(DefineDescriptor);

#[derive(Debug, FromBytes, AsBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct FreeDescriptor {
    pub descriptor: U32,
}
impl_call_header!(FreeDescriptor);

#[derive(Debug, FromBytes, AsBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct OpenFile {
    pub file: U32,
    pub writable: u8,
}
impl_call_header!(OpenFile);

#[derive(Debug, FromBytes, AsBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct CloseFile {
    pub file: U32,
}
impl_call_header!(CloseFile);

#[derive(Debug, FromBytes, AsBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct SyncFile {
    pub file: U32,
}
impl_call_header!(SyncFile);

#[derive(Debug, FromBytes, AsBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct WriteDarrayMulti {
    pub file: U32,
    pub descriptor: U32,
    pub nvars: U32,
    pub flush_to_disk: u8,
    pub fill_present: u8,
}
impl_call_header!(WriteDarrayMulti);

#[derive(Debug, FromBytes, AsBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct ReadDarray {
    pub file: U32,
    pub descriptor: U32,
    pub var: U32,
}
impl_call_header!(ReadDarray);

#[derive(Debug, FromBytes, AsBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct SetFrame {
    pub file: U32,
    pub var: U32,
    pub frame: U64,
}
impl_call_header!(SetFrame);

#[derive(Debug, FromBytes, AsBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct AdvanceFrame {
    pub file: U32,
    pub var: U32,
}
impl_call_header!(AdvanceFrame);

#[derive(Debug, FromBytes, AsBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct Exit {}
impl_call_header!(Exit);

pub fn encode_u64(value: u64) -> Vec<u8> {
    U64::new(value).as_bytes().to_vec()
}

pub fn decode_u64(bytes: &[u8]) -> Result<u64, TransportError> {
    U64::read_from(bytes)
        .map(U64::get)
        .ok_or(TransportError::Malformed("expected a single u64"))
}

pub fn encode_i32(value: i32) -> Vec<u8> {
    I32::new(value).as_bytes().to_vec()
}

pub fn decode_i32(bytes: &[u8]) -> Result<i32, TransportError> {
    I32::read_from(bytes)
        .map(I32::get)
        .ok_or(TransportError::Malformed("expected a single i32"))
}

pub fn encode_u64s(values: impl IntoIterator<Item = u64>) -> Vec<u8> {
    let values: Vec<U64> = values.into_iter().map(U64::new).collect();
    values.as_bytes().to_vec()
}

pub fn decode_u64s(bytes: &[u8]) -> Result<Vec<u64>, TransportError> {
    U64::slice_from(bytes)
        .map(|values| values.iter().map(|v| v.get()).collect())
        .ok_or(TransportError::Malformed("expected a list of u64"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn call_headers_map_to_opcodes() {
        assert_eq!(WriteDarrayMulti::opcode(), opcode::WRITE_DARRAY_MULTI);
        assert_eq!(DefineDescriptor::opcode(), opcode::DEFINE_DESCRIPTOR);
        assert_eq!(Exit::opcode(), opcode::EXIT);
    }

    #[test]
    fn u64_lists_reject_ragged_input() {
        let bytes = encode_u64s([1, 2, u64::MAX]);
        assert_eq!(decode_u64s(&bytes).unwrap(), vec![1, 2, u64::MAX]);
        assert!(decode_u64s(&bytes[..7]).is_err());
        assert!(decode_u64(&bytes).is_err());
        assert_eq!(decode_i32(&encode_i32(-36)).unwrap(), -36);
    }
}
