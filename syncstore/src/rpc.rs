//! gRPC plumbing shared by the server and `RemoteNode`
//!
//! The `Raft` and `Blocks` services are generated at build time. Messages are
//! the crate's own serde types carried by a bincode codec, and an [`Error`]
//! travels in the status details so the caller gets back the exact failure.

use bytes::{Buf, BufMut, Bytes};
use serde::de::DeserializeOwned;
use serde_derive::{Deserialize, Serialize};
use std::marker::PhantomData;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::{Code, Status};

use crate::error::Error;
use crate::metadata::FileInfoMap;
use crate::raft::LogEntry;

/// Largest message either side accepts or sends.
pub const MAX_MESSAGE_SIZE: usize = 64 << 20;

/// Generated service definitions
#[allow(clippy::all)]
pub mod pb {
    include!(concat!(env!("OUT_DIR"), "/syncstore.Raft.rs"));
    include!(concat!(env!("OUT_DIR"), "/syncstore.Blocks.rs"));
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntriesReply {
    pub entries: Vec<LogEntry>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct VersionReply {
    pub version: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileInfoMapReply {
    pub files: FileInfoMap,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HashList {
    pub hashes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockHash {
    pub hash: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockData {
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub struct BincodeEncoder<T>(PhantomData<T>);

impl<T: serde::Serialize> Encoder for BincodeEncoder<T> {
    type Item = T;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        bincode::serialize_into(dst.writer(), &item).map_err(|e| Status::internal(e.to_string()))
    }
}

#[derive(Debug)]
pub struct BincodeDecoder<U>(PhantomData<U>);

impl<U: DeserializeOwned> Decoder for BincodeDecoder<U> {
    type Item = U;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        // a zero-sized message is a valid frame, so never report "no message"
        let frame = src.copy_to_bytes(src.remaining());
        bincode::deserialize(&frame)
            .map(Some)
            .map_err(|e| Status::invalid_argument(e.to_string()))
    }
}

/// Codec named by the generated services.
#[derive(Debug, Clone, Copy)]
pub struct BincodeCodec<T, U>(PhantomData<(T, U)>);

impl<T, U> Default for BincodeCodec<T, U> {
    fn default() -> Self {
        BincodeCodec(PhantomData)
    }
}

impl<T, U> Codec for BincodeCodec<T, U>
where
    T: serde::Serialize + Send + 'static,
    U: DeserializeOwned + Send + 'static,
{
    type Encode = T;
    type Decode = U;
    type Encoder = BincodeEncoder<T>;
    type Decoder = BincodeDecoder<U>;

    fn encoder(&mut self) -> Self::Encoder {
        BincodeEncoder(PhantomData)
    }

    fn decoder(&mut self) -> Self::Decoder {
        BincodeDecoder(PhantomData)
    }
}

fn status_code(e: &Error) -> Code {
    match e {
        Error::Unavailable(_) => Code::Unavailable,
        Error::NotLeader
        | Error::StaleTerm { .. }
        | Error::LogMismatch { .. }
        | Error::StaleLog { .. } => Code::FailedPrecondition,
        Error::VersionConflict(_) => Code::Aborted,
        Error::MissingBlock(_) => Code::NotFound,
        Error::Config(_) => Code::InvalidArgument,
        Error::Io(_) | Error::Codec(_) => Code::Internal,
    }
}

impl From<Error> for Status {
    fn from(e: Error) -> Self {
        let code = status_code(&e);
        match bincode::serialize(&e) {
            Ok(details) => Status::with_details(code, e.to_string(), Bytes::from(details)),
            Err(_) => Status::new(code, e.to_string()),
        }
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        if !status.details().is_empty() {
            if let Ok(e) = bincode::deserialize::<Error>(status.details()) {
                return e;
            }
        }
        // no details: the status came from the transport, not from a handler
        match status.code() {
            Code::InvalidArgument | Code::Internal | Code::Unimplemented => {
                Error::Codec(status.message().to_string())
            }
            _ => Error::Unavailable(status.message().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::FileMetadata;

    #[test]
    fn handler_errors_survive_the_status() {
        let current = FileMetadata::new("a.txt", 3, vec!["h".to_string()]);
        let status = Status::from(Error::VersionConflict(Box::new(current.clone())));
        assert_eq!(status.code(), Code::Aborted);
        assert_eq!(Error::from(status), Error::VersionConflict(Box::new(current)));

        let status = Status::from(Error::NotLeader);
        assert_eq!(status.code(), Code::FailedPrecondition);
        assert_eq!(Error::from(status), Error::NotLeader);
    }

    #[test]
    fn transport_statuses_become_unavailable() {
        let err = Error::from(Status::unavailable("connection refused"));
        assert_eq!(err, Error::Unavailable("connection refused".to_string()));
        let err = Error::from(Status::deadline_exceeded("slow peer"));
        assert!(matches!(err, Error::Unavailable(_)));
        let err = Error::from(Status::internal("garbled frame"));
        assert!(matches!(err, Error::Codec(_)));
    }
}
