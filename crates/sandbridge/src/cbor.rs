//! CBOR codec shared by wire values and channel frames.

use std::convert::Infallible;
use std::io::{self, Write};

use bytes::{Bytes, BytesMut};
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::{
    error::TransportError,
    protocol::{Envelope, PROTOCOL_VERSION},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("JSON serialization error")]
    Json(#[from] serde_json::Error),
    #[error("CBOR decode error")]
    CborDecode(#[from] minicbor_serde::error::DecodeError),
    #[error("CBOR encode error")]
    CborEncode(#[from] minicbor_serde::error::EncodeError<std::convert::Infallible>),
    #[error("UTF-8 encoding error")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

struct Base64Formatter;

impl serde_json::ser::Formatter for Base64Formatter {
    fn write_byte_array<W>(&mut self, mut writer: &mut W, value: &[u8]) -> io::Result<()>
    where
        W: io::Write + ?Sized,
    {
        writer.write_all(b"\"")?;
        base64::write::EncoderWriter::new(&mut writer, &base64::engine::general_purpose::STANDARD)
            .write_all(value)?;
        writer.write_all(b"\"")
    }
}

/// Convert JSON string to CBOR bytes.
///
/// # Errors
/// Returns error if JSON parsing or CBOR serialization fails.
pub fn json_to_cbor(json: &str) -> Result<Bytes, Error> {
    let mut serializer = minicbor_serde::Serializer::new(CborBytesMut::default());
    serde_transcode::Transcoder::new(&mut serde_json::Deserializer::from_str(json))
        .serialize(serializer.serialize_unit_as_null(true))?;
    Ok(serializer.into_encoder().into_writer().freeze())
}

/// Convert CBOR bytes to JSON string. Byte strings become base64 text.
///
/// # Errors
/// Returns error if CBOR parsing or JSON serialization fails.
pub fn cbor_to_json(cbor: &[u8]) -> Result<String, Error> {
    let mut o = vec![];
    serde_transcode::Transcoder::new(&mut minicbor_serde::Deserializer::new(cbor)).serialize(
        &mut serde_json::Serializer::with_formatter(&mut o, Base64Formatter),
    )?;
    Ok(String::from_utf8(o)?)
}

/// Serialize any serializable value to CBOR bytes.
///
/// # Errors
/// Returns error if serialization fails.
pub fn to_cbor<T: Serialize + ?Sized>(value: &T) -> Result<Bytes, Error> {
    let mut serializer = minicbor_serde::Serializer::new(CborBytesMut::default());
    value.serialize(serializer.serialize_unit_as_null(true))?;
    Ok(serializer.into_encoder().into_writer().freeze())
}

/// Deserialize CBOR bytes to any deserializable type.
///
/// # Errors
/// Returns error if deserialization fails.
pub fn from_cbor<T: DeserializeOwned>(cbor: &[u8]) -> Result<T, Error> {
    let mut deserializer = minicbor_serde::Deserializer::new(cbor);
    Ok(T::deserialize(&mut deserializer)?)
}

/// Encode a channel frame.
///
/// # Errors
/// Returns [`TransportError::Malformed`] if the envelope cannot be encoded.
pub fn encode_frame<T: Serialize>(envelope: &Envelope<T>) -> Result<Bytes, TransportError> {
    to_cbor(envelope).map_err(|e| TransportError::Malformed(format!("encode frame: {e}")))
}

/// Decode a channel frame and check its protocol version.
///
/// # Errors
/// Returns [`TransportError::Malformed`] for undecodable bytes and
/// [`TransportError::VersionMismatch`] for frames from another protocol
/// version.
pub fn decode_frame<T: DeserializeOwned>(frame: &[u8]) -> Result<Envelope<T>, TransportError> {
    let envelope: Envelope<T> =
        from_cbor(frame).map_err(|e| TransportError::Malformed(format!("decode frame: {e}")))?;
    if envelope.version != PROTOCOL_VERSION {
        return Err(TransportError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            actual: envelope.version,
        });
    }
    Ok(envelope)
}

struct CborBytesMut(BytesMut);

impl CborBytesMut {
    fn freeze(self) -> Bytes {
        self.0.freeze()
    }
}

impl Default for CborBytesMut {
    fn default() -> Self {
        Self(BytesMut::new())
    }
}

impl minicbor::encode::Write for CborBytesMut {
    type Error = Infallible;

    fn write_all(&mut self, buf: &[u8]) -> Result<(), Self::Error> {
        self.0.extend_from_slice(buf);
        Ok(())
    }
}
