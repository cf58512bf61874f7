//! AMF0 value encoding (the subset RTMP commands and onMetaData use).

use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ServerError, ServerResult};

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;

/// One AMF0 value.
#[derive(Debug, Clone, PartialEq)]
pub enum Amf0Value {
    Number(f64),
    Boolean(bool),
    String(String),
    Object(Vec<(String, Amf0Value)>),
    EcmaArray(Vec<(String, Amf0Value)>),
    Null,
    Undefined,
}

impl Amf0Value {
    /// The value as a number, if it is one.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The value as a string, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Looks up a property of an object or ECMA array.
    pub fn get(&self, key: &str) -> Option<&Amf0Value> {
        match self {
            Self::Object(props) | Self::EcmaArray(props) => {
                props.iter().find(|(k, _)| k == key).map(|(_, v)| v)
            }
            _ => None,
        }
    }

    /// Serializes the value.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::Number(n) => {
                buf.put_u8(MARKER_NUMBER);
                buf.put_f64(*n);
            }
            Self::Boolean(b) => {
                buf.put_u8(MARKER_BOOLEAN);
                buf.put_u8(u8::from(*b));
            }
            Self::String(s) => {
                buf.put_u8(MARKER_STRING);
                put_utf8(buf, s);
            }
            Self::Object(props) => {
                buf.put_u8(MARKER_OBJECT);
                encode_props(buf, props);
            }
            Self::EcmaArray(props) => {
                buf.put_u8(MARKER_ECMA_ARRAY);
                buf.put_u32(props.len() as u32);
                encode_props(buf, props);
            }
            Self::Null => buf.put_u8(MARKER_NULL),
            Self::Undefined => buf.put_u8(MARKER_UNDEFINED),
        }
    }

    /// Serializes a sequence of values into one buffer.
    pub fn encode_all(values: &[Amf0Value]) -> Bytes {
        let mut buf = BytesMut::new();
        for value in values {
            value.encode(&mut buf);
        }
        buf.freeze()
    }

    /// Decodes every value in the buffer.
    pub fn decode_all(data: &[u8]) -> ServerResult<VecDeque<Amf0Value>> {
        let mut reader = Reader { data, pos: 0 };
        let mut values = VecDeque::new();
        while reader.pos < data.len() {
            values.push_back(reader.read_value()?);
        }
        Ok(values)
    }
}

fn put_utf8(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn encode_props(buf: &mut BytesMut, props: &[(String, Amf0Value)]) {
    for (key, value) in props {
        put_utf8(buf, key);
        value.encode(buf);
    }
    buf.put_u16(0);
    buf.put_u8(MARKER_OBJECT_END);
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn need(&self, n: usize) -> ServerResult<()> {
        if self.pos + n > self.data.len() {
            return Err(ServerError::Protocol(format!(
                "amf0 truncated at {} of {}",
                self.pos,
                self.data.len()
            )));
        }
        Ok(())
    }

    fn read_u8(&mut self) -> ServerResult<u8> {
        self.need(1)?;
        let b = self.data[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> ServerResult<u16> {
        self.need(2)?;
        let v = u16::from_be_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    fn read_u32(&mut self) -> ServerResult<u32> {
        self.need(4)?;
        let v = u32::from_be_bytes([
            self.data[self.pos],
            self.data[self.pos + 1],
            self.data[self.pos + 2],
            self.data[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(v)
    }

    fn read_f64(&mut self) -> ServerResult<f64> {
        self.need(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.data[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(f64::from_be_bytes(bytes))
    }

    fn read_utf8(&mut self) -> ServerResult<String> {
        let len = self.read_u16()? as usize;
        self.need(len)?;
        let s = String::from_utf8_lossy(&self.data[self.pos..self.pos + len]).into_owned();
        self.pos += len;
        Ok(s)
    }

    fn read_props(&mut self) -> ServerResult<Vec<(String, Amf0Value)>> {
        let mut props = Vec::new();
        loop {
            let key = self.read_utf8()?;
            if key.is_empty() {
                let end = self.read_u8()?;
                if end != MARKER_OBJECT_END {
                    return Err(ServerError::Protocol(format!(
                        "amf0 expected object end, got {:#04x}",
                        end
                    )));
                }
                return Ok(props);
            }
            let value = self.read_value()?;
            props.push((key, value));
        }
    }

    fn read_value(&mut self) -> ServerResult<Amf0Value> {
        let marker = self.read_u8()?;
        match marker {
            MARKER_NUMBER => Ok(Amf0Value::Number(self.read_f64()?)),
            MARKER_BOOLEAN => Ok(Amf0Value::Boolean(self.read_u8()? != 0)),
            MARKER_STRING => Ok(Amf0Value::String(self.read_utf8()?)),
            MARKER_OBJECT => Ok(Amf0Value::Object(self.read_props()?)),
            MARKER_ECMA_ARRAY => {
                let _count = self.read_u32()?;
                Ok(Amf0Value::EcmaArray(self.read_props()?))
            }
            MARKER_NULL => Ok(Amf0Value::Null),
            MARKER_UNDEFINED => Ok(Amf0Value::Undefined),
            other => Err(ServerError::Protocol(format!(
                "amf0 unsupported marker {:#04x}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: Amf0Value) -> Amf0Value {
        let wire = Amf0Value::encode_all(std::slice::from_ref(&value));
        let mut decoded = Amf0Value::decode_all(&wire).unwrap();
        assert_eq!(decoded.len(), 1);
        decoded.pop_front().unwrap()
    }

    #[test]
    fn scalar_round_trips() {
        assert_eq!(round_trip(Amf0Value::Number(1935.0)), Amf0Value::Number(1935.0));
        assert_eq!(round_trip(Amf0Value::Boolean(true)), Amf0Value::Boolean(true));
        assert_eq!(
            round_trip(Amf0Value::String("connect".into())),
            Amf0Value::String("connect".into())
        );
        assert_eq!(round_trip(Amf0Value::Null), Amf0Value::Null);
    }

    #[test]
    fn object_round_trips_and_is_queryable() {
        let obj = Amf0Value::Object(vec![
            ("app".into(), Amf0Value::String("live".into())),
            ("tcUrl".into(), Amf0Value::String("rtmp://h/live".into())),
            ("fpad".into(), Amf0Value::Boolean(false)),
        ]);
        let got = round_trip(obj);
        assert_eq!(got.get("app").and_then(Amf0Value::as_str), Some("live"));
        assert_eq!(got.get("missing"), None);
    }

    #[test]
    fn ecma_array_round_trips() {
        let arr = Amf0Value::EcmaArray(vec![
            ("duration".into(), Amf0Value::Number(0.0)),
            ("width".into(), Amf0Value::Number(1920.0)),
        ]);
        let got = round_trip(arr);
        assert_eq!(got.get("width").and_then(Amf0Value::as_number), Some(1920.0));
    }

    #[test]
    fn command_sequence_decodes() {
        let wire = Amf0Value::encode_all(&[
            Amf0Value::String("publish".into()),
            Amf0Value::Number(5.0),
            Amf0Value::Null,
            Amf0Value::String("livestream".into()),
            Amf0Value::String("live".into()),
        ]);
        let decoded = Amf0Value::decode_all(&wire).unwrap();
        assert_eq!(decoded.len(), 5);
        assert_eq!(decoded[0].as_str(), Some("publish"));
        assert_eq!(decoded[1].as_number(), Some(5.0));
    }

    #[test]
    fn truncated_input_is_rejected() {
        let wire = Amf0Value::encode_all(&[Amf0Value::String("connect".into())]);
        assert!(Amf0Value::decode_all(&wire[..wire.len() - 2]).is_err());
    }
}
