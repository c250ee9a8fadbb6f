use bytes::{Buf, Bytes, BytesMut};

use super::types::RespValue;
use crate::error::{Error, Result};

/// Incremental RESP reply parser
pub struct Parser;

impl Parser {
    /// Parse a complete RESP value from buffer.
    /// Returns None if buffer doesn't contain a complete message.
    /// Advances buffer past the parsed data.
    #[inline]
    pub fn parse(buf: &mut BytesMut) -> Result<Option<RespValue>> {
        if buf.is_empty() {
            return Ok(None);
        }

        match Self::parse_value(buf)? {
            Some((value, consumed)) => {
                buf.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Parse value, returning (value, bytes_consumed) or None if incomplete
    fn parse_value(buf: &[u8]) -> Result<Option<(RespValue, usize)>> {
        if buf.is_empty() {
            return Ok(None);
        }

        match buf[0] {
            b'+' => Self::parse_line(buf, RespValue::SimpleString),
            b'-' => Self::parse_line(buf, RespValue::Error),
            b':' => Self::parse_integer(buf),
            b'$' => Self::parse_bulk_string(buf),
            b'*' | b'>' => Self::parse_array(buf),
            b'_' => match Self::find_crlf(buf) {
                Some(pos) => Ok(Some((RespValue::Null, pos + 2))),
                None => Ok(None),
            },
            other => Err(Error::Protocol(format!(
                "unexpected reply type byte '{}'",
                other as char
            ))),
        }
    }

    /// Find \r\n in buffer, return position of \r
    #[inline]
    fn find_crlf(buf: &[u8]) -> Option<usize> {
        memchr::memchr(b'\r', buf).and_then(|pos| {
            if pos + 1 < buf.len() && buf[pos + 1] == b'\n' {
                Some(pos)
            } else {
                None
            }
        })
    }

    fn parse_line(
        buf: &[u8],
        ctor: fn(Bytes) -> RespValue,
    ) -> Result<Option<(RespValue, usize)>> {
        match Self::find_crlf(buf) {
            Some(pos) => {
                let s = Bytes::copy_from_slice(&buf[1..pos]);
                Ok(Some((ctor(s), pos + 2)))
            }
            None => Ok(None),
        }
    }

    fn parse_length(buf: &[u8], crlf_pos: usize, what: &str) -> Result<i64> {
        std::str::from_utf8(&buf[1..crlf_pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Protocol(format!("invalid {}", what)))
    }

    fn parse_integer(buf: &[u8]) -> Result<Option<(RespValue, usize)>> {
        match Self::find_crlf(buf) {
            Some(pos) => {
                let n = Self::parse_length(buf, pos, "integer")?;
                Ok(Some((RespValue::Integer(n), pos + 2)))
            }
            None => Ok(None),
        }
    }

    fn parse_bulk_string(buf: &[u8]) -> Result<Option<(RespValue, usize)>> {
        let crlf_pos = match Self::find_crlf(buf) {
            Some(pos) => pos,
            None => return Ok(None),
        };

        let len = Self::parse_length(buf, crlf_pos, "bulk length")?;
        if len < 0 {
            return Ok(Some((RespValue::Null, crlf_pos + 2)));
        }

        let len = len as usize;
        let data_start = crlf_pos + 2;
        let data_end = data_start + len;
        let total_len = data_end + 2; // +2 for trailing \r\n

        if buf.len() < total_len {
            return Ok(None);
        }

        let data = Bytes::copy_from_slice(&buf[data_start..data_end]);
        Ok(Some((RespValue::BulkString(data), total_len)))
    }

    fn parse_array(buf: &[u8]) -> Result<Option<(RespValue, usize)>> {
        let crlf_pos = match Self::find_crlf(buf) {
            Some(pos) => pos,
            None => return Ok(None),
        };

        let len = Self::parse_length(buf, crlf_pos, "array length")?;
        if len < 0 {
            return Ok(Some((RespValue::Null, crlf_pos + 2)));
        }

        let len = len as usize;
        let mut items = Vec::with_capacity(len.min(1024));
        let mut offset = crlf_pos + 2;

        for _ in 0..len {
            match Self::parse_value(&buf[offset..])? {
                Some((value, consumed)) => {
                    items.push(value);
                    offset += consumed;
                }
                None => return Ok(None),
            }
        }

        Ok(Some((RespValue::Array(items), offset)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_role_reply() {
        let mut buf = BytesMut::from(
            &b"*3\r\n$6\r\nmaster\r\n:3129659\r\n*1\r\n*3\r\n$9\r\n127.0.0.1\r\n$4\r\n9001\r\n$7\r\n3129242\r\n"[..],
        );
        let value = Parser::parse(&mut buf).unwrap().unwrap();
        let items = value.as_array().unwrap();
        assert_eq!(items[0].as_str(), Some("master"));
        assert_eq!(items[1].as_int(), Some(3129659));
        let replica = items[2].as_array().unwrap()[0].as_array().unwrap();
        assert_eq!(replica[0].as_str(), Some("127.0.0.1"));
        assert_eq!(replica[1].as_int(), Some(9001));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_incomplete_keeps_buffer() {
        let mut buf = BytesMut::from(&b"*2\r\n$7\r\nmessage\r\n$5\r\nhel"[..]);
        assert!(Parser::parse(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 24);

        buf.extend_from_slice(b"lo\r\n");
        let value = Parser::parse(&mut buf).unwrap().unwrap();
        assert_eq!(value.as_array().unwrap()[1].as_str(), Some("hello"));
    }

    #[test]
    fn test_null_and_errors() {
        let mut buf = BytesMut::from(&b"$-1\r\n*-1\r\n-ERR unknown command\r\n"[..]);
        assert_eq!(Parser::parse(&mut buf).unwrap(), Some(RespValue::Null));
        assert_eq!(Parser::parse(&mut buf).unwrap(), Some(RespValue::Null));
        let err = Parser::parse(&mut buf).unwrap().unwrap();
        assert_eq!(err.error_message().as_deref(), Some("ERR unknown command"));
    }

    #[test]
    fn test_invalid_type_byte() {
        let mut buf = BytesMut::from(&b"?oops\r\n"[..]);
        assert!(matches!(Parser::parse(&mut buf), Err(Error::Protocol(_))));
    }
}
