use bytes::{BufMut, Bytes, BytesMut};

/// RESP2 reply types as seen from the client side
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Simple string: +OK\r\n
    SimpleString(Bytes),
    /// Error: -ERR message\r\n
    Error(Bytes),
    /// Integer: :1000\r\n
    Integer(i64),
    /// Bulk string: $5\r\nhello\r\n
    BulkString(Bytes),
    /// Null bulk string or null array: $-1\r\n / *-1\r\n
    Null,
    /// Array: *2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n
    Array(Vec<RespValue>),
}

impl RespValue {
    #[inline]
    pub fn simple(s: &str) -> Self {
        Self::SimpleString(Bytes::copy_from_slice(s.as_bytes()))
    }

    #[inline]
    pub fn error(msg: &str) -> Self {
        Self::Error(Bytes::copy_from_slice(msg.as_bytes()))
    }

    #[inline]
    pub fn bulk_string(s: &str) -> Self {
        Self::BulkString(Bytes::copy_from_slice(s.as_bytes()))
    }

    #[inline]
    pub fn array(items: Vec<RespValue>) -> Self {
        Self::Array(items)
    }

    /// Simple or bulk string contents as UTF-8
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::BulkString(b) | RespValue::SimpleString(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Try to interpret as integer
    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            RespValue::Integer(n) => Some(*n),
            RespValue::BulkString(b) | RespValue::SimpleString(b) => {
                std::str::from_utf8(b).ok()?.parse().ok()
            }
            _ => None,
        }
    }

    #[inline]
    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            RespValue::Array(items) => Some(items),
            _ => None,
        }
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// Error message of an error reply
    pub fn error_message(&self) -> Option<String> {
        match self {
            RespValue::Error(e) => Some(String::from_utf8_lossy(e).into_owned()),
            _ => None,
        }
    }

    /// Name of the reply type, for diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            RespValue::SimpleString(_) => "simple-string",
            RespValue::Error(_) => "error",
            RespValue::Integer(_) => "integer",
            RespValue::BulkString(_) => "bulk-string",
            RespValue::Null => "null",
            RespValue::Array(_) => "array",
        }
    }

    /// Write to buffer in RESP2 format
    pub fn write_to(&self, buf: &mut BytesMut) {
        match self {
            RespValue::SimpleString(s) => {
                buf.put_u8(b'+');
                buf.extend_from_slice(s);
                buf.extend_from_slice(b"\r\n");
            }
            RespValue::Error(e) => {
                buf.put_u8(b'-');
                buf.extend_from_slice(e);
                buf.extend_from_slice(b"\r\n");
            }
            RespValue::Integer(n) => {
                buf.put_u8(b':');
                buf.extend_from_slice(itoa::Buffer::new().format(*n).as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            RespValue::BulkString(s) => {
                buf.put_u8(b'$');
                buf.extend_from_slice(itoa::Buffer::new().format(s.len()).as_bytes());
                buf.extend_from_slice(b"\r\n");
                buf.extend_from_slice(s);
                buf.extend_from_slice(b"\r\n");
            }
            RespValue::Null => buf.extend_from_slice(b"$-1\r\n"),
            RespValue::Array(items) => {
                buf.put_u8(b'*');
                buf.extend_from_slice(itoa::Buffer::new().format(items.len()).as_bytes());
                buf.extend_from_slice(b"\r\n");
                for item in items {
                    item.write_to(buf);
                }
            }
        }
    }

    /// Serialize to RESP wire format
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        self.write_to(&mut buf);
        buf.freeze()
    }
}

/// Encode a command as a RESP array of bulk strings
pub fn encode_command<A: AsRef<[u8]>>(args: &[A]) -> Bytes {
    let mut buf = BytesMut::with_capacity(16 + args.len() * 16);
    write_command(&mut buf, args);
    buf.freeze()
}

/// Append a command to an existing buffer (pipelining)
pub fn write_command<A: AsRef<[u8]>>(buf: &mut BytesMut, args: &[A]) {
    buf.put_u8(b'*');
    buf.extend_from_slice(itoa::Buffer::new().format(args.len()).as_bytes());
    buf.extend_from_slice(b"\r\n");
    for arg in args {
        let arg = arg.as_ref();
        buf.put_u8(b'$');
        buf.extend_from_slice(itoa::Buffer::new().format(arg.len()).as_bytes());
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(arg);
        buf.extend_from_slice(b"\r\n");
    }
}
