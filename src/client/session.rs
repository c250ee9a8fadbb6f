//! Caller-facing handles returned by the HA manager

use std::fmt;

use bytes::Bytes;

use super::Connection;
use crate::error::{Error, Result};
use crate::ha::endpoint::{Endpoint, Role};
use crate::protocol::RespValue;

/// A connection to one database on the node the manager selected
pub struct Db {
    role: Role,
    conn: Box<dyn Connection>,
}

impl fmt::Debug for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Db")
            .field("endpoint", self.endpoint())
            .field("role", &self.role)
            .field("db", &self.db_index())
            .finish()
    }
}

impl Db {
    pub fn new(role: Role, conn: Box<dyn Connection>) -> Self {
        Self { role, conn }
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.conn.endpoint()
    }

    /// Role of the node at selection time
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn db_index(&self) -> usize {
        self.conn.db_index()
    }

    /// Run one command; an error reply becomes `Error::Server`
    pub async fn execute<A: AsRef<[u8]>>(&mut self, args: &[A]) -> Result<RespValue> {
        let args: Vec<Bytes> = args
            .iter()
            .map(|a| Bytes::copy_from_slice(a.as_ref()))
            .collect();
        match self.conn.execute(&args).await? {
            RespValue::Error(e) => Err(Error::Server(String::from_utf8_lossy(&e).into_owned())),
            reply => Ok(reply),
        }
    }

    pub fn into_connection(self) -> Box<dyn Connection> {
        self.conn
    }
}

/// Queues commands and sends them in one round trip
pub struct Pipeline {
    db: Db,
    queue: Vec<Vec<Bytes>>,
}

impl Pipeline {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            queue: Vec::new(),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.db.endpoint()
    }

    pub fn add<A: AsRef<[u8]>>(&mut self, args: &[A]) -> &mut Self {
        self.queue.push(
            args.iter()
                .map(|a| Bytes::copy_from_slice(a.as_ref()))
                .collect(),
        );
        self
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Send every queued command; replies come back in queue order and
    /// error replies stay in place as `RespValue::Error`
    pub async fn execute(&mut self) -> Result<Vec<RespValue>> {
        if self.queue.is_empty() {
            return Ok(Vec::new());
        }
        let commands = std::mem::take(&mut self.queue);
        self.db.conn.execute_batch(&commands).await
    }
}

/// MULTI / EXEC framed pipeline
pub struct Transaction {
    pipeline: Pipeline,
}

impl Transaction {
    pub fn new(db: Db) -> Self {
        Self {
            pipeline: Pipeline::new(db),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.pipeline.endpoint()
    }

    pub fn add<A: AsRef<[u8]>>(&mut self, args: &[A]) -> &mut Self {
        self.pipeline.add(args);
        self
    }

    /// Drop every queued command without sending anything
    pub fn discard(&mut self) {
        self.pipeline.queue.clear();
    }

    /// Send `MULTI`, the queued commands and `EXEC`; returns the EXEC reply
    /// items. A null EXEC reply (aborted by WATCH) yields an empty vector.
    pub async fn execute(&mut self) -> Result<Vec<RespValue>> {
        if self.pipeline.is_empty() {
            return Ok(Vec::new());
        }

        let mut commands = Vec::with_capacity(self.pipeline.len() + 2);
        commands.push(vec![Bytes::from_static(b"MULTI")]);
        commands.append(&mut self.pipeline.queue);
        commands.push(vec![Bytes::from_static(b"EXEC")]);

        let mut replies = self.pipeline.db.conn.execute_batch(&commands).await?;

        if let Some(RespValue::Error(e)) = replies.first() {
            return Err(Error::Server(String::from_utf8_lossy(e).into_owned()));
        }

        match replies.pop() {
            Some(RespValue::Array(items)) => Ok(items),
            Some(RespValue::Null) => Ok(Vec::new()),
            Some(RespValue::Error(e)) => {
                Err(Error::Server(String::from_utf8_lossy(&e).into_owned()))
            }
            Some(other) => Err(Error::Protocol(format!(
                "unexpected EXEC reply type {}",
                other.type_name()
            ))),
            None => Err(Error::Protocol("missing EXEC reply".into())),
        }
    }
}
