//! Webspace RPC client
//!
//! Every call opens its own connection by default and closes it when the
//! reply has been read. Callers that need several calls over one stream
//! take a [`Connection`] from [`RpcClient::connect`]; it closes on drop.

use crate::backend::{ContainerConfig, ContainerStatus, Image};
use crate::daemon::config::DEFAULT_SOCKET;
use crate::daemon::protocol::{read_message, write_message, Call, Message, MessageId};
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::io;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Client for the webspace daemon
#[derive(Debug, Clone)]
pub struct RpcClient {
    socket_path: PathBuf,
    user: Option<String>,
    timeout: Option<Duration>,
}

impl Default for RpcClient {
    fn default() -> Self {
        Self::new(DEFAULT_SOCKET)
    }
}

impl RpcClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            user: None,
            timeout: None,
        }
    }

    /// Ask the daemon to act as `user` (honoured for administrators only)
    pub fn impersonating(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    /// Give up on a connection that stalls for longer than `timeout`
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Open a connection that stays up until dropped
    pub fn connect(&self) -> Result<Connection> {
        let stream = UnixStream::connect(&self.socket_path).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("Failed to connect to daemon at {}: {}", self.socket_path.display(), e),
            )
        })?;
        stream.set_read_timeout(self.timeout)?;
        stream.set_write_timeout(self.timeout)?;
        Ok(Connection {
            stream,
            user: self.user.clone(),
            message_id: 0,
        })
    }

    /// One call on a fresh connection
    pub fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.connect()?.call(method, args)
    }

    fn call_as<T: DeserializeOwned>(&self, method: &str, args: Vec<Value>) -> Result<T> {
        let value = self.call(method, args)?;
        serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("Unexpected result from {}: {}", method, e)))
    }

    fn call_unit(&self, method: &str, args: Vec<Value>) -> Result<()> {
        self.call(method, args).map(|_| ())
    }

    pub fn images(&self) -> Result<Vec<Image>> {
        self.call_as("images", vec![])
    }

    pub fn init(&self, fingerprint: &str) -> Result<()> {
        self.call_unit("init", vec![json!(fingerprint)])
    }

    pub fn status(&self) -> Result<ContainerStatus> {
        self.call_as("status", vec![])
    }

    pub fn log(&self) -> Result<String> {
        self.call_as("log", vec![])
    }

    /// Open a console session; returns the socket to attach to
    pub fn console(&self, width: u16, height: u16) -> Result<PathBuf> {
        let path: String = self.call_as("console", vec![json!(width), json!(height)])?;
        Ok(PathBuf::from(path))
    }

    pub fn console_resize(&self, session: &Path, width: u16, height: u16) -> Result<()> {
        self.call_unit(
            "console_resize",
            vec![json!(session.to_string_lossy()), json!(width), json!(height)],
        )
    }

    pub fn shutdown(&self) -> Result<()> {
        self.call_unit("shutdown", vec![])
    }

    pub fn reboot(&self) -> Result<()> {
        self.call_unit("reboot", vec![])
    }

    pub fn delete(&self) -> Result<()> {
        self.call_unit("delete", vec![])
    }

    pub fn get_config(&self) -> Result<ContainerConfig> {
        self.call_as("get_config", vec![])
    }

    pub fn set_option(&self, key: &str, value: &str) -> Result<()> {
        self.call_unit("set_option", vec![json!(key), json!(value)])
    }

    pub fn unset_option(&self, key: &str) -> Result<()> {
        self.call_unit("unset_option", vec![json!(key)])
    }
}

/// An open connection to the daemon
pub struct Connection {
    stream: UnixStream,
    user: Option<String>,
    message_id: MessageId,
}

impl Connection {
    /// Send one call and wait for its reply
    pub fn call(&mut self, method: &str, args: Vec<Value>) -> Result<Value> {
        let msg_id = self.next_message_id();
        let call = Call::new(method, args).impersonating(self.user.clone());
        write_message(&mut self.stream, &Message::Call(call), msg_id)?;

        let (response, response_id) = read_message(&mut self.stream)?;
        if response_id != msg_id {
            return Err(Error::Protocol(format!(
                "Reply id {} does not match call id {}",
                response_id, msg_id
            )));
        }

        match response {
            Message::Reply(reply) => reply.into_result(),
            Message::Call(_) => Err(Error::Protocol("Unexpected call from daemon".to_string())),
        }
    }

    fn next_message_id(&mut self) -> MessageId {
        let id = self.message_id;
        self.message_id = self.message_id.wrapping_add(1);
        id
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
