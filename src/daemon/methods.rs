//! Method table and the daemon's remote operations
//!
//! Handlers receive the call's [`AuthContext`] and positional JSON
//! arguments. Registration happens before the server starts; lookups are
//! read-only afterwards.

use crate::backend::Backend;
use crate::console::ConsoleRegistry;
use crate::daemon::auth::AuthContext;
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// A registered remote operation
pub type Handler = Box<dyn Fn(&AuthContext, &[Value]) -> Result<Value> + Send + Sync>;

/// Name → handler mapping consulted by the RPC server
#[derive(Default)]
pub struct MethodTable {
    handlers: HashMap<String, Handler>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous one
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(&AuthContext, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Box::new(handler));
    }

    /// Registered method names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run the handler registered under `name`
    pub fn dispatch(&self, ctx: &AuthContext, name: &str, args: &[Value]) -> Result<Value> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| Error::NoSuchMethod(name.to_string()))?;
        handler(ctx, args)
    }
}

/// Positional argument accessor
pub struct Args<'a> {
    method: &'a str,
    values: &'a [Value],
}

impl<'a> Args<'a> {
    pub fn new(method: &'a str, values: &'a [Value]) -> Self {
        Self { method, values }
    }

    /// Fail unless exactly `count` arguments were passed
    pub fn expect_len(&self, count: usize) -> Result<&Self> {
        if self.values.len() != count {
            return Err(Error::InvalidArgument(format!(
                "{} takes {} argument(s), got {}",
                self.method,
                count,
                self.values.len()
            )));
        }
        Ok(self)
    }

    /// Deserialize argument `index`
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        let value = self.values.get(index).ok_or_else(|| {
            Error::InvalidArgument(format!("{}: missing argument {}", self.method, index))
        })?;
        serde_json::from_value(value.clone()).map_err(|e| {
            Error::InvalidArgument(format!("{}: argument {}: {}", self.method, index, e))
        })
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| Error::Protocol(format!("Failed to encode result: {}", e)))
}

/// Register every webspace operation against `backend`
pub fn register_backend(
    table: &mut MethodTable,
    backend: Arc<dyn Backend>,
    consoles: Arc<ConsoleRegistry>,
) {
    let b = Arc::clone(&backend);
    table.register("images", move |_ctx, args| {
        Args::new("images", args).expect_len(0)?;
        to_value(b.list_images()?)
    });

    let b = Arc::clone(&backend);
    table.register("init", move |ctx, args| {
        let fingerprint: String = Args::new("init", args).expect_len(1)?.get(0)?;
        log::info!("{} creating container for {} from {}", ctx.caller, ctx.owner, fingerprint);
        b.create_container(&fingerprint, &ctx.owner)?;
        Ok(Value::Null)
    });

    let b = Arc::clone(&backend);
    table.register("status", move |ctx, args| {
        Args::new("status", args).expect_len(0)?;
        to_value(b.container_status(&ctx.owner)?)
    });

    let b = Arc::clone(&backend);
    table.register("log", move |ctx, args| {
        Args::new("log", args).expect_len(0)?;
        to_value(b.container_log(&ctx.owner)?)
    });

    let b = Arc::clone(&backend);
    let registry = Arc::clone(&consoles);
    table.register("console", move |ctx, args| {
        let args = Args::new("console", args);
        args.expect_len(2)?;
        let (width, height): (u16, u16) = (args.get(0)?, args.get(1)?);
        let session = registry.open(Arc::clone(&b), ctx, width, height)?;
        to_value(session.socket_path().to_string_lossy())
    });

    let registry = Arc::clone(&consoles);
    table.register("console_resize", move |ctx, args| {
        let args = Args::new("console_resize", args);
        args.expect_len(3)?;
        let path: String = args.get(0)?;
        let (width, height): (u16, u16) = (args.get(1)?, args.get(2)?);

        let session = registry
            .get(Path::new(&path))
            .filter(|s| s.owner() == ctx.owner)
            .ok_or_else(|| Error::InvalidState(format!("No open console session at {}", path)))?;
        session.resize(width, height)?;
        Ok(Value::Null)
    });

    let b = Arc::clone(&backend);
    table.register("shutdown", move |ctx, args| {
        Args::new("shutdown", args).expect_len(0)?;
        b.shutdown_container(&ctx.owner)?;
        Ok(Value::Null)
    });

    let b = Arc::clone(&backend);
    table.register("reboot", move |ctx, args| {
        Args::new("reboot", args).expect_len(0)?;
        b.reboot_container(&ctx.owner)?;
        Ok(Value::Null)
    });

    let b = Arc::clone(&backend);
    table.register("delete", move |ctx, args| {
        Args::new("delete", args).expect_len(0)?;
        log::info!("{} deleting container of {}", ctx.caller, ctx.owner);
        b.delete_container(&ctx.owner)?;
        Ok(Value::Null)
    });

    let b = Arc::clone(&backend);
    table.register("get_config", move |ctx, args| {
        Args::new("get_config", args).expect_len(0)?;
        to_value(b.get_config(&ctx.owner)?)
    });

    let b = Arc::clone(&backend);
    table.register("set_option", move |ctx, args| {
        let args = Args::new("set_option", args);
        args.expect_len(2)?;
        let (key, value): (String, String) = (args.get(0)?, args.get(1)?);
        b.set_config_option(&ctx.owner, &key, &value)?;
        Ok(Value::Null)
    });

    let b = backend;
    table.register("unset_option", move |ctx, args| {
        let key: String = Args::new("unset_option", args).expect_len(1)?.get(0)?;
        b.unset_config_option(&ctx.owner, &key)?;
        Ok(Value::Null)
    });
}
