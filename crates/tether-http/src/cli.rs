//! `tether` command-line client.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tether_core::{BatchMode, CallDescriptor, ClientConfig, Dialect, RpcClient};
use tracing::{info, warn};

use crate::ReqwestTransport;

/// Protocol version selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DialectArg {
    /// JSON-RPC 1.0
    #[value(name = "1")]
    V1,
    /// JSON-RPC 2.0
    #[value(name = "2")]
    V2,
}

impl From<DialectArg> for Dialect {
    fn from(arg: DialectArg) -> Self {
        match arg {
            DialectArg::V1 => Dialect::JsonRpc1,
            DialectArg::V2 => Dialect::JsonRpc2,
        }
    }
}

/// Command-line arguments.
#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Batching JSON-RPC client", long_about = None)]
pub struct Cli {
    /// Client configuration file (TOML or JSON).
    #[arg(short, long, default_value = "/etc/tether/client.toml")]
    pub config: PathBuf,

    /// Endpoint URL, overriding the configuration file.
    #[arg(short, long)]
    pub endpoint: Option<String>,

    /// Bearer token.
    #[arg(short, long, env = "TETHER_TOKEN")]
    pub token: Option<String>,

    /// Protocol version.
    #[arg(short, long, value_enum)]
    pub dialect: Option<DialectArg>,

    /// Per-method timeout in milliseconds.
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// What to do.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Call a method and print its result.
    Call {
        /// Method name.
        method: String,
        /// JSON array (positional) or object (named) parameters.
        params: Option<String>,
    },
    /// Send a notification.
    Notify {
        /// Method name.
        method: String,
        /// JSON parameters, as for `call`.
        params: Option<String>,
    },
    /// Send several calls as one batch, each given as `method` or
    /// `method=<json params>`; `--file` reads a JSON array of
    /// `{"method", "params"}` objects instead.
    Batch {
        /// JSON file listing the calls.
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Calls given on the command line.
        calls: Vec<String>,
    },
}

/// One call of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSpec {
    /// Method name.
    pub method: String,
    /// Parameter labels when the params were an object.
    pub names: Option<Vec<String>>,
    /// Argument values in order.
    pub args: Vec<Value>,
}

/// Split JSON params into optional labels and values.
///
/// An array is sent positionally, an object by name, and any other value
/// as a single positional argument.
pub fn parse_params(raw: Option<&str>) -> Result<(Option<Vec<String>>, Vec<Value>)> {
    let Some(raw) = raw else {
        return Ok((None, Vec::new()));
    };
    let value: Value = serde_json::from_str(raw).with_context(|| format!("invalid JSON params: {}", raw))?;
    Ok(split_params(value))
}

fn split_params(value: Value) -> (Option<Vec<String>>, Vec<Value>) {
    match value {
        Value::Null => (None, Vec::new()),
        Value::Array(items) => (None, items),
        Value::Object(map) => {
            let (names, args) = map.into_iter().unzip();
            (Some(names), args)
        }
        other => (None, vec![other]),
    }
}

/// Parse `method` or `method=<json>`.
pub fn parse_call(spec: &str) -> Result<CallSpec> {
    let (method, params) = match spec.split_once('=') {
        Some((method, params)) => (method, Some(params)),
        None => (spec, None),
    };
    if method.trim().is_empty() {
        bail!("empty method name in {:?}", spec);
    }
    let (names, args) = parse_params(params)?;
    Ok(CallSpec {
        method: method.trim().to_string(),
        names,
        args,
    })
}

/// Read a batch file: a JSON array of `{"method": .., "params": ..}`.
pub fn read_batch_file(path: &Path) -> Result<Vec<CallSpec>> {
    let contents = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let items: Vec<Value> = serde_json::from_str(&contents)?;
    items
        .into_iter()
        .map(|item| {
            let method = item
                .get("method")
                .and_then(Value::as_str)
                .context("batch entry without a method")?
                .to_string();
            let (names, args) = split_params(item.get("params").cloned().unwrap_or(Value::Null));
            Ok(CallSpec { method, names, args })
        })
        .collect()
}

fn descriptor(spec_names: Option<&Vec<String>>, method: &str) -> tether_core::call::CallDescriptorBuilder {
    let builder = CallDescriptor::builder(method).allow_empty_result();
    match spec_names {
        Some(names) => builder.params(names.clone()),
        None => builder,
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

impl Cli {
    /// Configuration file merged with command-line overrides.
    pub fn client_config(&self) -> Result<ClientConfig> {
        let mut config = if self.config.exists() {
            ClientConfig::from_file(&self.config)?
        } else {
            warn!(path = %self.config.display(), "config file not found, using defaults");
            ClientConfig::default()
        };
        if let Some(endpoint) = &self.endpoint {
            config.endpoint = endpoint.clone();
        }
        if let Some(token) = &self.token {
            config.auth.access_token = Some(token.clone());
        }
        if let Some(dialect) = self.dialect {
            config.dialect = dialect.into();
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.method_timeout_ms = timeout_ms;
        }
        // batches are flushed explicitly
        config.batch_mode = BatchMode::Manual;
        config.validate()?;
        Ok(config)
    }

    /// Execute the selected command.
    pub async fn run(self) -> Result<()> {
        let config = self.client_config()?;
        let transport = ReqwestTransport::new(Duration::from_millis(config.connect_timeout_ms))?;
        info!(endpoint = %config.endpoint, dialect = ?config.dialect, "tether client");
        let client = RpcClient::new(config, Arc::new(transport))?;

        let result = match self.command {
            Command::Call { ref method, ref params } => self.call(&client, method, params.as_deref()).await,
            Command::Notify { ref method, ref params } => self.notify(&client, method, params.as_deref()).await,
            Command::Batch { ref file, ref calls } => self.batch(&client, file.as_deref(), calls).await,
        };
        client.shutdown();
        result
    }

    async fn call(&self, client: &RpcClient, method: &str, params: Option<&str>) -> Result<()> {
        let (names, args) = parse_params(params)?;
        let desc = descriptor(names.as_ref(), method).build();
        let value: Value = client.call(&desc, args).await?;
        print_json(&value)
    }

    async fn notify(&self, client: &RpcClient, method: &str, params: Option<&str>) -> Result<()> {
        let (names, args) = parse_params(params)?;
        let desc = descriptor(names.as_ref(), method).notification().build();
        // a batch keeps the process alive until the notification is sent
        client.start_batch();
        client.notify(&desc, args)?;
        client.flush_batch().await?;
        Ok(())
    }

    async fn batch(&self, client: &RpcClient, file: Option<&Path>, calls: &[String]) -> Result<()> {
        let specs = match file {
            Some(path) => read_batch_file(path)?,
            None => calls.iter().map(|c| parse_call(c)).collect::<Result<Vec<_>>>()?,
        };
        if specs.is_empty() {
            bail!("no calls given");
        }

        client.start_batch();
        for spec in &specs {
            let desc = descriptor(spec.names.as_ref(), &spec.method)
                .asynchronous()
                .build();
            client.call_async(&desc, spec.args.clone(), |_| {})?;
        }
        let results = client.flush_batch().await?;
        print_json(&Value::Array(results))
    }
}
