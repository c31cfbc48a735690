use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use wisp_transfer::completion::EndAckPolicy;
use wisp_transfer::flow::FlowConfig;
use wisp_transfer::{ReceiveOptions, SendOptions, parse_code};

/// Loopback settings, taken from `WISP_*` environment variables over the
/// engine defaults.
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    pub chunk_size: Option<usize>,
    pub window: Option<usize>,
    pub heartbeat: Option<Duration>,
    pub end_ack_timeout: Option<Duration>,
    pub watchdog: Option<Duration>,
    pub output_dir: PathBuf,
    pub code: Option<String>,
    pub confirm: bool,
}

impl LoopbackConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let code = match lookup("WISP_CODE") {
            Some(raw) => Some(parse_code(&raw).with_context(|| "WISP_CODE is not a pairing code")?),
            None => None,
        };
        let config = LoopbackConfig {
            chunk_size: parse_var(&lookup, "WISP_CHUNK_SIZE")?,
            window: parse_var(&lookup, "WISP_WINDOW")?,
            heartbeat: parse_var(&lookup, "WISP_HEARTBEAT_MS")?.map(Duration::from_millis),
            end_ack_timeout: parse_var(&lookup, "WISP_END_ACK_TIMEOUT_MS")?.map(Duration::from_millis),
            watchdog: parse_var(&lookup, "WISP_WATCHDOG_MS")?.map(Duration::from_millis),
            output_dir: lookup("WISP_OUTPUT_DIR")
                .unwrap_or_else(|| "./wisp-received".into())
                .into(),
            code,
            confirm: parse_flag(&lookup, "WISP_CONFIRM")?,
        };

        // Catch inconsistent values here rather than when the session starts.
        config.send_options().validate().context("invalid sender settings")?;
        config.receive_options().validate().context("invalid receiver settings")?;
        Ok(config)
    }

    pub fn send_options(&self) -> SendOptions {
        let defaults = SendOptions::default();
        SendOptions {
            code: self.code.clone(),
            chunk_size: self.chunk_size.unwrap_or(defaults.chunk_size),
            flow: FlowConfig {
                window: self.window.unwrap_or(defaults.flow.window),
                ..defaults.flow.clone()
            },
            heartbeat_interval: self.heartbeat.unwrap_or(defaults.heartbeat_interval),
            end_ack: EndAckPolicy {
                timeout: self.end_ack_timeout.unwrap_or(defaults.end_ack.timeout),
                ..defaults.end_ack
            },
            ..defaults
        }
    }

    pub fn receive_options(&self) -> ReceiveOptions {
        let defaults = ReceiveOptions::default();
        ReceiveOptions {
            require_confirmation: self.confirm,
            watchdog_timeout: self.watchdog.unwrap_or(defaults.watchdog_timeout),
            ..defaults
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    match raw.trim().parse() {
        Ok(value) => Ok(Some(value)),
        Err(e) => bail!("{key}={raw:?} is not valid: {e}"),
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<bool> {
    match lookup(key).as_deref().map(str::trim) {
        None | Some("") | Some("0") | Some("false") | Some("no") => Ok(false),
        Some("1") | Some("true") | Some("yes") => Ok(true),
        Some(other) => bail!("{key}={other:?} is not valid: expected true or false"),
    }
}
