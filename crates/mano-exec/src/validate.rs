//! Hardened input validation for process arguments.
//!
//! Everything that becomes part of a process invocation passes through this
//! module first. Validated strings are byte-identical to what reaches the
//! exec call: validation never rewrites, it only accepts or rejects.

use mano_core::sanitize::is_log_safe;
use mano_core::slice::{valid_interface_name, validate_mtu, validate_udp_port, validate_vni};
use std::net::IpAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("command not allowed: {0}")]
    CommandNotAllowed(String),

    #[error("{command} exited with status {status}: {stderr}")]
    ExecFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("failed to parse {what} output: {detail}")]
    ParseFailed { what: String, detail: String },

    #[error("{command} timed out after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },

    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

pub type ExecResult<T> = std::result::Result<T, ExecError>;

impl From<ExecError> for mano_core::ManoError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::InvalidInput(msg) => mano_core::ManoError::Validation(msg),
            ExecError::CommandNotAllowed(cmd) => {
                mano_core::ManoError::Validation(format!("command not allowed: {cmd}"))
            }
            ExecError::Timeout { timeout_ms, .. } => mano_core::ManoError::Timeout { timeout_ms },
            ExecError::ParseFailed { .. } => mano_core::ManoError::Internal(err.to_string()),
            ExecError::ExecFailed { .. } | ExecError::Spawn { .. } => {
                mano_core::ManoError::Infrastructure(err.to_string())
            }
        }
    }
}

/// Commands this system is permitted to execute.
pub const ALLOWED_COMMANDS: &[&str] = &["ip", "tc", "bridge", "ping", "iperf3"];

/// Characters permitted in a process argument. Everything a `tc`/`ip`
/// invocation legitimately needs; no shell metacharacters.
fn allowed_arg_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(c, '.' | ':' | '/' | '_' | '-' | '+' | '%' | '=' | ',')
}

pub fn validate_command_name(command: &str) -> ExecResult<()> {
    if ALLOWED_COMMANDS.contains(&command) {
        Ok(())
    } else {
        Err(ExecError::CommandNotAllowed(
            mano_core::sanitize::sanitize_for_log(command),
        ))
    }
}

pub fn validate_argument(arg: &str) -> ExecResult<()> {
    if arg.is_empty() {
        return Err(ExecError::InvalidInput("empty argument".to_string()));
    }
    if !arg.chars().all(allowed_arg_char) || !is_log_safe(arg) {
        return Err(ExecError::InvalidInput(format!(
            "argument {:?} contains forbidden characters",
            mano_core::sanitize::sanitize_for_log(arg)
        )));
    }
    Ok(())
}

pub fn validate_interface(name: &str) -> ExecResult<()> {
    if valid_interface_name(name) {
        Ok(())
    } else {
        Err(ExecError::InvalidInput(format!(
            "invalid interface name {:?}",
            mano_core::sanitize::sanitize_for_log(name)
        )))
    }
}

pub fn validate_ip(addr: &str) -> ExecResult<IpAddr> {
    addr.parse::<IpAddr>().map_err(|_| {
        ExecError::InvalidInput(format!(
            "invalid IP address {:?}",
            mano_core::sanitize::sanitize_for_log(addr)
        ))
    })
}

pub fn validate_vni_arg(vni: u32) -> ExecResult<()> {
    validate_vni(vni).map_err(|e| ExecError::InvalidInput(e.to_string()))
}

pub fn validate_mtu_arg(mtu: u32) -> ExecResult<()> {
    validate_mtu(mtu).map_err(|e| ExecError::InvalidInput(e.to_string()))
}

pub fn validate_port_arg(port: u32) -> ExecResult<()> {
    validate_udp_port(port).map_err(|e| ExecError::InvalidInput(e.to_string()))
}

/// Command-specific argument checks, applied on top of the character-class
/// whitelist. They reject argument vectors that could not have been produced
/// by this system's own renderers.
pub fn validate_command_args(command: &str, args: &[String]) -> ExecResult<()> {
    for arg in args {
        validate_argument(arg)?;
    }
    match command {
        "tc" => {
            if !matches!(
                args.first().map(String::as_str),
                Some("qdisc" | "class" | "filter" | "-s")
            ) {
                return Err(ExecError::InvalidInput(
                    "tc invocations must operate on qdisc, class or filter".to_string(),
                ));
            }
            Ok(())
        }
        "ip" => {
            if !matches!(args.first().map(String::as_str), Some("link" | "-s" | "-d" | "addr" | "route")) {
                return Err(ExecError::InvalidInput(
                    "unsupported ip subcommand".to_string(),
                ));
            }
            Ok(())
        }
        "bridge" => {
            if args.first().map(String::as_str) != Some("fdb") {
                return Err(ExecError::InvalidInput(
                    "bridge invocations must operate on fdb".to_string(),
                ));
            }
            Ok(())
        }
        "ping" => {
            // host is the last argument
            match args.last() {
                Some(host) => validate_ip(host).map(|_| ()),
                None => Err(ExecError::InvalidInput("ping needs a host".to_string())),
            }
        }
        "iperf3" => {
            if !args.iter().any(|a| a == "-c") {
                return Err(ExecError::InvalidInput(
                    "only iperf3 client mode is permitted".to_string(),
                ));
            }
            Ok(())
        }
        other => Err(ExecError::CommandNotAllowed(
            mano_core::sanitize::sanitize_for_log(other),
        )),
    }
}
