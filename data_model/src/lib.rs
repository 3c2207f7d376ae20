use std::fmt::{self, Display};

use hermes_utils::random_hex_id;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display as StrumDisplay, EnumString};

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: String) -> Self {
                Self(id)
            }

            pub fn get(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(FunctionId);
string_id!(WorkerId);
string_id!(RunId);
string_id!(ListenerId);

impl WorkerId {
    pub fn random() -> Self {
        Self(random_hex_id(8))
    }
}

impl ListenerId {
    pub fn random() -> Self {
        Self(random_hex_id(8))
    }
}

pub const CHANNEL_PREFIX: &str = "watcher-";

/// Pub/sub topic of a single worker. Also used as the container's DNS name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelName(String);

impl ChannelName {
    pub fn new(name: String) -> Self {
        Self(name)
    }

    pub fn for_worker(function_id: &FunctionId, worker_id: &WorkerId) -> Self {
        Self(format!("{CHANNEL_PREFIX}{function_id}_{worker_id}"))
    }

    pub fn get(&self) -> &str {
        &self.0
    }

    /// Splits `watcher-{function}_{worker}` back into its parts. The worker
    /// id is hex so the last underscore is the separator.
    pub fn parse_worker(&self) -> Option<(FunctionId, WorkerId)> {
        let rest = self.0.strip_prefix(CHANNEL_PREFIX)?;
        let (function_id, worker_id) = rest.rsplit_once('_')?;
        if function_id.is_empty() || worker_id.is_empty() {
            return None;
        }
        Some((function_id.into(), worker_id.into()))
    }
}

impl Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ChannelName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// The function image a pool of workers is dedicated to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FunctionSpec {
    pub function_id: FunctionId,
    pub image_name: String,
    pub gpu_capable: bool,
}

/// Everything the container runtime needs to launch one worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image_name: String,
    pub gpu_capable: bool,
    pub port: u16,
    pub dns_name: String,
    pub detach: bool,
    pub network: String,
    pub env: Vec<String>,
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, StrumDisplay, EnumString, AsRefStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    Async,
    Sync,
}

/// Control-plane signal published by a worker's container on its channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    StartupSuccess,
    StartupError,
    RunDone(RunId),
    Unknown(String),
}

impl ControlMessage {
    const STARTUP_SUCCESS: &'static str = "STARTUP-SUCCESS";
    const STARTUP_ERROR: &'static str = "STARTUP-ERROR";
    const RUN_DONE: &'static str = "RUN-DONE ";

    pub fn parse(payload: &str) -> Self {
        if payload.contains(Self::STARTUP_SUCCESS) {
            return Self::StartupSuccess;
        }
        if payload == Self::STARTUP_ERROR {
            return Self::StartupError;
        }
        match payload.strip_prefix(Self::RUN_DONE) {
            Some(run_id) if !run_id.is_empty() => Self::RunDone(run_id.into()),
            _ => Self::Unknown(payload.to_string()),
        }
    }
}

impl Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StartupSuccess => write!(f, "{}", Self::STARTUP_SUCCESS),
            Self::StartupError => write!(f, "{}", Self::STARTUP_ERROR),
            Self::RunDone(run_id) => write!(f, "{}{}", Self::RUN_DONE, run_id),
            Self::Unknown(payload) => write!(f, "{payload}"),
        }
    }
}
