//! Wire protocol for the picshare WebSocket session
//!
//! Control messages travel as JSON text frames; payloads travel as binary
//! frames. Client commands look like `{"cmd": "UPLOAD", "args": ["a.png", "10"]}`.
//! Server responses carry a `status` key, asynchronous events an `event` key.

use serde::{Deserialize, Serialize};

use crate::error::CommandError;

// Default listening endpoint
pub const DEFAULT_BIND: &str = "0.0.0.0:8765";

// Maximum upload payload (64MB) unless configured otherwise
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 64 * 1024 * 1024;

// Control frames are small; leave room on top of the largest payload
pub const CONTROL_FRAME_SLACK: usize = 64 * 1024;

// Notifications kept for replay on AUTH
pub const DEFAULT_HISTORY_CAPACITY: usize = 5;

// Bounding box handed to the thumbnailer
pub const THUMBNAIL_MAX: (u32, u32) = (128, 128);

pub const ANONYMOUS: &str = "anon";

/// Command names as they appear in the `cmd` field
pub mod cmd {
    pub const AUTH: &str = "AUTH";
    pub const LIST: &str = "LIST";
    pub const UPLOAD: &str = "UPLOAD";
    pub const DOWNLOAD: &str = "DOWNLOAD";
    pub const VIEW: &str = "VIEW";
    pub const DISCONNECT: &str = "DISCONNECT";

    // Tag carried by READY so clients know binary data is expected next
    pub const UPLOAD_DATA: &str = "UPLOAD_DATA";
}

/// A command exactly as decoded from a text frame, before validation
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RawCommand {
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl RawCommand {
    pub fn new(cmd: &str, args: &[&str]) -> Self {
        RawCommand {
            cmd: cmd.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Whether a file is fetched to disk or opened in a viewer
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransferMode {
    Download,
    View,
}

impl TransferMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferMode::Download => cmd::DOWNLOAD,
            TransferMode::View => cmd::VIEW,
        }
    }
}

/// Validated client command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Auth { username: String },
    List,
    Upload { filename: String, size: u64 },
    Fetch { filename: String, mode: TransferMode },
    Disconnect,
}

impl Command {
    /// Decode a text frame into a command.
    pub fn parse(text: &str) -> Result<Command, CommandError> {
        let raw: RawCommand = serde_json::from_str(text)
            .map_err(|e| CommandError::InvalidFormat(e.to_string()))?;
        Command::from_raw(raw)
    }

    pub fn from_raw(raw: RawCommand) -> Result<Command, CommandError> {
        let name = raw.cmd.trim().to_uppercase();
        let mut args = raw.args;
        match name.as_str() {
            cmd::AUTH => {
                let username = args
                    .first()
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .unwrap_or(ANONYMOUS)
                    .to_string();
                Ok(Command::Auth { username })
            }
            cmd::LIST => Ok(Command::List),
            cmd::UPLOAD => {
                if args.len() != 2 {
                    return Err(CommandError::BadArguments(
                        "UPLOAD expects [filename, size]".into(),
                    ));
                }
                let size = args[1]
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| CommandError::BadArguments("invalid file size".into()))?;
                args.truncate(1);
                let filename = args.remove(0);
                Ok(Command::Upload { filename, size })
            }
            cmd::DOWNLOAD | cmd::VIEW => {
                if args.len() != 1 {
                    return Err(CommandError::BadArguments(format!(
                        "{name} expects [filename]"
                    )));
                }
                let mode = if name == cmd::VIEW {
                    TransferMode::View
                } else {
                    TransferMode::Download
                };
                Ok(Command::Fetch {
                    filename: args.remove(0),
                    mode,
                })
            }
            cmd::DISCONNECT => Ok(Command::Disconnect),
            _ => Err(CommandError::UnknownCommand(raw.cmd)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Auth { .. } => cmd::AUTH,
            Command::List => cmd::LIST,
            Command::Upload { .. } => cmd::UPLOAD,
            Command::Fetch { mode, .. } => mode.as_str(),
            Command::Disconnect => cmd::DISCONNECT,
        }
    }
}

/// One catalog entry as exposed by LIST
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub filename: String,
    pub uploader: String,
}

/// Server reply to a command
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Response {
    Success {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cmd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Vec<Listing>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
    },
    Error {
        message: String,
    },
    Ready {
        cmd: String,
    },
    SizeInfo {
        size: u64,
        filename: String,
        mode: TransferMode,
    },
    Bye {
        message: String,
    },
}

impl Response {
    pub fn success(message: impl Into<String>) -> Self {
        Response::Success {
            message: Some(message.into()),
            cmd: None,
            data: None,
            id: None,
        }
    }

    pub fn listing(data: Vec<Listing>) -> Self {
        Response::Success {
            message: None,
            cmd: Some(cmd::LIST.to_string()),
            data: Some(data),
            id: None,
        }
    }

    pub fn uploaded(filename: &str, id: u64) -> Self {
        Response::Success {
            message: Some(format!("upload of {filename} complete, id {id}")),
            cmd: None,
            data: None,
            id: Some(id),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
        }
    }

    pub fn ready() -> Self {
        Response::Ready {
            cmd: cmd::UPLOAD_DATA.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Response::Success { .. })
    }
}

/// Asynchronous notification pushed to sessions
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    NewUpload {
        message: String,
        filename: String,
        uploader: String,
    },
    History {
        data: Vec<Event>,
    },
}

impl Event {
    pub fn new_upload(filename: &str, uploader: &str) -> Self {
        Event::NewUpload {
            message: format!("new file '{filename}' uploaded by {uploader}"),
            filename: filename.to_string(),
            uploader: uploader.to_string(),
        }
    }
}

/// Any text frame the server may send
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum ServerMessage {
    Event(Event),
    Response(Response),
}
