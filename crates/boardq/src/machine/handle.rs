use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One allocatable unit of boards.
///
/// Two handles are the same unit when their name and version match; the remaining fields
/// describe the unit and never change once a manager has issued the handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareHandle {
    pub name: String,
    pub version: String,
    /// Extent in chips.
    pub width: u32,
    pub height: u32,
    pub boards: u32,
    /// Address of the board management processor.
    #[serde(default)]
    pub bmp: Option<String>,
}

impl HardwareHandle {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl PartialEq for HardwareHandle {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.version == other.version
    }
}

impl Eq for HardwareHandle {}

impl Hash for HardwareHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.version.hash(state);
    }
}

/// Compact form `(name:version:width:height:boards:bmp)`, the bmp part may be empty.
impl fmt::Display for HardwareHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}:{}:{}:{}:{}:{})",
            self.name,
            self.version,
            self.width,
            self.height,
            self.boards,
            self.bmp.as_deref().unwrap_or("")
        )
    }
}

impl FromStr for HardwareHandle {
    type Err = crate::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| {
            crate::Error::InvalidRequest(format!("Invalid machine description `{value}`: {reason}"))
        };
        let inner = value
            .trim()
            .strip_prefix('(')
            .and_then(|v| v.strip_suffix(')'))
            .ok_or_else(|| invalid("expected `(name:version:width:height:boards:bmp)`"))?;
        let parts: Vec<&str> = inner.split(':').map(str::trim).collect();
        let [name, version, width, height, boards, bmp] = parts.as_slice() else {
            return Err(invalid("expected six `:` separated fields"));
        };
        if name.is_empty() {
            return Err(invalid("empty name"));
        }
        let number = |field: &str, text: &str| {
            text.parse::<u32>()
                .map_err(|_| invalid(&format!("{field} `{text}` is not a number")))
        };
        Ok(HardwareHandle {
            name: name.to_string(),
            version: version.to_string(),
            width: number("width", width)?,
            height: number("height", height)?,
            boards: number("boards", boards)?,
            bmp: (!bmp.is_empty()).then(|| bmp.to_string()),
        })
    }
}
