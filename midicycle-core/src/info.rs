//! Port metadata and its tagged text form.
//!
//! ```text
//! <MidiPortInfo name="n", input="true", vendor="v", description="d", version="1", index="0", architecture="JACK"/>
//! ```
//!
//! Absent strings are written as `null`. Values containing a double quote
//! cannot be represented.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

const TAG: &str = "<MidiPortInfo ";
const NULL: &str = "null";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InfoParseError {
    #[error("not a MidiPortInfo tag: {0:?}")]
    NotAPortInfo(String),
    #[error("missing \"{0}\" parameter.")]
    MissingParameter(&'static str),
    #[error("unterminated \"{0}\" parameter.")]
    Unterminated(&'static str),
    #[error("invalid value {value:?} for \"{param}\" parameter.")]
    InvalidValue { param: &'static str, value: String },
    #[error("unknown architecture {0:?}")]
    UnknownArchitecture(String),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Architecture {
    WindowsMm,
    Alsa,
    Jack,
    MacosxCore,
}

impl Architecture {
    pub const ALL: [Architecture; 4] = [
        Architecture::WindowsMm,
        Architecture::Alsa,
        Architecture::Jack,
        Architecture::MacosxCore,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Architecture::WindowsMm => "WINDOWS_MM",
            Architecture::Alsa => "ALSA",
            Architecture::Jack => "JACK",
            Architecture::MacosxCore => "MACOSX_CORE",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = InfoParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Architecture::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| InfoParseError::UnknownArchitecture(s.to_string()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortInfo {
    pub name: Option<String>,
    pub input: bool,
    pub vendor: Option<String>,
    pub description: Option<String>,
    pub version: Option<String>,
    pub index: i32,
    pub architecture: Option<Architecture>,
}

impl PortInfo {
    /// An info with every optional field absent and no index.
    pub fn template(architecture: Option<Architecture>) -> PortInfo {
        PortInfo {
            name: None,
            input: false,
            vendor: None,
            description: None,
            version: None,
            index: -1,
            architecture,
        }
    }
}

impl Default for PortInfo {
    fn default() -> Self {
        PortInfo::template(None)
    }
}

impl fmt::Display for PortInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}name=\"{}\", input=\"{}\", vendor=\"{}\", description=\"{}\", version=\"{}\", index=\"{}\", architecture=\"{}\"/>",
            TAG,
            or_null(&self.name),
            self.input,
            or_null(&self.vendor),
            or_null(&self.description),
            or_null(&self.version),
            self.index,
            self.architecture.map_or(NULL, Architecture::as_str),
        )
    }
}

const FIELDS: [&str; 7] = [
    "name",
    "input",
    "vendor",
    "description",
    "version",
    "index",
    "architecture",
];

impl FromStr for PortInfo {
    type Err = InfoParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut rest = s
            .strip_prefix(TAG)
            .ok_or_else(|| InfoParseError::NotAPortInfo(s.to_string()))?;
        let mut values = [""; FIELDS.len()];
        for (i, &name) in FIELDS.iter().enumerate() {
            let (value, remaining) = param(rest, name, FIELDS.get(i + 1).copied())?;
            values[i] = value;
            rest = remaining;
        }
        let [name, input, vendor, description, version, index, architecture] = values;

        let architecture = match architecture {
            NULL => None,
            "" => {
                return Err(InfoParseError::InvalidValue {
                    param: "architecture",
                    value: String::new(),
                })
            }
            value => Some(value.parse::<Architecture>()?),
        };
        Ok(PortInfo {
            name: optional(name),
            input: bool_value("input", input)?,
            vendor: optional(vendor),
            description: optional(description),
            version: optional(version),
            index: int_value("index", index)?,
            architecture,
        })
    }
}

fn or_null(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or(NULL)
}

/// Splits `name="value"` off the front of `s`. The value ends at the quote
/// that introduces `next`, or at the closing `"/>` for the last field.
fn param<'a>(
    s: &'a str,
    name: &'static str,
    next: Option<&'static str>,
) -> Result<(&'a str, &'a str), InfoParseError> {
    let rest = s
        .strip_prefix(name)
        .and_then(|rest| rest.strip_prefix("=\""))
        .ok_or(InfoParseError::MissingParameter(name))?;
    match next {
        Some(next) => {
            let separator = format!("\", {}=\"", next);
            match rest.find(&separator) {
                Some(end) => Ok((&rest[..end], &rest[end + 3..])),
                None if rest.contains('"') => Err(InfoParseError::MissingParameter(next)),
                None => Err(InfoParseError::Unterminated(name)),
            }
        }
        None => rest
            .strip_suffix("\"/>")
            .map(|value| (value, ""))
            .ok_or(InfoParseError::Unterminated(name)),
    }
}

fn optional(value: &str) -> Option<String> {
    match value {
        NULL => None,
        value => Some(value.to_string()),
    }
}

fn bool_value(param: &'static str, value: &str) -> Result<bool, InfoParseError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        value => Err(InfoParseError::InvalidValue {
            param,
            value: value.to_string(),
        }),
    }
}

fn int_value(param: &'static str, value: &str) -> Result<i32, InfoParseError> {
    value.parse().map_err(|_| InfoParseError::InvalidValue {
        param,
        value: value.to_string(),
    })
}
