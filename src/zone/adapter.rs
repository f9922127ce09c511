//! Zone transfer adapters.
//!
//! Adapters describe where a zone's unsigned input comes from and where its
//! signed output goes.  The actual transfer machinery is an external
//! collaborator; the scheduler only needs to compare configurations and hand
//! the descriptions to the pipeline tools.

use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;

//----------- Adapter ----------------------------------------------------------

/// An inbound or outbound zone adapter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Adapter {
    /// How the zone is moved.
    pub kind: AdapterKind,

    /// The file to read or write, or the transfer configuration file.
    pub path: Utf8PathBuf,
}

impl fmt::Display for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.path)
    }
}

//----------- AdapterKind ------------------------------------------------------

/// The mechanism an adapter uses.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AdapterKind {
    /// A plain zone file on disk.
    File,

    /// Query-based zone transfer (AXFR/IXFR).
    Transfer,
}

impl FromStr for AdapterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(Self::File),
            "transfer" => Ok(Self::Transfer),
            other => Err(format!("unknown adapter type '{other}'")),
        }
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::File => "file",
            Self::Transfer => "transfer",
        })
    }
}
