use std::path::{Path, PathBuf};

/// Signing settings, usually kept next to the key material.
///
/// ```toml
/// pubkey = "02..."
/// secret = "/path/to/key.pem"
/// known_pubkeys = ["02...", "03...", "02...", "02...", "03..."]
/// ```
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Config {
    /// Expected public key of `secret`, in hex.
    pub pubkey: Option<String>,
    /// Absolute path of the PEM secret key.
    pub secret: Option<PathBuf>,
    /// The key table, in key index order.
    pub known_pubkeys: Option<Vec<String>>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let config = std::fs::read_to_string(path)?;
        toml::from_str(&config).map_err(Into::into)
    }
}

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Toml(toml::de::Error),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Toml(e)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "failed to read config file: {e}"),
            Error::Toml(e) => write!(f, "config file format error in TOML: {e}"),
        }
    }
}

impl std::error::Error for Error {}
