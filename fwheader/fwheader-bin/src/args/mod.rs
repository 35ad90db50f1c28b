use {
    clap::Parser,
    fwheader::KeySet,
    sec1::der::Decode,
    std::path::{Path, PathBuf},
};

mod cli;
mod config;

pub use config::Error as ConfigError;

/// Program arguments loaded from the CLI and config file.
#[derive(Debug, Clone)]
pub enum Args {
    /// Dump the header contents to stdout.
    Dump { input: PathBuf, key_set: KeySet },
    /// Wrap raw code in an unsigned header.
    Build {
        input: PathBuf,
        output: PathBuf,
        version: fwheader::Version,
        fix_version: fwheader::Version,
    },
    /// Sign a firmware file.
    Sign {
        pubkey: Option<secp256k1::PublicKey>,
        secret: secp256k1::SecretKey,
        input: PathBuf,
        output: Output,
        slot: u8,
        index: u8,
        key_set: Option<KeySet>,
    },
}

#[derive(Debug, Clone)]
pub enum Output {
    InPlace,
    File(PathBuf),
}

pub fn args<I, T>(args: I) -> Result<Args, Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = cli::Args::try_parse_from(args).map_err(Error::Cli)?;
    match cli.command {
        cli::Command::Dump {
            input,
            known_pubkey,
        } => Ok(Args::Dump {
            input,
            key_set: known_pubkey
                .map(|keys| key_set(&keys))
                .transpose()?
                .unwrap_or(consts::VENDOR_KEYS),
        }),
        cli::Command::Build {
            input,
            output,
            firmware_version,
            fix_version,
        } => {
            let version = header_version(&firmware_version)?;
            let fix_version = fix_version
                .as_ref()
                .map(header_version)
                .transpose()?
                .unwrap_or(version);
            Ok(Args::Build {
                input,
                output,
                version,
                fix_version,
            })
        }
        cli::Command::Sign {
            pubkey,
            secret,
            config,
            input,
            in_place,
            output,
            slot,
            index,
            known_pubkey: known_pubkeys,
        } => {
            // Load and validate the config.
            let config = config.map(|c| config::Config::load(&c)).transpose()?;
            let config_pubkey = config.as_ref().and_then(|config| config.pubkey.clone());
            let config_secret_path = config
                .as_ref()
                .and_then(|config| {
                    config.secret.as_ref().map(|secret| {
                        if !secret.is_absolute() {
                            return Err(Error::SecretPathNotAbsoluteInConfig(secret.clone()));
                        }
                        Ok(secret.clone())
                    })
                })
                .transpose()?;
            let config_known_pubkeys = config
                .as_ref()
                .and_then(|config| config.known_pubkeys.clone());

            // Reconcile the CLI and config arguments. Error if anything is specified both
            // on the CLI and in the config file.
            let pubkey = match (pubkey, config_pubkey) {
                (Some(_), Some(_)) => return Err(Error::PubkeyInConfigAndCli),
                (pubkey, config_pubkey) => pubkey.or(config_pubkey),
            };
            let secret = match (secret, config_secret_path) {
                (None, None) => return Err(Error::SecretMissing),
                (Some(_), Some(_)) => return Err(Error::SecretInConfigAndCli),
                (Some(secret), None) | (None, Some(secret)) => secret,
            };
            let known_pubkeys = match (known_pubkeys, config_known_pubkeys) {
                (Some(_), Some(_)) => return Err(Error::KnownPubkeysInConfigAndCli),
                (known_pubkeys, config_known_pubkeys) => known_pubkeys.or(config_known_pubkeys),
            };

            // Parse the arguments.
            let pubkey = pubkey
                .map(|p| {
                    secp256k1::PublicKey::from_slice(
                        &hex::decode(p).map_err(|_| Error::InvalidPubkeyHex)?,
                    )
                    .map_err(Error::InvalidPubkey)
                })
                .transpose()?;
            let secret = read_secret(&secret)?;
            let output = match (in_place, output) {
                (true, Some(_)) => return Err(Error::InPlaceAndOutputSpecified),
                (true, None) => Output::InPlace,
                (false, Some(path)) => Output::File(path),
                (false, None) => return Err(Error::OutputMissing),
            };
            let key_set = known_pubkeys.map(|keys| key_set(&keys)).transpose()?;
            Ok(Args::Sign {
                pubkey,
                secret,
                input,
                output,
                slot,
                index,
                key_set,
            })
        }
    }
}

/// Read a secp256k1 secret key from a SEC1 PEM file.
fn read_secret(path: &Path) -> Result<secp256k1::SecretKey, Error> {
    let pem = std::fs::read(path).map_err(Error::ReadPemFile)?;
    let key = pem::parse(pem)?;
    if key.tag() != "EC PRIVATE KEY" {
        return Err(Error::InvalidPemTag(key.tag().to_string()));
    }
    let secret = sec1::EcPrivateKey::from_der(key.contents())
        .map_err(Error::ParseDerContent)?
        .private_key;
    secp256k1::SecretKey::from_slice(secret).map_err(Error::InvalidSecretKey)
}

/// Parse the known public keys into a key table.
fn key_set(keys: &[String]) -> Result<KeySet, Error> {
    let keys = keys
        .iter()
        .map(|known_pubkey| {
            hex::decode(known_pubkey)
                .map_err(|_| Error::InvalidKnownPubkeyHex(known_pubkey.clone()))
                .and_then(|p| {
                    secp256k1::PublicKey::from_slice(&p)
                        .map_err(|_| Error::InvalidKnownPubkey(known_pubkey.clone()))
                })
                .map(|p| p.serialize())
        })
        .collect::<Result<Vec<_>, _>>()?;
    KeySet::try_from(keys.as_slice()).map_err(|_| Error::KnownPubkeysCount(keys.len()))
}

/// Header versions hold one byte per component and no pre-release tag.
fn header_version(version: &semver::Version) -> Result<fwheader::Version, Error> {
    let component = |v: u64| u8::try_from(v).map_err(|_| Error::InvalidVersion(version.clone()));
    if !version.pre.is_empty() || !version.build.is_empty() {
        return Err(Error::InvalidVersion(version.clone()));
    }
    Ok(fwheader::Version::new(
        component(version.major)?,
        component(version.minor)?,
        component(version.patch)?,
    ))
}

#[derive(Debug)]
pub enum Error {
    Cli(clap::Error),
    Config(ConfigError),
    InPlaceAndOutputSpecified,
    InvalidKnownPubkey(String),
    InvalidKnownPubkeyHex(String),
    InvalidPemTag(String),
    InvalidPubkey(secp256k1::Error),
    InvalidPubkeyHex,
    InvalidSecretKey(secp256k1::Error),
    InvalidVersion(semver::Version),
    KnownPubkeysCount(usize),
    KnownPubkeysInConfigAndCli,
    OutputMissing,
    ParseDerContent(sec1::der::Error),
    ParsePemFile(pem::PemError),
    PubkeyInConfigAndCli,
    ReadPemFile(std::io::Error),
    SecretInConfigAndCli,
    SecretMissing,
    SecretPathNotAbsoluteInConfig(PathBuf),
}

impl From<pem::PemError> for Error {
    fn from(e: pem::PemError) -> Self {
        Error::ParsePemFile(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Cli(e) => write!(f, "{}", e.render().ansi()),
            Error::Config(e) => write!(f, "config error: {e}"),
            Error::InPlaceAndOutputSpecified => {
                write!(f, "cannot specify both --in-place and --output (-o)")
            }
            Error::InvalidKnownPubkey(pubkey) => {
                write!(f, r#"user specified invalid known public key: "{pubkey}""#)
            }
            Error::InvalidKnownPubkeyHex(pubkey) => {
                write!(f, r#"user specified invalid known public key hex: "{pubkey}""#)
            }
            Error::InvalidPemTag(tag) => {
                write!(f, r#"invalid PEM tag: "{tag}", expected "EC PRIVATE KEY""#)
            }
            Error::InvalidPubkey(e) => write!(f, "user specified invalid public key: {e}"),
            Error::InvalidPubkeyHex => write!(f, "user specified invalid public key hex"),
            Error::InvalidSecretKey(e) => write!(f, "user specified invalid secret key: {e}"),
            Error::InvalidVersion(version) => write!(
                f,
                "version {version} cannot be stored in the header, \
                 each component must be at most 255 and pre-release tags are not allowed"
            ),
            Error::KnownPubkeysCount(count) => write!(
                f,
                "expected {} known public keys, got {count}",
                consts::PUBKEYS
            ),
            Error::KnownPubkeysInConfigAndCli => {
                write!(f, "known pubkeys specified in both config and cli")
            }
            Error::OutputMissing => write!(f, "either --in-place or --output (-o) is required"),
            Error::ParseDerContent(e) => {
                write!(f, "failed to parse DER content inside PEM file: {e}")
            }
            Error::ParsePemFile(e) => write!(f, "invalid PEM file: {e}"),
            Error::PubkeyInConfigAndCli => write!(f, "pubkey specified in both config and cli"),
            Error::ReadPemFile(e) => write!(f, "failed to read PEM file: {e}"),
            Error::SecretInConfigAndCli => write!(f, "secret specified in both config and cli"),
            Error::SecretMissing => write!(f, "user did not specify a secret key"),
            Error::SecretPathNotAbsoluteInConfig(path) => {
                write!(
                    f,
                    r#"config error: secret key path is not absolute: "{}""#,
                    path.to_str().unwrap_or("<invalid path>")
                )
            }
        }
    }
}

impl std::error::Error for Error {}
