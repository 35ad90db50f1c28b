//! Command line arguments.

use std::path::PathBuf;

#[derive(clap::Parser)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand)]
pub enum Command {
    /// Dump the header contents to stdout and check hashes and signatures.
    Dump {
        /// The firmware file.
        #[clap(short, long)]
        input: PathBuf,
        /// The five known public keys in hex, in key index order, separated
        /// by commas. Defaults to the vendor keys.
        #[clap(long, value_delimiter = ',')]
        known_pubkey: Option<Vec<String>>,
    },
    /// Wrap raw code in an unsigned header.
    Build {
        /// The raw code file.
        #[clap(short, long)]
        input: PathBuf,
        /// Path to write the firmware file.
        #[clap(short, long)]
        output: PathBuf,
        /// Version to write in the header.
        #[clap(long)]
        firmware_version: semver::Version,
        /// Fix version to write in the header. Defaults to the firmware
        /// version.
        #[clap(long)]
        fix_version: Option<semver::Version>,
    },
    /// Sign a firmware file into one of the three signature slots.
    Sign {
        /// The public key in hex, verified against the secret key to avoid
        /// accidental signing.
        #[clap(long)]
        pubkey: Option<String>,
        /// Path to PEM-encoded secret key.
        #[clap(long)]
        secret: Option<PathBuf>,
        /// Path to config file.
        #[clap(long, short)]
        config: Option<PathBuf>,
        /// The firmware file.
        #[clap(short, long)]
        input: PathBuf,
        /// Update the firmware file in place.
        #[clap(long)]
        in_place: bool,
        /// Path to write the signed firmware file.
        #[clap(short, long)]
        output: Option<PathBuf>,
        /// Signature slot to fill, 1 to 3.
        #[clap(long)]
        slot: u8,
        /// Index of the signing key in the key table, 1 to 5.
        #[clap(long)]
        index: u8,
        /// The five known public keys in hex, in key index order, separated
        /// by commas.
        #[clap(long, value_delimiter = ',')]
        known_pubkey: Option<Vec<String>>,
    },
}
