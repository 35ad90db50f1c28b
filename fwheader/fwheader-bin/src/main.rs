use {
    colored::Colorize,
    fwheader::{
        chunk_code_capacity, chunk_digest, FirmwareHeader, KeySet, Secp256k1Verify as _, Sha2,
        VerificationResult, CHUNK_SIZE, HEADER_LEN,
    },
    std::{
        ffi::OsString,
        io::{Read, Seek, Write},
        path::{Path, PathBuf},
    },
};

mod args;

#[cfg(test)]
mod tests;

fn main() -> std::process::ExitCode {
    main_args(
        std::env::args_os(),
        &mut std::io::stdout(),
        &mut std::io::stderr(),
    )
    .into()
}

fn main_args<I, T>(args: I, stdout: impl Write, mut stderr: impl Write) -> ExitCode
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    match run(args, stdout) {
        Ok(()) => ExitCode(0),
        Err(Error::Args(e @ args::Error::Cli(_))) => {
            // Clap already does the "error: {}" formatting.
            writeln!(stderr, "{e}").expect("write error to stderr");
            ExitCode(1)
        }
        Err(e) => {
            writeln!(stderr, "{} {e}", "error:".bold().red()).expect("write error to stderr");
            ExitCode(1)
        }
    }
}

fn run<I, T>(args: I, stdout: impl Write) -> Result<(), Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    match args::args(args)? {
        args::Args::Dump { input, key_set } => dump(&input, &key_set, stdout),
        args::Args::Build {
            input,
            output,
            version,
            fix_version,
        } => {
            let code = std::fs::read(input).map_err(Error::ReadInputFile)?;
            let header = FirmwareHeader::build(&code, version, fix_version, &Sha2)?;
            write_image(&output, &header, &code)
        }
        args::Args::Sign {
            pubkey,
            secret,
            input,
            output,
            slot,
            index,
            key_set,
        } => sign(pubkey, secret, &input, output, slot, index, key_set),
    }
}

/// Write `header` and `code` next to `output`, then move the result over it,
/// so a failed build never leaves a truncated image behind.
fn write_image(output: &Path, header: &FirmwareHeader, code: &[u8]) -> Result<(), Error> {
    let dir = match output.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(Error::CreateTempFile)?;
    file.write_all(&header.to_bytes())
        .map_err(Error::WriteOutputFile)?;
    file.write_all(code).map_err(Error::WriteOutputFile)?;
    file.persist(output)
        .map_err(|e| Error::MoveTempFile(e.error))?;
    Ok(())
}

fn dump(input: &Path, key_set: &KeySet, mut stdout: impl Write) -> Result<(), Error> {
    let image = std::fs::read(input).map_err(Error::ReadInputFile)?;
    if !image.starts_with(&consts::FIRMWARE_MAGIC_NEW) {
        writeln!(&mut stdout, "{}", "no header found".bold()).map_err(Error::Stdout)?;
        return Ok(());
    }
    let header = FirmwareHeader::parse(&image)?;
    let code = &image[HEADER_LEN..];
    let secp = Secp256k1Verify::default();

    writeln!(
        &mut stdout,
        "{:12} {}",
        "magic".bold(),
        String::from_utf8_lossy(&header.magic()),
    )
    .map_err(Error::Stdout)?;
    writeln!(&mut stdout, "{:12} {}", "header len".bold(), header.header_len())
        .map_err(Error::Stdout)?;
    let human_size = humansize::format_size(header.code_len(), humansize::BINARY);
    writeln!(
        &mut stdout,
        "{:12} {human_size} ({})",
        "code len".bold(),
        header.code_len(),
    )
    .map_err(Error::Stdout)?;
    if header.code_len() as usize != code.len() {
        writeln!(
            &mut stdout,
            "{:12} {}",
            "",
            format!("file holds {} bytes of code", code.len()).red(),
        )
        .map_err(Error::Stdout)?;
    }
    writeln!(&mut stdout, "{:12} {}", "version".bold(), header.version())
        .map_err(Error::Stdout)?;
    writeln!(&mut stdout, "{:12} {}", "fix version".bold(), header.fix_version())
        .map_err(Error::Stdout)?;
    writeln!(&mut stdout, "{:12} {}", "expiry".bold(), header.expiry()).map_err(Error::Stdout)?;

    for index in 0..header.used_chunks() {
        let hash = header.chunk_hash(index).copied().unwrap_or_default();
        let status = if chunk_matches(&header, code, index) {
            "ok".green()
        } else {
            "mismatch".red()
        };
        writeln!(
            &mut stdout,
            "{:12} {} {status}",
            format!("chunk {index}").bold(),
            hex::encode(hash),
        )
        .map_err(Error::Stdout)?;
    }
    if !header.unused_hashes_zero() {
        writeln!(
            &mut stdout,
            "{:12} {}",
            "chunks".bold(),
            "unused hash slots are not empty".red(),
        )
        .map_err(Error::Stdout)?;
    }

    let fingerprint = header.fingerprint(&Sha2);
    writeln!(
        &mut stdout,
        "{:12} {}",
        "fingerprint".bold(),
        hex::encode(fingerprint),
    )
    .map_err(Error::Stdout)?;
    for slot in 1..=consts::SIGNATURES as u8 {
        let index = header.sig_index(slot).unwrap_or_default();
        let signature = header.signature(slot).copied().unwrap_or([0; 64]);
        let valid = usize::from(index)
            .checked_sub(1)
            .and_then(|i| key_set.get(i))
            .is_some_and(|key| {
                secp.verify_ecdsa(fingerprint, signature, *key) == VerificationResult::Valid
            });
        let status = if valid { "valid".green() } else { "invalid".red() };
        writeln!(
            &mut stdout,
            "{:12} key {index} {status}",
            format!("signature{slot}").bold(),
        )
        .map_err(Error::Stdout)?;
        writeln!(
            &mut stdout,
            "{} {}",
            " ".repeat(12),
            hex::encode(&signature[..32]),
        )
        .map_err(Error::Stdout)?;
        writeln!(
            &mut stdout,
            "{} {}",
            " ".repeat(12),
            hex::encode(&signature[32..]),
        )
        .map_err(Error::Stdout)?;
    }

    let status = match header.verify_signatures(&[*key_set], &Sha2, &secp) {
        VerificationResult::Valid => "valid".green(),
        VerificationResult::Invalid => "invalid".red(),
    };
    writeln!(&mut stdout, "{:12} {status}", "3-of-5".bold()).map_err(Error::Stdout)?;
    Ok(())
}

fn sign(
    expected_pubkey: Option<secp256k1::PublicKey>,
    secret: secp256k1::SecretKey,
    input_path: &Path,
    output: args::Output,
    slot: u8,
    index: u8,
    key_set: Option<KeySet>,
) -> Result<(), Error> {
    // Check that user is not accidentally signing with the wrong key.
    let signer = Secp256k1Sign::new(secret);
    let pubkey = secret.public_key(&signer.secp256k1);
    if let Some(expected_pubkey) = expected_pubkey {
        if pubkey != expected_pubkey {
            return Err(Error::KeyMismatch);
        }
    }
    let known = key_set
        .as_ref()
        .zip(usize::from(index).checked_sub(1))
        .and_then(|(set, i)| set.get(i));
    if let Some(known) = known {
        if *known != pubkey.serialize() {
            return Err(Error::UnknownSigner { index });
        }
    }

    let mut input_options = std::fs::OpenOptions::new();
    input_options.read(true);
    if let args::Output::InPlace = output {
        // When working in-place, the input file will be written to.
        input_options.write(true);
    }
    let mut input = input_options
        .open(input_path)
        .map_err(Error::OpenInputFile)?;
    let output = match output {
        args::Output::InPlace => OutputFile::InPlace(
            // When working in-place, first write to a temporary file. The temporary
            // file will be moved to the input file at the end of the process.
            tempfile::NamedTempFile::new().map_err(Error::CreateTempFile)?,
        ),
        args::Output::File(path) => {
            let file = std::fs::OpenOptions::new()
                // After being written, the output file will be read and parsed as a sanity
                // check.
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .map_err(Error::OpenOutputFile)?;
            OutputFile::File(file, path)
        }
    };

    let mut input_buf = Vec::new();
    input
        .read_to_end(&mut input_buf)
        .map_err(Error::ReadInputFile)?;
    let mut header = FirmwareHeader::parse(&input_buf)?;
    let code = &input_buf[HEADER_LEN..];
    check_code(&header, code)?;
    header.sign(slot, index, &Sha2, &signer)?;

    output
        .file()
        .write_all(&header.to_bytes())
        .map_err(Error::WriteOutputFile)?;
    output
        .file()
        .write_all(code)
        .map_err(Error::WriteOutputFile)?;

    // When working in-place, the output is actually first written to a temporary
    // file. To achieve the effect of in-place editing, the temporary
    // file must be moved to the input file, replacing it.
    if output.is_in_place() {
        move_file(output.file(), output.path(), &input, input_path)
            .map_err(Error::MoveTempFile)?;
    }

    // Sanity check that the output file can be parsed. If not, it's possible the
    // output file was being used by another process.
    output
        .file()
        .seek(std::io::SeekFrom::Start(0))
        .map_err(Error::SeekOutputFile)?;
    let mut output_buf = Vec::new();
    output
        .file()
        .read_to_end(&mut output_buf)
        .map_err(Error::ReadOutputFile)?;
    let written = FirmwareHeader::parse(&output_buf).map_err(Error::ParseOutputFile)?;
    if written != header {
        return Err(Error::OutputChanged);
    }
    Ok(())
}

/// Code bytes of chunk `index`, possibly short or empty.
fn chunk_code(code: &[u8], index: usize) -> &[u8] {
    let start = (index * CHUNK_SIZE).saturating_sub(HEADER_LEN);
    let end = start + chunk_code_capacity(index);
    &code[start.min(code.len())..end.min(code.len())]
}

fn chunk_matches(header: &FirmwareHeader, code: &[u8], index: usize) -> bool {
    header.chunk_hash(index) == Some(&chunk_digest(index, chunk_code(code, index), &Sha2))
}

/// Check the code against the length and chunk hashes in the header.
fn check_code(header: &FirmwareHeader, code: &[u8]) -> Result<(), Error> {
    if header.code_len() as usize != code.len() {
        return Err(Error::CodeLenMismatch {
            header: header.code_len(),
            actual: code.len(),
        });
    }
    if let Some(index) = (0..header.used_chunks()).find(|&i| !chunk_matches(header, code, i)) {
        return Err(Error::ChunkHashMismatch(index));
    }
    if !header.unused_hashes_zero() {
        return Err(Error::UnusedHashesNotEmpty);
    }
    Ok(())
}

#[derive(Debug)]
struct Secp256k1Sign {
    secp256k1: secp256k1::Secp256k1<secp256k1::All>,
    key: secp256k1::SecretKey,
}

impl Secp256k1Sign {
    fn new(key: secp256k1::SecretKey) -> Self {
        Self {
            secp256k1: secp256k1::Secp256k1::new(),
            key,
        }
    }
}

impl fwheader::Secp256k1Sign for Secp256k1Sign {
    fn sign_ecdsa(&self, msg: [u8; 32]) -> [u8; 64] {
        self.secp256k1
            .sign_ecdsa(&secp256k1::Message::from_digest(msg), &self.key)
            .serialize_compact()
    }

    fn pubkey(&self) -> [u8; 33] {
        self.key.public_key(&self.secp256k1).serialize()
    }
}

#[derive(Debug, Default)]
struct Secp256k1Verify(secp256k1::Secp256k1<secp256k1::All>);

impl fwheader::Secp256k1Verify for Secp256k1Verify {
    fn verify_ecdsa(
        &self,
        msg: [u8; 32],
        signature: [u8; 64],
        pubkey: [u8; 33],
    ) -> VerificationResult {
        let Ok(pubkey) = secp256k1::PublicKey::from_slice(&pubkey) else {
            return VerificationResult::Invalid;
        };
        let Ok(signature) = secp256k1::ecdsa::Signature::from_compact(&signature) else {
            return VerificationResult::Invalid;
        };

        if self
            .0
            .verify_ecdsa(&secp256k1::Message::from_digest(msg), &signature, &pubkey)
            .is_ok()
        {
            VerificationResult::Valid
        } else {
            VerificationResult::Invalid
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExitCode(u8);

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        code.0.into()
    }
}

#[derive(Debug)]
enum OutputFile {
    InPlace(tempfile::NamedTempFile),
    File(std::fs::File, PathBuf),
}

impl OutputFile {
    fn file(&self) -> &std::fs::File {
        match self {
            OutputFile::InPlace(file) => file.as_file(),
            OutputFile::File(file, _) => file,
        }
    }

    fn path(&self) -> &Path {
        match self {
            OutputFile::InPlace(file) => file.path(),
            OutputFile::File(_, path) => path,
        }
    }

    fn is_in_place(&self) -> bool {
        matches!(self, OutputFile::InPlace(_))
    }
}

fn move_file(
    mut from_file: &std::fs::File,
    from_path: &Path,
    mut to_file: &std::fs::File,
    to_path: &Path,
) -> std::io::Result<()> {
    if std::fs::rename(from_path, to_path).is_err() {
        // If rename fails, the files might be on different filesystems.
        // Fall back to copying and removing the original file.
        from_file.seek(std::io::SeekFrom::Start(0))?;
        to_file.seek(std::io::SeekFrom::Start(0))?;
        std::io::copy(&mut from_file, &mut to_file)?;
        std::fs::remove_file(from_path)?;
    }
    Ok(())
}

#[derive(Debug)]
enum Error {
    Args(args::Error),
    ChunkHashMismatch(usize),
    CodeLenMismatch { header: u32, actual: usize },
    CreateTempFile(std::io::Error),
    Fwheader(fwheader::Error),
    KeyMismatch,
    MoveTempFile(std::io::Error),
    OpenInputFile(std::io::Error),
    OpenOutputFile(std::io::Error),
    OutputChanged,
    ParseOutputFile(fwheader::Error),
    ReadInputFile(std::io::Error),
    ReadOutputFile(std::io::Error),
    SeekOutputFile(std::io::Error),
    Stdout(std::io::Error),
    UnknownSigner { index: u8 },
    UnusedHashesNotEmpty,
    WriteOutputFile(std::io::Error),
}

impl From<args::Error> for Error {
    fn from(e: args::Error) -> Self {
        Error::Args(e)
    }
}

impl From<fwheader::Error> for Error {
    fn from(e: fwheader::Error) -> Self {
        Error::Fwheader(e)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Args(e) => write!(f, "{e}"),
            Error::ChunkHashMismatch(index) => {
                write!(f, "hash of chunk {index} does not match the header")
            }
            Error::CodeLenMismatch { header, actual } => write!(
                f,
                "invalid code length in header: should be {actual}, but is {header}"
            ),
            Error::CreateTempFile(e) => write!(f, "failed to create temporary file: {e}"),
            Error::Fwheader(e) => write!(f, "{e}"),
            Error::KeyMismatch => write!(f, "public key does not match secret key"),
            Error::MoveTempFile(e) => write!(f, "failed to move temporary file to output: {e}"),
            Error::OpenInputFile(e) => write!(f, "failed to open input file: {e}"),
            Error::OpenOutputFile(e) => write!(f, "failed to open output file: {e}"),
            Error::OutputChanged => write!(
                f,
                "output file header differs after writing; is another process using it?"
            ),
            Error::ParseOutputFile(e) => write!(
                f,
                "failed to parse output file after writing: {e}; is another process using it?"
            ),
            Error::ReadInputFile(e) => write!(f, "failed to read input file: {e}"),
            Error::ReadOutputFile(e) => write!(f, "failed to read output file: {e}"),
            Error::SeekOutputFile(e) => write!(f, "failed to seek output file: {e}"),
            Error::Stdout(e) => write!(f, "failed to write to stdout: {e}"),
            Error::UnknownSigner { index } => {
                write!(f, "signing key is not known key {index}")
            }
            Error::UnusedHashesNotEmpty => write!(f, "unused chunk hash slots are not empty"),
            Error::WriteOutputFile(e) => write!(f, "failed to write to output file: {e}"),
        }
    }
}

impl std::error::Error for Error {}
