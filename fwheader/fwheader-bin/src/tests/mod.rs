use {
    self::input::{create_file, known_pubkeys_arg},
    crate::ExitCode,
};


/// Try to dump header contents of a file with no header.
#[test]
fn dump_no_header() {
    let file = create_file(b"Hello, world!");
    let output = test(["dump", "-i", file.path().to_str().unwrap()]);
    assert_eq!(output.exit_code, ExitCode(0));
    assert!(output.stdout.contains("no header"));
    assert!(output.stderr.is_empty());
}

/// Dump a freshly built, unsigned image.
#[test]
fn build_and_dump() {
    let code = create_file(&input::code(100_000));
    let image = tempfile::NamedTempFile::new().unwrap();
    let output = test([
        "build",
        "-i",
        code.path().to_str().unwrap(),
        "-o",
        image.path().to_str().unwrap(),
        "--firmware-version",
        "1.8.3",
        "--fix-version",
        "1.8.0",
    ]);
    assert_eq!(output.exit_code, ExitCode(0));
    assert!(output.stderr.is_empty());

    // The built image is the one the library builds.
    let built = std::fs::read(image.path()).unwrap();
    assert_eq!(built.len(), 1024 + 100_000);
    assert_eq!(&built[..4], b"TRZF");
    assert_eq!(built[16..20], [1, 8, 3, 0]);
    assert_eq!(built[20..24], [1, 8, 0, 0]);

    let output = test(["dump", "-i", image.path().to_str().unwrap()]);
    assert_eq!(output.exit_code, ExitCode(0));
    // Prints magic value.
    assert!(output.stdout.contains("TRZF"));
    // Prints code size.
    assert!(output.stdout.contains("97.66 KiB (100000)"));
    // Prints versions.
    assert!(output.stdout.contains("1.8.3"));
    assert!(output.stdout.contains("1.8.0"));
    // Prints both used chunks, and both match.
    assert!(output.stdout.contains("chunk 0"));
    assert!(output.stdout.contains("chunk 1"));
    assert!(!output.stdout.contains("chunk 2"));
    assert!(!output.stdout.contains("mismatch"));
    // Unsigned images fail the signature check.
    assert!(line_with(&output.stdout, "3-of-5").contains("invalid"));
    assert!(output.stderr.is_empty());
}

/// Dump an image whose code no longer matches the chunk hashes.
#[test]
fn dump_tampered_chunk() {
    let mut image = input::image(100_000);
    image[1024 + 70_000] ^= 0x01;
    let file = create_file(&image);
    let output = test(["dump", "-i", file.path().to_str().unwrap()]);
    assert_eq!(output.exit_code, ExitCode(0));
    assert!(line_with(&output.stdout, "chunk 0").contains("ok"));
    assert!(line_with(&output.stdout, "chunk 1").contains("mismatch"));
}

/// Build rejects code below the minimum size.
#[test]
fn build_code_too_short() {
    let code = create_file(&input::code(100));
    let image = tempfile::NamedTempFile::new().unwrap();
    let output = test([
        "build",
        "-i",
        code.path().to_str().unwrap(),
        "-o",
        image.path().to_str().unwrap(),
        "--firmware-version",
        "1.8.3",
    ]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains("code too short"));
}

/// A failed build leaves an existing output file as it was.
#[test]
fn build_replaces_output_only_on_success() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("firmware.bin");
    std::fs::write(&image, b"previous image").unwrap();

    let short = create_file(&input::code(100));
    let output = test([
        "build",
        "-i",
        short.path().to_str().unwrap(),
        "-o",
        image.to_str().unwrap(),
        "--firmware-version",
        "1.8.3",
    ]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert_eq!(std::fs::read(&image).unwrap(), b"previous image");

    let code = create_file(&input::code(10_000));
    let output = test([
        "build",
        "-i",
        code.path().to_str().unwrap(),
        "-o",
        image.to_str().unwrap(),
        "--firmware-version",
        "1.8.3",
    ]);
    assert_eq!(output.exit_code, ExitCode(0));
    assert_eq!(std::fs::read(&image).unwrap().len(), 1024 + 10_000);
    // Only the image is left in the directory.
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
}

/// Versions must fit the header's one byte per component.
#[test]
fn build_invalid_version() {
    let code = create_file(&input::code(10_000));
    let image = tempfile::NamedTempFile::new().unwrap();
    for version in ["1.2.3-alpha1", "1.256.0"] {
        let output = test([
            "build",
            "-i",
            code.path().to_str().unwrap(),
            "-o",
            image.path().to_str().unwrap(),
            "--firmware-version",
            version,
        ]);
        assert_eq!(output.exit_code, ExitCode(1));
        assert!(output.stderr.contains("cannot be stored in the header"));
    }
}

/// Sign all three slots, then check the image with the known keys.
#[test]
fn sign_three_slots() {
    let image = create_file(&input::image(100_000));
    let signed = tempfile::NamedTempFile::new().unwrap();
    let secrets = [
        create_file(input::SECRET_1_PEM),
        create_file(input::SECRET_2_PEM),
        create_file(input::SECRET_3_PEM),
    ];

    let output = test([
        "sign",
        "--secret",
        secrets[0].path().to_str().unwrap(),
        "-i",
        image.path().to_str().unwrap(),
        "-o",
        signed.path().to_str().unwrap(),
        "--slot",
        "1",
        "--index",
        "1",
        "--known-pubkey",
        &known_pubkeys_arg(),
    ]);
    assert_eq!(output.exit_code, ExitCode(0));
    assert!(output.stdout.is_empty());
    assert!(output.stderr.is_empty());

    for (slot, secret) in [("2", &secrets[1]), ("3", &secrets[2])] {
        let output = test([
            "sign",
            "--secret",
            secret.path().to_str().unwrap(),
            "-i",
            signed.path().to_str().unwrap(),
            "--in-place",
            "--slot",
            slot,
            "--index",
            slot,
            "--pubkey",
            &input::known_pubkeys()[usize::from(slot.as_bytes()[0] - b'1')],
        ]);
        assert_eq!(output.exit_code, ExitCode(0));
        assert!(output.stderr.is_empty());
    }

    // The vendor keys do not verify these signatures.
    let output = test(["dump", "-i", signed.path().to_str().unwrap()]);
    assert_eq!(output.exit_code, ExitCode(0));
    assert!(line_with(&output.stdout, "3-of-5").contains("invalid"));

    let output = test([
        "dump",
        "-i",
        signed.path().to_str().unwrap(),
        "--known-pubkey",
        &known_pubkeys_arg(),
    ]);
    assert_eq!(output.exit_code, ExitCode(0));
    assert!(!line_with(&output.stdout, "signature1").contains("invalid"));
    assert!(!line_with(&output.stdout, "signature2").contains("invalid"));
    assert!(!line_with(&output.stdout, "signature3").contains("invalid"));
    assert!(!line_with(&output.stdout, "3-of-5").contains("invalid"));
    assert!(line_with(&output.stdout, "3-of-5").contains("valid"));

    // Signing leaves the code untouched.
    let original = std::fs::read(image.path()).unwrap();
    let signed = std::fs::read(signed.path()).unwrap();
    assert_eq!(original[1024..], signed[1024..]);
    assert_eq!(original[..544], signed[..544]);
}

/// Sign with the secret and known keys taken from a config file.
#[test]
fn sign_from_config() {
    let image = create_file(&input::image(10_000));
    let secret = create_file(input::SECRET_2_PEM);
    let config = create_file(
        format!(
            "secret = \"{}\"\npubkey = \"{}\"\nknown_pubkeys = {:?}\n",
            secret.path().to_str().unwrap(),
            input::PUBKEY_2_HEX,
            input::known_pubkeys(),
        )
        .as_bytes(),
    );
    let output = test([
        "sign",
        "-c",
        config.path().to_str().unwrap(),
        "-i",
        image.path().to_str().unwrap(),
        "--in-place",
        "--slot",
        "3",
        "--index",
        "2",
    ]);
    assert_eq!(output.exit_code, ExitCode(0));
    assert!(output.stderr.is_empty());

    let signed = std::fs::read(image.path()).unwrap();
    assert_ne!(signed[672..736], [0; 64]);
    assert_eq!(signed[736..739], [0, 0, 2]);
}

/// Secret given both on the command line and in the config file.
#[test]
fn secret_in_config_and_cli() {
    let image = create_file(&input::image(10_000));
    let secret = create_file(input::SECRET_1_PEM);
    let config = create_file(
        format!("secret = \"{}\"\n", secret.path().to_str().unwrap()).as_bytes(),
    );
    let output = test([
        "sign",
        "-c",
        config.path().to_str().unwrap(),
        "--secret",
        secret.path().to_str().unwrap(),
        "-i",
        image.path().to_str().unwrap(),
        "--in-place",
        "--slot",
        "1",
        "--index",
        "1",
    ]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains("secret specified in both config and cli"));
}

/// Relative secret paths are not accepted in the config file.
#[test]
fn relative_secret_in_config() {
    let image = create_file(&input::image(10_000));
    let config = create_file(b"secret = \"key.pem\"\n");
    let output = test([
        "sign",
        "-c",
        config.path().to_str().unwrap(),
        "-i",
        image.path().to_str().unwrap(),
        "--in-place",
        "--slot",
        "1",
        "--index",
        "1",
    ]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains("not absolute"));
}

/// The expected public key does not belong to the secret key.
#[test]
fn sign_pubkey_mismatch() {
    let image = create_file(&input::image(10_000));
    let secret = create_file(input::SECRET_1_PEM);
    let output = test([
        "sign",
        "--secret",
        secret.path().to_str().unwrap(),
        "--pubkey",
        input::PUBKEY_2_HEX,
        "-i",
        image.path().to_str().unwrap(),
        "--in-place",
        "--slot",
        "1",
        "--index",
        "1",
    ]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains("public key does not match secret key"));
}

/// The secret key is not the known key at the given index.
#[test]
fn sign_unknown_signer() {
    let image = create_file(&input::image(10_000));
    let secret = create_file(input::SECRET_1_PEM);
    let output = test([
        "sign",
        "--secret",
        secret.path().to_str().unwrap(),
        "-i",
        image.path().to_str().unwrap(),
        "--in-place",
        "--slot",
        "1",
        "--index",
        "2",
        "--known-pubkey",
        &known_pubkeys_arg(),
    ]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains("not known key 2"));
}

/// The key table must hold exactly five keys.
#[test]
fn sign_too_few_known_pubkeys() {
    let image = create_file(&input::image(10_000));
    let secret = create_file(input::SECRET_1_PEM);
    let output = test([
        "sign",
        "--secret",
        secret.path().to_str().unwrap(),
        "-i",
        image.path().to_str().unwrap(),
        "--in-place",
        "--slot",
        "1",
        "--index",
        "1",
        "--known-pubkey",
        &format!("{},{}", input::PUBKEY_1_HEX, input::PUBKEY_2_HEX),
    ]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains("expected 5 known public keys, got 2"));
}

/// A key index may only be used by one slot.
#[test]
fn sign_duplicate_index() {
    let image = create_file(&input::image(10_000));
    let secret = create_file(input::SECRET_1_PEM);
    let sign = |slot| {
        test([
            "sign",
            "--secret",
            secret.path().to_str().unwrap(),
            "-i",
            image.path().to_str().unwrap(),
            "--in-place",
            "--slot",
            slot,
            "--index",
            "1",
        ])
    };
    assert_eq!(sign("1").exit_code, ExitCode(0));
    let output = sign("2");
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains("key index 1 already used"));
}

/// Slots are numbered 1 to 3.
#[test]
fn sign_invalid_slot() {
    let image = create_file(&input::image(10_000));
    let secret = create_file(input::SECRET_1_PEM);
    let output = test([
        "sign",
        "--secret",
        secret.path().to_str().unwrap(),
        "-i",
        image.path().to_str().unwrap(),
        "--in-place",
        "--slot",
        "4",
        "--index",
        "1",
    ]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains("invalid signature slot 4"));
}

/// Refuse to sign code that does not match its chunk hashes.
#[test]
fn sign_tampered_chunk() {
    let mut image = input::image(100_000);
    image[1024 + 65_000] ^= 0x80;
    let image = create_file(&image);
    let secret = create_file(input::SECRET_1_PEM);
    let output = test([
        "sign",
        "--secret",
        secret.path().to_str().unwrap(),
        "-i",
        image.path().to_str().unwrap(),
        "--in-place",
        "--slot",
        "1",
        "--index",
        "1",
    ]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains("hash of chunk 1 does not match"));
}

/// Refuse to sign an image whose code length differs from the header.
#[test]
fn sign_truncated_image() {
    let image = input::image(10_000);
    let image = create_file(&image[..image.len() - 1]);
    let secret = create_file(input::SECRET_1_PEM);
    let output = test([
        "sign",
        "--secret",
        secret.path().to_str().unwrap(),
        "-i",
        image.path().to_str().unwrap(),
        "--in-place",
        "--slot",
        "1",
        "--index",
        "1",
    ]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains("should be 9999, but is 10000"));
}

/// Specifying both in-place and an output file is an error.
#[test]
fn sign_in_place_with_output_file() {
    let image = create_file(&input::image(10_000));
    let secret = create_file(input::SECRET_1_PEM);
    let output = test([
        "sign",
        "--secret",
        secret.path().to_str().unwrap(),
        "-i",
        image.path().to_str().unwrap(),
        "--in-place",
        "-o",
        image.path().to_str().unwrap(),
        "--slot",
        "1",
        "--index",
        "1",
    ]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains("cannot specify both --in-place and --output"));
}

/// First line of `stdout` mentioning `label`.
fn line_with<'a>(stdout: &'a str, label: &str) -> &'a str {
    stdout
        .lines()
        .find(|line| line.contains(label))
        .unwrap_or_else(|| panic!("no line with {label:?}"))
}

fn test<const N: usize>(args: [&str; N]) -> Output {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let exit_code = crate::main_args(
        std::iter::once("fwheader").chain(args),
        &mut stdout,
        &mut stderr,
    );
    println!("* args: {:?}", args);
    println!("* exit_code: {:?}", exit_code);
    println!("* stdout:\n{}", String::from_utf8_lossy(&stdout));
    println!("* stderr:\n{}", String::from_utf8_lossy(&stderr));
    Output {
        exit_code,
        stdout: String::from_utf8(stdout).unwrap(),
        stderr: String::from_utf8(stderr).unwrap(),
    }
}

#[derive(Debug)]
struct Output {
    exit_code: ExitCode,
    stdout: String,
    stderr: String,
}
