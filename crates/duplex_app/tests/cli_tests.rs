use std::path::Path;
use std::process::{Command, Output};

use tempfile::tempdir;

fn duplex(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_duplex"))
        .args(["--no-direct-input", "--no-direct-output", "--no-progress-bar"])
        .args(args)
        .output()
        .unwrap()
}

fn path(p: &Path) -> &str {
    p.to_str().unwrap()
}

#[test]
fn test_copy_with_digests() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("zeros.dd");
    let a = dir.path().join("a.dd");
    let b = dir.path().join("b.dd");
    std::fs::write(&input, vec![0u8; 1 << 20]).unwrap();

    let out = duplex(&[
        "-i", path(&input), "-o", path(&a), "-o", path(&b), "--bs", "64K", "-f", "-c",
    ]);
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(out.status.success(), "{stderr}");

    assert_eq!(std::fs::read(&a).unwrap(), vec![0u8; 1 << 20]);
    assert_eq!(std::fs::read(&b).unwrap(), vec![0u8; 1 << 20]);
    assert!(stderr.contains("16+0 blocks in"));
    assert!(stderr.contains("1048576 bytes read"));
    assert_eq!(
        stderr
            .matches("b6d81b360a5672d80c27430f39153e2c - md5 - ")
            .count(),
        3
    );
}

#[test]
fn test_block_digest_file_and_json_report() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("in.dd");
    let output = dir.path().join("out.dd");
    let digests = dir.path().join("blocks.txt");
    let report = dir.path().join("report.json");
    std::fs::write(&input, vec![0x41u8; 1536]).unwrap();

    let out = duplex(&[
        "-i", path(&input), "-o", path(&output), "--hash-blocks-save", path(&digests),
        "--report-json", path(&report),
    ]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let lines = std::fs::read_to_string(&digests).unwrap();
    let lines: Vec<&str> = lines.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[1].starts_with("block        1: 0000000000000200-0000000000000400: md5 - "));

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&report).unwrap()).unwrap();
    assert_eq!(json["tool"], "duplex");
    assert_eq!(json["report"]["input"]["counters"]["bytes"], 1536);
    assert_eq!(json["settings"]["bs"], 512);
}

#[test]
fn test_partition_table_is_printed() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("disk.img");
    let output = dir.path().join("copy.img");
    let mut image = vec![0u8; 64 * 512];
    image[446] = 0x80;
    image[446 + 4] = 0x83;
    image[446 + 8..446 + 12].copy_from_slice(&8u32.to_le_bytes());
    image[446 + 12..446 + 16].copy_from_slice(&32u32.to_le_bytes());
    image[510] = 0x55;
    image[511] = 0xAA;
    std::fs::write(&input, &image).unwrap();

    let out = duplex(&["-i", path(&input), "-o", path(&output), "--get-partition-table"]);
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(out.status.success(), "{stderr}");
    assert!(stderr.contains("   device  boot"));
    assert!(stderr.contains("disk.img1    *"));
    assert!(stderr.contains("Native Linux file system"));
}

#[test]
fn test_unknown_digest_is_rejected() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("in.dd");
    std::fs::write(&input, [0u8; 512]).unwrap();

    let out = duplex(&["-i", path(&input), "-o", path(&dir.path().join("o")), "--hash-files", "crc"]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("crc"));
}

#[test]
fn test_list_modules() {
    let out = Command::new(env!("CARGO_BIN_EXE_duplex"))
        .arg("--list-modules")
        .output()
        .unwrap();
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("to-upper-case"));
    assert!(stdout.contains("compression=LEVEL"));
    assert!(stdout.contains("find-regex=REGEX"));
}
